//! Bounded polling with exponential backoff.
//!
//! Used wherever the control plane finishes work asynchronously: provider
//! registration and identity principal propagation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReconcileError;

/// Poll schedule: `initial`, then multiplied by `multiplier` per attempt,
/// capped at `max_interval`, until `deadline` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    pub deadline: Duration,
}

impl Backoff {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            multiplier: 2,
            deadline,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_interval)
    }
}

/// Call `probe` until it yields `Some`, sleeping between attempts.
///
/// Errors from `probe` abort immediately. Once `deadline` is exceeded the
/// poll fails with [`ReconcileError::DependencyTimeout`].
pub async fn poll_until<T, F, Fut>(what: &str, backoff: Backoff, mut probe: F) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ReconcileError>>,
{
    let start = Instant::now();
    let mut interval = backoff.initial;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(value) = probe().await? {
            debug!(what, attempts, elapsed_ms = start.elapsed().as_millis() as u64, "Ready");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= backoff.deadline {
            warn!(what, attempts, deadline_secs = backoff.deadline.as_secs(), "Timeout waiting");
            return Err(ReconcileError::DependencyTimeout {
                what: what.to_string(),
                waited: elapsed,
            });
        }

        let pause = interval.min(backoff.deadline - elapsed);
        debug!(what, attempts, pause_ms = pause.as_millis() as u64, "Not ready yet, retrying...");
        tokio::time::sleep(pause).await;
        interval = backoff.next_interval(interval);
    }
}
