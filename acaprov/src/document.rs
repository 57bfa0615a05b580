//! Nested document helpers shared by structured patches and postconditions.
//!
//! Merge rules:
//! - objects merge key by key, recursively
//! - arrays of objects merge element-wise by identity key (`name`, else
//!   `volumeName`); a matched element is merged in place, an unmatched
//!   one is appended
//! - array elements without an identity key are appended only when no
//!   equal element is already present
//! - anything else overwrites
//!
//! With these rules merging the same fragment twice is a no-op, and
//! [`includes`] holds for every fragment right after it was merged.

use serde_json::{Map, Value};
use thiserror::Error;

/// Keys that identify an element inside an array of objects.
const IDENTITY_KEYS: &[&str] = &["name", "volumeName"];

fn identity(item: &Value) -> Option<(&'static str, &Value)> {
    let obj = item.as_object()?;
    IDENTITY_KEYS
        .iter()
        .find_map(|key| obj.get(*key).map(|value| (*key, value)))
}

/// Resolve a dotted path (`template.containers.0.image`) inside an object.
pub fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Why a dotted path could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("'{path}' is an array, '{segment}' is not an index")]
    NotAnIndex { path: String, segment: String },

    #[error("index {index} out of range for '{path}' (length {len})")]
    IndexOutOfRange { path: String, index: usize, len: usize },
}

/// Set a dotted path inside an object, creating intermediate objects.
///
/// A numeric segment indexes into an existing array element; arrays are
/// never grown or replaced on the way down. Other non-object
/// intermediates are replaced by objects. On error nothing is written.
pub fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), PathError> {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            if let Some(existing) = root.get(head) {
                check_path(existing, head, rest)?;
            }
            let child = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_value(child, rest, value);
            Ok(())
        }
    }
}

/// Verify every array on `path` below `current` is indexed in range.
fn check_path(current: &Value, at: &str, path: &str) -> Result<(), PathError> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let next = match current {
        Value::Array(items) => {
            let index = head.parse::<usize>().map_err(|_| PathError::NotAnIndex {
                path: at.to_string(),
                segment: head.to_string(),
            })?;
            let item = items.get(index).ok_or(PathError::IndexOutOfRange {
                path: at.to_string(),
                index,
                len: items.len(),
            })?;
            Some(item)
        }
        Value::Object(obj) => obj.get(head),
        _ => None,
    };
    match (next, rest) {
        (Some(next), Some(rest)) => check_path(next, &format!("{}.{}", at, head), rest),
        _ => Ok(()),
    }
}

/// Write `value` at `path` below `current`, assuming [`check_path`] passed.
fn set_value(current: &mut Value, path: &str, value: Value) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if let Value::Array(items) = current {
        if let Some(item) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            match rest {
                Some(rest) => set_value(item, rest, value),
                None => *item = value,
            }
        }
        return;
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(obj) = current {
        match rest {
            None => {
                obj.insert(head.to_string(), value);
            }
            Some(rest) => {
                let child = obj
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                set_value(child, rest, value);
            }
        }
    }
}

/// Merge `fragment` into `target`.
pub fn merge(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(existing), Value::Object(patch)) => merge_object(existing, patch),
        (Value::Array(existing), Value::Array(patch)) => {
            for item in patch {
                merge_element(existing, item);
            }
        }
        (existing, patch) => *existing = patch.clone(),
    }
}

/// Merge an object fragment into an object, key by key.
pub fn merge_object(target: &mut Map<String, Value>, fragment: &Map<String, Value>) {
    for (key, value) in fragment {
        match target.get_mut(key) {
            Some(existing) => merge(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_element(items: &mut Vec<Value>, item: &Value) {
    match identity(item) {
        Some((key, id)) => {
            if let Some(existing) = items.iter_mut().find(|e| e.get(key) == Some(id)) {
                merge(existing, item);
                return;
            }
        }
        None => {
            if items.contains(item) {
                return;
            }
        }
    }
    items.push(item.clone());
}

/// Whether `observed` already contains everything `fragment` would merge in.
pub fn includes(observed: &Value, fragment: &Value) -> bool {
    match (observed, fragment) {
        (Value::Object(obj), Value::Object(patch)) => includes_object(obj, patch),
        (Value::Array(items), Value::Array(patch)) => patch.iter().all(|wanted| match identity(wanted) {
            Some((key, id)) => items
                .iter()
                .find(|e| e.get(key) == Some(id))
                .is_some_and(|e| includes(e, wanted)),
            None => items.contains(wanted),
        }),
        (a, b) => a == b,
    }
}

/// Object form of [`includes`].
pub fn includes_object(observed: &Map<String, Value>, fragment: &Map<String, Value>) -> bool {
    fragment.iter().all(|(key, wanted)| {
        observed
            .get(key)
            .is_some_and(|value| includes(value, wanted))
    })
}
