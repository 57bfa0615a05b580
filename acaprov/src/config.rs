//! Deployment configuration loaded from TOML.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must not be empty")]
    EmptyName(&'static str),

    #[error("invalid storage account name '{0}': 3-24 lowercase letters and digits")]
    InvalidStorageAccountName(String),

    #[error("invalid registry name '{0}': 5-50 letters and digits")]
    InvalidRegistryName(String),

    #[error("invalid {field} prefix: {value}")]
    InvalidPrefix { field: &'static str, value: String },

    #[error("subnet {subnet} is not within virtual network {vnet}")]
    SubnetOutsideVnet { subnet: String, vnet: String },

    #[error("subnets {0} and {1} overlap")]
    SubnetOverlap(String, String),

    #[error("min_replicas ({min}) exceeds max_replicas ({max})")]
    ReplicaBounds { min: u32, max: u32 },

    #[error("cpu must be positive, got {0}")]
    InvalidCpu(f64),

    #[error("memory must be given in Gi (e.g. \"1.0Gi\"), got '{0}'")]
    InvalidMemory(String),

    #[error("target_port must not be 0")]
    InvalidPort,

    #[error("env var {name}: path '{path}' must stay below the mount path")]
    EscapingEnvPath { name: String, path: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Resource names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Names {
    pub resource_group: String,
    pub registry: String,
    pub storage_account: String,
    #[serde(default = "default_file_share")]
    pub file_share: String,
    pub vnet: String,
    #[serde(default = "default_ca_subnet")]
    pub ca_subnet: String,
    #[serde(default = "default_pe_subnet")]
    pub pe_subnet: String,
    /// Defaults to `pe-<storage_account>`.
    #[serde(default)]
    pub private_endpoint: Option<String>,
    pub environment: String,
    #[serde(default = "default_environment_storage")]
    pub environment_storage: String,
    pub app: String,
}

impl Names {
    pub fn private_endpoint(&self) -> String {
        self.private_endpoint
            .clone()
            .unwrap_or_else(|| format!("pe-{}", self.storage_account))
    }
}

/// Container images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Images {
    /// Public, unauthenticated image used to create the app.
    #[serde(default = "default_bootstrap_image")]
    pub bootstrap: String,
    /// `repository:tag` inside the private registry.
    pub target: String,
    /// Image imported into the registry as `target`, if set.
    #[serde(default)]
    pub import_source: Option<String>,
}

/// Application sizing and mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_target_port")]
    pub target_port: u16,
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default = "default_volume_name")]
    pub volume_name: String,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            target_port: default_target_port(),
            cpu: default_cpu(),
            memory: default_memory(),
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            volume_name: default_volume_name(),
            mount_path: default_mount_path(),
        }
    }
}

/// Address space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_vnet_prefix")]
    pub vnet_prefix: String,
    #[serde(default = "default_ca_subnet_prefix")]
    pub ca_subnet_prefix: String,
    #[serde(default = "default_pe_subnet_prefix")]
    pub pe_subnet_prefix: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            vnet_prefix: default_vnet_prefix(),
            ca_subnet_prefix: default_ca_subnet_prefix(),
            pe_subnet_prefix: default_pe_subnet_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_share_quota_gb")]
    pub share_quota_gb: u32,
    #[serde(default = "default_storage_sku")]
    pub sku: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            share_quota_gb: default_share_quota_gb(),
            sku: default_storage_sku(),
        }
    }
}

/// Deadlines for control-plane work that completes asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_identity_secs")]
    pub identity_secs: u64,
    #[serde(default = "default_provider_secs")]
    pub provider_secs: u64,
}

impl Timeouts {
    pub fn identity(&self) -> Duration {
        Duration::from_secs(self.identity_secs)
    }

    pub fn provider(&self) -> Duration {
        Duration::from_secs(self.provider_secs)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            identity_secs: default_identity_secs(),
            provider_secs: default_provider_secs(),
        }
    }
}

/// Everything the graph builder needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub location: String,
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// CLI extension required by the deployment, if any.
    #[serde(default = "default_cli_extension")]
    pub cli_extension: Option<String>,
    pub names: Names,
    pub images: Images,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// Environment variable name to path below the mount path.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_providers() -> Vec<String> {
    vec![
        "Microsoft.App".to_string(),
        "Microsoft.OperationalInsights".to_string(),
    ]
}

fn default_cli_extension() -> Option<String> {
    Some("containerapp".to_string())
}

fn default_file_share() -> String {
    "data".to_string()
}

fn default_ca_subnet() -> String {
    "snet-containerapps".to_string()
}

fn default_pe_subnet() -> String {
    "snet-private-endpoints".to_string()
}

fn default_environment_storage() -> String {
    "datamount".to_string()
}

fn default_bootstrap_image() -> String {
    "mcr.microsoft.com/azuredocs/containerapps-helloworld:latest".to_string()
}

fn default_target_port() -> u16 {
    80
}

fn default_cpu() -> f64 {
    0.5
}

fn default_memory() -> String {
    "1.0Gi".to_string()
}

fn default_min_replicas() -> u32 {
    1
}

fn default_max_replicas() -> u32 {
    3
}

fn default_volume_name() -> String {
    "data".to_string()
}

fn default_mount_path() -> String {
    "/mnt/data".to_string()
}

fn default_vnet_prefix() -> String {
    "10.10.0.0/16".to_string()
}

fn default_ca_subnet_prefix() -> String {
    "10.10.0.0/23".to_string()
}

fn default_pe_subnet_prefix() -> String {
    "10.10.2.0/24".to_string()
}

fn default_share_quota_gb() -> u32 {
    100
}

fn default_storage_sku() -> String {
    "Standard_LRS".to_string()
}

fn default_identity_secs() -> u64 {
    120
}

fn default_provider_secs() -> u64 {
    600
}

fn parse_prefix(field: &'static str, value: &str) -> Result<Ipv4Net> {
    value.parse().map_err(|_| ConfigError::InvalidPrefix {
        field,
        value: value.to_string(),
    })
}

/// Check if two IPv4 subnets overlap.
fn subnets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

impl DeployConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: DeployConfig = raw.parse()?;
        Ok(config)
    }

    /// Validate names, address space and sizing.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("location", &self.location),
            ("names.resource_group", &self.names.resource_group),
            ("names.file_share", &self.names.file_share),
            ("names.vnet", &self.names.vnet),
            ("names.ca_subnet", &self.names.ca_subnet),
            ("names.pe_subnet", &self.names.pe_subnet),
            ("names.environment", &self.names.environment),
            ("names.environment_storage", &self.names.environment_storage),
            ("names.app", &self.names.app),
            ("images.bootstrap", &self.images.bootstrap),
            ("images.target", &self.images.target),
            ("app.volume_name", &self.app.volume_name),
            ("app.mount_path", &self.app.mount_path),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyName(field));
            }
        }

        let account = &self.names.storage_account;
        if !(3..=24).contains(&account.len())
            || !account
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ConfigError::InvalidStorageAccountName(account.clone()));
        }

        let registry = &self.names.registry;
        if !(5..=50).contains(&registry.len()) || !registry.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidRegistryName(registry.clone()));
        }

        let vnet = parse_prefix("network.vnet", &self.network.vnet_prefix)?;
        let ca = parse_prefix("network.ca_subnet", &self.network.ca_subnet_prefix)?;
        let pe = parse_prefix("network.pe_subnet", &self.network.pe_subnet_prefix)?;
        for subnet in [&ca, &pe] {
            if !vnet.contains(subnet) {
                return Err(ConfigError::SubnetOutsideVnet {
                    subnet: subnet.to_string(),
                    vnet: vnet.to_string(),
                });
            }
        }
        if subnets_overlap(&ca, &pe) {
            return Err(ConfigError::SubnetOverlap(ca.to_string(), pe.to_string()));
        }

        if self.app.min_replicas > self.app.max_replicas {
            return Err(ConfigError::ReplicaBounds {
                min: self.app.min_replicas,
                max: self.app.max_replicas,
            });
        }
        if self.app.cpu.is_nan() || self.app.cpu <= 0.0 {
            return Err(ConfigError::InvalidCpu(self.app.cpu));
        }
        let memory_ok = self
            .app
            .memory
            .strip_suffix("Gi")
            .and_then(|n| n.parse::<f64>().ok())
            .is_some_and(|n| n > 0.0);
        if !memory_ok {
            return Err(ConfigError::InvalidMemory(self.app.memory.clone()));
        }
        if self.app.target_port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        for (name, path) in &self.env {
            let escapes = path.starts_with('/')
                || path.starts_with('\\')
                || path.split(['/', '\\']).any(|segment| segment == "..");
            if escapes {
                return Err(ConfigError::EscapingEnvPath {
                    name: name.clone(),
                    path: path.clone(),
                });
            }
        }

        Ok(())
    }

    /// Login server of the private registry.
    pub fn registry_server(&self) -> String {
        format!("{}.azurecr.io", self.names.registry)
    }

    /// Fully qualified private image reference.
    pub fn target_image(&self) -> String {
        format!("{}/{}", self.registry_server(), self.images.target)
    }

    /// Value of an env var: `path` joined to the mount path.
    pub fn env_value(&self, path: &str) -> String {
        let mount = self.app.mount_path.trim_end_matches('/');
        let path = path.trim_start_matches("./");
        if path.is_empty() {
            mount.to_string()
        } else {
            format!("{}/{}", mount, path)
        }
    }
}

impl std::str::FromStr for DeployConfig {
    type Err = ConfigError;

    /// Parse and validate TOML.
    fn from_str(raw: &str) -> Result<Self> {
        let config: DeployConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}
