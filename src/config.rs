//! Configuration loading and types.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The [`TargetConfig`] subsection describes one
//! storage target (provider, bucket, prefix, encryption and retry
//! tuning); it is validated when a [`Target`](crate::target::Target) is
//! constructed, never later.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::errors::StoreError;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The storage target holding the ACTIVE pointer.
    pub target: TargetConfig,

    /// ACTIVE pointer settings.
    #[serde(default)]
    pub pointer: PointerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Storage provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    S3,
    Azure,
    Gcs,
    /// In-process store with the same conditional-write semantics.
    Memory,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::S3 => "s3",
            BackendType::Azure => "azure",
            BackendType::Gcs => "gcs",
            BackendType::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "aws" => Ok(BackendType::S3),
            "azure" | "az" => Ok(BackendType::Azure),
            "gcs" | "gcp" | "gs" => Ok(BackendType::Gcs),
            "memory" => Ok(BackendType::Memory),
            other => Err(StoreError::Config(format!(
                "unknown backend type '{other}' (expected s3, azure, gcs or memory)"
            ))),
        }
    }
}

/// Backoff curve used between transient-failure retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Base delay doubling per retry, capped.
    #[default]
    Exponential,
    /// Base delay growing by a fixed increment per retry, capped.
    Linear,
}

/// One storage target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Name used for logging and error context.
    pub name: String,

    /// Backend type: `s3`, `azure`, `gcs` or `memory`. Kept as a string so
    /// unknown values are rejected at target construction.
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Bucket (S3, GCS) or container (Azure) name.
    #[serde(alias = "container", default)]
    pub bucket: String,

    /// Provider region (S3).
    #[serde(default = "default_region")]
    pub region: String,

    /// Key prefix; objects live at `<prefix>/<key>`.
    #[serde(default)]
    pub prefix: String,

    /// KMS key for server-side encryption (S3 key ID/ARN, GCS key name).
    #[serde(default)]
    pub kms_key: Option<String>,

    /// Azure encryption scope.
    #[serde(default)]
    pub encryption_scope: Option<String>,

    /// Azure storage account name.
    #[serde(default)]
    pub account: Option<String>,

    /// Custom endpoint (MinIO, Azurite, fake-gcs-server, ...).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Force path-style addressing (S3-compatible endpoints).
    #[serde(default)]
    pub use_path_style: bool,

    /// Explicit S3 access key (falls back to the AWS credential chain).
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Explicit S3 secret key (falls back to the AWS credential chain).
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Path to a GCS service account or ADC JSON file.
    #[serde(default)]
    pub credentials_file: Option<String>,

    /// Maximum in-flight requests against this target.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Overall per-operation deadline in seconds, retries included.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Backoff curve between retries.
    #[serde(default)]
    pub retry_backoff: RetryBackoff,

    /// First retry delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Randomise retry delays.
    #[serde(default = "default_true")]
    pub retry_jitter: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            backend_type: String::new(),
            bucket: String::new(),
            region: default_region(),
            prefix: String::new(),
            kms_key: None,
            encryption_scope: None,
            account: None,
            endpoint: None,
            use_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            credentials_file: None,
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
            retry_backoff: RetryBackoff::default(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: true,
        }
    }
}

impl TargetConfig {
    /// Convenience constructor for the common fields.
    pub fn new(
        name: impl Into<String>,
        backend_type: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend_type: backend_type.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration and resolve the backend type.
    pub fn validate(&self) -> Result<BackendType, StoreError> {
        let backend_type: BackendType = self.backend_type.parse()?;

        if self.name.trim().is_empty() {
            return Err(StoreError::Config("target name must not be empty".to_string()));
        }
        if backend_type != BackendType::Memory && self.bucket.trim().is_empty() {
            return Err(StoreError::Config(format!(
                "target '{}': {} requires a bucket/container",
                self.name, backend_type
            )));
        }
        if backend_type == BackendType::Azure
            && self.account.as_deref().map_or(true, |a| a.trim().is_empty())
        {
            return Err(StoreError::Config(format!(
                "target '{}': azure requires an account name",
                self.name
            )));
        }
        if self.encryption_scope.is_some()
            && !matches!(backend_type, BackendType::Azure | BackendType::Memory)
        {
            return Err(StoreError::Config(format!(
                "target '{}': encryption_scope is only supported on azure",
                self.name
            )));
        }
        if self.kms_key.is_some() && backend_type == BackendType::Azure {
            return Err(StoreError::Config(format!(
                "target '{}': azure uses encryption_scope, not kms_key",
                self.name
            )));
        }
        if self.max_concurrency == 0 {
            return Err(StoreError::Config(format!(
                "target '{}': max_concurrency must be at least 1",
                self.name
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(StoreError::Config(format!(
                "target '{}': timeout_seconds must be at least 1",
                self.name
            )));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(StoreError::Config(format!(
                "target '{}': retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.name, self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(StoreError::Config(format!(
                "target '{}': access_key_id and secret_access_key must be set together",
                self.name
            )));
        }

        Ok(backend_type)
    }
}

/// What the pointer manager does when a claim loses the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Report the conflict to the caller.
    #[default]
    Report,
    /// Return the winner's pointer instead of failing.
    ReadCurrent,
}

/// ACTIVE pointer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PointerConfig {
    /// Key of the pointer object, relative to the target prefix.
    #[serde(default = "default_pointer_key")]
    pub key: String,

    /// Behaviour when a claim loses the race.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            key: default_pointer_key(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder.
    #[serde(default)]
    pub metrics: bool,

    /// Address the Prometheus exporter listens on.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: false,
            metrics_listen: default_metrics_listen(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_concurrency() -> usize {
    16
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_pointer_key() -> String {
    "ACTIVE".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9464".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backend_type_parsing() {
        assert_eq!("s3".parse::<BackendType>().unwrap(), BackendType::S3);
        assert_eq!("GCS".parse::<BackendType>().unwrap(), BackendType::Gcs);
        assert_eq!("azure".parse::<BackendType>().unwrap(), BackendType::Azure);
        assert_eq!("memory".parse::<BackendType>().unwrap(), BackendType::Memory);
        assert!(matches!(
            "minio".parse::<BackendType>(),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_validate_unknown_type() {
        let cfg = TargetConfig::new("primary", "ftp", "bucket");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, StoreError::Config(ref msg) if msg.contains("ftp")));
    }

    #[test]
    fn test_validate_requires_bucket() {
        let cfg = TargetConfig::new("primary", "s3", "");
        assert!(matches!(cfg.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_validate_azure_requires_account() {
        let mut cfg = TargetConfig::new("primary", "azure", "state");
        assert!(matches!(cfg.validate(), Err(StoreError::Config(_))));
        cfg.account = Some("acct".to_string());
        assert_eq!(cfg.validate().unwrap(), BackendType::Azure);
    }

    #[test]
    fn test_validate_encryption_settings() {
        let mut cfg = TargetConfig::new("primary", "s3", "bucket");
        cfg.encryption_scope = Some("scope".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = TargetConfig::new("primary", "azure", "state");
        cfg.account = Some("acct".to_string());
        cfg.kms_key = Some("key".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_limits() {
        let mut cfg = TargetConfig::new("primary", "gcs", "bucket");
        cfg.max_concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TargetConfig::new("primary", "gcs", "bucket");
        cfg.timeout_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TargetConfig::new("primary", "gcs", "bucket");
        cfg.retry_base_delay_ms = 10_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_memory_needs_no_bucket() {
        let cfg = TargetConfig::new("scratch", "memory", "");
        assert_eq!(cfg.validate().unwrap(), BackendType::Memory);
    }

    #[test]
    fn test_yaml_deserialization_defaults() {
        let yaml = r#"
target:
  name: primary
  type: gcs
  bucket: state-bucket
  prefix: envs/prod
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.target.name, "primary");
        assert_eq!(config.target.backend_type, "gcs");
        assert_eq!(config.target.prefix, "envs/prod");
        assert_eq!(config.target.max_concurrency, 16);
        assert_eq!(config.target.max_retries, 3);
        assert_eq!(config.target.timeout_seconds, 30);
        assert_eq!(config.target.retry_backoff, RetryBackoff::Exponential);
        assert!(config.target.retry_jitter);
        assert_eq!(config.pointer.key, "ACTIVE");
        assert_eq!(config.pointer.conflict_policy, ConflictPolicy::Report);
        assert_eq!(config.logging.level, "info");
        assert!(!config.observability.metrics);
    }

    #[test]
    fn test_yaml_deserialization_azure() {
        let yaml = r#"
target:
  name: blob
  type: azure
  container: state
  account: mystorageaccount
  encryption_scope: tenant-a
  retry_backoff: linear
  max_retries: 5
pointer:
  key: current/ACTIVE
  conflict_policy: read_current
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.target.bucket, "state");
        assert_eq!(config.target.account.as_deref(), Some("mystorageaccount"));
        assert_eq!(config.target.encryption_scope.as_deref(), Some("tenant-a"));
        assert_eq!(config.target.retry_backoff, RetryBackoff::Linear);
        assert_eq!(config.target.max_retries, 5);
        assert_eq!(config.pointer.key, "current/ACTIVE");
        assert_eq!(config.pointer.conflict_policy, ConflictPolicy::ReadCurrent);
        assert_eq!(config.target.validate().unwrap(), BackendType::Azure);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "target:\n  name: local\n  type: memory\nlogging:\n  level: debug\n  format: json"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.target.name, "local");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/activestore.yaml").is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config =
            serde_yaml::from_str(include_str!("../activestore.example.yaml")).unwrap();
        assert_eq!(config.target.validate().unwrap(), BackendType::Memory);
        assert_eq!(config.pointer.key, "ACTIVE");
        assert_eq!(config.pointer.conflict_policy, ConflictPolicy::Report);
        assert!(!config.observability.metrics);
    }
}
