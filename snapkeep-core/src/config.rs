//! Configuration for the engine, its catalog backend and caller credentials
//!
//! Configuration is plain serde data. It can be loaded from a JSON file and
//! every field has a default, so a file only needs to name what it changes.

use serde::{Deserialize, Serialize};
use snapkeep_retry::RetryPolicy;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retention::RetentionPolicy;
use crate::{Result, SnapkeepError};

/// Default location of the local catalog document
pub const DEFAULT_CATALOG_PATH: &str = "./snapkeep-catalog.json";

/// Default object key of the catalog document in S3
pub const DEFAULT_CATALOG_KEY: &str = "snapkeep/catalog.json";

/// Provider credentials supplied by the caller
///
/// `Debug` output never includes the secret key or the session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

impl Credentials {
    pub fn new<S1, S2>(access_key_id: S1, secret_access_key: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            region: None,
        }
    }

    pub fn with_session_token<S: Into<String>>(mut self, token: S) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Validate that both key halves are present
    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.trim().is_empty() {
            return Err(SnapkeepError::config("access key id cannot be empty"));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(SnapkeepError::config("secret access key cannot be empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .finish()
    }
}

/// Enumeration of supported catalog backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogBackend {
    /// JSON document on the local filesystem
    Local,
    /// JSON document stored as an Amazon S3 object
    S3,
}

/// Where the catalog document lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// The catalog backend to use
    pub backend: CatalogBackend,
    /// Path of the catalog document (local backend)
    pub local_path: Option<PathBuf>,
    /// S3 bucket name (required for S3 backend)
    pub s3_bucket: Option<String>,
    /// Object key of the catalog document (S3 backend)
    pub s3_key: Option<String>,
    /// AWS region for S3 operations (optional, defaults to environment)
    pub s3_region: Option<String>,
}

impl CatalogConfig {
    /// Catalog stored in a local file
    pub fn local<P: AsRef<Path>>(path: P) -> Self {
        CatalogConfig {
            backend: CatalogBackend::Local,
            local_path: Some(path.as_ref().to_path_buf()),
            s3_bucket: None,
            s3_key: None,
            s3_region: None,
        }
    }

    /// Catalog stored as an S3 object
    pub fn s3(bucket: String, key: Option<String>) -> Self {
        CatalogConfig {
            backend: CatalogBackend::S3,
            local_path: None,
            s3_bucket: Some(bucket),
            s3_key: key,
            s3_region: None,
        }
    }

    /// Parse a catalog URI and create the matching configuration
    ///
    /// Supports formats:
    /// - `s3://bucket-name/path/catalog.json` for S3 storage
    /// - `/local/path.json` or `./relative/path.json` for local storage
    pub fn from_uri(uri: &str) -> Result<CatalogConfig> {
        if let Some(s3_part) = uri.strip_prefix("s3://") {
            let (bucket, key) = match s3_part.split_once('/') {
                Some((bucket, key)) => (bucket, key),
                None => (s3_part, ""),
            };
            if bucket.is_empty() {
                return Err(SnapkeepError::validation(
                    "Invalid S3 URI: missing bucket name",
                ));
            }

            let key = (!key.is_empty()).then(|| key.to_string());
            Ok(CatalogConfig::s3(bucket.to_string(), key))
        } else if uri.trim().is_empty() {
            Err(SnapkeepError::validation("Catalog location cannot be empty"))
        } else {
            Ok(CatalogConfig::local(uri))
        }
    }

    /// Resolved local path of the catalog document
    pub fn local_path(&self) -> PathBuf {
        self.local_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH))
    }

    /// Resolved S3 object key of the catalog document
    pub fn s3_key(&self) -> String {
        self.s3_key
            .clone()
            .unwrap_or_else(|| DEFAULT_CATALOG_KEY.to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend == CatalogBackend::S3
            && self.s3_bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(SnapkeepError::config(
                "S3 catalog backend requires a valid bucket name",
            ));
        }
        Ok(())
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::local(DEFAULT_CATALOG_PATH)
    }
}

/// Retry settings as they appear in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per provider call, including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Ceiling for a single retry delay
    pub max_backoff_ms: u64,
    /// Per-attempt timeout; 0 disables it
    pub attempt_timeout_ms: u64,
}

impl RetrySettings {
    /// Convert into the policy understood by the retry layer
    pub fn to_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::cloud_provider();
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: (self.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(self.attempt_timeout_ms)),
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            multiplier: defaults.multiplier,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::cloud_provider();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_interval.as_millis() as u64,
            max_backoff_ms: policy.max_interval.as_millis() as u64,
            attempt_timeout_ms: policy
                .attempt_timeout
                .map_or(0, |timeout| timeout.as_millis() as u64),
        }
    }
}

/// Default number of instances processed concurrently
pub fn default_fan_out() -> usize {
    num_cpus::get().clamp(1, 8)
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub catalog: CatalogConfig,
    pub retention: RetentionPolicy,
    /// Maximum number of per-instance provider workflows in flight
    pub fan_out: usize,
    pub retry: RetrySettings,
    /// Provider region; falls back to the provider's default
    pub region: Option<String>,
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SnapkeepError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|e| SnapkeepError::config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.catalog.validate()?;
        self.retention.validate()?;
        if self.fan_out < 1 {
            return Err(SnapkeepError::policy_violation("fan_out must be at least 1"));
        }
        if self.retry.max_attempts < 1 {
            return Err(SnapkeepError::config("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            retention: RetentionPolicy::default(),
            fan_out: default_fan_out(),
            retry: RetrySettings::default(),
            region: None,
        }
    }
}
