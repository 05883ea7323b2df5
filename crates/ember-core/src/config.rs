//! Service configuration.
//!
//! Loaded from a JSON file when one exists. Missing sections and missing
//! fields within a section fall back to their defaults. The encryption key is never read from
//! the file, only from the environment variable named by `cipher.key_env`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherAlgorithm, ContentCipher};
use crate::eraser::DEFAULT_PASSES;
use crate::error::ConfigError;
use crate::paths;
use crate::retry::Backoff;

pub const DEFAULT_KEY_ENV: &str = "EMBER_ENCRYPTION_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    pub exports_dir: PathBuf,
    pub outbox_dir: PathBuf,
}

impl StorageSettings {
    pub fn under(root: &Path) -> Self {
        Self {
            database_path: root.join("ember.db"),
            exports_dir: root.join("exports"),
            outbox_dir: root.join("outbox"),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self::under(&paths::data_dir().unwrap_or_else(|_| PathBuf::from(".ember")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherSettings {
    pub algorithm: String,
    /// Environment variable holding the key text.
    pub key_env: String,
}

impl Default for CipherSettings {
    fn default() -> Self {
        Self {
            algorithm: CipherAlgorithm::Aes256Gcm.as_str().into(),
            key_env: DEFAULT_KEY_ENV.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EraseSettings {
    /// Random overwrite passes before the final zero pass.
    pub passes: u32,
}

impl Default for EraseSettings {
    fn default() -> Self {
        Self {
            passes: DEFAULT_PASSES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub interval_secs: u64,
    pub safety_net_interval_secs: u64,
    pub max_parallel_groups: usize,
    /// Failures of one stage before the run is marked FAILED.
    pub max_attempts: u32,
    pub claim_ttl_secs: u64,
    /// Upper bound on groups picked up by a single sweep.
    pub batch_limit: usize,
    /// Erase archives of purged groups after this many days. Off when unset.
    pub export_retention_days: Option<u32>,
    pub retry: RetrySettings,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            safety_net_interval_secs: 24 * 60 * 60,
            max_parallel_groups: 4,
            max_attempts: 5,
            claim_ttl_secs: 15 * 60,
            batch_limit: 100,
            export_retention_days: None,
            retry: RetrySettings::default(),
        }
    }
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn safety_net_interval(&self) -> Duration {
        Duration::from_secs(self.safety_net_interval_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmberConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub cipher: CipherSettings,
    #[serde(default)]
    pub erase: EraseSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
}

impl EmberConfig {
    /// Defaults with all storage rooted at `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            storage: StorageSettings::under(root),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EmberConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the default config location) if it exists, otherwise
    /// fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_path()?,
        };
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cipher_algorithm()?;
        if self.erase.passes == 0 {
            return Err(ConfigError::Invalid("erase.passes must be at least 1".into()));
        }
        if self.sweep.interval_secs == 0 || self.sweep.safety_net_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep intervals must be non-zero".into()));
        }
        if self.sweep.max_parallel_groups == 0 {
            return Err(ConfigError::Invalid("sweep.max_parallel_groups must be at least 1".into()));
        }
        if self.sweep.max_attempts == 0 {
            return Err(ConfigError::Invalid("sweep.max_attempts must be at least 1".into()));
        }
        if self.sweep.claim_ttl_secs == 0 {
            return Err(ConfigError::Invalid("sweep.claim_ttl_secs must be non-zero".into()));
        }
        if self.sweep.batch_limit == 0 {
            return Err(ConfigError::Invalid("sweep.batch_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cipher_algorithm(&self) -> Result<CipherAlgorithm, ConfigError> {
        self.cipher.algorithm.parse()
    }

    /// Build the process cipher from the key in the configured environment
    /// variable. Fails fast when the key is absent or short.
    pub fn build_cipher(&self) -> Result<ContentCipher, ConfigError> {
        let key = std::env::var(&self.cipher.key_env)
            .map_err(|_| ConfigError::MissingKey(self.cipher.key_env.clone()))?;
        self.build_cipher_with_key(&key)
    }

    pub fn build_cipher_with_key(&self, key: &str) -> Result<ContentCipher, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::MissingKey(self.cipher.key_env.clone()));
        }
        ContentCipher::new(self.cipher_algorithm()?, key)
    }
}
