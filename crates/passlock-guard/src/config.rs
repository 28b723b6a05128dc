//! Guard configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use passlock_core::{LockoutPolicy, LOCKOUT_COOLDOWN_MINUTES, LOCKOUT_THRESHOLD};

use crate::error::{GuardError, Result};
use crate::time_source::SntpTimeProvider;

/// Guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Path of the security settings file
    pub settings_path: PathBuf,

    /// Path of the device identity file
    pub device_id_path: PathBuf,

    /// NTP servers (`host:port`) queried in order for trusted time
    pub ntp_servers: Vec<String>,

    /// Per-server NTP timeout (seconds)
    pub ntp_timeout_secs: u64,

    /// Consecutive failures that trigger a lockout
    pub lockout_threshold: u32,

    /// Lockout cooldown (minutes)
    pub lockout_cooldown_minutes: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            settings_path: data_dir.join("security.json"),
            device_id_path: data_dir.join("device_id"),
            ntp_servers: SntpTimeProvider::DEFAULT_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ntp_timeout_secs: 5,
            lockout_threshold: LOCKOUT_THRESHOLD,
            lockout_cooldown_minutes: LOCKOUT_COOLDOWN_MINUTES,
        }
    }
}

impl GuardConfig {
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| {
                #[cfg(unix)]
                {
                    PathBuf::from("/var/lib")
                }
                #[cfg(windows)]
                {
                    PathBuf::from(r"C:\ProgramData")
                }
            })
            .join("passlock")
    }

    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that would make the guard unusable
    pub fn validate(&self) -> Result<()> {
        if self.ntp_servers.is_empty() {
            return Err(GuardError::Config(
                "at least one NTP server is required".to_string(),
            ));
        }
        if self.ntp_timeout_secs == 0 {
            return Err(GuardError::Config(
                "ntp_timeout_secs must be positive".to_string(),
            ));
        }
        self.lockout_policy()?;
        Ok(())
    }

    /// Lockout policy described by this configuration
    pub fn lockout_policy(&self) -> Result<LockoutPolicy> {
        LockoutPolicy::new(self.lockout_threshold, self.lockout_cooldown_minutes)
            .map_err(|e| GuardError::Config(e.to_string()))
    }

    /// SNTP provider for the configured servers
    pub fn time_provider(&self) -> SntpTimeProvider {
        SntpTimeProvider::new(
            self.ntp_servers.clone(),
            Duration::from_secs(self.ntp_timeout_secs),
        )
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        for path in [&self.settings_path, &self.device_id_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
