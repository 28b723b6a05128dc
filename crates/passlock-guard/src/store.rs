//! Security settings storage
//!
//! The guard persists exactly one [`SecuritySettings`] record. Stores expose
//! an atomic read-modify-write and broadcast a snapshot after every
//! successful write so other layers can react to security changes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use passlock_core::SecuritySettings;

use crate::error::Result;

/// Buffered change notifications per subscriber
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// In-place modification applied to the settings record
pub type SettingsMutator = Box<dyn FnOnce(&mut SecuritySettings) + Send>;

/// Single-record settings persistence
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current record, or `None` if nothing has been written yet
    async fn read(&self) -> Result<Option<SecuritySettings>>;

    /// Apply `mutator` to the record (a default record when absent) and
    /// persist the result atomically. Returns the stored record.
    async fn update(&self, mutator: SettingsMutator) -> Result<SecuritySettings>;

    /// Receive a snapshot after each successful write
    fn subscribe(&self) -> broadcast::Receiver<SecuritySettings>;
}

/// Volatile store, for tests and hosts that persist elsewhere
pub struct MemorySettingsStore {
    record: RwLock<Option<SecuritySettings>>,
    changes: broadcast::Sender<SecuritySettings>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::with_settings(None)
    }

    /// Start from an existing record
    pub fn with_settings(settings: Option<SecuritySettings>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            record: RwLock::new(settings),
            changes,
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self) -> Result<Option<SecuritySettings>> {
        Ok(self.record.read().await.clone())
    }

    async fn update(&self, mutator: SettingsMutator) -> Result<SecuritySettings> {
        let mut record = self.record.write().await;
        let mut settings = record.clone().unwrap_or_default();
        mutator(&mut settings);
        *record = Some(settings.clone());

        // No subscribers is fine
        let _ = self.changes.send(settings.clone());
        Ok(settings)
    }

    fn subscribe(&self) -> broadcast::Receiver<SecuritySettings> {
        self.changes.subscribe()
    }
}

/// JSON file store with an in-memory cache
pub struct FileSettingsStore {
    /// Path of the settings file
    path: PathBuf,

    /// Last persisted record
    cache: RwLock<Option<SecuritySettings>>,

    changes: broadcast::Sender<SecuritySettings>,
}

impl FileSettingsStore {
    /// Open the store at `path`, loading the record if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let cached = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let settings: SecuritySettings = serde_json::from_str(&content)?;
            debug!("Loaded security settings from {:?}", path);
            Some(settings)
        } else {
            None
        };

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            cache: RwLock::new(cached),
            changes,
        })
    }

    /// Location of the settings file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record to disk
    async fn save_to_disk(&self, settings: &SecuritySettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &content).await?;

        if let Err(e) = install_file(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Restrict `temp_path` and move it over `path`
async fn install_file(temp_path: &Path, path: &Path) -> std::io::Result<()> {
    // Set restrictive permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(temp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(temp_path, path).await
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn read(&self) -> Result<Option<SecuritySettings>> {
        Ok(self.cache.read().await.clone())
    }

    async fn update(&self, mutator: SettingsMutator) -> Result<SecuritySettings> {
        let mut cache = self.cache.write().await;
        let mut settings = cache.clone().unwrap_or_default();
        mutator(&mut settings);

        // Cache only changes once the file is in place
        self.save_to_disk(&settings).await?;
        *cache = Some(settings.clone());
        debug!("Persisted security settings to {:?}", self.path);

        let _ = self.changes.send(settings.clone());
        Ok(settings)
    }

    fn subscribe(&self) -> broadcast::Receiver<SecuritySettings> {
        self.changes.subscribe()
    }
}
