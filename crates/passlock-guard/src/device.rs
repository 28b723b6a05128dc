//! Per-install device identity
//!
//! The device identifier keys the credential HMAC. Hosts with a platform
//! install id pass it to [`DeviceIdentity::new`]; otherwise a random UUID is
//! generated once and kept next to the settings file.

use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::{GuardError, Result};

/// Stable, unique-per-install identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Wrap a host-supplied identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(GuardError::Core(passlock_core::Error::InvalidInput(
                "device id must not be empty".to_string(),
            )));
        }
        Ok(Self { id })
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Load the identifier stored at `path`, generating and persisting one
    /// on first use
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            return Self::new(content.trim());
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!("Generated new device identity at {:?}", path);
        Ok(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &self.id)?;

        if let Err(e) = Self::install(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn install(temp_path: &Path, path: &Path) -> std::io::Result<()> {
        // Set restrictive permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(temp_path)?.permissions();
            perms.set_mode(0o600); // Read/write for owner only
            std::fs::set_permissions(temp_path, perms)?;
        }

        std::fs::rename(temp_path, path)
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.id
    }
}
