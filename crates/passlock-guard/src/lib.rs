//! Passlock Guard - Passcode verification service
//!
//! This crate provides:
//! - The passcode guard with attempt counting and trusted-time lockout
//! - Settings store abstraction with file and in-memory backends
//! - Trusted time provider abstraction with an SNTP client
//! - Per-install device identity
//! - Guard configuration

pub mod config;
pub mod device;
pub mod error;
pub mod guard;
pub mod store;
pub mod time_source;

pub use config::GuardConfig;
pub use device::DeviceIdentity;
pub use error::{GuardError, Result};
pub use guard::PasscodeGuard;
pub use store::{FileSettingsStore, MemorySettingsStore, SettingsMutator, SettingsStore};
pub use time_source::{SntpTimeProvider, TimeError, TrustedTimeProvider};

pub use passlock_core::{CredentialHash, GuardState, LockoutPolicy, SecuritySettings};
