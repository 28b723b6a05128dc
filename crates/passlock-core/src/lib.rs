//! Passlock Core - Shared types, credential derivation, and lockout policy
//!
//! This crate provides the foundational pieces of the Passlock passcode
//! guard: the persisted security settings record, the device-bound
//! credential deriver, and the attempt/lockout state machine. Everything
//! here is pure; persistence and trusted time live in `passlock-guard`.

pub mod credential;
pub mod error;
pub mod lockout;
pub mod settings;

pub use credential::{derive_credential, CredentialHash, CREDENTIAL_HASH_SIZE};
pub use error::{Error, Result};
pub use lockout::{minutes_between, AttemptOutcome, GuardState, LockCheck, LockoutPolicy};
pub use settings::SecuritySettings;

/// Consecutive failed attempts that trigger a lockout
pub const LOCKOUT_THRESHOLD: u32 = 5;

/// Lockout cooldown in minutes (inclusive: the lock clears strictly after this)
pub const LOCKOUT_COOLDOWN_MINUTES: i64 = 3;
