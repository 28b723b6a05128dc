//! Error types for the passcode guard

use thiserror::Error;

/// Result type alias for guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

/// Errors that can occur in the guard
#[derive(Debug, Error)]
pub enum GuardError {
    /// Trusted time source unreachable; nothing was changed
    #[error("Cannot validate current time with the time server: {0}")]
    TimeUnavailable(String),

    /// Wrong passcode, attempts remain
    #[error("Invalid passcode, {attempts_remaining} attempts left")]
    InvalidPasscode { attempts_remaining: u32 },

    /// This attempt triggered the lockout
    #[error("Passcode attempts exceeded")]
    PasscodeAttemptsExceeded,

    /// Verification refused during the cooldown
    #[error("Too many attempts, try again after {retry_after_minutes} minutes")]
    LockedOut { retry_after_minutes: u32 },

    /// No passcode has been set
    #[error("No passcode has been set")]
    PasscodeNotSet,

    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] passlock_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardError {
    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GuardError::TimeUnavailable(_)
                | GuardError::InvalidPasscode { .. }
                | GuardError::PasscodeAttemptsExceeded
                | GuardError::LockedOut { .. }
        )
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        GuardError::Serialization(e.to_string())
    }
}

impl From<crate::time_source::TimeError> for GuardError {
    fn from(e: crate::time_source::TimeError) -> Self {
        GuardError::TimeUnavailable(e.to_string())
    }
}
