//! The persisted security settings record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::CredentialHash;

/// Single persisted record backing the passcode guard.
///
/// All timestamps are trusted (network) time. A record with every field at
/// its default is what a store hands to a mutator when nothing has been
/// written yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Derived passcode credential; `None` means no passcode is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_hash: Option<CredentialHash>,

    /// Consecutive failed attempts since the last success or lockout clear
    #[serde(default)]
    pub failed_attempts: u32,

    /// When the attempt threshold was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,

    /// When the passcode was last verified successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unlocked_at: Option<DateTime<Utc>>,
}

impl SecuritySettings {
    /// Record holding only a credential
    pub fn with_credential(credential_hash: CredentialHash) -> Self {
        Self {
            credential_hash: Some(credential_hash),
            ..Self::default()
        }
    }

    pub fn has_passcode(&self) -> bool {
        self.credential_hash.is_some()
    }
}
