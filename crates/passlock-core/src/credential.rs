//! Device-bound credential derivation
//!
//! A stored credential is never the raw passcode. The passcode is first
//! hashed with SHA-512, and the hex form of that digest is then run through
//! HMAC-SHA256 keyed with the install's device identifier. A captured
//! credential is useless on another install, and a passcode guess cannot be
//! checked offline without the device id.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size of a credential hash in bytes (HMAC-SHA256 output)
pub const CREDENTIAL_HASH_SIZE: usize = 32;

/// Derived, device-bound representation of a passcode
#[derive(Clone, Copy, Eq, Zeroize)]
pub struct CredentialHash([u8; CREDENTIAL_HASH_SIZE]);

impl CredentialHash {
    pub fn new(bytes: [u8; CREDENTIAL_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CREDENTIAL_HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; CREDENTIAL_HASH_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Compare against a candidate without leaking where the first
    /// mismatching byte is
    pub fn matches(&self, candidate: &CredentialHash) -> bool {
        bool::from(self.ct_eq(candidate))
    }
}

impl ConstantTimeEq for CredentialHash {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0[..].ct_eq(&other.0[..])
    }
}

impl PartialEq for CredentialHash {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl std::fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialHash(<redacted>)")
    }
}

impl AsRef<[u8]> for CredentialHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for CredentialHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CredentialHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        CredentialHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Derive the credential hash for `passcode` on the install identified by
/// `device_id`.
///
/// Deterministic and side-effect free. Passcode format is the caller's
/// concern; only emptiness is rejected here.
pub fn derive_credential(passcode: &str, device_id: &str) -> Result<CredentialHash> {
    if passcode.is_empty() {
        return Err(Error::InvalidInput("passcode must not be empty".to_string()));
    }
    if device_id.is_empty() {
        return Err(Error::InvalidInput("device id must not be empty".to_string()));
    }

    let mut digest = Sha512::digest(passcode.as_bytes());
    let content_hash = Zeroizing::new(hex::encode(digest));
    digest.as_mut_slice().zeroize();

    let mut mac = HmacSha256::new_from_slice(device_id.as_bytes())
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(content_hash.as_bytes());

    Ok(CredentialHash(mac.finalize().into_bytes().into()))
}
