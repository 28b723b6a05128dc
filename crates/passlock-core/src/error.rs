//! Error types for the Passlock core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Invalid credential hash: {0}")]
    InvalidCredential(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid lockout policy: {0}")]
    InvalidPolicy(String),
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidCredential(e.to_string())
    }
}
