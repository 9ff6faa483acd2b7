//! Error types for the `Stockgate` core library.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing, unreadable or invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// SSH private key could not be resolved
    #[error("Private key error: {0}")]
    PrivateKey(String),
}
