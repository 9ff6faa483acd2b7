//! `Stockgate` Core Library
//!
//! Shared functionality for `Stockgate` components:
//! - Configuration resolution (defaults, settings file, environment)
//! - Private key resolution for the database tunnel
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::{Config, DatabaseSettings, Secret, ServerSettings, TunnelSettings};
pub use error::{Error, Result};
