//! `Stockgate` Daemon Library
//!
//! Process-level wiring around the tunnel manager:
//! - Tunnel configuration from resolved settings
//! - HTTP health endpoint backed by the tunnel status
//! - Postgres pool gated on tunnel readiness
//! - `OpenTelemetry` recording of tunnel status (feature `metrics`)

pub mod database;
pub mod health;
#[cfg(feature = "metrics")]
pub mod telemetry;
pub mod tunnel;
