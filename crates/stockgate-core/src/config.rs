//! Configuration resolution for Stockgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (explicit path, else ~/.config/stockgate/settings.json)
//! 3. Environment variables (the deployment's `SSH_*` / `PG_*` names)
//! 4. CLI arguments (highest priority, applied by the daemon)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Local port the database is exposed on when neither `SSH_LOCAL_PORT`
/// nor `PG_PORT` is set.
pub const DEFAULT_LOCAL_PORT: u16 = 5433;

/// Complete Stockgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelSettings::default(),
            database: DatabaseSettings::default(),
            server: ServerSettings::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A secret string. Redacted in `Debug` and serialization, wiped on drop.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

/// SSH tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Bastion host running the SSH server.
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    /// Inline private key. Literal `\n` sequences are accepted in place of newlines.
    pub private_key: Option<Secret>,
    /// Path to a private key file, used when no inline key is set.
    pub private_key_path: Option<PathBuf>,
    pub local_bind_addr: String,
    /// Local bridge port. Falls back to the database port when unset.
    pub local_port: Option<u16>,
    pub destination_host: String,
    pub destination_port: u16,
    pub keepalive_interval_secs: u64,
    pub keepalive_max: usize,
    pub connect_timeout_secs: u64,
    pub reconnect_initial_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
    /// Maximum consecutive failed attempts (None = retry forever).
    pub reconnect_max_attempts: Option<u32>,
    /// Expected `SHA256:` host key fingerprint. Any key is accepted when unset.
    pub host_key_fingerprint: Option<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            username: None,
            private_key: None,
            private_key_path: None,
            local_bind_addr: "127.0.0.1".to_string(),
            local_port: None,
            destination_host: "127.0.0.1".to_string(),
            destination_port: 5432,
            keepalive_interval_secs: 10,
            keepalive_max: 3,
            connect_timeout_secs: 20,
            reconnect_initial_delay_secs: 2,
            reconnect_max_delay_secs: 60,
            reconnect_max_attempts: None,
            host_key_fingerprint: None,
        }
    }
}

impl TunnelSettings {
    /// Resolve the private key material to bytes held in memory.
    ///
    /// An inline key wins over a key path. This is done once, before the
    /// tunnel is established; the tunnel never reads key files itself.
    pub fn resolve_private_key(&self) -> Result<Zeroizing<String>> {
        if let Some(inline) = self.private_key.as_ref().filter(|k| !k.is_blank()) {
            return Ok(Zeroizing::new(inline.expose().replace("\\n", "\n")));
        }

        if let Some(path) = &self.private_key_path {
            let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                Error::PrivateKey(format!(
                    "Failed to read SSH private key {}: {}",
                    path.display(),
                    e
                ))
            })?);
            if content.trim().is_empty() {
                return Err(Error::PrivateKey(format!(
                    "SSH private key file {} is empty",
                    path.display()
                )));
            }
            return Ok(content);
        }

        Err(Error::PrivateKey(
            "Missing SSH private key (set SSH_PRIVATE_KEY or SSH_PRIVATE_KEY_PATH)".to_string(),
        ))
    }
}

/// Postgres connection settings. The database is reached through the
/// tunnel's local bridge endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Connection URL. User, password and database are taken from it when
    /// set; host and port are always the tunnel's bridge endpoint.
    pub url: Option<Secret>,
    pub user: Option<String>,
    pub password: Option<Secret>,
    pub database: Option<String>,
    /// Local port the database is reached on.
    pub port: u16,
    pub max_connections: u32,
    /// How long the pool waits for the tunnel before giving up (seconds).
    pub ready_timeout_secs: Option<u64>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            database: None,
            port: DEFAULT_LOCAL_PORT,
            max_connections: 5,
            ready_timeout_secs: None,
        }
    }
}

/// HTTP server settings (health endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    /// Port the tunnel's bridge listener binds: `SSH_LOCAL_PORT`, else
    /// `PG_PORT`, else 5433.
    pub fn local_bind_port(&self) -> u16 {
        self.tunnel.local_port.unwrap_or(self.database.port)
    }

    /// Check that every required setting is present.
    ///
    /// All missing settings are reported in a single error.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if is_blank(self.tunnel.host.as_deref()) {
            missing.push("SSH_HOST");
        }
        if is_blank(self.tunnel.username.as_deref()) {
            missing.push("SSH_USER");
        }
        let has_inline_key = self.tunnel.private_key.as_ref().is_some_and(|k| !k.is_blank());
        if !has_inline_key && self.tunnel.private_key_path.is_none() {
            missing.push("SSH_PRIVATE_KEY");
        }
        if self.database.url.as_ref().is_none_or(Secret::is_blank) {
            if is_blank(self.database.user.as_deref()) {
                missing.push("PG_USER");
            }
            if self.database.password.as_ref().is_none_or(Secret::is_blank) {
                missing.push("PG_PASSWORD");
            }
            if is_blank(self.database.database.as_deref()) {
                missing.push("PG_DATABASE");
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )))
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Load configuration with hierarchical resolution.
///
/// `path` overrides the global settings file location. A missing global
/// file is not an error; a missing explicit file is.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(explicit) => load_config_file(explicit)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// `settings.json` under the platform config directory.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stockgate").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply environment overrides using `lookup` to read variables.
///
/// Unparseable numeric values are ignored, leaving the previous value.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(val) = lookup("SSH_HOST") {
        config.tunnel.host = Some(val);
    }
    if let Some(n) = lookup("SSH_PORT").and_then(|v| v.trim().parse().ok()) {
        config.tunnel.port = n;
    }
    if let Some(val) = lookup("SSH_USER") {
        config.tunnel.username = Some(val);
    }
    if let Some(val) = lookup("SSH_PRIVATE_KEY") {
        config.tunnel.private_key = Some(Secret::new(val));
    }
    if let Some(val) = lookup("SSH_PRIVATE_KEY_PATH") {
        config.tunnel.private_key_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("SSH_LOCAL_PORT").and_then(|v| v.trim().parse().ok()) {
        config.tunnel.local_port = Some(n);
    }
    if let Some(val) = lookup("SSH_HOST_KEY_FINGERPRINT") {
        config.tunnel.host_key_fingerprint = Some(val);
    }
    if let Some(n) = parsed("SSH_KEEPALIVE_INTERVAL") {
        config.tunnel.keepalive_interval_secs = n;
    }
    if let Some(n) = parsed("SSH_READY_TIMEOUT") {
        config.tunnel.connect_timeout_secs = n;
    }
    if let Some(val) = lookup("DATABASE_URL") {
        config.database.url = Some(Secret::new(val));
    }
    if let Some(val) = lookup("PG_USER") {
        config.database.user = Some(val);
    }
    if let Some(val) = lookup("PG_PASSWORD") {
        config.database.password = Some(Secret::new(val));
    }
    if let Some(val) = lookup("PG_DATABASE") {
        config.database.database = Some(val);
    }
    if let Some(n) = lookup("PG_PORT").and_then(|v| v.trim().parse().ok()) {
        config.database.port = n;
    }
    if let Some(n) = lookup("PORT").and_then(|v| v.trim().parse().ok()) {
        config.server.port = n;
    }
    if let Some(val) = lookup("STOCKGATE_LOG_LEVEL") {
        config.log_level = val;
    }
}
