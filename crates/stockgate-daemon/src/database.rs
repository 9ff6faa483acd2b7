//! Postgres pool reached through the tunnel.
//!
//! The pool is only created once the tunnel reports `Ready`; a closed or
//! timed-out wait is returned as an error without touching the network.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use stockgate_core::DatabaseSettings;
use stockgate_tunnel::{TunnelReadiness, WaitError};
use tracing::{debug, info};

/// Database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Tunnel not ready: {0}")]
    TunnelUnavailable(#[from] WaitError),

    #[error("Invalid database settings: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Connection options aimed at the bridge `endpoint`.
///
/// With a connection URL, credentials and database come from the URL;
/// otherwise from the individual settings. Host and port are always the
/// endpoint.
pub fn connect_options(
    settings: &DatabaseSettings,
    endpoint: SocketAddr,
) -> Result<PgConnectOptions, DatabaseError> {
    let options = match settings.url.as_ref().filter(|url| !url.is_blank()) {
        Some(url) => PgConnectOptions::from_str(url.expose())
            .map_err(|_| DatabaseError::Config("DATABASE_URL is not a valid Postgres URL".into()))?,
        None => {
            let mut options = PgConnectOptions::new()
                .username(settings.user.as_deref().unwrap_or_default())
                .database(settings.database.as_deref().unwrap_or_default());
            if let Some(password) = &settings.password {
                options = options.password(password.expose());
            }
            options
        }
    };

    Ok(options
        .host(&endpoint.ip().to_string())
        .port(endpoint.port()))
}

/// Wait for the tunnel, then open the pool through its bridge endpoint.
pub async fn open_pool(
    readiness: &TunnelReadiness,
    settings: &DatabaseSettings,
    deadline: Option<Duration>,
) -> Result<PgPool, DatabaseError> {
    debug!(?deadline, "Waiting for tunnel before connecting to the database");
    let epoch = readiness.wait_until_ready(deadline).await?;
    let endpoint = readiness
        .local_addr()
        .ok_or_else(|| DatabaseError::Config("tunnel has no local endpoint".into()))?;

    let options = connect_options(settings, endpoint)?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(epoch, %endpoint, "Database pool connected through tunnel");
    Ok(pool)
}

/// Round-trip a trivial query.
pub async fn ping(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use stockgate_core::Secret;
    use stockgate_tunnel::TunnelManager;
    use stockgate_tunnel::testing::MockTransport;

    use super::*;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:5433".parse().unwrap()
    }

    #[test]
    fn options_target_the_bridge_endpoint() {
        let settings = DatabaseSettings {
            user: Some("app".into()),
            password: Some(Secret::new("hunter2")),
            database: Some("inventory".into()),
            ..Default::default()
        };
        let options = connect_options(&settings, endpoint()).unwrap();
        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("inventory"));
    }

    #[test]
    fn url_host_is_replaced_by_endpoint() {
        let settings = DatabaseSettings {
            url: Some(Secret::new("postgres://svc:pw@db.internal:5432/stock")),
            ..Default::default()
        };
        let options = connect_options(&settings, endpoint()).unwrap();
        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "svc");
        assert_eq!(options.get_database(), Some("stock"));
    }

    #[test]
    fn malformed_url_does_not_echo_secret() {
        let settings = DatabaseSettings {
            url: Some(Secret::new("postgres://svc:topsecret@[db.internal/stock")),
            ..Default::default()
        };
        let err = connect_options(&settings, endpoint()).unwrap_err();
        assert!(matches!(&err, DatabaseError::Config(_)));
        assert!(!err.to_string().contains("topsecret"));
    }

    #[tokio::test]
    async fn closed_tunnel_fails_without_connecting() {
        let manager = TunnelManager::new(MockTransport::new());
        let readiness = manager.readiness();
        manager.close();

        let err = open_pool(&readiness, &DatabaseSettings::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::TunnelUnavailable(WaitError::Closed)));
    }

    #[tokio::test]
    async fn readiness_deadline_is_reported() {
        let manager = TunnelManager::new(MockTransport::new());
        let err = open_pool(
            &manager.readiness(),
            &DatabaseSettings::default(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DatabaseError::TunnelUnavailable(WaitError::Timeout)));
    }
}
