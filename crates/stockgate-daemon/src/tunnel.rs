//! Tunnel wiring for the daemon.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use stockgate_core::{Config, Error, Result};
use stockgate_tunnel::{Credential, ReconnectPolicy, Transport, TunnelConfig, TunnelManager};
use tracing::{error, info};

/// Build the tunnel configuration from validated settings and the resolved
/// private key.
pub fn tunnel_config(config: &Config, credential: Credential) -> Result<TunnelConfig> {
    let settings = &config.tunnel;
    let bind_ip: IpAddr = settings.local_bind_addr.trim().parse().map_err(|e| {
        Error::Config(format!(
            "Invalid local bind address {:?}: {e}",
            settings.local_bind_addr
        ))
    })?;

    let mut tunnel = TunnelConfig::new(
        settings.host.clone().unwrap_or_default(),
        settings.username.clone().unwrap_or_default(),
        credential,
    );
    tunnel.port = settings.port;
    tunnel.keepalive_interval = Duration::from_secs(settings.keepalive_interval_secs);
    tunnel.keepalive_max = settings.keepalive_max;
    tunnel.connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
    tunnel.local_addr = SocketAddr::new(bind_ip, config.local_bind_port());
    tunnel.destination_host.clone_from(&settings.destination_host);
    tunnel.destination_port = settings.destination_port;
    tunnel.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_secs(settings.reconnect_initial_delay_secs),
        max_delay: Duration::from_secs(settings.reconnect_max_delay_secs),
        max_attempts: settings.reconnect_max_attempts,
        ..ReconnectPolicy::default()
    };
    tunnel
        .host_key_fingerprint
        .clone_from(&settings.host_key_fingerprint);

    tunnel
        .validate()
        .map_err(|e| Error::Config(e.to_string()))?;
    Ok(tunnel)
}

/// Establish the tunnel at startup.
///
/// A failed first attempt is logged and startup continues; the supervisor
/// keeps retrying in the background and the health endpoint reports it.
pub async fn establish_or_continue<T: Transport>(
    manager: &TunnelManager<T>,
    config: TunnelConfig,
) -> Option<u64> {
    let local = config.local_addr;
    let remote = format!("{}:{}", config.destination_host, config.destination_port);
    match manager.establish(config).await {
        Ok(epoch) => {
            info!(epoch, %local, %remote, "SSH tunnel established");
            Some(epoch)
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "SSH tunnel failed, continuing without it");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stockgate_core::config::apply_env_overrides;
    use stockgate_tunnel::testing::{MockOutcome, MockTransport};
    use stockgate_tunnel::TunnelState;

    fn settings(pairs: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        });
        config
    }

    #[test]
    fn maps_settings_onto_tunnel_config() {
        let mut config = settings(&[
            ("SSH_HOST", "bastion.example.com"),
            ("SSH_PORT", "2222"),
            ("SSH_USER", "deploy"),
            ("PG_PORT", "6543"),
            ("SSH_KEEPALIVE_INTERVAL", "15"),
        ]);
        config.tunnel.reconnect_max_attempts = Some(5);

        let tunnel = tunnel_config(&config, Credential::new("KEY")).unwrap();
        assert_eq!(tunnel.host, "bastion.example.com");
        assert_eq!(tunnel.port, 2222);
        assert_eq!(tunnel.username, "deploy");
        assert_eq!(tunnel.local_addr.to_string(), "127.0.0.1:6543");
        assert_eq!(tunnel.destination_port, 5432);
        assert_eq!(tunnel.keepalive_interval, Duration::from_secs(15));
        assert_eq!(tunnel.reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(tunnel.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn invalid_bind_address_is_config_error() {
        let mut config = settings(&[("SSH_HOST", "h"), ("SSH_USER", "u")]);
        config.tunnel.local_bind_addr = "localhost:5433".to_string();
        let err = tunnel_config(&config, Credential::new("KEY")).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("bind address")));
    }

    #[test]
    fn blank_host_is_config_error() {
        let config = settings(&[("SSH_USER", "u")]);
        assert!(tunnel_config(&config, Credential::new("KEY")).is_err());
    }

    #[tokio::test]
    async fn failed_first_attempt_does_not_stop_startup() {
        let transport = MockTransport::new();
        transport.script([MockOutcome::Reject("denied".into())]);
        let manager = TunnelManager::new(transport);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut config = settings(&[("SSH_HOST", "h"), ("SSH_USER", "u")]);
        config.tunnel.local_port = Some(port);

        let tunnel = tunnel_config(&config, Credential::new("KEY")).unwrap();
        assert_eq!(establish_or_continue(&manager, tunnel).await, None);
        assert_eq!(manager.status().state, TunnelState::Degraded);
        manager.shutdown().await;
    }
}
