//! Ambient routing and resolver state, and its guaranteed restoration.

use std::path::PathBuf;

use async_trait::async_trait;

use super::driver::{render_template, run_command};
use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Routing and resolver changes made while the tunnel is up.
#[async_trait]
pub trait NetworkState: Send + Sync {
    /// Point the default route and resolver at the tunnel.
    async fn apply(&self) -> Result<(), NetworkError>;

    /// Put back what was there before. Every part is attempted even when an
    /// earlier part fails; the first failure is returned.
    async fn restore(&self) -> Result<(), NetworkError>;
}

/// Changes the host's default route and resolver file.
#[derive(Debug, Clone)]
pub struct SystemNetwork {
    interface: String,
    config: NetworkConfig,
    resolv_conf: PathBuf,
    /// Resolver file contents captured before any change.
    original_resolv: Option<String>,
}

impl SystemNetwork {
    /// Snapshot the resolver file so [`NetworkState::restore`] can put it back.
    pub async fn capture(interface: &str, config: &NetworkConfig) -> Result<Self, NetworkError> {
        let resolv_conf = PathBuf::from(&config.resolv_conf);
        let original_resolv = if config.manage_dns {
            let contents = tokio::fs::read_to_string(&resolv_conf)
                .await
                .map_err(|source| NetworkError::Io {
                    path: config.resolv_conf.clone(),
                    source,
                })?;
            Some(contents)
        } else {
            None
        };

        Ok(Self {
            interface: interface.to_string(),
            config: config.clone(),
            resolv_conf,
            original_resolv,
        })
    }

    async fn write_resolv(&self, contents: &str) -> Result<(), NetworkError> {
        tokio::fs::write(&self.resolv_conf, contents)
            .await
            .map_err(|source| NetworkError::Io {
                path: self.config.resolv_conf.clone(),
                source,
            })
    }
}

fn nameserver_lines(servers: &[String]) -> String {
    servers
        .iter()
        .map(|server| format!("nameserver {server}\n"))
        .collect()
}

#[async_trait]
impl NetworkState for SystemNetwork {
    async fn apply(&self) -> Result<(), NetworkError> {
        if self.config.manage_routes {
            let argv = render_template(&self.config.route_add_command, &self.interface);
            run_command(&argv, &[]).await?;
            tracing::info!(interface = %self.interface, "Default route set through tunnel");
        }

        if self.config.manage_dns {
            self.write_resolv(&nameserver_lines(&self.config.dns_servers))
                .await?;
            tracing::info!(servers = ?self.config.dns_servers, "Resolver pointed at tunnel DNS");
        }

        Ok(())
    }

    async fn restore(&self) -> Result<(), NetworkError> {
        let mut first_error = None;

        if self.config.manage_routes {
            let argv = render_template(&self.config.route_delete_command, &self.interface);
            match run_command(&argv, &[]).await {
                Ok(()) => tracing::info!("Default route reverted"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to revert default route");
                    first_error.get_or_insert(NetworkError::from(e));
                }
            }
        }

        if let Some(original) = &self.original_resolv {
            match self.write_resolv(original).await {
                Ok(()) => tracing::info!(path = %self.config.resolv_conf, "Resolver config reverted"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to revert resolver config");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Counts calls. `restore` never fails; `apply` fails when built with
    /// [`CountingNetwork::failing_apply`].
    #[derive(Default)]
    pub struct CountingNetwork {
        applies: AtomicUsize,
        restores: AtomicUsize,
        fail_apply: bool,
        slow_apply: Option<Duration>,
    }

    impl CountingNetwork {
        pub fn failing_apply() -> Self {
            Self {
                fail_apply: true,
                ..Self::default()
            }
        }

        /// `apply` is counted, then stalls for `delay`.
        pub fn slow_apply(delay: Duration) -> Self {
            Self {
                slow_apply: Some(delay),
                ..Self::default()
            }
        }

        pub fn applies(&self) -> usize {
            self.applies.load(Ordering::SeqCst)
        }

        pub fn restores(&self) -> usize {
            self.restores.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkState for CountingNetwork {
        async fn apply(&self) -> Result<(), NetworkError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.slow_apply {
                tokio::time::sleep(delay).await;
            }
            if self.fail_apply {
                return Err(NetworkError::Io {
                    path: "/etc/resolv.conf".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(())
        }

        async fn restore(&self) -> Result<(), NetworkError> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(resolv: &std::path::Path, route_delete: &[&str]) -> NetworkConfig {
        NetworkConfig {
            manage_routes: true,
            manage_dns: true,
            dns_servers: vec!["10.64.0.1".to_string(), "10.64.0.2".to_string()],
            resolv_conf: resolv.to_string_lossy().into_owned(),
            route_add_command: vec!["true".to_string()],
            route_delete_command: route_delete.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn temp_resolv(contents: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("relay-guard-resolv-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_apply_then_restore_round_trips_resolver() {
        let path = temp_resolv("nameserver 192.168.1.1\n");
        let network = SystemNetwork::capture("wg0", &config_with(&path, &["true"]))
            .await
            .unwrap();

        network.apply().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 10.64.0.1\nnameserver 10.64.0.2\n"
        );

        network.restore().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 192.168.1.1\n"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_restore_reverts_resolver_even_when_route_revert_fails() {
        let path = temp_resolv("nameserver 192.168.1.1\n");
        let network = SystemNetwork::capture("wg0", &config_with(&path, &["false"]))
            .await
            .unwrap();
        network.apply().await.unwrap();

        let err = network.restore().await.unwrap_err();
        assert!(matches!(err, NetworkError::Command(_)));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 192.168.1.1\n"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unmanaged_network_touches_nothing() {
        let config = NetworkConfig {
            manage_routes: false,
            manage_dns: false,
            resolv_conf: "/nonexistent/resolv.conf".to_string(),
            ..NetworkConfig::default()
        };
        let network = SystemNetwork::capture("wg0", &config).await.unwrap();
        network.apply().await.unwrap();
        network.restore().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_fails_on_unreadable_resolver() {
        let config = NetworkConfig {
            resolv_conf: "/nonexistent/resolv.conf".to_string(),
            ..NetworkConfig::default()
        };
        let err = SystemNetwork::capture("wg0", &config).await.unwrap_err();
        assert!(matches!(err, NetworkError::Io { .. }));
    }
}
