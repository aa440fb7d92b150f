//! Tunnel lifecycle port and its external-command implementation.

use std::io;
use std::net::SocketAddr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::TunnelError;
use crate::relay::{RelayDescriptor, Selection};

/// Brings the encrypted tunnel up and down. At most one tunnel is up at a
/// time; callers tear down before bringing up a replacement.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn up(&self, selection: &Selection) -> Result<(), TunnelError>;
    async fn down(&self) -> Result<(), TunnelError>;
}

/// Drives the tunnel through configured commands such as `wg-quick`.
///
/// `{interface}` in any argument is replaced with the interface name. The
/// selected hops are exported to the child as `RELAY_ENTRY_*` and, for
/// multi-hop, `RELAY_EXIT_*` variables. `RELAY_*_PEER` is the ready
/// `address:port` WireGuard endpoint of the hop.
#[derive(Debug, Clone)]
pub struct CommandTunnelDriver {
    interface: String,
    peer_port: u16,
    up_command: Vec<String>,
    down_command: Vec<String>,
}

impl CommandTunnelDriver {
    pub fn new(
        interface: String,
        peer_port: u16,
        up_command: Vec<String>,
        down_command: Vec<String>,
    ) -> Self {
        Self {
            interface,
            peer_port,
            up_command,
            down_command,
        }
    }

    fn render(&self, template: &[String]) -> Vec<String> {
        render_template(template, &self.interface)
    }

    /// Variables describing every hop of `selection`, entry first.
    fn selection_env(&self, selection: &Selection) -> Vec<(String, String)> {
        ["ENTRY", "EXIT"]
            .into_iter()
            .zip(selection.hops())
            .flat_map(|(prefix, relay)| hop_env(prefix, relay, self.peer_port))
            .collect()
    }
}

/// Substitute `{interface}` in every argument.
pub(crate) fn render_template(template: &[String], interface: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{interface}", interface))
        .collect()
}

fn hop_env(prefix: &str, relay: &RelayDescriptor, peer_port: u16) -> [(String, String); 5] {
    [
        (format!("RELAY_{prefix}_HOSTNAME"), relay.hostname.clone()),
        (format!("RELAY_{prefix}_ENDPOINT"), relay.endpoint.to_string()),
        (
            format!("RELAY_{prefix}_PEER"),
            SocketAddr::new(relay.endpoint.into(), peer_port).to_string(),
        ),
        (format!("RELAY_{prefix}_PUBKEY"), relay.public_key.clone()),
        (format!("RELAY_{prefix}_COUNTRY"), relay.country.clone()),
    ]
}

#[async_trait]
impl TunnelDriver for CommandTunnelDriver {
    async fn up(&self, selection: &Selection) -> Result<(), TunnelError> {
        let env = self.selection_env(selection);

        tracing::info!(interface = %self.interface, relay = %selection.describe(), "Bringing tunnel up");
        run_command(&self.render(&self.up_command), &env).await
    }

    async fn down(&self) -> Result<(), TunnelError> {
        tracing::info!(interface = %self.interface, "Bringing tunnel down");
        run_command(&self.render(&self.down_command), &[]).await
    }
}

/// Run `argv` to completion. A non-zero exit is an error carrying the exit
/// code and the child's combined output.
pub(crate) async fn run_command(
    argv: &[String],
    env: &[(String, String)],
) -> Result<(), TunnelError> {
    let command = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Err(TunnelError::Spawn {
            command,
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    let output = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| TunnelError::Spawn {
            command: command.clone(),
            source,
        })?;

    if output.status.success() {
        tracing::debug!(command = %command, "Command succeeded");
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Err(TunnelError::CommandFailed {
        command,
        code: output.status.code(),
        output: combined.trim().to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::fixtures::relay;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_render_substitutes_interface_everywhere() {
        let rendered = render_template(&argv(&["wg-quick", "up", "{interface}"]), "wg7");
        assert_eq!(rendered, argv(&["wg-quick", "up", "wg7"]));
    }

    #[tokio::test]
    async fn test_up_exports_hops_to_the_command() {
        let out = std::env::temp_dir().join(format!("relay-guard-up-{}", uuid::Uuid::new_v4()));
        let out_str = out.to_string_lossy().into_owned();

        // The interface name doubles as the output path for this test.
        let driver = CommandTunnelDriver::new(
            out_str.clone(),
            51820,
            argv(&[
                "sh",
                "-c",
                "printf '%s %s %s' \"$RELAY_ENTRY_HOSTNAME\" \"$RELAY_ENTRY_ENDPOINT\" \"$RELAY_EXIT_HOSTNAME\" > \"$0\"",
                "{interface}",
            ]),
            argv(&["true"]),
        );
        let selection = Selection {
            entry: relay("se-got-wg-001", 1, "Sweden"),
            exit: Some(relay("de-fra-wg-002", 2, "Germany")),
        };

        driver.up(&selection).await.unwrap();
        driver.down().await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let _ = std::fs::remove_file(&out);
        assert_eq!(written, "se-got-wg-001 10.0.0.1 de-fra-wg-002");
    }

    #[tokio::test]
    async fn test_default_up_command_points_the_peer_at_the_selected_relay() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-ins for wg-quick and wg that log their arguments.
        let bin = std::env::temp_dir().join(format!("relay-guard-bin-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&bin).unwrap();
        let log = bin.join("log");
        for tool in ["wg-quick", "wg"] {
            let path = bin.join(tool);
            std::fs::write(
                &path,
                format!("#!/bin/sh\necho \"{tool} $*\" >> \"{}\"\n", log.display()),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let tunnel = crate::config::TunnelConfig::default();
        let driver = CommandTunnelDriver::new(
            tunnel.interface_name.clone(),
            tunnel.peer_port,
            tunnel.up_command.clone(),
            tunnel.down_command.clone(),
        );
        let selection = Selection {
            entry: relay("se-sto-wg-002", 2, "Sweden"),
            exit: None,
        };

        let mut env = driver.selection_env(&selection);
        let path = std::env::var("PATH").unwrap_or_default();
        env.push(("PATH".to_string(), format!("{}:{path}", bin.display())));
        run_command(&driver.render(&tunnel.up_command), &env)
            .await
            .unwrap();

        let logged = std::fs::read_to_string(&log).unwrap();
        let _ = std::fs::remove_dir_all(&bin);
        assert_eq!(
            logged,
            "wg-quick up wg0\n\
             wg set wg0 peer se-sto-wg-002-pubkey endpoint 10.0.0.2:51820 allowed-ips 0.0.0.0/0,::/0\n"
        );
    }

    #[tokio::test]
    async fn test_failing_command_reports_code_and_output() {
        let err = run_command(&argv(&["sh", "-c", "echo boom >&2; exit 3"]), &[])
            .await
            .unwrap_err();
        match err {
            TunnelError::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output, "boom");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let err = run_command(&argv(&["relay-guard-no-such-binary"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));

        let err = run_command(&[], &[]).await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));
    }
}
