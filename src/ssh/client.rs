use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use russh::Channel;
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Maps a remote listener `(bind address, bound port)` to the destination
/// dialed from this process when the jump host hands us a connection.
pub type RemoteForwardMap = Arc<tokio::sync::Mutex<HashMap<(String, u32), String>>>;

/// SSH protocol event handler for tunnel sessions.
pub struct TunnelHandler {
    host: String,
    port: u16,
    insecure: bool,
    /// Shared with the tunnel supervisor, which registers remote forwards
    /// here after each `tcpip_forward` request.
    pub remote_forwards: RemoteForwardMap,
}

impl TunnelHandler {
    pub fn new(host: &str, port: u16, insecure: bool) -> Self {
        TunnelHandler {
            host: host.to_string(),
            port,
            insecure,
            remote_forwards: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }
}

impl client::Handler for TunnelHandler {
    type Error = anyhow::Error;

    /// Validate the server host key against `~/.ssh/known_hosts`, unless the
    /// insecure flag disables the check.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.insecure {
            debug!("host key validation disabled");
            return Ok(true);
        }

        verify_known_host(&self.host, self.port, server_public_key)
    }

    /// Called when the jump host forwards us a connection accepted on a
    /// remote listener. The destination is dialed from this process and the
    /// two streams are bridged until either side closes.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            origin = %format!("{originator_address}:{originator_port}"),
            "new connection on remote listener"
        );

        let destination = {
            let map = self.remote_forwards.lock().await;
            map.get(&(connected_address.to_string(), connected_port))
                .cloned()
        };

        let Some(destination) = destination else {
            warn!(
                address = connected_address,
                port = connected_port,
                "no forwarding destination registered for remote listener"
            );
            return Ok(());
        };

        tokio::spawn(async move {
            match TcpStream::connect(&destination).await {
                Ok(mut local) => {
                    let mut remote = channel.into_stream();
                    // Either side closing is a normal end of session.
                    let _ = copy_bidirectional(&mut remote, &mut local).await;
                }
                Err(e) => {
                    warn!(destination = %destination, error = %e, "destination dial failed");
                }
            }
        });

        Ok(())
    }
}

fn known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("known_hosts")
}

/// Check a server key against the user's known_hosts file, comparing raw
/// key blobs. Hashed entries are skipped.
fn verify_known_host(host: &str, port: u16, server_key: &PublicKey) -> Result<bool> {
    let path = known_hosts_path();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("error while parsing 'known_hosts' file: {}", path.display()))?;

    let host_pattern = if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    };

    let server_blob = server_key
        .to_bytes()
        .context("could not encode server host key")?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_b64)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if !hosts.split(',').any(|h| h == host_pattern) {
            continue;
        }

        let known_blob = match BASE64.decode(key_b64.as_bytes()) {
            Ok(b) => b,
            Err(_) => continue,
        };

        if known_blob == server_blob {
            return Ok(true);
        }

        bail!(
            "host key for {host_pattern} has changed, refusing to connect (see {})",
            path.display()
        );
    }

    bail!("no known_hosts entry for {host_pattern}, refusing to connect");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_starts_with_empty_forward_map() {
        let handler = TunnelHandler::new("example.com", 22, true);
        assert!(handler.remote_forwards.try_lock().unwrap().is_empty());
    }

    #[test]
    fn test_known_hosts_path_under_home() {
        let p = known_hosts_path();
        assert!(p.ends_with(".ssh/known_hosts"));
    }
}
