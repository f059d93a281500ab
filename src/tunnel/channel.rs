use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ssh::client::RemoteForwardMap;
use crate::ssh::config_file::ForwardConfig;

use super::{ReadyLatch, SharedSession, TunnelKind};

/// Fallback source when more destinations than sources were given: an
/// ephemeral local port.
const EPHEMERAL_SOURCE: &str = "127.0.0.1:0";

/// One forwarding path of a tunnel: a listener on `source`, each accepted
/// connection bridged to `destination`.
///
/// For a LOCAL tunnel this process listens on `source`; for a REMOTE tunnel
/// the jump host does. After `listen_*`, `source` holds the actually-bound
/// address, so a requested port 0 resolves to the real ephemeral port.
#[derive(Debug)]
pub struct Channel {
    pub source: String,
    pub destination: String,
    listener: Option<TcpListener>,
}

impl Channel {
    fn new(source: String, destination: String) -> Self {
        Channel {
            source,
            destination,
            listener: None,
        }
    }

    /// Bind the local listener for a LOCAL channel and rewrite `source`
    /// with the bound address.
    pub async fn listen_local(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.source)
            .await
            .with_context(|| format!("failed to listen on local address {}", self.source))?;

        if let Ok(addr) = listener.local_addr() {
            self.source = addr.to_string();
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Ask the jump host to listen on `source` for a REMOTE channel,
    /// rewrite `source` with the port the server actually bound, and
    /// register the destination so the session handler can bridge incoming
    /// connections.
    pub async fn listen_remote(
        &mut self,
        session: &SharedSession,
        remote_forwards: &RemoteForwardMap,
    ) -> Result<()> {
        let (host, port) = split_host_port(&self.source)
            .with_context(|| format!("invalid remote source address {}", self.source))?;

        let bound_port = {
            let mut handle = session.lock().await;
            handle
                .tcpip_forward(host.as_str(), port)
                .await
                .with_context(|| format!("failed to listen on remote address {}", self.source))?
        };

        // The server echoes back the port it bound; 0 means "as requested".
        let actual_port = if bound_port == 0 { port } else { bound_port };
        self.source = format!("{host}:{actual_port}");

        let mut map = remote_forwards.lock().await;
        map.insert((host, actual_port), self.destination.clone());

        Ok(())
    }

    /// Run the accept loop for a LOCAL channel: announce readiness once,
    /// then bridge every accepted connection through the SSH session to
    /// `destination`. A failed accept is fatal and is published on `done`;
    /// a failed destination dial only drops that one connection.
    pub fn spawn_accept_loop(
        &mut self,
        session: SharedSession,
        latch: ReadyLatch,
        done: tokio::sync::mpsc::Sender<Option<anyhow::Error>>,
    ) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("channel has no listener, listen must run first"))?;
        let destination = self.destination.clone();
        let source = self.source.clone();

        Ok(tokio::spawn(async move {
            latch.arrive();

            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = done
                            .send(Some(anyhow!(
                                "error while establishing new connection on {source}: {e}"
                            )))
                            .await;
                        return;
                    }
                };

                debug!(address = %peer, "new connection");

                let session = session.clone();
                let destination = destination.clone();

                tokio::spawn(async move {
                    let (host, port) = match split_host_port(&destination) {
                        Ok(hp) => hp,
                        Err(e) => {
                            warn!(destination = %destination, error = %e, "bad destination");
                            return;
                        }
                    };

                    let channel = {
                        let handle = session.lock().await;
                        handle
                            .channel_open_direct_tcpip(&host, port, "127.0.0.1", 0)
                            .await
                    };

                    match channel {
                        Ok(channel) => {
                            let mut channel_stream = channel.into_stream();
                            // Either side closing ends the session quietly.
                            let _ = copy_bidirectional(&mut stream, &mut channel_stream).await;
                        }
                        Err(e) => {
                            warn!(destination = %destination, error = %e, "remote dial error");
                        }
                    }
                });
            }
        }))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[source={}, destination={}]", self.source, self.destination)
    }
}

/// Build the channel set for a tunnel from the given source and destination
/// address lists.
///
/// - With more destinations than sources, the missing sources become
///   ephemeral local listeners; order is preserved.
/// - With more sources than destinations, the extra sources are dropped.
/// - With neither list given, the SSH config forwards for the host are
///   used instead.
/// - No destinations at all is an error.
pub fn build_channels(
    kind: TunnelKind,
    sources: &[String],
    destinations: &[String],
    config_forwards: &[ForwardConfig],
) -> Result<Vec<Channel>> {
    if sources.is_empty() && destinations.is_empty() {
        if config_forwards.is_empty() {
            bail!("cannot create a tunnel without at least one destination");
        }

        return config_forwards
            .iter()
            .map(|f| {
                let channel = Channel::new(
                    normalize_source(&f.source),
                    normalize_destination(&f.destination),
                );
                validate(kind, channel)
            })
            .collect();
    }

    if destinations.is_empty() {
        bail!("cannot create a tunnel without at least one destination");
    }

    let mut channels = Vec::with_capacity(destinations.len());

    for (i, destination) in destinations.iter().enumerate() {
        let source = sources.get(i).map(String::as_str).unwrap_or("");
        let channel = Channel::new(normalize_source(source), normalize_destination(destination));
        channels.push(validate(kind, channel)?);
    }

    if sources.len() > destinations.len() {
        debug!(
            dropped = sources.len() - destinations.len(),
            "more sources than destinations, extra sources are ignored"
        );
    }

    Ok(channels)
}

fn validate(kind: TunnelKind, channel: Channel) -> Result<Channel> {
    if channel.source.is_empty() || channel.destination.is_empty() {
        bail!("invalid {kind} tunnel channel {channel}");
    }

    let (_, port) = split_host_port(&channel.destination)
        .with_context(|| format!("invalid {kind} tunnel channel {channel}"))?;
    if port == 0 {
        bail!("missing port in destination address of channel {channel}");
    }

    Ok(channel)
}

/// An absent source listens on an ephemeral local port; a bare `:port`
/// listens on loopback.
fn normalize_source(source: &str) -> String {
    if source.is_empty() {
        return EPHEMERAL_SOURCE.to_string();
    }

    if source.starts_with(':') {
        return format!("127.0.0.1{source}");
    }

    source.to_string()
}

fn normalize_destination(destination: &str) -> String {
    if destination.starts_with(':') {
        return format!("127.0.0.1{destination}");
    }

    destination.to_string()
}

fn split_host_port(address: &str) -> Result<(String, u32)> {
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("address {address} has no port"))?;

    let port: u32 = port
        .parse()
        .with_context(|| format!("address {address} has a malformed port"))?;

    Ok((host.to_string(), port))
}
