//! The public transport node API.
//!
//! [`TransportNode`] builds the swarm, spawns its event loop, and
//! exposes handle-based access: dialing, the connection registry,
//! per-protocol stream handling, and gossip pub/sub. All methods take
//! `&self`; the node is designed to live in an `Arc` shared by the
//! protocol engines.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, Stream, StreamProtocol};
use tokio::sync::{mpsc, oneshot, watch};

use murmur_types::{MurmurError, Result};

use crate::addr;
use crate::config::NetworkConfig;
use crate::events::NetworkEvent;
use crate::pubsub::Topic;
use crate::swarm::{build_behaviour, run_swarm, SwarmCommand, SwarmContext};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Command channel capacity — callers await backpressure if the swarm
/// loop is overloaded.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Seconds before an outbound dial attempt is reported unreachable.
const DIAL_TIMEOUT_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// TransportNode
// ---------------------------------------------------------------------------

/// Handle to the running transport layer.
pub struct TransportNode {
    local_peer_id: PeerId,
    control: libp2p_stream::Control,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    registry: Arc<RwLock<HashMap<PeerId, Multiaddr>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransportNode {
    /// Builds the swarm, starts listening, and spawns the event loop.
    ///
    /// If the configured port is already bound the node falls back to
    /// an OS-assigned port and logs the substitution.
    ///
    /// Returns the node handle and the receiver for [`NetworkEvent`]s.
    pub async fn spawn(
        config: NetworkConfig,
        keypair: identity::Keypair,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>)> {
        config.validate()?;

        let local_peer_id = PeerId::from(keypair.public());
        let port = probe_port(config.listen_port);

        let behaviour_config = config.clone();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| MurmurError::Network {
                reason: format!("failed to configure TCP transport: {e}"),
            })?
            .with_behaviour(|key| build_behaviour(key, &behaviour_config))
            .map_err(|e| MurmurError::Network {
                reason: format!("failed to build network behaviour: {e}"),
            })?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(config.idle_timeout_secs))
            })
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}")
            .parse()
            .map_err(|e| MurmurError::Network {
                reason: format!("failed to build listen address: {e}"),
            })?;

        swarm
            .listen_on(listen_addr)
            .map_err(|e| MurmurError::Network {
                reason: format!("failed to start listening: {e}"),
            })?;

        let control = swarm.behaviour().stream.new_control();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(run_swarm(SwarmContext {
            swarm,
            cmd_rx,
            event_tx,
            registry: Arc::clone(&registry),
            shutdown_rx: shutdown_rx.clone(),
        }));

        Ok((
            Self {
                local_peer_id,
                control,
                cmd_tx,
                registry,
                shutdown_tx,
                shutdown_rx,
            },
            event_rx,
        ))
    }

    /// The local peer id. Stable for the process lifetime.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Human-shareable addresses in `<path>/p2p/<peer-id>` form.
    pub async fn advertised_addresses(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::ListenAddrs { reply })
            .await
            .map_err(|_| transport_stopped())?;
        let addrs = rx.await.map_err(|_| transport_stopped())?;
        Ok(addrs
            .iter()
            .map(|a| addr::full_addr(a, &self.local_peer_id))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Dialing and connections
    // -----------------------------------------------------------------------

    /// Dials a peer by full address string.
    ///
    /// Resolves once an authenticated connection is open. Fails with
    /// `InvalidAddress` on a malformed address and `Unreachable` when
    /// the dial fails or times out.
    pub async fn dial(&self, address: &str) -> Result<PeerId> {
        let (_, peer_id) = addr::parse_full_addr(address)?;

        if peer_id == self.local_peer_id {
            return Err(MurmurError::InvalidAddress {
                reason: "cannot dial the local node".into(),
            });
        }

        // Keep the /p2p/ suffix so the transport authenticates the
        // remote key against the dialed peer id.
        let full: Multiaddr = address.parse().map_err(|e| MurmurError::InvalidAddress {
            reason: format!("'{address}' is not a multiaddress: {e}"),
        })?;

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Dial { addr: full, peer_id, reply })
            .await
            .map_err(|_| transport_stopped())?;

        match tokio::time::timeout(Duration::from_secs(DIAL_TIMEOUT_SECS), rx).await {
            Ok(Ok(result)) => result.map(|()| peer_id),
            Ok(Err(_)) => Err(transport_stopped()),
            Err(_) => Err(MurmurError::Unreachable {
                reason: format!("dial to {peer_id} timed out"),
            }),
        }
    }

    /// Whether an open connection to `peer_id` exists.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.registry
            .read()
            .map(|r| r.contains_key(peer_id))
            .unwrap_or(false)
    }

    /// Snapshot of connected peers and their remote addresses.
    pub fn connected_peers(&self) -> Vec<(PeerId, Multiaddr)> {
        self.registry
            .read()
            .map(|r| r.iter().map(|(p, a)| (*p, a.clone())).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Opens a bidirectional stream to `peer_id` negotiated for
    /// `protocol`.
    ///
    /// Fails with `NotConnected` when no connection is open and
    /// `ProtocolUnsupported` when the remote rejects the protocol.
    pub async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Stream> {
        if !self.is_connected(&peer_id) {
            return Err(MurmurError::NotConnected { peer: peer_id.to_string() });
        }

        let mut control = self.control.clone();
        control
            .open_stream(peer_id, protocol)
            .await
            .map_err(|e| match e {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(p) => {
                    MurmurError::ProtocolUnsupported { protocol: p.to_string() }
                }
                other => MurmurError::Unreachable { reason: other.to_string() },
            })
    }

    /// Registers `handler` for inbound streams on `protocol`.
    ///
    /// The handler runs on its own task per stream and is responsible
    /// for reading, responding, and closing. The accept loop exits on
    /// node shutdown.
    pub fn register_stream_handler<F, Fut>(
        &self,
        protocol: StreamProtocol,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(PeerId, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut control = self.control.clone();
        let mut incoming = control.accept(protocol.clone()).map_err(|e| {
            MurmurError::Network {
                reason: format!("handler for {protocol} already registered: {e}"),
            }
        })?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = incoming.next() => match next {
                        Some((peer, stream)) => {
                            tokio::spawn(handler(peer, stream));
                        }
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(%protocol, "stream accept loop exited");
        });

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------

    /// Joins a gossip topic and returns its handle. Idempotent.
    pub async fn join(&self, topic_name: &str) -> Result<Topic> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::JoinTopic { topic: topic_name.to_string(), reply })
            .await
            .map_err(|_| transport_stopped())?;
        rx.await.map_err(|_| transport_stopped())??;
        Ok(Topic::new(topic_name.to_string(), self.cmd_tx.clone()))
    }

    /// Unsubscribes from a topic and closes all its local
    /// subscriptions.
    pub async fn leave_topic(&self, topic_name: &str) -> Result<()> {
        self.cmd_tx
            .send(SwarmCommand::LeaveTopic { topic: topic_name.to_string() })
            .await
            .map_err(|_| transport_stopped())
    }

    // -----------------------------------------------------------------------
    // DHT directory (stub)
    // -----------------------------------------------------------------------

    /// Registers the local username for peer discovery.
    ///
    /// Peers exchange user identity over the protocol streams; a
    /// signed DHT record scheme would replace this.
    pub fn publish_user(&self, username: &str) {
        tracing::info!(%username, "registered user for peer discovery");
    }

    /// Looks up a user's peer id in the DHT. Documented stub.
    pub fn find_user(&self, _username: &str) -> Result<PeerId> {
        Err(MurmurError::NotImplemented {
            reason: "DHT user lookup is not available; use the local user search".into(),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Signals the swarm loop and all accept loops to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Probes the requested TCP port, falling back to an OS-assigned port
/// (`0`) when it is already bound.
fn probe_port(port: u16) -> u16 {
    if port == 0 {
        return 0;
    }
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            port
        }
        Err(_) => {
            tracing::warn!(port, "port already in use, selecting an available port");
            0
        }
    }
}

fn transport_stopped() -> MurmurError {
    MurmurError::Network { reason: "transport node stopped".into() }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_free_port_is_kept() {
        // Bind an ephemeral port, release it, then probe it — it
        // should still be free immediately after.
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert_eq!(probe_port(port), port);
    }

    #[test]
    fn probe_bound_port_falls_back() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        // Still bound — the probe must yield the ephemeral fallback.
        assert_eq!(probe_port(port), 0);
    }

    #[test]
    fn probe_zero_is_passthrough() {
        assert_eq!(probe_port(0), 0);
    }
}
