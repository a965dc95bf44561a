//! Behaviour composition and the swarm event loop.
//!
//! The loop owns the libp2p `Swarm` exclusively. Everything else in
//! the process talks to it through [`SwarmCommand`]s; connection state
//! is mirrored into a shared registry that engines may read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, kad, mdns, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot, watch};

use murmur_types::MurmurError;

use crate::config::NetworkConfig;
use crate::events::NetworkEvent;
use crate::pubsub::GossipMessage;

/// Alias so the `#[derive(NetworkBehaviour)]` macro never sees a
/// shadowed `Result`.
type NResult<T> = std::result::Result<T, MurmurError>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum allowed gossip payload size (64 KiB).
pub const MAX_GOSSIP_SIZE: usize = 65_536;

/// Identify protocol version string.
const IDENTIFY_PROTOCOL: &str = "/murmur/id/1";

// ---------------------------------------------------------------------------
// Combined behaviour
// ---------------------------------------------------------------------------

/// Combined libp2p behaviour for Murmur.
///
/// Composes:
/// - `gossipsub::Behaviour` — conference pub/sub.
/// - `kad::Behaviour` — DHT routing (user lookup is a documented stub).
/// - `identify::Behaviour` — peer metadata exchange, feeds Kademlia.
/// - `Toggle<mdns>` — optional local-network discovery with auto-dial.
/// - `libp2p_stream::Behaviour` — per-protocol bidirectional streams.
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub stream: libp2p_stream::Behaviour,
}

/// Builds the combined behaviour for the given identity and config.
pub(crate) fn build_behaviour(
    key: &libp2p::identity::Keypair,
    config: &NetworkConfig,
) -> std::result::Result<Behaviour, Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = PeerId::from(key.public());

    let gossip_config = gossipsub::ConfigBuilder::default()
        .max_transmit_size(MAX_GOSSIP_SIZE)
        .build()
        .map_err(|e| format!("failed to build gossipsub config: {e}"))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossip_config,
    )
    .map_err(|e| format!("failed to create gossipsub behaviour: {e}"))?;

    let store = kad::store::MemoryStore::new(local_peer_id);
    let mut kademlia = kad::Behaviour::new(local_peer_id, store);
    kademlia.set_mode(Some(kad::Mode::Server));

    let identify = identify::Behaviour::new(
        identify::Config::new(IDENTIFY_PROTOCOL.into(), key.public())
            .with_agent_version(format!("murmur/{}", env!("CARGO_PKG_VERSION"))),
    );

    let mdns = if config.enable_mdns {
        Some(mdns::tokio::Behaviour::new(
            mdns::Config::default(),
            local_peer_id,
        )?)
    } else {
        None
    };

    Ok(Behaviour {
        gossipsub,
        kademlia,
        identify,
        mdns: Toggle::from(mdns),
        stream: libp2p_stream::Behaviour::new(),
    })
}

// ---------------------------------------------------------------------------
// SwarmCommand
// ---------------------------------------------------------------------------

/// Requests handled by the swarm event loop.
#[derive(Debug)]
pub(crate) enum SwarmCommand {
    /// Dial a peer at a fully-qualified address. The reply resolves
    /// once the connection is established or the dial fails.
    Dial {
        addr: Multiaddr,
        peer_id: PeerId,
        reply: oneshot::Sender<NResult<()>>,
    },
    /// Current listen addresses.
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Subscribe the gossipsub behaviour to a topic (idempotent).
    JoinTopic {
        topic: String,
        reply: oneshot::Sender<NResult<()>>,
    },
    /// Publish a payload; local subscriptions receive a self-echo.
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<NResult<()>>,
    },
    /// Open a local delivery channel for a joined topic.
    Subscribe {
        topic: String,
        reply: oneshot::Sender<NResult<mpsc::UnboundedReceiver<GossipMessage>>>,
    },
    /// Unsubscribe and drop all local delivery channels for a topic.
    LeaveTopic { topic: String },
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// State moved into the swarm task.
pub(crate) struct SwarmContext {
    pub swarm: Swarm<Behaviour>,
    pub cmd_rx: mpsc::Receiver<SwarmCommand>,
    pub event_tx: mpsc::UnboundedSender<NetworkEvent>,
    pub registry: Arc<RwLock<HashMap<PeerId, Multiaddr>>>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Runs the swarm event loop until the shutdown signal fires or the
/// command channel closes.
pub(crate) async fn run_swarm(mut ctx: SwarmContext) {
    use futures::StreamExt;

    let local_peer_id = *ctx.swarm.local_peer_id();
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<NResult<()>>>> = HashMap::new();
    let mut topics: HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>> = HashMap::new();

    loop {
        tokio::select! {
            event = ctx.swarm.select_next_some() => {
                handle_swarm_event(
                    &mut ctx,
                    event,
                    &mut pending_dials,
                    &mut topics,
                );
            }

            cmd = ctx.cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(
                        &mut ctx.swarm,
                        cmd,
                        local_peer_id,
                        &ctx.registry,
                        &mut pending_dials,
                        &mut topics,
                    ),
                    // All TransportNode handles dropped.
                    None => break,
                }
            }

            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    tracing::info!("transport shutdown signal received");
                    break;
                }
            }
        }
    }

    // Closing the delivery channels wakes any subscription tasks.
    topics.clear();
    tracing::info!("swarm event loop exited");
}

fn handle_swarm_event(
    ctx: &mut SwarmContext,
    event: SwarmEvent<BehaviourEvent>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<NResult<()>>>>,
    topics: &mut HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(%address, "listening");
            let _ = ctx.event_tx.send(NetworkEvent::NewListenAddr { addr: address });
        }

        SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
            let addr = endpoint.get_remote_address().clone();
            tracing::info!(%peer_id, %addr, num_established, "peer connected");

            if let Ok(mut registry) = ctx.registry.write() {
                registry.insert(peer_id, addr.clone());
            }

            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for reply in waiters {
                    let _ = reply.send(Ok(()));
                }
            }

            let _ = ctx.event_tx.send(NetworkEvent::PeerConnected { peer_id, addr });
        }

        SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
            tracing::info!(%peer_id, num_established, ?cause, "connection closed");
            if num_established == 0 {
                if let Ok(mut registry) = ctx.registry.write() {
                    registry.remove(&peer_id);
                }
                let _ = ctx.event_tx.send(NetworkEvent::PeerDisconnected { peer_id });
            }
        }

        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            tracing::warn!(?peer_id, %error, "outgoing connection error");
            if let Some(peer_id) = peer_id {
                if let Some(waiters) = pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Err(MurmurError::Unreachable {
                            reason: error.to_string(),
                        }));
                    }
                }
            }
        }

        SwarmEvent::IncomingConnectionError { local_addr, send_back_addr, error, .. } => {
            tracing::warn!(%local_addr, %send_back_addr, %error, "incoming connection error");
        }

        SwarmEvent::Behaviour(event) => {
            handle_behaviour_event(&mut ctx.swarm, event, topics);
        }

        other => {
            tracing::trace!(?other, "unhandled swarm event");
        }
    }
}

fn handle_behaviour_event(
    swarm: &mut Swarm<Behaviour>,
    event: BehaviourEvent,
    topics: &mut HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>,
) {
    match event {
        BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        }) => {
            let topic = message.topic.to_string();
            deliver_to_topic(topics, &topic, propagation_source, message.data);
        }
        BehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
            tracing::debug!(%peer_id, %topic, "peer subscribed to topic");
        }
        BehaviourEvent::Gossipsub(other) => {
            tracing::trace!(?other, "gossipsub event");
        }

        BehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
            for (peer_id, addr) in peers {
                tracing::info!(%peer_id, %addr, "mDNS discovered peer, dialing");
                if let Err(e) = swarm.dial(addr) {
                    tracing::debug!(%peer_id, %e, "mDNS auto-dial failed");
                }
            }
        }
        BehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
            for (peer_id, _) in peers {
                tracing::debug!(%peer_id, "mDNS record expired");
            }
        }

        BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
            tracing::debug!(
                %peer_id,
                agent = %info.agent_version,
                "identify: received peer info"
            );
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
        BehaviourEvent::Identify(other) => {
            tracing::trace!(?other, "identify event");
        }

        BehaviourEvent::Kademlia(event) => {
            tracing::trace!(?event, "kademlia event");
        }

        // The stream behaviour surfaces no events; streams arrive via
        // its Control / IncomingStreams handles.
        _ => {}
    }
}

fn handle_command(
    swarm: &mut Swarm<Behaviour>,
    cmd: SwarmCommand,
    local_peer_id: PeerId,
    registry: &Arc<RwLock<HashMap<PeerId, Multiaddr>>>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<NResult<()>>>>,
    topics: &mut HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>,
) {
    match cmd {
        SwarmCommand::Dial { addr, peer_id, reply } => {
            let already = registry
                .read()
                .map(|r| r.contains_key(&peer_id))
                .unwrap_or(false);
            if already {
                let _ = reply.send(Ok(()));
                return;
            }

            match swarm.dial(addr) {
                Ok(()) => {
                    pending_dials.entry(peer_id).or_default().push(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(MurmurError::Unreachable {
                        reason: format!("dial failed: {e}"),
                    }));
                }
            }
        }

        SwarmCommand::ListenAddrs { reply } => {
            let _ = reply.send(swarm.listeners().cloned().collect());
        }

        SwarmCommand::JoinTopic { topic, reply } => {
            let ident = gossipsub::IdentTopic::new(topic.clone());
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&ident)
                .map(|_| ())
                .map_err(|e| MurmurError::Network {
                    reason: format!("failed to join topic '{topic}': {e}"),
                });
            if result.is_ok() {
                topics.entry(topic).or_default();
            }
            let _ = reply.send(result);
        }

        SwarmCommand::Publish { topic, data, reply } => {
            if data.len() > MAX_GOSSIP_SIZE {
                let _ = reply.send(Err(MurmurError::Network {
                    reason: format!(
                        "gossip payload size {} exceeds maximum {MAX_GOSSIP_SIZE}",
                        data.len()
                    ),
                }));
                return;
            }

            let ident = gossipsub::IdentTopic::new(topic.clone());
            match swarm.behaviour_mut().gossipsub.publish(ident, data.clone()) {
                Ok(_) => {}
                // A lone participant has no mesh peers yet; the message
                // still reaches local subscriptions below.
                Err(gossipsub::PublishError::InsufficientPeers) => {
                    tracing::debug!(%topic, "publish with no mesh peers");
                }
                Err(e) => {
                    let _ = reply.send(Err(MurmurError::Network {
                        reason: format!("failed to publish to '{topic}': {e}"),
                    }));
                    return;
                }
            }

            // Self-echo: deliver the payload to local subscriptions
            // with received_from = the local peer id.
            deliver_to_topic(topics, &topic, local_peer_id, data);
            let _ = reply.send(Ok(()));
        }

        SwarmCommand::Subscribe { topic, reply } => {
            match topics.get_mut(&topic) {
                Some(senders) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders.push(tx);
                    let _ = reply.send(Ok(rx));
                }
                None => {
                    let _ = reply.send(Err(MurmurError::Network {
                        reason: format!("topic '{topic}' has not been joined"),
                    }));
                }
            }
        }

        SwarmCommand::LeaveTopic { topic } => {
            let ident = gossipsub::IdentTopic::new(topic.clone());
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&ident);
            // Dropping the senders closes every local subscription.
            topics.remove(&topic);
            tracing::debug!(%topic, "left topic");
        }
    }
}

/// Fans a message out to all local subscriptions of a topic, pruning
/// closed channels.
fn deliver_to_topic(
    topics: &mut HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>,
    topic: &str,
    received_from: PeerId,
    data: Vec<u8>,
) {
    let Some(senders) = topics.get_mut(topic) else {
        tracing::trace!(%topic, "gossip message for unjoined topic");
        return;
    };

    senders.retain(|tx| {
        tx.send(GossipMessage {
            received_from,
            topic: topic.to_string(),
            data: data.clone(),
        })
        .is_ok()
    });
}
