//! Topic and subscription handles for gossip pub/sub.
//!
//! A [`Topic`] is obtained from
//! [`TransportNode::join`](crate::node::TransportNode::join); it can
//! publish payloads and open [`Subscription`]s. Deliveries include
//! messages this node itself published — subscribers suppress
//! self-echoes by comparing [`GossipMessage::received_from`] against
//! the local peer id.

use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};

use murmur_types::{MurmurError, Result};

use crate::swarm::SwarmCommand;

// ---------------------------------------------------------------------------
// GossipMessage
// ---------------------------------------------------------------------------

/// A single message delivered to a subscription.
#[derive(Clone, Debug)]
pub struct GossipMessage {
    /// The peer this message arrived from. Equal to the local peer id
    /// for self-published messages.
    pub received_from: PeerId,
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Handle to a joined gossip topic.
#[derive(Clone, Debug)]
pub struct Topic {
    name: String,
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl Topic {
    pub(crate) fn new(name: String, cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { name, cmd_tx }
    }

    /// The topic string.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes a payload to the topic.
    ///
    /// Publishing with no remote subscribers is not an error — the
    /// payload is still echoed to local subscriptions.
    pub async fn publish(&self, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Publish { topic: self.name.clone(), data, reply })
            .await
            .map_err(|_| transport_stopped())?;
        rx.await.map_err(|_| transport_stopped())?
    }

    /// Opens a subscription on this topic.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Subscribe { topic: self.name.clone(), reply })
            .await
            .map_err(|_| transport_stopped())?;
        let receiver = rx.await.map_err(|_| transport_stopped())??;
        Ok(Subscription { rx: receiver })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A stream of messages delivered to this node for one topic.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<GossipMessage>,
}

impl Subscription {
    /// Yields the next delivered message, or `None` once the topic has
    /// been left or the transport stopped.
    pub async fn next(&mut self) -> Option<GossipMessage> {
        self.rx.recv().await
    }
}

fn transport_stopped() -> MurmurError {
    MurmurError::Network { reason: "transport node stopped".into() }
}
