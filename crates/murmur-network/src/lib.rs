//! Murmur libp2p transport layer.
//!
//! Owns the node's cryptographic identity, listens on a configured
//! port (with ephemeral fallback on contention), dials peers by
//! `<path>/p2p/<peer-id>` multiaddress, tracks live connections,
//! hosts gossip pub/sub, and dispatches inbound streams to registered
//! protocol handlers.
//!
//! # Architecture
//!
//! - [`identity`] — persistent ed25519 keypair keyed by data dir + port
//! - [`addr`] — full-address formatting and parsing
//! - [`config`] — network configuration with defaults
//! - [`events`] — events delivered to the node wiring
//! - [`pubsub`] — topic and subscription handles
//! - [`swarm`] — behaviour composition and the swarm event loop
//! - [`node`] — the public [`TransportNode`](node::TransportNode) API

pub mod addr;
pub mod config;
pub mod events;
pub mod identity;
pub mod node;
pub mod pubsub;
pub mod swarm;

pub use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};

pub use config::NetworkConfig;
pub use events::NetworkEvent;
pub use node::TransportNode;
pub use pubsub::{GossipMessage, Subscription, Topic};
