//! Events emitted by the transport node.
//!
//! Higher layers (node wiring, shell) subscribe to these to react to
//! network activity without coupling to libp2p internals.

use libp2p::{Multiaddr, PeerId};

/// Events emitted by the Murmur transport layer.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A connection to a remote peer was established.
    PeerConnected {
        /// The connected peer.
        peer_id: PeerId,
        /// The remote endpoint address.
        addr: Multiaddr,
    },

    /// The last connection to a remote peer closed.
    PeerDisconnected {
        /// The disconnected peer.
        peer_id: PeerId,
    },

    /// The node started listening on a new address.
    NewListenAddr {
        /// The bound listen address.
        addr: Multiaddr,
    },
}
