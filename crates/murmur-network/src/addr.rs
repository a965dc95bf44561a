//! Full-address formatting and parsing.
//!
//! A full address is the human-shareable form
//! `<network-path>/p2p/<peer-id>`, e.g.
//! `/ip4/192.168.1.10/tcp/9999/p2p/12D3KooW...`.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use murmur_types::{MurmurError, Result};

/// Formats a listen address and peer id into a full address string.
pub fn full_addr(addr: &Multiaddr, peer_id: &PeerId) -> String {
    format!("{addr}/p2p/{peer_id}")
}

/// Parses a full address into its network path and peer id.
///
/// # Errors
///
/// Returns [`MurmurError::InvalidAddress`] if the string is not a
/// multiaddress or lacks a trailing `/p2p/<peer-id>` component.
pub fn parse_full_addr(s: &str) -> Result<(Multiaddr, PeerId)> {
    let mut addr: Multiaddr = s.parse().map_err(|e| MurmurError::InvalidAddress {
        reason: format!("'{s}' is not a multiaddress: {e}"),
    })?;

    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((addr, peer_id)),
        _ => Err(MurmurError::InvalidAddress {
            reason: format!("'{s}' has no /p2p/<peer-id> component"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
