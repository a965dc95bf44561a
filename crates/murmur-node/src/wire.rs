//! Protocol identifiers and the stream wire codec.
//!
//! Every stream protocol carries exactly one JSON object terminated by
//! a newline, then the stream is closed. There is no framing beyond
//! the line delimiter.

use futures::{AsyncReadExt, AsyncWriteExt};
use murmur_network::{Stream, StreamProtocol};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use murmur_types::{MurmurError, Result};

// ---------------------------------------------------------------------------
// Protocol identifiers
// ---------------------------------------------------------------------------

pub const FRIEND_REQUEST: StreamProtocol = StreamProtocol::new("/friend/request/1");
pub const FRIEND_ACCEPT: StreamProtocol = StreamProtocol::new("/friend/accept/1");
pub const FRIEND_REJECT: StreamProtocol = StreamProtocol::new("/friend/reject/1");
pub const MESSAGE_DIRECT: StreamProtocol = StreamProtocol::new("/message/direct/1");
pub const MESSAGE_ACK: StreamProtocol = StreamProtocol::new("/message/ack/1");
pub const MESSAGE_READ: StreamProtocol = StreamProtocol::new("/message/read/1");
pub const CONFERENCE_INVITE: StreamProtocol = StreamProtocol::new("/conference/invite/1");

/// Topic string for a conference's gossip channel.
///
/// The id is the *originating* node's conference id — invitees must
/// use the id carried in the invite, never one they compute locally.
pub fn conference_topic(conference_id: i64) -> String {
    format!("/conf/{conference_id}")
}

/// Cap on a single wire message, matching the gossip payload cap.
pub const MAX_WIRE_SIZE: usize = 65_536;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// `friend/request/1` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FriendRequestMsg {
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    #[serde(default)]
    pub message: String,
}

/// `friend/accept/1` and `friend/reject/1` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FriendResponseMsg {
    pub accepted: bool,
    pub username: String,
    pub full_name: String,
    pub peer_id: String,
    #[serde(default)]
    pub message: String,
}

/// `message/direct/1` payload. `message_id` is the sender's local row
/// id, echoed back in the delivery acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectMessageMsg {
    pub message_id: i64,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub to_username: String,
    pub content: String,
    /// Sender's unix timestamp.
    pub timestamp: i64,
}

/// `message/ack/1` and `message/read/1` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageReceiptMsg {
    pub message_id: i64,
    pub from_peer: String,
    pub to_peer: String,
    pub timestamp: i64,
}

/// `conference/invite/1` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConferenceInviteMsg {
    pub conference_id: i64,
    pub conference_name: String,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    #[serde(default)]
    pub message: String,
}

/// Gossip payload published on a conference topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConferenceGossipMsg {
    pub conference_id: i64,
    pub from_username: String,
    pub from_full_name: String,
    pub from_peer_id: String,
    pub content: String,
    /// Sender's unix timestamp, trusted for ordering only.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Writes one JSON object plus newline, then closes the stream.
pub async fn send_json<T: Serialize>(mut stream: Stream, msg: &T) -> Result<()> {
    let mut data = serde_json::to_vec(msg).map_err(|e| MurmurError::Network {
        reason: format!("failed to encode wire message: {e}"),
    })?;
    data.push(b'\n');

    stream.write_all(&data).await.map_err(|e| MurmurError::Unreachable {
        reason: format!("failed to write wire message: {e}"),
    })?;
    stream.close().await.map_err(|e| MurmurError::Unreachable {
        reason: format!("failed to close stream: {e}"),
    })?;
    Ok(())
}

/// Reads one newline-terminated JSON object from the stream.
///
/// EOF before the newline is tolerated (the payload is whatever was
/// received); payloads above [`MAX_WIRE_SIZE`] are rejected.
pub async fn read_json<T: DeserializeOwned>(stream: &mut Stream) -> Result<T> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| MurmurError::Decode {
            reason: format!("failed to read wire message: {e}"),
        })?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_WIRE_SIZE {
            return Err(MurmurError::Decode {
                reason: format!("wire message exceeds {MAX_WIRE_SIZE} bytes"),
            });
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let line = match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => &buf[..pos],
        None => &buf[..],
    };

    serde_json::from_slice(line).map_err(|e| MurmurError::Decode {
        reason: format!("failed to decode wire message: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
