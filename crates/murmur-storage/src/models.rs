//! Persistent entities of the Murmur store.
//!
//! Primary keys are monotonically increasing integers assigned on
//! insert (`id == 0` means "not yet persisted"). Nullable timestamps
//! are `Option<DateTime<Utc>>` — a missing value is never coerced to
//! the zero instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel password hash marking a user row that represents a remote
/// peer not registered on this node. Such rows cannot log in and are
/// upgraded in place once the peer identifies itself.
pub const REMOTE_PLACEHOLDER: &str = "REMOTE_PLACEHOLDER";

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user account — either a local registration or a placeholder for a
/// remote peer encountered via the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Argon2 hash for local accounts, [`REMOTE_PLACEHOLDER`] for
    /// remote placeholder rows. Never serialized.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub full_name: String,
    pub peer_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Returns `true` if this row is a remote placeholder and may not
    /// be used for local login.
    pub fn is_placeholder(&self) -> bool {
        self.password_hash == REMOTE_PLACEHOLDER
    }
}

// ---------------------------------------------------------------------------
// Friendship
// ---------------------------------------------------------------------------

/// Status of a directed friendship edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FriendStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// Parses the stored column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for FriendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge in the social graph.
///
/// An accepted friendship between A and B is two rows — (A→B) and
/// (B→A), both `Accepted`. A pending request is a single row owned by
/// the requester. Unique on `(owner_user_id, other_user_id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Friendship {
    pub id: i64,
    pub owner_user_id: i64,
    pub other_user_id: i64,
    /// Peer id of the remote party, cached for dialing.
    pub other_peer_id: String,
    /// Username of the remote party at row creation.
    pub cached_username: String,
    /// Full name of the remote party at row creation.
    pub cached_full_name: String,
    pub status: FriendStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// DirectMessage
// ---------------------------------------------------------------------------

/// A one-to-one message, stored on both sender and receiver.
///
/// Ids are local to each node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: i64,
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub from_peer_id: String,
    pub to_peer_id: String,
    pub content: String,
    pub delivered: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Conference
// ---------------------------------------------------------------------------

/// A named group chat. The id is local — remote nodes carry the
/// originating node's id in protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conference {
    pub id: i64,
    pub name: String,
    pub creator_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in a conference. Inactivity marks "left but
/// history retained".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub conference_id: i64,
    pub user_id: i64,
    pub peer_id: String,
    pub cached_username: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// A message in a conference, persisted on every participant that
/// received it. `from_user_id` is 0 when the sender is not resolvable
/// to a local user row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConferenceMessage {
    pub id: i64,
    pub conference_id: i64,
    pub from_user_id: i64,
    pub from_peer_id: String,
    pub content: String,
    /// The sender's timestamp — trusted for ordering, not for security.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// KnownPeer
// ---------------------------------------------------------------------------

/// A peer this node has connected to before, cached for rediscovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnownPeer {
    pub id: i64,
    pub peer_id: String,
    pub username: String,
    /// Multiaddresses serialized as a JSON array of strings.
    pub addrs: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_detection() {
        let mut user = User {
            id: 1,
            username: "unknown_12D3".into(),
            password_hash: REMOTE_PLACEHOLDER.into(),
            full_name: "Unknown User".into(),
            peer_id: "12D3".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(user.is_placeholder());

        user.password_hash = "$argon2id$...".into();
        assert!(!user.is_placeholder());
    }

    #[test]
    fn friend_status_roundtrip() {
        for status in [FriendStatus::Pending, FriendStatus::Accepted, FriendStatus::Rejected] {
            assert_eq!(FriendStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FriendStatus::parse("blocked"), None);
    }

    #[test]
    fn password_hash_not_serialized() {
        let user = User {
            id: 1,
            username: "alice".into(),
            password_hash: "secret".into(),
            full_name: "Alice".into(),
            peer_id: "12D3".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
    }
}
