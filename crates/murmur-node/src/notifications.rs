//! User-visible events.
//!
//! Engines never print; every "notify the user" moment becomes a
//! [`Notification`] sent over the node's channel and rendered by the
//! shell.

use tokio::sync::mpsc;

/// Bounded notification channel capacity.
///
/// Large enough to absorb bursts of inbound traffic; a stalled shell
/// backpressures the emitting task instead of growing an unbounded
/// queue.
const NOTIFY_CHANNEL_SIZE: usize = 1024;

/// A user-visible event emitted by the engines or the node wiring.
#[derive(Clone, Debug)]
pub enum Notification {
    /// An inbound friend request.
    FriendRequest {
        from_username: String,
        from_full_name: String,
        message: String,
        /// True when no session was active — the request was not
        /// recorded and will arrive again.
        needs_login: bool,
    },

    /// A friend request arrived that already exists locally.
    DuplicateFriendRequest { from_username: String },

    /// A friend request we sent was accepted.
    FriendAccepted { username: String, full_name: String },

    /// A friend request we sent was declined.
    FriendRejected { username: String, full_name: String },

    /// An inbound direct message.
    DirectMessage {
        from_username: String,
        from_full_name: String,
        content: String,
    },

    /// An outbound message was stored for later delivery.
    MessageQueued { to_username: String },

    /// An invitation to join a conference.
    ConferenceInvite {
        conference_id: i64,
        conference_name: String,
        from_username: String,
        from_full_name: String,
        message: String,
    },

    /// A message arrived on a subscribed conference.
    ConferenceMessage {
        conference_id: i64,
        from_full_name: String,
        content: String,
    },

    /// A peer connected to this node.
    PeerConnected { peer_id: String },

    /// A peer disconnected from this node.
    PeerDisconnected { peer_id: String },
}

/// Sender half of the notification channel.
pub type NotificationSender = mpsc::Sender<Notification>;

/// Receiver half of the notification channel.
pub type NotificationReceiver = mpsc::Receiver<Notification>;

/// Creates the bounded notification channel.
pub fn channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::channel(NOTIFY_CHANNEL_SIZE)
}
