//! Relational persistence for the Murmur node.
//!
//! The [`Store`] trait is the capability bundle every engine works
//! against; [`SqliteStore`] is the default file-backed implementation
//! and doubles as the in-memory test variant via
//! [`SqliteStore::open_in_memory`].
//!
//! All mutation goes through this interface, which serializes writes
//! internally — engines never share any other state.

pub mod models;
pub mod sqlite;

pub use models::{
    Conference, ConferenceMessage, DirectMessage, FriendStatus, Friendship, KnownPeer,
    Participant, User, REMOTE_PLACEHOLDER,
};
pub use sqlite::SqliteStore;

use murmur_types::Result;

/// Transactional, concurrency-safe persistence for users, the social
/// graph, messages, conferences, and the known-peer cache.
///
/// Creation methods assign the row id (and, where noted, timestamps)
/// on success. Lookup methods return `Ok(None)` on "no row" — absence
/// is not an error.
pub trait Store: Send + Sync {
    // --- Users --------------------------------------------------------------

    /// Inserts a user, assigning `id`, `created_at`, and `updated_at`.
    ///
    /// Fails with `UniqueViolation` if the username or peer id collides.
    fn create_user(&self, user: &mut User) -> Result<()>;

    /// Overwrites a user row by id, refreshing `updated_at`. Used both
    /// to rotate the password hash and to upgrade placeholder rows.
    fn update_user(&self, user: &User) -> Result<()>;

    fn find_user_by_id(&self, id: i64) -> Result<Option<User>>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn find_user_by_peer_id(&self, peer_id: &str) -> Result<Option<User>>;

    /// Case-insensitive substring match on full name.
    fn search_users_by_fullname(&self, needle: &str) -> Result<Vec<User>>;

    // --- Friendships --------------------------------------------------------

    /// Inserts a directed friendship edge, assigning `id` and
    /// `created_at`.
    ///
    /// Fails with `UniqueViolation` on a duplicate
    /// `(owner_user_id, other_user_id)` pair.
    fn create_friendship(&self, row: &mut Friendship) -> Result<()>;

    /// Returns the edge owned by `owner` pointing at `other`, if any.
    fn find_friendship(&self, owner: i64, other: i64) -> Result<Option<Friendship>>;

    /// Overwrites status, cached names, and `accepted_at` by id.
    fn update_friendship(&self, row: &Friendship) -> Result<()>;

    /// All accepted edges owned by `owner`.
    fn friends_of(&self, owner: i64) -> Result<Vec<Friendship>>;

    /// All pending requests addressed to `owner`.
    fn pending_requests_for(&self, owner: i64) -> Result<Vec<Friendship>>;

    // --- Direct messages ----------------------------------------------------

    /// Appends a message, assigning `id`. `created_at` is taken from
    /// the model (senders stamp now, receive handlers stamp the wire
    /// timestamp).
    fn save_direct_message(&self, msg: &mut DirectMessage) -> Result<()>;

    /// The most recent `limit` messages between `a` and `b` in either
    /// direction, newest first.
    fn get_conversation(&self, a: i64, b: i64, limit: usize) -> Result<Vec<DirectMessage>>;

    /// All undelivered messages addressed to `owner`, oldest first.
    fn get_undelivered(&self, owner: i64) -> Result<Vec<DirectMessage>>;

    /// Sets the delivered flag and fills `delivered_at` if still null.
    /// Idempotent.
    fn mark_delivered(&self, id: i64) -> Result<()>;

    /// Sets the read flag and fills `read_at` if still null. Idempotent.
    fn mark_read(&self, id: i64) -> Result<()>;

    /// Number of unread messages addressed to `owner`.
    fn count_unread(&self, owner: i64) -> Result<i64>;

    // --- Conferences --------------------------------------------------------

    /// Inserts a conference, assigning `id` and `created_at`.
    fn create_conference(&self, conf: &mut Conference) -> Result<()>;

    fn find_conference(&self, id: i64) -> Result<Option<Conference>>;

    /// Conferences in which `user_id` is an active participant.
    fn conferences_for_user(&self, user_id: i64) -> Result<Vec<Conference>>;

    /// Inserts an active participant row, assigning `id` and
    /// `joined_at`.
    fn add_participant(&self, participant: &mut Participant) -> Result<()>;

    /// Reactivates a previously left participant row. Returns `true`
    /// if a row was reactivated, `false` if none existed.
    fn reactivate_participant(&self, conference_id: i64, user_id: i64) -> Result<bool>;

    /// Marks the participant inactive and stamps `left_at`.
    fn deactivate_participant(&self, conference_id: i64, user_id: i64) -> Result<()>;

    /// Active participants of a conference.
    fn participants(&self, conference_id: i64) -> Result<Vec<Participant>>;

    /// Appends a conference message, assigning `id`. `created_at` is
    /// taken from the model (the gossip timestamp for remote messages).
    fn save_conference_message(&self, msg: &mut ConferenceMessage) -> Result<()>;

    /// The most recent `limit` messages of a conference, newest first.
    fn conference_messages(&self, conference_id: i64, limit: usize)
        -> Result<Vec<ConferenceMessage>>;

    // --- Known peers --------------------------------------------------------

    /// Inserts or replaces the cache entry for `peer.peer_id`.
    fn save_known_peer(&self, peer: &KnownPeer) -> Result<()>;

    /// All cached peers, most recently seen first.
    fn known_peers(&self) -> Result<Vec<KnownPeer>>;
}
