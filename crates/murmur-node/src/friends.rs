//! Friend request state machine.
//!
//! A pending request is a single directed row owned by the requester;
//! acceptance materializes the reciprocal row so an accepted
//! friendship is always two rows. Cached identity fields on a row
//! always describe the *remote* party from this node's perspective.
//!
//! Remote peers may be known only by peer id when outreach starts; a
//! placeholder user row is created so friendship rows can reference a
//! local user id, and upgraded in place when the first protocol
//! message carries the real identity.

use std::sync::Arc;

use chrono::Utc;

use murmur_network::{PeerId, TransportNode};
use murmur_storage::{FriendStatus, Friendship, Store, User, REMOTE_PLACEHOLDER};
use murmur_types::{MurmurError, Result};

use crate::notifications::{Notification, NotificationSender};
use crate::session::Session;
use crate::wire::{self, FriendRequestMsg, FriendResponseMsg};

/// Returns whether `a` and `b` share an accepted friendship in either
/// direction.
pub fn friendship_accepted(store: &dyn Store, a: i64, b: i64) -> Result<bool> {
    if let Some(row) = store.find_friendship(a, b)? {
        if row.status == FriendStatus::Accepted {
            return Ok(true);
        }
    }
    if let Some(row) = store.find_friendship(b, a)? {
        if row.status == FriendStatus::Accepted {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// FriendEngine
// ---------------------------------------------------------------------------

/// Friend request send/accept/reject operations and their stream
/// handlers.
pub struct FriendEngine {
    store: Arc<dyn Store>,
    network: Arc<TransportNode>,
    session: Arc<Session>,
    notify: NotificationSender,
}

impl FriendEngine {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<TransportNode>,
        session: Arc<Session>,
        notify: NotificationSender,
    ) -> Arc<Self> {
        Arc::new(Self { store, network, session, notify })
    }

    /// Registers the three friend protocols on the transport node.
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::FRIEND_REQUEST, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<FriendRequestMsg>(&mut stream).await {
                    Ok(msg) => engine.on_friend_request(msg).await,
                    Err(e) => tracing::warn!(%peer, %e, "bad friend request"),
                }
            }
        })?;

        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::FRIEND_ACCEPT, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<FriendResponseMsg>(&mut stream).await {
                    Ok(msg) => engine.on_friend_accept(msg).await,
                    Err(e) => tracing::warn!(%peer, %e, "bad friend accept"),
                }
            }
        })?;

        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::FRIEND_REJECT, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<FriendResponseMsg>(&mut stream).await {
                    Ok(msg) => engine.on_friend_reject(msg).await,
                    Err(e) => tracing::warn!(%peer, %e, "bad friend reject"),
                }
            }
        })?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Sends a friend request to a peer, creating a placeholder user
    /// row when the peer is unknown.
    ///
    /// The pending row is persisted before the wire attempt; a stream
    /// failure leaves it in place and is not fatal.
    pub async fn send_request(&self, target_peer: PeerId) -> Result<()> {
        let me = self.current_user()?;
        let target_peer_str = target_peer.to_string();

        if target_peer_str == me.peer_id {
            return Err(MurmurError::CannotAddSelf);
        }

        let target = match self.store.find_user_by_peer_id(&target_peer_str)? {
            Some(user) => user,
            None => self.create_placeholder(&target_peer_str)?,
        };

        if let Some(existing) = self.store.find_friendship(me.id, target.id)? {
            return Err(match existing.status {
                FriendStatus::Accepted => MurmurError::AlreadyFriends,
                _ => MurmurError::DuplicateRequest,
            });
        }

        let mut row = Friendship {
            id: 0,
            owner_user_id: me.id,
            other_user_id: target.id,
            other_peer_id: target.peer_id.clone(),
            cached_username: target.username.clone(),
            cached_full_name: target.full_name.clone(),
            status: FriendStatus::Pending,
            created_at: Utc::now(),
            accepted_at: None,
        };
        self.store.create_friendship(&mut row)?;

        let request = FriendRequestMsg {
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            message: format!("{} wants to be your friend", me.full_name),
        };

        // Wire failure is not fatal: the pending row remains, and a
        // repeat send is idempotent (DuplicateRequest).
        match self.network.open_stream(target_peer, wire::FRIEND_REQUEST).await {
            Ok(stream) => {
                if let Err(e) = wire::send_json(stream, &request).await {
                    tracing::warn!(%target_peer, %e, "friend request not sent, left pending");
                }
            }
            Err(e) => {
                tracing::warn!(%target_peer, %e, "friend request not sent, left pending");
            }
        }

        Ok(())
    }

    /// Accepts a pending request from `from_username`, materializing
    /// the reciprocal accepted edge.
    pub async fn accept(&self, from_username: &str) -> Result<()> {
        let me = self.current_user()?;
        let from = self
            .store
            .find_user_by_username(from_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        let mut request = self
            .store
            .find_friendship(from.id, me.id)?
            .ok_or_else(|| MurmurError::NotFound { what: "friend request".into() })?;

        if request.status != FriendStatus::Pending {
            return Err(MurmurError::WrongState {
                reason: format!("request is {}", request.status),
            });
        }

        let now = Utc::now();
        request.status = FriendStatus::Accepted;
        request.accepted_at = Some(now);
        self.store.update_friendship(&request)?;

        let mut reciprocal = Friendship {
            id: 0,
            owner_user_id: me.id,
            other_user_id: from.id,
            other_peer_id: from.peer_id.clone(),
            cached_username: from.username.clone(),
            cached_full_name: from.full_name.clone(),
            status: FriendStatus::Accepted,
            created_at: now,
            accepted_at: Some(now),
        };
        match self.store.create_friendship(&mut reciprocal) {
            Ok(()) => {}
            // Mutual requests can race; promote the existing edge.
            Err(MurmurError::UniqueViolation { .. }) => {
                if let Some(mut existing) = self.store.find_friendship(me.id, from.id)? {
                    existing.status = FriendStatus::Accepted;
                    existing.accepted_at = Some(now);
                    self.store.update_friendship(&existing)?;
                }
            }
            Err(e) => return Err(e),
        }

        let response = FriendResponseMsg {
            accepted: true,
            username: me.username.clone(),
            full_name: me.full_name.clone(),
            peer_id: me.peer_id.clone(),
            message: format!("{} accepted your friend request", me.full_name),
        };
        self.send_response(&from.peer_id, wire::FRIEND_ACCEPT, &response).await;

        Ok(())
    }

    /// Rejects a pending request from `from_username`. The row is
    /// retained as rejected; no reciprocal edge is created.
    pub async fn reject(&self, from_username: &str) -> Result<()> {
        let me = self.current_user()?;
        let from = self
            .store
            .find_user_by_username(from_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        let mut request = self
            .store
            .find_friendship(from.id, me.id)?
            .ok_or_else(|| MurmurError::NotFound { what: "friend request".into() })?;

        if request.status != FriendStatus::Pending {
            return Err(MurmurError::WrongState {
                reason: format!("request is {}", request.status),
            });
        }

        request.status = FriendStatus::Rejected;
        self.store.update_friendship(&request)?;

        let response = FriendResponseMsg {
            accepted: false,
            username: me.username.clone(),
            full_name: me.full_name.clone(),
            peer_id: me.peer_id.clone(),
            message: "Friend request was declined".into(),
        };
        self.send_response(&from.peer_id, wire::FRIEND_REJECT, &response).await;

        Ok(())
    }

    /// Accepted friends of the logged-in user, with an online flag per
    /// friend.
    pub fn friends_with_presence(&self) -> Result<Vec<(Friendship, bool)>> {
        let user_id = self.session.require()?;
        let friends = self.store.friends_of(user_id)?;
        Ok(friends
            .into_iter()
            .map(|row| {
                let online = row
                    .other_peer_id
                    .parse::<PeerId>()
                    .map(|peer| self.network.is_connected(&peer))
                    .unwrap_or(false);
                (row, online)
            })
            .collect())
    }

    /// Pending requests addressed to the logged-in user.
    pub fn pending_requests(&self) -> Result<Vec<Friendship>> {
        let user_id = self.session.require()?;
        self.store.pending_requests_for(user_id)
    }

    // -----------------------------------------------------------------------
    // Stream handlers
    // -----------------------------------------------------------------------

    async fn on_friend_request(&self, msg: FriendRequestMsg) {
        let from = match self.upsert_remote_user(
            &msg.from_username,
            &msg.from_full_name,
            &msg.from_peer_id,
        ) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(%e, from = %msg.from_username, "failed to record requester");
                return;
            }
        };

        let Ok(me_id) = self.session.require() else {
            // No session: nothing is recorded, the sender will retry.
            let _ = self
                .notify
                .send(Notification::FriendRequest {
                    from_username: msg.from_username,
                    from_full_name: msg.from_full_name,
                    message: msg.message,
                    needs_login: true,
                })
                .await;
            return;
        };

        match self.store.find_friendship(from.id, me_id) {
            Ok(Some(_)) => {
                let _ = self
                    .notify
                    .send(Notification::DuplicateFriendRequest {
                        from_username: from.username,
                    })
                    .await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%e, "failed to check for an existing request");
                return;
            }
        }

        let mut row = Friendship {
            id: 0,
            owner_user_id: from.id,
            other_user_id: me_id,
            other_peer_id: from.peer_id.clone(),
            cached_username: from.username.clone(),
            cached_full_name: from.full_name.clone(),
            status: FriendStatus::Pending,
            created_at: Utc::now(),
            accepted_at: None,
        };
        if let Err(e) = self.store.create_friendship(&mut row) {
            tracing::warn!(%e, "failed to save inbound friend request");
            return;
        }

        let _ = self
            .notify
            .send(Notification::FriendRequest {
                from_username: from.username,
                from_full_name: from.full_name,
                message: msg.message,
                needs_login: false,
            })
            .await;
    }

    async fn on_friend_accept(&self, msg: FriendResponseMsg) {
        let accepter =
            match self.upsert_remote_user(&msg.username, &msg.full_name, &msg.peer_id) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(%e, from = %msg.username, "failed to record accepter");
                    return;
                }
            };

        let notification = Notification::FriendAccepted {
            username: accepter.username.clone(),
            full_name: accepter.full_name.clone(),
        };

        let Ok(me_id) = self.session.require() else {
            let _ = self.notify.send(notification).await;
            return;
        };

        let now = Utc::now();

        // Our pending edge toward the accepter becomes accepted, with
        // the cached names refreshed from the response.
        match self.store.find_friendship(me_id, accepter.id) {
            Ok(Some(mut row)) if row.status == FriendStatus::Pending => {
                row.status = FriendStatus::Accepted;
                row.accepted_at = Some(now);
                row.cached_username = accepter.username.clone();
                row.cached_full_name = accepter.full_name.clone();
                if let Err(e) = self.store.update_friendship(&row) {
                    tracing::warn!(%e, "failed to promote pending request");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%e, "failed to look up pending request"),
        }

        // Materialize the reciprocal edge if the accepter's node never
        // told us about it.
        match self.store.find_friendship(accepter.id, me_id) {
            Ok(None) => {
                let mut reciprocal = Friendship {
                    id: 0,
                    owner_user_id: accepter.id,
                    other_user_id: me_id,
                    other_peer_id: accepter.peer_id.clone(),
                    cached_username: accepter.username.clone(),
                    cached_full_name: accepter.full_name.clone(),
                    status: FriendStatus::Accepted,
                    created_at: now,
                    accepted_at: Some(now),
                };
                if let Err(e) = self.store.create_friendship(&mut reciprocal) {
                    tracing::warn!(%e, "failed to create reciprocal edge");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!(%e, "failed to look up reciprocal edge"),
        }

        let _ = self.notify.send(notification).await;
    }

    async fn on_friend_reject(&self, msg: FriendResponseMsg) {
        let sender = match self.store.find_user_by_username(&msg.username) {
            Ok(Some(user)) => Some(user),
            Ok(None) => self.store.find_user_by_peer_id(&msg.peer_id).ok().flatten(),
            Err(_) => None,
        };

        if let (Some(sender), Ok(me_id)) = (sender, self.session.require()) {
            if let Ok(Some(mut row)) = self.store.find_friendship(me_id, sender.id) {
                if row.status == FriendStatus::Pending {
                    row.status = FriendStatus::Rejected;
                    if let Err(e) = self.store.update_friendship(&row) {
                        tracing::warn!(%e, "failed to mark request rejected");
                    }
                }
            }
        }

        let _ = self
            .notify
            .send(Notification::FriendRejected {
                username: msg.username,
                full_name: msg.full_name,
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn current_user(&self) -> Result<User> {
        let user_id = self.session.require()?;
        self.store
            .find_user_by_id(user_id)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })
    }

    /// Creates a placeholder row for a peer known only by id. Races
    /// with the stream handlers are resolved by re-reading.
    fn create_placeholder(&self, peer_id: &str) -> Result<User> {
        let mut placeholder = User {
            id: 0,
            username: format!("unknown_{peer_id}"),
            password_hash: REMOTE_PLACEHOLDER.into(),
            full_name: "Unknown User".into(),
            peer_id: peer_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match self.store.create_user(&mut placeholder) {
            Ok(()) => Ok(placeholder),
            Err(MurmurError::UniqueViolation { .. }) => self
                .store
                .find_user_by_peer_id(peer_id)?
                .ok_or_else(|| MurmurError::Storage {
                    reason: "placeholder lost after unique violation".into(),
                }),
            Err(e) => Err(e),
        }
    }

    /// Resolves a remote identity to a user row: by username, else by
    /// peer id (upgrading a placeholder in place), else a new row.
    fn upsert_remote_user(
        &self,
        username: &str,
        full_name: &str,
        peer_id: &str,
    ) -> Result<User> {
        if let Some(user) = self.store.find_user_by_username(username)? {
            return Ok(user);
        }

        if let Some(mut user) = self.store.find_user_by_peer_id(peer_id)? {
            user.username = username.into();
            user.full_name = full_name.into();
            self.store.update_user(&user)?;
            return Ok(user);
        }

        let mut user = User {
            id: 0,
            username: username.into(),
            password_hash: REMOTE_PLACEHOLDER.into(),
            full_name: full_name.into(),
            peer_id: peer_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match self.store.create_user(&mut user) {
            Ok(()) => Ok(user),
            Err(MurmurError::UniqueViolation { .. }) => self
                .store
                .find_user_by_peer_id(peer_id)?
                .ok_or_else(|| MurmurError::Storage {
                    reason: "user row lost after unique violation".into(),
                }),
            Err(e) => Err(e),
        }
    }

    /// Best-effort response stream; failures are logged, never fatal.
    async fn send_response(
        &self,
        peer_id: &str,
        protocol: murmur_network::StreamProtocol,
        response: &FriendResponseMsg,
    ) {
        let peer: PeerId = match peer_id.parse() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(%peer_id, %e, "cannot notify peer: bad peer id");
                return;
            }
        };

        match self.network.open_stream(peer, protocol.clone()).await {
            Ok(stream) => {
                if let Err(e) = wire::send_json(stream, response).await {
                    tracing::warn!(%peer, %protocol, %e, "could not notify peer");
                }
            }
            Err(e) => {
                tracing::warn!(%peer, %protocol, %e, "could not notify peer");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_storage::SqliteStore;

    fn user(username: &str, peer_id: &str) -> User {
        User {
            id: 0,
            username: username.into(),
            password_hash: "$argon2id$test".into(),
            full_name: format!("{username} fullname"),
            peer_id: peer_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn friendship_accepted_checks_both_directions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut alice = user("alice", "peer-a");
        store.create_user(&mut alice).unwrap();
        let mut bob = user("bob", "peer-b");
        store.create_user(&mut bob).unwrap();

        let mut row = Friendship {
            id: 0,
            owner_user_id: 2,
            other_user_id: 1,
            other_peer_id: "peer".into(),
            cached_username: "bob".into(),
            cached_full_name: "Bob".into(),
            status: FriendStatus::Accepted,
            created_at: Utc::now(),
            accepted_at: Some(Utc::now()),
        };
        store.create_friendship(&mut row).unwrap();

        assert!(friendship_accepted(&store, 1, 2).unwrap());
        assert!(friendship_accepted(&store, 2, 1).unwrap());
        assert!(!friendship_accepted(&store, 1, 3).unwrap());
    }

    #[test]
    fn pending_edge_is_not_an_accepted_friendship() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut alice = user("alice", "peer-a");
        store.create_user(&mut alice).unwrap();
        let mut bob = user("bob", "peer-b");
        store.create_user(&mut bob).unwrap();

        let mut row = Friendship {
            id: 0,
            owner_user_id: 1,
            other_user_id: 2,
            other_peer_id: "peer".into(),
            cached_username: "bob".into(),
            cached_full_name: "Bob".into(),
            status: FriendStatus::Pending,
            created_at: Utc::now(),
            accepted_at: None,
        };
        store.create_friendship(&mut row).unwrap();

        assert!(!friendship_accepted(&store, 1, 2).unwrap());
    }
}
