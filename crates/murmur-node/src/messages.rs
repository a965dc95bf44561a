//! Direct messaging with offline queueing and acknowledgements.
//!
//! A message is persisted before any wire attempt, so a crash never
//! loses outbound intent. A successful wire send does NOT mark the
//! message delivered — only the `message/ack/1` round trip does.
//! Undelivered messages stay queued and are retried when the session
//! becomes active.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use murmur_network::{PeerId, TransportNode};
use murmur_storage::{DirectMessage, Store, User};
use murmur_types::{MurmurError, Result};

use crate::friends::friendship_accepted;
use crate::notifications::{Notification, NotificationSender};
use crate::session::Session;
use crate::wire::{self, DirectMessageMsg, MessageReceiptMsg};

/// How many recent messages the mark-as-read sweep inspects.
const READ_SWEEP_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// MessageEngine
// ---------------------------------------------------------------------------

/// 1-to-1 message operations and their stream handlers.
pub struct MessageEngine {
    store: Arc<dyn Store>,
    network: Arc<TransportNode>,
    session: Arc<Session>,
    notify: NotificationSender,
}

impl MessageEngine {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<TransportNode>,
        session: Arc<Session>,
        notify: NotificationSender,
    ) -> Arc<Self> {
        Arc::new(Self { store, network, session, notify })
    }

    /// Registers the direct, ack, and read protocols.
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::MESSAGE_DIRECT, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<DirectMessageMsg>(&mut stream).await {
                    Ok(msg) => engine.on_direct_message(msg, peer).await,
                    Err(e) => tracing::warn!(%peer, %e, "bad direct message"),
                }
            }
        })?;

        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::MESSAGE_ACK, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<MessageReceiptMsg>(&mut stream).await {
                    Ok(ack) => engine.on_ack(ack),
                    Err(e) => tracing::warn!(%peer, %e, "bad message ack"),
                }
            }
        })?;

        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::MESSAGE_READ, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<MessageReceiptMsg>(&mut stream).await {
                    Ok(receipt) => engine.on_read_receipt(receipt),
                    Err(e) => tracing::warn!(%peer, %e, "bad read receipt"),
                }
            }
        })?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Sends a message to a friend, queueing it when the peer is
    /// offline or the wire attempt fails.
    ///
    /// Returns the persisted row; `delivered` stays false until the
    /// acknowledgement arrives.
    pub async fn send(&self, to_username: &str, content: &str) -> Result<DirectMessage> {
        let me = self.current_user()?;
        let to = self
            .store
            .find_user_by_username(to_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        if !friendship_accepted(self.store.as_ref(), me.id, to.id)? {
            return Err(MurmurError::NotFriends { username: to.username });
        }

        let mut msg = DirectMessage {
            id: 0,
            from_user_id: me.id,
            to_user_id: to.id,
            from_peer_id: me.peer_id.clone(),
            to_peer_id: to.peer_id.clone(),
            content: content.into(),
            delivered: false,
            read: false,
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        };
        self.store.save_direct_message(&mut msg)?;

        let to_peer: PeerId = to.peer_id.parse().map_err(|_| MurmurError::InvalidAddress {
            reason: format!("stored peer id for {} is invalid", to.username),
        })?;

        if !self.network.is_connected(&to_peer) {
            let _ = self
                .notify
                .send(Notification::MessageQueued { to_username: to.username.clone() })
                .await;
            return Ok(msg);
        }

        let sent = self
            .deliver(&to_peer, &me, &to, &msg)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(%to_peer, %e, "direct message delivery failed");
                false
            });

        if !sent {
            let _ = self
                .notify
                .send(Notification::MessageQueued { to_username: to.username.clone() })
                .await;
        }

        Ok(msg)
    }

    /// The most recent `limit` messages with `other_username`, newest
    /// first.
    pub fn conversation(&self, other_username: &str, limit: usize) -> Result<Vec<DirectMessage>> {
        let me_id = self.session.require()?;
        let other = self
            .store
            .find_user_by_username(other_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;
        self.store.get_conversation(me_id, other.id, limit)
    }

    /// Unread messages addressed to the logged-in user.
    pub fn unread_count(&self) -> Result<i64> {
        let me_id = self.session.require()?;
        self.store.count_unread(me_id)
    }

    /// Marks recent messages from `other_username` as read, sending a
    /// best-effort read receipt per message when the peer is online.
    pub async fn mark_conversation_read(&self, other_username: &str) -> Result<()> {
        let me = self.current_user()?;
        let other = self
            .store
            .find_user_by_username(other_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        let recent = self.store.get_conversation(me.id, other.id, READ_SWEEP_LIMIT)?;
        let other_peer: Option<PeerId> = other.peer_id.parse().ok();

        for msg in recent {
            if msg.from_user_id != other.id || msg.read {
                continue;
            }
            if let Err(e) = self.store.mark_read(msg.id) {
                tracing::warn!(id = msg.id, %e, "failed to mark message read");
                continue;
            }

            let Some(peer) = other_peer else { continue };
            if !self.network.is_connected(&peer) {
                continue;
            }

            let receipt = MessageReceiptMsg {
                message_id: msg.id,
                from_peer: me.peer_id.clone(),
                to_peer: other.peer_id.clone(),
                timestamp: Utc::now().timestamp(),
            };
            match self.network.open_stream(peer, wire::MESSAGE_READ).await {
                Ok(stream) => {
                    if let Err(e) = wire::send_json(stream, &receipt).await {
                        tracing::debug!(%peer, %e, "read receipt not sent");
                    }
                }
                Err(e) => tracing::debug!(%peer, %e, "read receipt not sent"),
            }
        }

        Ok(())
    }

    /// Retries undelivered messages addressed to the logged-in user,
    /// redelivering to each counterparty that is currently connected.
    ///
    /// Runs when a session becomes active. Failures are logged and the
    /// messages stay queued.
    pub async fn retry_undelivered(&self) {
        let Ok(me_id) = self.session.require() else { return };

        let queued = match self.store.get_undelivered(me_id) {
            Ok(queued) => queued,
            Err(e) => {
                tracing::warn!(%e, "failed to enumerate undelivered messages");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }

        tracing::info!(count = queued.len(), "retrying undelivered messages");

        for msg in queued {
            let (Ok(Some(from)), Ok(Some(to))) = (
                self.store.find_user_by_id(msg.from_user_id),
                self.store.find_user_by_id(msg.to_user_id),
            ) else {
                continue;
            };

            let Ok(peer) = from.peer_id.parse::<PeerId>() else { continue };
            if !self.network.is_connected(&peer) {
                continue;
            }

            match self.deliver(&peer, &from, &to, &msg).await {
                Ok(true) => tracing::info!(id = msg.id, "redelivered queued message"),
                Ok(false) | Err(_) => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stream handlers
    // -----------------------------------------------------------------------

    async fn on_direct_message(&self, msg: DirectMessageMsg, from_peer: PeerId) {
        // Unknown senders and recipients are dropped, not upserted.
        let Ok(Some(from)) = self.store.find_user_by_username(&msg.from_username) else {
            tracing::warn!(from = %msg.from_username, "direct message from unknown user dropped");
            return;
        };
        let Ok(Some(to)) = self.store.find_user_by_username(&msg.to_username) else {
            tracing::warn!(to = %msg.to_username, "direct message to unknown user dropped");
            return;
        };

        let created_at = Utc
            .timestamp_opt(msg.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let mut row = DirectMessage {
            id: 0,
            from_user_id: from.id,
            to_user_id: to.id,
            from_peer_id: from.peer_id.clone(),
            to_peer_id: to.peer_id.clone(),
            content: msg.content.clone(),
            delivered: true,
            read: false,
            created_at,
            delivered_at: Some(Utc::now()),
            read_at: None,
        };
        if let Err(e) = self.store.save_direct_message(&mut row) {
            tracing::warn!(%e, "failed to save inbound message");
            return;
        }

        // Acknowledge with the sender's message id so the sender can
        // flip its own row.
        let ack = MessageReceiptMsg {
            message_id: msg.message_id,
            from_peer: to.peer_id.clone(),
            to_peer: from.peer_id.clone(),
            timestamp: Utc::now().timestamp(),
        };
        match self.network.open_stream(from_peer, wire::MESSAGE_ACK).await {
            Ok(stream) => {
                if let Err(e) = wire::send_json(stream, &ack).await {
                    tracing::warn!(%from_peer, %e, "failed to send ack");
                }
            }
            Err(e) => tracing::warn!(%from_peer, %e, "failed to send ack"),
        }

        let _ = self
            .notify
            .send(Notification::DirectMessage {
                from_username: msg.from_username,
                from_full_name: msg.from_full_name,
                content: msg.content,
            })
            .await;
    }

    fn on_ack(&self, ack: MessageReceiptMsg) {
        if ack.message_id <= 0 {
            return;
        }
        if let Err(e) = self.store.mark_delivered(ack.message_id) {
            tracing::warn!(id = ack.message_id, %e, "failed to mark message delivered");
        }
    }

    fn on_read_receipt(&self, receipt: MessageReceiptMsg) {
        if receipt.message_id <= 0 {
            return;
        }
        if let Err(e) = self.store.mark_read(receipt.message_id) {
            tracing::warn!(id = receipt.message_id, %e, "failed to mark message read");
        }
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

    /// One wire attempt. Returns `Ok(true)` when the payload was
    /// written; the delivered flag still waits for the ack.
    async fn deliver(
        &self,
        peer: &PeerId,
        from: &User,
        to: &User,
        msg: &DirectMessage,
    ) -> Result<bool> {
        let stream = self.network.open_stream(*peer, wire::MESSAGE_DIRECT).await?;

        let payload = DirectMessageMsg {
            message_id: msg.id,
            from_username: from.username.clone(),
            from_full_name: from.full_name.clone(),
            from_peer_id: from.peer_id.clone(),
            to_username: to.username.clone(),
            content: msg.content.clone(),
            timestamp: msg.created_at.timestamp(),
        };
        wire::send_json(stream, &payload).await?;
        Ok(true)
    }
}
