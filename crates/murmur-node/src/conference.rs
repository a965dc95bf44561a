//! Gossip-backed group chat.
//!
//! Each conference maps to one pub/sub topic derived from the
//! *originating* node's conference id. Invitations are friend-gated
//! stream messages; message fan-out rides the gossip substrate, with
//! a long-lived listener task per subscribed conference persisting
//! history.
//!
//! The topic/cancel maps are guarded by a single mutex held only for
//! map reads and writes — never across a suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use murmur_network::{PeerId, Subscription, Topic, TransportNode};
use murmur_storage::{Conference, ConferenceMessage, Participant, Store, User};
use murmur_types::{MurmurError, Result};

use crate::friends::friendship_accepted;
use crate::notifications::{Notification, NotificationSender};
use crate::session::Session;
use crate::wire::{self, ConferenceGossipMsg, ConferenceInviteMsg};

// ---------------------------------------------------------------------------
// ConferenceEngine
// ---------------------------------------------------------------------------

/// Per-conference subscription state held by the engine.
struct ConfSubscription {
    topic: Topic,
    cancel: watch::Sender<bool>,
}

/// Conference operations, the invite handler, and subscription
/// listeners.
pub struct ConferenceEngine {
    store: Arc<dyn Store>,
    network: Arc<TransportNode>,
    session: Arc<Session>,
    notify: NotificationSender,
    /// conference_id → (topic handle, cancellation token). One mutex
    /// guards both; every entry added by subscribe is removed by
    /// leave or process shutdown.
    subs: Mutex<HashMap<i64, ConfSubscription>>,
    /// Process-level shutdown, inherited by listener tasks.
    shutdown_rx: watch::Receiver<bool>,
}

impl ConferenceEngine {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<TransportNode>,
        session: Arc<Session>,
        notify: NotificationSender,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            network,
            session,
            notify,
            subs: Mutex::new(HashMap::new()),
            shutdown_rx,
        })
    }

    /// Registers the invite protocol on the transport node.
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let engine = Arc::clone(self);
        self.network.register_stream_handler(wire::CONFERENCE_INVITE, move |peer, mut stream| {
            let engine = Arc::clone(&engine);
            async move {
                match wire::read_json::<ConferenceInviteMsg>(&mut stream).await {
                    Ok(invite) => engine.on_invite(invite).await,
                    Err(e) => tracing::warn!(%peer, %e, "bad conference invite"),
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Creates a conference, adds the creator as first participant,
    /// and subscribes to its topic.
    pub async fn create(self: &Arc<Self>, name: &str) -> Result<Conference> {
        let me = self.current_user()?;

        let mut conf = Conference {
            id: 0,
            name: name.into(),
            creator_user_id: me.id,
            created_at: Utc::now(),
        };
        self.store.create_conference(&mut conf)?;

        let mut participant = Participant {
            id: 0,
            conference_id: conf.id,
            user_id: me.id,
            peer_id: me.peer_id.clone(),
            cached_username: me.username.clone(),
            joined_at: Utc::now(),
            left_at: None,
            active: true,
        };
        self.store.add_participant(&mut participant)?;

        self.subscribe(conf.id).await?;
        Ok(conf)
    }

    /// Invites a friend to a conference. Requires the inviter to be an
    /// active participant and the friend to be online.
    pub async fn invite(&self, conference_id: i64, friend_username: &str) -> Result<()> {
        let me = self.current_user()?;
        let conf = self
            .store
            .find_conference(conference_id)?
            .ok_or_else(|| MurmurError::NotFound { what: "conference".into() })?;

        let participants = self.store.participants(conference_id)?;
        if !participants.iter().any(|p| p.user_id == me.id && p.active) {
            return Err(MurmurError::WrongState {
                reason: "you are not a participant of this conference".into(),
            });
        }

        let friend = self
            .store
            .find_user_by_username(friend_username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        if !friendship_accepted(self.store.as_ref(), me.id, friend.id)? {
            return Err(MurmurError::NotFriends { username: friend.username });
        }

        if participants.iter().any(|p| p.user_id == friend.id && p.active) {
            return Err(MurmurError::AlreadyIn);
        }

        let peer: PeerId = friend.peer_id.parse().map_err(|_| MurmurError::InvalidAddress {
            reason: format!("stored peer id for {} is invalid", friend.username),
        })?;

        // Invites require an online recipient in this design.
        if !self.network.is_connected(&peer) {
            return Err(MurmurError::NotOnline { username: friend.username });
        }

        let invite = ConferenceInviteMsg {
            conference_id: conf.id,
            conference_name: conf.name.clone(),
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            message: format!("{} invited you to conference '{}'", me.full_name, conf.name),
        };

        let stream = self.network.open_stream(peer, wire::CONFERENCE_INVITE).await?;
        wire::send_json(stream, &invite).await
    }

    /// Joins a conference whose metadata is known locally, inserting
    /// or reactivating the participant row and subscribing.
    pub async fn join(self: &Arc<Self>, conference_id: i64) -> Result<Conference> {
        let me = self.current_user()?;
        let conf = self
            .store
            .find_conference(conference_id)?
            .ok_or_else(|| MurmurError::NotFound { what: "conference".into() })?;

        let participants = self.store.participants(conference_id)?;
        if participants.iter().any(|p| p.user_id == me.id && p.active) {
            return Err(MurmurError::AlreadyIn);
        }

        if !self.store.reactivate_participant(conference_id, me.id)? {
            let mut participant = Participant {
                id: 0,
                conference_id,
                user_id: me.id,
                peer_id: me.peer_id.clone(),
                cached_username: me.username.clone(),
                joined_at: Utc::now(),
                left_at: None,
                active: true,
            };
            self.store.add_participant(&mut participant)?;
        }

        self.subscribe(conference_id).await?;
        Ok(conf)
    }

    /// Subscribes to the conference topic and starts its listener.
    /// Idempotent: a second call is a no-op and leaks no tasks.
    pub async fn subscribe(self: &Arc<Self>, conference_id: i64) -> Result<()> {
        if self.subs_guard().contains_key(&conference_id) {
            return Ok(());
        }

        let topic_name = wire::conference_topic(conference_id);
        let topic = self.network.join(&topic_name).await?;
        let subscription = topic.subscribe().await?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        {
            let mut subs = self.subs_guard();
            if subs.contains_key(&conference_id) {
                // Lost a subscribe race; the duplicate receiver is
                // dropped and the winner's listener keeps running.
                return Ok(());
            }
            subs.insert(conference_id, ConfSubscription { topic, cancel: cancel_tx });
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.listen(conference_id, subscription, cancel_rx).await;
        });

        Ok(())
    }

    /// Publishes a message to a subscribed conference and persists it
    /// locally. A failed local persist does not undo the publish.
    pub async fn send_message(&self, conference_id: i64, content: &str) -> Result<()> {
        let me = self.current_user()?;

        let participants = self.store.participants(conference_id)?;
        if !participants.iter().any(|p| p.user_id == me.id && p.active) {
            return Err(MurmurError::WrongState {
                reason: "you are not a participant of this conference".into(),
            });
        }

        let topic = self
            .subs_guard()
            .get(&conference_id)
            .map(|entry| entry.topic.clone())
            .ok_or(MurmurError::NotSubscribed { conference_id })?;

        let now = Utc::now();
        let gossip = ConferenceGossipMsg {
            conference_id,
            from_username: me.username.clone(),
            from_full_name: me.full_name.clone(),
            from_peer_id: me.peer_id.clone(),
            content: content.into(),
            timestamp: now.timestamp(),
        };
        let payload = serde_json::to_vec(&gossip).map_err(|e| MurmurError::Network {
            reason: format!("failed to encode conference message: {e}"),
        })?;

        topic.publish(payload).await?;

        let mut row = ConferenceMessage {
            id: 0,
            conference_id,
            from_user_id: me.id,
            from_peer_id: me.peer_id.clone(),
            content: content.into(),
            created_at: now,
        };
        if let Err(e) = self.store.save_conference_message(&mut row) {
            tracing::warn!(%e, conference_id, "published message not saved locally");
        }

        Ok(())
    }

    /// Leaves a conference: marks the participant inactive, cancels
    /// the listener, and releases the topic.
    pub async fn leave(&self, conference_id: i64) -> Result<()> {
        let me = self.current_user()?;
        self.store.deactivate_participant(conference_id, me.id)?;

        let entry = self.subs_guard().remove(&conference_id);
        if let Some(entry) = entry {
            let _ = entry.cancel.send(true);
            let topic_name = entry.topic.name().to_string();
            self.network.leave_topic(&topic_name).await?;
        }

        Ok(())
    }

    /// Conferences the logged-in user is an active participant of.
    pub fn conferences(&self) -> Result<Vec<Conference>> {
        let me_id = self.session.require()?;
        self.store.conferences_for_user(me_id)
    }

    /// The most recent `limit` messages of a conference, newest first.
    pub fn history(&self, conference_id: i64, limit: usize) -> Result<Vec<ConferenceMessage>> {
        self.store.conference_messages(conference_id, limit)
    }

    /// Active participants of a conference.
    pub fn participants(&self, conference_id: i64) -> Result<Vec<Participant>> {
        self.store.participants(conference_id)
    }

    /// Whether the engine currently holds a topic handle for the
    /// conference.
    pub fn is_subscribed(&self, conference_id: i64) -> bool {
        self.subs_guard().contains_key(&conference_id)
    }

    // -----------------------------------------------------------------------
    // Listener
    // -----------------------------------------------------------------------

    /// Long-lived per-conference task: ingests gossip messages until
    /// the subscription is cancelled or the process shuts down.
    async fn listen(
        &self,
        conference_id: i64,
        mut subscription: Subscription,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let local_peer_id = self.network.local_peer_id();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                msg = subscription.next() => {
                    let Some(msg) = msg else { break };

                    // Our own publishes come back as self-echoes.
                    if msg.received_from == local_peer_id {
                        continue;
                    }

                    // Decoding errors are logged and skipped; they do
                    // not tear the listener down.
                    let gossip: ConferenceGossipMsg = match serde_json::from_slice(&msg.data) {
                        Ok(gossip) => gossip,
                        Err(e) => {
                            tracing::warn!(conference_id, %e, "undecodable conference message");
                            continue;
                        }
                    };

                    self.ingest(gossip).await;
                }
            }
        }

        tracing::debug!(conference_id, "conference listener exited");
    }

    /// Persists one remote conference message and notifies the user.
    async fn ingest(&self, gossip: ConferenceGossipMsg) {
        let from_user_id = self
            .store
            .find_user_by_peer_id(&gossip.from_peer_id)
            .ok()
            .flatten()
            .map(|user| user.id)
            .unwrap_or(0);

        let created_at = Utc
            .timestamp_opt(gossip.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let mut row = ConferenceMessage {
            id: 0,
            conference_id: gossip.conference_id,
            from_user_id,
            from_peer_id: gossip.from_peer_id.clone(),
            content: gossip.content.clone(),
            created_at,
        };
        if let Err(e) = self.store.save_conference_message(&mut row) {
            tracing::warn!(%e, "failed to save conference message");
        }

        let _ = self
            .notify
            .send(Notification::ConferenceMessage {
                conference_id: gossip.conference_id,
                from_full_name: gossip.from_full_name,
                content: gossip.content,
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Invite handler
    // -----------------------------------------------------------------------

    /// Invitations only notify; joining is an explicit user action
    /// using the conference id carried in the invite.
    async fn on_invite(&self, invite: ConferenceInviteMsg) {
        let _ = self
            .notify
            .send(Notification::ConferenceInvite {
                conference_id: invite.conference_id,
                conference_name: invite.conference_name,
                from_username: invite.from_username,
                from_full_name: invite.from_full_name,
                message: invite.message,
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

    fn subs_guard(&self) -> MutexGuard<'_, HashMap<i64, ConfSubscription>> {
        match self.subs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
