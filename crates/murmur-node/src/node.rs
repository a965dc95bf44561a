//! Node assembly.
//!
//! [`MurmurNode`] opens the store, loads the node identity, spawns the
//! transport, wires the three engines plus auth to the shared session,
//! and runs the network-event task that maintains the known-peer
//! cache. The shell drives everything through this type.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use murmur_network::{identity, NetworkConfig, NetworkEvent, PeerId, TransportNode};
use murmur_storage::{KnownPeer, SqliteStore, Store, User};
use murmur_types::config::AppConfig;
use murmur_types::Result;

use crate::auth::AuthService;
use crate::conference::ConferenceEngine;
use crate::friends::FriendEngine;
use crate::messages::MessageEngine;
use crate::notifications::{self, Notification, NotificationReceiver, NotificationSender};
use crate::session::Session;

/// A running Murmur node.
pub struct MurmurNode {
    store: Arc<dyn Store>,
    network: Arc<TransportNode>,
    session: Arc<Session>,
    auth: AuthService,
    friends: Arc<FriendEngine>,
    messages: Arc<MessageEngine>,
    conferences: Arc<ConferenceEngine>,
    shutdown_tx: watch::Sender<bool>,
}

impl MurmurNode {
    /// Opens the store at the configured path and starts the node.
    pub async fn start(
        config: AppConfig,
        net_config: NetworkConfig,
    ) -> Result<(Self, NotificationReceiver)> {
        config.validate()?;
        config.ensure_data_dir()?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path)?);
        Self::start_with_store(&config, net_config, store).await
    }

    /// Starts the node on an existing store (tests use the in-memory
    /// variant here).
    pub async fn start_with_store(
        config: &AppConfig,
        net_config: NetworkConfig,
        store: Arc<dyn Store>,
    ) -> Result<(Self, NotificationReceiver)> {
        let keypair = identity::load_or_generate(&config.data_dir, net_config.listen_port)?;
        let (network, network_events) = TransportNode::spawn(net_config, keypair).await?;
        let network = Arc::new(network);

        let session = Arc::new(Session::new());
        let (notify_tx, notify_rx) = notifications::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let auth = AuthService::new(Arc::clone(&store), Arc::clone(&session));

        let friends = FriendEngine::new(
            Arc::clone(&store),
            Arc::clone(&network),
            Arc::clone(&session),
            notify_tx.clone(),
        );
        friends.register_handlers()?;

        let messages = MessageEngine::new(
            Arc::clone(&store),
            Arc::clone(&network),
            Arc::clone(&session),
            notify_tx.clone(),
        );
        messages.register_handlers()?;

        let conferences = ConferenceEngine::new(
            Arc::clone(&store),
            Arc::clone(&network),
            Arc::clone(&session),
            notify_tx.clone(),
            shutdown_rx.clone(),
        );
        conferences.register_handlers()?;

        tokio::spawn(run_network_events(
            network_events,
            Arc::clone(&store),
            notify_tx,
            shutdown_rx,
        ));

        Ok((
            Self {
                store,
                network,
                session,
                auth,
                friends,
                messages,
                conferences,
                shutdown_tx,
            },
            notify_rx,
        ))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn network(&self) -> &Arc<TransportNode> {
        &self.network
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn friends(&self) -> &Arc<FriendEngine> {
        &self.friends
    }

    pub fn messages(&self) -> &Arc<MessageEngine> {
        &self.messages
    }

    pub fn conferences(&self) -> &Arc<ConferenceEngine> {
        &self.conferences
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    // -----------------------------------------------------------------------
    // Account lifecycle
    // -----------------------------------------------------------------------

    /// Registers a local account bound to this node's peer id.
    pub fn register(&self, username: &str, password: &str, full_name: &str) -> Result<User> {
        self.auth.register(
            username,
            password,
            full_name,
            &self.local_peer_id().to_string(),
        )
    }

    /// Logs in, publishes presence, and retries queued messages.
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .auth
            .login(username, password, &self.local_peer_id().to_string())?;

        self.network.publish_user(&user.username);
        self.messages.retry_undelivered().await;

        Ok(user)
    }

    /// Deactivates the session.
    pub fn logout(&self) {
        self.auth.logout();
    }

    /// Signals every background task and the transport to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.network.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Network event task
// ---------------------------------------------------------------------------

/// Mirrors connection events into notifications and the known-peer
/// cache. Logs and continues on storage errors; never crashes the
/// node.
async fn run_network_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<NetworkEvent>,
    store: Arc<dyn Store>,
    notify: NotificationSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    NetworkEvent::PeerConnected { peer_id, addr } => {
                        let peer_str = peer_id.to_string();
                        let username = store
                            .find_user_by_peer_id(&peer_str)
                            .ok()
                            .flatten()
                            .map(|user| user.username)
                            .unwrap_or_default();

                        let cache_entry = KnownPeer {
                            id: 0,
                            peer_id: peer_str.clone(),
                            username,
                            addrs: vec![addr.to_string()],
                            last_seen: Utc::now(),
                            created_at: Utc::now(),
                        };
                        if let Err(e) = store.save_known_peer(&cache_entry) {
                            tracing::warn!(%e, "failed to update known peer cache");
                        }

                        let _ = notify
                            .send(Notification::PeerConnected { peer_id: peer_str })
                            .await;
                    }
                    NetworkEvent::PeerDisconnected { peer_id } => {
                        let _ = notify
                            .send(Notification::PeerDisconnected {
                                peer_id: peer_id.to_string(),
                            })
                            .await;
                    }
                    NetworkEvent::NewListenAddr { addr } => {
                        tracing::debug!(%addr, "new listen address");
                    }
                }
            }
        }
    }

    tracing::debug!("network event task exited");
}
