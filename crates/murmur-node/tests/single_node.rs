//! Engine semantics on a single node with no peers.
//!
//! Wire sends to absent peers are best-effort by design, so the
//! friend and message engines can be exercised end-to-end against a
//! lone node: pending rows persist, messages queue, and conference
//! state stays consistent.

use std::sync::Arc;

use chrono::Utc;

use murmur_network::{NetworkConfig, PeerId};
use murmur_node::notifications::NotificationReceiver;
use murmur_node::{MurmurNode, Notification};
use murmur_storage::{
    Conference, FriendStatus, Friendship, Participant, SqliteStore, Store, REMOTE_PLACEHOLDER,
};
use murmur_types::config::AppConfig;
use murmur_types::MurmurError;

async fn test_node() -> (MurmurNode, NotificationReceiver, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = AppConfig {
        data_dir: tmp.path().to_path_buf(),
        db_path: tmp.path().join("murmur.db"),
        ..AppConfig::default()
    };
    let net_config = NetworkConfig {
        listen_port: 0,
        enable_mdns: false,
        ..NetworkConfig::default()
    };
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (node, notifications) = MurmurNode::start_with_store(&config, net_config, store)
        .await
        .expect("node failed to start");
    (node, notifications, tmp)
}

/// Registers and logs in the node's local account.
async fn login(node: &MurmurNode, username: &str, full_name: &str) -> murmur_storage::User {
    node.register(username, "long enough", full_name).unwrap();
    node.login(username, "long enough").await.unwrap()
}

/// Inserts a remote user row plus accepted edges in both directions.
fn befriend(store: &dyn Store, me: &murmur_storage::User, username: &str, peer_id: &str) -> murmur_storage::User {
    let mut friend = murmur_storage::User {
        id: 0,
        username: username.into(),
        password_hash: REMOTE_PLACEHOLDER.into(),
        full_name: format!("{username} remote"),
        peer_id: peer_id.into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_user(&mut friend).unwrap();

    let now = Utc::now();
    for (owner, other, peer, name) in [
        (me.id, friend.id, friend.peer_id.clone(), friend.username.clone()),
        (friend.id, me.id, friend.peer_id.clone(), friend.username.clone()),
    ] {
        let mut row = Friendship {
            id: 0,
            owner_user_id: owner,
            other_user_id: other,
            other_peer_id: peer,
            cached_username: name,
            cached_full_name: String::new(),
            status: FriendStatus::Accepted,
            created_at: now,
            accepted_at: Some(now),
        };
        store.create_friendship(&mut row).unwrap();
    }
    friend
}

// ---------------------------------------------------------------------------
// Friend engine
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn friend_request_requires_session() {
    let (node, _notifications, _tmp) = test_node().await;
    let err = node
        .friends()
        .send_request(PeerId::random())
        .await
        .expect_err("must require a session");
    assert!(matches!(err, MurmurError::NotAuthenticated));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_friend_request_rejected() {
    let (node, _notifications, _tmp) = test_node().await;
    login(&node, "alice", "Alice").await;

    let err = node
        .friends()
        .send_request(node.local_peer_id())
        .await
        .expect_err("self-send must fail");
    assert!(matches!(err, MurmurError::CannotAddSelf));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_to_unknown_peer_creates_placeholder_and_queues() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    let stranger = PeerId::random();
    // The peer is offline, so the wire send fails — but that is not
    // fatal: the pending row must remain.
    node.friends().send_request(stranger).await.unwrap();

    let placeholder = node
        .store()
        .find_user_by_peer_id(&stranger.to_string())
        .unwrap()
        .expect("placeholder row missing");
    assert_eq!(placeholder.password_hash, REMOTE_PLACEHOLDER);
    assert!(placeholder.username.starts_with("unknown_"));

    let pending = node
        .store()
        .find_friendship(me.id, placeholder.id)
        .unwrap()
        .expect("pending row missing");
    assert_eq!(pending.status, FriendStatus::Pending);
    assert!(pending.accepted_at.is_none());

    // Idempotence: a repeat send is DuplicateRequest, no row growth.
    let err = node.friends().send_request(stranger).await.unwrap_err();
    assert!(matches!(err, MurmurError::DuplicateRequest));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_unknown_user_fails_not_found() {
    let (node, _notifications, _tmp) = test_node().await;
    login(&node, "alice", "Alice").await;

    let err = node.friends().accept("ghost").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_materializes_reciprocal_edge() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    // Simulate an inbound pending request from bob.
    let mut bob = murmur_storage::User {
        id: 0,
        username: "bob".into(),
        password_hash: REMOTE_PLACEHOLDER.into(),
        full_name: "Bob Jones".into(),
        peer_id: PeerId::random().to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store().create_user(&mut bob).unwrap();

    let mut request = Friendship {
        id: 0,
        owner_user_id: bob.id,
        other_user_id: me.id,
        other_peer_id: bob.peer_id.clone(),
        cached_username: bob.username.clone(),
        cached_full_name: bob.full_name.clone(),
        status: FriendStatus::Pending,
        created_at: Utc::now(),
        accepted_at: None,
    };
    node.store().create_friendship(&mut request).unwrap();

    // Accept works even though bob is unreachable (the response
    // stream is best-effort).
    node.friends().accept("bob").await.unwrap();

    let forward = node.store().find_friendship(bob.id, me.id).unwrap().unwrap();
    assert_eq!(forward.status, FriendStatus::Accepted);
    assert!(forward.accepted_at.is_some());

    let reciprocal = node.store().find_friendship(me.id, bob.id).unwrap().unwrap();
    assert_eq!(reciprocal.status, FriendStatus::Accepted);
    assert!(reciprocal.accepted_at.is_some());

    // Accepting again is a state error, not a duplicate row.
    let err = node.friends().accept("bob").await.unwrap_err();
    assert!(matches!(err, MurmurError::WrongState { .. }));

    let friends = node.friends().friends_with_presence().unwrap();
    assert_eq!(friends.len(), 1);
    assert!(!friends[0].1, "offline friend must not be flagged online");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_keeps_row_and_skips_reciprocal() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    let mut bob = murmur_storage::User {
        id: 0,
        username: "bob".into(),
        password_hash: REMOTE_PLACEHOLDER.into(),
        full_name: "Bob Jones".into(),
        peer_id: PeerId::random().to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store().create_user(&mut bob).unwrap();

    let mut request = Friendship {
        id: 0,
        owner_user_id: bob.id,
        other_user_id: me.id,
        other_peer_id: bob.peer_id.clone(),
        cached_username: bob.username.clone(),
        cached_full_name: bob.full_name.clone(),
        status: FriendStatus::Pending,
        created_at: Utc::now(),
        accepted_at: None,
    };
    node.store().create_friendship(&mut request).unwrap();

    node.friends().reject("bob").await.unwrap();

    let row = node.store().find_friendship(bob.id, me.id).unwrap().unwrap();
    assert_eq!(row.status, FriendStatus::Rejected);
    assert!(node.store().find_friendship(me.id, bob.id).unwrap().is_none());
    assert!(node.friends().friends_with_presence().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Message engine
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_message_requires_friendship() {
    let (node, _notifications, _tmp) = test_node().await;
    login(&node, "alice", "Alice").await;

    let mut stranger = murmur_storage::User {
        id: 0,
        username: "mallory".into(),
        password_hash: REMOTE_PLACEHOLDER.into(),
        full_name: "Mallory".into(),
        peer_id: PeerId::random().to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store().create_user(&mut stranger).unwrap();

    let err = node.messages().send("mallory", "hi").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotFriends { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_to_offline_friend_is_queued() {
    let (node, mut notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;
    let bob = befriend(node.store().as_ref(), &me, "bob", &PeerId::random().to_string());

    let msg = node.messages().send("bob", "are you there?").await.unwrap();
    assert!(msg.id > 0);
    assert!(!msg.delivered);
    assert!(msg.delivered_at.is_none());

    // Persisted before (attempted) transmission, addressed to bob.
    let queued = node.store().get_undelivered(bob.id).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].content, "are you there?");

    // The shell is told the message was queued, not errored.
    let queued_notice = loop {
        match notifications.recv().await.expect("channel open") {
            Notification::MessageQueued { to_username } => break to_username,
            _ => continue,
        }
    };
    assert_eq!(queued_notice, "bob");

    let history = node.messages().conversation("bob", 10).unwrap();
    assert_eq!(history.len(), 1);
}

// ---------------------------------------------------------------------------
// Conference engine
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conference_create_subscribes_creator() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    let conf = node.conferences().create("study").await.unwrap();
    assert!(conf.id > 0);
    assert!(node.conferences().is_subscribed(conf.id));

    let participants = node.conferences().participants(conf.id).unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].user_id, me.id);

    // A lone participant can still talk; history records it.
    node.conferences().send_message(conf.id, "hello, me").await.unwrap();
    let history = node.conferences().history(conf.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_user_id, me.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invite_gates_on_friendship_and_presence() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;
    let conf = node.conferences().create("study").await.unwrap();

    // Not a friend.
    let mut stranger = murmur_storage::User {
        id: 0,
        username: "mallory".into(),
        password_hash: REMOTE_PLACEHOLDER.into(),
        full_name: "Mallory".into(),
        peer_id: PeerId::random().to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store().create_user(&mut stranger).unwrap();
    let err = node.conferences().invite(conf.id, "mallory").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotFriends { .. }));

    // A friend, but offline.
    befriend(node.store().as_ref(), &me, "bob", &PeerId::random().to_string());
    let err = node.conferences().invite(conf.id, "bob").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotOnline { .. }));

    // Unknown conference.
    let err = node.conferences().invite(999, "bob").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_unknown_conference_fails_not_found() {
    let (node, _notifications, _tmp) = test_node().await;
    login(&node, "alice", "Alice").await;

    let err = node.conferences().join(42).await.unwrap_err();
    assert!(matches!(err, MurmurError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_without_subscription_fails() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    // Conference metadata and membership exist, but subscribe was
    // never called (rows written directly, bypassing the engine).
    let mut conf = Conference {
        id: 0,
        name: "ghost".into(),
        creator_user_id: me.id,
        created_at: Utc::now(),
    };
    node.store().create_conference(&mut conf).unwrap();
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
    node.store().add_participant(&mut participant).unwrap();

    let err = node.conferences().send_message(conf.id, "hi").await.unwrap_err();
    assert!(matches!(err, MurmurError::NotSubscribed { conference_id } if conference_id == conf.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leave_releases_resources_and_spares_others() {
    let (node, _notifications, _tmp) = test_node().await;
    let me = login(&node, "alice", "Alice").await;

    let first = node.conferences().create("one").await.unwrap();
    let second = node.conferences().create("two").await.unwrap();

    // Subscribe is idempotent — no duplicate state.
    node.conferences().subscribe(first.id).await.unwrap();
    assert!(node.conferences().is_subscribed(first.id));

    node.conferences().leave(first.id).await.unwrap();
    assert!(!node.conferences().is_subscribed(first.id));
    assert!(node.conferences().is_subscribed(second.id));

    // Membership is inactive, history retained.
    assert!(node.conferences().participants(first.id).unwrap().is_empty());
    assert!(node.conferences().conferences().unwrap().iter().all(|c| c.id != first.id));

    // Rejoin reactivates the old membership row.
    let rejoined = node.conferences().join(first.id).await.unwrap();
    assert_eq!(rejoined.id, first.id);
    let participants = node.conferences().participants(first.id).unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].user_id, me.id);
    assert!(participants[0].left_at.is_none());
}
