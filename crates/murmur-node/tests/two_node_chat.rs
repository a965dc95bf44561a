//! End-to-end flows between two live nodes on loopback.
//!
//! Covers the two-node friendship handshake (including placeholder
//! upgrade on the requester), acknowledged direct messaging, read
//! receipts, and conference gossip round trips.

use std::sync::Arc;
use std::time::Duration;

use murmur_network::NetworkConfig;
use murmur_node::notifications::NotificationReceiver;
use murmur_node::{MurmurNode, Notification};
use murmur_storage::{FriendStatus, SqliteStore, Store};
use murmur_types::config::AppConfig;

struct TestNode {
    node: MurmurNode,
    notifications: NotificationReceiver,
    _tmp: tempfile::TempDir,
}

async fn spawn_node() -> TestNode {
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
    TestNode { node, notifications, _tmp: tmp }
}

async fn loopback_addr(node: &MurmurNode) -> String {
    for _ in 0..50 {
        let addrs = node.network().advertised_addresses().await.unwrap();
        if let Some(addr) = addrs.iter().find(|a| a.contains("127.0.0.1")) {
            return addr.clone();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("node never advertised a loopback address");
}

/// Polls `check` until it returns `Some`, up to `secs` seconds.
async fn wait_for<T>(secs: u64, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {secs}s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Full two-node setup: alice on A, bob on B, connected, friends.
async fn befriended_pair() -> (TestNode, TestNode) {
    let a = spawn_node().await;
    let b = spawn_node().await;

    a.node.register("alice", "long enough", "Alice Wonder").unwrap();
    a.node.login("alice", "long enough").await.unwrap();
    b.node.register("bob", "long enough", "Bob Jones").unwrap();
    b.node.login("bob", "long enough").await.unwrap();

    let addr_a = loopback_addr(&a.node).await;
    b.node.network().dial(&addr_a).await.expect("dial failed");

    // Bob requests friendship with a peer he only knows by id.
    b.node.friends().send_request(a.node.local_peer_id()).await.unwrap();

    // Alice's node records the pending request.
    let alice = a.node.auth().current_user().unwrap();
    let bob_on_a = wait_for(10, || {
        a.node.store().find_user_by_username("bob").unwrap()
    })
    .await;
    wait_for(10, || {
        a.node
            .store()
            .find_friendship(bob_on_a.id, alice.id)
            .unwrap()
            .filter(|row| row.status == FriendStatus::Pending)
    })
    .await;

    a.node.friends().accept("bob").await.unwrap();

    // Both directions accepted on A.
    wait_for(10, || {
        let forward = a.node.store().find_friendship(bob_on_a.id, alice.id).unwrap()?;
        let reciprocal = a.node.store().find_friendship(alice.id, bob_on_a.id).unwrap()?;
        (forward.status == FriendStatus::Accepted && reciprocal.status == FriendStatus::Accepted)
            .then_some(())
    })
    .await;

    // Both directions accepted on B once the accept message lands.
    let bob = b.node.auth().current_user().unwrap();
    let alice_on_b = wait_for(10, || {
        b.node.store().find_user_by_username("alice").unwrap()
    })
    .await;
    wait_for(10, || {
        let forward = b.node.store().find_friendship(bob.id, alice_on_b.id).unwrap()?;
        let reciprocal = b.node.store().find_friendship(alice_on_b.id, bob.id).unwrap()?;
        (forward.status == FriendStatus::Accepted && reciprocal.status == FriendStatus::Accepted)
            .then_some(())
    })
    .await;

    (a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_friendship_with_placeholder_upgrade() {
    let (a, b) = befriended_pair().await;

    // Bob initially knew Alice only by peer id; the accept message
    // must have upgraded the placeholder in place.
    let alice_on_b = b.node.store().find_user_by_username("alice").unwrap().unwrap();
    assert_eq!(alice_on_b.peer_id, a.node.local_peer_id().to_string());
    assert_eq!(alice_on_b.full_name, "Alice Wonder");
    assert!(
        b.node
            .store()
            .find_user_by_username(&format!("unknown_{}", a.node.local_peer_id()))
            .unwrap()
            .is_none(),
        "placeholder username must be gone after the upgrade"
    );

    // accepted_at is set on every accepted edge.
    let bob_on_a = a.node.store().find_user_by_username("bob").unwrap().unwrap();
    let alice = a.node.auth().current_user().unwrap();
    for (owner, other) in [(bob_on_a.id, alice.id), (alice.id, bob_on_a.id)] {
        let row = a.node.store().find_friendship(owner, other).unwrap().unwrap();
        assert!(row.accepted_at.is_some());
    }

    // Presence: each side sees the other online.
    let friends = a.node.friends().friends_with_presence().unwrap();
    assert_eq!(friends.len(), 1);
    assert!(friends[0].1, "bob should be online from alice's view");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_message_is_acked_and_read() {
    let (a, mut b) = befriended_pair().await;

    let sent = a.node.messages().send("bob", "hello bob").await.unwrap();
    assert!(!sent.delivered, "delivered must wait for the ack");

    // Bob's node persists the message and notifies.
    let received = loop {
        match b.notifications.recv().await.expect("channel open") {
            Notification::DirectMessage { from_username, content, .. } => {
                break (from_username, content)
            }
            _ => continue,
        }
    };
    assert_eq!(received.0, "alice");
    assert_eq!(received.1, "hello bob");

    let bob = b.node.auth().current_user().unwrap();
    let stored = wait_for(10, || {
        b.node
            .store()
            .get_undelivered(bob.id)
            .ok()
            .filter(|q| q.is_empty())
            .and_then(|_| {
                b.node
                    .messages()
                    .conversation("alice", 10)
                    .ok()
                    .and_then(|mut msgs| msgs.pop())
            })
    })
    .await;
    assert!(stored.delivered);
    assert!(stored.delivered_at.is_some());

    // The ack flips delivered on Alice's copy.
    wait_for(10, || {
        a.node
            .messages()
            .conversation("bob", 10)
            .unwrap()
            .into_iter()
            .find(|m| m.id == sent.id && m.delivered && m.delivered_at.is_some())
    })
    .await;

    // Bob opens the conversation; Alice sees the read receipt.
    b.node.messages().mark_conversation_read("alice").await.unwrap();
    wait_for(10, || {
        a.node
            .messages()
            .conversation("bob", 10)
            .unwrap()
            .into_iter()
            .find(|m| m.id == sent.id && m.read && m.read_at.is_some())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conference_gossip_reaches_both_nodes_exactly_once() {
    let (a, mut b) = befriended_pair().await;

    let conf_a = a.node.conferences().create("study").await.unwrap();

    // The invite reaches bob with the originating node's id.
    a.node.conferences().invite(conf_a.id, "bob").await.unwrap();
    let invited_id = loop {
        match b.notifications.recv().await.expect("channel open") {
            Notification::ConferenceInvite { conference_id, conference_name, .. } => {
                assert_eq!(conference_name, "study");
                break conference_id;
            }
            _ => continue,
        }
    };
    assert_eq!(invited_id, conf_a.id);

    // Joining without local metadata fails; bob materializes the
    // conference on his own node, which subscribes to the same topic
    // because both stores assign the same first id.
    let err = b.node.conferences().join(invited_id).await.unwrap_err();
    assert!(matches!(err, murmur_types::MurmurError::NotFound { .. }));

    let conf_b = b.node.conferences().create("study").await.unwrap();
    assert_eq!(conf_b.id, conf_a.id, "fresh stores must agree on the first id");

    // Let the gossip mesh form between the two subscribers.
    tokio::time::sleep(Duration::from_secs(2)).await;

    a.node.conferences().send_message(conf_a.id, "from alice").await.unwrap();
    b.node.conferences().send_message(conf_b.id, "from bob").await.unwrap();

    // Every node ends with exactly two rows: its own message (stored
    // at publish, self-echo filtered) and the remote one.
    for (label, node, conf_id) in [("A", &a.node, conf_a.id), ("B", &b.node, conf_b.id)] {
        let history = wait_for(15, || {
            let rows = node.conferences().history(conf_id, 10).unwrap();
            (rows.len() >= 2).then_some(rows)
        })
        .await;
        assert_eq!(history.len(), 2, "node {label} must hold exactly two rows");

        let mut contents: Vec<_> = history.iter().map(|m| m.content.clone()).collect();
        contents.sort();
        assert_eq!(contents, vec!["from alice".to_string(), "from bob".to_string()]);
    }

    // The remote row resolves the sender when the peer is known.
    let alice_on_b = b.node.store().find_user_by_username("alice").unwrap().unwrap();
    let remote_row = b
        .node
        .conferences()
        .history(conf_b.id, 10)
        .unwrap()
        .into_iter()
        .find(|m| m.content == "from alice")
        .unwrap();
    assert_eq!(remote_row.from_user_id, alice_on_b.id);

    // Leaving tears the listener down on B only.
    b.node.conferences().leave(conf_b.id).await.unwrap();
    assert!(!b.node.conferences().is_subscribed(conf_b.id));
    assert!(a.node.conferences().is_subscribed(conf_a.id));
}
