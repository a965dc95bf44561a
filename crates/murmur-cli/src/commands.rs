//! Shell command dispatch.
//!
//! One command per engine capability. Every input error prints as a
//! single line; transient network failures surface as "queued" or
//! "not delivered" notices from the engines themselves.

use murmur_node::MurmurNode;

use crate::{parse_peer, report};

/// What the main loop should do after a command.
pub enum CommandOutcome {
    Continue,
    Quit,
}

/// Parses and executes one command line.
pub async fn dispatch(node: &MurmurNode, line: &str) -> CommandOutcome {
    if line.is_empty() {
        return CommandOutcome::Continue;
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = parts[0];
    let args = &parts[1..];

    match cmd {
        "help" => help(),
        "quit" | "exit" => return CommandOutcome::Quit,

        // --- Account ------------------------------------------------------
        "register" => register(node, args),
        "login" => login(node, args).await,
        "logout" => logout(node),
        "whoami" => whoami(node),
        "passwd" => passwd(node, args),
        "search" => search(node, args),

        // --- Network ------------------------------------------------------
        "addr" => addr(node).await,
        "connect" => connect(node, args).await,
        "peers" => peers(node),

        // --- Friends ------------------------------------------------------
        "add-friend" => add_friend(node, args).await,
        "accept" => accept(node, args).await,
        "reject" => reject(node, args).await,
        "friends" => friends(node),
        "requests" => requests(node),

        // --- Messages -----------------------------------------------------
        "msg" => msg(node, args).await,
        "history" => history(node, args),
        "unread" => unread(node),
        "read" => mark_read(node, args).await,

        // --- Conferences --------------------------------------------------
        "create-conf" => create_conf(node, args).await,
        "invite" => invite(node, args).await,
        "join-conf" => join_conf(node, args).await,
        "conf-msg" => conf_msg(node, args).await,
        "confs" => confs(node),
        "conf-history" => conf_history(node, args),
        "participants" => participants(node, args),
        "leave-conf" => leave_conf(node, args).await,

        other => println!("unknown command '{other}', type 'help'"),
    }

    CommandOutcome::Continue
}

// ---------------------------------------------------------------------------
// Account commands
// ---------------------------------------------------------------------------

fn register(node: &MurmurNode, args: &[&str]) {
    if args.len() < 3 {
        println!("usage: register <username> <password> <full name...>");
        return;
    }
    let full_name = args[2..].join(" ");
    match node.register(args[0], args[1], &full_name) {
        Ok(user) => println!("registered '{}', you can now login", user.username),
        Err(e) => report(&e),
    }
}

async fn login(node: &MurmurNode, args: &[&str]) {
    if args.len() != 2 {
        println!("usage: login <username> <password>");
        return;
    }
    match node.login(args[0], args[1]).await {
        Ok(user) => println!("welcome back, {}!", user.full_name),
        Err(e) => report(&e),
    }
}

fn logout(node: &MurmurNode) {
    match node.auth().current_user() {
        Ok(user) => {
            node.logout();
            println!("logged out {}", user.username);
        }
        Err(e) => report(&e),
    }
}

fn whoami(node: &MurmurNode) {
    match node.auth().current_user() {
        Ok(user) => {
            println!("username:  {}", user.username);
            println!("full name: {}", user.full_name);
            println!("peer id:   {}", user.peer_id);
        }
        Err(e) => report(&e),
    }
}

fn passwd(node: &MurmurNode, args: &[&str]) {
    if args.len() != 2 {
        println!("usage: passwd <old-password> <new-password>");
        return;
    }
    match node.auth().change_password(args[0], args[1]) {
        Ok(()) => println!("password changed"),
        Err(e) => report(&e),
    }
}

fn search(node: &MurmurNode, args: &[&str]) {
    if args.is_empty() {
        println!("usage: search <name...>");
        return;
    }
    match node.auth().search_users(&args.join(" ")) {
        Ok(users) if users.is_empty() => println!("no users found"),
        Ok(users) => {
            for user in users {
                println!("  {} ({}) — {}", user.username, user.full_name, user.peer_id);
            }
        }
        Err(e) => report(&e),
    }
}

// ---------------------------------------------------------------------------
// Network commands
// ---------------------------------------------------------------------------

async fn addr(node: &MurmurNode) {
    match node.network().advertised_addresses().await {
        Ok(addrs) => {
            for addr in addrs {
                println!("  {addr}");
            }
        }
        Err(e) => report(&e),
    }
}

async fn connect(node: &MurmurNode, args: &[&str]) {
    if args.len() != 1 {
        println!("usage: connect <multiaddr>/p2p/<peer-id>");
        return;
    }
    match node.network().dial(args[0]).await {
        Ok(peer) => println!("connected to {peer}"),
        Err(e) => report(&e),
    }
}

fn peers(node: &MurmurNode) {
    let connected = node.network().connected_peers();
    if connected.is_empty() {
        println!("no connected peers");
        return;
    }
    for (peer, addr) in connected {
        println!("  {peer} @ {addr}");
    }
}

// ---------------------------------------------------------------------------
// Friend commands
// ---------------------------------------------------------------------------

async fn add_friend(node: &MurmurNode, args: &[&str]) {
    if args.len() != 1 {
        println!("usage: add-friend <peer-id>");
        return;
    }
    let peer = match parse_peer(args[0]) {
        Ok(peer) => peer,
        Err(e) => return report(&e),
    };
    match node.friends().send_request(peer).await {
        Ok(()) => println!("friend request sent"),
        Err(e) => report(&e),
    }
}

async fn accept(node: &MurmurNode, args: &[&str]) {
    if args.len() != 1 {
        println!("usage: accept <username>");
        return;
    }
    match node.friends().accept(args[0]).await {
        Ok(()) => println!("accepted friend request from {}", args[0]),
        Err(e) => report(&e),
    }
}

async fn reject(node: &MurmurNode, args: &[&str]) {
    if args.len() != 1 {
        println!("usage: reject <username>");
        return;
    }
    match node.friends().reject(args[0]).await {
        Ok(()) => println!("rejected friend request from {}", args[0]),
        Err(e) => report(&e),
    }
}

fn friends(node: &MurmurNode) {
    match node.friends().friends_with_presence() {
        Ok(list) if list.is_empty() => println!("no friends yet"),
        Ok(list) => {
            for (row, online) in list {
                let state = if online { "online" } else { "offline" };
                println!("  {} ({}) [{state}]", row.cached_username, row.cached_full_name);
            }
        }
        Err(e) => report(&e),
    }
}

fn requests(node: &MurmurNode) {
    match node.friends().pending_requests() {
        Ok(list) if list.is_empty() => println!("no pending requests"),
        Ok(list) => {
            for row in list {
                println!("  {} ({})", row.cached_username, row.cached_full_name);
            }
        }
        Err(e) => report(&e),
    }
}

// ---------------------------------------------------------------------------
// Message commands
// ---------------------------------------------------------------------------

async fn msg(node: &MurmurNode, args: &[&str]) {
    if args.len() < 2 {
        println!("usage: msg <username> <text...>");
        return;
    }
    match node.messages().send(args[0], &args[1..].join(" ")).await {
        Ok(_) => println!("message sent to {}", args[0]),
        Err(e) => report(&e),
    }
}

fn history(node: &MurmurNode, args: &[&str]) {
    if args.is_empty() {
        println!("usage: history <username> [limit]");
        return;
    }
    let limit = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(20);
    match node.messages().conversation(args[0], limit) {
        Ok(msgs) if msgs.is_empty() => println!("no messages with {}", args[0]),
        Ok(msgs) => {
            // Stored newest first; print oldest first.
            for msg in msgs.into_iter().rev() {
                let status = match (msg.delivered, msg.read) {
                    (_, true) => "read",
                    (true, false) => "delivered",
                    (false, false) => "queued",
                };
                println!(
                    "  [{}] ({status}) {}",
                    msg.created_at.format("%Y-%m-%d %H:%M:%S"),
                    msg.content
                );
            }
        }
        Err(e) => report(&e),
    }
}

fn unread(node: &MurmurNode) {
    match node.messages().unread_count() {
        Ok(count) => println!("{count} unread message(s)"),
        Err(e) => report(&e),
    }
}

async fn mark_read(node: &MurmurNode, args: &[&str]) {
    if args.len() != 1 {
        println!("usage: read <username>");
        return;
    }
    match node.messages().mark_conversation_read(args[0]).await {
        Ok(()) => println!("conversation with {} marked read", args[0]),
        Err(e) => report(&e),
    }
}

// ---------------------------------------------------------------------------
// Conference commands
// ---------------------------------------------------------------------------

async fn create_conf(node: &MurmurNode, args: &[&str]) {
    if args.is_empty() {
        println!("usage: create-conf <name...>");
        return;
    }
    match node.conferences().create(&args.join(" ")).await {
        Ok(conf) => println!("conference '{}' created (id {})", conf.name, conf.id),
        Err(e) => report(&e),
    }
}

async fn invite(node: &MurmurNode, args: &[&str]) {
    let (Some(id), Some(username)) = (args.first().and_then(|s| s.parse().ok()), args.get(1))
    else {
        println!("usage: invite <conf-id> <username>");
        return;
    };
    match node.conferences().invite(id, username).await {
        Ok(()) => println!("invited {username}"),
        Err(e) => report(&e),
    }
}

async fn join_conf(node: &MurmurNode, args: &[&str]) {
    let Some(id) = args.first().and_then(|s| s.parse().ok()) else {
        println!("usage: join-conf <conf-id>");
        return;
    };
    match node.conferences().join(id).await {
        Ok(conf) => println!("joined conference '{}'", conf.name),
        Err(e) => report(&e),
    }
}

async fn conf_msg(node: &MurmurNode, args: &[&str]) {
    let Some((first, rest)) = args.split_first() else {
        println!("usage: conf-msg <conf-id> <text...>");
        return;
    };
    let (Ok(id), false) = (first.parse::<i64>(), rest.is_empty()) else {
        println!("usage: conf-msg <conf-id> <text...>");
        return;
    };
    match node.conferences().send_message(id, &rest.join(" ")).await {
        Ok(()) => {}
        Err(e) => report(&e),
    }
}

fn confs(node: &MurmurNode) {
    match node.conferences().conferences() {
        Ok(list) if list.is_empty() => println!("no conferences"),
        Ok(list) => {
            for conf in list {
                println!("  {} — {}", conf.id, conf.name);
            }
        }
        Err(e) => report(&e),
    }
}

fn conf_history(node: &MurmurNode, args: &[&str]) {
    let Some(id) = args.first().and_then(|s| s.parse().ok()) else {
        println!("usage: conf-history <conf-id> [limit]");
        return;
    };
    let limit = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(20);
    match node.conferences().history(id, limit) {
        Ok(msgs) if msgs.is_empty() => println!("no messages in conference {id}"),
        Ok(msgs) => {
            for msg in msgs.into_iter().rev() {
                println!(
                    "  [{}] {}: {}",
                    msg.created_at.format("%H:%M:%S"),
                    msg.from_peer_id,
                    msg.content
                );
            }
        }
        Err(e) => report(&e),
    }
}

fn participants(node: &MurmurNode, args: &[&str]) {
    let Some(id) = args.first().and_then(|s| s.parse().ok()) else {
        println!("usage: participants <conf-id>");
        return;
    };
    match node.conferences().participants(id) {
        Ok(list) if list.is_empty() => println!("no active participants"),
        Ok(list) => {
            for p in list {
                println!("  {} (joined {})", p.cached_username, p.joined_at.format("%Y-%m-%d"));
            }
        }
        Err(e) => report(&e),
    }
}

async fn leave_conf(node: &MurmurNode, args: &[&str]) {
    let Some(id) = args.first().and_then(|s| s.parse().ok()) else {
        println!("usage: leave-conf <conf-id>");
        return;
    };
    match node.conferences().leave(id).await {
        Ok(()) => println!("left conference {id}"),
        Err(e) => report(&e),
    }
}

// ---------------------------------------------------------------------------
// Help
// ---------------------------------------------------------------------------

fn help() {
    println!("account:");
    println!("  register <username> <password> <full name...>");
    println!("  login <username> <password>      logout");
    println!("  whoami                           passwd <old> <new>");
    println!("  search <name...>");
    println!("network:");
    println!("  addr                             connect <multiaddr>");
    println!("  peers");
    println!("friends:");
    println!("  add-friend <peer-id>             accept <username>");
    println!("  reject <username>                friends");
    println!("  requests");
    println!("messages:");
    println!("  msg <username> <text...>         history <username> [limit]");
    println!("  unread                           read <username>");
    println!("conferences:");
    println!("  create-conf <name...>            invite <conf-id> <username>");
    println!("  join-conf <conf-id>              conf-msg <conf-id> <text...>");
    println!("  confs                            conf-history <conf-id> [limit]");
    println!("  participants <conf-id>           leave-conf <conf-id>");
    println!("other:");
    println!("  help                             quit");
}
