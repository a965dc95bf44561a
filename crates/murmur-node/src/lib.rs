//! Murmur protocol engines and node wiring.
//!
//! The engines implement the peer messaging semantics on top of the
//! store and the transport node:
//!
//! - [`session`] — the current logged-in user cell
//! - [`auth`] — registration, login, password changes, user search
//! - [`wire`] — protocol identifiers and the line-JSON stream codec
//! - [`friends`] — friend request state machine with reciprocal edges
//! - [`messages`] — 1-to-1 messaging with offline queueing and acks
//! - [`conference`] — gossip-backed group chat
//! - [`notifications`] — user-visible events for the shell
//! - [`node`] — assembles everything into a running [`MurmurNode`](node::MurmurNode)

pub mod auth;
pub mod conference;
pub mod friends;
pub mod messages;
pub mod node;
pub mod notifications;
pub mod session;
pub mod wire;

pub use node::MurmurNode;
pub use notifications::Notification;
pub use session::Session;
