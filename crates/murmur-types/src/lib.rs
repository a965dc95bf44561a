//! Core shared types for the Murmur decentralized messaging node.
//!
//! This crate defines the error taxonomy and application configuration
//! used across the workspace. No other crate should define shared
//! error variants — everything lives here.

pub mod config;

use thiserror::Error;

// ---------------------------------------------------------------------------
// MurmurError
// ---------------------------------------------------------------------------

/// Central error type for the Murmur system.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum. Shell-facing errors are the *input* variants
/// (each maps to a single-line diagnostic); *transient* variants are
/// logged and the operation abandoned; storage and network variants
/// bubble up to the caller.
#[derive(Debug, Error)]
pub enum MurmurError {
    // --- Input errors (user-visible, recoverable) --------------------------
    /// A peer address string could not be parsed or lacks a peer id.
    #[error("invalid address: {reason}")]
    InvalidAddress {
        /// Why the address is invalid.
        reason: String,
    },

    /// A requested entity does not exist.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up (e.g. "user", "conference").
        what: String,
    },

    /// The entity exists but is not in a state that permits the operation.
    #[error("wrong state: {reason}")]
    WrongState {
        /// Description of the state conflict.
        reason: String,
    },

    /// A friend request was sent to a user who is already a friend.
    #[error("already friends")]
    AlreadyFriends,

    /// A friend request to this target is already pending.
    #[error("friend request already pending")]
    DuplicateRequest,

    /// A friend request was addressed to the local user itself.
    #[error("cannot add yourself as a friend")]
    CannotAddSelf,

    /// The operation requires an accepted friendship that does not exist.
    #[error("not friends with {username}")]
    NotFriends {
        /// The other user's username.
        username: String,
    },

    /// The operation requires the remote peer to be connected.
    #[error("{username} is not online")]
    NotOnline {
        /// The offline user's username.
        username: String,
    },

    /// The user is already an active participant of the conference.
    #[error("already a participant of this conference")]
    AlreadyIn,

    /// Publishing requires an open topic handle for the conference.
    #[error("not subscribed to conference {conference_id}")]
    NotSubscribed {
        /// The conference whose topic is not held.
        conference_id: i64,
    },

    /// A required input field is missing or malformed.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Which field and why.
        reason: String,
    },

    /// The supplied password does not meet the minimum requirements.
    #[error("password must be at least {min} characters")]
    WeakPassword {
        /// Minimum accepted length.
        min: usize,
    },

    /// An insert collided with a uniqueness constraint.
    #[error("unique constraint violated: {reason}")]
    UniqueViolation {
        /// The colliding column or key.
        reason: String,
    },

    /// The operation requires an active session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Login or change-password was given a wrong password.
    #[error("invalid password")]
    InvalidPassword,

    // --- Transient errors (logged, caller may retry) -----------------------
    /// A dial or connection attempt failed.
    #[error("peer unreachable: {reason}")]
    Unreachable {
        /// Underlying transport failure.
        reason: String,
    },

    /// A stream was requested to a peer with no open connection.
    #[error("no open connection to peer {peer}")]
    NotConnected {
        /// The peer id that is not connected.
        peer: String,
    },

    /// The remote peer does not speak the requested protocol.
    #[error("peer does not support protocol {protocol}")]
    ProtocolUnsupported {
        /// The rejected protocol identifier.
        protocol: String,
    },

    // --- Infrastructure errors ---------------------------------------------
    /// A storage operation failed.
    #[error("storage error: {reason}")]
    Storage {
        /// Underlying database failure.
        reason: String,
    },

    /// A networking operation failed.
    #[error("network error: {reason}")]
    Network {
        /// Underlying swarm or transport failure.
        reason: String,
    },

    /// An inbound payload could not be decoded.
    #[error("decode error: {reason}")]
    Decode {
        /// What failed to parse.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// The offending value.
        reason: String,
    },

    /// The feature is a documented stub.
    #[error("not implemented: {reason}")]
    NotImplemented {
        /// Which stub was hit.
        reason: String,
    },
}

impl MurmurError {
    /// Returns `true` for errors the shell should show as a one-line
    /// diagnostic rather than a failure (spec'd input errors).
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::NotFound { .. }
                | Self::WrongState { .. }
                | Self::AlreadyFriends
                | Self::DuplicateRequest
                | Self::CannotAddSelf
                | Self::NotFriends { .. }
                | Self::NotOnline { .. }
                | Self::AlreadyIn
                | Self::NotSubscribed { .. }
                | Self::InvalidInput { .. }
                | Self::WeakPassword { .. }
                | Self::UniqueViolation { .. }
                | Self::NotAuthenticated
                | Self::InvalidPassword
        )
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`MurmurError`].
pub type Result<T> = std::result::Result<T, MurmurError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
