//! Local account management.
//!
//! A thin layer over the store that gates engine operations: register,
//! login, logout, password changes, and user search. Passwords are
//! hashed with Argon2id; placeholder rows carry a sentinel that never
//! verifies, so they cannot be used for local login.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

use murmur_storage::{Store, User};
use murmur_types::{MurmurError, Result};

use crate::session::Session;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Account registration and session management.
pub struct AuthService {
    store: Arc<dyn Store>,
    session: Arc<Session>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, session: Arc<Session>) -> Self {
        Self { store, session }
    }

    /// Creates a local account.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` on empty username, password, or full name.
    /// - `WeakPassword` below [`MIN_PASSWORD_LEN`].
    /// - `UniqueViolation` if the username or peer id is taken.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        full_name: &str,
        peer_id: &str,
    ) -> Result<User> {
        if username.is_empty() {
            return Err(MurmurError::InvalidInput { reason: "username is required".into() });
        }
        if password.is_empty() {
            return Err(MurmurError::InvalidInput { reason: "password is required".into() });
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(MurmurError::WeakPassword { min: MIN_PASSWORD_LEN });
        }
        if full_name.is_empty() {
            return Err(MurmurError::InvalidInput { reason: "full name is required".into() });
        }
        if peer_id.is_empty() {
            return Err(MurmurError::InvalidInput { reason: "peer id is required".into() });
        }

        let mut user = User {
            id: 0,
            username: username.into(),
            password_hash: hash_password(password)?,
            full_name: full_name.into(),
            peer_id: peer_id.into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        self.store.create_user(&mut user)?;
        Ok(user)
    }

    /// Verifies credentials and activates the session.
    ///
    /// On success the user's peer id is updated to `node_peer_id`
    /// (the node identity may have rotated since last run) and the
    /// row persisted.
    pub fn login(&self, username: &str, password: &str, node_peer_id: &str) -> Result<User> {
        let mut user = self
            .store
            .find_user_by_username(username)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })?;

        // Placeholder rows carry a sentinel that is not a valid hash,
        // so they fail verification like any wrong password.
        if !verify_password(&user.password_hash, password) {
            return Err(MurmurError::InvalidPassword);
        }

        if user.peer_id != node_peer_id {
            user.peer_id = node_peer_id.to_string();
            self.store.update_user(&user)?;
        }

        self.session.set(user.id);
        Ok(user)
    }

    /// Deactivates the session.
    pub fn logout(&self) {
        self.session.clear();
    }

    /// The logged-in user's row.
    pub fn current_user(&self) -> Result<User> {
        let user_id = self.session.require()?;
        self.store
            .find_user_by_id(user_id)?
            .ok_or_else(|| MurmurError::NotFound { what: "user".into() })
    }

    /// Rotates the password after verifying the old one.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        let mut user = self.current_user()?;

        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(MurmurError::WeakPassword { min: MIN_PASSWORD_LEN });
        }
        if !verify_password(&user.password_hash, old_password) {
            return Err(MurmurError::InvalidPassword);
        }

        user.password_hash = hash_password(new_password)?;
        self.store.update_user(&user)
    }

    /// Case-insensitive substring search over full names. Requires an
    /// active session.
    pub fn search_users(&self, name: &str) -> Result<Vec<User>> {
        self.session.require()?;
        self.store.search_users_by_fullname(name)
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| MurmurError::Storage {
            reason: format!("failed to hash password: {e}"),
        })
}

fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_storage::{SqliteStore, REMOTE_PLACEHOLDER};

    fn service() -> AuthService {
        AuthService::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(Session::new()),
        )
    }

    #[test]
    fn register_then_login_roundtrip() {
        let auth = service();
        let registered = auth
            .register("alice", "correct horse", "Alice Wonder", "12D3KooWOld")
            .unwrap();
        assert!(registered.id > 0);

        // Login rotates the peer id to the current node identity.
        let user = auth.login("alice", "correct horse", "12D3KooWNew").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.full_name, "Alice Wonder");
        assert_eq!(user.peer_id, "12D3KooWNew");
        assert_eq!(auth.current_user().unwrap().id, user.id);
    }

    #[test]
    fn short_password_rejected() {
        let auth = service();
        assert!(matches!(
            auth.register("alice", "short", "Alice", "12D3"),
            Err(MurmurError::WeakPassword { .. })
        ));
    }

    #[test]
    fn empty_fields_rejected() {
        let auth = service();
        assert!(auth.register("", "long enough", "Alice", "12D3").is_err());
        assert!(auth.register("alice", "long enough", "", "12D3").is_err());
        assert!(auth.register("alice", "long enough", "Alice", "").is_err());
    }

    #[test]
    fn duplicate_username_rejected() {
        let auth = service();
        auth.register("alice", "long enough", "Alice", "12D3a").unwrap();
        assert!(matches!(
            auth.register("alice", "long enough", "Alice Two", "12D3b"),
            Err(MurmurError::UniqueViolation { .. })
        ));
    }

    #[test]
    fn wrong_password_rejected() {
        let auth = service();
        auth.register("alice", "long enough", "Alice", "12D3").unwrap();
        assert!(matches!(
            auth.login("alice", "wrong password", "12D3"),
            Err(MurmurError::InvalidPassword)
        ));
        assert!(matches!(
            auth.login("nobody", "long enough", "12D3"),
            Err(MurmurError::NotFound { .. })
        ));
    }

    #[test]
    fn placeholder_rows_cannot_login() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let auth = AuthService::new(Arc::clone(&store), Arc::new(Session::new()));

        let mut placeholder = User {
            id: 0,
            username: "unknown_12D3".into(),
            password_hash: REMOTE_PLACEHOLDER.into(),
            full_name: "Unknown User".into(),
            peer_id: "12D3".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        store.create_user(&mut placeholder).unwrap();

        assert!(matches!(
            auth.login("unknown_12D3", REMOTE_PLACEHOLDER, "12D3"),
            Err(MurmurError::InvalidPassword)
        ));
    }

    #[test]
    fn change_password_requires_old_one() {
        let auth = service();
        auth.register("alice", "long enough", "Alice", "12D3").unwrap();
        auth.login("alice", "long enough", "12D3").unwrap();

        assert!(matches!(
            auth.change_password("wrong", "another long one"),
            Err(MurmurError::InvalidPassword)
        ));
        auth.change_password("long enough", "another long one").unwrap();

        auth.logout();
        assert!(auth.login("alice", "long enough", "12D3").is_err());
        auth.login("alice", "another long one", "12D3").unwrap();
    }

    #[test]
    fn search_requires_session() {
        let auth = service();
        auth.register("alice", "long enough", "Alice Wonder", "12D3").unwrap();
        assert!(matches!(
            auth.search_users("alice"),
            Err(MurmurError::NotAuthenticated)
        ));

        auth.login("alice", "long enough", "12D3").unwrap();
        assert_eq!(auth.search_users("wonder").unwrap().len(), 1);
    }
}
