//! The current logged-in user cell.
//!
//! A single writable cell holding the session user id (`0` = none).
//! The engines consult it so their stream handlers know whose inbox
//! incoming traffic belongs to. It is a field on the node wiring, not
//! a process-global.

use std::sync::atomic::{AtomicI64, Ordering};

use murmur_types::{MurmurError, Result};

/// Shared session state.
#[derive(Debug, Default)]
pub struct Session {
    user_id: AtomicI64,
}

impl Session {
    /// Creates an inactive session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates the session for `user_id`.
    pub fn set(&self, user_id: i64) {
        self.user_id.store(user_id, Ordering::SeqCst);
    }

    /// Deactivates the session.
    pub fn clear(&self) {
        self.user_id.store(0, Ordering::SeqCst);
    }

    /// The current user id, `0` when logged out.
    pub fn current_user_id(&self) -> i64 {
        self.user_id.load(Ordering::SeqCst)
    }

    /// Whether a user is logged in.
    pub fn is_active(&self) -> bool {
        self.current_user_id() != 0
    }

    /// The current user id, or `NotAuthenticated`.
    pub fn require(&self) -> Result<i64> {
        match self.current_user_id() {
            0 => Err(MurmurError::NotAuthenticated),
            id => Ok(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_logged_out() {
        let session = Session::new();
        assert!(!session.is_active());
        assert!(session.require().is_err());
    }

    #[test]
    fn login_logout_cycle() {
        let session = Session::new();
        session.set(7);
        assert!(session.is_active());
        assert_eq!(session.require().unwrap(), 7);

        session.clear();
        assert_eq!(session.current_user_id(), 0);
        assert!(matches!(session.require(), Err(MurmurError::NotAuthenticated)));
    }
}
