//! SQLite implementation of the [`Store`] trait.
//!
//! The schema is created on open if absent. The connection runs in WAL
//! mode so concurrent readers are not blocked by the writer; writes
//! from multiple tasks serialize on an internal mutex, held only for
//! the duration of one statement.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use murmur_types::{MurmurError, Result};

use crate::models::{
    Conference, ConferenceMessage, DirectMessage, FriendStatus, Friendship, KnownPeer,
    Participant, User,
};
use crate::Store;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    full_name     TEXT NOT NULL,
    peer_id       TEXT UNIQUE NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
CREATE INDEX IF NOT EXISTS idx_users_peer_id ON users(peer_id);

CREATE TABLE IF NOT EXISTS friendships (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user_id    INTEGER NOT NULL,
    other_user_id    INTEGER NOT NULL,
    other_peer_id    TEXT NOT NULL,
    cached_username  TEXT NOT NULL,
    cached_full_name TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    created_at       TEXT NOT NULL,
    accepted_at      TEXT,
    FOREIGN KEY(owner_user_id) REFERENCES users(id),
    UNIQUE(owner_user_id, other_user_id)
);

CREATE INDEX IF NOT EXISTS idx_friendships_owner ON friendships(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_friendships_status ON friendships(status);

CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    from_user_id INTEGER NOT NULL,
    to_user_id   INTEGER NOT NULL,
    from_peer_id TEXT NOT NULL,
    to_peer_id   TEXT NOT NULL,
    content      TEXT NOT NULL,
    delivered    INTEGER NOT NULL DEFAULT 0,
    read         INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    delivered_at TEXT,
    read_at      TEXT,
    FOREIGN KEY(from_user_id) REFERENCES users(id),
    FOREIGN KEY(to_user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_to_user ON messages(to_user_id);
CREATE INDEX IF NOT EXISTS idx_messages_delivered ON messages(delivered);

CREATE TABLE IF NOT EXISTS conferences (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    creator_user_id INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    FOREIGN KEY(creator_user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS conference_participants (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conference_id   INTEGER NOT NULL,
    user_id         INTEGER NOT NULL,
    peer_id         TEXT NOT NULL,
    cached_username TEXT NOT NULL,
    joined_at       TEXT NOT NULL,
    left_at         TEXT,
    active          INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(conference_id) REFERENCES conferences(id),
    FOREIGN KEY(user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_participants_conf ON conference_participants(conference_id);
CREATE INDEX IF NOT EXISTS idx_participants_user ON conference_participants(user_id);

CREATE TABLE IF NOT EXISTS conference_messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    conference_id INTEGER NOT NULL,
    from_user_id  INTEGER NOT NULL,
    from_peer_id  TEXT NOT NULL,
    content       TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    FOREIGN KEY(conference_id) REFERENCES conferences(id)
);

CREATE INDEX IF NOT EXISTS idx_conference_messages_conf ON conference_messages(conference_id);

CREATE TABLE IF NOT EXISTS known_peers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_id    TEXT UNIQUE NOT NULL,
    username   TEXT,
    addrs      TEXT,
    last_seen  TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_known_peers_peer_id ON known_peers(peer_id);
";

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// File-backed [`Store`] implementation.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`, creating parent
    /// directories and the schema as needed.
    ///
    /// # Errors
    ///
    /// Schema initialization failure is fatal for the caller — the
    /// node cannot run without a store.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                murmur_types::config::create_private_dir(dir)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| MurmurError::Storage {
            reason: format!("failed to open store at {}: {e}", path.display()),
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| MurmurError::Storage {
                reason: format!("failed to enable WAL mode: {e}"),
            })?;

        Self::from_connection(conn)
    }

    /// Opens an in-memory store. The schema is identical to the file
    /// variant; used by tests and available to embedders.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| MurmurError::Storage {
            reason: format!("failed to open in-memory store: {e}"),
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| MurmurError::Storage {
            reason: format!("failed to initialize schema: {e}"),
        })?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Runs `f` with the connection lock held.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| MurmurError::Storage {
            reason: "store lock poisoned".into(),
        })?;
        f(&conn).map_err(map_sqlite_err)
    }
}

/// Maps a rusqlite error onto the workspace taxonomy. Constraint
/// failures become `UniqueViolation` so callers can branch on them
/// without string matching.
fn map_sqlite_err(e: rusqlite::Error) -> MurmurError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MurmurError::UniqueViolation {
                reason: msg.clone().unwrap_or_else(|| "constraint violation".into()),
            }
        }
        _ => MurmurError::Storage { reason: e.to_string() },
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        full_name: row.get(3)?,
        peer_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_friendship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friendship> {
    let status: String = row.get(6)?;
    Ok(Friendship {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        other_user_id: row.get(2)?,
        other_peer_id: row.get(3)?,
        cached_username: row.get(4)?,
        cached_full_name: row.get(5)?,
        status: FriendStatus::parse(&status).unwrap_or(FriendStatus::Pending),
        created_at: row.get(7)?,
        accepted_at: row.get(8)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: row.get(0)?,
        from_user_id: row.get(1)?,
        to_user_id: row.get(2)?,
        from_peer_id: row.get(3)?,
        to_peer_id: row.get(4)?,
        content: row.get(5)?,
        delivered: row.get(6)?,
        read: row.get(7)?,
        created_at: row.get(8)?,
        delivered_at: row.get(9)?,
        read_at: row.get(10)?,
    })
}

fn map_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        conference_id: row.get(1)?,
        user_id: row.get(2)?,
        peer_id: row.get(3)?,
        cached_username: row.get(4)?,
        joined_at: row.get(5)?,
        left_at: row.get(6)?,
        active: row.get(7)?,
    })
}

const USER_COLS: &str = "id, username, password_hash, full_name, peer_id, created_at, updated_at";
const FRIEND_COLS: &str = "id, owner_user_id, other_user_id, other_peer_id, cached_username, \
                           cached_full_name, status, created_at, accepted_at";
const MSG_COLS: &str = "id, from_user_id, to_user_id, from_peer_id, to_peer_id, content, \
                        delivered, read, created_at, delivered_at, read_at";

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    // --- Users --------------------------------------------------------------

    fn create_user(&self, user: &mut User) -> Result<()> {
        let now = Utc::now();
        user.created_at = now;
        user.updated_at = now;
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, full_name, peer_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.username,
                    user.password_hash,
                    user.full_name,
                    user.peer_id,
                    user.created_at,
                    user.updated_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        user.id = id;
        Ok(())
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET username = ?1, password_hash = ?2, full_name = ?3,
                 peer_id = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    user.username,
                    user.password_hash,
                    user.full_name,
                    user.peer_id,
                    now,
                    user.id
                ],
            )?;
            Ok(())
        })
    }

    fn find_user_by_id(&self, id: i64) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .optional()
        })
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE username = ?1"),
                params![username],
                map_user,
            )
            .optional()
        })
    }

    fn find_user_by_peer_id(&self, peer_id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE peer_id = ?1"),
                params![peer_id],
                map_user,
            )
            .optional()
        })
    }

    fn search_users_by_fullname(&self, needle: &str) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLS} FROM users WHERE full_name LIKE ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![format!("%{needle}%")], map_user)?;
            rows.collect()
        })
    }

    // --- Friendships --------------------------------------------------------

    fn create_friendship(&self, row: &mut Friendship) -> Result<()> {
        row.created_at = Utc::now();
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friendships (owner_user_id, other_user_id, other_peer_id,
                 cached_username, cached_full_name, status, created_at, accepted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.owner_user_id,
                    row.other_user_id,
                    row.other_peer_id,
                    row.cached_username,
                    row.cached_full_name,
                    row.status.as_str(),
                    row.created_at,
                    row.accepted_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        row.id = id;
        Ok(())
    }

    fn find_friendship(&self, owner: i64, other: i64) -> Result<Option<Friendship>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {FRIEND_COLS} FROM friendships
                     WHERE owner_user_id = ?1 AND other_user_id = ?2"
                ),
                params![owner, other],
                map_friendship,
            )
            .optional()
        })
    }

    fn update_friendship(&self, row: &Friendship) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE friendships SET status = ?1, cached_username = ?2,
                 cached_full_name = ?3, accepted_at = ?4 WHERE id = ?5",
                params![
                    row.status.as_str(),
                    row.cached_username,
                    row.cached_full_name,
                    row.accepted_at,
                    row.id
                ],
            )?;
            Ok(())
        })
    }

    fn friends_of(&self, owner: i64) -> Result<Vec<Friendship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FRIEND_COLS} FROM friendships
                 WHERE owner_user_id = ?1 AND status = 'accepted' ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![owner], map_friendship)?;
            rows.collect()
        })
    }

    fn pending_requests_for(&self, owner: i64) -> Result<Vec<Friendship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FRIEND_COLS} FROM friendships
                 WHERE other_user_id = ?1 AND status = 'pending' ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![owner], map_friendship)?;
            rows.collect()
        })
    }

    // --- Direct messages ----------------------------------------------------

    fn save_direct_message(&self, msg: &mut DirectMessage) -> Result<()> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (from_user_id, to_user_id, from_peer_id, to_peer_id,
                 content, delivered, read, created_at, delivered_at, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    msg.from_user_id,
                    msg.to_user_id,
                    msg.from_peer_id,
                    msg.to_peer_id,
                    msg.content,
                    msg.delivered,
                    msg.read,
                    msg.created_at,
                    msg.delivered_at,
                    msg.read_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        msg.id = id;
        Ok(())
    }

    fn get_conversation(&self, a: i64, b: i64, limit: usize) -> Result<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MSG_COLS} FROM messages
                 WHERE (from_user_id = ?1 AND to_user_id = ?2)
                    OR (from_user_id = ?2 AND to_user_id = ?1)
                 ORDER BY created_at DESC, id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![a, b, limit as i64], map_message)?;
            rows.collect()
        })
    }

    fn get_undelivered(&self, owner: i64) -> Result<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MSG_COLS} FROM messages
                 WHERE to_user_id = ?1 AND delivered = 0
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![owner], map_message)?;
            rows.collect()
        })
    }

    fn mark_delivered(&self, id: i64) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET delivered = 1,
                 delivered_at = COALESCE(delivered_at, ?1) WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    fn mark_read(&self, id: i64) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET read = 1,
                 read_at = COALESCE(read_at, ?1) WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    fn count_unread(&self, owner: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE to_user_id = ?1 AND read = 0",
                params![owner],
                |row| row.get(0),
            )
        })
    }

    // --- Conferences --------------------------------------------------------

    fn create_conference(&self, conf: &mut Conference) -> Result<()> {
        conf.created_at = Utc::now();
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conferences (name, creator_user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![conf.name, conf.creator_user_id, conf.created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        conf.id = id;
        Ok(())
    }

    fn find_conference(&self, id: i64) -> Result<Option<Conference>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, creator_user_id, created_at FROM conferences WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Conference {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        creator_user_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    fn conferences_for_user(&self, user_id: i64) -> Result<Vec<Conference>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.creator_user_id, c.created_at
                 FROM conferences c
                 INNER JOIN conference_participants cp ON c.id = cp.conference_id
                 WHERE cp.user_id = ?1 AND cp.active = 1
                 ORDER BY c.id",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(Conference {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    creator_user_id: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    fn add_participant(&self, participant: &mut Participant) -> Result<()> {
        participant.joined_at = Utc::now();
        participant.active = true;
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conference_participants
                 (conference_id, user_id, peer_id, cached_username, joined_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    participant.conference_id,
                    participant.user_id,
                    participant.peer_id,
                    participant.cached_username,
                    participant.joined_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        participant.id = id;
        Ok(())
    }

    fn reactivate_participant(&self, conference_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conference_participants SET active = 1, left_at = NULL
                 WHERE conference_id = ?1 AND user_id = ?2 AND active = 0",
                params![conference_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    fn deactivate_participant(&self, conference_id: i64, user_id: i64) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conference_participants SET active = 0, left_at = ?1
                 WHERE conference_id = ?2 AND user_id = ?3 AND active = 1",
                params![now, conference_id, user_id],
            )?;
            Ok(())
        })
    }

    fn participants(&self, conference_id: i64) -> Result<Vec<Participant>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conference_id, user_id, peer_id, cached_username,
                        joined_at, left_at, active
                 FROM conference_participants
                 WHERE conference_id = ?1 AND active = 1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![conference_id], map_participant)?;
            rows.collect()
        })
    }

    fn save_conference_message(&self, msg: &mut ConferenceMessage) -> Result<()> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conference_messages
                 (conference_id, from_user_id, from_peer_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.conference_id,
                    msg.from_user_id,
                    msg.from_peer_id,
                    msg.content,
                    msg.created_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        msg.id = id;
        Ok(())
    }

    fn conference_messages(
        &self,
        conference_id: i64,
        limit: usize,
    ) -> Result<Vec<ConferenceMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conference_id, from_user_id, from_peer_id, content, created_at
                 FROM conference_messages
                 WHERE conference_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![conference_id, limit as i64], |row| {
                Ok(ConferenceMessage {
                    id: row.get(0)?,
                    conference_id: row.get(1)?,
                    from_user_id: row.get(2)?,
                    from_peer_id: row.get(3)?,
                    content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    // --- Known peers --------------------------------------------------------

    fn save_known_peer(&self, peer: &KnownPeer) -> Result<()> {
        let addrs = serde_json::to_string(&peer.addrs).map_err(|e| MurmurError::Storage {
            reason: format!("failed to serialize peer addrs: {e}"),
        })?;
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO known_peers (peer_id, username, addrs, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(peer_id) DO UPDATE SET
                     username = excluded.username,
                     addrs = excluded.addrs,
                     last_seen = excluded.last_seen",
                params![peer.peer_id, peer.username, addrs, peer.last_seen, now],
            )?;
            Ok(())
        })
    }

    fn known_peers(&self) -> Result<Vec<KnownPeer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, peer_id, username, addrs, last_seen, created_at
                 FROM known_peers ORDER BY last_seen DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                let addrs_json: Option<String> = row.get(3)?;
                let addrs = addrs_json
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default();
                Ok(KnownPeer {
                    id: row.get(0)?,
                    peer_id: row.get(1)?,
                    username: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    addrs,
                    last_seen: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::REMOTE_PLACEHOLDER;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn user(username: &str, peer_id: &str) -> User {
        User {
            id: 0,
            username: username.into(),
            password_hash: "$argon2id$test".into(),
            full_name: format!("{username} fullname"),
            peer_id: peer_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_user_assigns_id() {
        let store = store();
        let mut alice = user("alice", "peer-a");
        store.create_user(&mut alice).unwrap();
        assert!(alice.id > 0);

        let found = store.find_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert_eq!(found.peer_id, "peer-a");
    }

    #[test]
    fn duplicate_username_is_unique_violation() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();

        let mut dup = user("alice", "peer-b");
        match store.create_user(&mut dup) {
            Err(MurmurError::UniqueViolation { .. }) => {}
            other => panic!("expected UniqueViolation, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_peer_id_is_unique_violation() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();

        let mut dup = user("bob", "peer-a");
        assert!(matches!(
            store.create_user(&mut dup),
            Err(MurmurError::UniqueViolation { .. })
        ));
    }

    #[test]
    fn find_missing_user_is_none() {
        let store = store();
        assert!(store.find_user_by_username("ghost").unwrap().is_none());
        assert!(store.find_user_by_peer_id("nope").unwrap().is_none());
        assert!(store.find_user_by_id(42).unwrap().is_none());
    }

    #[test]
    fn placeholder_upgrade_in_place() {
        let store = store();
        let mut placeholder = User {
            password_hash: REMOTE_PLACEHOLDER.into(),
            ..user("unknown_peer-x", "peer-x")
        };
        store.create_user(&mut placeholder).unwrap();

        placeholder.username = "carol".into();
        placeholder.full_name = "Carol Real".into();
        store.update_user(&placeholder).unwrap();

        let found = store.find_user_by_peer_id("peer-x").unwrap().unwrap();
        assert_eq!(found.username, "carol");
        assert_eq!(found.full_name, "Carol Real");
        assert_eq!(found.id, placeholder.id);
        assert!(store.find_user_by_username("unknown_peer-x").unwrap().is_none());
    }

    #[test]
    fn fullname_search_is_case_insensitive() {
        let store = store();
        let mut a = user("alice", "peer-a");
        a.full_name = "Alice Wonder".into();
        store.create_user(&mut a).unwrap();

        let hits = store.search_users_by_fullname("wonder").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].username, "alice");

        assert!(store.search_users_by_fullname("xyz").unwrap().is_empty());
    }

    fn friendship(owner: i64, other: i64, status: FriendStatus) -> Friendship {
        Friendship {
            id: 0,
            owner_user_id: owner,
            other_user_id: other,
            other_peer_id: "peer".into(),
            cached_username: "friend".into(),
            cached_full_name: "Friend Name".into(),
            status,
            created_at: Utc::now(),
            accepted_at: None,
        }
    }

    #[test]
    fn duplicate_friendship_pair_rejected() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut row = friendship(1, 2, FriendStatus::Pending);
        store.create_friendship(&mut row).unwrap();
        assert!(row.id > 0);

        let mut dup = friendship(1, 2, FriendStatus::Pending);
        assert!(matches!(
            store.create_friendship(&mut dup),
            Err(MurmurError::UniqueViolation { .. })
        ));

        // The reverse direction is a distinct edge.
        let mut reverse = friendship(2, 1, FriendStatus::Pending);
        store.create_friendship(&mut reverse).unwrap();
    }

    #[test]
    fn friendship_transition_to_accepted() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut row = friendship(1, 2, FriendStatus::Pending);
        store.create_friendship(&mut row).unwrap();

        row.status = FriendStatus::Accepted;
        row.accepted_at = Some(Utc::now());
        store.update_friendship(&row).unwrap();

        let found = store.find_friendship(1, 2).unwrap().unwrap();
        assert_eq!(found.status, FriendStatus::Accepted);
        assert!(found.accepted_at.is_some());

        assert_eq!(store.friends_of(1).unwrap().len(), 1);
        assert!(store.friends_of(2).unwrap().is_empty());
    }

    #[test]
    fn pending_requests_are_addressed_to_owner() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut row = friendship(2, 1, FriendStatus::Pending);
        store.create_friendship(&mut row).unwrap();

        let pending = store.pending_requests_for(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner_user_id, 2);

        assert!(store.pending_requests_for(2).unwrap().is_empty());
    }

    fn message(from: i64, to: i64, content: &str) -> DirectMessage {
        DirectMessage {
            id: 0,
            from_user_id: from,
            to_user_id: to,
            from_peer_id: "peer-from".into(),
            to_peer_id: "peer-to".into(),
            content: content.into(),
            delivered: false,
            read: false,
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        }
    }

    #[test]
    fn conversation_returns_both_directions_newest_first() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut m1 = message(1, 2, "first");
        let mut m2 = message(2, 1, "second");
        let mut m3 = message(1, 2, "third");
        store.save_direct_message(&mut m1).unwrap();
        store.save_direct_message(&mut m2).unwrap();
        store.save_direct_message(&mut m3).unwrap();

        let convo = store.get_conversation(1, 2, 10).unwrap();
        assert_eq!(convo.len(), 3);
        assert_eq!(convo[0].content, "third");
        assert_eq!(convo[2].content, "first");

        let limited = store.get_conversation(1, 2, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn undelivered_are_oldest_first_and_scoped_to_recipient() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut m1 = message(1, 2, "a");
        let mut m2 = message(1, 2, "b");
        let mut m3 = message(2, 1, "c");
        store.save_direct_message(&mut m1).unwrap();
        store.save_direct_message(&mut m2).unwrap();
        store.save_direct_message(&mut m3).unwrap();

        let queue = store.get_undelivered(2).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].content, "a");

        store.mark_delivered(m1.id).unwrap();
        assert_eq!(store.get_undelivered(2).unwrap().len(), 1);
    }

    #[test]
    fn mark_delivered_is_idempotent() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut msg = message(1, 2, "hello");
        store.save_direct_message(&mut msg).unwrap();

        store.mark_delivered(msg.id).unwrap();
        let first = store.get_conversation(1, 2, 1).unwrap().remove(0);
        assert!(first.delivered);
        let stamp = first.delivered_at.unwrap();

        store.mark_delivered(msg.id).unwrap();
        let second = store.get_conversation(1, 2, 1).unwrap().remove(0);
        // The original timestamp is kept on repeat calls.
        assert_eq!(second.delivered_at.unwrap(), stamp);
    }

    #[test]
    fn mark_read_sets_flag_and_timestamp() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();
        let mut b = user("bob", "peer-b");
        store.create_user(&mut b).unwrap();

        let mut msg = message(1, 2, "hello");
        store.save_direct_message(&mut msg).unwrap();
        assert_eq!(store.count_unread(2).unwrap(), 1);

        store.mark_read(msg.id).unwrap();
        store.mark_read(msg.id).unwrap();

        let row = store.get_conversation(1, 2, 1).unwrap().remove(0);
        assert!(row.read);
        assert!(row.read_at.is_some());
        assert_eq!(store.count_unread(2).unwrap(), 0);
    }

    #[test]
    fn conference_lifecycle() {
        let store = store();
        let mut a = user("alice", "peer-a");
        store.create_user(&mut a).unwrap();

        let mut conf = Conference {
            id: 0,
            name: "study".into(),
            creator_user_id: 1,
            created_at: Utc::now(),
        };
        store.create_conference(&mut conf).unwrap();
        assert!(conf.id > 0);

        let mut creator = Participant {
            id: 0,
            conference_id: conf.id,
            user_id: 1,
            peer_id: "peer-a".into(),
            cached_username: "alice".into(),
            joined_at: Utc::now(),
            left_at: None,
            active: true,
        };
        store.add_participant(&mut creator).unwrap();

        assert_eq!(store.participants(conf.id).unwrap().len(), 1);
        assert_eq!(store.conferences_for_user(1).unwrap().len(), 1);

        store.deactivate_participant(conf.id, 1).unwrap();
        assert!(store.participants(conf.id).unwrap().is_empty());
        assert!(store.conferences_for_user(1).unwrap().is_empty());

        // Rejoin reactivates the existing row instead of duplicating it.
        assert!(store.reactivate_participant(conf.id, 1).unwrap());
        let active = store.participants(conf.id).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].left_at.is_none());

        // Reactivating an already active row is a no-op.
        assert!(!store.reactivate_participant(conf.id, 1).unwrap());
    }

    #[test]
    fn conference_messages_keep_sender_timestamp() {
        let store = store();
        let mut creator = user("alice", "peer-a");
        store.create_user(&mut creator).unwrap();
        let mut conf = Conference {
            id: 0,
            name: "study".into(),
            creator_user_id: creator.id,
            created_at: Utc::now(),
        };
        store.create_conference(&mut conf).unwrap();

        let sent_at = Utc::now() - chrono::Duration::minutes(5);
        let mut msg = ConferenceMessage {
            id: 0,
            conference_id: conf.id,
            from_user_id: 0,
            from_peer_id: "peer-b".into(),
            content: "hi all".into(),
            created_at: sent_at,
        };
        store.save_conference_message(&mut msg).unwrap();

        let history = store.conference_messages(conf.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].created_at, sent_at);
        assert_eq!(history[0].from_user_id, 0);
    }

    #[test]
    fn known_peer_upsert_keeps_one_row() {
        let store = store();
        let peer = KnownPeer {
            id: 0,
            peer_id: "12D3KooWpeer".into(),
            username: "alice".into(),
            addrs: vec!["/ip4/127.0.0.1/tcp/9999".into()],
            last_seen: Utc::now(),
            created_at: Utc::now(),
        };
        store.save_known_peer(&peer).unwrap();

        let updated = KnownPeer {
            username: "alice2".into(),
            last_seen: Utc::now(),
            ..peer
        };
        store.save_known_peer(&updated).unwrap();

        let peers = store.known_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].username, "alice2");
        assert_eq!(peers[0].addrs.len(), 1);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("murmur.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut alice = user("alice", "peer-a");
            store.create_user(&mut alice).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.find_user_by_username("alice").unwrap().is_some());
    }
}
