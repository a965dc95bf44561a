//! Persistent node identity.
//!
//! The keypair is generated on first run and stored in the data
//! directory, keyed by the listen port so several nodes can share one
//! machine. The peer id is the standard libp2p derivation from the
//! public key.

use std::path::{Path, PathBuf};

use libp2p::{identity, PeerId};

use murmur_types::{MurmurError, Result};

/// Returns the identity file path for a given data dir and port.
pub fn identity_path(data_dir: &Path, port: u16) -> PathBuf {
    data_dir.join(format!("identity_{port}.key"))
}

/// Loads the node keypair from the data directory, generating and
/// persisting a fresh ed25519 keypair on first run.
///
/// The key file is written with owner-only permissions on Unix.
pub fn load_or_generate(data_dir: &Path, port: u16) -> Result<identity::Keypair> {
    let path = identity_path(data_dir, port);

    if path.exists() {
        let bytes = std::fs::read(&path).map_err(|e| MurmurError::Config {
            reason: format!("failed to read identity file {}: {e}", path.display()),
        })?;
        return identity::Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
            MurmurError::Config {
                reason: format!("corrupt identity file {}: {e}", path.display()),
            }
        });
    }

    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| MurmurError::Config {
            reason: format!("failed to encode identity: {e}"),
        })?;

    murmur_types::config::create_private_dir(data_dir)?;
    std::fs::write(&path, encoded).map_err(|e| MurmurError::Config {
        reason: format!("failed to write identity file {}: {e}", path.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&path, perms);
    }

    tracing::info!(path = %path.display(), "generated new node identity");
    Ok(keypair)
}

/// Derives the peer id for a keypair.
pub fn peer_id(keypair: &identity::Keypair) -> PeerId {
    PeerId::from(keypair.public())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let kp1 = load_or_generate(tmp.path(), 9999).unwrap();
        let kp2 = load_or_generate(tmp.path(), 9999).unwrap();
        assert_eq!(peer_id(&kp1), peer_id(&kp2));
        assert!(identity_path(tmp.path(), 9999).exists());
    }

    #[test]
    fn different_ports_get_different_identities() {
        let tmp = tempfile::tempdir().unwrap();
        let kp1 = load_or_generate(tmp.path(), 9999).unwrap();
        let kp2 = load_or_generate(tmp.path(), 9998).unwrap();
        assert_ne!(peer_id(&kp1), peer_id(&kp2));
    }

    #[cfg(unix)]
    #[test]
    fn identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        load_or_generate(tmp.path(), 7777).unwrap();
        let mode = std::fs::metadata(identity_path(tmp.path(), 7777))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
