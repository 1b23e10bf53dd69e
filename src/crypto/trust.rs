//! Trust policies deciding which public keys may join the mesh.
//!
//! A policy is a strategy object handed to the mesh at construction. It is
//! consulted once per newly seen key, after the key's signature has verified
//! and before the peer is admitted to the registry.

use crate::crypto::constant_time_equal;
use crate::utils::{ConfigError, Result, TrustConfig, TrustMode};
use base64::{engine::general_purpose, Engine};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Approves or rejects a claimed public key
pub trait TrustPolicy: Send + Sync {
    /// Returns true if `public_key` may join the mesh
    fn approve(&self, public_key: &[u8]) -> bool;
}

/// Admits every key. Only sensible on an isolated network or in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl TrustPolicy for AllowAll {
    fn approve(&self, _public_key: &[u8]) -> bool {
        true
    }
}

/// A fixed list of trusted keys, usually loaded from a flat file
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    keys: Vec<Vec<u8>>,
}

impl TrustList {
    /// Trust exactly the given keys
    pub fn from_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        Self {
            keys: keys.into_iter().map(|k| k.as_ref().to_vec()).collect(),
        }
    }

    /// Load a file with one base64 encoded key per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let keys = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| general_purpose::STANDARD.decode(line))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        log::debug!("Loaded {} trusted keys from {}", keys.len(), path.display());
        Ok(Self { keys })
    }

    /// Number of trusted keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TrustPolicy for TrustList {
    fn approve(&self, public_key: &[u8]) -> bool {
        // No short-circuit so the position of a match is not observable
        self.keys
            .iter()
            .fold(false, |found, key| found | constant_time_equal(key, public_key))
    }
}

/// Scans a directory of key files on every decision, so keys dropped into
/// the directory take effect without a restart.
///
/// Each regular file holds one key, either as raw bytes or base64 text.
#[derive(Debug, Clone)]
pub struct TrustDirectory {
    dir: PathBuf,
}

impl TrustDirectory {
    /// Watch `dir` for trusted key files
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn scan(&self) -> std::io::Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let raw = std::fs::read(&path)?;
            let text = String::from_utf8_lossy(&raw);
            match general_purpose::STANDARD.decode(text.trim()) {
                Ok(decoded) => keys.push(decoded),
                Err(_) => keys.push(raw),
            }
        }
        Ok(keys)
    }
}

impl TrustPolicy for TrustDirectory {
    fn approve(&self, public_key: &[u8]) -> bool {
        match self.scan() {
            Ok(keys) => TrustList { keys }.approve(public_key),
            Err(e) => {
                log::warn!("Cannot scan trust directory {}: {}", self.dir.display(), e);
                false
            }
        }
    }
}

/// Build the policy selected by configuration
pub fn from_config(config: &TrustConfig) -> Result<Arc<dyn TrustPolicy>> {
    let path = || {
        config.path.clone().ok_or_else(|| ConfigError::MissingField {
            field: "trust.path".to_string(),
        })
    };

    Ok(match config.mode {
        TrustMode::AllowAll => Arc::new(AllowAll),
        TrustMode::File => Arc::new(TrustList::from_file(path()?)?),
        TrustMode::Directory => Arc::new(TrustDirectory::new(path()?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use std::io::Write;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.approve(&[1, 2, 3]));
        assert!(AllowAll.approve(&[]));
    }

    #[test]
    fn test_trust_list() {
        let trusted = Identity::generate();
        let stranger = Identity::generate();
        let list = TrustList::from_keys([trusted.public_key_bytes()]);

        assert!(list.approve(&trusted.public_key_bytes()));
        assert!(!list.approve(&stranger.public_key_bytes()));
        assert!(!list.approve(&trusted.public_key_bytes()[..16]));
    }

    #[test]
    fn test_trust_list_from_file() {
        let trusted = Identity::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# team keys").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            "{}",
            general_purpose::STANDARD.encode(trusted.public_key_bytes())
        )
        .unwrap();

        let list = TrustList::from_file(file.path()).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.approve(&trusted.public_key_bytes()));
    }

    #[test]
    fn test_trust_list_rejects_garbage_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not base64 !!!").unwrap();
        assert!(TrustList::from_file(file.path()).is_err());
    }

    #[test]
    fn test_trust_directory_picks_up_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let policy = TrustDirectory::new(dir.path());
        let alice = Identity::generate();
        let bob = Identity::generate();

        assert!(!policy.approve(&alice.public_key_bytes()));

        std::fs::write(
            dir.path().join("alice.pub"),
            general_purpose::STANDARD.encode(alice.public_key_bytes()),
        )
        .unwrap();
        std::fs::write(dir.path().join("bob.bin"), bob.public_key_bytes()).unwrap();

        assert!(policy.approve(&alice.public_key_bytes()));
        assert!(policy.approve(&bob.public_key_bytes()));
    }

    #[test]
    fn test_missing_directory_rejects() {
        let policy = TrustDirectory::new("/nonexistent/lan-mesh/trusted");
        assert!(!policy.approve(&[0u8; 32]));
    }

    #[test]
    fn test_from_config() {
        let config = TrustConfig {
            mode: TrustMode::AllowAll,
            path: None,
        };
        assert!(from_config(&config).unwrap().approve(b"anything"));

        let config = TrustConfig {
            mode: TrustMode::File,
            path: None,
        };
        assert!(from_config(&config).is_err());
    }
}
