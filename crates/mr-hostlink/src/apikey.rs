//! API key persistence.
//!
//! The key is a 32-hex-character token generated with a CSPRNG on first
//! run and stored in the user's home directory. `POST /access/api_key`
//! regenerates it.

use std::path::{Path, PathBuf};

pub const API_KEY_FILE: &str = ".klippy_api_key";

pub struct ApiKeyStore {
    path: PathBuf,
}

impl ApiKeyStore {
    /// Store the key file inside `dir`.
    pub fn new(dir: &Path) -> Self {
        ApiKeyStore {
            path: dir.join(API_KEY_FILE),
        }
    }

    /// Store at the default location, `~/.klippy_api_key`.
    pub fn in_home() -> Option<Self> {
        dirs::home_dir().map(|home| ApiKeyStore::new(&home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted key, creating one on first run.
    pub fn read_or_create(&self) -> std::io::Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(key) => Ok(key.trim().to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no API key file found, creating a new one");
                self.regenerate()
            }
            Err(e) => Err(e),
        }
    }

    /// Mint and persist a fresh key.
    pub fn regenerate(&self) -> std::io::Result<String> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        std::fs::write(&self.path, &key)?;
        Ok(key)
    }
}
