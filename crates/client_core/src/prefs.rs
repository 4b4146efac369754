//! Local preference storage for the user's identity. The sync engine never
//! reads this; the application resolves an [`Identity`] here and passes it
//! into session start explicitly.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use shared::domain::{Identity, UserId};

/// Nickname value meaning "the user never introduced themselves".
pub const PLACEHOLDER_NICKNAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub user_id: String,
    pub nickname: String,
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>>;
    fn store(&self, identity: &StoredIdentity) -> Result<()>;
}

/// One JSON file on disk.
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read preferences at {}", self.path.display()))?;
        let stored = serde_json::from_str(&raw)
            .with_context(|| format!("invalid preferences file at {}", self.path.display()))?;
        Ok(Some(stored))
    }

    fn store(&self, identity: &StoredIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create preference directory {}", parent.display())
                })?;
            }
        }
        let raw = serde_json::to_string_pretty(identity)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write preferences at {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    /// Stored identity is complete; a session can start with it.
    Ready(Identity),
    /// The caller must collect a nickname before starting a session.
    NicknameRequired(Identity),
}

/// Stored-identity policy: a first run mints and persists a user id with the
/// placeholder nickname, and the placeholder (or an empty nickname) forces a
/// prompt until the user replaces it.
pub fn resolve_identity(store: &dyn PreferenceStore) -> Result<IdentityResolution> {
    match store.load()? {
        Some(stored) => {
            let identity = Identity {
                user_id: UserId(stored.user_id),
                nickname: stored.nickname,
            };
            if identity.nickname.trim().is_empty() || identity.nickname == PLACEHOLDER_NICKNAME {
                Ok(IdentityResolution::NicknameRequired(identity))
            } else {
                Ok(IdentityResolution::Ready(identity))
            }
        }
        None => {
            let stored = StoredIdentity {
                user_id: generate_user_id(),
                nickname: PLACEHOLDER_NICKNAME.to_string(),
            };
            store.store(&stored)?;
            Ok(IdentityResolution::NicknameRequired(Identity {
                user_id: UserId(stored.user_id),
                nickname: stored.nickname,
            }))
        }
    }
}

fn generate_user_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| (byte as char).to_ascii_lowercase())
        .collect();
    format!("user_{suffix}")
}
