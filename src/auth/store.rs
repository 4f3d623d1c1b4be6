//! Persistent credential store for dynamically minted client keys.
//!
//! Records live in a JSON file keyed by `client_id`. The bearer wire
//! format is `{client_id}.{secret}`: the id selects the record, the
//! secret is verified against its bcrypt hash. The plaintext secret is
//! produced exactly once at mint time.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::{AuthenticatedClient, ClientKey, Permission};
use crate::secret::SecretString;
use crate::tenant::RateLimits;

/// Bcrypt work factor for key secrets.
const BCRYPT_COST: u32 = 12;

/// The one-time mint result handed to the operator.
pub struct MintedKey {
    pub client_id: String,
    /// Full bearer token (`client_id.secret`). Shown once, never stored.
    pub bearer: SecretString,
    pub key: ClientKey,
}

pub struct CredentialStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, ClientKey>>,
}

impl CredentialStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: PathBuf) -> Result<Self> {
        let keys = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read credential store {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid credential store {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    /// Mint a new client key with a fresh high-entropy secret.
    pub fn mint(
        &self,
        client_name: &str,
        permissions: Vec<Permission>,
        rate_limits: RateLimits,
    ) -> Result<MintedKey> {
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let client_id = format!("ck_{}", hex_encode(&id_bytes));

        let mut secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = URL_SAFE_NO_PAD.encode(secret_bytes);

        let hashed_secret =
            bcrypt::hash(&secret, BCRYPT_COST).context("failed to hash key secret")?;

        let key = ClientKey {
            client_id: client_id.clone(),
            client_name: client_name.to_string(),
            hashed_secret,
            permissions,
            rate_limits,
            created_at: chrono::Utc::now(),
            last_used_at: None,
            revoked: false,
        };

        {
            let mut keys = self.keys.write().expect("credential store lock poisoned");
            keys.insert(client_id.clone(), key.clone());
        }
        self.persist()?;

        Ok(MintedKey {
            bearer: SecretString::new(format!("{client_id}.{secret}")),
            client_id,
            key,
        })
    }

    /// Verify a bearer token. Returns the authenticated identity on
    /// success; all failure modes collapse to `None`.
    pub fn verify(&self, bearer: &str) -> Option<AuthenticatedClient> {
        let (client_id, secret) = bearer.split_once('.')?;
        let keys = self.keys.read().expect("credential store lock poisoned");
        let key = keys.get(client_id)?;
        if key.revoked {
            return None;
        }
        match bcrypt::verify(secret, &key.hashed_secret) {
            Ok(true) => Some(AuthenticatedClient {
                client_id: key.client_id.clone(),
                client_name: key.client_name.clone(),
                permissions: key.permissions.clone(),
                rate_limits: key.rate_limits,
            }),
            Ok(false) => None,
            Err(e) => {
                warn!(client_id, error = %e, "bcrypt verification error");
                None
            }
        }
    }

    /// Best-effort `last_used_at` update. The in-memory record changes
    /// immediately; the file write happens off the auth path and its
    /// failures only log.
    pub fn touch_last_used(self: &std::sync::Arc<Self>, client_id: &str) {
        {
            let mut keys = self.keys.write().expect("credential store lock poisoned");
            if let Some(key) = keys.get_mut(client_id) {
                key.last_used_at = Some(chrono::Utc::now());
            }
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.clone();
            let client_id = client_id.to_string();
            handle.spawn_blocking(move || {
                if let Err(e) = store.persist() {
                    debug!(client_id, error = %e, "could not persist last_used_at");
                }
            });
        }
    }

    pub fn revoke(&self, client_id: &str) -> Result<bool> {
        let found = {
            let mut keys = self.keys.write().expect("credential store lock poisoned");
            match keys.get_mut(client_id) {
                Some(key) => {
                    key.revoked = true;
                    true
                }
                None => false,
            }
        };
        if found {
            self.persist()?;
        }
        Ok(found)
    }

    /// All records, hashes included; callers must redact before exposure.
    pub fn list(&self) -> Vec<ClientKey> {
        let keys = self.keys.read().expect("credential store lock poisoned");
        let mut all: Vec<ClientKey> = keys.values().cloned().collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    fn persist(&self) -> Result<()> {
        let serialized = {
            let keys = self.keys.read().expect("credential store lock poisoned");
            serde_json::to_string_pretty(&*keys).context("cannot serialize credential store")?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serialized)
            .with_context(|| format!("cannot write credential store {}", self.path.display()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::ExposeSecret;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join("keys.json")).unwrap()
    }

    #[test]
    fn mint_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let minted = store
            .mint("ci-bot", vec![Permission::Chat], RateLimits::default())
            .unwrap();

        let client = store.verify(minted.bearer.expose_secret()).unwrap();
        assert_eq!(client.client_id, minted.client_id);
        assert!(client.has_permission(Permission::Chat));
        assert!(!client.has_permission(Permission::Admin));
    }

    #[test]
    fn wrong_secret_and_unknown_id_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let minted = store
            .mint("ci-bot", vec![Permission::Chat], RateLimits::default())
            .unwrap();

        assert!(store.verify(&format!("{}.nope", minted.client_id)).is_none());
        assert!(store.verify("ck_ffffffffffffffff.whatever").is_none());
        assert!(store.verify("no-separator").is_none());
    }

    #[test]
    fn revoked_keys_stop_working() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let minted = store
            .mint("ci-bot", vec![Permission::Chat], RateLimits::default())
            .unwrap();

        assert!(store.revoke(&minted.client_id).unwrap());
        assert!(store.verify(minted.bearer.expose_secret()).is_none());
        assert!(!store.revoke("ck_0000000000000000").unwrap());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let bearer;
        {
            let store = store_in(&dir);
            let minted = store
                .mint("ci-bot", vec![Permission::Chat], RateLimits::default())
                .unwrap();
            bearer = minted.bearer.expose_secret().to_string();
        }
        let reopened = store_in(&dir);
        assert!(reopened.verify(&bearer).is_some());
    }

    #[test]
    fn plaintext_secret_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let minted = store
            .mint("ci-bot", vec![Permission::Chat], RateLimits::default())
            .unwrap();
        let secret_part = minted
            .bearer
            .expose_secret()
            .split_once('.')
            .unwrap()
            .1
            .to_string();

        let on_disk = std::fs::read_to_string(dir.path().join("keys.json")).unwrap();
        assert!(!on_disk.contains(&secret_part));
        assert!(on_disk.contains(&minted.client_id));
    }
}
