//! Client authentication and the permission model.
//!
//! Operators mint client keys; end users present them as bearer tokens.
//! Permissions come from a closed set and are checked per RPC before the
//! handler body runs.

mod store;

pub use store::{CredentialStore, MintedKey};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::warn;

use crate::secret::{ExposeSecret, SecretString};
use crate::tenant::RateLimits;

/// Closed permission set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Permission {
    Chat,
    ChatStream,
    File,
    Admin,
}

/// A stored credential record. The plaintext secret exists only in the
/// mint response; afterwards only the bcrypt hash survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKey {
    pub client_id: String,
    pub client_name: String,
    pub hashed_secret: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

/// The authenticated identity attached to a request context.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client_id: String,
    pub client_name: String,
    pub permissions: Vec<Permission>,
    pub rate_limits: RateLimits,
}

impl AuthenticatedClient {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Authentication failure. Deliberately carries no detail: the client
/// learns only that the credential did not work.
#[derive(Debug, Error)]
#[error("unauthenticated")]
pub struct Unauthenticated;

/// How bearer tokens are checked.
pub enum AuthMode {
    /// One admin bearer from configuration; all permissions implicit.
    Static { token: SecretString },
    /// Lookups through the credential store.
    Dynamic { store: std::sync::Arc<CredentialStore> },
}

pub struct Authenticator {
    mode: AuthMode,
    dev_client: Option<AuthenticatedClient>,
}

impl Authenticator {
    /// `dev_auth` injects a synthetic client holding every permission
    /// except `Admin` for requests without a valid bearer. The caller is
    /// responsible for refusing to enable it in production.
    pub fn new(mode: AuthMode, dev_auth: bool) -> Self {
        let dev_client = if dev_auth {
            warn!(
                "development auth is ENABLED: unauthenticated requests get a synthetic \
                 client with Chat/ChatStream/File permissions"
            );
            Some(AuthenticatedClient {
                client_id: "dev-client".into(),
                client_name: "development synthetic client".into(),
                permissions: vec![Permission::Chat, Permission::ChatStream, Permission::File],
                rate_limits: RateLimits::default(),
            })
        } else {
            None
        };
        Self { mode, dev_client }
    }

    /// Verify a bearer token into an authenticated client.
    pub fn authenticate(&self, bearer: Option<&str>) -> Result<AuthenticatedClient, Unauthenticated> {
        if let Some(token) = bearer.filter(|t| !t.is_empty()) {
            match &self.mode {
                AuthMode::Static { token: expected } => {
                    if constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()) {
                        return Ok(AuthenticatedClient {
                            client_id: "static-admin".into(),
                            client_name: "static admin bearer".into(),
                            permissions: vec![
                                Permission::Admin,
                                Permission::Chat,
                                Permission::ChatStream,
                                Permission::File,
                            ],
                            rate_limits: RateLimits::default(),
                        });
                    }
                }
                AuthMode::Dynamic { store } => {
                    if let Some(client) = store.verify(token) {
                        store.touch_last_used(&client.client_id);
                        return Ok(client);
                    }
                }
            }
        }
        self.dev_client.clone().ok_or(Unauthenticated)
    }
}

/// Byte-wise comparison without early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_mode_grants_all_permissions() {
        let auth = Authenticator::new(
            AuthMode::Static {
                token: SecretString::from("admin-bearer-token"),
            },
            false,
        );
        let client = auth.authenticate(Some("admin-bearer-token")).unwrap();
        assert!(client.has_permission(Permission::Admin));
        assert!(client.has_permission(Permission::Chat));
        assert!(client.has_permission(Permission::ChatStream));
        assert!(client.has_permission(Permission::File));

        assert!(auth.authenticate(Some("wrong")).is_err());
        assert!(auth.authenticate(None).is_err());
        assert!(auth.authenticate(Some("")).is_err());
    }

    #[test]
    fn dev_mode_never_grants_admin() {
        let auth = Authenticator::new(
            AuthMode::Static {
                token: SecretString::from("admin-bearer-token"),
            },
            true,
        );
        let client = auth.authenticate(None).unwrap();
        assert_eq!(client.client_id, "dev-client");
        assert!(!client.has_permission(Permission::Admin));
        assert!(client.has_permission(Permission::Chat));

        // A real bearer still wins over the synthetic client.
        let admin = auth.authenticate(Some("admin-bearer-token")).unwrap();
        assert!(admin.has_permission(Permission::Admin));
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
