//! Thread-safe tenant registry with atomic reload.
//!
//! The hot path is read-only lookups from every request, so the map lives
//! behind an `RwLock<Arc<...>>`: readers clone the `Arc` and drop the lock
//! immediately, and `reload` swaps the whole map in one write. A reader
//! holding the old `Arc` keeps a consistent view; nobody ever observes a
//! half-updated registry.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::tenant::{TenantConfig, TenantLoader};

type TenantMap = HashMap<String, Arc<TenantConfig>>;

/// Outcome of one `reload`, by tenant id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct TenantRegistry {
    map: RwLock<Arc<TenantMap>>,
    loader: TenantLoader,
}

impl TenantRegistry {
    /// Load all tenants through `loader` and build the registry.
    pub async fn load(loader: TenantLoader) -> Result<Self> {
        let map = loader.load_all().await?;
        Ok(Self {
            map: RwLock::new(Arc::new(map)),
            loader,
        })
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        self.snapshot().get(tenant_id).cloned()
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_single_tenant(&self) -> bool {
        self.snapshot().len() == 1
    }

    /// The lone tenant id in single-tenant deployments; lets requests omit
    /// the tenant header.
    pub fn sole_tenant_id(&self) -> Option<String> {
        let snapshot = self.snapshot();
        if snapshot.len() == 1 {
            snapshot.keys().next().cloned()
        } else {
            None
        }
    }

    /// Re-run the loader and atomically swap the map.
    ///
    /// In-flight requests keep whichever snapshot they already hold; new
    /// requests see the new one as soon as the swap completes.
    pub async fn reload(&self) -> Result<ReloadDiff> {
        let next = Arc::new(self.loader.load_all().await?);

        let previous = {
            let mut guard = self.map.write().expect("tenant registry lock poisoned");
            std::mem::replace(&mut *guard, next.clone())
        };

        let mut added: Vec<String> = next
            .keys()
            .filter(|id| !previous.contains_key(*id))
            .cloned()
            .collect();
        let mut removed: Vec<String> = previous
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        let mut unchanged: Vec<String> = next
            .keys()
            .filter(|id| previous.contains_key(*id))
            .cloned()
            .collect();
        added.sort_unstable();
        removed.sort_unstable();
        unchanged.sort_unstable();

        let diff = ReloadDiff {
            added,
            removed,
            unchanged,
        };
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "tenant registry reloaded"
        );
        Ok(diff)
    }

    fn snapshot(&self) -> Arc<TenantMap> {
        self.map.read().expect("tenant registry lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretResolver;
    use crate::tenant::TenantSource;
    use std::path::Path;

    fn write_tenant_file(dir: &Path, name: &str, id: &str) {
        let body = serde_json::json!({
            "tenant_id": id,
            "providers": {
                "anthropic": {
                    "enabled": true,
                    "api_key": "inline-test-key",
                    "model": "claude-sonnet-4-5"
                }
            },
            "default_provider": "anthropic"
        });
        std::fs::write(dir.join(name), serde_json::to_string(&body).unwrap()).unwrap();
    }

    async fn registry_for(dir: &Path) -> TenantRegistry {
        let loader = TenantLoader::new(
            TenantSource::Dir(dir.to_path_buf()),
            SecretResolver::default(),
        );
        TenantRegistry::load(loader).await.unwrap()
    }

    #[tokio::test]
    async fn lookup_and_single_tenant() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "acme");
        let registry = registry_for(dir.path()).await;

        assert!(registry.get("acme").is_some());
        assert!(registry.get("ghost").is_none());
        assert!(registry.is_single_tenant());
        assert_eq!(registry.sole_tenant_id().as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn reload_diff_tracks_membership() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "acme");
        write_tenant_file(dir.path(), "b.json", "globex");
        let registry = registry_for(dir.path()).await;

        std::fs::remove_file(dir.path().join("b.json")).unwrap();
        write_tenant_file(dir.path(), "c.json", "initech");

        let diff = registry.reload().await.unwrap();
        assert_eq!(diff.added, vec!["initech".to_string()]);
        assert_eq!(diff.removed, vec!["globex".to_string()]);
        assert_eq!(diff.unchanged, vec!["acme".to_string()]);
        assert!(registry.get("globex").is_none());
        assert!(registry.get("initech").is_some());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_map() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "acme");
        let registry = registry_for(dir.path()).await;

        // Make the source invalid: a duplicate id.
        write_tenant_file(dir.path(), "dup.json", "acme");
        assert!(registry.reload().await.is_err());
        // Old map still served.
        assert!(registry.get("acme").is_some());
        assert_eq!(registry.tenant_ids(), vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_partial_map() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "acme");
        let registry = Arc::new(registry_for(dir.path()).await);

        let mut readers = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    // The tenant must exist in every observed snapshot.
                    assert!(registry.get("acme").is_some());
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..20 {
            registry.reload().await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
