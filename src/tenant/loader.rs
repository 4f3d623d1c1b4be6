//! Tenant configuration sources.
//!
//! Three sources, checked in precedence order frozen > remote > file:
//!
//! 1. Frozen JSON snapshot, parsed without validation.
//! 2. Remote secret store: brand list then one blob per brand, with
//!    exponential-backoff retry on 5xx/429.
//! 3. Local directory of `.json`/`.yaml`/`.yml` files; files without a
//!    `tenant_id` are skipped.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FrozenConfig, TenantSourceConfig};
use crate::retry::{RetryDecision, RetryPolicy, RetryReason, parse_retry_after, retry_with_backoff};
use crate::secret::{ExposeSecret, SecretString};
use crate::secrets::SecretResolver;
use crate::tenant::TenantConfig;

/// Where tenant configurations come from.
pub enum TenantSource {
    Frozen(PathBuf),
    Remote {
        base_url: String,
        token: SecretString,
    },
    Dir(PathBuf),
}

impl std::fmt::Debug for TenantSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen(p) => f.debug_tuple("Frozen").field(p).finish(),
            Self::Remote { base_url, .. } => {
                f.debug_struct("Remote").field("base_url", base_url).finish()
            }
            Self::Dir(p) => f.debug_tuple("Dir").field(p).finish(),
        }
    }
}

/// Loads and re-loads tenant configurations from the selected source.
#[derive(Debug)]
pub struct TenantLoader {
    source: TenantSource,
    resolver: SecretResolver,
    http: reqwest::Client,
}

impl TenantLoader {
    /// Select the source from configuration, honoring the precedence
    /// frozen > remote > file.
    pub fn from_config(config: &TenantSourceConfig, resolver: SecretResolver) -> Result<Self> {
        let source = if let Some(frozen) = &config.frozen_path {
            TenantSource::Frozen(frozen.clone())
        } else if !config.remote_token.is_empty() {
            let base_url = config
                .remote_url
                .clone()
                .context("remote tenant store token set but remote_url missing")?;
            let token = resolver
                .resolve(&config.remote_token)
                .context("cannot resolve remote tenant store token")?;
            TenantSource::Remote { base_url, token }
        } else if let Some(dir) = &config.dir {
            TenantSource::Dir(dir.clone())
        } else {
            bail!("no tenant source configured: set frozen_path, remote credentials, or dir");
        };
        Ok(Self::new(source, resolver))
    }

    pub fn new(source: TenantSource, resolver: SecretResolver) -> Self {
        Self {
            source,
            resolver,
            http: reqwest::Client::new(),
        }
    }

    /// Load every tenant from the source, resolve secrets, validate, and
    /// index by id. Duplicate ids are an error.
    pub async fn load_all(&self) -> Result<HashMap<String, Arc<TenantConfig>>> {
        let configs = match &self.source {
            TenantSource::Frozen(path) => self.load_frozen(path)?,
            TenantSource::Remote { base_url, token } => self.load_remote(base_url, token).await?,
            TenantSource::Dir(dir) => self.load_dir(dir)?,
        };

        let frozen = matches!(self.source, TenantSource::Frozen(_));
        let mut map = HashMap::with_capacity(configs.len());
        for mut config in configs {
            // Frozen snapshots were validated when produced.
            if !frozen {
                config.validate()?;
            }
            config.resolve_secrets(&self.resolver)?;
            let id = config.tenant_id.clone();
            if map.insert(id.clone(), Arc::new(config)).is_some() {
                bail!("duplicate tenant id {id:?}");
            }
        }
        info!(tenants = map.len(), source = ?self.source, "loaded tenant configurations");
        Ok(map)
    }

    fn load_frozen(&self, path: &Path) -> Result<Vec<TenantConfig>> {
        let frozen = FrozenConfig::load(path)?;
        Ok(frozen.tenant_configs)
    }

    fn load_dir(&self, dir: &Path) -> Result<Vec<TenantConfig>> {
        let mut configs = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read tenant directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            if !matches!(ext.as_str(), "json" | "yaml" | "yml") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let value: serde_json::Value = if ext == "json" {
                serde_json::from_str(&content)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?
            } else {
                serde_yaml::from_str(&content)
                    .with_context(|| format!("invalid YAML in {}", path.display()))?
            };
            if value.get("tenant_id").and_then(|v| v.as_str()).is_none() {
                debug!(file = %path.display(), "skipping file without tenant_id");
                continue;
            }
            let config: TenantConfig = serde_json::from_value(value)
                .with_context(|| format!("invalid tenant config in {}", path.display()))?;
            configs.push(config);
        }
        Ok(configs)
    }

    async fn load_remote(
        &self,
        base_url: &str,
        token: &SecretString,
    ) -> Result<Vec<TenantConfig>> {
        let base = base_url.trim_end_matches('/');
        let brand_list = self
            .fetch_remote(&format!("{base}/tenants"), token)
            .await
            .context("cannot fetch brand list from remote store")?;

        let mut configs = Vec::new();
        for brand in brand_list.split(',').map(str::trim).filter(|b| !b.is_empty()) {
            let blob = self
                .fetch_remote(&format!("{base}/tenants/{brand}"), token)
                .await
                .with_context(|| format!("cannot fetch tenant blob for brand {brand:?}"))?;
            let config: TenantConfig = serde_json::from_str(&blob)
                .with_context(|| format!("invalid tenant blob for brand {brand:?}"))?;
            configs.push(config);
        }
        Ok(configs)
    }

    /// GET one remote resource with backoff. Only 5xx and 429 are retried;
    /// transport errors and other statuses fail immediately.
    async fn fetch_remote(&self, url: &str, token: &SecretString) -> Result<String> {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::remote_store_default();

        let response = retry_with_backoff(
            &policy,
            &cancel,
            |_attempt| {
                self.http
                    .get(url)
                    .bearer_auth(token.expose_secret())
                    .send()
            },
            |result| match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        RetryDecision::Retry {
                            reason: RetryReason::RateLimited,
                            retry_after: parse_retry_after(resp.headers()),
                        }
                    } else if status.is_server_error() {
                        RetryDecision::Retry {
                            reason: RetryReason::ServerError,
                            retry_after: None,
                        }
                    } else {
                        RetryDecision::DoNotRetry
                    }
                }
                Err(_) => RetryDecision::DoNotRetry,
            },
            |attempt| {
                warn!(
                    url,
                    attempt = attempt.attempt,
                    delay_ms = attempt.delay.as_millis() as u64,
                    reason = attempt.reason.as_str(),
                    "remote tenant store fetch retrying"
                );
            },
        )
        .await
        .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("remote tenant store returned {status} for {url}");
        }
        response
            .text()
            .await
            .with_context(|| format!("cannot read body from {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        std::fs::write(dir.join(name), serde_json::to_string_pretty(&body).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn dir_loader_indexes_by_id() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "tenant_a");
        write_tenant_file(dir.path(), "b.json", "tenant_b");
        // No tenant_id: skipped, not an error.
        std::fs::write(dir.path().join("notes.json"), "{\"comment\": \"hi\"}").unwrap();
        // Wrong extension: ignored.
        std::fs::write(dir.path().join("readme.txt"), "hello").unwrap();

        let loader = TenantLoader::new(
            TenantSource::Dir(dir.path().to_path_buf()),
            SecretResolver::default(),
        );
        let map = loader.load_all().await.unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("tenant_a"));
        assert!(map.contains_key("tenant_b"));
    }

    #[tokio::test]
    async fn duplicate_ids_fail() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "tenant_a");
        write_tenant_file(dir.path(), "also_a.json", "tenant_a");

        let loader = TenantLoader::new(
            TenantSource::Dir(dir.path().to_path_buf()),
            SecretResolver::default(),
        );
        let err = loader.load_all().await.unwrap_err();
        assert!(err.to_string().contains("duplicate tenant id"));
    }

    #[tokio::test]
    async fn invalid_tenant_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write_tenant_file(dir.path(), "a.json", "NOT-LOWERCASE");

        let loader = TenantLoader::new(
            TenantSource::Dir(dir.path().to_path_buf()),
            SecretResolver::default(),
        );
        assert!(loader.load_all().await.is_err());
    }

    #[test]
    fn precedence_frozen_over_remote_over_dir() {
        let resolver = SecretResolver::default();

        let config = TenantSourceConfig {
            frozen_path: Some(PathBuf::from("/tmp/frozen.json")),
            remote_url: Some("https://store.example.com".into()),
            remote_token: "inline-token".into(),
            dir: Some(PathBuf::from("/etc/airborne/tenants")),
        };
        let loader = TenantLoader::from_config(&config, resolver.clone()).unwrap();
        assert!(matches!(loader.source, TenantSource::Frozen(_)));

        let config = TenantSourceConfig {
            frozen_path: None,
            remote_url: Some("https://store.example.com".into()),
            remote_token: "inline-token".into(),
            dir: Some(PathBuf::from("/etc/airborne/tenants")),
        };
        let loader = TenantLoader::from_config(&config, resolver.clone()).unwrap();
        assert!(matches!(loader.source, TenantSource::Remote { .. }));

        let config = TenantSourceConfig {
            frozen_path: None,
            remote_url: None,
            remote_token: String::new(),
            dir: Some(PathBuf::from("/etc/airborne/tenants")),
        };
        let loader = TenantLoader::from_config(&config, resolver).unwrap();
        assert!(matches!(loader.source, TenantSource::Dir(_)));
    }
}
