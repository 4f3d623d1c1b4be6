//! Per-tenant configuration: model, validation, loading, and the
//! thread-safe registry.
//!
//! A tenant is a logical customer with isolated provider credentials,
//! quotas, and storage partitions. Configurations come from a frozen
//! snapshot, a remote secret store, or a local directory (in that
//! precedence), have their secret references resolved, and are validated
//! before the registry ever serves them.

mod loader;
mod registry;

pub use loader::{TenantLoader, TenantSource};
pub use registry::{ReloadDiff, TenantRegistry};

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::secret::SecretString;
use crate::secrets::SecretResolver;

fn tenant_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{1,64}$").expect("static pattern"))
}

/// Configuration for one upstream provider of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Secret reference (`ENV=`, `FILE=`, `${VAR}`) or inline key.
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u32>,
    /// Custom endpoint. Requests carrying one require Admin permission.
    pub base_url: Option<String>,
    /// Provider-specific knobs (reasoning effort, service tier, thinking
    /// budget, safety threshold, ...). Unknown keys are ignored.
    pub extra_options: serde_json::Map<String, serde_json::Value>,
    /// Resolved at load time, never serialized.
    #[serde(skip)]
    pub resolved_api_key: Option<SecretString>,
}

/// Per-tenant quota overrides; zero means "use the global default".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimits {
    pub rpm: u32,
    pub rpd: u32,
    pub tpm: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Provider names in the order they should be tried.
    pub order: Vec<String>,
}

/// Optional image-generation block. Parsed and validated; the image RPC
/// surface itself is not part of this gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenerationConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub max_images: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub tenant_id: String,
    /// Provider name -> configuration.
    pub providers: HashMap<String, ProviderConfig>,
    /// Provider used when a request names none.
    pub default_provider: Option<String>,
    pub rate_limits: RateLimits,
    pub failover: FailoverConfig,
    pub image_generation: Option<ImageGenerationConfig>,
    /// Free-form operator metadata, carried through untouched.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            providers: HashMap::new(),
            default_provider: None,
            rate_limits: RateLimits::default(),
            failover: FailoverConfig::default(),
            image_generation: None,
            metadata: HashMap::new(),
        }
    }
}

impl TenantConfig {
    /// Enforce the structural invariants on one tenant.
    pub fn validate(&self) -> Result<()> {
        let id = &self.tenant_id;
        if !tenant_id_pattern().is_match(id) {
            bail!("tenant id {id:?} must be 1-64 chars of [a-z0-9_-]");
        }
        if !self.providers.values().any(|p| p.enabled) {
            bail!("tenant {id}: at least one provider must be enabled");
        }
        for (name, provider) in &self.providers {
            if let Some(t) = provider.temperature {
                if !(0.0..=2.0).contains(&t) {
                    bail!("tenant {id}: provider {name}: temperature {t} out of range 0-2");
                }
            }
            if let Some(p) = provider.top_p {
                if !(0.0..=1.0).contains(&p) {
                    bail!("tenant {id}: provider {name}: top_p {p} out of range 0-1");
                }
            }
            if let Some(max) = provider.max_output_tokens {
                if !(1..=128_000).contains(&max) {
                    bail!(
                        "tenant {id}: provider {name}: max_output_tokens {max} out of range 1-128000"
                    );
                }
            }
        }
        for name in &self.failover.order {
            if !self.providers.contains_key(name) {
                bail!("tenant {id}: failover order names unknown provider {name:?}");
            }
        }
        if let Some(default) = &self.default_provider {
            if !self.providers.contains_key(default) {
                bail!("tenant {id}: default provider {default:?} is not configured");
            }
        }
        if let Some(image) = &self.image_generation {
            if image.enabled && !self.providers.contains_key(&image.provider) {
                bail!(
                    "tenant {id}: image generation names unknown provider {:?}",
                    image.provider
                );
            }
            if let Some(n) = image.max_images {
                if !(1..=10).contains(&n) {
                    bail!("tenant {id}: image generation max_images {n} out of range 1-10");
                }
            }
        }
        Ok(())
    }

    /// Expand every provider's secret reference into live key material.
    pub fn resolve_secrets(&mut self, resolver: &SecretResolver) -> Result<()> {
        for (name, provider) in self.providers.iter_mut() {
            if provider.api_key.is_empty() {
                continue;
            }
            let resolved = resolver.resolve(&provider.api_key).map_err(|e| {
                anyhow::anyhow!(
                    "tenant {}: provider {name}: cannot resolve api key: {e}",
                    self.tenant_id
                )
            })?;
            provider.resolved_api_key = Some(resolved);
        }
        Ok(())
    }

    /// The provider chain for this tenant, selection first. The tenant
    /// default outranks the failover order: it leads the chain whenever
    /// it is set and enabled, with the failover order's enabled entries
    /// following as fallbacks. Only when no default is configured does
    /// the failover order's first enabled entry drive selection.
    pub fn provider_chain(&self) -> Vec<&str> {
        let mut chain: Vec<&str> = Vec::new();
        if let Some(default) = &self.default_provider {
            if self.providers.get(default).is_some_and(|p| p.enabled) {
                chain.push(default.as_str());
            }
        }
        if self.failover.enabled {
            for name in &self.failover.order {
                if self.providers.get(name).is_some_and(|p| p.enabled)
                    && !chain.contains(&name.as_str())
                {
                    chain.push(name.as_str());
                }
            }
        }
        if chain.is_empty() {
            let mut enabled: Vec<&str> = self
                .providers
                .iter()
                .filter(|(_, p)| p.enabled)
                .map(|(name, _)| name.as_str())
                .collect();
            enabled.sort_unstable();
            enabled.truncate(1);
            chain = enabled;
        }
        chain
    }
}
