//! Global gateway configuration.
//!
//! Loaded once at startup from a YAML file, then overridden by `APP_*`
//! environment variables. Invalid numeric or boolean env values leave the
//! file/default value intact with a warning; an unknown `APP_STARTUP_MODE`
//! is fatal.
//!
//! Recognized overrides:
//! `APP_LISTEN_ADDR`, `APP_METRICS_ADDR`, `APP_METRICS_ENABLED`,
//! `APP_STARTUP_MODE`, `APP_REDIS_URL`, `APP_DATABASE_URL`,
//! `APP_QDRANT_URL`, `APP_TENANT_DIR`, `APP_FROZEN_CONFIG`,
//! `APP_REMOTE_STORE_URL`, `APP_REMOTE_STORE_TOKEN`, `APP_STATIC_TOKEN`,
//! `APP_RPM_DEFAULT`, `APP_RPD_DEFAULT`, `APP_TPM_DEFAULT`,
//! `APP_RAG_ENABLED`, `APP_RAG_TOP_K`, `APP_CAPTURE_ENABLED`,
//! `APP_SHUTDOWN_GRACE_SECS`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::warn;

use crate::tenant::TenantConfig;

/// How strictly the gateway treats development conveniences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StartupMode {
    Production,
    Development,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9090".into(),
        }
    }
}

/// Client authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `static` (single admin bearer) or `dynamic` (credential store).
    pub mode: String,
    /// Secret reference for the static admin bearer.
    pub static_token: String,
    /// Path of the dynamic credential store file.
    pub keys_path: PathBuf,
    /// Inject a synthetic all-but-Admin client. Development mode only.
    pub dev_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: "dynamic".into(),
            static_token: String::new(),
            keys_path: PathBuf::from("/var/lib/airborne/keys.json"),
            dev_auth: false,
        }
    }
}

/// Fallback quota limits applied when a client has no override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaDefaults {
    pub rpm: u32,
    pub rpd: u32,
    pub tpm: u32,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            rpm: 60,
            rpd: 10_000,
            tpm: 100_000,
        }
    }
}

/// Where tenant configurations come from. Precedence: frozen > remote > file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSourceConfig {
    /// Frozen JSON snapshot; set to activate frozen mode.
    pub frozen_path: Option<PathBuf>,
    /// Remote secret-store base URL.
    pub remote_url: Option<String>,
    /// Secret reference for the remote store access token; remote mode
    /// activates only when this is set and non-empty.
    pub remote_token: String,
    /// Local directory of `.json`/`.yaml`/`.yml` tenant files.
    pub dir: Option<PathBuf>,
}

/// Retrieval pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub enabled: bool,
    pub extractor_url: String,
    pub embedder_url: String,
    pub qdrant_url: String,
    pub embedding_dim: u64,
    pub top_k: usize,
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extractor_url: "http://127.0.0.1:9998".into(),
            embedder_url: "http://127.0.0.1:8001".into(),
            qdrant_url: "http://127.0.0.1:6334".into(),
            embedding_dim: 1536,
            top_k: 5,
            max_chunk_size: 2000,
            min_chunk_size: 50,
            overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub listen_addr: String,
    pub startup_mode: StartupMode,
    pub metrics: MetricsConfig,
    pub auth: AuthConfig,
    pub quota_defaults: QuotaDefaults,
    pub redis_url: String,
    pub database_url: String,
    pub tenants: TenantSourceConfig,
    pub rag: RagConfig,
    /// Directory of `*_pricing.json` model cost tables.
    pub pricing_dir: Option<PathBuf>,
    /// Record raw provider request/response bodies on each turn.
    pub capture_enabled: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            startup_mode: StartupMode::Production,
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            quota_defaults: QuotaDefaults::default(),
            redis_url: "redis://127.0.0.1:6379".into(),
            database_url: "sqlite:///var/lib/airborne/conversations.db".into(),
            tenants: TenantSourceConfig::default(),
            rag: RagConfig::default(),
            pricing_dir: None,
            capture_enabled: false,
            shutdown_grace_secs: 30,
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a YAML file (defaults when absent), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `APP_*` environment overrides in place.
    ///
    /// Only `APP_STARTUP_MODE` can fail; malformed numbers and booleans
    /// keep the existing value and log a warning.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        env_string("APP_LISTEN_ADDR", &mut self.listen_addr);
        env_string("APP_METRICS_ADDR", &mut self.metrics.listen_addr);
        env_bool("APP_METRICS_ENABLED", &mut self.metrics.enabled);
        env_string("APP_REDIS_URL", &mut self.redis_url);
        env_string("APP_DATABASE_URL", &mut self.database_url);
        env_string("APP_QDRANT_URL", &mut self.rag.qdrant_url);
        env_opt_path("APP_TENANT_DIR", &mut self.tenants.dir);
        env_opt_path("APP_FROZEN_CONFIG", &mut self.tenants.frozen_path);
        env_opt_string("APP_REMOTE_STORE_URL", &mut self.tenants.remote_url);
        env_string("APP_REMOTE_STORE_TOKEN", &mut self.tenants.remote_token);
        env_string("APP_STATIC_TOKEN", &mut self.auth.static_token);
        env_u32("APP_RPM_DEFAULT", &mut self.quota_defaults.rpm);
        env_u32("APP_RPD_DEFAULT", &mut self.quota_defaults.rpd);
        env_u32("APP_TPM_DEFAULT", &mut self.quota_defaults.tpm);
        env_bool("APP_RAG_ENABLED", &mut self.rag.enabled);
        env_usize("APP_RAG_TOP_K", &mut self.rag.top_k);
        env_bool("APP_CAPTURE_ENABLED", &mut self.capture_enabled);
        env_u64("APP_SHUTDOWN_GRACE_SECS", &mut self.shutdown_grace_secs);

        if let Ok(raw) = std::env::var("APP_STARTUP_MODE") {
            self.startup_mode = StartupMode::from_str(raw.trim())
                .map_err(|_| anyhow::anyhow!("unknown APP_STARTUP_MODE {raw:?}"))?;
        }
        Ok(())
    }
}

fn env_string(name: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

fn env_opt_string(name: &str, slot: &mut Option<String>) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *slot = Some(v);
        }
    }
}

fn env_opt_path(name: &str, slot: &mut Option<PathBuf>) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *slot = Some(PathBuf::from(v));
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => *slot = true,
            "false" | "0" | "no" => *slot = false,
            other => warn!(var = name, value = other, "ignoring invalid boolean override"),
        }
    }
}

fn env_u32(name: &str, slot: &mut u32) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var = name, value = %v, "ignoring invalid integer override"),
        }
    }
}

fn env_u64(name: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var = name, value = %v, "ignoring invalid integer override"),
        }
    }
}

fn env_usize(name: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var = name, value = %v, "ignoring invalid integer override"),
        }
    }
}

/// Pre-validated snapshot of the whole deployment: global config plus every
/// tenant, secrets left as `ENV=`/`FILE=` references. Safe to commit, loaded
/// without validation in frozen mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenConfig {
    pub global_config: GlobalConfig,
    pub tenant_configs: Vec<TenantConfig>,
    pub frozen_at: chrono::DateTime<chrono::Utc>,
    pub single_tenant: bool,
}

impl FrozenConfig {
    /// Parse a frozen snapshot. By contract the snapshot was validated when
    /// it was produced, so this performs none.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read frozen config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse frozen config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation happens in this one test so parallel tests in
    // this binary never race on APP_* variables.
    #[test]
    fn env_overrides_apply_and_validate() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("APP_RPM_DEFAULT", "not-a-number");
            std::env::set_var("APP_TPM_DEFAULT", "123456");
            std::env::set_var("APP_LISTEN_ADDR", "127.0.0.1:4444");
        }
        let mut config = GlobalConfig::default();
        let rpm_before = config.quota_defaults.rpm;
        config.apply_env_overrides().unwrap();
        // Malformed integer keeps the default; valid values land.
        assert_eq!(config.quota_defaults.rpm, rpm_before);
        assert_eq!(config.quota_defaults.tpm, 123_456);
        assert_eq!(config.listen_addr, "127.0.0.1:4444");

        // Unknown startup mode is the one fatal override.
        unsafe { std::env::set_var("APP_STARTUP_MODE", "yolo") };
        let mut config = GlobalConfig::default();
        assert!(config.apply_env_overrides().is_err());
        unsafe {
            std::env::set_var("APP_STARTUP_MODE", "development");
        }
        let mut config = GlobalConfig::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.startup_mode, StartupMode::Development);

        unsafe {
            std::env::remove_var("APP_RPM_DEFAULT");
            std::env::remove_var("APP_TPM_DEFAULT");
            std::env::remove_var("APP_LISTEN_ADDR");
            std::env::remove_var("APP_STARTUP_MODE");
        }
    }

    #[test]
    fn yaml_roundtrip_with_defaults() {
        let yaml = "listen_addr: \"127.0.0.1:9999\"\nstartup_mode: development\n";
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.startup_mode, StartupMode::Development);
        // Untouched sections fall back to defaults.
        assert!(config.metrics.enabled);
        assert_eq!(config.rag.max_chunk_size, 2000);
    }
}
