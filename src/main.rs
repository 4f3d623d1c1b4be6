use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use airborne::auth::{AuthMode, Authenticator, CredentialStore};
use airborne::chat::{ChatOrchestrator, DefaultCatalog};
use airborne::config::{GlobalConfig, StartupMode};
use airborne::pricing::PricingEngine;
use airborne::quota::{CounterStore, MemoryCounterStore, QuotaEngine, RedisCounterStore};
use airborne::rag::RagService;
use airborne::secrets::SecretResolver;
use airborne::server::{AppState, serve};
use airborne::store::ConversationStore;
use airborne::tenant::{TenantLoader, TenantRegistry};
use airborne::validate::SsrfValidator;
use airborne::{metrics, secret::SecretString};

#[derive(Debug, Parser)]
#[command(name = "airborne", version, about = "Multi-tenant LLM gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, value_name = "PATH", env = "AIRBORNE_CONFIG")]
    config: Option<PathBuf>,

    /// Probe a running gateway's health endpoint and exit 0/1.
    #[arg(long)]
    health_check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("AIRBORNE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Bad flags exit 2 via clap before we get here.
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = GlobalConfig::load(cli.config.as_deref())?;

    if cli.health_check {
        return health_check(&config).await;
    }

    if config.startup_mode == StartupMode::Production && config.auth.dev_auth {
        bail!("dev_auth must not be enabled in production startup mode");
    }

    if config.metrics.enabled {
        let addr = config
            .metrics
            .listen_addr
            .parse()
            .context("invalid metrics listen address")?;
        tokio::spawn(metrics::start_metrics_server(addr));
    }

    let resolver = SecretResolver::default();

    let loader = TenantLoader::from_config(&config.tenants, resolver.clone())?;
    let registry = Arc::new(TenantRegistry::load(loader).await?);
    info!(tenants = registry.tenant_ids().len(), "tenant registry ready");

    let (authenticator, credential_store) = build_auth(&config, &resolver)?;

    let counter_store: Arc<dyn CounterStore> =
        match RedisCounterStore::connect(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                // Quota is advisory; a missing store must not block boot.
                warn!(error = %e, "redis unavailable, quota counters run in-process");
                Arc::new(MemoryCounterStore::default())
            }
        };
    let quota = Arc::new(QuotaEngine::new(counter_store, config.quota_defaults));

    let pricing = match &config.pricing_dir {
        Some(dir) => Arc::new(PricingEngine::load_dir(dir)?),
        None => {
            warn!("no pricing directory configured; every model costs $0 unknown");
            Arc::new(PricingEngine::empty())
        }
    };

    let store = Arc::new(ConversationStore::connect(&config.database_url).await?);

    let rag = if config.rag.enabled {
        Some(Arc::new(RagService::from_config(&config.rag)?))
    } else {
        None
    };

    let orchestrator = Arc::new(ChatOrchestrator::new(
        registry,
        Arc::new(DefaultCatalog),
        quota,
        pricing,
        store.clone(),
        rag.clone(),
        Arc::new(SsrfValidator::default()),
        config.capture_enabled,
    ));

    let state = AppState {
        orchestrator,
        authenticator: Arc::new(authenticator),
        credential_store,
        rag,
        store,
    };

    let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    serve(state, &config.listen_addr, shutdown_signal(grace)).await?;
    Ok(ExitCode::SUCCESS)
}

fn build_auth(
    config: &GlobalConfig,
    resolver: &SecretResolver,
) -> Result<(Authenticator, Option<Arc<CredentialStore>>)> {
    match config.auth.mode.as_str() {
        "static" => {
            if config.auth.static_token.is_empty() {
                bail!("auth mode is static but no static_token is configured");
            }
            let token: SecretString = resolver
                .resolve(&config.auth.static_token)
                .context("cannot resolve static auth token")?;
            Ok((
                Authenticator::new(AuthMode::Static { token }, config.auth.dev_auth),
                None,
            ))
        }
        "dynamic" => {
            let store = Arc::new(CredentialStore::open(config.auth.keys_path.clone())?);
            Ok((
                Authenticator::new(
                    AuthMode::Dynamic {
                        store: store.clone(),
                    },
                    config.auth.dev_auth,
                ),
                Some(store),
            ))
        }
        other => bail!("unknown auth mode {other:?}, expected static or dynamic"),
    }
}

/// Resolves on SIGTERM or SIGINT; a watchdog force-exits if draining
/// outlives the grace period.
async fn shutdown_signal(grace: std::time::Duration) {
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, draining"),
        _ = terminate => info!("SIGTERM received, draining"),
    }
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("grace period elapsed, forcing exit");
        std::process::exit(0);
    });
}

async fn health_check(config: &GlobalConfig) -> Result<ExitCode> {
    let port = config
        .listen_addr
        .rsplit(':')
        .next()
        .context("listen_addr has no port")?;
    let url = format!("http://127.0.0.1:{port}/healthz");
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await;
    match response {
        Ok(resp) if resp.status().is_success() => {
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        Ok(resp) => {
            eprintln!("health check failed: {}", resp.status());
            Ok(ExitCode::from(1))
        }
        Err(e) => {
            eprintln!("health check failed: {e}");
            Ok(ExitCode::from(1))
        }
    }
}
