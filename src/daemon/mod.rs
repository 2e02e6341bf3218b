use crate::config::Config;
use crate::engine::{CorrelationEngine, EngineSettings, SigningPolicy};
use crate::gateway::hub::ClientHub;
use crate::gateway::{AppState, CreateAppLimiter};
use crate::registry::{ApplicationRegistry, SqliteRegistry};
use crate::source::{CodePenSource, MessageSource};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const SUPERVISOR_INITIAL_BACKOFF_SECS: u64 = 2;
const SUPERVISOR_MAX_BACKOFF_SECS: u64 = 60;

/// Run gateway, correlation engine and session refresher until Ctrl+C.
pub async fn run(config: Config) -> Result<()> {
    config.validate_for_serve()?;

    let db_path = config.registry_db_path();
    let sqlite = SqliteRegistry::open(&db_path)?;
    let registered = sqlite.count().await?;
    let registry: Arc<dyn ApplicationRegistry> = Arc::new(sqlite);
    let policy = Arc::new(SigningPolicy::from_config(
        &config.issuance,
        Arc::clone(&registry),
    )?);
    let source = Arc::new(CodePenSource::new(&config.source)?);
    let hub = Arc::new(ClientHub::new());

    let engine = CorrelationEngine::new(
        Arc::clone(&source) as Arc<dyn MessageSource>,
        Arc::clone(&policy),
        Arc::clone(&hub) as Arc<dyn crate::gateway::hub::RealtimeGateway>,
        EngineSettings::from(&config.engine),
    );

    let state = AppState {
        hub,
        signal: engine.signal_handle(),
        policy: Arc::clone(&policy),
        registry,
        trust_forwarded_headers: config.gateway.trust_forwarded_headers,
        create_app_limiter: Arc::new(CreateAppLimiter::new(
            config.gateway.create_app_rate_limit_per_minute,
        )),
    };

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    {
        let refresh_every = Duration::from_secs(config.source.refresh_interval_secs.max(1));
        let source = Arc::clone(&source);
        handles.push(spawn_component_supervisor(
            "session",
            SUPERVISOR_INITIAL_BACKOFF_SECS,
            SUPERVISOR_MAX_BACKOFF_SECS,
            move || run_session_refresher(Arc::clone(&source), refresh_every),
        ));
    }

    handles.push(tokio::spawn(engine.run()));

    {
        let host = config.gateway.host.clone();
        let port = config.gateway.port;
        handles.push(spawn_component_supervisor(
            "gateway",
            SUPERVISOR_INITIAL_BACKOFF_SECS,
            SUPERVISOR_MAX_BACKOFF_SECS,
            move || {
                let host = host.clone();
                let state = state.clone();
                async move { crate::gateway::run_gateway(&host, port, state).await }
            },
        ));
    }

    tracing::info!(
        registry = %db_path.display(),
        registered,
        mode = policy.mode().as_str(),
        "cdp-auth daemon started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Refresh the source session now, then every `period`. Returns on the first
/// failure so the supervisor can retry with backoff.
async fn run_session_refresher(source: Arc<CodePenSource>, period: Duration) -> Result<()> {
    loop {
        source
            .refresh_session()
            .await
            .context("Session refresh failed")?;
        tracing::info!(source = source.name(), "Source session refreshed");
        tokio::time::sleep(period).await;
    }
}

fn next_backoff(current: u64, max: u64) -> u64 {
    current.saturating_mul(2).min(max)
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => {
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double after sleeping so the first failure waits the initial backoff
            backoff = next_backoff(backoff, max_backoff);
        }
    })
}
