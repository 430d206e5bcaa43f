//! inboxd server: state wiring, HTTP stack and CLI entry points.

use crate::config::InboxConfig;
use crate::dispatch::Dispatcher;
use crate::http_auth;
use crate::ingest::Ingestor;
use crate::routes;
use crate::scheduler::{Scheduler, SchedulerSettings, SweepReport};
use crate::seed::{self, SeedFile};
use crate::turn::{TurnEngine, TurnSettings};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::response::Response;
use chrono::Utc;
use inbox_channels::ChannelRegistry;
use inbox_llm::{ChatModel, LlmClient};
use inbox_store::Store;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: InboxConfig,
    pub store: Store,
    pub channels: ChannelRegistry,
    pub ingestor: Ingestor,
    pub dispatcher: Dispatcher,
    /// `None` when no LLM key is configured: ingest still runs, sweeps are
    /// refused.
    pub scheduler: Option<Arc<Scheduler>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: InboxConfig,
        store: Store,
        channels: ChannelRegistry,
        model: Option<Arc<dyn ChatModel>>,
    ) -> Self {
        let dispatcher = Dispatcher::new(store.clone(), channels.clone());
        let ingestor = Ingestor::new(store.clone(), channels.clone(), config.profile_timeout());
        let scheduler = model.map(|model| {
            let engine = TurnEngine::new(
                store.clone(),
                model,
                dispatcher.clone(),
                TurnSettings {
                    system_prompt: config.llm.system_prompt.clone(),
                    history_limit: config.pipeline.history_limit,
                    model_timeout: config.llm_timeout(),
                },
            );
            Arc::new(Scheduler::new(
                store.clone(),
                Arc::new(engine),
                SchedulerSettings {
                    reply_lookback_seconds: config.pipeline.reply_lookback_seconds,
                    settle_seconds: config.pipeline.settle_seconds,
                    lock_ttl: chrono::Duration::seconds(config.pipeline.lock_ttl_seconds),
                    max_concurrent_turns: config.pipeline.max_concurrent_turns,
                },
            ))
        });
        Self {
            config,
            store,
            channels,
            ingestor,
            dispatcher,
            scheduler,
            started_at: Instant::now(),
        }
    }

    fn from_config(cfg: InboxConfig) -> Result<Self> {
        let store = open_store(&cfg)?;
        let channels = ChannelRegistry::with_default_adapters()?;
        let model = build_model(&cfg)?;
        Ok(Self::new(cfg, store, channels, model))
    }
}

fn open_store(cfg: &InboxConfig) -> Result<Store> {
    let path = cfg.database_path()?;
    let store = Store::open(&path)
        .map_err(|e| anyhow::anyhow!("open database {}: {e}", path.display()))?;
    tracing::info!(database_path = %path.display(), "store opened");
    Ok(store)
}

fn build_model(cfg: &InboxConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    let Some(api_key) = cfg.api_key_for_model() else {
        tracing::warn!(model = %cfg.llm.model, "no api key for model; AI replies disabled");
        return Ok(None);
    };
    let client = LlmClient::new(&api_key, &cfg.llm.model, cfg.llm_timeout())?
        .with_base_url(cfg.llm.base_url.clone());
    tracing::info!(model = %cfg.llm.model, provider = ?client.provider(), "llm client initialized");
    Ok(Some(Arc::new(client)))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = InboxConfig::load_with_path(config_path).await?;
    let store = open_store(&cfg)?;
    store.ping().await?;
    let workspaces = store.list_workspaces().await?;
    tracing::info!(
        config_path = %path.display(),
        model = %cfg.llm.model,
        llm_key_configured = cfg.api_key_for_model().is_some(),
        meta_signature_check = cfg.webhooks.meta_app_secret.is_some(),
        operator_auth = cfg.server.control_api_token.is_some(),
        workspaces = workspaces.len(),
        "config ok"
    );
    Ok(())
}

pub async fn sweep_once(config_path: Option<PathBuf>) -> Result<SweepReport> {
    let cfg = InboxConfig::load(config_path).await?;
    let state = AppState::from_config(cfg)?;
    let scheduler = state
        .scheduler
        .ok_or_else(|| anyhow::anyhow!("no llm api key configured; cannot run a sweep"))?;
    scheduler.sweep(Utc::now()).await
}

pub async fn seed(config_path: Option<PathBuf>, file: &Path) -> Result<seed::SeedReport> {
    let cfg = InboxConfig::load(config_path).await?;
    let store = open_store(&cfg)?;
    let fixture = SeedFile::load(file).await?;
    seed::apply(&store, &fixture).await
}

/// Router with the full middleware stack.
pub fn app(state: Arc<AppState>) -> axum::Router {
    let policy = http_auth::OperatorAuthPolicy::new(state.config.server.control_api_token.as_deref());
    let max_in_flight = state.config.server.http_max_in_flight;
    let timeout = Duration::from_secs(state.config.server.http_timeout_seconds);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router(timeout)
        .layer(Extension(http_auth::OperatorAuthPolicyExt(policy)))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = InboxConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        model = %cfg.llm.model,
        reply_lookback_seconds = cfg.pipeline.reply_lookback_seconds,
        settle_seconds = cfg.pipeline.settle_seconds,
        lock_ttl_seconds = cfg.pipeline.lock_ttl_seconds,
        history_limit = cfg.pipeline.history_limit,
        max_concurrent_turns = cfg.pipeline.max_concurrent_turns,
        embedded_interval_seconds = ?cfg.scheduler.embedded_interval_seconds,
        meta_signature_check = cfg.webhooks.meta_app_secret.is_some(),
        operator_auth = cfg.server.control_api_token.is_some(),
        "server configuration loaded"
    );
    if cfg.server.control_api_token.is_none() && !addr.ip().is_loopback() {
        tracing::warn!(%addr, "operator API is unauthenticated on a non-loopback address");
    }

    let listener = preflight_bind_listener(addr).await?;
    let state = Arc::new(AppState::from_config(cfg)?);
    tracing::info!(
        channels = ?state.channels.channels(),
        ai_enabled = state.scheduler.is_some(),
        "pipeline initialized"
    );

    let shutdown = CancellationToken::new();
    let ticker = match (&state.scheduler, state.config.scheduler.embedded_interval_seconds) {
        (Some(scheduler), Some(seconds)) => Some(tokio::spawn(Arc::clone(scheduler).run_every(
            Duration::from_secs(seconds),
            shutdown.child_token(),
        ))),
        _ => None,
    };

    tracing::info!(%addr, "inboxd serving");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Some(ticker) = ticker {
        match ticker.await {
            Ok(()) => tracing::info!("sweep ticker shutdown completed"),
            Err(e) => tracing::error!(error = %e, "sweep ticker join failed during shutdown"),
        }
    }
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
