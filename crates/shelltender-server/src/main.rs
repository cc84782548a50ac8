//! Shelltender server
//!
//! Terminal-multiplexing server: spawns PTY sessions, persists their output
//! across disconnects and fans scrollback plus live output out to WebSocket
//! clients, with a data pipeline and pattern engine in the path.

pub mod admin_proxy;
pub mod handlers;
pub mod registry;

use admin_proxy::AdminProxy;
use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use registry::ClientRegistry;
use shelltender_core::pipeline::processors::{CreditCardRedactor, RateLimiter};
use shelltender_core::{
    BufferManager, Environment, PatternEngine, Pipeline, ServerConfig, SessionEvent,
    SessionManager, SessionStore,
};
use shelltender_types::{DataSource, ServerMessage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Rate limit applied when `enableRateLimit` is on.
const DEFAULT_RATE_LIMIT_BYTES_PER_SEC: usize = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub manager: SessionManager,
    pub buffers: Arc<BufferManager>,
    pub pipeline: Arc<Pipeline>,
    pub patterns: Arc<PatternEngine>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<ClientRegistry>,
    pub admin_proxy: Arc<AdminProxy>,
    pub started_at: Instant,
}

#[derive(Debug, Parser)]
#[command(name = "shelltender-server", about = "Terminal-multiplexing server")]
struct Args {
    /// JSON configuration file (alternative to environment variables).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen port; overrides SHELLTENDER_PORT.
    #[arg(long)]
    port: Option<u16>,
    /// WebSocket path; overrides SHELLTENDER_WS_PATH.
    #[arg(long)]
    ws_path: Option<String>,
    /// Session store directory; overrides SHELLTENDER_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting shelltender-server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run_server().await {
        error!("server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    let args = Args::parse();

    let (mut config, mut warnings) = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config file {path:?}"))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("config file is not valid JSON")?;
            ServerConfig::from_value(value)
        }
        None => ServerConfig::from_env(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ws_path) = args.ws_path {
        config.ws_path = ws_path;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    warnings.extend(config.validate());
    for warning in warnings {
        warn!("config: {}", warning);
    }

    let state = build_state(config).await?;

    let restored = state.manager.restore_all().await;
    if restored > 0 {
        info!("restored {} sessions from disk", restored);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        "listening on {} (ws path {}, data dir {:?})",
        addr, state.config.ws_path, state.config.data_dir
    );

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("persisting sessions before exit");
    state.manager.persist_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Construct the component tree bottom-up and wire the data path. Fails
/// only on startup-fatal conditions (unusable data directory).
pub async fn build_state(config: ServerConfig) -> Result<AppState> {
    let config = Arc::new(config);

    let store = Arc::new(SessionStore::new(config.data_dir.clone()));
    store
        .init()
        .await
        .with_context(|| format!("failed to create data directory {:?}", config.data_dir))?;

    let buffers = Arc::new(BufferManager::new(config.buffer_cap));
    let pipeline = Arc::new(Pipeline::new());
    let patterns = Arc::new(PatternEngine::new());
    let registry = Arc::new(ClientRegistry::new(config.overflow_policy));
    let manager = SessionManager::new(
        store.clone(),
        buffers.clone(),
        pipeline.clone(),
        config.max_sessions,
    );
    let admin_proxy = Arc::new(AdminProxy::new(
        manager.clone(),
        buffers.clone(),
        registry.clone(),
    ));

    if config.enable_pipeline {
        install_default_processors(&pipeline, &config);
    }
    wire_data_path(&pipeline, &buffers, &patterns, &registry);
    spawn_event_forwarder(&manager, &patterns, &registry);
    spawn_idle_reaper(&manager, &registry, &config);

    Ok(AppState {
        config,
        manager,
        buffers,
        pipeline,
        patterns,
        store,
        registry,
        admin_proxy,
        started_at: Instant::now(),
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = match state.config.environment {
        Environment::Development => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        Environment::Production => match &state.config.cors_origin {
            Some(origin) => match origin.parse::<HeaderValue>() {
                Ok(value) => CorsLayer::new().allow_origin(value),
                Err(_) => {
                    warn!("invalid corsOrigin {:?}; denying cross-origin requests", origin);
                    CorsLayer::new()
                }
            },
            None => CorsLayer::new(),
        },
    };

    Router::new()
        .route(&state.config.ws_path, get(handlers::ws::handler))
        .route("/api/health", get(handlers::health))
        .route("/api/sessions", get(handlers::sessions::list))
        .route("/api/sessions/:id", delete(handlers::sessions::delete))
        .route("/api/admin/sessions", get(handlers::admin::list))
        .route("/api/admin/sessions/bulk", post(handlers::admin::bulk))
        .route("/api/admin/sessions/kill-all", post(handlers::admin::kill_all))
        .route(
            "/api/admin/sessions/:id",
            get(handlers::admin::detail).delete(handlers::admin::kill),
        )
        .route("/api/shelltender/doctor", get(handlers::admin::doctor))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn install_default_processors(pipeline: &Arc<Pipeline>, config: &Arc<ServerConfig>) {
    if config.enable_security {
        pipeline.add_processor(Arc::new(CreditCardRedactor::new()));
    }
    if config.enable_rate_limit {
        pipeline.add_processor(Arc::new(RateLimiter::new(DEFAULT_RATE_LIMIT_BYTES_PER_SEC)));
    }
}

/// The canonical fan-out for every processed chunk: buffer append (which
/// assigns the sequence), subscriber broadcast, monitor firehose, bell
/// detection and pattern scanning. Restored replays are skipped — their
/// bytes were seeded into the buffer directly and stale pattern alerts
/// must not re-fire.
fn wire_data_path(
    pipeline: &Arc<Pipeline>,
    buffers: &Arc<BufferManager>,
    patterns: &Arc<PatternEngine>,
    registry: &Arc<ClientRegistry>,
) {
    let buffers = buffers.clone();
    let patterns = patterns.clone();
    let registry = registry.clone();
    pipeline.on_data(move |event| {
        if event.metadata.source == DataSource::Restored {
            return;
        }
        let Some(sequence) = buffers.append(&event.session_id, &event.processed_data) else {
            return;
        };

        let text = String::from_utf8_lossy(&event.processed_data);
        registry.broadcast_output(&event.session_id, &text, sequence);
        registry.broadcast_monitor(&event.session_id, &text, sequence);

        if event.processed_data.contains(&0x07) {
            registry.broadcast_to_session(
                &event.session_id,
                ServerMessage::Bell {
                    session_id: event.session_id.clone(),
                },
            );
        }

        for (pattern_id, terminal_event) in patterns.scan(&event.session_id, &event.processed_data)
        {
            if let Some(owner) = registry.pattern_owner(&pattern_id) {
                let event_type = terminal_event.type_name();
                registry.send_event(
                    &owner,
                    ServerMessage::TerminalEvent {
                        session_id: event.session_id.clone(),
                        pattern_id,
                        event: terminal_event,
                    },
                    event_type,
                );
            }
        }
    });
}

/// Forwards session lifecycle events as `exit` frames and tears down the
/// per-session state afterwards.
fn spawn_event_forwarder(
    manager: &SessionManager,
    patterns: &Arc<PatternEngine>,
    registry: &Arc<ClientRegistry>,
) {
    let mut events = manager.subscribe_events();
    let patterns = patterns.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Exited {
                    session_id,
                    exit_code,
                }) => {
                    registry.broadcast_to_session(
                        &session_id,
                        ServerMessage::Exit {
                            session_id: session_id.clone(),
                            reason: None,
                            exit_code,
                        },
                    );
                    registry.drop_session(&session_id);
                    patterns.clear_session(&session_id);
                }
                Ok(SessionEvent::SessionEnd { session_id, reason }) => {
                    registry.broadcast_to_session(
                        &session_id,
                        ServerMessage::Exit {
                            session_id: session_id.clone(),
                            reason,
                            exit_code: None,
                        },
                    );
                    registry.drop_session(&session_id);
                    patterns.clear_session(&session_id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event forwarder lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Suspends sessions with no subscribers and no PTY output for the
/// configured timeout; suspended sessions keep their stored record and are
/// resurrected on the next restart.
fn spawn_idle_reaper(
    manager: &SessionManager,
    registry: &Arc<ClientRegistry>,
    config: &Arc<ServerConfig>,
) {
    let Some(timeout) = config.session_idle_timeout() else {
        return;
    };
    let manager = manager.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for session in manager.get_all().await {
                if registry.subscriber_count(&session.id) > 0 {
                    continue;
                }
                let idle = manager
                    .last_output(&session.id)
                    .await
                    .map(|at| at.elapsed() >= timeout)
                    .unwrap_or(false);
                if idle {
                    if let Err(e) = manager.suspend(&session.id, "idle-timeout").await {
                        warn!("failed to suspend idle session {}: {}", session.id, e);
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
