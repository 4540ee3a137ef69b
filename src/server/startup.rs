//! Testable server startup logic
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real server on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly. Production startup runs
//! the same code path.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::admin::admin_router;
use super::beacon::beacon_handler;
use super::health::health_handler;
use super::ratelimit::{ingress_limit_middleware, IngressLimiter};
use super::ws::ws_handler;
use super::AppState;

use crate::bus::{self, BusError, CommandBus};
use crate::config::Config;
use crate::geoip::GeoIpResolver;
use crate::limiter::RateLimiter;
use crate::maintenance;
use crate::registry::SessionRegistry;
use crate::sink::{self, EventSink};
use crate::store::{spawn_writer, EventLogStore, SessionStore, StoreError};

/// How long shutdown waits for in-flight connections before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("required store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("required bus unavailable: {0}")]
    Bus(#[from] BusError),
}

/// Everything needed to start a server.
pub struct ServerConfig {
    pub config: Config,
    pub bind_address: SocketAddr,
    /// When `false` (tests), the maintenance loop is not spawned. The write
    /// worker, sink flusher, and bus subscriber always run; they are part of
    /// the serving path.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Config for integration tests: loopback, OS-assigned port, in-memory
    /// bus, no stores, no maintenance loop.
    pub fn for_testing(mut config: Config) -> Self {
        if config.admin.api_key.is_empty() {
            config.admin.api_key = "test-key".to_string();
        }
        ServerConfig {
            config,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_background_tasks: false,
        }
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
    worker_tasks: Vec<JoinHandle<()>>,
    pub state: Arc<AppState>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Graceful shutdown: stop accepting, stop the subscriber, drain the
    /// sink and write queue, close sockets, close the stores.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let closed = self.state.registry.close_all_connections("shutting_down");
        if closed > 0 {
            info!(target: "server", closed, "closing live connections");
        }
        for task in self.worker_tasks {
            let _ = task.await;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.serve_task)
            .await
            .is_err()
        {
            warn!(target: "server", "serve task did not stop in time");
            self.serve_task.abort();
        }
        self.state.sessions.close().await;
        info!(target: "server", "shutdown complete");
    }
}

/// Assemble the application router: HTTP surface behind the ingress
/// limiter, WebSocket endpoint beside it.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ingress = IngressLimiter::new(state.config.ingress.clone());

    let http: Router = Router::new()
        .route("/health", get(health_handler))
        .route("/beacon", post(beacon_handler))
        .with_state(state.clone())
        .nest("/admin", admin_router(state.clone()))
        .layer(middleware::from_fn_with_state(
            ingress,
            ingress_limit_middleware,
        ));

    let ws: Router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    http.merge(ws)
}

/// Build shared state: stores (or their degraded stand-ins), bus, limiter,
/// registry, sink, write worker.
async fn build_state(
    config: Arc<Config>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<(Arc<AppState>, Vec<JoinHandle<()>>), StartupError> {
    let geoip = Arc::new(match &config.geoip.database_path {
        Some(path) => match GeoIpResolver::from_csv_path(path) {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(target: "server", %err, "geoip database unavailable, lookups will miss");
                GeoIpResolver::empty()
            }
        },
        None => GeoIpResolver::empty(),
    });

    let sessions = match SessionStore::connect(&config.store).await {
        Ok(store) => Arc::new(store),
        Err(err) if config.store.required => return Err(err.into()),
        Err(err) => {
            warn!(target: "store", %err, "postgres unavailable, running degraded");
            Arc::new(SessionStore::disabled(&config.store))
        }
    };
    let events = match EventLogStore::connect(&config.store).await {
        Ok(store) => Arc::new(store),
        Err(err) if config.store.required => return Err(err.into()),
        Err(err) => {
            warn!(target: "store", %err, "clickhouse unavailable, running degraded");
            Arc::new(EventLogStore::disabled(&config.store))
        }
    };
    let bus = match &config.store.redis_url {
        Some(url) => match CommandBus::connect_redis(url).await {
            Ok(bus) => Arc::new(bus),
            Err(err) if config.store.required => return Err(err.into()),
            Err(err) => {
                warn!(target: "bus", %err, "redis unavailable, using in-process bus");
                Arc::new(CommandBus::in_memory())
            }
        },
        None => Arc::new(CommandBus::in_memory()),
    };

    let (writer, writer_task) = spawn_writer(sessions.clone(), events.clone(), shutdown_rx.clone());
    let sink_queue = Arc::new(EventSink::new());
    let limiter = Arc::new(RateLimiter::new(config.limiter.clone()));
    let registry = Arc::new(SessionRegistry::new());

    let state = Arc::new(AppState::new(
        config,
        limiter,
        registry.clone(),
        bus.clone(),
        sink_queue.clone(),
        sessions,
        events.clone(),
        writer.clone(),
        geoip,
    ));

    let flusher_task = tokio::spawn(sink::run_flusher(
        sink_queue,
        events,
        shutdown_rx.clone(),
    ));
    let subscriber_task = tokio::spawn(bus::run_subscriber(
        bus,
        registry,
        writer,
        shutdown_rx.clone(),
    ));

    Ok((state, vec![writer_task, flusher_task, subscriber_task]))
}

/// Start a server from the given configuration.
pub async fn run_server_with_config(
    server_config: ServerConfig,
) -> Result<ServerHandle, StartupError> {
    let config = Arc::new(server_config.config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (state, mut worker_tasks) = build_state(config.clone(), &shutdown_rx).await?;
    if server_config.spawn_background_tasks {
        worker_tasks.push(tokio::spawn(maintenance::run(
            state.clone(),
            shutdown_rx.clone(),
        )));
    }

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(server_config.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            addr: server_config.bind_address,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
        addr: server_config.bind_address,
        source,
    })?;

    let mut serve_shutdown = shutdown_rx.clone();
    let serve_task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await;
        if let Err(err) = result {
            error!(target: "server", %err, "serve loop failed");
        }
    });

    info!(
        target: "server",
        addr = %local_addr,
        bus = state.bus.backend_name(),
        postgres = state.sessions.is_enabled(),
        clickhouse = state.events.is_enabled(),
        "listening"
    );

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        serve_task,
        worker_tasks,
        state,
    })
}
