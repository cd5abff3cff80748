//! HTTP server
//!
//! Routes, shared state and the background session sweeper.

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::{users, vcenter};
use crate::auth::require_login;
use crate::config::{BackendKind, ServerConfig};
use crate::hypervisor::{HypervisorConnector, SimulatedConnector, VsphereConnector};
use crate::sessions::SessionRegistry;
use vmcaptain_common::Database;

/// State shared by every handler
pub struct AppState {
    pub db: Database,
    pub sessions: SessionRegistry,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(db: Database, connector: Arc<dyn HypervisorConnector>, config: ServerConfig) -> Self {
        let ttl = Duration::from_secs(config.sessions.vcenter_ttl_secs);
        Self {
            db,
            sessions: SessionRegistry::new(connector, ttl),
            config,
        }
    }

    /// Build state from config, opening the user store and picking the backend
    pub fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.db_path)?;
        let connector: Arc<dyn HypervisorConnector> = match config.backend {
            BackendKind::Vsphere => Arc::new(VsphereConnector),
            BackendKind::Simulated => Arc::new(SimulatedConnector::new()),
        };
        Ok(Self::new(db, connector, config))
    }

    /// Drop expired login and hypervisor sessions
    pub async fn purge_expired(&self) {
        if let Err(e) = self.db.purge_expired_sessions() {
            error!("Failed to purge login sessions: {}", e);
        }
        self.sessions.purge_expired().await;
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let db = Database::open_memory().expect("in-memory database");
        Self::new(db, Arc::new(SimulatedConnector::new()), ServerConfig::default())
    }
}

/// API server
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Create router
    pub fn router(&self) -> Router {
        let auth_layer = middleware::from_fn_with_state(self.state.clone(), require_login);

        let protected_routes = Router::new()
            .route("/api/auth/logout", post(users::logout))
            .route("/api/auth/whoami", get(users::whoami))
            .route("/api/users", get(users::list_users).post(users::add_user))
            .route("/api/users/password", put(users::change_password))
            .route("/api/users/:user_id", axum::routing::delete(users::delete_user))
            .route(
                "/api/users/:user_id/vms/:vm_id",
                put(users::assign_vm).delete(users::remove_vm),
            )
            .route("/api/vcenter/connect", post(vcenter::connect))
            .route("/api/vcenter/disconnect", post(vcenter::disconnect))
            .route("/api/vcenter/vms", get(vcenter::list_vms))
            .route("/api/vcenter/vms/:vm_id", get(vcenter::get_vm))
            .route("/api/vcenter/vms/:vm_id/power/:op", post(vcenter::power))
            .route(
                "/api/vcenter/vms/:vm_id/snapshots",
                get(vcenter::list_snapshots).post(vcenter::create_snapshot),
            )
            .route("/api/vcenter/vms/:vm_id/metrics", get(vcenter::metrics))
            .route("/api/vcenter/stats", get(vcenter::stats))
            .layer(auth_layer);

        Router::new()
            .route("/", get(index_handler))
            .route("/health", get(health_handler))
            .route("/api/auth/login", post(users::login))
            .merge(protected_routes)
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until ctrl-c, then close every hypervisor session
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_with<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("VM Captain API starting on http://{}", listener.local_addr()?);

        let sweeper = tokio::spawn(purge_loop(
            self.state.clone(),
            Duration::from_secs(self.state.config.sessions.purge_interval_secs.max(1)),
        ));

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        sweeper.abort();
        self.state.sessions.shutdown().await;
        info!("VM Captain API shutdown complete");
        Ok(())
    }
}

async fn purge_loop(state: Arc<AppState>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.purge_expired().await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

// ============================================================================
// Handlers
// ============================================================================

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "VM Captain API is running",
        "version": vmcaptain_common::VERSION,
    }))
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let vcenter = &state.config.vcenter;
    Json(serde_json::json!({
        "status": "ok",
        "service": "vmcaptain",
        "backend": state.config.backend.to_string(),
        "active_sessions": state.sessions.len(),
        "config": {
            "vcenter_url": vcenter.url,
            "vcenter_username": vcenter.username,
            "ignore_ssl": vcenter.ignore_ssl,
        },
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Not found"})),
    )
}
