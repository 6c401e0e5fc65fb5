use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tiercache_engine::{BackgroundTasks, CacheEngine};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::AppConfig,
    handlers::{self, AppState},
};

pub fn build_app(engine: CacheEngine, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Peer protocol
        .route(
            "/cache/{key}",
            get(handlers::peer_get)
                .put(handlers::peer_put)
                .delete(handlers::peer_delete),
        )
        // Administration
        .route(
            "/admin/metrics",
            get(handlers::admin_metrics).delete(handlers::admin_reset_metrics),
        )
        .route("/admin/invalidate/{token}", post(handlers::admin_invalidate))
        .route("/admin/nodes", get(handlers::admin_nodes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::debug!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(AppState { engine })
}

pub struct ServerBuilder {
    config: AppConfig,
}

pub struct TiercacheServer {
    addr: SocketAddr,
    app: Router,
    engine: CacheEngine,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Create the engine and its backing store, and assemble the router.
    pub async fn build(self) -> anyhow::Result<TiercacheServer> {
        let engine = CacheEngine::from_config(self.config.engine.clone()).await?;
        let app = build_app(engine.clone(), &self.config);
        Ok(TiercacheServer {
            addr: self.config.addr(),
            app,
            engine,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TiercacheServer {
    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    /// Serve until Ctrl+C, then stop the background tasks.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let tasks: BackgroundTasks = self.engine.start_background_tasks();

        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        tasks.shutdown().await;
        tracing::info!("background tasks stopped");
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
