//! API server — routes the control surface, webhook intake, and probes.

use crate::rest::{self, AppState};
use crate::webhook;
use axum::routing::{get, post};
use axum::Router;
use outreach_core::config::AppConfig;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the application router. Exposed separately so tests can
    /// drive it without binding a socket.
    pub fn router(state: AppState) -> Router {
        Router::new()
            // Campaign control surface
            .route(
                "/api/campaigns",
                get(rest::list_campaigns).post(rest::create_campaign),
            )
            .route(
                "/api/campaigns/:id",
                get(rest::get_campaign)
                    .put(rest::update_campaign)
                    .delete(rest::delete_campaign),
            )
            .route("/api/campaigns/:id/start", post(rest::start_campaign))
            .route("/api/campaigns/:id/pause", post(rest::pause_campaign))
            .route("/api/campaigns/:id/resume", post(rest::resume_campaign))
            // Segments
            .route(
                "/api/segments",
                get(rest::list_segments).post(rest::create_segment),
            )
            .route("/api/segments/preview", post(rest::preview_segment))
            .route("/api/segments/:id", get(rest::get_segment))
            .route("/api/segments/:id/sync", post(rest::sync_segment))
            // Follow-up sequences
            .route("/api/sequences", post(rest::create_sequence))
            .route("/api/sequences/:id/enroll", post(rest::enroll_contact))
            // Channel sessions
            .route("/api/sessions", get(rest::list_sessions))
            .route("/api/sessions/:name", get(rest::get_session))
            // Provider webhook
            .route("/api/webhooks/channel", post(webhook::handle_webhook))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/live", get(rest::liveness))
            // Middleware
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = Self::router(self.state.clone());
        let addr = SocketAddr::new(
            self.config.api.host.parse()?,
            self.config.api.http_port,
        );

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the Prometheus metrics exporter on its own port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.api.metrics_port,
            ))
            .install()?;

        info!(port = self.config.api.metrics_port, "Metrics exporter started");
        Ok(())
    }
}
