//! C8: HTTP submission API + C12's tracking endpoints, mounted on the same
//! listener.
//!
//! `ApiServer`/`ApiState` with `FromRef`-based state, `TraceLayer` +
//! `TimeoutLayer`, graceful shutdown via `CancellationToken`. A pure JSON
//! API — no dashboard UI, authentication is the bearer-token `TenantAuth`
//! extractor.

mod auth;
pub mod domains;
mod error;
pub mod messages;
mod validation;

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    response::{IntoResponse, Redirect},
    routing::get,
};
use serde::Serialize;
use sqlx::PgPool;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::models::{
    CredentialRepository, DomainRepository, EventRepository, MessageRepository, QueueRepository,
    SuppressionRepository, TenantRepository,
};
use crate::quota::QuotaController;
use crate::submission::SubmissionPipeline;
use crate::tenant_context::TenantContextService;
use crate::tracking::Tracker;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: PgPool,
    credentials: CredentialRepository,
    messages: MessageRepository,
    domains: DomainRepository,
    pipeline: SubmissionPipeline,
    tenant_context: TenantContextService,
    tracker: Tracker,
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for CredentialRepository {
    fn from_ref(state: &ApiState) -> Self {
        state.credentials.clone()
    }
}

impl FromRef<ApiState> for MessageRepository {
    fn from_ref(state: &ApiState) -> Self {
        state.messages.clone()
    }
}

impl FromRef<ApiState> for DomainRepository {
    fn from_ref(state: &ApiState) -> Self {
        state.domains.clone()
    }
}

impl FromRef<ApiState> for SubmissionPipeline {
    fn from_ref(state: &ApiState) -> Self {
        state.pipeline.clone()
    }
}

impl FromRef<ApiState> for TenantContextService {
    fn from_ref(state: &ApiState) -> Self {
        state.tenant_context.clone()
    }
}

impl FromRef<ApiState> for Tracker {
    fn from_ref(state: &ApiState) -> Self {
        state.tracker.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(socket: SocketAddr, pool: PgPool, shutdown: CancellationToken) -> ApiServer {
        let state = ApiState {
            credentials: CredentialRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            domains: DomainRepository::new(pool.clone()),
            pipeline: SubmissionPipeline::new(
                MessageRepository::new(pool.clone()),
                DomainRepository::new(pool.clone()),
                SuppressionRepository::new(pool.clone()),
                QueueRepository::new(pool.clone()),
                EventRepository::new(pool.clone()),
                QuotaController::new(pool.clone()),
            ),
            tenant_context: TenantContextService::new(TenantRepository::new(pool.clone())),
            tracker: Tracker::new(MessageRepository::new(pool.clone()), EventRepository::new(pool.clone())),
            pool,
        };

        let router = Router::new()
            .route("/healthy", get(healthy))
            .route("/v1/emails", axum::routing::post(messages::send))
            .route("/v1/emails/batch", axum::routing::post(messages::send_batch))
            .route("/v1/messages/{id}", get(messages::get_message))
            .route(
                "/v1/domains",
                get(domains::list_domains).post(domains::create_domain),
            )
            .route("/v1/domains/{id}", get(domains::get_domain))
            .route("/v1/domains/{id}/status", get(domains::get_domain_status))
            .route("/v1/track/open/{token}", get(track_open))
            .route("/v1/track/click/{token}", get(track_click))
            .layer((TraceLayer::new_for_http(), TimeoutLayer::new(Duration::from_secs(10))))
            .with_state(state);

        ApiServer { socket, router, shutdown }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket).await.map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {:?}", e);
                token.cancel();
                error!("shutting down API server")
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

#[derive(Debug, Serialize)]
struct HealthyResponse {
    healthy: bool,
    status: &'static str,
}

async fn healthy(State(pool): State<PgPool>) -> Json<HealthyResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthyResponse { healthy: true, status: "OK" }),
        Err(e) => {
            error!("database error: {:?}", e);
            Json(HealthyResponse { healthy: false, status: "database error" })
        }
    }
}

/// Always 200 with the pixel, whether or not `token` resolved — an
/// unauthenticated tracking link must never leak whether it was valid.
async fn track_open(State(tracker): State<Tracker>, Path(token): Path<String>) -> impl IntoResponse {
    if let Err(err) = tracker.record_open(&token).await {
        error!("failed to record open event: {err}");
    }

    ([(axum::http::header::CONTENT_TYPE, "image/gif")], crate::tracking::PIXEL_GIF)
}

#[derive(serde::Deserialize)]
struct ClickQuery {
    url: String,
}

/// Redirects to `url` after recording the click, or to the bare `url`
/// unconditionally if the token didn't resolve — a broken tracking link
/// must never strand the recipient.
async fn track_click(
    State(tracker): State<Tracker>,
    Path(token): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ClickQuery>,
) -> impl IntoResponse {
    match tracker.record_click(&token, &query.url).await {
        Ok(Some(target)) => Redirect::to(target.as_str()),
        Ok(None) => Redirect::to(&query.url),
        Err(err) => {
            error!("failed to record click event: {err}");
            Redirect::to(&query.url)
        }
    }
}
