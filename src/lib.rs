use derive_more::FromStr;
use serde::Serialize;
use sqlx::PgPool;
use std::{env, net::SocketAddr, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
mod bounce;
pub mod delivery;
mod dkim;
pub mod dns;
mod models;
mod quota;
mod smtp;
mod submission;
mod tenant_context;
mod tracking;
pub mod verifier;

#[cfg(test)]
mod mock;

pub use smtp::{SmtpConfig, server::SmtpServer};

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=trace,tower_http=debug,axum=trace,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn run_api_server(pool: PgPool, http_socket: SocketAddr, shutdown: CancellationToken) {
    let api_server = api::ApiServer::new(http_socket, pool, shutdown);
    api_server.spawn();
}

pub fn run_smtp_server(pool: PgPool, smtp_config: SmtpConfig, shutdown: CancellationToken) {
    let smtp_server = SmtpServer::new(pool, Arc::new(smtp_config), shutdown);
    smtp_server.spawn();
}

pub fn run_delivery_worker_pool(
    pool: PgPool,
    dns: dns::DnsResolver,
    config: delivery::DeliveryConfig,
    shutdown: CancellationToken,
) {
    delivery::DeliveryWorkerPool::new(pool, dns, config, shutdown).spawn();
}

pub fn run_verifier(
    pool: PgPool,
    dns: dns::DnsResolver,
    config: verifier::VerifierConfig,
    shutdown: CancellationToken,
) {
    verifier::Verifier::new(
        models::DomainRepository::new(pool.clone()),
        models::DkimKeyRepository::new(pool),
        dns,
        config,
        shutdown,
    )
    .spawn();
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
