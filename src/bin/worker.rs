use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ultrazend::{
    delivery::DeliveryConfig, dns::DnsResolver, init_tracing, run_delivery_worker_pool,
    shutdown_signal,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("ultrazend-worker");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let dns = DnsResolver::new(Default::default());
    let delivery_config = DeliveryConfig::from_env();

    let shutdown = CancellationToken::new();

    run_delivery_worker_pool(pool, dns, delivery_config, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
