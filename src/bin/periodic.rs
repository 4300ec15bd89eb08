use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{fs::OpenOptions, path::Path, time::SystemTime};
use sqlx::PgPool;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ultrazend::{
    delivery::DeliveryConfig, dns::DnsResolver, init_tracing, run_delivery_worker_pool,
    run_verifier, shutdown_signal, verifier::VerifierConfig,
};

/// Convenience binary bundling the two background sweeps (C3 domain
/// verification, C10 delivery dispatch) that don't need a dedicated
/// connection listener, for deployments that would rather run one
/// background worker than three processes.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options =
        PgConnectOptions::from_url(&database_url)?.application_name("ultrazend-periodic");

    let pool: PgPool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let dns = DnsResolver::new(Default::default());

    let shutdown = CancellationToken::new();

    run_verifier(pool.clone(), dns.clone(), VerifierConfig::default(), shutdown.clone());
    run_delivery_worker_pool(pool, dns, DeliveryConfig::from_env(), shutdown.clone());

    let shutdown_clone = shutdown.clone();
    let healthcheck = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => update_healthcheck("periodic"),
                _ = shutdown_clone.cancelled() => break,
            }
        }
    });

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();
    healthcheck.abort();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}

/// Updates the modification timestamp on a sentinel file so an external
/// process monitor can detect a hung event loop by its staleness.
fn update_healthcheck(name: &'static str) {
    let mut path = Path::new("/tmp").join(name);
    path.add_extension("healthcheck");
    if let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .inspect_err(|err| error!("failed to update healthcheck file: {err}"))
    {
        file.set_modified(SystemTime::now())
            .inspect_err(|err| error!("failed to update healthcheck file: {err}"))
            .ok();
    }
}
