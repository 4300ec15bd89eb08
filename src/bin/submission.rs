use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ultrazend::{Environment, SmtpConfig, init_tracing, run_smtp_server, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options =
        PgConnectOptions::from_url(&database_url)?.application_name("ultrazend-submission");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let smtp_config = SmtpConfig {
        listen_addr: std::env::var("SMTP_SOCKET")
            .unwrap_or_else(|_| "0.0.0.0:2525".to_string())
            .parse()
            .context("SMTP_SOCKET must be a valid socket address")?,
        cert_file: std::env::var("SMTP_CERT_FILE")
            .context("SMTP_CERT_FILE must be set")?
            .into(),
        key_file: std::env::var("SMTP_KEY_FILE")
            .context("SMTP_KEY_FILE must be set")?
            .into(),
        server_name: std::env::var("SMTP_SERVER_NAME").context("SMTP_SERVER_NAME must be set")?,
        environment: Environment::from_env(),
        limiter: Default::default(),
    };

    let shutdown = CancellationToken::new();

    run_smtp_server(pool, smtp_config, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
