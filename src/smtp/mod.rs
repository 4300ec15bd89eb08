//! C9: SMTP submission server.
//!
//! AUTH PLAIN verifies against the same `CredentialRepository` the HTTP
//! API uses, a completed `DATA` hands off into
//! [`crate::submission::SubmissionPipeline`], and TLS is opportunistic
//! (`STARTTLS`) rather than implicit — the listener accepts plaintext and
//! upgrades mid-connection, the way `connection.rs`'s `Stream` enum
//! documents.

mod connection;
pub mod limiter;
pub mod server;
mod session;

use std::{net::SocketAddr, path::PathBuf};

use crate::Environment;
use crate::smtp::limiter::LimiterConfig;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub listen_addr: SocketAddr,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub server_name: String,
    pub environment: Environment,
    pub limiter: LimiterConfig,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Capability, CredentialRepository, NewCredential, NewDomain, NewTenant, Plan, TenantRepository};
    use crate::smtp::server::SmtpServer;
    use mail_send::{SmtpClientBuilder, mail_builder::MessageBuilder};
    use sqlx::PgPool;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::crypto;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    async fn random_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    async fn setup_server(pool: PgPool) -> (CancellationToken, u16, String) {
        if crypto::CryptoProvider::get_default().is_none() {
            crypto::aws_lc_rs::default_provider().install_default().ok();
        }

        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants.create(&NewTenant { name: "Acme".to_string(), plan: Plan::Standard }).await.unwrap();

        let domains = crate::models::DomainRepository::new(pool.clone());
        domains
            .create(tenant.id(), &NewDomain { domain: "example.com".to_string() }, "uz")
            .await
            .unwrap();

        let credentials = CredentialRepository::new(pool.clone());
        let created = credentials
            .create(tenant.id(), &NewCredential { description: "smtp".to_string(), capabilities: vec![Capability::Send] })
            .await
            .unwrap();

        let port = random_port().await;
        let config = Arc::new(SmtpConfig {
            listen_addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port).into(),
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            server_name: "mail.example.com".to_string(),
            environment: Environment::Development,
            limiter: LimiterConfig::default(),
        });

        let shutdown = CancellationToken::new();
        let server = SmtpServer::new(pool, config, shutdown.clone());
        tokio::spawn(async move {
            server.serve().await.ok();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        (shutdown, port, created.token().to_string())
    }

    /// A bearer token authenticates AUTH PLAIN with any username — the
    /// password carries the whole `{credential_id}.{secret}` token, the
    /// same value the HTTP API accepts as a bearer token.
    #[sqlx::test]
    #[traced_test]
    async fn accepts_authenticated_submission(pool: PgPool) {
        let (shutdown, port, token) = setup_server(pool).await;

        let message = MessageBuilder::new()
            .from(("Acme", "sender@example.com"))
            .to(vec![("Someone", "someone@example.org")])
            .subject("Hi!")
            .text_body("Hello world!");

        SmtpClientBuilder::new("localhost", port)
            .implicit_tls(false)
            .allow_invalid_certs()
            .credentials(("ignored", token.as_str()))
            .connect()
            .await
            .unwrap()
            .send(message)
            .await
            .unwrap();

        shutdown.cancel();
    }

    #[sqlx::test]
    #[traced_test]
    async fn rejects_wrong_token(pool: PgPool) {
        let (shutdown, port, _token) = setup_server(pool).await;

        let result = SmtpClientBuilder::new("localhost", port)
            .implicit_tls(false)
            .allow_invalid_certs()
            .credentials(("ignored", "not-a-real-token"))
            .connect()
            .await;

        assert!(result.is_err());

        shutdown.cancel();
    }
}
