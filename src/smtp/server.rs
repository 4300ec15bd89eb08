use crate::{
    models::CredentialRepository,
    smtp::{
        SmtpConfig,
        connection::{self, ConnectionError},
        limiter::{ConnectionLimiter, SessionLimiter},
    },
    submission::SubmissionPipeline,
    tenant_context::TenantContextService,
};
use rand::random_range;
use sqlx::PgPool;
use std::{fs::File, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{net::TcpListener, select, sync::RwLock};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    credentials: CredentialRepository,
    tenant_context: TenantContextService,
    pipeline: SubmissionPipeline,
    connection_limiter: ConnectionLimiter,
    shutdown: CancellationToken,
    config: Arc<SmtpConfig>,
}

impl SmtpServer {
    pub fn new(pool: PgPool, config: Arc<SmtpConfig>, shutdown: CancellationToken) -> SmtpServer {
        SmtpServer {
            credentials: CredentialRepository::new(pool.clone()),
            tenant_context: TenantContextService::new(crate::models::TenantRepository::new(pool.clone())),
            pipeline: SubmissionPipeline::new(
                crate::models::MessageRepository::new(pool.clone()),
                crate::models::DomainRepository::new(pool.clone()),
                crate::models::SuppressionRepository::new(pool.clone()),
                crate::models::QueueRepository::new(pool.clone()),
                crate::models::EventRepository::new(pool.clone()),
                crate::quota::QuotaController::new(pool),
            ),
            connection_limiter: ConnectionLimiter::new(config.limiter),
            shutdown,
            config,
        }
    }

    async fn load_tls_config(
        config: &SmtpConfig,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        let mut cert_reader = io::BufReader::new(
            File::open(&config.cert_file).map_err(SmtpServerError::Certificate)?,
        );
        let mut key_reader = io::BufReader::new(
            File::open(&config.key_file).map_err(SmtpServerError::PrivateKey)?,
        );

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok((certs, key))
    }

    async fn build_tls_acceptor(config: &SmtpConfig) -> Result<TlsAcceptor, SmtpServerError> {
        let (certs, key) = Self::load_tls_config(config).await?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let SmtpServer {
            credentials,
            tenant_context,
            pipeline,
            connection_limiter,
            shutdown,
            config,
        } = self;

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = Arc::new(RwLock::new(Self::build_tls_acceptor(&config).await?));

        info!("smtp server on {}", config.listen_addr);

        let certificate_reload_interval =
            Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
        debug!(
            "Automatically reloading the SMTP certificate every {:?}",
            certificate_reload_interval
        );

        let server_name = config.server_name.clone();
        let limiter_config = config.limiter;

        let acceptor_clone = acceptor.clone();
        let reload_config = config.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(certificate_reload_interval);
            loop {
                interval.tick().await;
                info!("Reloading the SMTP TLS certificate");
                match Self::build_tls_acceptor(&reload_config).await {
                    Ok(new_acceptor) => *acceptor_clone.write().await = new_acceptor,
                    Err(err) => error!("failed to reload TLS certificate: {err}"),
                }
            }
        });

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down smtp server");

                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let Some(guard) = connection_limiter.accept(peer_addr.ip()).await else {
                            trace!(%peer_addr, "rejecting connection: per-IP connection limit reached");
                            continue;
                        };

                        trace!(
                            source_ip=peer_addr.ip().to_string(),
                            source_port=peer_addr.port(),
                            "new TCP connection"
                        );

                        let acceptor = acceptor.clone();
                        let server_name = server_name.clone();
                        let credentials = credentials.clone();
                        let tenant_context = tenant_context.clone();
                        let pipeline = pipeline.clone();
                        let limits = SessionLimiter::new(limiter_config);

                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(err) = connection::handle(
                                stream,
                                acceptor,
                                &server_name,
                                peer_addr,
                                credentials,
                                tenant_context,
                                pipeline,
                                limits,
                            )
                            .await
                            {
                                let error_string = err.to_string();
                                if let ConnectionError::Accept(e) = &err
                                    && (e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::ConnectionReset) {
                                        trace!("failed to handle connection: {error_string}");
                                        return
                                    }
                                error!("failed to handle connection: {error_string}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        });
    }
}
