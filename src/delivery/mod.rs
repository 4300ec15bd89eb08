//! C10: Delivery worker pool.
//!
//! A bounded `Semaphore` of workers, one task per leased job, DKIM signing
//! via C2 and MX resolution via C1 before the network attempt, and a
//! `mail_send::Error` transient/permanent split driving per-tenant
//! concurrency admission against a persisted job queue.

pub mod connection_log;
pub mod send;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use mail_send::smtp;
use sqlx::PgPool;
use std::{net::IpAddr, sync::Arc};
use tokio::{sync::Semaphore, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounce::BounceHandler;
use crate::delivery::connection_log::{ConnectionLog, LogLevel};
use crate::delivery::send::{DeliveryError, backoff, deliver_to_domain};
use crate::dkim;
use crate::dns::DnsResolver;
use crate::models::{
    DkimKeyRepository, DomainRepository, EventKind, EventRepository, Message, MessageId,
    MessageRepository, MessageStatus, QueueJob, QueueRepository, Recipient, RecipientState,
    SuppressionRepository,
};
use crate::quota::QuotaController;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: i32,
}

impl Default for RetryConfig {
    /// `base = 60 s`, `maxDelay = 6 h`, `maxAttempts = 8`.
    fn default() -> Self {
        RetryConfig {
            base_secs: 60,
            max_delay_secs: 6 * 3600,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub ehlo_domain: String,
    pub allow_plain: bool,
    pub outbound_ip: IpAddr,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub global_concurrency: usize,
    pub retry: RetryConfig,
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        DeliveryConfig {
            ehlo_domain: std::env::var("SMTP_EHLO_DOMAIN")
                .expect("Missing SMTP_EHLO_DOMAIN environment variable"),
            allow_plain: std::env::var("ALLOW_PLAINTEXT_DELIVERY").is_ok(),
            outbound_ip: std::env::var("OUTBOUND_IP")
                .expect("Missing OUTBOUND_IP environment variable")
                .parse()
                .expect("OUTBOUND_IP must be a valid IP address"),
            lease_seconds: 600,
            batch_size: 50,
            global_concurrency: std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryWorkerPool {
    messages: MessageRepository,
    queue: QueueRepository,
    domains: DomainRepository,
    dkim_keys: DkimKeyRepository,
    quota: QuotaController,
    events: EventRepository,
    bounce: BounceHandler,
    dns: DnsResolver,
    global: Arc<Semaphore>,
    config: Arc<DeliveryConfig>,
    worker_id: Arc<str>,
    shutdown: CancellationToken,
}

impl DeliveryWorkerPool {
    pub fn new(pool: PgPool, dns: DnsResolver, config: DeliveryConfig, shutdown: CancellationToken) -> Self {
        DeliveryWorkerPool {
            messages: MessageRepository::new(pool.clone()),
            queue: QueueRepository::new(pool.clone()),
            domains: DomainRepository::new(pool.clone()),
            dkim_keys: DkimKeyRepository::new(pool.clone()),
            quota: QuotaController::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            bounce: BounceHandler::new(SuppressionRepository::new(pool.clone()), EventRepository::new(pool)),
            dns,
            global: Arc::new(Semaphore::new(config.global_concurrency)),
            config: Arc::new(config),
            worker_id: Arc::from(format!("worker-{}", std::process::id())),
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down delivery worker pool");
                        return;
                    }
                    _ = interval.tick() => {
                        self.lease_and_dispatch().await;
                    }
                }
            }
        })
    }

    async fn lease_and_dispatch(&self) {
        let jobs = match self
            .queue
            .lease_batch(&self.worker_id, self.config.lease_seconds, self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!("failed to lease delivery jobs: {err}");
                return;
            }
        };

        for job in jobs {
            let Ok(global_permit) = self.global.clone().acquire_owned().await else {
                return;
            };
            let tenant_semaphore = self.quota.concurrency_semaphore(job.tenant_id()).await;
            let worker = self.clone();

            tokio::spawn(async move {
                let _global_permit = global_permit;
                let Ok(_tenant_permit) = tenant_semaphore.acquire_owned().await else {
                    return;
                };
                worker.process_job(job).await;
            });
        }
    }

    #[tracing::instrument(skip(self, job), fields(message_id = %job.message_id(), recipient_id = %job.recipient_id()))]
    async fn process_job(&self, job: QueueJob) {
        if let Err(err) = self.attempt_delivery(&job).await {
            error!("delivery attempt failed: {err}");
        }
    }

    async fn attempt_delivery(&self, job: &QueueJob) -> Result<(), crate::models::Error> {
        let tenant_id = job.tenant_id();
        let message_id = job.message_id();

        let Some(message) = self.messages.find_by_id(tenant_id, message_id).await? else {
            warn!(%message_id, "message vanished before delivery, dropping job");
            self.queue.complete(job.id()).await?;
            return Ok(());
        };

        let recipient = self.messages.find_recipient(job.recipient_id()).await?;
        if !matches!(recipient.state(), RecipientState::Pending | RecipientState::Deferred) {
            self.queue.complete(job.id()).await?;
            return Ok(());
        }

        if let Some(next_attempt_at) = recipient_due_later(&recipient) {
            self.queue.defer(job.id(), next_attempt_at).await?;
            return Ok(());
        }

        let mut log = ConnectionLog::default();

        let sender_domain = message
            .from_email()
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default();

        let Ok(domain) = self.domains.find_by_name(tenant_id, sender_domain).await else {
            self.terminate(&message, &recipient, job, "sender domain is not registered to this tenant")
                .await?;
            return Ok(());
        };

        if !domain.is_sendable() {
            self.terminate(&message, &recipient, job, "sender domain is not yet SPF-verified")
                .await?;
            return Ok(());
        }

        let dkim_key = self.dkim_keys.find_active(domain.id(), domain.selector()).await?;

        let Some(parsed) = MessageParser::default().parse(message.raw_data()) else {
            self.terminate(&message, &recipient, job, "message body could not be parsed")
                .await?;
            return Ok(());
        };

        let signed = match dkim::sign(domain.domain(), &dkim_key, &parsed) {
            Ok(header) => header,
            Err(err) => {
                error!(%message_id, "failed to DKIM-sign message: {err}");
                self.defer_or_fail(&message, &recipient, job, &err.to_string())
                    .await?;
                return Ok(());
            }
        };

        let mut signed_body = signed.into_bytes();
        signed_body.extend_from_slice(message.raw_data());

        let recipient_domain = recipient
            .address()
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default();

        let envelope = smtp::message::Message {
            mail_from: message.from_email().into(),
            rcpt_to: vec![recipient.address().into()],
            body: signed_body.as_slice().into(),
        };

        log.log(
            LogLevel::Info,
            format!("attempting delivery to {} (attempt {})", recipient.address(), recipient.attempts() + 1),
        );

        match deliver_to_domain(
            &self.dns,
            recipient_domain,
            &self.config.ehlo_domain,
            self.config.allow_plain,
            self.config.outbound_ip,
            envelope,
            &mut log,
        )
        .await
        {
            Ok(()) => {
                debug!(%message_id, recipient = recipient.address(), "delivered");
                self.messages.record_delivery(recipient.id()).await?;
                self.events
                    .record(tenant_id, message_id, Some(recipient.id()), EventKind::Delivered, Some(&log.summary()))
                    .await?;
                self.queue.complete(job.id()).await?;
            }
            Err(DeliveryError::Permanent) => {
                // A genuine 5xx from the receiving MTA: this address is
                // undeliverable, not just this message.
                self.messages.record_deferral(recipient.id(), &log.summary(), None).await?;
                self.bounce
                    .record_hard_bounce(tenant_id, message_id, recipient.id(), recipient.address(), &log.summary())
                    .await?;
                self.queue.complete(job.id()).await?;
            }
            Err(DeliveryError::Transient) => {
                self.defer_or_fail(&message, &recipient, job, &log.summary()).await?;
            }
        }

        self.sync_message_status(message_id).await?;
        Ok(())
    }

    /// Defers a recipient for another attempt, or marks it permanently
    /// failed once `max_attempts` is reached.
    async fn defer_or_fail(
        &self,
        message: &Message,
        recipient: &Recipient,
        job: &QueueJob,
        reason: &str,
    ) -> Result<(), crate::models::Error> {
        let next_attempts = recipient.attempts() + 1;

        if next_attempts >= self.config.retry.max_attempts {
            // Repeated transient (4xx) failures, not a permanent rejection —
            // marks the recipient failed without adding it to suppression.
            self.messages.record_deferral(recipient.id(), reason, None).await?;
            self.events
                .record(message.tenant_id(), message.id(), Some(recipient.id()), EventKind::Bounced, Some(reason))
                .await?;
            self.queue.complete(job.id()).await?;
            return Ok(());
        }

        let delay = backoff(recipient.attempts(), self.config.retry.base_secs, self.config.retry.max_delay_secs);
        let next_attempt_at = Utc::now() + delay;

        self.messages
            .record_deferral(recipient.id(), reason, Some(next_attempt_at))
            .await?;
        self.events
            .record(message.tenant_id(), message.id(), Some(recipient.id()), EventKind::Deferred, Some(reason))
            .await?;
        self.queue.defer(job.id(), next_attempt_at).await?;

        Ok(())
    }

    /// Marks a recipient as a terminal, non-retryable failure that isn't
    /// attributable to the address itself (sender-domain misconfiguration),
    /// so it does not add the recipient to suppression.
    async fn terminate(
        &self,
        message: &Message,
        recipient: &Recipient,
        job: &QueueJob,
        reason: &str,
    ) -> Result<(), crate::models::Error> {
        self.messages.record_deferral(recipient.id(), reason, None).await?;
        self.events
            .record(message.tenant_id(), message.id(), Some(recipient.id()), EventKind::Bounced, Some(reason))
            .await?;
        self.queue.complete(job.id()).await?;
        Ok(())
    }

    /// Recomputes the message's aggregate status from its recipients:
    /// `sending` while any recipient is still in flight, `sent` once at
    /// least one delivered and none remain pending, `failed` if every
    /// recipient ended up terminal without a delivery.
    async fn sync_message_status(&self, message_id: MessageId) -> Result<(), crate::models::Error> {
        let recipients = self.messages.recipients(message_id).await?;

        let still_in_flight = recipients
            .iter()
            .any(|r| matches!(r.state(), RecipientState::Pending | RecipientState::Deferred));
        let any_delivered = recipients.iter().any(|r| r.state() == RecipientState::Delivered);

        let status = if still_in_flight {
            MessageStatus::Sending
        } else if any_delivered {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };

        self.messages.update_status(message_id, status).await
    }
}

/// `Some(at)` if this recipient's `next_attempt_at` is still in the future
/// (its queue job's lease was held at exactly that timestamp, but a worker
/// can still observe it early after a restart or a clock skew), `None` if
/// it is due now.
fn recipient_due_later(recipient: &Recipient) -> Option<DateTime<Utc>> {
    recipient.next_attempt_at().filter(|at| *at > Utc::now())
}
