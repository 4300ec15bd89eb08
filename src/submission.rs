//! The submission pipeline shared by the HTTP API (C8) and the SMTP
//! submission server (C9): both accept a message into the exact same
//! admission path — domain-of-sender authorization, suppression lookup,
//! quota admission (C6), and persist + enqueue (C4, C7) — so a message
//! looks identical downstream regardless of which front door it came
//! through.
//!
//! Lifted out of the HTTP handler body so the SMTP `DATA` completion can
//! drive the same sequence of repository calls without going through an
//! HTTP request.

use std::collections::HashMap;

use email_address::EmailAddress;

use crate::models::{
    CredentialId, DomainRepository, EventKind, EventRepository, MessageId, MessageRepository,
    MessageStatus, NewMessage, QueueRepository, SuppressionRepository, TenantId,
};
use crate::quota::QuotaController;

/// The SMTP-layer bound from the wire protocol (`smtp::session`'s `DATA`
/// accumulation) applies equally to the HTTP submission API, since both
/// land here.
pub const MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Neither front door names an exact recipients-per-envelope limit; 100
/// matches common ESP submission limits and is independent of the
/// hourly/daily quota count.
pub const MAX_RECIPIENTS_PER_ENVELOPE: usize = 100;

/// A fully-formed envelope ready for admission: sender and recipients
/// already parsed, body already serialized to its final RFC 5322 bytes.
/// The HTTP API builds `raw_data` with `mail_builder::MessageBuilder`; the
/// SMTP session has it verbatim from `DATA`.
#[derive(Debug)]
pub struct Envelope {
    pub credential_id: CredentialId,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: Option<String>,
    pub raw_data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("at least one recipient is required")]
    EmptyRecipients,
    #[error("envelope exceeds the maximum of {MAX_RECIPIENTS_PER_ENVELOPE} recipients")]
    TooManyRecipients,
    #[error("sender domain is not authorized for this tenant")]
    UnauthorizedSender,
    #[error("message exceeds the maximum allowed size")]
    PayloadTooLarge,
    #[error("tenant quota exceeded, retry after {retry_after}s")]
    QuotaExceeded { retry_after: i64 },
    #[error(transparent)]
    Internal(#[from] crate::models::Error),
}

#[derive(Clone)]
pub struct SubmissionPipeline {
    messages: MessageRepository,
    domains: DomainRepository,
    suppression: SuppressionRepository,
    queue: QueueRepository,
    events: EventRepository,
    quota: QuotaController,
}

impl SubmissionPipeline {
    pub fn new(
        messages: MessageRepository,
        domains: DomainRepository,
        suppression: SuppressionRepository,
        queue: QueueRepository,
        events: EventRepository,
        quota: QuotaController,
    ) -> Self {
        SubmissionPipeline { messages, domains, suppression, queue, events, quota }
    }

    /// Validates, persists, and enqueues one envelope. Returns the new
    /// message's id once every non-suppressed recipient has a queue job.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        envelope: Envelope,
    ) -> Result<MessageId, SubmissionError> {
        if envelope.to.is_empty() {
            return Err(SubmissionError::EmptyRecipients);
        }
        if envelope.to.len() > MAX_RECIPIENTS_PER_ENVELOPE {
            return Err(SubmissionError::TooManyRecipients);
        }
        if envelope.raw_data.len() > MAX_MESSAGE_SIZE {
            return Err(SubmissionError::PayloadTooLarge);
        }

        let domain = self
            .domains
            .find_by_name(tenant_id, envelope.from.domain())
            .await
            .map_err(|err| match err {
                crate::models::Error::NotFound(_) => SubmissionError::UnauthorizedSender,
                other => SubmissionError::Internal(other),
            })?;
        if !domain.is_sendable() {
            return Err(SubmissionError::UnauthorizedSender);
        }

        // Suppression lookup precedes admission: a suppressed recipient
        // never consumes quota or a delivery attempt.
        let mut suppressed_by_address: HashMap<String, bool> = HashMap::new();
        for recipient in &envelope.to {
            let is_suppressed =
                self.suppression.is_suppressed(tenant_id, recipient.as_str()).await?;
            suppressed_by_address.insert(recipient.as_str().to_string(), is_suppressed);
        }
        let deliverable = suppressed_by_address.values().filter(|s| !**s).count() as i64;

        let admission = self.quota.admit(tenant_id, deliverable).await?;
        if !admission.allowed {
            return Err(SubmissionError::QuotaExceeded {
                retry_after: admission.retry_after.unwrap_or(60),
            });
        }

        let mut new_message = NewMessage::new(envelope.credential_id, envelope.from);
        new_message.recipients = envelope.to;
        new_message.raw_data = envelope.raw_data;

        let message =
            self.messages.create(tenant_id, envelope.subject.as_deref(), &new_message).await?;
        let persisted_recipients = self.messages.recipients(message.id()).await?;

        for recipient in &persisted_recipients {
            let is_suppressed =
                suppressed_by_address.get(recipient.address()).copied().unwrap_or(false);

            if is_suppressed {
                self.messages
                    .record_bounce(recipient.id(), "suppressed: prior bounce or complaint")
                    .await?;
                self.events
                    .record(
                        tenant_id,
                        message.id(),
                        Some(recipient.id()),
                        EventKind::Bounced,
                        Some("suppressed"),
                    )
                    .await?;
            } else {
                self.queue.enqueue(tenant_id, message.id(), recipient.id()).await?;
                self.events
                    .record(tenant_id, message.id(), Some(recipient.id()), EventKind::Queued, None)
                    .await?;
            }
        }

        // Every recipient was already suppressed: there is no job for a
        // worker to ever pick up, so the message's terminal status is
        // decided here rather than by the delivery worker pool.
        if deliverable == 0 {
            self.messages.update_status(message.id(), MessageStatus::Failed).await?;
        }

        Ok(message.id())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Capability, CredentialRepository, NewCredential, NewDomain, NewTenant, Plan, TenantRepository};
    use sqlx::PgPool;

    async fn pipeline(pool: PgPool) -> (SubmissionPipeline, TenantId, CredentialId) {
        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants
            .create(&NewTenant { name: "Acme".to_string(), plan: Plan::Standard })
            .await
            .unwrap();

        let credentials = CredentialRepository::new(pool.clone());
        let created = credentials
            .create(
                tenant.id(),
                &NewCredential { description: "default".to_string(), capabilities: vec![Capability::Send] },
            )
            .await
            .unwrap();

        let domains = DomainRepository::new(pool.clone());
        let domain = domains
            .create(tenant.id(), &NewDomain { domain: "example.com".to_string() }, "uz")
            .await
            .unwrap();
        domains
            .record_verification(
                domain.id(),
                crate::models::VerificationState::Verified,
                crate::models::VerificationState::Verified,
                crate::models::VerificationState::Pending,
            )
            .await
            .unwrap();

        let pipeline = SubmissionPipeline::new(
            MessageRepository::new(pool.clone()),
            domains,
            SuppressionRepository::new(pool.clone()),
            QueueRepository::new(pool.clone()),
            EventRepository::new(pool.clone()),
            QuotaController::new(pool),
        );

        (pipeline, tenant.id(), created.id())
    }

    #[sqlx::test]
    async fn rejects_unauthorized_sender_domain(db: PgPool) {
        let (pipeline, tenant_id, credential_id) = pipeline(db).await;

        let envelope = Envelope {
            credential_id,
            from: "john@not-owned.com".parse().unwrap(),
            to: vec!["jane@example.com".parse().unwrap()],
            subject: Some("Hi".to_string()),
            raw_data: b"From: john@not-owned.com\r\n\r\nhello".to_vec(),
        };

        let err = pipeline.submit(tenant_id, envelope).await.unwrap_err();
        assert!(matches!(err, SubmissionError::UnauthorizedSender));
    }

    #[sqlx::test]
    async fn admits_and_enqueues(db: PgPool) {
        let (pipeline, tenant_id, credential_id) = pipeline(db).await;

        let envelope = Envelope {
            credential_id,
            from: "john@example.com".parse().unwrap(),
            to: vec!["jane@example.com".parse().unwrap()],
            subject: Some("Hi".to_string()),
            raw_data: b"From: john@example.com\r\n\r\nhello".to_vec(),
        };

        pipeline.submit(tenant_id, envelope).await.unwrap();
    }
}
