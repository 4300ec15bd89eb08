use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use email_address::EmailAddress;
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{CredentialId, Error, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct MessageId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct RecipientId(Uuid);

/// Overall message lifecycle. A message starts `Queued`
/// the moment every recipient has been persisted and moves to `Sent` once
/// every recipient has reached a terminal state with at least one delivery,
/// or `Failed` if every recipient permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

/// Per-recipient delivery state, independent of the other recipients on the
/// same message — a message with three recipients can have one delivered,
/// one deferred, one bounced at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "recipient_state", rename_all = "lowercase")]
pub enum RecipientState {
    Pending,
    Deferred,
    Delivered,
    Bounced,
    Failed,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Message {
    id: MessageId,
    tenant_id: TenantId,
    credential_id: CredentialId,
    from_email: String,
    subject: Option<String>,
    status: MessageStatus,
    #[serde(skip)]
    raw_data: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn credential_id(&self) -> CredentialId {
        self.credential_id
    }

    pub fn from_email(&self) -> &str {
        &self.from_email
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// The raw RFC 5322 message as submitted, stored verbatim so a delivery
    /// worker can re-sign and re-send it on every retry without the
    /// submitter having to resubmit.
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Recipient {
    id: RecipientId,
    message_id: MessageId,
    address: String,
    state: RecipientState,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    #[serde(skip)]
    tracking_token: String,
}

impl Recipient {
    pub fn id(&self) -> RecipientId {
        self.id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> RecipientState {
        self.state
    }

    pub fn attempts(&self) -> i32 {
        self.attempts
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    /// Opaque token bound to this recipient, embedded in open-pixel and
    /// click-redirect URLs so `track(messageId, event)` can resolve an
    /// event back to a message/recipient pair without authentication.
    pub fn tracking_token(&self) -> &str {
        &self.tracking_token
    }
}

/// A message ingested but not yet persisted. Built directly by the SMTP
/// session state machine while accumulating `MAIL FROM`/`RCPT TO`/`DATA`.
#[derive(Debug)]
pub struct NewMessage {
    pub credential_id: CredentialId,
    pub from_email: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub raw_data: Vec<u8>,
}

impl NewMessage {
    pub fn new(credential_id: CredentialId, from_email: EmailAddress) -> Self {
        NewMessage {
            credential_id,
            from_email,
            recipients: Vec::new(),
            raw_data: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<MessageStatus>,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        MessageRepository { pool }
    }

    /// Persists the message and its recipients in a single transaction and
    /// hands back the generated id, but does not enqueue it — enqueueing is
    /// the caller's job (it also has to check suppression first).
    pub async fn create(
        &self,
        tenant_id: TenantId,
        subject: Option<&str>,
        new: &NewMessage,
    ) -> Result<Message, Error> {
        let mut tx = self.pool.begin().await?;

        let message = sqlx::query_as!(
            Message,
            r#"
            INSERT INTO messages (id, tenant_id, credential_id, from_email, subject, status, raw_data)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'queued', $5)
            RETURNING
                id, tenant_id, credential_id, from_email, subject,
                status as "status: MessageStatus", raw_data, created_at, updated_at
            "#,
            *tenant_id,
            *new.credential_id,
            new.from_email.as_str(),
            subject,
            new.raw_data,
        )
        .fetch_one(&mut *tx)
        .await?;

        for recipient in &new.recipients {
            let tracking_token = Alphanumeric.sample_string(&mut rand::rng(), 24);

            sqlx::query!(
                r#"
                INSERT INTO recipients (id, message_id, address, state, attempts, tracking_token)
                VALUES (gen_random_uuid(), $1, $2, 'pending', 0, $3)
                "#,
                *message.id,
                recipient.as_str(),
                tracking_token,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(message)
    }

    pub async fn find_by_id(
        &self,
        tenant_id: TenantId,
        id: MessageId,
    ) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as!(
            Message,
            r#"
            SELECT
                id, tenant_id, credential_id, from_email, subject,
                status as "status: MessageStatus", raw_data, created_at, updated_at
            FROM messages
            WHERE tenant_id = $1 AND id = $2
            "#,
            *tenant_id,
            *id,
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Unscoped by tenant — only for resolving the message behind a
    /// tracking token's `track` call, which carries no credential to scope
    /// by in the first place.
    pub async fn find_by_id_unscoped(&self, id: MessageId) -> Result<Message, Error> {
        Ok(sqlx::query_as!(
            Message,
            r#"
            SELECT
                id, tenant_id, credential_id, from_email, subject,
                status as "status: MessageStatus", raw_data, created_at, updated_at
            FROM messages
            WHERE id = $1
            "#,
            *id,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn list(&self, filter: MessageFilter) -> Result<Vec<Message>, Error> {
        Ok(sqlx::query_as!(
            Message,
            r#"
            SELECT
                id, tenant_id, credential_id, from_email, subject,
                status as "status: MessageStatus", raw_data, created_at, updated_at
            FROM messages
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::message_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT 200
            "#,
            filter.tenant_id.map(|id| *id),
            filter.status as Option<MessageStatus>,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn recipients(&self, message_id: MessageId) -> Result<Vec<Recipient>, Error> {
        Ok(sqlx::query_as!(
            Recipient,
            r#"
            SELECT
                id, message_id, address, state as "state: RecipientState",
                attempts, next_attempt_at, last_error, tracking_token
            FROM recipients
            WHERE message_id = $1
            "#,
            *message_id,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_recipient(&self, id: RecipientId) -> Result<Recipient, Error> {
        Ok(sqlx::query_as!(
            Recipient,
            r#"
            SELECT
                id, message_id, address, state as "state: RecipientState",
                attempts, next_attempt_at, last_error, tracking_token
            FROM recipients
            WHERE id = $1
            "#,
            *id,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn update_status(&self, id: MessageId, status: MessageStatus) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE messages SET status = $2, updated_at = now() WHERE id = $1",
            *id,
            status as MessageStatus,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_delivery(&self, recipient_id: RecipientId) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE recipients SET state = 'delivered', next_attempt_at = NULL WHERE id = $1",
            *recipient_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_bounce(
        &self,
        recipient_id: RecipientId,
        reason: &str,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE recipients
            SET state = 'bounced', last_error = $2, next_attempt_at = NULL
            WHERE id = $1
            "#,
            *recipient_id,
            reason,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Defers a recipient for a retry at `next_attempt_at`, or marks it
    /// `failed` if `attempts` has already reached the configured maximum.
    pub async fn record_deferral(
        &self,
        recipient_id: RecipientId,
        reason: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        let state = if next_attempt_at.is_some() {
            RecipientState::Deferred
        } else {
            RecipientState::Failed
        };

        sqlx::query!(
            r#"
            UPDATE recipients
            SET state = $2, attempts = attempts + 1, last_error = $3, next_attempt_at = $4
            WHERE id = $1
            "#,
            *recipient_id,
            state as RecipientState,
            reason,
            next_attempt_at,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn due_for_retry(&self, limit: i64) -> Result<Vec<Recipient>, Error> {
        Ok(sqlx::query_as!(
            Recipient,
            r#"
            SELECT
                id, message_id, address, state as "state: RecipientState",
                attempts, next_attempt_at, last_error, tracking_token
            FROM recipients
            WHERE state IN ('pending', 'deferred') AND (next_attempt_at IS NULL OR next_attempt_at <= now())
            ORDER BY next_attempt_at ASC NULLS FIRST
            LIMIT $1
            "#,
            limit,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Resolves a recipient from the opaque token embedded in open-pixel and
    /// click-redirect URLs (`track(messageId, event)`). These links carry no
    /// credential, so lookup is by token alone, not scoped to a tenant.
    pub async fn find_recipient_by_token(&self, tracking_token: &str) -> Result<Recipient, Error> {
        Ok(sqlx::query_as!(
            Recipient,
            r#"
            SELECT
                id, message_id, address, state as "state: RecipientState",
                attempts, next_attempt_at, last_error, tracking_token
            FROM recipients
            WHERE tracking_token = $1
            "#,
            tracking_token,
        )
        .fetch_one(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{
        Capability, CredentialRepository, NewCredential, NewTenant, Plan, TenantRepository,
    };

    #[sqlx::test]
    async fn message_lifecycle(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let credentials = CredentialRepository::new(db.clone());
        let credential = credentials
            .create(
                tenant.id(),
                &NewCredential {
                    description: "default".to_string(),
                    capabilities: vec![Capability::Send],
                },
            )
            .await
            .unwrap();

        let mut new_message = NewMessage::new(
            credential.id(),
            "john@example.com".parse().unwrap(),
        );
        new_message.recipients.push("jane@example.com".parse().unwrap());

        let messages = MessageRepository::new(db);
        let message = messages
            .create(tenant.id(), Some("Hi!"), &new_message)
            .await
            .unwrap();
        assert_eq!(message.status(), MessageStatus::Queued);

        let recipients = messages.recipients(message.id()).await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert!(!recipients[0].tracking_token().is_empty());

        let by_token = messages
            .find_recipient_by_token(recipients[0].tracking_token())
            .await
            .unwrap();
        assert_eq!(by_token.id(), recipients[0].id());

        messages.record_delivery(recipients[0].id()).await.unwrap();
        messages
            .update_status(message.id(), MessageStatus::Sent)
            .await
            .unwrap();

        let message = messages
            .find_by_id(tenant.id(), message.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.status(), MessageStatus::Sent);
    }
}
