use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Error, MessageId, RecipientId, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct EventId(Uuid);

/// Every event the platform records for a message, append-only. `events`
/// has no `UPDATE`/`DELETE` path anywhere in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "event_kind", rename_all = "lowercase")]
pub enum EventKind {
    Queued,
    Delivered,
    Bounced,
    Deferred,
    Opened,
    Clicked,
    Complained,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Event {
    id: EventId,
    tenant_id: TenantId,
    message_id: MessageId,
    recipient_id: Option<RecipientId>,
    kind: EventKind,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: PgPool,
}

impl EventRepository {
    pub fn new(pool: PgPool) -> Self {
        EventRepository { pool }
    }

    pub async fn record(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        recipient_id: Option<RecipientId>,
        kind: EventKind,
        detail: Option<&str>,
    ) -> Result<Event, Error> {
        Ok(sqlx::query_as!(
            Event,
            r#"
            INSERT INTO events (id, tenant_id, message_id, recipient_id, kind, detail)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
            RETURNING id, tenant_id, message_id, recipient_id, kind as "kind: EventKind", detail, created_at
            "#,
            *tenant_id,
            *message_id,
            recipient_id.map(|id| *id),
            kind as EventKind,
            detail,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Whether `recipient_id` already has an event of `kind` recorded since
    /// `since` — used by tracking (C12) to collapse replayed open/click
    /// hits (bots, image proxies re-fetching the pixel) into one event
    /// instead of one per request.
    pub async fn recent_for_recipient(
        &self,
        recipient_id: RecipientId,
        kind: EventKind,
        since: DateTime<Utc>,
    ) -> Result<bool, Error> {
        Ok(sqlx::query_scalar!(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM events
                WHERE recipient_id = $1 AND kind = $2 AND created_at >= $3
            ) as "exists!"
            "#,
            *recipient_id,
            kind as EventKind,
            since,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn for_message(&self, message_id: MessageId) -> Result<Vec<Event>, Error> {
        Ok(sqlx::query_as!(
            Event,
            r#"
            SELECT id, tenant_id, message_id, recipient_id, kind as "kind: EventKind", detail, created_at
            FROM events
            WHERE message_id = $1
            ORDER BY created_at ASC
            "#,
            *message_id,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
