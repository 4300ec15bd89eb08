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
pub struct QueueJobId(Uuid);

/// One unit of delivery work: a single recipient of a single message,
/// waiting to be leased by a delivery worker. There is one logical queue
/// shared by every tenant; fairness between tenants comes from how
/// `lease_batch` orders its claim, not from separate per-tenant queues.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct QueueJob {
    id: QueueJobId,
    tenant_id: TenantId,
    message_id: MessageId,
    recipient_id: RecipientId,
    enqueued_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn id(&self) -> QueueJobId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn recipient_id(&self) -> RecipientId {
        self.recipient_id
    }
}

#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: PgPool,
}

impl QueueRepository {
    pub fn new(pool: PgPool) -> Self {
        QueueRepository { pool }
    }

    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        recipient_id: RecipientId,
    ) -> Result<QueueJob, Error> {
        Ok(sqlx::query_as!(
            QueueJob,
            r#"
            INSERT INTO queue_jobs (id, tenant_id, message_id, recipient_id, enqueued_at)
            VALUES (gen_random_uuid(), $1, $2, $3, now())
            RETURNING id, tenant_id, message_id, recipient_id, enqueued_at, leased_until
            "#,
            *tenant_id,
            *message_id,
            *recipient_id,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Leases up to `limit` jobs for `worker_id`, favoring tenants with a
    /// higher `queue_weight` and, within a tenant, the oldest job first —
    /// weighted round-robin fairness. `FOR UPDATE SKIP LOCKED` lets
    /// multiple workers dequeue from the same table concurrently without
    /// blocking each other.
    pub async fn lease_batch(
        &self,
        worker_id: &str,
        lease_seconds: i64,
        limit: i64,
    ) -> Result<Vec<QueueJob>, Error> {
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as!(
            QueueJob,
            r#"
            SELECT q.id, q.tenant_id, q.message_id, q.recipient_id, q.enqueued_at, q.leased_until
            FROM queue_jobs q
            JOIN tenants t ON t.id = q.tenant_id
            WHERE q.leased_until IS NULL OR q.leased_until < now()
            ORDER BY t.queue_weight DESC, q.enqueued_at ASC
            LIMIT $1
            FOR UPDATE OF q SKIP LOCKED
            "#,
            limit,
        )
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = candidates.iter().map(|j| *j.id).collect();

        sqlx::query!(
            r#"
            UPDATE queue_jobs
            SET leased_until = now() + make_interval(secs => $2), lease_owner = $3
            WHERE id = ANY($1)
            "#,
            &ids,
            lease_seconds as f64,
            worker_id,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(candidates)
    }

    pub async fn complete(&self, id: QueueJobId) -> Result<(), Error> {
        sqlx::query!("DELETE FROM queue_jobs WHERE id = $1", *id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Releases the lease without deleting the job, so it becomes eligible
    /// for `lease_batch` again immediately.
    pub async fn release(&self, id: QueueJobId) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE queue_jobs SET leased_until = NULL, lease_owner = NULL WHERE id = $1",
            *id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Holds the job's lease until `until`, so a deferred recipient is not
    /// re-leased before its `next_attempt_at`. The job row is kept rather
    /// than deleted — deferral re-enqueues with the earliest
    /// `nextAttemptAt` instead of creating a new job.
    pub async fn defer(&self, id: QueueJobId, until: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE queue_jobs SET leased_until = $2, lease_owner = NULL WHERE id = $1",
            *id,
            until,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{
        Capability, CredentialRepository, MessageRepository, NewCredential, NewMessage,
        NewTenant, Plan, TenantRepository,
    };

    #[sqlx::test]
    async fn fairness_prefers_higher_weight_tenant(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let credentials = CredentialRepository::new(db.clone());
        let messages = MessageRepository::new(db.clone());
        let queue = QueueRepository::new(db);

        let trial = tenants
            .create(&NewTenant {
                name: "Trial".to_string(),
                plan: Plan::Trial,
            })
            .await
            .unwrap();
        let enterprise = tenants
            .create(&NewTenant {
                name: "Enterprise".to_string(),
                plan: Plan::Enterprise,
            })
            .await
            .unwrap();

        for tenant in [trial, enterprise] {
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

            let mut new_message =
                NewMessage::new(credential.id(), "john@example.com".parse().unwrap());
            new_message
                .recipients
                .push("jane@example.com".parse().unwrap());

            let message = messages.create(tenant.id(), None, &new_message).await.unwrap();
            let recipients = messages.recipients(message.id()).await.unwrap();
            queue
                .enqueue(tenant.id(), message.id(), recipients[0].id())
                .await
                .unwrap();
        }

        let leased = queue.lease_batch("worker-1", 60, 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].tenant_id(), enterprise.id());
    }
}
