use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Error, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct SuppressionId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "suppression_reason", rename_all = "lowercase")]
pub enum SuppressionReason {
    HardBounce,
    Complaint,
    Manual,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SuppressionEntry {
    id: SuppressionId,
    tenant_id: TenantId,
    address: String,
    reason: SuppressionReason,
    created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn reason(&self) -> SuppressionReason {
        self.reason
    }
}

#[derive(Debug, Clone)]
pub struct SuppressionRepository {
    pool: PgPool,
}

impl SuppressionRepository {
    pub fn new(pool: PgPool) -> Self {
        SuppressionRepository { pool }
    }

    /// A recipient on the suppression list for the tenant must never be
    /// (re-)enqueued, so this is called before every
    /// `QueueRepository::enqueue`.
    pub async fn is_suppressed(&self, tenant_id: TenantId, address: &str) -> Result<bool, Error> {
        Ok(sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM suppression WHERE tenant_id = $1 AND address = $2) as "exists!""#,
            *tenant_id,
            address,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn suppress(
        &self,
        tenant_id: TenantId,
        address: &str,
        reason: SuppressionReason,
    ) -> Result<SuppressionEntry, Error> {
        Ok(sqlx::query_as!(
            SuppressionEntry,
            r#"
            INSERT INTO suppression (id, tenant_id, address, reason)
            VALUES (gen_random_uuid(), $1, $2, $3)
            ON CONFLICT (tenant_id, address) DO UPDATE SET reason = $3
            RETURNING id, tenant_id, address, reason as "reason: SuppressionReason", created_at
            "#,
            *tenant_id,
            address,
            reason as SuppressionReason,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<SuppressionEntry>, Error> {
        Ok(sqlx::query_as!(
            SuppressionEntry,
            r#"
            SELECT id, tenant_id, address, reason as "reason: SuppressionReason", created_at
            FROM suppression
            WHERE tenant_id = $1
            "#,
            *tenant_id,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan, TenantRepository};

    #[sqlx::test]
    async fn suppression_blocks_future_sends(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let repo = SuppressionRepository::new(db);
        assert!(!repo.is_suppressed(tenant.id(), "jane@example.com").await.unwrap());

        repo.suppress(tenant.id(), "jane@example.com", SuppressionReason::HardBounce)
            .await
            .unwrap();

        assert!(repo.is_suppressed(tenant.id(), "jane@example.com").await.unwrap());
    }
}
