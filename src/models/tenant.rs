use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::Error;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct TenantId(Uuid);

/// Plan tiers set the defaults for quota and queue fairness; a tenant may
/// still carry explicit overrides for any of the limits in [`TenantLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "tenant_plan", rename_all = "lowercase")]
pub enum Plan {
    Trial,
    Standard,
    Enterprise,
}

impl Plan {
    /// Default quota and fairness weight for tenants that have not been
    /// given an explicit override.
    pub fn default_limits(self) -> TenantLimits {
        match self {
            Plan::Trial => TenantLimits {
                hourly_quota: 100,
                daily_quota: 500,
                max_concurrent_deliveries: 2,
                queue_weight: 1,
            },
            Plan::Standard => TenantLimits {
                hourly_quota: 5_000,
                daily_quota: 50_000,
                max_concurrent_deliveries: 10,
                queue_weight: 5,
            },
            Plan::Enterprise => TenantLimits {
                hourly_quota: 100_000,
                daily_quota: 1_000_000,
                max_concurrent_deliveries: 50,
                queue_weight: 20,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub struct TenantLimits {
    pub hourly_quota: i64,
    pub daily_quota: i64,
    pub max_concurrent_deliveries: i32,
    pub queue_weight: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "tenant_status", rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Tenant {
    id: TenantId,
    name: String,
    plan: Plan,
    status: TenantStatus,
    hourly_quota: i64,
    daily_quota: i64,
    max_concurrent_deliveries: i32,
    queue_weight: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn status(&self) -> TenantStatus {
        self.status
    }

    pub fn limits(&self) -> TenantLimits {
        TenantLimits {
            hourly_quota: self.hourly_quota,
            daily_quota: self.daily_quota,
            max_concurrent_deliveries: self.max_concurrent_deliveries,
            queue_weight: self.queue_weight,
        }
    }

    pub fn require_active(&self) -> Result<(), Error> {
        if self.status == TenantStatus::Active {
            Ok(())
        } else {
            Err(Error::TenantSuspended)
        }
    }
}

#[derive(Deserialize)]
#[cfg_attr(test, derive(Serialize))]
pub struct NewTenant {
    pub name: String,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct TenantRepository {
    pool: PgPool,
}

impl TenantRepository {
    pub fn new(pool: PgPool) -> Self {
        TenantRepository { pool }
    }

    pub async fn create(&self, new: &NewTenant) -> Result<Tenant, Error> {
        let limits = new.plan.default_limits();

        Ok(sqlx::query_as!(
            Tenant,
            r#"
            INSERT INTO tenants
                (id, name, plan, status, hourly_quota, daily_quota, max_concurrent_deliveries, queue_weight)
            VALUES (gen_random_uuid(), $1, $2, 'active', $3, $4, $5, $6)
            RETURNING
                id, name, plan as "plan: Plan", status as "status: TenantStatus",
                hourly_quota, daily_quota, max_concurrent_deliveries, queue_weight,
                created_at, updated_at
            "#,
            new.name,
            new.plan as Plan,
            limits.hourly_quota,
            limits.daily_quota,
            limits.max_concurrent_deliveries,
            limits.queue_weight,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn find_by_id(&self, id: TenantId) -> Result<Tenant, Error> {
        Ok(sqlx::query_as!(
            Tenant,
            r#"
            SELECT
                id, name, plan as "plan: Plan", status as "status: TenantStatus",
                hourly_quota, daily_quota, max_concurrent_deliveries, queue_weight,
                created_at, updated_at
            FROM tenants
            WHERE id = $1
            "#,
            *id
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn suspend(&self, id: TenantId) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE tenants SET status = 'suspended' WHERE id = $1",
            *id
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test]
    async fn tenant_lifecycle(db: PgPool) {
        let repo = TenantRepository::new(db);

        let tenant = repo
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();
        assert_eq!(tenant.limits().hourly_quota, 5_000);
        assert_eq!(tenant.status(), TenantStatus::Active);

        repo.suspend(tenant.id()).await.unwrap();
        let tenant = repo.find_by_id(tenant.id()).await.unwrap();
        assert!(tenant.require_active().is_err());
    }
}
