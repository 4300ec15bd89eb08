use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{DkimKeyRepository, Error, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct DomainId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "verification_state", rename_all = "lowercase")]
pub enum VerificationState {
    Pending,
    Verified,
    Failed,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Domain {
    id: DomainId,
    tenant_id: TenantId,
    domain: String,
    selector: String,
    spf_state: VerificationState,
    dkim_state: VerificationState,
    dmarc_state: VerificationState,
    last_checked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// The sender's `MAIL FROM`/`From`/`Return-Path` domain must be owned by
    /// the tenant and at least SPF-verified to send as.
    pub fn is_sendable(&self) -> bool {
        self.spf_state == VerificationState::Verified
    }
}

#[derive(Deserialize)]
#[cfg_attr(test, derive(Serialize))]
pub struct NewDomain {
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct DomainRepository {
    pool: PgPool,
}

impl DomainRepository {
    pub fn new(pool: PgPool) -> Self {
        DomainRepository { pool }
    }

    /// Creates the domain row and its first active DKIM key in one
    /// transaction, generating the keypair inline with the insert.
    pub async fn create(
        &self,
        tenant_id: TenantId,
        new: &NewDomain,
        dkim_selector: &str,
    ) -> Result<Domain, Error> {
        let mut tx = self.pool.begin().await?;

        let domain = sqlx::query_as!(
            Domain,
            r#"
            INSERT INTO domains (id, tenant_id, domain, selector, spf_state, dkim_state, dmarc_state)
            VALUES (gen_random_uuid(), $1, $2, $3, 'pending', 'pending', 'pending')
            RETURNING
                id, tenant_id, domain, selector,
                spf_state as "spf_state: VerificationState",
                dkim_state as "dkim_state: VerificationState",
                dmarc_state as "dmarc_state: VerificationState",
                last_checked_at, created_at
            "#,
            *tenant_id,
            new.domain,
            dkim_selector,
        )
        .fetch_one(&mut *tx)
        .await?;

        let keys = DkimKeyRepository::new(self.pool.clone());
        keys.generate_and_activate(domain.id, dkim_selector)
            .await?;

        tx.commit().await?;

        Ok(domain)
    }

    pub async fn find_by_id(&self, tenant_id: TenantId, id: DomainId) -> Result<Domain, Error> {
        Ok(sqlx::query_as!(
            Domain,
            r#"
            SELECT
                id, tenant_id, domain, selector,
                spf_state as "spf_state: VerificationState",
                dkim_state as "dkim_state: VerificationState",
                dmarc_state as "dmarc_state: VerificationState",
                last_checked_at, created_at
            FROM domains
            WHERE tenant_id = $1 AND id = $2
            "#,
            *tenant_id,
            *id,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn find_by_name(&self, tenant_id: TenantId, domain: &str) -> Result<Domain, Error> {
        Ok(sqlx::query_as!(
            Domain,
            r#"
            SELECT
                id, tenant_id, domain, selector,
                spf_state as "spf_state: VerificationState",
                dkim_state as "dkim_state: VerificationState",
                dmarc_state as "dmarc_state: VerificationState",
                last_checked_at, created_at
            FROM domains
            WHERE tenant_id = $1 AND domain = $2
            "#,
            *tenant_id,
            domain,
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<Domain>, Error> {
        Ok(sqlx::query_as!(
            Domain,
            r#"
            SELECT
                id, tenant_id, domain, selector,
                spf_state as "spf_state: VerificationState",
                dkim_state as "dkim_state: VerificationState",
                dmarc_state as "dmarc_state: VerificationState",
                last_checked_at, created_at
            FROM domains
            WHERE tenant_id = $1
            "#,
            *tenant_id,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Domains due for a verifier sweep: never checked, or checked more than
    /// `stale_after` ago.
    pub async fn due_for_verification(&self, batch_size: i64) -> Result<Vec<Domain>, Error> {
        Ok(sqlx::query_as!(
            Domain,
            r#"
            SELECT
                id, tenant_id, domain, selector,
                spf_state as "spf_state: VerificationState",
                dkim_state as "dkim_state: VerificationState",
                dmarc_state as "dmarc_state: VerificationState",
                last_checked_at, created_at
            FROM domains
            WHERE last_checked_at IS NULL OR last_checked_at < now() - interval '1 hour'
            ORDER BY last_checked_at ASC NULLS FIRST
            LIMIT $1
            "#,
            batch_size,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn record_verification(
        &self,
        id: DomainId,
        spf: VerificationState,
        dkim: VerificationState,
        dmarc: VerificationState,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE domains
            SET spf_state = $2, dkim_state = $3, dmarc_state = $4, last_checked_at = now()
            WHERE id = $1
            "#,
            *id,
            spf as VerificationState,
            dkim as VerificationState,
            dmarc as VerificationState,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan, TenantRepository};

    #[sqlx::test]
    async fn domain_lifecycle(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let domains = DomainRepository::new(db);
        let domain = domains
            .create(
                tenant.id(),
                &NewDomain {
                    domain: "example.com".to_string(),
                },
                "uz",
            )
            .await
            .unwrap();

        assert!(!domain.is_sendable());

        domains
            .record_verification(
                domain.id(),
                VerificationState::Verified,
                VerificationState::Verified,
                VerificationState::Pending,
            )
            .await
            .unwrap();

        let domain = domains.find_by_id(tenant.id(), domain.id()).await.unwrap();
        assert!(domain.is_sendable());
    }
}
