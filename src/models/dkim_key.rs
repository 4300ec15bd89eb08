use aws_lc_rs::{
    rsa::{KeySize, KeyPair as RsaKeyPair},
    signature::KeyPair as _,
};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use mail_auth::common::crypto::{RsaKey, Sha256};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{DomainId, Error};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct DkimKeyId(Uuid);

/// A generated RSA-2048 keypair held at rest as PKCS#8 DER, produced by
/// `DomainRepository::create` via `aws_lc_rs`.
#[derive(Debug)]
pub struct DkimKey {
    id: DkimKeyId,
    domain_id: DomainId,
    selector: String,
    private_key_der: Vec<u8>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl DkimKey {
    pub fn id(&self) -> DkimKeyId {
        self.id
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn signing_key(&self) -> Result<RsaKey<Sha256>, Error> {
        Ok(RsaKey::<Sha256>::from_der(&self.private_key_der)?)
    }

    /// The raw SubjectPublicKeyInfo bytes to publish as the base64 `p=`
    /// parameter of the `_domainkey` TXT record.
    pub fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        let keypair = RsaKeyPair::from_pkcs8(&self.private_key_der)
            .map_err(|_| Error::Internal("could not load generated DKIM keypair".to_string()))?;

        Ok(keypair.public_key().as_ref().to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct DkimKeyRepository {
    pool: PgPool,
}

impl DkimKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        DkimKeyRepository { pool }
    }

    /// Generates a new RSA-2048 key for `domain_id`/`selector` and, in the
    /// same transaction, deactivates whatever key was previously active for
    /// that pair. No key is ever deleted; rotation only flips `active`.
    pub async fn generate_and_activate(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<DkimKey, Error> {
        let keypair =
            RsaKeyPair::generate(KeySize::Rsa2048).map_err(|_| aws_lc_rs::error::Unspecified)?;
        let private_key_der = keypair.as_der().as_ref().to_vec();

        let mut tx = self.pool.begin().await?;

        sqlx::query!(
            "UPDATE dkim_keys SET active = false WHERE domain_id = $1 AND selector = $2 AND active",
            *domain_id,
            selector,
        )
        .execute(&mut *tx)
        .await?;

        let key = sqlx::query_as!(
            DkimKey,
            r#"
            INSERT INTO dkim_keys (id, domain_id, selector, private_key_der, active)
            VALUES (gen_random_uuid(), $1, $2, $3, true)
            RETURNING id, domain_id, selector, private_key_der, active, created_at
            "#,
            *domain_id,
            selector,
            private_key_der,
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(key)
    }

    pub async fn find_active(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<DkimKey, Error> {
        Ok(sqlx::query_as!(
            DkimKey,
            r#"
            SELECT id, domain_id, selector, private_key_der, active, created_at
            FROM dkim_keys
            WHERE domain_id = $1 AND selector = $2 AND active
            "#,
            *domain_id,
            selector,
        )
        .fetch_one(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DomainRepository, NewDomain, NewTenant, Plan, TenantRepository};

    #[sqlx::test]
    async fn rotation_deactivates_previous_key(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let domains = DomainRepository::new(db.clone());
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

        let keys = DkimKeyRepository::new(db);
        let first = keys
            .generate_and_activate(domain.id(), "uz")
            .await
            .unwrap();
        let second = keys
            .generate_and_activate(domain.id(), "uz")
            .await
            .unwrap();

        assert_ne!(first.id(), second.id());
        let active = keys.find_active(domain.id(), "uz").await.unwrap();
        assert_eq!(active.id(), second.id());
    }
}
