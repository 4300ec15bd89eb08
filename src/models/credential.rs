use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use password_auth::{generate_hash, verify_password};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Error, TenantId};

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr, ToSchema,
)]
pub struct CredentialId(Uuid);

/// A single capability granted to a credential. Credentials carry a set of
/// these; both the HTTP submission API and the SMTP submission server check
/// against the same set, since a tenant's API key and its SMTP username/
/// password are the same underlying credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "capability", rename_all = "lowercase")]
pub enum Capability {
    Send,
    Read,
    ManageDomains,
    Admin,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ApiCredential {
    id: CredentialId,
    tenant_id: TenantId,
    description: String,
    #[serde(skip)]
    token_hash: String,
    capabilities: Vec<Capability>,
    active: bool,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ApiCredential {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.active
            && self
                .capabilities
                .iter()
                .any(|c| *c == capability || *c == Capability::Admin)
    }

    pub fn verify_token(&self, token: &str) -> bool {
        let secret = token.split_once('.').map_or(token, |(_, secret)| secret);
        self.active && verify_password(secret, &self.token_hash).is_ok()
    }
}

/// The plaintext token is only ever returned once, at creation time.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct CreatedCredential {
    id: CredentialId,
    tenant_id: TenantId,
    description: String,
    token: String,
    capabilities: Vec<Capability>,
}

impl CreatedCredential {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    #[cfg(test)]
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Deserialize)]
#[cfg_attr(test, derive(Serialize))]
pub struct NewCredential {
    pub description: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: PgPool,
}

impl CredentialRepository {
    pub fn new(pool: PgPool) -> Self {
        CredentialRepository { pool }
    }

    pub async fn create(
        &self,
        tenant_id: TenantId,
        new: &NewCredential,
    ) -> Result<CreatedCredential, Error> {
        let id = Uuid::new_v4();
        let secret = Alphanumeric.sample_string(&mut rand::rng(), 40);
        let token = format!("{id}.{secret}");
        let token_hash = generate_hash(secret.as_bytes());

        let row = sqlx::query!(
            r#"
            INSERT INTO api_credentials (id, tenant_id, description, token_hash, capabilities, active)
            VALUES ($1, $2, $3, $4, $5, true)
            RETURNING id, description, capabilities as "capabilities: Vec<Capability>"
            "#,
            id,
            *tenant_id,
            new.description,
            token_hash,
            &new.capabilities as &[Capability],
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CreatedCredential {
            id: row.id.into(),
            tenant_id,
            description: row.description,
            token,
            capabilities: row.capabilities,
        })
    }

    /// Bearer tokens and SMTP AUTH passwords are formatted `{id}.{secret}` so
    /// the credential row can be found with an indexed lookup before the
    /// (slow, deliberately so) password hash is verified.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<ApiCredential>, Error> {
        let Some((id, _secret)) = token.split_once('.') else {
            return Ok(None);
        };
        let Ok(id) = id.parse::<Uuid>() else {
            return Ok(None);
        };

        match self.find_by_id(CredentialId::from(id)).await {
            Ok(credential) => Ok(Some(credential)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn find_by_id(&self, id: CredentialId) -> Result<ApiCredential, Error> {
        Ok(sqlx::query_as!(
            ApiCredential,
            r#"
            SELECT
                id, tenant_id, description, token_hash,
                capabilities as "capabilities: Vec<Capability>",
                active, last_used_at, created_at
            FROM api_credentials
            WHERE id = $1
            "#,
            *id
        )
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn mark_used(&self, id: CredentialId) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE api_credentials SET last_used_at = now() WHERE id = $1",
            *id
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn revoke(&self, id: CredentialId) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE api_credentials SET active = false WHERE id = $1",
            *id
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<ApiCredential>, Error> {
        Ok(sqlx::query_as!(
            ApiCredential,
            r#"
            SELECT
                id, tenant_id, description, token_hash,
                capabilities as "capabilities: Vec<Capability>",
                active, last_used_at, created_at
            FROM api_credentials
            WHERE tenant_id = $1
            "#,
            *tenant_id
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
    async fn credential_lifecycle(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let repo = CredentialRepository::new(db);
        let created = repo
            .create(
                tenant.id(),
                &NewCredential {
                    description: "default".to_string(),
                    capabilities: vec![Capability::Send, Capability::Read],
                },
            )
            .await
            .unwrap();

        let credential = repo.find_by_id(created.id()).await.unwrap();
        assert!(credential.verify_token(created.token()));
        assert!(!credential.verify_token("wrong"));
        assert!(credential.has(Capability::Send));
        assert!(!credential.has(Capability::ManageDomains));

        repo.revoke(created.id()).await.unwrap();
        let credential = repo.find_by_id(created.id()).await.unwrap();
        assert!(!credential.verify_token(created.token()));
    }
}
