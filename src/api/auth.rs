//! C8 credential resolution: the `Authorization: Bearer` extractor every
//! submission-API handler pulls its tenant/capability context from.
//!
//! A `FromRequestParts<S>` extractor resolved from request state via
//! `FromRef`, rejecting with `ApiError`, backed by a bearer-token lookup
//! against `CredentialRepository` plus a tenant-context freshness check.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::trace;

use crate::api::error::ApiError;
use crate::models::{ApiCredential, Capability, CredentialRepository};
use crate::tenant_context::{TenantContext, TenantContextService};

/// The resolved identity of an authenticated submission-API request: which
/// credential was presented and a fresh view of its tenant's status and
/// limits.
pub struct TenantAuth {
    credential: ApiCredential,
    tenant: TenantContext,
}

impl TenantAuth {
    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn credential(&self) -> &ApiCredential {
        &self.credential
    }

    /// Rejects with [`ApiError::Unauthenticated`] unless the credential
    /// carries `capability` (or `Capability::Admin`, per
    /// `ApiCredential::has`).
    pub fn require(&self, capability: Capability) -> Result<(), ApiError> {
        if self.credential.has(capability) {
            Ok(())
        } else {
            Err(ApiError::Unauthenticated)
        }
    }
}

impl<S> FromRequestParts<S> for TenantAuth
where
    S: Send + Sync,
    CredentialRepository: FromRef<S>,
    TenantContextService: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated)?
            .to_string();

        let credentials = CredentialRepository::from_ref(state);
        let credential = credentials
            .find_by_token(&token)
            .await?
            .ok_or(ApiError::Unauthenticated)?;

        if !credential.verify_token(&token) {
            return Err(ApiError::Unauthenticated);
        }
        if !credential.active() {
            return Err(ApiError::Revoked);
        }

        let tenant_context = TenantContextService::from_ref(state);
        let tenant = tenant_context.load(credential.tenant_id()).await?;
        tenant.require_fresh_and_active().map_err(|_| ApiError::TenantSuspended)?;

        credentials.mark_used(credential.id()).await?;

        trace!(credential_id = %credential.id(), tenant_id = %credential.tenant_id(), "authenticated submission request");

        Ok(TenantAuth { credential, tenant })
    }
}
