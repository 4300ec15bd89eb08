//! Domain registration and status (C3) exposed over the submission API:
//! create a sending domain, list a tenant's domains, fetch one, and check
//! its current SPF/DKIM/DMARC verification state.
//!
//! A `State<Repo>` CRUD shape with `Path<...>` extractors for ids, gated
//! by `TenantAuth`/`Capability::ManageDomains`.

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::{
    auth::TenantAuth,
    error::{ApiError, ApiResult},
};
use crate::models::{Capability, Domain, DomainId, DomainRepository, NewDomain};

/// Fixed selector: a tenant's domains each carry one DKIM keypair at a
/// time (`DkimKeyRepository::generate_and_activate` rotates it), so there
/// is no per-request selector to choose.
const DKIM_SELECTOR: &str = "uz";

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    pub domain: String,
}

pub async fn create_domain(
    auth: TenantAuth,
    State(repo): State<DomainRepository>,
    Json(request): Json<CreateDomainRequest>,
) -> ApiResult<Domain> {
    auth.require(Capability::ManageDomains)?;

    let tenant_id = auth.tenant().tenant_id();
    let domain = repo
        .create(tenant_id, &NewDomain { domain: request.domain }, DKIM_SELECTOR)
        .await?;

    info!(tenant_id = %tenant_id, domain_id = %domain.id(), domain = domain.domain(), "registered domain");

    Ok(Json(domain))
}

pub async fn list_domains(
    auth: TenantAuth,
    State(repo): State<DomainRepository>,
) -> ApiResult<Vec<Domain>> {
    auth.require(Capability::ManageDomains)?;

    let domains = repo.list(auth.tenant().tenant_id()).await?;

    Ok(Json(domains))
}

pub async fn get_domain(
    auth: TenantAuth,
    Path(domain_id): Path<DomainId>,
    State(repo): State<DomainRepository>,
) -> ApiResult<Domain> {
    auth.require(Capability::ManageDomains)?;

    let domain = repo.find_by_id(auth.tenant().tenant_id(), domain_id).await?;

    Ok(Json(domain))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DomainStatusResponse {
    pub domain: Domain,
    pub sendable: bool,
}

/// The on-demand status check: re-reads the domain row so a tenant can
/// poll it instead of waiting for the next verifier sweep to land.
pub async fn get_domain_status(
    auth: TenantAuth,
    Path(domain_id): Path<DomainId>,
    State(repo): State<DomainRepository>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require(Capability::ManageDomains)?;

    let domain = repo.find_by_id(auth.tenant().tenant_id(), domain_id).await?;
    let sendable = domain.is_sendable();

    Ok((StatusCode::OK, Json(DomainStatusResponse { domain, sendable })))
}
