//! C5: Tenant context service.
//!
//! Built on the `dns.rs` cache shape (a `RwLock<HashMap<_>>`
//! with a double-checked read before taking the write lock to coalesce
//! concurrent misses), generalized from DNS answers to tenant records:
//! `load(tenant_id)` returns a `TenantContext` good for 60 s, after which
//! the next caller re-fetches from `TenantRepository` and refreshes the
//! cache entry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;

use crate::models::{Error, Tenant, TenantId, TenantLimits, TenantRepository, TenantStatus};

/// How long a loaded context may be reused before it is considered stale.
const STALENESS_BOUND: Duration = Duration::from_secs(60);

/// A read-mostly snapshot of a tenant's plan, limits and status, tagged
/// with the instant it was loaded so callers that hold onto one for a
/// while (C6 admission, C10 dispatch) can reject a context that has
/// outlived the staleness bound instead of silently trusting quota limits
/// that may have been revised since.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: TenantId,
    status: TenantStatus,
    limits: TenantLimits,
    loaded_at: DateTime<Utc>,
}

impl TenantContext {
    fn from_tenant(tenant: &Tenant) -> Self {
        TenantContext {
            tenant_id: tenant.id(),
            status: tenant.status(),
            limits: tenant.limits(),
            loaded_at: Utc::now(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn limits(&self) -> TenantLimits {
        self.limits
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// `require_active` plus the staleness check admission callers must
    /// perform before trusting a cached context.
    pub fn require_fresh_and_active(&self) -> Result<(), Error> {
        if self.status != TenantStatus::Active {
            return Err(Error::TenantSuspended);
        }

        let age = Utc::now().signed_duration_since(self.loaded_at);
        if age.to_std().unwrap_or(Duration::MAX) > STALENESS_BOUND {
            return Err(Error::Internal("tenant context is stale".to_string()));
        }

        Ok(())
    }
}

#[derive(Clone)]
struct CacheEntry {
    context: TenantContext,
    expires_at: std::time::Instant,
}

/// Caches `TenantContext` values for 60 s, coalescing concurrent misses
/// for the same tenant behind the write lock the same way `DnsResolver`
/// coalesces MX lookups.
#[derive(Clone)]
pub struct TenantContextService {
    tenants: TenantRepository,
    cache: Arc<RwLock<HashMap<TenantId, CacheEntry>>>,
}

impl TenantContextService {
    pub fn new(tenants: TenantRepository) -> Self {
        TenantContextService {
            tenants,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn load(&self, tenant_id: TenantId) -> Result<TenantContext, Error> {
        if let Some(entry) = self.cache.read().await.get(&tenant_id)
            && entry.expires_at > std::time::Instant::now()
        {
            trace!(%tenant_id, "tenant context cache hit");
            return Ok(entry.context.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(&tenant_id)
            && entry.expires_at > std::time::Instant::now()
        {
            return Ok(entry.context.clone());
        }

        let tenant = self.tenants.find_by_id(tenant_id).await?;
        let context = TenantContext::from_tenant(&tenant);

        cache.insert(
            tenant_id,
            CacheEntry {
                context: context.clone(),
                expires_at: std::time::Instant::now() + STALENESS_BOUND,
            },
        );

        Ok(context)
    }

    /// Drops a cached entry immediately, e.g. after a tenant update or
    /// suspension, so the next admission decision sees it without waiting
    /// out the staleness bound.
    pub async fn invalidate(&self, tenant_id: TenantId) {
        self.cache.write().await.remove(&tenant_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan};
    use sqlx::PgPool;

    #[sqlx::test]
    async fn loads_and_caches(db: PgPool) {
        let tenants = TenantRepository::new(db);
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let service = TenantContextService::new(tenants.clone());
        let context = service.load(tenant.id()).await.unwrap();
        assert_eq!(context.limits().hourly_quota, 5_000);
        context.require_fresh_and_active().unwrap();

        tenants.suspend(tenant.id()).await.unwrap();
        // still cached: stale data is returned until invalidated or expired.
        let context = service.load(tenant.id()).await.unwrap();
        assert_eq!(context.limits().hourly_quota, 5_000);

        service.invalidate(tenant.id()).await;
        let context = service.load(tenant.id()).await.unwrap();
        assert!(context.require_fresh_and_active().is_err());
    }
}
