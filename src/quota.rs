//! C6: Rate/quota controller.
//!
//! A conditional-UPSERT "compare and swap" counter increment per tenant
//! window, plus a per-tenant `Arc<Semaphore>` concurrency cap shared by
//! every delivery worker rather than recreated per connection.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use sqlx::PgPool;
use tokio::sync::{RwLock, Semaphore};
use tracing::warn;

use crate::models::{Error, TenantId, TenantRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Hourly,
    Daily,
}

impl Window {
    fn label(self) -> &'static str {
        match self {
            Window::Hourly => "hourly",
            Window::Daily => "daily",
        }
    }

    /// Start of the current bucket for this window kind, the
    /// `(tenantId, windowStart)` key.
    fn bucket_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Hourly => now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now),
            Window::Daily => now
                .with_hour(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now),
        }
    }

    fn seconds_to_window_end(self, now: DateTime<Utc>) -> i64 {
        let end = match self {
            Window::Hourly => self.bucket_start(now) + ChronoDuration::hours(1),
            Window::Daily => self.bucket_start(now) + ChronoDuration::days(1),
        };
        (end - now).num_seconds().max(0)
    }
}

/// Outcome of an admission check: `admit(tenantId, n)` →
/// `{allowed, remainingHourly, remainingDaily, retryAfter?}`.
#[derive(Debug, Clone, Copy)]
pub struct AdmitResult {
    pub allowed: bool,
    pub remaining_hourly: i64,
    pub remaining_daily: i64,
    pub retry_after: Option<i64>,
}

/// Tracks atomic per-tenant counters for the hourly/daily admission
/// windows and the per-tenant concurrency semaphore consulted by C10
/// before a delivery attempt's network I/O.
#[derive(Clone)]
pub struct QuotaController {
    pool: PgPool,
    tenants: TenantRepository,
    concurrency: Arc<RwLock<HashMap<TenantId, Arc<Semaphore>>>>,
}

impl QuotaController {
    pub fn new(pool: PgPool) -> Self {
        QuotaController {
            tenants: TenantRepository::new(pool.clone()),
            pool,
            concurrency: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attempts to admit `n` messages for `tenant_id`. Increments both the
    /// hourly and daily counters atomically via a conditional `ON
    /// CONFLICT ... DO UPDATE ... WHERE` upsert — Postgres' row-level
    /// compare-and-swap — so that a counter is bumped only when doing so
    /// would not exceed its limit, with no separate read-then-write race
    /// window. Both windows are checked before either is committed: if
    /// either would be exceeded, the transaction is rolled back so a
    /// tenant's daily counter is never incremented for a request that
    /// failed on the hourly bound.
    pub async fn admit(&self, tenant_id: TenantId, n: i64) -> Result<AdmitResult, Error> {
        let tenant = self.tenants.find_by_id(tenant_id).await?;
        let limits = tenant.limits();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let hourly = self
            .try_increment(&mut tx, tenant_id, Window::Hourly, n, limits.hourly_quota, now)
            .await?;
        let daily = if hourly.is_some() {
            self.try_increment(&mut tx, tenant_id, Window::Daily, n, limits.daily_quota, now)
                .await?
        } else {
            None
        };

        let allowed = hourly.is_some() && daily.is_some();

        if allowed {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }

        let remaining_hourly = match hourly {
            Some(used) => limits.hourly_quota - used,
            None => self.current_count(tenant_id, Window::Hourly, now).await?.map(|used| limits.hourly_quota - used).unwrap_or(0),
        };
        let remaining_daily = match daily {
            Some(used) => limits.daily_quota - used,
            None => self.current_count(tenant_id, Window::Daily, now).await?.map(|used| limits.daily_quota - used).unwrap_or(0),
        };

        // "tightest bound": if both windows would reject, the caller
        // cannot retry successfully before whichever resets last, so take
        // the later of the two window ends.
        let retry_after = match (hourly, daily) {
            (Some(_), Some(_)) => None,
            (None, Some(_)) => Some(Window::Hourly.seconds_to_window_end(now)),
            (Some(_), None) => Some(Window::Daily.seconds_to_window_end(now)),
            (None, None) => Some(
                Window::Hourly
                    .seconds_to_window_end(now)
                    .max(Window::Daily.seconds_to_window_end(now)),
            ),
        };

        Ok(AdmitResult {
            allowed,
            remaining_hourly: remaining_hourly.max(0),
            remaining_daily: remaining_daily.max(0),
            retry_after,
        })
    }

    /// Returns the post-increment count on success, `None` if admitting
    /// `n` would exceed `limit`.
    async fn try_increment(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: TenantId,
        window: Window,
        n: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, Error> {
        let window_start = window.bucket_start(now);

        let row = sqlx::query_scalar!(
            r#"
            INSERT INTO quota_counters (tenant_id, window_kind, window_start, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, window_kind, window_start)
            DO UPDATE SET count = quota_counters.count + excluded.count
            WHERE quota_counters.count + excluded.count <= $5
            RETURNING count
            "#,
            *tenant_id,
            window.label(),
            window_start,
            n,
            limit,
        )
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    async fn current_count(
        &self,
        tenant_id: TenantId,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, Error> {
        let window_start = window.bucket_start(now);

        Ok(sqlx::query_scalar!(
            r#"
            SELECT count FROM quota_counters
            WHERE tenant_id = $1 AND window_kind = $2 AND window_start = $3
            "#,
            *tenant_id,
            window.label(),
            window_start,
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The per-tenant concurrency semaphore acquired by C10 before
    /// network I/O, released on terminal outcome. Sized from
    /// `max_concurrent_deliveries` and cached for the lifetime of the
    /// process the same way `DnsResolver` caches lookups.
    pub async fn concurrency_semaphore(&self, tenant_id: TenantId) -> Arc<Semaphore> {
        if let Some(semaphore) = self.concurrency.read().await.get(&tenant_id) {
            return semaphore.clone();
        }

        let mut semaphores = self.concurrency.write().await;
        if let Some(semaphore) = semaphores.get(&tenant_id) {
            return semaphore.clone();
        }

        let permits = match self.tenants.find_by_id(tenant_id).await {
            Ok(tenant) => tenant.limits().max_concurrent_deliveries.max(1) as usize,
            Err(err) => {
                warn!(%tenant_id, "could not load tenant limits, defaulting concurrency to 1: {err}");
                1
            }
        };

        let semaphore = Arc::new(Semaphore::new(permits));
        semaphores.insert(tenant_id, semaphore.clone());
        semaphore
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan};

    #[sqlx::test]
    async fn admits_until_hourly_limit(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Trial,
            })
            .await
            .unwrap();

        let quota = QuotaController::new(db);

        for _ in 0..100 {
            let result = quota.admit(tenant.id(), 1).await.unwrap();
            assert!(result.allowed);
        }

        let result = quota.admit(tenant.id(), 1).await.unwrap();
        assert!(!result.allowed);
        assert!(result.retry_after.is_some());
    }

    #[sqlx::test]
    async fn rejecting_hourly_does_not_touch_daily(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Trial,
            })
            .await
            .unwrap();

        let quota = QuotaController::new(db);
        quota.admit(tenant.id(), 100).await.unwrap();
        let rejected = quota.admit(tenant.id(), 1).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining_daily, 400);
    }
}
