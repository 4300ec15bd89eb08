//! C3: Domain authentication verifier.
//!
//! SPF/DKIM/DMARC TXT lookups (`verify_spf`/`verify_dkim`/`verify_dmarc`)
//! run as a background sweep against `models::DomainRepository`, rather
//! than on demand per message.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dns::DnsResolver;
use crate::models::{Domain, DkimKeyRepository, DomainId, DomainRepository, VerificationState};

#[derive(Debug, Clone, Copy)]
pub struct VerifierConfig {
    pub sweep_interval: Duration,
    pub batch_size: i64,
    pub batch_spacing: Duration,
    /// Fraction of a sweep's domains that may fail at least one check
    /// before the sweep is paused and an alert emitted.
    pub failure_rate_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            sweep_interval: Duration::from_secs(300),
            batch_size: 20,
            batch_spacing: Duration::from_secs(1),
            failure_rate_threshold: 0.5,
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    domains: DomainRepository,
    dkim_keys: DkimKeyRepository,
    dns: DnsResolver,
    config: VerifierConfig,
    shutdown: CancellationToken,
}

impl Verifier {
    pub fn new(
        domains: DomainRepository,
        dkim_keys: DkimKeyRepository,
        dns: DnsResolver,
        config: VerifierConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Verifier { domains, dkim_keys, dns, config, shutdown }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down domain verifier");
                        return;
                    }
                    _ = interval.tick() => {
                        self.run_sweep().await;
                    }
                }
            }
        })
    }

    /// Processes due domains in batches of `batch_size`, sleeping
    /// `batch_spacing` between batches to avoid hammering DNS. Stops early,
    /// with a logged alert, if the running failure rate across the sweep
    /// exceeds `failure_rate_threshold`.
    async fn run_sweep(&self) {
        let mut processed = 0u32;
        let mut failed = 0u32;

        loop {
            let batch = match self.domains.due_for_verification(self.config.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!("domain verifier could not load due domains: {err}");
                    return;
                }
            };

            if batch.is_empty() {
                break;
            }

            for domain in &batch {
                match self.verify_one(domain).await {
                    Ok(any_failed) => {
                        processed += 1;
                        if any_failed {
                            failed += 1;
                        }
                    }
                    Err(err) => {
                        processed += 1;
                        failed += 1;
                        warn!(domain = domain.domain(), "verifier sweep failed for domain: {err}");
                    }
                }
            }

            if processed > 0 && (failed as f64 / processed as f64) > self.config.failure_rate_threshold {
                error!(
                    processed,
                    failed, "domain verifier failure rate exceeded threshold, pausing sweep"
                );
                return;
            }

            tokio::time::sleep(self.config.batch_spacing).await;
        }

        info!(processed, failed, "domain verifier sweep complete");
    }

    /// Checks SPF, DKIM and DMARC for one domain and persists the result.
    /// Returns whether any of the three checks failed, for the sweep's
    /// failure-rate tracking.
    async fn verify_one(&self, domain: &Domain) -> Result<bool, crate::models::Error> {
        let spf = self.check_spf(domain.domain()).await;
        let dkim = self.check_dkim(domain.id(), domain.domain(), domain.selector()).await;
        let dmarc = self.check_dmarc(domain.domain()).await;

        let any_failed = [spf, dkim, dmarc].iter().any(|s| *s == VerificationState::Failed);

        self.domains.record_verification(domain.id(), spf, dkim, dmarc).await?;

        Ok(any_failed)
    }

    async fn check_spf(&self, domain: &str) -> VerificationState {
        match self.dns.txt_starting_with(domain, "", "v=spf1").await {
            Ok(_) => VerificationState::Verified,
            Err(_) => VerificationState::Failed,
        }
    }

    async fn check_dmarc(&self, domain: &str) -> VerificationState {
        match self.dns.txt_starting_with(domain, "_dmarc.", "v=DMARC1").await {
            Ok(_) => VerificationState::Verified,
            // DMARC is advisory — an absent record is "not yet configured",
            // not a hard failure for sendability.
            Err(_) => VerificationState::Pending,
        }
    }

    async fn check_dkim(&self, domain_id: DomainId, domain: &str, selector: &str) -> VerificationState {
        let Ok(key) = self.dkim_keys.find_active(domain_id, selector).await else {
            return VerificationState::Failed;
        };

        let Ok(public_key) = key.public_key_der() else {
            return VerificationState::Failed;
        };

        match self.dns.verify_dkim(domain, selector, &public_key).await {
            Ok(_) => VerificationState::Verified,
            Err(_) => VerificationState::Failed,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DomainRepository, NewDomain, NewTenant, Plan, TenantRepository};
    use sqlx::PgPool;

    #[sqlx::test]
    async fn sweep_marks_spf_verified(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant { name: "Acme".to_string(), plan: Plan::Standard })
            .await
            .unwrap();

        let domains = DomainRepository::new(db.clone());
        let domain = domains
            .create(tenant.id(), &NewDomain { domain: "localhost".to_string() }, "uz")
            .await
            .unwrap();

        let dkim_keys = DkimKeyRepository::new(db);
        let mut dns = DnsResolver::mock("localhost", 0);
        dns.set_txt("v=spf1 include:test.com -all");

        let verifier = Verifier::new(
            domains.clone(),
            dkim_keys,
            dns,
            VerifierConfig::default(),
            CancellationToken::new(),
        );
        verifier.run_sweep().await;

        let domain = domains.find_by_id(tenant.id(), domain.id()).await.unwrap();
        assert!(domain.is_sendable());
    }
}
