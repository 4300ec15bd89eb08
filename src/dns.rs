//! C1: DNS resolver with an in-process cache.
//!
//! MX-lookup-with-priority-fallback and singular-TXT-record helpers,
//! wrapped in a cache that coalesces concurrent lookups for the same name
//! and clamps the cached TTL between `DnsCacheConfig::{min,max,negative}_ttl`.

use base64ct::{Base64Unpadded, Encoding};
#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{LookupIpStrategy::Ipv4Only, NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
};
use std::{collections::HashMap, ops::Range, sync::Arc, time::{Duration, Instant}};
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[cfg(test)]
use crate::mock;

#[derive(Debug, Clone, Copy)]
pub struct DnsCacheConfig {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        DnsCacheConfig {
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(20),
        }
    }
}

pub enum ResolveError {
    Dns,
    AllServersExhausted,
}

#[derive(Clone)]
enum CachedRecord {
    Mx(String, u16),
    Txt(Option<String>),
}

struct CacheEntry {
    value: CachedRecord,
    expires_at: Instant,
}

/// Caches MX and TXT lookups, keyed by `"{kind}:{name}"`, coalescing misses
/// behind a write lock so two concurrent lookups for the same name only
/// perform one DNS round trip.
#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    resolver: mock::Resolver,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: DnsCacheConfig,
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new(config: DnsCacheConfig) -> Self {
        let mut resolver_options = ResolverOpts::default();
        resolver_options.ip_strategy = Ipv4Only;
        resolver_options.negative_max_ttl = Some(config.negative_ttl);
        resolver_options.attempts = 4;

        let mut resolver_config = ResolverConfig::new();
        resolver_config.add_name_server(NameServerConfig {
            socket_addr: "9.9.9.9:853".parse().unwrap(),
            protocol: Protocol::Tls,
            tls_dns_name: Some("dns.quad9.net".to_string()),
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
        resolver_config.add_name_server(NameServerConfig {
            socket_addr: "149.112.112.112:853".parse().unwrap(),
            protocol: Protocol::Tls,
            tls_dns_name: Some("dns.quad9.net".to_string()),
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        });

        Self {
            resolver: Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(resolver_options)
                .build(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[cfg(test)]
    pub fn mock(domain: &'static str, port: u16) -> Self {
        Self {
            resolver: mock::Resolver {
                host: (domain, port),
                txt: "",
            },
            cache: Arc::new(RwLock::new(HashMap::new())),
            config: DnsCacheConfig::default(),
        }
    }

    #[cfg(test)]
    pub fn set_txt(&mut self, txt: &'static str) {
        self.resolver.txt = txt;
    }

    fn clamp(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.config.min_ttl, self.config.max_ttl)
    }

    pub async fn resolve_mail_domain(
        &self,
        domain: &str,
        prio: &mut Range<u32>,
    ) -> Result<(String, u16), ResolveError> {
        let key = format!("mx:{domain}");

        if let Some(entry) = self.cache.read().await.get(&key)
            && entry.expires_at > Instant::now()
            && let CachedRecord::Mx(host, port) = &entry.value
        {
            trace!("dns cache hit for {domain}");
            return Ok((host.clone(), *port));
        }

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(&key)
            && entry.expires_at > Instant::now()
            && let CachedRecord::Mx(host, port) = &entry.value
        {
            return Ok((host.clone(), *port));
        }

        let smtp_port = 25;
        let fqdn = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        let lookup = self
            .resolver
            .mx_lookup(&fqdn)
            .await
            .map_err(|_| ResolveError::Dns)?;

        let Some(destination) = lookup
            .iter()
            .filter(|mx| prio.contains(&u32::from(mx.preference())))
            .min_by_key(|mx| mx.preference())
        else {
            return if prio.contains(&0) {
                prio.start = u32::MAX;
                Ok((fqdn, smtp_port))
            } else {
                Err(ResolveError::AllServersExhausted)
            };
        };

        #[cfg(test)]
        let smtp_port = destination.port();

        prio.start = u32::from(destination.preference()) + 1;
        let host = destination.exchange().to_utf8();

        debug!("resolved mail server for {domain}: {host}");

        cache.insert(
            key,
            CacheEntry {
                value: CachedRecord::Mx(host.clone(), smtp_port),
                expires_at: Instant::now() + self.clamp(self.config.max_ttl),
            },
        );

        Ok((host, smtp_port))
    }

    async fn get_singular_dns_record(
        &self,
        record: &str,
        starting_with: &str,
    ) -> Result<String, &'static str> {
        let key = format!("txt:{record}:{starting_with}");

        if let Some(entry) = self.cache.read().await.get(&key)
            && entry.expires_at > Instant::now()
            && let CachedRecord::Txt(value) = &entry.value
        {
            return value.clone().ok_or("record unavailable");
        }

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(&key)
            && entry.expires_at > Instant::now()
            && let CachedRecord::Txt(value) = &entry.value
        {
            return value.clone().ok_or("record unavailable");
        }

        trace!("requesting DNS record {record}");
        let result = self.resolver.txt_lookup(record).await;

        let (value, ttl) = match result {
            Err(_) => (None, self.config.negative_ttl),
            Ok(records) => {
                let mut matching = records.into_iter().filter(|r| {
                    r.txt_data()
                        .iter()
                        .flatten()
                        .take(starting_with.len())
                        .eq(starting_with.as_bytes())
                });

                match matching.next() {
                    None => (None, self.config.negative_ttl),
                    Some(_first) if matching.next().is_some() => {
                        return Err("multiple conflicting DNS records available");
                    }
                    Some(first) => {
                        let data = first.txt_data().iter().flatten().copied().collect::<Vec<_>>();
                        match String::from_utf8(data) {
                            Ok(text) => (Some(text), self.config.max_ttl),
                            Err(_) => return Err("could not decode record"),
                        }
                    }
                }
            }
        };

        cache.insert(
            key,
            CacheEntry {
                value: CachedRecord::Txt(value.clone()),
                expires_at: Instant::now() + self.clamp(ttl),
            },
        );

        value.ok_or("record unavailable")
    }

    pub async fn verify_dkim(
        &self,
        domain: &str,
        selector: &str,
        dkim_pk_from_db: &[u8],
    ) -> Result<&'static str, &'static str> {
        let domain = domain.trim_matches('.');
        let record = format!("{selector}._domainkey.{domain}.");
        let dkim_data = self.get_singular_dns_record(&record, "v=DKIM1").await?;

        let dns_key = dkim_data
            .split(';')
            .filter_map(|field| field.trim().split_once('='))
            .find(|(key, _value)| *key == "p")
            .ok_or("could not get public key from record")?
            .1;

        let Ok(dns_key) = Base64Unpadded::decode_vec(dns_key) else {
            return Err("could not decode DKIM key");
        };

        if dns_key.iter().eq(dkim_pk_from_db) {
            Ok("available!")
        } else {
            Err("public key in DNS record does not match")
        }
    }

    pub async fn txt_starting_with(
        &self,
        domain: &str,
        prefix: &str,
        marker: &str,
    ) -> Result<String, &'static str> {
        let record = format!("{prefix}{}.", domain.trim_matches('.'));
        self.get_singular_dns_record(&record, marker).await
    }

    pub async fn any_a_record(&self, domain: &str) -> bool {
        let domain = format!("{}.", domain.trim_matches('.'));
        matches!(self.resolver.lookup_ip(domain).await, Ok(ips) if ips.iter().next().is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dkim_verification() {
        let domain = "localhost";
        let mut dns = DnsResolver::mock(domain, 0);
        dns.set_txt("v=DKIM1; k=rsa; p=AQID");

        dns.verify_dkim(domain, "uz", &[1, 2, 3]).await.unwrap();
        dns.verify_dkim(domain, "uz", &[9, 9, 9])
            .await
            .expect_err("should error");
    }

    #[tokio::test]
    async fn txt_lookup_is_cached() {
        let domain = "localhost";
        let mut dns = DnsResolver::mock(domain, 0);
        dns.set_txt("v=spf1 include:test.com -all");

        let first = dns.txt_starting_with(domain, "", "v=spf1").await.unwrap();
        dns.set_txt("");
        let second = dns.txt_starting_with(domain, "", "v=spf1").await.unwrap();
        assert_eq!(first, second);
    }
}
