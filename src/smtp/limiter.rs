//! C9's connection, command, and per-session message rate limits, built on
//! the same counter shape C6's quota controller uses for per-tenant
//! admission, scaled down to per-connection in-memory counters rather than
//! a persisted window, since these are a cheap-abuse backstop in front of
//! authentication rather than a billable resource.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub max_connections_per_ip: usize,
    pub max_commands_per_session: u32,
    pub max_messages_per_session: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            max_connections_per_ip: 10,
            max_commands_per_session: 200,
            max_messages_per_session: 50,
        }
    }
}

#[derive(Default)]
struct Counts {
    by_ip: HashMap<IpAddr, usize>,
}

/// Shared across every connection accepted by one listener.
#[derive(Clone)]
pub struct ConnectionLimiter {
    config: LimiterConfig,
    counts: Arc<Mutex<Counts>>,
}

impl ConnectionLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        ConnectionLimiter { config, counts: Arc::new(Mutex::new(Counts::default())) }
    }

    /// Registers a new connection from `ip`. Returns `None` if `ip` is
    /// already at its concurrent-connection cap; the caller should close
    /// the socket without replying.
    pub async fn accept(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut counts = self.counts.lock().await;
        let current = counts.by_ip.entry(ip).or_insert(0);
        if *current >= self.config.max_connections_per_ip {
            return None;
        }
        *current += 1;

        Some(ConnectionGuard { limiter: self.clone(), ip })
    }

    async fn release(&self, ip: IpAddr) {
        let mut counts = self.counts.lock().await;
        if let Some(current) = counts.by_ip.get_mut(&ip) {
            *current = current.saturating_sub(1);
            if *current == 0 {
                counts.by_ip.remove(&ip);
            }
        }
    }
}

/// Decrements the owning IP's connection count when the connection ends.
pub struct ConnectionGuard {
    limiter: ConnectionLimiter,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let limiter = self.limiter.clone();
        let ip = self.ip;
        tokio::spawn(async move { limiter.release(ip).await });
    }
}

/// Per-connection counters: how many commands and how many completed
/// messages this session has sent, each capped independently of the
/// tenant-level quota enforced later by `submit_envelope`.
pub struct SessionLimiter {
    config: LimiterConfig,
    commands: u32,
    messages: u32,
}

impl SessionLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        SessionLimiter { config, commands: 0, messages: 0 }
    }

    /// Returns `false` once the session has exceeded its command budget —
    /// the connection should be dropped rather than replied to.
    pub fn record_command(&mut self) -> bool {
        self.commands += 1;
        self.commands <= self.config.max_commands_per_session
    }

    /// Returns `false` once the session has sent its maximum number of
    /// messages — further `DATA` attempts should be rejected.
    pub fn record_message(&mut self) -> bool {
        self.messages += 1;
        self.messages <= self.config.max_messages_per_session
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn connection_cap_is_enforced_per_ip() {
        let limiter =
            ConnectionLimiter::new(LimiterConfig { max_connections_per_ip: 1, ..Default::default() });
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let first = limiter.accept(ip).await;
        assert!(first.is_some());
        assert!(limiter.accept(ip).await.is_none());

        drop(first);
        // the guard's drop releases asynchronously via a spawned task
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(limiter.accept(ip).await.is_some());
    }

    #[test]
    fn session_message_cap_is_enforced() {
        let mut session =
            SessionLimiter::new(LimiterConfig { max_messages_per_session: 2, ..Default::default() });
        assert!(session.record_message());
        assert!(session.record_message());
        assert!(!session.record_message());
    }
}
