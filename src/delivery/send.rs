//! Direct-to-MX delivery of a single recipient, following a
//! `mail_send::Error` classification table of transient vs. permanent
//! failures.

use mail_send::{SmtpClientBuilder, smtp};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::delivery::connection_log::{ConnectionLog, LogLevel};
use crate::dns::{DnsResolver, ResolveError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("could not find a working MX receiver")]
    Permanent,
    #[error("no MX server accepted the message")]
    Transient,
}

#[derive(Clone, Copy)]
enum Protection {
    Tls,
    Plaintext,
}

/// Classifies a `mail_send::Error`: a 5xx SMTP reply is permanent,
/// everything else (connection, TLS, timeout, transient 4xx reply) is
/// retried.
fn classify(err: mail_send::Error) -> DeliveryError {
    match err {
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                DeliveryError::Transient
            } else {
                DeliveryError::Permanent
            }
        }
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism
        | mail_send::Error::MissingStartTls => DeliveryError::Permanent,
        _ => DeliveryError::Transient,
    }
}

/// Attempts delivery of `envelope` to `recipient_domain`'s MX hosts in
/// priority order, opportunistic TLS first, falling back to plaintext only
/// when `allow_plain` is set and only the connection itself (not the
/// message) was rejected.
pub async fn deliver_to_domain(
    dns: &DnsResolver,
    recipient_domain: &str,
    ehlo_domain: &str,
    allow_plain: bool,
    outbound_ip: IpAddr,
    envelope: smtp::message::Message<'_>,
    log: &mut ConnectionLog,
) -> Result<(), DeliveryError> {
    let mut priority = 0..u32::MAX;
    let mut saw_transient = false;

    let order: &[Protection] = if allow_plain {
        &[Protection::Tls, Protection::Plaintext]
    } else {
        &[Protection::Tls]
    };

    loop {
        let (host, port) = match dns.resolve_mail_domain(recipient_domain, &mut priority).await {
            Ok(target) => target,
            Err(ResolveError::AllServersExhausted) => {
                log.log(LogLevel::Info, format!("all mail servers for {recipient_domain} exhausted"));
                break;
            }
            Err(ResolveError::Dns) => {
                log.log(LogLevel::Error, format!("could not resolve domain {recipient_domain}"));
                saw_transient = true;
                break;
            }
        };

        for &protection in order {
            let builder = SmtpClientBuilder::new(host.as_str(), port)
                .local_ip(outbound_ip)
                .say_ehlo(true)
                .helo_host(ehlo_domain)
                .timeout(std::time::Duration::from_secs(60));

            let result = match protection {
                Protection::Tls => match builder.implicit_tls(false).connect().await {
                    Err(err) => Err(err),
                    Ok(mut client) => {
                        trace!(recipient_domain, %host, port, "securely connected to upstream server");
                        log.log(LogLevel::Info, format!("connected to {host}:{port} over TLS"));
                        let result = client.send(envelope.clone()).await;
                        client.quit().await.ok();
                        result
                    }
                },
                Protection::Plaintext => match builder.connect_plain().await {
                    Err(err) => Err(err),
                    Ok(mut client) => {
                        trace!(recipient_domain, %host, port, "insecurely connected to upstream server");
                        log.log(LogLevel::Warn, format!("connected to {host}:{port} without TLS"));
                        let result = client.send(envelope.clone()).await;
                        client.quit().await.ok();
                        result
                    }
                },
            };

            match result {
                Ok(()) => {
                    debug!(recipient_domain, %host, port, "message accepted");
                    log.log(LogLevel::Info, "message accepted");
                    return Ok(());
                }
                Err(err) => {
                    info!(recipient_domain, %host, port, "could not use server: {err}");
                    log.log(LogLevel::Warn, format!("could not use {host}:{port}: {err}"));

                    match classify(err) {
                        DeliveryError::Permanent => {}
                        DeliveryError::Transient => saw_transient = true,
                    }
                }
            }
        }
    }

    if saw_transient {
        Err(DeliveryError::Transient)
    } else {
        Err(DeliveryError::Permanent)
    }
}

/// Exponential backoff with jitter for a recipient's next retry: `delay =
/// min(max_delay, base * 2^attempts) * U(0.5, 1.5)`.
pub fn backoff(attempts: i32, base_secs: u64, max_delay_secs: u64) -> chrono::Duration {
    use rand::Rng;

    let exp = base_secs.saturating_mul(1u64.checked_shl(attempts.max(0) as u32).unwrap_or(u64::MAX));
    let capped = exp.min(max_delay_secs);
    let jittered = (capped as f64) * rand::rng().random_range(0.5..1.5);

    chrono::Duration::seconds(jittered.round() as i64)
}
