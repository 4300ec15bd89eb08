//! C11: Bounce/feedback handler.
//!
//! Outbound delivery classifies 5xx replies as hard bounces; this module
//! additionally parses inbound DSN (RFC 3464) and ARF (RFC 5965) reports
//! by line-scanning the machine-readable `message/delivery-status` and
//! `message/feedback-report` parts directly, rather than walking a full
//! MIME tree, since both are themselves flat RFC 822-style field blocks.

use crate::models::{
    EventKind, EventRepository, MessageId, RecipientId, SuppressionReason, SuppressionRepository,
    TenantId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAction {
    Failed,
    Delayed,
    Other,
}

#[derive(Debug, Clone)]
pub struct DsnRecipient {
    pub address: String,
    pub action: ReportAction,
}

#[derive(Clone)]
pub struct BounceHandler {
    suppression: SuppressionRepository,
    events: EventRepository,
}

impl BounceHandler {
    pub fn new(suppression: SuppressionRepository, events: EventRepository) -> Self {
        BounceHandler { suppression, events }
    }

    /// A recipient's outbound delivery attempt ended in a permanent (5xx)
    /// failure: suppress the address for this tenant so it is never
    /// re-enqueued, and record the terminal event.
    pub async fn record_hard_bounce(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        recipient_id: RecipientId,
        address: &str,
        reason: &str,
    ) -> Result<(), crate::models::Error> {
        self.suppression.suppress(tenant_id, address, SuppressionReason::HardBounce).await?;
        self.events
            .record(tenant_id, message_id, Some(recipient_id), EventKind::Bounced, Some(reason))
            .await?;
        Ok(())
    }

    /// An ARF feedback-loop complaint: suppressed the same as a hard
    /// bounce, but recorded distinctly — a complaint is a reputation
    /// signal, not a deliverability failure.
    pub async fn record_complaint(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        recipient_id: RecipientId,
        address: &str,
    ) -> Result<(), crate::models::Error> {
        self.suppression.suppress(tenant_id, address, SuppressionReason::Complaint).await?;
        self.events
            .record(tenant_id, message_id, Some(recipient_id), EventKind::Complained, None)
            .await?;
        Ok(())
    }
}

/// Extracts every `name: value` line (case-insensitive field name) from a
/// flat RFC 822-style field block, in document order.
fn extract_field<'a>(block: &'a str, name: &str) -> Vec<&'a str> {
    block
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .collect()
}

/// `rfc822;user@example.com` / `rfc822; user@example.com` → `user@example.com`.
fn strip_address_type(value: &str) -> &str {
    value.split_once(';').map_or(value, |(_, addr)| addr.trim())
}

/// Parses the per-recipient blocks of an RFC 3464 `message/delivery-status`
/// part, which is itself just a sequence of field blocks separated by a
/// blank line: one header block for the whole message, then one block per
/// recipient carrying at least `Final-Recipient`, `Action`, and `Status`.
pub fn parse_dsn_recipients(part: &str) -> Vec<DsnRecipient> {
    part.split("\n\n")
        .filter_map(|block| {
            let final_recipient = extract_field(block, "Final-Recipient").into_iter().next()?;
            let address = strip_address_type(final_recipient).to_string();

            let action = match extract_field(block, "Action").into_iter().next() {
                Some(a) if a.eq_ignore_ascii_case("failed") => ReportAction::Failed,
                Some(a) if a.eq_ignore_ascii_case("delayed") => ReportAction::Delayed,
                _ => ReportAction::Other,
            };

            Some(DsnRecipient { address, action })
        })
        .collect()
}

/// Parses the `Original-Rcpt-To` fields of an RFC 5965 `message/feedback-report`
/// part. A real ARF report carries at most one, but the format allows
/// repetition.
pub fn parse_arf_recipients(part: &str) -> Vec<String> {
    extract_field(part, "Original-Rcpt-To")
        .into_iter()
        .map(strip_address_type)
        .map(str::to_string)
        .collect()
}

/// Whether an ARF report's `Feedback-Type` field names a spam/abuse
/// complaint rather than some other feedback-loop category (fraud,
/// virus, ...), which this handler does not suppress on.
pub fn is_abuse_report(part: &str) -> bool {
    extract_field(part, "Feedback-Type")
        .into_iter()
        .next()
        .is_some_and(|v| v.eq_ignore_ascii_case("abuse"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_failed_recipient_from_dsn_block() {
        let report = "\
Reporting-MTA: dns; mx.example.com
Arrival-Date: Mon, 1 Jan 2026 00:00:00 +0000

Final-Recipient: rfc822; user@nobody.test
Action: failed
Status: 5.1.1
Diagnostic-Code: smtp; 550 5.1.1 no such user";

        let recipients = parse_dsn_recipients(report);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].address, "user@nobody.test");
        assert_eq!(recipients[0].action, ReportAction::Failed);
    }

    #[test]
    fn delayed_recipient_is_not_failed() {
        let report = "Final-Recipient: rfc822; user@example.com\nAction: delayed\nStatus: 4.4.1";
        let recipients = parse_dsn_recipients(report);
        assert_eq!(recipients[0].action, ReportAction::Delayed);
    }

    #[test]
    fn parses_arf_original_recipient_and_abuse_type() {
        let report = "\
Feedback-Type: abuse
User-Agent: SomeGenerator/1.0
Version: 1
Original-Rcpt-To: rfc822; user@example.com";

        assert!(is_abuse_report(report));
        assert_eq!(parse_arf_recipients(report), vec!["user@example.com".to_string()]);
    }

    #[test]
    fn non_abuse_feedback_type_is_not_a_complaint() {
        let report = "Feedback-Type: not-spam\nOriginal-Rcpt-To: rfc822; user@example.com";
        assert!(!is_abuse_report(report));
    }
}
