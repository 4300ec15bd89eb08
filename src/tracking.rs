//! C12: Tracking/event recorder.
//!
//! Grounded on `models/event.rs`'s append-only `EventRepository`, which
//! already carries the `Opened`/`Clicked` variants; this module is the
//! thin, stateless layer on top of it — resolve a recipient by its opaque
//! tracking token (no credential, the link must work unauthenticated) and
//! append an event, collapsing replays within a short window instead of
//! recording one event per hit.

use chrono::{Duration, Utc};
use url::Url;

use crate::models::{EventKind, EventRepository, MessageRepository};

/// Replayed opens/clicks (bot prefetchers, image proxies re-fetching the
/// pixel) within this window collapse into the first recorded event.
const DEDUP_WINDOW: Duration = Duration::seconds(30);

/// A 1x1 transparent GIF, returned for every open-pixel hit regardless of
/// whether the token resolved, so a non-existent/expired token doesn't
/// leak that fact to the remote image loader.
pub const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Clone)]
pub struct Tracker {
    messages: MessageRepository,
    events: EventRepository,
}

impl Tracker {
    pub fn new(messages: MessageRepository, events: EventRepository) -> Self {
        Tracker { messages, events }
    }

    /// Records an `Opened` event for the recipient bound to `token`.
    /// Unknown tokens are silently ignored — there is no rejection path a
    /// caller can observe.
    pub async fn record_open(&self, token: &str) -> Result<(), crate::models::Error> {
        self.record(token, EventKind::Opened).await
    }

    /// Records a `Clicked` event for the recipient bound to `token` and
    /// returns the validated redirect target.
    pub async fn record_click(
        &self,
        token: &str,
        target: &str,
    ) -> Result<Option<Url>, crate::models::Error> {
        self.record(token, EventKind::Clicked).await?;

        Ok(Url::parse(target).ok())
    }

    async fn record(&self, token: &str, kind: EventKind) -> Result<(), crate::models::Error> {
        let recipient = match self.messages.find_recipient_by_token(token).await {
            Ok(recipient) => recipient,
            Err(crate::models::Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let since = Utc::now() - DEDUP_WINDOW;
        if self.events.recent_for_recipient(recipient.id(), kind, since).await? {
            return Ok(());
        }

        let message = self.messages.find_by_id_unscoped(recipient.message_id()).await?;

        self.events
            .record(message.tenant_id(), message.id(), Some(recipient.id()), kind, None)
            .await?;

        Ok(())
    }
}
