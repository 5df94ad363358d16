use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// What an inbound messaging event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Postback,
    Media,
    Other,
}

/// A normalized inbound messaging event, constructed per webhook delivery and
/// handed to the reply pipeline. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Account that claimed the delivery.
    pub account_id: String,
    pub sender_id: String,
    /// Page / professional-account external id the message was sent to.
    pub recipient_id: String,
    pub timestamp_ms: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_urls: Vec<String>,
    /// Local path of the first fetched attachment, when media fetch succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    pub message_id: String,
}

/// One outbound reply unit produced by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media_urls: Vec::new(),
        }
    }
}

/// Produces replies for one inbound event. Implementations own their timeouts;
/// the gateway isolates failures per event and never retries.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn produce_replies(&self, event: &InboundEvent) -> anyhow::Result<Vec<ReplyPayload>>;
}

/// Best-effort activity patch pushed to a status sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusPatch {
    pub last_inbound_at: Option<u64>,
    pub last_outbound_at: Option<u64>,
}

impl StatusPatch {
    pub fn inbound(now_ms: u64) -> Self {
        Self {
            last_inbound_at: Some(now_ms),
            ..Self::default()
        }
    }

    pub fn outbound(now_ms: u64) -> Self {
        Self {
            last_outbound_at: Some(now_ms),
            ..Self::default()
        }
    }
}

/// Fire-and-forget activity sink. Notifications must never block or fail the
/// webhook path.
pub trait StatusSink: Send + Sync {
    fn notify(&self, patch: StatusPatch);
}

/// Lock-free per-account activity tracker, surfaced through `/health`.
/// Zero means "never".
#[derive(Debug, Default)]
pub struct ChannelStatus {
    last_inbound_at: AtomicU64,
    last_outbound_at: AtomicU64,
}

impl ChannelStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_inbound_at(&self) -> Option<u64> {
        match self.last_inbound_at.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn last_outbound_at(&self) -> Option<u64> {
        match self.last_outbound_at.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

impl StatusSink for ChannelStatus {
    fn notify(&self, patch: StatusPatch) {
        if let Some(ms) = patch.last_inbound_at {
            self.last_inbound_at.store(ms, Ordering::Relaxed);
        }
        if let Some(ms) = patch.last_outbound_at {
            self.last_outbound_at.store(ms, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_status_starts_empty() {
        let status = ChannelStatus::new();
        assert_eq!(status.last_inbound_at(), None);
        assert_eq!(status.last_outbound_at(), None);
    }

    #[test]
    fn channel_status_records_patches_independently() {
        let status = ChannelStatus::new();
        status.notify(StatusPatch::inbound(1_700_000_000_000));
        assert_eq!(status.last_inbound_at(), Some(1_700_000_000_000));
        assert_eq!(status.last_outbound_at(), None);

        status.notify(StatusPatch::outbound(1_700_000_000_500));
        assert_eq!(status.last_inbound_at(), Some(1_700_000_000_000));
        assert_eq!(status.last_outbound_at(), Some(1_700_000_000_500));
    }

    #[test]
    fn reply_payload_text_helper() {
        let payload = ReplyPayload::text("hi");
        assert_eq!(payload.text.as_deref(), Some("hi"));
        assert!(payload.media_urls.is_empty());
    }

    #[test]
    fn inbound_event_serializes_without_empty_fields() {
        let event = InboundEvent {
            account_id: "main".into(),
            sender_id: "123".into(),
            recipient_id: "456".into(),
            timestamp_ms: 1,
            kind: EventKind::Text,
            text: Some("hello".into()),
            attachment_urls: Vec::new(),
            media_path: None,
            message_id: "mid.1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("attachment_urls").is_none());
        assert!(json.get("media_path").is_none());
        assert_eq!(json["kind"], "text");
    }
}
