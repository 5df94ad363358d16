//! Instagram Messaging channel (Meta Graph API / Messenger Platform).
//!
//! Covers the webhook payload shapes delivered by Meta, normalization into
//! [`InboundEvent`]s, the send API client, and the outbound delivery contract
//! (one leading media item, then 1000-char text chunks).

use super::traits::{EventKind, InboundEvent, ReplyPayload, StatusPatch, StatusSink};
use crate::config::{AccountConfig, DmPolicy};
use crate::util::floor_utf8_char_boundary;
use serde::Deserialize;

const GRAPH_API_BASE: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v21.0";

/// Instagram caps DM text messages at 1000 characters.
pub const IG_TEXT_LIMIT: usize = 1000;

fn ensure_https(url: &str) -> anyhow::Result<()> {
    if !url.starts_with("https://") && !url.starts_with("http://127.0.0.1") {
        anyhow::bail!(
            "Refusing to transmit sensitive data over non-HTTPS URL: URL scheme must be https"
        );
    }
    Ok(())
}

// ── Webhook wire types ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub messaging: Vec<WebhookMessaging>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessaging {
    pub sender: Party,
    pub recipient: Party,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub message: Option<WebhookMessage>,
    #[serde(default)]
    pub postback: Option<WebhookPostback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Party {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    #[serde(default)]
    pub mid: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<WebhookAttachment>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAttachment {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPostback {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl WebhookMessaging {
    /// Message id used for replay deduplication (message mid, else postback mid).
    pub fn message_id(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|m| m.mid.as_str())
            .filter(|mid| !mid.is_empty())
            .or_else(|| self.postback.as_ref().and_then(|p| p.mid.as_deref()))
    }

    /// Echo markers flag messages our own page sent; deleted markers arrive
    /// when a user unsends. Both are dropped before dispatch.
    pub fn is_echo_or_deleted(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|m| m.is_echo || m.is_deleted)
    }

    fn image_urls(&self) -> Vec<String> {
        self.message
            .as_ref()
            .map(|m| {
                m.attachments
                    .iter()
                    .filter(|a| a.kind == "image")
                    .filter_map(|a| a.payload.as_ref().and_then(|p| p.url.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Normalize one messaging event. Returns `None` for events that carry
/// nothing actionable (reads, reactions, empty postbacks, ...).
pub fn normalize_event(account_id: &str, messaging: &WebhookMessaging) -> Option<InboundEvent> {
    let base = |kind, text: Option<String>, attachment_urls: Vec<String>| InboundEvent {
        account_id: account_id.to_string(),
        sender_id: messaging.sender.id.clone(),
        recipient_id: messaging.recipient.id.clone(),
        // Meta delivers seconds here; normalize to milliseconds.
        timestamp_ms: messaging.timestamp.saturating_mul(1000),
        kind,
        text,
        attachment_urls,
        media_path: None,
        message_id: messaging.message_id().unwrap_or_default().to_string(),
    };

    if let Some(message) = &messaging.message {
        let text = message.text.as_deref().map(str::trim).unwrap_or_default();
        if !text.is_empty() && message.attachments.is_empty() {
            return Some(base(EventKind::Text, Some(text.to_string()), Vec::new()));
        }

        let images = messaging.image_urls();
        if !message.attachments.is_empty() {
            let caption = (!text.is_empty()).then(|| text.to_string());
            return Some(base(EventKind::Media, caption, images));
        }
    }

    if let Some(postback) = &messaging.postback {
        // Ice breakers / buttons: prefer the payload, fall back to the title.
        let text = postback
            .payload
            .as_deref()
            .or(postback.title.as_deref())
            .map(str::trim)
            .unwrap_or_default();
        if !text.is_empty() {
            return Some(base(EventKind::Postback, Some(text.to_string()), Vec::new()));
        }
        return None;
    }

    None
}

// ── Send API ───────────────────────────────────────────────────────

/// Graph API error object attached to a non-success send response.
#[derive(Debug, thiserror::Error, Deserialize)]
#[error("Instagram API error: {message} (code {code:?}, subcode {error_subcode:?})")]
pub struct InstagramApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResult {
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    error: Option<InstagramApiError>,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// One account's view of the Instagram Messaging API.
pub struct InstagramChannel {
    account_id: String,
    access_token: String,
    page_id: String,
    api_version: String,
    dm_policy: DmPolicy,
    allow_from: Vec<String>,
    base_url: String,
    client: reqwest::Client,
}

impl InstagramChannel {
    pub fn from_account(account: &AccountConfig, access_token: String, page_id: String) -> Self {
        Self {
            account_id: account.account_id.clone(),
            access_token,
            page_id,
            api_version: account
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            dm_policy: account.dm_policy,
            allow_from: account.allow_from.clone(),
            base_url: GRAPH_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at a different API base. Intended for tests against a
    /// local mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// DM access control: `disabled` drops everything; `allowlist` admits
    /// listed ids, `"*"`, or everyone when the list is empty; `open` admits all.
    pub fn is_sender_allowed(&self, sender_id: &str) -> bool {
        match self.dm_policy {
            DmPolicy::Disabled => false,
            DmPolicy::Open => true,
            DmPolicy::Allowlist => {
                self.allow_from.is_empty()
                    || self.allow_from.iter().any(|v| v == "*" || v == sender_id)
            }
        }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.api_version, self.page_id
        )
    }

    async fn post_message(&self, body: serde_json::Value) -> anyhow::Result<SendResult> {
        let url = self.api_url();
        ensure_https(&url)?;

        let response: SendResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(err.into());
        }

        Ok(SendResult {
            recipient_id: response.recipient_id.unwrap_or_default(),
            message_id: response.message_id.unwrap_or_default(),
        })
    }

    pub async fn send_text(&self, recipient_id: &str, text: &str) -> anyhow::Result<SendResult> {
        self.post_message(serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
        }))
        .await
    }

    pub async fn send_image(
        &self,
        recipient_id: &str,
        image_url: &str,
    ) -> anyhow::Result<SendResult> {
        self.post_message(serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": {
                "attachment": {
                    "type": "image",
                    "payload": { "url": image_url },
                },
            },
        }))
        .await
    }

    /// Best-effort typing indicator while the pipeline runs.
    pub async fn send_typing_on(&self, recipient_id: &str) {
        let url = self.api_url();
        if ensure_https(&url).is_err() {
            return;
        }
        let body = serde_json::json!({
            "recipient": { "id": recipient_id },
            "sender_action": "typing_on",
        });
        if let Err(e) = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
        {
            tracing::debug!("[{}] typing indicator failed: {e}", self.account_id);
        }
    }

    /// Deliver one reply payload: at most the first media URL as an image
    /// message (a success consumes any caption text), otherwise the text in
    /// ordered 1000-char chunks. Chunk failures are logged, later chunks are
    /// still attempted.
    pub async fn deliver_reply(
        &self,
        recipient_id: &str,
        payload: &ReplyPayload,
        status: &dyn StatusSink,
    ) {
        if let Some(media_url) = payload.media_urls.first() {
            if payload.media_urls.len() > 1 {
                tracing::debug!(
                    "[{}] dropping {} extra media urls (one image per reply)",
                    self.account_id,
                    payload.media_urls.len() - 1
                );
            }
            match self.send_image(recipient_id, media_url).await {
                Ok(_) => {
                    status.notify(StatusPatch::outbound(crate::util::epoch_ms()));
                    return;
                }
                Err(e) => {
                    tracing::error!("[{}] Instagram image send failed: {e}", self.account_id);
                }
            }
        }

        let text = payload.text.as_deref().map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return;
        }

        for chunk in split_message(text, IG_TEXT_LIMIT) {
            match self.send_text(recipient_id, &chunk).await {
                Ok(_) => status.notify(StatusPatch::outbound(crate::util::epoch_ms())),
                Err(e) => {
                    tracing::error!("[{}] Instagram message send failed: {e}", self.account_id);
                }
            }
        }
    }
}

// ── Chunking ───────────────────────────────────────────────────────

/// Split a message into chunks of at most `limit` characters.
///
/// Markdown-aware in the sense that it prefers paragraph breaks, then line
/// breaks, then spaces, and only hard-splits when a chunk has no break point.
/// Separators stay with the preceding chunk, so concatenating the chunks
/// reproduces the input exactly.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let byte_limit = match remaining.char_indices().nth(limit) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let window = &remaining[..byte_limit];
        let half = byte_limit / 2;

        // Don't take a break point too close to the start; a tiny chunk
        // followed by another full window reads worse than a hard split.
        let cut = if let Some(pos) = window.rfind("\n\n").filter(|p| *p >= half) {
            pos + 2
        } else if let Some(pos) = window.rfind('\n').filter(|p| *p >= half) {
            pos + 1
        } else if let Some(pos) = window.rfind(' ') {
            pos + 1
        } else {
            floor_utf8_char_boundary(remaining, byte_limit)
        };

        let cut = cut.max(1);
        chunks.push(remaining[..cut].to_string());
        remaining = &remaining[cut..];
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
