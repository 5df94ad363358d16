//! Reply pipeline bindings.
//!
//! The gateway itself never composes replies; it hands each accepted inbound
//! event to a [`ReplyPipeline`] and delivers whatever comes back.

use crate::channels::{InboundEvent, ReplyPayload, ReplyPipeline};
use crate::config::PipelineConfig;
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// POSTs each event as JSON to a configured endpoint and expects an array of
/// reply payloads back. An empty array means "no reply".
pub struct HttpReplyPipeline {
    url: String,
    client: reqwest::Client,
}

impl HttpReplyPipeline {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build pipeline HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(Self::new(
            url,
            Duration::from_secs(config.timeout_secs),
        )?))
    }
}

#[async_trait]
impl ReplyPipeline for HttpReplyPipeline {
    async fn produce_replies(&self, event: &InboundEvent) -> Result<Vec<ReplyPayload>> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("pipeline request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "pipeline at {} returned {status}: {}",
                self.url,
                truncate_with_ellipsis(&body, 200)
            );
        }

        response
            .json::<Vec<ReplyPayload>>()
            .await
            .context("pipeline response was not a reply payload array")
    }
}

/// Logs inbound events and produces no replies. Used when no pipeline
/// endpoint is configured, so the gateway still works as a pure receiver.
pub struct LogOnlyPipeline;

#[async_trait]
impl ReplyPipeline for LogOnlyPipeline {
    async fn produce_replies(&self, event: &InboundEvent) -> Result<Vec<ReplyPayload>> {
        tracing::info!(
            account = %event.account_id,
            sender = %event.sender_id,
            kind = ?event.kind,
            "no pipeline configured; dropping event: {}",
            truncate_with_ellipsis(event.text.as_deref().unwrap_or("<media>"), 120)
        );
        Ok(Vec::new())
    }
}
