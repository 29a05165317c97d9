//! Fire-and-forget progress publishing.
//!
//! Stats snapshots feed an external real-time channel. Publishing is not part
//! of the durability contract: failures are logged and swallowed, and a stuck
//! channel is cut off by a short timeout so it can never stall a worker.

use crate::model::StatsSnapshot;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use tracing::warn;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn publish(&self, snapshot: &StatsSnapshot) -> Result<()>;
}

/// POSTs each snapshot as JSON to a configured webhook endpoint.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    endpoint: Url,
}

impl fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSink")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WebhookSink {
    pub fn new(endpoint: Url) -> Self {
        let http = Client::builder()
            .user_agent("wadispatch/0.1")
            .build()
            .expect("reqwest client");
        Self { http, endpoint }
    }
}

#[async_trait]
impl RealtimeSink for WebhookSink {
    async fn publish(&self, snapshot: &StatsSnapshot) -> Result<()> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(snapshot)
            .send()
            .await
            .context("failed to reach realtime webhook")?;
        if !res.status().is_success() {
            return Err(anyhow!("realtime webhook error {}", res.status()));
        }
        Ok(())
    }
}

/// Sink for deployments without a real-time channel.
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl RealtimeSink for NoopSink {
    async fn publish(&self, _snapshot: &StatsSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Publish with a bounded timeout; log and swallow any failure.
pub async fn publish_best_effort(sink: &dyn RealtimeSink, snapshot: &StatsSnapshot) {
    match tokio::time::timeout(PUBLISH_TIMEOUT, sink.publish(snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(?err, campaign_id = %snapshot.campaign_id, "stats publish failed");
        }
        Err(_) => {
            warn!(campaign_id = %snapshot.campaign_id, "stats publish timed out");
        }
    }
}
