//! Fire-and-forget product analytics

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait Analytics: Send + Sync {
    async fn capture(&self, event: &str, properties: Option<Value>) -> anyhow::Result<()>;
}

/// Logs events instead of shipping them anywhere
pub struct TracingAnalytics;

#[async_trait]
impl Analytics for TracingAnalytics {
    async fn capture(&self, event: &str, properties: Option<Value>) -> anyhow::Result<()> {
        tracing::debug!(event, properties = ?properties, "Analytics event");
        Ok(())
    }
}

/// Capture an event; failures are logged and dropped.
pub async fn capture(analytics: &Arc<dyn Analytics>, event: &str, properties: Option<Value>) {
    if let Err(e) = analytics.capture(event, properties).await {
        tracing::warn!("Failed to capture analytics event {}: {:#}", event, e);
    }
}
