use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use payhook_core::{CanonicalEvent, EventHandler, EventType, HandlerError, HandlerRegistry};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts each canonical event as JSON to a downstream endpoint.
///
/// A non-2xx answer counts as a handler failure so the dedup marker is
/// released and the gateway's redelivery gets another chance.
#[derive(Clone)]
pub struct ForwardingHandler {
    http: Client,
    target: Url,
}

impl ForwardingHandler {
    pub fn new(target: Url, http: Client) -> Self {
        Self { http, target }
    }

    /// Builds a client with a request timeout suited to inline forwarding.
    pub fn with_default_client(target: Url) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(FORWARD_TIMEOUT).build()?;
        Ok(Self::new(target, http))
    }

    async fn forward(&self, event: &CanonicalEvent) -> Result<(), ForwardError> {
        let response = self
            .http
            .post(self.target.clone())
            .header("Idempotency-Key", event.dedup_key().as_str())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(ForwardError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: &CanonicalEvent) -> Result<(), HandlerError> {
        match self.forward(event).await {
            Ok(()) => {
                counter!("forward_requests_total", "result" => "ok").increment(1);
                info!(
                    stage = "forward",
                    dedup_key = %event.dedup_key(),
                    target = %self.target,
                    "event forwarded"
                );
                Ok(())
            }
            Err(err) => {
                counter!("forward_requests_total", "result" => "error").increment(1);
                warn!(
                    stage = "forward",
                    dedup_key = %event.dedup_key(),
                    target = %self.target,
                    error = %err,
                    "event forwarding failed"
                );
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Fallback consumer when no forward target is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &CanonicalEvent) -> Result<(), HandlerError> {
        info!(
            stage = "forward",
            gateway = %event.gateway(),
            event_type = %event.event_type(),
            dedup_key = %event.dedup_key(),
            order_id = event.order_id().unwrap_or("-"),
            "event received"
        );
        Ok(())
    }
}

/// Registers one shared handler for every mapped event type.
///
/// Unmapped types stay unregistered so they surface as unhandled.
pub fn registry_for(handler: Arc<dyn EventHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for event_type in EventType::KNOWN {
        registry.register_shared(event_type, handler.clone());
    }
    registry
}

/// Forwarding registry when `forward_url` is set, logging registry otherwise.
pub fn build_registry(forward_url: Option<Url>) -> Result<HandlerRegistry, reqwest::Error> {
    let handler: Arc<dyn EventHandler> = match forward_url {
        Some(url) => Arc::new(ForwardingHandler::with_default_client(url)?),
        None => Arc::new(LoggingHandler),
    };
    Ok(registry_for(handler))
}
