use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::dedup::{DedupStore, StoreError, DEFAULT_DEDUP_RETENTION};
use crate::dispatcher::{
    DispatchError, DispatchOutcome, Dispatcher, HandlerFailure, HandlerRegistry,
};
use crate::envelope::WebhookEnvelope;
use crate::gateway::{Gateway, DEFAULT_REPLAY_TOLERANCE};
use crate::normalizer::{decode_payload, Normalizer, NormalizerError};
use crate::signature::{SignatureError, SignatureStrategy};
use crate::types::CanonicalEvent;

/// Response policy when a handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Answer 200 so the gateway stops retrying.
    Acknowledge,
    /// Answer 500 so the gateway redelivers.
    Retry,
}

impl FailurePolicy {
    /// NowPayments caps its retries, so failures are acknowledged there.
    pub fn default_for(gateway: Gateway) -> Self {
        match gateway {
            Gateway::NowPayments => Self::Acknowledge,
            Gateway::Stripe | Gateway::Cryptomus | Gateway::CoinGate => Self::Retry,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown failure policy: {0} (expected acknowledge or retry)")]
pub struct UnknownFailurePolicy(pub String);

impl FromStr for FailurePolicy {
    type Err = UnknownFailurePolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "acknowledge" | "ack" => Ok(Self::Acknowledge),
            "retry" => Ok(Self::Retry),
            _ => Err(UnknownFailurePolicy(value.to_string())),
        }
    }
}

/// Verification and dispatch settings for one gateway endpoint.
#[derive(Clone)]
pub struct GatewaySettings {
    pub gateway: Gateway,
    pub secret: String,
    pub strategy: SignatureStrategy,
    pub replay_tolerance: Duration,
    pub dedup_retention: Duration,
    pub failure_policy: FailurePolicy,
    pub reject_unknown_events: bool,
}

impl GatewaySettings {
    pub fn new(gateway: Gateway, secret: impl Into<String>) -> Self {
        Self {
            gateway,
            secret: secret.into(),
            strategy: gateway.default_strategy(),
            replay_tolerance: DEFAULT_REPLAY_TOLERANCE,
            dedup_retention: DEFAULT_DEDUP_RETENTION,
            failure_policy: FailurePolicy::default_for(gateway),
            reject_unknown_events: false,
        }
    }

    /// Also rewrites the tolerance carried by a timestamped strategy.
    pub fn with_replay_tolerance(mut self, tolerance: Duration) -> Self {
        self.replay_tolerance = tolerance;
        if let SignatureStrategy::TimestampedHmac { .. } = self.strategy {
            self.strategy = SignatureStrategy::TimestampedHmac { tolerance };
        }
        self
    }

    pub fn with_dedup_retention(mut self, retention: Duration) -> Self {
        self.dedup_retention = retention;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_reject_unknown_events(mut self, reject: bool) -> Self {
        self.reject_unknown_events = reject;
        self
    }

    pub fn normalizer(&self) -> Normalizer {
        if self.reject_unknown_events {
            Normalizer::strict()
        } else {
            Normalizer::lenient()
        }
    }
}

impl fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySettings")
            .field("gateway", &self.gateway)
            .field("secret", &"<redacted>")
            .field("strategy", &self.strategy)
            .field("replay_tolerance", &self.replay_tolerance)
            .field("dedup_retention", &self.dedup_retention)
            .field("failure_policy", &self.failure_policy)
            .field("reject_unknown_events", &self.reject_unknown_events)
            .finish()
    }
}

/// Why a delivery was refused before any handler ran.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Normalization(#[from] NormalizerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Signature(err) => err.reason(),
            Self::Normalization(err) => err.reason(),
            Self::Store(_) => "store_unavailable",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Signature(_) => 401,
            Self::Normalization(_) => 400,
            Self::Store(_) => 500,
        }
    }
}

impl From<DispatchError> for Rejection {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Store(err) => Self::Store(err),
        }
    }
}

/// Final verdict for one inbound webhook, mapped to an HTTP status by the caller.
#[derive(Debug)]
pub enum Decision {
    Accepted(CanonicalEvent),
    Duplicate(CanonicalEvent),
    Unhandled(CanonicalEvent),
    Rejected(Rejection),
    Failed {
        event: CanonicalEvent,
        cause: HandlerFailure,
    },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Duplicate(_) => "duplicate",
            Self::Unhandled(_) => "unhandled",
            Self::Rejected(_) => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn status_code(&self, policy: FailurePolicy) -> u16 {
        match self {
            Self::Accepted(_) | Self::Duplicate(_) | Self::Unhandled(_) => 200,
            Self::Rejected(rejection) => rejection.status_code(),
            Self::Failed { .. } => match policy {
                FailurePolicy::Acknowledge => 200,
                FailurePolicy::Retry => 500,
            },
        }
    }

    pub fn event(&self) -> Option<&CanonicalEvent> {
        match self {
            Self::Accepted(event)
            | Self::Duplicate(event)
            | Self::Unhandled(event)
            | Self::Failed { event, .. } => Some(event),
            Self::Rejected(_) => None,
        }
    }
}

/// Runs verify, decode, normalize and dispatch for one delivery.
#[derive(Debug, Clone)]
pub struct WebhookProcessor {
    dispatcher: Dispatcher,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self {
            dispatcher: Dispatcher::new(store),
        }
    }

    pub async fn process(
        &self,
        settings: &GatewaySettings,
        envelope: &WebhookEnvelope,
        registry: &HandlerRegistry,
        now: DateTime<Utc>,
    ) -> Decision {
        let gateway = settings.gateway;

        if let Err(err) = settings
            .strategy
            .verify(envelope, settings.secret.as_bytes(), now)
        {
            warn!(
                stage = "verify",
                %gateway,
                strategy = settings.strategy.label(),
                reason = err.reason(),
                error = %err,
                "webhook signature rejected"
            );
            return Decision::Rejected(err.into());
        }

        let event = match decode_payload(envelope)
            .and_then(|payload| settings.normalizer().normalize(gateway, &payload))
        {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    stage = "normalizer",
                    %gateway,
                    reason = err.reason(),
                    error = %err,
                    "webhook payload rejected"
                );
                return Decision::Rejected(err.into());
            }
        };

        if event.is_unhandled() {
            warn!(
                stage = "normalizer",
                %gateway,
                raw_type = event.raw_type(),
                "unmapped gateway event type"
            );
        }

        match self
            .dispatcher
            .dispatch(&event, registry, now, settings.dedup_retention)
            .await
        {
            Ok(DispatchOutcome::Accepted) => Decision::Accepted(event),
            Ok(DispatchOutcome::Duplicate(_)) => Decision::Duplicate(event),
            Ok(DispatchOutcome::Unhandled) => Decision::Unhandled(event),
            Ok(DispatchOutcome::Failed(cause)) => Decision::Failed { event, cause },
            Err(err) => {
                warn!(
                    stage = "dispatch",
                    %gateway,
                    dedup_key = %event.dedup_key(),
                    error = %err,
                    "dedup store unavailable"
                );
                Decision::Rejected(err.into())
            }
        }
    }
}
