//! Webhook verification, normalization and idempotent dispatch for payment
//! gateway callbacks.

pub mod canonical_json;
pub mod dedup;
pub mod dispatcher;
pub mod envelope;
pub mod gateway;
pub mod normalizer;
pub mod processor;
pub mod signature;
pub mod types;

pub use dedup::{
    expires_after, ClaimOutcome, DedupState, DedupStore, InMemoryDedupStore, StoreError,
    DEFAULT_DEDUP_RETENTION, MAX_DEDUP_RETENTION, PENDING_LEASE,
};
pub use dispatcher::{
    DispatchError, DispatchOutcome, Dispatcher, EventHandler, FnHandler, HandlerError,
    HandlerFailure, HandlerRegistry,
};
pub use envelope::WebhookEnvelope;
pub use gateway::{Gateway, UnknownGateway, DEFAULT_REPLAY_TOLERANCE};
pub use normalizer::{Normalizer, NormalizerError};
pub use processor::{
    Decision, FailurePolicy, GatewaySettings, Rejection, UnknownFailurePolicy, WebhookProcessor,
};
pub use signature::{SignatureError, SignatureStrategy};
pub use types::{CanonicalEvent, DedupKey, EventType, Settlement};
