use std::{
    collections::HashMap, error::Error as StdError, fmt, sync::Arc, time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dedup::{ClaimOutcome, DedupState, DedupStore, StoreError};
use crate::gateway::Gateway;
use crate::types::{CanonicalEvent, DedupKey, EventType};

/// Error returned by a handler. The dispatcher attaches it to
/// [`DispatchOutcome::Failed`] untouched.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Consumer-side reaction to a canonical event.
///
/// Handlers run inline on the request task and may block on their own I/O;
/// any timeout policy belongs to the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &CanonicalEvent) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&CanonicalEvent) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&CanonicalEvent) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, event: &CanonicalEvent) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

/// Handlers keyed by canonical event type.
///
/// Gateway-specific registrations take precedence over gateway-agnostic ones.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<EventType, Arc<dyn EventHandler>>,
    by_gateway: HashMap<(Gateway, EventType), Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, event_type: EventType, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        self.register_shared(event_type, Arc::new(handler))
    }

    /// Registers an already shared handler, e.g. one handler for many types.
    pub fn register_shared(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.by_type.insert(event_type, handler);
        self
    }

    pub fn register_for<H>(&mut self, gateway: Gateway, event_type: EventType, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        self.by_gateway
            .insert((gateway, event_type), Arc::new(handler));
        self
    }

    pub fn lookup(&self, gateway: Gateway, event_type: &EventType) -> Option<Arc<dyn EventHandler>> {
        self.by_gateway
            .get(&(gateway, event_type.clone()))
            .or_else(|| self.by_type.get(event_type))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_type.len() + self.by_gateway.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .field("gateway_overrides", &self.by_gateway.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handler failure with its original cause attached.
#[derive(Clone)]
pub struct HandlerFailure {
    cause: Arc<dyn StdError + Send + Sync>,
}

impl HandlerFailure {
    pub fn new(cause: HandlerError) -> Self {
        Self {
            cause: Arc::from(cause),
        }
    }

    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.cause.as_ref()
    }
}

impl fmt::Debug for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerFailure")
            .field(&self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.cause)
    }
}

/// Result of dispatching one canonical event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The handler ran and succeeded; the key is now accepted.
    Accepted,
    /// The key was already pending or accepted; no handler ran.
    Duplicate(DedupState),
    /// No handler is registered for the event type.
    Unhandled,
    /// The handler ran and failed; the key was rolled back to unseen.
    Failed(HandlerFailure),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate(_) => "duplicate",
            Self::Unhandled => "unhandled",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Routes canonical events to handlers at most once per dedup key.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DedupStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store }
    }

    /// Claims the event's key for `retention`, runs the matching handler and
    /// either accepts or releases the claim.
    ///
    /// If the returned future is dropped before the claim is settled, the
    /// pending key is released on a spawned task.
    pub async fn dispatch(
        &self,
        event: &CanonicalEvent,
        registry: &HandlerRegistry,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<DispatchOutcome, DispatchError> {
        let key = event.dedup_key();

        match self.store.try_claim(key, now, retention).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Existing(state) => {
                info!(
                    stage = "dispatch",
                    dedup_key = %key,
                    state = state.as_str(),
                    "duplicate delivery short-circuited"
                );
                return Ok(DispatchOutcome::Duplicate(state));
            }
        }
        let mut claim = PendingClaim::new(self.store.clone(), key.clone());

        let Some(handler) = registry.lookup(event.gateway(), event.event_type()) else {
            self.store.release(key).await?;
            claim.settle();
            info!(
                stage = "dispatch",
                dedup_key = %key,
                event_type = %event.event_type(),
                "no handler registered"
            );
            return Ok(DispatchOutcome::Unhandled);
        };

        match handler.handle(event).await {
            Ok(()) => {
                self.store.mark_accepted(key, now).await?;
                claim.settle();
                info!(
                    stage = "dispatch",
                    dedup_key = %key,
                    event_type = %event.event_type(),
                    "event accepted"
                );
                Ok(DispatchOutcome::Accepted)
            }
            Err(cause) => {
                let failure = HandlerFailure::new(cause);
                warn!(
                    stage = "dispatch",
                    dedup_key = %key,
                    event_type = %event.event_type(),
                    error = %failure,
                    "handler failed; releasing dedup key"
                );
                if let Err(err) = self.store.release(key).await {
                    error!(
                        stage = "dispatch",
                        dedup_key = %key,
                        error = %err,
                        "failed to release dedup key after handler failure"
                    );
                }
                claim.settle();
                Ok(DispatchOutcome::Failed(failure))
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Releases a pending claim that was never settled, e.g. when the dispatch
/// future is cancelled mid-handler. Store errors on the mark/release path
/// leave the guard armed too, so the key is not stranded as pending.
struct PendingClaim {
    store: Arc<dyn DedupStore>,
    key: DedupKey,
    armed: bool,
}

impl PendingClaim {
    fn new(store: Arc<dyn DedupStore>, key: DedupKey) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                stage = "dispatch",
                dedup_key = %self.key,
                "dispatch abandoned outside a runtime; claim expires with its lease"
            );
            return;
        };
        let store = self.store.clone();
        let key = self.key.clone();
        warn!(
            stage = "dispatch",
            dedup_key = %key,
            "dispatch abandoned before settling; releasing dedup key"
        );
        runtime.spawn(async move {
            if let Err(err) = store.release(&key).await {
                error!(
                    stage = "dispatch",
                    dedup_key = %key,
                    error = %err,
                    "failed to release abandoned dedup key"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{InMemoryDedupStore, DEFAULT_DEDUP_RETENTION};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn checkout_event() -> CanonicalEvent {
        CanonicalEvent::new(
            Gateway::Stripe,
            EventType::CheckoutCompleted,
            "checkout.session.completed",
            "cs_123",
            None,
            Map::new(),
        )
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(
            EventType::CheckoutCompleted,
            FnHandler::new(move |_event: &CanonicalEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        registry
    }

    #[tokio::test]
    async fn second_dispatch_is_duplicate() {
        let store = Arc::new(InMemoryDedupStore::new());
        let dispatcher = Dispatcher::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone());
        let event = checkout_event();
        let now = Utc::now();

        let first = dispatcher.dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION).await.expect("dispatch");
        let second = dispatcher.dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION).await.expect("dispatch");

        assert!(matches!(first, DispatchOutcome::Accepted));
        assert!(matches!(second, DispatchOutcome::Duplicate(DedupState::Accepted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.state(event.dedup_key()), Some(DedupState::Accepted));
    }

    #[tokio::test]
    async fn failure_rolls_back_so_retry_is_accepted() {
        let store = Arc::new(InMemoryDedupStore::new());
        let dispatcher = Dispatcher::new(store.clone());
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = attempts.clone();
        registry.register(
            EventType::CheckoutCompleted,
            FnHandler::new(move |_event: &CanonicalEvent| -> Result<(), HandlerError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("database unavailable".into())
                } else {
                    Ok(())
                }
            }),
        );
        let event = checkout_event();
        let now = Utc::now();

        let first = dispatcher.dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION).await.expect("dispatch");
        match first {
            DispatchOutcome::Failed(failure) => {
                assert_eq!(failure.cause().to_string(), "database unavailable");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(store.state(event.dedup_key()), None);

        let retry = dispatcher.dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION).await.expect("dispatch");
        assert!(matches!(retry, DispatchOutcome::Accepted));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_handler_is_unhandled_and_not_remembered() {
        let store = Arc::new(InMemoryDedupStore::new());
        let dispatcher = Dispatcher::new(store.clone());
        let event = checkout_event();

        let outcome = dispatcher
            .dispatch(
                &event,
                &HandlerRegistry::new(),
                Utc::now(),
                DEFAULT_DEDUP_RETENTION,
            )
            .await
            .expect("dispatch");

        assert!(matches!(outcome, DispatchOutcome::Unhandled));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn gateway_specific_handler_wins() {
        let generic = Arc::new(AtomicUsize::new(0));
        let specific = Arc::new(AtomicUsize::new(0));
        let mut registry = counting_registry(generic.clone());
        let counter = specific.clone();
        registry.register_for(
            Gateway::Stripe,
            EventType::CheckoutCompleted,
            FnHandler::new(move |_event: &CanonicalEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let dispatcher = Dispatcher::new(Arc::new(InMemoryDedupStore::new()));
        dispatcher
            .dispatch(&checkout_event(), &registry, Utc::now(), DEFAULT_DEDUP_RETENTION)
            .await
            .expect("dispatch");

        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(generic.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_run_the_handler_once() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(InMemoryDedupStore::new())));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register(
            EventType::CheckoutCompleted,
            FnHandler::new(move |_event: &CanonicalEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(())
            }),
        );
        let registry = Arc::new(registry);
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(&checkout_event(), &registry, now, DEFAULT_DEDUP_RETENTION)
                        .await
                        .expect("dispatch")
                })
            })
            .collect();

        let mut accepted = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.expect("join") {
                DispatchOutcome::Accepted => accepted += 1,
                DispatchOutcome::Duplicate(_) => duplicates += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(duplicates, 15);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct StalledHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for StalledHandler {
        async fn handle(&self, _event: &CanonicalEvent) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancelled_dispatch_releases_its_claim() {
        let store = Arc::new(InMemoryDedupStore::new());
        let dispatcher = Dispatcher::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(
            EventType::CheckoutCompleted,
            StalledHandler {
                calls: calls.clone(),
            },
        );
        let event = checkout_event();
        let now = Utc::now();

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            dispatcher.dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty());

        let redelivery = dispatcher
            .dispatch(&event, &registry, now, DEFAULT_DEDUP_RETENTION)
            .await
            .expect("dispatch");
        assert!(matches!(redelivery, DispatchOutcome::Accepted));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
