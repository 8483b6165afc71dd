use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gateway::Gateway;

/// Gateway-agnostic event classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CheckoutCompleted,
    CheckoutExpired,
    PaymentCreated,
    PaymentPending,
    PaymentConfirming,
    PaymentPartiallyPaid,
    PaymentSucceeded,
    PaymentFailed,
    PaymentExpired,
    PaymentCanceled,
    PaymentRefunded,
    PaymentPartiallyRefunded,
    RefundPending,
    RefundFailed,
    InvoiceFinalized,
    InvoiceSent,
    InvoicePaid,
    InvoicePaymentFailed,
    PayoutPending,
    PayoutCompleted,
    PayoutFailed,
    /// Gateway type string with no mapping. Kept so API drift stays observable.
    Unhandled(String),
}

impl EventType {
    /// Every mapped type, i.e. all variants except [`EventType::Unhandled`].
    pub const KNOWN: [EventType; 21] = [
        EventType::CheckoutCompleted,
        EventType::CheckoutExpired,
        EventType::PaymentCreated,
        EventType::PaymentPending,
        EventType::PaymentConfirming,
        EventType::PaymentPartiallyPaid,
        EventType::PaymentSucceeded,
        EventType::PaymentFailed,
        EventType::PaymentExpired,
        EventType::PaymentCanceled,
        EventType::PaymentRefunded,
        EventType::PaymentPartiallyRefunded,
        EventType::RefundPending,
        EventType::RefundFailed,
        EventType::InvoiceFinalized,
        EventType::InvoiceSent,
        EventType::InvoicePaid,
        EventType::InvoicePaymentFailed,
        EventType::PayoutPending,
        EventType::PayoutCompleted,
        EventType::PayoutFailed,
    ];

    /// Status segment of the dedup key.
    pub fn status_label(&self) -> &str {
        match self {
            Self::CheckoutCompleted => "completed",
            Self::CheckoutExpired => "expired",
            Self::PaymentCreated => "created",
            Self::PaymentPending => "pending",
            Self::PaymentConfirming => "confirming",
            Self::PaymentPartiallyPaid => "partially_paid",
            Self::PaymentSucceeded => "paid",
            Self::PaymentFailed => "failed",
            Self::PaymentExpired => "expired",
            Self::PaymentCanceled => "canceled",
            Self::PaymentRefunded => "refunded",
            Self::PaymentPartiallyRefunded => "partially_refunded",
            Self::RefundPending => "refund_pending",
            Self::RefundFailed => "refund_failed",
            Self::InvoiceFinalized => "finalized",
            Self::InvoiceSent => "sent",
            Self::InvoicePaid => "paid",
            Self::InvoicePaymentFailed => "payment_failed",
            Self::PayoutPending => "payout_pending",
            Self::PayoutCompleted => "payout_paid",
            Self::PayoutFailed => "payout_failed",
            Self::Unhandled(raw) => raw,
        }
    }

    /// Canonical name used for telemetry and the forwarding payload.
    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutCompleted => "checkout_completed",
            Self::CheckoutExpired => "checkout_expired",
            Self::PaymentCreated => "payment_created",
            Self::PaymentPending => "payment_pending",
            Self::PaymentConfirming => "payment_confirming",
            Self::PaymentPartiallyPaid => "payment_partially_paid",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentExpired => "payment_expired",
            Self::PaymentCanceled => "payment_canceled",
            Self::PaymentRefunded => "payment_refunded",
            Self::PaymentPartiallyRefunded => "payment_partially_refunded",
            Self::RefundPending => "refund_pending",
            Self::RefundFailed => "refund_failed",
            Self::InvoiceFinalized => "invoice_finalized",
            Self::InvoiceSent => "invoice_sent",
            Self::InvoicePaid => "invoice_paid",
            Self::InvoicePaymentFailed => "invoice_payment_failed",
            Self::PayoutPending => "payout_pending",
            Self::PayoutCompleted => "payout_completed",
            Self::PayoutFailed => "payout_failed",
            Self::Unhandled(_) => "unhandled",
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled(_))
    }

    /// Coarse transaction status an order should move to, if any.
    pub fn settlement(&self) -> Option<Settlement> {
        match self {
            Self::CheckoutCompleted
            | Self::PaymentSucceeded
            | Self::InvoicePaid
            | Self::PayoutCompleted => Some(Settlement::Completed),
            Self::PaymentCreated
            | Self::PaymentPending
            | Self::PaymentConfirming
            | Self::PaymentPartiallyPaid
            | Self::RefundPending
            | Self::PayoutPending => Some(Settlement::Pending),
            Self::CheckoutExpired
            | Self::PaymentFailed
            | Self::PaymentExpired
            | Self::PaymentCanceled
            | Self::InvoicePaymentFailed
            | Self::PayoutFailed => Some(Settlement::Failed),
            Self::PaymentRefunded | Self::PaymentPartiallyRefunded => Some(Settlement::Refunded),
            Self::RefundFailed | Self::InvoiceFinalized | Self::InvoiceSent | Self::Unhandled(_) => {
                None
            }
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhandled(raw) => write!(f, "unhandled({raw})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Coarse payment state shared by every gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Completed,
    Pending,
    Failed,
    Refunded,
}

/// Stable identity of a delivery used for redelivery detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(gateway: Gateway, external_id: &str, event_type: &EventType) -> Self {
        Self(format!(
            "{}:{}:{}",
            gateway.as_str(),
            external_id,
            event_type.status_label()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized webhook event handed to handlers. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    gateway: Gateway,
    event_type: EventType,
    raw_type: String,
    external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<String>,
    dedup_key: DedupKey,
    payload: Map<String, Value>,
}

impl CanonicalEvent {
    pub fn new(
        gateway: Gateway,
        event_type: EventType,
        raw_type: impl Into<String>,
        external_id: impl Into<String>,
        order_id: Option<String>,
        payload: Map<String, Value>,
    ) -> Self {
        let external_id = external_id.into();
        let dedup_key = DedupKey::new(gateway, &external_id, &event_type);
        Self {
            gateway,
            event_type,
            raw_type: raw_type.into(),
            external_id,
            order_id,
            dedup_key,
            payload,
        }
    }

    pub fn gateway(&self) -> Gateway {
        self.gateway
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Type string exactly as the gateway sent it.
    pub fn raw_type(&self) -> &str {
        &self.raw_type
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Merchant order reference, when the gateway echoes one back.
    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn dedup_key(&self) -> &DedupKey {
        &self.dedup_key
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn is_unhandled(&self) -> bool {
        self.event_type.is_unhandled()
    }
}
