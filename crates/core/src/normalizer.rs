use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::WebhookEnvelope;
use crate::gateway::Gateway;
use crate::signature::EMBEDDED_SIGNATURE_FIELD;
use crate::types::{CanonicalEvent, EventType};

/// Errors that can occur during normalization of incoming webhook payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizerError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unrecognized {gateway} event type: {event_type}")]
    UnrecognizedEventType { gateway: Gateway, event_type: String },
}

impl NormalizerError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::UnrecognizedEventType { .. } => "unrecognized_event_type",
        }
    }

    fn missing(field: &str) -> Self {
        Self::MalformedPayload(format!("missing required field: {field}"))
    }
}

/// Decodes the envelope body into a JSON object.
///
/// Form-encoded bodies (CoinGate's default callback format) become a map of
/// string values.
pub fn decode_payload(envelope: &WebhookEnvelope) -> Result<Map<String, Value>, NormalizerError> {
    if envelope.is_form_encoded() {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(envelope.body())
            .map_err(|err| NormalizerError::MalformedPayload(format!("invalid form body: {err}")))?;
        return Ok(pairs
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect());
    }

    match serde_json::from_slice::<Value>(envelope.body()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(NormalizerError::MalformedPayload(
            "payload must be a JSON object".to_string(),
        )),
        Err(err) => Err(NormalizerError::MalformedPayload(format!(
            "failed to parse payload: {err}"
        ))),
    }
}

/// Deterministic mapper from gateway payloads to [`CanonicalEvent`] values.
///
/// In the default lenient mode an unmapped type string yields an
/// [`EventType::Unhandled`] event; [`Normalizer::strict`] turns it into
/// [`NormalizerError::UnrecognizedEventType`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    strict: bool,
}

impl Normalizer {
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn normalize(
        &self,
        gateway: Gateway,
        payload: &Map<String, Value>,
    ) -> Result<CanonicalEvent, NormalizerError> {
        let fields = match gateway {
            Gateway::Stripe => stripe_fields(payload)?,
            Gateway::Cryptomus => cryptomus_fields(payload)?,
            Gateway::NowPayments => nowpayments_fields(payload)?,
            Gateway::CoinGate => coingate_fields(payload)?,
        };

        let event_type = match fields.event_type {
            Some(event_type) => event_type,
            None if self.strict => {
                return Err(NormalizerError::UnrecognizedEventType {
                    gateway,
                    event_type: fields.raw_type,
                })
            }
            None => EventType::Unhandled(fields.raw_type.clone()),
        };

        let mut payload = payload.clone();
        if gateway == Gateway::Cryptomus {
            payload.remove(EMBEDDED_SIGNATURE_FIELD);
        }

        Ok(CanonicalEvent::new(
            gateway,
            event_type,
            fields.raw_type,
            fields.external_id,
            fields.order_id,
            payload,
        ))
    }
}

struct ExtractedFields {
    raw_type: String,
    event_type: Option<EventType>,
    external_id: String,
    order_id: Option<String>,
}

fn stripe_fields(payload: &Map<String, Value>) -> Result<ExtractedFields, NormalizerError> {
    let raw_type = required_str(payload, "type")?;
    let object = payload
        .get("data")
        .and_then(|data| data.get("object"))
        .and_then(Value::as_object);
    let external_id = object
        .and_then(|object| id_value(object.get("id")))
        .or_else(|| id_value(payload.get("id")))
        .ok_or_else(|| NormalizerError::missing("data.object.id"))?;
    let order_id = object.and_then(|object| {
        id_value(object.get("client_reference_id")).or_else(|| {
            object
                .get("metadata")
                .and_then(|metadata| id_value(metadata.get("order_id")))
        })
    });

    Ok(ExtractedFields {
        event_type: stripe_event_type(&raw_type),
        raw_type,
        external_id,
        order_id,
    })
}

fn stripe_event_type(raw: &str) -> Option<EventType> {
    let event_type = match raw {
        "checkout.session.completed" => EventType::CheckoutCompleted,
        "checkout.session.expired" => EventType::CheckoutExpired,
        "checkout.session.async_payment_succeeded" | "payment_intent.succeeded" => {
            EventType::PaymentSucceeded
        }
        "checkout.session.async_payment_failed" | "payment_intent.payment_failed" => {
            EventType::PaymentFailed
        }
        "payment_intent.canceled" => EventType::PaymentCanceled,
        "charge.refunded" => EventType::PaymentRefunded,
        "invoice.finalized" => EventType::InvoiceFinalized,
        "invoice.sent" => EventType::InvoiceSent,
        "invoice.paid" | "invoice.payment_succeeded" => EventType::InvoicePaid,
        "invoice.payment_failed" => EventType::InvoicePaymentFailed,
        _ => return None,
    };
    Some(event_type)
}

fn cryptomus_fields(payload: &Map<String, Value>) -> Result<ExtractedFields, NormalizerError> {
    let status = required_str(payload, "status")?.to_ascii_lowercase();
    let external_id =
        id_value(payload.get("uuid")).ok_or_else(|| NormalizerError::missing("uuid"))?;
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("payment")
        .to_ascii_lowercase();

    let event_type = if kind == "payout" {
        cryptomus_payout_type(&status)
    } else {
        cryptomus_payment_type(&status)
    };

    Ok(ExtractedFields {
        event_type,
        raw_type: status,
        external_id,
        order_id: id_value(payload.get("order_id")),
    })
}

fn cryptomus_payment_type(status: &str) -> Option<EventType> {
    let event_type = match status {
        "paid" | "paid_over" => EventType::PaymentSucceeded,
        "wrong_amount" | "wrong_amount_waiting" => EventType::PaymentPartiallyPaid,
        "process" | "check" | "confirm_check" => EventType::PaymentConfirming,
        "cancel" => EventType::PaymentCanceled,
        "fail" | "system_fail" => EventType::PaymentFailed,
        "refund_process" => EventType::RefundPending,
        "refund_paid" => EventType::PaymentRefunded,
        "refund_fail" => EventType::RefundFailed,
        _ => return None,
    };
    Some(event_type)
}

fn cryptomus_payout_type(status: &str) -> Option<EventType> {
    let event_type = match status {
        "process" | "check" => EventType::PayoutPending,
        "paid" => EventType::PayoutCompleted,
        "fail" | "system_fail" | "cancel" => EventType::PayoutFailed,
        _ => return None,
    };
    Some(event_type)
}

fn nowpayments_fields(payload: &Map<String, Value>) -> Result<ExtractedFields, NormalizerError> {
    let status = required_str(payload, "payment_status")?.to_ascii_lowercase();
    let external_id = id_value(payload.get("payment_id"))
        .ok_or_else(|| NormalizerError::missing("payment_id"))?;

    let event_type = match status.as_str() {
        "waiting" => Some(EventType::PaymentPending),
        "confirming" | "confirmed" | "sending" => Some(EventType::PaymentConfirming),
        "partially_paid" => Some(EventType::PaymentPartiallyPaid),
        "finished" => Some(EventType::PaymentSucceeded),
        "failed" => Some(EventType::PaymentFailed),
        "refunded" => Some(EventType::PaymentRefunded),
        "expired" => Some(EventType::PaymentExpired),
        _ => None,
    };

    Ok(ExtractedFields {
        event_type,
        raw_type: status,
        external_id,
        order_id: id_value(payload.get("order_id")),
    })
}

fn coingate_fields(payload: &Map<String, Value>) -> Result<ExtractedFields, NormalizerError> {
    let status = required_str(payload, "status")?.to_ascii_lowercase();
    let external_id = id_value(payload.get("id")).ok_or_else(|| NormalizerError::missing("id"))?;

    let event_type = match status.as_str() {
        "new" => Some(EventType::PaymentCreated),
        "pending" => Some(EventType::PaymentPending),
        "confirming" => Some(EventType::PaymentConfirming),
        "paid" => Some(EventType::PaymentSucceeded),
        "invalid" => Some(EventType::PaymentFailed),
        "expired" => Some(EventType::PaymentExpired),
        "canceled" => Some(EventType::PaymentCanceled),
        "refunded" => Some(EventType::PaymentRefunded),
        "partially_refunded" => Some(EventType::PaymentPartiallyRefunded),
        _ => None,
    };

    Ok(ExtractedFields {
        event_type,
        raw_type: status,
        external_id,
        order_id: id_value(payload.get("order_id")),
    })
}

fn required_str(payload: &Map<String, Value>, field: &str) -> Result<String, NormalizerError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| NormalizerError::missing(field))
}

/// Identifiers arrive as strings or bare numbers depending on the gateway.
fn id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn stripe_checkout_completed_builds_expected_key() {
        let payload = object(json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_123", "client_reference_id": "order-9"}}
        }));
        let event = Normalizer::lenient()
            .normalize(Gateway::Stripe, &payload)
            .expect("normalize");

        assert_eq!(event.gateway(), Gateway::Stripe);
        assert_eq!(event.event_type(), &EventType::CheckoutCompleted);
        assert_eq!(event.dedup_key().as_str(), "stripe:cs_123:completed");
        assert_eq!(event.order_id(), Some("order-9"));
        assert_eq!(event.raw_type(), "checkout.session.completed");
    }

    #[test]
    fn stripe_falls_back_to_top_level_id() {
        let payload = object(json!({"id": "cs_123", "type": "checkout.session.completed"}));
        let event = Normalizer::lenient()
            .normalize(Gateway::Stripe, &payload)
            .expect("normalize");
        assert_eq!(event.dedup_key().as_str(), "stripe:cs_123:completed");
    }

    #[test]
    fn normalization_is_deterministic() {
        let payload = object(json!({"payment_id": 5077125051u64, "payment_status": "finished"}));
        let first = Normalizer::lenient().normalize(Gateway::NowPayments, &payload);
        let second = Normalizer::lenient().normalize(Gateway::NowPayments, &payload);
        assert_eq!(first, second);
        assert_eq!(
            first.expect("normalize").dedup_key().as_str(),
            "nowpayments:5077125051:paid"
        );
    }

    #[test]
    fn unknown_type_becomes_unhandled_in_lenient_mode() {
        let payload = object(json!({"id": "cus_1", "type": "customer.created"}));
        let event = Normalizer::lenient()
            .normalize(Gateway::Stripe, &payload)
            .expect("normalize");
        assert_eq!(
            event.event_type(),
            &EventType::Unhandled("customer.created".to_string())
        );
        assert!(event.is_unhandled());
    }

    #[test]
    fn unknown_type_is_an_error_in_strict_mode() {
        let payload = object(json!({"id": 7, "status": "on_hold"}));
        let err = Normalizer::strict()
            .normalize(Gateway::CoinGate, &payload)
            .expect_err("strict mode rejects");
        assert_eq!(
            err,
            NormalizerError::UnrecognizedEventType {
                gateway: Gateway::CoinGate,
                event_type: "on_hold".to_string(),
            }
        );
        assert_eq!(err.reason(), "unrecognized_event_type");
    }

    #[test]
    fn missing_fields_are_malformed() {
        let cases = [
            (Gateway::Stripe, json!({"id": "x"})),
            (Gateway::Stripe, json!({"type": "invoice.paid"})),
            (Gateway::Cryptomus, json!({"type": "payment", "status": "paid"})),
            (Gateway::NowPayments, json!({"payment_id": 1})),
            (Gateway::CoinGate, json!({"id": "", "status": "paid"})),
        ];
        for (gateway, payload) in cases {
            let err = Normalizer::lenient()
                .normalize(gateway, &object(payload))
                .expect_err("malformed");
            assert!(matches!(err, NormalizerError::MalformedPayload(_)), "{gateway}");
        }
    }

    #[test]
    fn cryptomus_distinguishes_payouts_from_payments() {
        let payment = object(json!({"type": "payment", "uuid": "u-1", "status": "paid", "order_id": "o-1"}));
        let payout = object(json!({"type": "payout", "uuid": "u-2", "status": "paid"}));

        let payment = Normalizer::lenient()
            .normalize(Gateway::Cryptomus, &payment)
            .expect("payment");
        let payout = Normalizer::lenient()
            .normalize(Gateway::Cryptomus, &payout)
            .expect("payout");

        assert_eq!(payment.event_type(), &EventType::PaymentSucceeded);
        assert_eq!(payment.order_id(), Some("o-1"));
        assert_eq!(payout.event_type(), &EventType::PayoutCompleted);
        assert_eq!(payout.dedup_key().as_str(), "cryptomus:u-2:payout_paid");
    }

    #[test]
    fn cryptomus_embedded_sign_is_not_forwarded() {
        let payload = object(json!({
            "type": "payment",
            "uuid": "u-3",
            "status": "paid",
            "sign": "6a3c5a9e0c1f5d3b8a1e2f4c7d9b0a12"
        }));

        let event = Normalizer::lenient()
            .normalize(Gateway::Cryptomus, &payload)
            .expect("normalize");

        assert!(!event.payload().contains_key("sign"));
        assert_eq!(event.payload().get("uuid"), Some(&json!("u-3")));
        assert_eq!(event.dedup_key().as_str(), "cryptomus:u-3:paid");

        let other = object(json!({"id": "evt_9", "type": "charge.refunded", "sign": "x"}));
        let event = Normalizer::lenient()
            .normalize(Gateway::Stripe, &other)
            .expect("normalize");
        assert!(event.payload().contains_key("sign"));
    }

    #[test]
    fn coingate_maps_statuses_case_insensitively() {
        let payload = object(json!({"id": 343, "status": "Partially_Refunded"}));
        let event = Normalizer::lenient()
            .normalize(Gateway::CoinGate, &payload)
            .expect("normalize");
        assert_eq!(event.event_type(), &EventType::PaymentPartiallyRefunded);
        assert_eq!(event.external_id(), "343");
    }

    #[test]
    fn decodes_form_encoded_bodies() {
        let envelope = WebhookEnvelope::new(b"id=343&status=paid&order_id=o%2D1".to_vec())
            .with_content_type("application/x-www-form-urlencoded");
        let payload = decode_payload(&envelope).expect("decode");
        assert_eq!(payload.get("order_id"), Some(&json!("o-1")));

        let event = Normalizer::lenient()
            .normalize(Gateway::CoinGate, &payload)
            .expect("normalize");
        assert_eq!(event.dedup_key().as_str(), "coingate:343:paid");
    }

    #[test]
    fn rejects_non_object_json() {
        let err = decode_payload(&WebhookEnvelope::new(b"[1,2]".to_vec())).expect_err("array");
        assert!(matches!(err, NormalizerError::MalformedPayload(_)));
        let err = decode_payload(&WebhookEnvelope::new(b"{".to_vec())).expect_err("truncated");
        assert_eq!(err.reason(), "malformed_payload");
    }
}
