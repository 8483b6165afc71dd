use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use payhook_core::{Decision, FailurePolicy, Gateway, GatewaySettings, Rejection, WebhookEnvelope};
use payhook_storage::NewDeliveryRecord;
use serde_json::json;
use tracing::{error, info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();

    let gateway: Gateway = gateway.parse().map_err(|err| {
        ProblemResponse::new(StatusCode::NOT_FOUND, "unknown_gateway", format!("{err}"))
    })?;
    let settings = state.gateway(gateway).ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "gateway_disabled",
            format!("no webhook secret configured for {gateway}"),
        )
        .for_gateway(gateway)
    })?;

    let settings = settings.clone();

    let envelope = envelope_from_request(gateway, &headers, body);
    let received_at = state.now();
    // Runs detached so a dropped connection cannot cancel a claimed delivery.
    let task = {
        let state = state.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let decision = state
                .processor()
                .process(&settings, &envelope, state.registry(), received_at)
                .await;
            record_metrics(gateway, &decision);
            append_delivery_log(&state, gateway, &decision, received_at).await;
            decision
        })
    };
    let decision = task.await.map_err(|err| {
        error!(stage = "ingress", %gateway, error = %err, "webhook processing task aborted");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "processing_aborted",
            "webhook processing did not complete; redeliver later",
        )
        .for_gateway(gateway)
    })?;

    let response = respond(&settings, &decision);

    histogram!("webhook_ack_latency_seconds", "gateway" => gateway.as_str())
        .record(start.elapsed().as_secs_f64());
    response
}

fn envelope_from_request(gateway: Gateway, headers: &HeaderMap, body: Bytes) -> WebhookEnvelope {
    let mut envelope = WebhookEnvelope::new(body.to_vec());
    if let Some(signature) = header_str(headers, gateway.signature_header()) {
        envelope = envelope.with_signature(signature);
    }
    if let Some(content_type) = header_str(headers, header::CONTENT_TYPE.as_str()) {
        envelope = envelope.with_content_type(content_type);
    }
    envelope
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn record_metrics(gateway: Gateway, decision: &Decision) {
    let gateway_label = gateway.as_str();
    counter!(
        "webhook_requests_total",
        "gateway" => gateway_label,
        "decision" => decision.label()
    )
    .increment(1);

    match decision {
        Decision::Rejected(Rejection::Signature(err)) => {
            counter!(
                "webhook_signature_failures_total",
                "gateway" => gateway_label,
                "reason" => err.reason()
            )
            .increment(1);
        }
        Decision::Rejected(_) => {}
        other => {
            counter!(
                "dispatch_outcomes_total",
                "gateway" => gateway_label,
                "outcome" => other.label()
            )
            .increment(1);
        }
    }
}

async fn append_delivery_log(
    state: &AppState,
    gateway: Gateway,
    decision: &Decision,
    received_at: chrono::DateTime<chrono::Utc>,
) {
    let detail = match decision {
        Decision::Rejected(rejection) => Some(rejection.to_string()),
        Decision::Failed { cause, .. } => Some(cause.to_string()),
        _ => None,
    };
    let record = NewDeliveryRecord::from_decision(gateway, decision, detail.as_deref(), received_at);
    if let Err(err) = state.storage().delivery_log().append(&record).await {
        error!(
            stage = "ingress",
            %gateway,
            decision = decision.label(),
            error = %err,
            "failed to append delivery log"
        );
    }
}

fn respond(settings: &GatewaySettings, decision: &Decision) -> Result<Response, ProblemResponse> {
    let gateway = settings.gateway;
    match decision {
        Decision::Rejected(rejection) => Err(ProblemResponse::from_rejection(gateway, rejection)),
        Decision::Failed { event, cause } => match settings.failure_policy {
            FailurePolicy::Acknowledge => {
                warn!(
                    stage = "dispatch",
                    %gateway,
                    dedup_key = %event.dedup_key(),
                    error = %cause,
                    "handler failed; acknowledging to stop redelivery"
                );
                Ok(acknowledge(decision))
            }
            FailurePolicy::Retry => Err(ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "handler_failed",
                "event handler failed; redeliver later",
            )
            .for_gateway(gateway)),
        },
        other => {
            if let Some(event) = other.event() {
                info!(
                    stage = "ingress",
                    %gateway,
                    decision = other.label(),
                    event_type = %event.event_type(),
                    dedup_key = %event.dedup_key(),
                    "webhook acknowledged"
                );
            }
            Ok(acknowledge(other))
        }
    }
}

fn acknowledge(decision: &Decision) -> Response {
    let dedup_key = decision.event().map(|event| event.dedup_key().as_str());
    (
        StatusCode::OK,
        Json(json!({
            "status": decision.label(),
            "dedup_key": dedup_key,
        })),
    )
        .into_response()
}
