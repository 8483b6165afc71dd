use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use payhook_core::{Gateway, Rejection};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<&'static str>,
}

/// `application/problem+json` error body.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                status: status.as_u16(),
                detail: detail.into(),
                gateway: None,
            },
        }
    }

    pub fn for_gateway(mut self, gateway: Gateway) -> Self {
        self.body.gateway = Some(gateway.as_str());
        self
    }

    /// Maps a rejected delivery to its problem. Store failures keep their
    /// cause out of the body.
    pub fn from_rejection(gateway: Gateway, rejection: &Rejection) -> Self {
        let status = StatusCode::from_u16(rejection.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match rejection {
            Rejection::Store(_) => "webhook could not be recorded; retry later".to_string(),
            other => other.to_string(),
        };
        Self::new(status, rejection.reason(), detail).for_gateway(gateway)
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
