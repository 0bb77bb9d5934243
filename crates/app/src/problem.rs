use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProblemBody {
    success: bool,
    error: String,
    code: &'static str,
}

/// JSON error reply shared by every route: `{success:false, error, code}`.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemBody,
    retry_after: Option<u64>,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, code: &'static str, error: S) -> Self {
        Self {
            status,
            body: ProblemBody {
                success: false,
                error: error.into(),
                code,
            },
            retry_after: None,
        }
    }

    pub fn bad_request<S: Into<String>>(code: &'static str, error: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, error)
    }

    /// 429 carrying a `Retry-After` header in whole seconds.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after: Some(retry_after_secs),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests. Please try again later.",
            )
        }
    }

    /// Generic 500; details stay in the logs.
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "An internal error occurred. Please try again later.",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
