use std::{
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use landing_core::lead::{email_domain, normalize_email, CaptureRejection, CaptureRequest};
use landing_storage::{ClientContext, LeadUpsert, NewAnalyticsEvent};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::problem::ProblemResponse;
use crate::rate_limit::RateDecision;
use crate::router::AppState;

pub const CAPTURE_ROUTE: &str = "email_capture";
pub const NEW_LEAD_MESSAGE: &str = "Thanks for subscribing! Check your inbox for what's next.";
pub const RETURNING_LEAD_MESSAGE: &str =
    "You're already on the list. Thanks for your continued interest!";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptureResponse {
    success: bool,
    is_new: bool,
    lead_id: String,
    subscription_count: u32,
    message: &'static str,
}

/// `POST /email-capture`
pub async fn handle(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let client = client_context(&headers, connect.map(|ConnectInfo(addr)| addr));
    let result = process(&state, &client, &body).await;

    let outcome = match &result {
        Ok(upsert) if upsert.is_new => "created",
        Ok(_) => "duplicate",
        Err(problem) if problem.status() == StatusCode::TOO_MANY_REQUESTS => "rate_limited",
        Err(problem) if problem.status().is_client_error() => "rejected",
        Err(_) => "error",
    };
    counter!("email_capture_requests_total", "outcome" => outcome).increment(1);
    histogram!("email_capture_latency_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());

    let upsert = result?;
    let (status, message) = if upsert.is_new {
        (StatusCode::CREATED, NEW_LEAD_MESSAGE)
    } else {
        (StatusCode::OK, RETURNING_LEAD_MESSAGE)
    };
    let body = CaptureResponse {
        success: true,
        is_new: upsert.is_new,
        lead_id: upsert.id,
        subscription_count: upsert.subscription_count,
        message,
    };
    Ok((status, Json(body)).into_response())
}

async fn process(
    state: &AppState,
    client: &ClientContext,
    body: &[u8],
) -> Result<LeadUpsert, ProblemResponse> {
    let ip = client.ip.as_deref().unwrap_or("unknown");
    match state.rate_limiter().check(CAPTURE_ROUTE, ip, state.now()) {
        RateDecision::Allowed { remaining } => {
            debug!(stage = "ratelimit", route = CAPTURE_ROUTE, %ip, remaining, "capture allowed");
        }
        RateDecision::Limited { retry_after_secs } => {
            counter!("rate_limited_total", "route" => CAPTURE_ROUTE).increment(1);
            warn!(stage = "ratelimit", route = CAPTURE_ROUTE, %ip, retry_after_secs, "capture rate limited");
            record_event(
                state,
                "rate_limited",
                None,
                json!({ "route": CAPTURE_ROUTE, "retryAfter": retry_after_secs }),
                client,
            )
            .await;
            return Err(ProblemResponse::rate_limited(retry_after_secs));
        }
    }

    let request: CaptureRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            record_event(
                state,
                "validation_error",
                None,
                json!({ "code": "invalid_json", "detail": err.to_string() }),
                client,
            )
            .await;
            return Err(ProblemResponse::bad_request(
                "invalid_json",
                "Request body must be a JSON object",
            ));
        }
    };

    let submitted_domain = request
        .email
        .as_deref()
        .and_then(normalize_email)
        .and_then(|email| email_domain(&email).map(str::to_string));
    let source = request.source.clone();
    let capture = match request.validate() {
        Ok(capture) => capture,
        Err(rejection) => {
            reject(state, client, &rejection, submitted_domain.as_deref(), source).await;
            return Err(ProblemResponse::bad_request(
                rejection.code(),
                rejection.to_string(),
            ));
        }
    };

    let upsert = match state
        .storage()
        .leads()
        .upsert(&capture, client, state.now())
        .await
    {
        Ok(upsert) => upsert,
        Err(err) => {
            error!(stage = "capture", domain = %capture.domain, error = %err, "failed to store lead");
            record_event(
                state,
                "capture_error",
                Some(&capture.domain),
                json!({ "source": capture.source, "error": err.to_string() }),
                client,
            )
            .await;
            return Err(ProblemResponse::internal());
        }
    };

    let event_type = if upsert.is_new {
        "email_captured"
    } else {
        "email_duplicate"
    };
    info!(
        stage = "capture",
        lead_id = %upsert.id,
        domain = %capture.domain,
        source = %capture.source,
        is_new = upsert.is_new,
        subscription_count = upsert.subscription_count,
        "lead captured"
    );
    record_event(
        state,
        event_type,
        Some(&capture.domain),
        json!({
            "leadId": upsert.id,
            "source": capture.source,
            "campaign": capture.campaign,
            "isNew": upsert.is_new,
            "subscriptionCount": upsert.subscription_count,
            "referrer": client.referrer,
        }),
        client,
    )
    .await;

    Ok(upsert)
}

async fn reject(
    state: &AppState,
    client: &ClientContext,
    rejection: &CaptureRejection,
    domain: Option<&str>,
    source: Option<String>,
) {
    let event_type = if rejection.is_blocked_domain() {
        "blocked_domain"
    } else {
        "validation_error"
    };
    info!(stage = "capture", code = rejection.code(), domain, "capture rejected");
    record_event(
        state,
        event_type,
        domain,
        json!({
            "code": rejection.code(),
            "message": rejection.to_string(),
            "source": source,
        }),
        client,
    )
    .await;
}

/// Persists an analytics event. Failures are logged and counted, never
/// surfaced to the caller.
pub(crate) async fn record_event(
    state: &AppState,
    event_type: &str,
    email_domain: Option<&str>,
    data: Value,
    client: &ClientContext,
) {
    let event = NewAnalyticsEvent {
        event_type,
        email_domain,
        data: &data,
        ip: client.ip.as_deref(),
        user_agent: client.user_agent.as_deref(),
        created_at: state.now(),
    };
    if let Err(err) = state.storage().analytics().insert(&event).await {
        counter!("analytics_write_failures_total").increment(1);
        warn!(stage = "storage", event_type, error = %err, "failed to record analytics event");
    }
}

/// Request provenance: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// the socket peer.
pub(crate) fn client_context(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientContext {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
    };
    let ip = forwarded
        .or_else(real_ip)
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string());

    ClientContext {
        ip,
        user_agent: header_string(headers, header::USER_AGENT.as_str()),
        referrer: header_string(headers, header::REFERER.as_str()),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
