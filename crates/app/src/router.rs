use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, warn};

use landing_storage::Database;
use landing_util::AppConfig;

use crate::capture::{self, client_context, record_event};
use crate::problem::ProblemResponse;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::telemetry;

const STATS_ROUTE: &str = "stats";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    rate_limiter: Arc<RateLimiter>,
    cors_origins: Arc<[String]>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, config: &AppConfig) -> Self {
        Self {
            metrics,
            storage,
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            cors_origins: config.cors_origins.clone().into(),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    Router::new()
        .route("/email-capture", post(capture::handle))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(cors)
        .with_state(state)
}

/// Only the site's own origins may call the API from a browser.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(stage = "app", %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::RETRY_AFTER])
        .max_age(Duration::from_secs(86_400))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "status": "healthy",
        "timestamp": state.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "version": SERVICE_VERSION,
    }))
}

async fn stats(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ProblemResponse> {
    let client = client_context(&headers, connect.map(|ConnectInfo(addr)| addr));
    let ip = client.ip.as_deref().unwrap_or("unknown");
    if let RateDecision::Limited { retry_after_secs } =
        state.rate_limiter().check(STATS_ROUTE, ip, state.now())
    {
        counter!("rate_limited_total", "route" => STATS_ROUTE).increment(1);
        record_event(
            &state,
            "rate_limited",
            None,
            json!({ "route": STATS_ROUTE, "retryAfter": retry_after_secs }),
            &client,
        )
        .await;
        return Err(ProblemResponse::rate_limited(retry_after_secs));
    }

    let stats = state.storage().leads().stats().await.map_err(|err| {
        error!(stage = "storage", error = %err, "failed to load lead stats");
        ProblemResponse::internal()
    })?;

    Ok(Json(json!({
        "success": true,
        "stats": {
            "totalLeads": stats.total_leads,
            "activeLeads": stats.active_leads,
            "timestamp": state.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    })))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use landing_util::{Environment, RateLimitConfig};
    use serde_json::Value;
    use tower::ServiceExt;

    fn config() -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            environment: Environment::Test,
            database_url: "sqlite::memory:".into(),
            site_domain: "example.com".into(),
            cors_origins: landing_util::site_origins("example.com"),
            rate_limit: RateLimitConfig {
                max_requests: 10,
                window: Duration::from_secs(60),
            },
        }
    }

    async fn setup_state() -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let fixed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        AppState::new(metrics, database, &config()).with_clock(Arc::new(move || fixed))
    }

    fn capture_request(body: &str, ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/email-capture")
            .header("content-type", "application/json")
            .header("x-forwarded-for", ip)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        serde_json::from_slice(&collected.to_bytes()).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_version() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["timestamp"], "2024-03-01T12:00:00.000Z");
        assert_eq!(body["version"], SERVICE_VERSION);
    }

    #[tokio::test]
    async fn repeat_capture_is_deduplicated_by_normalized_email() {
        let state = setup_state().await;
        let app = app_router(state.clone());

        let first = app
            .clone()
            .oneshot(capture_request(
                r#"{"email":"Jane.Doe+news@gmail.com","source":"hero"}"#,
                "198.51.100.1",
            ))
            .await
            .expect("first");
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = json_body(first).await;
        assert_eq!(first["success"], true);
        assert_eq!(first["isNew"], true);
        assert_eq!(first["subscriptionCount"], 1);

        let second = app
            .oneshot(capture_request(
                r#"{"email":"janedoe@googlemail.com"}"#,
                "198.51.100.1",
            ))
            .await
            .expect("second");
        assert_eq!(second.status(), StatusCode::OK);
        let second = json_body(second).await;
        assert_eq!(second["isNew"], false);
        assert_eq!(second["subscriptionCount"], 2);
        assert_eq!(second["leadId"], first["leadId"]);

        let analytics = state.storage().analytics();
        assert_eq!(analytics.count(Some("email_captured")).await.expect("count"), 1);
        assert_eq!(analytics.count(Some("email_duplicate")).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn missing_email_is_rejected_with_field_message() {
        let state = setup_state().await;
        let app = app_router(state.clone());

        let response = app
            .oneshot(capture_request(r#"{"source":"footer"}"#, "198.51.100.2"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "missing_email");
        assert!(body["error"]
            .as_str()
            .expect("error text")
            .to_lowercase()
            .contains("email"));
        assert_eq!(
            state
                .storage()
                .analytics()
                .count(Some("validation_error"))
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn disposable_domains_are_blocked() {
        let state = setup_state().await;
        let app = app_router(state.clone());

        let response = app
            .oneshot(capture_request(
                r#"{"email":"someone@mailinator.com"}"#,
                "198.51.100.3",
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "blocked_domain");
        assert_eq!(
            state
                .storage()
                .analytics()
                .count(Some("blocked_domain"))
                .await
                .expect("count"),
            1
        );
        assert_eq!(
            state.storage().leads().stats().await.expect("stats").total_leads,
            0
        );
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(capture_request("{not json", "198.51.100.4"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_json");
    }

    #[tokio::test]
    async fn eleventh_capture_in_a_minute_is_rate_limited() {
        let app = app_router(setup_state().await);

        for i in 0..10 {
            let response = app
                .clone()
                .oneshot(capture_request(
                    &format!(r#"{{"email":"reader{i}@example.org"}}"#),
                    "203.0.113.50",
                ))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::CREATED, "request {i}");
        }

        let response = app
            .clone()
            .oneshot(capture_request(
                r#"{"email":"late@example.org"}"#,
                "203.0.113.50",
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("60")
        );
        assert_eq!(json_body(response).await["code"], "rate_limited");

        let other_client = app
            .oneshot(capture_request(
                r#"{"email":"other@example.org"}"#,
                "203.0.113.51",
            ))
            .await
            .expect("response");
        assert_eq!(other_client.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn analytics_failures_do_not_fail_captures() {
        let state = setup_state().await;
        sqlx::query("DROP TABLE analytics_events")
            .execute(state.storage().pool())
            .await
            .expect("drop analytics table");
        let app = app_router(state);

        let response = app
            .oneshot(capture_request(r#"{"email":"ok@example.org"}"#, "198.51.100.9"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn storage_failures_return_generic_500() {
        let state = setup_state().await;
        sqlx::query("DROP TABLE leads")
            .execute(state.storage().pool())
            .await
            .expect("drop leads table");
        let app = app_router(state);

        let response = app
            .oneshot(capture_request(r#"{"email":"ok@example.org"}"#, "198.51.100.10"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "internal_error");
        assert!(!body["error"].as_str().expect("text").contains("leads"));
    }

    #[tokio::test]
    async fn stats_counts_leads() {
        let state = setup_state().await;
        let app = app_router(state.clone());
        app.clone()
            .oneshot(capture_request(r#"{"email":"a@example.org"}"#, "198.51.100.11"))
            .await
            .expect("capture");
        state
            .storage()
            .leads()
            .unsubscribe("a@example.org", state.now())
            .await
            .expect("unsubscribe");
        app.clone()
            .oneshot(capture_request(r#"{"email":"b@example.org"}"#, "198.51.100.11"))
            .await
            .expect("capture");

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .expect("stats");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["stats"]["totalLeads"], 2);
        assert_eq!(body["stats"]["activeLeads"], 1);
    }

    #[tokio::test]
    async fn cors_allows_only_site_origins() {
        let app = app_router(setup_state().await);

        let preflight = |origin: &'static str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/email-capture")
                .header("origin", origin)
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap()
        };

        let allowed = app
            .clone()
            .oneshot(preflight("https://staging.example.com"))
            .await
            .expect("preflight");
        assert_eq!(
            allowed
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|value| value.to_str().ok()),
            Some("https://staging.example.com")
        );

        let denied = app
            .oneshot(preflight("https://evil.example.net"))
            .await
            .expect("preflight");
        assert!(denied
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn metrics_exports_capture_counters() {
        let app = app_router(setup_state().await);
        app.clone()
            .oneshot(capture_request(r#"{"email":"m@example.org"}"#, "198.51.100.12"))
            .await
            .expect("capture");

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("email_capture_requests_total"));
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }
}
