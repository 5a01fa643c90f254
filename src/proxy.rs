//! The governed reverse proxy: tracing wrapper, rate-limiting gate,
//! loop-detection gate, and the single-origin forwarder with its response
//! reconciler and transport error handler.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use reqwest::Url;
use serde_json::{json, Value};

use crate::loopdetect::LoopDetector;
use crate::pricing::{calculate_cost, PricingTable};
use crate::providers::Provider;
use crate::reconcile::{
    is_streaming_content_type, Reservation, Settlement, StreamingReconciler,
};
use crate::runner::BoundedRunner;
use crate::spend::{GovernanceSnapshot, LimitDecision, SpendAccountant};
use crate::tokens;
use crate::{Result, SentinelError};

pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-ID";
pub const DEFAULT_INTERVENTION_HINT: &str =
    "System: break the loop and respond with a new approach.";

#[derive(Clone)]
pub struct ProxyState {
    provider: Arc<dyn Provider>,
    accountant: Option<Arc<SpendAccountant>>,
    detector: Option<Arc<dyn LoopDetector>>,
    runner: BoundedRunner,
    client: reqwest::Client,
    tenant_header: HeaderName,
    intervention_hint: String,
}

impl ProxyState {
    pub fn new(provider: Arc<dyn Provider>, runner: BoundedRunner) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            provider,
            accountant: None,
            detector: None,
            runner,
            client,
            tenant_header: HeaderName::from_static("x-tenant-id"),
            intervention_hint: DEFAULT_INTERVENTION_HINT.to_string(),
        })
    }

    pub fn with_accountant(mut self, accountant: Arc<SpendAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn LoopDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_tenant_header(mut self, name: &str) -> Result<Self> {
        self.tenant_header = name
            .parse::<HeaderName>()
            .map_err(|_| SentinelError::Config(format!("invalid tenant header name: {name}")))?;
        Ok(self)
    }

    pub fn with_intervention_hint(mut self, hint: impl Into<String>) -> Self {
        self.intervention_hint = hint.into();
        self
    }

    /// Accountant access for diagnostics (governance counters, spend
    /// lookups). `None` when governance is disabled.
    pub fn accountant(&self) -> Option<&Arc<SpendAccountant>> {
        self.accountant.as_ref()
    }
}

/// Middleware stack, outer to inner: tracing, rate limiting, loop
/// detection, then the forwarder. The `/sentinel/metrics` diagnostics
/// route is the one path that never reaches the origin.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/sentinel/metrics", get(metrics))
        .fallback(forward)
        .layer(middleware::from_fn_with_state(state.clone(), loop_detection))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limiting))
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

async fn metrics(State(state): State<ProxyState>) -> Json<GovernanceSnapshot> {
    let snapshot = state
        .accountant
        .as_ref()
        .map(|accountant| accountant.snapshot())
        .unwrap_or_default();
    Json(snapshot)
}

async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "proxied request"
    );
    response
}

/// Rate-limiting gate: estimates the request's cost and atomically reserves
/// it before forwarding. Client input issues pass through ungoverned;
/// accountant issues fail open inside the accountant itself.
async fn rate_limiting(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(accountant) = state.accountant.clone() else {
        return next.run(req).await;
    };
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let Some(tenant) = header_value(req.headers(), &state.tenant_header) else {
        tracing::debug!(path = req.uri().path(), "no tenant id, skipping spend check");
        return next.run(req).await;
    };

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, tenant_id = %tenant, "failed to buffer request body");
            return next.run(Request::from_parts(parts, Body::empty())).await;
        }
    };

    let mut model = state.provider.extract_model_from_path(parts.uri.path());
    let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();
    if model.is_empty() {
        if let Some(body_model) = parsed
            .as_ref()
            .and_then(|value| value.get("model"))
            .and_then(Value::as_str)
        {
            model = body_model.to_string();
        }
    }

    let request_text = parsed
        .as_ref()
        .map(|value| state.provider.extract_full_text(value))
        .unwrap_or_default();
    if request_text.is_empty() {
        tracing::debug!(tenant_id = %tenant, model, "no text content for token estimation");
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    let input_tokens = tokens::count_tokens(&request_text, &model);
    let (pricing, known_model) = PricingTable::builtin().resolve(state.provider.name(), &model);
    if !known_model {
        tracing::debug!(
            model,
            provider = state.provider.name(),
            "using default pricing for unknown model"
        );
    }
    let max_output = parsed
        .as_ref()
        .map(tokens::extract_max_output_tokens)
        .unwrap_or(0);
    let output_tokens = tokens::estimate_output_tokens(input_tokens, max_output);
    let estimated_cost = calculate_cost(input_tokens, output_tokens, pricing);

    let decision = accountant.check_and_reserve(&tenant, estimated_cost).await;
    let rate_headers = rate_limit_headers(&decision);

    if !decision.allowed {
        tracing::warn!(
            tenant_id = %tenant,
            current_spend = decision.current_spend,
            limit = decision.limit,
            estimated_cost,
            "rate limit exceeded"
        );
        return deny_response(&decision, &rate_headers);
    }

    tracing::debug!(
        tenant_id = %tenant,
        estimated_cost,
        current_spend = decision.current_spend,
        remaining = decision.remaining,
        "spend check passed"
    );

    parts.extensions.insert(Reservation {
        tenant,
        estimate: estimated_cost,
        pricing,
        model,
        started_at: Instant::now(),
    });
    let mut response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    apply_headers(response.headers_mut(), &rate_headers);
    response
}

/// Loop-detection gate: consults the sidecar and, on a positive verdict,
/// rewrites the outbound body with the intervention hint. Every failure
/// path forwards the request untouched.
async fn loop_detection(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(detector) = state.detector.clone() else {
        return next.run(req).await;
    };
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let Some(tenant) = header_value(req.headers(), &state.tenant_header) else {
        return next.run(req).await;
    };

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, tenant_id = %tenant, "loop detect: failed to read body");
            return next.run(Request::from_parts(parts, Body::empty())).await;
        }
    };

    let Ok(mut data) = serde_json::from_slice::<Value>(&bytes) else {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    };
    let prompt = state.provider.extract_full_text(&data);
    if prompt.is_empty() {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    let check = match detector.check_loop(&tenant, &prompt).await {
        Ok(check) => check,
        Err(err) => {
            tracing::warn!(error = %err, tenant_id = %tenant, "loop check failed (fail-open)");
            return next.run(Request::from_parts(parts, Body::from(bytes))).await;
        }
    };
    if !check.loop_detected {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    tracing::info!(
        tenant_id = %tenant,
        max_similarity = check.max_similarity,
        similar_prompt = %check.similar_prompt,
        "loop detected"
    );

    if state.provider.inject_hint(&mut data, &state.intervention_hint) {
        match serde_json::to_vec(&data) {
            Ok(updated) => {
                if let Ok(length) = HeaderValue::try_from(updated.len().to_string()) {
                    parts.headers.insert(header::CONTENT_LENGTH, length);
                }
                return next.run(Request::from_parts(parts, Body::from(updated))).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to re-serialize hinted body");
            }
        }
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Forwards to the configured origin and hands the response to the
/// reconciler. The only 5xx minted here is 502 for upstream transport
/// failure; upstream application errors pass through verbatim.
async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let reservation = parts.extensions.get::<Reservation>().cloned();

    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "failed to read request body for upstream");
            return transport_failure(&state, reservation);
        }
    };

    let mut url = match upstream_url(state.provider.base_url(), parts.uri.path(), parts.uri.query())
    {
        Ok(url) => url,
        Err(err) => {
            tracing::error!(error = %err, "failed to build upstream url");
            return transport_failure(&state, reservation);
        }
    };

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    state.provider.prepare_request(&mut url, &mut headers);

    let upstream = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(error = %err, "upstream transport failure");
            return transport_failure(&state, reservation);
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let settlement = reservation
        .filter(|reservation| reservation.estimate > 0.0)
        .and_then(|reservation| {
            state.accountant.clone().map(|accountant| Settlement {
                reservation,
                provider: state.provider.clone(),
                accountant,
                runner: state.runner.clone(),
            })
        });

    if is_streaming_content_type(&response_headers) {
        let stream = upstream.bytes_stream().boxed();
        let body = match settlement {
            Some(settlement) => Body::from_stream(StreamingReconciler::new(stream, settlement)),
            None => Body::from_stream(stream),
        };
        return response_from(status, response_headers, body);
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "upstream body read failure");
            if let Some(settlement) = settlement {
                settlement.refund();
            }
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    if let Some(settlement) = settlement {
        settlement.settle_buffered(status, &bytes);
    }
    response_from(status, response_headers, Body::from(bytes))
}

fn transport_failure(state: &ProxyState, reservation: Option<Reservation>) -> Response {
    if let (Some(reservation), Some(accountant)) = (reservation, state.accountant.clone()) {
        Settlement {
            reservation,
            provider: state.provider.clone(),
            accountant,
            runner: state.runner.clone(),
        }
        .refund();
    }
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Result<Url> {
    let mut url = base
        .join(path)
        .map_err(|err| SentinelError::Config(format!("upstream url: {err}")))?;
    url.set_query(query);
    Ok(url)
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in connection_named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn rate_limit_headers(decision: &LimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::try_from(format!("{:.2}", decision.limit)) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }
    if let Ok(value) = HeaderValue::try_from(format!("{:.2}", decision.remaining)) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }
    let reset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs() + 3600)
        .unwrap_or(3600);
    if let Ok(value) = HeaderValue::try_from(reset.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }
    headers
}

fn apply_headers(target: &mut HeaderMap, source: &HeaderMap) {
    for (name, value) in source {
        target.insert(name.clone(), value.clone());
    }
}

fn deny_response(decision: &LimitDecision, rate_headers: &HeaderMap) -> Response {
    let body = json!({
        "error": {
            "message": "Rate limit exceeded. Hourly spend limit reached.",
            "type": "rate_limit_error",
            "code": "rate_limit_exceeded"
        },
        "current_spend": decision.current_spend,
        "limit": decision.limit,
        "remaining": decision.remaining
    });
    let mut response = response_from(
        StatusCode::TOO_MANY_REQUESTS,
        HeaderMap::new(),
        Body::from(body.to_string()),
    );
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static("3600"));
    apply_headers(headers, rate_headers);
    response
}

fn response_from(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_keeps_path_and_query() {
        let base = Url::parse("https://generativelanguage.googleapis.com").expect("base");
        let url = upstream_url(
            &base,
            "/v1beta/models/gemini-2.5-flash:generateContent",
            Some("alt=sse"),
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?alt=sse"
        );
    }

    #[test]
    fn strips_hop_by_hop_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-drop-me"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-keep-me", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("x-drop-me").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-keep-me").is_some());
    }

    #[test]
    fn rate_limit_headers_format_two_decimals_and_reset_window() {
        let decision = LimitDecision {
            allowed: true,
            current_spend: 1.2345,
            limit: 100.0,
            remaining: 98.7655,
        };
        let headers = rate_limit_headers(&decision);
        assert_eq!(
            headers
                .get("x-ratelimit-limit")
                .and_then(|value| value.to_str().ok()),
            Some("100.00")
        );
        assert_eq!(
            headers
                .get("x-ratelimit-remaining")
                .and_then(|value| value.to_str().ok()),
            Some("98.77")
        );

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("now")
            .as_secs();
        let reset: u64 = headers
            .get("x-ratelimit-reset")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .expect("reset");
        assert!(reset >= now + 3599 && reset <= now + 3601);
    }

    #[test]
    fn deny_response_carries_contract_body_and_headers() {
        let decision = LimitDecision {
            allowed: false,
            current_spend: 0.002,
            limit: 0.001,
            remaining: 0.0,
        };
        let response = deny_response(&decision, &rate_limit_headers(&decision));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("3600")
        );
        assert!(response.headers().get("x-ratelimit-limit").is_some());
    }
}
