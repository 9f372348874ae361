//! Request dispatch and the retry state machine
//!
//! Every non-admin request lands here. The body is buffered up front (so it
//! can be replayed on retries), then up to `max_retries + 1` attempts run:
//! pick a node, round-trip, classify the outcome, update the node's passive
//! score, and either stream the response back or move on to the next node.

pub mod retry;
pub mod transport;

use crate::balance::Node;
use crate::config::Config;
use crate::script::{ConfigView, RequestMeta, ResponseMeta};
use crate::{AppState, Error};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

const GATEWAY_NAME: &str = "ferrogate";

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

enum Attempt {
    Deliver(Response),
    Retry { reason: &'static str, err: Error },
    Fail { reason: &'static str, err: Error },
}

/// Data-plane entry point.
pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let cfg = state.balancer.config();
    let (parts, body) = req.into_parts();

    let body_bytes = match axum::body::to_bytes(body, cfg.gateway.max_body_size as usize).await {
        Ok(bytes) => bytes,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid body"),
    };

    let request_id = ensure_request_id(&parts.headers);
    let start = Instant::now();
    let max_retries = retry::effective_max_retries(&parts.method, &cfg.gateway);
    let total = max_retries + 1;
    let key = addr.to_string();

    let mut last_err: Option<Error> = None;
    let mut last_node_id = String::new();
    let mut last_reason = "error";
    for attempt in 1..=total {
        let Some(node) = state.balancer.select(&key) else {
            warn!(
                request_id = %request_id,
                method = %parts.method,
                path = %parts.uri.path(),
                "no upstream available"
            );
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "no upstream available");
        };
        last_node_id = node.id.clone();

        match proxy_attempt(&state, &cfg, &node, &parts, &body_bytes, &request_id, attempt, total)
            .await
        {
            Attempt::Deliver(resp) => {
                info!(
                    request_id = %request_id,
                    node_id = %node.id,
                    method = %parts.method,
                    path = %parts.uri.path(),
                    status = resp.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "request"
                );
                return resp;
            }
            Attempt::Retry { reason, err } => {
                last_reason = reason;
                last_err = Some(err);
            }
            Attempt::Fail { reason, err } => {
                last_reason = reason;
                last_err = Some(err);
                break;
            }
        }
    }

    warn!(
        request_id = %request_id,
        node_id = %last_node_id,
        method = %parts.method,
        path = %parts.uri.path(),
        err = %last_err.map(|e| e.to_string()).unwrap_or_default(),
        retry_reason = last_reason,
        "upstream error"
    );
    text_response(StatusCode::BAD_GATEWAY, "upstream error")
}

#[allow(clippy::too_many_arguments)]
async fn proxy_attempt(
    state: &AppState,
    cfg: &Config,
    node: &Arc<Node>,
    parts: &http::request::Parts,
    body: &Bytes,
    request_id: &str,
    attempt: u32,
    total: u32,
) -> Attempt {
    let can_retry = attempt < total;
    let retry_cfg = &cfg.gateway.retry;
    let url = upstream_url(&node.target, &parts.uri);
    let headers = forward_headers(&parts.headers, request_id);

    let mut builder = node.client.request(parts.method.clone(), url).headers(headers);
    if !body.is_empty() {
        builder = builder.body(body.clone());
    }

    state.balancer.adjust_conn(node, 1);
    let sent = tokio::time::timeout(cfg.gateway.response_header_timeout, builder.send()).await;
    let response = match sent {
        Err(elapsed) => {
            state.balancer.adjust_conn(node, -1);
            return failed_attempt(cfg, node, Error::from(elapsed), parts, request_id, attempt, total);
        }
        Ok(Err(e)) => {
            state.balancer.adjust_conn(node, -1);
            return failed_attempt(cfg, node, Error::from(e), parts, request_id, attempt, total);
        }
        Ok(Ok(resp)) => resp,
    };

    let status = response.status();
    if retry_cfg.enabled && retry_cfg.retry_on_5xx && can_retry && status.is_server_error() {
        state.balancer.adjust_conn(node, -1);
        drop(response);
        let err = Error::UpstreamStatus(status.as_u16());
        apply_error_score(cfg, node, &err);
        info!(
            request_id = %request_id,
            node_id = %node.id,
            attempt,
            total,
            reason = "5xx",
            "retrying upstream"
        );
        return Attempt::Retry { reason: "5xx", err };
    }

    deliver(state, cfg, node, parts, response, request_id, can_retry).await
}

fn failed_attempt(
    cfg: &Config,
    node: &Node,
    err: Error,
    parts: &http::request::Parts,
    request_id: &str,
    attempt: u32,
    total: u32,
) -> Attempt {
    apply_error_score(cfg, node, &err);
    let reason = retry::retry_reason(&err);
    let can_retry = attempt < total;
    if can_retry && retry::should_retry(&err, &cfg.gateway.retry) {
        warn!(
            request_id = %request_id,
            node_id = %node.id,
            method = %parts.method,
            path = %parts.uri.path(),
            err = %err,
            "upstream error"
        );
        info!(request_id = %request_id, node_id = %node.id, attempt, total, reason, "retrying upstream");
        Attempt::Retry { reason, err }
    } else {
        Attempt::Fail { reason, err }
    }
}

fn apply_error_score(cfg: &Config, node: &Node, err: &Error) {
    node.update_passive_score(retry::error_penalty(err), cfg.strategy.max_penalty_per_second);
    node.sync_weight(cfg.strategy.min_weight);
}

/// Forward the upstream response to the client.
///
/// A response small enough for the trigger is buffered and may still demand
/// a re-select; everything else is streamed through untouched, with the
/// node's inflight count released when the stream is dropped.
async fn deliver(
    state: &AppState,
    cfg: &Config,
    node: &Arc<Node>,
    parts: &http::request::Parts,
    response: reqwest::Response,
    request_id: &str,
    can_retry: bool,
) -> Attempt {
    let status = response.status();
    let resp_headers = response.headers().clone();

    let buffer_wanted = (!cfg.gateway.trigger_script.is_empty()
        || tracing::enabled!(tracing::Level::DEBUG))
        && !is_streaming_response(&resp_headers);
    let within_limit = response
        .content_length()
        .map_or(false, |len| len <= cfg.gateway.trigger_body_limit as u64);

    let body = if buffer_wanted && within_limit {
        let bytes = response.bytes().await.unwrap_or_default();
        state.balancer.adjust_conn(node, -1);
        if !bytes.is_empty() {
            debug!(request_id = %request_id, body = %String::from_utf8_lossy(&bytes), "upstream response body");
        }
        if !cfg.gateway.trigger_script.is_empty() && !bytes.is_empty() {
            let wants_retry = run_trigger(state, cfg, node, parts, status, &bytes, request_id).await;
            if wants_retry && cfg.gateway.retry.enabled && can_retry {
                info!(request_id = %request_id, node_id = %node.id, reason = "trigger", "retrying upstream");
                return Attempt::Retry {
                    reason: "trigger",
                    err: Error::UpstreamStatus(status.as_u16()),
                };
            }
        }
        Body::from(bytes)
    } else {
        let guard = InflightGuard { balancer: state.balancer.clone(), node: node.clone() };
        let stream = response.bytes_stream().map(move |chunk| {
            let _live = &guard;
            chunk
        });
        Body::from_stream(stream)
    };

    if status.is_server_error() {
        // only 500 and 501 count against the passive score
        if status == StatusCode::INTERNAL_SERVER_ERROR || status == StatusCode::NOT_IMPLEMENTED {
            node.update_passive_score(-5, cfg.strategy.max_penalty_per_second);
            node.sync_weight(cfg.strategy.min_weight);
        }
    } else {
        node.update_passive_score(5, cfg.strategy.max_penalty_per_second);
        node.sync_weight(cfg.strategy.min_weight);
    }

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp_headers.iter() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
    }
    match builder.body(body) {
        Ok(resp) => Attempt::Deliver(resp),
        Err(e) => Attempt::Fail { reason: "error", err: Error::internal(e.to_string()) },
    }
}

/// Run the trigger script against a buffered response. Returns whether the
/// trigger demanded a retry. Errors are logged and treated as "no action".
async fn run_trigger(
    state: &AppState,
    cfg: &Config,
    node: &Arc<Node>,
    parts: &http::request::Parts,
    status: StatusCode,
    body: &Bytes,
    request_id: &str,
) -> bool {
    let request = RequestMeta {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: header_map(&parts.headers),
    };
    let response = ResponseMeta {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    };
    let node_meta = node.meta();
    let view = ConfigView::from_config(cfg);

    let result = match state
        .script_host
        .run_trigger(
            Path::new(&cfg.gateway.trigger_script),
            &request,
            &response,
            &node_meta,
            cfg.gateway.trigger_timeout,
            &view,
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!(request_id = %request_id, node_id = %node.id, err = %err, "trigger error");
            return false;
        }
    };

    let max_pps = cfg.strategy.max_penalty_per_second;
    if let Some(score) = result.score {
        node.set_passive_score(score);
    }
    if let Some(penalty) = result.penalty {
        node.update_passive_score(-penalty, max_pps);
    }
    if let Some(reward) = result.reward {
        node.update_passive_score(reward, max_pps);
    }
    node.sync_weight(cfg.strategy.min_weight);
    if let Some(msg) = result.message.as_deref().filter(|m| !m.is_empty()) {
        info!(request_id = %request_id, node_id = %node.id, msg = %msg, "trigger applied");
    }
    result.retry.unwrap_or(false)
}

/// Releases a node's inflight slot when the response stream is dropped.
struct InflightGuard {
    balancer: Arc<crate::balance::Balancer>,
    node: Arc<Node>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.balancer.adjust_conn(&self.node, -1);
    }
}

fn upstream_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    url.set_path(&single_joining_slash(target.path(), uri.path()));
    url.set_query(uri.query());
    url
}

fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn forward_headers(inbound: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(GATEWAY_NAME));
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn is_streaming_response(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| {
            ct.contains("text/event-stream") || ct.contains("application/x-ndjson")
        })
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            out.entry(name.to_string()).or_insert_with(|| v.to_string());
        }
    }
    out
}

fn ensure_request_id(headers: &HeaderMap) -> String {
    if let Some(rid) = headers.get(&REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        if !rid.is_empty() {
            return rid.to_string();
        }
    }
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{GATEWAY_NAME}-{nanos}-{seq}")
}

fn text_response(status: StatusCode, msg: &str) -> Response {
    (status, format!("{msg}\n")).into_response()
}
