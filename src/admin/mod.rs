//! Admin surface
//!
//! Thin token-gated endpoints under a reserved prefix: a liveness probe, a
//! configuration reload from the original path, and a validity check over
//! every configured script path. The token is compared in constant time.

use crate::config::Config;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{error, info};

/// Reserved URL prefix for the admin surface
pub const ADMIN_PREFIX: &str = "/.ferrogate";

/// Shared-secret header checked on every admin request
pub const TOKEN_HEADER: &str = "x-ferrogate-token";

/// Admin routes; everything else falls through to the dispatcher.
pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/.ferrogate/health", get(liveness))
        .route("/.ferrogate/reload/config", post(reload_config))
        .route("/.ferrogate/reload/scripts", post(reload_scripts))
        .route("/.ferrogate/*rest", any(unknown))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Admin authentication middleware.
///
/// A disabled admin API hides the whole prefix (404). With the API enabled,
/// a missing configured token is a deployment error (403) and a mismatched
/// header is rejected (401).
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let cfg = state.balancer.config();
    if !cfg.gateway.admin_api_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    let token = &cfg.gateway.admin_api_token;
    if token.is_empty() {
        return (StatusCode::FORBIDDEN, "admin token required\n").into_response();
    }
    let presented = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response();
    }
    next.run(req).await
}

async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /.ferrogate/reload/config — re-parse the config file and swap the
/// snapshot. A changed node list is ignored with a warning inside
/// `apply_config`.
async fn reload_config(State(state): State<AppState>) -> Response {
    let result = Config::load(state.config_path.as_ref())
        .and_then(|cfg| state.balancer.apply_config(cfg));
    match result {
        Ok(()) => {
            info!("admin reload config ok");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Err(err) => {
            error!(err = %err, "admin reload config");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /.ferrogate/reload/scripts — stat every configured script path.
async fn reload_scripts(State(state): State<AppState>) -> Response {
    match validate_scripts(&state.balancer.config()) {
        Ok(()) => {
            info!("admin reload scripts ok");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Err(err) => {
            error!(err = %err, "admin reload scripts");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn unknown() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn validate_scripts(cfg: &Config) -> crate::Result<()> {
    let mut paths = Vec::new();
    if !cfg.gateway.health_check_default.script.is_empty() {
        paths.push(cfg.gateway.health_check_default.script.clone());
    }
    if !cfg.gateway.trigger_script.is_empty() {
        paths.push(cfg.gateway.trigger_script.clone());
    }
    for node in &cfg.nodes {
        if !node.check_script.is_empty() {
            paths.push(node.check_script.clone());
        }
    }
    for path in paths {
        std::fs::metadata(&path)
            .map_err(|e| crate::Error::script(format!("{path}: {e}")))?;
    }
    Ok(())
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"wrong"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }

    #[test]
    fn test_validate_scripts_missing_path() {
        let toml = r#"
[gateway]
trigger_script = "/nonexistent/ferrogate-trigger.sh"
"#;
        let cfg = Config::from_toml(toml).unwrap();
        assert!(validate_scripts(&cfg).is_err());
    }

    #[test]
    fn test_validate_scripts_empty_ok() {
        let cfg = Config::from_toml("").unwrap();
        assert!(validate_scripts(&cfg).is_ok());
    }
}
