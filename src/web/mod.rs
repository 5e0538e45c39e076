//! HTTP surface: shared state, router assembly, auth helpers.

pub mod routes;

use crate::config::Config;
use crate::registry::{FlatId, Hub};
use crate::store::sessions;
use crate::ws::signal::SignalRegistry;
use crate::ws::{presence, signal};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use log::warn;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_http::services::ServeDir;

/// Sent on every HTTP response. Pages only talk to this origin.
const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'; \
     script-src 'self'; connect-src 'self'; img-src 'self' data:;";

/// Shared state for the whole server.
///
/// The two mutexes are the concurrency design: one lock for the presence
/// plane, one for the signal plane. Neither is held across an await.
pub struct SharedState {
    pub config: Arc<Config>,
    pub db: PgPool,
    pub hub: Mutex<Hub>,
    pub signals: Mutex<SignalRegistry>,
    pub start_time: Instant,
}

impl SharedState {
    pub fn new(config: Config, db: PgPool) -> Self {
        Self {
            config: Arc::new(config),
            db,
            hub: Mutex::new(Hub::new()),
            signals: Mutex::new(SignalRegistry::new()),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Build the full router: control API, static pages, both WS upgrades.
pub fn build_router(state: Arc<SharedState>) -> Router {
    let web_root = state.config.web_root.clone();

    Router::new()
        .route("/", get(routes::root))
        .route("/login", get(routes::login_page))
        .route("/setup", get(routes::setup_page))
        .route("/app", get(routes::app_page))
        .route("/health", get(routes::health))
        .route("/api/request-access", post(routes::request_access))
        .route("/api/setup-status", get(routes::setup_status))
        .route("/api/setup-pin", post(routes::setup_pin))
        .route("/api/login", post(routes::login))
        .route("/api/logout", post(routes::logout))
        .route("/api/live", get(routes::live_stations))
        .route("/api/report", post(routes::report_station))
        .route("/api/internal/live-snapshot", get(routes::live_snapshot))
        .route("/ws/presence", get(presence::presence_upgrade))
        .route("/ws/signal", get(signal::signal_upgrade))
        .fallback_service(ServeDir::new(web_root))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    response
}

/// Resolve the request's session to a flat id, or `None`.
///
/// Requires a cookie with a valid signature and a live, unexpired session
/// row. Store failures count as "no session" rather than surfacing.
pub async fn session_flat(state: &SharedState, headers: &HeaderMap) -> Option<FlatId> {
    let raw = cookie_from_headers(headers, sessions::COOKIE_NAME)?;
    let sid = sessions::verify_cookie_value(&state.config.session_secret, &raw)?;
    match sessions::session_flat_id(&state.db, &sid).await {
        Ok(flat) => flat,
        Err(e) => {
            warn!("session lookup failed: {}", e);
            None
        }
    }
}

/// Extract a cookie value from the request headers.
pub fn cookie_from_headers(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, val)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_extraction_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; audix_user_sid=abc.def; theme=dark"),
        );
        assert_eq!(
            cookie_from_headers(&headers, "audix_user_sid").as_deref(),
            Some("abc.def")
        );
        assert!(cookie_from_headers(&headers, "missing").is_none());
    }

    #[test]
    fn cookie_extraction_without_header() {
        let headers = HeaderMap::new();
        assert!(cookie_from_headers(&headers, "audix_user_sid").is_none());
    }
}
