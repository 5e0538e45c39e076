//! HTTP control API handlers.

use crate::store::flats;
use crate::store::sessions;
use crate::store::IdentityError;
use crate::web::{session_flat, SharedState};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RequestAccessBody {
    #[serde(default)]
    flat_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetupStatusQuery {
    #[serde(default)]
    flat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetupPinBody {
    #[serde(default)]
    flat_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    pin4: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    #[serde(default)]
    flat_id: String,
    #[serde(default)]
    pin4: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    remember: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReportBody {
    #[serde(default, rename = "stationId")]
    station_id: String,
}

pub async fn root() -> Response {
    found("/login")
}

pub async fn login_page(State(state): State<Arc<SharedState>>) -> Response {
    serve_page(&state, "login.html").await
}

pub async fn setup_page(State(state): State<Arc<SharedState>>) -> Response {
    serve_page(&state, "setup.html").await
}

pub async fn app_page(State(state): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if session_flat(&state, &headers).await.is_none() {
        return found("/login");
    }
    serve_page(&state, "app.html").await
}

pub async fn health(State(state): State<Arc<SharedState>>) -> Response {
    let (stations, clients) = {
        let hub = state.hub.lock().unwrap();
        (hub.station_count(), hub.client_count())
    };
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime_seconds(),
        "stations": stations,
        "clients": clients,
    }))
    .into_response()
}

pub async fn request_access(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<RequestAccessBody>,
) -> Response {
    match flats::create_access_request(&state.db, &body.flat_id, &body.name).await {
        Ok(outcome) => Json(json!({
            "ok": true,
            "id": outcome.id,
            "status": outcome.status,
            "reused": outcome.reused,
        }))
        .into_response(),
        Err(err) => identity_failure(err, false),
    }
}

pub async fn setup_status(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<SetupStatusQuery>,
) -> Response {
    match flats::setup_status(&state.db, &query.flat_id).await {
        Ok((flat_id, status)) => Json(json!({
            "ok": true,
            "flat_id": flat_id,
            "request": status.request,
            "flat": status.flat,
        }))
        .into_response(),
        Err(err) => identity_failure(err, false),
    }
}

pub async fn setup_pin(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<SetupPinBody>,
) -> Response {
    match flats::setup_pin_with_code(
        &state.db,
        &body.flat_id,
        &body.code,
        &body.pin4,
        body.password.as_deref(),
    )
    .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => identity_failure(err, false),
    }
}

pub async fn login(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<LoginBody>,
) -> Response {
    let flat_id =
        match flats::login_flat(&state.db, &body.flat_id, &body.pin4, body.password.as_deref())
            .await
        {
            Ok(flat_id) => flat_id,
            Err(err) => return identity_failure(err, true),
        };

    let (sid, _expire) = match sessions::create_session(&state.db, &flat_id, body.remember).await {
        Ok(created) => created,
        Err(e) => {
            error!("session create failed: {}", e);
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL");
        }
    };

    let signed = sessions::sign_sid(&state.config.session_secret, &sid);
    let cookie = sessions::login_cookie(&signed, body.remember, state.config.production);
    let Ok(cookie_value) = HeaderValue::from_str(&cookie) else {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL");
    };

    info!("flat {} logged in", flat_id);
    let mut response = Json(json!({ "ok": true, "flat_id": flat_id })).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie_value);
    response
}

pub async fn logout(State(state): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Some(raw) = super::cookie_from_headers(&headers, sessions::COOKIE_NAME) {
        if let Some(sid) = sessions::verify_cookie_value(&state.config.session_secret, &raw) {
            if let Err(e) = sessions::destroy_session(&state.db, &sid).await {
                warn!("session destroy failed: {}", e);
            }
        }
    }

    let cookie = sessions::clear_cookie(state.config.production);
    let mut response = Json(json!({ "ok": true })).into_response();
    if let Ok(cookie_value) = HeaderValue::from_str(&cookie) {
        response
            .headers_mut()
            .insert(header::SET_COOKIE, cookie_value);
    }
    response
}

pub async fn live_stations(State(state): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    let Some(flat_id) = session_flat(&state, &headers).await else {
        return found("/login");
    };
    let stations = state.hub.lock().unwrap().public_stations();
    Json(json!({ "ok": true, "flat_id": flat_id, "stations": stations })).into_response()
}

pub async fn report_station(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(body): Json<ReportBody>,
) -> Response {
    let Some(flat_id) = session_flat(&state, &headers).await else {
        return api_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED");
    };
    if body.station_id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "MISSING_FIELDS");
    }
    // Accepted and logged only; strike accounting is not implemented.
    info!("flat {} reported station {}", flat_id, body.station_id);
    Json(json!({ "ok": true })).into_response()
}

pub async fn live_snapshot(State(state): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    let supplied = headers
        .get("X-Audix-Live-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !sessions::constant_time_eq(supplied.as_bytes(), state.config.live_token.as_bytes()) {
        return api_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED");
    }

    let hub = state.hub.lock().unwrap();
    Json(json!({
        "ok": true,
        "uptimeSeconds": state.uptime_seconds(),
        "totals": {
            "stations": hub.station_count(),
            "listeners": hub.listener_count(),
            "clients": hub.client_count(),
        },
        "stations": hub.station_details(),
        "clients": hub.client_details(),
    }))
    .into_response()
}

async fn serve_page(state: &SharedState, file: &str) -> Response {
    let path = state.config.web_root.join(file);
    match tokio::fs::read(&path).await {
        Ok(data) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            data,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "page not found").into_response(),
    }
}

fn found(location: &'static str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    response
        .headers_mut()
        .insert(header::LOCATION, HeaderValue::from_static(location));
    response
}

fn api_error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": code }))).into_response()
}

/// Map a store failure to its HTTP shape. Login failures are 401, other
/// client-caused failures 400, internal ones a generic 500.
fn identity_failure(err: IdentityError, login: bool) -> Response {
    if err.is_internal() {
        error!("identity store failure: {}", err);
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL");
    }
    let status = if login {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_REQUEST
    };
    if let IdentityError::Banned { until } = &err {
        return (
            status,
            Json(json!({
                "ok": false,
                "error": "BANNED",
                "ban_until": until.to_rfc3339(),
            })),
        )
            .into_response();
    }
    api_error(status, err.code())
}
