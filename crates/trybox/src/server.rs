// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP and WebSocket surface.
//!
//! All endpoints live under `/1.0`. Admission denials on `/1.0/start` are
//! reported as HTTP 200 with a `status` code in the body; HTTP errors are
//! reserved for malformed requests and lookup failures. Handlers take one
//! configuration snapshot up front and use it for the whole request.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use ipnetwork::IpNetwork;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::admission;
use crate::config::ConfigHandle;
use crate::console;
use crate::db::{NewFeedback, SessionDb, StatsPeriod};
use crate::expiry::ExpiryScheduler;
use crate::provision::Provisioner;
use crate::runtime::{ContainerRuntime, ExecRequest};

/// Wire status: session started.
const STATUS_STARTED: i64 = 0;
/// Wire status: provisioning failed for an unclassified reason.
const STATUS_UNKNOWN_ERROR: i64 = 5;

/// Server is accepting sessions.
const SERVER_OPERATIONAL: i64 = 0;
/// Server is in maintenance or cannot reach its store.
const SERVER_MAINTENANCE: i64 = 1;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub db: SessionDb,
    /// Container backend.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Hot-reloadable configuration.
    pub config: Arc<ConfigHandle>,
    /// Expiry timers.
    pub scheduler: Arc<ExpiryScheduler>,
    /// Instance provisioning.
    pub provisioner: Arc<Provisioner>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/1.0", get(server_status))
        .route("/1.0/console", get(console_handler))
        .route("/1.0/feedback", get(feedback_get).post(feedback_post))
        .route("/1.0/info", get(session_info))
        .route("/1.0/start", get(session_start))
        .route("/1.0/statistics", get(statistics))
        .route("/1.0/terms", get(terms))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Requester address and protocol family.
///
/// Trusts `X-Forwarded-For` when present, falling back to the socket peer.
/// Unresolvable requesters extract as `None`.
struct ClientIp(Option<(String, &'static str)>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let Some(address) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| peer.map(|p| p.ip().to_string()))
        else {
            return Ok(ClientIp(None));
        };

        let Ok(ip) = address.parse::<IpAddr>() else {
            return Ok(ClientIp(None));
        };

        let protocol = if ip.is_ipv4() { "IPv4" } else { "IPv6" };
        Ok(ClientIp(Some((address, protocol))))
    }
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn not_found(message: &'static str) -> Response {
    (StatusCode::NOT_FOUND, message).into_response()
}

fn start_status(code: i64) -> Response {
    Json(json!({ "status": code })).into_response()
}

/// `GET /1.0`: server health and capacity.
async fn server_status(State(state): State<AppState>, client: ClientIp) -> Response {
    let config = state.config.snapshot();

    let Some((address, protocol)) = client.0 else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
    };

    let mut failure = false;

    let containers_count = match state.db.count_active().await {
        Ok(count) => count,
        Err(_) => {
            failure = true;
            0
        }
    };

    let mut containers_next = 0;
    if config.server_containers_max > 0 && containers_count >= config.server_containers_max {
        match state.db.next_expiry().await {
            Ok(next) => containers_next = next.unwrap_or(0),
            Err(_) => failure = true,
        }
    }

    let server_status = if config.server_maintenance || failure {
        SERVER_MAINTENANCE
    } else {
        SERVER_OPERATIONAL
    };

    Json(json!({
        "client_address": address,
        "client_protocol": protocol,
        "feedback": config.feedback,
        "server_console_only": config.server_console_only,
        "server_ipv6_only": config.server_ipv6_only,
        "server_status": server_status,
        "containers_count": containers_count,
        "containers_max": config.server_containers_max,
        "containers_next": containers_next,
    }))
    .into_response()
}

/// `GET /1.0/terms`: current terms text and fingerprint.
async fn terms(State(state): State<AppState>) -> Response {
    let config = state.config.snapshot();
    Json(json!({
        "hash": config.server_terms_hash,
        "terms": config.server_terms,
    }))
    .into_response()
}

/// `GET /1.0/start`: request a new session.
async fn session_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    client: ClientIp,
) -> Response {
    let config = state.config.snapshot();

    let Some((request_ip, _)) = client.0 else {
        return start_status(STATUS_UNKNOWN_ERROR);
    };

    let Some(terms) = params.get("terms").filter(|t| !t.is_empty()) else {
        return bad_request("Missing terms hash");
    };

    if let Err(denial) = admission::check(&state.db, &config, &request_ip, terms).await {
        return start_status(denial.status_code());
    }

    let session = match state.provisioner.provision(&config, &request_ip).await {
        Ok(session) => session,
        Err(e) => {
            error!(ip = %request_ip, error = %e, "Provisioning failed");
            return start_status(STATUS_UNKNOWN_ERROR);
        }
    };

    let mut body = json!({
        "id": session.token,
        "expiry": session.expiry,
        "status": STATUS_STARTED,
    });
    if !config.server_console_only {
        body["ip"] = json!(session.address);
        body["username"] = json!(session.username);
        body["password"] = json!(session.password);
        body["fqdn"] = json!(format!("{}.lxd", session.instance_name));
    }

    Json(body).into_response()
}

/// `GET /1.0/info`: details of an active session.
async fn session_info(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let config = state.config.snapshot();

    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return bad_request("Missing session id");
    };

    let session = match state.db.get_by_token(id, true).await {
        Ok(Some(session)) => session,
        _ => return not_found("Session not found"),
    };

    let mut body = json!({
        "id": session.uuid,
        "expiry": session.instance_expiry,
        "status": STATUS_STARTED,
    });
    if !config.server_console_only {
        body["ip"] = json!(session.instance_ip);
        body["username"] = json!(session.instance_username);
        body["password"] = json!(session.instance_password);
        body["fqdn"] = json!(format!("{}.lxd", session.instance_name));
    }

    Json(body).into_response()
}

/// `GET /1.0/console`: attach a WebSocket terminal to an active session.
async fn console_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = state.config.snapshot();

    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return bad_request("Missing session id");
    };

    let session = match state.db.get_by_token(id, true).await {
        Ok(Some(session)) => session,
        _ => return not_found("Session not found"),
    };

    let width = match params.get("width").filter(|w| !w.is_empty()) {
        None => 150,
        Some(width) => match width.parse::<u16>() {
            Ok(width) => width,
            Err(_) => return bad_request("Invalid width value"),
        },
    };
    let height = match params.get("height").filter(|h| !h.is_empty()) {
        None => 20,
        Some(height) => match height.parse::<u16>() {
            Ok(height) => height,
            Err(_) => return bad_request("Invalid height value"),
        },
    };

    let request = ExecRequest {
        command: config.command.clone(),
        env: HashMap::from([
            ("USER".to_string(), "root".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("TERM".to_string(), "xterm".to_string()),
        ]),
        width,
        height,
    };

    let exec = match state.runtime.exec(&session.instance_name, &request).await {
        Ok(exec) => exec,
        Err(e) => {
            error!(instance = %session.instance_name, error = %e, "Console exec failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    ws.on_upgrade(move |socket| console::run_console(socket, exec, width, height))
}

/// `GET /1.0/feedback`: stored feedback for a session.
async fn feedback_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let config = state.config.snapshot();
    if !config.feedback {
        return bad_request("Feedback reporting is disabled");
    }

    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return bad_request("Missing session id");
    };

    let session = match state.db.get_by_token(id, false).await {
        Ok(Some(session)) => session,
        _ => return not_found("Session not found"),
    };

    match state.db.get_feedback(session.id).await {
        Ok(Some(feedback)) => Json(feedback).into_response(),
        Ok(None) => not_found("No existing feedback"),
        Err(e) => {
            error!(session = session.id, error = %e, "Unable to read feedback");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// `POST /1.0/feedback`: record feedback for a session.
///
/// Accepted until the feedback grace window past the session expiry closes.
async fn feedback_post(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Result<Json<NewFeedback>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let config = state.config.snapshot();
    if !config.feedback {
        return bad_request("Feedback reporting is disabled");
    }

    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return bad_request("Missing session id");
    };

    let session = match state.db.get_by_token(id, false).await {
        Ok(Some(session)) => session,
        _ => return not_found("Session not found"),
    };

    let deadline = session.instance_expiry + config.feedback_timeout * 60;
    if chrono::Utc::now().timestamp() > deadline {
        return bad_request("Feedback timeout has been reached");
    }

    let Ok(Json(feedback)) = body else {
        return bad_request("Invalid JSON data");
    };

    match state.db.record_feedback(session.id, &feedback).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(session = session.id, error = %e, "Unable to record feedback");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to record feedback data",
            )
                .into_response()
        }
    }
}

/// `GET /1.0/statistics`: session counts for authenticated reporters.
async fn statistics(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let config = state.config.snapshot();

    let key = params.get("key").map(String::as_str).unwrap_or_default();
    if !config.server_statistics_keys.iter().any(|k| k == key) {
        return (StatusCode::UNAUTHORIZED, "Invalid authentication key").into_response();
    }

    let unique = params
        .get("unique")
        .map(|v| {
            matches!(
                v.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false);

    let period = match params
        .get("period")
        .map(String::as_str)
        .unwrap_or_default()
        .parse::<StatsPeriod>()
    {
        Ok(period) => period,
        Err(()) => return bad_request("Invalid period"),
    };

    let network = match params.get("network").filter(|n| !n.is_empty()) {
        None => None,
        Some(network) => match network.parse::<IpNetwork>() {
            Ok(network) => Some(network),
            Err(_) => return bad_request("Invalid network"),
        },
    };

    match state.db.count_sessions(period, unique, network).await {
        Ok(count) => format!("{count}\n").into_response(),
        Err(e) => {
            error!(error = %e, "Unable to compute statistics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to retrieve statistics",
            )
                .into_response()
        }
    }
}
