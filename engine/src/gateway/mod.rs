//! Skill HTTP gateway
//!
//! Localhost HTTP surface for externally-spawned skill scripts. The agent
//! subprocess receives a session token and calls
//! `POST /api/skill/{name}` with `{sessionId, parameters}`; the gateway
//! authenticates the session, dispatches to the skill registry, and returns
//! the uniform `{success, data?, error?}` body.
//!
//! The bind host must be a loopback interface; anything else is rejected at
//! startup. Only POST and OPTIONS are served.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use sdk::errors::GatewayError;
use sdk::types::{SkillInvocation, SkillResult};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::session::SessionRegistry;
use crate::skills::{SkillContext, SkillRegistry};

/// Shared state for gateway handlers.
#[derive(Clone)]
struct GatewayState {
    sessions: Arc<SessionRegistry>,
    skills: Arc<SkillRegistry>,
}

/// Running gateway server handle.
pub struct SkillGateway {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SkillGateway {
    /// Bind and start serving.
    ///
    /// Fails fast when the configured host is not a loopback interface or
    /// the port cannot be bound.
    pub async fn start(
        config: &GatewayConfig,
        sessions: Arc<SessionRegistry>,
        skills: Arc<SkillRegistry>,
    ) -> Result<Self, GatewayError> {
        let host = config.host.as_str();
        let ip = if host == "localhost" {
            IpAddr::from_str("127.0.0.1").unwrap()
        } else {
            IpAddr::from_str(host).map_err(|_| {
                GatewayError::Config(format!("Invalid gateway host '{}'", host))
            })?
        };
        if !ip.is_loopback() {
            return Err(GatewayError::Config(format!(
                "Gateway host must be a loopback interface, got '{}'",
                host
            )));
        }

        let state = GatewayState { sessions, skills };

        let app = Router::new()
            .route(
                "/api/skill/:name",
                post(skill_handler)
                    .options(preflight_handler)
                    .fallback(method_not_allowed),
            )
            .fallback(not_found)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(SocketAddr::new(ip, config.port))
            .await
            .map_err(|e| GatewayError::Gateway(format!("Failed to bind gateway: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Gateway(format!("Failed to read bind address: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            info!("Skill gateway listening on http://{}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                    info!("Skill gateway shutting down gracefully");
                })
                .await
                .unwrap_or_else(|e| {
                    error!("Skill gateway error: {}", e);
                });
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Actual bound address (useful when the configured port is 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).ok();
        }
    }
}

impl Drop for SkillGateway {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Attach the CORS headers every response carries.
fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn respond(status: StatusCode, body: Value) -> Response {
    with_cors((status, Json(body)).into_response())
}

fn fail_body(error: &str) -> Value {
    json!({ "success": false, "error": error })
}

async fn preflight_handler() -> Response {
    with_cors(StatusCode::NO_CONTENT.into_response())
}

async fn method_not_allowed() -> Response {
    respond(StatusCode::METHOD_NOT_ALLOWED, fail_body("Method not allowed"))
}

async fn not_found() -> Response {
    respond(StatusCode::NOT_FOUND, fail_body("Not found"))
}

/// POST /api/skill/{name}
async fn skill_handler(
    Path(name): Path<String>,
    State(state): State<GatewayState>,
    body: Bytes,
) -> Response {
    // Skill names are lowercase kebab; anything else is not a route we serve.
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '-')
    {
        return respond(StatusCode::NOT_FOUND, fail_body("Not found"));
    }

    // A body that is not a SkillInvocation cannot carry a session id.
    let invocation: SkillInvocation = match serde_json::from_slice(&body) {
        Ok(invocation) => invocation,
        Err(_) => {
            return respond(StatusCode::BAD_REQUEST, fail_body("Missing sessionId"));
        }
    };

    if invocation.session_id.is_empty() {
        return respond(StatusCode::BAD_REQUEST, fail_body("Missing sessionId"));
    }
    let session_id = invocation.session_id;

    let session = match state.sessions.get(&session_id) {
        Some(session) => session,
        None => {
            return respond(
                StatusCode::UNAUTHORIZED,
                fail_body("Invalid or expired session"),
            );
        }
    };

    if !state.skills.is_skill(&name) {
        return respond(
            StatusCode::NOT_FOUND,
            fail_body(&format!("Unknown skill: {}", name)),
        );
    }

    if name == "send-reply" && state.sessions.has_reply_sent(&session_id) {
        return respond(
            StatusCode::CONFLICT,
            fail_body("Reply already sent for this session"),
        );
    }

    let parameters = invocation.parameters;

    // Run the handler on its own task so a panic surfaces as a 500 rather
    // than poisoning the connection task.
    let dispatch = {
        let skills = Arc::clone(&state.skills);
        let skill_name = name.clone();
        let ctx = SkillContext { session };
        tokio::spawn(async move { skills.dispatch(&skill_name, &parameters, &ctx).await })
    };

    let result: SkillResult = match dispatch.await {
        Ok(result) => result,
        Err(e) => {
            error!("Skill '{}' panicked: {}", name, e);
            return respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                fail_body(&e.to_string()),
            );
        }
    };

    if result.success {
        // The handler claims the reply flag itself before dispatching; this
        // mark is a no-op that keeps the flag set even if a handler ever
        // returns success without claiming.
        if name == "send-reply" {
            state.sessions.mark_reply_sent(&session_id);
        }
        respond(
            StatusCode::OK,
            json!({ "success": true, "data": result.data }),
        )
    } else {
        let error = result.error.unwrap_or_else(|| "Skill failed".to_string());
        warn!("Skill '{}' failed for session {}: {}", name, session_id, error);
        respond(StatusCode::BAD_REQUEST, fail_body(&error))
    }
}
