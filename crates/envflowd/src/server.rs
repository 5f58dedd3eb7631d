//! HTTP and WebSocket surface of the daemon
//!
//! Long operations are WebSocket upgrades: the server writes one text frame
//! per progress message and closes the socket with the outcome's close code.
//! Listings are plain JSON.

use axum::Json;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use envflow_cloud::{AppInfra, Domain, Environment, LoadBalancerKind, TaskSize};
use envflow_controlplane::{
    ControlPlane, ControlPlaneError, CreateEnvironment, Frame, ProgressStream, channel, relay,
};
use futures_util::{SinkExt, future};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    plane: ControlPlane,
    /// Parent of every operation's cancellation token
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(plane: ControlPlane, shutdown: CancellationToken) -> Self {
        Self { plane, shutdown }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/environments", get(list_environments))
        .route("/environments/{name}/create", get(create_environment))
        .route("/environments/{name}/destroy", get(destroy_environment))
        .route("/environments/{name}/apps", get(list_apps))
        .route("/domains", get(list_domains))
        .route("/domains/{name}/create", get(create_domain))
        .route("/domains/{name}/destroy", get(destroy_domain))
        .route("/sizes/normalize", get(normalize_size))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error of a JSON route
struct ApiError(ControlPlaneError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        ApiError(err)
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

/// Relay `stream` onto the socket until the operation ends
async fn forward(socket: WebSocket, stream: ProgressStream) {
    let sink = socket.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let mut sink = std::pin::pin!(sink);

    match relay(stream, &mut sink).await {
        Ok(code) => tracing::debug!(code = code.code(), "Closed progress connection"),
        Err(e) => tracing::warn!(error = %e, "Client left before the operation finished"),
    }
}

/// A stream that only reports `err`
async fn rejected(err: ControlPlaneError) -> ProgressStream {
    let (tx, stream) = channel(1);
    tx.fail(err).await;
    stream
}

fn parse_load_balancer(value: &str) -> Result<LoadBalancerKind, ControlPlaneError> {
    match value {
        "alb" => Ok(LoadBalancerKind::Alb),
        other => Err(ControlPlaneError::Validation(format!(
            "unknown load balancer '{}' (expected alb)",
            other
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct CreateEnvironmentParams {
    domain: Option<String>,
    load_balancer: Option<String>,
}

async fn create_environment(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<CreateEnvironmentParams>,
) -> Response {
    tracing::info!(environment = %name, ?params, "Create environment requested");

    ws.on_upgrade(move |socket| async move {
        let stream = match params.load_balancer.as_deref().map(parse_load_balancer).transpose() {
            Ok(load_balancer) => {
                let request = CreateEnvironment {
                    name,
                    domain: params.domain,
                    load_balancer,
                };
                state
                    .plane
                    .create_environment(request, state.shutdown.child_token())
            }
            Err(err) => rejected(err).await,
        };
        forward(socket, stream).await;
    })
}

async fn destroy_environment(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    tracing::info!(environment = %name, "Destroy environment requested");

    ws.on_upgrade(move |socket| async move {
        let stream = state
            .plane
            .destroy_environment(&name, state.shutdown.child_token());
        forward(socket, stream).await;
    })
}

async fn create_domain(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    tracing::info!(domain = %name, "Create domain requested");

    ws.on_upgrade(move |socket| async move {
        let stream = state
            .plane
            .create_domain(&name, state.shutdown.child_token());
        forward(socket, stream).await;
    })
}

async fn destroy_domain(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    tracing::info!(domain = %name, "Destroy domain requested");

    ws.on_upgrade(move |socket| async move {
        let stream = state
            .plane
            .destroy_domain(&name, state.shutdown.child_token());
        forward(socket, stream).await;
    })
}

async fn list_environments(
    State(state): State<AppState>,
) -> Result<Json<Vec<Environment>>, ApiError> {
    Ok(Json(state.plane.environments().await?))
}

async fn list_domains(State(state): State<AppState>) -> Result<Json<Vec<Domain>>, ApiError> {
    Ok(Json(state.plane.domains().await?))
}

async fn list_apps(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<AppInfra>>, ApiError> {
    Ok(Json(state.plane.apps(&name).await?))
}

#[derive(Debug, Deserialize)]
struct SizeParams {
    cpu: u32,
    memory: u32,
}

async fn normalize_size(
    State(state): State<AppState>,
    Query(params): Query<SizeParams>,
) -> Json<TaskSize> {
    Json(
        state
            .plane
            .normalize_size(TaskSize::new(params.cpu, params.memory)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_map_to_messages() {
        match to_message(Frame::Text("Created VPC vpc-1".to_string())) {
            Message::Text(text) => assert_eq!(text.as_str(), "Created VPC vpc-1"),
            other => panic!("unexpected message: {:?}", other),
        }

        match to_message(Frame::Close {
            code: 1008,
            reason: "conflict".to_string(),
        }) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), "conflict");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_load_balancer() {
        assert_eq!(parse_load_balancer("alb").unwrap(), LoadBalancerKind::Alb);
        assert!(matches!(
            parse_load_balancer("nlb"),
            Err(ControlPlaneError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_stream_reports_error() {
        let events = rejected(ControlPlaneError::Validation("bad".into()))
            .await
            .collect()
            .await;
        assert_eq!(events.len(), 1);
    }
}
