//! JSON-RPC 2.0 over WebSocket endpoint.
//!
//! One axum route upgrades to a WebSocket session; every text frame is one
//! JSON-RPC request. Correlation is by `id`: each accepted request with an
//! id produces exactly one response with the same id (notifications produce
//! none). Each request runs under the configured handler timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{InfraError, Result};

use super::handler::RequestHandler;
use super::rpc::{RpcError, RpcRequest, RpcResponse, codes};

/// Shared server context.
#[derive(Clone)]
struct ApiContext {
    handler: Arc<RequestHandler>,
    request_timeout: Duration,
}

/// Serve the API until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
#[instrument(skip(handler, shutdown))]
pub async fn serve(
    handler: Arc<RequestHandler>,
    addr: String,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let context = ApiContext {
        handler,
        request_timeout,
    };
    let app = Router::new()
        .route("/", get(upgrade))
        .with_state(context);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| InfraError::Internal(format!("bind {addr}: {e}")))?;
    info!(%addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| InfraError::Internal(format!("serve: {e}")))?;
    Ok(())
}

async fn upgrade(State(context): State<ApiContext>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session(socket, context))
}

async fn session(mut socket: WebSocket, context: ApiContext) {
    debug!("API session opened");
    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(payload)) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if let Some(response) = handle_frame(&context, &text).await {
            let encoded = match serde_json::to_string(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(error = %e, "Response serialization failed");
                    continue;
                }
            };
            if socket.send(Message::Text(encoded.into())).await.is_err() {
                break;
            }
        }
    }
    debug!("API session closed");
}

/// Process one frame; `None` means no response (notification).
async fn handle_frame(context: &ApiContext, text: &str) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(_) => {
            return Some(RpcResponse::fail(
                Value::Null,
                RpcError::new(codes::PARSE, "parse error"),
            ));
        }
    };

    let id = request.id.clone();
    if request.jsonrpc != "2.0" {
        return Some(RpcResponse::fail(
            id.unwrap_or(Value::Null),
            RpcError::new(codes::INVALID_REQUEST, "invalid request"),
        ));
    }

    let outcome = tokio::time::timeout(
        context.request_timeout,
        context.handler.dispatch(&request.method, request.params),
    )
    .await;

    // Notifications get processed but never answered.
    let id = id?;
    Some(match outcome {
        Ok(Ok(result)) => RpcResponse::ok(id, result),
        Ok(Err(error)) => RpcResponse::fail(id, RpcError::from(&error)),
        Err(_) => RpcResponse::fail(
            id,
            RpcError::new(codes::SERVER, "request timed out"),
        ),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
