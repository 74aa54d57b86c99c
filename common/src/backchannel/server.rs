// Back-channel HTTP listener
// POST /jobruns/:correlation_id/messages delivers one message to the sink

use super::messages::{BackChannelMessage, MessageSink};
use crate::errors::{ApiError, BackChannelError, ExecutionError};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_ADDRESS: &str = "127.0.0.1:0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound back-channel listener
///
/// Binding happens before the sink exists so the URL can be handed to the
/// execution engine that later serves as the sink.
pub struct BackChannelServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BackChannelServer {
    /// Bind `address`, or an ephemeral loopback port when none is configured
    pub async fn bind(address: Option<&str>) -> Result<Self, BackChannelError> {
        let address = match address {
            Some(address) => address,
            None => {
                warn!("No back-channel address configured, using an ephemeral loopback port");
                DEFAULT_ADDRESS
            }
        };
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| BackChannelError::InvalidAddress(address.to_string()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BackChannelError::Bind {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| BackChannelError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        info!(address = %local_addr, "Back-channel listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL handed to child processes
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, sink: Arc<dyn MessageSink>, shutdown: F) -> Result<(), BackChannelError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(address = %self.local_addr, "Back-channel server started");
        axum::serve(self.listener, router(sink))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| BackChannelError::Bind {
                address: self.local_addr.to_string(),
                reason: e.to_string(),
            })?;
        info!("Back-channel server stopped");
        Ok(())
    }
}

/// Routes of the back-channel service
pub fn router(sink: Arc<dyn MessageSink>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/jobruns/:correlation_id/messages", post(post_message))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(sink)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn post_message(
    State(sink): State<Arc<dyn MessageSink>>,
    Path(correlation_id): Path<Uuid>,
    payload: Result<Json<BackChannelMessage>, JsonRejection>,
) -> Response {
    let Json(message) = match payload {
        Ok(message) => message,
        Err(rejection) => {
            warn!(
                correlation_id = %correlation_id,
                error = %rejection.body_text(),
                "Malformed back-channel message"
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new("INVALID_MESSAGE", rejection.body_text())),
            )
                .into_response();
        }
    };

    match sink.deliver(correlation_id, message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let status = match &e {
                ExecutionError::UnknownJobRun(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(
                correlation_id = %correlation_id,
                kind = message.kind(),
                error = %e,
                "Back-channel message rejected"
            );
            (status, Json(ApiError::from(&e))).into_response()
        }
    }
}
