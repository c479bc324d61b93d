//! Envelope transport over HTTP: `POST {address}/rpc` with a JSON body.

use async_trait::async_trait;
use axum::{extract::Extension, http::StatusCode, routing::post, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::protocol::{Envelope, Reply};
use super::transport::{EnvelopeHandler, Transport};
use crate::errors::{CommunicationError, ErrorBody};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

fn rpc_url(address: &str) -> String {
    format!("{}/rpc", address.trim_end_matches('/'))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, address: &str, envelope: &Envelope) -> Result<Reply, CommunicationError> {
        let response = self
            .client
            .post(rpc_url(address))
            .json(envelope)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CommunicationError::Timeout {
                        peer: address.to_string(),
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    debug!(peer = address, error = %e, "RPC send failed");
                    CommunicationError::Unreachable {
                        peer: address.to_string(),
                        attempts: 1,
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Reply>()
                .await
                .map_err(|e| CommunicationError::Rejected {
                    peer: address.to_string(),
                    reason: format!("malformed reply: {e}"),
                });
        }

        if status == reqwest::StatusCode::CONFLICT {
            return Err(CommunicationError::DuplicateSuppressed {
                request_id: envelope.request_id.clone(),
            });
        }

        if status.is_client_error() {
            let reason = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(CommunicationError::Rejected {
                peer: address.to_string(),
                reason,
            });
        }

        Err(CommunicationError::Unreachable {
            peer: address.to_string(),
            attempts: 1,
        })
    }
}

/// Status code a receiver answers with for a failed envelope.
pub fn status_for(err: &CommunicationError) -> StatusCode {
    match err {
        CommunicationError::DuplicateSuppressed { .. } => StatusCode::CONFLICT,
        CommunicationError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CommunicationError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
        CommunicationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

pub async fn handle_rpc(
    Extension(handler): Extension<Arc<dyn EnvelopeHandler>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Reply>, (StatusCode, Json<ErrorBody>)> {
    handler
        .handle(envelope)
        .await
        .map(Json)
        .map_err(|e| (status_for(&e), Json(ErrorBody::from(&e))))
}

/// Router serving `POST /rpc` for `handler`.
pub fn rpc_router(handler: Arc<dyn EnvelopeHandler>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .layer(Extension(handler))
}
