use std::sync::{Arc, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::protocol::{Envelope, Payload, Reply};
use super::retry::RetryPolicy;
use super::transport::Transport;
use crate::errors::CommunicationError;

/// Single exit point for remote calls: one envelope per logical call,
/// per-attempt timeout, exponential backoff between transient failures.
pub struct CommunicationLayer {
    node_id: String,
    transport: Arc<dyn Transport>,
    policy: RwLock<RetryPolicy>,
}

impl CommunicationLayer {
    pub fn new(node_id: impl Into<String>, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            policy: RwLock::new(policy),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn policy(&self) -> RetryPolicy {
        *self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
        info!(
            max_retries = policy.max_retries,
            backoff_factor = policy.backoff_factor,
            timeout_ms = policy.timeout.as_millis() as u64,
            "Retry policy updated"
        );
    }

    pub async fn call(&self, address: &str, payload: Payload) -> Result<Reply, CommunicationError> {
        self.call_with_policy(address, payload, self.policy()).await
    }

    pub async fn call_with_policy(
        &self,
        address: &str,
        payload: Payload,
        policy: RetryPolicy,
    ) -> Result<Reply, CommunicationError> {
        self.send(address, Envelope::new(self.node_id.clone(), payload), policy)
            .await
    }

    /// Delivers `envelope`, retrying transient failures under `policy`.
    ///
    /// The request id never changes across attempts. A receiver reporting a
    /// duplicate means an earlier attempt landed, which counts as delivered.
    pub async fn send(
        &self,
        address: &str,
        mut envelope: Envelope,
        policy: RetryPolicy,
    ) -> Result<Reply, CommunicationError> {
        let attempts = policy.total_attempts();

        for attempt in 0..attempts {
            envelope.attempt = attempt;
            let result = match timeout(policy.timeout, self.transport.deliver(address, &envelope)).await {
                Ok(result) => result,
                Err(_) => Err(CommunicationError::Timeout {
                    peer: address.to_string(),
                    after_ms: policy.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(CommunicationError::DuplicateSuppressed { request_id }) => {
                    debug!(request_id = %request_id, peer = address, "Receiver already has this request");
                    return Ok(Reply::Ack);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        request_id = %envelope.request_id,
                        peer = address,
                        kind = envelope.payload.kind(),
                        attempt,
                        error = %e,
                        "Remote call failed"
                    );
                    if attempt + 1 < attempts {
                        sleep(policy.delay_for(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CommunicationError::Unreachable {
            peer: address.to_string(),
            attempts,
        })
    }
}
