use async_trait::async_trait;

use super::protocol::{Envelope, Reply};
use crate::errors::CommunicationError;

/// Moves one envelope to `address` and returns the receiver's reply.
///
/// A transport makes exactly one attempt. Retrying is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, address: &str, envelope: &Envelope) -> Result<Reply, CommunicationError>;
}

/// Receiving side of a transport.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, CommunicationError>;
}
