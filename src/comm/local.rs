//! In-process network used to run several nodes inside one runtime.
//!
//! Nodes still talk through envelopes and the [`Transport`] trait, so the
//! protocols behave as they do over HTTP. The network can take nodes down,
//! cut links between them and duplicate every delivery.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::protocol::{Envelope, Reply};
use super::transport::{EnvelopeHandler, Transport};
use crate::errors::CommunicationError;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<String, Arc<dyn EnvelopeHandler>>,
    down: DashSet<String>,
    cut: DashSet<(String, String)>,
    duplicate_delivery: AtomicBool,
    delivered: AtomicU64,
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, address: impl Into<String>, handler: Arc<dyn EnvelopeHandler>) {
        self.nodes.insert(address.into(), handler);
    }

    pub fn detach(&self, address: &str) {
        self.nodes.remove(address);
    }

    /// A down node neither sends nor receives.
    pub fn set_down(&self, address: &str, down: bool) {
        if down {
            self.down.insert(address.to_string());
        } else {
            self.down.remove(address);
        }
    }

    /// Cuts every link between the two groups.
    pub fn partition(&self, left: &[String], right: &[String]) {
        for a in left {
            for b in right {
                if a != b {
                    self.cut.insert(link(a, b));
                }
            }
        }
    }

    pub fn heal(&self) {
        self.cut.clear();
    }

    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate_delivery.store(enabled, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn transport_for(self: &Arc<Self>, source: impl Into<String>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            source: source.into(),
        }
    }

    fn reachable(&self, source: &str, target: &str) -> bool {
        !self.down.contains(source)
            && !self.down.contains(target)
            && !self.cut.contains(&link(source, target))
    }
}

/// A node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    source: String,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(&self, address: &str, envelope: &Envelope) -> Result<Reply, CommunicationError> {
        let unreachable = || CommunicationError::Unreachable {
            peer: address.to_string(),
            attempts: 1,
        };

        if !self.network.reachable(&self.source, address) {
            trace!(from = %self.source, to = address, "Link down");
            return Err(unreachable());
        }
        let handler = self
            .network
            .nodes
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(unreachable)?;

        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        let reply = handler.handle(envelope.clone()).await;

        if self.network.duplicate_delivery.load(Ordering::Relaxed) {
            self.network.delivered.fetch_add(1, Ordering::Relaxed);
            let _ = handler.handle(envelope.clone()).await;
        }

        reply
    }
}
