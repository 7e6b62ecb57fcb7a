use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{IdentityResolver, TokenIdentityResolver},
    hub::{BroadcastHub, HubWorker},
    registry::ConnectionRegistry,
    store::{AccountStore, MessageStore},
};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Knobs every session reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Ordinary messages replayed to a newly active connection.
    pub history_limit: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Lifetime of a login token.
    pub session_ttl: time::Duration,
}

impl RelaySettings {
    /// Outbound queue size for a new connection: room for the whole history
    /// replay plus `outbound_buffer` live messages arriving meanwhile, so a
    /// replay can never saturate its own connection.
    pub fn queue_capacity(&self) -> usize {
        self.outbound_buffer.saturating_add(self.history_limit)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            session_ttl: time::Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

pub struct AppState {
    pub hub: BroadcastHub,
    pub messages: Arc<dyn MessageStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub settings: RelaySettings,
    pub shutdown: CancellationToken,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wires a fresh registry and hub. The returned worker still has to be
    /// spawned before ordinary messages go anywhere.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        accounts: Arc<dyn AccountStore>,
        settings: RelaySettings,
        shutdown: CancellationToken,
    ) -> (Self, HubWorker) {
        let (hub, worker) = BroadcastHub::new(ConnectionRegistry::new());
        let resolver = Arc::new(TokenIdentityResolver::new(Arc::clone(&accounts)));
        let state = Self {
            hub,
            messages,
            accounts,
            resolver,
            settings,
            shutdown,
            metrics: None,
        };
        (state, worker)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<PrometheusHandle>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.hub.registry()
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
