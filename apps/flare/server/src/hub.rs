//! Message fan-out.
//!
//! Ordinary messages go through one FIFO intake queue drained by a single
//! worker, so every recipient sees them in publish order. Distress alerts skip
//! the queue: the publishing session fans them out itself, right away. Both
//! paths share [`fan_out`], which takes one registry snapshot and gives each
//! connection in it exactly one delivery attempt. A connection that fails is
//! pruned and closed on the spot.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use flare_core::ChatMessage;
use metrics::{counter, gauge, histogram};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::HubError,
    registry::{ConnectionRegistry, Outbound},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub recipients: usize,
    pub delivered: usize,
    pub pruned: usize,
}

/// Publisher side of the hub. Cheap to clone; every session holds one.
#[derive(Clone)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
    intake: mpsc::UnboundedSender<Outbound>,
    pending: Arc<AtomicUsize>,
}

/// The single consumer of the intake queue.
pub struct HubWorker {
    registry: ConnectionRegistry,
    intake: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<AtomicUsize>,
}

impl BroadcastHub {
    pub fn new(registry: ConnectionRegistry) -> (Self, HubWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let hub = Self {
            registry: registry.clone(),
            intake: tx,
            pending: Arc::clone(&pending),
        };
        let worker = HubWorker {
            registry,
            intake: rx,
            pending,
        };
        (hub, worker)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Queues an ordinary message for asynchronous fan-out. Never waits.
    pub fn publish(&self, message: ChatMessage) -> Result<(), HubError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.intake.send(Arc::new(message)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(HubError::Closed);
        }
        counter!("flare_messages_published_total", 1);
        Ok(())
    }

    /// Fans a distress alert out on the caller's task, ahead of anything
    /// still waiting in the intake queue.
    pub fn broadcast_now(&self, message: ChatMessage) -> FanOutReport {
        let report = fan_out(&self.registry, &Arc::new(message));
        counter!("flare_alerts_raised_total", 1);
        report
    }

    /// Messages published but not yet fanned out.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.intake.is_closed()
    }
}

impl HubWorker {
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drains the intake queue in order until shutdown or until every
    /// publisher is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.intake.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.pending.fetch_sub(1, Ordering::Relaxed);

            let report = fan_out(&self.registry, &message);
            debug!(
                sender = %message.sender,
                recipients = report.recipients,
                delivered = report.delivered,
                pruned = report.pruned,
                "broadcast message"
            );
        }

        // refuse new publishes, then discard what was already queued
        self.intake.close();
        let mut dropped = 0usize;
        while self.intake.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            dropped += 1;
        }
        if dropped > 0 {
            counter!("flare_messages_dropped_total", dropped as u64);
            warn!(dropped, "broadcast hub stopped with undelivered messages");
        }
        info!("broadcast hub stopped");
    }
}

/// One delivery attempt per connection in a single registry snapshot.
pub fn fan_out(registry: &ConnectionRegistry, message: &Outbound) -> FanOutReport {
    let recipients = registry.snapshot();
    let mut report = FanOutReport {
        recipients: recipients.len(),
        ..FanOutReport::default()
    };

    for connection in recipients {
        match connection.deliver(message) {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                warn!(
                    connection_id = %connection.id(),
                    identity = %connection.identity(),
                    error = %err,
                    "pruning connection after failed delivery"
                );
                counter!(
                    "flare_deliveries_pruned_total",
                    1,
                    "reason" => err.metric_label()
                );
                connection.close();
                if registry.remove(connection.id()).is_some() {
                    report.pruned += 1;
                }
            }
        }
    }

    counter!("flare_deliveries_total", report.delivered as u64);
    histogram!("flare_fanout_recipients", report.recipients as f64);
    if report.pruned > 0 {
        gauge!("flare_connections_active", registry.len() as f64);
    }
    report
}
