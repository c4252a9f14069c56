use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channels::ChannelFactory;
use crate::config::{Config, NodeBackend};
use crate::dispatch::{DispatchReport, InvoiceEventDispatcher, InvoiceHandler};
use crate::lnd::LndConnector;
use crate::memory::MemoryConnector;
use crate::node::{InvoiceCategory, InvoiceSnapshot, NodeConnector};
use crate::query::NodeQueryClient;
use crate::settlement::{SettlementDeduplicator, SettlementEvent, SettlementLedger};
use crate::supervisor::{SubscriptionSupervisor, SupervisorSnapshot};

/// Picks the node backend named by the config.
pub fn connector_from_config(config: &Config) -> Arc<dyn NodeConnector> {
    match config.backend {
        NodeBackend::Lnd => Arc::new(LndConnector::new(config.clone())),
        NodeBackend::Memory => Arc::new(MemoryConnector::new()),
    }
}

/// Owns the shared channel factory and everything built on top of it.
pub struct InvoiceService {
    config: Config,
    channels: Arc<ChannelFactory>,
    queries: NodeQueryClient,
    deduplicator: Arc<SettlementDeduplicator>,
    dispatcher: Arc<InvoiceEventDispatcher>,
}

impl InvoiceService {
    pub fn new(
        config: Config,
        connector: Arc<dyn NodeConnector>,
        ledger: Arc<dyn SettlementLedger>,
    ) -> Self {
        let channels = Arc::new(ChannelFactory::new(connector));
        let queries = NodeQueryClient::new(Arc::clone(&channels));
        let deduplicator = Arc::new(SettlementDeduplicator::new(
            ledger,
            config.settled_marker_capacity,
        ));
        Self {
            config,
            channels,
            queries,
            deduplicator,
            dispatcher: Arc::new(InvoiceEventDispatcher::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queries(&self) -> &NodeQueryClient {
        &self.queries
    }

    pub fn channels(&self) -> &Arc<ChannelFactory> {
        &self.channels
    }

    pub async fn register_handler(&self, handler: Arc<dyn InvoiceHandler>) -> bool {
        self.dispatcher.register(handler).await
    }

    /// Spawns the subscription supervisor. Streaming starts right away rather
    /// than on first use so no settlement is missed while the service idles.
    pub fn start(&self, shutdown: CancellationToken) -> SupervisorHandle {
        let supervisor = SubscriptionSupervisor::new(
            Arc::clone(&self.channels),
            Arc::clone(&self.deduplicator),
            Arc::clone(&self.dispatcher),
            self.config.backoff_policy(),
        );
        let status = supervisor.status();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        info!(backend = self.channels.backend(), "invoice subscription started");
        SupervisorHandle {
            shutdown,
            status,
            task,
        }
    }

    /// Hands an off-chain (fiat) record to the handlers. The node never sees
    /// these, so they bypass settlement tracking.
    pub async fn publish_offchain(&self, snapshot: InvoiceSnapshot) -> DispatchReport {
        let event = SettlementEvent {
            category: snapshot.category.unwrap_or(InvoiceCategory::Fiat),
            first_settlement: false,
            snapshot,
        };
        info!(payment_hash = %event.identity_hex(), "publishing off-chain invoice");
        self.dispatcher.dispatch(&event).await
    }

    /// Closes every cached channel. Call after the supervisor has stopped.
    pub async fn shutdown(&self) {
        self.channels.close_all().await;
    }
}

pub struct SupervisorHandle {
    shutdown: CancellationToken,
    status: watch::Receiver<SupervisorSnapshot>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn status(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.status.borrow().clone()
    }

    /// Cancels the supervisor and waits for it to finish.
    pub async fn stop(self) -> Result<(), tokio::task::JoinError> {
        self.shutdown.cancel();
        self.task.await
    }
}
