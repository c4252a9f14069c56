use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::channels::ChannelFactory;
use crate::dispatch::InvoiceEventDispatcher;
use crate::node::{CredentialScope, InvoiceSnapshot, InvoiceUpdates, NodeError};
use crate::settlement::SettlementDeduplicator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Disconnected,
    Subscribing,
    Streaming,
    Backoff,
    Stopped,
}

impl SupervisorState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub subscriptions: u64,
    pub reconnect_attempts: u64,
    pub notifications: u64,
    pub next_retry_ms: Option<u64>,
    pub last_failure: Option<String>,
}

impl Default for SupervisorSnapshot {
    fn default() -> Self {
        Self {
            state: SupervisorState::Disconnected,
            subscriptions: 0,
            reconnect_attempts: 0,
            notifications: 0,
            next_retry_ms: None,
            last_failure: None,
        }
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone)]
pub enum StreamFailure {
    /// The wallet is locked; nothing will work until an operator unlocks it.
    NodeLocked(NodeError),
    Failed(NodeError),
    /// The node closed the stream. Never expected in production.
    Completed,
}

impl StreamFailure {
    #[must_use]
    pub fn classify(error: NodeError) -> Self {
        if error.is_node_locked() {
            Self::NodeLocked(error)
        } else {
            Self::Failed(error)
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::NodeLocked(error) | Self::Failed(error) => error.to_string(),
            Self::Completed => "stream completed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub retry: Duration,
    pub node_locked: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(10),
            node_locked: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn delay_for(&self, failure: &StreamFailure) -> Duration {
        match failure {
            StreamFailure::NodeLocked(_) => self.node_locked,
            StreamFailure::Failed(_) | StreamFailure::Completed => self.retry,
        }
    }
}

/// Owns the invoice subscription for the lifetime of the process.
///
/// Every way the subscription can end (subscribe error, stream error, clean
/// end of stream) leads to a classified backoff, a reset of the streaming
/// channel and a fresh subscribe. Only cancellation stops the loop.
pub struct SubscriptionSupervisor {
    channels: Arc<ChannelFactory>,
    deduplicator: Arc<SettlementDeduplicator>,
    dispatcher: Arc<InvoiceEventDispatcher>,
    backoff: BackoffPolicy,
    status: watch::Sender<SupervisorSnapshot>,
}

impl SubscriptionSupervisor {
    pub fn new(
        channels: Arc<ChannelFactory>,
        deduplicator: Arc<SettlementDeduplicator>,
        dispatcher: Arc<InvoiceEventDispatcher>,
        backoff: BackoffPolicy,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorSnapshot::default());
        Self {
            channels,
            deduplicator,
            dispatcher,
            backoff,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.status.subscribe()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.status.send_modify(|status| {
                status.state = SupervisorState::Subscribing;
                status.next_retry_ms = None;
            });

            let Some(failure) = self.stream_once(&shutdown).await else {
                break;
            };

            let delay = self.backoff.delay_for(&failure);
            match &failure {
                StreamFailure::NodeLocked(_) => error!(
                    retry_in_secs = delay.as_secs(),
                    "lightning node seems to be locked, please unlock it; retrying invoice subscription in {}s",
                    delay.as_secs()
                ),
                StreamFailure::Failed(cause) => error!(
                    error = %cause,
                    retry_in_secs = delay.as_secs(),
                    "invoice subscription failed; retrying in {}s",
                    delay.as_secs()
                ),
                StreamFailure::Completed => error!(
                    retry_in_secs = delay.as_secs(),
                    "invoice subscription completed by node; resubscribing in {}s",
                    delay.as_secs()
                ),
            }
            self.status.send_modify(|status| {
                status.state = SupervisorState::Backoff;
                status.reconnect_attempts += 1;
                status.next_retry_ms = Some(delay.as_millis() as u64);
                status.last_failure = Some(failure.describe());
            });

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown requested during subscription backoff");
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
            self.channels.reset_channel(CredentialScope::Streaming).await;
        }

        self.status.send_modify(|status| {
            status.state = SupervisorState::Stopped;
            status.next_retry_ms = None;
        });
        info!("invoice subscription stopped");
    }

    /// Runs one subscription until it fails. `None` means shutdown.
    async fn stream_once(&self, shutdown: &CancellationToken) -> Option<StreamFailure> {
        let opened = tokio::select! {
            () = shutdown.cancelled() => return None,
            opened = self.open_subscription() => opened,
        };
        let mut updates = match opened {
            Ok(updates) => updates,
            Err(error) => return Some(StreamFailure::classify(error)),
        };

        self.status.send_modify(|status| {
            status.state = SupervisorState::Streaming;
            status.subscriptions += 1;
        });
        info!("subscribed to invoice updates");

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => return None,
                next = updates.next() => next,
            };
            match next {
                Some(Ok(snapshot)) => self.deliver(snapshot).await,
                Some(Err(error)) => return Some(StreamFailure::classify(error)),
                None => return Some(StreamFailure::Completed),
            }
        }
    }

    async fn open_subscription(&self) -> Result<InvoiceUpdates, NodeError> {
        let handle = self.channels.get_channel(CredentialScope::Streaming).await?;
        handle.channel().subscribe_invoices().await
    }

    async fn deliver(&self, snapshot: InvoiceSnapshot) {
        info!(
            payment_hash = %snapshot.payment_hash,
            settled = snapshot.settled,
            "received invoice update on subscription"
        );
        let event = self.deduplicator.observe(snapshot).await;
        self.dispatcher.dispatch(&event).await;
        self.status.send_modify(|status| status.notifications += 1);
    }
}
