//! In-memory node backend.
//!
//! Used for local dry runs (`INVOICE_BRIDGE_NODE_BACKEND=memory`) and as the
//! scripted node behind the test suite: connect, call and subscribe failures
//! can be queued up front, and invoice updates can be pushed to live
//! subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::node::{
    ChannelFilter, ChannelSummary, CreatedInvoice, CredentialScope, InvoiceRequest,
    InvoiceSnapshot, InvoiceUpdates, NodeChannel, NodeConnector, NodeError, NodeInfo, PaymentHash,
    PeerInfo, StatusCode,
};

/// What one `subscribe_invoices` call should do.
#[derive(Debug, Clone)]
pub enum SubscriptionScript {
    /// The subscribe call itself fails.
    Reject(NodeError),
    /// Yield these items, then end the stream.
    Yield(Vec<Result<InvoiceSnapshot, NodeError>>),
    /// Yield these items, then stay open without further updates.
    YieldThenHold(Vec<Result<InvoiceSnapshot, NodeError>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub method: &'static str,
    pub scope: CredentialScope,
    pub connection: u64,
}

#[derive(Default)]
struct MemoryState {
    info: Option<NodeInfo>,
    channels: Vec<ChannelSummary>,
    peers: HashMap<String, PeerInfo>,
    invoices: HashMap<PaymentHash, InvoiceSnapshot>,
    next_add_index: u64,
    connect_failures: HashMap<CredentialScope, usize>,
    connects: HashMap<CredentialScope, usize>,
    call_failures: VecDeque<NodeError>,
    subscription_scripts: VecDeque<SubscriptionScript>,
    subscribers: Vec<mpsc::UnboundedSender<Result<InvoiceSnapshot, NodeError>>>,
    calls: Vec<CallRecord>,
    subscribe_calls: usize,
    closes: usize,
    fail_closes: bool,
}

/// Connector handing out channels onto one shared in-memory node.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    pub fn set_node_info(&self, info: NodeInfo) {
        self.state().info = Some(info);
    }

    pub fn add_channel(&self, channel: ChannelSummary) {
        self.state().channels.push(channel);
    }

    pub fn add_peer(&self, peer: PeerInfo) {
        self.state().peers.insert(peer.pub_key.clone(), peer);
    }

    /// The next `count` connects for `scope` fail.
    pub fn fail_next_connects(&self, scope: CredentialScope, count: usize) {
        *self.state().connect_failures.entry(scope).or_default() += count;
    }

    /// Every close from now on fails.
    pub fn fail_closes(&self) {
        self.state().fail_closes = true;
    }

    /// The next request/response call, on any channel, fails with `error`.
    pub fn push_call_failure(&self, error: NodeError) {
        self.state().call_failures.push_back(error);
    }

    /// Queues the behavior of the next unscripted `subscribe_invoices` call.
    /// Once the queue is drained, subscriptions are live and fed by
    /// [`Self::publish`].
    pub fn push_subscription(&self, script: SubscriptionScript) {
        self.state().subscription_scripts.push_back(script);
    }

    /// Stores the snapshot and pushes it to every live subscriber.
    pub fn publish(&self, snapshot: InvoiceSnapshot) {
        let mut state = self.state();
        state
            .invoices
            .insert(snapshot.payment_hash, snapshot.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.send(Ok(snapshot.clone())).is_ok());
    }

    /// Marks a stored invoice as paid and publishes the update.
    pub fn settle(&self, payment_hash: &PaymentHash) -> Result<InvoiceSnapshot, NodeError> {
        let snapshot = {
            let mut state = self.state();
            let invoice = state.invoices.get_mut(payment_hash).ok_or_else(|| {
                NodeError::status(StatusCode::NotFound, "unable to locate invoice")
            })?;
            invoice.settled = true;
            invoice.amount_paid_sats = invoice.amount_sats;
            invoice.settled_at = Some(Utc::now());
            invoice.clone()
        };
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Drops every live subscriber, ending their streams.
    pub fn drop_subscribers(&self) {
        self.state().subscribers.clear();
    }

    pub fn connects(&self, scope: CredentialScope) -> usize {
        self.state().connects.get(&scope).copied().unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn live_subscribers(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl NodeConnector for MemoryConnector {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, scope: CredentialScope) -> Result<Arc<dyn NodeChannel>, NodeError> {
        {
            let mut state = self.state();
            if let Some(remaining) = state.connect_failures.get_mut(&scope) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(NodeError::Connect(format!(
                        "memory node refused {scope} connection"
                    )));
                }
            }
            *state.connects.entry(scope).or_default() += 1;
        }
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            scope,
            connection,
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    scope: CredentialScope,
    connection: u64,
}

impl MemoryChannel {
    /// Records the call and pops a queued failure, if any.
    fn begin(&self, method: &'static str) -> Result<MutexGuard<'_, MemoryState>, NodeError> {
        let mut state = lock(&self.state);
        state.calls.push(CallRecord {
            method,
            scope: self.scope,
            connection: self.connection,
        });
        match state.call_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl NodeChannel for MemoryChannel {
    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        let state = self.begin("get_info")?;
        Ok(state.info.clone().unwrap_or_else(|| NodeInfo {
            identity_pubkey: "02".to_string() + &"00".repeat(32),
            alias: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            block_height: 0,
            synced_to_chain: true,
            num_active_channels: state.channels.iter().filter(|c| c.active).count() as u32,
            num_peers: state.peers.len() as u32,
        }))
    }

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<ChannelSummary>, NodeError> {
        let state = self.begin("list_channels")?;
        Ok(state
            .channels
            .iter()
            .filter(|channel| !filter.active_only || channel.active)
            .filter(|channel| !filter.inactive_only || !channel.active)
            .filter(|channel| !filter.public_only || !channel.private)
            .filter(|channel| !filter.private_only || channel.private)
            .cloned()
            .collect())
    }

    async fn get_peer_info(&self, pub_key: &str) -> Result<PeerInfo, NodeError> {
        let state = self.begin("get_peer_info")?;
        state
            .peers
            .get(pub_key)
            .cloned()
            .ok_or_else(|| NodeError::status(StatusCode::NotFound, "unable to find node"))
    }

    async fn add_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice, NodeError> {
        let mut state = self.begin("add_invoice")?;
        state.next_add_index += 1;
        let add_index = state.next_add_index;

        let mut hasher = Sha256::new();
        hasher.update(request.memo.as_bytes());
        hasher.update(add_index.to_be_bytes());
        let payment_hash = PaymentHash::new(hasher.finalize().into());
        let payment_request = format!("lnbcrt{}memory{add_index}", request.amount_sats);

        let mut snapshot = InvoiceSnapshot::new(payment_hash, false, request.amount_sats);
        snapshot.memo.clone_from(&request.memo);
        snapshot.payment_request.clone_from(&payment_request);
        snapshot.created_at = Some(Utc::now());
        state.invoices.insert(payment_hash, snapshot);

        Ok(CreatedInvoice {
            payment_hash,
            payment_request,
            add_index,
        })
    }

    async fn lookup_invoice(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<InvoiceSnapshot, NodeError> {
        let state = self.begin("lookup_invoice")?;
        state
            .invoices
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| NodeError::status(StatusCode::NotFound, "unable to locate invoice"))
    }

    async fn subscribe_invoices(&self) -> Result<InvoiceUpdates, NodeError> {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        match state.subscription_scripts.pop_front() {
            Some(SubscriptionScript::Reject(error)) => Err(error),
            Some(SubscriptionScript::Yield(items)) => Ok(stream::iter(items).boxed()),
            Some(SubscriptionScript::YieldThenHold(items)) => {
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.subscribers.push(sender);
                Ok(stream::unfold(receiver, |mut receiver| async move {
                    receiver.recv().await.map(|item| (item, receiver))
                })
                .boxed())
            }
        }
    }

    async fn close(&self) -> Result<(), NodeError> {
        let mut state = lock(&self.state);
        state.closes += 1;
        if state.fail_closes {
            return Err(NodeError::Close("memory node close failure".to_string()));
        }
        Ok(())
    }
}

/// Suspends once before every connect so other tasks interleave with an
/// in-flight connect.
#[cfg(test)]
pub(crate) struct YieldingConnector(pub(crate) MemoryConnector);

#[cfg(test)]
#[async_trait]
impl NodeConnector for YieldingConnector {
    fn backend(&self) -> &'static str {
        self.0.backend()
    }

    async fn connect(&self, scope: CredentialScope) -> Result<Arc<dyn NodeChannel>, NodeError> {
        tokio::task::yield_now().await;
        self.0.connect(scope).await
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
