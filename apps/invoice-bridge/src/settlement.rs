use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::node::{InvoiceCategory, InvoiceSnapshot, PaymentHash};

/// A node notification after deduplication. Raised for every notification;
/// `first_settlement` is true exactly once per invoice that became paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub snapshot: InvoiceSnapshot,
    pub category: InvoiceCategory,
    pub first_settlement: bool,
}

impl SettlementEvent {
    #[must_use]
    pub fn identity_hex(&self) -> String {
        self.snapshot.payment_hash.to_hex()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// What the persisted invoice record knows about an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub settled: bool,
    pub category: InvoiceCategory,
}

/// Persisted invoice state. A settled entry here suppresses the
/// first-settlement flag even when the deduplicator's own markers were lost,
/// e.g. after a restart.
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn lookup(&self, payment_hash: &PaymentHash) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Stores the latest known state, replacing any earlier entry.
    async fn record(&self, payment_hash: PaymentHash, entry: LedgerEntry)
    -> Result<(), LedgerError>;
}

/// Ledger that knows nothing; every invoice looks new.
#[derive(Debug, Default)]
pub struct NoopLedger;

#[async_trait]
impl SettlementLedger for NoopLedger {
    async fn lookup(
        &self,
        _payment_hash: &PaymentHash,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(None)
    }

    async fn record(
        &self,
        _payment_hash: PaymentHash,
        _entry: LedgerEntry,
    ) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<PaymentHash, LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_settled(&self, payment_hash: &PaymentHash) {
        if let Some(entry) = self.entries.lock().await.get_mut(payment_hash) {
            entry.settled = true;
        }
    }
}

#[async_trait]
impl SettlementLedger for InMemoryLedger {
    async fn lookup(&self, payment_hash: &PaymentHash) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.lock().await.get(payment_hash).copied())
    }

    async fn record(
        &self,
        payment_hash: PaymentHash,
        entry: LedgerEntry,
    ) -> Result<(), LedgerError> {
        self.entries.lock().await.insert(payment_hash, entry);
        Ok(())
    }
}

/// Bounded set of invoices already announced as settled. Oldest markers are
/// evicted first; an evicted invoice falls back to the ledger.
struct SettledMarkers {
    capacity: usize,
    members: HashSet<PaymentHash>,
    order: VecDeque<PaymentHash>,
}

impl SettledMarkers {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the marker was already present.
    fn insert(&mut self, payment_hash: PaymentHash) -> bool {
        if !self.members.insert(payment_hash) {
            return false;
        }
        self.order.push_back(payment_hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Turns raw, possibly redelivered node notifications into settlement events
/// that flag the first false-to-true settle transition exactly once.
pub struct SettlementDeduplicator {
    ledger: Arc<dyn SettlementLedger>,
    markers: Mutex<SettledMarkers>,
}

impl SettlementDeduplicator {
    pub fn new(ledger: Arc<dyn SettlementLedger>, marker_capacity: usize) -> Self {
        Self {
            ledger,
            markers: Mutex::new(SettledMarkers::new(marker_capacity)),
        }
    }

    pub async fn observe(&self, snapshot: InvoiceSnapshot) -> SettlementEvent {
        let payment_hash = snapshot.payment_hash;
        let ledger_entry = self.lookup_ledger(&payment_hash).await;

        let category = snapshot
            .category
            .or(ledger_entry.map(|entry| entry.category))
            .unwrap_or_default();

        if !snapshot.settled {
            debug!(payment_hash = %payment_hash, "invoice update without settlement");
            return SettlementEvent {
                snapshot,
                category,
                first_settlement: false,
            };
        }

        let already_settled = ledger_entry.is_some_and(|entry| entry.settled);
        let newly_marked = self.markers.lock().await.insert(payment_hash);
        let first_settlement = newly_marked && !already_settled;
        if first_settlement {
            info!(
                payment_hash = %payment_hash,
                amount_sats = snapshot.amount_sats,
                "invoice settled for the first time"
            );
        } else {
            debug!(payment_hash = %payment_hash, "settled invoice redelivered");
        }

        SettlementEvent {
            snapshot,
            category,
            first_settlement,
        }
    }

    /// Number of invoices currently remembered as settled.
    pub async fn tracked(&self) -> usize {
        self.markers.lock().await.len()
    }

    async fn lookup_ledger(&self, payment_hash: &PaymentHash) -> Option<LedgerEntry> {
        match self.ledger.lookup(payment_hash).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    payment_hash = %payment_hash,
                    error = %error,
                    "settlement ledger lookup failed, treating invoice as unknown"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{
        InMemoryLedger, LedgerEntry, LedgerError, NoopLedger, SettlementDeduplicator,
        SettlementLedger,
    };
    use crate::node::{InvoiceCategory, InvoiceSnapshot, PaymentHash};

    fn hash(byte: u8) -> PaymentHash {
        PaymentHash::new([byte; 32])
    }

    fn deduplicator() -> SettlementDeduplicator {
        SettlementDeduplicator::new(Arc::new(NoopLedger), 16)
    }

    #[tokio::test]
    async fn settle_transition_is_flagged_once() {
        let dedup = deduplicator();
        let open = dedup.observe(InvoiceSnapshot::new(hash(1), false, 100)).await;
        assert!(!open.first_settlement);

        let settled = dedup.observe(InvoiceSnapshot::new(hash(1), true, 100)).await;
        assert!(settled.first_settlement);

        let redelivered = dedup.observe(InvoiceSnapshot::new(hash(1), true, 100)).await;
        assert!(!redelivered.first_settlement);
        assert_eq!(dedup.tracked().await, 1);
    }

    #[tokio::test]
    async fn unsettled_updates_are_not_tracked() {
        let dedup = deduplicator();
        for _ in 0..3 {
            dedup.observe(InvoiceSnapshot::new(hash(2), false, 5)).await;
        }
        assert_eq!(dedup.tracked().await, 0);
    }

    #[tokio::test]
    async fn ledger_settled_state_suppresses_first_flag_after_restart() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .record(
                hash(3),
                LedgerEntry {
                    settled: true,
                    category: InvoiceCategory::Donation,
                },
            )
            .await
            .expect("record");
        let dedup = SettlementDeduplicator::new(ledger, 16);

        let event = dedup.observe(InvoiceSnapshot::new(hash(3), true, 10)).await;
        assert!(!event.first_settlement);
        assert_eq!(event.category, InvoiceCategory::Donation);
    }

    #[tokio::test]
    async fn ledger_category_is_used_when_snapshot_has_none() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .record(
                hash(4),
                LedgerEntry {
                    settled: false,
                    category: InvoiceCategory::PointOfSale,
                },
            )
            .await
            .expect("record");
        let dedup = SettlementDeduplicator::new(ledger, 16);

        let event = dedup.observe(InvoiceSnapshot::new(hash(4), true, 10)).await;
        assert!(event.first_settlement);
        assert_eq!(event.category, InvoiceCategory::PointOfSale);

        let tagged = dedup
            .observe(InvoiceSnapshot::new(hash(5), false, 10).with_category(InvoiceCategory::Fiat))
            .await;
        assert_eq!(tagged.category, InvoiceCategory::Fiat);
    }

    #[tokio::test]
    async fn evicted_markers_fall_back_to_the_ledger() {
        let ledger = Arc::new(InMemoryLedger::new());
        let dedup = SettlementDeduplicator::new(ledger.clone(), 1);
        for byte in [6, 7] {
            ledger
                .record(
                    hash(byte),
                    LedgerEntry {
                        settled: false,
                        category: InvoiceCategory::Standard,
                    },
                )
                .await
                .expect("record");
        }

        assert!(dedup.observe(InvoiceSnapshot::new(hash(6), true, 1)).await.first_settlement);
        ledger.mark_settled(&hash(6)).await;
        assert!(dedup.observe(InvoiceSnapshot::new(hash(7), true, 1)).await.first_settlement);
        assert_eq!(dedup.tracked().await, 1);

        // hash(6) was evicted from memory, the ledger now reports it settled.
        assert!(!dedup.observe(InvoiceSnapshot::new(hash(6), true, 1)).await.first_settlement);
    }

    struct FailingLedger;

    #[async_trait]
    impl SettlementLedger for FailingLedger {
        async fn lookup(
            &self,
            _payment_hash: &PaymentHash,
        ) -> Result<Option<LedgerEntry>, LedgerError> {
            Err(LedgerError::Unavailable("db down".to_string()))
        }

        async fn record(
            &self,
            _payment_hash: PaymentHash,
            _entry: LedgerEntry,
        ) -> Result<(), LedgerError> {
            Err(LedgerError::Unavailable("db down".to_string()))
        }
    }

    #[tokio::test]
    async fn ledger_failure_treats_invoice_as_unknown() {
        let dedup = SettlementDeduplicator::new(Arc::new(FailingLedger), 16);
        let event = dedup.observe(InvoiceSnapshot::new(hash(8), true, 1)).await;
        assert!(event.first_settlement);
        assert_eq!(event.category, InvoiceCategory::Standard);
        assert!(!dedup.observe(InvoiceSnapshot::new(hash(8), true, 1)).await.first_settlement);
    }
}
