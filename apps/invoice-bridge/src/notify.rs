use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::dispatch::{HandlerError, InvoiceHandler};
use crate::node::InvoiceCategory;
use crate::settlement::{LedgerEntry, SettlementEvent, SettlementLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MailKind {
    /// Lightning payment arrived.
    PaymentReceived,
    /// Off-chain order placed; payment happens outside the node.
    FiatOrderPlaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderMail {
    pub kind: MailKind,
    pub payment_hash: String,
    pub category: InvoiceCategory,
    pub amount_sats: i64,
    pub memo: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &OrderMail) -> Result<(), MailError>;
}

/// Writes the would-be mail to the log. Used when no transport is wired.
#[derive(Debug, Default)]
pub struct LoggingMailSender;

#[async_trait]
impl MailSender for LoggingMailSender {
    async fn send(&self, mail: &OrderMail) -> Result<(), MailError> {
        info!(
            kind = ?mail.kind,
            payment_hash = %mail.payment_hash,
            category = ?mail.category,
            amount_sats = mail.amount_sats,
            "order confirmation mail"
        );
        Ok(())
    }
}

/// Decides which settlement events deserve an order confirmation mail.
///
/// Paid invoices are confirmed on their first settlement only, except point of
/// sale taps. Fiat orders are confirmed while still unsettled.
#[must_use]
pub fn mail_kind_for(event: &SettlementEvent) -> Option<MailKind> {
    let settled = event.snapshot.settled;
    if settled && event.first_settlement && event.category != InvoiceCategory::PointOfSale {
        return Some(MailKind::PaymentReceived);
    }
    if !settled && event.category == InvoiceCategory::Fiat {
        return Some(MailKind::FiatOrderPlaced);
    }
    None
}

pub struct OrderConfirmationNotifier {
    sender: Arc<dyn MailSender>,
    enabled: bool,
}

impl OrderConfirmationNotifier {
    pub fn new(sender: Arc<dyn MailSender>, enabled: bool) -> Self {
        Self { sender, enabled }
    }
}

#[async_trait]
impl InvoiceHandler for OrderConfirmationNotifier {
    fn name(&self) -> &'static str {
        "order_confirmation_mail"
    }

    async fn handle_invoice_updated(
        &self,
        identity_hex: &str,
        event: &SettlementEvent,
    ) -> Result<(), HandlerError> {
        if !self.enabled {
            debug!(payment_hash = %identity_hex, "mail sending disabled");
            return Ok(());
        }
        let Some(kind) = mail_kind_for(event) else {
            return Ok(());
        };
        let mail = OrderMail {
            kind,
            payment_hash: identity_hex.to_string(),
            category: event.category,
            amount_sats: event.snapshot.amount_sats,
            memo: event.snapshot.memo.clone(),
        };
        self.sender
            .send(&mail)
            .await
            .map_err(|error| HandlerError::Failed(error.to_string()))
    }
}

/// Persists settlement state so a restarted process does not announce the
/// same payment twice.
pub struct LedgerRecorder {
    ledger: Arc<dyn SettlementLedger>,
}

impl LedgerRecorder {
    pub fn new(ledger: Arc<dyn SettlementLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl InvoiceHandler for LedgerRecorder {
    fn name(&self) -> &'static str {
        "ledger_recorder"
    }

    async fn handle_invoice_updated(
        &self,
        _identity_hex: &str,
        event: &SettlementEvent,
    ) -> Result<(), HandlerError> {
        self.ledger
            .record(
                event.snapshot.payment_hash,
                LedgerEntry {
                    settled: event.snapshot.settled,
                    category: event.category,
                },
            )
            .await
            .map_err(|error| HandlerError::Failed(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{
        LedgerRecorder, MailError, MailKind, MailSender, OrderConfirmationNotifier, OrderMail,
        mail_kind_for,
    };
    use crate::dispatch::InvoiceHandler;
    use crate::node::{InvoiceCategory, InvoiceSnapshot, PaymentHash};
    use crate::settlement::{
        InMemoryLedger, LedgerEntry, LedgerError, SettlementEvent, SettlementLedger,
    };

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<OrderMail>>,
    }

    #[async_trait]
    impl MailSender for Outbox {
        async fn send(&self, mail: &OrderMail) -> Result<(), MailError> {
            self.sent.lock().expect("outbox lock").push(mail.clone());
            Ok(())
        }
    }

    fn event(settled: bool, first: bool, category: InvoiceCategory) -> SettlementEvent {
        SettlementEvent {
            snapshot: InvoiceSnapshot::new(PaymentHash::new([4; 32]), settled, 1_000),
            category,
            first_settlement: first,
        }
    }

    #[test]
    fn decision_table() {
        use InvoiceCategory::{Donation, Fiat, PointOfSale, Standard};

        assert_eq!(mail_kind_for(&event(true, true, Standard)), Some(MailKind::PaymentReceived));
        assert_eq!(mail_kind_for(&event(true, true, Donation)), Some(MailKind::PaymentReceived));
        assert_eq!(mail_kind_for(&event(true, false, Standard)), None);
        assert_eq!(mail_kind_for(&event(true, true, PointOfSale)), None);
        assert_eq!(mail_kind_for(&event(false, false, Standard)), None);
        assert_eq!(mail_kind_for(&event(false, false, Fiat)), Some(MailKind::FiatOrderPlaced));
    }

    #[tokio::test]
    async fn disabled_notifier_sends_nothing() {
        let outbox = Arc::new(Outbox::default());
        let notifier = OrderConfirmationNotifier::new(outbox.clone(), false);
        let event = event(true, true, InvoiceCategory::Standard);
        notifier
            .handle_invoice_updated(&event.identity_hex(), &event)
            .await
            .expect("handled");
        assert!(outbox.sent.lock().expect("outbox lock").is_empty());
    }

    #[tokio::test]
    async fn enabled_notifier_sends_first_settlement() {
        let outbox = Arc::new(Outbox::default());
        let notifier = OrderConfirmationNotifier::new(outbox.clone(), true);
        for first in [true, false] {
            let event = event(true, first, InvoiceCategory::Standard);
            notifier
                .handle_invoice_updated(&event.identity_hex(), &event)
                .await
                .expect("handled");
        }
        let sent = outbox.sent.lock().expect("outbox lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MailKind::PaymentReceived);
        assert_eq!(sent[0].payment_hash, PaymentHash::new([4; 32]).to_hex());
    }

    #[tokio::test]
    async fn recorder_persists_settled_state() {
        let ledger = Arc::new(InMemoryLedger::new());
        let recorder = LedgerRecorder::new(ledger.clone());
        let event = event(true, true, InvoiceCategory::Donation);
        recorder
            .handle_invoice_updated(&event.identity_hex(), &event)
            .await
            .expect("recorded");

        let entry = ledger
            .lookup(&PaymentHash::new([4; 32]))
            .await
            .expect("lookup")
            .expect("entry");
        assert!(entry.settled);
        assert_eq!(entry.category, InvoiceCategory::Donation);
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl SettlementLedger for ReadOnlyStore {
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
            Err(LedgerError::Unavailable("store is read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn recorder_surfaces_store_failures() {
        let recorder = LedgerRecorder::new(Arc::new(ReadOnlyStore));
        let event = event(true, true, InvoiceCategory::Standard);
        let error = recorder
            .handle_invoice_updated(&event.identity_hex(), &event)
            .await
            .expect_err("store rejects writes");
        assert!(error.to_string().contains("store is read-only"));
    }
}
