use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::settlement::SettlementEvent;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Downstream consumer of invoice updates (mail notifier, persistence, ...).
#[async_trait]
pub trait InvoiceHandler: Send + Sync {
    fn name(&self) -> &'static str {
        "unnamed"
    }

    async fn handle_invoice_updated(
        &self,
        identity_hex: &str,
        event: &SettlementEvent,
    ) -> Result<(), HandlerError>;
}

/// Outcome of one dispatch, mostly for tests and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans settlement events out to every registered handler, one after the
/// other, on the delivering task. A failing or panicking handler does not
/// stop the others.
#[derive(Default)]
pub struct InvoiceEventDispatcher {
    handlers: RwLock<Vec<Arc<dyn InvoiceHandler>>>,
}

impl InvoiceEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` unless this exact instance is already registered.
    /// Returns whether it was added.
    pub async fn register(&self, handler: Arc<dyn InvoiceHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        if handlers
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &handler))
        {
            debug!(handler = handler.name(), "handler already registered");
            return false;
        }
        debug!(handler = handler.name(), "registered invoice handler");
        handlers.push(handler);
        true
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn dispatch(&self, event: &SettlementEvent) -> DispatchReport {
        // Snapshot the set so a handler cannot deadlock by registering.
        let handlers = self.handlers.read().await.clone();
        let identity_hex = event.identity_hex();
        let mut report = DispatchReport::default();

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle_invoice_updated(&identity_hex, event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(handler_error)) => {
                    report.failed += 1;
                    error!(
                        handler = handler.name(),
                        payment_hash = %identity_hex,
                        error = %handler_error,
                        "invoice handler failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    error!(
                        handler = handler.name(),
                        payment_hash = %identity_hex,
                        "invoice handler panicked"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{HandlerError, InvoiceEventDispatcher, InvoiceHandler};
    use crate::node::{InvoiceCategory, InvoiceSnapshot, PaymentHash};
    use crate::settlement::SettlementEvent;

    #[derive(Default)]
    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl InvoiceHandler for Counting {
        async fn handle_invoice_updated(
            &self,
            identity_hex: &str,
            event: &SettlementEvent,
        ) -> Result<(), HandlerError> {
            assert_eq!(identity_hex, event.snapshot.payment_hash.to_hex());
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl InvoiceHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle_invoice_updated(
            &self,
            _identity_hex: &str,
            _event: &SettlementEvent,
        ) -> Result<(), HandlerError> {
            Err(HandlerError::Failed("smtp down".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl InvoiceHandler for Panicking {
        async fn handle_invoice_updated(
            &self,
            _identity_hex: &str,
            _event: &SettlementEvent,
        ) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    fn event() -> SettlementEvent {
        SettlementEvent {
            snapshot: InvoiceSnapshot::new(PaymentHash::new([9; 32]), true, 50),
            category: InvoiceCategory::Standard,
            first_settlement: true,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_no_op() {
        let dispatcher = InvoiceEventDispatcher::new();
        let handler = Arc::new(Counting::default());
        assert!(dispatcher.register(handler.clone()).await);
        assert!(!dispatcher.register(handler.clone()).await);
        assert!(dispatcher.register(Arc::new(Counting::default())).await);
        assert_eq!(dispatcher.handler_count().await, 2);

        let report = dispatcher.dispatch(&event()).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_block_others() {
        let dispatcher = InvoiceEventDispatcher::new();
        let counting = Arc::new(Counting::default());
        dispatcher.register(Arc::new(Failing)).await;
        dispatcher.register(Arc::new(Panicking)).await;
        dispatcher.register(counting.clone()).await;

        let report = dispatcher.dispatch(&event()).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_without_handlers_is_empty() {
        let dispatcher = InvoiceEventDispatcher::new();
        let report = dispatcher.dispatch(&event()).await;
        assert_eq!(report, super::DispatchReport::default());
    }
}
