#![forbid(unsafe_code)]

//! Keeps a long-lived connection to a Lightning node healthy for an
//! invoice-issuing service: lazily cached per-scope channels, one retry after
//! reconnect for queries, a self-healing invoice subscription, and
//! exactly-once first-settlement detection for downstream handlers.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod lnd;
pub mod memory;
pub mod node;
pub mod notify;
pub mod query;
pub mod service;
pub mod settlement;
pub mod supervisor;

pub use channels::{ChannelFactory, ChannelHandle};
pub use config::{Config, ConfigError, NodeBackend};
pub use dispatch::{DispatchReport, HandlerError, InvoiceEventDispatcher, InvoiceHandler};
pub use node::{
    CredentialScope, InvoiceCategory, InvoiceSnapshot, NodeChannel, NodeConnector, NodeError,
    PaymentHash, StatusCode,
};
pub use query::NodeQueryClient;
pub use service::{InvoiceService, SupervisorHandle, connector_from_config};
pub use settlement::{SettlementDeduplicator, SettlementEvent, SettlementLedger};
pub use supervisor::{BackoffPolicy, SubscriptionSupervisor, SupervisorSnapshot, SupervisorState};
