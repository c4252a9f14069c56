use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

/// Credential boundary a channel is authorized for. Each scope gets its own
/// macaroon and its own independently-lived channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScope {
    ReadOnly,
    Invoice,
    Streaming,
}

impl CredentialScope {
    pub const ALL: [Self; 3] = [Self::ReadOnly, Self::Invoice, Self::Streaming];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Invoice => "invoice",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirror of the gRPC status codes the node can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("node returned {}: {message}", .code.as_str())]
    Status { code: StatusCode, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl NodeError {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect_failed",
            Self::Status { code, .. } => code.as_str(),
            Self::Validation(_) => "validation_failed",
            Self::Close(_) => "close_failed",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Status { message, .. }
            | Self::Connect(message)
            | Self::Validation(message)
            | Self::Close(message)
            | Self::InvalidInput(message) => message.clone(),
        }
    }

    /// A locked LND wallet answers every RPC outside the unlocker service with
    /// `Unimplemented`.
    #[must_use]
    pub fn is_node_locked(&self) -> bool {
        matches!(
            self,
            Self::Status {
                code: StatusCode::Unimplemented,
                ..
            }
        )
    }

    /// Whether a query failing with this error is worth one reconnect-and-retry.
    /// Caller input errors are deterministic and go straight back.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

pub const PAYMENT_HASH_LEN: usize = 32;

/// Fixed-length payment hash identifying exactly one invoice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentHash([u8; PAYMENT_HASH_LEN]);

impl PaymentHash {
    #[must_use]
    pub const fn new(bytes: [u8; PAYMENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeError> {
        let array: [u8; PAYMENT_HASH_LEN] = bytes.try_into().map_err(|_| {
            NodeError::Validation(format!(
                "payment hash must be {PAYMENT_HASH_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAYMENT_HASH_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for PaymentHash {
    type Err = NodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value.trim())
            .map_err(|error| NodeError::InvalidInput(format!("payment hash hex: {error}")))?;
        Self::from_slice(&bytes).map_err(|error| NodeError::InvalidInput(error.message()))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", self.to_hex())
    }
}

impl Serialize for PaymentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PaymentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Business category of an invoice. The node never reports this; it comes
/// from the persisted invoice record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceCategory {
    #[default]
    Standard,
    Donation,
    /// Point-of-sale tap; paid in person, never confirmed by mail.
    PointOfSale,
    /// Off-chain order settled outside the node.
    Fiat,
}

/// Point-in-time view of one invoice as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub payment_hash: PaymentHash,
    pub settled: bool,
    pub amount_sats: i64,
    pub amount_paid_sats: i64,
    pub memo: String,
    pub payment_request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<InvoiceCategory>,
    pub created_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settle_index: u64,
}

impl InvoiceSnapshot {
    /// Minimal snapshot, mostly useful for off-chain records and tests.
    #[must_use]
    pub fn new(payment_hash: PaymentHash, settled: bool, amount_sats: i64) -> Self {
        Self {
            payment_hash,
            settled,
            amount_sats,
            amount_paid_sats: if settled { amount_sats } else { 0 },
            memo: String::new(),
            payment_request: String::new(),
            category: None,
            created_at: None,
            settled_at: None,
            settle_index: 0,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: InvoiceCategory) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub identity_pubkey: String,
    pub alias: String,
    pub version: String,
    pub block_height: u32,
    pub synced_to_chain: bool,
    pub num_active_channels: u32,
    pub num_peers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: u64,
    pub channel_point: String,
    pub remote_pubkey: String,
    pub capacity_sats: i64,
    pub local_balance_sats: i64,
    pub remote_balance_sats: i64,
    pub active: bool,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pub_key: String,
    pub alias: String,
    pub color: String,
    pub addresses: Vec<String>,
    pub num_channels: u32,
    pub total_capacity_sats: i64,
}

/// Channel listing filter. The resilient client always sends
/// [`ChannelFilter::ACTIVE_PUBLIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFilter {
    pub active_only: bool,
    pub inactive_only: bool,
    pub public_only: bool,
    pub private_only: bool,
}

impl ChannelFilter {
    pub const ACTIVE_PUBLIC: Self = Self {
        active_only: true,
        inactive_only: false,
        public_only: true,
        private_only: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub memo: String,
    pub amount_sats: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub payment_hash: PaymentHash,
    pub payment_request: String,
    pub add_index: u64,
}

/// Lazy, unbounded, non-restartable sequence of invoice updates. A clean end
/// of stream is still a failure from the supervisor's point of view.
pub type InvoiceUpdates = Pin<Box<dyn Stream<Item = Result<InvoiceSnapshot, NodeError>> + Send>>;

/// One authenticated connection to the node.
#[async_trait]
pub trait NodeChannel: Send + Sync {
    async fn get_info(&self) -> Result<NodeInfo, NodeError>;

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<ChannelSummary>, NodeError>;

    async fn get_peer_info(&self, pub_key: &str) -> Result<PeerInfo, NodeError>;

    async fn add_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice, NodeError>;

    async fn lookup_invoice(&self, payment_hash: &PaymentHash)
    -> Result<InvoiceSnapshot, NodeError>;

    /// Subscribe to every invoice update, without add/settle index filters.
    async fn subscribe_invoices(&self) -> Result<InvoiceUpdates, NodeError>;

    async fn close(&self) -> Result<(), NodeError>;
}

/// Builds fresh channels for a scope: new credentials, new TLS context.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn connect(&self, scope: CredentialScope) -> Result<Arc<dyn NodeChannel>, NodeError>;
}
