use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::channels::ChannelFactory;
use crate::node::{
    ChannelFilter, ChannelSummary, CreatedInvoice, CredentialScope, InvoiceRequest,
    InvoiceSnapshot, NodeChannel, NodeError, NodeInfo, PaymentHash, PeerInfo,
};

/// Request/response access to the node.
///
/// Every operation runs on its scope's cached channel. On failure the channel
/// is torn down, rebuilt, and the operation retried exactly once; a second
/// failure goes back to the caller untouched.
#[derive(Clone)]
pub struct NodeQueryClient {
    channels: Arc<ChannelFactory>,
}

impl NodeQueryClient {
    pub fn new(channels: Arc<ChannelFactory>) -> Self {
        Self { channels }
    }

    pub async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        info!("get_info called");
        self.with_retry(CredentialScope::ReadOnly, "get_info", |channel| {
            Box::pin(async move { channel.get_info().await })
        })
        .await
    }

    /// Lists channels that are both active and publicly announced.
    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>, NodeError> {
        info!("list_channels called");
        self.with_retry(CredentialScope::ReadOnly, "list_channels", |channel| {
            Box::pin(async move { channel.list_channels(ChannelFilter::ACTIVE_PUBLIC).await })
        })
        .await
    }

    pub async fn get_peer_info(&self, pub_key: &str) -> Result<PeerInfo, NodeError> {
        let pub_key = pub_key.trim().to_ascii_lowercase();
        if pub_key.is_empty() {
            return Err(NodeError::InvalidInput("pub_key is required".to_string()));
        }
        info!(pub_key = %pub_key, "get_peer_info called");
        self.with_retry(CredentialScope::ReadOnly, "get_peer_info", |channel| {
            let pub_key = pub_key.clone();
            Box::pin(async move { channel.get_peer_info(&pub_key).await })
        })
        .await
    }

    pub async fn create_invoice(
        &self,
        memo: &str,
        amount_sats: i64,
    ) -> Result<CreatedInvoice, NodeError> {
        if amount_sats < 0 {
            return Err(NodeError::InvalidInput(
                "amount_sats must be >= 0".to_string(),
            ));
        }
        info!(memo = %memo, amount_sats, "create_invoice called");
        let request = InvoiceRequest {
            memo: memo.to_string(),
            amount_sats,
        };
        self.with_retry(CredentialScope::Invoice, "create_invoice", |channel| {
            let request = request.clone();
            Box::pin(async move { channel.add_invoice(&request).await })
        })
        .await
    }

    pub async fn lookup_invoice(&self, payment_hash_hex: &str) -> Result<InvoiceSnapshot, NodeError> {
        info!(payment_hash = %payment_hash_hex, "lookup_invoice called");
        let payment_hash: PaymentHash = payment_hash_hex.parse()?;
        self.with_retry(CredentialScope::Invoice, "lookup_invoice", |channel| {
            Box::pin(async move { channel.lookup_invoice(&payment_hash).await })
        })
        .await
    }

    async fn with_retry<T, F>(
        &self,
        scope: CredentialScope,
        operation: &'static str,
        call: F,
    ) -> Result<T, NodeError>
    where
        F: for<'a> Fn(&'a dyn NodeChannel) -> BoxFuture<'a, Result<T, NodeError>> + Send + Sync,
        T: Send,
    {
        match self.channels.get_channel(scope).await {
            Ok(handle) => match call(handle.channel()).await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    warn!(
                        operation,
                        scope = %scope,
                        channel_id = handle.id(),
                        error = %error,
                        "node call failed, retrying with fresh channel"
                    );
                    self.channels.invalidate(&handle).await;
                }
            },
            // Nothing was cached, so there is nothing stale to tear down. A
            // channel another caller built meanwhile is reused as is.
            Err(error) => warn!(
                operation,
                scope = %scope,
                error = %error,
                "could not obtain node channel, retrying"
            ),
        }

        let handle = self.channels.get_channel(scope).await?;
        call(handle.channel()).await
    }
}
