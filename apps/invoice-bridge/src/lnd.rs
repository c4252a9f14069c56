use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tonic_lnd::lnrpc;
use tonic_lnd::tonic::{Code, Status};

use crate::config::Config;
use crate::node::{
    ChannelFilter, ChannelSummary, CreatedInvoice, CredentialScope, InvoiceRequest,
    InvoiceSnapshot, InvoiceUpdates, NodeChannel, NodeConnector, NodeError, NodeInfo, PaymentHash,
    PeerInfo, StatusCode,
};

/// Connects to LND over gRPC. Every connect re-reads the trust anchor and the
/// scope's macaroon, so rotated credentials are picked up on reconnect.
pub struct LndConnector {
    config: Config,
}

impl LndConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeConnector for LndConnector {
    fn backend(&self) -> &'static str {
        "lnd"
    }

    async fn connect(&self, scope: CredentialScope) -> Result<Arc<dyn NodeChannel>, NodeError> {
        let endpoint = self.config.endpoint(scope);
        let client = tonic_lnd::connect(
            endpoint.address(),
            self.config.cert_path.clone(),
            endpoint.macaroon_path.clone(),
        )
        .await
        .map_err(|error| NodeError::Connect(format!("{scope} channel: {error}")))?;
        Ok(Arc::new(LndChannel {
            client: Mutex::new(Some(client)),
        }))
    }
}

struct LndChannel {
    client: Mutex<Option<tonic_lnd::Client>>,
}

impl LndChannel {
    /// Clones the generated client out of the slot so calls do not serialize
    /// on the mutex.
    async fn lightning(&self) -> Result<tonic_lnd::LightningClient, NodeError> {
        let mut client = self.client.lock().await;
        match client.as_mut() {
            Some(client) => Ok(client.lightning().clone()),
            None => Err(NodeError::Connect("channel already closed".to_string())),
        }
    }
}

#[async_trait]
impl NodeChannel for LndChannel {
    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        let response = self
            .lightning()
            .await?
            .get_info(lnrpc::GetInfoRequest {})
            .await
            .map_err(status_error)?
            .into_inner();
        Ok(NodeInfo {
            identity_pubkey: response.identity_pubkey,
            alias: response.alias,
            version: response.version,
            block_height: response.block_height,
            synced_to_chain: response.synced_to_chain,
            num_active_channels: response.num_active_channels,
            num_peers: response.num_peers,
        })
    }

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<ChannelSummary>, NodeError> {
        let request = lnrpc::ListChannelsRequest {
            active_only: filter.active_only,
            inactive_only: filter.inactive_only,
            public_only: filter.public_only,
            private_only: filter.private_only,
            ..Default::default()
        };
        let response = self
            .lightning()
            .await?
            .list_channels(request)
            .await
            .map_err(status_error)?
            .into_inner();
        Ok(response
            .channels
            .into_iter()
            .map(|channel| ChannelSummary {
                channel_id: channel.chan_id,
                channel_point: channel.channel_point,
                remote_pubkey: channel.remote_pubkey,
                capacity_sats: channel.capacity,
                local_balance_sats: channel.local_balance,
                remote_balance_sats: channel.remote_balance,
                active: channel.active,
                private: channel.private,
            })
            .collect())
    }

    async fn get_peer_info(&self, pub_key: &str) -> Result<PeerInfo, NodeError> {
        let request = lnrpc::NodeInfoRequest {
            pub_key: pub_key.to_string(),
            include_channels: false,
            ..Default::default()
        };
        let response = self
            .lightning()
            .await?
            .get_node_info(request)
            .await
            .map_err(status_error)?
            .into_inner();
        let node = response
            .node
            .ok_or_else(|| NodeError::Validation("node info response without node".to_string()))?;
        Ok(PeerInfo {
            pub_key: node.pub_key,
            alias: node.alias,
            color: node.color,
            addresses: node.addresses.into_iter().map(|address| address.addr).collect(),
            num_channels: response.num_channels,
            total_capacity_sats: response.total_capacity,
        })
    }

    async fn add_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice, NodeError> {
        let invoice = lnrpc::Invoice {
            memo: request.memo.clone(),
            value: request.amount_sats,
            ..Default::default()
        };
        let response = self
            .lightning()
            .await?
            .add_invoice(invoice)
            .await
            .map_err(status_error)?
            .into_inner();
        Ok(CreatedInvoice {
            payment_hash: PaymentHash::from_slice(&response.r_hash)?,
            payment_request: response.payment_request,
            add_index: response.add_index,
        })
    }

    async fn lookup_invoice(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<InvoiceSnapshot, NodeError> {
        let request = lnrpc::PaymentHash {
            r_hash: payment_hash.as_bytes().to_vec(),
            ..Default::default()
        };
        let invoice = self
            .lightning()
            .await?
            .lookup_invoice(request)
            .await
            .map_err(status_error)?
            .into_inner();
        snapshot_from_invoice(invoice)
    }

    async fn subscribe_invoices(&self) -> Result<InvoiceUpdates, NodeError> {
        let stream = self
            .lightning()
            .await?
            .subscribe_invoices(lnrpc::InvoiceSubscription::default())
            .await
            .map_err(status_error)?
            .into_inner();
        Ok(stream
            .map(|item| item.map_err(status_error).and_then(snapshot_from_invoice))
            .boxed())
    }

    async fn close(&self) -> Result<(), NodeError> {
        // Dropping the client tears down the underlying HTTP/2 connection.
        self.client.lock().await.take();
        Ok(())
    }
}

fn snapshot_from_invoice(invoice: lnrpc::Invoice) -> Result<InvoiceSnapshot, NodeError> {
    let settled = invoice.state == lnrpc::invoice::InvoiceState::Settled as i32;
    Ok(InvoiceSnapshot {
        payment_hash: PaymentHash::from_slice(&invoice.r_hash)?,
        settled,
        amount_sats: invoice.value,
        amount_paid_sats: invoice.amt_paid_sat,
        memo: invoice.memo,
        payment_request: invoice.payment_request,
        category: None,
        created_at: timestamp(invoice.creation_date),
        settled_at: if settled {
            timestamp(invoice.settle_date)
        } else {
            None
        },
        settle_index: invoice.settle_index,
    })
}

fn timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    if seconds <= 0 {
        return None;
    }
    DateTime::from_timestamp(seconds, 0)
}

fn status_error(status: Status) -> NodeError {
    NodeError::status(status_code(status.code()), status.message())
}

fn status_code(code: Code) -> StatusCode {
    match code {
        Code::Cancelled => StatusCode::Cancelled,
        Code::InvalidArgument => StatusCode::InvalidArgument,
        Code::DeadlineExceeded => StatusCode::DeadlineExceeded,
        Code::NotFound => StatusCode::NotFound,
        Code::AlreadyExists => StatusCode::AlreadyExists,
        Code::PermissionDenied => StatusCode::PermissionDenied,
        Code::ResourceExhausted => StatusCode::ResourceExhausted,
        Code::FailedPrecondition => StatusCode::FailedPrecondition,
        Code::Aborted => StatusCode::Aborted,
        Code::OutOfRange => StatusCode::OutOfRange,
        Code::Unimplemented => StatusCode::Unimplemented,
        Code::Internal => StatusCode::Internal,
        Code::Unavailable => StatusCode::Unavailable,
        Code::DataLoss => StatusCode::DataLoss,
        Code::Unauthenticated => StatusCode::Unauthenticated,
        Code::Ok | Code::Unknown => StatusCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use tonic_lnd::lnrpc;
    use tonic_lnd::tonic::{Code, Status};

    use super::{snapshot_from_invoice, status_error};

    #[test]
    fn locked_wallet_status_maps_to_node_locked() {
        let error = status_error(Status::new(
            Code::Unimplemented,
            "unknown service lnrpc.Lightning",
        ));
        assert!(error.is_node_locked());
        assert!(!status_error(Status::new(Code::Unavailable, "down")).is_node_locked());
    }

    #[test]
    fn settled_state_drives_snapshot_flag() {
        let invoice = lnrpc::Invoice {
            r_hash: vec![3; 32],
            value: 2_100,
            amt_paid_sat: 2_100,
            memo: "order".to_string(),
            state: lnrpc::invoice::InvoiceState::Settled as i32,
            creation_date: 1_700_000_000,
            settle_date: 1_700_000_060,
            ..Default::default()
        };
        let snapshot = snapshot_from_invoice(invoice).expect("snapshot");
        assert!(snapshot.settled);
        assert_eq!(snapshot.amount_sats, 2_100);
        assert!(snapshot.settled_at.is_some());
        assert_eq!(snapshot.category, None);

        let open = lnrpc::Invoice {
            r_hash: vec![3; 32],
            state: lnrpc::invoice::InvoiceState::Open as i32,
            ..Default::default()
        };
        assert!(!snapshot_from_invoice(open).expect("snapshot").settled);
    }

    #[test]
    fn malformed_hash_is_a_validation_failure() {
        let invoice = lnrpc::Invoice {
            r_hash: vec![1, 2, 3],
            ..Default::default()
        };
        let error = snapshot_from_invoice(invoice).expect_err("short hash");
        assert_eq!(error.code(), "validation_failed");
    }
}
