//! Local request handlers
//!
//! A gateway answers a small set of actions itself; everything else is
//! relayed by the dispatcher and never reaches this module.

use chrono::{DateTime, Utc};
use ocpp_mesh_core::{Action, ActionRegistry, ErrorCode, IncomingRequest, NetworkingNodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Heartbeat request (empty payload)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

pub struct Heartbeat;

impl Action for Heartbeat {
    const NAME: &'static str = "Heartbeat";
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub struct DataTransfer;

impl Action for DataTransfer {
    const NAME: &'static str = "DataTransfer";
    type Request = DataTransferRequest;
    type Response = DataTransferResponse;
}

/// Vendor id this node answers DataTransfer for
pub const VENDOR_ID: &str = "org.openchargealliance.mesh";

/// Actions answered locally
pub fn registry() -> ActionRegistry {
    ActionRegistry::new().with::<Heartbeat>().with::<DataTransfer>()
}

/// Answer a DataTransfer: echo for our vendor id, refuse others
pub fn data_transfer(request: &DataTransferRequest) -> DataTransferResponse {
    if request.vendor_id != VENDOR_ID {
        return DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
        };
    }
    match request.message_id.as_deref() {
        None | Some("echo") => DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: request.data.clone(),
        },
        Some(_) => DataTransferResponse {
            status: DataTransferStatus::UnknownMessageId,
            data: None,
        },
    }
}

/// Serve requests addressed to this node until the dispatcher goes away
pub async fn serve(local: NetworkingNodeId, mut incoming: mpsc::Receiver<IncomingRequest>) {
    while let Some(request) = incoming.recv().await {
        let IncomingRequest {
            message_id,
            action,
            origin,
            request,
            responder,
        } = request;
        debug!("Handling {} {} from {:?}", action, message_id, origin);

        let sent = if request.is::<Heartbeat>() {
            let response = HeartbeatResponse {
                current_time: Utc::now(),
            };
            responder.respond_typed::<Heartbeat>(&response).await
        } else if let Some(transfer) = request.downcast_ref::<DataTransfer>() {
            let response = data_transfer(transfer);
            info!("DataTransfer from {:?}: {:?}", origin, response.status);
            responder.respond_typed::<DataTransfer>(&response).await
        } else {
            responder
                .respond_error(
                    ErrorCode::NotImplemented,
                    format!("Action {} not supported by {}", action, local),
                    Value::Object(Default::default()),
                )
                .await
        };

        if let Err(e) = sent {
            warn!("Could not answer {}: {}", message_id, e);
        }
    }
    debug!("Local handler for {} stopped", local);
}
