use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::ConditionalTransfer;

/// Why a trigger was published. The processor evaluates the order for every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerAction {
    #[serde(alias = "created")]
    Created,
    /// Re-published by the pending sweeper
    #[serde(alias = "sweep")]
    Sweep,
    #[serde(alias = "expired")]
    Expired,
    #[serde(alias = "placed")]
    Placed,
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerAction::Created => "CREATED",
            TriggerAction::Sweep => "SWEEP",
            TriggerAction::Expired => "EXPIRED",
            TriggerAction::Placed => "PLACED",
        };
        write!(f, "{}", s)
    }
}

/// Order reference carried inside a trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRef {
    pub order_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// "Evaluate this order" message carried by the trigger channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPayload {
    pub transfer_id: TransferRef,
    pub published_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub action: TriggerAction,
    pub user_id: i64,
}

impl TriggerPayload {
    pub fn for_transfer(transfer: &ConditionalTransfer, action: TriggerAction) -> Self {
        Self {
            transfer_id: TransferRef {
                order_id: transfer.order_id,
                expires_at: transfer.expires_at,
            },
            published_at: Utc::now(),
            idempotency_key: transfer.idempotency_key.clone(),
            action,
            user_id: transfer.user_id,
        }
    }

    pub fn order_id(&self) -> Uuid {
        self.transfer_id.order_id
    }
}
