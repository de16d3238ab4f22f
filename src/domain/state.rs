use serde::{Deserialize, Serialize};
use std::fmt;

/// Conditional transfer status
///
/// `Pending` is the only non-terminal state. Every other state is final and
/// no transition ever leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    /// Waiting for the rate condition or expiry
    Pending,
    /// Conversion settled, `transaction_id` recorded
    Executed,
    /// Settlement attempt failed
    Failed,
    /// Cancelled by the owning user
    Cancelled,
    /// `expires_at` passed before the condition was met
    Expired,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Executed => "EXECUTED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Cancelled => "CANCELLED",
            TransferStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TransferStatus) -> bool {
        use TransferStatus::*;

        matches!(
            (self, target),
            (Pending, Executed) | (Pending, Failed) | (Pending, Cancelled) | (Pending, Expired)
        )
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<TransferStatus> {
        use TransferStatus::*;

        match self {
            Pending => vec![Executed, Failed, Cancelled, Expired],
            Executed | Failed | Cancelled | Expired => vec![],
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransferStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TransferStatus::Pending),
            "EXECUTED" => Ok(TransferStatus::Executed),
            "FAILED" => Ok(TransferStatus::Failed),
            "CANCELLED" => Ok(TransferStatus::Cancelled),
            "EXPIRED" => Ok(TransferStatus::Expired),
            _ => Err(format!("Unknown transfer status: {}", s)),
        }
    }
}
