use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::TransferStatus;
use crate::error::{RatewatchError, Result};

/// Which side of the threshold fires the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Execute once the live rate is >= target
    #[serde(rename = "GREATER_EQUAL", alias = ">=")]
    GreaterEqual,
    /// Execute once the live rate is <= target
    #[serde(rename = "LESS_EQUAL", alias = "<=")]
    LessEqual,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::GreaterEqual => "GREATER_EQUAL",
            TransferDirection::LessEqual => "LESS_EQUAL",
        }
    }

    /// Decide whether a live rate satisfies the threshold. Equality always fires.
    pub fn is_triggered(&self, rate: Decimal, target_rate: Decimal) -> bool {
        match self {
            TransferDirection::GreaterEqual => rate >= target_rate,
            TransferDirection::LessEqual => rate <= target_rate,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransferDirection {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.trim().to_uppercase().as_str() {
            "GREATER_EQUAL" | ">=" | "GTE" => Ok(TransferDirection::GreaterEqual),
            "LESS_EQUAL" | "<=" | "LTE" => Ok(TransferDirection::LessEqual),
            _ => Err(format!("Unknown transfer direction: {}", s)),
        }
    }
}

/// A conditional transfer (the order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalTransfer {
    pub order_id: Uuid,
    pub user_id: i64,
    pub from_currency: String,
    pub to_currency: String,
    pub from_network: String,
    pub to_network: String,
    pub amount: Decimal,
    pub target_rate: Decimal,
    pub direction: TransferDirection,
    pub expires_at: DateTime<Utc>,
    pub status: TransferStatus,
    pub idempotency_key: String,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConditionalTransfer {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check the rate condition against a live quote rate
    pub fn should_execute(&self, rate: Decimal) -> bool {
        self.direction.is_triggered(rate, self.target_rate)
    }

    /// Apply a status transition in memory, enforcing the state machine and
    /// the `transaction_id <=> EXECUTED` invariant.
    pub fn apply_transition(
        &mut self,
        to: TransferStatus,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(RatewatchError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if (to == TransferStatus::Executed) != transaction_id.is_some() {
            return Err(RatewatchError::Validation(format!(
                "transaction_id must be set iff status is EXECUTED (got {} with {:?})",
                to, transaction_id
            )));
        }

        self.status = to;
        self.transaction_id = transaction_id;
        self.updated_at = now;
        Ok(())
    }
}

/// Everything the caller supplies to create an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransfer {
    pub user_id: i64,
    pub from_currency: String,
    pub to_currency: String,
    pub from_network: String,
    pub to_network: String,
    pub amount: Decimal,
    pub target_rate: Decimal,
    pub direction: TransferDirection,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl NewTransfer {
    /// Validate field constraints before anything is persisted
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let mut errors = Vec::new();

        check_len(&mut errors, "from_currency", &self.from_currency, 3, 10);
        check_len(&mut errors, "to_currency", &self.to_currency, 3, 10);
        check_len(&mut errors, "from_network", &self.from_network, 2, 50);
        check_len(&mut errors, "to_network", &self.to_network, 2, 50);
        check_len(&mut errors, "idempotency_key", &self.idempotency_key, 10, 255);

        if self.amount <= Decimal::ZERO {
            errors.push("amount must be positive".to_string());
        }
        if self.target_rate <= Decimal::ZERO {
            errors.push("target_rate must be positive".to_string());
        }
        if self.expires_at <= now {
            errors.push("expires_at must be in the future".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RatewatchError::Validation(errors.join("; ")))
        }
    }

    /// Materialize a fresh PENDING order with a new id
    pub fn into_transfer(self, now: DateTime<Utc>) -> ConditionalTransfer {
        ConditionalTransfer {
            order_id: Uuid::new_v4(),
            user_id: self.user_id,
            from_currency: self.from_currency,
            to_currency: self.to_currency,
            from_network: self.from_network,
            to_network: self.to_network,
            amount: self.amount,
            target_rate: self.target_rate,
            direction: self.direction,
            expires_at: self.expires_at,
            status: TransferStatus::Pending,
            idempotency_key: self.idempotency_key,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn check_len(errors: &mut Vec<String>, field: &str, value: &str, min: usize, max: usize) {
    let len = value.trim().chars().count();
    if len < min || len > max {
        errors.push(format!("{field} must be {min}-{max} characters (got {len})"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn new_transfer() -> NewTransfer {
        NewTransfer {
            user_id: 7,
            from_currency: "USDC".to_string(),
            to_currency: "EURC".to_string(),
            from_network: "ethereum".to_string(),
            to_network: "ethereum".to_string(),
            amount: dec!(100),
            target_rate: dec!(1.5),
            direction: TransferDirection::GreaterEqual,
            expires_at: Utc::now() + Duration::hours(1),
            idempotency_key: "client-key-0001".to_string(),
        }
    }

    #[test]
    fn test_direction_equal_rate_triggers() {
        assert!(TransferDirection::GreaterEqual.is_triggered(dec!(1.5), dec!(1.5)));
        assert!(TransferDirection::LessEqual.is_triggered(dec!(1.5), dec!(1.5)));
    }

    #[test]
    fn test_direction_wrong_side_never_triggers() {
        assert!(TransferDirection::GreaterEqual.is_triggered(dec!(1.6), dec!(1.5)));
        assert!(!TransferDirection::GreaterEqual.is_triggered(dec!(1.4999), dec!(1.5)));
        assert!(TransferDirection::LessEqual.is_triggered(dec!(1.4), dec!(1.5)));
        assert!(!TransferDirection::LessEqual.is_triggered(dec!(1.5001), dec!(1.5)));
    }

    #[test]
    fn test_direction_accepts_operator_aliases() {
        let parsed: TransferDirection = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(parsed, TransferDirection::GreaterEqual);
        assert_eq!(
            TransferDirection::try_from("<=").unwrap(),
            TransferDirection::LessEqual
        );
        assert_eq!(
            serde_json::to_string(&TransferDirection::LessEqual).unwrap(),
            "\"LESS_EQUAL\""
        );
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut request = new_transfer();
        request.from_currency = "US".to_string();
        request.to_network = "x".to_string();
        request.amount = Decimal::ZERO;
        request.idempotency_key = "short".to_string();

        let err = request.validate(Utc::now()).unwrap_err().to_string();
        assert!(err.contains("from_currency"));
        assert!(err.contains("to_network"));
        assert!(err.contains("amount"));
        assert!(err.contains("idempotency_key"));
        assert!(new_transfer().validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_expiry_is_strictly_after() {
        let now = Utc::now();
        let mut transfer = new_transfer().into_transfer(now);
        transfer.expires_at = now;
        assert!(!transfer.is_expired_at(now));
        assert!(transfer.is_expired_at(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_apply_transition_enforces_invariants() {
        let now = Utc::now();
        let mut transfer = new_transfer().into_transfer(now);
        assert_eq!(transfer.status, TransferStatus::Pending);

        // EXECUTED requires a transaction id
        assert!(transfer
            .apply_transition(TransferStatus::Executed, None, now)
            .is_err());
        // ...and nothing else may carry one
        assert!(transfer
            .apply_transition(TransferStatus::Failed, Some("tx".to_string()), now)
            .is_err());

        transfer
            .apply_transition(TransferStatus::Executed, Some("tx-1".to_string()), now)
            .unwrap();
        assert_eq!(transfer.transaction_id.as_deref(), Some("tx-1"));

        let err = transfer
            .apply_transition(TransferStatus::Cancelled, None, now)
            .unwrap_err();
        assert!(matches!(err, RatewatchError::InvalidStateTransition { .. }));
    }
}
