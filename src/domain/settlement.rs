use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ConditionalTransfer;

/// Quote request for converting `amount` of one asset into another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub from_currency: String,
    pub to_currency: String,
    pub from_network: String,
    pub to_network: String,
    pub amount: Decimal,
}

impl From<&ConditionalTransfer> for QuoteRequest {
    fn from(transfer: &ConditionalTransfer) -> Self {
        Self {
            from_currency: transfer.from_currency.clone(),
            to_currency: transfer.to_currency.clone(),
            from_network: transfer.from_network.clone(),
            to_network: transfer.to_network.clone(),
            amount: transfer.amount,
        }
    }
}

/// Live rate plus the id that settles at that rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub quote_id: String,
    pub source_account: String,
    pub destination_account: String,
}

/// Settlement receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub transaction_id: String,
    pub status: Option<String>,
}
