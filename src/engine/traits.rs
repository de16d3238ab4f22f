use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ApiCredentials, ConditionalTransfer, Conversion, ConversionRequest, Quote, QuoteRequest,
    TransferStatus, TriggerPayload, User,
};
use crate::error::{Result, SettlementError};

/// Result of an idempotent insert
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ConditionalTransfer),
    /// A row with the same idempotency key exists inside the window
    Existing(ConditionalTransfer),
}

/// Keyset position inside the PENDING listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCursor {
    pub created_at: DateTime<Utc>,
    pub order_id: Uuid,
}

impl From<&ConditionalTransfer> for PendingCursor {
    fn from(transfer: &ConditionalTransfer) -> Self {
        Self {
            created_at: transfer.created_at,
            order_id: transfer.order_id,
        }
    }
}

/// Result of a conditional status write
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The row was still PENDING and now carries the new status
    Applied(ConditionalTransfer),
    /// Someone else moved the row out of PENDING first
    Superseded(TransferStatus),
    Missing,
}

/// Durable record of conditional transfers
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Most recent order with this key created strictly after `created_after`
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<ConditionalTransfer>>;

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<ConditionalTransfer>>;

    /// Lookup scoped to the owning user
    async fn find_for_user(
        &self,
        user_id: i64,
        order_id: Uuid,
    ) -> Result<Option<ConditionalTransfer>>;

    /// Newest first
    async fn list_by_user(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConditionalTransfer>>;

    /// PENDING orders ordered by `(created_at, order_id)`, starting strictly after `after`
    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: u32,
    ) -> Result<Vec<ConditionalTransfer>>;

    /// Insert `transfer` unless an order with its idempotency key was created after
    /// `window_start`. The check and the insert are atomic.
    async fn create(
        &self,
        transfer: &ConditionalTransfer,
        window_start: DateTime<Utc>,
    ) -> Result<CreateOutcome>;

    /// Move a PENDING order to `to`. Never overwrites a non-PENDING row.
    async fn transition(
        &self,
        order_id: Uuid,
        to: TransferStatus,
        transaction_id: Option<&str>,
    ) -> Result<TransitionOutcome>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, user_id: i64) -> Result<Option<User>>;
}

/// Shared key-value store used for per-order locks and short-lived value caches
#[async_trait]
pub trait CoordinationCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Atomic set-if-absent with TTL. Returns false if the key already exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Atomic compare-and-delete. Returns false if the key is gone or holds another value.
    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Publishing side of the trigger channel
#[async_trait]
pub trait TriggerPublisher: Send + Sync {
    /// Returns the channel-assigned message id
    async fn publish(&self, payload: &TriggerPayload) -> Result<String>;
}

/// One at-least-once delivery of a raw trigger message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub body: String,
    /// 1 on first delivery
    pub attempt: u32,
}

/// Consuming side of the trigger channel. Every delivery gets exactly one of ack/nack.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Leave the delivery for redelivery
    async fn nack(&self, delivery: &Delivery) -> Result<()>;
}

/// Typed trigger handler. `true` means fully resolved (ack), `false` means redeliver (nack).
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, payload: &TriggerPayload) -> bool;
}

/// External quote/conversion service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn get_quote(
        &self,
        request: &QuoteRequest,
        credentials: &ApiCredentials,
    ) -> std::result::Result<Quote, SettlementError>;

    async fn create_conversion(
        &self,
        request: &ConversionRequest,
        credentials: &ApiCredentials,
    ) -> std::result::Result<Conversion, SettlementError>;
}
