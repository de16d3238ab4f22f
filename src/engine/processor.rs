//! Execution processor: evaluates one order per trigger delivery.
//!
//! Every evaluation runs under the per-order lock, and the lock is released on
//! every exit path once it has been acquired. Status writes are conditional on
//! the row still being PENDING, so a cancellation that lands first always wins.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cache::{keys, CacheExt, OrderLock};
use super::traits::{
    CoordinationCache, OrderStore, SettlementApi, TransitionOutcome, TriggerHandler, UserStore,
};
use crate::adapters::settlement::RetryPolicy;
use crate::config::EngineConfig;
use crate::domain::{
    ConditionalTransfer, ConversionRequest, Quote, QuoteRequest, TransferStatus, TriggerPayload,
    User,
};
use crate::error::{RatewatchError, Result};

/// What one evaluation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Another processor holds the lock; nothing was read or written
    LockContended,
    NotFound,
    AlreadyTerminal(TransferStatus),
    Expired,
    UserMissing,
    /// Order stays PENDING
    ConditionNotMet { rate: Decimal },
    Executed { transaction_id: String },
    Failed { reason: String },
    /// A concurrent writer (cancellation) moved the order first
    Superseded(TransferStatus),
    /// Infrastructure error; order left untouched for redelivery
    Deferred { reason: String },
}

impl Outcome {
    /// Whether the trigger is fully handled (ack) or should be redelivered (nack)
    pub fn is_resolved(&self) -> bool {
        match self {
            Outcome::NotFound
            | Outcome::AlreadyTerminal(_)
            | Outcome::Expired
            | Outcome::UserMissing
            | Outcome::Executed { .. }
            | Outcome::Superseded(_) => true,
            Outcome::LockContended
            | Outcome::ConditionNotMet { .. }
            | Outcome::Failed { .. }
            | Outcome::Deferred { .. } => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::LockContended => write!(f, "lock contended"),
            Outcome::NotFound => write!(f, "order not found"),
            Outcome::AlreadyTerminal(status) => write!(f, "already {}", status),
            Outcome::Expired => write!(f, "expired"),
            Outcome::UserMissing => write!(f, "owning user missing"),
            Outcome::ConditionNotMet { rate } => write!(f, "condition not met at rate {}", rate),
            Outcome::Executed { transaction_id } => write!(f, "executed ({})", transaction_id),
            Outcome::Failed { reason } => write!(f, "failed: {}", reason),
            Outcome::Superseded(status) => write!(f, "superseded by {}", status),
            Outcome::Deferred { reason } => write!(f, "deferred: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub order_id: Uuid,
    pub outcome: Outcome,
}

impl Evaluation {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_resolved()
    }
}

pub struct ExecutionProcessor {
    store: Arc<dyn OrderStore>,
    users: Arc<dyn UserStore>,
    cache: Arc<dyn CoordinationCache>,
    settlement: Arc<dyn SettlementApi>,
    config: EngineConfig,
    write_policy: RetryPolicy,
}

impl ExecutionProcessor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        users: Arc<dyn UserStore>,
        cache: Arc<dyn CoordinationCache>,
        settlement: Arc<dyn SettlementApi>,
        config: EngineConfig,
    ) -> Self {
        let write_policy = RetryPolicy::new(
            config.write_max_attempts,
            Duration::from_millis(config.write_initial_backoff_ms),
        );
        Self {
            store,
            users,
            cache,
            settlement,
            config,
            write_policy,
        }
    }

    /// Evaluate one order. Safe to call concurrently and repeatedly for the same id.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn evaluate(&self, order_id: Uuid) -> Evaluation {
        let lock =
            match OrderLock::acquire(self.cache.as_ref(), &order_id, self.config.lock_ttl_secs)
                .await
            {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    debug!("Order is locked by another processor");
                    return Evaluation {
                        order_id,
                        outcome: Outcome::LockContended,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "Could not acquire order lock");
                    return Evaluation {
                        order_id,
                        outcome: Outcome::Deferred {
                            reason: e.to_string(),
                        },
                    };
                }
            };

        let outcome = match self.evaluate_locked(order_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Evaluation deferred");
                Outcome::Deferred {
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = lock.release(self.cache.as_ref()).await {
            // The TTL frees it eventually
            warn!(error = %e, "Failed to release order lock");
        }

        match &outcome {
            Outcome::Executed { .. } | Outcome::Expired => info!(%outcome, "Order resolved"),
            Outcome::Failed { .. } => warn!(%outcome, "Order failed"),
            Outcome::NotFound | Outcome::UserMissing => error!(%outcome, "Order data error"),
            _ => debug!(%outcome, "Evaluation finished"),
        }

        Evaluation { order_id, outcome }
    }

    async fn evaluate_locked(&self, order_id: Uuid) -> Result<Outcome> {
        let Some(transfer) = self.store.find_by_order_id(order_id).await? else {
            warn!("Trigger references unknown order");
            return Ok(Outcome::NotFound);
        };

        if transfer.status.is_terminal() {
            return Ok(Outcome::AlreadyTerminal(transfer.status));
        }

        // A previous run settled but never persisted EXECUTED
        if let Some(transaction_id) = self
            .cache
            .get_json::<String>(&keys::settlement(&order_id))
            .await?
        {
            warn!(%transaction_id, "Recovering settlement recorded by an earlier run");
            return self
                .finish(order_id, TransferStatus::Executed, Some(transaction_id))
                .await;
        }

        if transfer.is_expired_at(Utc::now()) {
            return self.finish(order_id, TransferStatus::Expired, None).await;
        }

        let Some(user) = self.load_user(transfer.user_id).await? else {
            error!(user_id = transfer.user_id, "Error loading user");
            return Ok(Outcome::UserMissing);
        };

        let quote = match self.fetch_quote(&transfer, &user).await {
            Ok(quote) => quote,
            Err(e) if e.is_settlement() => return self.fail(order_id, e).await,
            Err(e) => return Err(e),
        };

        if !transfer.should_execute(quote.rate) {
            debug!(rate = %quote.rate, target = %transfer.target_rate, direction = %transfer.direction, "Rate condition not met");
            return Ok(Outcome::ConditionNotMet { rate: quote.rate });
        }

        info!(rate = %quote.rate, quote_id = %quote.quote_id, "Rate condition met, settling");
        let request = ConversionRequest {
            quote_id: quote.quote_id.clone(),
            source_account: user.account.clone(),
            destination_account: user.account.clone(),
        };
        let conversion = match self
            .settlement
            .create_conversion(&request, &user.credentials())
            .await
        {
            Ok(conversion) => conversion,
            Err(e) => return self.fail(order_id, e.into()).await,
        };

        if let Err(e) = self
            .cache
            .set_json(
                &keys::settlement(&order_id),
                &conversion.transaction_id,
                self.config.settlement_marker_ttl_secs,
            )
            .await
        {
            warn!(error = %e, transaction_id = %conversion.transaction_id, "Could not record settlement marker");
        }

        self.finish(
            order_id,
            TransferStatus::Executed,
            Some(conversion.transaction_id),
        )
        .await
    }

    async fn load_user(&self, user_id: i64) -> Result<Option<User>> {
        let users = self.users.clone();
        self.cache
            .get_or_set(&keys::user(user_id), self.config.user_ttl_secs, || async move {
                users.find_user(user_id).await
            })
            .await
    }

    /// Read-through quote cache; bounds rate staleness to `quote_ttl_secs`
    async fn fetch_quote(&self, transfer: &ConditionalTransfer, user: &User) -> Result<Quote> {
        let request = QuoteRequest::from(transfer);
        let credentials = user.credentials();
        let settlement = self.settlement.clone();

        self.cache
            .get_or_set(
                &keys::quote(&transfer.order_id),
                self.config.quote_ttl_secs,
                || async move {
                    settlement
                        .get_quote(&request, &credentials)
                        .await
                        .map_err(RatewatchError::from)
                },
            )
            .await
    }

    async fn fail(&self, order_id: Uuid, cause: RatewatchError) -> Result<Outcome> {
        error!(error = %cause, "Settlement operation failed");
        match self.finish(order_id, TransferStatus::Failed, None).await? {
            Outcome::Failed { .. } => Ok(Outcome::Failed {
                reason: cause.to_string(),
            }),
            other => Ok(other),
        }
    }

    /// Conditionally persist a terminal status, retrying transient store errors.
    async fn finish(
        &self,
        order_id: Uuid,
        to: TransferStatus,
        transaction_id: Option<String>,
    ) -> Result<Outcome> {
        let mut attempt = 1;
        let transition = loop {
            match self
                .store
                .transition(order_id, to, transaction_id.as_deref())
                .await
            {
                Ok(transition) => break transition,
                Err(e) if attempt < self.write_policy.max_attempts => {
                    warn!(error = %e, attempt, status = %to, "Status write failed, retrying");
                    sleep(self.write_policy.backoff_after(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, status = %to, ?transaction_id, "Status write failed");
                    return Err(e);
                }
            }
        };

        Ok(match transition {
            TransitionOutcome::Applied(updated) => match updated.status {
                TransferStatus::Executed => Outcome::Executed {
                    transaction_id: updated.transaction_id.unwrap_or_default(),
                },
                TransferStatus::Expired => Outcome::Expired,
                TransferStatus::Failed => Outcome::Failed {
                    reason: "settlement failed".to_string(),
                },
                other => Outcome::AlreadyTerminal(other),
            },
            TransitionOutcome::Superseded(current) => {
                warn!(status = %current, wanted = %to, "Order changed concurrently; keeping existing status");
                Outcome::Superseded(current)
            }
            TransitionOutcome::Missing => Outcome::NotFound,
        })
    }
}

#[async_trait]
impl TriggerHandler for ExecutionProcessor {
    async fn handle(&self, payload: &TriggerPayload) -> bool {
        let order_id = payload.order_id();
        debug!(%order_id, action = %payload.action, "Handling trigger");

        let resolved = self.evaluate(order_id).await.is_resolved();
        if !resolved {
            // Goes back for redelivery; the sweeper must not add another one
            if let Err(e) = self
                .cache
                .set(&keys::trigger(&order_id), "1", self.config.trigger_liveness_secs)
                .await
            {
                warn!(%order_id, error = %e, "Could not mark trigger as live");
            }
        }
        resolved
    }
}
