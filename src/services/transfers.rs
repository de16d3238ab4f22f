//! Order intake: idempotent creation, listing, lookup and cancellation of
//! conditional transfers.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{
    ConditionalTransfer, NewTransfer, TransferStatus, TriggerAction, TriggerPayload,
};
use crate::engine::{CreateOutcome, OrderStore, TransitionOutcome, TriggerPublisher};
use crate::error::{RatewatchError, Result};

pub struct TransferService {
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn TriggerPublisher>,
    idempotency_window: Duration,
    page_size: u32,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        publisher: Arc<dyn TriggerPublisher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            idempotency_window: Duration::hours(config.idempotency_window_hours),
            page_size: config.page_size.max(1),
        }
    }

    /// Create an order, or return the one already created with the same
    /// idempotency key inside the window. A trigger is published only for a
    /// newly created order.
    pub async fn create_order(&self, request: NewTransfer) -> Result<ConditionalTransfer> {
        let now = Utc::now();
        let window_start = now - self.idempotency_window;

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(&request.idempotency_key, window_start)
            .await?
        {
            info!(
                order_id = %existing.order_id,
                idempotency_key = %request.idempotency_key,
                "Returning existing order for idempotency key"
            );
            return Ok(existing);
        }

        request.validate(now)?;
        let transfer = request.into_transfer(now);

        let created = match self.store.create(&transfer, window_start).await? {
            CreateOutcome::Created(created) => created,
            CreateOutcome::Existing(existing) => {
                debug!(order_id = %existing.order_id, "Concurrent create with the same idempotency key");
                return Ok(existing);
            }
        };

        let payload = TriggerPayload::for_transfer(&created, TriggerAction::Created);
        match self.publisher.publish(&payload).await {
            Ok(message_id) => {
                info!(
                    order_id = %created.order_id,
                    user_id = created.user_id,
                    direction = %created.direction,
                    target_rate = %created.target_rate,
                    %message_id,
                    "Order created"
                );
                Ok(created)
            }
            Err(e) => {
                // The row stays PENDING and the sweeper re-triggers it
                error!(order_id = %created.order_id, error = %e, "Order stored but trigger publish failed");
                Err(e)
            }
        }
    }

    /// Orders of one user, newest first. Pages start at 1.
    pub async fn list_orders(&self, user_id: i64, page: u32) -> Result<Vec<ConditionalTransfer>> {
        let page = page.max(1);
        let offset = (page - 1).saturating_mul(self.page_size);
        self.store
            .list_by_user(user_id, self.page_size, offset)
            .await
    }

    pub async fn get_order(&self, user_id: i64, order_id: Uuid) -> Result<ConditionalTransfer> {
        self.store
            .find_for_user(user_id, order_id)
            .await?
            .ok_or_else(|| RatewatchError::NotFound(format!("order {order_id}")))
    }

    /// Cancel a PENDING order. Orders already in a terminal state are returned
    /// unchanged, whichever writer got there first.
    pub async fn cancel_order(&self, user_id: i64, order_id: Uuid) -> Result<ConditionalTransfer> {
        let current = self.get_order(user_id, order_id).await?;
        if current.status.is_terminal() {
            debug!(%order_id, status = %current.status, "Cancel on terminal order ignored");
            return Ok(current);
        }

        match self
            .store
            .transition(order_id, TransferStatus::Cancelled, None)
            .await?
        {
            TransitionOutcome::Applied(cancelled) => {
                info!(%order_id, user_id, "Order cancelled");
                Ok(cancelled)
            }
            TransitionOutcome::Superseded(status) => {
                warn!(%order_id, %status, "Order resolved before cancellation");
                self.get_order(user_id, order_id).await
            }
            TransitionOutcome::Missing => {
                Err(RatewatchError::NotFound(format!("order {order_id}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransferDirection;
    use crate::engine::memory::{MemoryOrderStore, MemoryTriggerChannel};
    use rust_decimal_macros::dec;

    fn service() -> (TransferService, Arc<MemoryOrderStore>, Arc<MemoryTriggerChannel>) {
        let store = Arc::new(MemoryOrderStore::new());
        let channel = Arc::new(MemoryTriggerChannel::new());
        let service = TransferService::new(store.clone(), channel.clone(), &EngineConfig::default());
        (service, store, channel)
    }

    fn request(user_id: i64, key: &str) -> NewTransfer {
        NewTransfer {
            user_id,
            from_currency: "USDC".to_string(),
            to_currency: "EURC".to_string(),
            from_network: "ethereum".to_string(),
            to_network: "ethereum".to_string(),
            amount: dec!(100),
            target_rate: dec!(1.5),
            direction: TransferDirection::GreaterEqual,
            expires_at: Utc::now() + Duration::hours(1),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_publishes_trigger() {
        let (service, store, channel) = service();

        let created = tokio_test::assert_ok!(service.create_order(request(1, "create-key-0001")).await);

        assert_eq!(created.status, TransferStatus::Pending);
        assert!(created.transaction_id.is_none());
        assert_eq!(store.len().await, 1);

        let published = channel.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].order_id(), created.order_id);
        assert_eq!(published[0].action, TriggerAction::Created);
        assert_eq!(published[0].idempotency_key, "create-key-0001");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (service, store, channel) = service();

        let first = service.create_order(request(1, "create-key-0002")).await.unwrap();
        let second = service.create_order(request(1, "create-key-0002")).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(store.len().await, 1);
        assert_eq!(channel.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_key_outside_window_creates_new_order() {
        let (service, store, channel) = service();

        let mut old = request(1, "create-key-0003").into_transfer(Utc::now() - Duration::hours(25));
        old.expires_at = Utc::now() + Duration::hours(1);
        store.insert_transfer(old.clone()).await;

        let fresh = service.create_order(request(1, "create-key-0003")).await.unwrap();

        assert_ne!(fresh.order_id, old.order_id);
        assert_eq!(store.len().await, 2);
        assert_eq!(channel.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_order() {
        let (service, store, channel) = service();
        let service = Arc::new(service);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.create_order(request(1, "create-key-0004")).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().order_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(channel.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (service, store, channel) = service();
        let mut bad = request(1, "create-key-0005");
        bad.amount = dec!(0);

        let err = tokio_test::assert_err!(service.create_order(bad).await);

        assert!(matches!(err, RatewatchError::Validation(_)));
        assert!(store.is_empty().await);
        assert!(channel.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_pages_per_user() {
        let (service, _store, _channel) = service();
        for i in 0..12 {
            service
                .create_order(request(1, &format!("list-key-{i:04}")))
                .await
                .unwrap();
        }
        service.create_order(request(2, "list-key-other")).await.unwrap();

        assert_eq!(service.list_orders(1, 1).await.unwrap().len(), 10);
        assert_eq!(service.list_orders(1, 2).await.unwrap().len(), 2);
        assert!(service.list_orders(1, 3).await.unwrap().is_empty());
        // Page 0 is treated as the first page
        assert_eq!(service.list_orders(1, 0).await.unwrap().len(), 10);
        assert_eq!(service.list_orders(2, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_is_scoped_to_owner() {
        let (service, _store, _channel) = service();
        let created = service.create_order(request(1, "get-key-000001")).await.unwrap();

        assert_eq!(service.get_order(1, created.order_id).await.unwrap(), created);
        assert!(matches!(
            service.get_order(2, created.order_id).await,
            Err(RatewatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_terminal() {
        let (service, store, _channel) = service();
        let open = service.create_order(request(1, "cancel-key-0001")).await.unwrap();
        let done = service.create_order(request(1, "cancel-key-0002")).await.unwrap();
        store.force_status(done.order_id, TransferStatus::Executed).await;

        let cancelled = service.cancel_order(1, open.order_id).await.unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);

        let unchanged = service.cancel_order(1, done.order_id).await.unwrap();
        assert_eq!(unchanged.status, TransferStatus::Executed);

        assert!(matches!(
            service.cancel_order(2, open.order_id).await,
            Err(RatewatchError::NotFound(_))
        ));
    }
}
