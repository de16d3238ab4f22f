//! End-to-end flows over the in-process backends: intake publishes a trigger,
//! the consumer hands it to the processor, and the processor settles or not.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ratewatch::config::{EngineConfig, TriggerConfig};
use ratewatch::domain::{
    ApiCredentials, ConditionalTransfer, Conversion, ConversionRequest, NewTransfer, Quote,
    QuoteRequest, TransferDirection, TransferStatus, User,
};
use ratewatch::engine::{
    Disposition, ExecutionProcessor, MemoryCache, MemoryOrderStore, MemoryTriggerChannel,
    OrderStore, Outcome, PendingSweeper, SettlementApi, TriggerConsumer, TriggerSource,
};
use ratewatch::services::TransferService;
use ratewatch::SettlementError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Settlement service stand-in with a settable rate
struct FakeSettlement {
    rate: Mutex<Decimal>,
    quotes: AtomicUsize,
    conversions: AtomicUsize,
    conversion_delay: std::time::Duration,
    /// Cancel this order just before the conversion returns
    cancel_during_conversion: Option<(Arc<MemoryOrderStore>, Uuid)>,
}

impl FakeSettlement {
    fn at_rate(rate: Decimal) -> Self {
        Self {
            rate: Mutex::new(rate),
            quotes: AtomicUsize::new(0),
            conversions: AtomicUsize::new(0),
            conversion_delay: std::time::Duration::ZERO,
            cancel_during_conversion: None,
        }
    }

    fn set_rate(&self, rate: Decimal) {
        *self.rate.lock().unwrap() = rate;
    }
}

#[async_trait]
impl SettlementApi for FakeSettlement {
    async fn get_quote(
        &self,
        _request: &QuoteRequest,
        _credentials: &ApiCredentials,
    ) -> Result<Quote, SettlementError> {
        let n = self.quotes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Quote {
            quote_id: format!("quote_{n}"),
            rate: *self.rate.lock().unwrap(),
        })
    }

    async fn create_conversion(
        &self,
        request: &ConversionRequest,
        _credentials: &ApiCredentials,
    ) -> Result<Conversion, SettlementError> {
        if !self.conversion_delay.is_zero() {
            tokio::time::sleep(self.conversion_delay).await;
        }
        if let Some((store, order_id)) = &self.cancel_during_conversion {
            store
                .transition(*order_id, TransferStatus::Cancelled, None)
                .await
                .unwrap();
        }
        self.conversions.fetch_add(1, Ordering::SeqCst);
        Ok(Conversion {
            transaction_id: format!("trxn_for_{}", request.quote_id),
            status: Some("COMPLETED".to_string()),
        })
    }
}

struct World {
    store: Arc<MemoryOrderStore>,
    cache: Arc<MemoryCache>,
    channel: Arc<MemoryTriggerChannel>,
    service: TransferService,
}

async fn world() -> World {
    let store = Arc::new(MemoryOrderStore::new());
    store
        .insert_user(User {
            id: 1,
            email: "treasury@example.com".to_string(),
            password_hash: "hash".to_string(),
            api_key: "key_1".to_string(),
            api_secret: "secret_1".to_string(),
            account: "acct_1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;
    let channel = Arc::new(MemoryTriggerChannel::new());
    let service = TransferService::new(store.clone(), channel.clone(), &EngineConfig::default());
    World {
        store,
        cache: Arc::new(MemoryCache::new()),
        channel,
        service,
    }
}

fn processor(w: &World, settlement: Arc<FakeSettlement>) -> Arc<ExecutionProcessor> {
    Arc::new(ExecutionProcessor::new(
        w.store.clone(),
        w.store.clone(),
        w.cache.clone(),
        settlement,
        EngineConfig::default(),
    ))
}

fn request(key: &str, direction: TransferDirection) -> NewTransfer {
    NewTransfer {
        user_id: 1,
        from_currency: "USDC".to_string(),
        to_currency: "EURC".to_string(),
        from_network: "ethereum".to_string(),
        to_network: "ethereum".to_string(),
        amount: dec!(100),
        target_rate: dec!(1.5),
        direction,
        expires_at: Utc::now() + Duration::hours(1),
        idempotency_key: key.to_string(),
    }
}

async fn drain(consumer: &TriggerConsumer) -> Vec<Disposition> {
    let mut tasks = JoinSet::new();
    consumer.poll_once(&mut tasks).await.unwrap();
    let mut dispositions = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        dispositions.push(joined.unwrap());
    }
    dispositions
}

async fn status(w: &World, order_id: Uuid) -> ConditionalTransfer {
    w.store.get(order_id).await.unwrap()
}

#[tokio::test]
async fn create_trigger_and_execute() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.6)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );

    let created = w
        .service
        .create_order(request("scenario-key-0001", TransferDirection::GreaterEqual))
        .await
        .unwrap();

    assert_eq!(drain(&consumer).await, vec![Disposition::Acked]);

    let executed = status(&w, created.order_id).await;
    assert_eq!(executed.status, TransferStatus::Executed);
    assert_eq!(executed.transaction_id.as_deref(), Some("trxn_for_quote_1"));
    assert_eq!(settlement.conversions.load(Ordering::SeqCst), 1);
    assert_eq!(w.channel.in_flight().await, 0);
    assert_eq!(w.channel.queued().await, 0);
}

#[tokio::test(start_paused = true)]
async fn unmet_condition_is_redelivered_until_rate_moves() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.4)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );

    let created = w
        .service
        .create_order(request("scenario-key-0002", TransferDirection::GreaterEqual))
        .await
        .unwrap();

    assert_eq!(drain(&consumer).await, vec![Disposition::Nacked]);
    assert_eq!(status(&w, created.order_id).await.status, TransferStatus::Pending);

    // Cached quote still answers until its TTL runs out
    settlement.set_rate(dec!(1.55));
    assert_eq!(drain(&consumer).await, vec![Disposition::Nacked]);
    assert_eq!(settlement.quotes.load(Ordering::SeqCst), 1);

    tokio::time::advance(std::time::Duration::from_secs(61)).await;
    assert_eq!(drain(&consumer).await, vec![Disposition::Acked]);

    let executed = status(&w, created.order_id).await;
    assert_eq!(executed.status, TransferStatus::Executed);
    assert_eq!(executed.transaction_id.as_deref(), Some("trxn_for_quote_2"));
}

#[tokio::test]
async fn concurrent_evaluations_settle_at_most_once() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement {
        conversion_delay: std::time::Duration::from_millis(50),
        ..FakeSettlement::at_rate(dec!(1.6))
    });
    let processor = processor(&w, settlement.clone());

    let created = w
        .service
        .create_order(request("scenario-key-0003", TransferDirection::GreaterEqual))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        processor.evaluate(created.order_id),
        processor.evaluate(created.order_id)
    );

    let executed = [&a, &b]
        .iter()
        .filter(|e| matches!(e.outcome, Outcome::Executed { .. }))
        .count();
    assert_eq!(executed, 1);
    assert!([&a, &b]
        .iter()
        .any(|e| e.outcome == Outcome::LockContended));
    assert_eq!(settlement.conversions.load(Ordering::SeqCst), 1);

    // A later redelivery sees the terminal state and does nothing
    let again = processor.evaluate(created.order_id).await;
    assert_eq!(again.outcome, Outcome::AlreadyTerminal(TransferStatus::Executed));
    assert_eq!(settlement.conversions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_during_settlement_wins() {
    let w = world().await;
    let created = w
        .service
        .create_order(request("scenario-key-0004", TransferDirection::GreaterEqual))
        .await
        .unwrap();

    let settlement = Arc::new(FakeSettlement {
        cancel_during_conversion: Some((w.store.clone(), created.order_id)),
        ..FakeSettlement::at_rate(dec!(1.6))
    });
    let evaluation = processor(&w, settlement).evaluate(created.order_id).await;

    assert_eq!(evaluation.outcome, Outcome::Superseded(TransferStatus::Cancelled));
    assert!(evaluation.is_resolved());
    let stored = status(&w, created.order_id).await;
    assert_eq!(stored.status, TransferStatus::Cancelled);
    assert!(stored.transaction_id.is_none());
}

#[tokio::test]
async fn cancelled_order_is_acked_without_settlement() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.6)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );

    let created = w
        .service
        .create_order(request("scenario-key-0005", TransferDirection::GreaterEqual))
        .await
        .unwrap();
    w.service.cancel_order(1, created.order_id).await.unwrap();

    assert_eq!(drain(&consumer).await, vec![Disposition::Acked]);
    assert_eq!(status(&w, created.order_id).await.status, TransferStatus::Cancelled);
    assert_eq!(settlement.quotes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sweeper_expires_stale_orders() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.6)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );

    let mut stale = request("scenario-key-0006", TransferDirection::LessEqual)
        .into_transfer(Utc::now() - Duration::hours(2));
    stale.expires_at = Utc::now() - Duration::minutes(1);
    w.store.insert_transfer(stale.clone()).await;

    let sweeper = PendingSweeper::new(
        w.store.clone(),
        w.channel.clone(),
        w.cache.clone(),
        &EngineConfig::default(),
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    assert_eq!(drain(&consumer).await, vec![Disposition::Acked]);
    assert_eq!(status(&w, stale.order_id).await.status, TransferStatus::Expired);
    assert_eq!(settlement.quotes.load(Ordering::SeqCst), 0);

    // Nothing left to sweep
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_sweeps_keep_one_live_trigger_per_order() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.4)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );
    let sweeper = PendingSweeper::new(
        w.store.clone(),
        w.channel.clone(),
        w.cache.clone(),
        &EngineConfig::default(),
    );

    // Old enough that the sweeper no longer defers to its CREATED trigger
    let mut waiting = request("scenario-key-0007", TransferDirection::GreaterEqual)
        .into_transfer(Utc::now() - Duration::minutes(10));
    waiting.expires_at = Utc::now() + Duration::hours(1);
    w.store.insert_transfer(waiting.clone()).await;

    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    for _ in 0..5 {
        assert_eq!(drain(&consumer).await, vec![Disposition::Nacked]);
        sweeper.sweep_once().await.unwrap();
        assert_eq!(w.channel.queued().await, 1);
        // Past the sweep marker's TTL, so only the handler keeps the trigger live
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
    }
    assert_eq!(w.channel.published().await.len(), 1);
    assert_eq!(status(&w, waiting.order_id).await.status, TransferStatus::Pending);
}

#[tokio::test]
async fn malformed_trigger_is_discarded() {
    let w = world().await;
    let settlement = Arc::new(FakeSettlement::at_rate(dec!(1.6)));
    let consumer = TriggerConsumer::new(
        w.channel.clone(),
        processor(&w, settlement.clone()),
        &TriggerConfig::default(),
    );

    let id = w.channel.push_raw(r#"{"transferId": 42}"#).await;

    assert_eq!(drain(&consumer).await, vec![Disposition::Discarded]);
    assert_eq!(w.channel.acked().await, vec![id]);
    assert!(w.channel.receive(1).await.unwrap().is_empty());
}
