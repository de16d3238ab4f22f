//! Trigger consumer: pulls deliveries from the trigger channel and dispatches
//! them to the handler on a bounded worker pool.
//!
//! Every delivery ends with exactly one ack or nack. Payloads that do not
//! decode are acked and logged, since redelivering them cannot succeed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::traits::{Delivery, TriggerHandler, TriggerSource};
use crate::config::TriggerConfig;
use crate::coordination::ShutdownToken;
use crate::domain::TriggerPayload;
use crate::error::Result;

/// How a single delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
    /// Undecodable body, acked
    Discarded,
}

/// Decode, handle, then ack or nack exactly once.
pub async fn process_delivery(
    source: &dyn TriggerSource,
    handler: &dyn TriggerHandler,
    delivery: &Delivery,
) -> Disposition {
    let payload: TriggerPayload = match serde_json::from_str(&delivery.body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(message_id = %delivery.id, error = %e, "Discarding malformed trigger");
            if let Err(e) = source.ack(delivery).await {
                warn!(message_id = %delivery.id, error = %e, "Ack failed");
            }
            return Disposition::Discarded;
        }
    };

    let resolved = handler.handle(&payload).await;

    let (disposition, settled) = if resolved {
        (Disposition::Acked, source.ack(delivery).await)
    } else {
        (Disposition::Nacked, source.nack(delivery).await)
    };
    if let Err(e) = settled {
        // Unacked entries come back through redelivery
        warn!(message_id = %delivery.id, ?disposition, error = %e, "Failed to settle delivery");
    }

    debug!(
        message_id = %delivery.id,
        order_id = %payload.order_id(),
        attempt = delivery.attempt,
        ?disposition,
        "Delivery settled"
    );
    disposition
}

pub struct TriggerConsumer {
    source: Arc<dyn TriggerSource>,
    handler: Arc<dyn TriggerHandler>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
    idle_delay: Duration,
    error_backoff: Duration,
}

impl TriggerConsumer {
    pub fn new(
        source: Arc<dyn TriggerSource>,
        handler: Arc<dyn TriggerHandler>,
        config: &TriggerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            batch_size: config.batch_size.max(1),
            idle_delay: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Delay between polls when the channel returns nothing
    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    /// Receive one batch and spawn a task per delivery. Waits for a free worker
    /// first, and never fetches more deliveries than there are free workers.
    pub async fn poll_once(&self, tasks: &mut JoinSet<Disposition>) -> Result<usize> {
        let Ok(first) = self.semaphore.clone().acquire_owned().await else {
            return Ok(0);
        };
        let max = (self.semaphore.available_permits() + 1).min(self.batch_size);

        let deliveries = self.source.receive(max).await?;
        let count = deliveries.len();

        let mut first = Some(first);
        for delivery in deliveries {
            let permit = match first.take() {
                Some(permit) => permit,
                None => match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let source = self.source.clone();
            let handler = self.handler.clone();
            tasks.spawn(async move {
                let disposition =
                    process_delivery(source.as_ref(), handler.as_ref(), &delivery).await;
                drop(permit);
                disposition
            });
        }

        Ok(count)
    }

    /// Consume until shutdown, then wait for in-flight tasks.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            concurrency = self.semaphore.available_permits(),
            "Starting trigger consumer"
        );

        let mut tasks = JoinSet::new();

        while !shutdown.is_shutdown_requested() {
            let delay = match self.poll_once(&mut tasks).await {
                Ok(0) => Some(self.idle_delay),
                Ok(_) => None,
                Err(e) => {
                    error!("Trigger receive failed: {}", e);
                    Some(self.error_backoff)
                }
            };

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Delivery task panicked: {}", e);
                }
            }

            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(in_flight = tasks.len(), "Trigger consumer stopping, draining in-flight deliveries");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task panicked: {}", e);
            }
        }
        info!("Trigger consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTransfer, TransferDirection, TriggerAction};
    use crate::engine::memory::MemoryTriggerChannel;
    use crate::engine::traits::TriggerPublisher;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedHandler {
        resolved: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TriggerHandler for FixedHandler {
        async fn handle(&self, _payload: &TriggerPayload) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.resolved
        }
    }

    fn handler(resolved: bool) -> Arc<FixedHandler> {
        Arc::new(FixedHandler {
            resolved,
            calls: AtomicUsize::new(0),
        })
    }

    fn payload() -> TriggerPayload {
        let transfer = NewTransfer {
            user_id: 3,
            from_currency: "USDC".to_string(),
            to_currency: "EURC".to_string(),
            from_network: "base".to_string(),
            to_network: "base".to_string(),
            amount: dec!(50),
            target_rate: dec!(1.1),
            direction: TransferDirection::GreaterEqual,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            idempotency_key: "consumer-key-01".to_string(),
        }
        .into_transfer(Utc::now());
        TriggerPayload::for_transfer(&transfer, TriggerAction::Created)
    }

    #[tokio::test]
    async fn test_resolved_delivery_is_acked() {
        let channel = MemoryTriggerChannel::new();
        let id = channel.publish(&payload()).await.unwrap();
        let handler = handler(true);

        let delivery = channel.receive(1).await.unwrap().remove(0);
        let disposition = process_delivery(&channel, handler.as_ref(), &delivery).await;

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(channel.acked().await, vec![id]);
        assert!(channel.nacked().await.is_empty());
        assert_eq!(channel.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_unresolved_delivery_is_nacked_and_redelivered() {
        let channel = MemoryTriggerChannel::new();
        let id = channel.publish(&payload()).await.unwrap();
        let handler = handler(false);

        let delivery = channel.receive(1).await.unwrap().remove(0);
        let disposition = process_delivery(&channel, handler.as_ref(), &delivery).await;

        assert_eq!(disposition, Disposition::Nacked);
        assert_eq!(channel.nacked().await, vec![id.clone()]);
        assert!(channel.acked().await.is_empty());

        let again = channel.receive(1).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked_without_handling() {
        let channel = MemoryTriggerChannel::new();
        let id = channel.push_raw("{not json").await;
        let handler = handler(false);

        let delivery = channel.receive(1).await.unwrap().remove(0);
        let disposition = process_delivery(&channel, handler.as_ref(), &delivery).await;

        assert_eq!(disposition, Disposition::Discarded);
        assert_eq!(channel.acked().await, vec![id]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_once_dispatches_batch() {
        let channel = Arc::new(MemoryTriggerChannel::new());
        for _ in 0..3 {
            channel.publish(&payload()).await.unwrap();
        }
        let handler = handler(true);
        let consumer = TriggerConsumer::new(channel.clone(), handler.clone(), &TriggerConfig::default());

        let mut tasks = JoinSet::new();
        assert_eq!(consumer.poll_once(&mut tasks).await.unwrap(), 3);
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap(), Disposition::Acked);
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(channel.acked().await.len(), 3);
        assert_eq!(channel.queued().await, 0);
    }

    #[tokio::test]
    async fn test_poll_once_respects_concurrency() {
        let channel = Arc::new(MemoryTriggerChannel::new());
        for _ in 0..5 {
            channel.publish(&payload()).await.unwrap();
        }
        let config = TriggerConfig {
            concurrency: 2,
            ..TriggerConfig::default()
        };
        let consumer = TriggerConsumer::new(channel.clone(), handler(true), &config);

        let mut tasks = JoinSet::new();
        assert_eq!(consumer.poll_once(&mut tasks).await.unwrap(), 2);
        while tasks.join_next().await.is_some() {}
        assert_eq!(channel.queued().await, 3);
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let channel = Arc::new(MemoryTriggerChannel::new());
        for _ in 0..4 {
            channel.publish(&payload()).await.unwrap();
        }
        let consumer = TriggerConsumer::new(channel.clone(), handler(true), &TriggerConfig::default())
            .with_idle_delay(Duration::from_millis(5));

        let shutdown = crate::coordination::GracefulShutdown::with_defaults();
        let token = shutdown.token();
        let run = consumer.run(token);
        let stop = async {
            while channel.acked().await.len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            shutdown.request_shutdown(crate::coordination::ShutdownSignal::Graceful);
        };

        let (result, ()) = tokio::join!(run, stop);
        assert!(result.is_ok());
        assert_eq!(channel.acked().await.len(), 4);
        assert_eq!(channel.in_flight().await, 0);
    }
}
