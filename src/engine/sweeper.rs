//! Pending order sweeper
//!
//! Periodically walks every PENDING order and republishes a SWEEP trigger for
//! the ones that no longer have a live trigger, so orders whose triggers were
//! lost get re-evaluated and eventually expire. An order counts as having a
//! live trigger while it is younger than the liveness window (its CREATED
//! trigger) or while its `trigger:<id>` marker exists. The marker is refreshed
//! whenever a delivery is handed back for redelivery, and claimed here before
//! publishing, so each order has at most one trigger in circulation.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::cache::keys;
use super::traits::{CoordinationCache, OrderStore, PendingCursor, TriggerPublisher};
use crate::config::EngineConfig;
use crate::coordination::ShutdownToken;
use crate::domain::{ConditionalTransfer, TriggerAction, TriggerPayload};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sweeps: u64,
    pub republished: u64,
    /// Orders left alone because a trigger was still live
    pub skipped_live: u64,
    pub publish_errors: u64,
}

pub struct PendingSweeper {
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn TriggerPublisher>,
    cache: Arc<dyn CoordinationCache>,
    interval: Duration,
    batch_size: u32,
    liveness_secs: u64,
    stats: RwLock<SweepStats>,
}

impl PendingSweeper {
    pub fn new(
        store: Arc<dyn OrderStore>,
        publisher: Arc<dyn TriggerPublisher>,
        cache: Arc<dyn CoordinationCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            cache,
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            batch_size: config.sweep_batch_size.max(1),
            liveness_secs: config.trigger_liveness_secs,
            stats: RwLock::new(SweepStats::default()),
        }
    }

    /// One pass over all PENDING orders, page by page. Returns how many triggers were published.
    pub async fn sweep_once(&self) -> Result<usize> {
        let fresh_since = Utc::now() - chrono::Duration::seconds(self.liveness_secs as i64);
        let mut cursor: Option<PendingCursor> = None;
        let mut seen = 0usize;
        let mut published = 0usize;
        let mut skipped = 0u64;
        let mut failed = 0u64;

        loop {
            let page = self.store.list_pending(cursor, self.batch_size).await?;
            seen += page.len();

            for transfer in &page {
                if transfer.created_at > fresh_since {
                    skipped += 1;
                    continue;
                }
                match self.republish(transfer).await {
                    Ok(true) => published += 1,
                    Ok(false) => skipped += 1,
                    Err(e) => {
                        warn!(order_id = %transfer.order_id, error = %e, "Failed to republish trigger");
                        failed += 1;
                    }
                }
            }

            if page.len() < self.batch_size as usize {
                break;
            }
            cursor = page.last().map(PendingCursor::from);
        }

        let mut stats = self.stats.write().await;
        stats.sweeps += 1;
        stats.republished += published as u64;
        stats.skipped_live += skipped;
        stats.publish_errors += failed;

        if seen > 0 {
            info!(pending = seen, published, skipped, "Sweep complete");
        }
        Ok(published)
    }

    /// Claim the order's trigger marker and publish. `false` when a trigger is already live.
    async fn republish(&self, transfer: &ConditionalTransfer) -> Result<bool> {
        let marker = keys::trigger(&transfer.order_id);
        if !self
            .cache
            .set_if_absent(&marker, "sweep", self.liveness_secs)
            .await?
        {
            return Ok(false);
        }

        let payload = TriggerPayload::for_transfer(transfer, TriggerAction::Sweep);
        match self.publisher.publish(&payload).await {
            Ok(message_id) => {
                debug!(order_id = %transfer.order_id, %message_id, "Republished trigger");
                Ok(true)
            }
            Err(e) => {
                // Let the next sweep try again
                if let Err(del_err) = self.cache.del(&marker).await {
                    warn!(order_id = %transfer.order_id, error = %del_err, "Could not clear trigger marker");
                }
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> SweepStats {
        self.stats.read().await.clone()
    }

    /// Sweep on a fixed interval until shutdown is requested
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!(interval_secs = self.interval.as_secs(), batch_size = self.batch_size, "Starting pending sweeper");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Pending sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Pending sweeper stopped");
    }
}
