//! In-process backends for the engine seams.
//!
//! They honor the same contracts as the Postgres/Redis adapters (atomic
//! set-if-absent, conditional status writes, exactly-once ack/nack) and are
//! what the test suites run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::traits::{
    CoordinationCache, CreateOutcome, Delivery, OrderStore, PendingCursor, TransitionOutcome,
    TriggerPublisher, TriggerSource, UserStore,
};
use crate::domain::{ConditionalTransfer, TransferStatus, TriggerPayload, User};
use crate::error::{RatewatchError, Result};

// ==================== Cache ====================

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: &str, ttl_secs: u64) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// TTL-aware key-value cache. Uses tokio's clock so paused-time tests can expire entries.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl_secs));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let live = self
            .entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone());
        if live.is_none() {
            self.entries.remove_if(key, |_, e| !e.is_live());
        }
        Ok(live)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    Ok(false)
                } else {
                    occupied.insert(CacheEntry::new(value, ttl_secs));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl_secs));
                Ok(true)
            }
        }
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, e| e.is_live() && e.value == expected)
            .is_some())
    }
}

// ==================== Orders and users ====================

#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<Uuid, ConditionalTransfer>>,
    users: RwLock<HashMap<i64, User>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    /// Seed a row directly, bypassing idempotency and validation
    pub async fn insert_transfer(&self, transfer: ConditionalTransfer) {
        self.orders.write().await.insert(transfer.order_id, transfer);
    }

    /// Overwrite a row unconditionally (used to simulate external writers)
    pub async fn force_status(&self, order_id: Uuid, status: TransferStatus) {
        if let Some(transfer) = self.orders.write().await.get_mut(&order_id) {
            transfer.status = status;
            transfer.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, order_id: Uuid) -> Option<ConditionalTransfer> {
        self.orders.read().await.get(&order_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

fn newest_with_key<'a>(
    orders: impl Iterator<Item = &'a ConditionalTransfer>,
    key: &str,
    created_after: DateTime<Utc>,
) -> Option<&'a ConditionalTransfer> {
    orders
        .filter(|t| t.idempotency_key == key && t.created_at > created_after)
        .max_by_key(|t| t.created_at)
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<ConditionalTransfer>> {
        let orders = self.orders.read().await;
        Ok(newest_with_key(orders.values(), key, created_after).cloned())
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<ConditionalTransfer>> {
        Ok(self.get(order_id).await)
    }

    async fn find_for_user(
        &self,
        user_id: i64,
        order_id: Uuid,
    ) -> Result<Option<ConditionalTransfer>> {
        Ok(self.get(order_id).await.filter(|t| t.user_id == user_id))
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConditionalTransfer>> {
        let orders = self.orders.read().await;
        let mut owned: Vec<_> = orders
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: u32,
    ) -> Result<Vec<ConditionalTransfer>> {
        let position = |t: &ConditionalTransfer| (t.created_at, t.order_id);
        let orders = self.orders.read().await;
        let mut pending: Vec<_> = orders
            .values()
            .filter(|t| t.status == TransferStatus::Pending)
            .filter(|t| after.map_or(true, |c| position(t) > (c.created_at, c.order_id)))
            .cloned()
            .collect();
        pending.sort_by_key(position);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn create(
        &self,
        transfer: &ConditionalTransfer,
        window_start: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        let mut orders = self.orders.write().await;
        if let Some(existing) =
            newest_with_key(orders.values(), &transfer.idempotency_key, window_start)
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        if orders.contains_key(&transfer.order_id) {
            return Err(RatewatchError::Internal(format!(
                "duplicate order_id {}",
                transfer.order_id
            )));
        }

        orders.insert(transfer.order_id, transfer.clone());
        Ok(CreateOutcome::Created(transfer.clone()))
    }

    async fn transition(
        &self,
        order_id: Uuid,
        to: TransferStatus,
        transaction_id: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let mut orders = self.orders.write().await;
        let Some(transfer) = orders.get_mut(&order_id) else {
            return Ok(TransitionOutcome::Missing);
        };
        if transfer.status != TransferStatus::Pending {
            return Ok(TransitionOutcome::Superseded(transfer.status));
        }

        transfer.apply_transition(to, transaction_id.map(str::to_string), Utc::now())?;
        Ok(TransitionOutcome::Applied(transfer.clone()))
    }
}

#[async_trait]
impl UserStore for MemoryOrderStore {
    async fn find_user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }
}

// ==================== Trigger channel ====================

#[derive(Debug, Default)]
struct ChannelState {
    next_id: u64,
    queue: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    acked: Vec<String>,
    nacked: Vec<String>,
    published: Vec<TriggerPayload>,
}

/// At-least-once channel: nacked deliveries go back to the tail of the queue.
#[derive(Debug, Default)]
pub struct MemoryTriggerChannel {
    state: Mutex<ChannelState>,
}

impl MemoryTriggerChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary body, e.g. a malformed message
    pub async fn push_raw(&self, body: impl Into<String>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.queue.push_back(Delivery {
            id: id.clone(),
            body: body.into(),
            attempt: 1,
        });
        id
    }

    pub async fn published(&self) -> Vec<TriggerPayload> {
        self.state.lock().await.published.clone()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    pub async fn nacked(&self) -> Vec<String> {
        self.state.lock().await.nacked.clone()
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl TriggerPublisher for MemoryTriggerChannel {
    async fn publish(&self, payload: &TriggerPayload) -> Result<String> {
        let body = serde_json::to_string(payload)?;
        let id = self.push_raw(body).await;
        self.state.lock().await.published.push(payload.clone());
        Ok(id)
    }
}

#[async_trait]
impl TriggerSource for MemoryTriggerChannel {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        let take = max.min(state.queue.len());
        let batch: Vec<Delivery> = state.queue.drain(..take).collect();
        for delivery in &batch {
            state.in_flight.insert(delivery.id.clone(), delivery.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.id).is_none() {
            return Err(RatewatchError::Channel(format!(
                "delivery {} is not in flight",
                delivery.id
            )));
        }
        state.acked.push(delivery.id.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut redelivery) = state.in_flight.remove(&delivery.id) else {
            return Err(RatewatchError::Channel(format!(
                "delivery {} is not in flight",
                delivery.id
            )));
        };
        state.nacked.push(delivery.id.clone());
        redelivery.attempt += 1;
        state.queue.push_back(redelivery);
        Ok(())
    }
}
