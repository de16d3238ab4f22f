//! Trigger channel on Redis Streams.
//!
//! Publishing is XADD. Each worker reads through a consumer group; ack is
//! XACK + XDEL, nack leaves the entry in the pending list, and entries pending
//! longer than `redelivery_idle_ms` are reclaimed with XAUTOCLAIM.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadOptions;
use redis::{AsyncCommands, Client, Value};
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::domain::TriggerPayload;
use crate::engine::{Delivery, TriggerPublisher, TriggerSource};
use crate::error::Result;

const PAYLOAD_FIELD: &str = "payload";

#[derive(Clone)]
pub struct RedisTriggerStream {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block_ms: usize,
    redelivery_idle_ms: u64,
}

impl RedisTriggerStream {
    /// Connect and make sure the consumer group exists
    pub async fn connect(redis_url: &str, config: &TriggerConfig) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let mut conn = ConnectionManager::new(client).await?;

        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(&config.stream, &config.group, "0")
            .await
        {
            Ok(()) => info!(stream = %config.stream, group = %config.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %config.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        info!(stream = %config.stream, consumer = %config.consumer, "Connected to trigger stream");
        Ok(Self {
            conn,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            block_ms: config.block_ms as usize,
            redelivery_idle_ms: config.redelivery_idle_ms,
        })
    }

    /// Take over entries another consumer (or an earlier nack) left idle
    async fn reclaim(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.redelivery_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let entries = match &reply {
            Value::Bulk(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
            _ => Vec::new(),
        };

        let mut deliveries = Vec::with_capacity(entries.len());
        for (id, body) in entries {
            match body {
                Some(body) => deliveries.push(Delivery {
                    id,
                    body,
                    attempt: 2,
                }),
                None => {
                    // Entry was trimmed while pending
                    conn.xack::<_, _, _, i64>(&self.stream, &self.group, &[&id])
                        .await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn read_new(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(self.block_ms);

        let reply: Value = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;

        // A missing payload field surfaces as an empty body and is discarded downstream
        Ok(parse_read_reply(&reply)
            .into_iter()
            .map(|(id, body)| Delivery {
                id,
                body: body.unwrap_or_default(),
                attempt: 1,
            })
            .collect())
    }
}

#[async_trait]
impl TriggerPublisher for RedisTriggerStream {
    async fn publish(&self, payload: &TriggerPayload) -> Result<String> {
        let body = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.stream, "*", &[(PAYLOAD_FIELD, body.as_str())])
            .await?;
        debug!(message_id = %id, order_id = %payload.order_id(), action = %payload.action, "Published trigger");
        Ok(id)
    }
}

#[async_trait]
impl TriggerSource for RedisTriggerStream {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let max = max.max(1);
        let mut deliveries = self.reclaim(max).await?;
        if deliveries.len() < max {
            let fresh = self.read_new(max - deliveries.len()).await?;
            deliveries.extend(fresh);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&self.stream, &self.group, &[&delivery.id])
            .await?;
        conn.xdel::<_, _, i64>(&self.stream, &[&delivery.id]).await?;
        if acked == 0 {
            warn!(message_id = %delivery.id, "Ack for entry that was not pending");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        // Stays pending; XAUTOCLAIM hands it out again once idle
        debug!(
            message_id = %delivery.id,
            retry_after_ms = self.redelivery_idle_ms,
            "Left delivery pending for redelivery"
        );
        Ok(())
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `[[id, [field, value, ...]], ...]` into `(id, payload)`. A nil field list
/// (deleted entry) or a missing payload field yields `None`.
fn parse_entries(value: &Value) -> Vec<(String, Option<String>)> {
    let Value::Bulk(entries) = value else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let Value::Bulk(parts) = entry else {
                return None;
            };
            let id = parts.first().and_then(value_to_string)?;
            let body = match parts.get(1) {
                Some(Value::Bulk(fields)) => fields
                    .chunks(2)
                    .find(|pair| {
                        pair.len() == 2
                            && value_to_string(&pair[0]).as_deref() == Some(PAYLOAD_FIELD)
                    })
                    .and_then(|pair| value_to_string(&pair[1])),
                _ => None,
            };
            Some((id, body))
        })
        .collect()
}

/// XREADGROUP reply: nil on timeout, else `[[stream, entries], ...]`
fn parse_read_reply(value: &Value) -> Vec<(String, Option<String>)> {
    match value {
        Value::Bulk(streams) => streams
            .iter()
            .filter_map(|stream| match stream {
                Value::Bulk(parts) if parts.len() >= 2 => Some(parse_entries(&parts[1])),
                _ => None,
            })
            .flatten()
            .collect(),
        _ => Vec::new(),
    }
}
