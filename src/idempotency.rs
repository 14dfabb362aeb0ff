use crate::models::ComposeResponse;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const KEY_PREFIX: &str = "compose:idem:";

/// Replays the stored response for a repeated `Idempotency-Key`. Redis when
/// configured, otherwise an in-process map with the same TTL.
///
/// A key is reserved before the pipeline runs, so a concurrent duplicate sees
/// it as in flight instead of calling the capability a second time.
#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, Record)>>>,
    ttl: Duration,
}

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Debug)]
pub enum Reservation {
    /// The caller owns the key and must `complete` or `release` it.
    Reserved,
    Replay(Box<ComposeResponse>),
    InFlight,
    /// The key was first used with a different request body.
    Mismatch,
}

#[derive(Clone, Serialize, Deserialize)]
struct Record {
    fingerprint: String,
    response: Option<ComposeResponse>,
}

impl Record {
    fn classify(self, fingerprint: &str) -> Reservation {
        if self.fingerprint != fingerprint {
            return Reservation::Mismatch;
        }
        match self.response {
            Some(response) => Reservation::Replay(Box::new(response)),
            None => Reservation::InFlight,
        }
    }
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::from_secs(ttl_secs.max(1)),
        }
    }

    pub async fn begin(&self, key: &str, fingerprint: &str) -> Reservation {
        let pending = Record {
            fingerprint: fingerprint.to_string(),
            response: None,
        };
        if let Some(client) = &self.redis {
            return redis_begin(client, key, &pending, self.ttl.as_secs()).await;
        }

        let mut guard = self.local.lock().await;
        let ttl = self.ttl;
        guard.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        match guard.get(key) {
            Some((_, record)) => record.clone().classify(fingerprint),
            None => {
                guard.insert(key.to_string(), (Instant::now(), pending));
                Reservation::Reserved
            }
        }
    }

    pub async fn complete(&self, key: &str, fingerprint: &str, response: &ComposeResponse) {
        let record = Record {
            fingerprint: fingerprint.to_string(),
            response: Some(response.clone()),
        };
        if let Some(client) = &self.redis {
            redis_set(client, key, &record, self.ttl.as_secs()).await;
            return;
        }
        self.local
            .lock()
            .await
            .insert(key.to_string(), (Instant::now(), record));
    }

    /// Drops a reservation after a failed run so the caller can retry.
    pub async fn release(&self, key: &str) {
        if let Some(client) = &self.redis {
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                let _: Result<(), _> = conn.del(format!("{KEY_PREFIX}{key}")).await;
            }
            return;
        }
        self.local.lock().await.remove(key);
    }
}

async fn redis_begin(
    client: &redis::Client,
    key: &str,
    pending: &Record,
    ttl_secs: u64,
) -> Reservation {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "compose.idempotency", error = %err, "redis unavailable; running without replay");
            return Reservation::Reserved;
        }
    };
    let Ok(json) = serde_json::to_string(pending) else {
        return Reservation::Reserved;
    };
    let redis_key = format!("{KEY_PREFIX}{key}");
    let set: redis::RedisResult<Option<String>> = redis::cmd("SET")
        .arg(&redis_key)
        .arg(json)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(&mut conn)
        .await;
    match set {
        Ok(Some(_)) => Reservation::Reserved,
        Ok(None) => {
            let existing: redis::RedisResult<Option<String>> = conn.get(&redis_key).await;
            match existing.ok().flatten().and_then(|v| serde_json::from_str::<Record>(&v).ok()) {
                Some(record) => record.classify(&pending.fingerprint),
                // Expired between SET and GET.
                None => Reservation::InFlight,
            }
        }
        Err(err) => {
            warn!(target = "compose.idempotency", error = %err, "redis reservation failed");
            Reservation::Reserved
        }
    }
}

async fn redis_set(client: &redis::Client, key: &str, value: &Record, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn
            .set_ex(format!("{KEY_PREFIX}{key}"), json, ttl_secs)
            .await;
    }
}
