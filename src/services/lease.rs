//! Per-intent mutual exclusion around the read-check-write fulfillment steps.

use crate::errors::ServiceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Held while one delivery works on an intent.
#[derive(Debug)]
pub struct LeaseToken {
    intent_id: String,
    token: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LeaseToken {
    pub fn intent_id(&self) -> &str {
        &self.intent_id
    }
}

#[async_trait]
pub trait IntentLease: Send + Sync {
    /// `Ok(None)` when another holder keeps the lease past the wait budget.
    async fn acquire(&self, intent_id: &str) -> Result<Option<LeaseToken>, ServiceError>;
    async fn release(&self, lease: LeaseToken);
}

/// In-process lease: one async mutex per intent id.
pub struct LocalLease {
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_wait: Duration,
}

impl Default for LocalLease {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LocalLease {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            max_wait,
        }
    }

    /// Intents with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl IntentLease for LocalLease {
    async fn acquire(&self, intent_id: &str) -> Result<Option<LeaseToken>, ServiceError> {
        let lock = self
            .locks
            .entry(intent_id.to_string())
            .or_default()
            .clone();

        match tokio::time::timeout(self.max_wait, lock.lock_owned()).await {
            Ok(guard) => Ok(Some(LeaseToken {
                intent_id: intent_id.to_string(),
                token: Uuid::new_v4().to_string(),
                guard: Some(guard),
            })),
            Err(_) => {
                debug!(%intent_id, "intent lease wait timed out");
                Ok(None)
            }
        }
    }

    async fn release(&self, mut lease: LeaseToken) {
        drop(lease.guard.take());
        // Only the map holds the mutex once nobody waits on it.
        self.locks
            .remove_if(&lease.intent_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Cross-process lease: `SET key token NX PX ttl`, released by compare-and-delete.
pub struct RedisLease {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
    prefix: String,
}

impl RedisLease {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, ServiceError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ttl,
            prefix: "lease:intent:".to_string(),
        })
    }

    fn key(&self, intent_id: &str) -> String {
        format!("{}{}", self.prefix, intent_id)
    }
}

#[async_trait]
impl IntentLease for RedisLease {
    async fn acquire(&self, intent_id: &str) -> Result<Option<LeaseToken>, ServiceError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(intent_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| LeaseToken {
            intent_id: intent_id.to_string(),
            token,
            guard: None,
        }))
    }

    async fn release(&self, lease: LeaseToken) {
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(&lease.intent_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            // The TTL frees the key eventually.
            warn!(intent_id = %lease.intent_id, error = %e, "failed to release intent lease");
        }
    }
}
