//! Locks in a JetStream key-value bucket.
//!
//! `create` only succeeds when the key is absent, which gives mutual
//! exclusion. The bucket's max age stands in for session-bound locks: an
//! entry left by a crashed holder expires after the configured TTL.

use async_nats::jetstream::kv;
use async_trait::async_trait;
use std::fmt::Write;
use std::time::Duration;
use strata_core::ports::LockService;
use strata_core::{Error, Result};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::connection::NatsConnection;

/// Lock service over the configured bucket.
#[derive(Clone)]
pub struct NatsLockService {
    connection: NatsConnection,
    store: kv::Store,
}

impl NatsLockService {
    pub async fn new(connection: NatsConnection) -> Result<Self> {
        let config = connection.config();
        let store = connection
            .jetstream()
            .create_key_value(kv::Config {
                bucket: config.lock_bucket.clone(),
                history: 1,
                max_age: config.lock_ttl(),
                storage: async_nats::jetstream::stream::StorageType::Memory,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Internal(format!("Failed to open lock bucket: {}", e)))?;

        info!(bucket = %config.lock_bucket, ttl = ?config.lock_ttl(), "Lock bucket ready");
        Ok(Self { connection, store })
    }

    /// Live entry for `key`; delete markers count as absent.
    async fn held_entry(&self, key: &str) -> Result<Option<kv::Entry>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read lock {}: {}", key, e)))?;
        Ok(entry.filter(|e| e.operation == kv::Operation::Put))
    }

    /// Delete `key` only while it is still at `revision`. Returns false when
    /// the entry moved on, i.e. it expired and somebody else now holds it.
    async fn delete_revision(&self, key: &str, revision: u64) -> Result<bool> {
        match self.store.delete_expect_revision(key, Some(revision)).await {
            Ok(()) => Ok(true),
            Err(e) => match self.held_entry(key).await? {
                Some(current) if current.revision == revision => Err(Error::Internal(format!(
                    "Failed to release {}: {}",
                    key, e
                ))),
                _ => Ok(false),
            },
        }
    }
}

/// Map a lock path onto the key alphabet: `/strata/agents/a,b` becomes
/// `strata/agents/a=2Cb`. Distinct paths stay distinct.
pub(crate) fn bucket_key(path: &str) -> String {
    let mut key = String::with_capacity(path.len());
    for byte in path.trim_start_matches('/').bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'/' => {
                key.push(byte as char)
            }
            other => {
                let _ = write!(key, "={:02X}", other);
            }
        }
    }
    if key.is_empty() {
        key.push('_');
    }
    key
}

#[async_trait]
impl LockService for NatsLockService {
    async fn acquire(&self, path: &str, owner: &str, timeout: Duration) -> Result<()> {
        let key = bucket_key(path);
        let deadline = Instant::now() + timeout;
        let metrics = self.connection.metrics();
        let poll = self.connection.config().lock_poll();

        loop {
            match self.store.create(&key, owner.to_string().into()).await {
                Ok(_) => {
                    metrics.record_lock_acquired();
                    debug!(path, owner, "Lock acquired");
                    return Ok(());
                }
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                    metrics.record_lock_contention();
                }
                Err(e) => {
                    return Err(Error::Internal(format!("Failed to acquire {}: {}", path, e)));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                metrics.record_lock_timeout();
                return Err(Error::LockTimeout(path.to_string()));
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    async fn release(&self, path: &str, owner: &str) -> Result<()> {
        let key = bucket_key(path);
        let Some(entry) = self.held_entry(&key).await? else {
            return Ok(());
        };

        let holder = String::from_utf8_lossy(&entry.value);
        if holder != owner {
            warn!(path, owner, holder = %holder, "Refusing to release lock held by another owner");
            return Ok(());
        }

        if self.delete_revision(&key, entry.revision).await? {
            debug!(path, owner, "Lock released");
        } else {
            warn!(path, owner, "Lock expired and was taken over before release");
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.held_entry(&bucket_key(path)).await?.is_some())
    }
}
