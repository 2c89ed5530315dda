//! Lease locks serializing deployment runs.
//!
//! A lease is a value `<owner>:<unix expiry>` stored under a well-known key.
//! Acquisition polls until the key is free or its lease has expired, then
//! claims it with compare-and-set. While held, a background task renews the
//! lease; a crashed holder's lease simply expires.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use drydock_id::LockOwnerId;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::DirectorConfig;

/// Delay between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lock errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another owner held the lease for the whole timeout.
    #[error("failed to acquire lock '{name}' within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The lease was taken over while we thought we held it.
    #[error("lock '{0}' was lost")]
    Lost(String),

    #[error("lease store error: {0}")]
    Store(String),
}

/// Storage for leases. Only compare-and-set semantics are required.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    /// Set `key` to `value` only if it currently holds `expected`
    /// (`None` = absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, LockError>;

    /// Remove `key` only if it still holds `expected`.
    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, LockError>;
}

/// Lease store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<BTreeMap<String, String>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        Ok(self.leases().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, LockError> {
        let mut leases = self.leases();
        if leases.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        leases.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut leases = self.leases();
        if leases.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        leases.remove(key);
        Ok(true)
    }
}

fn encode_lease(owner: &LockOwnerId, expiry: i64) -> String {
    format!("{}:{}", owner, expiry)
}

/// Expiry of a lease value; unparseable values count as expired.
fn lease_expiry(value: &str) -> i64 {
    value
        .rsplit_once(':')
        .and_then(|(_, expiry)| expiry.parse().ok())
        .unwrap_or(i64::MIN)
}

fn expiry_from_now(lifetime: Duration) -> i64 {
    Utc::now().timestamp() + i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX / 2)
}

/// A named lease lock.
pub struct Lock {
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: LockOwnerId,
    timeout: Duration,
    expiry: Duration,
}

impl Lock {
    pub fn new(store: Arc<dyn LeaseStore>, name: String, timeout: Duration, expiry: Duration) -> Self {
        Self {
            store,
            name,
            owner: LockOwnerId::new(),
            timeout,
            expiry,
        }
    }

    /// Lock serializing all runs against one deployment.
    pub fn deployment(store: Arc<dyn LeaseStore>, deployment: &str, config: &DirectorConfig) -> Self {
        Self::new(
            store,
            format!("lock:deployment:{}", deployment),
            config.lock_timeout,
            config.lock_expiry,
        )
    }

    pub fn release(store: Arc<dyn LeaseStore>, release: &str, config: &DirectorConfig) -> Self {
        Self::new(
            store,
            format!("lock:release:{}", release),
            config.lock_timeout,
            config.lock_expiry,
        )
    }

    pub fn stemcell(
        store: Arc<dyn LeaseStore>,
        name: &str,
        version: &str,
        config: &DirectorConfig,
    ) -> Self {
        Self::new(
            store,
            format!("lock:stemcells:{}:{}", name, version),
            config.lock_timeout,
            config.lock_expiry,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll until the lease is ours or the timeout passes.
    pub async fn acquire(self) -> Result<LockGuard, LockError> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let value = loop {
            let candidate = encode_lease(&self.owner, expiry_from_now(self.expiry));
            let acquired = match self.store.get(&self.name).await? {
                None => self.store.compare_and_set(&self.name, None, &candidate).await?,
                Some(current) if lease_expiry(&current) < Utc::now().timestamp() => {
                    debug!(lock = %self.name, stale = %current, "reclaiming expired lease");
                    self.store
                        .compare_and_set(&self.name, Some(&current), &candidate)
                        .await?
                }
                Some(_) => false,
            };
            if acquired {
                break candidate;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    name: self.name,
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        info!(lock = %self.name, owner = %self.owner, "Acquired lock");
        let value = Arc::new(Mutex::new(value));
        let renewal = tokio::spawn(renew(
            self.store.clone(),
            self.name.clone(),
            self.owner,
            self.expiry,
            value.clone(),
        ));

        Ok(LockGuard {
            store: self.store,
            name: self.name,
            value,
            renewal,
        })
    }
}

async fn renew(
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: LockOwnerId,
    expiry: Duration,
    value: Arc<Mutex<String>>,
) {
    let period = (expiry / 2).max(Duration::from_millis(100));
    loop {
        tokio::time::sleep(period).await;
        let current = value.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let next = encode_lease(&owner, expiry_from_now(expiry));
        match store.compare_and_set(&name, Some(&current), &next).await {
            Ok(true) => *value.lock().unwrap_or_else(|e| e.into_inner()) = next,
            Ok(false) => {
                warn!(lock = %name, "lease was taken over, stopping renewal");
                return;
            }
            Err(e) => warn!(lock = %name, error = %e, "failed to renew lease"),
        }
    }
}

/// A held lock. Release explicitly; dropping stops renewal and lets the
/// lease expire.
pub struct LockGuard {
    store: Arc<dyn LeaseStore>,
    name: String,
    value: Arc<Mutex<String>>,
    renewal: JoinHandle<()>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(self) -> Result<(), LockError> {
        self.renewal.abort();
        let current = self.value.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if self.store.delete_if(&self.name, &current).await? {
            info!(lock = %self.name, "Released lock");
            Ok(())
        } else {
            Err(LockError::Lost(self.name.clone()))
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
