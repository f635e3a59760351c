//! # Leader election
//!
//! Only one master instance drives reconciliation at a time. Leadership is a
//! time-bounded lease that the holder renews every `retryPeriod`; a holder
//! that cannot renew within `renewDeadline` gives up and the whole subsystem
//! is shut down.
//!
//! [`decide`] holds the lease logic; [`LeaseLock`] implementations only read
//! and write the record.

pub mod kube;
pub mod memory;

pub use self::kube::KubeLeaseLock;
pub use memory::MemoryLeaseLock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaderElectionConfig;
use crate::store::{with_timeout, StoreError};

#[derive(Error, Debug)]
pub enum LeaderError {
    #[error("Lease store error: {0}")]
    Store(#[from] StoreError),

    #[error("Leader election cancelled")]
    Cancelled,

    #[error("Failed to determine identity: {0}")]
    Identity(String),
}

/// Contents of the lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub lease_duration: Duration,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub transitions: i32,
}

impl LeaseRecord {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let duration = chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        self.renew_time
            .checked_add_signed(duration)
            .map(|expiry| now > expiry)
            .unwrap_or(false)
    }
}

/// What to do with the current lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Nobody holds a valid lease; take it
    Acquire,
    /// We hold it; extend it
    Renew,
    /// Someone else holds a valid lease
    Wait { holder: String },
}

pub fn decide(current: Option<&LeaseRecord>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    match current {
        None => LeaseDecision::Acquire,
        Some(record) if record.holder_identity == identity => LeaseDecision::Renew,
        Some(record) if record.holder_identity.is_empty() || record.expired_at(now) => {
            LeaseDecision::Acquire
        }
        Some(record) => LeaseDecision::Wait {
            holder: record.holder_identity.clone(),
        },
    }
}

/// Storage of a single lease record with optimistic concurrency
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Current record and its version
    async fn get(&self) -> Result<Option<(LeaseRecord, String)>, StoreError>;

    async fn create(&self, record: &LeaseRecord) -> Result<(), StoreError>;

    /// Replace the record, failing with `Conflict` if `version` is stale
    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

/// Identity of this process in the lease: the host name
pub fn default_identity() -> Result<String, LeaderError> {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .map_err(|e| LeaderError::Identity(e.to_string()))
}

// ============================================================================
// Elector
// ============================================================================

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, identity: impl Into<String>, config: LeaderElectionConfig) -> Self {
        Self {
            lock,
            identity: identity.into(),
            config,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One acquire-or-renew round; `true` if we hold the lease afterwards
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderError> {
        let now = Utc::now();
        let current = with_timeout(self.lock.get()).await?;

        let Some((record, version)) = current else {
            with_timeout(self.lock.create(&self.new_record(now, 0))).await?;
            return Ok(true);
        };

        match decide(Some(&record), &self.identity, now) {
            LeaseDecision::Wait { holder } => {
                debug!("Lease {} held by {}", self.lock.describe(), holder);
                Ok(false)
            }
            LeaseDecision::Renew => {
                let renewed = LeaseRecord {
                    renew_time: now,
                    lease_duration: self.config.lease_duration,
                    ..record
                };
                with_timeout(self.lock.update(&renewed, &version)).await?;
                Ok(true)
            }
            LeaseDecision::Acquire => {
                let taken = self.new_record(now, record.transitions + 1);
                with_timeout(self.lock.update(&taken, &version)).await?;
                Ok(true)
            }
        }
    }

    fn new_record(&self, now: DateTime<Utc>, transitions: i32) -> LeaseRecord {
        LeaseRecord {
            holder_identity: self.identity.clone(),
            lease_duration: self.config.lease_duration,
            acquire_time: now,
            renew_time: now,
            transitions,
        }
    }

    /// Block until the lease is ours or `shutdown` fires
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<(), LeaderError> {
        info!("Waiting for lease {} as {}", self.lock.describe(), self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired lease {}", self.lock.describe());
                    return Ok(());
                }
                Ok(false) => {}
                Err(LeaderError::Store(StoreError::Conflict(_))) => {
                    debug!("Lost race for lease {}", self.lock.describe());
                }
                Err(e) => warn!("Failed to acquire lease {}: {}", self.lock.describe(), e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Err(LeaderError::Cancelled),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing in the background. When renewal keeps failing for
    /// `renewDeadline`, or someone else takes the lease, `lost` is cancelled.
    pub fn spawn_renewal(self: Arc<Self>, lost: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_renewal = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = lost.cancelled() => return,
                    _ = tokio::time::sleep(self.config.retry_period) => {}
                }

                // A round may not outlast the deadline
                let remaining = self.config.renew_deadline.saturating_sub(last_renewal.elapsed());
                let round = tokio::time::timeout(remaining, self.try_acquire_or_renew())
                    .await
                    .unwrap_or(Err(LeaderError::Store(StoreError::Timeout(remaining))));

                match round {
                    Ok(true) => {
                        last_renewal = tokio::time::Instant::now();
                        continue;
                    }
                    Ok(false) => {
                        error!("Lease {} taken over by another instance", self.lock.describe());
                        lost.cancel();
                        return;
                    }
                    Err(e) => warn!("Failed to renew lease {}: {}", self.lock.describe(), e),
                }

                if last_renewal.elapsed() >= self.config.renew_deadline {
                    error!(
                        "Could not renew lease {} within {:?}",
                        self.lock.describe(),
                        self.config.renew_deadline
                    );
                    lost.cancel();
                    return;
                }
            }
        })
    }

    /// Give the lease up so another instance can take over at once
    pub async fn release(&self) -> Result<(), LeaderError> {
        if let Some((record, version)) = with_timeout(self.lock.get()).await? {
            if record.holder_identity == self.identity {
                let released = LeaseRecord {
                    holder_identity: String::new(),
                    ..record
                };
                with_timeout(self.lock.update(&released, &version)).await?;
                info!("Released lease {}", self.lock.describe());
            }
        }
        Ok(())
    }
}
