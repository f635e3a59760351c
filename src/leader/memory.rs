//! In-memory lease lock for tests

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{LeaseLock, LeaseRecord};
use crate::store::StoreError;

pub struct MemoryLeaseLock {
    name: String,
    state: Mutex<Option<(LeaseRecord, String)>>,
    version: AtomicU64,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl MemoryLeaseLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(None),
            version: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    async fn check(&self) -> Result<(), StoreError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::NotSynced(format!("lease {} unavailable", self.name)));
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<(LeaseRecord, String)>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.lock_state().as_ref().map(|(r, _)| r.clone())
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every call block forever, like an unresponsive API server
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Hand the lease to `holder` behind everyone's back
    pub fn force_holder(&self, holder: &str) {
        let version = self.next_version();
        let mut state = self.lock_state();
        if let Some((record, v)) = state.as_mut() {
            record.holder_identity = holder.to_string();
            record.renew_time = chrono::Utc::now();
            *v = version;
        }
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn get(&self) -> Result<Option<(LeaseRecord, String)>, StoreError> {
        self.check().await?;
        Ok(self.lock_state().clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.check().await?;
        let version = self.next_version();
        let mut state = self.lock_state();
        if state.is_some() {
            return Err(StoreError::Conflict(format!("lease {}", self.name)));
        }
        *state = Some((record.clone(), version));
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), StoreError> {
        self.check().await?;
        let next = self.next_version();
        let mut state = self.lock_state();
        match state.as_ref() {
            Some((_, current)) if current == version => {
                *state = Some((record.clone(), next));
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!("lease {}", self.name))),
            None => Err(StoreError::NotFound {
                kind: "Lease",
                name: self.name.clone(),
            }),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
