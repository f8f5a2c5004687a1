//! In-memory job store.
//!
//! Used by tests and single-process deployments. Counts reads and can be
//! switched into an unavailable mode to simulate transient store failures,
//! or given a read delay to simulate a slow backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use vsum_models::{CorrelationToken, JobId, ProcessingJob};

use crate::error::{StoreError, StoreResult};
use crate::store::{check_write, JobStore};

#[derive(Default)]
struct Records {
    jobs: HashMap<JobId, ProcessingJob>,
    tokens: HashMap<CorrelationToken, JobId>,
}

/// Job store backed by a process-local map.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<Records>,
    reads: AtomicU64,
    writes: AtomicU64,
    unavailable: AtomicBool,
    read_delay_ms: AtomicU64,
    reads_in_flight: AtomicU64,
    peak_reads_in_flight: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read operations served (successful or not).
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful write operations.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent operation fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Hold every subsequent read for `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest number of reads that were in progress at the same time.
    pub fn peak_reads_in_flight(&self) -> u64 {
        self.peak_reads_in_flight.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Count the read as in flight and apply the configured delay. Reads
    /// abandoned mid-delay still leave the in-flight count.
    async fn begin_read(&self) -> scopeguard::ScopeGuard<(), impl FnOnce(()) + '_> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_reads_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let guard = scopeguard::guard((), move |_| {
            self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        guard
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::transient("memory store marked unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ProcessingJob) -> StoreResult<()> {
        self.check_available()?;
        check_write(None, job)?;

        let mut records = self.records.write().await;
        if records.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        if records.tokens.contains_key(&job.correlation_token) {
            return Err(StoreError::TokenInUse(job.correlation_token.to_string()));
        }

        records
            .tokens
            .insert(job.correlation_token.clone(), job.id.clone());
        records.jobs.insert(job.id.clone(), job.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<ProcessingJob>> {
        let _read = self.begin_read().await;
        self.check_available()?;
        Ok(self.records.read().await.jobs.get(id).cloned())
    }

    async fn find_by_token(&self, token: &CorrelationToken) -> StoreResult<Option<ProcessingJob>> {
        let _read = self.begin_read().await;
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records
            .tokens
            .get(token)
            .and_then(|id| records.jobs.get(id))
            .cloned())
    }

    async fn save(&self, job: &ProcessingJob) -> StoreResult<()> {
        self.check_available()?;

        let mut records = self.records.write().await;
        let previous = records
            .jobs
            .get(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;
        check_write(Some(previous), job)?;

        records.jobs.insert(job.id.clone(), job.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
