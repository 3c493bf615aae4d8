use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for batch submission traffic.
#[derive(Debug, Default)]
pub struct CpStats {
    flushes: AtomicU64,
    implicit_flushes: AtomicU64,
    empty_flushes: AtomicU64,
    submit_failures: AtomicU64,
    dwords_submitted: AtomicU64,
    owner_switches: AtomicU64,
    aperture_retries: AtomicU64,
    query_drains: AtomicU64,
}

impl CpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_implicit_flushes(&self) {
        self.implicit_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_empty_flushes(&self) {
        self.empty_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submit_failures(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dwords_submitted(&self, dwords: u64) {
        self.dwords_submitted.fetch_add(dwords, Ordering::Relaxed);
    }

    pub fn inc_owner_switches(&self) {
        self.owner_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_aperture_retries(&self) {
        self.aperture_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_query_drains(&self) {
        self.query_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CpStatsSnapshot {
        CpStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            implicit_flushes: self.implicit_flushes.load(Ordering::Relaxed),
            empty_flushes: self.empty_flushes.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            dwords_submitted: self.dwords_submitted.load(Ordering::Relaxed),
            owner_switches: self.owner_switches.load(Ordering::Relaxed),
            aperture_retries: self.aperture_retries.load(Ordering::Relaxed),
            query_drains: self.query_drains.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpStatsSnapshot {
    /// Batches ended, whether or not the winsys accepted them.
    pub flushes: u64,
    /// Subset of `flushes` triggered by running out of space.
    pub implicit_flushes: u64,
    /// Flush requests with nothing to submit.
    pub empty_flushes: u64,
    pub submit_failures: u64,
    pub dwords_submitted: u64,
    pub owner_switches: u64,
    pub aperture_retries: u64,
    pub query_drains: u64,
}

impl CpStatsSnapshot {
    pub fn to_json(self) -> String {
        format!(
            "{{\"flushes\":{},\"implicit_flushes\":{},\"empty_flushes\":{},\"submit_failures\":{},\"dwords_submitted\":{},\"owner_switches\":{},\"aperture_retries\":{},\"query_drains\":{}}}",
            self.flushes,
            self.implicit_flushes,
            self.empty_flushes,
            self.submit_failures,
            self.dwords_submitted,
            self.owner_switches,
            self.aperture_retries,
            self.query_drains,
        )
    }
}
