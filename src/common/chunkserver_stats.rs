//! Per-chunkserver operation counters and defect tracking.
//!
//! For each chunkserver we track how many of our read/write operations are
//! in flight and whether the server recently looked overloaded or offline
//! ("defective"). When several servers can satisfy a request, the one with
//! the best score and the fewest pending operations wins. The defect flag
//! decays after a timeout so recovered servers get traffic again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::NetworkAddress;

const DEFECTIVE_TIMEOUT: Duration = Duration::from_millis(2000);

// don't be too pedantic to prevent overflows
const MAX_DEFECTS: u32 = 1000;

#[derive(Clone, Debug)]
pub struct ChunkserverEntry {
    pending_reads: u32,
    pending_writes: u32,
    defects: u32,
    defective_until: Option<Instant>,
}

impl ChunkserverEntry {
    fn new() -> Self {
        Self { pending_reads: 0, pending_writes: 0, defects: 0, defective_until: None }
    }

    pub fn pending_reads(&self) -> u32 {
        self.pending_reads
    }

    pub fn pending_writes(&self) -> u32 {
        self.pending_writes
    }

    pub fn operation_count(&self) -> u32 {
        self.pending_reads + self.pending_writes
    }

    pub fn score(&self) -> f32 {
        self.score_at(Instant::now())
    }

    pub fn score_at(&self, now: Instant) -> f32 {
        match self.defective_until {
            Some(until) if self.defects > 0 && now < until => 1.0 / (self.defects + 1) as f32,
            _ => 1.0,
        }
    }
}

/// Registry of per-chunkserver statistics. All methods are thread safe; an
/// unknown address gets a fresh entry.
#[derive(Default)]
pub struct ChunkserverStats {
    entries: Mutex<HashMap<NetworkAddress, ChunkserverEntry>>,
}

impl ChunkserverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statistics_for(&self, address: NetworkAddress) -> ChunkserverEntry {
        self.entries.lock().entry(address).or_insert_with(ChunkserverEntry::new).clone()
    }

    pub fn register_read_operation(&self, address: NetworkAddress) {
        self.entries.lock().entry(address).or_insert_with(ChunkserverEntry::new).pending_reads += 1;
    }

    pub fn unregister_read_operation(&self, address: NetworkAddress) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&address) {
            entry.pending_reads = entry.pending_reads.saturating_sub(1);
        }
    }

    pub fn register_write_operation(&self, address: NetworkAddress) {
        self.entries.lock().entry(address).or_insert_with(ChunkserverEntry::new).pending_writes +=
            1;
    }

    pub fn unregister_write_operation(&self, address: NetworkAddress) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&address) {
            entry.pending_writes = entry.pending_writes.saturating_sub(1);
        }
    }

    pub fn mark_defective(&self, address: NetworkAddress) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(address).or_insert_with(ChunkserverEntry::new);
        if entry.defects < MAX_DEFECTS {
            entry.defects += 1;
        }
        entry.defective_until = Some(Instant::now() + DEFECTIVE_TIMEOUT);
    }

    pub fn mark_working(&self, address: NetworkAddress) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(address).or_insert_with(ChunkserverEntry::new);
        entry.defects = 0;
    }
}

/// Request-scoped proxy over [`ChunkserverStats`]. Dropping the proxy
/// unregisters every operation registered through it, so error paths cannot
/// leak pending-operation counts.
pub struct ChunkserverStatsProxy {
    stats: Arc<ChunkserverStats>,
    read_operations: HashMap<NetworkAddress, u32>,
    write_operations: HashMap<NetworkAddress, u32>,
}

impl ChunkserverStatsProxy {
    pub fn new(stats: Arc<ChunkserverStats>) -> Self {
        Self { stats, read_operations: HashMap::new(), write_operations: HashMap::new() }
    }

    pub fn register_read_operation(&mut self, address: NetworkAddress) {
        self.stats.register_read_operation(address);
        *self.read_operations.entry(address).or_insert(0) += 1;
    }

    pub fn unregister_read_operation(&mut self, address: NetworkAddress) {
        self.stats.unregister_read_operation(address);
        if let Some(count) = self.read_operations.get_mut(&address) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn register_write_operation(&mut self, address: NetworkAddress) {
        self.stats.register_write_operation(address);
        *self.write_operations.entry(address).or_insert(0) += 1;
    }

    pub fn unregister_write_operation(&mut self, address: NetworkAddress) {
        self.stats.unregister_write_operation(address);
        if let Some(count) = self.write_operations.get_mut(&address) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn mark_defective(&self, address: NetworkAddress) {
        self.stats.mark_defective(address);
    }

    pub fn mark_working(&self, address: NetworkAddress) {
        self.stats.mark_working(address);
    }

    /// Mark every server that still has an operation registered through this
    /// proxy as defective. Used when a connection breaks mid-request and we
    /// cannot tell which server caused it.
    pub fn all_pending_defective(&self) {
        for (address, count) in &self.read_operations {
            if *count > 0 {
                self.stats.mark_defective(*address);
            }
        }
        for (address, count) in &self.write_operations {
            if *count > 0 {
                self.stats.mark_defective(*address);
            }
        }
    }
}

impl Drop for ChunkserverStatsProxy {
    fn drop(&mut self) {
        for (address, count) in &self.read_operations {
            for _ in 0..*count {
                self.stats.unregister_read_operation(*address);
            }
        }
        for (address, count) in &self.write_operations {
            for _ in 0..*count {
                self.stats.unregister_write_operation(*address);
            }
        }
    }
}
