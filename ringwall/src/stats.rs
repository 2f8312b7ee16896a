use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use ringwall_common::MAX_LCORE;

/// Counters owned by one lcore. Only that lcore writes them.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CoreStats {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub dropped: AtomicU64,
    pub stolen: AtomicU64,
    pub tx_shortfall: AtomicU64,
    pub ring_full_spins: AtomicU64,
}

impl CoreStats {
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn read(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            tx_shortfall: self.tx_shortfall.load(Ordering::Relaxed),
            ring_full_spins: self.ring_full_spins.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
    pub stolen: u64,
    pub tx_shortfall: u64,
    pub ring_full_spins: u64,
}

impl StatsSnapshot {
    fn accumulate(&mut self, other: &StatsSnapshot) {
        self.rx += other.rx;
        self.tx += other.tx;
        self.dropped += other.dropped;
        self.stolen += other.stolen;
        self.tx_shortfall += other.tx_shortfall;
        self.ring_full_spins += other.ring_full_spins;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatsEntry {
    pub lcore: u16,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

/// One cache-line-aligned [`CoreStats`] per possible lcore.
pub struct StatsTable {
    cores: Box<[CoreStats]>,
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTable {
    pub fn new() -> Self {
        Self {
            cores: (0..MAX_LCORE).map(|_| CoreStats::default()).collect(),
        }
    }

    /// Counters of `lcore`. Out-of-range ids map onto the last entry.
    #[inline]
    pub fn core(&self, lcore: u16) -> &CoreStats {
        let index = (lcore as usize).min(self.cores.len() - 1);
        &self.cores[index]
    }

    pub fn totals(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for core in self.cores.iter() {
            total.accumulate(&core.read());
        }
        total
    }

    pub fn per_core(&self, lcores: impl IntoIterator<Item = u16>) -> Vec<CoreStatsEntry> {
        lcores
            .into_iter()
            .map(|lcore| CoreStatsEntry {
                lcore,
                stats: self.core(lcore).read(),
            })
            .collect()
    }
}
