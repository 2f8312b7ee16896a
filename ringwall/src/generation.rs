//! Double-buffered configuration and the switch protocol.
//!
//! Two snapshot slots live for the whole process. A reload fills the inactive
//! slot from the active one and advances the global generation. Workers carry
//! their own `Arc<Snapshot>`; when they see `switch_in_progress` on it they
//! move to the other slot and publish the global generation as their own.
//! Once every registered core has caught up, the old snapshot has no readers
//! left, its module state is freed and the other slot becomes active.
//!
//! A core that stops polling stalls retirement. That is reported in the log,
//! never papered over.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringwall_common::MAX_LCORE;

use crate::error::{Error, Result};
use crate::module::{Hook, Registry};
use crate::port::PortConfig;
use crate::snapshot::{ControlPorts, Slot, Snapshot};
use crate::worker::Role;

/// Generation of a core that is not running a packet loop.
pub const INACTIVE: i64 = -1;

/// Outcome of the last reload attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    pub generation: i64,
    pub ok: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

pub struct GenerationManager {
    slots: [ArcSwapOption<Snapshot>; 2],
    active: AtomicUsize,
    global: AtomicI64,
    cores: Box<[AtomicI64]>,
    registry: Arc<Registry>,
    quiesce_poll: Duration,
    last_reload: ArcSwapOption<ReloadStatus>,
    cycling: AtomicBool,
}

impl GenerationManager {
    /// Run every module's `init` on `initial` and install it as slot A.
    pub fn new(registry: Arc<Registry>, mut initial: Snapshot, quiesce_poll: Duration) -> Result<Self> {
        initial.slot = Slot::A;
        registry.init_all(&mut initial)?;

        Ok(Self {
            slots: [
                ArcSwapOption::from_pointee(initial),
                ArcSwapOption::empty(),
            ],
            active: AtomicUsize::new(Slot::A.index()),
            global: AtomicI64::new(0),
            cores: (0..MAX_LCORE).map(|_| AtomicI64::new(INACTIVE)).collect(),
            registry,
            quiesce_poll,
            last_reload: ArcSwapOption::empty(),
            cycling: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn active_slot(&self) -> Slot {
        Slot::from_index(self.active.load(Ordering::Acquire))
    }

    /// The published active snapshot.
    pub fn active(&self) -> Option<Arc<Snapshot>> {
        let index = self.active.load(Ordering::Acquire);
        self.slots[index]
            .load_full()
            .or_else(|| self.slots[index ^ 1].load_full())
    }

    pub fn global_generation(&self) -> i64 {
        self.global.load(Ordering::Acquire)
    }

    /// Published generation of `lcore`, `None` while it is inactive.
    pub fn core_generation(&self, lcore: u16) -> Option<i64> {
        let generation = self.cores.get(lcore as usize)?.load(Ordering::Acquire);
        (generation != INACTIVE).then_some(generation)
    }

    pub fn last_reload(&self) -> Option<Arc<ReloadStatus>> {
        self.last_reload.load_full()
    }

    /// Enter `lcore` into the live set and hand it the active snapshot.
    pub fn register_core(&self, lcore: u16) -> Result<Arc<Snapshot>> {
        let cell = self
            .cores
            .get(lcore as usize)
            .ok_or_else(|| Error::Topology(format!("lcore {} out of range", lcore)))?;
        let snapshot = self
            .active()
            .ok_or_else(|| Error::Config("no active snapshot".into()))?;
        cell.store(self.global.load(Ordering::Acquire), Ordering::Release);
        tracing::debug!(lcore, generation = self.global_generation(), "core registered");
        Ok(snapshot)
    }

    /// Remove `lcore` from the live set. Retirement stops waiting for it.
    pub fn unregister_core(&self, lcore: u16) {
        if let Some(cell) = self.cores.get(lcore as usize) {
            cell.store(INACTIVE, Ordering::Release);
        }
    }

    /// Worker side of a switch: let go of `old`, take the other slot and
    /// publish the current generation.
    pub fn observe_switch(&self, old: Arc<Snapshot>, lcore: u16) -> Arc<Snapshot> {
        let Some(next) = self.slots[old.slot.other().index()].load_full() else {
            return old;
        };
        drop(old);
        if let Some(cell) = self.cores.get(lcore as usize) {
            cell.store(self.global.load(Ordering::Acquire), Ordering::Release);
        }
        next
    }

    /// Build the next snapshot from `active` in the other slot.
    ///
    /// Runs every module's `conf` on the copy. On failure the copy is
    /// discarded and `active` keeps serving.
    pub fn reload(&self, active: &Snapshot) -> Result<Arc<Snapshot>> {
        let mut next = active.fork(active.slot.other());
        self.registry.conf_all(&mut next)?;

        let next = Arc::new(next);
        self.slots[next.slot.index()].store(Some(Arc::clone(&next)));
        let generation = self.global.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, slot = ?next.slot, "configuration reloaded");
        Ok(next)
    }

    pub fn begin_switch(&self, old: &Snapshot) {
        old.set_switch_in_progress(true);
        tracing::info!(slot = ?old.slot, "switch started");
    }

    /// Wait until every live core runs on the current generation, then free
    /// `old` and publish the other slot as active. The retired slot is left
    /// empty.
    pub fn await_quiescence_and_retire(&self, old: Arc<Snapshot>) {
        let target = self.global_generation();
        let started = Instant::now();
        let mut rounds: u64 = 0;
        loop {
            let behind = self.lagging_cores(target);
            if behind.is_empty() {
                break;
            }
            rounds += 1;
            if rounds % 100 == 0 {
                tracing::warn!(
                    target,
                    ?behind,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "cores have not switched yet"
                );
            }
            thread::sleep(self.quiesce_poll);
        }

        let slot = old.slot;
        drop(old);
        let Some(mut retired) = self.slots[slot.index()].swap(None) else {
            tracing::error!(?slot, "retiring an empty slot");
            return;
        };
        // Every core has moved on; what is left are transient loads.
        let mut retired = loop {
            match Arc::try_unwrap(retired) {
                Ok(snapshot) => break snapshot,
                Err(shared) => {
                    retired = shared;
                    thread::sleep(self.quiesce_poll);
                }
            }
        };

        if let Err(e) = self.registry.free_all(&mut retired) {
            tracing::error!(?slot, "freeing retired snapshot failed: {}", e);
        }
        retired.set_switch_in_progress(false);

        // The slot stays empty until the next reload fills it, so readers
        // only ever find the new snapshot from here on.
        let next = slot.other();
        if retired.take_reload_request() {
            if let Some(active) = self.slots[next.index()].load_full() {
                active.request_reload();
            }
        }
        self.active.store(next.index(), Ordering::Release);
        drop(retired);
        tracing::info!(
            slot = ?next,
            generation = target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "switch complete"
        );
    }

    /// Full cycle: reload, switch, wait, retire. Blocks the caller until the
    /// slowest core has switched. Returns the new generation.
    pub fn switch(&self) -> Result<i64> {
        if self.cycling.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("a switch is already in progress".into()));
        }
        let result = self.cycle();
        self.cycling.store(false, Ordering::Release);

        let status = match &result {
            Ok(generation) => ReloadStatus {
                generation: *generation,
                ok: true,
                message: "ok".into(),
                at: Utc::now(),
            },
            Err(e) => {
                tracing::error!(generation = self.global_generation(), "reload failed: {}", e);
                ReloadStatus {
                    generation: self.global_generation(),
                    ok: false,
                    message: e.to_string(),
                    at: Utc::now(),
                }
            }
        };
        self.last_reload.store(Some(Arc::new(status)));
        result
    }

    fn cycle(&self) -> Result<i64> {
        let active = self
            .active()
            .ok_or_else(|| Error::Config("no active snapshot".into()))?;
        let next = self.reload(&active)?;
        let generation = self.global_generation();
        drop(next);

        self.begin_switch(&active);
        self.await_quiescence_and_retire(active);
        Ok(generation)
    }

    /// Ask the management loop for a reload.
    pub fn request_reload(&self) -> bool {
        match self.active() {
            Some(active) => {
                active.request_reload();
                true
            }
            None => false,
        }
    }

    /// Consume a pending reload request on the active snapshot.
    pub fn take_reload_request(&self) -> bool {
        self.active().is_some_and(|active| active.take_reload_request())
    }

    /// Free the active snapshot's module state. Call after every worker
    /// has been joined.
    pub fn shutdown(&self) -> Result<()> {
        let index = self.active.load(Ordering::Acquire);
        self.slots[index ^ 1].store(None);
        let Some(active) = self.slots[index].swap(None) else {
            return Ok(());
        };
        let mut snapshot = Arc::try_unwrap(active).map_err(|shared| {
            Error::Config(format!(
                "active snapshot still has {} holders at shutdown",
                Arc::strong_count(&shared) - 1
            ))
        })?;
        self.registry.free_all(&mut snapshot)?;
        tracing::info!(slot = ?snapshot.slot, "active snapshot freed");
        Ok(())
    }

    fn lagging_cores(&self, target: i64) -> Vec<u16> {
        self.cores
            .iter()
            .enumerate()
            .filter_map(|(lcore, cell)| {
                let generation = cell.load(Ordering::Acquire);
                (generation != INACTIVE && generation < target).then_some(lcore as u16)
            })
            .collect()
    }

    pub fn dump(&self) -> Option<ConfigDump> {
        let active = self.active()?;
        let workers = active
            .workers
            .iter()
            .map(|w| WorkerDump {
                lcore: w.lcore,
                role: w.role,
                ports: w.ports.clone(),
                queues: w.queues.clone(),
                generation: self.core_generation(w.lcore),
            })
            .collect();
        let modules = self
            .registry
            .iter()
            .map(|m| ModuleDump {
                id: m.id().0,
                name: m.name(),
                enabled: m.enabled(),
                state: m.describe(&active),
            })
            .collect();
        let pipeline = Hook::ALL
            .iter()
            .filter_map(|&hook| {
                let names: Vec<&'static str> = self
                    .registry
                    .hooks()
                    .modules(hook)
                    .iter()
                    .filter_map(|&id| self.registry.get(id).map(|m| m.name()))
                    .collect();
                (!names.is_empty()).then_some(HookDump {
                    hook: hook.name(),
                    modules: names,
                })
            })
            .collect();

        Some(ConfigDump {
            active_slot: self.active_slot(),
            global_generation: self.global_generation(),
            pool: PoolDump {
                name: active.pool.name().to_string(),
                capacity: active.pool.capacity(),
                in_use: active.pool.in_use(),
                available: active.pool.available(),
                buffer_size: active.pool.buffer_size(),
            },
            promiscuous: active.promiscuous,
            worker_num: active.workers.len(),
            port_num: active.ports.len(),
            queue_num: active.queue_num,
            inspection_rings: active.rings.ingress_count(),
            tx_rings: active.rings.tx_count(),
            control: active.control,
            switch_in_progress: active.switch_in_progress(),
            reload_requested: active.reload_requested(),
            ports: active.ports.configs().to_vec(),
            workers,
            modules,
            pipeline,
            last_reload: self.last_reload().map(|s| (*s).clone()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolDump {
    pub name: String,
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDump {
    pub id: u16,
    pub name: &'static str,
    pub enabled: bool,
    pub state: Option<String>,
}

/// Registered modules a hook runs, in order.
#[derive(Debug, Clone, Serialize)]
pub struct HookDump {
    pub hook: &'static str,
    pub modules: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDump {
    pub lcore: u16,
    pub role: Role,
    pub ports: Vec<u16>,
    pub queues: Vec<u16>,
    pub generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigDump {
    pub active_slot: Slot,
    pub global_generation: i64,
    pub pool: PoolDump,
    pub promiscuous: bool,
    pub worker_num: usize,
    pub port_num: usize,
    pub queue_num: u16,
    pub inspection_rings: usize,
    pub tx_rings: usize,
    pub control: ControlPorts,
    pub switch_in_progress: bool,
    pub reload_requested: bool,
    pub ports: Vec<PortConfig>,
    pub workers: Vec<WorkerDump>,
    pub modules: Vec<ModuleDump>,
    pub pipeline: Vec<HookDump>,
    pub last_reload: Option<ReloadStatus>,
}
