//! Configuration snapshots.
//!
//! A snapshot bundles everything a worker reads while moving packets. Shared
//! infrastructure (pool, ports, rings, worker table) is reference counted and
//! carried unchanged from one snapshot to the next; module-derived state is
//! rebuilt by the modules' `conf` callbacks on every reload.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ringwall_common::MAX_MODULE_NUM;

use crate::mbuf::PacketPool;
use crate::module::ModuleId;
use crate::port::PortSet;
use crate::worker::{RingSet, WorkerTable};

/// One of the two snapshot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Self {
        if index % 2 == 0 {
            Slot::A
        } else {
            Slot::B
        }
    }

    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

type State = Arc<dyn Any + Send + Sync>;

/// Per-module derived state, indexed by module id.
#[derive(Clone)]
pub struct ModuleState {
    entries: Vec<Option<State>>,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            entries: vec![None; MAX_MODULE_NUM],
        }
    }
}

impl ModuleState {
    pub fn get<T: Any + Send + Sync>(&self, id: ModuleId) -> Option<&T> {
        self.entries.get(id.index())?.as_ref()?.downcast_ref::<T>()
    }

    /// Replace the state of module `id`.
    pub fn insert<T: Any + Send + Sync>(&mut self, id: ModuleId, value: T) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            *entry = Some(Arc::new(value));
        }
    }

    pub fn take(&mut self, id: ModuleId) -> Option<State> {
        self.entries.get_mut(id.index())?.take()
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        matches!(self.entries.get(id.index()), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i))
            .collect();
        f.debug_struct("ModuleState").field("modules", &ids).finish()
    }
}

/// Control-surface endpoints, carried for the configuration dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ControlPorts {
    pub api_port: u16,
    pub shell_port: Option<u16>,
}

#[derive(Debug)]
pub struct Snapshot {
    pub slot: Slot,
    pub pool: Arc<PacketPool>,
    pub ports: Arc<PortSet>,
    pub workers: Arc<WorkerTable>,
    pub rings: Arc<RingSet>,
    pub promiscuous: bool,
    /// RX and TX queues configured per port.
    pub queue_num: u16,
    pub control: ControlPorts,
    pub modules: ModuleState,
    reload_requested: AtomicBool,
    switch_in_progress: AtomicBool,
}

impl Snapshot {
    pub fn new(
        slot: Slot,
        pool: Arc<PacketPool>,
        ports: Arc<PortSet>,
        workers: Arc<WorkerTable>,
        rings: Arc<RingSet>,
        promiscuous: bool,
        control: ControlPorts,
    ) -> Self {
        let queue_num = workers.queue_num();
        Self {
            slot,
            pool,
            ports,
            workers,
            rings,
            promiscuous,
            queue_num,
            control,
            modules: ModuleState::default(),
            reload_requested: AtomicBool::new(false),
            switch_in_progress: AtomicBool::new(false),
        }
    }

    /// Copy into `slot`, sharing infrastructure and module state, with both
    /// flags cleared.
    pub fn fork(&self, slot: Slot) -> Self {
        Self {
            slot,
            pool: Arc::clone(&self.pool),
            ports: Arc::clone(&self.ports),
            workers: Arc::clone(&self.workers),
            rings: Arc::clone(&self.rings),
            promiscuous: self.promiscuous,
            queue_num: self.queue_num,
            control: self.control,
            modules: self.modules.clone(),
            reload_requested: AtomicBool::new(false),
            switch_in_progress: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn switch_in_progress(&self) -> bool {
        self.switch_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_switch_in_progress(&self, on: bool) {
        self.switch_in_progress.store(on, Ordering::Release);
    }

    pub fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::Acquire)
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    /// Clear the reload request, returning whether one was pending.
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }
}
