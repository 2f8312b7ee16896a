//! Lcore roles, ring topology and the per-core poll loop.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use ringwall_common::{MAX_LCORE, MAX_QUEUE_NUM};

use crate::error::{Error, Result};
use crate::generation::GenerationManager;
use crate::mbuf::Mbuf;
use crate::module::{Registry, Verdict};
use crate::port::PortSet;
use crate::ring::RingQueue;
use crate::snapshot::Snapshot;
use crate::stats::{CoreStats, StatsTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    None,
    Mgmt,
    Rx,
    Tx,
    Rtx,
    Worker,
    RtxWorker,
}

impl Role {
    pub fn from_name(name: &str) -> Self {
        match name {
            "RX" => Role::Rx,
            "TX" => Role::Tx,
            "RTX" => Role::Rtx,
            "WORKER" => Role::Worker,
            "RTX_WORKER" => Role::RtxWorker,
            "MGMT" => Role::Mgmt,
            _ => Role::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::None => "NONE",
            Role::Mgmt => "MGMT",
            Role::Rx => "RX",
            Role::Tx => "TX",
            Role::Rtx => "RTX",
            Role::Worker => "WORKER",
            Role::RtxWorker => "RTX_WORKER",
        }
    }

    /// Roles that run a packet loop and need `(port, queue)` pairs.
    pub fn owns_queues(self) -> bool {
        !matches!(self, Role::Mgmt | Role::None)
    }

    pub fn receives(self) -> bool {
        matches!(self, Role::Rx | Role::Rtx | Role::RtxWorker)
    }

    pub fn transmits(self) -> bool {
        matches!(self, Role::Tx | Role::Rtx | Role::RtxWorker)
    }

    pub fn inspects(self) -> bool {
        matches!(self, Role::Worker | Role::RtxWorker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerDesc {
    pub lcore: u16,
    pub role: Role,
    pub ports: Vec<u16>,
    pub queues: Vec<u16>,
    /// Index of this worker's inspection ring, for inspecting roles.
    pub work_queue: Option<usize>,
}

impl WorkerDesc {
    pub fn new(lcore: u16, role: Role, ports: Vec<u16>, queues: Vec<u16>) -> Self {
        Self {
            lcore,
            role,
            ports,
            queues,
            work_queue: None,
        }
    }

    /// Every `(port, queue)` combination this worker serves.
    pub fn pairs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.ports
            .iter()
            .flat_map(move |&p| self.queues.iter().map(move |&q| (p, q)))
    }
}

/// The validated lcore assignment.
#[derive(Debug)]
pub struct WorkerTable {
    workers: Vec<WorkerDesc>,
    by_lcore: Vec<Option<usize>>,
}

impl WorkerTable {
    /// Validate the role layout and hand out inspection ring indices.
    pub fn new(mut workers: Vec<WorkerDesc>) -> Result<Self> {
        let mut by_lcore = vec![None; MAX_LCORE];
        let mut next_ring = 0;
        let mut mgmt = 0;

        for (index, worker) in workers.iter_mut().enumerate() {
            let slot = by_lcore
                .get_mut(worker.lcore as usize)
                .ok_or_else(|| Error::Topology(format!("lcore {} out of range", worker.lcore)))?;
            if slot.is_some() {
                return Err(Error::Topology(format!("lcore {} assigned twice", worker.lcore)));
            }
            *slot = Some(index);

            if worker.role == Role::Mgmt {
                mgmt += 1;
            }
            if worker.role.owns_queues() && (worker.ports.is_empty() || worker.queues.is_empty()) {
                return Err(Error::Topology(format!(
                    "lcore {} role {} has no port/queue pairs",
                    worker.lcore,
                    worker.role.name()
                )));
            }
            worker.work_queue = if worker.role.inspects() {
                next_ring += 1;
                Some(next_ring - 1)
            } else {
                None
            };
        }

        if mgmt > 1 {
            return Err(Error::Topology(format!("{} MGMT lcores, at most one allowed", mgmt)));
        }
        if next_ring == 0 && workers.iter().any(|w| w.role.receives()) {
            return Err(Error::Topology(
                "receive lcores configured without any inspection worker".into(),
            ));
        }

        Ok(Self { workers, by_lcore })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDesc> {
        self.workers.iter()
    }

    pub fn get(&self, lcore: u16) -> Option<&WorkerDesc> {
        let index = (*self.by_lcore.get(lcore as usize)?)?;
        self.workers.get(index)
    }

    pub fn mgmt(&self) -> Option<&WorkerDesc> {
        self.workers.iter().find(|w| w.role == Role::Mgmt)
    }

    /// Lcores that run a packet loop.
    pub fn packet_cores(&self) -> impl Iterator<Item = &WorkerDesc> {
        self.workers.iter().filter(|w| w.role.owns_queues())
    }

    pub fn inspection_count(&self) -> usize {
        self.workers.iter().filter(|w| w.role.inspects()).count()
    }

    /// Distinct `(port, queue)` pairs referenced by any worker, sorted.
    pub fn pairs(&self) -> BTreeSet<(u16, u16)> {
        self.workers.iter().flat_map(WorkerDesc::pairs).collect()
    }

    /// Queues to configure per port: highest queue index referenced plus one.
    pub fn queue_num(&self) -> u16 {
        self.workers
            .iter()
            .flat_map(|w| w.queues.iter().copied())
            .max()
            .map_or(0, |q| q + 1)
    }

    /// Every port a worker references must exist.
    pub fn check_ports(&self, ports: &PortSet) -> Result<()> {
        for worker in &self.workers {
            if let Some(&port) = worker.ports.iter().find(|&&p| ports.config(p).is_none()) {
                return Err(Error::Topology(format!(
                    "lcore {} references port {} which is not in the port list",
                    worker.lcore, port
                )));
            }
        }
        Ok(())
    }
}

/// Inspection rings plus one transmit ring per distinct `(port, queue)`.
#[derive(Debug)]
pub struct RingSet {
    ingress: Vec<Arc<RingQueue>>,
    tx: Vec<Option<Arc<RingQueue>>>,
    tx_count: usize,
}

impl RingSet {
    /// Create every ring the worker table needs. A failure drops the rings
    /// created so far and fails the whole setup.
    pub fn setup(workers: &WorkerTable, ring_size: usize) -> Result<Self> {
        let mut ingress = Vec::with_capacity(workers.inspection_count());
        for worker in workers.iter().filter(|w| w.role.inspects()) {
            let ring = RingQueue::new(format!("work_ring_{}", worker.lcore), ring_size)?;
            tracing::info!(lcore = worker.lcore, ring = ring.name(), "inspection ring created");
            ingress.push(Arc::new(ring));
        }

        let mut tx = vec![None; ringwall_common::MAX_PORT_NUM * MAX_QUEUE_NUM];
        let mut tx_count = 0;
        for (port, queue) in workers.pairs() {
            let index = tx_index(port, queue).ok_or_else(|| {
                Error::Topology(format!("port {} queue {} out of range", port, queue))
            })?;
            let ring = RingQueue::new(format!("tx_ring_p{}_q{}", port, queue), ring_size)?;
            tx[index] = Some(Arc::new(ring));
            tx_count += 1;
        }
        tracing::info!(
            inspection_rings = ingress.len(),
            tx_rings = tx_count,
            "rings created"
        );

        Ok(Self {
            ingress,
            tx,
            tx_count,
        })
    }

    pub fn ingress_count(&self) -> usize {
        self.ingress.len()
    }

    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    pub fn ingress(&self, index: usize) -> Option<&Arc<RingQueue>> {
        self.ingress.get(index)
    }

    /// Index of the inspection ring a packet received on `queue` goes to.
    #[inline]
    pub fn ingress_index(&self, queue: u16) -> Option<usize> {
        if self.ingress.is_empty() {
            return None;
        }
        Some(queue as usize % self.ingress.len())
    }

    #[inline]
    pub fn ingress_for_queue(&self, queue: u16) -> Option<&Arc<RingQueue>> {
        self.ingress.get(self.ingress_index(queue)?)
    }

    #[inline]
    pub fn tx(&self, port: u16, queue: u16) -> Option<&Arc<RingQueue>> {
        self.tx.get(tx_index(port, queue)?).and_then(Option::as_ref)
    }
}

fn tx_index(port: u16, queue: u16) -> Option<usize> {
    let (port, queue) = (port as usize, queue as usize);
    if port >= ringwall_common::MAX_PORT_NUM || queue >= MAX_QUEUE_NUM {
        return None;
    }
    Some(port * MAX_QUEUE_NUM + queue)
}

/// Runtime state of one packet lcore.
pub struct Worker {
    desc: WorkerDesc,
    pairs: Vec<(u16, u16)>,
    registry: Arc<Registry>,
    stats: Arc<StatsTable>,
    shutdown: Arc<AtomicBool>,
    burst: usize,
    rx_buf: Vec<Mbuf>,
    tx_buf: Vec<Mbuf>,
}

impl Worker {
    pub fn new(
        desc: WorkerDesc,
        registry: Arc<Registry>,
        stats: Arc<StatsTable>,
        shutdown: Arc<AtomicBool>,
        burst: usize,
    ) -> Self {
        let pairs = desc.pairs().collect();
        Self {
            desc,
            pairs,
            registry,
            stats,
            shutdown,
            burst,
            rx_buf: Vec::with_capacity(burst),
            tx_buf: Vec::with_capacity(burst),
        }
    }

    /// One iteration of the role body against `snapshot`.
    #[inline]
    pub fn poll_once(&mut self, snapshot: &Snapshot) {
        match self.desc.role {
            Role::Rx => self.receive(snapshot),
            Role::Tx => self.transmit(snapshot),
            Role::Rtx => {
                self.receive(snapshot);
                self.transmit(snapshot);
            }
            Role::Worker => {
                self.inspect(snapshot);
            }
            Role::RtxWorker => {
                self.receive(snapshot);
                self.inspect(snapshot);
                self.transmit(snapshot);
            }
            Role::Mgmt | Role::None => {}
        }
    }

    /// Receive a burst per owned pair and hand it to the inspection rings.
    ///
    /// A full ring is spun on. When the ring is this worker's own, it is
    /// drained in place since nothing else will. Shutdown ends the wait and
    /// drops what is left of the burst.
    fn receive(&mut self, snapshot: &Snapshot) {
        let mut batch = std::mem::take(&mut self.rx_buf);
        let stats = self.stats.core(self.desc.lcore);
        for &(port, queue) in &self.pairs {
            let n = snapshot.ports.receive(port, queue, &mut batch, self.burst);
            if n == 0 {
                continue;
            }
            CoreStats::add(&stats.rx, n as u64);

            let Some(index) = snapshot.rings.ingress_index(queue) else {
                CoreStats::add(&stats.dropped, n as u64);
                batch.clear();
                continue;
            };
            let Some(ring) = snapshot.rings.ingress(index) else {
                CoreStats::add(&stats.dropped, n as u64);
                batch.clear();
                continue;
            };
            let own = self.desc.work_queue == Some(index);
            for mbuf in batch.drain(..) {
                let pushed = ring.push_spin(mbuf, || {
                    CoreStats::add(&stats.ring_full_spins, 1);
                    if own {
                        self.inspect(snapshot);
                    }
                    !self.shutdown.load(Ordering::Relaxed)
                });
                if pushed.is_err() {
                    CoreStats::add(&stats.dropped, 1);
                }
            }
        }
        self.rx_buf = batch;
    }

    fn transmit(&mut self, snapshot: &Snapshot) {
        let stats = self.stats.core(self.desc.lcore);
        for &(port, queue) in &self.pairs {
            let Some(ring) = snapshot.rings.tx(port, queue) else {
                continue;
            };
            if ring.pop_burst(&mut self.tx_buf, self.burst) == 0 {
                continue;
            }

            let sent = snapshot
                .ports
                .driver(port)
                .map_or(0, |driver| driver.transmit_burst(queue, &mut self.tx_buf));
            CoreStats::add(&stats.tx, sent as u64);

            let left = self.tx_buf.len();
            if left > 0 {
                tracing::warn!(
                    lcore = self.desc.lcore,
                    port,
                    queue,
                    sent,
                    dropped = left,
                    "transmit shortfall"
                );
                CoreStats::add(&stats.tx_shortfall, 1);
                CoreStats::add(&stats.dropped, left as u64);
                self.tx_buf.clear();
            }
        }
    }

    /// Inspect one packet from this worker's ring. Returns whether a packet
    /// was taken.
    fn inspect(&self, snapshot: &Snapshot) -> bool {
        let Some(ring) = self
            .desc
            .work_queue
            .and_then(|index| snapshot.rings.ingress(index))
        else {
            return false;
        };
        let Some(pkt) = ring.pop() else {
            return false;
        };

        let stats = self.stats.core(self.desc.lcore);
        let pkt = match self.registry.inspect(snapshot, pkt) {
            Verdict::Accept(pkt) => pkt,
            Verdict::Stolen => {
                CoreStats::add(&stats.stolen, 1);
                return true;
            }
        };

        let (port, queue) = (pkt.meta().port_out, pkt.meta().queue_id);
        match snapshot.rings.tx(port, queue) {
            Some(tx) => {
                if tx.push(pkt).is_err() {
                    CoreStats::add(&stats.dropped, 1);
                }
            }
            None => {
                tracing::trace!(lcore = self.desc.lcore, port, queue, "no transmit ring, dropped");
                CoreStats::add(&stats.dropped, 1);
            }
        }
        true
    }

    /// Poll until `shutdown` is set, switching snapshots when asked.
    ///
    /// The core registers its generation before waiting on `ready`, so the
    /// management core never starts a switch it would not wait for.
    pub fn run(mut self, manager: &GenerationManager, ready: &Barrier) {
        let lcore = self.desc.lcore;
        let registered = manager.register_core(lcore);
        ready.wait();

        let mut snapshot = match registered {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(lcore, "worker failed to start: {}", e);
                return;
            }
        };
        tracing::info!(lcore, role = self.desc.role.name(), "worker loop started");

        while !self.shutdown.load(Ordering::Relaxed) {
            if snapshot.switch_in_progress() {
                snapshot = manager.observe_switch(snapshot, lcore);
            }
            self.poll_once(&snapshot);
        }

        drop(snapshot);
        manager.unregister_core(lcore);
        tracing::info!(lcore, "worker loop stopped");
    }
}

/// Pin the calling thread to CPU `core`.
pub fn pin_to_core(core: usize) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(core, &mut cpuset);
            let ret = libc::sched_setaffinity(0, std::mem::size_of_val(&cpuset), &cpuset);
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = core;
    Ok(())
}
