//! Frame builders and a small in-memory dataplane for tests.

use std::sync::Arc;

use crate::mbuf::PacketPool;
use crate::module::Registry;
use crate::modules;
use crate::port::{MemPort, Port, PortConfig, PortSet, PortType};
use crate::snapshot::{ControlPorts, Slot, Snapshot};
use crate::stats::StatsTable;
use crate::worker::{RingSet, Role, WorkerDesc, WorkerTable};

pub const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
pub const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

fn ethernet(ethertype: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(128);
    frame.extend_from_slice(&DST_MAC);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame
}

pub fn ipv4_udp_frame(sip: [u8; 4], dip: [u8; 4], sp: u16, dp: u16) -> Vec<u8> {
    let mut frame = ethernet(0x0800);
    let total_len: u16 = 20 + 8 + 4;
    frame.extend_from_slice(&[0x45, 0]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
    frame.extend_from_slice(&sip);
    frame.extend_from_slice(&dip);
    frame.extend_from_slice(&sp.to_be_bytes());
    frame.extend_from_slice(&dp.to_be_bytes());
    frame.extend_from_slice(&12u16.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(b"ping");
    frame
}

pub fn ipv6_tcp_frame(sip: [u8; 16], dip: [u8; 16], sp: u16, dp: u16) -> Vec<u8> {
    let mut frame = ethernet(0x86dd);
    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&20u16.to_be_bytes());
    frame.extend_from_slice(&[6, 64]);
    frame.extend_from_slice(&sip);
    frame.extend_from_slice(&dip);
    frame.extend_from_slice(&sp.to_be_bytes());
    frame.extend_from_slice(&dp.to_be_bytes());
    frame.extend_from_slice(&[0; 16]);
    frame
}

pub fn port_config(id: u16, kind: PortType, vwire: u32) -> PortConfig {
    PortConfig {
        id,
        kind,
        bus: format!("0000:00:{:02x}.0", id),
        mac: format!("02:00:00:00:00:{:02x}", id),
        vwire,
    }
}

/// Ports, rings, pool and builtin modules wired together, minus threads.
pub struct Fixture {
    pub pool: Arc<PacketPool>,
    pub ports: Arc<PortSet>,
    pub workers: Arc<WorkerTable>,
    pub rings: Arc<RingSet>,
    pub registry: Arc<Registry>,
    pub stats: Arc<StatsTable>,
    mem: Vec<Arc<MemPort>>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    pub fn build(ports: Vec<PortConfig>, workers: Vec<WorkerDesc>, max_queues: u16, depth: usize) -> Self {
        Self::build_sized(ports, workers, max_queues, depth, 64, 64)
    }

    fn build_sized(
        ports: Vec<PortConfig>,
        workers: Vec<WorkerDesc>,
        max_queues: u16,
        depth: usize,
        ring_size: usize,
        pool_size: usize,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mem: Vec<Arc<MemPort>> = ports
            .iter()
            .map(|c| Arc::new(MemPort::new(c.id, max_queues, depth)))
            .collect();
        let drivers = mem.iter().map(|m| m.clone() as Arc<dyn Port>).collect();
        let workers = WorkerTable::new(workers).unwrap();
        let rings = RingSet::setup(&workers, ring_size).unwrap();

        Self {
            pool: PacketPool::new("test", pool_size, 2048).unwrap(),
            ports: Arc::new(PortSet::new(ports, drivers).unwrap()),
            workers: Arc::new(workers),
            rings: Arc::new(rings),
            registry: Arc::new(modules::builtin(dir.path())),
            stats: Arc::new(StatsTable::new()),
            mem,
            _dir: dir,
        }
    }

    fn vwire(max_queues: u16, depth: usize, ring_size: usize, pool_size: usize) -> Self {
        Self::build_sized(
            vec![
                port_config(1, PortType::Vwire, 7),
                port_config(2, PortType::Vwire, 7),
            ],
            vec![
                WorkerDesc::new(0, Role::Mgmt, vec![], vec![]),
                WorkerDesc::new(2, Role::RtxWorker, vec![1, 2], vec![0]),
            ],
            max_queues,
            depth,
            ring_size,
            pool_size,
        )
    }

    /// Ports 1 and 2 on virtual wire 7, one RTX_WORKER on lcore 2.
    pub fn vwire_pair() -> Self {
        Self::vwire(4, 64, 64, 64)
    }

    pub fn with_port_depth(depth: usize) -> Self {
        Self::vwire(4, depth, 64, 64)
    }

    pub fn with_max_queues(max_queues: u16) -> Self {
        Self::vwire(max_queues, 64, 64, 64)
    }

    /// The vwire pair with `ring_size` rings and a pool and port depth
    /// large enough to overrun them.
    pub fn with_ring_size(ring_size: usize) -> Self {
        Self::vwire(4, 256, ring_size, 256)
    }

    /// A single plain port 0 served by an RTX_WORKER on lcore 2.
    pub fn plain_port() -> Self {
        Self::build(
            vec![port_config(0, PortType::None, 0)],
            vec![WorkerDesc::new(2, Role::RtxWorker, vec![0], vec![0])],
            4,
            64,
        )
    }

    /// Slot A snapshot with no module state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            Slot::A,
            self.pool.clone(),
            self.ports.clone(),
            self.workers.clone(),
            self.rings.clone(),
            true,
            ControlPorts::default(),
        )
    }

    /// Snapshot after every builtin module's `init`; ports are configured.
    pub fn initialised_snapshot(&self) -> Snapshot {
        let mut snapshot = self.snapshot();
        self.registry.init_all(&mut snapshot).unwrap();
        snapshot
    }

    pub fn mem_port(&self, id: u16) -> &MemPort {
        self.mem.iter().find(|m| m.id() == id).unwrap()
    }

    pub fn inject(&self, port: u16, queue: u16, frame: &[u8]) {
        let mbuf = self.pool.alloc_frame(frame).unwrap();
        self.mem_port(port).inject(queue, mbuf).unwrap();
    }
}
