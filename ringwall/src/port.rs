//! Port abstraction, driver selection and the in-memory driver.
//!
//! The dataplane only needs four things from a NIC: configure N RX/TX queues,
//! receive a burst, transmit a burst and toggle promiscuous mode. Anything
//! implementing [`Port`] can back a port id. The `bus` of an `interface.json`
//! entry picks the driver: `tap:<ifname>` for a kernel TAP device
//! ([`TapPort`]), `mem` for a [`MemPort`] whose queues are plain rings.

use arc_swap::ArcSwap;
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ringwall_common::{PacketMeta, MAX_PORT_NUM, MAX_QUEUE_NUM};

use crate::error::{Error, Result};
use crate::mbuf::{Mbuf, PacketPool};
use crate::tap::TapPort;

/// Port type from `interface.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    #[default]
    None,
    /// Transparent bridge to exactly one partner port.
    Vwire,
}

impl PortType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "vwire" => PortType::Vwire,
            _ => PortType::None,
        }
    }
}

/// One entry of `interface.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConfig {
    pub id: u16,
    pub kind: PortType,
    pub bus: String,
    pub mac: String,
    /// Virtual-wire pair id; meaningful only for [`PortType::Vwire`].
    pub vwire: u32,
}

pub trait Port: Send + Sync {
    fn id(&self) -> u16;

    /// Hardware limit on RX and TX queues.
    fn max_queues(&self) -> u16;

    fn configure(&self, n_rx: u16, n_tx: u16) -> Result<()>;

    /// Append up to `max` received buffers to `out`; returns how many.
    fn receive_burst(&self, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize;

    /// Offer `pkts` for transmission. Sent buffers are removed from the front
    /// of `pkts`; whatever the port could not take stays behind. Returns the
    /// number sent.
    fn transmit_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

    fn set_promiscuous(&self, on: bool) -> Result<()>;
}

struct MemQueues {
    rx: Vec<ArrayQueue<Mbuf>>,
    tx: Vec<ArrayQueue<Mbuf>>,
}

impl MemQueues {
    fn new(n_rx: u16, n_tx: u16, depth: usize) -> Self {
        Self {
            rx: (0..n_rx).map(|_| ArrayQueue::new(depth)).collect(),
            tx: (0..n_tx).map(|_| ArrayQueue::new(depth)).collect(),
        }
    }
}

/// In-memory port: `inject` plays the wire on the receive side and
/// `take_transmitted` plays it on the transmit side.
pub struct MemPort {
    id: u16,
    max_queues: u16,
    depth: usize,
    queues: ArcSwap<MemQueues>,
    promiscuous: AtomicBool,
}

impl MemPort {
    pub fn new(id: u16, max_queues: u16, depth: usize) -> Self {
        Self {
            id,
            max_queues,
            depth: depth.max(1),
            queues: ArcSwap::from_pointee(MemQueues::new(0, 0, 1)),
            promiscuous: AtomicBool::new(false),
        }
    }

    /// Place a frame on an RX queue, as if it arrived from the wire.
    #[cfg(test)]
    pub fn inject(&self, queue: u16, mbuf: Mbuf) -> std::result::Result<(), Mbuf> {
        let queues = self.queues.load();
        match queues.rx.get(queue as usize) {
            Some(q) => q.push(mbuf),
            None => Err(mbuf),
        }
    }

    /// Drain everything transmitted on `queue`.
    #[cfg(test)]
    pub fn take_transmitted(&self, queue: u16) -> Vec<Mbuf> {
        let queues = self.queues.load();
        let mut out = Vec::new();
        if let Some(q) = queues.tx.get(queue as usize) {
            while let Some(mbuf) = q.pop() {
                out.push(mbuf);
            }
        }
        out
    }

    #[cfg(test)]
    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn queue_count(&self) -> (usize, usize) {
        let queues = self.queues.load();
        (queues.rx.len(), queues.tx.len())
    }
}

impl Port for MemPort {
    fn id(&self) -> u16 {
        self.id
    }

    fn max_queues(&self) -> u16 {
        self.max_queues
    }

    fn configure(&self, n_rx: u16, n_tx: u16) -> Result<()> {
        if n_rx > self.max_queues || n_tx > self.max_queues {
            return Err(Error::port(
                self.id,
                format!(
                    "{} rx / {} tx queues requested, device supports {}",
                    n_rx, n_tx, self.max_queues
                ),
            ));
        }
        self.queues
            .store(Arc::new(MemQueues::new(n_rx, n_tx, self.depth)));
        tracing::debug!(port = self.id, n_rx, n_tx, "port configured");
        Ok(())
    }

    fn receive_burst(&self, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let queues = self.queues.load();
        let Some(q) = queues.rx.get(queue as usize) else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            match q.pop() {
                Some(mbuf) => {
                    out.push(mbuf);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn transmit_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let queues = self.queues.load();
        let Some(q) = queues.tx.get(queue as usize) else {
            return 0;
        };
        let room = (q.capacity() - q.len()).min(pkts.len());
        let mut sent = 0;
        for mbuf in pkts.drain(..room) {
            if q.push(mbuf).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn set_promiscuous(&self, on: bool) -> Result<()> {
        self.promiscuous.store(on, Ordering::Relaxed);
        Ok(())
    }
}

/// Port table: configuration plus driver, indexed by port id.
pub struct PortSet {
    configs: Vec<PortConfig>,
    drivers: Vec<Option<Arc<dyn Port>>>,
}

impl PortSet {
    /// Pair each configuration entry with the driver of the same id.
    pub fn new(configs: Vec<PortConfig>, drivers: Vec<Arc<dyn Port>>) -> Result<Self> {
        let mut table: Vec<Option<Arc<dyn Port>>> = vec![None; MAX_PORT_NUM];
        for driver in drivers {
            let id = driver.id() as usize;
            if id >= MAX_PORT_NUM {
                return Err(Error::Config(format!("port id {} out of range", id)));
            }
            table[id] = Some(driver);
        }
        for config in &configs {
            if table.get(config.id as usize).and_then(Option::as_ref).is_none() {
                return Err(Error::port(config.id, "no driver bound"));
            }
        }
        Ok(Self {
            configs,
            drivers: table,
        })
    }

    /// Bind each configured port to the driver its `bus` names. TAP
    /// devices are created when the port is configured, not here. `depth` is
    /// the per-queue depth of in-memory ports.
    pub fn open(configs: Vec<PortConfig>, pool: &Arc<PacketPool>, depth: usize) -> Result<Self> {
        let drivers = configs
            .iter()
            .map(|config| -> Result<Arc<dyn Port>> {
                match config.bus.split_once(':') {
                    Some(("tap", ifname)) => {
                        Ok(Arc::new(TapPort::new(config.id, ifname, pool.clone())?))
                    }
                    _ if config.bus == "mem" => {
                        Ok(Arc::new(MemPort::new(config.id, MAX_QUEUE_NUM as u16, depth)))
                    }
                    _ => Err(Error::port(
                        config.id,
                        format!("unsupported bus {:?}, expected tap:<ifname> or mem", config.bus),
                    )),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        for config in &configs {
            tracing::info!(port = config.id, bus = %config.bus, "port bound");
        }
        Self::new(configs, drivers)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn configs(&self) -> &[PortConfig] {
        &self.configs
    }

    pub fn config(&self, id: u16) -> Option<&PortConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    #[inline]
    pub fn driver(&self, id: u16) -> Option<&Arc<dyn Port>> {
        self.drivers.get(id as usize).and_then(Option::as_ref)
    }

    /// Receive on `(port, queue)` and stamp each new buffer's metadata.
    #[inline]
    pub fn receive(&self, port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let Some(driver) = self.driver(port) else {
            return 0;
        };
        let start = out.len();
        let n = driver.receive_burst(queue, out, max);
        for mbuf in &mut out[start..] {
            *mbuf.meta_mut() = PacketMeta::received(port, queue);
        }
        n
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSet")
            .field("configs", &self.configs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vwire(id: u16, pair: u32) -> PortConfig {
        PortConfig {
            id,
            kind: PortType::Vwire,
            bus: format!("0000:00:0{}.0", id),
            mac: format!("02:00:00:00:00:0{}", id),
            vwire: pair,
        }
    }

    #[test]
    fn test_port_type_from_name() {
        assert_eq!(PortType::from_name("vwire"), PortType::Vwire);
        assert_eq!(PortType::from_name("l3"), PortType::None);
    }

    #[test]
    fn test_configure_limits() {
        let port = MemPort::new(0, 4, 8);
        assert!(port.configure(4, 4).is_ok());
        assert_eq!(port.queue_count(), (4, 4));
        assert!(matches!(port.configure(5, 1), Err(Error::Port { port: 0, .. })));
    }

    #[test]
    fn test_receive_stamps_metadata() {
        let pool = PacketPool::new("test", 8, 64).unwrap();
        let mem = MemPort::new(1, 2, 8);
        mem.configure(2, 2).unwrap();
        let mut mbuf = pool.alloc_frame(&[0xaa; 20]).unwrap();
        mbuf.meta_mut().port_out = 30;
        mem.inject(1, mbuf).unwrap();

        let ports = PortSet::new(vec![vwire(1, 7)], vec![Arc::new(mem) as Arc<dyn Port>]).unwrap();
        let mut out = Vec::new();
        assert_eq!(ports.receive(1, 1, &mut out, 32), 1);
        let meta = out[0].meta();
        assert_eq!((meta.port_in, meta.port_out, meta.queue_id), (1, 1, 1));
    }

    #[test]
    fn test_transmit_shortfall_leaves_remainder() {
        let pool = PacketPool::new("test", 8, 64).unwrap();
        let port = MemPort::new(0, 1, 2);
        port.configure(1, 1).unwrap();

        let mut pkts: Vec<_> = (0..3u8).map(|i| pool.alloc_frame(&[i]).unwrap()).collect();
        assert_eq!(port.transmit_burst(0, &mut pkts), 2);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].data(), &[2]);

        let wire = port.take_transmitted(0);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].data(), &[0]);
    }

    #[test]
    fn test_port_set_requires_driver() {
        let result = PortSet::new(vec![vwire(3, 1)], Vec::new());
        assert!(matches!(result, Err(Error::Port { port: 3, .. })));
    }

    #[test]
    fn test_open_selects_driver_from_bus() {
        let pool = PacketPool::new("test", 4, 64).unwrap();
        let mut tap = vwire(1, 7);
        tap.bus = "tap:rw1".into();
        let mut mem = vwire(2, 7);
        mem.bus = "mem".into();

        let ports = PortSet::open(vec![tap, mem], &pool, 8).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports.driver(1).unwrap().id(), 1);
        assert_eq!(ports.driver(2).unwrap().max_queues(), MAX_QUEUE_NUM as u16);
    }

    #[test]
    fn test_open_rejects_unknown_bus() {
        let pool = PacketPool::new("test", 4, 64).unwrap();
        let result = PortSet::open(vec![vwire(3, 1)], &pool, 8);
        assert!(matches!(result, Err(Error::Port { port: 3, .. })));

        let mut long = vwire(4, 1);
        long.bus = "tap:an-interface-name-too-long".into();
        let result = PortSet::open(vec![long], &pool, 8);
        assert!(matches!(result, Err(Error::Port { port: 4, .. })));
    }

    #[test]
    fn test_inject_unconfigured_queue_rejected() {
        let pool = PacketPool::new("test", 1, 64).unwrap();
        let port = MemPort::new(0, 1, 2);
        assert!(port.inject(0, pool.alloc().unwrap()).is_err());
    }
}
