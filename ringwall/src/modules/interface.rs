//! Port bring-up and virtual-wire forwarding.

use std::collections::BTreeMap;

use ringwall_common::{flags, MAX_PORT_NUM};

use crate::error::{Error, Result};
use crate::mbuf::Mbuf;
use crate::module::{Capabilities, Hook, Module, ModuleId, Verdict};
use crate::port::{PortConfig, PortType};
use crate::snapshot::Snapshot;

/// Partner port of every virtual-wire port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VwireTable {
    partner: [Option<u16>; MAX_PORT_NUM],
    pairs: Vec<(u32, u16, u16)>,
}

impl VwireTable {
    /// Group virtual-wire ports by pair id. Every group must hold exactly
    /// two ports.
    pub fn build(ports: &[PortConfig]) -> Result<Self> {
        let mut groups: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for port in ports.iter().filter(|p| p.kind == PortType::Vwire) {
            let group = groups.entry(port.vwire).or_default();
            if group.len() == 2 {
                return Err(Error::Config(format!(
                    "vwire pair {} binds more than two ports (port {})",
                    port.vwire, port.id
                )));
            }
            group.push(port.id);
        }

        let mut table = Self {
            partner: [None; MAX_PORT_NUM],
            pairs: Vec::with_capacity(groups.len()),
        };
        for (vwire, group) in groups {
            let &[a, b] = group.as_slice() else {
                return Err(Error::Config(format!(
                    "vwire pair {} has {} port, expected 2",
                    vwire,
                    group.len()
                )));
            };
            table.partner[a as usize] = Some(b);
            table.partner[b as usize] = Some(a);
            table.pairs.push((vwire, a, b));
            tracing::info!(vwire, port1 = a, port2 = b, "vwire pair bound");
        }
        tracing::info!("total vwire pair num {}", table.pairs.len());
        Ok(table)
    }

    #[inline]
    pub fn partner(&self, port: u16) -> Option<u16> {
        self.partner.get(port as usize).copied().flatten()
    }

    /// `(pair id, port1, port2)` in pair-id order.
    pub fn pairs(&self) -> &[(u32, u16, u16)] {
        &self.pairs
    }
}

/// Configures every port at startup and sends virtual-wire traffic out of
/// the partner port at pre-routing.
pub struct InterfaceModule;

impl InterfaceModule {
    fn setup_ports(snapshot: &Snapshot) -> Result<()> {
        let queues = snapshot.queue_num;
        for config in snapshot.ports.configs() {
            let driver = snapshot
                .ports
                .driver(config.id)
                .ok_or_else(|| Error::port(config.id, "no driver bound"))?;
            if queues > driver.max_queues() {
                return Err(Error::port(
                    config.id,
                    format!(
                        "worker queue num {} out of range (max {})",
                        queues,
                        driver.max_queues()
                    ),
                ));
            }
            driver.configure(queues, queues)?;
            if snapshot.promiscuous {
                driver.set_promiscuous(true)?;
            }
            tracing::info!(
                port = config.id,
                queues,
                promiscuous = snapshot.promiscuous,
                "port started"
            );
        }
        Ok(())
    }
}

impl Module for InterfaceModule {
    fn id(&self) -> ModuleId {
        ModuleId::INTERFACE
    }

    fn name(&self) -> &'static str {
        "interface"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_init().with_process()
    }

    fn loggable(&self) -> bool {
        true
    }

    fn init(&self, snapshot: &mut Snapshot) -> Result<()> {
        if snapshot.modules.contains(ModuleId::INTERFACE) {
            return Err(Error::module(self.name(), "interface config exists"));
        }
        let table = VwireTable::build(snapshot.ports.configs())
            .map_err(|e| Error::module(self.name(), e.to_string()))?;
        Self::setup_ports(snapshot)?;
        snapshot.modules.insert(ModuleId::INTERFACE, table);
        Ok(())
    }

    fn describe(&self, snapshot: &Snapshot) -> Option<String> {
        let table = snapshot.modules.get::<VwireTable>(ModuleId::INTERFACE)?;
        let pairs: Vec<String> = table
            .pairs()
            .iter()
            .map(|(vwire, a, b)| format!("vwire {} {}<->{}", vwire, a, b))
            .collect();
        Some(if pairs.is_empty() {
            "no vwire pairs".to_string()
        } else {
            pairs.join(", ")
        })
    }

    #[inline]
    fn process(&self, snapshot: &Snapshot, mut pkt: Mbuf, hook: Hook) -> Verdict {
        if hook != Hook::PreRouting {
            return Verdict::Accept(pkt);
        }
        let Some(table) = snapshot.modules.get::<VwireTable>(ModuleId::INTERFACE) else {
            return Verdict::Accept(pkt);
        };
        let meta = pkt.meta_mut();
        if let Some(partner) = table.partner(meta.port_in) {
            meta.port_out = partner;
            meta.flags |= flags::REDIRECTED;
        }
        Verdict::Accept(pkt)
    }
}
