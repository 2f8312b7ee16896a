//! First-match access control.
//!
//! Rules come from `acl.json` in the configuration directory and are compiled
//! into an immutable [`AclTable`] kept in the snapshot. A reload builds a new
//! table for the next snapshot; the retired one is released by `free`.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use ringwall_common::FlowTuple;

use crate::error::{Error, Result};
use crate::files::{read_json, ACL_FILE};
use crate::mbuf::Mbuf;
use crate::module::{Capabilities, Hook, Module, ModuleId, Verdict};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Ingress,
    Egress,
}

#[derive(Debug, Deserialize)]
struct AclFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    action: Action,
    #[serde(default)]
    stage: Stage,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    proto: Option<u8>,
    #[serde(default)]
    src_port: Option<u16>,
    #[serde(default)]
    dst_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub src: Option<IpNet>,
    pub dst: Option<IpNet>,
    pub proto: Option<u8>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl Rule {
    fn needs_ip(&self) -> bool {
        self.src.is_some()
            || self.dst.is_some()
            || self.proto.is_some()
            || self.src_port.is_some()
            || self.dst_port.is_some()
    }

    pub fn matches(&self, tuple: &FlowTuple) -> bool {
        let Some((sip, dip)) = addresses(tuple) else {
            return !self.needs_ip();
        };
        let (sp, dp) = tuple.ports();
        self.src.map_or(true, |net| net.contains(&sip))
            && self.dst.map_or(true, |net| net.contains(&dip))
            && self.proto.map_or(true, |p| tuple.proto() == Some(p))
            && self.src_port.map_or(true, |p| p == sp)
            && self.dst_port.map_or(true, |p| p == dp)
    }
}

fn addresses(tuple: &FlowTuple) -> Option<(IpAddr, IpAddr)> {
    match tuple {
        FlowTuple::None => None,
        FlowTuple::V4(t) => Some((
            IpAddr::V4(Ipv4Addr::from(t.sip)),
            IpAddr::V4(Ipv4Addr::from(t.dip)),
        )),
        FlowTuple::V6(t) => Some((
            IpAddr::V6(Ipv6Addr::from(t.sip)),
            IpAddr::V6(Ipv6Addr::from(t.dip)),
        )),
    }
}

/// Compiled rule lists, one per stage. Unmatched packets are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclTable {
    ingress: Vec<Rule>,
    egress: Vec<Rule>,
}

impl AclTable {
    /// Load `acl.json` from `dir`. A missing file yields an empty table.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.join(ACL_FILE).exists() {
            tracing::info!(dir = %dir.display(), "no acl file, accepting everything");
            return Ok(Self::default());
        }
        let file: AclFile = read_json(dir, ACL_FILE)?;
        Self::compile(file.rules)
    }

    fn compile(entries: Vec<RuleEntry>) -> Result<Self> {
        let mut table = Self::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let rule = Rule {
                action: entry.action,
                src: parse_net(index, "src", entry.src.as_deref())?,
                dst: parse_net(index, "dst", entry.dst.as_deref())?,
                proto: entry.proto,
                src_port: entry.src_port,
                dst_port: entry.dst_port,
            };
            match entry.stage {
                Stage::Ingress => table.ingress.push(rule),
                Stage::Egress => table.egress.push(rule),
            }
        }
        tracing::info!(
            ingress = table.ingress.len(),
            egress = table.egress.len(),
            "acl rules compiled"
        );
        Ok(table)
    }

    pub fn rules(&self, stage: Stage) -> &[Rule] {
        match stage {
            Stage::Ingress => &self.ingress,
            Stage::Egress => &self.egress,
        }
    }

    pub fn len(&self) -> usize {
        self.ingress.len() + self.egress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Action of the first rule of `stage` matching `tuple`.
    #[inline]
    pub fn evaluate(&self, stage: Stage, tuple: &FlowTuple) -> Action {
        self.rules(stage)
            .iter()
            .find(|rule| rule.matches(tuple))
            .map_or(Action::Accept, |rule| rule.action)
    }
}

fn parse_net(index: usize, field: &str, raw: Option<&str>) -> Result<Option<IpNet>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    // A bare address is a host route.
    let parsed = raw
        .parse::<IpNet>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from));
    parsed
        .map(Some)
        .map_err(|_| Error::Config(format!("acl rule {} {}: invalid network '{}'", index, field, raw)))
}

pub struct AclModule {
    config_dir: PathBuf,
}

impl AclModule {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
        }
    }

    fn load(&self, snapshot: &mut Snapshot) -> Result<()> {
        let table =
            AclTable::load(&self.config_dir).map_err(|e| Error::module(self.name(), e.to_string()))?;
        snapshot.modules.insert(ModuleId::ACL, table);
        Ok(())
    }
}

impl Module for AclModule {
    fn id(&self) -> ModuleId {
        ModuleId::ACL
    }

    fn name(&self) -> &'static str {
        "acl"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_init()
            .with_process()
            .with_conf()
            .with_free()
    }

    fn init(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.load(snapshot)
    }

    #[inline]
    fn process(&self, snapshot: &Snapshot, pkt: Mbuf, hook: Hook) -> Verdict {
        let stage = match hook {
            Hook::Ingress => Stage::Ingress,
            Hook::Egress => Stage::Egress,
            _ => return Verdict::Accept(pkt),
        };
        let Some(table) = snapshot.modules.get::<AclTable>(ModuleId::ACL) else {
            return Verdict::Accept(pkt);
        };
        match table.evaluate(stage, &pkt.meta().tuple) {
            Action::Accept => Verdict::Accept(pkt),
            Action::Drop => {
                drop(pkt);
                Verdict::Stolen
            }
        }
    }

    fn conf(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.load(snapshot)
    }

    fn describe(&self, snapshot: &Snapshot) -> Option<String> {
        let table = snapshot.modules.get::<AclTable>(ModuleId::ACL)?;
        if table.is_empty() {
            return Some("no rules, accepting everything".to_string());
        }
        Some(format!(
            "{} rules (ingress {}, egress {})",
            table.len(),
            table.rules(Stage::Ingress).len(),
            table.rules(Stage::Egress).len()
        ))
    }

    fn free(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.modules.take(ModuleId::ACL);
        Ok(())
    }
}
