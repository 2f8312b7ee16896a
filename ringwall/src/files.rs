//! On-disk topology files: `interface.json` and `worker.json`.
//!
//! Both are read once at startup. Every field the dataplane needs is required;
//! a missing one is a load error rather than a silent default.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use ringwall_common::{MAX_LCORE, MAX_PORT_NUM, MAX_QUEUE_NUM};

use crate::error::{Error, Result};
use crate::port::{PortConfig, PortType};
use crate::worker::{Role, WorkerDesc};

pub const INTERFACE_FILE: &str = "interface.json";
pub const WORKER_FILE: &str = "worker.json";
pub const ACL_FILE: &str = "acl.json";

pub(crate) fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    let content = fs::read_to_string(&path).map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::Json { path, source })
}

#[derive(Debug, Deserialize)]
struct InterfaceFile {
    ports: Vec<PortEntry>,
}

#[derive(Debug, Deserialize)]
struct PortEntry {
    id: u16,
    #[serde(rename = "type")]
    kind: String,
    bus: String,
    mac: String,
    vwire: u32,
}

/// Load the ordered port list from `interface.json`.
pub fn load_interfaces(dir: &Path) -> Result<Vec<PortConfig>> {
    let file: InterfaceFile = read_json(dir, INTERFACE_FILE)?;
    parse_interfaces(file)
}

fn parse_interfaces(file: InterfaceFile) -> Result<Vec<PortConfig>> {
    let mut seen = HashSet::new();
    let mut ports = Vec::with_capacity(file.ports.len());

    for entry in file.ports {
        if entry.id as usize >= MAX_PORT_NUM {
            return Err(Error::Config(format!(
                "port id {} out of range (max {})",
                entry.id,
                MAX_PORT_NUM - 1
            )));
        }
        if !seen.insert(entry.id) {
            return Err(Error::Config(format!("port id {} listed twice", entry.id)));
        }

        let port = PortConfig {
            id: entry.id,
            kind: PortType::from_name(&entry.kind),
            bus: entry.bus,
            mac: entry.mac,
            vwire: entry.vwire,
        };
        tracing::info!(
            port = port.id,
            kind = ?port.kind,
            bus = %port.bus,
            mac = %port.mac,
            vwire = port.vwire,
            "port loaded"
        );
        ports.push(port);
    }

    tracing::info!("total port num {}", ports.len());
    Ok(ports)
}

#[derive(Debug, Deserialize)]
struct WorkerFile {
    lcores: Vec<LcoreEntry>,
}

#[derive(Debug, Deserialize)]
struct LcoreEntry {
    lcore_id: u16,
    role: String,
    #[serde(default)]
    ports: Option<String>,
    #[serde(default)]
    queues: Option<String>,
}

/// Load lcore role assignments from `worker.json`.
pub fn load_workers(dir: &Path) -> Result<Vec<WorkerDesc>> {
    let file: WorkerFile = read_json(dir, WORKER_FILE)?;
    parse_workers(file)
}

fn parse_workers(file: WorkerFile) -> Result<Vec<WorkerDesc>> {
    let mut seen = HashSet::new();
    let mut workers = Vec::with_capacity(file.lcores.len());

    for (index, entry) in file.lcores.into_iter().enumerate() {
        let lcore = entry.lcore_id;
        if lcore as usize >= MAX_LCORE {
            return Err(Error::Config(format!(
                "lcore {} out of range (max {})",
                lcore,
                MAX_LCORE - 1
            )));
        }
        if !seen.insert(lcore) {
            return Err(Error::Config(format!("lcore {} assigned twice", lcore)));
        }

        let role = Role::from_name(&entry.role);
        let (ports, queues) = if role.owns_queues() {
            let ports = required_list(lcore, "ports", entry.ports.as_deref(), MAX_PORT_NUM)?;
            let queues = required_list(lcore, "queues", entry.queues.as_deref(), MAX_QUEUE_NUM)?;
            (ports, queues)
        } else {
            (Vec::new(), Vec::new())
        };

        tracing::info!(
            worker = index,
            lcore,
            role = ?role,
            port_num = ports.len(),
            queue_num = queues.len(),
            "worker loaded"
        );
        workers.push(WorkerDesc::new(lcore, role, ports, queues));
    }

    Ok(workers)
}

fn required_list(lcore: u16, field: &str, raw: Option<&str>, max: usize) -> Result<Vec<u16>> {
    let raw = raw.ok_or_else(|| {
        Error::Config(format!("lcore {} has no {} list for its role", lcore, field))
    })?;
    let values = split_by_comma(raw).map_err(|reason| {
        Error::Config(format!("lcore {} {}: {}", lcore, field, reason))
    })?;
    if values.is_empty() {
        return Err(Error::Config(format!("lcore {} {} num is 0", lcore, field)));
    }
    if let Some(bad) = values.iter().find(|&&v| v as usize >= max) {
        return Err(Error::Config(format!(
            "lcore {} {} value {} out of range (max {})",
            lcore,
            field,
            bad,
            max - 1
        )));
    }
    Ok(values)
}

/// Split `"0,1, 3"` into `[0, 1, 3]`, keeping order and dropping duplicates.
fn split_by_comma(raw: &str) -> std::result::Result<Vec<u16>, String> {
    let mut values = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let value: u16 = part
            .parse()
            .map_err(|_| format!("'{}' is not a number", part))?;
        if !values.contains(&value) {
            values.push(value);
        }
    }
    Ok(values)
}
