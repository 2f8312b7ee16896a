//! Module registry and hook pipeline.
//!
//! Modules are trait objects registered once at startup into a fixed-size table
//! indexed by [`ModuleId`]. Each [`Hook`] owns a compiled-in ordered list of
//! module ids; [`Registry::dispatch`] walks that list and stops at the first
//! module that steals the packet.

use std::fmt;
use std::sync::Arc;

use ringwall_common::MAX_MODULE_NUM;

use crate::error::Result;
use crate::mbuf::Mbuf;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u16);

impl ModuleId {
    /// Reserved; never registered.
    pub const NONE: ModuleId = ModuleId(0);
    pub const INTERFACE: ModuleId = ModuleId(1);
    pub const DECODER: ModuleId = ModuleId(2);
    pub const ACL: ModuleId = ModuleId(3);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stages, in packet order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hook {
    Recv,
    Ingress,
    PreRouting,
    Forward,
    PostRouting,
    LocalIn,
    LocalOut,
    Egress,
    Send,
}

impl Hook {
    pub const COUNT: usize = 9;

    pub const ALL: [Hook; Hook::COUNT] = [
        Hook::Recv,
        Hook::Ingress,
        Hook::PreRouting,
        Hook::Forward,
        Hook::PostRouting,
        Hook::LocalIn,
        Hook::LocalOut,
        Hook::Egress,
        Hook::Send,
    ];

    /// Hooks an inspection worker runs, ingress through egress.
    pub const INSPECTION: [Hook; 7] = [
        Hook::Ingress,
        Hook::PreRouting,
        Hook::Forward,
        Hook::PostRouting,
        Hook::LocalIn,
        Hook::LocalOut,
        Hook::Egress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Hook::Recv => "recv",
            Hook::Ingress => "ingress",
            Hook::PreRouting => "prerouting",
            Hook::Forward => "forward",
            Hook::PostRouting => "postrouting",
            Hook::LocalIn => "localin",
            Hook::LocalOut => "localout",
            Hook::Egress => "egress",
            Hook::Send => "send",
        }
    }
}

/// Per-module, per-packet outcome.
///
/// `Accept` hands the packet back so the next module can run; `Stolen` means
/// the module kept (dropped, queued, redirected) the packet and the pipeline
/// ends for it.
#[must_use]
#[derive(Debug)]
pub enum Verdict {
    Accept(Mbuf),
    Stolen,
}

impl Verdict {
    #[cfg(test)]
    pub fn is_stolen(&self) -> bool {
        matches!(self, Verdict::Stolen)
    }
}

/// Which callbacks a module implements. Registry walks skip the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub init: bool,
    pub process: bool,
    pub conf: bool,
    pub free: bool,
}

impl Capabilities {
    pub const fn none() -> Self {
        Self {
            init: false,
            process: false,
            conf: false,
            free: false,
        }
    }

    pub const fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    pub const fn with_process(mut self) -> Self {
        self.process = true;
        self
    }

    pub const fn with_conf(mut self) -> Self {
        self.conf = true;
        self
    }

    pub const fn with_free(mut self) -> Self {
        self.free = true;
        self
    }
}

/// A pluggable inspection/modification module.
///
/// `init`, `conf` and `free` only ever see a snapshot that no worker is
/// reading, so they get it mutably. `process` runs on worker cores against
/// the snapshot that core currently holds.
pub trait Module: Send + Sync {
    fn id(&self) -> ModuleId;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn enabled(&self) -> bool {
        true
    }

    /// Trace every verdict of this module.
    fn loggable(&self) -> bool {
        false
    }

    /// Build derived state in the first snapshot.
    fn init(&self, _snapshot: &mut Snapshot) -> Result<()> {
        Ok(())
    }

    fn process(&self, _snapshot: &Snapshot, pkt: Mbuf, _hook: Hook) -> Verdict {
        Verdict::Accept(pkt)
    }

    /// Rebuild derived state in a freshly copied snapshot.
    fn conf(&self, _snapshot: &mut Snapshot) -> Result<()> {
        Ok(())
    }

    /// Release derived state of a retired snapshot.
    fn free(&self, _snapshot: &mut Snapshot) -> Result<()> {
        Ok(())
    }

    /// One-line summary of the state this module keeps in `snapshot`.
    fn describe(&self, _snapshot: &Snapshot) -> Option<String> {
        None
    }
}

/// Ordered module ids per hook.
#[derive(Debug, Clone, Default)]
pub struct HookTable {
    hooks: [Vec<ModuleId>; Hook::COUNT],
}

impl HookTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The firewall's pipeline: decode then policy on the way in and out,
    /// topology at pre-routing.
    pub fn builtin() -> Self {
        Self::empty()
            .with(Hook::Ingress, &[ModuleId::DECODER, ModuleId::ACL])
            .with(Hook::PreRouting, &[ModuleId::INTERFACE])
            .with(Hook::Egress, &[ModuleId::DECODER, ModuleId::ACL])
    }

    pub fn with(mut self, hook: Hook, ids: &[ModuleId]) -> Self {
        self.hooks[hook as usize] = ids.to_vec();
        self
    }

    pub fn modules(&self, hook: Hook) -> &[ModuleId] {
        &self.hooks[hook as usize]
    }
}

pub struct Registry {
    modules: Vec<Option<Arc<dyn Module>>>,
    hooks: HookTable,
}

impl Registry {
    pub fn new(hooks: HookTable) -> Self {
        Self {
            modules: vec![None; MAX_MODULE_NUM],
            hooks,
        }
    }

    /// Insert a module under its id. The first registration for an id wins;
    /// later ones and out-of-range ids are ignored. Returns whether the
    /// module was inserted.
    pub fn register(&mut self, module: Arc<dyn Module>) -> bool {
        let id = module.id();
        if id == ModuleId::NONE || id.index() >= MAX_MODULE_NUM {
            tracing::warn!(module = module.name(), %id, "module id out of range, ignored");
            return false;
        }
        let slot = &mut self.modules[id.index()];
        if let Some(existing) = slot {
            tracing::warn!(
                module = module.name(),
                existing = existing.name(),
                %id,
                "module id already registered, ignored"
            );
            return false;
        }
        tracing::info!("module load {}", module.name());
        *slot = Some(module);
        true
    }

    #[inline]
    pub fn get(&self, id: ModuleId) -> Option<&Arc<dyn Module>> {
        self.modules.get(id.index()).and_then(Option::as_ref)
    }

    /// Registered modules in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Module>> {
        self.modules.iter().flatten()
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn init_all(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.each("init", |c| c.init, snapshot, |m, s| m.init(s))
    }

    pub fn conf_all(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.each("conf", |c| c.conf, snapshot, |m, s| m.conf(s))
    }

    pub fn free_all(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.each("free", |c| c.free, snapshot, |m, s| m.free(s))
    }

    fn each(
        &self,
        what: &str,
        has: fn(&Capabilities) -> bool,
        snapshot: &mut Snapshot,
        call: impl Fn(&dyn Module, &mut Snapshot) -> Result<()>,
    ) -> Result<()> {
        for module in self.iter() {
            if !module.enabled() || !has(&module.capabilities()) {
                continue;
            }
            tracing::info!("module {} {}", what, module.name());
            call(module.as_ref(), snapshot)?;
        }
        Ok(())
    }

    /// Run `pkt` through every module on `hook`, in order.
    #[inline]
    pub fn dispatch(&self, snapshot: &Snapshot, mut pkt: Mbuf, hook: Hook) -> Verdict {
        for &id in self.hooks.modules(hook) {
            let Some(module) = self.get(id) else {
                continue;
            };
            if !module.enabled() || !module.capabilities().process {
                continue;
            }
            match module.process(snapshot, pkt, hook) {
                Verdict::Accept(p) => pkt = p,
                Verdict::Stolen => {
                    if module.loggable() {
                        tracing::trace!(module = module.name(), hook = hook.name(), "stolen");
                    }
                    return Verdict::Stolen;
                }
            }
            if module.loggable() {
                tracing::trace!(
                    module = module.name(),
                    hook = hook.name(),
                    port_out = pkt.meta().port_out,
                    "accept"
                );
            }
        }
        Verdict::Accept(pkt)
    }

    /// Run `pkt` through the inspection hooks, ingress through egress.
    #[inline]
    pub fn inspect(&self, snapshot: &Snapshot, mut pkt: Mbuf) -> Verdict {
        for hook in Hook::INSPECTION {
            match self.dispatch(snapshot, pkt, hook) {
                Verdict::Accept(p) => pkt = p,
                Verdict::Stolen => return Verdict::Stolen,
            }
        }
        Verdict::Accept(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testutil;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every call into a shared log.
    struct Probe {
        id: ModuleId,
        name: &'static str,
        steal: bool,
        enabled: bool,
        fail_conf: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(id: u16, name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: ModuleId(id),
                name,
                steal: false,
                enabled: true,
                fail_conf: false,
                log: log.clone(),
            }
        }

        fn record(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
        }
    }

    impl Module for Probe {
        fn id(&self) -> ModuleId {
            self.id
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none()
                .with_init()
                .with_process()
                .with_conf()
                .with_free()
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn init(&self, _snapshot: &mut Snapshot) -> Result<()> {
            self.record("init");
            Ok(())
        }

        fn process(&self, _snapshot: &Snapshot, pkt: Mbuf, hook: Hook) -> Verdict {
            self.record(hook.name());
            if self.steal {
                drop(pkt);
                Verdict::Stolen
            } else {
                Verdict::Accept(pkt)
            }
        }

        fn conf(&self, _snapshot: &mut Snapshot) -> Result<()> {
            self.record("conf");
            if self.fail_conf {
                return Err(Error::module(self.name, "bad rules"));
            }
            Ok(())
        }

        fn free(&self, _snapshot: &mut Snapshot) -> Result<()> {
            self.record("free");
            Ok(())
        }
    }

    /// Module with no callbacks at all.
    struct Inert(AtomicUsize);

    impl Module for Inert {
        fn id(&self) -> ModuleId {
            ModuleId(9)
        }

        fn name(&self) -> &'static str {
            "inert"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none()
        }

        fn process(&self, _snapshot: &Snapshot, pkt: Mbuf, _hook: Hook) -> Verdict {
            self.0.fetch_add(1, Ordering::Relaxed);
            Verdict::Accept(pkt)
        }
    }

    fn abc_registry(steal_b: bool) -> (Registry, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookTable::empty().with(Hook::Forward, &[ModuleId(1), ModuleId(2), ModuleId(3)]);
        let mut registry = Registry::new(hooks);
        registry.register(Arc::new(Probe::new(1, "a", &log)));
        let mut b = Probe::new(2, "b", &log);
        b.steal = steal_b;
        registry.register(Arc::new(b));
        registry.register(Arc::new(Probe::new(3, "c", &log)));
        (registry, log)
    }

    #[test]
    fn test_dispatch_runs_in_order() {
        let (registry, log) = abc_registry(false);
        let fixture = testutil::Fixture::vwire_pair();
        let snapshot = fixture.snapshot();
        let pkt = fixture.pool.alloc().unwrap();

        let verdict = registry.dispatch(&snapshot, pkt, Hook::Forward);
        assert!(matches!(verdict, Verdict::Accept(_)));
        assert_eq!(*log.lock().unwrap(), vec!["a:forward", "b:forward", "c:forward"]);
    }

    #[test]
    fn test_stolen_stops_pipeline() {
        let (registry, log) = abc_registry(true);
        let fixture = testutil::Fixture::vwire_pair();
        let snapshot = fixture.snapshot();
        let pkt = fixture.pool.alloc().unwrap();

        let verdict = registry.dispatch(&snapshot, pkt, Hook::Forward);
        assert!(verdict.is_stolen());
        assert_eq!(*log.lock().unwrap(), vec!["a:forward", "b:forward"]);
        drop(verdict);
        assert_eq!(fixture.pool.in_use(), 0);
    }

    #[test]
    fn test_empty_hook_accepts() {
        let (registry, log) = abc_registry(true);
        let fixture = testutil::Fixture::vwire_pair();
        let snapshot = fixture.snapshot();
        let pkt = fixture.pool.alloc().unwrap();

        assert!(matches!(
            registry.dispatch(&snapshot, pkt, Hook::Send),
            Verdict::Accept(_)
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_first_registration_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new(HookTable::empty());
        assert!(registry.register(Arc::new(Probe::new(5, "first", &log))));
        assert!(!registry.register(Arc::new(Probe::new(5, "second", &log))));
        assert!(!registry.register(Arc::new(Probe::new(0, "none", &log))));
        assert!(!registry.register(Arc::new(Probe::new(MAX_MODULE_NUM as u16, "big", &log))));
        assert_eq!(registry.get(ModuleId(5)).unwrap().name(), "first");
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_lifecycle_skips_disabled_and_incapable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inert = Arc::new(Inert(AtomicUsize::new(0)));
        let mut registry = Registry::new(HookTable::empty().with(Hook::Ingress, &[ModuleId(9)]));
        let mut off = Probe::new(4, "off", &log);
        off.enabled = false;
        registry.register(Arc::new(off));
        registry.register(Arc::new(Probe::new(2, "on", &log)));
        registry.register(inert.clone());

        let fixture = testutil::Fixture::vwire_pair();
        let mut snapshot = fixture.snapshot();
        registry.init_all(&mut snapshot).unwrap();
        registry.conf_all(&mut snapshot).unwrap();
        registry.free_all(&mut snapshot).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["on:init", "on:conf", "on:free"]);

        let pkt = fixture.pool.alloc().unwrap();
        let _ = registry.dispatch(&snapshot, pkt, Hook::Ingress);
        assert_eq!(inert.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_conf_fails_fast_in_id_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new(HookTable::empty());
        let mut bad = Probe::new(1, "bad", &log);
        bad.fail_conf = true;
        registry.register(Arc::new(Probe::new(2, "later", &log)));
        registry.register(Arc::new(bad));

        let fixture = testutil::Fixture::vwire_pair();
        let mut snapshot = fixture.snapshot();
        let err = registry.conf_all(&mut snapshot).unwrap_err();
        assert!(matches!(err, Error::Module { module: "bad", .. }));
        assert_eq!(*log.lock().unwrap(), vec!["bad:conf"]);
    }

    #[test]
    fn test_builtin_hook_table() {
        let hooks = HookTable::builtin();
        assert_eq!(hooks.modules(Hook::Ingress), &[ModuleId::DECODER, ModuleId::ACL]);
        assert_eq!(hooks.modules(Hook::PreRouting), &[ModuleId::INTERFACE]);
        assert!(hooks.modules(Hook::Recv).is_empty());
        assert!(hooks.modules(Hook::Send).is_empty());
    }
}
