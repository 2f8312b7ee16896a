//! Builtin inspection modules.

pub mod acl;
pub mod decoder;
pub mod interface;

use std::path::Path;
use std::sync::Arc;

use crate::module::{HookTable, Registry};

pub use acl::AclModule;
pub use decoder::DecoderModule;
pub use interface::InterfaceModule;

/// Registry with every builtin module on the builtin hook table.
pub fn builtin(config_dir: &Path) -> Registry {
    let mut registry = Registry::new(HookTable::builtin());
    registry.register(Arc::new(InterfaceModule));
    registry.register(Arc::new(DecoderModule));
    registry.register(Arc::new(AclModule::new(config_dir)));
    registry
}
