//! Module management for Tether processes.
//!
//! A [`ModuleManager`] loads [`Module`]s, registers their components in a
//! [`DiContainer`] under `"<namespace>.<name>"` and resolves component ids,
//! first locally and then through an [`ObjectRemotingRouter`] that asks the
//! connected peers. The [`bootstrap`] module carries the command-line
//! contract used to start child processes that connect back to a host.

pub mod bootstrap;
pub mod component;
pub mod di;
pub mod error;
pub mod manager;
pub mod module;
pub mod router;

pub use bootstrap::{fork, module_manager, set_module_manager};
pub use component::{ComponentCollection, ComponentInfo, ComponentKind, Descriptor};
pub use di::{DiContainer, Registration};
pub use error::{ModuleError, ModuleResult};
pub use manager::{Communication, ModuleManager};
pub use module::{Module, ModuleInfo};
pub use router::{ClientRouter, HostRouter, LocalResolver, ObjectRemotingRouter};
