//! Factories for module implementations provided by torii_core.

mod mem_registry;
pub use mem_registry::*;

mod mem_datagrams;
pub use mem_datagrams::*;
