#![deny(missing_docs)]
//! The production module implementations for the torii domain
//! controller.
//!
//! The interesting engineering here is the control plane: the
//! gatekeeper admission state machine, the node registry with its
//! interest-set fan-out, the static-assignment queue that keeps workers
//! respawned, the ICE/metaverse heartbeat loops with failover, and the
//! packet dispatch that feeds them. These modules are tightly coupled
//! through one shared membership table ([torii_api::NodeRegistry]) and
//! one settings store ([torii_api::SettingsStore]).

pub mod factories;

pub mod dispatch;
pub use dispatch::*;

pub mod gatekeeper;

pub mod assignment_queue;
pub use assignment_queue::AssignmentQueue;

pub mod fanout;
pub use fanout::MembershipFanout;

pub mod heartbeat;

pub mod services;
pub use services::NodeServices;

pub mod identity;
pub use identity::*;

/// Construct a builder with the default production module factories.
pub fn default_builder() -> torii_api::Builder {
    torii_api::Builder {
        settings: torii_api::SettingsStore::new_ephemeral(),
        registry: factories::MemRegistryFactory::create(),
        datagrams: factories::MemDatagramsFactory::create(),
    }
}
