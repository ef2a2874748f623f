#![deny(missing_docs)]
//! Torii API contains the domain-controller module traits and the basic
//! types required to define the api of those traits.
//!
//! If you want to run an actual domain controller, please see the
//! torii_domain_srv crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

mod error;
pub use error::*;

mod timestamp;
pub use timestamp::*;

pub mod id;
pub use id::{AssignmentId, DomainId, LocalId, NodeId, SessionSecret};

pub mod node;
pub use node::*;

pub mod assignment;
pub use assignment::*;

pub mod protocol;

pub mod settings;
pub use settings::{SettingsStore, SettingsUpdate};

pub mod datagrams;
pub use datagrams::*;

pub mod registry;
pub use registry::*;

pub mod metaverse;
pub use metaverse::*;

pub mod backup;
pub use backup::*;

pub mod builder;
pub use builder::*;
