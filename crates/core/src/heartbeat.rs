//! The two periodic presence engines: the metaverse heartbeat and the
//! signed ice-server heartbeat.
//!
//! Both are explicit state machines driven by a `tick` function rather
//! than hidden callbacks, so the failover and keypair-regeneration
//! thresholds are directly testable.

mod metaverse;
pub use metaverse::*;

mod ice;
pub use ice::*;
