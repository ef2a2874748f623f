#![deny(missing_docs)]
//! The content backup engine for the torii domain controller.
//!
//! The engine owns two things on disk: the authoritative entities file
//! (a gzipped scene prefixed by an `{id, version}` header) and a
//! directory of zip backup archives. Archives are produced by
//! rule-driven snapshots and restored by streaming each entry to its
//! registered [torii_api::BackupHandler]. Replacing the entities file
//! goes through a `.replace` staging path so a crash mid-write can
//! never corrupt the authoritative scene.

pub mod entities;
pub use entities::*;

pub mod engine;
pub use engine::*;

pub mod handlers;
pub use handlers::*;
