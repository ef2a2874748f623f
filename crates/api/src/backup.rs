//! Backup-handler related types.
//!
//! The content backup engine archives the entities file plus the
//! contribution of every registered handler. Handlers are pluggable
//! and must be atomic or reversible: a recovery either fully applies
//! or leaves the system unchanged.

use crate::*;
use std::sync::Arc;

/// One entry a handler contributes to (or consumes from) an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// The entry name inside the archive, e.g. `content-settings.json`.
    pub name: String,
    /// The entry bytes.
    pub data: bytes::Bytes,
}

/// Represents the ability to contribute to and recover from content
/// backups.
pub trait BackupHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Produce this handler's archive entries for a backup being
    /// created.
    fn backup(&self) -> BoxFut<'_, ToriiResult<Vec<ArchiveEntry>>>;

    /// Offer one recovered archive entry to this handler. Returns
    /// `true` if the entry was consumed. Must fully apply or leave the
    /// system unchanged.
    fn load(&self, entry: ArchiveEntry) -> BoxFut<'_, ToriiResult<bool>>;
}

/// Trait-object [BackupHandler].
pub type DynBackupHandler = Arc<dyn BackupHandler>;
