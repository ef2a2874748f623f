//! The backup handlers shipped with the engine: the entities file, the
//! content-settings snapshot, and the asset blobs.

use crate::entities::EntitiesFile;
use std::sync::Arc;
use torii_api::*;

/// Archive entry name for the entities file.
pub const ENTITIES_ENTRY: &str = "models.json.gz";

/// Archive entry name for the content-settings snapshot.
pub const CONTENT_SETTINGS_ENTRY: &str = "content-settings.json";

/// Archive entry prefix for asset blobs.
pub const ASSETS_PREFIX: &str = "files/";

/// Archives and recovers the authoritative entities file. Recovery
/// goes through the `.replace` staging path, so it inherits the swap
/// protocol's crash safety.
#[derive(Debug)]
pub struct EntitiesBackupHandler {
    entities: Arc<EntitiesFile>,
}

impl EntitiesBackupHandler {
    /// Construct over the entities file manager.
    pub fn create(entities: Arc<EntitiesFile>) -> DynBackupHandler {
        let out: DynBackupHandler = Arc::new(Self { entities });
        out
    }
}

impl BackupHandler for EntitiesBackupHandler {
    fn name(&self) -> &str {
        "entities"
    }

    fn backup(&self) -> BoxFut<'_, ToriiResult<Vec<ArchiveEntry>>> {
        Box::pin(async move {
            Ok(match self.entities.read_raw()? {
                Some(raw) => vec![ArchiveEntry {
                    name: ENTITIES_ENTRY.into(),
                    data: raw,
                }],
                None => Vec::new(),
            })
        })
    }

    fn load(&self, entry: ArchiveEntry) -> BoxFut<'_, ToriiResult<bool>> {
        Box::pin(async move {
            if entry.name != ENTITIES_ENTRY {
                return Ok(false);
            }
            self.entities.stage_replacement(&entry.data)?;
            self.entities.swap_in_replacement()?;
            Ok(true)
        })
    }
}

/// Archives and recovers the content settings (the settings snapshot
/// minus the security tree).
#[derive(Debug)]
pub struct ContentSettingsBackupHandler {
    settings: SettingsStore,
}

impl ContentSettingsBackupHandler {
    /// Construct over the settings store.
    pub fn create(settings: SettingsStore) -> DynBackupHandler {
        let out: DynBackupHandler = Arc::new(Self { settings });
        out
    }
}

impl BackupHandler for ContentSettingsBackupHandler {
    fn name(&self) -> &str {
        "content-settings"
    }

    fn backup(&self) -> BoxFut<'_, ToriiResult<Vec<ArchiveEntry>>> {
        Box::pin(async move {
            let mut snapshot = self.settings.snapshot();
            if let Some(map) = snapshot.as_object_mut() {
                // operator credentials do not belong in content backups
                map.remove("security");
            }
            let data = serde_json::to_vec_pretty(&snapshot).map_err(
                |e| ToriiError::other_src("encode content settings", e),
            )?;
            Ok(vec![ArchiveEntry {
                name: CONTENT_SETTINGS_ENTRY.into(),
                data: data.into(),
            }])
        })
    }

    fn load(&self, entry: ArchiveEntry) -> BoxFut<'_, ToriiResult<bool>> {
        Box::pin(async move {
            if entry.name != CONTENT_SETTINGS_ENTRY {
                return Ok(false);
            }
            let patch: serde_json::Value =
                serde_json::from_slice(&entry.data).map_err(|e| {
                    ToriiError::other_src("parse content settings", e)
                })?;
            // parse fully before applying: either the whole snapshot
            // goes in or nothing does
            self.settings.recurse_and_overwrite(patch)?;
            Ok(true)
        })
    }
}

/// Archives and recovers the asset blobs under the asset directory.
#[derive(Debug)]
pub struct AssetsBackupHandler {
    assets_dir: std::path::PathBuf,
}

impl AssetsBackupHandler {
    /// Construct over the asset blob directory.
    pub fn create(
        assets_dir: impl Into<std::path::PathBuf>,
    ) -> DynBackupHandler {
        let out: DynBackupHandler = Arc::new(Self {
            assets_dir: assets_dir.into(),
        });
        out
    }
}

impl BackupHandler for AssetsBackupHandler {
    fn name(&self) -> &str {
        "assets"
    }

    fn backup(&self) -> BoxFut<'_, ToriiResult<Vec<ArchiveEntry>>> {
        Box::pin(async move {
            let dir = match std::fs::read_dir(&self.assets_dir) {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Vec::new())
                }
                Err(e) => {
                    return Err(ToriiError::other_src(
                        "read assets dir",
                        e,
                    ))
                }
            };

            let mut out = Vec::new();
            for entry in dir {
                let entry = entry.map_err(|e| {
                    ToriiError::other_src("read assets dir entry", e)
                })?;
                if !entry.path().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let data = std::fs::read(entry.path()).map_err(|e| {
                    ToriiError::other_src("read asset blob", e)
                })?;
                out.push(ArchiveEntry {
                    name: format!("{ASSETS_PREFIX}{name}"),
                    data: data.into(),
                });
            }
            Ok(out)
        })
    }

    fn load(&self, entry: ArchiveEntry) -> BoxFut<'_, ToriiResult<bool>> {
        Box::pin(async move {
            let name = match entry.name.strip_prefix(ASSETS_PREFIX) {
                Some(name) => name,
                None => return Ok(false),
            };
            if name.is_empty() || name.contains('/') || name.contains("..")
            {
                return Err(ToriiError::other(format!(
                    "refusing asset entry name {:?}",
                    entry.name
                )));
            }

            std::fs::create_dir_all(&self.assets_dir).map_err(|e| {
                ToriiError::other_src("create assets dir", e)
            })?;
            let path = self.assets_dir.join(name);
            let tmp = path.with_extension("part");
            std::fs::write(&tmp, &entry.data)
                .and_then(|_| std::fs::rename(&tmp, &path))
                .map_err(|e| {
                    ToriiError::other_src("write asset blob", e)
                })?;
            Ok(true)
        })
    }
}
