//! The rule-driven backup scheduler, recovery, and consolidation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use torii_api::*;

/// Settings keys read by [BackupEngine].
mod keys {
    /// Seconds between scheduler sweeps.
    pub const CHECK_INTERVAL_SECS: &str = "backups.check_interval_secs";
    /// The rule table.
    pub const RULES: &str = "backups.rules";
}

const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// One snapshot rule. A rule fires when wall-clock time crosses
/// `last_fired + interval`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackupRule {
    /// The rule name, used in logs and archive pruning.
    pub name: String,
    /// Seconds between snapshots.
    pub interval_secs: u64,
    /// Archives kept for this rule before the oldest are deleted.
    pub max_kept: usize,
    /// The archive filename pattern; `{timestamp}` expands to unix
    /// seconds at creation time.
    pub format: String,
}

impl BackupRule {
    fn expand(&self, now: Timestamp) -> String {
        self.format.replace(
            "{timestamp}",
            &(now.as_micros() / 1_000_000).to_string(),
        )
    }

    /// The fixed prefix of this rule's archive names, for pruning and
    /// last-fired recovery.
    fn prefix(&self) -> &str {
        self.format.split("{timestamp}").next().unwrap_or("")
    }
}

/// Progress of an asynchronous consolidation ("download this backup")
/// job.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConsolidationState {
    /// The job is running.
    InProgress,
    /// The consolidated archive is ready.
    CompleteWithSuccess {
        /// Path of the consolidated archive.
        path: std::path::PathBuf,
    },
    /// The job failed.
    CompleteWithError {
        /// What went wrong.
        error: String,
    },
}

/// A listed archive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArchiveInfo {
    /// The archive id (its filename).
    pub id: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Creation time, micros since epoch.
    pub created: i64,
}

/// The content backup engine. Owns the backup directory: it is
/// append-only from the outside, and only this engine deletes from it.
pub struct BackupEngine {
    settings: SettingsStore,
    backups_dir: std::path::PathBuf,
    handlers: Mutex<Vec<DynBackupHandler>>,
    last_fired: Mutex<HashMap<String, Timestamp>>,
    consolidations: Arc<Mutex<HashMap<String, ConsolidationState>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("backups_dir", &self.backups_dir)
            .finish()
    }
}

impl Drop for BackupEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl BackupEngine {
    /// Construct the engine over a backup directory.
    pub fn create(
        settings: SettingsStore,
        backups_dir: impl Into<std::path::PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            backups_dir: backups_dir.into(),
            handlers: Mutex::new(Vec::new()),
            last_fired: Mutex::new(HashMap::new()),
            consolidations: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        })
    }

    /// Register a backup handler. Handlers are pluggable; each one
    /// contributes entries to every archive and consumes matching
    /// entries on recovery.
    pub fn add_handler(&self, handler: DynBackupHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// The backup archive directory.
    pub fn backups_path(&self) -> &std::path::Path {
        &self.backups_dir
    }

    /// Spawn the scheduler loop.
    pub fn start(self: Arc<Self>) {
        let engine = Arc::downgrade(&self);
        let task = tokio::task::spawn(async move {
            loop {
                let interval = match engine.upgrade() {
                    Some(engine) => engine.settings.get_or(
                        keys::CHECK_INTERVAL_SECS,
                        DEFAULT_CHECK_INTERVAL_SECS,
                    ),
                    None => break,
                };
                tokio::time::sleep(std::time::Duration::from_secs(
                    interval.max(1),
                ))
                .await;
                match engine.upgrade() {
                    Some(engine) => engine.tick(Timestamp::now()).await,
                    None => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    /// The configured rules.
    pub fn rules(&self) -> Vec<BackupRule> {
        self.settings.get_or(keys::RULES, Vec::new())
    }

    /// One scheduler sweep: fire every due rule, then prune its
    /// archives beyond `max_kept`.
    pub async fn tick(&self, now: Timestamp) {
        for rule in self.rules() {
            let due = {
                let mut last_fired = self.last_fired.lock().unwrap();
                let last = *last_fired
                    .entry(rule.name.clone())
                    .or_insert_with(|| {
                        self.newest_archive_time(&rule)
                            .unwrap_or(Timestamp::from_micros(0))
                    });
                let interval =
                    std::time::Duration::from_secs(rule.interval_secs);
                if last + interval <= now {
                    last_fired.insert(rule.name.clone(), now);
                    true
                } else {
                    false
                }
            };
            if !due {
                continue;
            }

            tracing::info!(rule = %rule.name, "backup rule fired");
            if let Err(err) = self.create_archive(&rule.expand(now)).await
            {
                tracing::warn!(?err, rule = %rule.name,
                    "backup creation failed");
                continue;
            }
            if let Err(err) = self.prune(&rule) {
                tracing::warn!(?err, rule = %rule.name,
                    "backup pruning failed");
            }
        }
    }

    /// Create a manual archive immediately. Returns the archive id.
    pub async fn create_manual(&self, label: &str) -> ToriiResult<String> {
        let now = Timestamp::now().as_micros() / 1_000_000;
        let id = format!("manual-{label}-{now}.zip");
        self.create_archive(&id).await?;
        Ok(id)
    }

    async fn create_archive(&self, id: &str) -> ToriiResult<()> {
        check_archive_id(id)?;
        let mut entries = Vec::new();
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            entries.extend(handler.backup().await?);
        }

        let path = self.backups_dir.join(id);
        let backups_dir = self.backups_dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&backups_dir).map_err(|e| {
                ToriiError::other_src("create backups dir", e)
            })?;
            write_zip(&path, &entries)
        })
        .await
        .map_err(|e| ToriiError::other_src("archive task", e))??;

        tracing::info!(%id, "created backup archive");
        Ok(())
    }

    fn prune(&self, rule: &BackupRule) -> ToriiResult<()> {
        let mut archives: Vec<(std::path::PathBuf, Timestamp)> = self
            .list()?
            .into_iter()
            .filter(|info| info.id.starts_with(rule.prefix()))
            .map(|info| {
                (
                    self.backups_dir.join(&info.id),
                    Timestamp::from_micros(info.created),
                )
            })
            .collect();
        if archives.len() <= rule.max_kept {
            return Ok(());
        }

        archives.sort_by_key(|(_, created)| *created);
        let excess = archives.len() - rule.max_kept;
        for (path, _) in archives.into_iter().take(excess) {
            tracing::info!(?path, rule = %rule.name,
                "pruning old backup archive");
            std::fs::remove_file(&path).map_err(|e| {
                ToriiError::other_src("remove old archive", e)
            })?;
        }
        Ok(())
    }

    /// List every archive in the backup directory.
    pub fn list(&self) -> ToriiResult<Vec<ArchiveInfo>> {
        let dir = match std::fs::read_dir(&self.backups_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(e) => {
                return Err(ToriiError::other_src("read backups dir", e))
            }
        };

        let mut out = Vec::new();
        for entry in dir {
            let entry = entry
                .map_err(|e| ToriiError::other_src("read dir entry", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".zip") {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| ToriiError::other_src("stat archive", e))?;
            let created: Timestamp = meta
                .modified()
                .map(Timestamp::from)
                .unwrap_or(Timestamp::from_micros(0));
            out.push(ArchiveInfo {
                id: name,
                size: meta.len(),
                created: created.as_micros(),
            });
        }
        out.sort_by_key(|info| info.created);
        Ok(out)
    }

    /// Delete one archive by id.
    pub fn delete(&self, id: &str) -> ToriiResult<()> {
        check_archive_id(id)?;
        std::fs::remove_file(self.backups_dir.join(id))
            .map_err(|e| ToriiError::other_src("delete archive", e))
    }

    /// Recover a backup: stream each archive entry to its registered
    /// handler. Handlers either fully apply or leave the system
    /// unchanged; entries no handler claims are logged and skipped.
    pub async fn recover(&self, id: &str) -> ToriiResult<()> {
        check_archive_id(id)?;
        let path = self.backups_dir.join(id);
        let entries =
            tokio::task::spawn_blocking(move || read_zip(&path))
                .await
                .map_err(|e| ToriiError::other_src("archive task", e))??;

        let handlers = self.handlers.lock().unwrap().clone();
        for entry in entries {
            let mut consumed = false;
            for handler in &handlers {
                if handler.load(entry.clone()).await? {
                    consumed = true;
                    break;
                }
            }
            if !consumed {
                tracing::warn!(entry = %entry.name,
                    "no handler claimed archive entry");
            }
        }
        tracing::info!(%id, "recovered backup archive");
        Ok(())
    }

    /// Start an asynchronous consolidation of an archive for download:
    /// the archive's entries plus any handler contribution it lacks are
    /// re-zipped into a one-shot file under `downloads/`.
    pub fn consolidate(self: Arc<Self>, id: &str) -> ToriiResult<()> {
        check_archive_id(id)?;
        {
            let mut jobs = self.consolidations.lock().unwrap();
            if matches!(jobs.get(id), Some(ConsolidationState::InProgress))
            {
                return Ok(());
            }
            jobs.insert(id.to_string(), ConsolidationState::InProgress);
        }

        let engine = self.clone();
        let id = id.to_string();
        tokio::task::spawn(async move {
            let state = match engine.consolidate_inner(&id).await {
                Ok(path) => {
                    ConsolidationState::CompleteWithSuccess { path }
                }
                Err(err) => {
                    tracing::warn!(?err, %id, "consolidation failed");
                    ConsolidationState::CompleteWithError {
                        error: err.to_string(),
                    }
                }
            };
            engine
                .consolidations
                .lock()
                .unwrap()
                .insert(id, state);
        });
        Ok(())
    }

    /// The progress of a consolidation job.
    pub fn consolidation_state(
        &self,
        id: &str,
    ) -> Option<ConsolidationState> {
        self.consolidations.lock().unwrap().get(id).cloned()
    }

    async fn consolidate_inner(
        &self,
        id: &str,
    ) -> ToriiResult<std::path::PathBuf> {
        let path = self.backups_dir.join(id);
        let mut entries =
            tokio::task::spawn_blocking(move || read_zip(&path))
                .await
                .map_err(|e| ToriiError::other_src("archive task", e))??;

        // graft in anything the archive predates, e.g. asset blobs a
        // handler only started contributing later
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            for entry in handler.backup().await? {
                if !entries.iter().any(|e| e.name == entry.name) {
                    entries.push(entry);
                }
            }
        }

        let out = self.backups_dir.join("downloads").join(id);
        let write_path = out.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = write_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ToriiError::other_src("create downloads dir", e)
                })?;
            }
            write_zip(&write_path, &entries)
        })
        .await
        .map_err(|e| ToriiError::other_src("archive task", e))??;
        Ok(out)
    }

    fn newest_archive_time(&self, rule: &BackupRule) -> Option<Timestamp> {
        self.list()
            .ok()?
            .into_iter()
            .filter(|info| info.id.starts_with(rule.prefix()))
            .map(|info| Timestamp::from_micros(info.created))
            .max()
    }

    /// Seed this engine's default settings.
    pub fn default_config(settings: &SettingsStore) -> ToriiResult<()> {
        settings.seed_default(
            keys::CHECK_INTERVAL_SECS,
            serde_json::json!(DEFAULT_CHECK_INTERVAL_SECS),
        )?;
        settings.seed_default(
            keys::RULES,
            serde_json::json!([{
                "name": "hourly",
                "interval_secs": 3600,
                "max_kept": 24,
                "format": "hourly-{timestamp}.zip",
            }]),
        )
    }
}

/// Archive ids are bare filenames; anything path-like is refused.
fn check_archive_id(id: &str) -> ToriiResult<()> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
    {
        return Err(ToriiError::other(format!("invalid archive id {id:?}")));
    }
    Ok(())
}

fn write_zip(
    path: &std::path::Path,
    entries: &[ArchiveEntry],
) -> ToriiResult<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| ToriiError::other_src("create archive", e))?;
    let mut zip = zip::ZipWriter::new(file);
    let options: zip::write::SimpleFileOptions = Default::default();
    for entry in entries {
        zip.start_file(entry.name.as_str(), options)
            .and_then(|_| {
                zip.write_all(&entry.data).map_err(zip::result::ZipError::Io)
            })
            .map_err(|e| ToriiError::other_src("write archive entry", e))?;
    }
    zip.finish()
        .map_err(|e| ToriiError::other_src("finish archive", e))?;
    Ok(())
}

fn read_zip(path: &std::path::Path) -> ToriiResult<Vec<ArchiveEntry>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ToriiError::other_src("open archive", e))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ToriiError::other_src("parse archive", e))?;
    let mut out = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ToriiError::other_src("read archive entry", e))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| ToriiError::other_src("read archive entry", e))?;
        out.push(ArchiveEntry {
            name: entry.name().to_string(),
            data: data.into(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test;
