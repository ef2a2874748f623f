use super::*;
use crate::entities::*;
use crate::handlers::*;
use serde_json::json;

struct Harness {
    _dir: tempfile::TempDir,
    settings: SettingsStore,
    entities: Arc<EntitiesFile>,
    engine: Arc<BackupEngine>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsStore::new_ephemeral();
    let entities =
        Arc::new(EntitiesFile::new(dir.path().join("entities")));
    let engine =
        BackupEngine::create(settings.clone(), dir.path().join("backups"));
    engine.add_handler(EntitiesBackupHandler::create(entities.clone()));
    engine
        .add_handler(ContentSettingsBackupHandler::create(settings.clone()));
    Harness {
        _dir: dir,
        settings,
        entities,
        engine,
    }
}

fn seed_scene(h: &Harness, body: &str) {
    let raw = gzip_scene(
        &SceneHeader {
            id: uuid::Uuid::new_v4(),
            version: 1,
        },
        body,
    )
    .unwrap();
    h.entities.persist(&raw).unwrap();
}

fn rules(h: &Harness, rules: serde_json::Value) {
    h.settings.set_override("backups.rules", rules);
}

#[tokio::test]
async fn due_rule_fires_and_produces_an_archive() {
    let h = harness();
    seed_scene(&h, r#"{"entities":[]}"#);
    rules(
        &h,
        json!([{
            "name": "hourly",
            "interval_secs": 3600,
            "max_kept": 3,
            "format": "hourly-{timestamp}.zip",
        }]),
    );

    h.engine.tick(Timestamp::now()).await;

    let archives = h.engine.list().unwrap();
    assert_eq!(1, archives.len());
    assert!(archives[0].id.starts_with("hourly-"));

    // not due again until the interval passes
    h.engine.tick(Timestamp::now()).await;
    assert_eq!(1, h.engine.list().unwrap().len());

    // but due once wall-clock crosses last_fired + interval
    h.engine
        .tick(Timestamp::now() + std::time::Duration::from_secs(3601))
        .await;
    assert_eq!(2, h.engine.list().unwrap().len());
}

#[tokio::test]
async fn pruning_keeps_only_max_kept_archives() {
    let h = harness();
    seed_scene(&h, r#"{"entities":[]}"#);
    rules(
        &h,
        json!([{
            "name": "minutely",
            "interval_secs": 60,
            "max_kept": 2,
            "format": "minutely-{timestamp}.zip",
        }]),
    );

    let mut now = Timestamp::now();
    for _ in 0..4 {
        h.engine.tick(now).await;
        now = now + std::time::Duration::from_secs(61);
        // distinct mtimes so pruning order is stable
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    let archives = h.engine.list().unwrap();
    assert_eq!(2, archives.len());
}

#[tokio::test]
async fn manual_backup_and_recovery_roundtrip() {
    let h = harness();
    seed_scene(&h, r#"{"entities":["original"]}"#);
    h.settings
        .recurse_and_overwrite(json!({
            "descriptors": { "world_name": "before" }
        }))
        .unwrap();

    let id = h.engine.create_manual("pre-upgrade").await.unwrap();
    assert!(id.starts_with("manual-pre-upgrade-"));

    // wreck the live state
    seed_scene(&h, r#"{"entities":["wrecked"]}"#);
    h.settings
        .recurse_and_overwrite(json!({
            "descriptors": { "world_name": "after" }
        }))
        .unwrap();

    h.engine.recover(&id).await.unwrap();

    let (_, body) = h.entities.read().unwrap().unwrap();
    assert_eq!(r#"{"entities":["original"]}"#, body);
    assert_eq!(
        Some(json!("before")),
        h.settings.get("descriptors.world_name"),
    );
}

#[tokio::test]
async fn recovery_does_not_restore_security_settings() {
    let h = harness();
    seed_scene(&h, r#"{"entities":[]}"#);
    h.settings
        .recurse_and_overwrite(json!({
            "security": { "http_password": "old-hash" }
        }))
        .unwrap();

    let id = h.engine.create_manual("x").await.unwrap();

    h.settings
        .recurse_and_overwrite(json!({
            "security": { "http_password": "new-hash" }
        }))
        .unwrap();
    h.engine.recover(&id).await.unwrap();

    // the content-settings snapshot never carried the security tree
    assert_eq!(
        Some(json!("new-hash")),
        h.settings.get("security.http_password"),
    );
}

#[tokio::test]
async fn delete_removes_an_archive() {
    let h = harness();
    seed_scene(&h, r#"{"entities":[]}"#);
    let id = h.engine.create_manual("doomed").await.unwrap();
    assert_eq!(1, h.engine.list().unwrap().len());

    h.engine.delete(&id).unwrap();
    assert!(h.engine.list().unwrap().is_empty());
}

#[tokio::test]
async fn path_like_archive_ids_are_refused() {
    let h = harness();
    assert!(h.engine.delete("../../etc/passwd").is_err());
    assert!(h.engine.recover("a/b.zip").await.is_err());
}

#[tokio::test]
async fn consolidation_reports_progress_states() {
    let h = harness();
    seed_scene(&h, r#"{"entities":[]}"#);
    let id = h.engine.create_manual("dl").await.unwrap();

    h.engine.clone().consolidate(&id).unwrap();
    for _ in 0..100 {
        match h.engine.consolidation_state(&id) {
            Some(ConsolidationState::CompleteWithSuccess { path }) => {
                assert!(path.exists());
                return;
            }
            Some(ConsolidationState::CompleteWithError { error }) => {
                panic!("consolidation failed: {error}");
            }
            _ => {
                tokio::time::sleep(std::time::Duration::from_millis(20))
                    .await;
            }
        }
    }
    panic!("consolidation never completed");
}

#[tokio::test]
async fn consolidating_a_missing_archive_reports_the_error() {
    let h = harness();
    h.engine.clone().consolidate("missing.zip").unwrap();
    for _ in 0..100 {
        if let Some(ConsolidationState::CompleteWithError { .. }) =
            h.engine.consolidation_state("missing.zip")
        {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("missing archive consolidation never errored");
}
