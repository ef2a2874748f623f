use super::*;

fn scene_bytes(version: u64, body: &str) -> Vec<u8> {
    gzip_scene(
        &SceneHeader {
            id: uuid::Uuid::new_v4(),
            version,
        },
        body,
    )
    .unwrap()
}

#[test]
fn persist_then_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());

    let raw = scene_bytes(7, r#"{"entities":[]}"#);
    let header = entities.persist(&raw).unwrap();
    assert_eq!(7, header.version);

    let (read_header, body) = entities.read().unwrap().unwrap();
    assert_eq!(header, read_header);
    assert_eq!(r#"{"entities":[]}"#, body);
}

#[test]
fn persist_rejects_garbage_and_keeps_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());

    let good = scene_bytes(1, r#"{"entities":[1]}"#);
    entities.persist(&good).unwrap();

    assert!(entities.persist(b"not a gzip stream").is_err());

    let (header, _) = entities.read().unwrap().unwrap();
    assert_eq!(1, header.version);
}

#[test]
fn swap_replaces_and_mints_fresh_identity() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());

    let original = scene_bytes(3, r#"{"entities":["old"]}"#);
    entities.persist(&original).unwrap();
    let (old_header, _) = entities.read().unwrap().unwrap();

    entities
        .stage_replacement(&scene_bytes(9, r#"{"entities":["new"]}"#))
        .unwrap();
    assert!(entities.replace_path().exists());

    assert!(entities.swap_in_replacement().unwrap());
    assert!(!entities.replace_path().exists());

    let (header, body) = entities.read().unwrap().unwrap();
    assert_eq!(r#"{"entities":["new"]}"#, body);
    assert_ne!(old_header.id, header.id);
    assert_eq!(10, header.version);
}

#[test]
fn swap_without_staged_file_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());
    assert!(!entities.swap_in_replacement().unwrap());
}

#[test]
fn invalid_staged_file_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());
    entities.persist(&scene_bytes(2, r#"{"keep":true}"#)).unwrap();

    std::fs::write(entities.replace_path(), b"garbage").unwrap();
    assert!(!entities.swap_in_replacement().unwrap());

    let (header, _) = entities.read().unwrap().unwrap();
    assert_eq!(2, header.version);
}

#[test]
fn staging_accepts_plain_json_and_mints_a_header() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());

    entities.stage_replacement(br#"{"entities":["plain"]}"#).unwrap();
    assert!(entities.swap_in_replacement().unwrap());

    let (header, body) = entities.read().unwrap().unwrap();
    assert_eq!(r#"{"entities":["plain"]}"#, body);
    assert_eq!(1, header.version);
}

#[test]
fn staging_rejects_invalid_json() {
    let dir = tempfile::tempdir().unwrap();
    let entities = EntitiesFile::new(dir.path());
    assert!(entities.stage_replacement(b"{ nope").is_err());
    assert!(!entities.replace_path().exists());
}

#[test]
fn a_swap_survives_dying_between_stage_and_swap() {
    let dir = tempfile::tempdir().unwrap();

    // "process one" stages and is killed before swapping
    {
        let entities = EntitiesFile::new(dir.path());
        entities.persist(&scene_bytes(5, r#"{"old":true}"#)).unwrap();
        entities
            .stage_replacement(&scene_bytes(0, r#"{"new":true}"#))
            .unwrap();
    }

    // "process two" starts up and finds the staged file
    let entities = EntitiesFile::new(dir.path());
    let (header, _) = entities.read().unwrap().unwrap();
    assert_eq!(5, header.version);

    assert!(entities.swap_in_replacement().unwrap());
    let (_, body) = entities.read().unwrap().unwrap();
    assert_eq!(r#"{"new":true}"#, body);
}
