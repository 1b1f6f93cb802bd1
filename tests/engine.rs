use serde_json::{json, Value};
use tempfile::tempdir;

use yardb::{Document, Engine, YarDbError};

fn doc(value: Value) -> Document {
    value.as_object().unwrap().clone()
}

fn ids(documents: &[Document]) -> Vec<i64> {
    documents
        .iter()
        .map(|d| d.get("_id").unwrap().as_i64().unwrap())
        .collect()
}

#[test]
fn create_and_read_roundtrip() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    let mut alice = doc(json!({"name": "alice", "age": 30}));
    let mut bob = doc(json!({"name": "bob", "age": 25}));
    assert_eq!(db.create(&mut alice).unwrap(), 1);
    assert_eq!(db.create(&mut bob).unwrap(), 2);

    let all = db.read(&Document::new()).unwrap();
    assert_eq!(ids(&all), vec![1, 2]);

    let bobs = db.read(&doc(json!({"name": "bob"}))).unwrap();
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0]["age"], json!(25));

    let missing = db.read(&doc(json!({"name": "carol"}))).unwrap();
    assert!(missing.is_empty());
}

#[test]
fn sequence_is_monotonic_and_ids_stay_unique() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    let mut explicit = doc(json!({"_id": 10, "name": "ten"}));
    db.create(&mut explicit).unwrap();

    let mut next = doc(json!({"name": "eleven"}));
    assert_eq!(db.create(&mut next).unwrap(), 11);

    let mut duplicate = doc(json!({"_id": 10, "name": "clash"}));
    assert!(matches!(
        db.create(&mut duplicate),
        Err(YarDbError::DocumentValidation(_))
    ));
}

#[test]
fn update_merges_and_chains_versions() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    let mut original = doc(json!({"name": "alice", "age": 30}));
    let id = db.create(&mut original).unwrap();

    let updated = db
        .update(&doc(json!({"_id": id})), &doc(json!({"age": 31})))
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["age"], json!(31));
    assert_eq!(updated[0]["name"], json!("alice"));

    let history = db.history(&doc(json!({"_id": id}))).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["age"], json!(31));
    assert_eq!(history[1]["age"], json!(30));
}

#[test]
fn history_walks_the_full_chain_newest_first() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    let mut v1 = doc(json!({"a": 1}));
    let id = db.create(&mut v1).unwrap();
    db.replace(&doc(json!({"_id": id})), &doc(json!({"a": 2}))).unwrap();
    db.replace(&doc(json!({"_id": id})), &doc(json!({"a": 3}))).unwrap();

    let history = db.history(&doc(json!({"_id": id}))).unwrap();
    let values: Vec<i64> = history.iter().map(|d| d["a"].as_i64().unwrap()).collect();
    assert_eq!(values, vec![3, 2, 1]);
    assert!(history.iter().all(|d| d["_id"] == json!(id)));
}

#[test]
fn destroy_erases_and_honors_top() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    for n in 0..3 {
        db.create(&mut doc(json!({"n": n}))).unwrap();
    }

    let destroyed = db.destroy(&doc(json!({"$top": 2}))).unwrap();
    assert_eq!(ids(&destroyed), vec![1, 2]);

    let remaining = db.read(&Document::new()).unwrap();
    assert_eq!(ids(&remaining), vec![3]);

    let gone = db.destroy(&doc(json!({"_id": 1}))).unwrap();
    assert!(gone.is_empty());
}

#[test]
fn read_honors_skip_top_and_desc() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    for n in 0..5 {
        db.create(&mut doc(json!({"n": n}))).unwrap();
    }

    let window = db.read(&doc(json!({"$skip": 1, "$top": 2}))).unwrap();
    assert_eq!(ids(&window), vec![2, 3]);

    let reversed = db.read(&doc(json!({"$desc": true, "$top": 2}))).unwrap();
    assert_eq!(ids(&reversed), vec![5, 4]);

    let range = db.read(&doc(json!({"_id": {"$gte": 2, "$lte": 4}}))).unwrap();
    assert_eq!(ids(&range), vec![2, 3, 4]);
}

#[test]
fn secondary_index_configuration_and_reindex() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("users");

    db.create(&mut doc(json!({"email": "a@x", "name": "alice"}))).unwrap();

    let keys = db.index(vec!["email".to_string()]).unwrap();
    assert_eq!(keys, vec!["email".to_string()]);
    // Adding the same key again leaves the configuration unchanged.
    let keys = db.index(vec!["email".to_string()]).unwrap();
    assert_eq!(keys, vec!["email".to_string()]);

    // Documents written after the configuration are indexed immediately.
    db.create(&mut doc(json!({"email": "b@x", "name": "bob"}))).unwrap();
    let found = db.read(&doc(json!({"email": "b@x"}))).unwrap();
    assert_eq!(found.len(), 1);

    // Pre-existing documents only appear after a reindex.
    db.reindex().unwrap();
    let found = db.read(&doc(json!({"email": "a@x"}))).unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn index_configuration_alone_does_not_create_a_collection() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("ghost");

    db.index(vec!["email".to_string()]).unwrap();
    assert!(db.collections().is_empty());

    db.create(&mut doc(json!({"email": "a@x"}))).unwrap();
    assert_eq!(db.collections(), vec!["ghost".to_string()]);
}

#[test]
fn replay_is_a_fixed_point() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("yar.db");

    let (all_before, history_before, by_email_before) = {
        let mut db = Engine::open(&path).unwrap();
        db.collection("users");
        db.index(vec!["email".to_string()]).unwrap();
        db.create(&mut doc(json!({"email": "a@x", "name": "alice"}))).unwrap();
        db.create(&mut doc(json!({"email": "b@x", "name": "bob"}))).unwrap();
        db.create(&mut doc(json!({"email": "c@x", "name": "carol"}))).unwrap();
        db.update(&doc(json!({"_id": 2})), &doc(json!({"name": "robert"}))).unwrap();
        db.destroy(&doc(json!({"_id": 3}))).unwrap();
        (
            db.read(&Document::new()).unwrap(),
            db.history(&doc(json!({"_id": 2}))).unwrap(),
            db.read(&doc(json!({"email": "b@x"}))).unwrap(),
        )
    };

    let mut db = Engine::open(&path).unwrap();
    db.collection("users");
    assert_eq!(db.read(&Document::new()).unwrap(), all_before);
    assert_eq!(db.history(&doc(json!({"_id": 2}))).unwrap(), history_before);
    assert_eq!(db.read(&doc(json!({"email": "b@x"}))).unwrap(), by_email_before);

    // The sequence survives too: the next id continues after the highest
    // ever assigned, even though document 3 was deleted.
    let mut next = doc(json!({"email": "d@x"}));
    assert_eq!(db.create(&mut next).unwrap(), 4);
}

#[test]
fn torn_tail_is_ignored_on_replay() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("yar.db");

    {
        let mut db = Engine::open(&path).unwrap();
        db.collection("items");
        db.create(&mut doc(json!({"n": 1}))).unwrap();
        db.create(&mut doc(json!({"n": 2}))).unwrap();
    }

    // Simulate a crash mid-append: garbage at the end of the file.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[b'C', 0xff, 0xff]).unwrap();
    drop(file);

    let mut db = Engine::open(&path).unwrap();
    db.collection("items");
    let all = db.read(&Document::new()).unwrap();
    assert_eq!(ids(&all), vec![1, 2]);
}

#[test]
fn pid_lock_excludes_other_openers() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("yar.db");

    let db = Engine::open(&path).unwrap();
    assert!(tmp.path().join("yar.db.pid").exists());

    assert!(matches!(
        Engine::open(&path),
        Err(YarDbError::AlreadyLocked { .. })
    ));

    drop(db);
    assert!(!tmp.path().join("yar.db.pid").exists());
    let _db = Engine::open(&path).unwrap();
}

#[test]
fn metadata_lookups_track_mutations() {
    let tmp = tempdir().unwrap();
    let mut db = Engine::open(tmp.path().join("yar.db")).unwrap();
    db.collection("items");

    let mut first = doc(json!({"n": 1}));
    let id = db.create(&mut first).unwrap();
    let selector = doc(json!({"_id": id}));

    let position = db.metadata_position(&selector).unwrap().unwrap();
    assert!(db.metadata_timestamp(&selector).unwrap().is_some());

    db.update(&selector, &doc(json!({"n": 2}))).unwrap();
    let moved = db.metadata_position(&selector).unwrap().unwrap();
    assert_ne!(position, moved);

    db.destroy(&selector).unwrap();
    assert!(db.metadata_position(&selector).unwrap().is_none());
}
