#![forbid(unsafe_code)]

//! Cascading-delete semantics exercised against real SQLite transactions.

use kinex_store::{Dialect, Driver, Tx};
use rusqlite::Connection;
use serde_json::{json, Value};

const CACHE_SKIP: &str = "skip-controller-manager-metadata-caching";

struct Owner<'a> {
    uid: &'a str,
    block: Option<bool>,
}

fn obj_value(
    name: &str,
    uid: &str,
    labels: &[(&str, &str)],
    owners: &[Owner<'_>],
    finalizers: &[&str],
) -> Vec<u8> {
    let mut metadata = json!({"name": name, "namespace": "default", "uid": uid});
    if !labels.is_empty() {
        metadata["labels"] = labels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    }
    if !finalizers.is_empty() {
        metadata["finalizers"] = json!(finalizers);
    }
    if !owners.is_empty() {
        metadata["ownerReferences"] = Value::Array(
            owners
                .iter()
                .map(|o| {
                    let mut r = json!({
                        "apiVersion": "v1", "kind": "Pod", "name": "owner", "uid": o.uid
                    });
                    if let Some(b) = o.block {
                        r["blockOwnerDeletion"] = json!(b);
                    }
                    r
                })
                .collect(),
        );
    }
    serde_json::to_vec(&json!({"apiVersion": "v1", "kind": "Pod", "metadata": metadata})).unwrap()
}

fn create(tx: &Tx<'_>, key: &str, value: &[u8]) -> i64 {
    let id = tx.insert_revision(key, true, false, 0, 0, 0, Some(value), b"").unwrap();
    tx.insert_metadata_raw(id, key, 0, value, b"", false).unwrap();
    id
}

fn update(tx: &Tx<'_>, key: &str, value: &[u8], prev_id: i64, prev_value: &[u8]) -> i64 {
    let id = tx
        .insert_revision(key, false, false, 0, prev_id, 0, Some(value), prev_value)
        .unwrap();
    tx.insert_metadata_raw(id, key, 0, value, prev_value, false).unwrap();
    id
}

fn delete(tx: &Tx<'_>, key: &str, value: &[u8], prev_id: i64) {
    let id = tx.insert_revision(key, false, true, 0, prev_id, 0, None, value).unwrap();
    let obj = kinex_core::decode_object(key, value).unwrap();
    tx.insert_metadata(id, key, 0, value, value, &obj, true).unwrap();
}

fn deleted_count(conn: &Connection, key: &str) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM kine WHERE name = ? AND deleted = 1", [key], |r| {
        r.get(0)
    })
    .unwrap()
}

fn latest_live(conn: &Connection, key: &str) -> (i64, Vec<u8>) {
    conn.query_row(
        "SELECT id, value FROM kine WHERE name = ? AND deleted = 0 ORDER BY id DESC LIMIT 1",
        [key],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .unwrap()
}

fn index_rows(conn: &Connection, table: &str, id: i64) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table} WHERE kine_id = ?"), [id], |r| {
        r.get(0)
    })
    .unwrap()
}

#[test]
fn label_index_matches_object_labels() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();
    let value = serde_json::to_vec(&json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "web", "namespace": "default", "uid": "u-web",
            "labels": {"app": "web", "tier": "frontend"},
            "ownerReferences": [{"uid": "u-rs", "blockOwnerDeletion": true}]
        },
        "spec": {"nodeName": "node1"}
    }))
    .unwrap();
    let key = "/registry/pods/default/web";
    let id = create(&tx, key, &value);
    tx.commit().unwrap();

    let conn = driver.conn();
    let mut stmt = conn
        .prepare("SELECT name, value FROM kine_labels WHERE kine_id = ? ORDER BY name")
        .unwrap();
    let labels: Vec<(String, String)> = stmt
        .query_map([id], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        labels,
        vec![("app".into(), "web".into()), ("tier".into(), "frontend".into())]
    );

    // Field names are underscore-translated inside a single JSON row.
    let fields_json: String = conn
        .query_row("SELECT json FROM kine_fields WHERE kine_id = ?", [id], |r| r.get(0))
        .unwrap();
    let fields: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&fields_json).unwrap();
    assert_eq!(fields["spec_nodeName"], "node1");
    assert_eq!(fields["metadata_name"], "web");
    assert!(fields.keys().all(|k| !k.contains('.')));

    let (owner_uid, block): (String, bool) = conn
        .query_row(
            "SELECT owner_uid, block_owner_deletion FROM kine_owners WHERE kine_id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(owner_uid, "u-rs");
    assert!(block);
}

#[test]
fn foreground_cascade_deletes_finalizer_free_dependents() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();

    let o_key = "/registry/pods/default/owner";
    let o1 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &[]);
    let o_id = create(&tx, o_key, &o1);

    let d1_key = "/registry/pods/default/dep-1";
    let d2_key = "/registry/pods/default/dep-2";
    let d1 = obj_value("dep-1", "u-d1", &[], &[Owner { uid: "u-o", block: None }], &[]);
    let d2 = obj_value("dep-2", "u-d2", &[], &[Owner { uid: "u-o", block: None }], &[]);
    create(&tx, d1_key, &d1);
    create(&tx, d2_key, &d2);

    // Deletion starts: the owner is rewritten with the foreground
    // finalizer; the writer promotes this into the delete path.
    let o2 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &["foregroundDeletion"]);
    let o2_id = update(&tx, o_key, &o2, o_id, &o1);
    tx.commit().unwrap();

    let conn = driver.conn();
    assert_eq!(deleted_count(conn, d1_key), 1);
    assert_eq!(deleted_count(conn, d2_key), 1);
    assert_eq!(deleted_count(conn, o_key), 1);

    // Tombstones never get index rows.
    let mut stmt = conn.prepare("SELECT id FROM kine WHERE deleted = 1").unwrap();
    let tombstones: Vec<i64> =
        stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(tombstones.len(), 3);
    for id in tombstones {
        assert_eq!(index_rows(conn, "kine_labels", id), 0);
        assert_eq!(index_rows(conn, "kine_fields", id), 0);
        assert_eq!(index_rows(conn, "kine_owners", id), 0);
    }

    // The promoted write itself still indexed the owner's revision.
    assert!(index_rows(conn, "kine_labels", o2_id) > 0);
}

#[test]
fn blocking_dependent_defers_foreground_delete() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();

    let o_key = "/registry/pods/default/owner";
    let o1 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &[]);
    let o_id = create(&tx, o_key, &o1);

    let d_key = "/registry/pods/default/dep";
    let d1 = obj_value(
        "dep",
        "u-d",
        &[(CACHE_SKIP, "true")],
        &[Owner { uid: "u-o", block: Some(true) }],
        &["example.com/keep"],
    );
    create(&tx, d_key, &d1);

    let o2 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &["foregroundDeletion"]);
    update(&tx, o_key, &o2, o_id, &o1);
    tx.commit().unwrap();

    // Blocked: no owner tombstone in this transaction, but the dependent
    // was stamped for deletion.
    let conn = driver.conn();
    assert_eq!(deleted_count(conn, o_key), 0);
    let (_, d_latest) = latest_live(conn, d_key);
    let d_obj: Value = serde_json::from_slice(&d_latest).unwrap();
    assert!(d_obj.pointer("/metadata/deletionTimestamp").is_some());
}

#[test]
fn sweep_deletes_owner_after_last_blocking_dependent() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();

    let o_key = "/registry/pods/default/owner";
    let o1 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &[]);
    let o_id = create(&tx, o_key, &o1);

    let d_key = "/registry/pods/default/dep";
    let d1 = obj_value(
        "dep",
        "u-d",
        &[(CACHE_SKIP, "true")],
        &[Owner { uid: "u-o", block: Some(true) }],
        &["example.com/keep"],
    );
    create(&tx, d_key, &d1);

    let o2 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &["foregroundDeletion"]);
    update(&tx, o_key, &o2, o_id, &o1);
    tx.commit().unwrap();
    assert_eq!(deleted_count(driver.conn(), o_key), 0);

    // The dependent goes away; its deletion sweeps the waiting owner.
    let (d_id, d_latest) = latest_live(driver.conn(), d_key);
    let tx = driver.begin().unwrap();
    delete(&tx, d_key, &d_latest, d_id);
    tx.commit().unwrap();

    let conn = driver.conn();
    assert_eq!(deleted_count(conn, d_key), 1);
    assert_eq!(deleted_count(conn, o_key), 1);
}

#[test]
fn unblocking_rewrite_sweeps_pending_owner() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();

    let o_key = "/registry/pods/default/owner";
    let o1 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &[]);
    let o_id = create(&tx, o_key, &o1);

    let d_key = "/registry/pods/default/dep";
    let d1 = obj_value(
        "dep",
        "u-d",
        &[(CACHE_SKIP, "true")],
        &[Owner { uid: "u-o", block: Some(true) }],
        &["example.com/keep"],
    );
    create(&tx, d_key, &d1);

    let o2 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &["foregroundDeletion"]);
    update(&tx, o_key, &o2, o_id, &o1);
    tx.commit().unwrap();
    assert_eq!(deleted_count(driver.conn(), o_key), 0);

    // The dependent drops blockOwnerDeletion; the rewrite must notice the
    // transition against the previous value and sweep the owner.
    let (d_id, d_prev) = latest_live(driver.conn(), d_key);
    let mut d_obj: Value = serde_json::from_slice(&d_prev).unwrap();
    d_obj["metadata"]["ownerReferences"][0]["blockOwnerDeletion"] = json!(false);
    let d_next = serde_json::to_vec(&d_obj).unwrap();

    let tx = driver.begin().unwrap();
    update(&tx, d_key, &d_next, d_id, &d_prev);
    tx.commit().unwrap();

    assert_eq!(deleted_count(driver.conn(), o_key), 1);
}

#[test]
fn orphan_cascade_removes_back_references() {
    for dialect in [Dialect::sqlite(), Dialect::sqlite_returning()] {
        let conn = Connection::open_in_memory().unwrap();
        let mut driver = Driver::with_dialect(conn, dialect).unwrap();
        let tx = driver.begin().unwrap();

        let o_key = "/registry/pods/default/owner";
        let o1 = obj_value("owner", "u-o", &[(CACHE_SKIP, "true")], &[], &["orphan"]);
        let o_id = create(&tx, o_key, &o1);

        let d_key = "/registry/pods/default/dep";
        let d1 = obj_value(
            "dep",
            "u-d",
            &[],
            &[Owner { uid: "u-o", block: Some(true) }, Owner { uid: "u-other", block: None }],
            &[],
        );
        create(&tx, d_key, &d1);

        delete(&tx, o_key, &o1, o_id);
        tx.commit().unwrap();

        let conn = driver.conn();
        assert_eq!(deleted_count(conn, o_key), 1);
        // The dependent survives with the dead owner's reference dropped.
        assert_eq!(deleted_count(conn, d_key), 0);
        let (_, d_latest) = latest_live(conn, d_key);
        let d_obj: Value = serde_json::from_slice(&d_latest).unwrap();
        let refs = d_obj.pointer("/metadata/ownerReferences").unwrap().as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "u-other");
    }
}

#[test]
fn housekeeping_statements_execute() {
    let mut driver = Driver::open_in_memory().unwrap();
    let tx = driver.begin().unwrap();
    let key = "/registry/pods/default/web";
    let v1 = obj_value("web", "u-1", &[], &[], &[]);
    let v2 = obj_value("web", "u-1", &[("app", "web")], &[], &[]);
    let id1 = create(&tx, key, &v1);
    let id2 = update(&tx, key, &v2, id1, &v1);

    assert_eq!(tx.current_revision().unwrap(), id2);
    assert_eq!(tx.compact_revision().unwrap(), 0);
    // Compacting drops the superseded revision but keeps the current one.
    assert_eq!(tx.compact(id2).unwrap(), 1);
    tx.delete_revision(id2).unwrap();
    tx.commit().unwrap();

    let count: i64 = driver
        .conn()
        .query_row("SELECT COUNT(*) FROM kine WHERE name = ?", [key], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}
