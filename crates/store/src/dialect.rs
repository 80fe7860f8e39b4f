//! Per-driver capability set: SQL templates, placeholder convention, and
//! insert strategy. The writer never hardcodes SQL; everything it executes
//! comes from here.

/// Injected SQL surface for one database flavor.
#[derive(Clone)]
pub struct Dialect {
    /// Fetch new revision ids via the driver's last-insert-id instead of
    /// `RETURNING id`.
    pub last_insert_id: bool,
    pub insert_sql: &'static str,
    pub insert_last_insert_id_sql: &'static str,
    pub insert_owner_sql: &'static str,
    pub insert_label_sql: &'static str,
    pub insert_fields_sql: &'static str,
    pub get_owned_sql: &'static str,
    pub get_uid_sql: &'static str,
    /// Tests one field/value pair against the JSON fields row. A `%s` slot
    /// takes the underscored field name; without one the name binds as an
    /// argument.
    pub field_lookup_sql: &'static str,
    pub current_rev_sql: &'static str,
    pub compact_rev_sql: &'static str,
    pub update_compact_sql: &'static str,
    pub compact_sql: &'static str,
    pub delete_sql: &'static str,
    pub err_code: fn(&rusqlite::Error) -> String,
    pub ddl: &'static [&'static str],
}

const SQLITE_INSERT_LAST_INSERT_ID: &str = "INSERT INTO kine(name, created, deleted, create_revision, prev_revision, lease, value, old_value) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

const SQLITE_INSERT: &str = "INSERT INTO kine(name, created, deleted, create_revision, prev_revision, lease, value, old_value) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id";

// Latest live revision per key that carries an owner reference to the
// given uid. The anti-join keeps only current rows; superseded or
// tombstoned dependents drop out.
const SQLITE_GET_OWNED: &str = "SELECT kv.id, kv.name, COALESCE(json_extract(kv.value, '$.metadata.uid'), ''), kv.create_revision, kv.value, ko.block_owner_deletion
	FROM kine_owners ko
	JOIN kine kv ON kv.id = ko.kine_id
	LEFT JOIN kine newer ON newer.name = kv.name AND newer.id > kv.id
	WHERE ko.owner_uid = ? AND newer.id IS NULL AND kv.deleted = 0";

// Latest revision of the object whose metadata.uid matches; the deleted
// flag is returned so callers can skip tombstones.
const SQLITE_GET_UID: &str = "SELECT kv.id, kv.name, kv.deleted, kv.create_revision, kv.value
	FROM kine kv
	LEFT JOIN kine newer ON newer.name = kv.name AND newer.id > kv.id
	WHERE newer.id IS NULL AND json_extract(COALESCE(kv.value, kv.old_value), '$.metadata.uid') = ?";

const SQLITE_COMPACT: &str = "DELETE FROM kine WHERE id IN (
	SELECT kp.prev_revision AS id FROM kine kp WHERE kp.name != 'compact_rev_key' AND kp.prev_revision != 0 AND kp.id <= ?
	UNION
	SELECT kd.id AS id FROM kine kd WHERE kd.deleted != 0 AND kd.id <= ?
)";

const SQLITE_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kine (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		name TEXT NOT NULL,
		created INTEGER,
		deleted INTEGER,
		create_revision INTEGER,
		prev_revision INTEGER,
		lease INTEGER,
		value BLOB,
		old_value BLOB
	)",
    "CREATE INDEX IF NOT EXISTS kine_name_index ON kine (name)",
    "CREATE INDEX IF NOT EXISTS kine_name_prev_revision_uindex ON kine (name, prev_revision)",
    "CREATE TABLE IF NOT EXISTS kine_labels (
		kine_id INTEGER NOT NULL,
		kine_name TEXT NOT NULL,
		name TEXT NOT NULL,
		value TEXT NOT NULL,
		UNIQUE (kine_id, name)
	)",
    "CREATE INDEX IF NOT EXISTS kine_labels_lookup_index ON kine_labels (kine_name, name, value)",
    "CREATE TABLE IF NOT EXISTS kine_fields (
		kine_id INTEGER NOT NULL,
		kine_name TEXT NOT NULL,
		json TEXT NOT NULL
	)",
    "CREATE INDEX IF NOT EXISTS kine_fields_name_index ON kine_fields (kine_name)",
    "CREATE TABLE IF NOT EXISTS kine_owners (
		kine_id INTEGER NOT NULL,
		owner_uid TEXT NOT NULL,
		block_owner_deletion INTEGER
	)",
    "CREATE INDEX IF NOT EXISTS kine_owners_uid_index ON kine_owners (owner_uid)",
];

fn sqlite_err_code(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code.to_string(),
        _ => "error".to_string(),
    }
}

impl Dialect {
    /// SQLite flavor: `?` placeholders, last-insert-id revision ids.
    pub fn sqlite() -> Dialect {
        Dialect {
            last_insert_id: true,
            insert_sql: SQLITE_INSERT,
            insert_last_insert_id_sql: SQLITE_INSERT_LAST_INSERT_ID,
            insert_owner_sql: "INSERT INTO kine_owners(kine_id, owner_uid, block_owner_deletion) VALUES (?, ?, ?)",
            insert_label_sql: "INSERT INTO kine_labels(kine_id, kine_name, name, value) VALUES (?, ?, ?, ?)",
            insert_fields_sql: "INSERT INTO kine_fields(kine_id, kine_name, json) VALUES (?, ?, ?)",
            get_owned_sql: SQLITE_GET_OWNED,
            get_uid_sql: SQLITE_GET_UID,
            field_lookup_sql: "json_extract(json, '$.' || ?) = ?",
            current_rev_sql: "SELECT MAX(rkv.id) AS id FROM kine rkv",
            compact_rev_sql: "SELECT MAX(crkv.prev_revision) AS prev_revision FROM kine crkv WHERE crkv.name = 'compact_rev_key'",
            update_compact_sql: "UPDATE kine SET prev_revision = ? WHERE name = 'compact_rev_key'",
            compact_sql: SQLITE_COMPACT,
            delete_sql: "DELETE FROM kine WHERE id = ?",
            err_code: sqlite_err_code,
            ddl: SQLITE_DDL,
        }
    }

    /// SQLite flavor using `RETURNING id` instead of last-insert-id; the
    /// writer then issues dependent reinserts synchronously.
    pub fn sqlite_returning() -> Dialect {
        Dialect { last_insert_id: false, ..Dialect::sqlite() }
    }
}
