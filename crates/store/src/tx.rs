//! Transaction handle: revision inserts, housekeeping statements, and the
//! metadata writer with its cascading-delete walk.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use metrics::histogram;
use rusqlite::types::Value as SqlValue;
use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::trace;

use kinex_core::{
    deletion_timestamp, finalizers_of, owners_of, DecodedObject, CACHE_SKIP_LABEL,
    FINALIZER_DELETE_DEPENDENTS, FINALIZER_ORPHAN_DEPENDENTS,
};

use crate::{stripped, Dialect, StoreError};

/// A dependent row joined through the owner index.
struct OwnedRow {
    id: i64,
    key: String,
    #[allow(dead_code)]
    uid: String,
    create_revision: i64,
    value: Vec<u8>,
    block_owner_deletion: bool,
}

/// The current revision of an object looked up by its uid.
struct UidRow {
    id: i64,
    key: String,
    deleted: bool,
    create_revision: i64,
    value: Vec<u8>,
}

/// One enqueued metadata statement, drained at the end of the write.
type MetaStmt = (&'static str, Vec<SqlValue>);

pub struct Tx<'a> {
    tx: rusqlite::Transaction<'a>,
    d: &'a Dialect,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(tx: rusqlite::Transaction<'a>, d: &'a Dialect) -> Tx<'a> {
        Tx { tx, d }
    }

    pub fn commit(self) -> Result<(), StoreError> {
        trace!("tx commit");
        Ok(self.tx.commit()?)
    }

    pub fn rollback(self) -> Result<(), StoreError> {
        trace!("tx rollback");
        Ok(self.tx.rollback()?)
    }

    pub fn current_revision(&self) -> Result<i64, StoreError> {
        self.query_max(self.d.current_rev_sql)
    }

    pub fn compact_revision(&self) -> Result<i64, StoreError> {
        self.query_max(self.d.compact_rev_sql)
    }

    pub fn set_compact_revision(&self, revision: i64) -> Result<(), StoreError> {
        trace!(revision, "tx set compact revision");
        self.execute(self.d.update_compact_sql, &[SqlValue::Integer(revision)])?;
        Ok(())
    }

    pub fn compact(&self, revision: i64) -> Result<usize, StoreError> {
        trace!(revision, "tx compact");
        self.execute(
            self.d.compact_sql,
            &[SqlValue::Integer(revision), SqlValue::Integer(revision)],
        )
    }

    pub fn delete_revision(&self, revision: i64) -> Result<(), StoreError> {
        trace!(revision, "tx delete revision");
        self.execute(self.d.delete_sql, &[SqlValue::Integer(revision)])?;
        Ok(())
    }

    /// Insert a revision row and return its id, by last-insert-id or
    /// `RETURNING` depending on the dialect.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_revision(
        &self,
        key: &str,
        create: bool,
        delete: bool,
        create_revision: i64,
        prev_revision: i64,
        lease: i64,
        value: Option<&[u8]>,
        prev_value: &[u8],
    ) -> Result<i64, StoreError> {
        let params = revision_params(
            key,
            create,
            delete,
            create_revision,
            prev_revision,
            lease,
            value,
            prev_value,
        );
        if self.d.last_insert_id {
            self.execute(self.d.insert_last_insert_id_sql, &params)?;
            Ok(self.tx.last_insert_rowid())
        } else {
            self.query_row_id(self.d.insert_sql, &params)
        }
    }

    /// Write the metadata index rows for revision `id` of `key` and drive
    /// any cascade the object's finalizers and owner references call for.
    ///
    /// `value` carries the object bytes backing `obj`; for delete revisions
    /// that is the value being tombstoned. All index statements accumulate
    /// and drain at the end, so a failure anywhere aborts the whole write.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_metadata(
        &self,
        id: i64,
        key: &str,
        create_revision: i64,
        value: &[u8],
        prev_value: &[u8],
        obj: &DecodedObject,
        deleted: bool,
    ) -> Result<(), StoreError> {
        let mut meta_sqls: Vec<MetaStmt> = Vec::new();

        let finalizers = obj.finalizers();
        let uid = obj.uid().to_string();
        let foreground = finalizers.len() == 1 && finalizers[0] == FINALIZER_DELETE_DEPENDENTS;
        let cache_skip = obj.labels.contains_key(CACHE_SKIP_LABEL);
        let mut gc_owner_uids: BTreeSet<String> = BTreeSet::new();
        let mut delete = deleted;

        if !delete {
            // Decoded lazily, at most once; only needed to spot owner
            // references whose blockOwnerDeletion dropped since the prior
            // revision.
            let mut prev_obj: Option<Value> = None;
            let mut prev_tried = false;

            for owner in &obj.owners {
                if cache_skip && !owner.blocks_owner_deletion() {
                    if !prev_tried {
                        prev_tried = true;
                        if !prev_value.is_empty() {
                            prev_obj = Some(
                                serde_json::from_slice(prev_value)
                                    .map_err(|_| StoreError::PrevValueDecode)?,
                            );
                        }
                    }
                    if let Some(prev) = &prev_obj {
                        let was_blocking = owners_of(prev)
                            .iter()
                            .any(|r| r.uid == owner.uid && r.blocks_owner_deletion());
                        if was_blocking {
                            // This dependent no longer blocks the owner; a
                            // pending foreground delete may now proceed.
                            gc_owner_uids.insert(owner.uid.clone());
                        }
                    }
                }
                meta_sqls.push((
                    self.d.insert_owner_sql,
                    vec![
                        SqlValue::Integer(id),
                        SqlValue::Text(owner.uid.clone()),
                        match owner.block_owner_deletion {
                            Some(b) => SqlValue::Integer(b as i64),
                            None => SqlValue::Null,
                        },
                    ],
                ));
            }

            for (k, v) in &obj.labels {
                meta_sqls.push((
                    self.d.insert_label_sql,
                    vec![
                        SqlValue::Integer(id),
                        SqlValue::Text(key.to_string()),
                        SqlValue::Text(k.clone()),
                        SqlValue::Text(v.clone()),
                    ],
                ));
            }

            if !obj.fields.is_empty() {
                let translated: BTreeMap<String, &str> = obj
                    .fields
                    .iter()
                    .map(|(k, v)| (k.replace('.', "_"), v.as_str()))
                    .collect();
                let json = serde_json::to_string(&translated).map_err(StoreError::Encode)?;
                meta_sqls.push((
                    self.d.insert_fields_sql,
                    vec![
                        SqlValue::Integer(id),
                        SqlValue::Text(key.to_string()),
                        SqlValue::Text(json),
                    ],
                ));
            }

            if foreground {
                delete = true;
            }
        }

        if cache_skip && delete {
            let orphan = finalizers.len() == 1 && finalizers[0] == FINALIZER_ORPHAN_DEPENDENTS;

            let mut blocked = false;
            for dep in self.get_owned(&uid)? {
                if dep.id == 0 {
                    continue;
                }
                let mut dep_obj: Value =
                    serde_json::from_slice(&dep.value).map_err(StoreError::DependentDecode)?;

                if orphan {
                    if let Some(refs) = dep_obj
                        .pointer_mut("/metadata/ownerReferences")
                        .and_then(|v| v.as_array_mut())
                    {
                        refs.retain(|r| {
                            r.get("uid").and_then(|u| u.as_str()) != Some(uid.as_str())
                        });
                    }
                    let new_value =
                        serde_json::to_vec(&dep_obj).map_err(StoreError::Encode)?;
                    self.reinsert_dependent(
                        &mut meta_sqls,
                        &dep.key,
                        dep.create_revision,
                        dep.id,
                        &new_value,
                        &dep.value,
                    )?;
                } else if finalizers_of(&dep_obj).is_empty() {
                    self.insert_revision(
                        &dep.key,
                        false,
                        true,
                        dep.create_revision,
                        dep.id,
                        0,
                        None,
                        &dep.value,
                    )?;
                } else if deletion_timestamp(&dep_obj).is_some() {
                    if foreground && dep.block_owner_deletion {
                        blocked = true;
                    }
                } else {
                    if foreground && dep.block_owner_deletion {
                        blocked = true;
                    }
                    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                    if let Some(meta) =
                        dep_obj.pointer_mut("/metadata").and_then(|v| v.as_object_mut())
                    {
                        meta.insert("deletionTimestamp".to_string(), Value::String(now));
                    }
                    let new_value =
                        serde_json::to_vec(&dep_obj).map_err(StoreError::Encode)?;
                    self.reinsert_dependent(
                        &mut meta_sqls,
                        &dep.key,
                        dep.create_revision,
                        dep.id,
                        &new_value,
                        &dep.value,
                    )?;
                }
            }

            if foreground && !blocked {
                self.insert_revision(key, false, true, create_revision, id, 0, None, value)?;
            }
            if !foreground || !blocked {
                for owner in &obj.owners {
                    gc_owner_uids.insert(owner.uid.clone());
                }
            }
        }

        for owner_uid in &gc_owner_uids {
            self.sweep_owner(owner_uid)?;
        }

        for (sql, params) in &meta_sqls {
            self.execute(sql, params)?;
        }
        Ok(())
    }

    /// Decode `value` and write its metadata rows in one step.
    pub fn insert_metadata_raw(
        &self,
        id: i64,
        key: &str,
        create_revision: i64,
        value: &[u8],
        prev_value: &[u8],
        deleted: bool,
    ) -> Result<(), StoreError> {
        let obj = kinex_core::decode_object(key, value)?;
        self.insert_metadata(id, key, create_revision, value, prev_value, &obj, deleted)
    }

    // Delete an owner whose foreground deletion was pending and whose last
    // blocking dependent is gone. Only direct dependents are examined; the
    // revision pump re-enters this writer when those are rewritten.
    fn sweep_owner(&self, owner_uid: &str) -> Result<(), StoreError> {
        for owner in self.get_by_uid(owner_uid)? {
            if owner.deleted {
                continue;
            }
            let owner_obj: Value =
                serde_json::from_slice(&owner.value).map_err(StoreError::DependentDecode)?;
            let finalizers = finalizers_of(&owner_obj);
            if finalizers.len() != 1 || finalizers[0] != FINALIZER_DELETE_DEPENDENTS {
                continue;
            }

            let mut unblocked = true;
            for dep in self.get_owned(owner_uid)? {
                if dep.id == 0 {
                    continue;
                }
                let dep_obj: Value =
                    serde_json::from_slice(&dep.value).map_err(StoreError::DependentDecode)?;
                for r in owners_of(&dep_obj) {
                    if r.uid == owner_uid && r.blocks_owner_deletion() {
                        unblocked = false;
                    }
                }
            }

            if unblocked {
                self.insert_revision(
                    &owner.key,
                    false,
                    true,
                    owner.create_revision,
                    owner.id,
                    0,
                    None,
                    &owner.value,
                )?;
            }
        }
        Ok(())
    }

    // Dependent rewrites defer behind the index statements under
    // last-insert-id; with RETURNING they run synchronously and the error
    // surfaces immediately.
    fn reinsert_dependent(
        &self,
        meta_sqls: &mut Vec<MetaStmt>,
        key: &str,
        create_revision: i64,
        prev_revision: i64,
        value: &[u8],
        prev_value: &[u8],
    ) -> Result<(), StoreError> {
        let params = revision_params(
            key,
            false,
            false,
            create_revision,
            prev_revision,
            0,
            Some(value),
            prev_value,
        );
        if self.d.last_insert_id {
            meta_sqls.push((self.d.insert_last_insert_id_sql, params));
            Ok(())
        } else {
            self.query_row_id(self.d.insert_sql, &params)?;
            Ok(())
        }
    }

    fn get_owned(&self, owner_uid: &str) -> Result<Vec<OwnedRow>, StoreError> {
        trace!(owner_uid, sql = %stripped(self.d.get_owned_sql), "tx query owned");
        let started = Instant::now();
        let res = (|| {
            let mut stmt = self.tx.prepare_cached(self.d.get_owned_sql)?;
            let rows = stmt.query_map([owner_uid], |row| {
                Ok(OwnedRow {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    uid: row.get(2)?,
                    create_revision: row.get(3)?,
                    value: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                    block_owner_deletion: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })();
        self.observe(started, code_of(&res, self.d));
        Ok(res?)
    }

    fn get_by_uid(&self, uid: &str) -> Result<Vec<UidRow>, StoreError> {
        trace!(uid, sql = %stripped(self.d.get_uid_sql), "tx query uid");
        let started = Instant::now();
        let res = (|| {
            let mut stmt = self.tx.prepare_cached(self.d.get_uid_sql)?;
            let rows = stmt.query_map([uid], |row| {
                Ok(UidRow {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    deleted: row.get(2)?,
                    create_revision: row.get(3)?,
                    value: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })();
        self.observe(started, code_of(&res, self.d));
        Ok(res?)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError> {
        trace!(sql = %stripped(sql), params = params.len(), "tx exec");
        let started = Instant::now();
        let res = self.tx.execute(sql, rusqlite::params_from_iter(params));
        self.observe(started, code_of(&res, self.d));
        Ok(res?)
    }

    fn query_row_id(&self, sql: &str, params: &[SqlValue]) -> Result<i64, StoreError> {
        trace!(sql = %stripped(sql), params = params.len(), "tx query row");
        let started = Instant::now();
        let res = self
            .tx
            .query_row(sql, rusqlite::params_from_iter(params), |row| row.get(0));
        self.observe(started, code_of(&res, self.d));
        Ok(res?)
    }

    fn query_max(&self, sql: &str) -> Result<i64, StoreError> {
        trace!(sql = %stripped(sql), "tx query row");
        let started = Instant::now();
        let res = self
            .tx
            .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional();
        self.observe(started, code_of(&res, self.d));
        Ok(res?.flatten().unwrap_or(0))
    }

    fn observe(&self, started: Instant, code: String) {
        histogram!("kinex_sql_seconds", started.elapsed().as_secs_f64(), "code" => code);
    }
}

fn code_of<T>(res: &Result<T, rusqlite::Error>, d: &Dialect) -> String {
    match res {
        Ok(_) => "0".to_string(),
        Err(err) => (d.err_code)(err),
    }
}

#[allow(clippy::too_many_arguments)]
fn revision_params(
    key: &str,
    create: bool,
    delete: bool,
    create_revision: i64,
    prev_revision: i64,
    lease: i64,
    value: Option<&[u8]>,
    prev_value: &[u8],
) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(key.to_string()),
        SqlValue::Integer(create as i64),
        SqlValue::Integer(delete as i64),
        SqlValue::Integer(create_revision),
        SqlValue::Integer(prev_revision),
        SqlValue::Integer(lease),
        match value {
            Some(v) => SqlValue::Blob(v.to_vec()),
            None => SqlValue::Null,
        },
        SqlValue::Blob(prev_value.to_vec()),
    ]
}
