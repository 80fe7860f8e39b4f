//! Metadata index writer for the kinex backend.
//!
//! Owns all writes to the `kine_labels`, `kine_fields`, and `kine_owners`
//! index tables and drives cascading-delete semantics (foreground, orphan,
//! background) inside the caller's transaction. The revisioned `kine` table
//! itself is written only through [`Tx::insert_revision`].

#![forbid(unsafe_code)]

mod dialect;
mod tx;

use rusqlite::Connection;
use tracing::trace;

pub use dialect::Dialect;
pub use kinex_selector::SqlArg;
pub use tx::Tx;

/// Store-layer errors. Storage failures roll the caller's transaction back.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object decode failed: {0}")]
    Decode(#[from] kinex_core::DecodeError),
    #[error("dependent decode failed: {0}")]
    DependentDecode(#[source] serde_json::Error),
    #[error("previous value decode failed")]
    PrevValueDecode,
    #[error("metadata encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Connection plus dialect; hands out transactions.
pub struct Driver {
    conn: Connection,
    dialect: Dialect,
}

impl Driver {
    /// Open (or create) a database at `path` with the SQLite dialect.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::with_dialect(conn, Dialect::sqlite())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_dialect(Connection::open_in_memory()?, Dialect::sqlite())
    }

    /// Wrap an existing connection with an explicit dialect; runs the DDL.
    pub fn with_dialect(conn: Connection, dialect: Dialect) -> Result<Self, StoreError> {
        for ddl in dialect.ddl {
            conn.execute(ddl, [])?;
        }
        Ok(Self { conn, dialect })
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction. Dropping the returned handle rolls back.
    pub fn begin(&mut self) -> Result<Tx<'_>, StoreError> {
        trace!("tx begin");
        let Driver { conn, dialect } = self;
        Ok(Tx::new(conn.transaction()?, dialect))
    }
}

/// Bindable values for a fragment produced by the selector compiler.
pub fn selector_params(args: &[SqlArg]) -> Vec<rusqlite::types::Value> {
    args.iter()
        .map(|a| match a {
            SqlArg::Text(s) => rusqlite::types::Value::Text(s.clone()),
            SqlArg::Int(i) => rusqlite::types::Value::Integer(*i),
        })
        .collect()
}

// Collapse whitespace runs so multi-line SQL logs on one line.
pub(crate) fn stripped(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripped_collapses_whitespace() {
        assert_eq!(stripped(" SELECT a,\n\tb FROM  t "), "SELECT a, b FROM t");
    }

    #[test]
    fn selector_params_map_both_variants() {
        let params = selector_params(&[SqlArg::from("a"), SqlArg::Int(3)]);
        assert_eq!(params.len(), 2);
        assert!(matches!(&params[0], rusqlite::types::Value::Text(s) if s == "a"));
        assert!(matches!(params[1], rusqlite::types::Value::Integer(3)));
    }
}
