//! libSQL storage layer (embedded, offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database for content units, jobs,
//! watched sources, the narrative graph, learner sessions and mastery.
//! Query methods are grouped by entity in submodules, each adding an
//! `impl Storage` block.
//!
//! **Access rules:**
//! - Workers and watchers: read-write via [`Storage::open`]
//! - Reporting tools: read-only via [`Storage::open_readonly`]
//!
//! Every test opens its own database file, so no state is shared between
//! runs. Dropping the handle releases the connection.

mod graph;
mod jobs;
mod migrations;
mod nuggets;
mod sessions;
mod sources;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Value, params};
use lorepath_shared::{LorepathError, Result};

pub use jobs::JobFilter;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LorepathError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LorepathError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LorepathError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared by the query modules
// ---------------------------------------------------------------------------

pub(crate) fn storage_err(e: libsql::Error) -> LorepathError {
    LorepathError::Storage(e.to_string())
}

pub(crate) fn json_err(e: serde_json::Error) -> LorepathError {
    LorepathError::Storage(format!("invalid JSON column: {e}"))
}

/// RFC 3339 form used for every timestamp column.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LorepathError::Storage(format!("invalid date: {e}")))
}

pub(crate) fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

pub(crate) fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        _ => None,
    }
}

pub(crate) fn int(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(storage_err)
}

pub(crate) fn real(row: &libsql::Row, idx: i32) -> Result<f64> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Real(v) => Ok(v),
        Value::Integer(v) => Ok(v as f64),
        other => Err(LorepathError::Storage(format!(
            "expected REAL in column {idx}, found {other:?}"
        ))),
    }
}

pub(crate) fn timestamp(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&text(row, idx)?)
}

pub(crate) fn opt_timestamp(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    opt_text(row, idx).map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn opt_blob(row: &libsql::Row, idx: i32) -> Option<Vec<u8>> {
    match row.get_value(idx) {
        Ok(Value::Blob(b)) => Some(b),
        _ => None,
    }
}

/// Convert an f32 vector to little-endian bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert a BLOB back into an f32 vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use lorepath_shared::Nugget;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lp_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("lp_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        let nugget = Nugget::new("org", "Intro", "/incoming/a.md", "text", None);
        rw.insert_nugget_if_absent(&nugget).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let found = ro.get_nugget(&nugget.id).await.unwrap();
        assert!(found.is_some());

        let other = Nugget::new("org", "Other", "/incoming/b.md", "text", None);
        let result = ro.insert_nugget_if_absent(&other).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[test]
    fn blob_roundtrip_preserves_values() {
        let v = vec![0.25_f32, -1.5, 3.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
        assert_eq!(vec_to_blob(&v).len(), 12);
    }
}
