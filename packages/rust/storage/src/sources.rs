//! Watched folder and monitored URL queries.

use chrono::{DateTime, Utc};
use libsql::params;
use lorepath_shared::{LorepathError, MonitoredUrl, Result, WatchedFolder};

use crate::{Storage, int, json_err, opt_text, opt_timestamp, storage_err, text, timestamp, ts};

const FOLDER_COLUMNS: &str =
    "id, organization_id, path, enabled, file_types_json, recursive, auto_process, \
     created_at, updated_at";

const URL_COLUMNS: &str = "id, organization_id, url, check_interval_secs, last_content_hash, \
     last_checked_at, enabled, created_at";

fn row_to_folder(row: &libsql::Row) -> Result<WatchedFolder> {
    Ok(WatchedFolder {
        id: text(row, 0)?,
        organization_id: text(row, 1)?,
        path: text(row, 2)?,
        enabled: int(row, 3)? != 0,
        file_types: serde_json::from_str(&text(row, 4)?).map_err(json_err)?,
        recursive: int(row, 5)? != 0,
        auto_process: int(row, 6)? != 0,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

fn row_to_url(row: &libsql::Row) -> Result<MonitoredUrl> {
    Ok(MonitoredUrl {
        id: text(row, 0)?,
        organization_id: text(row, 1)?,
        url: text(row, 2)?,
        check_interval_secs: int(row, 3)?.max(0) as u64,
        last_content_hash: opt_text(row, 4),
        last_checked_at: opt_timestamp(row, 5)?,
        enabled: int(row, 6)? != 0,
        created_at: timestamp(row, 7)?,
    })
}

impl Storage {
    // -----------------------------------------------------------------------
    // Watched folders
    // -----------------------------------------------------------------------

    /// Insert a folder, or update its settings if the id already exists.
    pub async fn upsert_folder(&self, folder: &WatchedFolder) -> Result<()> {
        self.check_writable()?;
        let file_types = serde_json::to_string(&folder.file_types).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO watched_folders (id, organization_id, path, enabled, \
                 file_types_json, recursive, auto_process, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(id) DO UPDATE SET organization_id = excluded.organization_id, \
                 path = excluded.path, enabled = excluded.enabled, \
                 file_types_json = excluded.file_types_json, recursive = excluded.recursive, \
                 auto_process = excluded.auto_process, updated_at = excluded.updated_at",
                params![
                    folder.id.as_str(),
                    folder.organization_id.as_str(),
                    folder.path.as_str(),
                    folder.enabled as i64,
                    file_types,
                    folder.recursive as i64,
                    folder.auto_process as i64,
                    ts(&folder.created_at),
                    ts(&folder.updated_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_folder(&self, id: &str) -> Result<Option<WatchedFolder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM watched_folders WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_folder(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_folders(&self) -> Result<Vec<WatchedFolder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM watched_folders ORDER BY created_at, id");
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;
        let mut folders = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            folders.push(row_to_folder(&row)?);
        }
        Ok(folders)
    }

    pub async fn set_folder_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE watched_folders SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("watched folder", id));
        }
        Ok(())
    }

    pub async fn delete_folder(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM watched_folders WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Monitored URLs
    // -----------------------------------------------------------------------

    /// Insert a URL, or update its settings if the id already exists.
    ///
    /// The recorded hash and check time are left untouched on update.
    pub async fn upsert_url(&self, url: &MonitoredUrl) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO monitored_urls (id, organization_id, url, check_interval_secs, \
                 last_content_hash, last_checked_at, enabled, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(id) DO UPDATE SET organization_id = excluded.organization_id, \
                 url = excluded.url, check_interval_secs = excluded.check_interval_secs, \
                 enabled = excluded.enabled",
                params![
                    url.id.as_str(),
                    url.organization_id.as_str(),
                    url.url.as_str(),
                    url.check_interval_secs as i64,
                    url.last_content_hash.clone(),
                    url.last_checked_at.as_ref().map(ts),
                    url.enabled as i64,
                    ts(&url.created_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_url(&self, id: &str) -> Result<Option<MonitoredUrl>> {
        let sql = format!("SELECT {URL_COLUMNS} FROM monitored_urls WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_url(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_urls(&self) -> Result<Vec<MonitoredUrl>> {
        let sql = format!("SELECT {URL_COLUMNS} FROM monitored_urls ORDER BY created_at, id");
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;
        let mut urls = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            urls.push(row_to_url(&row)?);
        }
        Ok(urls)
    }

    pub async fn set_url_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE monitored_urls SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("monitored URL", id));
        }
        Ok(())
    }

    pub async fn delete_url(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM monitored_urls WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record the outcome of a poll.
    ///
    /// `content_hash` is `Some` only when the check found changed content and
    /// an ingestion job has already been enqueued for it; otherwise only the
    /// check time moves.
    pub async fn record_url_check(
        &self,
        id: &str,
        content_hash: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let changed = match content_hash {
            Some(hash) => {
                self.conn
                    .execute(
                        "UPDATE monitored_urls SET last_content_hash = ?1, last_checked_at = ?2 \
                         WHERE id = ?3",
                        params![hash, ts(&checked_at), id],
                    )
                    .await
            }
            None => {
                self.conn
                    .execute(
                        "UPDATE monitored_urls SET last_checked_at = ?1 WHERE id = ?2",
                        params![ts(&checked_at), id],
                    )
                    .await
            }
        }
        .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("monitored URL", id));
        }
        Ok(())
    }
}
