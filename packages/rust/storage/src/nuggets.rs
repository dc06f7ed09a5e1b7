//! Content unit queries.

use chrono::Utc;
use libsql::params;
use lorepath_shared::{LorepathError, Nugget, NuggetMetadata, NuggetStatus, Result};

use crate::{
    Storage, blob_to_vec, int, json_err, opt_blob, opt_text, storage_err, text, timestamp, ts,
    vec_to_blob,
};

const NUGGET_COLUMNS: &str = "id, organization_id, title, source, content, content_hash, \
     metadata_json, status, image_url, audio_url, embedding, created_at, updated_at";

fn row_to_nugget(row: &libsql::Row) -> Result<Nugget> {
    let metadata = opt_text(row, 6)
        .map(|json| serde_json::from_str::<NuggetMetadata>(&json))
        .transpose()
        .map_err(json_err)?;
    Ok(Nugget {
        id: text(row, 0)?,
        organization_id: text(row, 1)?,
        title: text(row, 2)?,
        source: text(row, 3)?,
        content: text(row, 4)?,
        content_hash: text(row, 5)?,
        metadata,
        status: text(row, 7)?.parse()?,
        image_url: opt_text(row, 8),
        audio_url: opt_text(row, 9),
        embedding: opt_blob(row, 10).map(|b| blob_to_vec(&b)),
        created_at: timestamp(row, 11)?,
        updated_at: timestamp(row, 12)?,
    })
}

impl Storage {
    /// Insert `nugget` unless a unit with the same organization, source and
    /// content hash already exists.
    ///
    /// Returns the stored record and whether this call created it.
    pub async fn insert_nugget_if_absent(&self, nugget: &Nugget) -> Result<(Nugget, bool)> {
        self.check_writable()?;
        let metadata_json = nugget
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO nuggets (id, organization_id, title, source, content, \
                 content_hash, metadata_json, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    nugget.id.as_str(),
                    nugget.organization_id.as_str(),
                    nugget.title.as_str(),
                    nugget.source.as_str(),
                    nugget.content.as_str(),
                    nugget.content_hash.as_str(),
                    metadata_json,
                    nugget.status.as_str(),
                    ts(&nugget.created_at),
                    ts(&nugget.updated_at)
                ],
            )
            .await
            .map_err(storage_err)?;

        let stored = self
            .find_nugget_by_source(&nugget.organization_id, &nugget.source, &nugget.content_hash)
            .await?
            .ok_or_else(|| LorepathError::Storage("nugget vanished after insert".into()))?;
        Ok((stored, inserted > 0))
    }

    /// Look up a content unit by its uniqueness key.
    pub async fn find_nugget_by_source(
        &self,
        organization_id: &str,
        source: &str,
        content_hash: &str,
    ) -> Result<Option<Nugget>> {
        let sql = format!(
            "SELECT {NUGGET_COLUMNS} FROM nuggets \
             WHERE organization_id = ?1 AND source = ?2 AND content_hash = ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![organization_id, source, content_hash])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_nugget(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_nugget(&self, id: &str) -> Result<Option<Nugget>> {
        let sql = format!("SELECT {NUGGET_COLUMNS} FROM nuggets WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_nugget(&row)?)),
            None => Ok(None),
        }
    }

    /// List an organization's content units, oldest first.
    pub async fn list_nuggets(&self, organization_id: &str) -> Result<Vec<Nugget>> {
        let sql = format!(
            "SELECT {NUGGET_COLUMNS} FROM nuggets WHERE organization_id = ?1 \
             ORDER BY created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![organization_id])
            .await
            .map_err(storage_err)?;
        let mut nuggets = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            nuggets.push(row_to_nugget(&row)?);
        }
        Ok(nuggets)
    }

    pub async fn update_nugget_status(&self, id: &str, status: NuggetStatus) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE nuggets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("nugget", id));
        }
        Ok(())
    }

    /// Store the embedding vector and mark the unit `ready`.
    pub async fn set_nugget_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE nuggets SET embedding = ?1, status = 'ready', updated_at = ?2 \
                 WHERE id = ?3",
                params![vec_to_blob(embedding), ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("nugget", id));
        }
        Ok(())
    }

    pub async fn set_nugget_image(&self, id: &str, image_url: &str) -> Result<()> {
        self.set_nugget_artifact("image_url", id, image_url).await
    }

    pub async fn set_nugget_audio(&self, id: &str, audio_url: &str) -> Result<()> {
        self.set_nugget_artifact("audio_url", id, audio_url).await
    }

    async fn set_nugget_artifact(&self, column: &str, id: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        let sql = format!("UPDATE nuggets SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let changed = self
            .conn
            .execute(&sql, params![value, ts(&Utc::now()), id])
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("nugget", id));
        }
        Ok(())
    }

    /// Topics extracted from the organization's earlier units, in the order
    /// they were first seen.
    pub async fn list_known_topics(&self, organization_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT metadata_json FROM nuggets \
                 WHERE organization_id = ?1 AND metadata_json IS NOT NULL \
                 ORDER BY created_at, id",
                params![organization_id],
            )
            .await
            .map_err(storage_err)?;

        let mut topics: Vec<String> = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let Some(json) = opt_text(&row, 0) else {
                continue;
            };
            let meta: NuggetMetadata = serde_json::from_str(&json).map_err(json_err)?;
            for topic in meta.topics {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }
        Ok(topics)
    }

    /// Embeddings of the organization's `ready` units as `(nugget_id, vector)`.
    pub async fn ready_embeddings(&self, organization_id: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, embedding FROM nuggets \
                 WHERE organization_id = ?1 AND status = 'ready' AND embedding IS NOT NULL",
                params![organization_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id = text(&row, 0)?;
            if let Some(blob) = opt_blob(&row, 1) {
                results.push((id, blob_to_vec(&blob)));
            }
        }
        Ok(results)
    }

    /// Count an organization's units in `status`.
    pub async fn count_nuggets(&self, organization_id: &str, status: NuggetStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM nuggets WHERE organization_id = ?1 AND status = ?2",
                params![organization_id, status.as_str()],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(int(&row, 0)? as u64),
            None => Ok(0),
        }
    }
}
