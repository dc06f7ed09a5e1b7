//! Learner session and mastery queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use libsql::params;
use lorepath_shared::{LorepathError, Result, Session};

use crate::{Storage, int, json_err, opt_timestamp, storage_err, text, timestamp, ts};

const SESSION_COLUMNS: &str = "id, learner_id, organization_id, current_node_id, path_json, \
     status, started_at, last_activity_at, completed_at";

fn row_to_session(row: &libsql::Row) -> Result<Session> {
    Ok(Session {
        id: text(row, 0)?,
        learner_id: text(row, 1)?,
        organization_id: text(row, 2)?,
        current_node_id: text(row, 3)?,
        path: serde_json::from_str(&text(row, 4)?).map_err(json_err)?,
        status: text(row, 5)?.parse()?,
        started_at: timestamp(row, 6)?,
        last_activity_at: timestamp(row, 7)?,
        completed_at: opt_timestamp(row, 8)?,
    })
}

impl Storage {
    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        self.check_writable()?;
        let path = serde_json::to_string(&session.path).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, learner_id, organization_id, current_node_id, \
                 path_json, status, started_at, last_activity_at, completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id.as_str(),
                    session.learner_id.as_str(),
                    session.organization_id.as_str(),
                    session.current_node_id.as_str(),
                    path,
                    session.status.as_str(),
                    ts(&session.started_at),
                    ts(&session.last_activity_at),
                    session.completed_at.as_ref().map(ts)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    /// Persist a navigation step made from a session whose stored path was
    /// `previous_path`. Returns `false`, changing nothing, if the session has
    /// completed or its path moved on since it was read.
    pub async fn update_session_navigation(
        &self,
        session: &Session,
        previous_path: &[String],
    ) -> Result<bool> {
        self.check_writable()?;
        let path = serde_json::to_string(&session.path).map_err(json_err)?;
        let previous = serde_json::to_string(previous_path).map_err(json_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET current_node_id = ?1, path_json = ?2, status = ?3, \
                 last_activity_at = ?4 \
                 WHERE id = ?5 AND status != 'completed' AND path_json = ?6",
                params![
                    session.current_node_id.as_str(),
                    path,
                    session.status.as_str(),
                    ts(&session.last_activity_at),
                    session.id.as_str(),
                    previous
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// `active -> completed`. Returns `false` if the session was not active.
    pub async fn complete_session(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = 'completed', completed_at = ?1, \
                 last_activity_at = ?1 WHERE id = ?2 AND status = 'active'",
                params![ts(&at), id],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Mastery
    // -----------------------------------------------------------------------

    /// A learner's level for every evidenced concept.
    pub async fn get_mastery_levels(&self, learner_id: &str) -> Result<BTreeMap<String, u8>> {
        let mut rows = self
            .conn
            .query(
                "SELECT concept, level FROM mastery WHERE learner_id = ?1",
                params![learner_id],
            )
            .await
            .map_err(storage_err)?;
        let mut levels = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            levels.insert(text(&row, 0)?, int(&row, 1)?.clamp(0, 100) as u8);
        }
        Ok(levels)
    }

    /// Current `(level, evidence_count)` for one concept, if evidenced.
    pub async fn get_mastery(&self, learner_id: &str, concept: &str) -> Result<Option<(u8, u32)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT level, evidence_count FROM mastery WHERE learner_id = ?1 AND concept = ?2",
                params![learner_id, concept],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some((
                int(&row, 0)?.clamp(0, 100) as u8,
                int(&row, 1)?.max(0) as u32,
            ))),
            None => Ok(None),
        }
    }

    /// Fold one score into a concept's level in a single statement and
    /// return the new `(level, evidence_count)`.
    ///
    /// The first score sets the level; later ones blend as
    /// `level * (1 - smoothing) + score * smoothing`, rounded and clamped to
    /// `0..=100`.
    pub async fn record_mastery_evidence(
        &self,
        learner_id: &str,
        concept: &str,
        score: u8,
        smoothing: f64,
    ) -> Result<(u8, u32)> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO mastery (learner_id, concept, level, evidence_count, updated_at) \
                 VALUES (?1, ?2, ?3, 1, ?5) \
                 ON CONFLICT(learner_id, concept) DO UPDATE SET \
                 level = MAX(0, MIN(100, CAST(ROUND(level * (1.0 - ?4) + excluded.level * ?4) \
                 AS INTEGER))), \
                 evidence_count = evidence_count + 1, updated_at = excluded.updated_at \
                 RETURNING level, evidence_count",
                params![
                    learner_id,
                    concept,
                    score as i64,
                    smoothing.clamp(0.0, 1.0),
                    ts(&Utc::now())
                ],
            )
            .await
            .map_err(storage_err)?;
        let row = rows
            .next()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| LorepathError::Storage("mastery upsert returned no row".into()))?;
        Ok((
            int(&row, 0)?.clamp(0, 100) as u8,
            int(&row, 1)?.max(0) as u32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use chrono::Utc;
    use lorepath_shared::{Session, SessionStatus, new_id};

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: new_id(),
            learner_id: "learner".into(),
            organization_id: "org".into(),
            current_node_id: "a".into(),
            path: vec!["a".into()],
            status: SessionStatus::Created,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn navigation_and_completion() {
        let storage = test_storage().await;
        let mut s = session();
        storage.insert_session(&s).await.unwrap();

        // Created sessions cannot complete
        assert!(!storage.complete_session(&s.id, Utc::now()).await.unwrap());

        let before = s.path.clone();
        s.current_node_id = "b".into();
        s.path.push("b".into());
        s.status = SessionStatus::Active;
        assert!(storage.update_session_navigation(&s, &before).await.unwrap());

        let loaded = storage.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.path, vec!["a", "b"]);
        assert_eq!(loaded.status, SessionStatus::Active);

        assert!(storage.complete_session(&s.id, Utc::now()).await.unwrap());
        let before = s.path.clone();
        s.path.push("c".into());
        assert!(!storage.update_session_navigation(&s, &before).await.unwrap());
        let loaded = storage.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn navigation_from_a_stale_path_changes_nothing() {
        let storage = test_storage().await;
        let s = session();
        storage.insert_session(&s).await.unwrap();

        // Two moves made from the same read of the session.
        let mut to_b = s.clone();
        to_b.current_node_id = "b".into();
        to_b.path.push("b".into());
        let mut to_c = s.clone();
        to_c.current_node_id = "c".into();
        to_c.path.push("c".into());

        assert!(storage.update_session_navigation(&to_b, &s.path).await.unwrap());
        assert!(!storage.update_session_navigation(&to_c, &s.path).await.unwrap());

        let loaded = storage.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.path, vec!["a", "b"]);
        assert_eq!(loaded.current_node_id, "b");
    }

    #[tokio::test]
    async fn mastery_evidence_blends_per_concept() {
        let storage = test_storage().await;
        assert!(storage.get_mastery("l", "Sets").await.unwrap().is_none());

        assert_eq!(
            storage.record_mastery_evidence("l", "Sets", 40, 0.4).await.unwrap(),
            (40, 1)
        );
        assert_eq!(
            storage.record_mastery_evidence("l", "Sets", 100, 0.4).await.unwrap(),
            (64, 2)
        );
        assert_eq!(
            storage.record_mastery_evidence("l", "Sets", 0, 1.0).await.unwrap(),
            (0, 3)
        );
        storage.record_mastery_evidence("l", "Logic", 90, 0.4).await.unwrap();
        storage.record_mastery_evidence("other", "Sets", 10, 0.4).await.unwrap();

        assert_eq!(storage.get_mastery("l", "Sets").await.unwrap(), Some((0, 3)));
        let levels = storage.get_mastery_levels("l").await.unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels["Logic"], 90);
    }
}
