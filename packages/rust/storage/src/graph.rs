//! Narrative node queries.

use chrono::Utc;
use libsql::params;
use lorepath_shared::{Choice, LorepathError, NarrativeNode, Position, Result};

use crate::{Storage, int, json_err, real, storage_err, text, timestamp, ts};

const NODE_COLUMNS: &str = "id, organization_id, nugget_id, prerequisites_json, adapts_to_json, \
     position_x, position_y, choices_json, created_at, updated_at";

fn row_to_node(row: &libsql::Row) -> Result<NarrativeNode> {
    Ok(NarrativeNode {
        id: text(row, 0)?,
        organization_id: text(row, 1)?,
        nugget_id: text(row, 2)?,
        prerequisites: serde_json::from_str(&text(row, 3)?).map_err(json_err)?,
        adapts_to: serde_json::from_str(&text(row, 4)?).map_err(json_err)?,
        position: Position {
            x: real(row, 5)?,
            y: real(row, 6)?,
        },
        choices: serde_json::from_str(&text(row, 7)?).map_err(json_err)?,
        created_at: timestamp(row, 8)?,
        updated_at: timestamp(row, 9)?,
    })
}

impl Storage {
    /// Insert `node` unless its content unit already has one.
    ///
    /// Returns the stored node and whether this call created it.
    pub async fn insert_node_if_absent(&self, node: &NarrativeNode) -> Result<(NarrativeNode, bool)> {
        self.check_writable()?;
        let prerequisites = serde_json::to_string(&node.prerequisites).map_err(json_err)?;
        let adapts_to = serde_json::to_string(&node.adapts_to).map_err(json_err)?;
        let choices = serde_json::to_string(&node.choices).map_err(json_err)?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO narrative_nodes (id, organization_id, nugget_id, \
                 prerequisites_json, adapts_to_json, position_x, position_y, choices_json, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    node.id.as_str(),
                    node.organization_id.as_str(),
                    node.nugget_id.as_str(),
                    prerequisites,
                    adapts_to,
                    node.position.x,
                    node.position.y,
                    choices,
                    ts(&node.created_at),
                    ts(&node.updated_at)
                ],
            )
            .await
            .map_err(storage_err)?;

        let stored = self
            .get_node_by_nugget(&node.nugget_id)
            .await?
            .ok_or_else(|| LorepathError::Storage("node vanished after insert".into()))?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<NarrativeNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM narrative_nodes WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_node_by_nugget(&self, nugget_id: &str) -> Result<Option<NarrativeNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM narrative_nodes WHERE nugget_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![nugget_id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    /// All of an organization's nodes, oldest first.
    pub async fn list_nodes(&self, organization_id: &str) -> Result<Vec<NarrativeNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM narrative_nodes WHERE organization_id = ?1 \
             ORDER BY created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![organization_id])
            .await
            .map_err(storage_err)?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }

    pub async fn count_nodes(&self, organization_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM narrative_nodes WHERE organization_id = ?1",
                params![organization_id],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(int(&row, 0)? as u64),
            None => Ok(0),
        }
    }

    /// Replace a node's whole choice list in one statement, so readers see
    /// either the old list or the new one.
    pub async fn replace_choices(&self, node_id: &str, choices: &[Choice]) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(choices).map_err(json_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE narrative_nodes SET choices_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, ts(&Utc::now()), node_id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(LorepathError::not_found("node", node_id));
        }
        Ok(())
    }
}
