//! Adaptive session delivery.
//!
//! A session moves `created -> active -> completed`. The first navigation
//! (or an explicit start) activates it; completion is allowed exactly once.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use lorepath_narrative::{ChoiceGenerator, RankingContext};
use lorepath_shared::{
    Choice, LorepathError, MasteryState, NarrativeNode, Result, Session, SessionStatus, new_id,
};
use lorepath_storage::Storage;

use crate::progress::ProgressTracker;

/// Snapshot returned by [`SessionDelivery::get_progress`].
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub session: Session,
    /// Distinct nodes visited so far, including the entry node.
    pub nodes_visited: usize,
    pub duration_secs: i64,
    pub mastery: MasteryState,
}

/// Creates sessions, records navigation and recommends next steps.
#[derive(Clone)]
pub struct SessionDelivery {
    storage: Arc<Storage>,
    progress: ProgressTracker,
    choices: ChoiceGenerator,
}

impl SessionDelivery {
    pub fn new(storage: Arc<Storage>, progress: ProgressTracker, choices: ChoiceGenerator) -> Self {
        Self {
            storage,
            progress,
            choices,
        }
    }

    /// Open a session at `start_node_id`, or at the organization's entry node.
    #[instrument(skip_all, fields(learner_id = %learner_id, org_id = %organization_id))]
    pub async fn create_session(
        &self,
        learner_id: &str,
        organization_id: &str,
        start_node_id: Option<&str>,
    ) -> Result<Session> {
        if learner_id.trim().is_empty() {
            return Err(LorepathError::validation("session is missing a learner id"));
        }
        let start = match start_node_id {
            Some(id) => self.node_in_org(id, organization_id).await?,
            None => self.entry_node(organization_id).await?,
        };

        let now = Utc::now();
        let session = Session {
            id: new_id(),
            learner_id: learner_id.to_string(),
            organization_id: organization_id.to_string(),
            current_node_id: start.id.clone(),
            path: vec![start.id],
            status: SessionStatus::Created,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        };
        self.storage.insert_session(&session).await?;
        info!(session_id = %session.id, node_id = %session.current_node_id, "session created");
        Ok(session)
    }

    /// `created -> active` without moving. Already-active sessions are
    /// returned unchanged.
    pub async fn start_session(&self, session_id: &str) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        if session.status == SessionStatus::Active {
            return Ok(session);
        }
        let previous = session.path.clone();
        self.transition(&mut session, SessionStatus::Active)?;
        session.last_activity_at = Utc::now();
        self.persist_navigation(&session, &previous).await?;
        Ok(session)
    }

    /// Move the learner to `node_id`, appending it to the path.
    ///
    /// The node must exist in the session's organization. Moving along an
    /// edge that is not one of the current node's choices is allowed.
    #[instrument(skip_all, fields(session_id = %session_id, node_id = %node_id))]
    pub async fn update_current_node(&self, session_id: &str, node_id: &str) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        self.transition(&mut session, SessionStatus::Active)?;
        let target = self.node_in_org(node_id, &session.organization_id).await?;

        if let Some(current) = self.storage.get_node(&session.current_node_id).await? {
            if !current.offers(&target.id) {
                debug!(from = %current.id, "navigating outside the offered choices");
            }
        }

        let previous = session.path.clone();
        session.path.push(target.id.clone());
        session.current_node_id = target.id;
        session.last_activity_at = Utc::now();
        self.persist_navigation(&session, &previous).await?;
        Ok(session)
    }

    /// `active -> completed`. Completing twice, or completing a session that
    /// never started, is a conflict.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn complete_session(&self, session_id: &str) -> Result<Session> {
        let session = self.load(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(LorepathError::conflict(format!(
                "only active sessions can be completed (session is {})",
                session.status.as_str()
            )));
        }
        if !self.storage.complete_session(session_id, Utc::now()).await? {
            return Err(LorepathError::conflict("session was completed concurrently"));
        }
        let done = self.load(session_id).await?;
        info!(
            duration_secs = done.duration_secs(Utc::now()),
            steps = done.path.len(),
            "session completed"
        );
        Ok(done)
    }

    /// The current node's choices, re-ranked for this learner.
    pub async fn recommend_next(&self, session_id: &str) -> Result<Vec<Choice>> {
        let session = self.load(session_id).await?;
        let neighborhood = self.progress.neighborhood(&session.current_node_id).await?;
        let Some((current, candidates)) = neighborhood.split_first() else {
            return Ok(Vec::new());
        };

        let mastery = self
            .progress
            .mastery_state(&session.learner_id, &neighborhood)
            .await?;
        let ctx = RankingContext::for_learner(&mastery, self.progress.threshold());
        let ranked = self.choices.rank(current, candidates, &ctx);

        Ok(ranked
            .into_iter()
            .filter_map(|node| {
                current
                    .choices
                    .iter()
                    .find(|c| c.target_node_id == node.id)
                    .cloned()
            })
            .collect())
    }

    pub async fn get_progress(&self, session_id: &str) -> Result<SessionProgress> {
        let session = self.load(session_id).await?;
        let neighborhood = self.progress.neighborhood(&session.current_node_id).await?;
        let mastery = self
            .progress
            .mastery_state(&session.learner_id, &neighborhood)
            .await?;

        let mut visited = session.path.clone();
        visited.sort();
        visited.dedup();

        Ok(SessionProgress {
            nodes_visited: visited.len(),
            duration_secs: session.duration_secs(Utc::now()),
            session,
            mastery,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.load(session_id).await
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("session", session_id))
    }

    fn transition(&self, session: &mut Session, next: SessionStatus) -> Result<()> {
        if !session.status.can_transition_to(next) {
            return Err(LorepathError::conflict(format!(
                "session cannot move from {} to {}",
                session.status.as_str(),
                next.as_str()
            )));
        }
        session.status = next;
        Ok(())
    }

    async fn persist_navigation(
        &self,
        session: &Session,
        previous_path: &[String],
    ) -> Result<()> {
        if self
            .storage
            .update_session_navigation(session, previous_path)
            .await?
        {
            return Ok(());
        }
        let current = self.load(&session.id).await?;
        if current.status == SessionStatus::Completed {
            return Err(LorepathError::conflict("session has already completed"));
        }
        Err(LorepathError::conflict(
            "session moved concurrently; reload it and navigate again",
        ))
    }

    async fn node_in_org(&self, node_id: &str, organization_id: &str) -> Result<NarrativeNode> {
        let node = self
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("narrative node", node_id))?;
        if node.organization_id != organization_id {
            return Err(LorepathError::validation(format!(
                "node {node_id} is not part of organization {organization_id}"
            )));
        }
        Ok(node)
    }

    /// First node without prerequisites in creation order, else the first node.
    async fn entry_node(&self, organization_id: &str) -> Result<NarrativeNode> {
        let nodes = self.storage.list_nodes(organization_id).await?;
        let entry = nodes
            .iter()
            .position(|n| n.prerequisites.is_empty())
            .unwrap_or(0);
        nodes
            .into_iter()
            .nth(entry)
            .ok_or_else(|| LorepathError::not_found("entry node", organization_id))
    }
}
