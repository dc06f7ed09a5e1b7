//! SQL migration definitions for the Lorepath database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: nuggets, jobs, watched_folders, monitored_urls",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Content units
CREATE TABLE IF NOT EXISTS nuggets (
    id              TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    title           TEXT NOT NULL,
    source          TEXT NOT NULL,
    content         TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    metadata_json   TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    image_url       TEXT,
    audio_url       TEXT,
    embedding       BLOB,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(organization_id, source, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_nuggets_org_status ON nuggets(organization_id, status);

-- Orchestrated jobs, all queues
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    queue           TEXT NOT NULL,
    kind            TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    deferred        INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status);
CREATE INDEX IF NOT EXISTS idx_jobs_org ON jobs(organization_id);

-- Watched folders
CREATE TABLE IF NOT EXISTS watched_folders (
    id              TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    path            TEXT NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    file_types_json TEXT NOT NULL DEFAULT '[]',
    recursive       INTEGER NOT NULL DEFAULT 1,
    auto_process    INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- Monitored URLs
CREATE TABLE IF NOT EXISTS monitored_urls (
    id                  TEXT PRIMARY KEY,
    organization_id     TEXT NOT NULL,
    url                 TEXT NOT NULL,
    check_interval_secs INTEGER NOT NULL,
    last_content_hash   TEXT,
    last_checked_at     TEXT,
    enabled             INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Narrative graph, sessions, mastery",
            sql: r#"
-- Graph nodes, one per content unit
CREATE TABLE IF NOT EXISTS narrative_nodes (
    id                 TEXT PRIMARY KEY,
    organization_id    TEXT NOT NULL,
    nugget_id          TEXT NOT NULL UNIQUE,
    prerequisites_json TEXT NOT NULL DEFAULT '[]',
    adapts_to_json     TEXT NOT NULL DEFAULT '[]',
    position_x         REAL NOT NULL,
    position_y         REAL NOT NULL,
    choices_json       TEXT NOT NULL DEFAULT '[]',
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_org ON narrative_nodes(organization_id);

-- Learner traversals
CREATE TABLE IF NOT EXISTS sessions (
    id               TEXT PRIMARY KEY,
    learner_id       TEXT NOT NULL,
    organization_id  TEXT NOT NULL,
    current_node_id  TEXT NOT NULL,
    path_json        TEXT NOT NULL DEFAULT '[]',
    status           TEXT NOT NULL DEFAULT 'created',
    started_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    completed_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_learner ON sessions(learner_id);

-- Per-learner concept mastery
CREATE TABLE IF NOT EXISTS mastery (
    learner_id     TEXT NOT NULL,
    concept        TEXT NOT NULL,
    level          INTEGER NOT NULL,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (learner_id, concept)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
