//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, pending edges, episodes, entities",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Reflection jobs and per-agent settings",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Usage event time series",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: memories and their satellites
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    project_id TEXT,
    session_id TEXT,
    text TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB,
    memory_type TEXT NOT NULL DEFAULT 'fact',
    layer TEXT NOT NULL DEFAULT 'episodic',
    confidence REAL NOT NULL DEFAULT 0.6,
    strength REAL NOT NULL DEFAULT 1.0,
    edges TEXT NOT NULL DEFAULT '[]',
    contradictions TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_reinforced_at TEXT NOT NULL,
    last_decayed_at TEXT,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_agent_created
    ON memories(agent_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_agent_project_created
    ON memories(agent_id, project_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_expires
    ON memories(expires_at) WHERE expires_at IS NOT NULL;

-- FTS5 mirror over text + tags, kept in sync by the store
CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    id UNINDEXED,
    text,
    tags
);

CREATE TABLE IF NOT EXISTS pending_edges (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    probability REAL NOT NULL DEFAULT 0.5,
    status TEXT NOT NULL DEFAULT 'pending',
    reason TEXT NOT NULL DEFAULT '',
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_review
    ON pending_edges(status, probability DESC, created_at DESC);

CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    title TEXT NOT NULL,
    narrative TEXT NOT NULL,
    participants TEXT NOT NULL DEFAULT '[]',
    dominant_topics TEXT NOT NULL DEFAULT '[]',
    fact_ids TEXT NOT NULL DEFAULT '[]',
    embedding BLOB,
    strength REAL NOT NULL DEFAULT 1.0,
    layer TEXT NOT NULL DEFAULT 'episodic',
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_agent_session
    ON episodes(agent_id, session_id);

CREATE TABLE IF NOT EXISTS entities (
    agent_id TEXT NOT NULL,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'term',
    mention_count INTEGER NOT NULL DEFAULT 0,
    memory_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (agent_id, slug)
);
"#;

/// V2: durable reflection jobs and settings documents
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS reflect_jobs (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    session_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    stages TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_jobs_agent_created
    ON reflect_jobs(agent_id, created_at DESC);

CREATE TABLE IF NOT EXISTS settings (
    agent_id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// V3: append-only usage events
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS usage_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    operation TEXT NOT NULL,
    agent_id TEXT,
    model TEXT NOT NULL,
    provider TEXT NOT NULL,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    input_texts INTEGER NOT NULL DEFAULT 0,
    input_type TEXT,
    estimated_cost_usd REAL NOT NULL DEFAULT 0.0,
    pipeline_job_id TEXT,
    pipeline_stage TEXT,
    memory_id TEXT,
    is_mock INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_usage_operation ON usage_events(operation, timestamp);
"#;

/// Apply all pending migrations to a connection
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            "Applying migration: {}",
            migration.description
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let mut last = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > last);
            last = migration.version;
        }
    }

    #[test]
    fn test_migrations_apply_idempotently() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }
}
