//! SQLite schema statements.
//!
//! Each statement is idempotent (`IF NOT EXISTS`) so the migration runner can
//! replay the full list safely. Structured sub-documents (artifact, report,
//! attempts) are stored as JSON text; the fields used for filtering and
//! listing are real columns.

/// All schema statements, in creation order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            env_id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            image_ref TEXT NOT NULL,
            language TEXT NOT NULL,
            test_command TEXT NOT NULL,
            syntax_check_command TEXT,
            created_at TEXT NOT NULL,
            notes TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            episode_id TEXT PRIMARY KEY,
            env_id TEXT NOT NULL REFERENCES environments(env_id),
            status TEXT NOT NULL,
            phase TEXT NOT NULL,
            max_attempts INTEGER NOT NULL,
            strategy TEXT NOT NULL DEFAULT 'removal_only',
            seed INTEGER NOT NULL DEFAULT 0,
            artifact TEXT,
            validation_report TEXT,
            attempts TEXT NOT NULL DEFAULT '[]',
            final_reward REAL,
            error TEXT,
            model_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status)",
        "CREATE INDEX IF NOT EXISTS idx_episodes_env ON episodes(env_id)",
        "CREATE INDEX IF NOT EXISTS idx_episodes_created ON episodes(created_at)",
    ]
}
