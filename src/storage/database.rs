//! SQLite database client for episode and environment persistence.
//!
//! Episodes persist their artifact, validation report and attempt history as
//! JSON documents; status and timestamps are real columns so listings and
//! resume scans filter in SQL.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::episode::{Episode, EpisodeStatus};
use crate::model::{Environment, InjectionStrategy, LanguageHint};

use super::migrations::MigrationRunner;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// SQLite database client.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connects to the database and runs pending migrations.
    ///
    /// In-memory databases get a single-connection pool so every query sees
    /// the same store.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Environment operations
    // =========================================================================

    /// Inserts a new environment. Names are unique.
    pub async fn insert_environment(&self, env: &Environment) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                env_id, name, image_ref, language, test_command,
                syntax_check_command, created_at, notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(env.env_id.to_string())
        .bind(&env.name)
        .bind(&env.image_ref)
        .bind(env.language.to_string())
        .bind(&env.test_command)
        .bind(&env.syntax_check_command)
        .bind(env.created_at)
        .bind(&env.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_environment(&self, env_id: Uuid) -> Result<Option<Environment>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM environments WHERE env_id = ?")
            .bind(env_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(environment_from_row).transpose()
    }

    pub async fn get_environment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Environment>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM environments WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(environment_from_row).transpose()
    }

    pub async fn list_environments(&self) -> Result<Vec<Environment>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM environments ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(environment_from_row).collect()
    }

    /// Deletes an environment, refusing while any episode references it.
    pub async fn delete_environment(&self, env_id: Uuid) -> Result<(), DatabaseError> {
        let (references,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM episodes WHERE env_id = ?")
                .bind(env_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        if references > 0 {
            return Err(DatabaseError::Conflict(format!(
                "environment is referenced by {references} episode(s)"
            )));
        }
        let result = sqlx::query("DELETE FROM environments WHERE env_id = ?")
            .bind(env_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(env_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Episode operations
    // =========================================================================

    /// Inserts or updates an episode and its embedded documents.
    pub async fn save_episode(&self, episode: &Episode) -> Result<(), DatabaseError> {
        let artifact = episode
            .artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let report = episode
            .validation_report
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let attempts = serde_json::to_string(&episode.attempts)?;

        sqlx::query(
            r#"
            INSERT INTO episodes (
                episode_id, env_id, status, phase, max_attempts, strategy,
                seed, artifact, validation_report, attempts, final_reward,
                error, model_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (episode_id) DO UPDATE SET
                status = excluded.status,
                phase = excluded.phase,
                max_attempts = excluded.max_attempts,
                strategy = excluded.strategy,
                seed = excluded.seed,
                artifact = excluded.artifact,
                validation_report = excluded.validation_report,
                attempts = excluded.attempts,
                final_reward = excluded.final_reward,
                error = excluded.error,
                model_id = excluded.model_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(episode.episode_id.to_string())
        .bind(episode.env_id.to_string())
        .bind(episode.status.as_str())
        .bind(&episode.phase)
        .bind(episode.max_attempts as i64)
        .bind(episode.strategy.to_string())
        .bind(episode.seed as i64)
        .bind(artifact)
        .bind(report)
        .bind(attempts)
        .bind(episode.final_reward)
        .bind(&episode.error)
        .bind(&episode.model_id)
        .bind(episode.created_at)
        .bind(episode.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_episode(&self, episode_id: Uuid) -> Result<Option<Episode>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM episodes WHERE episode_id = ?")
            .bind(episode_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(episode_from_row).transpose()
    }

    /// Lists episodes newest-first, optionally filtered by status.
    pub async fn list_episodes(
        &self,
        status: Option<EpisodeStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>, DatabaseError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM episodes WHERE status = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(s.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM episodes ORDER BY created_at DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(episode_from_row).collect()
    }

    /// Episodes stranded in a non-terminal status, oldest first.
    pub async fn list_resumable(&self) -> Result<Vec<Episode>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM episodes \
             WHERE status NOT IN ('completed', 'failed', 'cancelled') \
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(episode_from_row).collect()
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::InvalidValue(format!("uuid '{s}': {e}")))
}

fn environment_from_row(row: SqliteRow) -> Result<Environment, DatabaseError> {
    let language: String = row.try_get("language")?;
    Ok(Environment {
        env_id: parse_uuid(&row.try_get::<String, _>("env_id")?)?,
        name: row.try_get("name")?,
        image_ref: row.try_get("image_ref")?,
        language: LanguageHint::parse(&language)
            .ok_or_else(|| DatabaseError::InvalidValue(format!("language '{language}'")))?,
        test_command: row.try_get("test_command")?,
        syntax_check_command: row.try_get("syntax_check_command")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        notes: row.try_get("notes")?,
    })
}

fn episode_from_row(row: SqliteRow) -> Result<Episode, DatabaseError> {
    let status: String = row.try_get("status")?;
    let strategy: String = row.try_get("strategy")?;
    let artifact: Option<String> = row.try_get("artifact")?;
    let report: Option<String> = row.try_get("validation_report")?;
    let attempts: String = row.try_get("attempts")?;

    Ok(Episode {
        episode_id: parse_uuid(&row.try_get::<String, _>("episode_id")?)?,
        env_id: parse_uuid(&row.try_get::<String, _>("env_id")?)?,
        status: EpisodeStatus::parse(&status)
            .ok_or_else(|| DatabaseError::InvalidValue(format!("status '{status}'")))?,
        phase: row.try_get("phase")?,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        strategy: InjectionStrategy::parse(&strategy)
            .ok_or_else(|| DatabaseError::InvalidValue(format!("strategy '{strategy}'")))?,
        seed: row.try_get::<i64, _>("seed")? as u64,
        artifact: artifact.as_deref().map(serde_json::from_str).transpose()?,
        validation_report: report.as_deref().map(serde_json::from_str).transpose()?,
        attempts: serde_json::from_str(&attempts)?,
        final_reward: row.try_get("final_reward")?,
        error: row.try_get("error")?,
        model_id: row.try_get("model_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeEvent;
    use crate::model::{BugArtifact, InjectionStrategy, SolverAttempt};

    async fn db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_env() -> Environment {
        Environment::new("calc", "python:3.12-slim", LanguageHint::Python, "pytest")
            .with_syntax_check("python3 -m py_compile {file}")
    }

    #[tokio::test]
    async fn environment_round_trip() {
        let db = db().await;
        let env = sample_env();
        db.insert_environment(&env).await.unwrap();

        let loaded = db.get_environment(env.env_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "calc");
        assert_eq!(loaded.language, LanguageHint::Python);
        assert_eq!(
            loaded.syntax_check_command.as_deref(),
            Some("python3 -m py_compile {file}")
        );

        let by_name = db.get_environment_by_name("calc").await.unwrap().unwrap();
        assert_eq!(by_name.env_id, env.env_id);
        assert!(db.get_environment_by_name("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_environment_name_rejected() {
        let db = db().await;
        db.insert_environment(&sample_env()).await.unwrap();
        let dup = Environment::new("calc", "other", LanguageHint::Go, "go test ./...");
        assert!(db.insert_environment(&dup).await.is_err());
    }

    #[tokio::test]
    async fn episode_round_trip_preserves_documents() {
        let db = db().await;
        let env = sample_env();
        db.insert_environment(&env).await.unwrap();

        let mut ep = Episode::new(env.env_id, 4);
        ep.advance(EpisodeEvent::StartRequested).unwrap();
        ep.artifact = Some(BugArtifact {
            source_file: "calc.py".to_string(),
            test_file: "tests/test_oracle.py".to_string(),
            bug_diff: "--- a/calc.py\n+++ b/calc.py\n".to_string(),
            oracle_test: "def test(): ...".to_string(),
            test_command: "pytest tests/test_oracle.py".to_string(),
            strategy: InjectionStrategy::RemovalOnly,
            seed: 99,
        });
        ep.advance(EpisodeEvent::ArtifactReceived).unwrap();
        ep.advance(EpisodeEvent::ValidationPassed).unwrap();
        ep.push_attempt(SolverAttempt::record(
            1,
            Some("diff".to_string()),
            "out".to_string(),
            String::new(),
            2,
            2,
            true,
            Utc::now(),
        ))
        .unwrap();
        db.save_episode(&ep).await.unwrap();

        let loaded = db.get_episode(ep.episode_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EpisodeStatus::Solving);
        assert_eq!(loaded.max_attempts, 4);
        assert_eq!(loaded.artifact.as_ref().unwrap().seed, 99);
        assert_eq!(loaded.attempts.len(), 1);
        assert!(loaded.attempts[0].solved);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let db = db().await;
        let env = sample_env();
        db.insert_environment(&env).await.unwrap();

        let mut ep = Episode::new(env.env_id, 2);
        db.save_episode(&ep).await.unwrap();
        ep.advance(EpisodeEvent::StartRequested).unwrap();
        ep.error = Some("boom".to_string());
        db.save_episode(&ep).await.unwrap();

        let loaded = db.get_episode(ep.episode_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EpisodeStatus::Injecting);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let db = db().await;
        let env = sample_env();
        db.insert_environment(&env).await.unwrap();

        for terminal in [false, true, true] {
            let mut ep = Episode::new(env.env_id, 1);
            if terminal {
                ep.advance(EpisodeEvent::StartRequested).unwrap();
                ep.advance(EpisodeEvent::InfrastructureFailed).unwrap();
            }
            db.save_episode(&ep).await.unwrap();
        }

        let failed = db
            .list_episodes(Some(EpisodeStatus::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        let all = db.list_episodes(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let resumable = db.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].status, EpisodeStatus::Pending);
    }

    #[tokio::test]
    async fn environment_delete_guarded_while_referenced() {
        let db = db().await;
        let env = sample_env();
        db.insert_environment(&env).await.unwrap();
        let ep = Episode::new(env.env_id, 1);
        db.save_episode(&ep).await.unwrap();

        let err = db.delete_environment(env.env_id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        // Unknown environments surface as not found.
        let err = db.delete_environment(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("episodes.db").display()
        );

        let env = sample_env();
        {
            let db = Database::connect(&url).await.unwrap();
            db.insert_environment(&env).await.unwrap();
        }

        // Reconnecting re-runs migrations; already-applied statements are
        // skipped and stored rows are intact.
        let db = Database::connect(&url).await.unwrap();
        let loaded = db.get_environment(env.env_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, env.name);
    }
}
