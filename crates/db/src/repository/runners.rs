//! Runner registration repository functions.

use sqlx::PgPool;

use crate::{models::RunnerRow, DbError};

/// Insert a runner or refresh every column of an existing one.
pub async fn upsert_runner(pool: &PgPool, runner: &RunnerRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO runners (id, name, version, tags, status, last_seen, current_job)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name,
            version = EXCLUDED.version,
            tags = EXCLUDED.tags,
            status = EXCLUDED.status,
            last_seen = EXCLUDED.last_seen,
            current_job = EXCLUDED.current_job
        "#,
    )
    .bind(&runner.id)
    .bind(&runner.name)
    .bind(&runner.version)
    .bind(&runner.tags)
    .bind(&runner.status)
    .bind(runner.last_seen)
    .bind(runner.current_job)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a runner.  Removing an unknown runner is not an error.
pub async fn delete_runner(pool: &PgPool, id: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM runners WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
