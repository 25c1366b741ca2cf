//! Run repository functions.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{models::RunRow, DbError};

/// Insert a new run row.
pub async fn insert_run(conn: &mut PgConnection, run: &RunRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO runs
            (id, workflow_name, status, cancel_requested, inputs, created_at, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(run.id)
    .bind(&run.workflow_name)
    .bind(&run.status)
    .bind(run.cancel_requested)
    .bind(&run.inputs)
    .bind(run.created_at)
    .bind(run.started_at)
    .bind(run.finished_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrite the mutable columns of a run.
///
/// Returns `DbError::NotFound` if no row was updated.
pub async fn update_run(conn: &mut PgConnection, run: &RunRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, cancel_requested = $2, started_at = $3, finished_at = $4
        WHERE id = $5
        "#,
    )
    .bind(&run.status)
    .bind(run.cancel_requested)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Fetch a single run by its primary key.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, workflow_name, status, cancel_requested, inputs, created_at, started_at, finished_at
        FROM runs WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}
