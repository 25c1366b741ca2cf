//! Job and step repository functions.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    models::{JobRow, StepRow},
    DbError,
};

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

pub async fn insert_job(conn: &mut PgConnection, job: &JobRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO jobs
            (id, run_id, name, position, status, needs, runner_id, lease_id, error, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(job.id)
    .bind(job.run_id)
    .bind(&job.name)
    .bind(job.position)
    .bind(&job.status)
    .bind(&job.needs)
    .bind(&job.runner_id)
    .bind(job.lease_id)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrite the mutable columns of a job.
pub async fn update_job(conn: &mut PgConnection, job: &JobRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1, runner_id = $2, lease_id = $3, error = $4, started_at = $5, finished_at = $6
        WHERE id = $7
        "#,
    )
    .bind(&job.status)
    .bind(&job.runner_id)
    .bind(job.lease_id)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// All jobs of a run in declaration order.
pub async fn list_jobs(pool: &PgPool, run_id: Uuid) -> Result<Vec<JobRow>, DbError> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, run_id, name, position, status, needs, runner_id, lease_id, error, started_at, finished_at
        FROM jobs WHERE run_id = $1 ORDER BY position ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// steps
// ---------------------------------------------------------------------------

pub async fn insert_step(conn: &mut PgConnection, step: &StepRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO steps
            (id, run_id, job_id, position, name, command, continue_on_error, status,
             exit_code, output, error, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(step.id)
    .bind(step.run_id)
    .bind(step.job_id)
    .bind(step.position)
    .bind(&step.name)
    .bind(&step.command)
    .bind(step.continue_on_error)
    .bind(&step.status)
    .bind(step.exit_code)
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.started_at)
    .bind(step.finished_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrite the result columns of a step.
pub async fn update_step(conn: &mut PgConnection, step: &StepRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE steps
        SET status = $1, exit_code = $2, output = $3, error = $4, started_at = $5, finished_at = $6
        WHERE id = $7
        "#,
    )
    .bind(&step.status)
    .bind(step.exit_code)
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.started_at)
    .bind(step.finished_at)
    .bind(step.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// All steps of a run, grouped by job and ordered by position.
pub async fn list_steps(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
    let rows = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT s.id, s.run_id, s.job_id, s.position, s.name, s.command, s.continue_on_error,
               s.status, s.exit_code, s.output, s.error, s.started_at, s.finished_at
        FROM steps s
        JOIN jobs j ON j.id = s.job_id
        WHERE s.run_id = $1
        ORDER BY j.position ASC, s.position ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
