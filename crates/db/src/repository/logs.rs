//! Log line repository functions.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::LogRow, DbError};

/// Append one log line.
///
/// `(run_id, seq)` is the primary key, so a replayed append surfaces as
/// `DbError::Conflict` rather than a duplicate line.
pub async fn insert_log(pool: &PgPool, entry: &LogRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO logs (run_id, job_id, step_id, seq, level, content, timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (run_id, seq) DO NOTHING
        "#,
    )
    .bind(entry.run_id)
    .bind(entry.job_id)
    .bind(entry.step_id)
    .bind(entry.seq)
    .bind(&entry.level)
    .bind(&entry.content)
    .bind(entry.timestamp)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::Conflict(format!(
            "log seq {} of run {}",
            entry.seq, entry.run_id
        )));
    }

    Ok(())
}

/// Lines of a run with `seq > since_seq`, in sequence order.
pub async fn list_logs(pool: &PgPool, run_id: Uuid, since_seq: i64) -> Result<Vec<LogRow>, DbError> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT run_id, job_id, step_id, seq, level, content, timestamp
        FROM logs WHERE run_id = $1 AND seq > $2
        ORDER BY seq ASC
        "#,
    )
    .bind(run_id)
    .bind(since_seq)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
