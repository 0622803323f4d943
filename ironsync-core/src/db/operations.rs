//! Store operations. Calls are individual statements, atomic in isolation;
//! there are no cross-call transactions. Mutation helpers write `synced = 0`
//! in the same statement, so a post-sync edit re-dirties the record and the
//! next pass picks it up.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::db::models::{
    EntityType, OperationType, QueueItem, Session, SessionExercise, SessionStatus, SetRecord, now,
};

// Sessions

pub async fn upsert_session(pool: &SqlitePool, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (
            id, athlete_id, workout_plan_id, assignment_id, status, started_at,
            paused_at, completed_at, total_duration_seconds, current_exercise_index,
            notes, created_at, updated_at, synced
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            athlete_id = excluded.athlete_id,
            workout_plan_id = excluded.workout_plan_id,
            assignment_id = excluded.assignment_id,
            status = excluded.status,
            started_at = excluded.started_at,
            paused_at = excluded.paused_at,
            completed_at = excluded.completed_at,
            total_duration_seconds = excluded.total_duration_seconds,
            current_exercise_index = excluded.current_exercise_index,
            notes = excluded.notes,
            updated_at = MAX(excluded.updated_at, sessions.updated_at + 1),
            synced = excluded.synced",
    )
    .bind(&session.id)
    .bind(&session.athlete_id)
    .bind(&session.workout_plan_id)
    .bind(&session.assignment_id)
    .bind(session.status)
    .bind(session.started_at)
    .bind(session.paused_at)
    .bind(session.completed_at)
    .bind(session.total_duration_seconds)
    .bind(session.current_exercise_index)
    .bind(&session.notes)
    .bind(session.created_at)
    .bind(session.updated_at)
    .bind(session.synced)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_session(pool: &SqlitePool, session_id: &str) -> Result<Option<Session>> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

pub async fn get_sessions_for_athlete(pool: &SqlitePool, athlete_id: &str) -> Result<Vec<Session>> {
    sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE athlete_id = ?1 ORDER BY started_at DESC",
    )
    .bind(athlete_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_sessions_by_status(
    pool: &SqlitePool,
    status: SessionStatus,
) -> Result<Vec<Session>> {
    sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE status = ?1 ORDER BY started_at DESC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// The most recently started session still in the active or paused state.
pub async fn get_current_session(pool: &SqlitePool) -> Result<Option<Session>> {
    sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE status IN ('active', 'paused')
         ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_unsynced_sessions(pool: &SqlitePool) -> Result<Vec<Session>> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE synced = 0 ORDER BY started_at")
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

/// Confirm as synced the session state that was read at `updated_at`. A
/// mutation that landed after that read has bumped `updated_at`, so the flip
/// is a no-op and the record stays dirty for the next pass.
pub async fn mark_session_synced(
    pool: &SqlitePool,
    session_id: &str,
    updated_at: i64,
) -> Result<()> {
    sqlx::query("UPDATE sessions SET synced = 1 WHERE id = ?1 AND updated_at = ?2")
        .bind(session_id)
        .bind(updated_at)
        .execute(pool)
        .await?;
    Ok(())
}

// MAX(now, updated_at + 1) keeps updated_at strictly increasing even when two
// writes land within one clock second; the synced flip above depends on it.
async fn transition_session(
    pool: &SqlitePool,
    session_id: &str,
    set_clause: &str,
    status: SessionStatus,
) -> Result<u64> {
    let sql = format!(
        "UPDATE sessions SET status = ?1, {set_clause},
         updated_at = MAX(?2, updated_at + 1), synced = 0 WHERE id = ?3"
    );
    let result = sqlx::query(&sql)
        .bind(status)
        .bind(now())
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn pause_session(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    transition_session(
        pool,
        session_id,
        "paused_at = CAST(strftime('%s','now') AS INTEGER)",
        SessionStatus::Paused,
    )
    .await
}

pub async fn resume_session(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    transition_session(pool, session_id, "paused_at = NULL", SessionStatus::Active).await
}

pub async fn complete_session(
    pool: &SqlitePool,
    session_id: &str,
    total_duration_seconds: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions SET status = ?1, completed_at = ?2, total_duration_seconds = ?3,
         updated_at = MAX(?2, updated_at + 1), synced = 0 WHERE id = ?4",
    )
    .bind(SessionStatus::Completed)
    .bind(now())
    .bind(total_duration_seconds)
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn abandon_session(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    transition_session(
        pool,
        session_id,
        "completed_at = CAST(strftime('%s','now') AS INTEGER)",
        SessionStatus::Abandoned,
    )
    .await
}

pub async fn update_session_progress(
    pool: &SqlitePool,
    session_id: &str,
    current_exercise_index: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE sessions SET current_exercise_index = ?1,
         updated_at = MAX(?2, updated_at + 1), synced = 0 WHERE id = ?3",
    )
    .bind(current_exercise_index)
    .bind(now())
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_session(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// Session exercises

pub async fn upsert_session_exercise(
    pool: &SqlitePool,
    exercise: &SessionExercise,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO session_exercises (
            id, session_id, exercise_id, exercise_name, order_index, target_sets,
            target_reps, target_weight, weight_type, target_rest_seconds, notes,
            is_completed, sets_completed, synced
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            exercise_name = excluded.exercise_name,
            order_index = excluded.order_index,
            target_sets = excluded.target_sets,
            target_reps = excluded.target_reps,
            target_weight = excluded.target_weight,
            weight_type = excluded.weight_type,
            target_rest_seconds = excluded.target_rest_seconds,
            notes = excluded.notes,
            is_completed = excluded.is_completed,
            sets_completed = excluded.sets_completed,
            synced = excluded.synced",
    )
    .bind(&exercise.id)
    .bind(&exercise.session_id)
    .bind(&exercise.exercise_id)
    .bind(&exercise.exercise_name)
    .bind(exercise.order_index)
    .bind(exercise.target_sets)
    .bind(exercise.target_reps)
    .bind(exercise.target_weight)
    .bind(&exercise.weight_type)
    .bind(exercise.target_rest_seconds)
    .bind(&exercise.notes)
    .bind(exercise.is_completed)
    .bind(exercise.sets_completed)
    .bind(exercise.synced)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_exercises_for_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<SessionExercise>> {
    sqlx::query_as::<_, SessionExercise>(
        "SELECT * FROM session_exercises WHERE session_id = ?1 ORDER BY order_index",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_session_exercise(
    pool: &SqlitePool,
    exercise_id: &str,
) -> Result<Option<SessionExercise>> {
    sqlx::query_as::<_, SessionExercise>("SELECT * FROM session_exercises WHERE id = ?1")
        .bind(exercise_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

/// Bump the exercise's progress and queue the new state for upload.
/// Exercises have no fast sync path, so every progress change rides the
/// queue like the exercise's creation did.
pub async fn record_exercise_set_completed(
    pool: &SqlitePool,
    exercise_id: &str,
    is_completed: bool,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE session_exercises SET sets_completed = sets_completed + 1,
         is_completed = ?1, synced = 0 WHERE id = ?2",
    )
    .bind(is_completed)
    .bind(exercise_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(());
    }

    if let Some(exercise) = get_session_exercise(pool, exercise_id).await? {
        let item = QueueItem::new(
            OperationType::Update,
            EntityType::Exercise,
            exercise_id,
            &serde_json::json!({
                "id": exercise.id,
                "session_id": exercise.session_id,
                "sets_completed": exercise.sets_completed,
                "is_completed": exercise.is_completed,
            }),
        );
        enqueue(pool, &item).await?;
    }
    Ok(())
}

/// No-op while another queued mutation for this exercise is still pending;
/// that newer item carries the later state and flips the flag on its own
/// success.
pub async fn mark_exercise_synced(pool: &SqlitePool, exercise_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE session_exercises SET synced = 1 WHERE id = ?1
         AND NOT EXISTS (SELECT 1 FROM sync_queue WHERE entity_id = ?1)",
    )
    .bind(exercise_id)
    .execute(pool)
    .await?;
    Ok(())
}

// Set records

pub async fn insert_set_record(pool: &SqlitePool, record: &SetRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO set_records (
            id, session_id, session_exercise_id, set_number, reps_completed,
            weight_used, rpe, notes, completed_at, created_at, synced
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET synced = excluded.synced",
    )
    .bind(&record.id)
    .bind(&record.session_id)
    .bind(&record.session_exercise_id)
    .bind(record.set_number)
    .bind(record.reps_completed)
    .bind(record.weight_used)
    .bind(record.rpe)
    .bind(&record.notes)
    .bind(record.completed_at)
    .bind(record.created_at)
    .bind(record.synced)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_set_records_for_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<SetRecord>> {
    sqlx::query_as::<_, SetRecord>(
        "SELECT * FROM set_records WHERE session_id = ?1 ORDER BY completed_at",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_set_records_for_exercise(
    pool: &SqlitePool,
    session_exercise_id: &str,
) -> Result<Vec<SetRecord>> {
    sqlx::query_as::<_, SetRecord>(
        "SELECT * FROM set_records WHERE session_exercise_id = ?1 ORDER BY set_number",
    )
    .bind(session_exercise_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_unsynced_set_records(pool: &SqlitePool) -> Result<Vec<SetRecord>> {
    sqlx::query_as::<_, SetRecord>(
        "SELECT * FROM set_records WHERE synced = 0 ORDER BY session_id, completed_at",
    )
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Flip a whole batch to synced in one statement, so a successful
/// batch-create marks every record in it together.
pub async fn mark_set_records_synced(pool: &SqlitePool, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = (1..=ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE set_records SET synced = 1 WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

pub async fn mark_set_record_synced(pool: &SqlitePool, record_id: &str) -> Result<()> {
    sqlx::query("UPDATE set_records SET synced = 1 WHERE id = ?1")
        .bind(record_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_set_record(pool: &SqlitePool, record_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM set_records WHERE id = ?1")
        .bind(record_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// Sync queue

pub async fn enqueue(pool: &SqlitePool, item: &QueueItem) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_queue (
            id, operation_type, entity_type, entity_id, payload, created_at,
            attempts, last_attempt, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&item.id)
    .bind(item.operation_type)
    .bind(item.entity_type)
    .bind(&item.entity_id)
    .bind(&item.payload)
    .bind(item.created_at)
    .bind(item.attempts)
    .bind(item.last_attempt)
    .bind(&item.error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Items still eligible for dispatch, oldest first. Anything at or past
/// `max_retries` attempts is excluded; it stays in the table for diagnostics.
pub async fn get_pending_queue_items(
    pool: &SqlitePool,
    max_retries: i64,
) -> Result<Vec<QueueItem>> {
    sqlx::query_as::<_, QueueItem>(
        "SELECT * FROM sync_queue WHERE attempts < ?1 ORDER BY created_at, rowid",
    )
    .bind(max_retries)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn get_queue_items(pool: &SqlitePool) -> Result<Vec<QueueItem>> {
    sqlx::query_as::<_, QueueItem>("SELECT * FROM sync_queue ORDER BY created_at, rowid")
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

pub async fn delete_queue_item(pool: &SqlitePool, item_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_queue_failure(pool: &SqlitePool, item_id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_queue SET attempts = attempts + 1, last_attempt = ?1, error = ?2
         WHERE id = ?3",
    )
    .bind(now())
    .bind(error)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Counts shown by the sync indicator: (sessions, exercises, set records,
/// queue items) still waiting on the remote.
pub async fn count_unsynced(pool: &SqlitePool) -> Result<(i64, i64, i64, i64)> {
    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE synced = 0")
        .fetch_one(pool)
        .await?;
    let exercises: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM session_exercises WHERE synced = 0")
            .fetch_one(pool)
            .await?;
    let sets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM set_records WHERE synced = 0")
        .fetch_one(pool)
        .await?;
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    Ok((sessions, exercises, sets, queued))
}

/// Marks the record behind a successful queue create/update as synced, but
/// only once no further queued mutation for it remains. Deletes need
/// nothing; the local row is already gone.
pub async fn mark_entity_synced(
    pool: &SqlitePool,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<()> {
    match entity_type {
        EntityType::Session => {
            sqlx::query(
                "UPDATE sessions SET synced = 1 WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM sync_queue WHERE entity_id = ?1)",
            )
            .bind(entity_id)
            .execute(pool)
            .await?;
            Ok(())
        }
        EntityType::Exercise => mark_exercise_synced(pool, entity_id).await,
        EntityType::Set => mark_set_record_synced(pool, entity_id).await,
    }
}
