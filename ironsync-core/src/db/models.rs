use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unix seconds; the store never deals in sub-second precision.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntityType {
    Session,
    Exercise,
    Set,
}

impl EntityType {
    /// REST collection name for queue dispatch.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Session => "sessions",
            EntityType::Exercise => "exercises",
            EntityType::Set => "sets",
        }
    }
}

/// One logged workout instance. Created locally at workout start and mutated
/// through pause/resume/complete/abandon before the remote ever sees it.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub athlete_id: String,
    pub workout_plan_id: String,
    pub assignment_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: i64,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub total_duration_seconds: i64,
    pub current_exercise_index: i64,
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub synced: bool,
}

impl Session {
    pub fn new(athlete_id: &str, workout_plan_id: &str, assignment_id: Option<String>) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            athlete_id: athlete_id.to_string(),
            workout_plan_id: workout_plan_id.to_string(),
            assignment_id,
            status: SessionStatus::Active,
            started_at: ts,
            paused_at: None,
            completed_at: None,
            total_duration_seconds: 0,
            current_exercise_index: 0,
            notes: None,
            created_at: ts,
            updated_at: ts,
            synced: false,
        }
    }
}

/// One exercise inside a session, seeded from the assigned plan.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SessionExercise {
    pub id: String,
    pub session_id: String,
    pub exercise_id: String,
    pub exercise_name: String,
    pub order_index: i64,
    pub target_sets: i64,
    pub target_reps: i64,
    pub target_weight: Option<f64>,
    pub weight_type: Option<String>,
    pub target_rest_seconds: Option<i64>,
    pub notes: Option<String>,
    pub is_completed: bool,
    pub sets_completed: i64,
    pub synced: bool,
}

impl SessionExercise {
    pub fn new(
        session_id: &str,
        exercise_id: &str,
        exercise_name: &str,
        order_index: i64,
        target_sets: i64,
        target_reps: i64,
        target_weight: Option<f64>,
    ) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.to_string(),
            exercise_id: exercise_id.to_string(),
            exercise_name: exercise_name.to_string(),
            order_index,
            target_sets,
            target_reps,
            target_weight,
            weight_type: None,
            target_rest_seconds: None,
            notes: None,
            is_completed: false,
            sets_completed: 0,
            synced: false,
        }
    }
}

/// One completed set. Immutable after creation except for the synced flag.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SetRecord {
    pub id: String,
    pub session_id: String,
    pub session_exercise_id: String,
    pub set_number: i64,
    pub reps_completed: i64,
    pub weight_used: Option<f64>,
    pub rpe: Option<f64>,
    pub notes: Option<String>,
    pub completed_at: i64,
    pub created_at: i64,
    pub synced: bool,
}

impl SetRecord {
    pub fn new(
        session_id: &str,
        session_exercise_id: &str,
        set_number: i64,
        reps_completed: i64,
        weight_used: Option<f64>,
        rpe: Option<f64>,
    ) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            session_id: session_id.to_string(),
            session_exercise_id: session_exercise_id.to_string(),
            set_number,
            reps_completed,
            weight_used,
            rpe,
            notes: None,
            completed_at: ts,
            created_at: ts,
            synced: false,
        }
    }
}

/// A pending mutation with no fast sync path (exercise creates, deletes, …).
/// Removed on successful dispatch; kept with an attempt count on failure.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueueItem {
    pub id: String,
    pub operation_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: String,
    pub created_at: i64,
    pub attempts: i64,
    pub last_attempt: Option<i64>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(
        operation_type: OperationType,
        entity_type: EntityType,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> Self {
        Self {
            id: new_id(),
            operation_type,
            entity_type,
            entity_id: entity_id.to_string(),
            payload: payload.to_string(),
            created_at: now(),
            attempts: 0,
            last_attempt: None,
            error: None,
        }
    }
}
