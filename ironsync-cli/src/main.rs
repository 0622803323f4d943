use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::warn;

use ironsync::app::{SyncConfig, SyncContext};
use ironsync::db::SqlitePool;
use ironsync::db::models::{
    EntityType, OperationType, QueueItem, Session, SessionExercise, SessionStatus, SetRecord, now,
};
use ironsync::db::operations::{
    abandon_session, complete_session, count_unsynced, enqueue, get_current_session,
    get_exercises_for_session, get_queue_items, get_set_records_for_exercise, insert_set_record,
    pause_session, record_exercise_set_completed, resume_session, upsert_session,
    upsert_session_exercise,
};
use ironsync::sync::{MAX_RETRIES, SyncStatus};

#[derive(Parser, Debug)]
#[command(version, about = "ironsync - offline-first workout session tracker", long_about = None)]
struct Args {
    /// Path to the local store (env: IRONSYNC_DB)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Base URL of the hosted API (env: IRONSYNC_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a workout session from an assigned plan
    Start {
        #[arg(long)]
        athlete: String,
        #[arg(long)]
        plan: String,
        #[arg(long)]
        assignment: Option<String>,
        /// Planned exercise as NAME:SETS:REPS[:WEIGHT]; repeatable
        #[arg(long = "exercise", value_name = "SPEC")]
        exercises: Vec<String>,
    },
    /// Log one completed set against the current session
    Log {
        #[arg(long)]
        exercise: String,
        #[arg(long)]
        reps: i64,
        #[arg(long)]
        weight: Option<f64>,
        #[arg(long)]
        rpe: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Pause the current session
    Pause,
    /// Resume the current session
    Resume,
    /// Complete the current session
    Complete,
    /// Abandon the current session
    Abandon,
    /// Show the current session and what is still unsynced
    Status,
    /// List pending and stale queue items
    Queue,
    /// Probe connectivity and run one sync pass
    Sync,
}

fn config_from(args: &Args) -> SyncConfig {
    let mut config = SyncConfig::default();
    if let Some(db) = args.db.clone().or_else(|| std::env::var("IRONSYNC_DB").ok()) {
        config.db_path = db;
    }
    if let Some(url) = args
        .api_url
        .clone()
        .or_else(|| std::env::var("IRONSYNC_API_URL").ok())
    {
        config.api_base_url = url;
    }
    config
}

fn parse_exercise_spec(spec: &str) -> Result<(String, i64, i64, Option<f64>)> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        bail!("exercise spec must be NAME:SETS:REPS[:WEIGHT], got '{}'", spec);
    }
    let sets = parts[1]
        .parse::<i64>()
        .with_context(|| format!("bad set count in '{}'", spec))?;
    let reps = parts[2]
        .parse::<i64>()
        .with_context(|| format!("bad rep count in '{}'", spec))?;
    let weight = match parts.get(3) {
        Some(w) => Some(
            w.parse::<f64>()
                .with_context(|| format!("bad weight in '{}'", spec))?,
        ),
        None => None,
    };
    Ok((parts[0].to_string(), sets, reps, weight))
}

fn slugify(name: &str) -> String {
    name.to_lowercase().replace(char::is_whitespace, "-")
}

fn exercise_payload(exercise: &SessionExercise) -> serde_json::Value {
    serde_json::json!({
        "id": exercise.id,
        "session_id": exercise.session_id,
        "exercise_id": exercise.exercise_id,
        "exercise_name": exercise.exercise_name,
        "order_index": exercise.order_index,
        "target_sets": exercise.target_sets,
        "target_reps": exercise.target_reps,
        "target_weight": exercise.target_weight,
    })
}

async fn require_current_session(pool: &SqlitePool) -> Result<Session> {
    get_current_session(pool)
        .await?
        .ok_or_else(|| anyhow!("No active session; run `ironsync start` first"))
}

async fn cmd_start(
    context: &SyncContext,
    athlete: &str,
    plan: &str,
    assignment: Option<String>,
    specs: &[String],
) -> Result<()> {
    if let Some(existing) = get_current_session(&context.pool).await? {
        bail!(
            "Session {} is still {}; complete or abandon it first",
            existing.id,
            existing.status
        );
    }

    let session = Session::new(athlete, plan, assignment);
    upsert_session(&context.pool, &session).await?;

    for (index, spec) in specs.iter().enumerate() {
        let (name, sets, reps, weight) = parse_exercise_spec(spec)?;
        let exercise = SessionExercise::new(
            &session.id,
            &slugify(&name),
            &name,
            index as i64,
            sets,
            reps,
            weight,
        );
        upsert_session_exercise(&context.pool, &exercise).await?;
        // Exercises have no fast sync path; their creation rides the queue.
        let item = QueueItem::new(
            OperationType::Create,
            EntityType::Exercise,
            &exercise.id,
            &exercise_payload(&exercise),
        );
        enqueue(&context.pool, &item).await?;
    }

    println!("Started session {} ({} exercises planned)", session.id, specs.len());
    Ok(())
}

async fn cmd_log(
    context: &SyncContext,
    name: &str,
    reps: i64,
    weight: Option<f64>,
    rpe: Option<f64>,
    notes: Option<String>,
) -> Result<()> {
    let session = require_current_session(&context.pool).await?;
    if session.status != SessionStatus::Active {
        bail!("Session {} is paused; resume it before logging", session.id);
    }

    let exercises = get_exercises_for_session(&context.pool, &session.id).await?;
    let exercise = match exercises
        .iter()
        .find(|e| e.exercise_name.eq_ignore_ascii_case(name))
    {
        Some(existing) => existing.clone(),
        None => {
            // Not in the plan; add it on the fly, queued like any other
            // exercise create.
            let exercise = SessionExercise::new(
                &session.id,
                &slugify(name),
                name,
                exercises.len() as i64,
                0,
                0,
                None,
            );
            upsert_session_exercise(&context.pool, &exercise).await?;
            let item = QueueItem::new(
                OperationType::Create,
                EntityType::Exercise,
                &exercise.id,
                &exercise_payload(&exercise),
            );
            enqueue(&context.pool, &item).await?;
            exercise
        }
    };

    let done = get_set_records_for_exercise(&context.pool, &exercise.id).await?;
    let set_number = done.len() as i64 + 1;
    let mut record = SetRecord::new(&session.id, &exercise.id, set_number, reps, weight, rpe);
    record.notes = notes;
    insert_set_record(&context.pool, &record).await?;

    let finished = exercise.target_sets > 0 && set_number >= exercise.target_sets;
    record_exercise_set_completed(&context.pool, &exercise.id, finished).await?;

    let weight_str = weight.map(|w| format!(" @ {:.1}kg", w)).unwrap_or_default();
    let rpe_str = rpe.map(|r| format!(" RPE {:.1}", r)).unwrap_or_default();
    println!(
        "{}: set {} x {} reps{}{} (unsynced until next pass)",
        exercise.exercise_name, set_number, reps, weight_str, rpe_str
    );
    Ok(())
}

async fn cmd_status(context: &SyncContext) -> Result<()> {
    match get_current_session(&context.pool).await? {
        Some(session) => {
            println!(
                "Session {} [{}] athlete={} plan={} started_at={}",
                session.id, session.status, session.athlete_id, session.workout_plan_id,
                session.started_at
            );
            for exercise in get_exercises_for_session(&context.pool, &session.id).await? {
                println!(
                    "  {} - {}/{} sets{}",
                    exercise.exercise_name,
                    exercise.sets_completed,
                    exercise.target_sets,
                    if exercise.is_completed { " (done)" } else { "" }
                );
            }
        }
        None => println!("No active session"),
    }

    let (sessions, exercises, sets, queued) = count_unsynced(&context.pool).await?;
    println!(
        "Unsynced: {} sessions, {} exercises, {} set records, {} queue items",
        sessions, exercises, sets, queued
    );
    Ok(())
}

async fn cmd_queue(context: &SyncContext) -> Result<()> {
    let items = get_queue_items(&context.pool).await?;
    if items.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for item in items {
        let state = if item.attempts >= MAX_RETRIES {
            "stale"
        } else {
            "pending"
        };
        println!(
            "{} {:?} {:?} {} attempts={} {}",
            state,
            item.operation_type,
            item.entity_type,
            item.entity_id,
            item.attempts,
            item.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_sync(context: &SyncContext) -> Result<()> {
    if !context.monitor.check_connectivity().await {
        warn!("API unreachable; records stay local");
        println!("Offline - nothing synced");
        return Ok(());
    }

    let _sub = context.engine.subscribe_status(|status| {
        if let SyncStatus::Syncing(Some(progress)) = status {
            println!("  {}/{}", progress.current, progress.total);
        }
    });

    context.engine.sync_now().await;
    match context.engine.status() {
        SyncStatus::Error => println!("Sync pass failed; will retry on the next trigger"),
        _ => {
            let (sessions, exercises, sets, queued) = count_unsynced(&context.pool).await?;
            println!(
                "Sync pass complete. Still unsynced: {} sessions, {} exercises, {} sets, {} queue items",
                sessions, exercises, sets, queued
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = config_from(&args);
    let context = SyncContext::open(&config).await.map_err(|e| {
        // Without the local store there is no offline capability at all; a
        // real client would degrade to online-only mode here.
        anyhow!("offline store unavailable: {:#}", e)
    })?;

    let result = match &args.command {
        Commands::Start {
            athlete,
            plan,
            assignment,
            exercises,
        } => cmd_start(&context, athlete, plan, assignment.clone(), exercises).await,
        Commands::Log {
            exercise,
            reps,
            weight,
            rpe,
            notes,
        } => cmd_log(&context, exercise, *reps, *weight, *rpe, notes.clone()).await,
        Commands::Pause => {
            let session = require_current_session(&context.pool).await?;
            pause_session(&context.pool, &session.id).await?;
            println!("Paused session {}", session.id);
            Ok(())
        }
        Commands::Resume => {
            let session = require_current_session(&context.pool).await?;
            resume_session(&context.pool, &session.id).await?;
            println!("Resumed session {}", session.id);
            Ok(())
        }
        Commands::Complete => {
            let session = require_current_session(&context.pool).await?;
            let duration = (now() - session.started_at).max(0);
            complete_session(&context.pool, &session.id, duration).await?;
            println!("Completed session {} ({}s)", session.id, duration);
            Ok(())
        }
        Commands::Abandon => {
            let session = require_current_session(&context.pool).await?;
            abandon_session(&context.pool, &session.id).await?;
            println!("Abandoned session {}", session.id);
            Ok(())
        }
        Commands::Status => cmd_status(&context).await,
        Commands::Queue => cmd_queue(&context).await,
        Commands::Sync => cmd_sync(&context).await,
    };

    context.stop().await;
    result
}
