//! Durable local store. `open` is idempotent: it creates the database file on
//! first use and applies the embedded migration list additively; nothing is
//! ever dropped on a version bump. An open failure should push the caller
//! into online-only mode, not abort the process.

pub mod models;
pub mod operations;

pub use sqlx::SqlitePool;

use anyhow::Result;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

struct Migration {
    name: &'static str,
    up_sql: &'static str,
}

const MIGRATION_2026_03_02_101500_0000_SETUP_TABLES: &str =
    include_str!("../../migrations/2026-03-02-101500-0000_setup_tables/up.sql");
const MIGRATION_2026_03_19_084200_0000_QUEUE_ATTEMPTS_INDEX: &str =
    include_str!("../../migrations/2026-03-19-084200-0000_queue_attempts_index/up.sql");

// Append-only. Renaming or reordering entries would re-run history on
// existing installs.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "2026-03-02-101500-0000_setup_tables",
        up_sql: MIGRATION_2026_03_02_101500_0000_SETUP_TABLES,
    },
    Migration {
        name: "2026-03-19-084200-0000_queue_attempts_index",
        up_sql: MIGRATION_2026_03_19_084200_0000_QUEUE_ATTEMPTS_INDEX,
    },
];

/// Open (creating if missing) the store at `path` and bring its schema up to
/// date.
pub async fn open(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open local store at {}: {}", path, e))?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    init_database(&pool).await?;
    Ok(pool)
}

/// In-memory store with the full schema. Single connection, since each
/// `:memory:` connection is its own database.
pub async fn open_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_database(&pool).await?;
    Ok(pool)
}

async fn init_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER NOT NULL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s','now') AS INTEGER))
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn is_migration_applied(pool: &SqlitePool, migration_name: &str) -> Result<bool> {
    let result =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _migrations WHERE name = ?1")
            .bind(migration_name)
            .fetch_one(pool)
            .await?;
    Ok(result > 0)
}

async fn mark_migration_applied(pool: &SqlitePool, migration_name: &str) -> Result<()> {
    sqlx::query("INSERT INTO _migrations (name) VALUES (?1)")
        .bind(migration_name)
        .execute(pool)
        .await?;
    Ok(())
}

fn parse_sql_statements(sql: &str) -> Vec<String> {
    sql.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn init_database(pool: &SqlitePool) -> Result<()> {
    init_migrations_table(pool).await?;

    for migration in MIGRATIONS {
        if is_migration_applied(pool, migration.name).await? {
            debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        info!("Applying migration: {}", migration.name);
        for statement in parse_sql_statements(migration.up_sql) {
            sqlx::query(&statement).execute(pool).await.map_err(|e| {
                anyhow::anyhow!(
                    "Failed to execute migration statement in {}: {} - Error: {}",
                    migration.name,
                    statement,
                    e
                )
            })?;
        }

        mark_migration_applied(pool, migration.name).await?;
        info!("Migration {} applied successfully", migration.name);
    }

    Ok(())
}
