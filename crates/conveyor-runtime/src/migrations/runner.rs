//! Migration runner.
//!
//! Several workers may start at once against an empty broker, so the runner
//! serializes on a session-level advisory lock held on one connection.

use std::collections::HashSet;

use conveyor_core::{ConveyorError, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info, warn};

/// "CONVEYOR" in ASCII.
const MIGRATION_LOCK_ID: i64 = 0x434F_4E56_4559_4F52;

#[derive(Debug, Clone)]
pub struct Migration {
    /// Ordering key, e.g. `0001_conveyor_broker`.
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Executable statements, without comment-only fragments.
    pub fn statements(&self) -> Vec<&str> {
        split_statements(&self.sql)
    }
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every built-in migration not yet recorded. Returns the names applied.
    pub async fn run(&self) -> Result<Vec<String>> {
        self.run_with(super::builtin::builtin_migrations()).await
    }

    pub async fn run_with(&self, migrations: Vec<Migration>) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await.map_err(database("acquire connection"))?;

        debug!("Acquiring migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
            .map_err(database("acquire migration lock"))?;

        let result = apply_pending(&mut conn, migrations).await;

        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    /// Names of the migrations already applied.
    pub async fn applied(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM conveyor_migrations ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(database("list applied migrations"))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

async fn apply_pending(
    conn: &mut PoolConnection<Postgres>,
    mut migrations: Vec<Migration>,
) -> Result<Vec<String>> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conveyor_migrations (
            name VARCHAR(255) PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut **conn)
    .await
    .map_err(database("create migrations table"))?;

    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM conveyor_migrations")
        .fetch_all(&mut **conn)
        .await
        .map_err(database("list applied migrations"))?;
    let applied: HashSet<String> = rows.into_iter().map(|(name,)| name).collect();

    migrations.sort_by(|a, b| a.name.cmp(&b.name));

    let mut done = Vec::new();
    for migration in migrations.iter().filter(|m| !applied.contains(&m.name)) {
        info!(migration = %migration.name, "Applying migration");

        let mut tx = sqlx::Connection::begin(&mut **conn)
            .await
            .map_err(database("begin migration"))?;
        for statement in migration.statements() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    ConveyorError::Database(format!(
                        "Failed to apply migration '{}': {}",
                        migration.name, e
                    ))
                })?;
        }
        sqlx::query("INSERT INTO conveyor_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await
            .map_err(database("record migration"))?;
        tx.commit().await.map_err(database("commit migration"))?;

        done.push(migration.name.clone());
    }

    if done.is_empty() {
        debug!("Broker schema up to date");
    }
    Ok(done)
}

fn database(action: &'static str) -> impl Fn(sqlx::Error) -> ConveyorError {
    move |e| ConveyorError::Database(format!("Failed to {}: {}", action, e))
}

/// Split a script on top-level semicolons.
///
/// Semicolons inside quotes, dollar-quoted bodies and comments do not split.
fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'$' => {
                if let Some(len) = dollar_tag_len(&bytes[i..]) {
                    let tag = &sql[i..i + len];
                    let body = i + len;
                    i = match sql[body..].find(tag) {
                        Some(end) => body + end + len - 1,
                        None => bytes.len(),
                    };
                }
            }
            b';' => {
                push_statement(&mut statements, &sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < bytes.len() {
        push_statement(&mut statements, &sql[start..]);
    }
    statements
}

/// Length of a `$tag$` opener at the start of `bytes`.
fn dollar_tag_len(bytes: &[u8]) -> Option<usize> {
    let mut j = 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1)
}

fn push_statement<'a>(statements: &mut Vec<&'a str>, fragment: &'a str) {
    let fragment = fragment.trim();
    let has_code = fragment.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    });
    if has_code {
        statements.push(fragment);
    }
}
