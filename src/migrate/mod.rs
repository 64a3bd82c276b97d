use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applies all pending forward migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
/// Embeds SQL files from `src/migrate/sql/` and applies them in order.
pub fn up(conn: &Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (start_version, dirty) = current_version(conn)?;

    if dirty {
        anyhow::bail!("migration version {start_version} is dirty, manual intervention required");
    }

    tracing::info!(current_version = start_version, "running migrations");

    let mut applied = 0u32;

    for migration in MIGRATIONS {
        if migration.version <= start_version {
            continue;
        }

        tracing::info!(version = migration.version, "applying migration");

        // Mark as dirty before applying.
        set_version(conn, migration.version, true)?;

        execute_sql(conn, migration.up_sql)
            .with_context(|| format!("applying migration version {}", migration.version))?;

        // Mark as clean.
        set_version(conn, migration.version, false)?;

        applied += 1;
    }

    if applied == 0 {
        tracing::info!("no pending migrations");
    } else {
        let (final_version, _) = current_version(conn)?;
        tracing::info!(version = final_version, applied, "migrations completed");
    }

    Ok(())
}

/// Rolls back the last applied migration.
pub fn down(conn: &Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (current, _) = current_version(conn)?;

    if current == 0 {
        tracing::info!("no migrations to roll back");
        return Ok(());
    }

    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == current)
        .with_context(|| format!("migration version {current} not found"))?;

    tracing::info!(version = current, "rolling back migration");

    set_version(conn, current, true)?;

    execute_sql(conn, migration.down_sql)
        .with_context(|| format!("rolling back migration version {current}"))?;

    // Set version to previous migration.
    let prev_version = MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0);

    if prev_version == 0 {
        conn.execute("DELETE FROM schema_migrations", [])
            .context("clearing schema_migrations after rollback")?;
    } else {
        set_version(conn, prev_version, false)?;
    }

    tracing::info!(version = prev_version, "rollback completed");

    Ok(())
}

/// Returns the current migration version and dirty flag.
pub fn status(conn: &Connection) -> Result<(u32, bool)> {
    ensure_migrations_table(conn)?;
    current_version(conn)
}

/// Ensures the schema_migrations tracking table exists.
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER NOT NULL,
            dirty INTEGER NOT NULL,
            sequence INTEGER NOT NULL
        )",
        [],
    )
    .context("creating schema_migrations table")?;

    Ok(())
}

/// Returns the current migration version and dirty state.
fn current_version(conn: &Connection) -> Result<(u32, bool)> {
    let row = conn
        .query_row(
            "SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1",
            [],
            |row| {
                let version: u32 = row.get(0)?;
                let dirty: i64 = row.get(1)?;
                Ok((version, dirty != 0))
            },
        )
        .optional()
        .context("querying migration version")?;

    Ok(row.unwrap_or((0, false)))
}

/// Sets the migration version in the tracking table.
fn set_version(conn: &Connection, version: u32, dirty: bool) -> Result<()> {
    // Clear and re-insert (matches golang-migrate behavior).
    conn.execute("DELETE FROM schema_migrations", [])
        .context("clearing schema_migrations")?;

    conn.execute(
        "INSERT INTO schema_migrations (version, dirty, sequence) VALUES (?1, ?2, 1)",
        params![version, dirty as i64],
    )
    .context("inserting migration version")?;

    Ok(())
}

/// Splits a SQL string into individual statements and executes each.
fn execute_sql(conn: &Connection, sql: &str) -> Result<()> {
    for statement in split_statements(sql) {
        conn.execute_batch(statement).with_context(|| {
            let preview: String = statement.chars().take(80).collect();
            format!("executing migration statement: {preview}...")
        })?;
    }

    Ok(())
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        Connection::open_in_memory().expect("in-memory database")
    }

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id INTEGER); CREATE TABLE bar (id INTEGER);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_with_whitespace() {
        let sql = "
            SELECT 1;

            SELECT 2;

        ";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_split_statements_empty() {
        let stmts = split_statements("");
        assert!(stmts.is_empty());
    }

    #[test]
    fn test_migrations_embedded() {
        // Verify that embedded SQL files are non-empty.
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(
                !m.up_sql.is_empty(),
                "migration {} up SQL is empty",
                m.version
            );
            assert!(
                !m.down_sql.is_empty(),
                "migration {} down SQL is empty",
                m.version
            );
        }
    }

    #[test]
    fn test_migrations_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[0].version < window[1].version,
                "migrations not in order: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn test_up_applies_all_and_records_version() {
        let conn = open();
        up(&conn).expect("migrations apply");

        let (version, dirty) = status(&conn).expect("status");
        assert_eq!(version, MIGRATIONS.last().expect("non-empty").version);
        assert!(!dirty);

        for table in [
            "test_papers",
            "questions_asked",
            "test_papers_monthly",
            "questions_weekly",
            "question_usage_daily",
            "daily_activity",
            "weekly_activity",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("sqlite_master query");
            assert_eq!(count, 1, "table {table} missing");
        }
    }

    #[test]
    fn test_up_is_idempotent() {
        let conn = open();
        up(&conn).expect("first run");
        up(&conn).expect("second run is a no-op");
    }

    #[test]
    fn test_up_reapplies_after_down() {
        let conn = open();
        up(&conn).expect("first apply");
        down(&conn).expect("rollback");
        up(&conn).expect("re-apply from version zero");

        let (version, dirty) = status(&conn).expect("status");
        assert_eq!(version, MIGRATIONS.last().expect("non-empty").version);
        assert!(!dirty);
    }

    #[test]
    fn test_down_rolls_back_to_zero() {
        let conn = open();
        up(&conn).expect("migrations apply");
        down(&conn).expect("rollback");

        let (version, dirty) = status(&conn).expect("status");
        assert_eq!(version, 0);
        assert!(!dirty);
    }

    #[test]
    fn test_up_refuses_dirty_state() {
        let conn = open();
        ensure_migrations_table(&conn).expect("tracking table");
        set_version(&conn, 1, true).expect("mark dirty");

        let err = up(&conn).expect_err("dirty state must refuse to run");
        assert!(err.to_string().contains("dirty"));
    }
}
