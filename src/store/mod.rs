use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::event::{EventKind, NewEvent};
use crate::migrate;

/// Aggregation bucket width for the raw-to-rollup jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Monthly,
    Weekly,
}

impl Period {
    /// Truncates a timestamp to its bucket start date: the first of the
    /// month, or the Monday of the week.
    pub fn bucket(self, t: NaiveDateTime) -> NaiveDate {
        let date = t.date();
        match self {
            // with_day(1) cannot fail: day 1 exists in every month.
            Self::Monthly => date.with_day(1).unwrap_or(date),
            Self::Weekly => week_start(date),
        }
    }
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let back = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(back)).unwrap_or(date)
}

/// Outcome of one aggregation run, for logs and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupOutcome {
    /// Distinct group rows upserted into the rollup table.
    pub groups: usize,
    /// Raw rows deleted after aggregation.
    pub raw_deleted: usize,
}

/// One daily-activity row mirrored out of the counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDay {
    pub student_id: String,
    pub subject: String,
    pub day: NaiveDate,
    pub seconds_active: i64,
}

/// One (student, subject) group summed over a week of daily rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyGroup {
    pub student_id: String,
    pub subject: String,
    pub seconds_active: i64,
}

/// Durable SQLite store for raw events, rollups, and activity tables.
///
/// The connection sits behind a mutex because `rusqlite::Connection` is
/// `!Send`; every operation takes the lock for one transaction and
/// releases it before any await point in the caller.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies pragmas.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database. Used by tests and local runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("opening in-memory database")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("setting busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("applying pragmas")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Applies all pending schema migrations.
    pub fn migrate(&self) -> Result<()> {
        migrate::up(&self.conn.lock())
    }

    /// Rolls back the most recent schema migration.
    pub fn migrate_down(&self) -> Result<()> {
        migrate::down(&self.conn.lock())
    }

    /// Returns the current schema version and dirty flag.
    pub fn migration_status(&self) -> Result<(u32, bool)> {
        migrate::status(&self.conn.lock())
    }

    /// Persists a raw event. Returns false when the idempotency key was
    /// already present; the duplicate delivery is a no-op.
    pub fn insert_event(&self, kind: EventKind, ev: &NewEvent) -> Result<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO {}
                (event_id, user_id, profile_id, class_name, subject, data, event_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            kind.raw_table()
        );

        let inserted = self
            .conn
            .lock()
            .execute(
                &sql,
                params![
                    ev.event_id,
                    ev.user_id,
                    ev.profile_id,
                    ev.class_name,
                    ev.subject,
                    ev.data,
                    ev.event_time,
                ],
            )
            .with_context(|| format!("inserting into {}", kind.raw_table()))?;

        Ok(inserted > 0)
    }

    /// Compacts raw events older than `cutoff` into the kind's rollup
    /// table (monthly buckets for test papers, weekly for questions).
    ///
    /// Upserts are additive and the aggregated raw rows are deleted in
    /// the same transaction, so a failed run leaves everything in place
    /// for the next tick and counts are conserved per bucket.
    pub fn rollup_events(&self, kind: EventKind, cutoff: NaiveDateTime) -> Result<RollupOutcome> {
        let (period, bucket_col) = match kind {
            EventKind::TestPaper => (Period::Monthly, "month_start"),
            EventKind::Question => (Period::Weekly, "week_start"),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting rollup transaction")?;

        let mut groups: BTreeMap<(String, String, NaiveDate), i64> = BTreeMap::new();
        {
            let select = format!(
                "SELECT class_name, subject, event_time FROM {} WHERE event_time < ?1",
                kind.raw_table()
            );
            let mut stmt = tx.prepare(&select).context("preparing rollup select")?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, NaiveDateTime>(2)?,
                    ))
                })
                .context("scanning raw events")?;

            for row in rows {
                let (class_name, subject, event_time) = row.context("reading raw event row")?;
                *groups
                    .entry((class_name, subject, period.bucket(event_time)))
                    .or_default() += 1;
            }
        }

        let upsert = format!(
            "INSERT INTO {table} (class_name, subject, {bucket_col}, count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (class_name, subject, {bucket_col})
             DO UPDATE SET
                 count = count + excluded.count,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%f', 'now')",
            table = kind.rollup_table(),
        );
        for ((class_name, subject, bucket), count) in &groups {
            tx.execute(&upsert, params![class_name, subject, bucket, count])
                .with_context(|| format!("upserting into {}", kind.rollup_table()))?;
        }

        let raw_deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE event_time < ?1", kind.raw_table()),
                params![cutoff],
            )
            .context("deleting aggregated raw events")?;

        tx.commit().context("committing rollup transaction")?;

        Ok(RollupOutcome {
            groups: groups.len(),
            raw_deleted,
        })
    }

    /// Folds the entire `questions_asked` table into per-user daily usage
    /// counts keyed by `day`.
    ///
    /// A rowid watermark is snapshotted first and both the aggregation
    /// and the deletion stop at it, so rows ingested while the fold runs
    /// survive for the next run.
    pub fn fold_question_usage(&self, day: NaiveDate) -> Result<RollupOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting fold transaction")?;

        let watermark: Option<i64> = tx
            .query_row("SELECT MAX(id) FROM questions_asked", [], |row| row.get(0))
            .context("snapshotting fold watermark")?;
        let Some(watermark) = watermark else {
            return Ok(RollupOutcome::default());
        };

        let mut groups = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "SELECT user_id, profile_id, class_name, subject, COUNT(*)
                     FROM questions_asked
                     WHERE id <= ?1
                     GROUP BY user_id, profile_id, class_name, subject",
                )
                .context("preparing fold select")?;
            let rows = stmt
                .query_map(params![watermark], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .context("grouping question usage")?;

            for row in rows {
                let (user_id, profile_id, class_name, subject, count) =
                    row.context("reading usage group")?;
                tx.execute(
                    "INSERT INTO question_usage_daily
                        (user_id, profile_id, class_name, subject, day, count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (user_id, profile_id, class_name, subject, day)
                     DO UPDATE SET
                         count = count + excluded.count,
                         updated_at = strftime('%Y-%m-%dT%H:%M:%f', 'now')",
                    params![user_id, profile_id, class_name, subject, day, count],
                )
                .context("upserting question usage")?;
                groups += 1;
            }
        }

        let raw_deleted = tx
            .execute(
                "DELETE FROM questions_asked WHERE id <= ?1",
                params![watermark],
            )
            .context("deleting folded questions")?;

        tx.commit().context("committing fold transaction")?;

        Ok(RollupOutcome {
            groups,
            raw_deleted,
        })
    }

    /// Mirrors one page of counter values into `daily_activity`.
    ///
    /// Overwrite semantics: the counter holds the authoritative running
    /// total for the day, so re-syncing a key is harmless.
    pub fn upsert_daily_activity(&self, rows: &[ActivityDay]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("starting daily-activity transaction")?;

        for row in rows {
            tx.execute(
                "INSERT INTO daily_activity (student_id, subject, day, seconds_active)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (student_id, subject, day)
                 DO UPDATE SET
                     seconds_active = excluded.seconds_active,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%f', 'now')",
                params![row.student_id, row.subject, row.day, row.seconds_active],
            )
            .context("upserting daily activity")?;
        }

        tx.commit().context("committing daily activity")
    }

    /// Sums daily activity over [week_start, week_start+6] grouped by
    /// (student, subject).
    pub fn weekly_activity_groups(&self, week_start: NaiveDate) -> Result<Vec<WeeklyGroup>> {
        let week_end = week_start + Days::new(6);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT student_id, subject, SUM(seconds_active)
                 FROM daily_activity
                 WHERE day >= ?1 AND day <= ?2
                 GROUP BY student_id, subject
                 ORDER BY student_id, subject",
            )
            .context("preparing weekly grouping")?;

        let rows = stmt
            .query_map(params![week_start, week_end], |row| {
                Ok(WeeklyGroup {
                    student_id: row.get(0)?,
                    subject: row.get(1)?,
                    seconds_active: row.get(2)?,
                })
            })
            .context("grouping weekly activity")?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row.context("reading weekly group")?);
        }
        Ok(groups)
    }

    /// Overwrite-upserts one batch of weekly rollup rows for the week
    /// starting at `week_start`.
    pub fn upsert_weekly_activity(&self, week_start: NaiveDate, rows: &[WeeklyGroup]) -> Result<()> {
        let week_end = week_start + Days::new(6);
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("starting weekly-activity transaction")?;

        for row in rows {
            tx.execute(
                "INSERT INTO weekly_activity
                    (student_id, subject, week_start, week_end, seconds_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (student_id, subject, week_start)
                 DO UPDATE SET
                     seconds_active = excluded.seconds_active,
                     week_end = excluded.week_end,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%f', 'now')",
                params![
                    row.student_id,
                    row.subject,
                    week_start,
                    week_end,
                    row.seconds_active
                ],
            )
            .context("upserting weekly activity")?;
        }

        tx.commit().context("committing weekly activity")
    }

    /// Returns up to `limit` ids of daily-activity rows dated before
    /// `before`, oldest first. Used to prune in bounded chunks.
    pub fn stale_daily_activity_ids(&self, before: NaiveDate, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM daily_activity WHERE day < ?1 ORDER BY id LIMIT ?2")
            .context("preparing prune select")?;

        let rows = stmt
            .query_map(params![before, limit as i64], |row| row.get::<_, i64>(0))
            .context("selecting stale daily activity")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("reading stale row id")?);
        }
        Ok(ids)
    }

    /// Deletes the given daily-activity rows. Returns the number removed.
    pub fn delete_daily_activity(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting prune transaction")?;

        let mut deleted = 0usize;
        {
            let mut stmt = tx
                .prepare("DELETE FROM daily_activity WHERE id = ?1")
                .context("preparing prune delete")?;
            for id in ids {
                deleted += stmt.execute(params![id]).context("deleting daily row")?;
            }
        }

        tx.commit().context("committing prune")?;
        Ok(deleted)
    }

    /// Total test papers for a class/subject across both tiers: raw rows
    /// not yet aggregated plus the monthly rollup.
    pub fn total_test_papers(&self, class_name: &str, subject: &str) -> Result<i64> {
        self.tier_total(EventKind::TestPaper, class_name, subject)
    }

    /// Total questions for a class/subject across both tiers.
    pub fn total_questions(&self, class_name: &str, subject: &str) -> Result<i64> {
        self.tier_total(EventKind::Question, class_name, subject)
    }

    fn tier_total(&self, kind: EventKind, class_name: &str, subject: &str) -> Result<i64> {
        let conn = self.conn.lock();

        let raw: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE class_name = ?1 AND subject = ?2",
                    kind.raw_table()
                ),
                params![class_name, subject],
                |row| row.get(0),
            )
            .with_context(|| format!("counting raw {}", kind.raw_table()))?;

        // The sum spans all buckets.
        let rolled: i64 = conn
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(count), 0) FROM {}
                     WHERE class_name = ?1 AND subject = ?2",
                    kind.rollup_table()
                ),
                params![class_name, subject],
                |row| row.get(0),
            )
            .with_context(|| format!("summing {}", kind.rollup_table()))?;

        Ok(raw + rolled)
    }

    /// Count of raw rows currently awaiting aggregation.
    pub fn raw_event_count(&self, kind: EventKind) -> Result<i64> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", kind.raw_table()),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("counting {}", kind.raw_table()))
    }

    /// Rollup count for one (class, subject, bucket) row, if present.
    pub fn rollup_count(
        &self,
        kind: EventKind,
        class_name: &str,
        subject: &str,
        bucket: NaiveDate,
    ) -> Result<Option<i64>> {
        let bucket_col = match kind {
            EventKind::TestPaper => "month_start",
            EventKind::Question => "week_start",
        };
        self.conn
            .lock()
            .query_row(
                &format!(
                    "SELECT count FROM {} WHERE class_name = ?1 AND subject = ?2 AND {} = ?3",
                    kind.rollup_table(),
                    bucket_col
                ),
                params![class_name, subject, bucket],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("reading {}", kind.rollup_table()))
    }

    /// Per-user question usage summed across subjects for one day.
    pub fn question_usage_count(&self, user_id: &str, day: NaiveDate) -> Result<i64> {
        self.conn
            .lock()
            .query_row(
                "SELECT COALESCE(SUM(count), 0) FROM question_usage_daily
                 WHERE user_id = ?1 AND day = ?2",
                params![user_id, day],
                |row| row.get(0),
            )
            .context("reading question usage")
    }

    /// Mirrored activity seconds for one (student, subject, day) row.
    pub fn daily_activity_seconds(
        &self,
        student_id: &str,
        subject: &str,
        day: NaiveDate,
    ) -> Result<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT seconds_active FROM daily_activity
                 WHERE student_id = ?1 AND subject = ?2 AND day = ?3",
                params![student_id, subject, day],
                |row| row.get(0),
            )
            .optional()
            .context("reading daily activity")
    }

    /// Runs arbitrary SQL. Test hook for setting up failure conditions.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .context("executing raw sql")
    }

    /// Weekly rollup seconds for one (student, subject, week) row.
    pub fn weekly_activity_seconds(
        &self,
        student_id: &str,
        subject: &str,
        week_start: NaiveDate,
    ) -> Result<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT seconds_active FROM weekly_activity
                 WHERE student_id = ?1 AND subject = ?2 AND week_start = ?3",
                params![student_id, subject, week_start],
                |row| row.get(0),
            )
            .optional()
            .context("reading weekly activity")
    }
}
