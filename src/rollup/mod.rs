use anyhow::Result;
use chrono::{Days, NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::ActivityConfig;
use crate::counter::{self, CounterStore, ACTIVITY_PREFIX};
use crate::event::EventKind;
use crate::health::PipelineMetrics;
use crate::store::{week_start, ActivityDay, RollupOutcome, Store};

/// Outcome of one counter-sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Keys mirrored into daily_activity.
    pub synced: usize,
    /// Keys skipped because they could not be parsed.
    pub skipped: usize,
    /// Pages that failed to commit.
    pub failed_pages: usize,
}

/// Outcome of one weekly activity rollup + retention run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityRollupOutcome {
    /// Weekly rows written across both weeks.
    pub rows_upserted: usize,
    /// Batches that failed and were skipped.
    pub failed_batches: usize,
    /// Daily rows pruned.
    pub pruned: usize,
    /// Prune chunks that failed; their rows wait for the next run.
    pub failed_chunks: usize,
}

/// Compacts raw events of `kind` that have aged past `retention` into
/// the kind's rollup table. One transaction; a failure leaves the raw
/// table intact for the next tick.
pub fn run_event_rollup(
    store: &Store,
    metrics: &PipelineMetrics,
    kind: EventKind,
    retention: std::time::Duration,
) -> Result<RollupOutcome> {
    let cutoff = Utc::now().naive_utc()
        - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());

    let outcome = store.rollup_events(kind, cutoff)?;

    metrics
        .rows_compacted
        .with_label_values(&[kind.as_str()])
        .inc_by(outcome.raw_deleted as f64);
    info!(
        kind = %kind,
        groups = outcome.groups,
        raw_deleted = outcome.raw_deleted,
        "event rollup completed"
    );

    Ok(outcome)
}

/// Folds all pending questions into per-user daily usage counts, keyed
/// by today's date.
pub fn run_question_usage_fold(store: &Store, metrics: &PipelineMetrics) -> Result<RollupOutcome> {
    let outcome = store.fold_question_usage(Utc::now().date_naive())?;

    metrics
        .rows_compacted
        .with_label_values(&["question_usage"])
        .inc_by(outcome.raw_deleted as f64);
    info!(
        groups = outcome.groups,
        raw_deleted = outcome.raw_deleted,
        "question usage fold completed"
    );

    Ok(outcome)
}

/// Mirrors activity counters into `daily_activity`, one page at a time.
///
/// A failed page is logged and skipped; earlier pages stay committed.
/// Overwrite semantics make re-yielded keys harmless.
pub fn sync_counters(
    store: &Store,
    counters: &CounterStore,
    metrics: &PipelineMetrics,
    page_size: usize,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();
    let mut cursor: Option<String> = None;

    loop {
        let (page, next) = counters.scan_prefix(ACTIVITY_PREFIX, cursor.as_deref(), page_size);
        if page.is_empty() && next.is_none() {
            break;
        }

        let mut rows = Vec::with_capacity(page.len());
        for (key, seconds) in &page {
            match counter::parse_activity_key(key) {
                Some((student_id, subject, day)) => rows.push(ActivityDay {
                    student_id,
                    subject,
                    day,
                    seconds_active: *seconds,
                }),
                None => {
                    outcome.skipped += 1;
                    metrics.counters_skipped.inc();
                    warn!(key = %key, "skipping unparseable activity key");
                }
            }
        }

        match store.upsert_daily_activity(&rows) {
            Ok(()) => {
                outcome.synced += rows.len();
                metrics.counters_synced.inc_by(rows.len() as f64);
            }
            Err(e) => {
                outcome.failed_pages += 1;
                warn!(error = %e, page_len = rows.len(), "counter sync page failed");
            }
        }

        cursor = match next {
            Some(c) => Some(c),
            None => break,
        };
    }

    metrics.counter_entries.set(counters.len() as f64);
    info!(
        synced = outcome.synced,
        skipped = outcome.skipped,
        "counter sync completed"
    );

    Ok(outcome)
}

/// Recomputes weekly activity for last week and the current week, then
/// prunes daily rows older than the current week.
pub fn run_activity_rollup(
    store: &Store,
    metrics: &PipelineMetrics,
    cfg: &ActivityConfig,
) -> Result<ActivityRollupOutcome> {
    let today = Utc::now().date_naive();
    run_activity_rollup_at(store, metrics, cfg, today)
}

/// Like [`run_activity_rollup`] but anchored to an explicit date, so the
/// week arithmetic is testable.
pub fn run_activity_rollup_at(
    store: &Store,
    metrics: &PipelineMetrics,
    cfg: &ActivityConfig,
    today: NaiveDate,
) -> Result<ActivityRollupOutcome> {
    let this_week = week_start(today);
    let last_week = this_week - Days::new(7);

    let mut outcome = ActivityRollupOutcome::default();

    for week in [last_week, this_week] {
        let groups = store.weekly_activity_groups(week)?;
        for batch in groups.chunks(cfg.weekly_batch_size) {
            match store.upsert_weekly_activity(week, batch) {
                Ok(()) => outcome.rows_upserted += batch.len(),
                Err(e) => {
                    outcome.failed_batches += 1;
                    warn!(week = %week, error = %e, "weekly activity batch failed");
                }
            }
        }
    }

    // Retention: daily rows before the current week are covered by a
    // stable weekly row and can go.
    loop {
        let ids = store.stale_daily_activity_ids(this_week, cfg.prune_chunk_size)?;
        if ids.is_empty() {
            break;
        }
        match store.delete_daily_activity(&ids) {
            Ok(deleted) => {
                outcome.pruned += deleted;
                metrics.activity_pruned.inc_by(deleted as f64);
                if deleted == 0 {
                    break;
                }
            }
            Err(e) => {
                outcome.failed_chunks += 1;
                warn!(error = %e, chunk_len = ids.len(), "activity prune chunk failed");
                // The next select would yield the same ids; stop here and
                // leave the remainder for the next run.
                break;
            }
        }
    }

    info!(
        rows_upserted = outcome.rows_upserted,
        pruned = outcome.pruned,
        "activity rollup completed"
    );

    Ok(outcome)
}
