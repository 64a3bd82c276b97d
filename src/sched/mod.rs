use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::counter::CounterStore;
use crate::event::EventKind;
use crate::health::PipelineMetrics;
use crate::rollup;
use crate::store::Store;

/// When a job fires relative to the previous fire time. All calendar
/// cadences are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval.
    Every(Duration),
    /// Once a day at hour:minute.
    DailyAt { hour: u32, minute: u32 },
    /// Once a month on `day` at hour:minute.
    MonthlyAt { day: u32, hour: u32, minute: u32 },
}

impl Cadence {
    /// First fire time strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(interval) => {
                after + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero())
            }
            Cadence::DailyAt { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
                let mut candidate = after.date_naive().and_time(time).and_utc();
                if candidate <= after {
                    candidate += chrono::Duration::days(1);
                }
                candidate
            }
            Cadence::MonthlyAt { day, hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
                let mut date = after.date_naive();
                loop {
                    if let Some(on_day) = date.with_day(day) {
                        let candidate = on_day.and_time(time).and_utc();
                        if candidate > after {
                            return candidate;
                        }
                    }
                    // Advance to the first of the next month.
                    let first = date.with_day(1).unwrap_or(date);
                    date = first + Days::new(32);
                    date = date.with_day(1).unwrap_or(date);
                }
            }
        }
    }
}

/// The scheduled pipeline jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    TestPaperRollup,
    QuestionRollup,
    QuestionUsageFold,
    CounterSync,
    ActivityRollup,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestPaperRollup => "test_paper_rollup",
            Self::QuestionRollup => "question_rollup",
            Self::QuestionUsageFold => "question_usage_fold",
            Self::CounterSync => "counter_sync",
            Self::ActivityRollup => "activity_rollup",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a job needs to run.
pub struct JobContext {
    pub store: Store,
    pub counters: Arc<CounterStore>,
    pub metrics: Arc<PipelineMetrics>,
    pub cfg: Arc<Config>,
}

impl JobContext {
    fn run(&self, job: JobKind) -> anyhow::Result<()> {
        match job {
            JobKind::TestPaperRollup => rollup::run_event_rollup(
                &self.store,
                &self.metrics,
                EventKind::TestPaper,
                self.cfg.rollup.test_paper_retention,
            )
            .map(|_| ()),
            JobKind::QuestionRollup => rollup::run_event_rollup(
                &self.store,
                &self.metrics,
                EventKind::Question,
                self.cfg.rollup.question_retention,
            )
            .map(|_| ()),
            JobKind::QuestionUsageFold => {
                rollup::run_question_usage_fold(&self.store, &self.metrics).map(|_| ())
            }
            JobKind::CounterSync => rollup::sync_counters(
                &self.store,
                &self.counters,
                &self.metrics,
                self.cfg.activity.sync_page_size,
            )
            .map(|_| ()),
            JobKind::ActivityRollup => {
                rollup::run_activity_rollup(&self.store, &self.metrics, &self.cfg.activity)
                    .map(|_| ())
            }
        }
    }
}

/// The default job table: compaction in the quiet early-UTC hours, the
/// counter sync on its configured interval.
pub fn default_schedule(sync_interval: Duration) -> Vec<(Cadence, JobKind)> {
    vec![
        (
            Cadence::MonthlyAt {
                day: 1,
                hour: 3,
                minute: 0,
            },
            JobKind::TestPaperRollup,
        ),
        (
            Cadence::DailyAt {
                hour: 2,
                minute: 30,
            },
            JobKind::QuestionRollup,
        ),
        (
            Cadence::DailyAt { hour: 2, minute: 0 },
            JobKind::QuestionUsageFold,
        ),
        (Cadence::Every(sync_interval), JobKind::CounterSync),
        (
            Cadence::DailyAt {
                hour: 3,
                minute: 30,
            },
            JobKind::ActivityRollup,
        ),
    ]
}

/// Spawns the scheduler loop.
///
/// Jobs fire independently; a failing job is logged, counted, and
/// rescheduled, never fatal.
pub fn spawn(
    ctx: JobContext,
    jobs: Vec<(Cadence, JobKind)>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let now = Utc::now();
        let mut entries: Vec<(DateTime<Utc>, Cadence, JobKind)> = jobs
            .into_iter()
            .map(|(cadence, job)| (cadence.next_fire(now), cadence, job))
            .collect();

        for (at, _, job) in &entries {
            info!(job = %job, next_fire = %at, "job scheduled");
        }

        loop {
            let Some(idx) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, (at, _, _))| *at)
                .map(|(idx, _)| idx)
            else {
                // No jobs configured; nothing to drive.
                token.cancelled().await;
                return;
            };

            let due = entries[idx].0;
            let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let (_, cadence, job) = entries[idx];
            let started = Utc::now();
            match ctx.run(job) {
                Ok(()) => {
                    ctx.metrics
                        .job_runs
                        .with_label_values(&[job.as_str(), "success"])
                        .inc();
                }
                Err(e) => {
                    ctx.metrics
                        .job_runs
                        .with_label_values(&[job.as_str(), "error"])
                        .inc();
                    error!(job = %job, error = %e, "job failed");
                }
            }

            let next = cadence.next_fire(started);
            if next <= started {
                warn!(job = %job, "cadence did not advance, disabling job");
                entries.remove(idx);
                continue;
            }
            entries[idx].0 = next;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid test time")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_every_advances_by_interval() {
        let cadence = Cadence::Every(Duration::from_secs(300));
        assert_eq!(
            cadence.next_fire(at("2026-08-28T10:00:00Z")),
            at("2026-08-28T10:05:00Z")
        );
    }

    #[test]
    fn test_daily_same_day_when_time_ahead() {
        let cadence = Cadence::DailyAt { hour: 2, minute: 30 };
        assert_eq!(
            cadence.next_fire(at("2026-08-28T01:00:00Z")),
            at("2026-08-28T02:30:00Z")
        );
    }

    #[test]
    fn test_daily_rolls_to_next_day() {
        let cadence = Cadence::DailyAt { hour: 2, minute: 30 };
        assert_eq!(
            cadence.next_fire(at("2026-08-28T02:30:00Z")),
            at("2026-08-29T02:30:00Z")
        );
        assert_eq!(
            cadence.next_fire(at("2026-08-28T14:00:00Z")),
            at("2026-08-29T02:30:00Z")
        );
    }

    #[test]
    fn test_monthly_rolls_to_next_month() {
        let cadence = Cadence::MonthlyAt {
            day: 1,
            hour: 3,
            minute: 0,
        };
        assert_eq!(
            cadence.next_fire(at("2026-08-28T10:00:00Z")),
            at("2026-09-01T03:00:00Z")
        );
        // Fires later the same day when the time has not passed yet.
        assert_eq!(
            cadence.next_fire(at("2026-09-01T01:00:00Z")),
            at("2026-09-01T03:00:00Z")
        );
    }

    #[test]
    fn test_monthly_rolls_across_year_end() {
        let cadence = Cadence::MonthlyAt {
            day: 1,
            hour: 3,
            minute: 0,
        };
        assert_eq!(
            cadence.next_fire(at("2026-12-15T00:00:00Z")),
            at("2027-01-01T03:00:00Z")
        );
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let cadence = Cadence::MonthlyAt {
            day: 31,
            hour: 0,
            minute: 0,
        };
        // February has no day 31; the next fire lands in March.
        assert_eq!(
            cadence.next_fire(at("2026-02-01T00:00:00Z")),
            at("2026-03-31T00:00:00Z")
        );
    }

    #[test]
    fn test_default_schedule_covers_all_jobs() {
        let schedule = default_schedule(Duration::from_secs(300));
        let jobs: Vec<JobKind> = schedule.iter().map(|(_, job)| *job).collect();
        assert!(jobs.contains(&JobKind::TestPaperRollup));
        assert!(jobs.contains(&JobKind::QuestionRollup));
        assert!(jobs.contains(&JobKind::QuestionUsageFold));
        assert!(jobs.contains(&JobKind::CounterSync));
        assert!(jobs.contains(&JobKind::ActivityRollup));
    }

    #[tokio::test]
    async fn test_scheduler_runs_interval_job() {
        let store = Store::open_in_memory().expect("store");
        store.migrate().expect("migrations");
        let counters = Arc::new(CounterStore::new());
        counters.incr_by("activity:s1:Math:2026-08-28", 30, Duration::from_secs(60));

        let metrics = Arc::new(PipelineMetrics::new().expect("metrics"));
        let ctx = JobContext {
            store: store.clone(),
            counters,
            metrics: metrics.clone(),
            cfg: Arc::new(Config::default()),
        };

        let token = CancellationToken::new();
        let handle = spawn(
            ctx,
            vec![(
                Cadence::Every(Duration::from_millis(10)),
                JobKind::CounterSync,
            )],
            token.clone(),
        );

        for _ in 0..100 {
            let runs = metrics
                .job_runs
                .with_label_values(&["counter_sync", "success"])
                .get();
            if runs >= 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        handle.await.expect("scheduler exits");

        let day = chrono::NaiveDate::parse_from_str("2026-08-28", "%Y-%m-%d").expect("date");
        assert_eq!(
            store
                .daily_activity_seconds("s1", "Math", day)
                .expect("read"),
            Some(30)
        );
    }
}
