use anyhow::Result;
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "insightd" namespace. Counters are labeled by
/// event kind or job name where a breakdown is useful.
pub struct PipelineMetrics {
    registry: Registry,

    /// Raw events persisted, by kind.
    pub events_stored: CounterVec,
    /// Duplicate deliveries skipped via the idempotency key, by kind.
    pub events_duplicate: CounterVec,
    /// Messages acknowledged without persistence (malformed or unknown
    /// type), by kind.
    pub messages_dropped: CounterVec,
    /// Queue transport errors, by kind.
    pub queue_errors: CounterVec,
    /// Activity heartbeats accepted.
    pub heartbeats: Counter,
    /// Activity heartbeats rejected (empty student_id).
    pub heartbeats_rejected: Counter,
    /// Scheduled job runs, by job and outcome.
    pub job_runs: CounterVec,
    /// Raw rows deleted by compaction, by job.
    pub rows_compacted: CounterVec,
    /// Counter keys mirrored into daily_activity.
    pub counters_synced: Counter,
    /// Counter keys skipped during sync (unparseable).
    pub counters_skipped: Counter,
    /// Daily activity rows pruned by retention.
    pub activity_pruned: Counter,
    /// Live entries in the counter store.
    pub counter_entries: Gauge,
    /// Plan-details cache hits.
    pub plan_cache_hits: Counter,
    /// Plan-details cache misses.
    pub plan_cache_misses: Counter,
}

impl PipelineMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_stored = CounterVec::new(
            Opts::new("events_stored_total", "Raw events persisted by kind.")
                .namespace("insightd"),
            &["kind"],
        )?;
        let events_duplicate = CounterVec::new(
            Opts::new(
                "events_duplicate_total",
                "Duplicate deliveries skipped via idempotency key, by kind.",
            )
            .namespace("insightd"),
            &["kind"],
        )?;
        let messages_dropped = CounterVec::new(
            Opts::new(
                "messages_dropped_total",
                "Messages acknowledged without persistence, by kind.",
            )
            .namespace("insightd"),
            &["kind"],
        )?;
        let queue_errors = CounterVec::new(
            Opts::new("queue_errors_total", "Queue transport errors by kind.")
                .namespace("insightd"),
            &["kind"],
        )?;
        let heartbeats = Counter::with_opts(
            Opts::new("heartbeats_total", "Activity heartbeats accepted.").namespace("insightd"),
        )?;
        let heartbeats_rejected = Counter::with_opts(
            Opts::new(
                "heartbeats_rejected_total",
                "Activity heartbeats rejected for an empty student_id.",
            )
            .namespace("insightd"),
        )?;
        let job_runs = CounterVec::new(
            Opts::new("job_runs_total", "Scheduled job runs by job and outcome.")
                .namespace("insightd"),
            &["job", "outcome"],
        )?;
        let rows_compacted = CounterVec::new(
            Opts::new(
                "rows_compacted_total",
                "Raw rows deleted after aggregation, by job.",
            )
            .namespace("insightd"),
            &["job"],
        )?;
        let counters_synced = Counter::with_opts(
            Opts::new(
                "counters_synced_total",
                "Counter keys mirrored into daily_activity.",
            )
            .namespace("insightd"),
        )?;
        let counters_skipped = Counter::with_opts(
            Opts::new(
                "counters_skipped_total",
                "Counter keys skipped during sync because they could not be parsed.",
            )
            .namespace("insightd"),
        )?;
        let activity_pruned = Counter::with_opts(
            Opts::new(
                "activity_pruned_total",
                "Daily activity rows pruned by retention.",
            )
            .namespace("insightd"),
        )?;
        let counter_entries = Gauge::with_opts(
            Opts::new("counter_entries", "Live entries in the counter store.")
                .namespace("insightd"),
        )?;
        let plan_cache_hits = Counter::with_opts(
            Opts::new("plan_cache_hits_total", "Plan-details cache hits.").namespace("insightd"),
        )?;
        let plan_cache_misses = Counter::with_opts(
            Opts::new("plan_cache_misses_total", "Plan-details cache misses.")
                .namespace("insightd"),
        )?;

        registry.register(Box::new(events_stored.clone()))?;
        registry.register(Box::new(events_duplicate.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(queue_errors.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(heartbeats_rejected.clone()))?;
        registry.register(Box::new(job_runs.clone()))?;
        registry.register(Box::new(rows_compacted.clone()))?;
        registry.register(Box::new(counters_synced.clone()))?;
        registry.register(Box::new(counters_skipped.clone()))?;
        registry.register(Box::new(activity_pruned.clone()))?;
        registry.register(Box::new(counter_entries.clone()))?;
        registry.register(Box::new(plan_cache_hits.clone()))?;
        registry.register(Box::new(plan_cache_misses.clone()))?;

        Ok(Self {
            registry,
            events_stored,
            events_duplicate,
            messages_dropped,
            queue_errors,
            heartbeats,
            heartbeats_rejected,
            job_runs,
            rows_compacted,
            counters_synced,
            counters_skipped,
            activity_pruned,
            counter_entries,
            plan_cache_hits,
            plan_cache_misses,
        })
    }

    /// Registry backing the /metrics endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
