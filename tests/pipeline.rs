//! End-to-end pipeline tests: queue -> consumer -> store -> rollup jobs,
//! and heartbeat -> counter -> daily mirror -> weekly rollup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use insightd::config::{ActivityConfig, ConsumerConfig};
use insightd::consumer::Consumer;
use insightd::counter::CounterStore;
use insightd::event::EventKind;
use insightd::health::PipelineMetrics;
use insightd::ingest::IngestServer;
use insightd::queue::{MemoryQueue, MessageQueue};
use insightd::rollup;
use insightd::store::{ActivityDay, Store, week_start};

fn open_store() -> Store {
    let store = Store::open_in_memory().expect("open store");
    store.migrate().expect("migrations apply");
    store
}

fn metrics() -> Arc<PipelineMetrics> {
    Arc::new(PipelineMetrics::new().expect("metrics"))
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        max_messages: 10,
        wait_time: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
    }
}

fn event_body(event_type: &str, event_id: &str, timestamp: &str) -> String {
    format!(
        r#"{{"event_id":"{event_id}","event_type":"{event_type}",
            "user_id":"u1","profile_id":"p1","class_name":"10",
            "subject":"Math","data":{{"difficulty":"easy"}},
            "timestamp":"{timestamp}"}}"#
    )
}

async fn drain_queue(queue: &Arc<MemoryQueue>) {
    for _ in 0..200 {
        if queue.pending() == 0 && queue.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue did not drain in time");
}

#[tokio::test]
async fn test_duplicate_delivery_yields_one_row() {
    let store = open_store();
    let queue = Arc::new(MemoryQueue::new());
    let body = event_body("TEST_PAPER_GENERATED", "evt-dup", "2026-08-27T10:00:00Z");
    queue.push(body.clone());
    queue.push(body);

    let token = CancellationToken::new();
    let handle = Consumer::new(
        EventKind::TestPaper,
        queue.clone(),
        store.clone(),
        metrics(),
        consumer_config(),
    )
    .spawn(token.clone());

    drain_queue(&queue).await;
    token.cancel();
    handle.await.expect("consumer exits");

    assert_eq!(
        store.raw_event_count(EventKind::TestPaper).expect("count"),
        1
    );
}

#[tokio::test]
async fn test_questions_fold_into_daily_usage() {
    let store = open_store();
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..5 {
        queue.push(event_body(
            "QUESTION_ASKED",
            &format!("q-{i}"),
            "2026-08-27T10:00:00Z",
        ));
    }

    let token = CancellationToken::new();
    let m = metrics();
    let handle = Consumer::new(
        EventKind::Question,
        queue.clone(),
        store.clone(),
        m.clone(),
        consumer_config(),
    )
    .spawn(token.clone());

    drain_queue(&queue).await;
    token.cancel();
    handle.await.expect("consumer exits");

    let outcome = rollup::run_question_usage_fold(&store, &m).expect("fold");
    assert_eq!(outcome.raw_deleted, 5);

    // Raw table empty, usage row carries the count.
    assert_eq!(store.raw_event_count(EventKind::Question).expect("count"), 0);
    assert_eq!(
        store
            .question_usage_count("u1", Utc::now().date_naive())
            .expect("usage"),
        5
    );
}

#[tokio::test]
async fn test_heartbeats_mirror_into_daily_activity() {
    let store = open_store();
    let counters = Arc::new(CounterStore::new());
    let m = metrics();

    let server = IngestServer::new(
        "127.0.0.1:0",
        counters.clone(),
        m.clone(),
        Duration::from_secs(30),
        Duration::from_secs(48 * 3600),
    );
    let addr = server.start().await.expect("server starts");

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("http://{addr}/activity/heartbeat"))
            .json(&serde_json::json!({"student_id": "s1", "subject": "Math"}))
            .send()
            .await
            .expect("heartbeat");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }
    server.stop().await.expect("server stops");

    let outcome = rollup::sync_counters(&store, &counters, &m, 100).expect("sync");
    assert_eq!(outcome.synced, 1);

    assert_eq!(
        store
            .daily_activity_seconds("s1", "Math", Utc::now().date_naive())
            .expect("read"),
        Some(90)
    );
}

#[tokio::test]
async fn test_last_week_rolls_up_and_prunes() {
    let store = open_store();
    let m = metrics();
    let today = Utc::now().date_naive();
    let last_week = week_start(today) - Days::new(7);

    for (offset, secs) in [(0u64, 300i64), (1, 120), (3, 60)] {
        store
            .upsert_daily_activity(&[ActivityDay {
                student_id: "s1".into(),
                subject: "Science".into(),
                day: last_week + Days::new(offset),
                seconds_active: secs,
            }])
            .expect("seed daily rows");
    }

    let cfg = ActivityConfig::default();
    let outcome = rollup::run_activity_rollup(&store, &m, &cfg).expect("rollup");
    assert_eq!(outcome.pruned, 3);

    // Weekly row carries the sum and outlives its daily sources.
    assert_eq!(
        store
            .weekly_activity_seconds("s1", "Science", last_week)
            .expect("read"),
        Some(480)
    );
    assert_eq!(
        store
            .daily_activity_seconds("s1", "Science", last_week)
            .expect("read"),
        None
    );

    // Re-running recomputes the same stable row.
    rollup::run_activity_rollup(&store, &m, &cfg).expect("second run");
    assert_eq!(
        store
            .weekly_activity_seconds("s1", "Science", last_week)
            .expect("read"),
        Some(480)
    );
}

#[tokio::test]
async fn test_totals_conserved_across_compaction() {
    let store = open_store();
    let queue = Arc::new(MemoryQueue::new());
    let m = metrics();

    // Old events (aggregated by the rollup) plus fresh ones (kept raw).
    for i in 0..4 {
        queue.push(event_body(
            "TEST_PAPER_GENERATED",
            &format!("old-{i}"),
            "2026-01-10T09:00:00Z",
        ));
    }
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    for i in 0..2 {
        queue.push(event_body("TEST_PAPER_GENERATED", &format!("new-{i}"), &now));
    }

    let token = CancellationToken::new();
    let handle = Consumer::new(
        EventKind::TestPaper,
        queue.clone(),
        store.clone(),
        m.clone(),
        consumer_config(),
    )
    .spawn(token.clone());
    drain_queue(&queue).await;
    token.cancel();
    handle.await.expect("consumer exits");

    assert_eq!(store.total_test_papers("10", "Math").expect("total"), 6);

    rollup::run_event_rollup(
        &store,
        &m,
        EventKind::TestPaper,
        Duration::from_secs(30 * 24 * 3600),
    )
    .expect("rollup");

    // The old events moved tiers; the total is unchanged.
    assert_eq!(store.total_test_papers("10", "Math").expect("total"), 6);
    assert_eq!(
        store.raw_event_count(EventKind::TestPaper).expect("count"),
        2
    );
    let month = NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date");
    assert_eq!(
        store
            .rollup_count(EventKind::TestPaper, "10", "Math", month)
            .expect("read"),
        Some(4)
    );
}

#[tokio::test]
async fn test_unacked_message_redelivered_and_deduped() {
    let store = open_store();
    let queue = Arc::new(MemoryQueue::new());
    queue.push(event_body(
        "QUESTION_ASKED",
        "evt-redeliver",
        "2026-08-27T10:00:00Z",
    ));

    // First delivery consumed outside any consumer and never acked.
    let first = queue
        .receive(1, Duration::from_millis(1))
        .await
        .expect("receive");
    assert_eq!(first.len(), 1);
    assert_eq!(queue.redeliver(), 1);

    let token = CancellationToken::new();
    let handle = Consumer::new(
        EventKind::Question,
        queue.clone(),
        store.clone(),
        metrics(),
        consumer_config(),
    )
    .spawn(token.clone());
    drain_queue(&queue).await;
    token.cancel();
    handle.await.expect("consumer exits");

    assert_eq!(store.raw_event_count(EventKind::Question).expect("count"), 1);
}
