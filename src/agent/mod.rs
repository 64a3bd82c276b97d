use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consumer::Consumer;
use crate::counter::CounterStore;
use crate::event::EventKind;
use crate::health::PipelineMetrics;
use crate::ingest::IngestServer;
use crate::plan::{HttpAccountClient, PlanCache};
use crate::queue::HttpQueue;
use crate::sched::{self, JobContext};
use crate::store::Store;

/// Agent orchestrates all components: store, ingest server, queue
/// consumers, and the job scheduler.
pub struct Agent {
    cfg: Arc<Config>,
    metrics: Arc<PipelineMetrics>,
    counters: Arc<CounterStore>,
    plan: Option<PlanCache<HttpAccountClient>>,
    server: Option<IngestServer>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing metrics and the plan cache
    /// (when an account service is configured).
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(PipelineMetrics::new().context("creating metrics")?);
        let counters = Arc::new(CounterStore::new());

        let plan = if cfg.plan.endpoint.is_empty() {
            None
        } else {
            Some(PlanCache::new(
                HttpAccountClient::new(&cfg.plan).context("creating account client")?,
                Arc::clone(&counters),
                Arc::clone(&metrics),
                cfg.plan.cache_ttl,
            ))
        };

        Ok(Self {
            cfg: Arc::new(cfg),
            metrics,
            counters,
            plan,
            server: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Plan lookups for the reporting layer. None when no account
    /// service endpoint is configured; callers must then fail closed.
    pub fn plan_cache(&self) -> Option<&PlanCache<HttpAccountClient>> {
        self.plan.as_ref()
    }

    /// Start all components and begin consuming.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Open the store and apply migrations before anything that
        //    could write.
        let store = Store::open(&self.cfg.database.path).context("opening store")?;
        store.migrate().context("applying migrations")?;
        info!(path = %self.cfg.database.path.display(), "store ready");

        // 2. Serve heartbeats, health, and metrics.
        let server = IngestServer::new(
            &self.cfg.server.addr,
            Arc::clone(&self.counters),
            Arc::clone(&self.metrics),
            self.cfg.activity.heartbeat_quantum,
            self.cfg.activity.counter_ttl,
        );
        server.start().await.context("starting ingest server")?;
        self.server = Some(server);

        // 3. One consumer loop per queue.
        for (kind, queue_cfg) in [
            (EventKind::TestPaper, &self.cfg.test_paper_queue),
            (EventKind::Question, &self.cfg.question_queue),
        ] {
            let queue = Arc::new(HttpQueue::new(queue_cfg).context("creating queue client")?);
            let consumer = Consumer::new(
                kind,
                queue,
                store.clone(),
                Arc::clone(&self.metrics),
                self.cfg.consumer.clone(),
            );
            self.tasks.push(consumer.spawn(self.cancel.child_token()));
        }

        // 4. The job scheduler.
        let ctx = JobContext {
            store,
            counters: Arc::clone(&self.counters),
            metrics: Arc::clone(&self.metrics),
            cfg: Arc::clone(&self.cfg),
        };
        self.tasks.push(sched::spawn(
            ctx,
            sched::default_schedule(self.cfg.activity.sync_interval),
            self.cancel.child_token(),
        ));

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal consumers and the scheduler to stop at their next loop
        // boundary; in-flight messages stay unacked for redelivery.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "task ended abnormally");
            }
        }

        if let Some(server) = &self.server {
            server.stop().await?;
        }

        info!("agent stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(db_path: &std::path::Path) -> Config {
        let yaml = format!(
            r#"
database:
  path: {}
server:
  addr: 127.0.0.1:0
test_paper_queue:
  endpoint: http://127.0.0.1:1
  queue_url: http://127.0.0.1:1/queue/test-papers
question_queue:
  endpoint: http://127.0.0.1:1
  queue_url: http://127.0.0.1:1/queue/questions
consumer:
  wait_time: 50ms
  error_backoff: 50ms
"#,
            db_path.display()
        );
        let cfg: Config = serde_yaml::from_str(&yaml).expect("test config parses");
        cfg.validate().expect("test config valid");
        cfg
    }

    #[test]
    fn test_plan_cache_requires_endpoint() {
        let dir = tempfile::tempdir().expect("tempdir");

        let cfg = test_config(&dir.path().join("a.db"));
        let agent = Agent::new(cfg).expect("agent");
        assert!(agent.plan_cache().is_none());

        let mut cfg = test_config(&dir.path().join("b.db"));
        cfg.plan.endpoint = "http://127.0.0.1:1".to_string();
        let agent = Agent::new(cfg).expect("agent");
        assert!(agent.plan_cache().is_some());
    }

    #[tokio::test]
    async fn test_agent_start_stop_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(&dir.path().join("agent.db"));

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("starts");

        // Consumers hit an unreachable queue and back off; shutdown must
        // still be prompt.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), agent.stop())
            .await
            .expect("stop is prompt")
            .expect("stops cleanly");
    }
}
