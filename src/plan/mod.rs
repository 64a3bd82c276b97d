use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PlanConfig;
use crate::counter::CounterStore;
use crate::health::PipelineMetrics;

/// Cache key prefix for plan lookups.
const PLAN_PREFIX: &str = "plan_details:";

/// Subscription plan as returned by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDetails {
    #[serde(default)]
    pub plan_id: String,
    /// Feature codes enabled for this plan.
    #[serde(default)]
    pub features: Vec<String>,
}

/// Account-service API client trait.
pub trait AccountClient: Send + Sync {
    /// Fetch the plan for one profile.
    fn fetch_plan(
        &self,
        profile_id: &str,
    ) -> impl std::future::Future<Output = Result<PlanDetails>> + Send;
}

/// HTTP-based account-service client.
pub struct HttpAccountClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpAccountClient {
    pub fn new(cfg: &PlanConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
        })
    }
}

impl AccountClient for HttpAccountClient {
    async fn fetch_plan(&self, profile_id: &str) -> Result<PlanDetails> {
        if self.endpoint.is_empty() {
            bail!("account service endpoint not configured");
        }

        let url = format!("{}/plans/{profile_id}", self.endpoint);
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting plan for {profile_id}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} fetching plan for {profile_id}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding plan for {profile_id}"))
    }
}

/// Plan lookups with a counter-store cache in front of the account
/// service.
///
/// Feature checks fail closed: any lookup failure means the feature is
/// treated as disabled.
pub struct PlanCache<C> {
    client: C,
    counters: Arc<CounterStore>,
    metrics: Arc<PipelineMetrics>,
    cache_ttl: Duration,
}

impl<C: AccountClient> PlanCache<C> {
    pub fn new(
        client: C,
        counters: Arc<CounterStore>,
        metrics: Arc<PipelineMetrics>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            counters,
            metrics,
            cache_ttl,
        }
    }

    /// Whether `feature_code` is enabled for the profile's plan.
    pub async fn check_feature(&self, profile_id: &str, feature_code: &str) -> bool {
        match self.plan_details(profile_id).await {
            Ok(plan) => plan.features.iter().any(|f| f == feature_code),
            Err(e) => {
                warn!(profile_id = %profile_id, error = %e, "plan lookup failed, denying feature");
                false
            }
        }
    }

    /// Plan for the profile, from cache or the account service.
    pub async fn plan_details(&self, profile_id: &str) -> Result<PlanDetails> {
        let key = format!("{PLAN_PREFIX}{profile_id}");

        if let Some(cached) = self.counters.get_text(&key) {
            self.metrics.plan_cache_hits.inc();
            return serde_json::from_str(&cached).context("decoding cached plan");
        }

        self.metrics.plan_cache_misses.inc();
        debug!(profile_id = %profile_id, "plan cache miss");

        let plan = self.client.fetch_plan(profile_id).await?;
        let encoded = serde_json::to_string(&plan).context("encoding plan for cache")?;
        self.counters.set_text(&key, encoded, self.cache_ttl);

        Ok(plan)
    }
}
