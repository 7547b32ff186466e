use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Quantities describing one completed (or failed) unit of billable work.
#[derive(Debug, Clone, Serialize)]
pub struct UsageMetrics {
    pub identity: String,
    /// Service kind code, "stt" or "llm".
    pub service: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub audio_seconds: f64,
    pub cost: f64,
    pub success: bool,
    pub error: Option<String>,
}

/// Immutable fact derived from [`UsageMetrics`]; created exactly once per
/// unit of work and never mutated afterward.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub metrics: UsageMetrics,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence collaborator for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn persist(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

/// In-memory sink; the default when no endpoint is configured, and the
/// capture point for tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl UsageSink for MemorySink {
    async fn persist(&self, record: &UsageRecord) -> anyhow::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// POSTs each record as JSON to an analytics endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl UsageSink for HttpSink {
    async fn persist(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("usage sink returned {}", response.status());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl AlertPeriod {
    /// Calendar start of the period containing `now` (UTC).
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let day = now.date_naive();
        let start_day = match self {
            AlertPeriod::Daily => day,
            AlertPeriod::Weekly => {
                day - ChronoDuration::days(i64::from(day.weekday().num_days_from_monday()))
            }
            AlertPeriod::Monthly => day.with_day(1).unwrap_or(day),
        };
        Utc.from_utc_datetime(&start_day.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

/// Spend threshold for one identity and period. Firing never blocks
/// usage; consumers of the trigger decide policy.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: Uuid,
    pub identity: String,
    pub period: AlertPeriod,
    pub threshold: f64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct SpendBucket {
    period_start: DateTime<Utc>,
    total: f64,
}

#[derive(Debug, Clone, Copy)]
struct RollingSpend {
    daily: SpendBucket,
    weekly: SpendBucket,
    monthly: SpendBucket,
}

impl RollingSpend {
    fn new(now: DateTime<Utc>) -> Self {
        let bucket = |p: AlertPeriod| SpendBucket {
            period_start: p.period_start(now),
            total: 0.0,
        };
        Self {
            daily: bucket(AlertPeriod::Daily),
            weekly: bucket(AlertPeriod::Weekly),
            monthly: bucket(AlertPeriod::Monthly),
        }
    }

    fn apply(&mut self, now: DateTime<Utc>, cost: f64) {
        for (period, bucket) in [
            (AlertPeriod::Daily, &mut self.daily),
            (AlertPeriod::Weekly, &mut self.weekly),
            (AlertPeriod::Monthly, &mut self.monthly),
        ] {
            let start = period.period_start(now);
            if bucket.period_start != start {
                bucket.period_start = start;
                bucket.total = 0.0;
            }
            bucket.total += cost;
        }
    }

    fn total_for(&self, period: AlertPeriod, now: DateTime<Utc>) -> f64 {
        let bucket = match period {
            AlertPeriod::Daily => &self.daily,
            AlertPeriod::Weekly => &self.weekly,
            AlertPeriod::Monthly => &self.monthly,
        };
        if bucket.period_start == period.period_start(now) {
            bucket.total
        } else {
            0.0
        }
    }
}

/// Converts completed work into persisted usage records and rolling
/// per-identity spend, evaluating alert rules as a side effect.
///
/// Recording is a best-effort side channel: persistence failures are
/// logged and swallowed, never surfaced to the caller that produced the
/// underlying transcription or completion.
pub struct UsageRecorder {
    sink: Arc<dyn UsageSink>,
    aggregates: DashMap<String, RollingSpend>,
    rules: RwLock<Vec<AlertRule>>,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self {
            sink,
            aggregates: DashMap::new(),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn add_rule(&self, identity: &str, period: AlertPeriod, threshold: f64) -> Uuid {
        let id = Uuid::new_v4();
        self.rules.write().push(AlertRule {
            id,
            identity: identity.to_string(),
            period,
            threshold,
            last_triggered: None,
            trigger_count: 0,
        });
        id
    }

    pub fn rule(&self, id: Uuid) -> Option<AlertRule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    /// Current-period spend snapshot for an identity.
    pub fn spend_for(&self, identity: &str, period: AlertPeriod) -> f64 {
        let now = Utc::now();
        self.aggregates
            .get(identity)
            .map(|s| s.total_for(period, now))
            .unwrap_or(0.0)
    }

    pub async fn record(&self, metrics: UsageMetrics) -> UsageRecord {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            metrics,
            recorded_at: Utc::now(),
        };

        if let Err(e) = self.sink.persist(&record).await {
            warn!(%e, identity = %record.metrics.identity, "usage persistence failed");
        }

        let now = record.recorded_at;
        self.aggregates
            .entry(record.metrics.identity.clone())
            .or_insert_with(|| RollingSpend::new(now))
            .apply(now, record.metrics.cost);

        self.evaluate_alerts(&record.metrics.identity, now);

        debug!(
            identity = %record.metrics.identity,
            service = %record.metrics.service,
            provider = %record.metrics.provider,
            cost = record.metrics.cost,
            success = record.metrics.success,
            "usage recorded"
        );
        record
    }

    fn evaluate_alerts(&self, identity: &str, now: DateTime<Utc>) {
        let spend = match self.aggregates.get(identity) {
            Some(s) => *s,
            None => return,
        };

        let mut rules = self.rules.write();
        for rule in rules.iter_mut().filter(|r| r.identity == identity) {
            let period_start = rule.period.period_start(now);
            let total = spend.total_for(rule.period, now);
            let already_fired = matches!(rule.last_triggered, Some(t) if t >= period_start);
            if total >= rule.threshold && !already_fired {
                rule.last_triggered = Some(now);
                rule.trigger_count += 1;
                info!(
                    identity = %rule.identity,
                    threshold = rule.threshold,
                    spend = total,
                    period = ?rule.period,
                    "spend alert triggered"
                );
            }
        }
    }
}
