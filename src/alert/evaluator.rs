//! Polling alert evaluator.
//!
//! Each tick loads the enabled rules, computes every rule's metric over its
//! trailing window and notifies the rule's channel when the threshold holds
//! and the rule is out of cooldown. Ticks are single-flight: a tick that
//! starts while another is still running is skipped.

use crate::alert::dispatch::{AlertNotification, ChannelConfig, DispatchError};
use crate::alert::metrics::{per_minute, Metric};
use crate::alert::rules::AlertRule;
use crate::config::AlertingConfig;
use crate::error::{AppError, AppResult};
use crate::types::PerformanceSample;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Where rules come from and where firings are recorded.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn active_rules(&self) -> AppResult<Vec<AlertRule>>;
    async fn mark_triggered(&self, rule_id: i64, at: i64) -> AppResult<()>;
}

/// Raw signals a metric is computed from. `since` and `until` are epoch ms, inclusive.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn count_events(&self, project_id: Option<&str>, since: i64, until: i64)
        -> AppResult<u64>;
    async fn samples(
        &self,
        project_id: Option<&str>,
        since: i64,
        until: i64,
    ) -> AppResult<Vec<PerformanceSample>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        channel: &ChannelConfig,
        alert: &AlertNotification,
    ) -> Result<(), DispatchError>;
}

/// What happened to one rule during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    NotTriggered { value: f64 },
    CoolingDown { value: f64 },
    Fired { value: f64 },
    DispatchFailed { value: f64 },
    Failed(String),
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: Vec<(i64, RuleOutcome)>,
}

impl TickReport {
    pub fn fired(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RuleOutcome::Fired { .. }))
            .count()
    }

    pub fn outcome(&self, rule_id: i64) -> Option<&RuleOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == rule_id)
            .map(|(_, o)| o)
    }
}

pub struct AlertEvaluator<S, N> {
    store: Arc<S>,
    notifier: Arc<N>,
    interval: Duration,
    rule_timeout: Duration,
    in_flight: Mutex<()>,
}

/// Returned by [`AlertEvaluator::start`]; dropping it leaves the loop running.
pub struct EvaluatorHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EvaluatorHandle {
    /// Cancel the pending timer and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "alert evaluator task failed");
        }
    }
}

impl<S, N> AlertEvaluator<S, N>
where
    S: RuleStore + SignalSource + 'static,
    N: Notifier + 'static,
{
    pub fn new(store: Arc<S>, notifier: Arc<N>, config: &AlertingConfig) -> Self {
        Self {
            store,
            notifier,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            rule_timeout: Duration::from_secs(config.rule_timeout_secs.max(1)),
            in_flight: Mutex::new(()),
        }
    }

    pub fn start(self: Arc<Self>) -> EvaluatorHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.interval.as_secs(), "alert evaluator started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Outside the select so cancellation never interrupts a tick
                self.tick().await;
            }

            tracing::info!("alert evaluator stopped");
        });

        EvaluatorHandle { token, handle }
    }

    pub async fn tick(&self) -> Option<TickReport> {
        self.tick_at(chrono::Utc::now().timestamp_millis()).await
    }

    /// Run one evaluation pass as of `now_ms`. Returns `None` when another
    /// tick is still running.
    pub async fn tick_at(&self, now_ms: i64) -> Option<TickReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!("previous alert tick still running, skipping");
            return None;
        };

        let rules = match self.store.active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(error = %e, "failed to load alert rules");
                return Some(TickReport::default());
            }
        };

        let mut report = TickReport::default();
        for rule in rules {
            let outcome =
                match time::timeout(self.rule_timeout, self.evaluate_rule(&rule, now_ms)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        tracing::error!(rule_id = rule.id, rule = %rule.name, error = %e, "alert rule evaluation failed");
                        RuleOutcome::Failed(e.to_string())
                    }
                    Err(_) => {
                        tracing::error!(rule_id = rule.id, rule = %rule.name, "alert rule evaluation timed out");
                        RuleOutcome::Failed("timed out".to_string())
                    }
                };
            report.outcomes.push((rule.id, outcome));
        }

        tracing::debug!(rules = report.outcomes.len(), fired = report.fired(), "alert tick complete");
        Some(report)
    }

    async fn compute(&self, rule: &AlertRule, metric: Metric, now_ms: i64) -> AppResult<f64> {
        let since = rule
            .window_minutes
            .checked_mul(60_000)
            .and_then(|span| now_ms.checked_sub(span))
            .ok_or_else(|| {
                AppError::Validation(format!("window_minutes out of range: {}", rule.window_minutes))
            })?;
        let project_id = rule.project_id.as_deref();

        if metric.uses_samples() {
            let samples = self.store.samples(project_id, since, now_ms).await?;
            Ok(metric
                .from_samples(&samples, rule.window_minutes)
                .unwrap_or_default())
        } else {
            let count = self.store.count_events(project_id, since, now_ms).await?;
            Ok(per_minute(count, rule.window_minutes))
        }
    }

    async fn evaluate_rule(&self, rule: &AlertRule, now_ms: i64) -> AppResult<RuleOutcome> {
        let metric = Metric::parse(&rule.metric)
            .ok_or_else(|| AppError::Validation(format!("unknown metric: {}", rule.metric)))?;
        let value = self.compute(rule, metric, now_ms).await?;

        if !rule.comparator.compare(value, rule.threshold) {
            return Ok(RuleOutcome::NotTriggered { value });
        }
        if rule.on_cooldown(now_ms) {
            tracing::debug!(rule_id = rule.id, "alert condition holds but rule is cooling down");
            return Ok(RuleOutcome::CoolingDown { value });
        }

        let alert = AlertNotification {
            rule_name: rule.name.clone(),
            metric: rule.metric.clone(),
            value,
            comparator: rule.comparator.as_str().to_string(),
            threshold: rule.threshold,
            project_id: rule.project_id.clone(),
        };

        match self.notifier.notify(&rule.channel, &alert).await {
            Ok(()) => {
                self.store.mark_triggered(rule.id, now_ms).await?;
                tracing::info!(
                    rule_id = rule.id,
                    rule = %rule.name,
                    metric = %rule.metric,
                    value,
                    threshold = rule.threshold,
                    channel = rule.channel.kind(),
                    "alert fired"
                );
                Ok(RuleOutcome::Fired { value })
            }
            Err(e) => {
                tracing::warn!(rule_id = rule.id, rule = %rule.name, error = %e, "alert dispatch failed");
                Ok(RuleOutcome::DispatchFailed { value })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::rules::Comparator;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeStore {
        rules: std::sync::Mutex<Vec<AlertRule>>,
        event_count: u64,
    }

    impl FakeStore {
        fn new(rules: Vec<AlertRule>, event_count: u64) -> Self {
            Self {
                rules: std::sync::Mutex::new(rules),
                event_count,
            }
        }

        fn last_triggered(&self, id: i64) -> Option<i64> {
            let rules = self.rules.lock().unwrap();
            rules.iter().find(|r| r.id == id).and_then(|r| r.last_triggered_at)
        }
    }

    #[async_trait]
    impl RuleStore for FakeStore {
        async fn active_rules(&self) -> AppResult<Vec<AlertRule>> {
            Ok(self.rules.lock().unwrap().clone())
        }

        async fn mark_triggered(&self, rule_id: i64, at: i64) -> AppResult<()> {
            let mut rules = self.rules.lock().unwrap();
            if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
                rule.last_triggered_at = Some(at);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SignalSource for FakeStore {
        async fn count_events(&self, _: Option<&str>, _: i64, _: i64) -> AppResult<u64> {
            Ok(self.event_count)
        }

        async fn samples(&self, _: Option<&str>, _: i64, _: i64) -> AppResult<Vec<PerformanceSample>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: AtomicUsize,
        failing: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, _: &ChannelConfig, _: &AlertNotification) -> Result<(), DispatchError> {
            if self.delay_ms > 0 {
                time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(DispatchError::Status(503));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn rule(id: i64, metric: &str) -> AlertRule {
        AlertRule {
            id,
            name: format!("rule-{id}"),
            project_id: None,
            metric: metric.to_string(),
            comparator: Comparator::Gt,
            threshold: 100.0,
            window_minutes: 1,
            cooldown_ms: 60_000,
            channel: ChannelConfig::Webhook {
                url: "https://example.com/hook".to_string(),
            },
            enabled: true,
            last_triggered_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn evaluator(
        store: Arc<FakeStore>,
        notifier: Arc<FakeNotifier>,
    ) -> AlertEvaluator<FakeStore, FakeNotifier> {
        AlertEvaluator::new(store, notifier, &AlertingConfig::default())
    }

    #[tokio::test]
    async fn test_fires_once_then_cooldown_suppresses() {
        // 150 events in a 1 minute window -> 150/min > 100
        let store = Arc::new(FakeStore::new(vec![rule(1, "events_per_minute")], 150));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = evaluator(store.clone(), notifier.clone());

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert_eq!(report.outcome(1), Some(&RuleOutcome::Fired { value: 150.0 }));
        assert_eq!(store.last_triggered(1), Some(1_000_000));

        let report = eval.tick_at(1_010_000).await.unwrap();
        assert_eq!(report.outcome(1), Some(&RuleOutcome::CoolingDown { value: 150.0 }));
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        assert_eq!(store.last_triggered(1), Some(1_000_000));

        // Cooldown elapsed
        let report = eval.tick_at(1_060_000).await.unwrap();
        assert_eq!(report.fired(), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_fire() {
        let store = Arc::new(FakeStore::new(vec![rule(1, "events_per_minute")], 100));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = evaluator(store.clone(), notifier.clone());

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert_eq!(report.outcome(1), Some(&RuleOutcome::NotTriggered { value: 100.0 }));
        assert_eq!(store.last_triggered(1), None);
    }

    #[tokio::test]
    async fn test_dispatch_failure_leaves_rule_untouched() {
        let store = Arc::new(FakeStore::new(vec![rule(1, "events_per_minute")], 150));
        let notifier = Arc::new(FakeNotifier::default());
        notifier.failing.store(true, Ordering::SeqCst);
        let eval = evaluator(store.clone(), notifier.clone());

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert_eq!(report.outcome(1), Some(&RuleOutcome::DispatchFailed { value: 150.0 }));
        assert_eq!(store.last_triggered(1), None);

        // Next tick retries without waiting out a cooldown
        notifier.failing.store(false, Ordering::SeqCst);
        let report = eval.tick_at(1_010_000).await.unwrap();
        assert_eq!(report.fired(), 1);
        assert_eq!(store.last_triggered(1), Some(1_010_000));
    }

    #[tokio::test]
    async fn test_failing_rule_does_not_block_others() {
        let store = Arc::new(FakeStore::new(
            vec![rule(1, "bogus_metric"), rule(2, "events_per_minute")],
            150,
        ));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = evaluator(store.clone(), notifier.clone());

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert!(matches!(report.outcome(1), Some(RuleOutcome::Failed(_))));
        assert_eq!(report.outcome(2), Some(&RuleOutcome::Fired { value: 150.0 }));
    }

    #[tokio::test]
    async fn test_oversized_window_fails_only_that_rule() {
        let mut huge = rule(1, "events_per_minute");
        huge.window_minutes = i64::MAX / 1000;
        let store = Arc::new(FakeStore::new(vec![huge, rule(2, "events_per_minute")], 150));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = evaluator(store.clone(), notifier.clone());

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert!(matches!(report.outcome(1), Some(RuleOutcome::Failed(_))));
        assert_eq!(report.outcome(2), Some(&RuleOutcome::Fired { value: 150.0 }));
        assert_eq!(store.last_triggered(1), None);
    }

    #[tokio::test]
    async fn test_sample_metric_with_no_samples_is_zero() {
        let mut r = rule(1, "lcp_p75");
        r.comparator = Comparator::Lt;
        r.threshold = 1.0;
        let store = Arc::new(FakeStore::new(vec![r], 0));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = evaluator(store, notifier);

        let report = eval.tick_at(1_000_000).await.unwrap();
        assert_eq!(report.outcome(1), Some(&RuleOutcome::Fired { value: 0.0 }));
    }

    #[tokio::test]
    async fn test_overlapping_ticks_are_single_flight() {
        let store = Arc::new(FakeStore::new(vec![rule(1, "events_per_minute")], 150));
        let notifier = Arc::new(FakeNotifier {
            delay_ms: 50,
            ..Default::default()
        });
        let eval = evaluator(store.clone(), notifier.clone());

        let (first, second) = tokio::join!(eval.tick_at(1_000_000), eval.tick_at(1_000_000));
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let store = Arc::new(FakeStore::new(vec![rule(1, "events_per_minute")], 150));
        let notifier = Arc::new(FakeNotifier::default());
        let eval = Arc::new(evaluator(store.clone(), notifier.clone()));

        let handle = eval.start();
        // The first interval tick completes immediately
        time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        assert!(store.last_triggered(1).is_some());
    }
}
