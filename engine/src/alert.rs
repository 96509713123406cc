//! Evaluates alerting rules against the metrics backend after a run.
use std::time::Duration;

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::index::{Indexer, IndexingOpts};
use crate::prom::PromClient;

/// Metric name alert documents are indexed under.
pub const ALERT_METRIC_NAME: &str = "alert";

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Logged only.
    Warning,
    /// Aggregated into the run's error tally.
    Error,
    /// Terminates the process with the reserved exit code.
    Critical,
}

/// One alerting rule of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    /// PromQL expression template to evaluate.
    pub expr: String,
    /// Informative description reported when the alert fires.
    pub description: String,
    /// Alert severity.
    pub severity: Severity,
}

/// An alert document emitted to the indexer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Timestamp of the sample that fired the alert.
    pub timestamp: DateTime<Utc>,
    /// Run id the alert belongs to.
    pub uuid: String,
    /// Severity of the rule that fired.
    pub severity: Severity,
    /// Rendered description.
    pub description: String,
    /// Always [`ALERT_METRIC_NAME`].
    pub metric_name: &'static str,
    /// Whether the sample fell inside the job's churn window.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub churn_metric: bool,
}

/// Wall-clock window of a finished job, as seen by the evaluator.
#[derive(Debug, Clone)]
pub struct JobWindow {
    /// Job name, if the window belongs to a named job.
    pub name: Option<String>,
    /// When dispatch started.
    pub start: DateTime<Utc>,
    /// When the job (churn included) finished.
    pub end: DateTime<Utc>,
    /// Churn phase start, when the job churned.
    pub churn_start: Option<DateTime<Utc>>,
    /// Churn phase end, when the job churned.
    pub churn_end: Option<DateTime<Utc>>,
}

/// Evaluates an alert profile against the metrics backend.
pub struct AlertManager {
    profile: Vec<AlertRule>,
    prom: Box<dyn PromClient + Send + Sync>,
    step: Duration,
    uuid: String,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("profile", &self.profile)
            .field("step", &self.step)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl AlertManager {
    /// Parse and validate a profile. Unknown fields and uncompilable
    /// description templates are rejected up front.
    pub fn new(
        profile_yaml: &str,
        uuid: String,
        prom: Box<dyn PromClient + Send + Sync>,
        step: Duration,
    ) -> Result<Self, Error> {
        let profile: Vec<AlertRule> = serde_yaml::from_str(profile_yaml)
            .map_err(|err| Error::Config(format!("alert profile: {err}")))?;
        for rule in &profile {
            handlebars::Template::compile(&rule.expr)
                .map_err(|err| Error::Template(format!("expr '{}': {err}", rule.expr)))?;
            handlebars::Template::compile(&rule.description).map_err(|err| {
                Error::Template(format!("description '{}': {err}", rule.description))
            })?;
        }
        Ok(Self {
            profile,
            prom,
            step,
            uuid,
        })
    }

    /// Evaluate every rule over the job window.
    ///
    /// Returns the number of error-severity alerts; a critical alert indexes
    /// the collected documents and then propagates [`Error::AlertCritical`].
    pub async fn evaluate(
        &self,
        window: &JobWindow,
        indexer: Option<&dyn Indexer>,
    ) -> Result<usize, Error> {
        match &window.name {
            Some(name) => info!(job = name.as_str(), "evaluating alerts"),
            None => info!("evaluating alerts"),
        }
        let registry = Handlebars::new();
        let vars = expr_vars(window);
        let mut alerts = Vec::new();
        let mut critical = None;
        let mut error_alerts = 0;
        for rule in &self.profile {
            let expr = registry
                .render_template(&rule.expr, &vars)
                .map_err(|err| Error::Template(format!("expr '{}': {err}", rule.expr)))?;
            debug!(expr = expr.as_str(), "evaluating expression");
            let data = match self
                .prom
                .query_range(&expr, window.start, window.end, self.step)
                .await
            {
                Ok(data) => data,
                Err(err) => {
                    warn!("error performing query {expr}: {err:#}");
                    continue;
                }
            };
            for series in data.into_matrix()? {
                // The same query can fire one alert per series; only the
                // first sample of a series counts.
                let Some(sample) = series.values.first() else {
                    continue;
                };
                let value = (sample.value * 1000.0).round() / 1000.0;
                let description = registry
                    .render_template(
                        &rule.description,
                        &serde_json::json!({ "Labels": series.metric, "Value": value }),
                    )
                    .map_err(|err| Error::Template(format!("alert rendering error: {err}")))?;
                let churn_metric = matches!(
                    (window.churn_start, window.churn_end),
                    (Some(churn_start), Some(churn_end))
                        if sample.timestamp > churn_start && sample.timestamp < churn_end
                );
                let msg = format!(
                    "alert at {}: '{}'",
                    sample.timestamp.to_rfc3339(),
                    description
                );
                match rule.severity {
                    Severity::Warning => warn!("{msg}"),
                    Severity::Error => {
                        error!("{msg}");
                        error_alerts += 1;
                    }
                    Severity::Critical => {
                        error!("{msg}");
                        critical.get_or_insert(description.clone());
                    }
                }
                alerts.push(Alert {
                    timestamp: sample.timestamp,
                    uuid: self.uuid.clone(),
                    severity: rule.severity,
                    description,
                    metric_name: ALERT_METRIC_NAME,
                    churn_metric,
                });
            }
        }
        self.index(&alerts, indexer)?;
        if let Some(description) = critical {
            return Err(Error::AlertCritical(description));
        }
        Ok(error_alerts)
    }

    fn index(&self, alerts: &[Alert], indexer: Option<&dyn Indexer>) -> Result<(), Error> {
        let Some(indexer) = indexer else {
            return Ok(());
        };
        if alerts.is_empty() {
            return Ok(());
        }
        info!("indexing {} alerts", alerts.len());
        let mut docs = Vec::with_capacity(alerts.len());
        for alert in alerts {
            docs.push(serde_json::to_value(alert).map_err(|err| Error::Other(err.into()))?);
        }
        let opts = IndexingOpts {
            metric_name: ALERT_METRIC_NAME.to_owned(),
        };
        match indexer.index(&docs, &opts) {
            Ok(receipt) => info!("{receipt}"),
            Err(err) => error!("indexing alerts failed: {err:#}"),
        }
        Ok(())
    }
}

/// Variables available to expression templates: every process env var plus
/// the synthetic `elapsed` window duration in minutes.
fn expr_vars(window: &JobWindow) -> Map<String, Value> {
    let mut vars: Map<String, Value> = std::env::vars()
        .map(|(key, value)| (key, Value::from(value)))
        .collect();
    let elapsed = (window.end - window.start).num_minutes();
    vars.insert("elapsed".to_owned(), Value::from(format!("{elapsed}m")));
    vars
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use serde_json::json;
    use unimock::{matching, MockFn, Unimock};

    use crate::prom::{PromClientMock, QueryData};

    use super::*;

    struct MemoryIndexer {
        docs: Mutex<Vec<Value>>,
    }

    impl MemoryIndexer {
        fn new() -> Self {
            Self {
                docs: Mutex::new(Vec::new()),
            }
        }
    }

    impl Indexer for MemoryIndexer {
        fn index(&self, docs: &[Value], _opts: &IndexingOpts) -> anyhow::Result<String> {
            self.docs.lock().expect("docs lock").extend(docs.iter().cloned());
            Ok(format!("indexed {} documents", docs.len()))
        }
    }

    fn window() -> JobWindow {
        JobWindow {
            name: Some("storm".to_owned()),
            start: Utc.timestamp_opt(1000, 0).unwrap(),
            end: Utc.timestamp_opt(1600, 0).unwrap(),
            churn_start: None,
            churn_end: None,
        }
    }

    fn matrix(values: Value) -> QueryData {
        QueryData {
            result_type: "matrix".to_owned(),
            result: values,
        }
    }

    fn manager(profile: &str, prom: Unimock) -> AlertManager {
        AlertManager::new(
            profile,
            "abc123".to_owned(),
            Box::new(prom),
            Duration::from_secs(30),
        )
        .expect("profile should parse")
    }

    const CRITICAL_PROFILE: &str = r#"
- expr: up == 0
  description: "{{ Labels.instance }} down"
  severity: critical
"#;

    #[tokio::test]
    async fn critical_alert_is_fatal_and_indexed() {
        let prom = Unimock::new(
            PromClientMock::query_range
                .next_call(matching!(_, _, _, _))
                .returns(Ok(matrix(json!([
                    {"metric": {"instance": "i1"}, "values": [[1200.0, "0"]]}
                ])))),
        );
        let indexer = MemoryIndexer::new();
        let manager = manager(CRITICAL_PROFILE, prom);
        let err = manager
            .evaluate(&window(), Some(&indexer))
            .await
            .expect_err("critical must be fatal");
        assert!(matches!(err, Error::AlertCritical(_)));
        assert_eq!(err.exit_code(), crate::error::RC_ALERT);

        let docs = indexer.docs.lock().expect("docs lock");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["description"], "i1 down");
        assert_eq!(docs[0]["metricName"], "alert");
        assert_eq!(docs[0]["severity"], "critical");
    }

    #[tokio::test]
    async fn one_alert_per_series_first_sample_only() {
        let prom = Unimock::new(
            PromClientMock::query_range
                .next_call(matching!(_, _, _, _))
                .returns(Ok(matrix(json!([
                    {"metric": {"instance": "i1"}, "values": [[1100.0, "1.23456"], [1130.0, "9"]]},
                    {"metric": {"instance": "i2"}, "values": [[1160.0, "2"]]}
                ])))),
        );
        let indexer = MemoryIndexer::new();
        let profile = r#"
- expr: up == 0
  description: "{{ Labels.instance }}: {{ Value }}"
  severity: warning
"#;
        let manager = manager(profile, prom);
        let errors = manager
            .evaluate(&window(), Some(&indexer))
            .await
            .expect("warnings are not fatal");
        assert_eq!(errors, 0);
        let docs = indexer.docs.lock().expect("docs lock");
        assert_eq!(docs.len(), 2);
        // Value is rounded to three decimals, later samples are dropped.
        assert_eq!(docs[0]["description"], "i1: 1.235");
        assert_eq!(docs[1]["description"], "i2: 2.0");
    }

    #[tokio::test]
    async fn error_alerts_aggregate() {
        let prom = Unimock::new(
            PromClientMock::query_range
                .next_call(matching!(_, _, _, _))
                .returns(Ok(matrix(json!([
                    {"metric": {}, "values": [[1100.0, "1"]]}
                ])))),
        );
        let profile = r#"
- expr: errors_total > 0
  description: "errors observed"
  severity: error
"#;
        let manager = manager(profile, prom);
        let errors = manager
            .evaluate(&window(), None)
            .await
            .expect("error severity aggregates");
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn non_matrix_results_fail() {
        let prom = Unimock::new(
            PromClientMock::query_range
                .next_call(matching!(_, _, _, _))
                .returns(Ok(QueryData {
                    result_type: "vector".to_owned(),
                    result: json!([]),
                })),
        );
        let manager = manager(CRITICAL_PROFILE, prom);
        let err = manager
            .evaluate(&window(), None)
            .await
            .expect_err("vector result is invalid");
        assert!(matches!(err, Error::BadResult(_)));
    }

    #[tokio::test]
    async fn alerts_inside_churn_window_are_tagged() {
        let prom = Unimock::new(
            PromClientMock::query_range
                .next_call(matching!(_, _, _, _))
                .returns(Ok(matrix(json!([
                    {"metric": {}, "values": [[1250.0, "1"]]}
                ])))),
        );
        let indexer = MemoryIndexer::new();
        let profile = r#"
- expr: up == 0
  description: "down"
  severity: warning
"#;
        let manager = manager(profile, prom);
        let mut window = window();
        window.churn_start = Some(Utc.timestamp_opt(1200, 0).unwrap());
        window.churn_end = Some(Utc.timestamp_opt(1400, 0).unwrap());
        manager
            .evaluate(&window, Some(&indexer))
            .await
            .expect("warning is not fatal");
        let docs = indexer.docs.lock().expect("docs lock");
        assert_eq!(docs[0]["churnMetric"], true);
    }

    #[test]
    fn unknown_profile_fields_are_rejected() {
        let profile = r#"
- expr: up == 0
  description: "down"
  severity: warning
  extra: nope
"#;
        let err = AlertManager::new(
            profile,
            "abc123".to_owned(),
            Box::new(Unimock::new(())),
            Duration::from_secs(30),
        )
        .expect_err("unknown field must be rejected");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn expr_vars_carry_env_and_elapsed() {
        std::env::set_var("KINDLING_TEST_VAR", "42");
        let vars = expr_vars(&window());
        assert_eq!(vars.get("elapsed"), Some(&Value::from("10m")));
        assert_eq!(vars.get("KINDLING_TEST_VAR"), Some(&Value::from("42")));
    }
}
