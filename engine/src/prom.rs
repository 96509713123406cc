//! Query surface of the metrics backend consumed by the alert evaluator.
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use unimock::unimock;

use crate::error::Error;

/// Define the behavior we consume from the metrics backend API.
#[unimock(api = PromClientMock)]
#[async_trait]
pub trait PromClient {
    /// Range-query `expr` over `[start, end]` with the given step.
    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryData>;
}

/// Parsed `data` object of a range query response.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryData {
    /// Result shape reported by the backend, e.g. `matrix`.
    #[serde(rename = "resultType")]
    pub result_type: String,
    /// Raw result payload; its shape depends on `result_type`.
    pub result: serde_json::Value,
}

impl QueryData {
    /// Interpret the result as a matrix, the only shape a range query may
    /// legitimately produce here.
    pub fn into_matrix(self) -> Result<Vec<Series>, Error> {
        if self.result_type != "matrix" {
            return Err(Error::BadResult(format!(
                "unsupported result format: {}",
                self.result_type
            )));
        }
        serde_json::from_value(self.result).map_err(|err| Error::BadResult(err.to_string()))
    }
}

/// One labeled series of a matrix result.
#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    /// Label set identifying the series.
    pub metric: BTreeMap<String, String>,
    /// Ordered `[timestamp, value]` samples.
    pub values: Vec<Sample>,
}

/// A single sample. The wire format is `[unix_seconds, "value"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "(f64, String)")]
pub struct Sample {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sample value.
    pub value: f64,
}

impl TryFrom<(f64, String)> for Sample {
    type Error = String;

    fn try_from((ts, value): (f64, String)) -> Result<Self, Self::Error> {
        let timestamp = DateTime::from_timestamp(ts.trunc() as i64, (ts.fract() * 1e9) as u32)
            .ok_or_else(|| format!("timestamp {ts} out of range"))?;
        let value = value
            .parse::<f64>()
            .map_err(|err| format!("sample value: {err}"))?;
        Ok(Self { timestamp, value })
    }
}

/// HTTP client for a Prometheus-compatible backend.
pub struct HttpPromClient {
    base: reqwest::Url,
    client: reqwest::Client,
}

impl HttpPromClient {
    /// Build a client for `base`, e.g. `http://prometheus:9090`.
    pub fn new(base: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            base: reqwest::Url::parse(base).context("prometheus url")?,
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .context("building http client")?,
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl PromClient for HttpPromClient {
    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryData> {
        let url = self.base.join("api/v1/query_range")?;
        let resp = self
            .client
            .get(url)
            .query(&[
                ("query", expr.to_owned()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{}s", step.as_secs().max(1))),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("range query failed with status {}", resp.status());
        }
        let body: ApiResponse = resp.json().await?;
        if body.status != "success" {
            anyhow::bail!("range query failed: {}", body.error.unwrap_or_default());
        }
        body.data
            .ok_or_else(|| anyhow::anyhow!("range query response missing data"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn matrix_parses_series_and_samples() {
        let data = QueryData {
            result_type: "matrix".to_owned(),
            result: json!([
                {"metric": {"instance": "i1"}, "values": [[1000.5, "0.25"], [1030.0, "1"]]}
            ]),
        };
        let series = data.into_matrix().expect("matrix parses");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric.get("instance").map(String::as_str), Some("i1"));
        assert_eq!(series[0].values[0].value, 0.25);
        assert_eq!(series[0].values[0].timestamp.timestamp(), 1000);
    }

    #[test]
    fn non_matrix_shapes_are_rejected() {
        let data = QueryData {
            result_type: "vector".to_owned(),
            result: json!([]),
        };
        let err = data.into_matrix().expect_err("vector is not a matrix");
        assert!(matches!(err, Error::BadResult(_)));
    }
}
