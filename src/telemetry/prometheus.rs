/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::resources::Dimension;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Shortest window the monitoring service is asked to average over.
pub const MIN_WINDOW: Duration = Duration::from_secs(30);

/// Secondary telemetry source. Answers "what was the average usage of this container over the
/// `window` ending at `at`", with CPU in percent of one core and memory in MiB.
#[async_trait]
pub trait MonitoringQuery: Send + Sync {
    async fn query_average(
        &self,
        dimension: Dimension,
        container: &str,
        window: Duration,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<f64>>;
}

/// Queries cAdvisor metrics through the Prometheus HTTP API.
pub struct PrometheusClient {
    base_url: String,
    client: reqwest::Client,
}
impl PrometheusClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MonitoringQuery for PrometheusClient {
    async fn query_average(
        &self,
        dimension: Dimension,
        container: &str,
        window: Duration,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<f64>> {
        let query = build_query(dimension, container, window);
        debug!("prometheus query: {}", query);
        let time = at.timestamp().to_string();

        let resp = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[
                ("query", query.as_str()),
                ("time", time.as_str()),
            ])
            .send()
            .await
            .context("Error querying Prometheus")?
            .error_for_status()
            .context("Prometheus rejected the query")?;

        let json_obj: Value = resp.json().await?;
        Ok(try_parse_value(&json_obj).map(|v| match dimension {
            Dimension::Cpu => v * 100.0,
            Dimension::Ram => v / (1024.0 * 1024.0),
        }))
    }
}

pub fn build_query(dimension: Dimension, container: &str, window: Duration) -> String {
    let secs = window.max(MIN_WINDOW).as_secs();
    match dimension {
        Dimension::Cpu => format!(
            "avg_over_time(rate(container_cpu_usage_seconds_total{{name=\"{container}\"}}[10s])[{secs}s:10s])"
        ),
        Dimension::Ram => {
            format!("avg_over_time(container_memory_usage_bytes{{name=\"{container}\"}}[{secs}s])")
        }
    }
}

/// First sample value of an instant-vector response, `None` when the vector is empty.
fn try_parse_value(json_obj: &Value) -> Option<f64> {
    if json_obj.get("status")?.as_str()? != "success" {
        return None;
    }
    json_obj
        .get("data")?
        .get("result")?
        .get(0)?
        .get("value")?
        .get(1)?
        .as_str()?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
