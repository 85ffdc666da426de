/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{WorkloadOutcome, WorkloadRequest, WorkloadRunner};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code k6 uses when the run completed but thresholds were crossed.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

pub struct K6Runner {
    binary: String,
    timeout: Duration,
}
impl K6Runner {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    fn summary_path() -> PathBuf {
        std::env::temp_dir().join(format!("minima-k6-summary-{}.json", nanoid::nanoid!(10)))
    }
}

#[async_trait]
impl WorkloadRunner for K6Runner {
    async fn invoke(&self, request: &WorkloadRequest) -> anyhow::Result<WorkloadOutcome> {
        let summary_path = Self::summary_path();

        let mut cmd = Command::new(&self.binary);
        cmd.arg("run").arg("--summary-export").arg(&summary_path);
        if let Some(raw) = &request.raw_output {
            cmd.arg("--out").arg(format!("json={}", raw.display()));
        }
        cmd.arg("--env")
            .arg(format!("BASE_URL={}", request.base_url))
            .arg(&request.script)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            "running k6 script {} against {}",
            request.script.display(),
            request.base_url
        );
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("k6 did not finish within {:?}", self.timeout))?
            .with_context(|| format!("Failed to run {}", self.binary))?;

        let exit_code = output.status.code();
        let summary = match tokio::fs::read_to_string(&summary_path).await {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .map_err(|err| warn!("k6 summary is not valid json: {}", err))
                .ok(),
            Err(_) => None,
        };
        if let Err(err) = tokio::fs::remove_file(&summary_path).await {
            debug!("could not remove {}: {}", summary_path.display(), err);
        }

        let Some(summary) = summary else {
            anyhow::bail!(
                "k6 exited with {:?} and wrote no summary: {}",
                exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        };

        let mut outcome = parse_summary(&summary);
        outcome.exit_code = exit_code;
        outcome.thresholds_ok = match exit_code {
            Some(0) => Some(true),
            Some(THRESHOLDS_FAILED_EXIT_CODE) => Some(false),
            _ => None,
        };
        outcome.raw_output = request.raw_output.clone();
        outcome.summary = Some(summary);
        Ok(outcome)
    }
}

/// Reads error rate and request duration statistics from a k6 summary. Handles both the
/// `--summary-export` layout (stats directly on the metric, rate as `value`) and the newer
/// layout where stats sit under `values`.
pub fn parse_summary(summary: &Value) -> WorkloadOutcome {
    let metrics = summary.get("metrics");
    let metric = |name: &str| {
        metrics
            .and_then(|m| m.get(name))
            .map(|m| m.get("values").unwrap_or(m))
    };

    let error_rate = metric("http_req_failed").and_then(|m| {
        m.get("rate")
            .or_else(|| m.get("value"))
            .and_then(Value::as_f64)
    });

    let latency = metric("http_req_duration")
        .and_then(Value::as_object)
        .map(|stats| {
            stats
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    WorkloadOutcome {
        error_rate,
        latency,
        ..Default::default()
    }
}
