/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod k6;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRequest {
    pub script: PathBuf,
    /// Address of component A, handed to the script as `BASE_URL`.
    pub base_url: String,
    /// Where to write the load generator's raw per-request output, if anywhere.
    pub raw_output: Option<PathBuf>,
}

/// What the load generator reported for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadOutcome {
    pub exit_code: Option<i32>,
    /// The load generator's own threshold verdict, when its exit code tells us.
    pub thresholds_ok: Option<bool>,
    /// Fraction of failed requests.
    pub error_rate: Option<f64>,
    /// Request duration statistics in milliseconds keyed `avg`, `med`, `p(95)` etc.
    pub latency: BTreeMap<String, f64>,
    pub summary: Option<serde_json::Value>,
    pub raw_output: Option<PathBuf>,
}
impl WorkloadOutcome {
    pub fn latency(&self, stat: &str) -> Option<f64> {
        self.latency.get(stat).copied()
    }
}

#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    /// Runs the workload to completion. Returns an error only when the load generator could not
    /// be run or produced nothing usable.
    async fn invoke(&self, request: &WorkloadRequest) -> anyhow::Result<WorkloadOutcome>;
}
