/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::TrialError,
    provisioner::ReportedSpec,
    resources::ResourceConfiguration,
    telemetry::{TelemetryAverages, TelemetryGap, TelemetrySample},
    trial::{MonitoringAverages, TrialResult},
    workload::WorkloadOutcome,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

const MAX_NAME_ATTEMPTS: usize = 8;

/// The durable artifact of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub name: String,
    pub stack: String,
    pub workload: String,
    pub repetition: u32,
    pub configuration: ResourceConfiguration,
    pub instance: Option<String>,
    pub reported_spec: Option<ReportedSpec>,
    pub outcome: Option<WorkloadOutcome>,
    pub samples: Vec<TelemetrySample>,
    pub gaps: Vec<TelemetryGap>,
    pub averages: TelemetryAverages,
    pub monitoring: MonitoringAverages,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub error: Option<TrialError>,
    pub teardown_error: Option<TrialError>,
}
impl TrialRecord {
    pub fn from_result(result: &TrialResult, workload: &str) -> Self {
        Self {
            name: result.name.clone(),
            stack: result.stack.clone(),
            workload: workload.to_string(),
            repetition: result.repetition,
            configuration: result.configuration,
            instance: result.instance.clone(),
            reported_spec: result.reported_spec.clone(),
            outcome: result.workload.clone(),
            samples: result.telemetry.samples.clone(),
            gaps: result.telemetry.gaps.clone(),
            averages: result.telemetry.averages(),
            monitoring: result.monitoring,
            started_at: result.started_at,
            ended_at: result.ended_at,
            duration_secs: result.duration_secs(),
            error: result.error.clone(),
            teardown_error: result.teardown_error.clone(),
        }
    }
}

/// Writes trial records into the results directory without ever replacing an existing file.
#[derive(Debug, Clone)]
pub struct ResultsStore {
    dir: PathBuf,
}
impl ResultsStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))
    }

    /// Saves `record` as `{name}_metrics.json`. When that file exists, a random suffix is added.
    pub fn save_trial(&self, record: &TrialRecord) -> anyhow::Result<PathBuf> {
        self.ensure_dir()?;
        let json = serde_json::to_string_pretty(record)?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{}_metrics.json", record.name)
            } else {
                format!("{}_metrics_{}.json", record.name, nanoid::nanoid!(6))
            };
            let path = self.dir.join(file_name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(json.as_bytes())
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    debug!("saved trial record {}", path.display());
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        }

        Err(anyhow::anyhow!(
            "Could not find a free file name for {}",
            record.name
        ))
    }

    pub fn journal(&self, kind: &str, workload: &str, stack: &str) -> SearchJournal {
        SearchJournal {
            path: self.dir.join(format!("{kind}_{workload}_{stack}.jsonl")),
        }
    }
}

/// Append-only JSON lines file, one line per evaluated configuration.
#[derive(Debug, Clone)]
pub struct SearchJournal {
    path: PathBuf,
}
impl SearchJournal {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, entry: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Allocation;

    fn record() -> TrialRecord {
        let config = ResourceConfiguration::new(
            Allocation::from_cores(0.5, 512),
            Allocation::from_cores(1.0, 1024),
        );
        let result = TrialResult::new(
            "1.get_users-node-postgres-a0.5_512-b1_1024".to_string(),
            "node-postgres",
            config,
            1,
        );
        TrialRecord::from_result(&result, "get_users")
    }

    #[test]
    fn records_are_never_overwritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ResultsStore::new(&dir.path().join("results"));

        let record = record();
        let first = store.save_trial(&record)?;
        let second = store.save_trial(&record)?;

        assert_eq!(
            first.file_name().and_then(|n| n.to_str()),
            Some("1.get_users-node-postgres-a0.5_512-b1_1024_metrics.json")
        );
        assert_ne!(first, second);
        assert_eq!(fs::read_dir(store.dir())?.count(), 2);

        let saved: TrialRecord = serde_json::from_str(&fs::read_to_string(&first)?)?;
        assert_eq!(saved, record);
        Ok(())
    }

    #[test]
    fn journal_appends_one_line_per_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let journal = ResultsStore::new(dir.path()).journal("search", "get_users", "node-mysql");

        journal.append(&serde_json::json!({ "iteration": 1 }))?;
        journal.append(&serde_json::json!({ "iteration": 2 }))?;

        assert!(journal.path().ends_with("search_get_users_node-mysql.jsonl"));
        let text = fs::read_to_string(journal.path())?;
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], r#"{"iteration":2}"#);
        Ok(())
    }
}
