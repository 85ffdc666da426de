/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use async_trait::async_trait;
use chrono::Utc;
use minima::{
    config::Config,
    error::TrialError,
    provisioner::{
        InstanceHandle, InstanceProvisioner, ReportedAllocation, ReportedSpec, Teardown,
    },
    resources::{Allocation, Component, Dimension, ResourceConfiguration},
    retry::RetryPolicy,
    search::{self, Decision, Evaluator, SearchConfig, SearchState},
    telemetry::{ComponentReading, ResourceSampler, SampleTargets, TelemetrySample},
    thresholds::{Threshold, ThresholdMetric},
    trial::TrialSettings,
    verdict::{ComponentVerdict, ThresholdVerdict, Verdict},
    workload::{WorkloadOutcome, WorkloadRequest, WorkloadRunner},
    Collaborators, Mode, StackOutcome,
};
use std::{
    collections::BTreeMap,
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A stack that needs `need` on both components and answers like a real one would.
struct Lab {
    need: Allocation,
    current: Mutex<Option<(String, ResourceConfiguration)>>,
}
impl Lab {
    fn new(need: Allocation) -> Arc<Self> {
        Arc::new(Self {
            need,
            current: Mutex::new(None),
        })
    }

    fn current(&self) -> anyhow::Result<(String, ResourceConfiguration)> {
        self.current
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no instance"))
    }

    fn reading(&self, allocation: Allocation) -> ComponentReading {
        let cpu = if allocation.cpu_millis >= self.need.cpu_millis {
            self.need.cpu_millis as f64 * 0.6 / 10.0
        } else {
            allocation.cpu_percent_ceiling()
        };
        let mem = if allocation.ram_mib >= self.need.ram_mib {
            self.need.ram_mib as f64 * 0.5
        } else {
            allocation.ram_mib as f64 * 0.95
        };
        ComponentReading {
            cpu_pct: Some(cpu),
            mem_mb: Some(mem),
        }
    }
}

#[async_trait]
impl InstanceProvisioner for Lab {
    async fn ensure_reachable(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        stack: &str,
        config: &ResourceConfiguration,
    ) -> Result<InstanceHandle, TrialError> {
        if stack == "broken" {
            return Err(TrialError::UnrecoverableSetup {
                reason: "quota exceeded".to_string(),
            });
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some((stack.to_string(), *config));
        }
        Ok(InstanceHandle {
            name: "lab-1".to_string(),
            stack: stack.to_string(),
            containers: SampleTargets {
                component_a: "lab-1-backend-1".to_string(),
                component_b: "lab-1-database-1".to_string(),
            },
        })
    }

    async fn poll_ready(&self, _handle: &InstanceHandle) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn refresh(&self, _handle: &InstanceHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resolve_address(&self, _handle: &InstanceHandle) -> anyhow::Result<Option<String>> {
        Ok(Some("http://127.0.0.1:3000".to_string()))
    }

    async fn read_reported_spec(&self, _handle: &InstanceHandle) -> anyhow::Result<ReportedSpec> {
        let (stack, config) = self.current()?;
        let reported = |a: Allocation| ReportedAllocation {
            cpu_millis: Some(a.cpu_millis),
            ram_mib: Some(a.ram_mib),
        };
        Ok(ReportedSpec {
            stack: Some(stack),
            component_a: reported(config.component_a),
            component_b: reported(config.component_b),
        })
    }

    async fn destroy(&self, _handle: &InstanceHandle) -> anyhow::Result<Teardown> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?;
        Ok(match current.take() {
            Some(_) => Teardown::Removed,
            None => Teardown::AlreadyAbsent,
        })
    }
}

#[async_trait]
impl WorkloadRunner for Lab {
    async fn invoke(&self, _request: &WorkloadRequest) -> anyhow::Result<WorkloadOutcome> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let (_, config) = self.current()?;
        let enough = config.component_a.covers(&self.need) && config.component_b.covers(&self.need);
        Ok(WorkloadOutcome {
            exit_code: Some(0),
            error_rate: Some(if enough { 0.0 } else { 0.08 }),
            latency: [("p(95)".to_string(), if enough { 180.0 } else { 2400.0 })]
                .into_iter()
                .collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ResourceSampler for Lab {
    async fn sample(&self, _targets: &SampleTargets) -> anyhow::Result<TelemetrySample> {
        let (_, config) = self.current()?;
        Ok(TelemetrySample {
            host_cpu_pct: Some(30.0),
            component_a: self.reading(config.component_a),
            component_b: self.reading(config.component_b),
            ..TelemetrySample::empty(Utc::now())
        })
    }
}

fn fast_trials() -> TrialSettings {
    let quick = |n| RetryPolicy::fixed(n, Duration::from_millis(1));
    TrialSettings {
        ready: quick(3),
        address: quick(3),
        refresh_every: 2,
        spec: quick(2),
        teardown: quick(3),
        sample_interval_secs: 0.005,
        monitoring_settle_secs: 0.0,
    }
}

#[tokio::test]
async fn run_finds_the_smallest_configuration_and_moves_past_broken_stacks() -> anyhow::Result<()>
{
    let dir = tempfile::tempdir()?;
    let script = dir.path().join("get_users.js");
    fs::write(
        &script,
        "export const options = { thresholds: { http_req_failed: ['rate<0.01'] } };",
    )?;

    let config = Config {
        results_dir: dir.path().join("results"),
        repetitions: 1,
        trial: fast_trials(),
        ..Config::default()
    };
    let lab = Lab::new(Allocation::from_cores(1.5, 1024));
    let collaborators = Collaborators {
        provisioner: lab.clone(),
        workload: lab.clone(),
        sampler: lab,
        monitoring: None,
    };
    let stacks = vec!["broken".to_string(), "node-postgres".to_string()];

    let outcomes = minima::run(Mode::Search, &config, &stacks, &script, collaborators).await?;

    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        &outcomes[0],
        (stack, StackOutcome::Halted(TrialError::UnrecoverableSetup { .. })) if stack == "broken"
    ));
    let StackOutcome::Searched(outcome) = &outcomes[1].1 else {
        anyhow::bail!("node-postgres was not searched");
    };
    let expected = Allocation::from_cores(1.5, 1024);
    assert_eq!(
        outcome.minimal_configuration(),
        Some(ResourceConfiguration::new(expected, expected))
    );
    assert_eq!(outcome.iterations(), 4);

    let journal = fs::read_to_string(
        config
            .results_dir
            .join("search_get_users_node-postgres.jsonl"),
    )?;
    assert_eq!(journal.lines().count(), 4);

    let records = fs::read_dir(&config.results_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with("_metrics.json"))
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 5);
    // the halted stack keeps the record of the trial that stopped it
    assert_eq!(records.iter().filter(|n| n.contains("-broken-")).count(), 1);
    assert_eq!(
        records.iter().filter(|n| n.contains("-node-postgres-")).count(),
        4
    );
    Ok(())
}

/// Fails every configuration and blames a different dimension each time.
struct NeverEnough {
    seen: Mutex<Vec<ResourceConfiguration>>,
}

#[async_trait]
impl Evaluator for NeverEnough {
    async fn evaluate(&self, configuration: ResourceConfiguration) -> Result<Verdict, TrialError> {
        let round = {
            let mut seen = self.seen.lock().map_err(|_| TrialError::UnrecoverableSetup {
                reason: "poisoned".to_string(),
            })?;
            seen.push(configuration);
            seen.len()
        };
        let blamed = ComponentVerdict {
            usage: ComponentReading::default(),
            cpu_bottleneck: round % 2 == 1,
            ram_bottleneck: round % 3 == 0,
        };
        Ok(Verdict {
            configuration: Some(configuration),
            repetitions: 1,
            failed_repetitions: 0,
            error_rate: Some(0.2),
            latency: BTreeMap::new(),
            host_cpu_pct: None,
            host_mem_used_mb: None,
            host_mem_unavailable_mb: None,
            component_a: blamed,
            component_b: ComponentVerdict::default(),
            thresholds: vec![ThresholdVerdict {
                name: "error_rate".to_string(),
                threshold: Threshold::strict(ThresholdMetric::ErrorRate, 0.01),
                observed: Some(0.2),
                passed: false,
            }],
        })
    }
}

#[tokio::test]
async fn search_never_shrinks_and_stays_within_its_bound() -> anyhow::Result<()> {
    let config = SearchConfig::default();
    let evaluator = NeverEnough {
        seen: Mutex::new(vec![]),
    };

    let outcome = search::run_search(&config, &evaluator, None).await?;

    assert!(matches!(outcome.final_state, SearchState::Exhausted(_)));
    assert!(matches!(
        outcome.history.last().map(|e| &e.decision),
        Some(Decision::Exhausted { .. })
    ));

    let cpu_steps = (config.cpu_max_millis - config.cpu_min_millis).div_ceil(config.cpu_step_millis);
    let ram_steps = (config.ram_max_mib as f64 / config.ram_min_mib as f64)
        .log2()
        .ceil() as u32;
    assert!(outcome.iterations() as u32 <= cpu_steps + ram_steps + 1);

    for pair in outcome.history.windows(2) {
        for component in Component::ALL {
            let (before, after) = (
                pair[0].configuration.get(component),
                pair[1].configuration.get(component),
            );
            assert!(after.covers(&before), "{before} shrank to {after}");
            assert!(
                [Dimension::Cpu, Dimension::Ram]
                    .into_iter()
                    .filter(|d| after.get(*d) != before.get(*d))
                    .count()
                    <= 1
            );
        }
    }

    let ceiling = Allocation::new(config.cpu_max_millis, config.ram_max_mib);
    assert_eq!(
        outcome.final_configuration,
        ResourceConfiguration::new(ceiling, ceiling)
    );
    Ok(())
}
