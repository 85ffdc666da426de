/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    resources::{Component, Dimension, ResourceConfiguration},
    telemetry::{mean_of, ComponentReading},
    thresholds::{Threshold, ThresholdMetric, ThresholdSet},
    trial::TrialResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A component is CPU bound when its average usage exceeds this share of its CPU allocation.
pub const CPU_BOTTLENECK_FRACTION: f64 = 0.85;
/// A component is memory bound when its average usage exceeds this share of its RAM allocation.
pub const RAM_BOTTLENECK_FRACTION: f64 = 0.80;

/// Which bottlenecks count against a configuration that meets every threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRule {
    #[serde(default = "enabled")]
    pub cpu_bottleneck: bool,
    #[serde(default = "enabled")]
    pub ram_bottleneck: bool,
}
fn enabled() -> bool {
    true
}
impl Default for StopRule {
    fn default() -> Self {
        Self {
            cpu_bottleneck: true,
            ram_bottleneck: true,
        }
    }
}
impl StopRule {
    pub fn applies_to(&self, dimension: Dimension) -> bool {
        match dimension {
            Dimension::Cpu => self.cpu_bottleneck,
            Dimension::Ram => self.ram_bottleneck,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub name: String,
    pub threshold: Threshold,
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentVerdict {
    pub usage: ComponentReading,
    pub cpu_bottleneck: bool,
    pub ram_bottleneck: bool,
}
impl ComponentVerdict {
    pub fn bottleneck(&self, dimension: Dimension) -> bool {
        match dimension {
            Dimension::Cpu => self.cpu_bottleneck,
            Dimension::Ram => self.ram_bottleneck,
        }
    }
}

/// Averages and pass/fail flags for one configuration across its repetitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub configuration: Option<ResourceConfiguration>,
    pub repetitions: usize,
    pub failed_repetitions: usize,
    pub error_rate: Option<f64>,
    /// Latency statistics named by a threshold, in milliseconds.
    pub latency: BTreeMap<String, Option<f64>>,
    pub host_cpu_pct: Option<f64>,
    pub host_mem_used_mb: Option<f64>,
    pub host_mem_unavailable_mb: Option<f64>,
    pub component_a: ComponentVerdict,
    pub component_b: ComponentVerdict,
    pub thresholds: Vec<ThresholdVerdict>,
}
impl Verdict {
    pub fn component(&self, component: Component) -> &ComponentVerdict {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }

    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn bottleneck(&self, component: Component, dimension: Dimension) -> bool {
        self.component(component).bottleneck(dimension)
    }

    /// True when every threshold passes and none of `searched` is bottlenecked on a dimension
    /// the stop rule checks.
    pub fn passed(&self, rule: &StopRule, searched: &[Component]) -> bool {
        self.thresholds_passed()
            && !searched.iter().any(|c| {
                [Dimension::Cpu, Dimension::Ram]
                    .into_iter()
                    .any(|d| rule.applies_to(d) && self.bottleneck(*c, d))
            })
    }
}

/// Usage of one component in one repetition. The sampler is the primary source, the monitoring
/// service fills in what the sampler did not see.
fn reconciled_usage(result: &TrialResult, component: Component) -> ComponentReading {
    let sampled = *result.telemetry.averages().component(component);
    let monitored = *result.monitoring.component(component);
    ComponentReading {
        cpu_pct: sampled.cpu_pct.or(monitored.cpu_pct),
        mem_mb: sampled.mem_mb.or(monitored.mem_mb),
    }
}

fn observed(results: &[TrialResult], metric: &ThresholdMetric) -> Option<f64> {
    let values = results.iter().map(|r| {
        let outcome = r.workload.as_ref()?;
        match metric {
            ThresholdMetric::ErrorRate => outcome.error_rate,
            ThresholdMetric::Latency(stat) => outcome.latency(stat),
        }
    });
    mean_of(values)
}

/// Reduces the repetitions of one configuration to a single verdict. Each metric is averaged over
/// the repetitions that produced it; the result does not depend on the order of `results`.
pub fn aggregate(results: &[TrialResult], thresholds: &ThresholdSet) -> Verdict {
    let configuration = results.first().map(|r| r.configuration);

    let thresholds_out = thresholds
        .iter()
        .map(|(name, threshold)| {
            let value = observed(results, &threshold.metric);
            ThresholdVerdict {
                name: name.to_string(),
                threshold: threshold.clone(),
                observed: value,
                passed: threshold.passes(value),
            }
        })
        .collect::<Vec<_>>();

    let latency = thresholds
        .iter()
        .filter_map(|(name, t)| match &t.metric {
            ThresholdMetric::Latency(_) => Some((name.to_string(), observed(results, &t.metric))),
            ThresholdMetric::ErrorRate => None,
        })
        .collect();

    let per_run = results
        .iter()
        .map(|r| r.telemetry.averages())
        .collect::<Vec<_>>();

    let component = |c: Component| {
        let usage = ComponentReading {
            cpu_pct: mean_of(results.iter().map(|r| reconciled_usage(r, c).cpu_pct)),
            mem_mb: mean_of(results.iter().map(|r| reconciled_usage(r, c).mem_mb)),
        };
        let allocation = configuration.map(|config| *config.get(c));
        ComponentVerdict {
            usage,
            cpu_bottleneck: match (usage.cpu_pct, allocation) {
                (Some(cpu), Some(alloc)) => {
                    cpu > CPU_BOTTLENECK_FRACTION * alloc.cpu_percent_ceiling()
                }
                _ => false,
            },
            ram_bottleneck: match (usage.mem_mb, allocation) {
                (Some(mem), Some(alloc)) => mem > RAM_BOTTLENECK_FRACTION * alloc.ram_mib as f64,
                _ => false,
            },
        }
    };

    Verdict {
        configuration,
        repetitions: results.len(),
        failed_repetitions: results.iter().filter(|r| !r.succeeded()).count(),
        error_rate: observed(results, &ThresholdMetric::ErrorRate),
        latency,
        host_cpu_pct: mean_of(per_run.iter().map(|avg| avg.host_cpu_pct)),
        host_mem_used_mb: mean_of(per_run.iter().map(|avg| avg.host_mem_used_mb)),
        host_mem_unavailable_mb: mean_of(per_run.iter().map(|avg| avg.host_mem_unavailable_mb)),
        component_a: component(Component::ComponentA),
        component_b: component(Component::ComponentB),
        thresholds: thresholds_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TrialError,
        resources::Allocation,
        telemetry::{TelemetryLog, TelemetrySample},
        thresholds,
        workload::WorkloadOutcome,
    };
    use chrono::Utc;

    fn config() -> ResourceConfiguration {
        ResourceConfiguration::new(
            Allocation::from_cores(1.0, 1024),
            Allocation::from_cores(1.0, 1024),
        )
    }

    fn trial(error_rate: Option<f64>, p95: Option<f64>, usage_a: ComponentReading) -> TrialResult {
        let mut result = TrialResult::new("t".to_string(), "node-postgres", config(), 1);
        result.workload = Some(WorkloadOutcome {
            error_rate,
            latency: p95.map(|v| ("p(95)".to_string(), v)).into_iter().collect(),
            ..Default::default()
        });
        result.telemetry = TelemetryLog {
            samples: vec![TelemetrySample {
                component_a: usage_a,
                ..TelemetrySample::empty(Utc::now())
            }],
            gaps: vec![],
        };
        result
    }

    fn idle() -> ComponentReading {
        ComponentReading {
            cpu_pct: Some(10.0),
            mem_mb: Some(100.0),
        }
    }

    #[test]
    fn unset_observations_are_excluded_from_averages() {
        let results = vec![
            trial(Some(0.0), Some(100.0), idle()),
            trial(Some(0.02), Some(100.0), idle()),
            trial(None, Some(100.0), idle()),
        ];
        let verdict = aggregate(&results, &thresholds::extract("http_req_failed: ['rate<0.01']"));

        assert_eq!(verdict.error_rate, Some(0.01));
        assert_eq!(verdict.thresholds.len(), 1);
        assert!(!verdict.thresholds[0].passed);
        assert!(!verdict.passed(&StopRule::default(), &Component::ALL));
    }

    #[test]
    fn unknown_metric_fails_its_threshold() {
        let results = vec![trial(Some(0.0), None, idle())];
        let verdict = aggregate(&results, &ThresholdSet::defaults());

        let p95 = verdict
            .thresholds
            .iter()
            .find(|t| t.name == "latency_p95")
            .unwrap();
        assert_eq!(p95.observed, None);
        assert!(!p95.passed);
        assert!(!verdict.thresholds_passed());
    }

    #[test]
    fn aggregation_ignores_order() {
        let mut results = vec![
            trial(Some(0.1), Some(480.3), idle()),
            trial(Some(0.2), Some(12.7), idle()),
            trial(Some(0.3), Some(333.3), idle()),
            trial(None, Some(0.1), idle()),
        ];
        let set = ThresholdSet::defaults();
        let forward = aggregate(&results, &set);
        results.reverse();
        let backward = aggregate(&results, &set);
        results.swap(0, 2);
        let shuffled = aggregate(&results, &set);

        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn bottlenecks_follow_allocation() {
        let busy = ComponentReading {
            cpu_pct: Some(90.0),
            mem_mb: Some(900.0),
        };
        let results = vec![trial(Some(0.0), Some(100.0), busy)];
        let verdict = aggregate(&results, &ThresholdSet::defaults());

        assert!(verdict.thresholds_passed());
        assert!(verdict.bottleneck(Component::ComponentA, Dimension::Cpu));
        assert!(verdict.bottleneck(Component::ComponentA, Dimension::Ram));
        // nothing was observed for component B
        assert!(!verdict.bottleneck(Component::ComponentB, Dimension::Cpu));

        assert!(!verdict.passed(&StopRule::default(), &[Component::ComponentA]));
        assert!(verdict.passed(&StopRule::default(), &[Component::ComponentB]));

        let thresholds_only = StopRule {
            cpu_bottleneck: false,
            ram_bottleneck: false,
        };
        assert!(verdict.passed(&thresholds_only, &Component::ALL));
    }

    #[test]
    fn monitoring_fills_in_missing_sampler_values() {
        let mut result = trial(
            Some(0.0),
            Some(100.0),
            ComponentReading {
                cpu_pct: Some(20.0),
                mem_mb: None,
            },
        );
        result.monitoring.component_a = ComponentReading {
            cpu_pct: Some(99.0),
            mem_mb: Some(300.0),
        };
        let verdict = aggregate(&[result], &ThresholdSet::defaults());

        assert_eq!(verdict.component_a.usage.cpu_pct, Some(20.0));
        assert_eq!(verdict.component_a.usage.mem_mb, Some(300.0));
    }

    #[test]
    fn failed_repetitions_are_counted() {
        let mut failed = TrialResult::new("t".to_string(), "node-postgres", config(), 2);
        failed.error = Some(TrialError::ProvisioningFailed {
            reason: "quota".to_string(),
        });
        let results = vec![trial(Some(0.0), Some(10.0), idle()), failed];
        let verdict = aggregate(&results, &ThresholdSet::defaults());

        assert_eq!(verdict.repetitions, 2);
        assert_eq!(verdict.failed_repetitions, 1);
        assert_eq!(verdict.error_rate, Some(0.0));
    }

    #[test]
    fn empty_input_has_no_configuration() {
        let verdict = aggregate(&[], &ThresholdSet::defaults());
        assert_eq!(verdict.configuration, None);
        assert!(!verdict.thresholds_passed());
        assert!(!verdict.bottleneck(Component::ComponentA, Dimension::Cpu));
    }
}
