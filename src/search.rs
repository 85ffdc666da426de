/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The adaptive search over resource configurations.
//!
//! Starting from the smallest allocation, every configuration is evaluated (N repetitions,
//! aggregated into a [`Verdict`]). A passing configuration ends the search. Otherwise exactly one
//! dimension grows, chosen in a fixed priority order, until the ceilings are reached.

use crate::{
    error::TrialError,
    persistence::SearchJournal,
    resources::{cores_to_millis, Allocation, Component, Dimension, ResourceConfiguration},
    verdict::{StopRule, Verdict},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Which components the search sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTarget {
    /// Both components get the probe allocation in lockstep.
    #[default]
    Both,
    /// Component A is searched, component B stays at the pinned allocation.
    ComponentA,
    /// Component B is searched, component A stays at the pinned allocation.
    ComponentB,
}
impl SearchTarget {
    pub fn searched(&self) -> &'static [Component] {
        match self {
            SearchTarget::Both => &Component::ALL,
            SearchTarget::ComponentA => &[Component::ComponentA],
            SearchTarget::ComponentB => &[Component::ComponentB],
        }
    }
}
impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchTarget::Both => write!(f, "both"),
            SearchTarget::ComponentA => write!(f, "component_a"),
            SearchTarget::ComponentB => write!(f, "component_b"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RamGrowth {
    #[default]
    Double,
    Step {
        step_mib: u64,
    },
}

/// Ranges and increments of one search. CPU values are in millicores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub target: SearchTarget,
    pub cpu_min_millis: u32,
    pub cpu_step_millis: u32,
    pub cpu_max_millis: u32,
    pub ram_min_mib: u64,
    pub ram_max_mib: u64,
    pub ram_growth: RamGrowth,
    /// Allocation of the component that is not searched.
    pub pinned: Allocation,
    pub stop_rule: StopRule,
}
impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            target: SearchTarget::Both,
            cpu_min_millis: cores_to_millis(0.5),
            cpu_step_millis: cores_to_millis(0.5),
            cpu_max_millis: cores_to_millis(4.0),
            ram_min_mib: 512,
            ram_max_mib: 8192,
            ram_growth: RamGrowth::Double,
            pinned: Allocation::from_cores(2.0, 4096),
            stop_rule: StopRule::default(),
        }
    }
}
impl SearchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.cpu_min_millis > 0, "minimum cpu must be positive");
        anyhow::ensure!(self.cpu_step_millis > 0, "cpu step must be positive");
        anyhow::ensure!(
            self.cpu_min_millis <= self.cpu_max_millis,
            "minimum cpu is above maximum cpu"
        );
        anyhow::ensure!(self.ram_min_mib > 0, "minimum ram must be positive");
        anyhow::ensure!(
            self.ram_min_mib <= self.ram_max_mib,
            "minimum ram is above maximum ram"
        );
        if let RamGrowth::Step { step_mib } = self.ram_growth {
            anyhow::ensure!(step_mib > 0, "ram step must be positive");
        }
        Ok(())
    }

    pub fn initial_probe(&self) -> Allocation {
        Allocation::new(self.cpu_min_millis, self.ram_min_mib)
    }

    /// Full configuration for a probe: searched components get the probe, the others the pinned
    /// allocation.
    pub fn configuration(&self, probe: Allocation) -> ResourceConfiguration {
        match self.target {
            SearchTarget::Both => ResourceConfiguration::new(probe, probe),
            SearchTarget::ComponentA => ResourceConfiguration::new(probe, self.pinned),
            SearchTarget::ComponentB => ResourceConfiguration::new(self.pinned, probe),
        }
    }

    pub fn below_ceiling(&self, probe: Allocation, dimension: Dimension) -> bool {
        match dimension {
            Dimension::Cpu => probe.cpu_millis < self.cpu_max_millis,
            Dimension::Ram => probe.ram_mib < self.ram_max_mib,
        }
    }

    /// Grows one dimension of `probe`, clamped to its ceiling.
    pub fn grow(&self, probe: Allocation, dimension: Dimension) -> Allocation {
        match dimension {
            Dimension::Cpu => Allocation {
                cpu_millis: probe
                    .cpu_millis
                    .saturating_add(self.cpu_step_millis)
                    .min(self.cpu_max_millis),
                ..probe
            },
            Dimension::Ram => {
                let grown = match self.ram_growth {
                    RamGrowth::Double => probe.ram_mib.saturating_mul(2),
                    RamGrowth::Step { step_mib } => probe.ram_mib.saturating_add(step_mib),
                };
                Allocation {
                    ram_mib: grown.min(self.ram_max_mib),
                    ..probe
                }
            }
        }
    }

    /// Every probe of the sweep grid, CPU-major. The ceilings are always included.
    pub fn sweep_grid(&self) -> Vec<Allocation> {
        let mut cpus = vec![self.cpu_min_millis];
        let mut rams = vec![self.ram_min_mib];
        let start = self.initial_probe();

        let mut probe = start;
        while self.below_ceiling(probe, Dimension::Cpu) {
            probe = self.grow(probe, Dimension::Cpu);
            cpus.push(probe.cpu_millis);
        }
        let mut probe = start;
        while self.below_ceiling(probe, Dimension::Ram) {
            probe = self.grow(probe, Dimension::Ram);
            rams.push(probe.ram_mib);
        }

        cpus.into_iter()
            .cartesian_product(rams)
            .map(|(cpu, ram)| Allocation::new(cpu, ram))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "probe", rename_all = "snake_case")]
pub enum SearchState {
    Probing(Allocation),
    Passed(Allocation),
    Exhausted(Allocation),
}
impl SearchState {
    pub fn probe(&self) -> Allocation {
        match self {
            SearchState::Probing(p) | SearchState::Passed(p) | SearchState::Exhausted(p) => *p,
        }
    }
}

/// Why the controller moved on from a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Passed,
    Grow {
        dimension: Dimension,
        /// The bottlenecked component that drove the growth, `None` for the fallback.
        bottleneck: Option<Component>,
    },
    Exhausted {
        reason: String,
    },
    /// Sweep mode evaluates every configuration and never decides.
    Recorded,
}
impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Passed => write!(f, "passed"),
            Decision::Grow {
                dimension,
                bottleneck: Some(component),
            } => write!(f, "grow {dimension} ({component} {dimension} bottleneck)"),
            Decision::Grow {
                dimension,
                bottleneck: None,
            } => write!(f, "grow {dimension} (fallback)"),
            Decision::Exhausted { reason } => write!(f, "exhausted: {reason}"),
            Decision::Recorded => write!(f, "recorded"),
        }
    }
}

/// Picks the dimension to grow after a failing verdict. Bottlenecks are checked in the order
/// A-CPU, A-RAM, B-CPU, B-RAM, restricted to searched components and to dimensions below their
/// ceiling. Without a usable bottleneck RAM grows, then CPU.
pub fn choose_growth(
    config: &SearchConfig,
    probe: Allocation,
    verdict: &Verdict,
) -> Option<(Dimension, Option<Component>)> {
    let searched = config.target.searched();
    let bottleneck = Component::ALL
        .into_iter()
        .filter(|c| searched.contains(c))
        .cartesian_product([Dimension::Cpu, Dimension::Ram])
        .find(|(c, d)| verdict.bottleneck(*c, *d) && config.below_ceiling(probe, *d));
    if let Some((component, dimension)) = bottleneck {
        return Some((dimension, Some(component)));
    }

    [Dimension::Ram, Dimension::Cpu]
        .into_iter()
        .find(|d| config.below_ceiling(probe, *d))
        .map(|d| (d, None))
}

/// The transition rule. Terminal states are returned unchanged.
pub fn transition(
    config: &SearchConfig,
    state: SearchState,
    verdict: &Verdict,
) -> (SearchState, Decision) {
    let SearchState::Probing(probe) = state else {
        return (state, Decision::Recorded);
    };

    if verdict.passed(&config.stop_rule, config.target.searched()) {
        return (SearchState::Passed(probe), Decision::Passed);
    }

    match choose_growth(config, probe, verdict) {
        Some((dimension, bottleneck)) => {
            let next = config.grow(probe, dimension);
            if next == probe {
                exhausted(probe)
            } else {
                (
                    SearchState::Probing(next),
                    Decision::Grow {
                        dimension,
                        bottleneck,
                    },
                )
            }
        }
        None => exhausted(probe),
    }
}

fn exhausted(probe: Allocation) -> (SearchState, Decision) {
    (
        SearchState::Exhausted(probe),
        Decision::Exhausted {
            reason: "every searched dimension is at its ceiling and thresholds still fail"
                .to_string(),
        },
    )
}

/// Evaluates one configuration. Only unrecoverable setup failures are errors, everything else is
/// part of the verdict.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, configuration: ResourceConfiguration) -> Result<Verdict, TrialError>;
}

/// One line of the per-stack search journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub target: SearchTarget,
    pub configuration: ResourceConfiguration,
    pub verdict: Verdict,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub configuration: ResourceConfiguration,
    pub verdict: Verdict,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub final_state: SearchState,
    pub final_configuration: ResourceConfiguration,
    pub history: Vec<Evaluation>,
}
impl SearchOutcome {
    pub fn iterations(&self) -> usize {
        self.history.len()
    }

    pub fn minimal_configuration(&self) -> Option<ResourceConfiguration> {
        matches!(self.final_state, SearchState::Passed(_)).then_some(self.final_configuration)
    }
}

fn record(
    journal: Option<&SearchJournal>,
    iteration: u32,
    target: SearchTarget,
    evaluation: &Evaluation,
) {
    let verdict = &evaluation.verdict;
    let thresholds = verdict
        .thresholds
        .iter()
        .map(|t| {
            format!(
                "{}={}({})",
                t.name,
                t.observed.map_or("?".to_string(), |v| format!("{v:.4}")),
                if t.passed { "ok" } else { "fail" }
            )
        })
        .join(",");
    let bottlenecks = Component::ALL
        .into_iter()
        .cartesian_product([Dimension::Cpu, Dimension::Ram])
        .filter(|(c, d)| verdict.bottleneck(*c, *d))
        .map(|(c, d)| format!("{c}.{d}"))
        .join(",");

    info!(
        iteration,
        configuration = %evaluation.configuration,
        error_rate = ?verdict.error_rate,
        latency = ?verdict.latency,
        host_cpu_pct = ?verdict.host_cpu_pct,
        host_mem_used_mb = ?verdict.host_mem_used_mb,
        host_mem_unavailable_mb = ?verdict.host_mem_unavailable_mb,
        a_cpu_pct = ?verdict.component_a.usage.cpu_pct,
        a_mem_mb = ?verdict.component_a.usage.mem_mb,
        b_cpu_pct = ?verdict.component_b.usage.cpu_pct,
        b_mem_mb = ?verdict.component_b.usage.mem_mb,
        thresholds = %thresholds,
        bottlenecks = %bottlenecks,
        failed_repetitions = verdict.failed_repetitions,
        decision = %evaluation.decision,
        "configuration evaluated"
    );

    let Some(journal) = journal else { return };
    let entry = JournalEntry {
        timestamp: Utc::now(),
        iteration,
        target,
        configuration: evaluation.configuration,
        verdict: evaluation.verdict.clone(),
        decision: evaluation.decision.clone(),
    };
    if let Err(err) = journal.append(&entry) {
        warn!("could not append to search journal: {:#}", err);
    }
}

/// Drives the search until a configuration passes or nothing can grow any more.
pub async fn run_search(
    config: &SearchConfig,
    evaluator: &dyn Evaluator,
    journal: Option<&SearchJournal>,
) -> Result<SearchOutcome, TrialError> {
    let mut state = SearchState::Probing(config.initial_probe());
    let mut history = Vec::new();
    let mut iteration = 0;

    while let SearchState::Probing(probe) = state {
        iteration += 1;
        let configuration = config.configuration(probe);
        info!("search iteration {} at {}", iteration, configuration);

        let verdict = evaluator.evaluate(configuration).await?;
        let (next, decision) = transition(config, state, &verdict);

        let evaluation = Evaluation {
            configuration,
            verdict,
            decision,
        };
        record(journal, iteration, config.target, &evaluation);
        history.push(evaluation);
        state = next;
    }

    Ok(SearchOutcome {
        final_state: state,
        final_configuration: config.configuration(state.probe()),
        history,
    })
}

/// Evaluates every configuration of the grid without stopping early.
pub async fn run_sweep(
    config: &SearchConfig,
    evaluator: &dyn Evaluator,
    journal: Option<&SearchJournal>,
) -> Result<Vec<Evaluation>, TrialError> {
    let mut evaluations = Vec::new();
    for (i, probe) in config.sweep_grid().into_iter().enumerate() {
        let configuration = config.configuration(probe);
        info!("sweep point {} at {}", i + 1, configuration);

        let verdict = evaluator.evaluate(configuration).await?;
        let evaluation = Evaluation {
            configuration,
            verdict,
            decision: Decision::Recorded,
        };
        record(journal, i as u32 + 1, config.target, &evaluation);
        evaluations.push(evaluation);
    }
    Ok(evaluations)
}
