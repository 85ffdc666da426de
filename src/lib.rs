/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod error;
pub mod experiment;
pub mod persistence;
pub mod provisioner;
pub mod resources;
pub mod retry;
pub mod search;
pub mod summary;
pub mod telemetry;
pub mod thresholds;
pub mod trial;
pub mod verdict;
pub mod workload;

use anyhow::Context;
use colored::Colorize;
use config::{Config, SamplerKind};
use error::TrialError;
use experiment::Experiment;
use persistence::ResultsStore;
use provisioner::{compose::ComposeProvisioner, InstanceProvisioner};
use search::{Evaluation, SearchOutcome};
use std::{fs, path::Path, sync::Arc};
use telemetry::{
    docker::DockerSampler,
    prometheus::{MonitoringQuery, PrometheusClient},
    ssh::SshSampler,
    ResourceSampler,
};
use thresholds::ThresholdSet;
use tracing::{error, info};
use trial::{TrialRunner, TrialTarget};
use workload::{k6::K6Runner, WorkloadRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Search,
    Sweep,
}
impl Mode {
    fn journal_kind(&self) -> &'static str {
        match self {
            Mode::Search => "search",
            Mode::Sweep => "sweep",
        }
    }
}

/// The implementations of every external collaborator a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn InstanceProvisioner>,
    pub workload: Arc<dyn WorkloadRunner>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub monitoring: Option<Arc<dyn MonitoringQuery>>,
}
impl Collaborators {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let provisioner = ComposeProvisioner::connect(config.compose.clone())?;

        let sampler: Arc<dyn ResourceSampler> = match config.sampler.kind {
            SamplerKind::Docker => Arc::new(DockerSampler::connect()?),
            SamplerKind::Ssh => {
                let ssh = config
                    .sampler
                    .ssh
                    .clone()
                    .context("The ssh sampler needs a [sampler.ssh] section or --ssh-host")?;
                Arc::new(SshSampler::new(ssh))
            }
        };

        let monitoring = config
            .monitoring
            .prometheus_url
            .as_deref()
            .map(|url| Arc::new(PrometheusClient::new(url)) as Arc<dyn MonitoringQuery>);

        Ok(Self {
            provisioner: Arc::new(provisioner),
            workload: Arc::new(K6Runner::new(
                &config.workload.k6_binary,
                config.workload.timeout(),
            )),
            sampler,
            monitoring,
        })
    }
}

#[derive(Debug)]
pub enum StackOutcome {
    Searched(SearchOutcome),
    Swept(Vec<Evaluation>),
    /// An unrecoverable setup failure stopped this stack.
    Halted(TrialError),
}

/// Name of the workload as it appears in trial names: the script's file stem.
pub fn workload_name(script: &Path) -> String {
    script
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "workload".to_string())
}

/// Runs a search (or sweep) for every stack, one after the other.
///
/// # Arguments
///
/// * mode - Search for the minimal configuration or sweep the whole grid.
/// * config - Loaded configuration with command line overrides applied.
/// * stacks - Stacks to evaluate, in order.
/// * script - The k6 script every trial runs.
/// * collaborators - Provisioner, workload runner, sampler and monitoring service.
///
/// # Returns
///
/// One outcome per stack. Only preflight failures (unreachable provisioner, unreadable script,
/// invalid ranges) are returned as errors.
pub async fn run(
    mode: Mode,
    config: &Config,
    stacks: &[String],
    script: &Path,
    collaborators: Collaborators,
) -> anyhow::Result<Vec<(String, StackOutcome)>> {
    let search_config = config.search.to_search_config();
    search_config.validate()?;

    collaborators
        .provisioner
        .ensure_reachable()
        .await
        .context("The provisioner is not reachable")?;

    let script_text = fs::read_to_string(script)
        .with_context(|| format!("Unable to read workload script {}", script.display()))?;
    let thresholds = thresholds::extract(&script_text);
    summary::print_thresholds(&thresholds);

    let store = ResultsStore::new(&config.results_dir);
    store.ensure_dir()?;
    let workload = workload_name(script);

    let mut outcomes = vec![];
    for stack in stacks {
        println!(
            "\n> {} {} with {}",
            mode.journal_kind(),
            stack.green(),
            workload.green()
        );
        info!("starting {} of stack {}", mode.journal_kind(), stack);

        let experiment = experiment(
            config,
            &collaborators,
            stack,
            &workload,
            script,
            &thresholds,
            &store,
        );
        let journal = store.journal(mode.journal_kind(), &workload, stack);

        let outcome = match mode {
            Mode::Search => search::run_search(&search_config, &experiment, Some(&journal))
                .await
                .map(StackOutcome::Searched),
            Mode::Sweep => search::run_sweep(&search_config, &experiment, Some(&journal))
                .await
                .map(StackOutcome::Swept),
        };

        let outcome = match outcome {
            Ok(outcome) => {
                match &outcome {
                    StackOutcome::Searched(searched) => {
                        summary::print_search_summary(stack, searched)
                    }
                    StackOutcome::Swept(evaluations) => summary::print_sweep_summary(
                        stack,
                        evaluations,
                        &search_config.stop_rule,
                        search_config.target.searched(),
                    ),
                    StackOutcome::Halted(_) => {}
                }
                outcome
            }
            Err(err) => {
                error!("stack {} halted: {}", stack, err);
                println!("{} {} halted: {}", "✗".red(), stack.red(), err);
                StackOutcome::Halted(err)
            }
        };
        outcomes.push((stack.clone(), outcome));
    }

    Ok(outcomes)
}

fn experiment(
    config: &Config,
    collaborators: &Collaborators,
    stack: &str,
    workload: &str,
    script: &Path,
    thresholds: &ThresholdSet,
    store: &ResultsStore,
) -> Experiment {
    let runner = TrialRunner::new(
        collaborators.provisioner.clone(),
        collaborators.workload.clone(),
        collaborators.sampler.clone(),
        collaborators.monitoring.clone(),
        config.trial.clone(),
    );
    let target = TrialTarget {
        stack: stack.to_string(),
        workload: workload.to_string(),
        script: script.to_path_buf(),
        raw_output_dir: config
            .workload
            .raw_output
            .then(|| store.dir().to_path_buf()),
    };
    Experiment::new(
        runner,
        target,
        thresholds.clone(),
        config.repetitions,
        store.clone(),
    )
}
