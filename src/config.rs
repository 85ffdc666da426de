/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    provisioner::compose::ComposeSettings,
    resources::{cores_to_millis, Allocation},
    search::{RamGrowth, SearchConfig, SearchTarget},
    telemetry::ssh::SshSettings,
    trial::TrialSettings,
    verdict::StopRule,
};
use anyhow::Context;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/minima.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default = "default_compose")]
    pub compose: ComposeSettings,
    #[serde(default)]
    pub workload: WorkloadSection,
    #[serde(default)]
    pub sampler: SamplerSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
    #[serde(default)]
    pub trial: TrialSettings,
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_repetitions() -> u32 {
    3
}
fn default_compose() -> ComposeSettings {
    ComposeSettings {
        up: "docker compose -p {instance} -f stacks/{stack}/docker-compose.yml up -d".to_string(),
        down: "docker compose -p {instance} -f stacks/{stack}/docker-compose.yml down -v"
            .to_string(),
        refresh: None,
        component_a_service: "backend".to_string(),
        component_b_service: "database".to_string(),
        component_a_port: 3000,
        address_host: "127.0.0.1".to_string(),
        stack_label: "minima.stack".to_string(),
        instance_prefix: "minima".to_string(),
    }
}
impl Default for Config {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            repetitions: default_repetitions(),
            search: SearchSection::default(),
            compose: default_compose(),
            workload: WorkloadSection::default(),
            sampler: SamplerSection::default(),
            monitoring: MonitoringSection::default(),
            trial: TrialSettings::default(),
        }
    }
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .with_context(|| format!("Unable to open {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.search.to_search_config().validate()?;
        config.trial.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to the built in defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
        if path.exists() {
            Config::try_from_path(path)
        } else {
            tracing::info!("{} not found, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Command line flags win over the file.
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(repetitions) = overrides.repetitions {
            self.repetitions = repetitions;
        }
        if let Some(dir) = &overrides.results_dir {
            self.results_dir = dir.clone();
        }

        if let Some(host) = &overrides.ssh_host {
            self.sampler.kind = SamplerKind::Ssh;
            let ssh = self.sampler.ssh.get_or_insert_with(|| SshSettings {
                host: host.clone(),
                user: whoami(),
                key_path: None,
                port: 22,
                timeout_secs: 15,
            });
            ssh.host = host.clone();
        }
        if let Some(ssh) = self.sampler.ssh.as_mut() {
            if let Some(user) = &overrides.ssh_user {
                ssh.user = user.clone();
            }
            if let Some(key) = &overrides.ssh_key {
                ssh.key_path = Some(key.clone());
            }
            if let Some(port) = overrides.ssh_port {
                ssh.port = port;
            }
        }
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// Search ranges as written by people: cores and MiB.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SearchSection {
    #[serde(default)]
    pub target: SearchTarget,
    #[serde(default = "default_cpu_min")]
    pub cpu_min: f64,
    #[serde(default = "default_cpu_step")]
    pub cpu_step: f64,
    #[serde(default = "default_cpu_max")]
    pub cpu_max: f64,
    #[serde(default = "default_ram_min")]
    pub ram_min_mib: u64,
    #[serde(default = "default_ram_max")]
    pub ram_max_mib: u64,
    #[serde(default)]
    pub ram_growth: RamGrowth,
    #[serde(default = "default_pinned_cpu")]
    pub pinned_cpu: f64,
    #[serde(default = "default_pinned_ram")]
    pub pinned_ram_mib: u64,
    #[serde(default)]
    pub stop_rule: StopRule,
}
fn default_cpu_min() -> f64 {
    0.5
}
fn default_cpu_step() -> f64 {
    0.5
}
fn default_cpu_max() -> f64 {
    4.0
}
fn default_ram_min() -> u64 {
    512
}
fn default_ram_max() -> u64 {
    8192
}
fn default_pinned_cpu() -> f64 {
    2.0
}
fn default_pinned_ram() -> u64 {
    4096
}
impl Default for SearchSection {
    fn default() -> Self {
        Self {
            target: SearchTarget::default(),
            cpu_min: default_cpu_min(),
            cpu_step: default_cpu_step(),
            cpu_max: default_cpu_max(),
            ram_min_mib: default_ram_min(),
            ram_max_mib: default_ram_max(),
            ram_growth: RamGrowth::default(),
            pinned_cpu: default_pinned_cpu(),
            pinned_ram_mib: default_pinned_ram(),
            stop_rule: StopRule::default(),
        }
    }
}
impl SearchSection {
    pub fn to_search_config(&self) -> SearchConfig {
        SearchConfig {
            target: self.target,
            cpu_min_millis: cores_to_millis(self.cpu_min),
            cpu_step_millis: cores_to_millis(self.cpu_step),
            cpu_max_millis: cores_to_millis(self.cpu_max),
            ram_min_mib: self.ram_min_mib,
            ram_max_mib: self.ram_max_mib,
            ram_growth: self.ram_growth,
            pinned: Allocation::from_cores(self.pinned_cpu, self.pinned_ram_mib),
            stop_rule: self.stop_rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkloadSection {
    #[serde(default = "default_k6_binary")]
    pub k6_binary: String,
    #[serde(default = "default_workload_timeout")]
    pub timeout_secs: u64,
    /// Keep k6's raw JSON output next to each trial record.
    #[serde(default)]
    pub raw_output: bool,
}
fn default_k6_binary() -> String {
    "k6".to_string()
}
fn default_workload_timeout() -> u64 {
    900
}
impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            k6_binary: default_k6_binary(),
            timeout_secs: default_workload_timeout(),
            raw_output: false,
        }
    }
}
impl WorkloadSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    #[default]
    Docker,
    Ssh,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SamplerSection {
    #[serde(default)]
    pub kind: SamplerKind,
    pub ssh: Option<SshSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MonitoringSection {
    pub prometheus_url: Option<String>,
}

/// Values given on the command line that replace the ones in the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub repetitions: Option<u32>,
    pub results_dir: Option<PathBuf>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: Option<u16>,
}

pub fn init_config(path: &Path) {
    println!("\n{}", " Setting up minima ".reversed().green());
    match Config::write_example_to_file(path) {
        Ok(_) => println!("{}", format!("{} created!", path.display()).green()),
        Err(err) => println!("{}\n{}", "Error creating config.".red(), err),
    }
}
