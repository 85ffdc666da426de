/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{ComponentReading, ResourceSampler, SampleTargets, TelemetrySample};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, process::Stdio, sync::OnceLock, time::Duration};
use tokio::process::Command;
use tracing::trace;

const CPU_MARKER: &str = "@@minima:cpu";
const MEM_MARKER: &str = "@@minima:mem";
const DOCKER_MARKER: &str = "@@minima:docker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    pub host: String,
    pub user: String,
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}
fn default_port() -> u16 {
    22
}
fn default_timeout_secs() -> u64 {
    15
}

/// Samples a remote Docker host over `ssh`. Each sample is one round trip that runs `top`,
/// `free -m` and `docker stats` and separates their output with marker lines.
pub struct SshSampler {
    settings: SshSettings,
}
impl SshSampler {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn remote_script() -> String {
        format!(
            "echo '{CPU_MARKER}'; LANG=C top -bn1 | grep 'Cpu(s)'; \
             echo '{MEM_MARKER}'; LANG=C free -m | grep Mem; \
             echo '{DOCKER_MARKER}'; docker stats --no-stream --format '{{{{.Name}}}};{{{{.CPUPerc}}}};{{{{.MemUsage}}}}'"
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.timeout_secs))
            .arg("-p")
            .arg(self.settings.port.to_string());
        if let Some(key) = &self.settings.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.settings.user, self.settings.host))
            .arg(Self::remote_script())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ResourceSampler for SshSampler {
    async fn sample(&self, targets: &SampleTargets) -> anyhow::Result<TelemetrySample> {
        let timeout = Duration::from_secs(self.settings.timeout_secs.max(1) * 2);
        let output = tokio::time::timeout(timeout, self.command().output())
            .await
            .context("ssh sample timed out")?
            .context("failed to run ssh")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.contains(CPU_MARKER) {
            anyhow::bail!(
                "ssh exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        trace!("ssh sample output:\n{}", stdout);

        Ok(parse_sample(&stdout, targets))
    }
}

/// Builds a sample from the marker-separated output of one remote round trip.
pub fn parse_sample(output: &str, targets: &SampleTargets) -> TelemetrySample {
    let cpu = section(output, CPU_MARKER);
    let mem = section(output, MEM_MARKER);
    let docker = section(output, DOCKER_MARKER);

    let (host_mem_used_mb, host_mem_unavailable_mb) = parse_free(&mem);
    let (component_a, component_b) = parse_docker_stats(&docker, targets);

    TelemetrySample {
        timestamp: Utc::now(),
        host_cpu_pct: parse_top_cpu(&cpu),
        host_mem_used_mb,
        host_mem_unavailable_mb,
        component_a,
        component_b,
    }
}

fn section(output: &str, marker: &str) -> String {
    output
        .lines()
        .skip_while(|line| line.trim() != marker)
        .skip(1)
        .take_while(|line| !line.trim().starts_with("@@minima:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Host CPU usage as `100 - idle` from a `top -bn1` summary line. Accepts `,` as the decimal
/// separator.
pub fn parse_top_cpu(line: &str) -> Option<f64> {
    static IDLE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = IDLE
        .get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*id").ok())
        .as_ref()?;

    let idle = re
        .captures(line)?
        .get(1)?
        .as_str()
        .replace(',', ".")
        .parse::<f64>()
        .ok()?;
    Some((100.0 - idle).clamp(0.0, 100.0))
}

/// Parses the `Mem:` line of `free -m` (`total used free shared buff/cache available`) into
/// `(total - free - buff/cache, total - available)`.
pub fn parse_free(line: &str) -> (Option<f64>, Option<f64>) {
    let Some(mem_line) = line.lines().find(|l| l.trim_start().starts_with("Mem")) else {
        return (None, None);
    };
    let cols = mem_line
        .split_whitespace()
        .skip(1)
        .map(|c| c.parse::<f64>().ok())
        .collect::<Vec<_>>();
    let col = |i: usize| cols.get(i).copied().flatten();

    let total = col(0);
    let used = match (total, col(2), col(4)) {
        (Some(total), Some(free), Some(cache)) => Some(total - free - cache),
        _ => None,
    };
    let unavailable = match (total, col(5)) {
        (Some(total), Some(available)) => Some(total - available),
        _ => None,
    };
    (used, unavailable)
}

/// Extracts the readings of both targets from `docker stats` lines formatted as
/// `name;cpu%;used / limit`. A container matches a target when its name contains it.
pub fn parse_docker_stats(
    output: &str,
    targets: &SampleTargets,
) -> (ComponentReading, ComponentReading) {
    let mut a = ComponentReading::default();
    let mut b = ComponentReading::default();

    for line in output.lines() {
        let parts = line.trim().splitn(3, ';').collect::<Vec<_>>();
        let [name, cpu, mem] = parts.as_slice() else {
            continue;
        };

        let reading = ComponentReading {
            cpu_pct: cpu.trim().trim_end_matches('%').replace(',', ".").parse().ok(),
            mem_mb: mem.split('/').next().and_then(parse_mem_mib),
        };
        if name.contains(&targets.component_a) {
            a = reading;
        } else if name.contains(&targets.component_b) {
            b = reading;
        }
    }

    (a, b)
}

/// Converts a Docker memory figure such as `35.33MiB` or `1.2GB` to MiB.
pub fn parse_mem_mib(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number = number.trim().replace(',', ".").parse::<f64>().ok()?;

    let factor = match unit.trim() {
        "B" => 1.0 / (1024.0 * 1024.0),
        "KiB" => 1.0 / 1024.0,
        "kB" | "KB" => 1000.0 / (1024.0 * 1024.0),
        "MiB" | "" => 1.0,
        "MB" => 1_000_000.0 / (1024.0 * 1024.0),
        "GiB" => 1024.0,
        "GB" => 1_000_000_000.0 / (1024.0 * 1024.0),
        "TiB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(number * factor)
}
