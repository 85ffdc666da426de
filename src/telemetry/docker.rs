/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{ComponentReading, ResourceSampler, SampleTargets, TelemetrySample};
use crate::resources::Component;
use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    container::{Stats, StatsOptions},
    Docker,
};
use chrono::Utc;
use futures_util::TryStreamExt;
use std::sync::Mutex;
use sysinfo::System;
use tracing::{trace, warn};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Samples containers running on the local Docker engine. Host figures come from `sysinfo`,
/// which has no notion of buff/cache, so only `host_mem_unavailable_mb` is reported.
pub struct DockerSampler {
    docker: Docker,
    system: Mutex<System>,
}
impl DockerSampler {
    pub fn new(docker: Docker) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            docker,
            system: Mutex::new(system),
        }
    }

    pub fn connect() -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_defaults().context("Failed to connect to the Docker engine")?;
        Ok(Self::new(docker))
    }

    fn host_figures(&self) -> (Option<f64>, Option<f64>) {
        let Ok(mut system) = self.system.lock() else {
            return (None, None);
        };
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = system.global_cpu_usage() as f64;
        let unavailable = system
            .total_memory()
            .saturating_sub(system.available_memory()) as f64
            / BYTES_PER_MIB;
        (Some(cpu), Some(unavailable))
    }

    async fn container_reading(&self, name: &str) -> ComponentReading {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        match self.docker.stats(name, Some(options)).try_next().await {
            Ok(Some(stats)) => reading_from_stats(&stats),
            Ok(None) => ComponentReading::default(),
            Err(err) => {
                warn!("no docker stats for {}: {}", name, err);
                ComponentReading::default()
            }
        }
    }
}

#[async_trait]
impl ResourceSampler for DockerSampler {
    async fn sample(&self, targets: &SampleTargets) -> anyhow::Result<TelemetrySample> {
        let (host_cpu_pct, host_mem_unavailable_mb) = self.host_figures();

        let component_a = self
            .container_reading(targets.get(Component::ComponentA))
            .await;
        let component_b = self
            .container_reading(targets.get(Component::ComponentB))
            .await;
        trace!("docker sample a={:?} b={:?}", component_a, component_b);

        Ok(TelemetrySample {
            timestamp: Utc::now(),
            host_cpu_pct,
            host_mem_used_mb: None,
            host_mem_unavailable_mb,
            component_a,
            component_b,
        })
    }
}

fn reading_from_stats(stats: &Stats) -> ComponentReading {
    let mem_mb = stats
        .memory_stats
        .usage
        .map(|bytes| bytes as f64 / BYTES_PER_MIB);

    ComponentReading {
        cpu_pct: cpu_percent(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage,
            stats.precpu_stats.system_cpu_usage,
            stats.cpu_stats.online_cpus,
        ),
        mem_mb,
    }
}

/// `(cpu_delta / system_delta) * online_cpus * 100`, the figure `docker stats` shows.
pub fn cpu_percent(
    total: u64,
    pre_total: u64,
    system: Option<u64>,
    pre_system: Option<u64>,
    online_cpus: Option<u64>,
) -> Option<f64> {
    let cpu_delta = total.checked_sub(pre_total)?;
    let system_delta = system?.checked_sub(pre_system?)?;
    if system_delta == 0 {
        return None;
    }
    let cpus = online_cpus.filter(|n| *n > 0)? as f64;
    Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_matches_docker_formula() {
        // a quarter of the system time on a 4 cpu host == one full core
        assert_eq!(
            cpu_percent(2_500, 0, Some(10_000), Some(0), Some(4)),
            Some(100.0)
        );
    }

    #[test]
    fn cpu_percent_needs_a_previous_reading() {
        assert_eq!(cpu_percent(100, 0, Some(1_000), None, Some(2)), None);
        assert_eq!(cpu_percent(100, 0, Some(1_000), Some(1_000), Some(2)), None);
        assert_eq!(cpu_percent(100, 200, Some(2_000), Some(1_000), Some(2)), None);
    }
}
