/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod collector;
pub mod docker;
pub mod prometheus;
pub mod ssh;

use crate::{error::TrialError, resources::Component};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Containers to observe during a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleTargets {
    pub component_a: String,
    pub component_b: String,
}
impl SampleTargets {
    pub fn get(&self, component: Component) -> &str {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentReading {
    /// 100.0 == one full core
    pub cpu_pct: Option<f64>,
    pub mem_mb: Option<f64>,
}
/// A point-in-time reading of host and container resource usage. Any field may be missing
/// when the corresponding probe failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub host_cpu_pct: Option<f64>,
    /// total - free - buff/cache
    pub host_mem_used_mb: Option<f64>,
    /// total - available
    pub host_mem_unavailable_mb: Option<f64>,
    pub component_a: ComponentReading,
    pub component_b: ComponentReading,
}
impl TelemetrySample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            host_cpu_pct: None,
            host_mem_used_mb: None,
            host_mem_unavailable_mb: None,
            component_a: ComponentReading::default(),
            component_b: ComponentReading::default(),
        }
    }

    pub fn component(&self, component: Component) -> &ComponentReading {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Takes one snapshot of the host and of the target containers.
    async fn sample(&self, targets: &SampleTargets) -> anyhow::Result<TelemetrySample>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryGap {
    pub at: DateTime<Utc>,
    pub reason: String,
}
impl TelemetryGap {
    pub fn to_error(&self) -> TrialError {
        TrialError::TelemetryCollectionGap {
            reason: format!("{} at {}", self.reason, self.at.to_rfc3339()),
        }
    }
}

/// Everything the sampler collected during one trial, in collection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryLog {
    pub samples: Vec<TelemetrySample>,
    pub gaps: Vec<TelemetryGap>,
}
impl TelemetryLog {
    pub fn averages(&self) -> TelemetryAverages {
        let component = |c: Component| ComponentReading {
            cpu_pct: mean_of(self.samples.iter().map(|s| s.component(c).cpu_pct)),
            mem_mb: mean_of(self.samples.iter().map(|s| s.component(c).mem_mb)),
        };

        TelemetryAverages {
            host_cpu_pct: mean_of(self.samples.iter().map(|s| s.host_cpu_pct)),
            host_mem_used_mb: mean_of(self.samples.iter().map(|s| s.host_mem_used_mb)),
            host_mem_unavailable_mb: mean_of(
                self.samples.iter().map(|s| s.host_mem_unavailable_mb),
            ),
            component_a: component(Component::ComponentA),
            component_b: component(Component::ComponentB),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryAverages {
    pub host_cpu_pct: Option<f64>,
    pub host_mem_used_mb: Option<f64>,
    pub host_mem_unavailable_mb: Option<f64>,
    pub component_a: ComponentReading,
    pub component_b: ComponentReading,
}
impl TelemetryAverages {
    pub fn component(&self, component: Component) -> &ComponentReading {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }
}

/// Arithmetic mean of the values that are present. Values are sorted before summing so the
/// result does not depend on the order of the input.
pub fn mean_of(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut present = values
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite())
        .collect::<Vec<_>>();
    if present.is_empty() {
        return None;
    }

    present.sort_by(f64::total_cmp);
    let sum: f64 = present.iter().sum();
    Some(sum / present.len() as f64)
}
