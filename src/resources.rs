/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MILLIS_PER_CORE: u32 = 1000;

/// One of the two independently sized containers of a stack. Component A is the application
/// backend (the container the workload talks to), component B is its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ComponentA,
    ComponentB,
}
impl Component {
    pub const ALL: [Component; 2] = [Component::ComponentA, Component::ComponentB];
}
impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::ComponentA => write!(f, "component_a"),
            Component::ComponentB => write!(f, "component_b"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Ram,
}
impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Cpu => write!(f, "cpu"),
            Dimension::Ram => write!(f, "ram"),
        }
    }
}

/// CPU and memory granted to a single container.
///
/// CPU is kept in millicores so that stepping by fractions of a core stays exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_millis: u32,
    pub ram_mib: u64,
}
impl Allocation {
    pub fn new(cpu_millis: u32, ram_mib: u64) -> Self {
        Self {
            cpu_millis,
            ram_mib,
        }
    }

    pub fn from_cores(cores: f64, ram_mib: u64) -> Self {
        Self::new(cores_to_millis(cores), ram_mib)
    }

    pub fn cores(&self) -> f64 {
        self.cpu_millis as f64 / MILLIS_PER_CORE as f64
    }

    /// CPU ceiling expressed the way container runtimes report usage (100% == one core).
    pub fn cpu_percent_ceiling(&self) -> f64 {
        self.cpu_millis as f64 / 10.0
    }

    pub fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Cpu => self.cpu_millis as u64,
            Dimension::Ram => self.ram_mib,
        }
    }

    /// Short label used in artifact names, e.g. `0.5_1024`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.cores(), self.ram_mib)
    }

    /// True if neither dimension of `self` is smaller than the same dimension of `other`.
    pub fn covers(&self, other: &Allocation) -> bool {
        self.cpu_millis >= other.cpu_millis && self.ram_mib >= other.ram_mib
    }
}
impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu / {} MiB", self.cores(), self.ram_mib)
    }
}

pub fn cores_to_millis(cores: f64) -> u32 {
    (cores * MILLIS_PER_CORE as f64).round().max(0.0) as u32
}

/// The allocation of both components of a stack for one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceConfiguration {
    pub component_a: Allocation,
    pub component_b: Allocation,
}
impl ResourceConfiguration {
    pub fn new(component_a: Allocation, component_b: Allocation) -> Self {
        Self {
            component_a,
            component_b,
        }
    }

    pub fn get(&self, component: Component) -> &Allocation {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }

    pub fn label(&self) -> String {
        format!(
            "a{}-b{}",
            self.component_a.label(),
            self.component_b.label()
        )
    }

    pub fn covers(&self, other: &ResourceConfiguration) -> bool {
        self.component_a.covers(&other.component_a) && self.component_b.covers(&other.component_b)
    }
}
impl fmt::Display for ResourceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A[{}] B[{}]", self.component_a, self.component_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_cores_are_exact() {
        let alloc = Allocation::from_cores(0.1 + 0.2, 512);
        assert_eq!(alloc.cpu_millis, 300);
        assert_eq!(alloc.cores(), 0.3);
        assert_eq!(alloc.cpu_percent_ceiling(), 30.0);
    }

    #[test]
    fn labels_drop_trailing_zeroes() {
        let config = ResourceConfiguration::new(
            Allocation::from_cores(1.0, 1024),
            Allocation::from_cores(0.5, 2048),
        );
        assert_eq!(config.label(), "a1_1024-b0.5_2048");
    }

    #[test]
    fn covers_compares_every_dimension() {
        let small = Allocation::from_cores(0.5, 1024);
        let more_cpu = Allocation::from_cores(1.0, 1024);
        let less_ram = Allocation::from_cores(1.0, 512);

        assert!(more_cpu.covers(&small));
        assert!(!less_ram.covers(&small));
        assert!(small.covers(&small));
    }
}
