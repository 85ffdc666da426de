/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod compose;

use crate::{
    error::TrialError,
    resources::{Component, ResourceConfiguration},
    telemetry::SampleTargets,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A provisioned stack instance. Owned by exactly one trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub name: String,
    pub stack: String,
    pub containers: SampleTargets,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedAllocation {
    pub cpu_millis: Option<u32>,
    pub ram_mib: Option<u64>,
}

/// What the infrastructure says it actually granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedSpec {
    pub stack: Option<String>,
    pub component_a: ReportedAllocation,
    pub component_b: ReportedAllocation,
}
impl ReportedSpec {
    pub fn get(&self, component: Component) -> &ReportedAllocation {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }

    /// Every way in which the instance differs from what was requested. Values that were not
    /// reported count as differences.
    pub fn differences(&self, stack: &str, requested: &ResourceConfiguration) -> Vec<String> {
        let mut diffs = Vec::new();

        match &self.stack {
            Some(reported) if reported == stack => {}
            Some(reported) => diffs.push(format!("stack is {reported}, expected {stack}")),
            None => diffs.push("stack not reported".to_string()),
        }

        for component in Component::ALL {
            let want = requested.get(component);
            let got = self.get(component);

            match got.cpu_millis {
                Some(m) if m == want.cpu_millis => {}
                Some(m) => diffs.push(format!(
                    "{component} cpu is {} cores, expected {}",
                    m as f64 / 1000.0,
                    want.cores()
                )),
                None => diffs.push(format!("{component} cpu not reported")),
            }
            match got.ram_mib {
                Some(r) if r == want.ram_mib => {}
                Some(r) => diffs.push(format!(
                    "{component} ram is {r} MiB, expected {}",
                    want.ram_mib
                )),
                None => diffs.push(format!("{component} ram not reported")),
            }
        }

        diffs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    Removed,
    AlreadyAbsent,
}

/// Creates and removes stack instances at a requested resource configuration.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Fails when the provisioning backend cannot be reached at all.
    async fn ensure_reachable(&self) -> anyhow::Result<()>;

    /// Starts creating an instance. Errors that make every later trial pointless are reported as
    /// [`TrialError::UnrecoverableSetup`].
    async fn create(
        &self,
        stack: &str,
        config: &ResourceConfiguration,
    ) -> Result<InstanceHandle, TrialError>;

    async fn poll_ready(&self, handle: &InstanceHandle) -> anyhow::Result<bool>;

    /// Nudges the backend to refresh its view of the instance while waiting for an address.
    async fn refresh(&self, handle: &InstanceHandle) -> anyhow::Result<()>;

    async fn resolve_address(&self, handle: &InstanceHandle) -> anyhow::Result<Option<String>>;

    async fn read_reported_spec(&self, handle: &InstanceHandle) -> anyhow::Result<ReportedSpec>;

    /// Idempotent. Calling it on an instance that is already gone returns `AlreadyAbsent`.
    async fn destroy(&self, handle: &InstanceHandle) -> anyhow::Result<Teardown>;
}
