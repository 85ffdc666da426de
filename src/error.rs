/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures that can occur while running a single trial.
///
/// Everything except `UnrecoverableSetup` is local to one trial: it is stored in that trial's
/// result and record and the search carries on, treating the trial as failed.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialError {
    #[error("instance {instance} was not ready after {attempts} attempts ({waited_secs:.0}s)")]
    ProvisioningTimeout {
        instance: String,
        attempts: u32,
        waited_secs: f64,
    },

    #[error("failed to provision instance: {reason}")]
    ProvisioningFailed { reason: String },

    #[error("no address for instance {instance} after {attempts} attempts ({waited_secs:.0}s)")]
    AddressResolutionTimeout {
        instance: String,
        attempts: u32,
        waited_secs: f64,
    },

    #[error("instance {instance} does not match the requested configuration: {}", .differences.join("; "))]
    ConfigurationMismatch {
        instance: String,
        differences: Vec<String>,
    },

    #[error("workload invocation failed: {reason}")]
    WorkloadInvocationFailure { reason: String },

    #[error("telemetry collection gap: {reason}")]
    TelemetryCollectionGap { reason: String },

    #[error("teardown of instance {instance} failed after {attempts} attempts: {reason}")]
    TeardownFailure {
        instance: String,
        attempts: u32,
        reason: String,
    },

    #[error("unrecoverable setup error: {reason}")]
    UnrecoverableSetup { reason: String },
}
impl TrialError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, TrialError::UnrecoverableSetup { .. })
    }

    /// The trial stage the error belongs to, used when printing failures.
    pub fn stage(&self) -> &'static str {
        match self {
            TrialError::ProvisioningTimeout { .. } | TrialError::ProvisioningFailed { .. } => {
                "provisioning"
            }
            TrialError::AddressResolutionTimeout { .. } => "address resolution",
            TrialError::ConfigurationMismatch { .. } => "configuration validation",
            TrialError::WorkloadInvocationFailure { .. } => "workload",
            TrialError::TelemetryCollectionGap { .. } => "telemetry",
            TrialError::TeardownFailure { .. } => "teardown",
            TrialError::UnrecoverableSetup { .. } => "setup",
        }
    }
}
