/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::TrialError,
    provisioner::{InstanceHandle, InstanceProvisioner, ReportedSpec, Teardown},
    resources::{Component, Dimension, ResourceConfiguration},
    retry::{Exhausted, RetryPolicy},
    telemetry::{
        collector, prometheus::MonitoringQuery, ComponentReading, ResourceSampler, TelemetryGap,
        TelemetryLog,
    },
    workload::{WorkloadOutcome, WorkloadRequest, WorkloadRunner},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSettings {
    #[serde(default = "default_ready_policy")]
    pub ready: RetryPolicy,
    #[serde(default = "default_address_policy")]
    pub address: RetryPolicy,
    /// Ask the provisioner to refresh every this many failed address lookups.
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u32,
    #[serde(default = "default_spec_policy")]
    pub spec: RetryPolicy,
    #[serde(default = "default_teardown_policy")]
    pub teardown: RetryPolicy,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: f64,
    /// Wait before asking the monitoring service, so its scrapes cover the end of the run.
    #[serde(default = "default_settle_secs")]
    pub monitoring_settle_secs: f64,
}
fn default_ready_policy() -> RetryPolicy {
    RetryPolicy::fixed(120, Duration::from_secs(2))
}
fn default_address_policy() -> RetryPolicy {
    RetryPolicy::fixed(90, Duration::from_secs(5))
}
fn default_refresh_every() -> u32 {
    5
}
fn default_spec_policy() -> RetryPolicy {
    RetryPolicy::fixed(10, Duration::from_secs(2))
}
fn default_teardown_policy() -> RetryPolicy {
    RetryPolicy::fixed(20, Duration::from_secs(3))
}
fn default_sample_interval_secs() -> f64 {
    2.0
}
fn default_settle_secs() -> f64 {
    35.0
}
impl TrialSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, policy) in [
            ("ready", &self.ready),
            ("address", &self.address),
            ("spec", &self.spec),
            ("teardown", &self.teardown),
        ] {
            policy
                .validate()
                .with_context(|| format!("Invalid [trial.{name}] policy"))?;
        }
        anyhow::ensure!(
            self.sample_interval_secs.is_finite() && self.sample_interval_secs > 0.0,
            "sample_interval_secs must be a finite, positive number"
        );
        anyhow::ensure!(
            self.monitoring_settle_secs.is_finite() && self.monitoring_settle_secs >= 0.0,
            "monitoring_settle_secs must be a finite, non-negative number"
        );
        Ok(())
    }
}
impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            ready: default_ready_policy(),
            address: default_address_policy(),
            refresh_every: default_refresh_every(),
            spec: default_spec_policy(),
            teardown: default_teardown_policy(),
            sample_interval_secs: default_sample_interval_secs(),
            monitoring_settle_secs: default_settle_secs(),
        }
    }
}

/// The stack and workload every trial of an experiment runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialTarget {
    pub stack: String,
    pub workload: String,
    pub script: PathBuf,
    /// Directory for raw load generator output. `None` disables it.
    pub raw_output_dir: Option<PathBuf>,
}
impl TrialTarget {
    /// `{repetition}.{workload}-{stack}-{configuration}`, shared by every artifact of a trial.
    pub fn trial_name(&self, config: &ResourceConfiguration, repetition: u32) -> String {
        format!(
            "{}.{}-{}-{}",
            repetition,
            self.workload,
            self.stack,
            config.label()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAverages {
    pub component_a: ComponentReading,
    pub component_b: ComponentReading,
}
impl MonitoringAverages {
    pub fn component(&self, component: Component) -> &ComponentReading {
        match component {
            Component::ComponentA => &self.component_a,
            Component::ComponentB => &self.component_b,
        }
    }

    fn component_mut(&mut self, component: Component) -> &mut ComponentReading {
        match component {
            Component::ComponentA => &mut self.component_a,
            Component::ComponentB => &mut self.component_b,
        }
    }
}

/// Everything observed during one provision-run-teardown cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub name: String,
    pub stack: String,
    pub repetition: u32,
    pub configuration: ResourceConfiguration,
    pub instance: Option<String>,
    pub reported_spec: Option<ReportedSpec>,
    pub workload: Option<WorkloadOutcome>,
    pub telemetry: TelemetryLog,
    pub monitoring: MonitoringAverages,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<TrialError>,
    pub teardown_error: Option<TrialError>,
}
impl TrialResult {
    pub fn new(name: String, stack: &str, config: ResourceConfiguration, repetition: u32) -> Self {
        let now = Utc::now();
        Self {
            name,
            stack: stack.to_string(),
            repetition,
            configuration: config,
            instance: None,
            reported_spec: None,
            workload: None,
            telemetry: TelemetryLog::default(),
            monitoring: MonitoringAverages::default(),
            started_at: now,
            ended_at: now,
            error: None,
            teardown_error: None,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// The error that makes every further trial of this stack pointless, if any.
    pub fn halted(&self) -> Option<&TrialError> {
        self.error.as_ref().filter(|err| err.is_unrecoverable())
    }
}

pub struct TrialRunner {
    provisioner: Arc<dyn InstanceProvisioner>,
    workload: Arc<dyn WorkloadRunner>,
    sampler: Arc<dyn ResourceSampler>,
    monitoring: Option<Arc<dyn MonitoringQuery>>,
    settings: TrialSettings,
}
impl TrialRunner {
    pub fn new(
        provisioner: Arc<dyn InstanceProvisioner>,
        workload: Arc<dyn WorkloadRunner>,
        sampler: Arc<dyn ResourceSampler>,
        monitoring: Option<Arc<dyn MonitoringQuery>>,
        settings: TrialSettings,
    ) -> Self {
        Self {
            provisioner,
            workload,
            sampler,
            monitoring,
            settings,
        }
    }

    /// Runs one repetition of `config`.
    ///
    /// Every failure is stored in the returned result, unrecoverable ones included, so callers
    /// can persist it before checking [`TrialResult::halted`]. Once an instance exists it is torn
    /// down on every path out of this function.
    pub async fn run_trial(
        &self,
        target: &TrialTarget,
        config: ResourceConfiguration,
        repetition: u32,
    ) -> TrialResult {
        let name = target.trial_name(&config, repetition);
        let mut result = TrialResult::new(name, &target.stack, config, repetition);
        info!("trial {} started", result.name);

        let handle = match self.provisioner.create(&target.stack, &config).await {
            Ok(handle) => handle,
            Err(err) => {
                error!("trial {} failed during {}: {}", result.name, err.stage(), err);
                result.error = Some(err);
                result.ended_at = Utc::now();
                return result;
            }
        };
        result.instance = Some(handle.name.clone());

        let outcome = self.exercise(target, &handle, &mut result).await;
        if result.ended_at == result.started_at {
            result.ended_at = Utc::now();
        }

        if let Err(err) = self.teardown(&handle).await {
            // never replaces the trial failure
            warn!("{}", err);
            result.teardown_error = Some(err);
        }

        match outcome {
            Ok(()) => info!(
                "trial {} finished in {:.1}s",
                result.name,
                result.duration_secs()
            ),
            Err(err) => {
                error!("trial {} failed during {}: {}", result.name, err.stage(), err);
                result.error = Some(err);
            }
        }
        result
    }

    async fn exercise(
        &self,
        target: &TrialTarget,
        handle: &InstanceHandle,
        result: &mut TrialResult,
    ) -> Result<(), TrialError> {
        self.wait_ready(handle).await?;
        let address = self.wait_address(handle).await?;
        debug!("instance {} reachable at {}", handle.name, address);

        let spec = self.wait_spec(handle).await?;
        let differences = spec.differences(&target.stack, &result.configuration);
        result.reported_spec = Some(spec);
        if !differences.is_empty() {
            return Err(TrialError::ConfigurationMismatch {
                instance: handle.name.clone(),
                differences,
            });
        }

        let request = WorkloadRequest {
            script: target.script.clone(),
            base_url: address,
            raw_output: target
                .raw_output_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.json", result.name))),
        };

        let sampling = collector::start_sampling(
            self.sampler.clone(),
            handle.containers.clone(),
            Duration::from_secs_f64(self.settings.sample_interval_secs.max(0.1)),
        );
        let workload_start = Utc::now();
        result.started_at = workload_start;
        let outcome = self.workload.invoke(&request).await;
        result.ended_at = Utc::now();

        result.telemetry = match sampling.stop().await {
            Ok(log) => log,
            Err(err) => TelemetryLog {
                samples: vec![],
                gaps: vec![TelemetryGap {
                    at: Utc::now(),
                    reason: format!("{:#}", err),
                }],
            },
        };
        for gap in result.telemetry.gaps.iter() {
            debug!("{}", gap.to_error());
        }

        let outcome = outcome.map_err(|err| TrialError::WorkloadInvocationFailure {
            reason: format!("{:#}", err),
        })?;
        result.workload = Some(outcome);

        if let Some(monitoring) = &self.monitoring {
            result.monitoring = self
                .query_monitoring(&**monitoring, handle, result)
                .await;
        }
        Ok(())
    }

    async fn wait_ready(&self, handle: &InstanceHandle) -> Result<(), TrialError> {
        let provisioner = &self.provisioner;
        self.settings
            .ready
            .poll(move |_| async move {
                match provisioner.poll_ready(handle).await {
                    Ok(ready) => ready.then_some(()),
                    Err(err) => {
                        debug!("readiness check failed: {:#}", err);
                        None
                    }
                }
            })
            .await
            .map_err(|Exhausted { attempts, waited }| TrialError::ProvisioningTimeout {
                instance: handle.name.clone(),
                attempts,
                waited_secs: waited.as_secs_f64(),
            })
    }

    async fn wait_address(&self, handle: &InstanceHandle) -> Result<String, TrialError> {
        let provisioner = &self.provisioner;
        let refresh_every = self.settings.refresh_every;
        self.settings
            .address
            .poll(move |n| async move {
                if refresh_every > 0 && n > 1 && (n - 1) % refresh_every == 0 {
                    if let Err(err) = provisioner.refresh(handle).await {
                        debug!("refresh failed: {:#}", err);
                    }
                }
                match provisioner.resolve_address(handle).await {
                    Ok(address) => address,
                    Err(err) => {
                        debug!("address lookup failed: {:#}", err);
                        None
                    }
                }
            })
            .await
            .map_err(
                |Exhausted { attempts, waited }| TrialError::AddressResolutionTimeout {
                    instance: handle.name.clone(),
                    attempts,
                    waited_secs: waited.as_secs_f64(),
                },
            )
    }

    async fn wait_spec(&self, handle: &InstanceHandle) -> Result<ReportedSpec, TrialError> {
        let provisioner = &self.provisioner;
        self.settings
            .spec
            .poll(move |_| async move {
                match provisioner.read_reported_spec(handle).await {
                    Ok(spec) => Some(spec),
                    Err(err) => {
                        debug!("reading instance spec failed: {:#}", err);
                        None
                    }
                }
            })
            .await
            .map_err(|Exhausted { attempts, .. }| TrialError::ConfigurationMismatch {
                instance: handle.name.clone(),
                differences: vec![format!(
                    "spec could not be read after {attempts} attempts"
                )],
            })
    }

    /// Retries until the instance is confirmed gone. A `Removed` answer is confirmed with a
    /// second call in the same attempt.
    async fn teardown(&self, handle: &InstanceHandle) -> Result<(), TrialError> {
        let provisioner = &self.provisioner;
        let last_error = Mutex::new(String::from("instance still present"));
        let last_error_ref = &last_error;

        let res = self
            .settings
            .teardown
            .poll(move |_| async move {
                let confirmed = match provisioner.destroy(handle).await {
                    Ok(Teardown::AlreadyAbsent) => Ok(true),
                    Ok(Teardown::Removed) => provisioner
                        .destroy(handle)
                        .await
                        .map(|t| t == Teardown::AlreadyAbsent),
                    Err(err) => Err(err),
                };
                match confirmed {
                    Ok(true) => Some(()),
                    Ok(false) => None,
                    Err(err) => {
                        *last_error_ref.lock().await = format!("{:#}", err);
                        None
                    }
                }
            })
            .await;

        match res {
            Ok(()) => Ok(()),
            Err(Exhausted { attempts, .. }) => Err(TrialError::TeardownFailure {
                instance: handle.name.clone(),
                attempts,
                reason: last_error.into_inner(),
            }),
        }
    }

    async fn query_monitoring(
        &self,
        monitoring: &dyn MonitoringQuery,
        handle: &InstanceHandle,
        result: &TrialResult,
    ) -> MonitoringAverages {
        let settle = Duration::from_secs_f64(self.settings.monitoring_settle_secs.max(0.0));
        debug!("waiting {:?} before querying monitoring", settle);
        tokio::time::sleep(settle).await;

        let window = (result.ended_at - result.started_at)
            .to_std()
            .unwrap_or_default();
        let mut averages = MonitoringAverages::default();
        for component in Component::ALL {
            let container = handle.containers.get(component);
            for dimension in [Dimension::Cpu, Dimension::Ram] {
                let value = match monitoring
                    .query_average(dimension, container, window, result.ended_at)
                    .await
                {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("monitoring query for {} {} failed: {:#}", container, dimension, err);
                        None
                    }
                };
                let reading = averages.component_mut(component);
                match dimension {
                    Dimension::Cpu => reading.cpu_pct = value,
                    Dimension::Ram => reading.mem_mb = value,
                }
            }
        }
        averages
    }
}


#[cfg(test)]
mod tests {
    use super::{fakes::*, *};
    use crate::resources::Allocation;
    use std::sync::atomic::Ordering;

    fn target() -> TrialTarget {
        TrialTarget {
            stack: "node-postgres".to_string(),
            workload: "get_users".to_string(),
            script: PathBuf::from("get_users.js"),
            raw_output_dir: None,
        }
    }

    fn config() -> ResourceConfiguration {
        ResourceConfiguration::new(
            Allocation::from_cores(1.0, 1024),
            Allocation::from_cores(0.5, 512),
        )
    }

    fn runner(provisioner: Arc<FakeProvisioner>, outcome: Option<WorkloadOutcome>) -> TrialRunner {
        TrialRunner::new(
            provisioner,
            Arc::new(FakeWorkload { outcome }),
            Arc::new(FixedSampler {
                reading: ComponentReading {
                    cpu_pct: Some(50.0),
                    mem_mb: Some(256.0),
                },
            }),
            None,
            fast_settings(),
        )
    }

    fn ok_outcome() -> WorkloadOutcome {
        WorkloadOutcome {
            exit_code: Some(0),
            thresholds_ok: Some(true),
            error_rate: Some(0.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_trial_collects_telemetry_and_tears_down() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner::default());
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 1)
            .await;

        assert!(result.succeeded());
        assert_eq!(result.name, "1.get_users-node-postgres-a1_1024-b0.5_512");
        assert!(!result.telemetry.samples.is_empty());
        assert_eq!(result.workload.as_ref().and_then(|w| w.error_rate), Some(0.0));
        assert!(result.reported_spec.is_some());
        assert!(!provisioner.alive.load(Ordering::SeqCst));
        assert_eq!(provisioner.destroy_calls.load(Ordering::SeqCst), 2);
        assert!(result.teardown_error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn provisioning_timeout_still_tears_down() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner {
            never_ready: true,
            ..Default::default()
        });
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 1)
            .await;

        assert!(matches!(
            result.error,
            Some(TrialError::ProvisioningTimeout { attempts: 3, .. })
        ));
        assert!(!provisioner.alive.load(Ordering::SeqCst));
        assert!(result.workload.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn address_timeout_refreshes_and_tears_down() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner {
            no_address: true,
            ..Default::default()
        });
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 1)
            .await;

        assert!(matches!(
            result.error,
            Some(TrialError::AddressResolutionTimeout { attempts: 3, .. })
        ));
        // refresh_every = 2: only the third lookup is preceded by a refresh
        assert_eq!(provisioner.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(result.workload.is_none());
        assert!(result.teardown_error.is_none());
        assert!(!provisioner.alive.load(Ordering::SeqCst));
        assert_eq!(provisioner.destroy_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_spec_is_reported_and_torn_down() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner {
            wrong_stack: true,
            ..Default::default()
        });
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 2)
            .await;

        match &result.error {
            Some(TrialError::ConfigurationMismatch { differences, .. }) => {
                assert_eq!(differences.len(), 1);
                assert!(differences[0].contains("other-stack"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(result.reported_spec.is_some());
        assert!(!provisioner.alive.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn workload_failure_keeps_telemetry() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner::default());
        let result = runner(provisioner.clone(), None)
            .run_trial(&target(), config(), 1)
            .await;

        assert!(matches!(
            result.error,
            Some(TrialError::WorkloadInvocationFailure { .. })
        ));
        assert!(!result.telemetry.samples.is_empty());
        assert!(!provisioner.alive.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn teardown_failure_does_not_hide_trial_failure() -> anyhow::Result<()> {
        let provisioner = Arc::new(FakeProvisioner {
            never_ready: true,
            destroy_fails: true,
            ..Default::default()
        });
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 1)
            .await;

        assert!(matches!(
            result.error,
            Some(TrialError::ProvisioningTimeout { .. })
        ));
        match &result.teardown_error {
            Some(TrialError::TeardownFailure {
                attempts, reason, ..
            }) => {
                assert_eq!(*attempts, 3);
                assert!(reason.contains("engine unavailable"));
            }
            other => panic!("unexpected teardown error {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unrecoverable_setup_is_kept_in_the_result() {
        let provisioner = Arc::new(FakeProvisioner {
            unrecoverable: true,
            ..Default::default()
        });
        let result = runner(provisioner.clone(), Some(ok_outcome()))
            .run_trial(&target(), config(), 1)
            .await;

        assert!(matches!(
            result.halted(),
            Some(TrialError::UnrecoverableSetup { .. })
        ));
        assert!(result.instance.is_none());
        assert_eq!(provisioner.destroy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn destroy_twice_reports_already_absent() -> anyhow::Result<()> {
        let provisioner = FakeProvisioner::default();
        let handle = provisioner
            .create("node-postgres", &config())
            .await
            .map_err(anyhow::Error::from)?;

        assert_eq!(provisioner.destroy(&handle).await?, Teardown::Removed);
        assert_eq!(provisioner.destroy(&handle).await?, Teardown::AlreadyAbsent);
        Ok(())
    }
}
