/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{InstanceHandle, InstanceProvisioner, ReportedAllocation, ReportedSpec, Teardown};
use crate::{
    error::TrialError,
    resources::{Component, ResourceConfiguration},
    telemetry::SampleTargets,
};
use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    container::InspectContainerOptions, errors::Error as BollardError,
    models::ContainerInspectResponse, Docker,
};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{io::ErrorKind, process::Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

const INSTANCE_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeSettings {
    /// Command that brings an instance up. Placeholders: `{instance}`, `{stack}`, `{a_cpu}`,
    /// `{a_ram}`, `{b_cpu}`, `{b_ram}` (cores and MiB).
    pub up: String,
    /// Command that removes an instance. Only `{instance}` and `{stack}` are available.
    pub down: String,
    /// Optional command run while waiting for an address. Same placeholders as `down`.
    #[serde(default)]
    pub refresh: Option<String>,
    pub component_a_service: String,
    pub component_b_service: String,
    /// Container port of component A that the workload talks to.
    pub component_a_port: u16,
    #[serde(default = "default_address_host")]
    pub address_host: String,
    #[serde(default = "default_stack_label")]
    pub stack_label: String,
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
}
fn default_address_host() -> String {
    "127.0.0.1".to_string()
}
fn default_stack_label() -> String {
    "minima.stack".to_string()
}
fn default_instance_prefix() -> String {
    "minima".to_string()
}

/// Provisions instances with Docker Compose and inspects them through the Docker Engine API.
pub struct ComposeProvisioner {
    settings: ComposeSettings,
    docker: Docker,
}
impl ComposeProvisioner {
    pub fn new(settings: ComposeSettings, docker: Docker) -> Self {
        Self { settings, docker }
    }

    pub fn connect(settings: ComposeSettings) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_defaults().context("Failed to connect to the Docker engine")?;
        Ok(Self::new(settings, docker))
    }

    fn container_name(instance: &str, service: &str) -> String {
        format!("{instance}-{service}-1")
    }

    fn handle(&self, instance: String, stack: &str) -> InstanceHandle {
        InstanceHandle {
            containers: SampleTargets {
                component_a: Self::container_name(&instance, &self.settings.component_a_service),
                component_b: Self::container_name(&instance, &self.settings.component_b_service),
            },
            name: instance,
            stack: stack.to_string(),
        }
    }

    /// `None` when the container does not exist.
    async fn inspect(&self, container: &str) -> anyhow::Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => Ok(Some(resp)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(err).context(format!("Failed to inspect container {container}")),
        }
    }
}

/// Placeholder values and environment for one instance.
pub fn template_vars(
    instance: &str,
    stack: &str,
    config: &ResourceConfiguration,
) -> Vec<(&'static str, String)> {
    vec![
        ("instance", instance.to_string()),
        ("stack", stack.to_string()),
        ("a_cpu", config.component_a.cores().to_string()),
        ("a_ram", config.component_a.ram_mib.to_string()),
        ("b_cpu", config.component_b.cores().to_string()),
        ("b_ram", config.component_b.ram_mib.to_string()),
    ]
}

pub fn render(template: &str, vars: &[(&'static str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// Runs a rendered command template. The placeholders are exported as `MINIMA_*` variables too.
async fn run_template(template: &str, vars: &[(&'static str, String)]) -> Result<(), TrialError> {
    let command = render(template, vars);
    let words = shlex::split(&command).ok_or_else(|| TrialError::UnrecoverableSetup {
        reason: format!("command is not POSIX compliant: {command}"),
    })?;
    let [program, args @ ..] = words.as_slice() else {
        return Err(TrialError::UnrecoverableSetup {
            reason: "empty command template".to_string(),
        });
    };

    debug!("running {}", command);
    let output = Command::new(program)
        .args(args)
        .envs(
            vars.iter()
                .map(|(k, v)| (format!("MINIMA_{}", k.to_uppercase()), v.clone())),
        )
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => TrialError::UnrecoverableSetup {
                reason: format!("cannot run {program}: {err}"),
            },
            _ => TrialError::ProvisioningFailed {
                reason: format!("{command}: {err}"),
            },
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(TrialError::ProvisioningFailed {
            reason: format!(
                "{command} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Whatever a container inspection says about granted cpu and memory.
pub fn reported_allocation(resp: &ContainerInspectResponse) -> ReportedAllocation {
    let host_config = resp.host_config.as_ref();
    ReportedAllocation {
        cpu_millis: host_config
            .and_then(|h| h.nano_cpus)
            .filter(|n| *n > 0)
            .map(|n| (n / 1_000_000) as u32),
        ram_mib: host_config
            .and_then(|h| h.memory)
            .filter(|m| *m > 0)
            .map(|m| (m / (1024 * 1024)) as u64),
    }
}

/// `http://{host}:{published port}` of `container_port/tcp`, if it is published.
pub fn published_address(
    resp: &ContainerInspectResponse,
    container_port: u16,
    host: &str,
) -> Option<String> {
    let bindings = resp
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{container_port}/tcp"))?
        .as_ref()?;

    bindings
        .iter()
        .filter_map(|b| b.host_port.as_deref())
        .find(|p| !p.is_empty())
        .map(|port| format!("http://{host}:{port}"))
}

fn is_running(resp: &ContainerInspectResponse) -> bool {
    resp.state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

#[async_trait]
impl InstanceProvisioner for ComposeProvisioner {
    async fn ensure_reachable(&self) -> anyhow::Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker engine did not answer ping")?;
        Ok(())
    }

    async fn create(
        &self,
        stack: &str,
        config: &ResourceConfiguration,
    ) -> Result<InstanceHandle, TrialError> {
        let instance = format!(
            "{}-{}",
            self.settings.instance_prefix,
            nanoid::nanoid!(8, &INSTANCE_ALPHABET)
        );
        info!("creating instance {} of {} at {}", instance, stack, config);

        if let Err(err) = run_template(&self.settings.up, &template_vars(&instance, stack, config)).await {
            // a half-started project would otherwise outlive the trial
            let vars = vec![("instance", instance.clone()), ("stack", stack.to_string())];
            if let Err(cleanup) = run_template(&self.settings.down, &vars).await {
                warn!("cleanup of {} failed: {}", instance, cleanup);
            }
            return Err(err);
        }
        println!("{} {}", "✓".green(), format!("started {instance}").dimmed());
        Ok(self.handle(instance, stack))
    }

    async fn poll_ready(&self, handle: &InstanceHandle) -> anyhow::Result<bool> {
        for component in Component::ALL {
            match self.inspect(handle.containers.get(component)).await? {
                Some(resp) if is_running(&resp) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn refresh(&self, handle: &InstanceHandle) -> anyhow::Result<()> {
        let Some(template) = &self.settings.refresh else {
            return Ok(());
        };

        let vars = vec![
            ("instance", handle.name.clone()),
            ("stack", handle.stack.clone()),
        ];
        run_template(template, &vars).await?;
        Ok(())
    }

    async fn resolve_address(&self, handle: &InstanceHandle) -> anyhow::Result<Option<String>> {
        Ok(self
            .inspect(&handle.containers.component_a)
            .await?
            .and_then(|resp| {
                published_address(
                    &resp,
                    self.settings.component_a_port,
                    &self.settings.address_host,
                )
            }))
    }

    async fn read_reported_spec(&self, handle: &InstanceHandle) -> anyhow::Result<ReportedSpec> {
        let a = self
            .inspect(&handle.containers.component_a)
            .await?
            .context("component A container is gone")?;
        let b = self
            .inspect(&handle.containers.component_b)
            .await?
            .context("component B container is gone")?;

        let stack = a
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(&self.settings.stack_label))
            .cloned();

        Ok(ReportedSpec {
            stack,
            component_a: reported_allocation(&a),
            component_b: reported_allocation(&b),
        })
    }

    async fn destroy(&self, handle: &InstanceHandle) -> anyhow::Result<Teardown> {
        let mut present = false;
        for component in Component::ALL {
            present |= self.inspect(handle.containers.get(component)).await?.is_some();
        }
        if !present {
            return Ok(Teardown::AlreadyAbsent);
        }

        let vars = vec![
            ("instance", handle.name.clone()),
            ("stack", handle.stack.clone()),
        ];
        run_template(&self.settings.down, &vars).await?;
        println!("{} {}", "✓".green(), format!("removed {}", handle.name).dimmed());
        Ok(Teardown::Removed)
    }
}
