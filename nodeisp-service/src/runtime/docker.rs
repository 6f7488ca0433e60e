//! Docker Engine API implementation of [`ContainerRuntime`].

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    HostConfig, Mount as DockerMount, MountTypeEnum, PortBinding as DockerPortBinding,
    RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use chrono::DateTime;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::debug;

use super::{
    ContainerRuntime, ContainerState, ContainerSummary, CreateContainer, OutputStream,
};
use crate::descriptor::MountKind;
use crate::error::RuntimeError;
use crate::labels::ContainerQuery;

impl From<DockerError> for RuntimeError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

/// Gateway backed by a local Docker (or API-compatible) daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn label_filters(labels: Vec<String>) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), labels)])
}

fn mount_type(kind: MountKind) -> MountTypeEnum {
    match kind {
        MountKind::Bind => MountTypeEnum::BIND,
        MountKind::Volume => MountTypeEnum::VOLUME,
        MountKind::Tmpfs => MountTypeEnum::TMPFS,
    }
}

fn container_config(spec: &CreateContainer) -> Config<String> {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| DockerMount {
            typ: Some(mount_type(m.kind)),
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            ..Default::default()
        })
        .collect();

    let port_bindings = spec
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| DockerPortBinding {
                    host_ip: Some(b.host_ip.clone()),
                    host_port: Some(b.host_port.clone()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    let exposed_ports = spec
        .exposed_ports
        .iter()
        .map(|p| (p.clone(), HashMap::new()))
        .collect();

    Config {
        tty: Some(true),
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            network_mode: Some(spec.network.clone()),
            mounts: Some(mounts),
            restart_policy: Some(DockerRestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_network(&self, label: &str) -> Result<Option<String>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: label_filters(vec![label.to_string()]),
            }))
            .await?;

        Ok(networks.into_iter().find_map(|n| n.id))
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let response = self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                labels,
                ..Default::default()
            })
            .await?;

        // The Id field changed optionality between Engine API schema
        // versions, so read it from the wire form.
        serde_json::to_value(&response)
            .ok()
            .and_then(|v| v.get("Id").and_then(|id| id.as_str()).map(str::to_string))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RuntimeError::Unexpected("network create returned no ID".into()))
    }

    async fn list_containers(
        &self,
        query: &ContainerQuery,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: label_filters(query.label_filters()),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                    state: ContainerState::parse(c.state.as_deref().unwrap_or_default()),
                    created: c.created.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn pull_image(&self, image: &str, platform: Option<&str>) -> Result<(), RuntimeError> {
        let mut progress = Box::pin(self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                platform: platform.unwrap_or_default().to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));

        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                debug!(image = %image, progress = ?info.progress, "{}", status);
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: spec.platform.clone(),
                }),
                container_config(spec),
            )
            .await?;

        for warning in &response.warnings {
            debug!(container = %spec.name, "create warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.stop_container(id, None).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn attach_output(&self, id: &str) -> Result<OutputStream, RuntimeError> {
        let AttachContainerResults { output, .. } = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        Ok(output
            .map(|chunk| {
                chunk
                    .map(|o| o.into_bytes().to_vec())
                    .map_err(|e| RuntimeError::Stream(e.to_string()))
            })
            .boxed())
    }

    fn wait_not_running(&self, id: &str) -> BoxFuture<'static, Result<i64, RuntimeError>> {
        let docker = self.docker.clone();
        let id = id.to_string();

        async move {
            let mut responses = Box::pin(docker.wait_container(
                &id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));

            match responses.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // Non-zero exits are reported as an error carrying the code.
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(e.into()),
                None => Err(RuntimeError::Unexpected(format!(
                    "wait stream for {id} ended without a status"
                ))),
            }
        }
        .boxed()
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<OutputStream, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|chunk| {
                    chunk
                        .map(|o| o.into_bytes().to_vec())
                        .map_err(|e| RuntimeError::Stream(e.to_string()))
                })
                .boxed()),
            StartExecResults::Detached => Err(RuntimeError::Unexpected(format!(
                "exec {} started detached",
                exec.id
            ))),
        }
    }
}
