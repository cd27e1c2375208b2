//! Docker implementation of the ContainerRuntime boundary, over bollard
//! against the local daemon socket.

// Bollard 0.19 still ships the pre-query_parameters option structs as
// deprecated aliases; they are used here where the replacement has no
// stable shape yet.
#![allow(deprecated)]

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    EndpointSettings, HostConfig, NetworkConnectRequest, NetworkCreateRequest, PortBinding,
    RestartPolicyNameEnum,
};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::resources;
use crate::runtime::{
    labels, ContainerDetails, ContainerRuntime, ContainerSummary, ExecOutcome, NetworkSummary,
    RuntimeError, RuntimeResult, VolumeSummary,
};
use crate::state::{
    scoped_network_name, scoped_volume_name, RestartPolicy, Service, ServiceStatus,
};

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => RuntimeError::NotFound(message),
                409 => RuntimeError::Conflict(message),
                code => RuntimeError::Api {
                    status: code,
                    message,
                },
            },
            other => {
                let message = other.to_string();
                if message.contains("Connection refused")
                    || message.contains("No such file or directory")
                {
                    RuntimeError::Connection(message)
                } else if message.contains("timed out") || message.contains("timeout") {
                    RuntimeError::Timeout(message)
                } else {
                    RuntimeError::Api {
                        status: 500,
                        message,
                    }
                }
            }
        }
    }
}

/// Talks to the local Docker daemon. Every resource it creates carries the
/// iotistic ownership labels, and every listing it returns is filtered down
/// to them.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects over the platform's default local socket and verifies the
    /// daemon answers.
    pub async fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("container daemon is not reachable: {}", e))?;
        info!("connected to local container daemon");
        Ok(Self { docker })
    }
}

/// Separates `"redis:7-alpine"` into name and tag, defaulting to `latest`.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        // A colon inside a registry host (`localhost:5000/img`) is not a tag.
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

/// Builds the Docker create request for a target service: ports, env,
/// volume binds (named volumes against their app-scoped runtime names),
/// resource limits, restart policy, ownership labels and the first declared
/// network. Remaining networks are attached after create.
fn container_config(
    service: &Service,
    app_name: &str,
) -> RuntimeResult<(Config<String>, CreateContainerOptions<String>)> {
    let cfg = &service.config;

    let env: Vec<String> = cfg
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut port_bindings = HashMap::new();
    let mut exposed_ports = HashMap::new();
    for port in &cfg.ports {
        let container_port = format!("{}/{}", port.container_port, port.protocol);
        exposed_ports.insert(container_port.clone(), HashMap::new());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    let binds: Vec<String> = cfg
        .volumes
        .iter()
        .map(|mount| {
            let source = if mount.is_bind_mount() {
                mount.source.clone()
            } else {
                scoped_volume_name(&service.app_id, &mount.source)
            };
            format!("{}:{}", source, mount.target)
        })
        .collect();

    let restart_policy = bollard::models::RestartPolicy {
        name: Some(match cfg.restart_policy {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        }),
        maximum_retry_count: None,
    };

    let invalid =
        |e: resources::ResourceParseError| RuntimeError::InvalidConfig(e.to_string());
    let nano_cpus = cfg
        .resources
        .cpu_limit
        .as_deref()
        .map(resources::cpu_limit_to_nano_cpus)
        .transpose()
        .map_err(invalid)?;
    let cpu_shares = cfg
        .resources
        .cpu_request
        .as_deref()
        .map(resources::cpu_request_to_shares)
        .transpose()
        .map_err(invalid)?;
    let memory = cfg
        .resources
        .memory_limit
        .as_deref()
        .map(resources::parse_memory)
        .transpose()
        .map_err(invalid)?;
    let memory_reservation = cfg
        .resources
        .memory_request
        .as_deref()
        .map(resources::parse_memory)
        .transpose()
        .map_err(invalid)?;

    let first_network = cfg
        .networks
        .first()
        .map(|n| scoped_network_name(&service.app_id, n));

    let host_config = Some(HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(binds),
        network_mode: first_network.clone(),
        restart_policy: Some(restart_policy),
        nano_cpus,
        cpu_shares,
        memory,
        memory_reservation,
        ..Default::default()
    });

    let networking_config = first_network.map(|network| {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            network,
            EndpointSettings {
                aliases: Some(vec![service.service_name.clone()]),
                ..Default::default()
            },
        );
        NetworkingConfig {
            endpoints_config: endpoints,
        }
    });

    let config = Config {
        image: Some(cfg.image.clone()),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        labels: Some(labels::for_container(
            &service.app_id,
            app_name,
            &service.service_id,
            &service.service_name,
        )),
        host_config,
        networking_config,
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: format!("{}_{}", service.app_id, service.service_id),
        platform: None,
    };

    Ok((config, options))
}

fn managed_filter() -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{}=true", labels::MANAGED)],
    );
    filters
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (name, tag) = split_image_tag(image);
        debug!(image, "pulling image");

        let options = bollard::image::CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn has_image(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_start_container(
        &self,
        service: &Service,
        app_name: &str,
    ) -> RuntimeResult<String> {
        let (config, options) = container_config(service, app_name)?;
        let response = self.docker.create_container(Some(options), config).await?;

        // The first declared network rides along on create; the rest are
        // attached before the container starts.
        for network in service.config.networks.iter().skip(1) {
            let scoped = scoped_network_name(&service.app_id, network);
            self.docker
                .connect_network(
                    &scoped,
                    NetworkConnectRequest {
                        container: Some(response.id.clone()),
                        endpoint_config: Some(EndpointSettings {
                            aliases: Some(vec![service.service_name.clone()]),
                            ..Default::default()
                        }),
                    },
                )
                .await?;
        }

        self.docker
            .start_container(
                &response.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await?;
        debug!(
            container = %response.id,
            app_id = %service.app_id,
            service_id = %service.service_id,
            "container started"
        );
        Ok(response.id)
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u32) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or already gone both mean "stopped".
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> RuntimeResult<ContainerDetails> {
        let response = self
            .docker
            .inspect_container(
                container_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await?;

        let status = match response.state.as_ref().and_then(|s| s.running) {
            Some(true) => ServiceStatus::Running,
            _ => ServiceStatus::Stopped,
        };

        let ip_addresses = response
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| {
                networks
                    .into_iter()
                    .filter_map(|(name, endpoint)| {
                        endpoint
                            .ip_address
                            .filter(|ip| !ip.is_empty())
                            .map(|ip| (name, ip))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            status,
            ip_addresses,
        })
    }

    async fn list_managed_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: managed_filter(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let summary = ContainerSummary {
                    id: c.id?,
                    name: c
                        .names
                        .as_ref()
                        .and_then(|n| n.first())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    status: if c.status.as_deref().unwrap_or("").contains("Up") {
                        ServiceStatus::Running
                    } else {
                        ServiceStatus::Stopped
                    },
                    labels: c.labels.unwrap_or_default(),
                };
                labels::is_managed(&summary.labels).then_some(summary)
            })
            .collect())
    }

    async fn get_logs(&self, container_id: &str, tail: usize) -> RuntimeResult<Vec<String>> {
        let options = bollard::query_parameters::LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut lines = Vec::new();
        while let Some(entry) = stream.next().await {
            let output = entry?;
            lines.push(format!("{}", output).trim_end().to_string());
        }
        Ok(lines)
    }

    async fn create_network(
        &self,
        name: &str,
        resource_labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            labels: Some(resource_labels.clone()),
            ..Default::default()
        };
        match self.docker.create_network(request).await {
            Ok(_) => Ok(()),
            // Converging onto an existing network is fine.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        let networks = self
            .docker
            .list_networks(None::<bollard::query_parameters::ListNetworksOptions>)
            .await?;
        Ok(networks
            .into_iter()
            .filter_map(|n| {
                let summary = NetworkSummary {
                    id: n.id.unwrap_or_default(),
                    name: n.name?,
                    labels: n.labels.unwrap_or_default(),
                };
                labels::is_managed(&summary.labels).then_some(summary)
            })
            .collect())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        resource_labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: resource_labels.clone(),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        Ok(())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<VolumeSummary>> {
        let response = self
            .docker
            .list_volumes(None::<bollard::query_parameters::ListVolumesOptions>)
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| {
                let summary = VolumeSummary {
                    name: v.name,
                    labels: v.labels,
                };
                labels::is_managed(&summary.labels).then_some(summary)
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveVolumeOptions { force };
        match self.docker.remove_volume(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec_in_container(
        &self,
        container_id: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await?
        {
            while let Some(chunk) = output.next().await {
                collected.push_str(&format!("{}", chunk?));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output: collected,
        })
    }

    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PortMapping, ServiceConfig, VolumeMount};

    fn test_service() -> Service {
        let mut config = ServiceConfig::new("registry.iotistic.io/telemetry:2.0");
        config.ports = vec![PortMapping::parse("8080:80").unwrap()];
        config.environment.insert("MQTT_HOST".into(), "broker".into());
        config.volumes = vec![
            VolumeMount::parse("data:/var/lib/telemetry").unwrap(),
            VolumeMount::parse("/etc/localtime:/etc/localtime").unwrap(),
        ];
        config.networks = vec!["backend".into()];
        config.resources.cpu_limit = Some("500m".into());
        config.resources.memory_limit = Some("512Mi".into());
        config.resources.memory_request = Some("128Mi".into());
        Service::target("app1", "svc1", "telemetry", config)
    }

    #[test]
    fn split_image_tag_handles_registries() {
        assert_eq!(split_image_tag("redis:7-alpine"), ("redis", "7-alpine"));
        assert_eq!(split_image_tag("postgres"), ("postgres", "latest"));
        assert_eq!(
            split_image_tag("localhost:5000/img"),
            ("localhost:5000/img", "latest")
        );
        assert_eq!(
            split_image_tag("localhost:5000/img:v1"),
            ("localhost:5000/img", "v1")
        );
    }

    #[test]
    fn container_config_carries_ownership_labels() {
        let (config, options) = container_config(&test_service(), "plant-floor").unwrap();

        let container_labels = config.labels.unwrap();
        assert_eq!(
            container_labels.get(labels::APP_ID).map(String::as_str),
            Some("app1")
        );
        assert_eq!(
            container_labels.get(labels::APP_NAME).map(String::as_str),
            Some("plant-floor")
        );
        assert_eq!(
            container_labels.get(labels::SERVICE_ID).map(String::as_str),
            Some("svc1")
        );
        assert_eq!(
            container_labels.get(labels::SERVICE_NAME).map(String::as_str),
            Some("telemetry")
        );
        assert_eq!(
            container_labels.get(labels::MANAGED).map(String::as_str),
            Some("true")
        );
        assert_eq!(container_labels.len(), 5);
        assert_eq!(options.name, "app1_svc1");
    }

    #[test]
    fn container_config_translates_resources() {
        let (config, _) = container_config(&test_service(), "plant-floor").unwrap();
        let host = config.host_config.unwrap();
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.memory, Some(536_870_912));
        assert_eq!(host.memory_reservation, Some(134_217_728));
        assert_eq!(host.cpu_shares, None);
    }

    #[test]
    fn container_config_scopes_named_volumes_only() {
        let (config, _) = container_config(&test_service(), "plant-floor").unwrap();
        let binds = config.host_config.unwrap().binds.unwrap();
        assert!(binds.contains(&"app1_data:/var/lib/telemetry".to_string()));
        assert!(binds.contains(&"/etc/localtime:/etc/localtime".to_string()));
    }

    #[test]
    fn container_config_attaches_first_network() {
        let (config, _) = container_config(&test_service(), "plant-floor").unwrap();
        assert_eq!(
            config.host_config.unwrap().network_mode,
            Some("app1_backend".to_string())
        );
        let networking = config.networking_config.unwrap();
        assert!(networking.endpoints_config.contains_key("app1_backend"));
    }

    #[test]
    fn container_config_rejects_bad_resources() {
        let mut service = test_service();
        service.config.resources.memory_limit = Some("plenty".into());
        let err = container_config(&service, "plant-floor").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig(_)));
        assert!(!err.is_transient());
    }
}
