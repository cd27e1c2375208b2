#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use iotistic_supervisor::runtime::{
    labels, ContainerDetails, ContainerRuntime, ContainerSummary, ExecOutcome, NetworkSummary,
    RuntimeError, RuntimeResult, VolumeSummary,
};
use iotistic_supervisor::state::{App, Service, ServiceConfig, ServiceStatus, SimpleState};

#[derive(Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ServiceStatus,
    pub labels: HashMap<String, String>,
    pub networks: Vec<String>,
}

/// In-memory ContainerRuntime used by the integration tests. Records every
/// mutating operation in order so tests can assert step sequencing, and can
/// be told to fail specific services or image pulls.
pub struct MockRuntime {
    pub containers: Mutex<HashMap<String, MockContainer>>,
    pub images: Mutex<HashSet<String>>,
    pub networks: Mutex<HashMap<String, HashMap<String, String>>>,
    pub volumes: Mutex<HashMap<String, HashMap<String, String>>>,
    pub operations: Mutex<Vec<String>>,
    pub fail_start_services: Mutex<HashSet<String>>,
    pub fail_pull_images: Mutex<HashSet<String>>,
    pub exec_results: Mutex<HashMap<String, ExecOutcome>>,
    pub exec_delay: Mutex<Option<Duration>>,
    pub container_ip: Mutex<String>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashSet::new()),
            networks: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            fail_start_services: Mutex::new(HashSet::new()),
            fail_pull_images: Mutex::new(HashSet::new()),
            exec_results: Mutex::new(HashMap::new()),
            exec_delay: Mutex::new(None),
            container_ip: Mutex::new("127.0.0.1".to_string()),
        })
    }

    pub async fn operations(&self) -> Vec<String> {
        self.operations.lock().await.clone()
    }

    pub async fn clear_operations(&self) {
        self.operations.lock().await.clear();
    }

    pub async fn fail_start_of(&self, service_id: &str) {
        self.fail_start_services
            .lock()
            .await
            .insert(service_id.to_string());
    }

    pub async fn heal_start_of(&self, service_id: &str) {
        self.fail_start_services.lock().await.remove(service_id);
    }

    pub async fn set_exec_result(&self, container_id: &str, exit_code: i64, output: &str) {
        self.exec_results.lock().await.insert(
            container_id.to_string(),
            ExecOutcome {
                exit_code,
                output: output.to_string(),
            },
        );
    }

    /// Registers a running container outside of the engine, as if a previous
    /// supervisor process had created it.
    pub async fn seed_container(&self, service: &Service, app_name: &str) -> String {
        let id = format!("seeded-{}", Uuid::new_v4());
        let container = MockContainer {
            id: id.clone(),
            name: format!("{}_{}", service.app_id, service.service_id),
            image: service.config.image.clone(),
            status: ServiceStatus::Running,
            labels: labels::for_container(
                &service.app_id,
                app_name,
                &service.service_id,
                &service.service_name,
            ),
            networks: service.config.networks.clone(),
        };
        self.containers.lock().await.insert(id.clone(), container);
        id
    }

    async fn record(&self, operation: String) {
        self.operations.lock().await.push(operation);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        if self.fail_pull_images.lock().await.contains(image) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("mock registry refused {}", image),
            });
        }
        self.record(format!("pullImage({})", image)).await;
        self.images.lock().await.insert(image.to_string());
        Ok(())
    }

    async fn has_image(&self, image: &str) -> RuntimeResult<bool> {
        Ok(self.images.lock().await.contains(image))
    }

    async fn create_and_start_container(
        &self,
        service: &Service,
        app_name: &str,
    ) -> RuntimeResult<String> {
        if self
            .fail_start_services
            .lock()
            .await
            .contains(&service.service_id)
        {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("mock daemon refused to start {}", service.service_id),
            });
        }

        let id = format!("mock-{}", Uuid::new_v4());
        self.record(format!(
            "startContainer({}/{})",
            service.app_id, service.service_id
        ))
        .await;

        let container = MockContainer {
            id: id.clone(),
            name: format!("{}_{}", service.app_id, service.service_id),
            image: service.config.image.clone(),
            status: ServiceStatus::Running,
            labels: labels::for_container(
                &service.app_id,
                app_name,
                &service.service_id,
                &service.service_name,
            ),
            networks: service.config.networks.clone(),
        };
        self.containers.lock().await.insert(id.clone(), container);
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u32) -> RuntimeResult<()> {
        self.record(format!("stopContainer({})", container_id)).await;
        if let Some(container) = self.containers.lock().await.get_mut(container_id) {
            container.status = ServiceStatus::Stopped;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> RuntimeResult<()> {
        self.record(format!("removeContainer({})", container_id))
            .await;
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> RuntimeResult<ContainerDetails> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no container {}", container_id)))?;
        let ip = self.container_ip.lock().await.clone();
        let mut ip_addresses = HashMap::new();
        let network = container
            .networks
            .first()
            .cloned()
            .unwrap_or_else(|| "bridge".to_string());
        ip_addresses.insert(network, ip);
        Ok(ContainerDetails {
            id: container.id.clone(),
            status: container.status.clone(),
            ip_addresses,
        })
    }

    async fn list_managed_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let containers = self.containers.lock().await;
        Ok(containers
            .values()
            .filter(|c| labels::is_managed(&c.labels))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                status: c.status.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn get_logs(&self, _container_id: &str, _tail: usize) -> RuntimeResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn create_network(
        &self,
        name: &str,
        resource_labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        self.record(format!("createNetwork({})", name)).await;
        self.networks
            .lock()
            .await
            .insert(name.to_string(), resource_labels.clone());
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        let networks = self.networks.lock().await;
        Ok(networks
            .iter()
            .filter(|(_, labels)| labels::is_managed(labels))
            .map(|(name, labels)| NetworkSummary {
                id: name.clone(),
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.record(format!("removeNetwork({})", name)).await;
        self.networks.lock().await.remove(name);
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        resource_labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        self.record(format!("createVolume({})", name)).await;
        self.volumes
            .lock()
            .await
            .insert(name.to_string(), resource_labels.clone());
        Ok(())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<VolumeSummary>> {
        let volumes = self.volumes.lock().await;
        Ok(volumes
            .iter()
            .filter(|(_, labels)| labels::is_managed(labels))
            .map(|(name, labels)| VolumeSummary {
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> RuntimeResult<()> {
        self.record(format!("removeVolume({})", name)).await;
        self.volumes.lock().await.remove(name);
        Ok(())
    }

    async fn exec_in_container(
        &self,
        container_id: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutcome> {
        if let Some(delay) = *self.exec_delay.lock().await {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("exec({}: {})", container_id, command.join(" ")))
            .await;
        let results = self.exec_results.lock().await;
        Ok(results.get(container_id).cloned().unwrap_or(ExecOutcome {
            exit_code: 0,
            output: String::new(),
        }))
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Builds a target service with sensible defaults for tests.
pub fn service(app_id: &str, service_id: &str, image: &str) -> Service {
    Service::target(app_id, service_id, service_id, ServiceConfig::new(image))
}

pub fn app_with(app_id: &str, app_name: &str, services: Vec<Service>) -> App {
    let mut app = App::new(app_id, app_name);
    for service in services {
        app = app.with_service(service);
    }
    app
}

pub fn state_with(apps: Vec<App>) -> SimpleState {
    let mut state = SimpleState::new();
    for app in apps {
        state = state.with_app(app);
    }
    state
}

/// Index of the first operation containing `needle`, panicking when absent.
pub fn op_index(operations: &[String], needle: &str) -> usize {
    operations
        .iter()
        .position(|op| op.contains(needle))
        .unwrap_or_else(|| panic!("operation containing '{}' not found in {:?}", needle, operations))
}
