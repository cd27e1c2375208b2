use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::state::{Service, ServiceStatus};

/// Ownership labels stamped on every container, network and volume the
/// engine creates. Only resources carrying `iotistic.managed=true` are ever
/// considered for removal; foreign containers on the same daemon are
/// invisible to the engine.
pub mod labels {
    use std::collections::HashMap;

    pub const APP_ID: &str = "iotistic.app-id";
    pub const APP_NAME: &str = "iotistic.app-name";
    pub const SERVICE_ID: &str = "iotistic.service-id";
    pub const SERVICE_NAME: &str = "iotistic.service-name";
    pub const MANAGED: &str = "iotistic.managed";

    pub fn for_container(
        app_id: &str,
        app_name: &str,
        service_id: &str,
        service_name: &str,
    ) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(APP_ID.to_string(), app_id.to_string());
        labels.insert(APP_NAME.to_string(), app_name.to_string());
        labels.insert(SERVICE_ID.to_string(), service_id.to_string());
        labels.insert(SERVICE_NAME.to_string(), service_name.to_string());
        labels.insert(MANAGED.to_string(), "true".to_string());
        labels
    }

    pub fn for_resource(app_id: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(APP_ID.to_string(), app_id.to_string());
        labels.insert(MANAGED.to_string(), "true".to_string());
        labels
    }

    pub fn is_managed(labels: &HashMap<String, String>) -> bool {
        labels.get(MANAGED).map(|v| v == "true").unwrap_or(false)
    }
}

/// Error taxonomy at the runtime boundary. The executor retries transient
/// failures through the RetryManager and skips/reports terminal ones.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("cannot reach container runtime: {0}")]
    Connection(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("resource in a conflicting state: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("runtime API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RuntimeError {
    /// Transient failures are worth another attempt after backoff; terminal
    /// ones require a new target state or operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::Connection(_) | RuntimeError::Timeout(_) | RuntimeError::Conflict(_) => {
                true
            }
            RuntimeError::Api { status, .. } => *status >= 500,
            RuntimeError::NotFound(_) | RuntimeError::InvalidConfig(_) => false,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A managed container as reported by a runtime listing.
#[derive(Clone, Debug)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ServiceStatus,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn app_id(&self) -> Option<&str> {
        self.labels.get(labels::APP_ID).map(|s| s.as_str())
    }

    pub fn app_name(&self) -> Option<&str> {
        self.labels.get(labels::APP_NAME).map(|s| s.as_str())
    }

    pub fn service_id(&self) -> Option<&str> {
        self.labels.get(labels::SERVICE_ID).map(|s| s.as_str())
    }

    pub fn service_name(&self) -> Option<&str> {
        self.labels.get(labels::SERVICE_NAME).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ContainerDetails {
    pub id: String,
    pub status: ServiceStatus,
    /// IP address per attached network, as reported by the runtime.
    pub ip_addresses: HashMap<String, String>,
}

impl ContainerDetails {
    /// Address of the container's first network interface, used by health
    /// probes.
    pub fn first_ip(&self) -> Option<&str> {
        self.ip_addresses.values().next().map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct VolumeSummary {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

/// The boundary between the reconciliation engine and the container engine.
/// The Reconciler and StepExecutor never talk to a daemon except through
/// this trait, which is what makes the engine testable against a mock.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    async fn has_image(&self, image: &str) -> RuntimeResult<bool>;

    /// Creates the container for a target service, connects it to its
    /// declared networks and starts it. Returns the new container id.
    async fn create_and_start_container(
        &self,
        service: &Service,
        app_name: &str,
    ) -> RuntimeResult<String>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u32) -> RuntimeResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect_container(&self, container_id: &str) -> RuntimeResult<ContainerDetails>;

    /// Containers bearing the full ownership label set. Foreign containers
    /// are never returned.
    async fn list_managed_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    async fn get_logs(&self, container_id: &str, tail: usize) -> RuntimeResult<Vec<String>>;

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<()>;

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>>;

    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<()>;

    async fn list_volumes(&self) -> RuntimeResult<Vec<VolumeSummary>>;

    async fn remove_volume(&self, name: &str, force: bool) -> RuntimeResult<()>;

    /// Runs a command inside a running container, for exec health probes.
    async fn exec_in_container(
        &self,
        container_id: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutcome>;

    async fn ping(&self) -> bool;
}
