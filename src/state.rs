use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::health::HealthCheck;

/// Lifecycle status of a service's container as observed at the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "starting" => ServiceStatus::Starting,
            "running" => ServiceStatus::Running,
            "stopping" => ServiceStatus::Stopping,
            _ => ServiceStatus::Stopped,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String, // "tcp" or "udp"
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    /// Parses `"8080:80"` or `"8080:80/udp"`.
    pub fn parse(s: &str) -> Result<Self> {
        let (mapping, protocol) = match s.split_once('/') {
            Some((m, p)) if p == "tcp" || p == "udp" => (m, p.to_string()),
            Some((_, p)) => bail!("invalid port protocol '{}' in '{}'", p, s),
            None => (s, default_protocol()),
        };
        let (host, container) = mapping
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid port mapping '{}', expected host:container", s))?;
        Ok(Self {
            host_port: host.parse()?,
            container_port: container.parse()?,
            protocol,
        })
    }
}

/// A single volume entry of a service. Named volumes (`data:/var/lib/data`)
/// are lifecycle-managed by the engine; bind mounts (`/host/path:/in/container`)
/// are passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

impl VolumeMount {
    pub fn parse(s: &str) -> Result<Self> {
        let (source, target) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid volume '{}', expected source:target", s))?;
        if source.is_empty() || target.is_empty() {
            bail!("invalid volume '{}', empty source or target", s);
        }
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    pub fn is_bind_mount(&self) -> bool {
        self.source.starts_with('/')
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Always
    }
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

/// Raw resource limits/requests as supplied by the control plane. Values are
/// kept as strings (`"500m"`, `"512Mi"`) and translated to runtime units by
/// the `resources` module when a container is created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
}

impl ResourceConfig {
    pub fn is_empty(&self) -> bool {
        self.cpu_limit.is_none()
            && self.cpu_request.is_none()
            && self.memory_limit.is_none()
            && self.memory_request.is_none()
    }
}

/// The full mutable configuration of a service. Target and current services
/// share this shape; two services are "unchanged" iff every field here is
/// equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl ServiceConfig {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ports: Vec::new(),
            environment: HashMap::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            resources: ResourceConfig::default(),
            restart_policy: RestartPolicy::default(),
            health_check: None,
        }
    }

    /// Canonical change detector. Compares every mutable dimension of the
    /// config and returns the first one that differs, or None if the configs
    /// are equivalent. Ordering of ports/volumes/networks and env entries is
    /// irrelevant. Every field added to this struct must be compared here,
    /// otherwise drift in that dimension becomes invisible to reconciliation.
    pub fn diff_against(&self, other: &ServiceConfig) -> Option<&'static str> {
        if self.image != other.image {
            return Some("image");
        }
        if sorted(&self.ports) != sorted(&other.ports) {
            return Some("ports");
        }
        if self.environment != other.environment {
            return Some("environment");
        }
        if sorted(&self.volumes) != sorted(&other.volumes) {
            return Some("volumes");
        }
        if as_set(&self.networks) != as_set(&other.networks) {
            return Some("networks");
        }
        if self.resources != other.resources {
            return Some("resources");
        }
        if self.restart_policy != other.restart_policy {
            return Some("restart_policy");
        }
        if self.health_check != other.health_check {
            return Some("health_check");
        }
        None
    }
}

fn sorted<T: Clone + Ord>(items: &[T]) -> Vec<T> {
    let mut v = items.to_vec();
    v.sort();
    v
}

fn as_set(items: &[String]) -> HashSet<&str> {
    items.iter().map(|s| s.as_str()).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub app_id: String,
    pub service_id: String,
    pub service_name: String,
    pub config: ServiceConfig,
    /// Present only once a container exists at the runtime (current side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default = "default_status")]
    pub status: ServiceStatus,
}

fn default_status() -> ServiceStatus {
    ServiceStatus::Stopped
}

impl Service {
    pub fn target(app_id: &str, service_id: &str, service_name: &str, config: ServiceConfig) -> Self {
        Self {
            app_id: app_id.to_string(),
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            config,
            container_id: None,
            status: ServiceStatus::Stopped,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub app_id: String,
    pub app_name: String,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    /// Networks this app currently owns at the runtime. Maintained on the
    /// current side only, by the StepExecutor, so a network whose last
    /// referencing service is gone still shows up here until it is removed.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Same bookkeeping as `networks`, for named volumes.
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl App {
    pub fn new(app_id: &str, app_name: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_name: app_name.to_string(),
            services: HashMap::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.insert(service.service_id.clone(), service);
        self
    }

    /// Network names referenced by any service of this app.
    pub fn networks_in_use(&self) -> HashSet<String> {
        self.services
            .values()
            .flat_map(|s| s.config.networks.iter().cloned())
            .collect()
    }

    /// Named (non-bind) volume sources referenced by any service of this app.
    pub fn volumes_in_use(&self) -> HashSet<String> {
        self.services
            .values()
            .flat_map(|s| s.config.volumes.iter())
            .filter(|v| !v.is_bind_mount())
            .map(|v| v.source.clone())
            .collect()
    }
}

/// Full device state: either the desired topology supplied by the control
/// plane (target) or the engine's view of what the runtime has (current).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleState {
    #[serde(default)]
    pub apps: HashMap<String, App>,
}

impl SimpleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, app: App) -> Self {
        self.apps.insert(app.app_id.clone(), app);
        self
    }

    /// Shape validation applied on SetTarget: ids must be consistent with
    /// their map keys, and every port/volume string must already have parsed.
    pub fn validate(&self) -> Result<()> {
        for (app_id, app) in &self.apps {
            if app_id != &app.app_id {
                bail!("app key '{}' does not match app_id '{}'", app_id, app.app_id);
            }
            if app.app_id.is_empty() || app.app_id.contains('_') {
                bail!("invalid app_id '{}' (must be non-empty, without '_')", app.app_id);
            }
            for (service_id, service) in &app.services {
                if service_id != &service.service_id {
                    bail!(
                        "service key '{}' does not match service_id '{}' in app '{}'",
                        service_id,
                        service.service_id,
                        app.app_id
                    );
                }
                if service.app_id != app.app_id {
                    bail!(
                        "service '{}' carries app_id '{}' but belongs to app '{}'",
                        service.service_id,
                        service.app_id,
                        app.app_id
                    );
                }
                if service.config.image.is_empty() {
                    bail!(
                        "service '{}/{}' has no image",
                        app.app_id,
                        service.service_id
                    );
                }
            }
        }
        Ok(())
    }

    pub fn service(&self, app_id: &str, service_id: &str) -> Option<&Service> {
        self.apps.get(app_id)?.services.get(service_id)
    }

    pub fn service_mut(&mut self, app_id: &str, service_id: &str) -> Option<&mut Service> {
        self.apps.get_mut(app_id)?.services.get_mut(service_id)
    }
}

/// Runtime name of an app-scoped network: `{app_id}_{network_name}`. Keeps
/// two apps' `backend` networks from colliding on one device.
pub fn scoped_network_name(app_id: &str, network: &str) -> String {
    format!("{}_{}", app_id, network)
}

/// Runtime name of an app-scoped named volume: `{app_id}_{volume_name}`.
pub fn scoped_volume_name(app_id: &str, volume: &str) -> String {
    format!("{}_{}", app_id, volume)
}
