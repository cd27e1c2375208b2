//! Target/current state diffing and step planning. `plan_steps` is a pure
//! function of the two states; everything it emits is ordered so that a
//! container is never started before its network/volume dependencies exist,
//! and networks/volumes are never removed while a container may still
//! reference them.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::runtime::ContainerRuntime;
use crate::state::{Service, ServiceConfig, SimpleState};
use crate::store::StateStore;

/// A single atomic runtime operation produced by the diff. Each step carries
/// enough identity for the executor and for test assertions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    PullImage {
        app_id: String,
        service_id: String,
        image: String,
    },
    CreateVolume {
        app_id: String,
        volume_name: String,
    },
    CreateNetwork {
        app_id: String,
        network_name: String,
    },
    StopContainer {
        app_id: String,
        service_id: String,
        container_id: String,
    },
    RemoveContainer {
        app_id: String,
        service_id: String,
        container_id: String,
    },
    StartContainer {
        app_id: String,
        service_id: String,
    },
    RemoveNetwork {
        app_id: String,
        network_name: String,
    },
    RemoveVolume {
        app_id: String,
        volume_name: String,
    },
}

impl Step {
    /// Backoff key. Service lifecycle steps share one key so a failing
    /// service backs off as a unit; network/volume steps get their own.
    pub fn key(&self) -> String {
        match self {
            Step::PullImage { app_id, service_id, .. }
            | Step::StopContainer { app_id, service_id, .. }
            | Step::RemoveContainer { app_id, service_id, .. }
            | Step::StartContainer { app_id, service_id } => {
                format!("{}:{}", app_id, service_id)
            }
            Step::CreateNetwork { app_id, network_name }
            | Step::RemoveNetwork { app_id, network_name } => {
                format!("{}:network:{}", app_id, network_name)
            }
            Step::CreateVolume { app_id, volume_name }
            | Step::RemoveVolume { app_id, volume_name } => {
                format!("{}:volume:{}", app_id, volume_name)
            }
        }
    }

    /// Identity of the service whose lifecycle this step belongs to, if any.
    /// Used to skip the rest of a stop→remove→start chain once a link fails.
    pub fn service_key(&self) -> Option<String> {
        match self {
            Step::PullImage { app_id, service_id, .. }
            | Step::StopContainer { app_id, service_id, .. }
            | Step::RemoveContainer { app_id, service_id, .. }
            | Step::StartContainer { app_id, service_id } => {
                Some(format!("{}:{}", app_id, service_id))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::PullImage { image, .. } => write!(f, "pullImage({})", image),
            Step::CreateVolume { app_id, volume_name } => {
                write!(f, "createVolume({}/{})", app_id, volume_name)
            }
            Step::CreateNetwork { app_id, network_name } => {
                write!(f, "createNetwork({}/{})", app_id, network_name)
            }
            Step::StopContainer { app_id, service_id, .. } => {
                write!(f, "stopContainer({}/{})", app_id, service_id)
            }
            Step::RemoveContainer { app_id, service_id, .. } => {
                write!(f, "removeContainer({}/{})", app_id, service_id)
            }
            Step::StartContainer { app_id, service_id } => {
                write!(f, "startContainer({}/{})", app_id, service_id)
            }
            Step::RemoveNetwork { app_id, network_name } => {
                write!(f, "removeNetwork({}/{})", app_id, network_name)
            }
            Step::RemoveVolume { app_id, volume_name } => {
                write!(f, "removeVolume({}/{})", app_id, volume_name)
            }
        }
    }
}

/// Computes the ordered step list that takes `current` to `target`.
///
/// Phase order is strict: image pulls, volume creates, network creates,
/// per-service stop+remove, starts, network removals, volume removals.
/// Within one service the stop→remove pair is adjacent and sequential.
/// A converged state plans an empty list.
pub fn plan_steps(target: &SimpleState, current: &SimpleState) -> Vec<Step> {
    let mut pulls = Vec::new();
    let mut volume_creates = BTreeSet::new();
    let mut network_creates = BTreeSet::new();
    let mut teardowns = Vec::new();
    let mut starts = Vec::new();
    let mut network_removes = BTreeSet::new();
    let mut volume_removes = BTreeSet::new();

    let mut pulled_images: HashSet<(String, String)> = HashSet::new();

    // Target-side walk: new and changed services, plus the networks/volumes
    // they will need. Sorted iteration keeps plans deterministic.
    for app_id in sorted_keys(&target.apps) {
        let target_app = &target.apps[&app_id];
        let current_app = current.apps.get(&app_id);

        for service_id in sorted_keys(&target_app.services) {
            let target_service = &target_app.services[&service_id];
            let current_service = current_app.and_then(|a| a.services.get(&service_id));

            let needs_recreate = match current_service {
                None => true,
                Some(cs) => match cs.config.diff_against(&target_service.config) {
                    Some(dimension) => {
                        debug!(
                            app_id = %app_id,
                            service_id = %service_id,
                            changed = dimension,
                            "service config drifted, scheduling recreate"
                        );
                        true
                    }
                    // Config matches but no container exists yet (e.g. an
                    // earlier start failed, or it vanished at the runtime).
                    None => cs.container_id.is_none(),
                },
            };
            if !needs_recreate {
                continue;
            }

            if pulled_images.insert((app_id.clone(), target_service.config.image.clone())) {
                pulls.push(Step::PullImage {
                    app_id: app_id.clone(),
                    service_id: service_id.clone(),
                    image: target_service.config.image.clone(),
                });
            }

            for volume in &target_service.config.volumes {
                if volume.is_bind_mount() {
                    continue;
                }
                let exists = current_app
                    .map(|a| a.volumes.contains(&volume.source))
                    .unwrap_or(false);
                if !exists {
                    volume_creates.insert(Step::CreateVolume {
                        app_id: app_id.clone(),
                        volume_name: volume.source.clone(),
                    });
                }
            }

            for network in &target_service.config.networks {
                let exists = current_app
                    .map(|a| a.networks.contains(network))
                    .unwrap_or(false);
                if !exists {
                    network_creates.insert(Step::CreateNetwork {
                        app_id: app_id.clone(),
                        network_name: network.clone(),
                    });
                }
            }

            // Old container goes away first; the start below re-attaches the
            // service to its declared networks.
            if let Some(container_id) = current_service.and_then(|s| s.container_id.clone()) {
                teardowns.push(Step::StopContainer {
                    app_id: app_id.clone(),
                    service_id: service_id.clone(),
                    container_id: container_id.clone(),
                });
                teardowns.push(Step::RemoveContainer {
                    app_id: app_id.clone(),
                    service_id: service_id.clone(),
                    container_id,
                });
            }

            starts.push(Step::StartContainer {
                app_id: app_id.clone(),
                service_id: service_id.clone(),
            });
        }
    }

    // Current-side walk: services and whole apps that left the target.
    for app_id in sorted_keys(&current.apps) {
        let current_app = &current.apps[&app_id];
        let target_app = target.apps.get(&app_id);

        for service_id in sorted_keys(&current_app.services) {
            let current_service = &current_app.services[&service_id];
            let still_wanted = target_app
                .map(|a| a.services.contains_key(&service_id))
                .unwrap_or(false);
            if still_wanted {
                continue;
            }
            if let Some(container_id) = current_service.container_id.clone() {
                teardowns.push(Step::StopContainer {
                    app_id: app_id.clone(),
                    service_id: service_id.clone(),
                    container_id: container_id.clone(),
                });
                teardowns.push(Step::RemoveContainer {
                    app_id: app_id.clone(),
                    service_id: service_id.clone(),
                    container_id,
                });
            }
        }

        // Networks/volumes this app owns but no service will reference once
        // this pass completes. Every non-target container is stopped and
        // removed in an earlier phase of the same pass, so only target-side
        // references keep a resource alive.
        let (referenced_networks, referenced_volumes) = match target_app {
            Some(target_app) => (target_app.networks_in_use(), target_app.volumes_in_use()),
            None => (HashSet::new(), HashSet::new()),
        };

        for network in &current_app.networks {
            if !referenced_networks.contains(network) {
                network_removes.insert(Step::RemoveNetwork {
                    app_id: app_id.clone(),
                    network_name: network.clone(),
                });
            }
        }
        for volume in &current_app.volumes {
            if !referenced_volumes.contains(volume) {
                volume_removes.insert(Step::RemoveVolume {
                    app_id: app_id.clone(),
                    volume_name: volume.clone(),
                });
            }
        }
    }

    let mut steps = pulls;
    steps.extend(volume_creates);
    steps.extend(network_creates);
    steps.extend(teardowns);
    steps.extend(starts);
    steps.extend(network_removes);
    steps.extend(volume_removes);
    steps
}

fn sorted_keys<V>(map: &std::collections::HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// Holds the device's target and current state and produces step plans.
/// `current` is only ever mutated by the StepExecutor reflecting runtime
/// truth; `set_target` is the single entry point for desired state.
pub struct Reconciler {
    target: Arc<RwLock<SimpleState>>,
    current: Arc<RwLock<SimpleState>>,
    store: Arc<dyn StateStore>,
    pending: AtomicBool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            target: Arc::new(RwLock::new(SimpleState::new())),
            current: Arc::new(RwLock::new(SimpleState::new())),
            store,
            pending: AtomicBool::new(false),
        }
    }

    /// Validates and stores a new target state, and marks a convergence
    /// pass as pending. Never touches current state and never blocks on a
    /// running pass.
    pub async fn set_target(&self, state: SimpleState) -> Result<()> {
        state.validate().context("rejecting invalid target state")?;
        self.store
            .save_target(&state)
            .await
            .context("persisting target state")?;
        let app_count = state.apps.len();
        *self.target.write().await = state;
        self.pending.store(true, Ordering::SeqCst);
        info!(apps = app_count, "accepted new target state");
        Ok(())
    }

    /// Loads the last persisted target state, e.g. on process start.
    pub async fn load_target(&self) -> Result<()> {
        if let Some(state) = self.store.load_target().await? {
            *self.target.write().await = state;
            self.pending.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn get_target(&self) -> SimpleState {
        self.target.read().await.clone()
    }

    pub async fn get_current(&self) -> SimpleState {
        self.current.read().await.clone()
    }

    /// Shared handle the StepExecutor mutates as steps succeed.
    pub fn current_handle(&self) -> Arc<RwLock<SimpleState>> {
        Arc::clone(&self.current)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn mark_pending(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn clear_pending(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Computes the ordered step list for one convergence pass. Calling this
    /// twice without an intervening runtime change yields an empty second
    /// plan.
    pub async fn plan(&self) -> Vec<Step> {
        let target = self.target.read().await;
        let current = self.current.read().await;
        plan_steps(&target, &current)
    }

    /// Persists the current snapshot after a step batch.
    pub async fn save_current(&self) -> Result<()> {
        let current = self.current.read().await;
        self.store.save_current(&current).await
    }

    /// Rebuilds current state from runtime truth. Containers bearing our
    /// ownership labels are matched back to the persisted snapshot to
    /// recover their full config; a labeled container the snapshot does not
    /// know (e.g. a crash between create and persist) is adopted with a
    /// bare config so the next pass recreates it cleanly. Labeled networks
    /// and volumes are folded back into per-app bookkeeping.
    pub async fn sync_current_from_runtime(
        &self,
        runtime: &dyn ContainerRuntime,
    ) -> Result<()> {
        let persisted = self.store.load_current().await?.unwrap_or_default();
        let containers = runtime.list_managed_containers().await?;
        let networks = runtime.list_networks().await?;
        let volumes = runtime.list_volumes().await?;

        let mut rebuilt = SimpleState::new();

        for summary in containers {
            let (app_id, service_id) = match (summary.app_id(), summary.service_id()) {
                (Some(a), Some(s)) => (a.to_string(), s.to_string()),
                _ => {
                    warn!(container = %summary.id, "managed container missing identity labels, ignoring");
                    continue;
                }
            };
            let app_name = summary.app_name().unwrap_or(&app_id).to_string();
            let service_name = summary.service_name().unwrap_or(&service_id).to_string();

            let known = persisted
                .service(&app_id, &service_id)
                .filter(|s| s.container_id.as_deref() == Some(summary.id.as_str()));
            let config = match known {
                Some(service) => service.config.clone(),
                None => {
                    debug!(
                        container = %summary.id,
                        app_id = %app_id,
                        service_id = %service_id,
                        "adopting unrecorded managed container"
                    );
                    ServiceConfig::new(&summary.image)
                }
            };

            let app = rebuilt
                .apps
                .entry(app_id.clone())
                .or_insert_with(|| crate::state::App::new(&app_id, &app_name));
            app.services.insert(
                service_id.clone(),
                Service {
                    app_id: app_id.clone(),
                    service_id,
                    service_name,
                    config,
                    container_id: Some(summary.id),
                    status: summary.status,
                },
            );
        }

        for network in networks {
            if let Some((app_id, name)) = network.name.split_once('_') {
                let app = rebuilt
                    .apps
                    .entry(app_id.to_string())
                    .or_insert_with(|| crate::state::App::new(app_id, app_id));
                if !app.networks.contains(&name.to_string()) {
                    app.networks.push(name.to_string());
                }
            }
        }
        for volume in volumes {
            if let Some((app_id, name)) = volume.name.split_once('_') {
                let app = rebuilt
                    .apps
                    .entry(app_id.to_string())
                    .or_insert_with(|| crate::state::App::new(app_id, app_id));
                if !app.volumes.contains(&name.to_string()) {
                    app.volumes.push(name.to_string());
                }
            }
        }

        let container_count: usize = rebuilt.apps.values().map(|a| a.services.len()).sum();
        info!(apps = rebuilt.apps.len(), services = container_count, "synced current state from runtime");

        *self.current.write().await = rebuilt;
        self.save_current().await
    }
}
