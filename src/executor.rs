use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::reconciler::Step;
use crate::retry::RetryManager;
use crate::runtime::{labels, ContainerRuntime, RuntimeError};
use crate::state::{
    scoped_network_name, scoped_volume_name, App, Service, ServiceStatus, SimpleState,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// Not attempted this pass; the target stays pending.
    Skipped { reason: String },
    /// Attempted and failed. Transient failures re-enter backoff; terminal
    /// ones need a new target state or operator action.
    Failed { error: String, terminal: bool },
}

#[derive(Clone, Debug)]
pub struct StepResult {
    pub step: Step,
    pub outcome: StepOutcome,
}

impl StepResult {
    pub fn executed(&self) -> bool {
        self.outcome == StepOutcome::Executed
    }
}

/// Walks a step list against the ContainerRuntime, consulting the
/// RetryManager before each step and folding every success into current
/// state immediately. One failing service never aborts the rest of the
/// pass; only later steps of the same service's lifecycle chain are skipped.
pub struct StepExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    retry: RetryManager,
    current: Arc<RwLock<SimpleState>>,
    stop_timeout_secs: u32,
}

impl StepExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        retry: RetryManager,
        current: Arc<RwLock<SimpleState>>,
        stop_timeout_secs: u32,
    ) -> Self {
        Self {
            runtime,
            retry,
            current,
            stop_timeout_secs,
        }
    }

    pub async fn execute(&self, steps: Vec<Step>, target: &SimpleState) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(steps.len());
        let mut failed_services: HashSet<String> = HashSet::new();

        for step in steps {
            let key = step.key();

            if let Some(service_key) = step.service_key() {
                if failed_services.contains(&service_key) {
                    results.push(StepResult {
                        step,
                        outcome: StepOutcome::Skipped {
                            reason: "earlier step for this service failed".to_string(),
                        },
                    });
                    continue;
                }
            }

            if !self.retry.should_retry(&key).await {
                let reason = if self.retry.is_max_retries_exceeded(&key).await {
                    "max retries exceeded, waiting for new target or operator action".to_string()
                } else {
                    "backing off".to_string()
                };
                debug!(step = %step, %reason, "skipping step");
                results.push(StepResult {
                    step,
                    outcome: StepOutcome::Skipped { reason },
                });
                continue;
            }

            match self.run_step(&step, target).await {
                Ok(()) => {
                    self.retry.record_success(&key).await;
                    debug!(step = %step, "step succeeded");
                    results.push(StepResult {
                        step,
                        outcome: StepOutcome::Executed,
                    });
                }
                Err(e) => {
                    let terminal = !e.is_transient();
                    let error = e.to_string();
                    if terminal {
                        warn!(step = %step, %error, "step failed with a configuration error, not retrying");
                    } else {
                        warn!(step = %step, %error, "step failed, will back off");
                        self.retry.record_failure(&key, &error).await;
                    }
                    if let Some(service_key) = step.service_key() {
                        failed_services.insert(service_key);
                    }
                    results.push(StepResult {
                        step,
                        outcome: StepOutcome::Failed { error, terminal },
                    });
                }
            }
        }

        let executed = results.iter().filter(|r| r.executed()).count();
        if executed > 0 {
            info!(executed, total = results.len(), "step batch finished");
        }
        results
    }

    async fn run_step(&self, step: &Step, target: &SimpleState) -> Result<(), RuntimeError> {
        match step {
            Step::PullImage { image, .. } => {
                if self.runtime.has_image(image).await? {
                    return Ok(());
                }
                self.runtime.pull_image(image).await
            }

            Step::CreateVolume { app_id, volume_name } => {
                let scoped = scoped_volume_name(app_id, volume_name);
                self.runtime
                    .create_volume(&scoped, &labels::for_resource(app_id))
                    .await?;
                let mut current = self.current.write().await;
                let app = app_entry(&mut current, app_id, target);
                if !app.volumes.contains(volume_name) {
                    app.volumes.push(volume_name.clone());
                }
                Ok(())
            }

            Step::CreateNetwork { app_id, network_name } => {
                let scoped = scoped_network_name(app_id, network_name);
                self.runtime
                    .create_network(&scoped, &labels::for_resource(app_id))
                    .await?;
                let mut current = self.current.write().await;
                let app = app_entry(&mut current, app_id, target);
                if !app.networks.contains(network_name) {
                    app.networks.push(network_name.clone());
                }
                Ok(())
            }

            Step::StopContainer {
                app_id,
                service_id,
                container_id,
            } => {
                self.runtime
                    .stop_container(container_id, self.stop_timeout_secs)
                    .await?;
                let mut current = self.current.write().await;
                if let Some(service) = current.service_mut(app_id, service_id) {
                    service.status = ServiceStatus::Stopped;
                }
                Ok(())
            }

            Step::RemoveContainer {
                app_id,
                service_id,
                container_id,
            } => {
                self.runtime.remove_container(container_id, false).await?;
                let mut current = self.current.write().await;
                let still_wanted = target.service(app_id, service_id).is_some();
                if let Some(app) = current.apps.get_mut(app_id) {
                    if still_wanted {
                        // Recreate in flight: keep the entry, drop the
                        // runtime fields.
                        if let Some(service) = app.services.get_mut(service_id) {
                            service.container_id = None;
                            service.status = ServiceStatus::Stopped;
                        }
                    } else {
                        app.services.remove(service_id);
                    }
                }
                prune_empty_app(&mut current, app_id);
                Ok(())
            }

            Step::StartContainer { app_id, service_id } => {
                let (service, app_name) = match target
                    .apps
                    .get(app_id)
                    .and_then(|a| a.services.get(service_id).map(|s| (s, a.app_name.clone())))
                {
                    Some(found) => found,
                    None => {
                        return Err(RuntimeError::InvalidConfig(format!(
                            "service {}/{} vanished from target state",
                            app_id, service_id
                        )))
                    }
                };
                let container_id = self
                    .runtime
                    .create_and_start_container(service, &app_name)
                    .await?;
                let mut current = self.current.write().await;
                let app = app_entry(&mut current, app_id, target);
                app.services.insert(
                    service_id.clone(),
                    Service {
                        app_id: app_id.clone(),
                        service_id: service_id.clone(),
                        service_name: service.service_name.clone(),
                        config: service.config.clone(),
                        container_id: Some(container_id),
                        status: ServiceStatus::Running,
                    },
                );
                Ok(())
            }

            Step::RemoveNetwork { app_id, network_name } => {
                let scoped = scoped_network_name(app_id, network_name);
                self.runtime.remove_network(&scoped).await?;
                let mut current = self.current.write().await;
                if let Some(app) = current.apps.get_mut(app_id) {
                    app.networks.retain(|n| n != network_name);
                }
                prune_empty_app(&mut current, app_id);
                Ok(())
            }

            Step::RemoveVolume { app_id, volume_name } => {
                let scoped = scoped_volume_name(app_id, volume_name);
                self.runtime.remove_volume(&scoped, false).await?;
                let mut current = self.current.write().await;
                if let Some(app) = current.apps.get_mut(app_id) {
                    app.volumes.retain(|v| v != volume_name);
                }
                prune_empty_app(&mut current, app_id);
                Ok(())
            }
        }
    }
}

/// Current-side App entry for `app_id`, created from the target's app
/// metadata on first touch.
fn app_entry<'a>(current: &'a mut SimpleState, app_id: &str, target: &SimpleState) -> &'a mut App {
    current.apps.entry(app_id.to_string()).or_insert_with(|| {
        let app_name = target
            .apps
            .get(app_id)
            .map(|a| a.app_name.clone())
            .unwrap_or_else(|| app_id.to_string());
        App::new(app_id, &app_name)
    })
}

/// Drops a current-side App entry once nothing of it is left at the runtime.
fn prune_empty_app(current: &mut SimpleState, app_id: &str) {
    let empty = current
        .apps
        .get(app_id)
        .map(|a| a.services.is_empty() && a.networks.is_empty() && a.volumes.is_empty())
        .unwrap_or(false);
    if empty {
        current.apps.remove(app_id);
    }
}
