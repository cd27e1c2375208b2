use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::executor::{StepExecutor, StepResult};
use crate::health::{HealthCheckExecutor, HealthCheckResult};
use crate::reconciler::{Reconciler, Step};
use crate::retry::{RetryManager, MAX_RETRIES};
use crate::runtime::ContainerRuntime;
use crate::state::{ServiceStatus, SimpleState};
use crate::store::StateStore;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Seconds between convergence passes of the daemon loop.
    pub poll_interval_secs: u64,
    /// Grace period handed to the runtime when stopping a container.
    pub stop_timeout_secs: u32,
    /// Per-probe health check timeout.
    pub health_check_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stop_timeout_secs: 10,
            health_check_timeout_ms: 1000,
        }
    }
}

/// Per-service convergence verdict exposed to callers: converged, still
/// working on it (possibly backing off), or given up until the target
/// changes.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ConvergenceStatus {
    Converged,
    Pending {
        #[serde(skip_serializing_if = "Option::is_none")]
        next_retry_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    ExceededRetries {
        last_error: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceReport {
    pub app_id: String,
    pub service_id: String,
    pub service_name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub convergence: ConvergenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthCheckResult>,
}

/// Owns one device's convergence machinery: the Reconciler for planning,
/// the StepExecutor for driving the runtime, the RetryManager for backoff
/// and the HealthCheckExecutor for post-start probes. At most one pass is
/// in flight at a time; SetTarget during a pass only marks it pending.
pub struct Supervisor {
    config: SupervisorConfig,
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Reconciler,
    executor: StepExecutor,
    retry: RetryManager,
    health: HealthCheckExecutor,
    health_results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
    pass_running: AtomicBool,
    is_running: Mutex<bool>,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn StateStore>,
        config: SupervisorConfig,
    ) -> Self {
        let retry = RetryManager::new();
        let reconciler = Reconciler::new(store);
        let executor = StepExecutor::new(
            Arc::clone(&runtime),
            retry.clone(),
            reconciler.current_handle(),
            config.stop_timeout_secs,
        );
        let health = HealthCheckExecutor::new(Arc::clone(&runtime));
        Self {
            config,
            runtime,
            reconciler,
            executor,
            retry,
            health,
            health_results: Arc::new(RwLock::new(HashMap::new())),
            pass_running: AtomicBool::new(false),
            is_running: Mutex::new(false),
        }
    }

    /// Accepts a new target state. Always cheap: validates, persists and
    /// marks a pass pending; never waits for a running pass.
    pub async fn set_target(&self, state: SimpleState) -> Result<()> {
        self.reconciler.set_target(state).await
    }

    pub async fn get_current(&self) -> SimpleState {
        self.reconciler.get_current().await
    }

    pub async fn get_target(&self) -> SimpleState {
        self.reconciler.get_target().await
    }

    /// Restores persisted target state and rebuilds current state from
    /// runtime truth. Called once before the daemon loop.
    pub async fn resync(&self) -> Result<()> {
        self.reconciler.load_target().await?;
        self.reconciler
            .sync_current_from_runtime(self.runtime.as_ref())
            .await
    }

    /// Runs a single convergence pass: plan, execute, persist, probe. If a
    /// pass is already in flight the call only marks the target pending.
    /// Returns the per-step results of the pass.
    pub async fn converge_once(&self) -> Result<Vec<StepResult>> {
        if self
            .pass_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("pass already in flight, leaving target pending");
            self.reconciler.mark_pending();
            return Ok(Vec::new());
        }

        let outcome = self.run_pass().await;
        self.pass_running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_pass(&self) -> Result<Vec<StepResult>> {
        self.reconciler.clear_pending();

        let target = self.reconciler.get_target().await;
        let steps = self.reconciler.plan().await;
        if steps.is_empty() {
            debug!("state converged, nothing to do");
            return Ok(Vec::new());
        }

        let pass_id = uuid::Uuid::new_v4();
        info!(%pass_id, steps = steps.len(), "starting convergence pass");
        let results = self.executor.execute(steps, &target).await;
        self.reconciler.save_current().await?;

        // Anything not executed this pass (backoff, failure) keeps the
        // target pending so the loop comes back to it.
        if results.iter().any(|r| !r.executed()) {
            self.reconciler.mark_pending();
        }

        self.spawn_health_checks(&results, &target).await;
        Ok(results)
    }

    /// Fires post-start health probes for services a pass just started.
    /// Fire-and-forget: a failing probe is recorded and reported upstream,
    /// never fed back into reconciliation.
    async fn spawn_health_checks(&self, results: &[StepResult], target: &SimpleState) {
        let current = self.reconciler.get_current().await;
        for result in results {
            if !result.executed() {
                continue;
            }
            let (app_id, service_id) = match &result.step {
                Step::StartContainer { app_id, service_id } => (app_id, service_id),
                _ => continue,
            };
            let check = match target
                .service(app_id, service_id)
                .and_then(|s| s.config.health_check.clone())
            {
                Some(check) => check,
                None => continue,
            };
            let container_id = match current
                .service(app_id, service_id)
                .and_then(|s| s.container_id.clone())
            {
                Some(id) => id,
                None => continue,
            };

            let key = format!("{}:{}", app_id, service_id);
            let health = self.health.clone();
            let health_results = Arc::clone(&self.health_results);
            let timeout = self.config.health_check_timeout_ms;
            tokio::spawn(async move {
                let result = health.execute(&container_id, &check, Some(timeout)).await;
                if !result.success {
                    warn!(service = %key, message = %result.message, "health check failed");
                }
                health_results.write().await.insert(key, result);
            });
        }
    }

    /// One report per target service, distinguishing converged, pending /
    /// backing off and exceeded-retries.
    pub async fn service_report(&self) -> Vec<ServiceReport> {
        let target = self.reconciler.get_target().await;
        let current = self.reconciler.get_current().await;
        let health_results = self.health_results.read().await;

        let mut reports = Vec::new();
        for app in target.apps.values() {
            for service in app.services.values() {
                let key = format!("{}:{}", service.app_id, service.service_id);
                let current_service = current.service(&service.app_id, &service.service_id);

                let convergence = match self.retry.get(&key).await {
                    Some(state) if state.count >= MAX_RETRIES => ConvergenceStatus::ExceededRetries {
                        last_error: state.last_error,
                    },
                    Some(state) => ConvergenceStatus::Pending {
                        next_retry_at: Some(state.next_retry_at),
                        last_error: Some(state.last_error),
                    },
                    None => {
                        let converged = current_service
                            .map(|cs| {
                                cs.container_id.is_some()
                                    && cs.config.diff_against(&service.config).is_none()
                            })
                            .unwrap_or(false);
                        if converged {
                            ConvergenceStatus::Converged
                        } else {
                            ConvergenceStatus::Pending {
                                next_retry_at: None,
                                last_error: None,
                            }
                        }
                    }
                };

                reports.push(ServiceReport {
                    app_id: service.app_id.clone(),
                    service_id: service.service_id.clone(),
                    service_name: service.service_name.clone(),
                    status: current_service
                        .map(|s| s.status.clone())
                        .unwrap_or(ServiceStatus::Stopped),
                    container_id: current_service.and_then(|s| s.container_id.clone()),
                    convergence,
                    last_health: health_results.get(&key).cloned(),
                });
            }
        }
        reports
    }

    /// Daemon loop: resync from runtime truth, then converge whenever the
    /// target is pending or drift is detected, until `stop` is called.
    pub async fn start(&self) -> Result<()> {
        {
            let mut is_running = self.is_running.lock().await;
            if *is_running {
                return Ok(());
            }
            *is_running = true;
        }

        self.resync().await?;
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "supervisor loop started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        loop {
            {
                let is_running = self.is_running.lock().await;
                if !*is_running {
                    break;
                }
            }

            ticker.tick().await;

            // Re-read runtime truth so drift (a crashed container, a
            // manually removed network) is seen even without a new target.
            if let Err(e) = self
                .reconciler
                .sync_current_from_runtime(self.runtime.as_ref())
                .await
            {
                error!("failed to sync current state from runtime: {:#}", e);
                continue;
            }

            let pending = self.reconciler.is_pending();
            let steps = self.reconciler.plan().await;
            if !pending && steps.is_empty() {
                continue;
            }

            if let Err(e) = self.converge_once().await {
                error!("convergence pass failed: {:#}", e);
            }
        }

        info!("supervisor loop stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut is_running = self.is_running.lock().await;
        *is_running = false;
    }
}
