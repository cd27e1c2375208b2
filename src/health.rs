use chrono::{DateTime, Utc};
use hyper::{Body, Client, Request};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

use crate::runtime::ContainerRuntime;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// A health probe declared on a service. The variant is selected by the
/// `type` field of the service config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    Http {
        port: u16,
        #[serde(default = "default_path")]
        path: String,
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Accepted response codes. When absent, every code in 200..=399
        /// counts as healthy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_status: Option<Vec<u16>>,
    },
    Tcp {
        port: u16,
    },
    Exec {
        command: Vec<String>,
    },
}

fn default_path() -> String {
    "/".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs HTTP/TCP/exec probes against a running container. Probe failures are
/// results, not errors: the executor never propagates a failure to its
/// caller, it reports `success: false` with timing information instead.
#[derive(Clone)]
pub struct HealthCheckExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl HealthCheckExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn execute(
        &self,
        container_id: &str,
        check: &HealthCheck,
        timeout_ms: Option<u64>,
    ) -> HealthCheckResult {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let started = Instant::now();
        let outcome = self.run_check(container_id, check, timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, message) = match outcome {
            Ok((success, message)) => (success, message),
            Err(e) => (false, format!("health check error: {:#}", e)),
        };
        debug!(container_id, success, %message, duration_ms, "health check finished");

        HealthCheckResult {
            success,
            message,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    async fn run_check(
        &self,
        container_id: &str,
        check: &HealthCheck,
        timeout: Duration,
    ) -> anyhow::Result<(bool, String)> {
        match check {
            HealthCheck::Http {
                port,
                path,
                scheme,
                headers,
                expected_status,
            } => {
                let ip = self.container_ip(container_id).await?;
                self.http_check(&ip, *port, path, scheme, headers, expected_status, timeout)
                    .await
            }
            HealthCheck::Tcp { port } => {
                let ip = self.container_ip(container_id).await?;
                Ok(tcp_check(&ip, *port, timeout).await)
            }
            HealthCheck::Exec { command } => self.exec_check(container_id, command, timeout).await,
        }
    }

    async fn container_ip(&self, container_id: &str) -> anyhow::Result<String> {
        let details = self.runtime.inspect_container(container_id).await?;
        details
            .first_ip()
            .map(|ip| ip.to_string())
            .ok_or_else(|| anyhow::anyhow!("container {} has no network address", container_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn http_check(
        &self,
        ip: &str,
        port: u16,
        path: &str,
        scheme: &str,
        headers: &HashMap<String, String>,
        expected_status: &Option<Vec<u16>>,
        timeout: Duration,
    ) -> anyhow::Result<(bool, String)> {
        let uri = format!("{}://{}:{}{}", scheme, ip, port, path);

        let mut builder = Request::get(uri.as_str());
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(Body::empty())?;

        let client = Client::new();
        let response = match tokio::time::timeout(timeout, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Ok((false, format!("GET {} failed: {}", uri, e))),
            Err(_) => {
                return Ok((
                    false,
                    format!("GET {} timed out after {}ms", uri, timeout.as_millis()),
                ))
            }
        };

        let status = response.status().as_u16();
        // Always consume the body so the connection can be reused.
        let _ = hyper::body::to_bytes(response.into_body()).await;

        let healthy = match expected_status {
            Some(accepted) => accepted.contains(&status),
            None => (200..=399).contains(&status),
        };
        if healthy {
            Ok((true, format!("GET {} returned {}", uri, status)))
        } else {
            Ok((false, format!("GET {} returned unexpected status {}", uri, status)))
        }
    }

    async fn exec_check(
        &self,
        container_id: &str,
        command: &[String],
        timeout: Duration,
    ) -> anyhow::Result<(bool, String)> {
        let exec = self.runtime.exec_in_container(container_id, command);
        match tokio::time::timeout(timeout, exec).await {
            Ok(Ok(outcome)) if outcome.exit_code == 0 => {
                Ok((true, format!("'{}' exited 0", command.join(" "))))
            }
            Ok(Ok(outcome)) => Ok((
                false,
                format!(
                    "'{}' failed with exit code {}: {}",
                    command.join(" "),
                    outcome.exit_code,
                    outcome.output.trim()
                ),
            )),
            Ok(Err(e)) => Ok((false, format!("exec failed: {}", e))),
            Err(_) => Ok((
                false,
                format!(
                    "'{}' timed out after {}ms",
                    command.join(" "),
                    timeout.as_millis()
                ),
            )),
        }
    }
}

async fn tcp_check(ip: &str, port: u16, timeout: Duration) -> (bool, String) {
    let address = format!("{}:{}", ip, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => (true, format!("tcp connect to {} succeeded", address)),
        Ok(Err(e)) => (false, format!("tcp connect to {} failed: {}", address, e)),
        Err(_) => (
            false,
            format!(
                "tcp connect to {} timed out after {}ms",
                address,
                timeout.as_millis()
            ),
        ),
    }
}
