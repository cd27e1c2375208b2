pub mod docker;
pub mod executor;
pub mod health;
pub mod reconciler;
pub mod resources;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod store;
pub mod supervisor;

pub use reconciler::{plan_steps, Reconciler, Step};
pub use retry::{RetryManager, BACKOFF_TABLE_SECS, MAX_RETRIES};
pub use runtime::ContainerRuntime;
pub use state::{App, Service, ServiceConfig, SimpleState};
pub use supervisor::{Supervisor, SupervisorConfig};
