//! Bounded admission controller for disposable MySQL instances running
//! on docker-compose.

pub mod compose;
pub mod config;
pub mod instance;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod transport;

pub use config::FleetConfig;
pub use instance::{InstanceRecord, InstanceStatus};
pub use registry::RegistryError;
pub use runtime::{ComposeRuntime, DockerCompose};
pub use service::{Admission, FleetService};
