//! FleetService: transport-agnostic admission control and lifecycle
//! bookkeeping.
//!
//! The service owns the single exclusion domain (registry + allocator +
//! waiting queue) and the provisioning job channel. Admission and stop are
//! pure bookkeeping under one lock hold and never wait on docker-compose;
//! the worker pool reports outcomes back through the same lock.

use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

use crate::compose;
use crate::config::FleetConfig;
use crate::instance::{ComposeHandle, InstanceRecord};
use crate::provisioner::{DispatchError, JobDispatcher, ProvisionJob, Provisioner};
use crate::registry::{lock_state, FleetState, QueuedRequest, RegistryError};
use crate::runtime::ComposeRuntime;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to render compose template: {0}")]
    Template(#[from] serde_yaml::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no instance registered on port {0}")]
pub struct NotFound(pub u16);

/// Outcome of an admission decision.
#[derive(Debug)]
pub enum Admission {
    /// Admitted: port allocated, record registered, provisioning dispatched.
    Started(InstanceRecord),
    /// Over capacity: request appended to the waiting queue.
    Queued { position: usize },
}

/// Snapshot of the whole fleet for list/health queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FleetSnapshot {
    pub instances: Vec<InstanceRecord>,
    pub queue_size: usize,
    pub capacity: usize,
}

pub struct FleetService {
    config: FleetConfig,
    state: Arc<Mutex<FleetState>>,
    jobs: JobDispatcher,
    runtime: Arc<dyn ComposeRuntime>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FleetService {
    /// Create the service and spawn its provisioning workers.
    pub fn new(config: FleetConfig, runtime: Arc<dyn ComposeRuntime>) -> Arc<Self> {
        let state = Arc::new(Mutex::new(FleetState::new()));
        // A freed port can have its teardown and a re-admission queued at
        // once, so two slots per port in the range covers the worst case.
        let queue_depth = 2 * (config.max_port.saturating_sub(config.base_port) as usize + 1);
        let provisioner = Provisioner::spawn(
            config.provision_workers,
            queue_depth,
            Arc::clone(&runtime),
            Arc::clone(&state),
        );
        let jobs = provisioner.dispatcher();
        // Workers outlive the Provisioner handle; the channel closes when
        // the last sender drops.
        tokio::spawn(provisioner.join());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            state,
            jobs,
            runtime,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Admit a start request or queue it.
    ///
    /// Admission happens entirely under the state lock: capacity check,
    /// port allocation, record insertion and job dispatch are observed
    /// atomically by every concurrent caller. Returns immediately; the
    /// provisioning outcome arrives asynchronously via status/list.
    pub fn start(&self, root_password: String) -> Result<Admission, StartError> {
        let mut state = lock_state(&self.state);

        if state.count() >= self.config.max_instances {
            state.push_waiting(QueuedRequest { root_password });
            let position = state.queue_len();
            tracing::info!(position, "at capacity, request queued");
            return Ok(Admission::Queued { position });
        }

        let record = self.admit_locked(&mut state, root_password)?;
        Ok(Admission::Started(record))
    }

    /// Stop an instance: remove its record and dispatch teardown, both
    /// under the same lock hold so the freed port cannot be reallocated
    /// before the record is fully gone. Drains the waiting queue after.
    pub fn stop(&self, port: u16) -> Result<InstanceRecord, NotFound> {
        let mut state = lock_state(&self.state);
        let record = state.remove(port).ok_or(NotFound(port))?;

        if let Err(e) = self.jobs.dispatch(ProvisionJob::Stop {
            port,
            handle: record.handle.clone(),
            done: None,
        }) {
            tracing::warn!(port, error = %e, "dispatch failed, tearing down directly");
            let runtime = Arc::clone(&self.runtime);
            let handle = record.handle.clone();
            tokio::spawn(async move {
                tear_down_direct(runtime.as_ref(), &handle).await;
            });
        }
        tracing::info!(port, "instance removed from registry");

        self.drain_locked(&mut state);
        Ok(record)
    }

    pub fn status(&self, port: u16) -> Option<InstanceRecord> {
        lock_state(&self.state).get(port).cloned()
    }

    pub fn list(&self) -> FleetSnapshot {
        let state = lock_state(&self.state);
        FleetSnapshot {
            instances: state.snapshot(),
            queue_size: state.queue_len(),
            capacity: self.config.max_instances,
        }
    }

    pub fn count(&self) -> usize {
        lock_state(&self.state).count()
    }

    pub fn queue_size(&self) -> usize {
        lock_state(&self.state).queue_len()
    }

    /// Allocate, register and dispatch one request. Caller holds the lock.
    fn admit_locked(
        &self,
        state: &mut FleetState,
        root_password: String,
    ) -> Result<InstanceRecord, StartError> {
        let port = state.allocate_port(self.config.base_port, self.config.max_port)?;
        let handle = compose::handle_for(&self.config.compose_dir, port);

        // Rendered here so template errors surface synchronously; the
        // artifact itself is written by the worker, off the admission path.
        let compose_yaml = compose::render(port, &root_password)?;

        let record = InstanceRecord::new(port, root_password, handle.clone());
        state.insert(record.clone())?;

        if let Err(e) = self.jobs.dispatch(ProvisionJob::Start {
            port,
            handle,
            compose_yaml,
        }) {
            state.remove(port);
            return Err(e.into());
        }

        tracing::info!(port, "instance admitted, provisioning dispatched");
        Ok(record)
    }

    /// Admit queued requests until capacity is reached or the queue is
    /// empty. Runs inside the caller's lock hold, so drains are serialized
    /// and a stop triggers exactly one fill-to-capacity pass.
    fn drain_locked(&self, state: &mut FleetState) {
        while state.queue_len() > 0 && state.count() < self.config.max_instances {
            let Some(request) = state.pop_waiting() else {
                break;
            };
            match self.admit_locked(state, request.root_password) {
                Ok(record) => {
                    tracing::info!(port = record.port, "queued request admitted");
                }
                Err(e) => {
                    // Fatal to that request only; the next stop retries the rest.
                    tracing::error!(error = %e, "dropping queued request");
                }
            }
        }
    }

    /// Tear down every live instance, best-effort, and drop all queued
    /// requests. Teardowns go through the worker pool so they queue behind
    /// any in-flight start for the same port; completion is awaited via
    /// per-job acknowledgements.
    pub async fn shutdown_all(&self) {
        let records = {
            let mut state = lock_state(&self.state);
            while state.pop_waiting().is_some() {}
            state.drain_all()
        };

        tracing::info!(instances = records.len(), "tearing down fleet");
        let mut pending = Vec::new();
        for record in records {
            let (done_tx, done_rx) = oneshot::channel();
            match self.jobs.dispatch(ProvisionJob::Stop {
                port: record.port,
                handle: record.handle.clone(),
                done: Some(done_tx),
            }) {
                Ok(()) => pending.push(done_rx),
                Err(e) => {
                    tracing::warn!(port = record.port, error = %e, "dispatch failed, tearing down directly");
                    tear_down_direct(self.runtime.as_ref(), &record.handle).await;
                }
            }
        }
        for done_rx in pending {
            let _ = done_rx.await;
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// Fallback teardown for when the worker pool is unavailable. Removes the
/// compose artifact regardless of the teardown outcome.
async fn tear_down_direct(runtime: &dyn ComposeRuntime, handle: &ComposeHandle) {
    if let Err(e) = runtime.tear_down(handle).await {
        tracing::warn!(
            project = %handle.project_name,
            error = %e,
            "teardown failed, compose project may be leaked"
        );
    }
    compose::remove_artifact(handle).await;
}
