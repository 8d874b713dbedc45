//! Provisioning worker pool.
//!
//! The slow docker-compose calls run here, off the admission path. Each
//! worker owns its own bounded channel and jobs are keyed to a worker by
//! port, so jobs for one port execute in dispatch order and a port never
//! has two in-flight jobs (a teardown followed by a re-admission of the
//! freed port must not race). Jobs for different ports run concurrently
//! across workers.
//!
//! Outcomes are written back through the same fleet-state mutex the
//! admission path uses, so status/list readers never observe a torn record.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::compose;
use crate::instance::ComposeHandle;
use crate::registry::{lock_state, FleetState};
use crate::runtime::ComposeRuntime;

/// One unit of provisioning work.
#[derive(Debug)]
pub(crate) enum ProvisionJob {
    /// Write the compose artifact and bring the instance up.
    Start {
        port: u16,
        handle: ComposeHandle,
        compose_yaml: String,
    },
    /// Tear the instance down and remove its artifact. Best-effort; the
    /// record is already gone from the registry. `done` is signalled once
    /// the teardown has run, for callers that need to wait on it.
    Stop {
        port: u16,
        handle: ComposeHandle,
        done: Option<oneshot::Sender<()>>,
    },
}

impl ProvisionJob {
    fn port(&self) -> u16 {
        match self {
            Self::Start { port, .. } | Self::Stop { port, .. } => *port,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The target worker's queue is at capacity.
    #[error("provisioning queue is full")]
    QueueFull,

    /// Every worker channel has closed.
    #[error("provisioning workers are shut down")]
    Closed,
}

/// Routes jobs to workers, keyed by port.
#[derive(Clone)]
pub(crate) struct JobDispatcher {
    senders: Vec<mpsc::Sender<ProvisionJob>>,
}

impl JobDispatcher {
    pub fn dispatch(&self, job: ProvisionJob) -> Result<(), DispatchError> {
        let index = job.port() as usize % self.senders.len();
        match self.senders[index].try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                tracing::error!(port = job.port(), "provisioning queue full, job dropped");
                Err(DispatchError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

/// Fixed pool of provisioning workers.
pub(crate) struct Provisioner {
    senders: Vec<mpsc::Sender<ProvisionJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl Provisioner {
    /// Spawn `worker_count` workers, each consuming its own channel of at
    /// most `queue_depth` pending jobs.
    pub fn spawn(
        worker_count: usize,
        queue_depth: usize,
        runtime: Arc<dyn ComposeRuntime>,
        state: Arc<Mutex<FleetState>>,
    ) -> Self {
        let mut senders = Vec::new();
        let mut workers = Vec::new();

        for worker_id in 0..worker_count.max(1) {
            let (tx, mut rx) = mpsc::channel::<ProvisionJob>(queue_depth.max(1));
            let runtime = Arc::clone(&runtime);
            let state = Arc::clone(&state);
            senders.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    run_job(job, runtime.as_ref(), &state).await;
                }
                tracing::debug!(worker_id, "job channel closed, worker exiting");
            }));
        }

        Self { senders, workers }
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher {
            senders: self.senders.clone(),
        }
    }

    /// Close the channels and wait for in-flight jobs to finish.
    ///
    /// Any [`JobDispatcher`] still alive keeps its channels open; workers
    /// exit once the last sender drops.
    pub async fn join(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "provisioning worker panicked");
            }
        }
    }
}

async fn run_job(job: ProvisionJob, runtime: &dyn ComposeRuntime, state: &Mutex<FleetState>) {
    match job {
        ProvisionJob::Start {
            port,
            handle,
            compose_yaml,
        } => {
            if let Err(e) = compose::write_artifact(&handle, &compose_yaml).await {
                tracing::error!(port, error = %e, "failed to write compose artifact");
                lock_state(state).mark_failed(port, format!("failed to write compose file: {e}"));
                return;
            }

            match runtime.bring_up(&handle).await {
                Ok(()) => {
                    tracing::info!(port, project = %handle.project_name, "instance running");
                    lock_state(state).mark_running(port);
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "provisioning failed");
                    lock_state(state).mark_failed(port, e.to_string());
                }
            }
        }
        ProvisionJob::Stop { port, handle, done } => {
            if let Err(e) = runtime.tear_down(&handle).await {
                // Accepted tradeoff: bookkeeping is already reclaimed, the
                // runtime unit may linger until an operator reaps it.
                tracing::warn!(
                    port,
                    project = %handle.project_name,
                    error = %e,
                    "teardown failed, compose project may be leaked"
                );
            } else {
                tracing::info!(port, project = %handle.project_name, "instance torn down");
            }
            compose::remove_artifact(&handle).await;
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceRecord, InstanceStatus};
    use crate::runtime::RuntimeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockRuntime {
        fail_up: bool,
        fail_down: bool,
        up_delay: Option<Duration>,
        up_calls: AtomicUsize,
        down_calls: AtomicUsize,
        events: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self::unwrapped())
        }

        fn failing_up() -> Arc<Self> {
            Arc::new(Self {
                fail_up: true,
                ..Self::unwrapped()
            })
        }

        fn failing_down() -> Arc<Self> {
            Arc::new(Self {
                fail_down: true,
                ..Self::unwrapped()
            })
        }

        fn slow_up(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                up_delay: Some(delay),
                ..Self::unwrapped()
            })
        }

        fn unwrapped() -> Self {
            Self {
                fail_up: false,
                fail_down: false,
                up_delay: None,
                up_calls: AtomicUsize::new(0),
                down_calls: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn error() -> RuntimeError {
            RuntimeError::Spawn {
                command: "docker-compose".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock failure"),
            }
        }
    }

    #[async_trait::async_trait]
    impl ComposeRuntime for MockRuntime {
        async fn bring_up(&self, handle: &ComposeHandle) -> Result<(), RuntimeError> {
            if let Some(delay) = self.up_delay {
                tokio::time::sleep(delay).await;
            }
            self.up_calls.fetch_add(1, Ordering::SeqCst);
            self.record(format!("up {}", handle.project_name));
            if self.fail_up {
                Err(Self::error())
            } else {
                Ok(())
            }
        }

        async fn tear_down(&self, handle: &ComposeHandle) -> Result<(), RuntimeError> {
            self.down_calls.fetch_add(1, Ordering::SeqCst);
            self.record(format!("down {}", handle.project_name));
            if self.fail_down {
                Err(Self::error())
            } else {
                Ok(())
            }
        }
    }

    fn inserted_state(
        dir: &std::path::Path,
        port: u16,
    ) -> (Arc<Mutex<FleetState>>, ComposeHandle) {
        let handle = compose::handle_for(dir, port);
        let mut state = FleetState::new();
        state
            .insert(InstanceRecord::new(port, "pw".to_string(), handle.clone()))
            .unwrap();
        (Arc::new(Mutex::new(state)), handle)
    }

    async fn wait_for_status(state: &Arc<Mutex<FleetState>>, port: u16, expected: InstanceStatus) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if lock_state(state).get(port).map(|r| r.status) == Some(expected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("record never reached expected status");
    }

    #[tokio::test]
    async fn start_job_marks_record_running() {
        let dir = tempfile::tempdir().unwrap();
        let (state, handle) = inserted_state(dir.path(), 3306);
        let runtime = MockRuntime::new();

        let pool = Provisioner::spawn(
            2,
            8,
            Arc::clone(&runtime) as Arc<dyn ComposeRuntime>,
            Arc::clone(&state),
        );
        pool.dispatcher()
            .dispatch(ProvisionJob::Start {
                port: 3306,
                handle: handle.clone(),
                compose_yaml: compose::render(3306, "pw").unwrap(),
            })
            .unwrap();

        wait_for_status(&state, 3306, InstanceStatus::Running).await;
        assert_eq!(runtime.up_calls.load(Ordering::SeqCst), 1);
        assert!(handle.compose_file.exists());
    }

    #[tokio::test]
    async fn start_job_failure_marks_record_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (state, handle) = inserted_state(dir.path(), 3306);
        let runtime = MockRuntime::failing_up();

        let pool = Provisioner::spawn(1, 8, runtime, Arc::clone(&state));
        pool.dispatcher()
            .dispatch(ProvisionJob::Start {
                port: 3306,
                handle,
                compose_yaml: compose::render(3306, "pw").unwrap(),
            })
            .unwrap();

        wait_for_status(&state, 3306, InstanceStatus::Failed).await;
        let err = lock_state(&state).get(3306).unwrap().error.clone();
        assert!(err.unwrap().contains("mock failure"));
    }

    #[tokio::test]
    async fn stop_job_removes_artifact_even_when_teardown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let handle = compose::handle_for(dir.path(), 3306);
        compose::write_artifact(&handle, "services: {}\n").await.unwrap();
        let state = Arc::new(Mutex::new(FleetState::new()));
        let runtime = MockRuntime::failing_down();

        let pool = Provisioner::spawn(1, 8, Arc::clone(&runtime) as Arc<dyn ComposeRuntime>, state);
        pool.dispatcher()
            .dispatch(ProvisionJob::Stop {
                port: 3306,
                handle: handle.clone(),
                done: None,
            })
            .unwrap();
        pool.join().await;

        assert_eq!(runtime.down_calls.load(Ordering::SeqCst), 1);
        assert!(!handle.compose_file.exists());
    }

    #[tokio::test]
    async fn stop_job_signals_done_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let handle = compose::handle_for(dir.path(), 3306);
        let state = Arc::new(Mutex::new(FleetState::new()));
        let runtime = MockRuntime::new();

        let pool = Provisioner::spawn(1, 8, Arc::clone(&runtime) as Arc<dyn ComposeRuntime>, state);
        let (tx, rx) = oneshot::channel();
        pool.dispatcher()
            .dispatch(ProvisionJob::Stop {
                port: 3306,
                handle,
                done: Some(tx),
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("teardown never acknowledged")
            .unwrap();
        assert_eq!(runtime.down_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_port_jobs_run_in_dispatch_order() {
        // A teardown for a freed port followed by a re-admission on the
        // same port must not interleave.
        let dir = tempfile::tempdir().unwrap();
        let (state, handle) = inserted_state(dir.path(), 3306);
        let runtime = MockRuntime::new();

        let pool = Provisioner::spawn(
            4,
            8,
            Arc::clone(&runtime) as Arc<dyn ComposeRuntime>,
            Arc::clone(&state),
        );
        let dispatcher = pool.dispatcher();
        dispatcher
            .dispatch(ProvisionJob::Stop {
                port: 3306,
                handle: handle.clone(),
                done: None,
            })
            .unwrap();
        dispatcher
            .dispatch(ProvisionJob::Start {
                port: 3306,
                handle,
                compose_yaml: compose::render(3306, "pw").unwrap(),
            })
            .unwrap();
        drop(dispatcher);
        pool.join().await;

        let events = runtime.events.lock().unwrap().clone();
        assert_eq!(events, vec!["down mysql_3306", "up mysql_3306"]);
    }

    #[tokio::test]
    async fn dispatch_fails_when_queue_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let (state, handle) = inserted_state(dir.path(), 3306);
        let runtime = MockRuntime::slow_up(Duration::from_millis(100));

        let pool = Provisioner::spawn(
            1,
            1,
            Arc::clone(&runtime) as Arc<dyn ComposeRuntime>,
            Arc::clone(&state),
        );
        let dispatcher = pool.dispatcher();
        let start_job = || ProvisionJob::Start {
            port: 3306,
            handle: handle.clone(),
            compose_yaml: compose::render(3306, "pw").unwrap(),
        };

        dispatcher.dispatch(start_job()).unwrap();
        // The worker holds at most one job plus the one-slot buffer.
        let _ = dispatcher.dispatch(start_job());
        let err = dispatcher.dispatch(start_job()).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull));

        drop(dispatcher);
        pool.join().await;
    }

    #[tokio::test]
    async fn join_waits_for_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (state, handle) = inserted_state(dir.path(), 3306);
        let runtime = MockRuntime::new();

        let pool = Provisioner::spawn(1, 8, runtime, Arc::clone(&state));
        pool.dispatcher()
            .dispatch(ProvisionJob::Start {
                port: 3306,
                handle,
                compose_yaml: compose::render(3306, "pw").unwrap(),
            })
            .unwrap();
        pool.join().await;

        assert_eq!(
            lock_state(&state).get(3306).unwrap().status,
            InstanceStatus::Running
        );
    }
}
