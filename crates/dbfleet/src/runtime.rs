//! External container runtime interface.
//!
//! The fleet never creates or destroys database processes itself; it
//! shells out to docker-compose through [`ComposeRuntime`]. The trait is
//! the seam tests mock out.

use async_trait::async_trait;
use tokio::process::Command;

use crate::instance::ComposeHandle;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// The container orchestrator the fleet delegates to. Both operations are
/// synchronous, blocking and possibly slow from the collaborator's point
/// of view; callers must keep them off the admission path.
#[async_trait]
pub trait ComposeRuntime: Send + Sync + 'static {
    /// Bring the instance's runtime unit up (`docker-compose up -d`).
    async fn bring_up(&self, handle: &ComposeHandle) -> Result<(), RuntimeError>;

    /// Tear the instance's runtime unit down (`docker-compose down -v`).
    async fn tear_down(&self, handle: &ComposeHandle) -> Result<(), RuntimeError>;
}

/// Production runtime: the `docker-compose` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCompose;

impl DockerCompose {
    pub fn new() -> Self {
        DockerCompose
    }

    async fn run(&self, args: &[&str]) -> Result<(), RuntimeError> {
        let command = format!("docker-compose {}", args.join(" "));
        tracing::debug!(%command, "invoking compose runtime");

        let output = Command::new("docker-compose")
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[async_trait]
impl ComposeRuntime for DockerCompose {
    async fn bring_up(&self, handle: &ComposeHandle) -> Result<(), RuntimeError> {
        let file = handle.compose_file.to_string_lossy();
        self.run(&["-f", &file, "-p", &handle.project_name, "up", "-d"])
            .await
    }

    async fn tear_down(&self, handle: &ComposeHandle) -> Result<(), RuntimeError> {
        let file = handle.compose_file.to_string_lossy();
        self.run(&["-f", &file, "-p", &handle.project_name, "down", "-v"])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn failed_error_carries_diagnostic() {
        use std::os::unix::process::ExitStatusExt;

        let err = RuntimeError::Failed {
            command: "docker-compose up -d".to_string(),
            status: std::process::ExitStatus::from_raw(256),
            stderr: "no such image".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docker-compose up -d"));
        assert!(msg.contains("no such image"));
    }

    #[test]
    fn spawn_error_names_the_command() {
        let err = RuntimeError::Spawn {
            command: "docker-compose down -v".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
        };
        assert!(err.to_string().contains("docker-compose down -v"));
    }
}
