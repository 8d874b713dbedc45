//! Instance lifecycle state tracking.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one managed MySQL instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Record created, provisioning dispatched but not yet finished.
    Starting,
    /// docker-compose brought the instance up successfully.
    Running,
    /// Provisioning failed; the record stays registered for inspection.
    Failed,
    /// Terminal; records are removed from the registry on stop.
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Collaborator-specific reference needed to tear an instance down:
/// the compose artifact on disk plus the compose project name.
///
/// Both are derived deterministically from the port, so a handle can be
/// rebuilt from bookkeeping alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeHandle {
    pub compose_file: PathBuf,
    pub project_name: String,
}

/// One active or starting instance. The port is the unique key and is
/// immutable for the record's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub port: u16,
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(flatten)]
    pub handle: ComposeHandle,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl InstanceRecord {
    pub fn new(port: u16, password: String, handle: ComposeHandle) -> Self {
        Self {
            port,
            host: "localhost".to_string(),
            username: "root".to_string(),
            password,
            handle,
            status: InstanceStatus::Starting,
            error: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Starting → Running. Clears any stale diagnostic.
    pub fn set_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.error = None;
    }

    /// Starting → Failed with the collaborator's diagnostic output.
    pub fn set_failed(&mut self, error: String) {
        self.status = InstanceStatus::Failed;
        self.error = Some(error);
    }
}
