//! docker-compose artifact generation.
//!
//! One artifact per live instance, named deterministically from the port
//! so a handle can always be rebuilt from bookkeeping. The artifact is the
//! only state persisted beyond the in-memory registry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::instance::ComposeHandle;

const MYSQL_IMAGE: &str = "mysql:5.7";
const MYSQL_CONTAINER_PORT: u16 = 3306;

#[derive(Debug, Serialize)]
struct ComposeFile {
    version: String,
    services: BTreeMap<String, ComposeService>,
    volumes: BTreeMap<String, serde_yaml::Mapping>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    ports: Vec<String>,
    environment: BTreeMap<String, String>,
    volumes: Vec<String>,
}

/// Build the handle for a port: artifact path under `compose_dir` plus
/// the compose project name.
pub fn handle_for(compose_dir: &Path, port: u16) -> ComposeHandle {
    ComposeHandle {
        compose_file: compose_dir.join(format!("docker-compose_{port}.yml")),
        project_name: format!("mysql_{port}"),
    }
}

/// Render the compose YAML for one instance: a single mysql service
/// publishing `port`, with its root password and a named data volume.
pub fn render(port: u16, root_password: &str) -> Result<String, serde_yaml::Error> {
    let service_name = format!("mysql_{port}");
    let volume_name = format!("mysql_data_{port}");

    let service = ComposeService {
        image: MYSQL_IMAGE.to_string(),
        ports: vec![format!("{port}:{MYSQL_CONTAINER_PORT}")],
        environment: BTreeMap::from([(
            "MYSQL_ROOT_PASSWORD".to_string(),
            root_password.to_string(),
        )]),
        volumes: vec![format!("{volume_name}:/var/lib/mysql")],
    };

    let file = ComposeFile {
        version: "3".to_string(),
        services: BTreeMap::from([(service_name, service)]),
        volumes: BTreeMap::from([(volume_name, serde_yaml::Mapping::new())]),
    };

    serde_yaml::to_string(&file)
}

/// Write the artifact, creating the compose directory if needed.
pub async fn write_artifact(handle: &ComposeHandle, content: &str) -> std::io::Result<()> {
    if let Some(dir) = handle.compose_file.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&handle.compose_file, content).await
}

/// Remove the artifact. Best-effort: a missing file is fine, anything
/// else is logged and swallowed.
pub async fn remove_artifact(handle: &ComposeHandle) {
    match tokio::fs::remove_file(&handle.compose_file).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                file = %handle.compose_file.display(),
                error = %e,
                "failed to remove compose artifact"
            );
        }
    }
}
