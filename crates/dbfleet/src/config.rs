//! Fleet configuration.

use std::path::PathBuf;

/// Tunables for the admission controller and worker pool. Defaults match
/// the conventional MySQL port layout; everything can be overridden
/// through `DBFLEET_*` environment variables.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Hard cap on concurrently registered instances.
    pub max_instances: usize,
    /// First port the allocator tries.
    pub base_port: u16,
    /// Last port the allocator tries before reporting exhaustion.
    pub max_port: u16,
    /// Directory holding the generated compose artifacts.
    pub compose_dir: PathBuf,
    /// Number of concurrent provisioning workers.
    pub provision_workers: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            base_port: 3306,
            max_port: 3406,
            compose_dir: PathBuf::from("docker_compose_files"),
            provision_workers: 3,
        }
    }
}

impl FleetConfig {
    /// Defaults overridden by `DBFLEET_MAX_INSTANCES`, `DBFLEET_BASE_PORT`,
    /// `DBFLEET_MAX_PORT`, `DBFLEET_COMPOSE_DIR` and `DBFLEET_WORKERS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("DBFLEET_MAX_INSTANCES") {
            config.max_instances = v;
        }
        if let Some(v) = env_parse("DBFLEET_BASE_PORT") {
            config.base_port = v;
        }
        if let Some(v) = env_parse("DBFLEET_MAX_PORT") {
            config.max_port = v;
        }
        if let Ok(v) = std::env::var("DBFLEET_COMPOSE_DIR") {
            config.compose_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("DBFLEET_WORKERS") {
            config.provision_workers = v;
        }
        config
    }

    /// Reject configurations the allocator cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_instances > 0, "max_instances must be at least 1");
        anyhow::ensure!(self.provision_workers > 0, "provision_workers must be at least 1");
        anyhow::ensure!(
            self.base_port <= self.max_port,
            "base_port {} exceeds max_port {}",
            self.base_port,
            self.max_port
        );
        let range = (self.max_port - self.base_port) as usize + 1;
        anyhow::ensure!(
            range >= self.max_instances,
            "port range holds {} ports but max_instances is {}",
            range,
            self.max_instances
        );
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
