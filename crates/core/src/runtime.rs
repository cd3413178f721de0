//! Container runtime abstraction for Docker/Podman
//!
//! The harness talks to containers only through the [`ContainerRuntime`] and
//! [`ImageBuilder`] traits: start, exec, copy, stop, and derive-an-image.
//! [`crate::docker::CliRuntime`] implements both over the `docker`/`podman`
//! CLI; [`crate::docker::mock::MockRuntime`] implements them in memory.

use crate::docker::CliRuntime;
use crate::errors::{HarnessError, Result};
use crate::image::{ImageRef, Overlay};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Label put on every container started by the harness
pub const MANAGED_LABEL: &str = "bcicheck.managed";

/// Configuration for executing commands in containers
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// User to run command as
    pub user: Option<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Upper bound on the command's run time
    pub timeout: Option<Duration>,
}

impl ExecConfig {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Result of executing a command in a container
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code of the command (-1 when it was cut off)
    pub exit_code: i32,
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// The command exceeded `ExecConfig::timeout` and was killed
    pub timed_out: bool,
}

/// Options used when starting a container
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Container name
    pub name: Option<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Extra labels; [`MANAGED_LABEL`] is always added
    pub labels: HashMap<String, String>,
    /// Entrypoint and arguments that keep the container alive for exec
    pub keep_alive: Vec<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            name: None,
            env: HashMap::new(),
            labels: HashMap::new(),
            keep_alive: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }
}

/// Container runtime collaborator
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime: Send + Sync {
    /// Name of this runtime (e.g., "docker", "podman")
    fn runtime_name(&self) -> &'static str;

    /// Health check for runtime availability
    async fn ping(&self) -> Result<()>;

    /// Start a detached container from `image` and return its id
    async fn start(&self, image: &ImageRef, options: &StartOptions) -> Result<String>;

    /// Execute a command in a running container, capturing all output
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        config: &ExecConfig,
    ) -> Result<ExecResult>;

    /// Copy a host file or directory into the container
    async fn copy_into(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()>;

    /// Stop and remove a container; processes inside it are terminated
    async fn stop(&self, container_id: &str, grace_secs: Option<u32>) -> Result<()>;

    /// Current runtime status (e.g. "running", "exited"), `None` if unknown to the runtime
    async fn inspect_state(&self, container_id: &str) -> Result<Option<String>>;

    /// Synchronous best-effort removal, used when a handle is dropped without teardown
    fn release_blocking(&self, _container_id: &str) {}
}

/// Image-build collaborator
#[allow(async_fn_in_trait)]
pub trait ImageBuilder {
    /// Build (or reuse) the image `base + overlay` and return its reference
    async fn derive(&self, base: &ImageRef, overlay: &Overlay) -> Result<ImageRef>;

    /// Remove a derived image
    async fn remove_image(&self, image: &ImageRef) -> Result<()>;
}

/// Runtime selection options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(HarnessError::InvalidArgument {
                message: format!(
                    "Unknown runtime: {}. Supported runtimes: docker, podman",
                    s
                ),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime factory for creating container runtime instances
pub struct RuntimeFactory;

impl RuntimeFactory {
    /// Detect runtime from an explicit choice, environment variable, or default
    ///
    /// Precedence: explicit > BCICHECK_RUNTIME env var > default (docker)
    pub fn detect_runtime(explicit: Option<RuntimeKind>) -> RuntimeKind {
        if let Some(runtime) = explicit {
            return runtime;
        }

        if let Ok(env_runtime) = std::env::var("BCICHECK_RUNTIME") {
            if let Ok(runtime) = env_runtime.parse() {
                return runtime;
            }
        }

        RuntimeKind::Docker
    }

    /// Create a CLI runtime for `kind`, optionally with a custom binary path
    pub fn create_runtime(kind: RuntimeKind, runtime_path: Option<&str>) -> CliRuntime {
        match runtime_path {
            Some(path) => CliRuntime::with_runtime_path(kind, path.to_string()),
            None => CliRuntime::new(kind),
        }
    }
}
