//! Docker and Podman CLI integration
//!
//! [`CliRuntime`] drives the `docker` or `podman` binary: it starts detached
//! containers, runs commands in them with captured output and optional
//! timeouts, copies files in, builds derived images, and tears containers
//! down. The [`mock`] module provides an in-memory runtime for tests.

use crate::containerfile::ContainerfileGenerator;
use crate::errors::{BuildError, HarnessError, Result, RuntimeError};
use crate::image::{ImageRef, Overlay};
use crate::runtime::{
    ContainerRuntime, ExecConfig, ExecResult, ImageBuilder, RuntimeKind, StartOptions,
    MANAGED_LABEL,
};
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};

/// Generic CLI-based container runtime implementation
///
/// Used for both Docker and Podman since they share a compatible CLI.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    /// Create a runtime using the default binary for `kind`
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            runtime_path: kind.as_str().to_string(),
        }
    }

    /// Create a new CliRuntime for Docker
    pub fn docker() -> Self {
        Self::new(RuntimeKind::Docker)
    }

    /// Create a new CliRuntime for Podman
    pub fn podman() -> Self {
        Self::new(RuntimeKind::Podman)
    }

    /// Create a new CliRuntime with custom runtime binary path
    pub fn with_runtime_path(kind: RuntimeKind, runtime_path: String) -> Self {
        Self { kind, runtime_path }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Run the runtime binary to completion and capture its output
    async fn run_cli(&self, args: &[String]) -> std::result::Result<Output, RuntimeError> {
        debug!("Executing runtime command: {} {}", self.runtime_path, args.join(" "));

        tokio::process::Command::new(&self.runtime_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))
    }

    fn spawn_error(&self, error: std::io::Error) -> RuntimeError {
        if error.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::NotInstalled {
                runtime: self.runtime_path.clone(),
            }
        } else {
            RuntimeError::CLIError(format!("Failed to execute runtime command: {}", error))
        }
    }

    /// Build `run -d ...` arguments
    fn start_args(image: &ImageRef, options: &StartOptions) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            format!("{}=true", MANAGED_LABEL),
        ];

        if let Some(ref name) = options.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        let mut labels: Vec<_> = options.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        let mut env: Vec<_> = options.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        let mut keep_alive = options.keep_alive.iter();
        if let Some(entrypoint) = keep_alive.next() {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(image.to_string());
        args.extend(keep_alive.cloned());
        args
    }

    /// Build `exec ...` arguments
    fn exec_args(container_id: &str, command: &[String], config: &ExecConfig) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if let Some(ref user) = config.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }

        if let Some(ref workdir) = config.working_dir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(container_id.to_string());
        args.extend(command.iter().cloned());
        args
    }

    /// Errors reported by the daemon itself rather than by the exec'd command
    fn is_missing_container_error(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("no such container")
            || lower.contains("is not running")
            || lower.contains("no container with name or id")
    }

    /// Check if container runtime binary is available
    #[instrument(skip(self))]
    pub async fn check_runtime_installed(&self) -> Result<()> {
        let output = self.run_cli(&["--version".to_string()]).await?;
        if output.status.success() {
            debug!("Container runtime binary found and working");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::CLIError(format!("Runtime version check failed: {}", stderr)).into())
        }
    }

    async fn is_container_running(&self, container_id: &str) -> Result<bool> {
        let state = self.inspect_state(container_id).await?;
        Ok(state.as_deref() == Some("running"))
    }

    /// Local image id of `image`, or `None` when it is not present
    async fn image_id(&self, image: &ImageRef) -> Result<Option<String>> {
        let output = self
            .run_cli(&[
                "image".to_string(),
                "inspect".to_string(),
                "--format".to_string(),
                "{{.Id}}".to_string(),
                image.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    /// Image id of the base, pulling it first when it is not present locally
    async fn resolve_base_id(&self, base: &ImageRef) -> Result<String> {
        if let Some(id) = self.image_id(base).await? {
            return Ok(id);
        }

        debug!("Base image {} not present, pulling", base);
        let output = self.run_cli(&["pull".to_string(), base.to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Failed {
                base: base.to_string(),
                message: format!("pull failed: {}", stderr.trim()),
            }
            .into());
        }

        self.image_id(base).await?.ok_or_else(|| {
            BuildError::Failed {
                base: base.to_string(),
                message: "image id unavailable after pull".to_string(),
            }
            .into()
        })
    }

    /// Whether an image with this reference exists locally
    async fn image_exists(&self, image: &ImageRef) -> Result<bool> {
        let output = self
            .run_cli(&["image".to_string(), "inspect".to_string(), image.to_string()])
            .await?;
        Ok(output.status.success())
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

/// Subset of `inspect` state output
#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

/// Parse `inspect --format '{{json .State}}'` output
fn parse_inspect_state(json_output: &str) -> Result<Option<String>> {
    let trimmed = json_output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let state: InspectState = serde_json::from_str(trimmed)
        .map_err(|e| RuntimeError::CLIError(format!("Failed to parse inspect JSON: {}", e)))?;
    Ok(Some(state.status))
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("Stopped reading exec output: {}", e);
        }
    }
    buf
}

impl ContainerRuntime for CliRuntime {
    fn runtime_name(&self) -> &'static str {
        self.kind.as_str()
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        debug!("Pinging container runtime daemon");

        let output = self
            .run_cli(&[
                "version".to_string(),
                "--format".to_string(),
                "json".to_string(),
            ])
            .await?;

        if output.status.success() {
            debug!("Container runtime daemon is available");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::CLIError(format!("Runtime ping failed: {}", stderr.trim())).into())
        }
    }

    #[instrument(skip(self, options))]
    async fn start(&self, image: &ImageRef, options: &StartOptions) -> Result<String> {
        let output = self.run_cli(&Self::start_args(image, options)).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CLIError(format!(
                "Run command failed for {}: {}",
                image,
                stderr.trim()
            ))
            .into());
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(
                RuntimeError::CLIError(format!("Run command for {} printed no id", image)).into(),
            );
        }

        debug!("Started container {} from {}", container_id, image);
        Ok(container_id)
    }

    #[instrument(skip(self, config))]
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        config: &ExecConfig,
    ) -> Result<ExecResult> {
        let args = Self::exec_args(container_id, command, config);
        debug!("Runtime exec args: {:?}", args);

        let mut child = tokio::process::Command::new(&self.runtime_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Read both pipes concurrently so a chatty command cannot fill one and block
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let wait_error =
            |e: std::io::Error| RuntimeError::CLIError(format!("Failed to wait for exec: {}", e));

        let status = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status.map_err(wait_error)?),
                Err(_) => {
                    warn!(
                        "Command {:?} in {} exceeded {:?}, killing exec client",
                        command, container_id, limit
                    );
                    if let Err(e) = child.start_kill() {
                        debug!("Failed to kill exec client: {}", e);
                    }
                    let _ = child.wait().await;
                    None
                }
            },
            None => Some(child.wait().await.map_err(wait_error)?),
        };

        let stdout = stdout_task
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        let Some(status) = status else {
            return Ok(ExecResult {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
            });
        };

        let exit_code = status.code().unwrap_or(-1);
        // The exec'd command may print the same text, so confirm with the daemon
        if exit_code != 0
            && stdout.is_empty()
            && Self::is_missing_container_error(&stderr)
            && !self.is_container_running(container_id).await?
        {
            return Err(RuntimeError::ContainerNotFound {
                id: container_id.to_string(),
            }
            .into());
        }

        debug!("Exec in {} finished with exit code {}", container_id, exit_code);
        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
        })
    }

    #[instrument(skip(self))]
    async fn copy_into(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        if !host_path.exists() {
            return Err(HarnessError::InvalidArgument {
                message: format!("host path {} does not exist", host_path.display()),
            });
        }

        let output = self
            .run_cli(&[
                "cp".to_string(),
                host_path.display().to_string(),
                format!("{}:{}", container_id, container_path),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CLIError(format!(
                "Copy into {} failed: {}",
                container_id,
                stderr.trim()
            ))
            .into());
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, container_id: &str, grace_secs: Option<u32>) -> Result<()> {
        debug!("Stopping container: {}", container_id);

        let mut args = vec!["stop".to_string()];
        if let Some(grace) = grace_secs {
            args.push("-t".to_string());
            args.push(grace.to_string());
        }
        args.push(container_id.to_string());

        let output = self.run_cli(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Stop of {} failed, forcing removal: {}", container_id, stderr.trim());
        }

        let output = self
            .run_cli(&["rm".to_string(), "-f".to_string(), container_id.to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !Self::is_missing_container_error(&stderr) {
                return Err(RuntimeError::CLIError(format!(
                    "Remove command failed: {}",
                    stderr.trim()
                ))
                .into());
            }
        }

        debug!("Container {} stopped and removed", container_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn inspect_state(&self, container_id: &str) -> Result<Option<String>> {
        let output = self
            .run_cli(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{json .State}}".to_string(),
                container_id.to_string(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(
                RuntimeError::CLIError(format!("Inspect command failed: {}", stderr.trim())).into(),
            );
        }

        parse_inspect_state(&String::from_utf8_lossy(&output.stdout))
    }

    fn release_blocking(&self, container_id: &str) {
        match std::process::Command::new(&self.runtime_path)
            .args(["rm", "-f", container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => debug!("Released container {}", container_id),
            Ok(status) => warn!(
                "Release of {} exited with status {}",
                container_id,
                status.code().unwrap_or(-1)
            ),
            Err(e) => warn!("Release of {} failed: {}", container_id, e),
        }
    }
}

impl ImageBuilder for CliRuntime {
    #[instrument(skip(self, overlay))]
    async fn derive(&self, base: &ImageRef, overlay: &Overlay) -> Result<ImageRef> {
        let base_id = self.resolve_base_id(base).await?;
        let generator = ContainerfileGenerator::new(base, overlay).with_base_id(&base_id);
        let containerfile = generator.generate()?;
        let tag = generator.derived_tag()?;

        if self.image_exists(&tag).await? {
            debug!("Reusing derived image {} (base {})", tag, base_id);
            return Ok(tag);
        }

        let context = overlay.context_dir();
        if !context.is_dir() {
            return Err(BuildError::Context {
                path: context.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "overlay context is not a directory",
                ),
            }
            .into());
        }

        let context_error = |e: std::io::Error| BuildError::Context {
            path: context.display().to_string(),
            source: e,
        };
        let mut file = tempfile::Builder::new()
            .prefix("Containerfile.")
            .tempfile()
            .map_err(context_error)?;
        file.write_all(containerfile.as_bytes())
            .map_err(context_error)?;

        debug!("Building {} from:\n{}", tag, containerfile);
        let output = self
            .run_cli(&[
                "build".to_string(),
                "-f".to_string(),
                file.path().display().to_string(),
                "-t".to_string(),
                tag.to_string(),
                context.display().to_string(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Failed {
                base: base.to_string(),
                message: stderr.trim().to_string(),
            }
            .into());
        }

        debug!("Built derived image {}", tag);
        Ok(tag)
    }

    #[instrument(skip(self))]
    async fn remove_image(&self, image: &ImageRef) -> Result<()> {
        let output = self
            .run_cli(&["rmi".to_string(), "-f".to_string(), image.to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CLIError(format!(
                "Image removal failed: {}",
                stderr.trim()
            ))
            .into());
        }
        Ok(())
    }
}

pub mod mock {
    //! Mock runtime for testing harness flows
    //!
    //! Provides an in-memory implementation of [`ContainerRuntime`] and
    //! [`ImageBuilder`] that can be used without a container daemon. Exec
    //! responses are scripted per command: each command keeps a queue of
    //! responses, the last of which repeats once the queue is drained.

    use crate::containerfile::ContainerfileGenerator;
    use crate::errors::{BuildError, HarnessError, Result, RuntimeError};
    use crate::image::{ImageRef, Overlay};
    use crate::runtime::{
        ContainerRuntime, ExecConfig, ExecResult, ImageBuilder, StartOptions,
    };
    use std::collections::{HashMap, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tracing::{debug, instrument};

    /// Configuration for exec command responses
    #[derive(Debug, Clone, Default)]
    pub struct MockExecResponse {
        /// Exit code to return
        pub exit_code: i32,
        /// Optional delay to simulate command execution time
        pub delay: Option<Duration>,
        /// Stdout content
        pub stdout: String,
        /// Stderr content
        pub stderr: String,
    }

    impl MockExecResponse {
        /// Successful response printing `stdout`
        pub fn ok(stdout: impl Into<String>) -> Self {
            Self {
                stdout: stdout.into(),
                ..Default::default()
            }
        }

        /// Response with the given exit code and stderr
        pub fn exit(exit_code: i32, stderr: impl Into<String>) -> Self {
            Self {
                exit_code,
                stderr: stderr.into(),
                ..Default::default()
            }
        }

        /// Add a simulated execution delay
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    /// Mock container state for simulation
    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub id: String,
        pub image: ImageRef,
        pub options: StartOptions,
        pub state: String,
    }

    /// Configuration for the MockRuntime
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntimeConfig {
        /// Simulate the runtime daemon being unavailable
        pub daemon_unavailable: bool,
        /// Make `start` fail
        pub fail_start: bool,
        /// Make `derive` fail with this message
        pub build_failure: Option<String>,
        /// Make `stop` fail
        pub fail_stop: bool,
    }

    /// Record of an exec call for verification in tests
    #[derive(Debug, Clone)]
    pub struct MockExecCall {
        pub container_id: String,
        pub command: Vec<String>,
        pub config: ExecConfig,
        pub timestamp: Instant,
    }

    /// Record of a copy into a container
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockCopyCall {
        pub container_id: String,
        pub host_path: PathBuf,
        pub container_path: String,
    }

    /// Record of a derived image build
    #[derive(Debug, Clone)]
    pub struct MockBuildCall {
        pub base: ImageRef,
        pub containerfile: String,
        pub tag: ImageRef,
    }

    #[derive(Debug, Default)]
    struct Scripts {
        exact: HashMap<String, VecDeque<MockExecResponse>>,
        contains: Vec<(String, VecDeque<MockExecResponse>)>,
        default: MockExecResponse,
    }

    impl Scripts {
        fn next(queue: &mut VecDeque<MockExecResponse>) -> Option<MockExecResponse> {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }

        fn respond(&mut self, command: &str) -> MockExecResponse {
            if let Some(response) = self.exact.get_mut(command).and_then(Self::next) {
                return response;
            }
            for (needle, queue) in self.contains.iter_mut() {
                if command.contains(needle.as_str()) {
                    if let Some(response) = Self::next(queue) {
                        return response;
                    }
                }
            }
            self.default.clone()
        }
    }

    /// Mock runtime implementation
    #[derive(Debug, Default)]
    pub struct MockRuntime {
        config: Arc<Mutex<MockRuntimeConfig>>,
        scripts: Arc<Mutex<Scripts>>,
        containers: Arc<Mutex<Vec<MockContainer>>>,
        exec_history: Arc<Mutex<Vec<MockExecCall>>>,
        copy_history: Arc<Mutex<Vec<MockCopyCall>>>,
        build_history: Arc<Mutex<Vec<MockBuildCall>>>,
        removed_images: Arc<Mutex<Vec<ImageRef>>>,
        released: Arc<Mutex<Vec<String>>>,
        next_id: Arc<Mutex<u64>>,
    }

    impl MockRuntime {
        /// Create a new MockRuntime with default configuration
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a new MockRuntime with custom configuration
        pub fn with_config(config: MockRuntimeConfig) -> Self {
            Self {
                config: Arc::new(Mutex::new(config)),
                ..Default::default()
            }
        }

        /// Update mock configuration
        pub fn update_config<F>(&self, f: F)
        where
            F: FnOnce(&mut MockRuntimeConfig),
        {
            let mut config = self.config.lock().unwrap();
            f(&mut config);
        }

        /// Script responses for a command matched by its full text
        /// (argv joined with spaces)
        pub fn set_exec_responses(&self, command: &str, responses: Vec<MockExecResponse>) {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .exact
                .insert(command.to_string(), responses.into_iter().collect());
        }

        /// Script a single response for a command matched by its full text
        pub fn set_exec_response(&self, command: &str, response: MockExecResponse) {
            self.set_exec_responses(command, vec![response]);
        }

        /// Script responses for any command whose text contains `needle`
        pub fn set_exec_rule(&self, needle: &str, responses: Vec<MockExecResponse>) {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.contains.retain(|(n, _)| n != needle);
            scripts
                .contains
                .push((needle.to_string(), responses.into_iter().collect()));
        }

        /// Response used when nothing else matches
        pub fn set_default_exec_response(&self, response: MockExecResponse) {
            self.scripts.lock().unwrap().default = response;
        }

        pub fn containers(&self) -> Vec<MockContainer> {
            self.containers.lock().unwrap().clone()
        }

        /// Ids of containers that are still running
        pub fn running_containers(&self) -> Vec<String> {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.state == "running")
                .map(|c| c.id.clone())
                .collect()
        }

        pub fn exec_history(&self) -> Vec<MockExecCall> {
            self.exec_history.lock().unwrap().clone()
        }

        /// Executed commands as joined strings, in issue order
        pub fn executed_commands(&self) -> Vec<String> {
            self.exec_history
                .lock()
                .unwrap()
                .iter()
                .map(|call| call.command.join(" "))
                .collect()
        }

        pub fn copy_history(&self) -> Vec<MockCopyCall> {
            self.copy_history.lock().unwrap().clone()
        }

        pub fn build_history(&self) -> Vec<MockBuildCall> {
            self.build_history.lock().unwrap().clone()
        }

        pub fn removed_images(&self) -> Vec<ImageRef> {
            self.removed_images.lock().unwrap().clone()
        }

        /// Containers removed through `release_blocking`
        pub fn released(&self) -> Vec<String> {
            self.released.lock().unwrap().clone()
        }

        fn check_daemon(&self) -> Result<()> {
            if self.config.lock().unwrap().daemon_unavailable {
                return Err(RuntimeError::NotInstalled {
                    runtime: "mock".to_string(),
                }
                .into());
            }
            Ok(())
        }

        fn set_state(&self, container_id: &str, state: &str) -> Result<()> {
            let mut containers = self.containers.lock().unwrap();
            match containers.iter_mut().find(|c| c.id == container_id) {
                Some(container) => {
                    container.state = state.to_string();
                    Ok(())
                }
                None => Err(RuntimeError::ContainerNotFound {
                    id: container_id.to_string(),
                }
                .into()),
            }
        }

        fn is_running(&self, container_id: &str) -> bool {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.id == container_id && c.state == "running")
        }
    }

    impl ContainerRuntime for MockRuntime {
        fn runtime_name(&self) -> &'static str {
            "mock"
        }

        async fn ping(&self) -> Result<()> {
            self.check_daemon()
        }

        #[instrument(skip(self, options))]
        async fn start(&self, image: &ImageRef, options: &StartOptions) -> Result<String> {
            self.check_daemon()?;
            if self.config.lock().unwrap().fail_start {
                return Err(RuntimeError::CLIError(format!(
                    "Mock start failure for {}",
                    image
                ))
                .into());
            }

            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("mock{:012}", *next)
            };
            self.containers.lock().unwrap().push(MockContainer {
                id: id.clone(),
                image: image.clone(),
                options: options.clone(),
                state: "running".to_string(),
            });
            debug!("MockRuntime started {} from {}", id, image);
            Ok(id)
        }

        #[instrument(skip(self, config))]
        async fn exec(
            &self,
            container_id: &str,
            command: &[String],
            config: &ExecConfig,
        ) -> Result<ExecResult> {
            self.check_daemon()?;
            if !self.is_running(container_id) {
                return Err(RuntimeError::ContainerNotFound {
                    id: container_id.to_string(),
                }
                .into());
            }

            let response = self.scripts.lock().unwrap().respond(&command.join(" "));
            self.exec_history.lock().unwrap().push(MockExecCall {
                container_id: container_id.to_string(),
                command: command.to_vec(),
                config: config.clone(),
                timestamp: Instant::now(),
            });

            if let Some(delay) = response.delay {
                if let Some(limit) = config.timeout.filter(|limit| *limit < delay) {
                    tokio::time::sleep(limit).await;
                    return Ok(ExecResult {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: String::new(),
                        timed_out: true,
                    });
                }
                tokio::time::sleep(delay).await;
            }

            Ok(ExecResult {
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
                timed_out: false,
            })
        }

        async fn copy_into(
            &self,
            container_id: &str,
            host_path: &Path,
            container_path: &str,
        ) -> Result<()> {
            self.check_daemon()?;
            if !self.is_running(container_id) {
                return Err(RuntimeError::ContainerNotFound {
                    id: container_id.to_string(),
                }
                .into());
            }
            if !host_path.exists() {
                return Err(HarnessError::InvalidArgument {
                    message: format!("host path {} does not exist", host_path.display()),
                });
            }
            self.copy_history.lock().unwrap().push(MockCopyCall {
                container_id: container_id.to_string(),
                host_path: host_path.to_path_buf(),
                container_path: container_path.to_string(),
            });
            Ok(())
        }

        async fn stop(&self, container_id: &str, _grace_secs: Option<u32>) -> Result<()> {
            self.check_daemon()?;
            if self.config.lock().unwrap().fail_stop {
                return Err(RuntimeError::CLIError("Mock stop failure".to_string()).into());
            }
            self.set_state(container_id, "removed")
        }

        async fn inspect_state(&self, container_id: &str) -> Result<Option<String>> {
            self.check_daemon()?;
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id == container_id && c.state != "removed")
                .map(|c| c.state.clone()))
        }

        fn release_blocking(&self, container_id: &str) {
            let _ = self.set_state(container_id, "removed");
            self.released.lock().unwrap().push(container_id.to_string());
        }
    }

    impl ImageBuilder for MockRuntime {
        async fn derive(&self, base: &ImageRef, overlay: &Overlay) -> Result<ImageRef> {
            self.check_daemon()?;
            let generator = ContainerfileGenerator::new(base, overlay);
            let containerfile = generator.generate()?;
            let tag = generator.derived_tag()?;

            if let Some(message) = self.config.lock().unwrap().build_failure.clone() {
                return Err(BuildError::Failed {
                    base: base.to_string(),
                    message,
                }
                .into());
            }

            self.build_history.lock().unwrap().push(MockBuildCall {
                base: base.clone(),
                containerfile,
                tag: tag.clone(),
            });
            Ok(tag)
        }

        async fn remove_image(&self, image: &ImageRef) -> Result<()> {
            self.check_daemon()?;
            self.removed_images.lock().unwrap().push(image.clone());
            Ok(())
        }
    }
}
