//! Running containers and their lifecycle
//!
//! A [`RunningContainer`] is the handle tests use to run commands against a
//! live container. Its [`ContainerState`] follows
//! `uninitialized -> building -> ready -> stopped`, with `failed` as the
//! terminal state of a launch that did not get a container running. Commands
//! and predicate probes are only accepted in `ready`.

use crate::command::{CommandResult, ExitCodes, ShellCommand};
use crate::errors::{CommandFailure, HarnessError, Result};
use crate::image::{ContainerImageSpec, ImageRef};
use crate::predicate::{self, Predicate, ProcessInfo};
use crate::runtime::{ContainerRuntime, ExecConfig, ExecResult};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Lifecycle state of a container handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Uninitialized,
    /// Overlay image is being materialized
    Building,
    /// Accepting commands
    Ready,
    Stopped,
    /// Build or start failed; terminal
    Failed,
}

/// Events driving [`ContainerState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// An overlay must be built before first use
    BuildStarted,
    /// The container is up (after a build, or directly from a plain image)
    Started,
    /// Build or start failed
    LaunchFailed,
    /// Teardown requested
    Stop,
}

impl ContainerState {
    /// Apply `event`, rejecting transitions outside the lifecycle
    pub fn advance(self, event: StateEvent) -> Result<Self> {
        use ContainerState::*;
        use StateEvent::*;

        let next = match (self, event) {
            (Uninitialized, BuildStarted) => Building,
            (Uninitialized | Building, Started) => Ready,
            (Uninitialized | Building, LaunchFailed) => Failed,
            (Ready | Stopped, Stop) => Stopped,
            (state, event) => {
                return Err(HarnessError::InvalidState {
                    container: "-".to_string(),
                    state: state.to_string(),
                    operation: format!("apply {:?} to", event),
                })
            }
        };
        debug!("Container state {} -> {} on {:?}", self, next, event);
        Ok(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a live container
///
/// Commands issued through one handle are serialized: each waits for the
/// previous one to finish, so they observe issue order. Dropping a handle
/// that was never stopped removes the container synchronously.
pub struct RunningContainer<R: ContainerRuntime> {
    runtime: Arc<R>,
    id: String,
    image: ImageRef,
    spec: ContainerImageSpec,
    state: Mutex<ContainerState>,
    exec_lock: tokio::sync::Mutex<()>,
    default_timeout: Option<Duration>,
    stop_grace_secs: Option<u32>,
}

impl<R: ContainerRuntime> fmt::Debug for RunningContainer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningContainer")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("spec", &self.spec.name())
            .field("state", &self.state())
            .finish()
    }
}

impl<R: ContainerRuntime> RunningContainer<R> {
    /// Wrap a started container; the handle begins in `ready`
    pub fn new(
        runtime: Arc<R>,
        id: String,
        image: ImageRef,
        spec: ContainerImageSpec,
        default_timeout: Option<Duration>,
        stop_grace_secs: Option<u32>,
    ) -> Self {
        Self {
            runtime,
            id,
            image,
            spec,
            state: Mutex::new(ContainerState::Ready),
            exec_lock: tokio::sync::Mutex::new(()),
            default_timeout,
            stop_grace_secs,
        }
    }

    /// Carry over the state reached while launching
    pub(crate) fn with_state(self, state: ContainerState) -> Self {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Image the container was started from (the derived image for overlays)
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn spec(&self) -> &ContainerImageSpec {
        &self.spec
    }

    pub fn state(&self) -> ContainerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ContainerState::Failed)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    fn ensure_ready(&self, operation: &str) -> Result<()> {
        match self.state() {
            ContainerState::Ready => Ok(()),
            state => Err(HarnessError::InvalidState {
                container: self.short_id().to_string(),
                state: state.to_string(),
                operation: operation.to_string(),
            }),
        }
    }

    fn failure(
        &self,
        command: &ShellCommand,
        expected: &ExitCodes,
        result: ExecResult,
    ) -> Box<CommandFailure> {
        Box::new(CommandFailure {
            command: command.to_string(),
            container_id: self.id.clone(),
            image: self.image.to_string(),
            expected: expected.clone(),
            exit_code: (!result.timed_out).then_some(result.exit_code),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    /// Run a command and return its raw outcome, mapping a timeout to an error
    async fn exec_command(
        &self,
        command: &ShellCommand,
        expected: &ExitCodes,
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        self.ensure_ready("execute a command in")?;
        if command.is_empty() {
            return Err(HarnessError::InvalidArgument {
                message: "command cannot be empty".to_string(),
            });
        }

        let _guard = self.exec_lock.lock().await;
        // A stop may have landed while waiting for the lock
        self.ensure_ready("execute a command in")?;

        let config = ExecConfig::with_timeout(timeout);
        let result = self
            .runtime
            .exec(&self.id, &command.to_argv(), &config)
            .await?;

        if result.timed_out {
            let limit = timeout.unwrap_or_default();
            warn!(
                container = %self.short_id(),
                command = %command,
                "Command timed out after {:?}",
                limit
            );
            return Err(HarnessError::Timeout {
                failure: self.failure(command, expected, result),
                timeout: limit,
            });
        }

        debug!(
            container = %self.short_id(),
            command = %command,
            exit_code = result.exit_code,
            "Command finished"
        );
        Ok(result)
    }

    /// Run `command` with the default timeout and fail unless its exit code
    /// is in `expected`
    pub async fn execute_expect(
        &self,
        command: impl Into<ShellCommand>,
        expected: &ExitCodes,
    ) -> Result<CommandResult> {
        self.execute_expect_with_timeout(command, expected, self.default_timeout)
            .await
    }

    /// Like [`Self::execute_expect`] with an explicit timeout (`None` waits
    /// indefinitely)
    #[instrument(skip_all, fields(container = %self.short_id()))]
    pub async fn execute_expect_with_timeout(
        &self,
        command: impl Into<ShellCommand>,
        expected: &ExitCodes,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        let command = command.into();
        let result = self.exec_command(&command, expected, timeout).await?;

        if !expected.contains(result.exit_code) {
            return Err(HarnessError::UnexpectedExitCode(
                self.failure(&command, expected, result),
            ));
        }

        Ok(CommandResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    /// Run `command` and return its result whatever the exit code
    ///
    /// Timeouts are still errors.
    #[instrument(skip_all, fields(container = %self.short_id()))]
    pub async fn run(&self, command: impl Into<ShellCommand>) -> Result<CommandResult> {
        let command = command.into();
        let result = self
            .exec_command(&command, &ExitCodes::success(), self.default_timeout)
            .await?;
        Ok(CommandResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    /// Evaluate a side-effect-free predicate against the container
    ///
    /// `Ok(false)` means the predicate does not hold; it is not a failure.
    #[instrument(skip_all, fields(container = %self.short_id(), predicate = %predicate))]
    pub async fn probe_predicate(&self, predicate: &Predicate) -> Result<bool> {
        let holds = predicate.evaluate(self).await?;
        debug!("Predicate {} = {}", predicate, holds);
        Ok(holds)
    }

    /// Snapshot of the container's process table
    pub async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        predicate::list_processes(self).await
    }

    /// Copy a host file or directory into the container
    #[instrument(skip(self), fields(container = %self.short_id()))]
    pub async fn copy_into(&self, host_path: &Path, container_path: &str) -> Result<()> {
        self.ensure_ready("copy into")?;
        let _guard = self.exec_lock.lock().await;
        self.ensure_ready("copy into")?;
        self.runtime
            .copy_into(&self.id, host_path, container_path)
            .await?;
        debug!("Copied {} to {}", host_path.display(), container_path);
        Ok(())
    }

    /// Stop and remove the container; later calls return `Ok` without doing anything
    ///
    /// The runtime tears down every process in the container, including
    /// commands whose exec client was killed on timeout.
    #[instrument(skip(self), fields(container = %self.short_id()))]
    pub async fn stop(&self) -> Result<()> {
        let current = self.state();
        if current == ContainerState::Stopped {
            return Ok(());
        }
        if current != ContainerState::Ready {
            return Err(HarnessError::InvalidState {
                container: self.short_id().to_string(),
                state: current.to_string(),
                operation: "stop".to_string(),
            });
        }

        self.runtime.stop(&self.id, self.stop_grace_secs).await?;

        if let Ok(mut state) = self.state.lock() {
            *state = state.advance(StateEvent::Stop)?;
        }
        debug!("Container {} stopped", self.short_id());
        Ok(())
    }

    /// Whether the handle is ready and the runtime reports the container running
    pub async fn is_alive(&self) -> bool {
        if self.state() != ContainerState::Ready {
            return false;
        }
        match self.runtime.inspect_state(&self.id).await {
            Ok(Some(status)) => status == "running",
            Ok(None) => false,
            Err(e) => {
                debug!("Inspect of {} failed: {}", self.short_id(), e);
                false
            }
        }
    }
}

impl<R: ContainerRuntime> Drop for RunningContainer<R> {
    fn drop(&mut self) {
        if self.state() == ContainerState::Ready {
            warn!(
                "Container {} dropped without stop; removing it",
                self.short_id()
            );
            self.runtime.release_blocking(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::{MockExecResponse, MockRuntime, MockRuntimeConfig};
    use crate::runtime::StartOptions;

    async fn start(runtime: &Arc<MockRuntime>, timeout: Option<Duration>) -> RunningContainer<MockRuntime> {
        let image = ImageRef::parse("registry.suse.com/bci/python:3.10").unwrap();
        let id = runtime
            .start(&image, &StartOptions::default())
            .await
            .unwrap();
        RunningContainer::new(
            runtime.clone(),
            id,
            image.clone(),
            ContainerImageSpec::new(image),
            timeout,
            Some(1),
        )
    }

    #[test]
    fn test_state_machine_transitions() {
        use ContainerState::*;
        use StateEvent::*;

        assert_eq!(Uninitialized.advance(BuildStarted).unwrap(), Building);
        assert_eq!(Building.advance(Started).unwrap(), Ready);
        assert_eq!(Uninitialized.advance(Started).unwrap(), Ready);
        assert_eq!(Building.advance(LaunchFailed).unwrap(), Failed);
        assert_eq!(Ready.advance(Stop).unwrap(), Stopped);
        assert_eq!(Stopped.advance(Stop).unwrap(), Stopped);

        assert!(Ready.advance(BuildStarted).is_err());
        assert!(Failed.advance(Started).is_err());
        assert!(Failed.advance(Stop).is_err());
        assert!(Stopped.advance(Started).is_err());
        assert!(Uninitialized.advance(Stop).is_err());
    }

    #[tokio::test]
    async fn test_execute_expect_accepts_member_codes() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;
        runtime.set_exec_response("/bin/sh -c grep -q x f", MockExecResponse::exit(1, ""));

        let codes = ExitCodes::new([0, 1]).unwrap();
        let result = container.execute_expect("grep -q x f", &codes).await.unwrap();
        assert_eq!(result.exit_code, 1);

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_expect_fails_on_unexpected_code() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;
        runtime.set_exec_rule(
            "pip install tox",
            vec![MockExecResponse::exit(1, "Could not find a version")],
        );

        let err = container
            .execute_expect("pip install tox", &ExitCodes::success())
            .await
            .unwrap_err();
        assert!(err.is_exit_failure());
        assert!(!err.is_timeout());
        let failure = err.command_failure().unwrap();
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.command, "pip install tox");
        assert_eq!(failure.image, "registry.suse.com/bci/python:3.10");
        assert!(failure.stderr.contains("Could not find"));

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_is_distinguishable() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, Some(Duration::from_millis(10))).await;
        runtime.set_exec_rule(
            "sleep",
            vec![MockExecResponse::ok("").with_delay(Duration::from_millis(200))],
        );

        let err = container
            .execute_expect("sleep 300", &ExitCodes::success())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_exit_failure());
        assert_eq!(err.command_failure().unwrap().exit_code, None);

        // Teardown removes the container and anything still running in it
        container.stop().await.unwrap();
        assert!(runtime.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_any_exit_code() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;
        runtime.set_exec_rule("false", vec![MockExecResponse::exit(3, "nope")]);

        let result = container.run("false").await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "nope");

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_run_in_issue_order() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;

        for i in 0..5 {
            container.run(format!("echo {}", i)).await.unwrap();
        }
        let commands = runtime.executed_commands();
        let expected: Vec<String> = (0..5).map(|i| format!("/bin/sh -c echo {}", i)).collect();
        assert_eq!(commands, expected);

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;

        let err = container.run("  ").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidArgument { .. }));
        assert!(runtime.exec_history().is_empty());

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_blocks_commands() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;

        assert!(container.is_alive().await);
        container.stop().await.unwrap();
        container.stop().await.unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(!container.is_alive().await);

        let err = container.run("true").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
        let err = container
            .copy_into(Path::new("Cargo.toml"), "/tmp/")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_copy_waiting_on_command_sees_stop() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_exec_rule(
            "sleep",
            vec![MockExecResponse::ok("").with_delay(Duration::from_millis(200))],
        );
        let container = start(&runtime, None).await;
        let file = tempfile::NamedTempFile::new().unwrap();

        // The command holds the exec lock; the copy queues behind it and the
        // stop lands while it waits
        let copy = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            container.copy_into(file.path(), "/tmp/copied").await
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            container.stop().await
        };
        let (_, copied, stopped) = tokio::join!(container.run("sleep 1"), copy, stop);

        stopped.unwrap();
        let err = copied.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }), "{}", err);
        assert!(runtime.copy_history().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_container_ready() {
        let runtime = Arc::new(MockRuntime::with_config(MockRuntimeConfig {
            fail_stop: true,
            ..Default::default()
        }));
        let container = start(&runtime, None).await;

        assert!(container.stop().await.is_err());
        assert_eq!(container.state(), ContainerState::Ready);

        let id = container.id().to_string();
        drop(container);
        assert_eq!(runtime.released(), vec![id]);
    }

    #[tokio::test]
    async fn test_drop_without_stop_releases() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;
        let id = container.id().to_string();

        drop(container);
        assert_eq!(runtime.released(), vec![id]);
        assert!(runtime.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_copy_into_records_transfer() {
        let runtime = Arc::new(MockRuntime::new());
        let container = start(&runtime, None).await;
        let file = tempfile::NamedTempFile::new().unwrap();

        container
            .copy_into(file.path(), "/tmp/trainers/")
            .await
            .unwrap();
        let copies = runtime.copy_history();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].container_path, "/tmp/trainers/");
        assert_eq!(copies[0].container_id, container.id());

        container.stop().await.unwrap();
    }
}
