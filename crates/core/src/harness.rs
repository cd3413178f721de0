//! Launching containers and scoping their lifetime
//!
//! [`Harness::launch`] turns a [`ContainerImageSpec`] into a ready
//! [`RunningContainer`], building the overlay image first when there is one.
//! Two lifetimes are offered and the caller picks per image:
//!
//! - [`Harness::scoped`]: a fresh container for one test body, stopped
//!   afterwards whatever the body returned.
//! - [`SharedContainers`]: one container per spec reused across tests and
//!   stopped by [`SharedContainers::shutdown`].

use crate::config::HarnessConfig;
use crate::container::{ContainerState, RunningContainer, StateEvent};
use crate::errors::{HarnessError, Result};
use crate::image::{ContainerImageSpec, ImageRef};
use crate::runtime::{ContainerRuntime, ImageBuilder, StartOptions};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Label carrying the spec name of a harness container
pub const SPEC_LABEL: &str = "bcicheck.spec";

/// How long a container lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimePolicy {
    /// Fresh container per test, stopped at the end of the test
    PerTest,
    /// One container per spec for the whole suite
    Shared,
}

/// Entry point for launching containers
pub struct Harness<R> {
    runtime: Arc<R>,
    config: HarnessConfig,
    derived_images: Mutex<BTreeSet<ImageRef>>,
}

impl<R: ContainerRuntime + ImageBuilder> Harness<R> {
    pub fn new(runtime: R, config: HarnessConfig) -> Self {
        Self::with_shared_runtime(Arc::new(runtime), config)
    }

    pub fn with_shared_runtime(runtime: Arc<R>, config: HarnessConfig) -> Self {
        Self {
            runtime,
            config,
            derived_images: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Fail early with `RuntimeUnavailable` when the runtime cannot be reached
    pub async fn ensure_available(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// Build (if needed) and start a container for `spec`
    #[instrument(skip_all, fields(spec = %spec.name()))]
    pub async fn launch(&self, spec: &ContainerImageSpec) -> Result<RunningContainer<R>> {
        let mut state = ContainerState::Uninitialized;

        let image = match spec.overlay().filter(|_| spec.needs_build()) {
            Some(overlay) => {
                state = state.advance(StateEvent::BuildStarted)?;
                debug!(%state, "Deriving image for {}", spec.name());
                match self.runtime.derive(spec.base(), overlay).await {
                    Ok(image) => {
                        if let Ok(mut built) = self.derived_images.lock() {
                            built.insert(image.clone());
                        }
                        image
                    }
                    Err(e) => {
                        state = state.advance(StateEvent::LaunchFailed)?;
                        warn!(%state, "Overlay build for {} failed: {}", spec.name(), e);
                        return Err(e);
                    }
                }
            }
            None => spec.base().clone(),
        };

        let mut options = StartOptions::default();
        options
            .labels
            .insert(SPEC_LABEL.to_string(), spec.name().to_string());

        let id = match self.runtime.start(&image, &options).await {
            Ok(id) => id,
            Err(e) => {
                state = state.advance(StateEvent::LaunchFailed)?;
                warn!(%state, "Starting {} failed: {}", image, e);
                return Err(e);
            }
        };
        state = state.advance(StateEvent::Started)?;

        info!(%state, "Container {} ready from {}", id, image);
        Ok(RunningContainer::new(
            self.runtime.clone(),
            id,
            image,
            spec.clone(),
            self.config.exec_timeout(),
            Some(self.config.stop_timeout_secs),
        )
        .with_state(state))
    }

    /// Run `body` against a fresh container, then stop it
    ///
    /// The container is stopped even when `body` fails; an error from `body`
    /// takes precedence over a teardown error.
    pub async fn scoped<T, E, F, Fut>(&self, spec: &ContainerImageSpec, body: F) -> std::result::Result<T, E>
    where
        E: From<HarnessError>,
        F: FnOnce(Arc<RunningContainer<R>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let container = Arc::new(self.launch(spec).await?);
        let outcome = body(container.clone()).await;
        let stopped = container.stop().await;

        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(stop_error)) => Err(stop_error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(stop_error)) => {
                warn!("Teardown after failed test also failed: {}", stop_error);
                Err(error)
            }
        }
    }

    /// Derived images built so far
    pub fn derived_images(&self) -> Vec<ImageRef> {
        self.derived_images
            .lock()
            .map(|built| built.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every derived image this harness built, unless configured to keep them
    pub async fn remove_derived_images(&self) -> Result<()> {
        if self.config.keep_images {
            debug!("Keeping derived images");
            return Ok(());
        }

        let images = match self.derived_images.lock() {
            Ok(mut built) => std::mem::take(&mut *built),
            Err(_) => BTreeSet::new(),
        };

        let mut first_error = None;
        for image in images {
            if let Err(e) = self.runtime.remove_image(&image).await {
                warn!("Failed to remove derived image {}: {}", image, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Suite-scoped containers, one per spec name
pub struct SharedContainers<R: ContainerRuntime> {
    harness: Arc<Harness<R>>,
    containers: tokio::sync::Mutex<HashMap<String, Arc<RunningContainer<R>>>>,
}

impl<R: ContainerRuntime + ImageBuilder> SharedContainers<R> {
    pub fn new(harness: Arc<Harness<R>>) -> Self {
        Self {
            harness,
            containers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn harness(&self) -> &Arc<Harness<R>> {
        &self.harness
    }

    /// Shared container for `spec`, launched on first use
    pub async fn get_or_launch(&self, spec: &ContainerImageSpec) -> Result<Arc<RunningContainer<R>>> {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get(spec.name()) {
            if container.state() == ContainerState::Ready {
                return Ok(container.clone());
            }
        }

        let container = Arc::new(self.harness.launch(spec).await?);
        containers.insert(spec.name().to_string(), container.clone());
        Ok(container)
    }

    /// Run `body` with a container whose lifetime follows `policy`
    pub async fn with_container<T, E, F, Fut>(
        &self,
        policy: LifetimePolicy,
        spec: &ContainerImageSpec,
        body: F,
    ) -> std::result::Result<T, E>
    where
        E: From<HarnessError>,
        F: FnOnce(Arc<RunningContainer<R>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match policy {
            LifetimePolicy::PerTest => self.harness.scoped(spec, body).await,
            LifetimePolicy::Shared => {
                let container = self.get_or_launch(spec).await?;
                body(container).await
            }
        }
    }

    /// Stop every shared container, then drop derived images
    ///
    /// All containers are attempted; the first error is returned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let containers: Vec<_> = self.containers.lock().await.drain().collect();
        debug!("Stopping {} shared containers", containers.len());

        let results =
            futures::future::join_all(containers.iter().map(|(_, container)| container.stop()))
                .await;

        let mut first_error = None;
        for ((name, _), result) in containers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop shared container for {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        let images = self.harness.remove_derived_images().await;
        match first_error {
            Some(e) => Err(e),
            None => images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExitCodes;
    use crate::docker::mock::{MockExecResponse, MockRuntime, MockRuntimeConfig};
    use crate::errors::{BuildError, RuntimeError};
    use crate::image::Overlay;
    use crate::predicate::Predicate;
    use crate::poll::{poll_until, PollConfig};
    use std::time::Duration;

    fn base() -> ContainerImageSpec {
        ContainerImageSpec::new(ImageRef::parse("registry.suse.com/bci/python:3.6").unwrap())
    }

    fn derived() -> ContainerImageSpec {
        ContainerImageSpec::derived(
            ImageRef::parse("registry.suse.com/bci/python:3.6").unwrap(),
            Overlay::new(".").workdir("/tmp/").create_dir("output/"),
        )
    }

    fn harness(runtime: MockRuntime) -> Harness<MockRuntime> {
        Harness::new(runtime, HarnessConfig::default())
    }

    #[tokio::test]
    async fn test_launch_plain_image() {
        let harness = harness(MockRuntime::new());
        let container = harness.launch(&base()).await.unwrap();

        assert_eq!(container.state(), ContainerState::Ready);
        assert_eq!(container.image().as_str(), "registry.suse.com/bci/python:3.6");
        assert!(harness.runtime().build_history().is_empty());
        let containers = harness.runtime().containers();
        let started = &containers[0];
        assert_eq!(
            started.options.labels.get(SPEC_LABEL).map(String::as_str),
            Some("registry.suse.com/bci/python:3.6")
        );

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_builds_overlay_before_start() {
        let harness = harness(MockRuntime::new());
        let container = harness.launch(&derived()).await.unwrap();

        let builds = harness.runtime().build_history();
        assert_eq!(builds.len(), 1);
        assert!(builds[0].containerfile.contains("WORKDIR /tmp/"));
        assert_eq!(container.image(), &builds[0].tag);
        assert_eq!(harness.derived_images(), vec![builds[0].tag.clone()]);
        assert_eq!(container.state(), ContainerState::Ready);

        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_failure_aborts_before_start() {
        let harness = harness(MockRuntime::with_config(MockRuntimeConfig {
            build_failure: Some("COPY failed: file not found".to_string()),
            ..Default::default()
        }));

        let err = harness.launch(&derived()).await.unwrap_err();
        assert!(matches!(err, HarnessError::Build(BuildError::Failed { .. })));
        assert!(harness.runtime().containers().is_empty());
        assert!(harness.runtime().exec_history().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_unavailable() {
        let harness = harness(MockRuntime::with_config(MockRuntimeConfig {
            fail_start: true,
            ..Default::default()
        }));
        let err = harness.launch(&base()).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::RuntimeUnavailable(RuntimeError::CLIError(_))
        ));

        harness
            .runtime()
            .update_config(|c| c.daemon_unavailable = true);
        assert!(harness.ensure_available().await.is_err());
    }

    #[tokio::test]
    async fn test_scoped_stops_after_success_and_failure() {
        let harness = harness(MockRuntime::new());
        harness
            .runtime()
            .set_exec_rule("exit 1", vec![MockExecResponse::exit(1, "")]);

        let value = harness
            .scoped(&base(), |c| async move {
                c.execute_expect("true", &ExitCodes::success()).await?;
                Ok::<_, HarnessError>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = harness
            .scoped(&base(), |c| async move {
                c.execute_expect("exit 1", &ExitCodes::success()).await?;
                Ok::<_, HarnessError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_exit_failure());

        assert_eq!(harness.runtime().containers().len(), 2);
        assert!(harness.runtime().running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_body_error_wins_over_stop_error() {
        let harness = harness(MockRuntime::with_config(MockRuntimeConfig {
            fail_stop: true,
            ..Default::default()
        }));

        let err = harness
            .scoped(&base(), |_| async {
                Err::<(), _>(anyhow::anyhow!("assertion failed"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "assertion failed");

        let err = harness
            .scoped(&base(), |_| async { Ok::<_, HarnessError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_background_server_then_poll() {
        let harness = harness(MockRuntime::new());
        let listening_after = "   0: 00000000:1FBB 00000000:0000 0A 00000000:00000000 00:00000000 00000000 0 0 1 1\n";
        harness.runtime().set_exec_rule(
            "/proc/net/tcp",
            vec![
                MockExecResponse::ok(""),
                MockExecResponse::ok(""),
                MockExecResponse::ok(listening_after),
            ],
        );

        harness
            .scoped(&base(), |c| async move {
                let port = Predicate::listening("tcp://0.0.0.0:8123")?;
                assert!(!c.probe_predicate(&port).await?);
                c.execute_expect(
                    "nohup python3 -m http.server 8123 >/dev/null 2>&1 &",
                    &ExitCodes::success(),
                )
                .await?;
                let up = poll_until(&PollConfig::fixed(5, Duration::from_millis(1)), || {
                    c.probe_predicate(&port)
                })
                .await?;
                assert!(up);
                Ok::<_, HarnessError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_containers_reuse_and_shutdown() {
        let shared = SharedContainers::new(Arc::new(harness(MockRuntime::new())));

        let a = shared.get_or_launch(&base()).await.unwrap();
        let b = shared.get_or_launch(&base()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = shared.get_or_launch(&derived()).await.unwrap();
        assert_ne!(a.id(), c.id());

        shared.shutdown().await.unwrap();
        assert_eq!(a.state(), ContainerState::Stopped);
        assert_eq!(c.state(), ContainerState::Stopped);

        let runtime = shared.harness().runtime();
        assert!(runtime.running_containers().is_empty());
        assert_eq!(runtime.removed_images().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_first_error_after_trying_all() {
        let shared = SharedContainers::new(Arc::new(harness(MockRuntime::new())));
        let a = shared.get_or_launch(&base()).await.unwrap();
        let b = shared
            .get_or_launch(&base().with_name("second"))
            .await
            .unwrap();

        shared
            .harness()
            .runtime()
            .update_config(|c| c.fail_stop = true);
        assert!(shared.shutdown().await.is_err());
        assert_eq!(a.state(), ContainerState::Ready);
        assert_eq!(b.state(), ContainerState::Ready);
    }

    #[tokio::test]
    async fn test_keep_images_skips_removal() {
        let config = HarnessConfig {
            keep_images: true,
            ..Default::default()
        };
        let shared = SharedContainers::new(Arc::new(Harness::new(MockRuntime::new(), config)));
        shared.get_or_launch(&derived()).await.unwrap();

        shared.shutdown().await.unwrap();
        assert!(shared.harness().runtime().removed_images().is_empty());
    }

    #[tokio::test]
    async fn test_with_container_policies() {
        let shared = SharedContainers::new(Arc::new(harness(MockRuntime::new())));

        let first = shared
            .with_container(LifetimePolicy::Shared, &base(), |c| async move {
                Ok::<_, HarnessError>(c.id().to_string())
            })
            .await
            .unwrap();
        let second = shared
            .with_container(LifetimePolicy::Shared, &base(), |c| async move {
                Ok::<_, HarnessError>(c.id().to_string())
            })
            .await
            .unwrap();
        assert_eq!(first, second);

        let per_test = shared
            .with_container(LifetimePolicy::PerTest, &base(), |c| async move {
                Ok::<_, HarnessError>(c.id().to_string())
            })
            .await
            .unwrap();
        assert_ne!(first, per_test);
        assert_eq!(shared.harness().runtime().running_containers(), vec![first]);

        shared.shutdown().await.unwrap();
    }
}
