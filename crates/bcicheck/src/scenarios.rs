//! Checks run against Python base images
//!
//! Each check takes a ready container and fails with a descriptive error when
//! the image does not behave as expected.

use crate::matrix::{
    trainer_asset, ImageEntry, DOWNLOAD_EXAMPLE, OUTPUT_DIR, TENSORFLOW_TRAINER, TRAINER_DIR,
};
use anyhow::{ensure, Context, Result};
use bcicheck_core::command::ExitCodes;
use bcicheck_core::container::RunningContainer;
use bcicheck_core::harness::Harness;
use bcicheck_core::poll::{poll_until, PollConfig};
use bcicheck_core::predicate::Predicate;
use bcicheck_core::runtime::{ContainerRuntime, ImageBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Port used by the web server check
pub const WEBSERVER_PORT: u16 = 8123;

/// Remote file fetched by the download check
pub const DOWNLOAD_URL: &str = "https://www.suse.com/assets/img/suse-white-logo-green.svg";
pub const DOWNLOAD_FILE: &str = "suse-white-logo-green.svg";

/// In-container time limit for long-running checks
const IN_CONTAINER_TIMEOUT: &str = "240s";

/// Polling used while waiting for a background server
pub fn server_poll() -> PollConfig {
    PollConfig::new(
        20,
        Duration::from_millis(250),
        Duration::from_secs(3),
        Default::default(),
    )
}

async fn output<R: ContainerRuntime>(container: &RunningContainer<R>, command: &str) -> Result<String> {
    let result = container
        .execute_expect(command, &ExitCodes::success())
        .await?;
    Ok(result.stdout_trimmed().to_string())
}

/// `python3 --version` matches `$PYTHON_VERSION`
pub async fn python_version<R: ContainerRuntime>(container: &RunningContainer<R>) -> Result<()> {
    let reported = output(container, "python3 --version").await?;
    let expected = output(container, "echo $PYTHON_VERSION").await?;

    ensure!(!expected.is_empty(), "PYTHON_VERSION is not set in the image");
    ensure!(
        reported == format!("Python {}", expected),
        "python3 reports '{}', PYTHON_VERSION is '{}'",
        reported,
        expected
    );
    Ok(())
}

/// `pip check` passes and `pip --version` matches `$PIP_VERSION`
pub async fn pip_version<R: ContainerRuntime>(container: &RunningContainer<R>) -> Result<()> {
    container
        .execute_expect("pip check", &ExitCodes::success())
        .await
        .context("installed packages have broken requirements")?;

    let reported = output(container, "pip --version").await?;
    let expected = output(container, "echo $PIP_VERSION").await?;

    ensure!(!expected.is_empty(), "PIP_VERSION is not set in the image");
    ensure!(
        reported.contains(&format!("pip {}", expected)),
        "pip reports '{}', PIP_VERSION is '{}'",
        reported,
        expected
    );
    Ok(())
}

/// pip can install tox for the current user
pub async fn tox_install<R: ContainerRuntime>(container: &RunningContainer<R>) -> Result<()> {
    container
        .execute_expect("pip install --user tox", &ExitCodes::success())
        .await?;
    Ok(())
}

/// `python3 -m http.server` starts in the background and listens
pub async fn webserver_listens<R: ContainerRuntime>(
    container: &RunningContainer<R>,
    poll: &PollConfig,
) -> Result<()> {
    let port = Predicate::listening(&format!("tcp://0.0.0.0:{}", WEBSERVER_PORT))?;
    let server = Predicate::process_running("python3", Some("http.server"));

    ensure!(
        !container.probe_predicate(&port).await?,
        "port {} is already listening before the server starts",
        WEBSERVER_PORT
    );

    // Detached from exec's output pipes so the exec returns immediately
    container
        .execute_expect(
            format!(
                "nohup timeout {} python3 -m http.server {} >/dev/null 2>&1 &",
                IN_CONTAINER_TIMEOUT, WEBSERVER_PORT
            ),
            &ExitCodes::success(),
        )
        .await?;

    ensure!(
        poll_until(poll, || container.probe_predicate(&server)).await?,
        "no python3 process running http.server"
    );
    ensure!(
        poll_until(poll, || container.probe_predicate(&port)).await?,
        "http.server is not listening on port {}",
        WEBSERVER_PORT
    );

    info!("http.server listening on {} in {}", WEBSERVER_PORT, container.id());
    Ok(())
}

/// The `wget` package downloads a remote file from a copied-in script
pub async fn wget_download<R: ContainerRuntime>(container: &RunningContainer<R>) -> Result<()> {
    let script = format!("{}{}", TRAINER_DIR, DOWNLOAD_EXAMPLE);
    let target = format!("{}{}", OUTPUT_DIR, DOWNLOAD_FILE);

    container
        .execute_expect("pip install wget", &ExitCodes::success())
        .await?;

    container
        .copy_into(&trainer_asset(DOWNLOAD_EXAMPLE), TRAINER_DIR)
        .await
        .context("copying the download example into the container")?;

    ensure!(
        container.probe_predicate(&Predicate::is_file(&script)).await?,
        "{} is not a file after copying",
        script
    );
    ensure!(
        !container.probe_predicate(&Predicate::file_exists(&target)).await?,
        "{} exists before the download",
        target
    );

    let out = output(
        container,
        &format!(
            "timeout {} python3 {} {} {}",
            IN_CONTAINER_TIMEOUT, script, DOWNLOAD_URL, OUTPUT_DIR
        ),
    )
    .await?;
    ensure!(out.contains("PASS"), "download example did not pass:\n{}", out);

    ensure!(
        container.probe_predicate(&Predicate::file_exists(&target)).await?,
        "{} missing after the download",
        target
    );
    Ok(())
}

/// Major version from TensorFlow's `__version__` output (last line wins)
pub fn tensorflow_major(version_output: &str) -> Option<u32> {
    version_output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()?
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// TensorFlow 2 installs and the trainer reaches its accuracy target
pub async fn tensorflow_training<R: ContainerRuntime>(container: &RunningContainer<R>) -> Result<()> {
    let trainer = format!("{}{}", TRAINER_DIR, TENSORFLOW_TRAINER);

    ensure!(
        container.probe_predicate(&Predicate::is_file(&trainer)).await?,
        "{} is not present in the image",
        trainer
    );

    container
        .execute_expect("grep -qi ' sse4' /proc/cpuinfo", &ExitCodes::success())
        .await
        .context("CPU lacks the SSE4 flags TensorFlow needs")?;

    container
        .execute_expect("pip install tensorflow", &ExitCodes::success())
        .await?;

    let version = output(
        container,
        "python3 -c 'import tensorflow as tf; print(tf.__version__)' 2>&1 | tail -1",
    )
    .await?;
    let major = tensorflow_major(&version)
        .with_context(|| format!("cannot parse TensorFlow version from '{}'", version))?;
    ensure!(major >= 2, "TensorFlow {} is older than 2.x", version);

    let out = output(
        container,
        &format!("timeout {} python3 {}", IN_CONTAINER_TIMEOUT, trainer),
    )
    .await?;
    ensure!(out.contains("accuracy"), "trainer printed no accuracy:\n{}", out);
    ensure!(out.contains("PASS"), "trainer did not pass:\n{}", out);
    Ok(())
}

/// Run `check` in a fresh container for each entry, stopping at the first
/// failure
///
/// Derived images are removed afterwards even when a check failed, so a
/// later run never picks up an image left behind by a broken one.
pub async fn check_each_fresh<R, F, Fut>(
    harness: &Harness<R>,
    entries: &[ImageEntry],
    check: F,
) -> Result<()>
where
    R: ContainerRuntime + ImageBuilder,
    F: Fn(Arc<RunningContainer<R>>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut outcome = Ok(());
    for entry in entries {
        outcome = harness
            .scoped(&entry.spec, &check)
            .await
            .with_context(|| format!("check failed on {}", entry.spec.name()));
        if outcome.is_err() {
            break;
        }
    }

    let removed = harness.remove_derived_images().await;
    match (outcome, removed) {
        (Err(e), Err(cleanup)) => {
            warn!("Removing derived images also failed: {}", cleanup);
            Err(e)
        }
        (outcome, removed) => {
            removed?;
            outcome
        }
    }
}
