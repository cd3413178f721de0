//! Shared helpers for the container-backed tests.

#![allow(dead_code)]

use bcicheck_core::config::HarnessConfig;
use bcicheck_core::docker::CliRuntime;
use bcicheck_core::harness::Harness;
use bcicheck_core::logging;
use std::sync::Arc;

/// Helper to skip tests that need network access beyond pulling images.
///
/// Returns `true` (skip) unless `BCICHECK_NETWORK_TESTS` is set.
pub fn skip_if_no_network_tests() -> bool {
    if std::env::var("BCICHECK_NETWORK_TESTS").is_err() {
        eprintln!("Skipping network test - set BCICHECK_NETWORK_TESTS=1 to enable");
        return true;
    }
    false
}

/// Check if the configured runtime daemon answers
fn is_runtime_available(runtime_path: &str) -> bool {
    std::process::Command::new(runtime_path)
        .arg("info")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Harness over the configured runtime, or `None` (with a message) when no
/// runtime is reachable
pub fn harness(test_name: &str) -> Option<Arc<Harness<CliRuntime>>> {
    let _ = logging::init(None);

    let config = match HarnessConfig::load() {
        Ok(config) => config,
        Err(e) => panic!("invalid harness configuration: {}", e),
    };
    let runtime = config.create_runtime();
    if !is_runtime_available(runtime.runtime_path()) {
        eprintln!(
            "Skipping {}: {} not available",
            test_name,
            runtime.runtime_path()
        );
        return None;
    }

    Some(Arc::new(Harness::new(runtime, config)))
}
