//! Image matrix: which Python images are checked, and how
//!
//! Plain base images are shared across checks. Checks that need the trainer
//! scripts run against a derived image that adds them, one fresh container
//! per check.

use bcicheck_core::config::HarnessConfig;
use bcicheck_core::errors::Result;
use bcicheck_core::harness::LifetimePolicy;
use bcicheck_core::image::{ContainerImageSpec, ImageRef, Overlay};
use std::fmt;
use std::path::PathBuf;

/// Working directory of trainer images
pub const WORK_DIR: &str = "/tmp/";
/// Trainer scripts inside trainer images
pub const TRAINER_DIR: &str = "/tmp/trainers/";
/// Scratch output directory inside trainer images
pub const OUTPUT_DIR: &str = "/tmp/output/";

pub const TENSORFLOW_TRAINER: &str = "tensorflow_examples.py";
pub const DOWNLOAD_EXAMPLE: &str = "communication_examples.py";

/// Python base image variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PythonVariant {
    Python36,
    Python39,
    Python310,
}

impl PythonVariant {
    pub const ALL: [PythonVariant; 3] = [Self::Python36, Self::Python39, Self::Python310];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Python36 => "3.6",
            Self::Python39 => "3.9",
            Self::Python310 => "3.10",
        }
    }

    /// `<registry>/python:<tag>`
    pub fn image_ref(&self, registry: &str) -> Result<ImageRef> {
        ImageRef::parse(&format!("{}/python:{}", registry, self.tag()))
    }
}

impl fmt::Display for PythonVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "python-{}", self.tag())
    }
}

/// One image under test
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub variant: PythonVariant,
    pub spec: ContainerImageSpec,
    pub policy: LifetimePolicy,
}

/// Directory holding the fixture files copied into containers
pub fn assets_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets")
}

/// Host path of a trainer script
pub fn trainer_asset(name: &str) -> PathBuf {
    assets_dir().join("trainers").join(name)
}

/// Overlay adding the trainer directory layout and the TensorFlow trainer
pub fn trainer_overlay() -> Overlay {
    Overlay::new(assets_dir())
        .workdir(WORK_DIR)
        .create_dir("trainers/")
        .create_dir("output/")
        .copy(format!("trainers/{}", TENSORFLOW_TRAINER), "trainers/")
}

/// Plain base images, shared across checks
pub fn base_images(config: &HarnessConfig) -> Result<Vec<ImageEntry>> {
    PythonVariant::ALL
        .iter()
        .map(|&variant| -> Result<ImageEntry> {
            let spec = ContainerImageSpec::new(variant.image_ref(config.registry())?)
                .with_name(variant.to_string());
            Ok(ImageEntry {
                variant,
                spec,
                policy: LifetimePolicy::Shared,
            })
        })
        .collect()
}

/// Base images with the trainer overlay, one container per check
pub fn trainer_images(config: &HarnessConfig) -> Result<Vec<ImageEntry>> {
    PythonVariant::ALL
        .iter()
        .map(|&variant| -> Result<ImageEntry> {
            let spec =
                ContainerImageSpec::derived(variant.image_ref(config.registry())?, trainer_overlay())
                    .with_name(format!("{}+trainers", variant));
            Ok(ImageEntry {
                variant,
                spec,
                policy: LifetimePolicy::PerTest,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcicheck_core::containerfile::ContainerfileGenerator;

    #[test]
    fn test_base_images() {
        let entries = base_images(&HarnessConfig::default()).unwrap();
        let refs: Vec<_> = entries.iter().map(|e| e.spec.base().to_string()).collect();
        assert_eq!(
            refs,
            vec![
                "registry.suse.com/bci/python:3.6",
                "registry.suse.com/bci/python:3.9",
                "registry.suse.com/bci/python:3.10",
            ]
        );
        assert!(entries.iter().all(|e| e.policy == LifetimePolicy::Shared));
        assert!(entries.iter().all(|e| !e.spec.needs_build()));
        assert_eq!(entries[2].spec.name(), "python-3.10");
    }

    #[test]
    fn test_trainer_images_use_registry_and_overlay() {
        let config = HarnessConfig {
            registry: "localhost:5000/bci/".to_string(),
            ..Default::default()
        };
        let entries = trainer_images(&config).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0].spec.base().as_str(),
            "localhost:5000/bci/python:3.6"
        );
        assert_eq!(entries[0].spec.name(), "python-3.6+trainers");
        assert!(entries.iter().all(|e| e.policy == LifetimePolicy::PerTest));
        assert!(entries.iter().all(|e| e.spec.needs_build()));
    }

    #[test]
    fn test_trainer_overlay_containerfile() {
        let base = PythonVariant::Python39
            .image_ref("registry.suse.com/bci")
            .unwrap();
        let overlay = trainer_overlay();
        let containerfile = ContainerfileGenerator::new(&base, &overlay)
            .generate()
            .unwrap();
        assert_eq!(
            containerfile,
            "FROM registry.suse.com/bci/python:3.9\n\
             WORKDIR /tmp/\n\
             RUN mkdir -p trainers/\n\
             RUN mkdir -p output/\n\
             COPY trainers/tensorflow_examples.py trainers/\n"
        );
    }

    #[test]
    fn test_assets_present() {
        assert!(trainer_asset(TENSORFLOW_TRAINER).is_file());
        assert!(trainer_asset(DOWNLOAD_EXAMPLE).is_file());
    }
}
