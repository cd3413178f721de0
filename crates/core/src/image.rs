//! Image references, overlays and container image specs
//!
//! A [`ContainerImageSpec`] names a base image and optionally an [`Overlay`]:
//! an ordered list of declarative build steps layered onto the base to
//! produce a derived image. Specs are immutable once constructed.

use crate::errors::{HarnessError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Validated image reference: `[registry/][namespace/]name[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageRef(String);

impl ImageRef {
    /// Parse and validate an image reference
    pub fn parse(reference: &str) -> Result<Self> {
        validate_image_reference(reference)?;
        Ok(Self(reference.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageRef {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(message: String) -> HarnessError {
    HarnessError::InvalidArgument { message }
}

/// Validates an image reference according to registry naming rules.
///
/// - Registry (first component containing `.` or `:`) is accepted as host[:port]
/// - Repository components are lowercase alphanumerics, dots, hyphens, underscores
/// - Tag is at most 128 characters and cannot start with `.` or `-`
/// - Digest must start with `sha256:` or `sha512:`
pub fn validate_image_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(invalid("Image reference cannot be empty".to_string()));
    }

    let (name_part, digest) = match reference.rsplit_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (reference, None),
    };

    if let Some(digest) = digest {
        if !digest.starts_with("sha256:") && !digest.starts_with("sha512:") {
            return Err(invalid(format!(
                "Image digest '{}' must start with 'sha256:' or 'sha512:'",
                digest
            )));
        }
    }

    // A ':' followed by a '/' belongs to a registry port, not a tag
    let (name_section, tag) = match name_part.rsplit_once(':') {
        Some((before, after)) if !after.contains('/') => (before, Some(after)),
        _ => (name_part, None),
    };

    if let Some(tag) = tag {
        if tag.is_empty() {
            return Err(invalid("Image tag after ':' cannot be empty".to_string()));
        }
        if tag.len() > 128 {
            return Err(invalid(format!(
                "Image tag '{}' exceeds maximum length of 128 characters",
                tag
            )));
        }
        if let Some(ch) = tag
            .chars()
            .find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '-' | '_'))
        {
            return Err(invalid(format!(
                "Image tag '{}' contains invalid character '{}'",
                tag, ch
            )));
        }
        if tag.starts_with('.') || tag.starts_with('-') {
            return Err(invalid(format!(
                "Image tag '{}' cannot start with '.' or '-'",
                tag
            )));
        }
    }

    if name_section.is_empty() {
        return Err(invalid("Image name cannot be empty".to_string()));
    }

    for (idx, part) in name_section.split('/').enumerate() {
        if part.is_empty() {
            return Err(invalid(format!(
                "Image reference '{}' contains empty component",
                reference
            )));
        }

        if idx == 0 && (part.contains('.') || part.contains(':')) {
            continue;
        }

        if let Some(ch) = part.chars().find(|ch| {
            !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && !matches!(ch, '.' | '-' | '_')
        }) {
            return Err(invalid(format!(
                "Image name component '{}' contains invalid character '{}'",
                part, ch
            )));
        }

        let is_separator = |c: char| matches!(c, '.' | '-' | '_');
        if part.starts_with(is_separator) || part.ends_with(is_separator) {
            return Err(invalid(format!(
                "Image name component '{}' cannot start or end with '.', '-', or '_'",
                part
            )));
        }
    }

    Ok(())
}

/// One declarative build action of an overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayStep {
    /// Set the working directory for later steps and for the container
    WorkDir(String),
    /// Create a directory (relative paths resolve against the working directory)
    CreateDir(String),
    /// Copy a file from the overlay context into the image
    Copy {
        /// Path relative to the overlay's context directory
        source: PathBuf,
        /// Destination inside the image
        destination: String,
    },
    /// Set an environment variable
    Env { key: String, value: String },
    /// Run a setup command at build time
    Run(String),
}

/// Ordered build steps plus the host directory `Copy` sources resolve against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    context_dir: PathBuf,
    steps: Vec<OverlayStep>,
}

impl Overlay {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            steps: Vec::new(),
        }
    }

    pub fn workdir(mut self, path: impl Into<String>) -> Self {
        self.steps.push(OverlayStep::WorkDir(path.into()));
        self
    }

    pub fn create_dir(mut self, path: impl Into<String>) -> Self {
        self.steps.push(OverlayStep::CreateDir(path.into()));
        self
    }

    pub fn copy(mut self, source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        self.steps.push(OverlayStep::Copy {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.steps.push(OverlayStep::Env {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.steps.push(OverlayStep::Run(command.into()));
        self
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    pub fn steps(&self) -> &[OverlayStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Base image plus optional overlay; consumed to launch a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImageSpec {
    name: String,
    base: ImageRef,
    overlay: Option<Overlay>,
}

impl ContainerImageSpec {
    /// Spec for a plain base image, named after the reference
    pub fn new(base: ImageRef) -> Self {
        Self {
            name: base.to_string(),
            base,
            overlay: None,
        }
    }

    /// Spec for an image derived from `base` through `overlay`
    pub fn derived(base: ImageRef, overlay: Overlay) -> Self {
        Self {
            name: format!("{}+overlay", base),
            base,
            overlay: Some(overlay),
        }
    }

    /// Rename the spec (names key shared containers and show up in logs)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &ImageRef {
        &self.base
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    /// True when an overlay with at least one step must be built before use
    pub fn needs_build(&self) -> bool {
        self.overlay.as_ref().is_some_and(|o| !o.is_empty())
    }
}
