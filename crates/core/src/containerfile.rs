//! Containerfile generation for derived images
//!
//! Renders a base image plus an [`Overlay`] into Containerfile text and
//! computes a content-addressed tag for the result, so the same overlay over
//! the same base maps to one derived image.

use crate::errors::{BuildError, Result};
use crate::image::{ImageRef, Overlay, OverlayStep};
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use tracing::{debug, instrument};

/// Repository used for derived image tags
pub const DERIVED_REPOSITORY: &str = "bcicheck-derived";

/// Generates Containerfiles for overlays
#[derive(Debug)]
pub struct ContainerfileGenerator<'a> {
    base: &'a ImageRef,
    overlay: &'a Overlay,
    base_id: Option<&'a str>,
}

impl<'a> ContainerfileGenerator<'a> {
    pub fn new(base: &'a ImageRef, overlay: &'a Overlay) -> Self {
        Self {
            base,
            overlay,
            base_id: None,
        }
    }

    /// Pin the tag to the local id of the base image, so a re-pulled base
    /// yields a new derived tag
    pub fn with_base_id(mut self, base_id: &'a str) -> Self {
        self.base_id = Some(base_id);
        self
    }

    /// Generate the complete Containerfile
    #[instrument(skip(self), fields(base = %self.base))]
    pub fn generate(&self) -> Result<String> {
        debug!(
            "Generating Containerfile with {} overlay steps",
            self.overlay.steps().len()
        );

        let mut containerfile = format!("FROM {}\n", self.base);
        for step in self.overlay.steps() {
            containerfile.push_str(&Self::render_step(step)?);
            containerfile.push('\n');
        }

        Ok(containerfile)
    }

    /// Tag of the image produced by this Containerfile.
    ///
    /// The hash covers the rendered text, the base image id when known, and
    /// the content of every copied file, so editing a copied file yields a
    /// new tag.
    pub fn derived_tag(&self) -> Result<ImageRef> {
        let mut hasher = Sha256::new();
        hasher.update(self.generate()?.as_bytes());
        if let Some(base_id) = self.base_id {
            hasher.update(base_id.as_bytes());
        }

        for step in self.overlay.steps() {
            if let OverlayStep::Copy { source, .. } = step {
                let path = self.overlay.context_dir().join(source);
                if path.is_file() {
                    let content = std::fs::read(&path).map_err(|e| BuildError::Context {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                    hasher.update(&content);
                }
            }
        }

        let hex: String = hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect();
        ImageRef::parse(&format!("{}:{}", DERIVED_REPOSITORY, hex))
    }

    fn render_step(step: &OverlayStep) -> Result<String> {
        let line = match step {
            OverlayStep::WorkDir(path) => format!("WORKDIR {}", non_empty(path, "WORKDIR")?),
            OverlayStep::CreateDir(path) => {
                format!("RUN mkdir -p {}", shell_words::quote(non_empty(path, "mkdir")?))
            }
            OverlayStep::Copy {
                source,
                destination,
            } => {
                let source = Self::context_relative(source)?;
                format!("COPY {} {}", source, non_empty(destination, "COPY")?)
            }
            OverlayStep::Env { key, value } => {
                if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '=') {
                    return Err(BuildError::InvalidStep {
                        message: format!("invalid environment variable name '{}'", key),
                    }
                    .into());
                }
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("ENV {}=\"{}\"", key, escaped)
            }
            OverlayStep::Run(command) => format!("RUN {}", non_empty(command, "RUN")?),
        };
        Ok(line)
    }

    /// Copy sources must stay inside the build context
    fn context_relative(source: &Path) -> Result<String> {
        let escapes = source.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || source.as_os_str().is_empty() {
            return Err(BuildError::InvalidStep {
                message: format!(
                    "copy source '{}' must be a relative path inside the overlay context",
                    source.display()
                ),
            }
            .into());
        }
        Ok(source.to_string_lossy().replace('\\', "/"))
    }
}

fn non_empty<'s>(value: &'s str, what: &str) -> Result<&'s str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BuildError::InvalidStep {
            message: format!("{} argument cannot be empty", what),
        }
        .into());
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HarnessError;

    fn base() -> ImageRef {
        ImageRef::parse("registry.suse.com/bci/python:3.10").unwrap()
    }

    #[test]
    fn test_generate_trainer_overlay() {
        let overlay = Overlay::new("assets")
            .workdir("/tmp/")
            .create_dir("trainers/")
            .create_dir("output/")
            .copy("trainers/tensorflow_examples.py", "trainers/");
        let base = base();
        let containerfile = ContainerfileGenerator::new(&base, &overlay)
            .generate()
            .unwrap();

        assert_eq!(
            containerfile,
            "FROM registry.suse.com/bci/python:3.10\n\
             WORKDIR /tmp/\n\
             RUN mkdir -p trainers/\n\
             RUN mkdir -p output/\n\
             COPY trainers/tensorflow_examples.py trainers/\n"
        );
    }

    #[test]
    fn test_env_and_run_rendering() {
        let overlay = Overlay::new(".")
            .env("GREETING", "say \"hi\"")
            .run("zypper -n in iproute2");
        let base = base();
        let containerfile = ContainerfileGenerator::new(&base, &overlay)
            .generate()
            .unwrap();

        assert!(containerfile.contains("ENV GREETING=\"say \\\"hi\\\"\"\n"));
        assert!(containerfile.contains("RUN zypper -n in iproute2\n"));
    }

    #[test]
    fn test_copy_source_cannot_escape_context() {
        let base = base();
        for source in ["../secret", "/etc/passwd", ""] {
            let overlay = Overlay::new(".").copy(source, "/tmp/");
            let err = ContainerfileGenerator::new(&base, &overlay)
                .generate()
                .unwrap_err();
            assert!(
                matches!(err, HarnessError::Build(BuildError::InvalidStep { .. })),
                "{}",
                source
            );
        }
    }

    #[test]
    fn test_invalid_env_key() {
        let base = base();
        let overlay = Overlay::new(".").env("A B", "1");
        assert!(ContainerfileGenerator::new(&base, &overlay)
            .generate()
            .is_err());
    }

    #[test]
    fn test_derived_tag_is_content_addressed() {
        let base = base();
        let a = Overlay::new(".").create_dir("/a");
        let b = Overlay::new("elsewhere").create_dir("/a");
        let c = Overlay::new(".").create_dir("/c");

        let tag_a = ContainerfileGenerator::new(&base, &a).derived_tag().unwrap();
        let tag_b = ContainerfileGenerator::new(&base, &b).derived_tag().unwrap();
        let tag_c = ContainerfileGenerator::new(&base, &c).derived_tag().unwrap();

        assert_eq!(tag_a, tag_b);
        assert_ne!(tag_a, tag_c);
        assert!(tag_a.as_str().starts_with("bcicheck-derived:"));
        assert_eq!(tag_a.as_str().len(), "bcicheck-derived:".len() + 16);
    }

    #[test]
    fn test_derived_tag_tracks_copied_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('v1')\n").unwrap();
        let base = base();
        let overlay = Overlay::new(dir.path()).copy("app.py", "/tmp/");

        let first = ContainerfileGenerator::new(&base, &overlay)
            .derived_tag()
            .unwrap();
        std::fs::write(dir.path().join("app.py"), "print('v2')\n").unwrap();
        let second = ContainerfileGenerator::new(&base, &overlay)
            .derived_tag()
            .unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_derived_tag_tracks_base_image_id() {
        let base = base();
        let overlay = Overlay::new(".").create_dir("/a");

        let unpinned = ContainerfileGenerator::new(&base, &overlay)
            .derived_tag()
            .unwrap();
        let old = ContainerfileGenerator::new(&base, &overlay)
            .with_base_id("sha256:1111")
            .derived_tag()
            .unwrap();
        let repulled = ContainerfileGenerator::new(&base, &overlay)
            .with_base_id("sha256:2222")
            .derived_tag()
            .unwrap();

        assert_ne!(old, repulled);
        assert_ne!(unpinned, old);
    }
}
