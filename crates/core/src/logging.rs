//! Logging setup
//!
//! Structured logging through `tracing`, written to stderr so command output
//! captured by tests stays separate. Text and JSON formats are selected at
//! runtime.
//!
//! ## Environment Variables
//!
//! * `BCICHECK_LOG` - logging filter (falls back to `RUST_LOG`, then `info`)
//! * `BCICHECK_LOG_FORMAT` - `json` for JSON lines, anything else for text
//! * `BCICHECK_LOG_SPAN_EVENTS` - comma separated span events
//!   (`none,new,close,enter,exit,active,full`)

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize logging; later calls are no-ops.
///
/// `format` overrides `BCICHECK_LOG_FORMAT` when given.
///
/// ```rust
/// bcicheck_core::logging::init(Some("json")).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var("BCICHECK_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        // try_init: a test binary may already have installed a global subscriber
        let installed = match effective_format {
            "json" => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_events(span_events)
                        .with_writer(io::stderr),
                )
                .with(filter)
                .try_init(),
            _ => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_span_events(span_events)
                        .with_writer(io::stderr),
                )
                .with(filter)
                .try_init(),
        };

        if installed.is_ok() {
            tracing::debug!("Logging initialized with format: {}", effective_format);
        }
    });

    Ok(())
}

fn create_env_filter() -> EnvFilter {
    if let Ok(spec) = std::env::var("BCICHECK_LOG") {
        EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            eprintln!("Invalid BCICHECK_LOG specification '{}', using 'info'", spec);
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Span lifecycle events: env var first, else NEW|CLOSE for json and none for text
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var("BCICHECK_LOG_SPAN_EVENTS") {
        return parse_span_events(&raw);
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    let mut acc = FmtSpan::NONE;
    for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
        acc |= match token.as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        };
    }
    acc
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmt::format::FmtSpan;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_multiple_calls_safe() {
        assert!(init(None).is_ok());
        assert!(init(Some("json")).is_ok());
        assert!(init(Some("invalid")).is_ok());
        assert!(is_initialized());
    }

    #[test]
    fn test_parse_span_events() {
        assert_eq!(parse_span_events("none"), FmtSpan::NONE);
        assert_eq!(parse_span_events("new, close"), FmtSpan::NEW | FmtSpan::CLOSE);
        assert_eq!(parse_span_events("FULL"), FmtSpan::FULL);
        assert_eq!(parse_span_events("bogus|enter"), FmtSpan::ENTER);
    }

    #[test]
    #[serial]
    fn test_span_events_default_by_format() {
        std::env::remove_var("BCICHECK_LOG_SPAN_EVENTS");
        assert_eq!(span_events_for_format("text"), FmtSpan::NONE);
        assert_eq!(
            span_events_for_format("json"),
            FmtSpan::NEW | FmtSpan::CLOSE
        );

        std::env::set_var("BCICHECK_LOG_SPAN_EVENTS", "exit");
        assert_eq!(span_events_for_format("json"), FmtSpan::EXIT);
        std::env::remove_var("BCICHECK_LOG_SPAN_EVENTS");
    }

    #[test]
    #[serial]
    fn test_env_filter_with_env_vars() {
        std::env::set_var("BCICHECK_LOG", "bcicheck_core=trace");
        let _filter = create_env_filter();
        std::env::set_var("BCICHECK_LOG", "invalid_spec_@@=");
        let _filter = create_env_filter();
        std::env::remove_var("BCICHECK_LOG");
    }
}
