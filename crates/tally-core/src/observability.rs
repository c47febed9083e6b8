//! Logging initialisation and span helpers.
//!
//! Every coordinator entry point runs inside a [`consolidation_span`], so each
//! log line carries the operation, the run key and (where relevant) the tenant.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

const ENV_LOG_FORMAT: &str = "TALLY_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads the format from `TALLY_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Reads the format with a custom environment source.
    ///
    /// `json` (any case) selects [`LogFormat::Json`]; anything else is pretty.
    #[must_use]
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match get_env(ENV_LOG_FORMAT) {
            Some(raw) if raw.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tally_flow=debug`)
///
/// # Example
///
/// ```rust
/// use tally_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        // Another subscriber may already be installed (tests, embedding hosts).
        drop(result);
    });
}

/// Creates a span for consolidation operations with standard fields.
///
/// # Example
///
/// ```rust
/// use tally_core::observability::consolidation_span;
///
/// let span = consolidation_span("append", "runs/01HX", Some("acme"));
/// let _guard = span.enter();
/// tracing::info!("appending tenant rows");
/// ```
#[must_use]
pub fn consolidation_span(operation: &str, run_key: &str, tenant: Option<&str>) -> Span {
    tracing::info_span!(
        "consolidation",
        op = operation,
        run_key = run_key,
        tenant = tenant.unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helper_creates_span() {
        let span = consolidation_span("join", "runs/abc", None);
        let _guard = span.enter();
        tracing::info!("message in span");
    }

    #[test]
    fn log_format_from_env() {
        assert_eq!(
            LogFormat::from_env_with(|_| Some("JSON".into())),
            LogFormat::Json
        );
        assert_eq!(
            LogFormat::from_env_with(|_| Some("text".into())),
            LogFormat::Pretty
        );
        assert_eq!(LogFormat::from_env_with(|_| None), LogFormat::Pretty);
    }
}
