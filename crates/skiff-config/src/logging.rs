//! Logging setup and per-component event macros.
//!
//! Every log line carries a `component` field (SHARE, SCAN or LIST)
//! so one subsystem can be filtered out of a combined stream without
//! touching targets or module paths. The macros pre-fill that field;
//! everything else is plain `tracing`.

use tracing_subscriber::EnvFilter;

/// Component identifiers for log filtering.
pub mod component {
    pub const SHARE: &str = "SHARE";
    pub const SCAN: &str = "SCAN";
    pub const LIST: &str = "LIST";
}

/// Verbosity requested by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The env-filter directive used when `RUST_LOG` is unset.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// Shared expander behind the per-component macros. Not public API.
#[doc(hidden)]
#[macro_export]
macro_rules! __component_event {
    ($level:ident, $component:literal, $msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::$level!(component = $component, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_share_info {
    ($($args:tt)*) => { $crate::__component_event!(info, "SHARE", $($args)*) };
}

#[macro_export]
macro_rules! log_share_warn {
    ($($args:tt)*) => { $crate::__component_event!(warn, "SHARE", $($args)*) };
}

#[macro_export]
macro_rules! log_scan_info {
    ($($args:tt)*) => { $crate::__component_event!(info, "SCAN", $($args)*) };
}

#[macro_export]
macro_rules! log_scan_debug {
    ($($args:tt)*) => { $crate::__component_event!(debug, "SCAN", $($args)*) };
}

#[macro_export]
macro_rules! log_list_info {
    ($($args:tt)*) => { $crate::__component_event!(info, "LIST", $($args)*) };
}

#[macro_export]
macro_rules! log_list_debug {
    ($($args:tt)*) => { $crate::__component_event!(debug, "LIST", $($args)*) };
}

/// Install the global subscriber. An explicit `RUST_LOG` wins over
/// the requested level. Only the application entry point should call
/// this, and only once.
pub fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directives() {
        assert_eq!(LogLevel::Error.directive(), "error");
        assert_eq!(LogLevel::Debug.directive(), "debug");
        assert_eq!(LogLevel::default().directive(), "info");
    }

    #[test]
    fn test_component_names() {
        assert_eq!(component::SHARE, "SHARE");
        assert_eq!(component::SCAN, "SCAN");
        assert_eq!(component::LIST, "LIST");
    }

    #[test]
    fn test_macros_expand_without_subscriber() {
        // Events with no subscriber installed are simply dropped.
        log_share_info!("share event", count = 1);
        log_scan_debug!("scan event");
        log_list_info!("list event", user = "nobody",);
    }
}
