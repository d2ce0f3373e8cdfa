//! Structured logging utilities for sandfs components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use sandfs_config::logging::*;
//!
//! log_pack_info!("Batch written", entries = 12);
//! log_links_debug!("Chain resolved", hops = 3);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const PACK: &'static str = "PACK";
    pub const LINKS: &'static str = "LINKS";
    pub const LOCK: &'static str = "LOCK";
    pub const BACKEND: &'static str = "BACKEND";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === PACK logging macros ===

#[macro_export]
macro_rules! log_pack_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "PACK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_pack_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PACK", $($key = $value,)* $msg)
    };
}

// === LINKS logging macros ===

#[macro_export]
macro_rules! log_links_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "LINKS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_links_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LINKS", $($key = $value,)* $msg)
    };
}

// === BACKEND logging macros ===

#[macro_export]
macro_rules! log_backend_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "BACKEND", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::PACK, "PACK");
        assert_eq!(Component::LINKS, "LINKS");
        assert_eq!(Component::BACKEND, "BACKEND");
    }
}
