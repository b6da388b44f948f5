//! # Logging Initialization
//!
//! Grounded on the teacher's `utils::logging::init_logging`: a `std::sync::Once`
//! guarded global `tracing` subscriber, driven by `RUST_LOG` with a crate-specific
//! fallback filter. Unlike the teacher this crate is a library embedded in someone
//! else's process, so it has no file-logging mode of its own — it only installs a
//! stderr subscriber, and only if the caller opts in by calling [`init`] (nothing
//! here runs implicitly).

use std::path::Path;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber reading `RUST_LOG`, falling back to
/// `info` for third-party crates and `debug` for this one. Safe to call more than
/// once — only the first call takes effect.
pub fn init() {
    init_with(default_filter());
}

/// As [`init`], but with a caller-supplied filter instead of the `RUST_LOG` default.
pub fn init_with(filter: EnvFilter) {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(true))
            .init();
    });
}

/// Installs a global subscriber that writes to a daily rolling file under `dir`
/// instead of stderr (§2.1): for a host process that embeds this engine
/// long-running and wants a log trail rather than stderr noise. The returned
/// guard owns the non-blocking writer's background flush thread — drop it only
/// at process exit, or buffered lines are lost.
///
/// # Errors
/// Returns an error if `dir` cannot be created.
pub fn init_to_file(dir: impl AsRef<Path>, file_name_prefix: &str) -> std::io::Result<WorkerGuard> {
    init_to_file_with(dir, file_name_prefix, default_filter())
}

/// As [`init_to_file`], but with a caller-supplied filter.
pub fn init_to_file_with(
    dir: impl AsRef<Path>,
    file_name_prefix: &str,
    filter: EnvFilter,
) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(dir.as_ref())?;
    let appender = tracing_appender::rolling::daily(dir, file_name_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
    });
    Ok(guard)
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,xec=debug"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn init_to_file_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let _guard = init_to_file(&log_dir, "xec").unwrap();
        assert!(log_dir.is_dir());
    }
}
