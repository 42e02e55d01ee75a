//! Structured logging setup (SPEC_FULL.md §6 ambient addition), grounded
//! on the teacher's `tracing_subscriber::fmt` initialization in its CLI
//! entry point, generalized into a library-safe `init` callers invoke
//! once at process startup.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs a global `tracing` subscriber from `config`, once per process.
/// Safe to call more than once (e.g. from several tests in the same
/// binary); only the first call takes effect.
pub fn init_tracing(config: &LoggingConfig) {
    INIT.get_or_init(|| {
        let result = if config.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(build_filter(&config.level))
                .json()
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(build_filter(&config.level))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("failed to install tracing subscriber: {err}");
        }
    });
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
