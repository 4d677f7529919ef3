//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal as _, sync::Once};

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

static SPOOL_LOG_ENV_VAR: &str = "SPOOL_LOG";

/// List of crates in the workspace.
const SPOOL_CRATES: &[&str] = &["common", "master_db", "spooler"];

pub fn register_logger() {
    // Since we also use this function to enable logging in tests, wrap it in
    // `Once` to prevent multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Parse directives from RUST_LOG
        let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
        let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
        let mut env_filter = log_filter.parse(&directive_string).unwrap();

        let spool_log_level =
            std::env::var(SPOOL_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

        for crate_name in SPOOL_CRATES {
            // Add directives for each crate in SPOOL_CRATES, if not overriden by RUST_LOG
            if !directive_string.contains(&format!("{crate_name}=")) {
                env_filter = env_filter
                    .add_directive(format!("{crate_name}={spool_log_level}").parse().unwrap());
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
    });
}
