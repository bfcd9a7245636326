//! Logging initialization
//!
//! One process-wide setup, performed by the embedding application at
//! startup. All crate modules log through the `log` facade only.

use env_logger::{Builder, Env, Target};

use crate::config::LoggingConfig;

/// Initialize the process-wide logger.
///
/// The configured level is the default filter; `RUST_LOG` overrides it.
/// Safe to call more than once — later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.level.as_str()));
    if config.output == "stderr" {
        builder.target(Target::Stderr);
    } else {
        builder.target(Target::Stdout);
    }
    let _ = builder.try_init();
}
