use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "taskmate.log";

/// Installs the global subscriber. With a `log_dir` output goes to
/// `<log_dir>/taskmate.log`, otherwise to stderr. `RUST_LOG` directives are
/// honoured on top of the chosen level.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Result<(), InfraError> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let installed = match log_dir {
        Some(log_dir) => {
            fs::create_dir_all(log_dir)?;
            let log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_dir.join(LOG_FILE))?;
            tracing_subscriber::fmt()
                .with_writer(log_file)
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init(),
    };
    installed.map_err(|error| {
        InfraError::InvalidConfig(format!("logging already initialised: {error}"))
    })?;

    info!(verbose, "logging initialised");
    Ok(())
}
