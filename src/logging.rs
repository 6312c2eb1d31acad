//! Logging setup for the gateway.
//!
//! One entry point: logs go to stderr unless `DATAGATE_LOG_FILE` routes
//! them to a file (useful when the process runs under a scheduler and
//! stderr is discarded). Verbosity follows `RUST_LOG` via `EnvFilter`.

use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{GatewayError, Result};

/// Initializes logging from the environment.
///
/// `DATAGATE_LOG_FILE=<path>` sends output to that file; an empty value
/// selects [`default_log_path`]. Unset means stderr.
pub fn init_from_env() -> Result<()> {
    match std::env::var("DATAGATE_LOG_FILE") {
        Ok(path) if !path.is_empty() => init(Some(Path::new(&path))),
        Ok(_) => init(Some(&default_log_path()?)),
        Err(_) => init(None),
    }
}

/// Initializes the global subscriber, writing to `log_file` when given
/// and stderr otherwise.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let outcome = match log_file {
        None => builder.try_init(),
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::config(format!(
                        "cannot create log directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            let file = std::fs::File::create(path).map_err(|e| {
                GatewayError::config(format!("cannot create log file {}: {e}", path.display()))
            })?;
            // No ANSI color codes in file output.
            builder.with_writer(file).with_ansi(false).try_init()
        }
    };

    outcome.map_err(|e| GatewayError::internal(format!("logging already initialized: {e}")))
}

/// Default log file, kept next to the gateway's other state
/// (`~/.data-connector/datagate.log`).
pub fn default_log_path() -> Result<PathBuf> {
    Ok(Config::state_dir()?.join("datagate.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_path_lives_in_state_dir() {
        let path = default_log_path().unwrap();
        assert_eq!(
            path.parent().and_then(|p| p.file_name()),
            Some(std::ffi::OsStr::new(".data-connector"))
        );
        assert_eq!(
            path.file_name(),
            Some(std::ffi::OsStr::new("datagate.log"))
        );
    }

    #[test]
    fn test_init_reports_bad_file_path() {
        // A directory as the log file target must surface a config
        // error, not panic.
        let dir = tempfile::tempdir().unwrap();
        let err = init(Some(dir.path())).unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }
}
