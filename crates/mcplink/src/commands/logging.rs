//! Logging initialization and configuration.
//!
//! Logs go to stderr so stdout stays free for command output, or to a file
//! in the platform log directory with `--log-file`.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "mcplink.log";

/// Filter used when `RUST_LOG` is unset.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "mcplink=debug,mcplink_client=debug"
    } else {
        "mcplink=info,mcplink_client=warn"
    }
}

/// Open `mcplink.log` under `dir` for appending, creating the directory.
fn open_log_file(dir: &Path) -> std::io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((path, file))
}

/// Initialize logging. `RUST_LOG` overrides the built-in filter.
///
/// With `to_file` the subscriber writes to the log directory and the file
/// path is returned. If the file cannot be opened a warning is printed and
/// logging falls back to stderr.
pub fn init_logging(verbose: bool, to_file: bool) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if to_file {
        match open_log_file(&get_log_dir()) {
            Ok((path, file)) => {
                builder.with_ansi(false).with_writer(file).init();
                return Some(path);
            }
            Err(e) => eprintln!("Warning: Could not open log file: {e}"),
        }
    }

    builder.with_writer(std::io::stderr).init();
    None
}

/// Platform log directory for mcplink.
pub fn get_log_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir().map(|home| home.join("Library/Logs/mcplink"));

    #[cfg(target_os = "linux")]
    let dir = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/state")))
        .map(|state| state.join("mcplink/logs"));

    #[cfg(target_os = "windows")]
    let dir = dirs::data_local_dir().map(|local| local.join("mcplink/logs"));

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    let dir: Option<PathBuf> = None;

    dir.unwrap_or_else(|| PathBuf::from(".mcplink/logs"))
}
