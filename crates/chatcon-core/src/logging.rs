use std::{
    fs::{self, File, OpenOptions},
    path::Path,
    sync::Mutex,
};

use crate::Result;

/// Initialize tracing for a chatcon binary.
///
/// `default_level` applies to our crates and everything else; `RUST_LOG`
/// overrides it entirely. With `log_dir` set, every event is also appended
/// (without colours) to `<log_dir>/<service_name>.log`. The file is never
/// rotated here; leave that to logrotate or the service manager.
pub fn init(service_name: &str, default_level: &str, log_dir: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},chatcon={default_level},chatcon_core={default_level},{}={default_level}",
            service_name.replace('-', "_")
        ))
    });

    let file_layer = match log_dir {
        Some(dir) => Some(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(dir, service_name)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_ansi(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Config(format!("failed to install log subscriber: {e}")))?;

    Ok(())
}

/// Open `<dir>/<service_name>.log` for appending, creating `dir` if needed.
pub fn open_log_file(dir: &Path, service_name: &str) -> Result<File> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{service_name}.log")))?;
    Ok(file)
}
