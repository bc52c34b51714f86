use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use soundtime_extensions::LogLevel;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use crate::config::HostConfig;
use crate::dispatcher::LogLevelSetter;
use crate::error::HostError;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured default. The returned setter swaps
/// the filter at runtime.
pub fn init(config: &HostConfig) -> Result<LogLevelSetter, HostError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.default_log_level()));
    let (filter, handle) = reload::Layer::new(filter);

    let file_layer = match config.log_file() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| HostError::Config(format!("failed to install logger: {e}")))?;

    Ok(Arc::new(move |level: LogLevel| {
        handle
            .reload(EnvFilter::new(level.as_str()))
            .map_err(|e| HostError::Config(format!("failed to change log level: {e}")))?;
        tracing::info!(level = level.as_str(), "log level changed");
        Ok(())
    }))
}
