//! Per-extension logging.
//!
//! Console output produced inside a sandbox never reaches the process
//! stdout. It is re-emitted through `tracing` on the `extension` target,
//! tagged with the package name.

use serde::Deserialize;

/// Maximum log message length accepted from extensions.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strip control characters (except newline/tab) and cap the length.
pub fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    #[serde(alias = "log")]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level name as understood by `tracing` filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logger handed to one extension's sandbox.
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    package_name: String,
}

impl ExtensionLogger {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let msg = sanitize_log_message(message);
        let extension = self.package_name.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(target: "extension", %extension, "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "extension", %extension, "{msg}"),
            LogLevel::Info => tracing::info!(target: "extension", %extension, "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "extension", %extension, "{msg}"),
            LogLevel::Error => tracing::error!(target: "extension", %extension, "{msg}"),
        }
    }
}
