//! Process configuration: startup arguments plus environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use soundtime_extensions::SandboxConfig;

use crate::error::HostError;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DISCOVERY_MAX_RETRIES: u32 = 3;

/// Name of the log file written under `-logPath`.
pub const LOG_FILE_NAME: &str = "extension_host.log";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Socket (unix) or named pipe (windows) shared with the host application.
    pub ipc_path: PathBuf,
    pub extension_paths: Vec<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub install_path: Option<PathBuf>,
    /// `None` disables the correlation timeout.
    pub request_timeout: Option<Duration>,
    pub discovery_max_retries: u32,
    pub debug_logging: bool,
    pub sandbox: SandboxConfig,
}

impl HostConfig {
    /// Build config from process arguments and environment variables.
    pub fn from_args<I, S>(args: I) -> Result<Self, HostError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_args_with(args, |key| std::env::var(key).ok())
    }

    /// Like [`from_args`](Self::from_args), reading variables through `lookup`.
    pub fn from_args_with<I, S>(args: I, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut flags = parse_args(args);
        let ipc_path = flags
            .remove("ipcPath")
            .and_then(|values| values.into_iter().next())
            .map(PathBuf::from)
            .ok_or_else(|| HostError::Config("missing -ipcPath".into()))?;

        let timeout_secs = lookup("EXTENSION_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Self {
            ipc_path,
            extension_paths: flags
                .remove("extensionPath")
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            log_path: first_path(&mut flags, "logPath"),
            install_path: first_path(&mut flags, "installPath"),
            request_timeout: request_timeout(timeout_secs),
            discovery_max_retries: lookup("EXTENSION_DISCOVERY_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DISCOVERY_MAX_RETRIES),
            debug_logging: lookup("DEBUG_LOGGING").is_some_and(|v| !v.is_empty()),
            sandbox: SandboxConfig::from_lookup(&lookup),
        })
    }

    /// Default filter directive when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        if self.debug_logging {
            "debug"
        } else {
            "info"
        }
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_path.as_ref().map(|p| p.join(LOG_FILE_NAME))
    }
}

fn first_path(flags: &mut HashMap<String, Vec<String>>, key: &str) -> Option<PathBuf> {
    flags
        .remove(key)
        .and_then(|values| values.into_iter().next())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn request_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Collect `-flag value...` pairs. Every value up to the next `-flag`
/// belongs to it. Values before the first flag are ignored.
pub fn parse_args<I, S>(args: I) -> HashMap<String, Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut flags: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;
    for arg in args.into_iter().map(Into::into) {
        match arg.strip_prefix('-') {
            Some(name) if !name.is_empty() => {
                flags.entry(name.to_string()).or_default();
                current = Some(name.to_string());
            }
            _ => {
                if let Some(name) = &current {
                    flags.entry(name.clone()).or_default().push(arg);
                }
            }
        }
    }
    flags
}
