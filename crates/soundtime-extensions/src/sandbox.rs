//! Isolated execution of extension code.
//!
//! The orchestration layer only sees the [`Sandbox`], [`EntryPoint`] and
//! [`ExtensionInstance`] traits. [`crate::wasm::WasmSandbox`] is the
//! production implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ExtensionApi;
use crate::error::ExtensionError;
use crate::logger::ExtensionLogger;
use crate::preferences::PreferenceGroup;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 50_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    /// Without WASI the mapped extension directory is unreachable.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: 50_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            memory_limit: lookup("EXTENSION_MEMORY_LIMIT_MB")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(64)
                * 1024
                * 1024,
            fuel_limit: lookup("EXTENSION_FUEL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(50_000_000),
            wasi_enabled: lookup("EXTENSION_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Environment ────────────────────────────────────────────────────────

/// Environment keys never passed into a sandbox.
pub const ENV_DENY_LIST: &[&str] = &[
    "FanartTVApiKey",
    "LastFmApiKey",
    "LastFmSecret",
    "SpotifyClientID",
    "SpotifyClientSecret",
    "YoutubeClientID",
    "YoutubeClientSecret",
    "GH_TOKEN",
];

pub fn is_denied_env_key(key: &str) -> bool {
    ENV_DENY_LIST.iter().any(|d| d.eq_ignore_ascii_case(key))
}

/// Drop deny-listed keys from `vars`.
pub fn filter_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| !is_denied_env_key(key))
        .collect()
}

// ─── Contracts ──────────────────────────────────────────────────────────

/// Everything a sandbox may expose to the code it runs.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub package_name: String,
    pub entry_path: PathBuf,
    /// The only host directory reachable from inside the sandbox.
    pub root: PathBuf,
    pub env: BTreeMap<String, String>,
    pub api: Arc<ExtensionApi>,
    pub logger: ExtensionLogger,
}

/// One factory an entry point offers.
///
/// Each field names a function exported by the module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryDescriptor {
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub register_user_preferences: Option<String>,
    #[serde(default)]
    pub register_preferences: Option<String>,
}

impl FactoryDescriptor {
    /// Preference hook to call, current name first.
    pub fn preference_hook(&self) -> Option<&str> {
        self.register_user_preferences
            .as_deref()
            .or(self.register_preferences.as_deref())
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Load `source` into a fresh isolated context.
    async fn evaluate(
        &self,
        source: Vec<u8>,
        context: SandboxContext,
    ) -> Result<Arc<dyn EntryPoint>, ExtensionError>;
}

/// A loaded, not yet instantiated extension module.
#[async_trait]
pub trait EntryPoint: Send + Sync {
    /// Factory descriptors, or `None` if the module exposes none.
    async fn descriptors(&self) -> Result<Option<Vec<FactoryDescriptor>>, ExtensionError>;

    async fn preferences(&self, export: &str) -> Result<Vec<PreferenceGroup>, ExtensionError>;

    async fn create(&self, export: &str) -> Result<Arc<dyn ExtensionInstance>, ExtensionError>;
}

/// A running extension.
#[async_trait]
pub trait ExtensionInstance: Send + Sync {
    fn has_method(&self, method: &str) -> bool;

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, ExtensionError>;
}

// ─── Tests ──────────────────────────────────────────────────────────────
