//! Extism-backed sandbox.
//!
//! Each extension entry is a WASM module run by its own `extism::Plugin`.
//! The module must export `extension_descriptors`, returning a JSON array of
//! [`FactoryDescriptor`]s whose fields name further exports. Guests reach
//! the host through a single imported function, `soundtime_host_call`.
//!
//! Plugin calls are synchronous and run on the blocking pool. The host
//! function re-enters the runtime with `Handle::block_on`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use extism::{host_fn, Manifest, Plugin, PluginBuilder, UserData, Wasm, PTR};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::api::{Callable, Callback, ExtensionApi};
use crate::error::ExtensionError;
use crate::host_functions;
use crate::logger::ExtensionLogger;
use crate::preferences::{parse_preferences, PreferenceGroup};
use crate::sandbox::{
    EntryPoint, ExtensionInstance, FactoryDescriptor, Sandbox, SandboxConfig, SandboxContext,
};

/// WASM magic bytes: `\0asm`.
const WASM_MAGIC: &[u8] = b"\0asm";

/// Import namespaces an extension module may use.
pub const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",
    "extism:host/env",
    "extism:host/user",
    "wasi_snapshot_preview1",
    "wasi_unstable",
];

/// Export every extension module must provide.
pub const DESCRIPTORS_EXPORT: &str = "extension_descriptors";

/// Name of the imported host function.
pub const HOST_CALL_FUNCTION: &str = "soundtime_host_call";

/// Guest path of the extension's own directory.
pub const GUEST_ROOT: &str = "/extension";

// ─── Validation ─────────────────────────────────────────────────────────

/// Check magic bytes and imports, returning the exported function names.
pub fn validate_module(bytes: &[u8]) -> Result<HashSet<String>, ExtensionError> {
    use wasmparser::{ExternalKind, Parser, Payload};

    if bytes.len() < 4 || &bytes[..4] != WASM_MAGIC {
        return Err(ExtensionError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    let mut exports = HashSet::new();
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload
            .map_err(|e| ExtensionError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        match payload {
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| {
                        ExtensionError::WasmValidation(format!("failed to read import: {e}"))
                    })?;
                    if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                        return Err(ExtensionError::WasmValidation(format!(
                            "unauthorized import namespace: '{}' (function: '{}'); \
                             allowed namespaces: {:?}",
                            import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                        )));
                    }
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| {
                        ExtensionError::WasmValidation(format!("failed to read export: {e}"))
                    })?;
                    if export.kind == ExternalKind::Func {
                        exports.insert(export.name.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(exports)
}

fn classify_call_error(package: &str, error: extism::Error) -> ExtensionError {
    let msg = error.to_string();
    if msg.contains("fuel") {
        ExtensionError::FuelExhausted(package.to_string())
    } else if msg.contains("memory") {
        ExtensionError::MemoryExceeded(package.to_string())
    } else {
        ExtensionError::Invocation(msg)
    }
}

fn decode_output(bytes: &[u8]) -> Result<Value, ExtensionError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(bytes)?)
}

// ─── Host state ─────────────────────────────────────────────────────────

/// Data reachable from the host function of one plugin.
struct HostState {
    api: Arc<ExtensionApi>,
    logger: ExtensionLogger,
    handle: Handle,
    plugin: Weak<PluginHandle>,
}

host_fn!(soundtime_host_call(user_data: HostState; request: String) -> String {
    let state = user_data.get()?;
    let (api, logger, handle, plugin) = {
        let state = state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.api.clone(), state.logger.clone(), state.handle.clone(), state.plugin.clone())
    };
    let callback_for = move |export: &str| -> Callback {
        Arc::new(WasmCallback {
            plugin: plugin.clone(),
            export: export.to_string(),
        })
    };
    Ok(handle.block_on(host_functions::handle_request(&request, &api, &logger, &callback_for)))
});

// ─── Sandbox ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WasmSandbox {
    config: SandboxConfig,
}

impl WasmSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    async fn evaluate(
        &self,
        source: Vec<u8>,
        context: SandboxContext,
    ) -> Result<Arc<dyn EntryPoint>, ExtensionError> {
        let exports = validate_module(&source)?;
        if !exports.contains(DESCRIPTORS_EXPORT) {
            return Err(ExtensionError::InvalidEntryPoint(format!(
                "{} does not export {DESCRIPTORS_EXPORT}",
                context.entry_path.display()
            )));
        }

        let user_data = UserData::new(HostState {
            api: context.api.clone(),
            logger: context.logger.clone(),
            handle: Handle::current(),
            plugin: Weak::new(),
        });

        let mut manifest = Manifest::new([Wasm::data(source)])
            .with_memory_max((self.config.memory_limit / 65536) as u32)
            .with_config(context.env.clone().into_iter());
        if self.config.wasi_enabled {
            manifest =
                manifest.with_allowed_path(context.root.to_string_lossy().into_owned(), GUEST_ROOT);
            tracing::warn!(
                extension = %context.package_name,
                root = %context.root.display(),
                "WASI enabled for extension, its directory is mapped into the sandbox"
            );
        }

        let plugin = PluginBuilder::new(manifest)
            .with_wasi(self.config.wasi_enabled)
            .with_fuel_limit(self.config.fuel_limit)
            .with_function(
                HOST_CALL_FUNCTION,
                [PTR],
                [PTR],
                user_data.clone(),
                soundtime_host_call,
            )
            .build()
            .map_err(|e| ExtensionError::Sandbox(e.to_string()))?;

        let handle = Arc::new(PluginHandle {
            name: context.package_name.clone(),
            plugin: Mutex::new(plugin),
            exports,
        });
        let state = user_data
            .get()
            .map_err(|e| ExtensionError::Sandbox(e.to_string()))?;
        state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plugin = Arc::downgrade(&handle);

        tracing::debug!(extension = %context.package_name, "WASM module loaded");
        Ok(Arc::new(WasmModule { handle }))
    }
}

// ─── Plugin handle ──────────────────────────────────────────────────────

/// One loaded plugin, shared by its module, instance and callbacks.
struct PluginHandle {
    name: String,
    plugin: Mutex<Plugin>,
    exports: HashSet<String>,
}

impl PluginHandle {
    /// Call `export` with raw input on the blocking pool.
    async fn call(self: &Arc<Self>, export: &str, input: Vec<u8>) -> Result<Vec<u8>, ExtensionError> {
        if !self.exports.contains(export) {
            return Err(ExtensionError::Invocation(format!(
                "{} has no export named {export}",
                self.name
            )));
        }
        let this = self.clone();
        let export = export.to_string();
        tokio::task::spawn_blocking(move || {
            let mut plugin = this.plugin.lock().unwrap_or_else(PoisonError::into_inner);
            plugin
                .call::<&[u8], Vec<u8>>(&export, &input)
                .map_err(|e| classify_call_error(&this.name, e))
        })
        .await
        .map_err(|e| ExtensionError::Sandbox(e.to_string()))?
    }

    async fn call_json(self: &Arc<Self>, export: &str, input: &Value) -> Result<Value, ExtensionError> {
        let bytes = if input.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(input)?
        };
        let output = self.call(export, bytes).await?;
        decode_output(&output)
    }
}

// ─── Module ─────────────────────────────────────────────────────────────

pub struct WasmModule {
    handle: Arc<PluginHandle>,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("name", &self.handle.name)
            .field("exports", &self.handle.exports)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EntryPoint for WasmModule {
    async fn descriptors(&self) -> Result<Option<Vec<FactoryDescriptor>>, ExtensionError> {
        let value = self.handle.call_json(DESCRIPTORS_EXPORT, &Value::Null).await?;
        if value.is_null() {
            return Ok(None);
        }
        let descriptors: Vec<FactoryDescriptor> = serde_json::from_value(value)?;
        Ok((!descriptors.is_empty()).then_some(descriptors))
    }

    async fn preferences(&self, export: &str) -> Result<Vec<PreferenceGroup>, ExtensionError> {
        let value = self.handle.call_json(export, &Value::Null).await?;
        Ok(parse_preferences(value)?)
    }

    async fn create(&self, export: &str) -> Result<Arc<dyn ExtensionInstance>, ExtensionError> {
        self.handle.call_json(export, &Value::Null).await?;
        Ok(Arc::new(WasmInstance {
            handle: self.handle.clone(),
        }))
    }
}

// ─── Instance ───────────────────────────────────────────────────────────

/// A created extension. Its methods are exports of the same plugin.
pub struct WasmInstance {
    handle: Arc<PluginHandle>,
}

#[async_trait]
impl ExtensionInstance for WasmInstance {
    fn has_method(&self, method: &str) -> bool {
        self.handle.exports.contains(method)
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, ExtensionError> {
        self.handle.call_json(method, &args).await
    }
}

// ─── Callbacks ──────────────────────────────────────────────────────────

/// Callback that calls back into a guest export.
struct WasmCallback {
    plugin: Weak<PluginHandle>,
    export: String,
}

#[async_trait]
impl Callable for WasmCallback {
    async fn call(&self, args: Vec<Value>) -> Result<Value, ExtensionError> {
        let plugin = self.plugin.upgrade().ok_or_else(|| {
            ExtensionError::Invocation(format!("{} was unloaded", self.export))
        })?;
        plugin.call_json(&self.export, &Value::Array(args)).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
