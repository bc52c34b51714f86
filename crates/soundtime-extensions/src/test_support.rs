//! In-process fakes for the sandbox traits.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::{ExtensionApi, ExtensionCommunicator};
use crate::bus::RequestBus;
use crate::error::ExtensionError;
use crate::manifest::Manifest;
use crate::preferences::PreferenceGroup;
use crate::registry::LoadedExtension;
use crate::sandbox::{EntryPoint, ExtensionInstance, FactoryDescriptor, Sandbox, SandboxContext};

pub fn manifest(name: &str, version: &str) -> Manifest {
    let dir = PathBuf::from("/extensions").join(name);
    Manifest {
        package_name: name.to_string(),
        display_name: format!("{name} display"),
        description: None,
        author: None,
        version: version.to_string(),
        entry: dir.join("index.wasm"),
        extension_path: dir,
        icon: None,
    }
}

/// Write a marked `package.json` and an entry file under `root/dir`.
pub fn write_extension(root: &Path, dir: &str, name: &str, version: &str) -> PathBuf {
    let ext_dir = root.join(dir);
    std::fs::create_dir_all(&ext_dir).unwrap();
    std::fs::write(
        ext_dir.join("package.json"),
        json!({
            "soundtimeExtension": true,
            "name": name,
            "displayName": format!("{name} display"),
            "version": version,
            "extensionEntry": "index.wasm",
            "icon": "icon.svg",
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(ext_dir.join("index.wasm"), b"\0asm").unwrap();
    ext_dir
}

struct NullCommunicator;

impl ExtensionCommunicator for NullCommunicator {
    fn installed_extensions(&self) -> Vec<String> {
        Vec::new()
    }
    fn add_preference(&self, _: &str, _: PreferenceGroup) -> bool {
        false
    }
    fn remove_preference(&self, _: &str, _: &str) -> bool {
        false
    }
}

/// A registry entry backed by a [`RecordingInstance`].
pub fn loaded(manifest: Manifest) -> Arc<LoadedExtension> {
    let (bus, _rx) = RequestBus::new(None);
    let api = Arc::new(ExtensionApi::new(
        manifest.package_name.clone(),
        bus,
        Arc::new(NullCommunicator),
    ));
    let instance = Arc::new(RecordingInstance::default());
    let entry_point = Arc::new(ScriptedEntryPoint {
        script: Script::default(),
        instance: instance.clone(),
    });
    Arc::new(LoadedExtension::new(
        manifest,
        Vec::new(),
        entry_point,
        api,
        instance,
    ))
}

// ─── Instance ───────────────────────────────────────────────────────────

/// Records every invocation. Lifecycle methods exist unless removed.
#[derive(Default)]
pub struct RecordingInstance {
    pub calls: Mutex<Vec<(String, Value)>>,
    pub missing: HashSet<String>,
    pub failing: HashSet<String>,
    pub panicking: HashSet<String>,
}

impl RecordingInstance {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|(m, _)| m).collect()
    }
}

#[async_trait]
impl ExtensionInstance for RecordingInstance {
    fn has_method(&self, method: &str) -> bool {
        !self.missing.contains(method)
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, ExtensionError> {
        self.calls.lock().unwrap().push((method.to_string(), args));
        if self.panicking.contains(method) {
            panic!("{method} panicked");
        }
        if self.failing.contains(method) {
            return Err(ExtensionError::Invocation(format!("{method} failed")));
        }
        Ok(Value::Null)
    }
}

// ─── Entry point ────────────────────────────────────────────────────────

/// Hook run against the capability object when a module is evaluated.
pub type ApiHook = Arc<dyn Fn(&ExtensionApi) + Send + Sync>;

/// How a fake module behaves.
#[derive(Clone)]
pub struct Script {
    pub descriptors: Option<Vec<FactoryDescriptor>>,
    pub preferences: Vec<PreferenceGroup>,
    pub evaluate_error: bool,
    pub create_error: bool,
    pub instance: Option<Arc<RecordingInstance>>,
    pub on_evaluate: Option<ApiHook>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            descriptors: Some(vec![FactoryDescriptor {
                create: Some("create".into()),
                ..Default::default()
            }]),
            preferences: Vec::new(),
            evaluate_error: false,
            create_error: false,
            instance: None,
            on_evaluate: None,
        }
    }
}

pub struct ScriptedEntryPoint {
    script: Script,
    instance: Arc<RecordingInstance>,
}

#[async_trait]
impl EntryPoint for ScriptedEntryPoint {
    async fn descriptors(&self) -> Result<Option<Vec<FactoryDescriptor>>, ExtensionError> {
        Ok(self.script.descriptors.clone())
    }

    async fn preferences(&self, _export: &str) -> Result<Vec<PreferenceGroup>, ExtensionError> {
        Ok(self.script.preferences.clone())
    }

    async fn create(&self, export: &str) -> Result<Arc<dyn ExtensionInstance>, ExtensionError> {
        if self.script.create_error {
            return Err(ExtensionError::Invocation(format!("{export} threw")));
        }
        Ok(self.instance.clone())
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// Sandbox whose modules follow a per-package [`Script`].
#[derive(Default)]
pub struct FakeSandbox {
    scripts: Mutex<HashMap<String, Script>>,
    pub contexts: Mutex<Vec<SandboxContext>>,
    instances: Mutex<HashMap<String, Arc<RecordingInstance>>>,
}

impl FakeSandbox {
    pub fn script(&self, package: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(package.to_string(), script);
    }

    /// Instance most recently created for `package`.
    pub fn instance(&self, package: &str) -> Arc<RecordingInstance> {
        self.instances.lock().unwrap()[package].clone()
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.package_name.clone())
            .collect()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn evaluate(
        &self,
        _source: Vec<u8>,
        context: SandboxContext,
    ) -> Result<Arc<dyn EntryPoint>, ExtensionError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&context.package_name)
            .cloned()
            .unwrap_or_default();
        let package = context.package_name.clone();
        self.contexts.lock().unwrap().push(context.clone());

        if script.evaluate_error {
            return Err(ExtensionError::InvalidEntryPoint(format!(
                "{package} is not a module"
            )));
        }
        if let Some(hook) = &script.on_evaluate {
            hook(&context.api);
        }

        let instance = script.instance.clone().unwrap_or_default();
        self.instances
            .lock()
            .unwrap()
            .insert(package, instance.clone());
        Ok(Arc::new(ScriptedEntryPoint { script, instance }))
    }
}
