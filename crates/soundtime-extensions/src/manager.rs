//! Extension manager: turns a manifest into a registered extension.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use crate::api::{ExtensionApi, ExtensionCommunicator};
use crate::bus::RequestBus;
use crate::error::ExtensionError;
use crate::logger::ExtensionLogger;
use crate::manifest::Manifest;
use crate::preferences::PreferenceGroup;
use crate::registry::{ExtensionFilter, ExtensionRegistry, LoadedExtension, RegistryHandle};
use crate::sandbox::{filter_env, Sandbox, SandboxContext};

/// Host version exposed to extensions as `SOUNDTIME_VERSION`.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

fn read(registry: &RegistryHandle) -> RwLockReadGuard<'_, dyn ExtensionRegistry> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(registry: &RegistryHandle) -> RwLockWriteGuard<'_, dyn ExtensionRegistry + 'static> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

/// Add `preference` to every entry of `package`. True if any entry took it.
fn add_preference(registry: &RegistryHandle, package: &str, preference: PreferenceGroup) -> bool {
    let extensions = read(registry).get(&ExtensionFilter::package(package));
    if extensions.is_empty() {
        tracing::warn!(extension = %package, "cannot add preference to unknown extension");
        return false;
    }
    let mut added = false;
    for extension in &extensions {
        added |= extension.add_preference(preference.clone());
    }
    if !added {
        tracing::warn!(extension = %package, key = %preference.key, "preference key already exists");
    }
    added
}

/// Remove `key` from every entry of `package`. True if any entry had it.
fn remove_preference(registry: &RegistryHandle, package: &str, key: &str) -> bool {
    let mut removed = false;
    for extension in read(registry).get(&ExtensionFilter::package(package)) {
        removed |= extension.remove_preference(key);
    }
    if !removed {
        tracing::warn!(extension = %package, %key, "preference to remove not found");
    }
    removed
}

/// Registry access handed to one extension's capability object.
struct ManagerCommunicator {
    registry: RegistryHandle,
}

impl ExtensionCommunicator for ManagerCommunicator {
    fn installed_extensions(&self) -> Vec<String> {
        read(&self.registry)
            .get(&ExtensionFilter::all())
            .iter()
            .map(|e| e.package_name().to_string())
            .collect()
    }

    fn add_preference(&self, package: &str, preference: PreferenceGroup) -> bool {
        add_preference(&self.registry, package, preference)
    }

    fn remove_preference(&self, package: &str, key: &str) -> bool {
        remove_preference(&self.registry, package, key)
    }
}

pub struct ExtensionManager {
    registry: RegistryHandle,
    sandbox: Arc<dyn Sandbox>,
    bus: RequestBus,
    install_path: Option<PathBuf>,
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("install_path", &self.install_path)
            .finish_non_exhaustive()
    }
}

impl ExtensionManager {
    pub fn new(registry: RegistryHandle, sandbox: Arc<dyn Sandbox>, bus: RequestBus) -> Self {
        Self {
            registry,
            sandbox,
            bus,
            install_path: None,
        }
    }

    pub fn with_install_path(mut self, install_path: Option<PathBuf>) -> Self {
        self.install_path = install_path;
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn bus(&self) -> &RequestBus {
        &self.bus
    }

    /// Load, instantiate and register the extension described by `manifest`.
    ///
    /// Failures are logged and leave the registry untouched.
    pub async fn instantiate_and_register(&self, manifest: &Manifest) -> bool {
        match self.instantiate(manifest).await {
            Ok(extension) => {
                write(&self.registry).register(extension);
                tracing::info!(
                    extension = %manifest.package_name,
                    version = %manifest.version,
                    "extension loaded"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    extension = %manifest.package_name,
                    entry = %manifest.entry.display(),
                    error = %e,
                    "failed to load extension"
                );
                false
            }
        }
    }

    async fn instantiate(&self, manifest: &Manifest) -> Result<Arc<LoadedExtension>, ExtensionError> {
        let package = manifest.package_name.as_str();
        let source = tokio::fs::read(&manifest.entry).await?;

        let api = Arc::new(ExtensionApi::new(
            package,
            self.bus.clone(),
            Arc::new(ManagerCommunicator {
                registry: self.registry.clone(),
            }),
        ));
        let context = SandboxContext {
            package_name: package.to_string(),
            entry_path: manifest.entry.clone(),
            root: manifest.extension_path.clone(),
            env: self.sandbox_env(),
            api: api.clone(),
            logger: ExtensionLogger::new(package),
        };

        let entry_point = self.sandbox.evaluate(source, context).await?;
        let descriptors = entry_point.descriptors().await?.ok_or_else(|| {
            ExtensionError::InvalidEntryPoint(format!("{package} exposes no extension descriptors"))
        })?;

        let (descriptor, create) = descriptors
            .iter()
            .find_map(|d| d.create.as_deref().map(|create| (d, create)))
            .ok_or_else(|| {
                ExtensionError::InvalidEntryPoint(format!("{package} has no create function"))
            })?;
        if descriptors.len() > 1 {
            tracing::debug!(
                extension = %package,
                count = descriptors.len(),
                "using the first descriptor with a create function"
            );
        }

        let preferences = match descriptor.preference_hook() {
            Some(hook) => entry_point.preferences(hook).await?,
            None => Vec::new(),
        };
        let instance = entry_point.create(create).await?;

        Ok(Arc::new(LoadedExtension::new(
            manifest.clone(),
            preferences,
            entry_point,
            api,
            instance,
        )))
    }

    /// Environment visible inside a sandbox, built from the process environment.
    pub fn sandbox_env(&self) -> BTreeMap<String, String> {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        self.sandbox_env_from(vars)
    }

    /// Environment visible inside a sandbox, built from `vars`.
    pub fn sandbox_env_from<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env = filter_env(vars);
        env.insert("SOUNDTIME_VERSION".into(), HOST_VERSION.into());
        if let Some(path) = &self.install_path {
            env.insert("installPath".into(), path.to_string_lossy().into_owned());
        }
        env
    }

    pub fn get_extensions(&self, filter: &ExtensionFilter) -> Vec<Arc<LoadedExtension>> {
        read(&self.registry).get(filter)
    }

    pub fn deregister(&self, package: &str) -> usize {
        write(&self.registry).deregister(package)
    }

    pub fn set_started(&self, package: &str, started: bool) -> usize {
        read(&self.registry).set_started(package, started)
    }

    pub fn add_preference(&self, package: &str, preference: PreferenceGroup) -> bool {
        add_preference(&self.registry, package, preference)
    }

    pub fn remove_preference(&self, package: &str, key: &str) -> bool {
        remove_preference(&self.registry, package, key)
    }
}
