//! Extension registry: the set of loaded extensions.
//!
//! The registry only stores and filters. Loading, starting and evicting
//! extensions is the manager's and handler's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;

use crate::api::ExtensionApi;
use crate::manifest::Manifest;
use crate::preferences::PreferenceGroup;
use crate::sandbox::{EntryPoint, ExtensionInstance};

// ─── Loaded extension ───────────────────────────────────────────────────

/// A registered extension with its running instance.
pub struct LoadedExtension {
    pub manifest: Manifest,
    started: AtomicBool,
    preferences: Mutex<Vec<PreferenceGroup>>,
    /// Keeps the sandboxed module alive for as long as the instance.
    pub entry_point: Arc<dyn EntryPoint>,
    pub api: Arc<ExtensionApi>,
    pub instance: Arc<dyn ExtensionInstance>,
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("package_name", &self.manifest.package_name)
            .field("version", &self.manifest.version)
            .field("started", &self.has_started())
            .finish_non_exhaustive()
    }
}

impl LoadedExtension {
    pub fn new(
        manifest: Manifest,
        preferences: Vec<PreferenceGroup>,
        entry_point: Arc<dyn EntryPoint>,
        api: Arc<ExtensionApi>,
        instance: Arc<dyn ExtensionInstance>,
    ) -> Self {
        Self {
            manifest,
            started: AtomicBool::new(false),
            preferences: Mutex::new(preferences),
            entry_point,
            api,
            instance,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.manifest.package_name
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    fn lock_preferences(&self) -> MutexGuard<'_, Vec<PreferenceGroup>> {
        self.preferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn preferences(&self) -> Vec<PreferenceGroup> {
        self.lock_preferences().clone()
    }

    /// Append a preference. Returns false when the key is already taken.
    pub fn add_preference(&self, preference: PreferenceGroup) -> bool {
        let mut prefs = self.lock_preferences();
        if prefs.iter().any(|p| p.key == preference.key) {
            return false;
        }
        prefs.push(preference);
        true
    }

    /// Remove the preference with `key`. Returns false when absent.
    pub fn remove_preference(&self, key: &str) -> bool {
        let mut prefs = self.lock_preferences();
        let Some(index) = prefs.iter().position(|p| p.key == key) else {
            return false;
        };
        prefs.remove(index);
        true
    }

    pub fn details(&self) -> ExtensionDetails {
        let m = &self.manifest;
        ExtensionDetails {
            name: m.display_name.clone(),
            package_name: m.package_name.clone(),
            desc: m.description.clone(),
            author: m.author.clone(),
            version: m.version.clone(),
            has_started: self.has_started(),
            entry: m.entry.to_string_lossy().into_owned(),
            preferences: self.preferences(),
            extension_path: m.extension_path.to_string_lossy().into_owned(),
            extension_icon: m
                .icon
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// What the host application sees of an extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDetails {
    pub name: String,
    pub package_name: String,
    pub desc: Option<String>,
    pub author: Option<String>,
    pub version: String,
    pub has_started: bool,
    pub entry: String,
    pub preferences: Vec<PreferenceGroup>,
    pub extension_path: String,
    pub extension_icon: Option<String>,
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Conjunctive filter. A `None` field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    pub package_name: Option<String>,
    pub started: Option<bool>,
}

impl ExtensionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn package(package_name: impl Into<String>) -> Self {
        Self {
            package_name: Some(package_name.into()),
            started: None,
        }
    }

    pub fn with_package(mut self, package_name: Option<&str>) -> Self {
        self.package_name = package_name.map(str::to_string);
        self
    }

    pub fn with_started(mut self, started: bool) -> Self {
        self.started = Some(started);
        self
    }

    pub fn matches(&self, extension: &LoadedExtension) -> bool {
        self.package_name
            .as_deref()
            .map_or(true, |p| p == extension.package_name())
            && self
                .started
                .map_or(true, |s| s == extension.has_started())
    }
}

pub trait ExtensionRegistry: Send + Sync {
    fn register(&mut self, extension: Arc<LoadedExtension>);

    /// Remove every entry for `package_name`. Returns how many were removed.
    fn deregister(&mut self, package_name: &str) -> usize;

    /// Matching entries in registration order.
    fn get(&self, filter: &ExtensionFilter) -> Vec<Arc<LoadedExtension>>;

    /// Set the started flag of every entry for `package_name`.
    fn set_started(&self, package_name: &str, started: bool) -> usize;
}

/// Shared, swappable registry backend.
pub type RegistryHandle = Arc<RwLock<dyn ExtensionRegistry>>;

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    extensions: Vec<Arc<LoadedExtension>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_handle(self) -> RegistryHandle {
        Arc::new(RwLock::new(self))
    }
}

impl ExtensionRegistry for InMemoryRegistry {
    fn register(&mut self, extension: Arc<LoadedExtension>) {
        tracing::debug!(extension = %extension.package_name(), "registered");
        self.extensions.push(extension);
    }

    fn deregister(&mut self, package_name: &str) -> usize {
        let before = self.extensions.len();
        self.extensions.retain(|e| e.package_name() != package_name);
        let removed = before - self.extensions.len();
        tracing::debug!(extension = %package_name, removed, "deregistered");
        removed
    }

    fn get(&self, filter: &ExtensionFilter) -> Vec<Arc<LoadedExtension>> {
        self.extensions
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    fn set_started(&self, package_name: &str, started: bool) -> usize {
        let mut count = 0;
        for extension in self.extensions.iter().filter(|e| e.package_name() == package_name) {
            extension.set_started(started);
            count += 1;
        }
        count
    }
}
