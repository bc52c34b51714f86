//! Extension handler: lifecycle and fan-out across registered extensions.
//!
//! Every call into extension code runs in its own task, so a failing or
//! panicking extension never takes the others down with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::{AccountEntry, ExtendedContextMenuItem};
use crate::error::ExtensionError;
use crate::events::{ContextMenuKind, ExtensionEventMessage, ExtraEvent, ExtraEventType, LifecycleEvent, ProviderScope};
use crate::finder::ExtensionFinder;
use crate::manager::ExtensionManager;
use crate::manifest::Manifest;
use crate::normalize::{normalize_response, strip_package_prefix};
use crate::registry::{ExtensionDetails, ExtensionFilter, LoadedExtension};

/// Provider query answered by [`ExtensionHandler::handle_provider_request`].
pub const PROVIDER_SCOPES_REQUEST: &str = "getExtensionProviderScopes";

pub struct ExtensionHandler {
    finder: ExtensionFinder,
    manager: ExtensionManager,
    /// Serialises discovery, duplicate eviction and removal.
    registration: Mutex<()>,
}

impl std::fmt::Debug for ExtensionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandler")
            .field("search_paths", &self.finder.search_paths())
            .finish_non_exhaustive()
    }
}

/// Await spawned per-extension tasks, logging failures and panics.
async fn join_all<T>(tasks: Vec<(String, JoinHandle<T>)>) -> Vec<(String, Option<T>)> {
    let mut out = Vec::with_capacity(tasks.len());
    for (package, task) in tasks {
        match task.await {
            Ok(value) => out.push((package, Some(value))),
            Err(e) if e.is_panic() => {
                tracing::error!(extension = %package, "extension task panicked");
                out.push((package, None));
            }
            Err(e) => {
                tracing::error!(extension = %package, error = %e, "extension task failed");
                out.push((package, None));
            }
        }
    }
    out
}

impl ExtensionHandler {
    pub fn new(finder: ExtensionFinder, manager: ExtensionManager) -> Self {
        Self {
            finder,
            manager,
            registration: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &ExtensionManager {
        &self.manager
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Discover and register every extension not already loaded.
    ///
    /// Returns the number of newly registered extensions.
    pub async fn register_plugins(&self) -> Result<usize, ExtensionError> {
        let manifests = self.finder.find_extensions();
        futures::pin_mut!(manifests);

        let mut registered = 0;
        while let Some(manifest) = manifests.next().await {
            let manifest = manifest?;
            let _guard = self.registration.lock().await;
            if self.is_duplicate(&manifest) {
                continue;
            }
            if self.manager.instantiate_and_register(&manifest).await {
                registered += 1;
            }
        }

        tracing::info!(registered, "extension registration finished");
        Ok(registered)
    }

    /// Whether `candidate` should be skipped.
    ///
    /// A strictly newer candidate evicts every registered entry of its
    /// package and is not a duplicate.
    fn is_duplicate(&self, candidate: &Manifest) -> bool {
        let existing = self
            .manager
            .get_extensions(&ExtensionFilter::package(&candidate.package_name));
        if existing.is_empty() {
            return false;
        }

        let version = candidate.numeric_version();
        if existing
            .iter()
            .all(|e| version > e.manifest.numeric_version())
        {
            tracing::info!(
                extension = %candidate.package_name,
                version = %candidate.version,
                "replacing older version"
            );
            self.manager.deregister(&candidate.package_name);
            return false;
        }

        tracing::debug!(
            extension = %candidate.package_name,
            version = %candidate.version,
            "same or newer version already registered"
        );
        true
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub async fn start_all(&self) {
        self.toggle_ext_status(None, true).await;
    }

    /// Start or stop one extension, or all of them.
    pub async fn toggle_ext_status(&self, package: Option<&str>, enabled: bool) {
        let event = if enabled {
            LifecycleEvent::OnStarted
        } else {
            LifecycleEvent::OnStopped
        };
        let targets = self
            .manager
            .get_extensions(&ExtensionFilter::all().with_package(package));
        for extension in targets {
            let name = extension.package_name();
            self.send_to_extensions(Some(name), event, Value::Null).await;
            self.manager.set_started(name, enabled);
        }
    }

    /// Stop and deregister `package`. Returns whether anything was removed.
    pub async fn remove_ext(&self, package: &str) -> bool {
        let _guard = self.registration.lock().await;
        self.toggle_ext_status(Some(package), false).await;
        self.manager.deregister(package) > 0
    }

    pub async fn stop_all_extensions(&self) {
        tracing::debug!("stopping all extensions");
        self.toggle_ext_status(None, false).await;
    }

    /// Invoke a lifecycle method on matching extensions.
    ///
    /// `onStarted` goes to extensions not yet started, everything else to
    /// started ones.
    pub async fn send_to_extensions(&self, package: Option<&str>, event: LifecycleEvent, args: Value) {
        let filter = ExtensionFilter::all()
            .with_package(package)
            .with_started(event != LifecycleEvent::OnStarted);

        let mut tasks = Vec::new();
        for extension in self.manager.get_extensions(&filter) {
            let method = event.method();
            if !extension.instance.has_method(method) {
                continue;
            }
            tracing::debug!(extension = %extension.package_name(), %event, "sending lifecycle event");
            let args = args.clone();
            let package = extension.package_name().to_string();
            tasks.push((
                package,
                tokio::spawn(async move {
                    if let Err(e) = extension.instance.invoke(method, args).await {
                        tracing::error!(
                            extension = %extension.package_name(),
                            %event,
                            error = %e,
                            "lifecycle method failed"
                        );
                    }
                }),
            ));
        }
        join_all(tasks).await;
    }

    /// Forward a lifecycle event received from the host application.
    pub async fn send_event(&self, message: ExtensionEventMessage) {
        self.send_to_extensions(
            message.package_name.as_deref(),
            message.event,
            message.data.unwrap_or(Value::Null),
        )
        .await;
    }

    // ── Extra events ─────────────────────────────────────────────────

    /// Deliver `event` to started extensions and collect their answers.
    ///
    /// Provider responses are namespaced by package. A failed extension
    /// answers `None`.
    pub async fn send_extra_event_to_extensions(
        &self,
        event: ExtraEvent,
    ) -> BTreeMap<String, Option<Value>> {
        let filter = ExtensionFilter::all()
            .with_package(event.package_name.as_deref())
            .with_started(true);

        let mut tasks = Vec::new();
        for extension in self.manager.get_extensions(&filter) {
            let package = extension.package_name().to_string();
            let mut scoped = ExtraEvent::new(event.kind, event.data.clone());
            if event.kind == ExtraEventType::RequestedPlaylistSongs {
                if let Some(playlist_id) = scoped.data.first_mut() {
                    strip_package_prefix(&package, playlist_id);
                }
            }
            tasks.push((package, tokio::spawn(emit_to(extension, scoped))));
        }

        join_all(tasks)
            .await
            .into_iter()
            .map(|(package, response)| (package, response.flatten()))
            .collect()
    }

    /// Provider scopes advertised by each extension's registered callbacks.
    pub fn extension_provides(&self, package: Option<&str>) -> BTreeMap<String, Vec<ProviderScope>> {
        let mut provides = BTreeMap::new();
        for extension in self
            .manager
            .get_extensions(&ExtensionFilter::all().with_package(package))
        {
            let scopes: &mut Vec<ProviderScope> = provides
                .entry(extension.package_name().to_string())
                .or_default();
            for kind in ExtraEventType::ALL {
                if let Some(scope) = kind.provider_scope() {
                    if extension.api.is_event_callback_registered(kind) && !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
            }
        }
        provides
    }

    pub fn handle_provider_request(&self, kind: &str, package: Option<&str>) -> Result<Value, ExtensionError> {
        match kind {
            PROVIDER_SCOPES_REQUEST => Ok(serde_json::to_value(self.extension_provides(package))?),
            other => {
                tracing::warn!(request = %other, "unknown provider request");
                Ok(Value::Null)
            }
        }
    }

    // ── Context menu ─────────────────────────────────────────────────

    /// Context-menu entries of started extensions for `kind`.
    pub fn get_extension_context_menu(&self, kind: ContextMenuKind) -> Vec<ExtendedContextMenuItem> {
        self.manager
            .get_extensions(&ExtensionFilter::all().with_started(true))
            .iter()
            .flat_map(|e| e.api.context_menu_items())
            .filter(|item| item.kind == kind)
            .collect()
    }

    /// Run the handler of the context-menu entry `id`.
    ///
    /// Returns whether a handler was found.
    pub async fn fire_context_menu_callback(&self, id: &str, package: &str, arg: Value) -> bool {
        let filter = ExtensionFilter::package(package).with_started(true);
        let mut fired = false;
        for extension in self.manager.get_extensions(&filter) {
            let Some(handler) = extension.api.context_menu_handler(id) else {
                continue;
            };
            fired = true;
            let task = tokio::spawn({
                let arg = arg.clone();
                async move { handler.call(vec![arg]).await }
            });
            if let Some(Err(e)) = join_all(vec![(package.to_string(), task)]).await.pop().and_then(|(_, r)| r) {
                tracing::error!(extension = %package, item = %id, error = %e, "context menu handler failed");
            }
        }
        if !fired {
            tracing::debug!(extension = %package, item = %id, "no context menu handler");
        }
        fired
    }

    // ── Accounts ─────────────────────────────────────────────────────

    /// Accounts of started extensions, keyed by package.
    pub fn get_extension_accounts(&self, package: Option<&str>) -> BTreeMap<String, Vec<AccountEntry>> {
        self.manager
            .get_extensions(&ExtensionFilter::all().with_package(package).with_started(true))
            .iter()
            .map(|e| (e.package_name().to_string(), e.api.accounts()))
            .collect()
    }

    /// Run the sign-in or sign-out callback of an account.
    pub async fn perform_extension_account_login(
        &self,
        package: &str,
        account_id: &str,
        login: bool,
    ) -> Result<bool, ExtensionError> {
        let mut performed = false;
        for extension in self.manager.get_extensions(&ExtensionFilter::package(package)) {
            performed |= extension.api.perform_account_login(account_id, login).await?;
        }
        Ok(performed)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// `{package: icon}` for the first matching extension with an icon.
    pub fn get_extension_icon(&self, package: &str) -> BTreeMap<String, String> {
        self.manager
            .get_extensions(&ExtensionFilter::package(package))
            .into_iter()
            .next()
            .and_then(|e| e.manifest.icon.as_ref().map(|i| i.to_string_lossy().into_owned()))
            .map(|icon| BTreeMap::from([(package.to_string(), icon)]))
            .unwrap_or_default()
    }

    pub fn get_display_name(&self, package: &str) -> Option<String> {
        self.manager
            .get_extensions(&ExtensionFilter::package(package))
            .first()
            .map(|e| e.manifest.display_name.clone())
    }

    pub fn get_installed_extensions(&self) -> Vec<ExtensionDetails> {
        self.manager
            .get_extensions(&ExtensionFilter::all())
            .iter()
            .map(|e| e.details())
            .collect()
    }
}

async fn emit_to(extension: Arc<LoadedExtension>, event: ExtraEvent) -> Option<Value> {
    let package = extension.package_name();
    match extension.api.emit(&event).await {
        Ok(Some(mut response)) => {
            normalize_response(event.kind, package, &mut response);
            Some(response)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::error!(extension = %package, event = %event.kind, error = %e, "extra event failed");
            None
        }
    }
}
