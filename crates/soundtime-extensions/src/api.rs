//! The capability object handed to each extension.
//!
//! [`ExtensionApi`] is the only way an extension reaches the host
//! application. Host-bound calls are correlated through the
//! [`RequestBus`]. Event callbacks, context-menu entries and accounts are
//! held locally and answered without a round-trip.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::bus::RequestBus;
use crate::envelope::ExtensionRequest;
use crate::error::ExtensionError;
use crate::events::{ContextMenuKind, ExtraEvent, ExtraEventType};
use crate::preferences::PreferenceGroup;

// ─── Callbacks ──────────────────────────────────────────────────────────

/// Something an extension registered to be called later.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> Result<Value, ExtensionError>;
}

pub type Callback = Arc<dyn Callable>;

/// Adapts an async closure into a [`Callable`].
pub struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> Callable for FnCallback<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExtensionError>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, ExtensionError> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExtensionError>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

// ─── Communicator ───────────────────────────────────────────────────────

/// Registry access scoped to what an extension may see and change.
pub trait ExtensionCommunicator: Send + Sync {
    /// Package names of every registered extension.
    fn installed_extensions(&self) -> Vec<String>;
    /// Add a preference to `package`. Returns false if the key exists.
    fn add_preference(&self, package: &str, preference: PreferenceGroup) -> bool;
    /// Remove a preference from `package`. Returns false if absent.
    fn remove_preference(&self, package: &str, key: &str) -> bool;
}

// ─── Context menu ───────────────────────────────────────────────────────

/// A context-menu entry as declared by an extension.
#[derive(Clone)]
pub struct ContextMenuItem {
    pub kind: ContextMenuKind,
    pub label: String,
    pub disabled: Option<bool>,
    pub children: Option<Vec<ContextMenuItem>>,
    pub handler: Option<Callback>,
}

impl ContextMenuItem {
    pub fn new(kind: ContextMenuKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            disabled: None,
            children: None,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Callback) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_children(mut self, children: Vec<ContextMenuItem>) -> Self {
        self.children = Some(children);
        self
    }
}

/// A stored context-menu entry with its generated id.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedContextMenuItem {
    pub id: String,
    pub package_name: String,
    #[serde(rename = "type")]
    pub kind: ContextMenuKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ExtendedContextMenuItem>>,
    #[serde(skip)]
    pub handler: Option<Callback>,
}

impl ExtendedContextMenuItem {
    fn from_declared(package: &str, item: ContextMenuItem) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            package_name: package.to_string(),
            kind: item.kind,
            label: item.label,
            disabled: item.disabled,
            children: item.children.map(|children| {
                children
                    .into_iter()
                    .map(|c| Self::from_declared(package, c))
                    .collect()
            }),
            handler: item.handler,
        }
    }

    /// Copy of this entry and its children with handlers removed.
    pub fn without_handlers(&self) -> Self {
        Self {
            id: self.id.clone(),
            package_name: self.package_name.clone(),
            kind: self.kind,
            label: self.label.clone(),
            disabled: self.disabled,
            children: self
                .children
                .as_ref()
                .map(|c| c.iter().map(Self::without_handlers).collect()),
            handler: None,
        }
    }

    /// Depth-first search for the entry with `id`.
    pub fn find(&self, id: &str) -> Option<&Self> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find_map(|c| c.find(id))
    }
}

// ─── Accounts ───────────────────────────────────────────────────────────

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    pub id: String,
    pub package_name: String,
    pub name: String,
    pub bg_color: String,
    pub icon: String,
    pub logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip)]
    pub sign_in: Option<Callback>,
    #[serde(skip)]
    pub sign_out: Option<Callback>,
}

// ─── Request payloads ───────────────────────────────────────────────────

/// A song given either by id or as a full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SongRef {
    Id(String),
    Song(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Info,
    Error,
    Default,
}

// ─── Capability object ──────────────────────────────────────────────────

#[derive(Default)]
struct ApiState {
    callbacks: HashMap<ExtraEventType, Callback>,
    context_menu: Vec<ExtendedContextMenuItem>,
    accounts: Vec<AccountEntry>,
}

pub struct ExtensionApi {
    package_name: String,
    bus: RequestBus,
    communicator: Arc<dyn ExtensionCommunicator>,
    state: Mutex<ApiState>,
}

impl std::fmt::Debug for ExtensionApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionApi")
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl ExtensionApi {
    pub fn new(
        package_name: impl Into<String>,
        bus: RequestBus,
        communicator: Arc<dyn ExtensionCommunicator>,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            bus,
            communicator,
            state: Mutex::new(ApiState::default()),
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Base URL under which the host routes custom requests to this extension.
    pub fn custom_request_base_url(&self) -> String {
        format!("extension://{}", self.package_name)
    }

    pub fn installed_extensions(&self) -> Vec<String> {
        self.communicator.installed_extensions()
    }

    /// This extension's slice of an artist's `artist_extra_info`.
    pub fn artist_extra_info(&self, artist: &Value) -> Option<Value> {
        self.own_extra_info(artist, "artist_extra_info")
    }

    /// This extension's slice of an album's `album_extra_info`.
    pub fn album_extra_info(&self, album: &Value) -> Option<Value> {
        self.own_extra_info(album, "album_extra_info")
    }

    fn own_extra_info(&self, entity: &Value, field: &str) -> Option<Value> {
        entity
            .get(field)?
            .get("extensions")?
            .get(&self.package_name)
            .cloned()
    }

    fn lock_state(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request(
        &self,
        kind: ExtensionRequest,
        data: Option<Value>,
    ) -> Result<Option<Value>, ExtensionError> {
        self.bus
            .send_async(kind.as_str(), data, Some(&self.package_name))
            .await
    }

    /// Send a request without waiting for its reply.
    fn notify(&self, kind: ExtensionRequest, data: Option<Value>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(extension = %self.package_name, request = %kind, "no runtime, notification dropped");
            return;
        };
        let bus = self.bus.clone();
        let package = self.package_name.clone();
        handle.spawn(async move {
            if let Err(e) = bus.send_async(kind.as_str(), data, Some(&package)).await {
                tracing::debug!(extension = %package, request = %kind, error = %e, "notification not acknowledged");
            }
        });
    }

    fn scoped(&self, mut fields: Map<String, Value>) -> Value {
        fields.insert(
            "packageName".into(),
            Value::String(self.package_name.clone()),
        );
        Value::Object(fields)
    }

    // ── Library ──────────────────────────────────────────────────────

    pub async fn get_songs(&self, options: Value) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetSongs, Some(options)).await
    }

    pub async fn get_entity(&self, options: Value) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetEntity, Some(options)).await
    }

    pub async fn add_songs(&self, songs: Vec<Value>) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::AddSongs, Some(Value::Array(songs)))
            .await
    }

    pub async fn update_song(&self, song: Value) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::UpdateSong, Some(song)).await
    }

    /// Remove a song. An id is looked up first; an unknown id is a no-op.
    pub async fn remove_song(&self, song: SongRef) -> Result<Option<Value>, ExtensionError> {
        let song = match song {
            SongRef::Song(song) => song,
            SongRef::Id(id) => {
                let found = self
                    .get_songs(json!({ "song": { "_id": id } }))
                    .await?
                    .and_then(|songs| songs.as_array().and_then(|s| s.first().cloned()));
                match found {
                    Some(song) => song,
                    None => {
                        tracing::debug!(extension = %self.package_name, song = %id, "song to remove not found");
                        return Ok(None);
                    }
                }
            }
        };
        self.request(ExtensionRequest::RemoveSong, Some(song)).await
    }

    // ── Player state ─────────────────────────────────────────────────

    pub async fn get_current_song(&self) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetCurrentSong, None).await
    }

    pub async fn get_volume(&self) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetVolume, None).await
    }

    pub async fn get_time(&self) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetTime, None).await
    }

    pub async fn get_queue(&self) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetQueue, None).await
    }

    pub async fn get_player_state(&self) -> Result<Option<Value>, ExtensionError> {
        self.request(ExtensionRequest::GetPlayerState, None).await
    }

    // ── Preferences ──────────────────────────────────────────────────

    pub async fn get_preferences(
        &self,
        key: Option<&str>,
        default_value: Option<Value>,
    ) -> Result<Option<Value>, ExtensionError> {
        let data = self.preference_query(key, default_value);
        self.request(ExtensionRequest::GetPreferences, Some(data)).await
    }

    pub async fn get_secure(
        &self,
        key: Option<&str>,
        default_value: Option<Value>,
    ) -> Result<Option<Value>, ExtensionError> {
        let data = self.preference_query(key, default_value);
        self.request(ExtensionRequest::GetSecurePreferences, Some(data))
            .await
    }

    pub async fn set_preferences(&self, key: &str, value: Value) -> Result<(), ExtensionError> {
        let data = self.preference_write(key, value);
        self.request(ExtensionRequest::SetPreferences, Some(data)).await?;
        Ok(())
    }

    pub async fn set_secure(&self, key: &str, value: Value) -> Result<(), ExtensionError> {
        let data = self.preference_write(key, value);
        self.request(ExtensionRequest::SetSecurePreferences, Some(data))
            .await?;
        Ok(())
    }

    fn preference_query(&self, key: Option<&str>, default_value: Option<Value>) -> Value {
        let mut fields = Map::new();
        if let Some(key) = key {
            fields.insert("key".into(), Value::String(key.into()));
        }
        if let Some(default_value) = default_value {
            fields.insert("defaultValue".into(), default_value);
        }
        self.scoped(fields)
    }

    fn preference_write(&self, key: &str, value: Value) -> Value {
        let mut fields = Map::new();
        fields.insert("key".into(), Value::String(key.into()));
        fields.insert("value".into(), value);
        self.scoped(fields)
    }

    /// Add a preference to this extension's settings page.
    pub fn add_user_preference(&self, preference: PreferenceGroup) -> bool {
        let added = self
            .communicator
            .add_preference(&self.package_name, preference);
        if added {
            self.notify(ExtensionRequest::UpdatePreferences, None);
        }
        added
    }

    pub fn remove_user_preference(&self, key: &str) -> bool {
        let removed = self.communicator.remove_preference(&self.package_name, key);
        if removed {
            self.notify(ExtensionRequest::UpdatePreferences, None);
        }
        removed
    }

    // ── Playlists ────────────────────────────────────────────────────

    /// Create a playlist and return its id, or an empty string.
    pub async fn add_playlist(&self, playlist: Value) -> Result<String, ExtensionError> {
        let id = self
            .request(ExtensionRequest::AddPlaylist, Some(playlist))
            .await?;
        Ok(id
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default())
    }

    pub async fn add_songs_to_playlist(
        &self,
        playlist_id: &str,
        songs: Vec<Value>,
    ) -> Result<(), ExtensionError> {
        self.request(
            ExtensionRequest::AddSongToPlaylist,
            Some(json!({ "playlistID": playlist_id, "songs": songs })),
        )
        .await?;
        Ok(())
    }

    // ── External ─────────────────────────────────────────────────────

    pub async fn register_oauth(&self, path: &str) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::RegisterOauth, Some(json!(path)))
            .await?;
        Ok(())
    }

    pub async fn open_external_url(&self, url: &str) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::OpenExternal, Some(json!(url)))
            .await?;
        Ok(())
    }

    pub async fn show_toast(
        &self,
        message: &str,
        duration: Option<u64>,
        kind: Option<ToastKind>,
    ) -> Result<(), ExtensionError> {
        self.request(
            ExtensionRequest::ShowToast,
            Some(json!({ "type": kind, "duration": duration, "message": message })),
        )
        .await?;
        Ok(())
    }

    // ── Accounts ─────────────────────────────────────────────────────

    /// Register an account and return its generated id.
    pub async fn register_account(
        &self,
        name: &str,
        bg_color: &str,
        icon: &str,
        sign_in: Callback,
        sign_out: Callback,
    ) -> Result<String, ExtensionError> {
        let entry = {
            let mut state = self.lock_state();
            let entry = AccountEntry {
                id: format!("account:{}:{}", self.package_name, state.accounts.len()),
                package_name: self.package_name.clone(),
                name: name.to_string(),
                bg_color: bg_color.to_string(),
                icon: icon.to_string(),
                logged_in: false,
                username: None,
                sign_in: Some(sign_in),
                sign_out: Some(sign_out),
            };
            state.accounts.push(entry.clone());
            entry
        };
        let id = entry.id.clone();
        self.request(ExtensionRequest::RegisterAccount, Some(serde_json::to_value(&entry)?))
            .await?;
        Ok(id)
    }

    /// Update an account's login state. Unknown ids are ignored.
    pub async fn change_account_auth_status(
        &self,
        id: &str,
        logged_in: bool,
        username: Option<String>,
    ) -> Result<(), ExtensionError> {
        let updated = {
            let mut state = self.lock_state();
            state.accounts.iter_mut().find(|a| a.id == id).map(|account| {
                account.logged_in = logged_in;
                account.username = username;
                account.clone()
            })
        };
        let Some(account) = updated else {
            tracing::debug!(extension = %self.package_name, account = %id, "unknown account");
            return Ok(());
        };
        self.request(
            ExtensionRequest::RegisterAccount,
            Some(serde_json::to_value(&account)?),
        )
        .await?;
        Ok(())
    }

    pub async fn open_login_modal(&self, options: Value) -> Result<bool, ExtensionError> {
        let mut fields = match options {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.insert(
            "packageName".into(),
            Value::String(self.package_name.clone()),
        );
        let reply = self
            .request(ExtensionRequest::OpenLoginModal, Some(Value::Object(fields)))
            .await?;
        Ok(reply.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn close_login_modal(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::CloseLoginModal, None).await?;
        Ok(())
    }

    /// Snapshot of the registered accounts.
    pub fn accounts(&self) -> Vec<AccountEntry> {
        self.lock_state().accounts.clone()
    }

    /// Run the sign-in or sign-out callback of `account_id`.
    ///
    /// Returns `Ok(false)` when the account is unknown.
    pub async fn perform_account_login(
        &self,
        account_id: &str,
        login: bool,
    ) -> Result<bool, ExtensionError> {
        let callback = {
            let state = self.lock_state();
            let Some(account) = state.accounts.iter().find(|a| a.id == account_id) else {
                return Ok(false);
            };
            if login {
                account.sign_in.clone()
            } else {
                account.sign_out.clone()
            }
        };
        if let Some(callback) = callback {
            callback.call(Vec::new()).await?;
        }
        Ok(true)
    }

    // ── Editable info ────────────────────────────────────────────────

    pub async fn set_artist_editable_info(
        &self,
        artist_id: &str,
        object: Value,
    ) -> Result<(), ExtensionError> {
        self.request(
            ExtensionRequest::SetArtistEditableInfo,
            Some(json!({ "artist_id": artist_id, "object": object })),
        )
        .await?;
        Ok(())
    }

    pub async fn set_album_editable_info(
        &self,
        album_id: &str,
        object: Value,
    ) -> Result<(), ExtensionError> {
        self.request(
            ExtensionRequest::SetAlbumEditableInfo,
            Some(json!({ "album_id": album_id, "object": object })),
        )
        .await?;
        Ok(())
    }

    // ── Player controls ──────────────────────────────────────────────

    pub async fn play(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::Play, None).await.map(drop)
    }

    pub async fn pause(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::Pause, None).await.map(drop)
    }

    pub async fn stop(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::Stop, None).await.map(drop)
    }

    pub async fn next_song(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::Next, None).await.map(drop)
    }

    pub async fn prev_song(&self) -> Result<(), ExtensionError> {
        self.request(ExtensionRequest::Prev, None).await.map(drop)
    }

    // ── Event callbacks ──────────────────────────────────────────────

    /// Register `callback` for `event`, replacing any previous one.
    pub fn on(&self, event: ExtraEventType, callback: Callback) {
        tracing::debug!(extension = %self.package_name, %event, "registering listener");
        self.lock_state().callbacks.insert(event, callback);
        self.notify(ExtensionRequest::ExtensionUpdated, None);
    }

    pub fn off(&self, event: ExtraEventType) {
        tracing::debug!(extension = %self.package_name, %event, "removing listener");
        self.lock_state().callbacks.remove(&event);
    }

    pub fn is_event_callback_registered(&self, event: ExtraEventType) -> bool {
        self.lock_state().callbacks.contains_key(&event)
    }

    /// Deliver `event` to the registered callback, if any.
    pub async fn emit(&self, event: &ExtraEvent) -> Result<Option<Value>, ExtensionError> {
        let callback = self.lock_state().callbacks.get(&event.kind).cloned();
        let Some(callback) = callback else {
            return Ok(None);
        };
        tracing::debug!(extension = %self.package_name, event = %event.kind, "emitting");
        let value = callback.call(event.data.clone()).await?;
        Ok((!value.is_null()).then_some(value))
    }

    // ── Context menu ─────────────────────────────────────────────────

    /// Store `items` with freshly generated ids. Returns the new count.
    pub fn set_context_menu_item(&self, items: Vec<ContextMenuItem>) -> usize {
        let extended: Vec<_> = items
            .into_iter()
            .map(|item| ExtendedContextMenuItem::from_declared(&self.package_name, item))
            .collect();
        let mut state = self.lock_state();
        state.context_menu.extend(extended);
        state.context_menu.len()
    }

    pub fn remove_context_menu_item(&self, index: usize) {
        let mut state = self.lock_state();
        if index < state.context_menu.len() {
            state.context_menu.remove(index);
        }
    }

    /// Registered entries without their handlers.
    pub fn context_menu_items(&self) -> Vec<ExtendedContextMenuItem> {
        self.lock_state()
            .context_menu
            .iter()
            .map(ExtendedContextMenuItem::without_handlers)
            .collect()
    }

    /// Handler of the entry with `id`, searching nested children too.
    pub fn context_menu_handler(&self, id: &str) -> Option<Callback> {
        self.lock_state()
            .context_menu
            .iter()
            .find_map(|item| item.find(id))
            .and_then(|item| item.handler.clone())
    }
}
