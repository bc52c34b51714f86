//! Host calls made by sandboxed extension code.
//!
//! Guests send one JSON request per call, `{"method": ..., "args": ...}`,
//! and get back `{"ok": value}` or `{"error": message}`. Each request is
//! executed against the extension's own [`ExtensionApi`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{Callback, ContextMenuItem, ExtensionApi, SongRef, ToastKind};
use crate::error::ExtensionError;
use crate::events::{ContextMenuKind, ExtraEventType};
use crate::logger::{ExtensionLogger, LogLevel};
use crate::preferences::PreferenceGroup;

/// A context-menu entry declared by guest code. `handler` names an export.
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredMenuItem {
    #[serde(rename = "type")]
    pub kind: ContextMenuKind,
    pub label: String,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub children: Option<Vec<DeclaredMenuItem>>,
    #[serde(default)]
    pub handler: Option<String>,
}

impl DeclaredMenuItem {
    fn into_item(self, callback_for: &dyn Fn(&str) -> Callback) -> ContextMenuItem {
        ContextMenuItem {
            kind: self.kind,
            label: self.label,
            disabled: self.disabled,
            children: self.children.map(|children| {
                children
                    .into_iter()
                    .map(|c| c.into_item(callback_for))
                    .collect()
            }),
            handler: self.handler.as_deref().map(callback_for),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(
    tag = "method",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum HostCall {
    GetSongs(Value),
    GetEntity(Value),
    AddSongs(Vec<Value>),
    UpdateSong(Value),
    RemoveSong(SongRef),
    GetCurrentSong,
    GetVolume,
    GetTime,
    GetQueue,
    GetPlayerState,
    GetPreferences {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        default_value: Option<Value>,
    },
    GetSecure {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        default_value: Option<Value>,
    },
    SetPreferences {
        key: String,
        value: Value,
    },
    SetSecure {
        key: String,
        value: Value,
    },
    AddUserPreference(PreferenceGroup),
    RemoveUserPreference(String),
    AddPlaylist(Value),
    AddSongsToPlaylist {
        #[serde(rename = "playlistID")]
        playlist_id: String,
        songs: Vec<Value>,
    },
    RegisterOauth(String),
    #[serde(rename = "openExternalURL")]
    OpenExternalUrl(String),
    ShowToast {
        message: String,
        #[serde(default)]
        duration: Option<u64>,
        #[serde(default, rename = "type")]
        kind: Option<ToastKind>,
    },
    RegisterAccount {
        name: String,
        bg_color: String,
        icon: String,
        sign_in: String,
        sign_out: String,
    },
    ChangeAccountAuthStatus {
        id: String,
        logged_in: bool,
        #[serde(default)]
        username: Option<String>,
    },
    OpenLoginModal(Value),
    CloseLoginModal,
    SetArtistEditableInfo {
        artist_id: String,
        object: Value,
    },
    SetAlbumEditableInfo {
        album_id: String,
        object: Value,
    },
    Play,
    Pause,
    Stop,
    NextSong,
    PrevSong,
    On {
        event: ExtraEventType,
        handler: String,
    },
    Off {
        event: ExtraEventType,
    },
    SetContextMenuItem(Vec<DeclaredMenuItem>),
    RemoveContextMenuItem(usize),
    GetContextMenuItems,
    GetInstalledExtensions,
    GetPackageName,
    GetCustomRequestBaseUrl,
    GetArtistExtraInfo(Value),
    GetAlbumExtraInfo(Value),
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum HostResponse {
    Ok(Value),
    Error(String),
}

fn unit<T>(result: Result<T, ExtensionError>) -> Result<Value, ExtensionError> {
    result.map(|_| Value::Null)
}

fn opt(result: Result<Option<Value>, ExtensionError>) -> Result<Value, ExtensionError> {
    result.map(Option::unwrap_or_default)
}

/// Execute one host call.
///
/// `callback_for` turns an export name into a callback that re-enters the
/// guest.
pub async fn execute(
    call: HostCall,
    api: &ExtensionApi,
    logger: &ExtensionLogger,
    callback_for: &(dyn Fn(&str) -> Callback + Send + Sync),
) -> Result<Value, ExtensionError> {
    match call {
        HostCall::GetSongs(options) => opt(api.get_songs(options).await),
        HostCall::GetEntity(options) => opt(api.get_entity(options).await),
        HostCall::AddSongs(songs) => opt(api.add_songs(songs).await),
        HostCall::UpdateSong(song) => opt(api.update_song(song).await),
        HostCall::RemoveSong(song) => opt(api.remove_song(song).await),
        HostCall::GetCurrentSong => opt(api.get_current_song().await),
        HostCall::GetVolume => opt(api.get_volume().await),
        HostCall::GetTime => opt(api.get_time().await),
        HostCall::GetQueue => opt(api.get_queue().await),
        HostCall::GetPlayerState => opt(api.get_player_state().await),
        HostCall::GetPreferences { key, default_value } => {
            opt(api.get_preferences(key.as_deref(), default_value).await)
        }
        HostCall::GetSecure { key, default_value } => {
            opt(api.get_secure(key.as_deref(), default_value).await)
        }
        HostCall::SetPreferences { key, value } => unit(api.set_preferences(&key, value).await),
        HostCall::SetSecure { key, value } => unit(api.set_secure(&key, value).await),
        HostCall::AddUserPreference(pref) => Ok(Value::Bool(api.add_user_preference(pref))),
        HostCall::RemoveUserPreference(key) => Ok(Value::Bool(api.remove_user_preference(&key))),
        HostCall::AddPlaylist(playlist) => api.add_playlist(playlist).await.map(Value::String),
        HostCall::AddSongsToPlaylist { playlist_id, songs } => {
            unit(api.add_songs_to_playlist(&playlist_id, songs).await)
        }
        HostCall::RegisterOauth(path) => unit(api.register_oauth(&path).await),
        HostCall::OpenExternalUrl(url) => unit(api.open_external_url(&url).await),
        HostCall::ShowToast {
            message,
            duration,
            kind,
        } => unit(api.show_toast(&message, duration, kind).await),
        HostCall::RegisterAccount {
            name,
            bg_color,
            icon,
            sign_in,
            sign_out,
        } => api
            .register_account(
                &name,
                &bg_color,
                &icon,
                callback_for(&sign_in),
                callback_for(&sign_out),
            )
            .await
            .map(Value::String),
        HostCall::ChangeAccountAuthStatus {
            id,
            logged_in,
            username,
        } => unit(api.change_account_auth_status(&id, logged_in, username).await),
        HostCall::OpenLoginModal(options) => api.open_login_modal(options).await.map(Value::Bool),
        HostCall::CloseLoginModal => unit(api.close_login_modal().await),
        HostCall::SetArtistEditableInfo { artist_id, object } => {
            unit(api.set_artist_editable_info(&artist_id, object).await)
        }
        HostCall::SetAlbumEditableInfo { album_id, object } => {
            unit(api.set_album_editable_info(&album_id, object).await)
        }
        HostCall::Play => unit(api.play().await),
        HostCall::Pause => unit(api.pause().await),
        HostCall::Stop => unit(api.stop().await),
        HostCall::NextSong => unit(api.next_song().await),
        HostCall::PrevSong => unit(api.prev_song().await),
        HostCall::On { event, handler } => {
            api.on(event, callback_for(&handler));
            Ok(Value::Null)
        }
        HostCall::Off { event } => {
            api.off(event);
            Ok(Value::Null)
        }
        HostCall::SetContextMenuItem(declared) => {
            let items = declared.into_iter().map(|d| d.into_item(callback_for)).collect();
            Ok(json!(api.set_context_menu_item(items)))
        }
        HostCall::RemoveContextMenuItem(index) => {
            api.remove_context_menu_item(index);
            Ok(Value::Null)
        }
        HostCall::GetContextMenuItems => Ok(serde_json::to_value(api.context_menu_items())?),
        HostCall::GetInstalledExtensions => Ok(json!(api.installed_extensions())),
        HostCall::GetPackageName => Ok(json!(api.package_name())),
        HostCall::GetCustomRequestBaseUrl => Ok(json!(api.custom_request_base_url())),
        HostCall::GetArtistExtraInfo(artist) => Ok(api.artist_extra_info(&artist).unwrap_or_default()),
        HostCall::GetAlbumExtraInfo(album) => Ok(api.album_extra_info(&album).unwrap_or_default()),
        HostCall::Log { level, message } => {
            logger.log(level, &message);
            Ok(Value::Null)
        }
    }
}

/// Decode a raw guest request, execute it and encode the response.
pub async fn handle_request(
    request: &str,
    api: &ExtensionApi,
    logger: &ExtensionLogger,
    callback_for: &(dyn Fn(&str) -> Callback + Send + Sync),
) -> String {
    let response = match serde_json::from_str::<HostCall>(request) {
        Ok(call) => match execute(call, api, logger, callback_for).await {
            Ok(value) => HostResponse::Ok(value),
            Err(e) => {
                tracing::debug!(extension = %api.package_name(), error = %e, "host call failed");
                HostResponse::Error(e.to_string())
            }
        },
        Err(e) => {
            tracing::warn!(extension = %api.package_name(), error = %e, "malformed host call");
            HostResponse::Error(format!("malformed host call: {e}"))
        }
    };
    serde_json::to_string(&response)
        .unwrap_or_else(|e| format!(r#"{{"error":"failed to encode response: {e}"}}"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{callback, ExtensionCommunicator};
    use crate::bus::RequestBus;
    use std::sync::{Arc, Mutex};

    struct NoopCommunicator;

    impl ExtensionCommunicator for NoopCommunicator {
        fn installed_extensions(&self) -> Vec<String> {
            vec!["foo".into()]
        }
        fn add_preference(&self, _package: &str, _preference: PreferenceGroup) -> bool {
            true
        }
        fn remove_preference(&self, _package: &str, _key: &str) -> bool {
            false
        }
    }

    fn fixture() -> (Arc<ExtensionApi>, RequestBus, crate::bus::OutboundReceiver, ExtensionLogger) {
        let (bus, rx) = RequestBus::new(None);
        let api = Arc::new(ExtensionApi::new("foo", bus.clone(), Arc::new(NoopCommunicator)));
        (api, bus, rx, ExtensionLogger::new("foo"))
    }

    /// Records requested export names.
    fn recording_callbacks() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback + Send + Sync) {
        let names = Arc::new(Mutex::new(Vec::new()));
        let recorded = names.clone();
        let factory = move |export: &str| {
            recorded.lock().unwrap().push(export.to_string());
            let export = export.to_string();
            callback(move |_| {
                let export = export.clone();
                async move { Ok(json!(export)) }
            })
        };
        (names, factory)
    }

    #[test]
    fn test_host_call_deserialization() {
        let call: HostCall = serde_json::from_str(r#"{"method":"getVolume"}"#).unwrap();
        assert!(matches!(call, HostCall::GetVolume));

        let call: HostCall = serde_json::from_str(
            r#"{"method":"addSongsToPlaylist","args":{"playlistID":"p","songs":[]}}"#,
        )
        .unwrap();
        assert!(matches!(call, HostCall::AddSongsToPlaylist { ref playlist_id, .. } if playlist_id == "p"));

        let call: HostCall = serde_json::from_str(
            r##"{"method":"registerAccount","args":{"name":"n","bgColor":"#000","icon":"i","signIn":"a","signOut":"b"}}"##,
        )
        .unwrap();
        assert!(matches!(call, HostCall::RegisterAccount { ref bg_color, .. } if bg_color == "#000"));

        let call: HostCall =
            serde_json::from_str(r#"{"method":"on","args":{"event":"requestedSearchResult","handler":"search"}}"#)
                .unwrap();
        assert!(matches!(call, HostCall::On { event: ExtraEventType::RequestedSearchResult, .. }));
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(serde_json::from_str::<HostCall>(r#"{"method":"formatDisk"}"#).is_err());
    }

    #[tokio::test]
    async fn test_on_uses_named_export() {
        let (api, _bus, _rx, logger) = fixture();
        let (names, factory) = recording_callbacks();
        let out = handle_request(
            r#"{"method":"on","args":{"event":"requestedLyrics","handler":"lyrics"}}"#,
            &api,
            &logger,
            &factory,
        )
        .await;
        assert_eq!(out, r#"{"ok":null}"#);
        assert_eq!(*names.lock().unwrap(), vec!["lyrics"]);
        assert!(api.is_event_callback_registered(ExtraEventType::RequestedLyrics));
    }

    #[tokio::test]
    async fn test_context_menu_handlers_bound_recursively() {
        let (api, _bus, _rx, logger) = fixture();
        let (names, factory) = recording_callbacks();
        let out = handle_request(
            r#"{"method":"setContextMenuItem","args":[
                {"type":"SONGS","label":"Parent","children":[
                    {"type":"SONGS","label":"Child","handler":"on_child"}
                ]}
            ]}"#,
            &api,
            &logger,
            &factory,
        )
        .await;
        assert_eq!(out, r#"{"ok":1}"#);
        assert_eq!(*names.lock().unwrap(), vec!["on_child"]);

        let items = api.context_menu_items();
        let child_id = &items[0].children.as_ref().unwrap()[0].id;
        let handler = api.context_menu_handler(child_id).unwrap();
        assert_eq!(handler.call(vec![]).await.unwrap(), json!("on_child"));
    }

    #[tokio::test]
    async fn test_request_round_trips_through_bus() {
        let (api, bus, mut rx, logger) = fixture();
        let (_, factory) = recording_callbacks();
        let task = tokio::spawn({
            let api = api.clone();
            let logger = logger.clone();
            async move { handle_request(r#"{"method":"getTime"}"#, &api, &logger, &factory).await }
        });
        let req = rx.recv().await.unwrap();
        assert_eq!(req.kind, "get-time");
        bus.resolve(req.reply(Some(json!(12.5)))).unwrap();
        assert_eq!(task.await.unwrap(), r#"{"ok":12.5}"#);
    }

    #[tokio::test]
    async fn test_local_queries() {
        let (api, _bus, _rx, logger) = fixture();
        let (_, factory) = recording_callbacks();
        let out = handle_request(r#"{"method":"getCustomRequestBaseUrl"}"#, &api, &logger, &factory).await;
        assert_eq!(out, r#"{"ok":"extension://foo"}"#);
        let out = handle_request(r#"{"method":"getInstalledExtensions"}"#, &api, &logger, &factory).await;
        assert_eq!(out, r#"{"ok":["foo"]}"#);
        let out = handle_request(
            r#"{"method":"log","args":{"level":"warn","message":"hi"}}"#,
            &api,
            &logger,
            &factory,
        )
        .await;
        assert_eq!(out, r#"{"ok":null}"#);
    }

    #[tokio::test]
    async fn test_extra_info_returns_own_slice() {
        let (api, _bus, _rx, logger) = fixture();
        let (_, factory) = recording_callbacks();
        let out = handle_request(
            r#"{"method":"getArtistExtraInfo","args":{"artist_extra_info":{"extensions":{"foo":{"k":"v"},"bar":{"k":"w"}}}}}"#,
            &api,
            &logger,
            &factory,
        )
        .await;
        assert_eq!(out, r#"{"ok":{"k":"v"}}"#);

        let out = handle_request(
            r#"{"method":"getAlbumExtraInfo","args":{"album_id":"a1"}}"#,
            &api,
            &logger,
            &factory,
        )
        .await;
        assert_eq!(out, r#"{"ok":null}"#);
    }

    #[tokio::test]
    async fn test_malformed_request_reports_error() {
        let (api, _bus, _rx, logger) = fixture();
        let (_, factory) = recording_callbacks();
        let out = handle_request("not json", &api, &logger, &factory).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert!(value["error"].as_str().unwrap().contains("malformed host call"));
    }
}
