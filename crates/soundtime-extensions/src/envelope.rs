//! Wire envelope shared by both directions of the extension host channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One framed unit of the wire protocol.
///
/// `channel` only correlates a reply with its request. It is never reused
/// as a persistent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_name: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            channel: channel.into(),
            data: None,
            extension_name: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_extension_name(mut self, name: impl Into<String>) -> Self {
        self.extension_name = Some(name.into());
        self
    }

    /// Build the reply to this envelope, echoing its type, channel and
    /// extension name.
    pub fn reply(&self, data: Option<Value>) -> Self {
        Self {
            kind: self.kind.clone(),
            channel: self.channel.clone(),
            data,
            extension_name: self.extension_name.clone(),
        }
    }

    /// Payload or `null` when absent.
    pub fn data_or_null(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }
}

/// Lifecycle events delivered straight to plugin instances.
pub const EXTENSION_EVENT_TYPES: &[&str] = &["onStarted", "onStopped"];

/// Commands the host application sends to the extension host.
pub const MAIN_REQUEST_TYPES: &[&str] = &[
    "getInstalledExtensions",
    "findNewExtensions",
    "toggleExtensionStatus",
    "removeExtension",
    "stopProcess",
    "getExtensionIcon",
    "extraExtensionEvents",
    "getExtensionContextMenu",
    "onClickedContextMenu",
    "set-log-level",
    "getAccounts",
    "performAccountLogin",
    "getDisplayName",
];

/// Provider capability queries.
pub const PROVIDER_REQUEST_TYPES: &[&str] = &["getExtensionProviderScopes"];

/// Requests a plugin sends to the host application through its
/// capability object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionRequest {
    GetSongs,
    GetEntity,
    GetCurrentSong,
    GetVolume,
    GetTime,
    GetQueue,
    GetPlayerState,
    GetPreferences,
    GetSecurePreferences,
    SetPreferences,
    SetSecurePreferences,
    AddSongs,
    UpdateSong,
    RemoveSong,
    AddPlaylist,
    AddSongToPlaylist,
    RegisterOauth,
    OpenExternal,
    ShowToast,
    RegisterAccount,
    OpenLoginModal,
    CloseLoginModal,
    ExtensionUpdated,
    UpdatePreferences,
    SetArtistEditableInfo,
    SetAlbumEditableInfo,
    Play,
    Pause,
    Stop,
    Next,
    Prev,
}

impl ExtensionRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSongs => "get-songs",
            Self::GetEntity => "get-entity",
            Self::GetCurrentSong => "get-current-song",
            Self::GetVolume => "get-volume",
            Self::GetTime => "get-time",
            Self::GetQueue => "get-queue",
            Self::GetPlayerState => "get-player-state",
            Self::GetPreferences => "get-preferences",
            Self::GetSecurePreferences => "get-secure-preferences",
            Self::SetPreferences => "set-preferences",
            Self::SetSecurePreferences => "set-secure-preferences",
            Self::AddSongs => "add-songs",
            Self::UpdateSong => "update-song",
            Self::RemoveSong => "remove-song",
            Self::AddPlaylist => "add-playlist",
            Self::AddSongToPlaylist => "add-song-to-playlist",
            Self::RegisterOauth => "register-oauth",
            Self::OpenExternal => "open-external",
            Self::ShowToast => "show-toast",
            Self::RegisterAccount => "register-account",
            Self::OpenLoginModal => "open-login-modal",
            Self::CloseLoginModal => "close-login-modal",
            Self::ExtensionUpdated => "extension-updated",
            Self::UpdatePreferences => "update-preferences",
            Self::SetArtistEditableInfo => "set-artist-editable-info",
            Self::SetAlbumEditableInfo => "set-album-editable-info",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Prev => "prev",
        }
    }
}

impl std::fmt::Display for ExtensionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
