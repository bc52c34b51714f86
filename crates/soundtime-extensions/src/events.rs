//! Event types delivered to extensions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle methods the host invokes on extension instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    OnStarted,
    OnStopped,
}

impl LifecycleEvent {
    /// Name of the method invoked on the extension instance.
    pub fn method(&self) -> &'static str {
        match self {
            Self::OnStarted => "onStarted",
            Self::OnStopped => "onStopped",
        }
    }

    pub fn from_method(name: &str) -> Option<Self> {
        match name {
            "onStarted" => Some(Self::OnStarted),
            "onStopped" => Some(Self::OnStopped),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// A lifecycle event forwarded by the host, optionally for one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionEventMessage {
    #[serde(rename = "type")]
    pub event: LifecycleEvent,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub package_name: Option<String>,
}

/// Events an extension subscribes to through `on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtraEventType {
    RequestedPlaylists,
    RequestedPlaylistSongs,
    OauthCallback,
    SongQueueChanged,
    Seeked,
    VolumeChanged,
    PlayerStateChanged,
    SongChanged,
    PreferenceChanged,
    PlaybackDetailsRequested,
    CustomRequest,
    #[serde(rename = "requestedSongFromURL")]
    RequestedSongFromUrl,
    #[serde(rename = "requestedPlaylistFromURL")]
    RequestedPlaylistFromUrl,
    RequestedSearchResult,
    RequestedRecommendations,
    RequestedLyrics,
    RequestedArtistSongs,
    RequestedAlbumSongs,
    SongAdded,
    SongRemoved,
    PlaylistAdded,
    PlaylistRemoved,
    RequestedSongFromId,
    #[serde(rename = "getRemoteURL")]
    GetRemoteUrl,
}

impl ExtraEventType {
    pub const ALL: [ExtraEventType; 24] = [
        Self::RequestedPlaylists,
        Self::RequestedPlaylistSongs,
        Self::OauthCallback,
        Self::SongQueueChanged,
        Self::Seeked,
        Self::VolumeChanged,
        Self::PlayerStateChanged,
        Self::SongChanged,
        Self::PreferenceChanged,
        Self::PlaybackDetailsRequested,
        Self::CustomRequest,
        Self::RequestedSongFromUrl,
        Self::RequestedPlaylistFromUrl,
        Self::RequestedSearchResult,
        Self::RequestedRecommendations,
        Self::RequestedLyrics,
        Self::RequestedArtistSongs,
        Self::RequestedAlbumSongs,
        Self::SongAdded,
        Self::SongRemoved,
        Self::PlaylistAdded,
        Self::PlaylistRemoved,
        Self::RequestedSongFromId,
        Self::GetRemoteUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestedPlaylists => "requestedPlaylists",
            Self::RequestedPlaylistSongs => "requestedPlaylistSongs",
            Self::OauthCallback => "oauthCallback",
            Self::SongQueueChanged => "songQueueChanged",
            Self::Seeked => "seeked",
            Self::VolumeChanged => "volumeChanged",
            Self::PlayerStateChanged => "playerStateChanged",
            Self::SongChanged => "songChanged",
            Self::PreferenceChanged => "preferenceChanged",
            Self::PlaybackDetailsRequested => "playbackDetailsRequested",
            Self::CustomRequest => "customRequest",
            Self::RequestedSongFromUrl => "requestedSongFromURL",
            Self::RequestedPlaylistFromUrl => "requestedPlaylistFromURL",
            Self::RequestedSearchResult => "requestedSearchResult",
            Self::RequestedRecommendations => "requestedRecommendations",
            Self::RequestedLyrics => "requestedLyrics",
            Self::RequestedArtistSongs => "requestedArtistSongs",
            Self::RequestedAlbumSongs => "requestedAlbumSongs",
            Self::SongAdded => "songAdded",
            Self::SongRemoved => "songRemoved",
            Self::PlaylistAdded => "playlistAdded",
            Self::PlaylistRemoved => "playlistRemoved",
            Self::RequestedSongFromId => "requestedSongFromId",
            Self::GetRemoteUrl => "getRemoteURL",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Provider scope advertised by registering a callback for this event.
    pub fn provider_scope(&self) -> Option<ProviderScope> {
        match self {
            Self::RequestedSearchResult => Some(ProviderScope::Search),
            Self::RequestedAlbumSongs => Some(ProviderScope::AlbumSongs),
            Self::RequestedArtistSongs => Some(ProviderScope::ArtistSongs),
            Self::RequestedPlaylists => Some(ProviderScope::Playlists),
            Self::RequestedPlaylistSongs => Some(ProviderScope::PlaylistSongs),
            Self::RequestedPlaylistFromUrl => Some(ProviderScope::PlaylistFromUrl),
            Self::RequestedSongFromUrl => Some(ProviderScope::SongFromUrl),
            Self::RequestedRecommendations => Some(ProviderScope::Recommendations),
            Self::PlaybackDetailsRequested => Some(ProviderScope::PlaybackDetails),
            _ => None,
        }
    }
}

impl fmt::Display for ExtraEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extra event fanned out to started extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraEvent {
    #[serde(rename = "type")]
    pub kind: ExtraEventType,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
}

impl ExtraEvent {
    pub fn new(kind: ExtraEventType, data: Vec<Value>) -> Self {
        Self {
            kind,
            data,
            package_name: None,
        }
    }
}

/// Capabilities a provider extension can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderScope {
    Search,
    Playlists,
    PlaylistSongs,
    ArtistSongs,
    AlbumSongs,
    Recommendations,
    PlaylistFromUrl,
    SongFromUrl,
    PlaybackDetails,
}

/// Where a context-menu entry is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextMenuKind {
    Songs,
    GeneralSongs,
    Playlist,
    GeneralPlaylist,
    PlaylistContent,
    QueueItem,
    Artist,
    Album,
    CurrentSong,
}
