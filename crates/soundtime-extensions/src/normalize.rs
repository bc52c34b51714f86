//! Namespacing of entities returned by provider extensions.
//!
//! Every song, playlist, album and artist id an extension hands back is
//! rewritten to `"{package}:{id}"` so results merged from several providers
//! never collide.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::events::ExtraEventType;

/// Whether `response` asks the host to consult another provider instead.
pub fn is_forward_request(response: &Value) -> bool {
    match response.get("forwardTo") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

/// Rewrite `response` in place according to the event that produced it.
///
/// `null` responses and forward directives are left untouched.
pub fn normalize_response(kind: ExtraEventType, package: &str, response: &mut Value) {
    if response.is_null() || is_forward_request(response) {
        return;
    }

    match kind {
        ExtraEventType::RequestedPlaylists => {
            update_field(response, "playlists", |v| sanitize_playlists(package, false, v));
        }
        ExtraEventType::RequestedPlaylistFromUrl => {
            update_field(response, "playlist", |v| sanitize_playlist(package, false, v));
            update_field(response, "songs", |v| sanitize_songs(package, v));
        }
        ExtraEventType::RequestedPlaylistSongs
        | ExtraEventType::RequestedRecommendations
        | ExtraEventType::RequestedArtistSongs
        | ExtraEventType::RequestedAlbumSongs => {
            update_field(response, "songs", |v| sanitize_songs(package, v));
        }
        ExtraEventType::RequestedSongFromUrl | ExtraEventType::RequestedSongFromId => {
            update_field(response, "song", |v| sanitize_song(package, v));
        }
        ExtraEventType::RequestedSearchResult => {
            update_field(response, "songs", |v| sanitize_songs(package, v));
            update_field(response, "playlists", |v| sanitize_playlists(package, false, v));
            update_field(response, "artists", |v| sanitize_artists(package, v));
            update_field(response, "albums", |v| sanitize_albums(package, v));
        }
        _ => {}
    }
}

/// Remove this package's namespace from a playlist id before handing it
/// back to the extension that owns it.
pub fn strip_package_prefix(package: &str, id: &mut Value) {
    if let Value::String(s) = id {
        let prefix = format!("{package}:");
        if let Some(rest) = s.strip_prefix(&prefix) {
            *s = rest.to_string();
        }
    }
}

fn update_field(target: &mut Value, field: &str, f: impl FnOnce(&mut Value)) {
    if let Some(value) = target.get_mut(field) {
        if !value.is_null() {
            f(value);
        }
    }
}

fn for_each_object(list: &mut Value, mut f: impl FnMut(&mut Map<String, Value>)) {
    if let Value::Array(items) = list {
        for item in items.iter_mut() {
            if let Value::Object(obj) = item {
                f(obj);
            }
        }
    }
}

fn namespaced_id(package: &str, id: Option<&Value>) -> Value {
    let raw = match id {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    Value::String(format!("{package}:{raw}"))
}

/// Stringify every value of an extension's extra-info map.
fn sanitize_extra_info(info: Option<&Value>) -> Value {
    let mut out = Map::new();
    if let Some(Value::Object(entries)) = info {
        for (key, value) in entries {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(key.clone(), Value::String(text));
        }
    }
    Value::Object(out)
}

fn rekey_extra_info(package: &str, obj: &mut Map<String, Value>, field: &str) {
    let own = obj
        .get(field)
        .and_then(|v| v.get("extensions"))
        .and_then(|v| v.get(package));
    let sanitized = sanitize_extra_info(own);

    let mut extensions = Map::new();
    extensions.insert(package.to_string(), sanitized);
    let mut wrapper = Map::new();
    wrapper.insert("extensions".to_string(), Value::Object(extensions));
    obj.insert(field.to_string(), Value::Object(wrapper));
}

fn sanitize_song_object(package: &str, song: &mut Map<String, Value>) {
    if let Some(artists) = song.get_mut("artists") {
        sanitize_artists(package, artists);
    }
    if let Some(album) = song.get_mut("album") {
        if let Value::Object(obj) = album {
            sanitize_album_object(package, obj);
        }
    }
    let id = namespaced_id(package, song.get("_id"));
    song.insert("_id".into(), id);
    song.insert("providerExtension".into(), Value::String(package.into()));
}

fn sanitize_album_object(package: &str, album: &mut Map<String, Value>) {
    let id = namespaced_id(package, album.get("album_id"));
    album.insert("album_id".into(), id);
    rekey_extra_info(package, album, "album_extra_info");
}

fn sanitize_artist_object(package: &str, artist: &mut Map<String, Value>) {
    let id = namespaced_id(package, artist.get("artist_id"));
    artist.insert("artist_id".into(), id);
    rekey_extra_info(package, artist, "artist_extra_info");
}

fn sanitize_playlist_object(package: &str, is_local: bool, playlist: &mut Map<String, Value>) {
    let id = namespaced_id(package, playlist.get("playlist_id"));
    playlist.insert("playlist_id".into(), id);
    playlist.insert("extension".into(), Value::String(package.into()));
    playlist.insert("isLocal".into(), Value::Bool(is_local));
}

pub fn sanitize_song(package: &str, song: &mut Value) {
    if let Value::Object(obj) = song {
        sanitize_song_object(package, obj);
    }
}

pub fn sanitize_songs(package: &str, songs: &mut Value) {
    for_each_object(songs, |s| sanitize_song_object(package, s));
}

pub fn sanitize_playlist(package: &str, is_local: bool, playlist: &mut Value) {
    if let Value::Object(obj) = playlist {
        sanitize_playlist_object(package, is_local, obj);
    }
}

pub fn sanitize_playlists(package: &str, is_local: bool, playlists: &mut Value) {
    for_each_object(playlists, |p| sanitize_playlist_object(package, is_local, p));
}

pub fn sanitize_albums(package: &str, albums: &mut Value) {
    for_each_object(albums, |a| sanitize_album_object(package, a));
}

pub fn sanitize_artists(package: &str, artists: &mut Value) {
    for_each_object(artists, |a| sanitize_artist_object(package, a));
}
