//! SoundCloud tracks.
//!
//! Track metadata, comments and resolved stream URLs arrive in separate API
//! responses. They are joined by track id.

use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{id_field, parse_json, str_field, SiteExtractor, SiteSummary};

const PLAYBACK_DOMAIN: &str = "playback.media-streaming.soundcloud.cloud";

static MEDIA_TRACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"api-v2\.soundcloud\.com/media/soundcloud:tracks:(\d+)").unwrap());
static TRACK_BY_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"api-v2\.soundcloud\.com/tracks/(\d+)").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommentUser {
    pub avatar_url: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackComment {
    pub body: String,
    pub created_at: String,
    pub user: CommentUser,
}

/// A track assembled from metadata, comments and stream responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoundCloudTrack {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub avatar_url: String,
    pub artwork_url: String,
    /// Milliseconds.
    pub duration: u64,
    pub description: String,
    pub permalink_url: String,
    pub stream_url: String,
    pub comments: Vec<TrackComment>,
}

impl SoundCloudTrack {
    fn with_id(track_id: &str) -> Self {
        Self {
            track_id: track_id.to_string(),
            ..Self::default()
        }
    }

    /// Fills fields from `other`, preferring its non-empty values, and appends
    /// its comments.
    pub fn merge_from(&mut self, other: SoundCloudTrack) {
        fn fill(slot: &mut String, incoming: String) {
            if !incoming.is_empty() {
                *slot = incoming;
            }
        }
        fill(&mut self.title, other.title);
        fill(&mut self.artist, other.artist);
        fill(&mut self.avatar_url, other.avatar_url);
        fill(&mut self.artwork_url, other.artwork_url);
        fill(&mut self.description, other.description);
        fill(&mut self.permalink_url, other.permalink_url);
        fill(&mut self.stream_url, other.stream_url);
        if other.duration > 0 {
            self.duration = other.duration;
        }
        self.comments.extend(other.comments);
    }

    /// Returns true if the track has something worth showing.
    pub fn is_presentable(&self) -> bool {
        is_playback_url(&self.stream_url)
            || !self.comments.is_empty()
            || !self.title.is_empty()
            || !self.artist.is_empty()
    }
}

/// Returns true for soundcloud.com and its subdomains.
pub fn is_soundcloud_host(host: &str) -> bool {
    host == "soundcloud.com" || host.ends_with(".soundcloud.com")
}

/// Returns true if `url` points at downloadable audio.
pub fn is_playback_url(url: &str) -> bool {
    url.contains(PLAYBACK_DOMAIN)
        || url.contains("cf-media.sndcdn.com")
        || url.contains("ec-media.sndcdn.com")
        || url.contains(".m3u8")
        || url.contains(".mp3")
}

fn user_name(user: &Value) -> String {
    let username = str_field(user, "username");
    if !username.is_empty() {
        return username;
    }
    let full = str_field(user, "full_name");
    if !full.is_empty() {
        return full;
    }
    [str_field(user, "first_name"), str_field(user, "last_name")]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalizes a track object. Requires an id.
pub fn parse_track(obj: &Value) -> Option<SoundCloudTrack> {
    let track_id = id_field(obj, "id")?;
    let user = obj.get("user").cloned().unwrap_or(Value::Null);

    let mut artwork_url = str_field(obj, "artwork_url");
    if artwork_url.is_empty() {
        artwork_url = str_field(obj, "artwork_url_template");
    }
    let artwork_url = artwork_url.replace("{size}", "t500x500");

    let permalink_url = match str_field(obj, "permalink_url") {
        p if p.is_empty() => match str_field(obj, "permalink") {
            slug if slug.is_empty() => String::new(),
            slug => format!("https://soundcloud.com/{slug}"),
        },
        p => p,
    };

    Some(SoundCloudTrack {
        track_id,
        title: str_field(obj, "title").trim().to_string(),
        artist: user_name(&user),
        avatar_url: str_field(&user, "avatar_url"),
        artwork_url,
        duration: obj.get("duration").and_then(Value::as_u64).unwrap_or(0),
        description: str_field(obj, "description").trim().to_string(),
        permalink_url,
        stream_url: String::new(),
        comments: Vec::new(),
    })
}

fn collection(data: &Value) -> &[Value] {
    data.get("collection")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Tracks in a response: the body itself and every item of `collection`.
pub fn parse_tracks(data: &Value) -> Vec<SoundCloudTrack> {
    parse_track(data)
        .into_iter()
        .chain(
            collection(data)
                .iter()
                .filter(|item| item.get("kind").and_then(Value::as_str) != Some("comment"))
                .filter_map(parse_track),
        )
        .collect()
}

/// Comments in a response, as partial tracks keyed by `track_id`.
pub fn parse_comments(data: &Value) -> Vec<SoundCloudTrack> {
    collection(data)
        .iter()
        .filter(|item| item.get("kind").and_then(Value::as_str) == Some("comment"))
        .filter_map(|item| {
            let track_id = id_field(item, "track_id")?;
            let user = item.get("user").cloned().unwrap_or(Value::Null);
            let username = match user_name(&user) {
                name if name.is_empty() => "User".to_string(),
                name => name,
            };
            let mut track = SoundCloudTrack::with_id(&track_id);
            track.comments.push(TrackComment {
                body: str_field(item, "body"),
                created_at: str_field(item, "created_at"),
                user: CommentUser {
                    avatar_url: str_field(&user, "avatar_url"),
                    username,
                },
            });
            Some(track)
        })
        .collect()
}

/// Stream URL of a media resolution response, if it looks like audio.
pub fn parse_stream_url(data: &Value) -> Option<String> {
    let url = data.get("url")?.as_str()?.trim();
    let is_stream = url.contains(".m3u8")
        || url.contains(".mp3")
        || url.contains(".ogg")
        || url.contains(PLAYBACK_DOMAIN)
        || url.contains("sndcdn.com");
    (is_stream && !url.is_empty()).then(|| url.to_string())
}

/// Track id encoded in a media or track API URL.
pub fn track_id_from_url(url: &str) -> Option<String> {
    MEDIA_TRACK
        .captures(url)
        .or_else(|| TRACK_BY_ID.captures(url))
        .map(|c| c[1].to_string())
}

/// Extracts SoundCloud tracks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoundCloudExtractor;

impl SiteExtractor for SoundCloudExtractor {
    type Entity = SoundCloudTrack;

    fn name(&self) -> &'static str {
        "soundcloud"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_soundcloud_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<SoundCloudTrack> {
        let Some(data) = record.response_body.as_deref().and_then(parse_json) else {
            return Vec::new();
        };

        let mut out = parse_tracks(&data);
        out.extend(parse_comments(&data));

        let url_track = track_id_from_url(&record.url)
            .or_else(|| parse_tracks(&data).into_iter().next().map(|t| t.track_id));
        if let (Some(track_id), Some(stream_url)) = (url_track, parse_stream_url(&data)) {
            let mut track = SoundCloudTrack::with_id(&track_id);
            track.stream_url = stream_url;
            out.push(track);
        }

        out
    }

    fn key(&self, entity: &SoundCloudTrack) -> String {
        entity.track_id.clone()
    }

    fn merge(&self, existing: &mut SoundCloudTrack, incoming: SoundCloudTrack) {
        existing.merge_from(incoming);
    }

    fn detail(&self, entity: &SoundCloudTrack) -> String {
        format!(
            "{}{}{}",
            entity.title.len(),
            entity.comments.len(),
            u8::from(!entity.stream_url.is_empty())
        )
    }

    fn finish(&self, mut entities: Vec<SoundCloudTrack>) -> Vec<SoundCloudTrack> {
        entities.retain(SoundCloudTrack::is_presentable);
        entities
    }
}

impl SiteSummary for SoundCloudExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_soundcloud_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        let tracks = crate::extractor::aggregate(self, records);
        serde_json::json!({ "tracks": tracks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::aggregate;
    use chrono::DateTime;
    use leech_core::RequestType;
    use serde_json::json;

    fn record(url: &str, response: Value) -> CapturedRequest {
        CapturedRequest {
            id: 1.0,
            url: url.into(),
            method: "GET".into(),
            headers: vec![],
            body: None,
            response_body: Some(response.to_string()),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    #[test]
    fn parses_single_track() {
        let track = parse_track(&json!({
            "id": 42,
            "title": "  Song ",
            "duration": 185000,
            "artwork_url_template": "https://i1.sndcdn.com/artworks-x-{size}.jpg",
            "permalink": "artist/song",
            "user": {"first_name": "Ada", "last_name": "L"}
        }))
        .unwrap();
        assert_eq!(track.track_id, "42");
        assert_eq!(track.title, "Song");
        assert_eq!(track.artist, "Ada L");
        assert_eq!(track.artwork_url, "https://i1.sndcdn.com/artworks-x-t500x500.jpg");
        assert_eq!(track.permalink_url, "https://soundcloud.com/artist/song");
    }

    #[test]
    fn track_requires_id() {
        assert!(parse_track(&json!({"title": "x"})).is_none());
    }

    #[test]
    fn stream_urls() {
        assert_eq!(
            parse_stream_url(&json!({"url": " https://cf-media.sndcdn.com/a.mp3 "})).as_deref(),
            Some("https://cf-media.sndcdn.com/a.mp3")
        );
        assert_eq!(parse_stream_url(&json!({"url": "https://example.com/page"})), None);
        assert!(is_playback_url("https://x/playlist.m3u8"));
        assert!(!is_playback_url("https://x/file.ogg"));
    }

    #[test]
    fn url_track_ids() {
        assert_eq!(
            track_id_from_url("https://api-v2.soundcloud.com/media/soundcloud:tracks:77/abc/stream/hls")
                .as_deref(),
            Some("77")
        );
        assert_eq!(
            track_id_from_url("https://api-v2.soundcloud.com/tracks/88?client_id=x").as_deref(),
            Some("88")
        );
        assert_eq!(track_id_from_url("https://soundcloud.com/discover"), None);
    }

    #[test]
    fn joins_metadata_comments_and_stream() {
        let records = vec![
            record(
                "https://api-v2.soundcloud.com/tracks?ids=1,2",
                json!({"collection": [
                    {"id": 1, "title": "One", "user": {"username": "dj"}},
                    {"id": 2}
                ]}),
            ),
            record(
                "https://api-v2.soundcloud.com/tracks/1/comments",
                json!({"collection": [
                    {"kind": "comment", "track_id": 1, "body": "nice", "user": {}},
                    {"kind": "comment", "body": "orphan"}
                ]}),
            ),
            record(
                "https://api-v2.soundcloud.com/media/soundcloud:tracks:1/x/stream/hls",
                json!({"url": "https://playback.media-streaming.soundcloud.cloud/1/playlist.m3u8"}),
            ),
            record(
                "https://example.com/tracks",
                json!({"id": 9, "title": "Elsewhere"}),
            ),
        ];

        let tracks = aggregate(&SoundCloudExtractor, &records);
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.title, "One");
        assert_eq!(t.artist, "dj");
        assert_eq!(t.comments.len(), 1);
        assert_eq!(t.comments[0].user.username, "User");
        assert!(is_playback_url(&t.stream_url));
    }

    #[test]
    fn merge_prefers_non_empty() {
        let mut a = SoundCloudTrack::with_id("1");
        a.title = "Old".into();
        a.duration = 10;
        let mut b = SoundCloudTrack::with_id("1");
        b.artist = "New".into();
        a.merge_from(b);
        assert_eq!(a.title, "Old");
        assert_eq!(a.artist, "New");
        assert_eq!(a.duration, 10);
    }
}
