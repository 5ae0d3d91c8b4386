//! TikTok videos, authors, hashtag challenges and sounds.
//!
//! Item lists (`itemList` or `items`) carry videos with their author, music
//! and challenges; user lists (`userList`) carry authors with stats. Each
//! entity kind is keyed by its id and the first version seen wins.

use leech_core::CapturedRequest;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{aggregate, id_field, parse_json, str_field, SiteExtractor, SiteSummary};

static NULL: Value = Value::Null;

/// Count that may be encoded as a number or a numeric string.
fn count(stats: Option<&Value>, key: &str) -> Option<u64> {
    match stats?.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn is_true(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool) == Some(true)
}

fn objects<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|v| v.is_object())
}

/// Video creator, with the stats shipped alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TikTokAuthor {
    pub id: String,
    pub sec_uid: String,
    pub unique_id: String,
    pub nickname: String,
    pub signature: String,
    pub avatar_thumb: String,
    pub avatar_medium: String,
    pub avatar_larger: String,
    pub verified: bool,
    pub private_account: bool,
    pub follower_count: u64,
    pub following_count: u64,
    pub heart_count: u64,
    pub video_count: u64,
    pub digg_count: u64,
}

impl TikTokAuthor {
    /// Normalizes an author object. `stats` falls back to `stats_v2`.
    pub fn from_parts(author: &Value, stats: Option<&Value>, stats_v2: Option<&Value>) -> Option<Self> {
        if !author.is_object() {
            return None;
        }
        let stats = stats.filter(|s| s.is_object()).or(stats_v2);
        Some(Self {
            id: str_field(author, "id"),
            sec_uid: str_field(author, "secUid"),
            unique_id: str_field(author, "uniqueId"),
            nickname: str_field(author, "nickname"),
            signature: str_field(author, "signature").trim().to_string(),
            avatar_thumb: str_field(author, "avatarThumb"),
            avatar_medium: str_field(author, "avatarMedium"),
            avatar_larger: str_field(author, "avatarLarger"),
            verified: is_true(author, "verified"),
            private_account: is_true(author, "privateAccount"),
            follower_count: count(stats, "followerCount").unwrap_or(0),
            following_count: count(stats, "followingCount").unwrap_or(0),
            heart_count: count(stats, "heartCount")
                .or_else(|| count(stats, "heart"))
                .unwrap_or(0),
            video_count: count(stats, "videoCount").unwrap_or(0),
            digg_count: count(stats, "diggCount").unwrap_or(0),
        })
    }
}

/// A hashtag challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TikTokChallenge {
    pub id: String,
    pub title: String,
    pub desc: String,
    pub cover_thumb: String,
    pub profile_thumb: String,
}

impl TikTokChallenge {
    pub fn from_value(c: &Value) -> Option<Self> {
        let id = str_field(c, "id");
        if id.is_empty() {
            return None;
        }
        Some(Self {
            title: str_field(c, "title"),
            desc: str_field(c, "desc").trim().to_string(),
            cover_thumb: str_field(c, "coverThumb"),
            profile_thumb: str_field(c, "profileThumb"),
            id,
        })
    }
}

/// A sound used by videos.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TikTokMusic {
    pub id: String,
    pub title: String,
    pub author_name: String,
    pub duration: Option<u64>,
    pub play_url: String,
    pub cover_thumb: String,
    pub cover_medium: String,
    pub cover_large: String,
    pub original: bool,
    pub is_copyrighted: bool,
}

impl TikTokMusic {
    /// Normalizes a music object. Requires an id.
    pub fn from_value(m: &Value) -> Option<Self> {
        let id = id_field(m, "id")?;
        Some(Self {
            title: str_field(m, "title"),
            author_name: str_field(m, "authorName"),
            duration: m.get("duration").and_then(Value::as_u64),
            play_url: str_field(m, "playUrl"),
            cover_thumb: str_field(m, "coverThumb"),
            cover_medium: str_field(m, "coverMedium"),
            cover_large: str_field(m, "coverLarge"),
            original: is_true(m, "original"),
            is_copyrighted: is_true(m, "isCopyrighted"),
            id,
        })
    }
}

/// A video with its stats, media URLs and captions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TikTokVideo {
    pub id: String,
    pub desc: String,
    pub create_time: i64,
    pub author: Option<TikTokAuthor>,
    pub play_count: u64,
    pub digg_count: u64,
    pub comment_count: u64,
    pub share_count: u64,
    pub collect_count: u64,
    pub repost_count: u64,
    pub play_addr: String,
    pub cover: String,
    pub duration: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub music_id: String,
    pub music_title: String,
    pub music_author: String,
    pub music_play_url: String,
    pub caption_url: String,
    pub caption_language: String,
    pub challenges: Vec<TikTokChallenge>,
    pub hashtags: Vec<String>,
}

impl TikTokVideo {
    /// Normalizes an item. Requires `id` or `aweme_id`.
    pub fn from_item(item: &Value) -> Option<Self> {
        let id = id_field(item, "id").or_else(|| id_field(item, "aweme_id"))?;
        let stats = item
            .get("stats")
            .filter(|s| s.is_object())
            .or_else(|| item.get("statsV2"));
        let video = item.get("video").unwrap_or(&NULL);
        let music = item.get("music").unwrap_or(&NULL);
        let (caption_url, caption_language) = caption(video);
        let stat = |key: &str| count(stats, key).unwrap_or(0);

        Some(Self {
            desc: str_field(item, "desc").trim().to_string(),
            create_time: item.get("createTime").and_then(Value::as_i64).unwrap_or(0),
            author: item
                .get("author")
                .and_then(|a| TikTokAuthor::from_parts(a, item.get("authorStats"), item.get("authorStatsV2"))),
            play_count: stat("playCount"),
            digg_count: stat("diggCount"),
            comment_count: stat("commentCount"),
            share_count: stat("shareCount"),
            collect_count: stat("collectCount"),
            repost_count: stat("repostCount"),
            play_addr: Some(str_field(video, "playAddr"))
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    video
                        .pointer("/PlayAddrStruct/UrlList/0")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default(),
            cover: Some(str_field(video, "cover"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| str_field(video, "originCover")),
            duration: video.get("duration").and_then(Value::as_u64).unwrap_or(0),
            width: video.get("width").and_then(Value::as_u64),
            height: video.get("height").and_then(Value::as_u64),
            music_id: id_field(music, "id").unwrap_or_default(),
            music_title: str_field(music, "title"),
            music_author: str_field(music, "authorName"),
            music_play_url: str_field(music, "playUrl"),
            caption_url,
            caption_language,
            challenges: objects(item, "challenges")
                .filter_map(TikTokChallenge::from_value)
                .collect(),
            hashtags: objects(item, "textExtra")
                .filter_map(|t| t.get("hashtagName").and_then(Value::as_str))
                .filter(|h| !h.is_empty())
                .map(|h| format!("#{h}"))
                .collect(),
            id,
        })
    }
}

/// Subtitle URL and language. Subtitles win over auto captions.
fn caption(video: &Value) -> (String, String) {
    if let Some(sub) = video
        .pointer("/subtitleInfos/0")
        .filter(|s| s.get("Url").and_then(Value::as_str).is_some_and(|u| !u.is_empty()))
    {
        return (str_field(sub, "Url"), str_field(sub, "LanguageCodeName"));
    }
    match video.pointer("/claInfo/captionInfos/0") {
        Some(first) => {
            let url = Some(str_field(first, "url"))
                .filter(|u| !u.is_empty())
                .or_else(|| {
                    first
                        .pointer("/urlList/0")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            let language = Some(str_field(first, "language"))
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| str_field(first, "languageCodeName"));
            (url, language)
        }
        None => Default::default(),
    }
}

/// Items of an `itemList` or `items` response.
pub fn item_list(data: &Value) -> Vec<&Value> {
    let list = data
        .get("itemList")
        .filter(|l| l.is_array())
        .or_else(|| data.get("items"));
    list.and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|i| i.is_object())
        .collect()
}

/// Authors of a `userList` response.
pub fn user_list(data: &Value) -> Vec<TikTokAuthor> {
    objects(data, "userList")
        .filter_map(|entry| {
            TikTokAuthor::from_parts(entry.get("user")?, entry.get("stats"), entry.get("statsV2"))
        })
        .collect()
}

/// Paging and status metadata of a list response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    pub logid: String,
    pub now: Option<i64>,
    pub has_more: bool,
    pub status_code: Option<i64>,
    pub status_msg: String,
}

pub fn list_meta(data: &Value) -> ListMeta {
    let extra = data.get("extra").unwrap_or(&NULL);
    ListMeta {
        logid: str_field(extra, "logid"),
        now: extra.get("now").and_then(Value::as_i64),
        has_more: is_true(data, "hasMore"),
        status_code: data
            .get("statusCode")
            .or_else(|| data.get("status_code"))
            .and_then(Value::as_i64),
        status_msg: Some(str_field(data, "status_msg"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| str_field(data, "statusMsg")),
    }
}

/// Returns true for tiktok.com and its subdomains.
pub fn is_tiktok_host(host: &str) -> bool {
    host == "tiktok.com" || host.ends_with(".tiktok.com")
}

#[derive(Debug, Clone, PartialEq)]
pub enum TikTokEntity {
    Video(TikTokVideo),
    Author(TikTokAuthor),
    Challenge(TikTokChallenge),
    Music(TikTokMusic),
}

/// Videos, authors, challenges and sounds seen across captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TikTokView {
    pub videos: Vec<TikTokVideo>,
    pub authors: Vec<TikTokAuthor>,
    pub challenges: Vec<TikTokChallenge>,
    pub music: Vec<TikTokMusic>,
}

impl TikTokView {
    /// Builds the view from store records.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let mut view = Self::default();
        for entity in aggregate(&TikTokExtractor, records) {
            match entity {
                TikTokEntity::Video(v) => view.videos.push(v),
                TikTokEntity::Author(a) => view.authors.push(a),
                TikTokEntity::Challenge(c) => view.challenges.push(c),
                TikTokEntity::Music(m) => view.music.push(m),
            }
        }
        view
    }
}

/// Extracts TikTok entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct TikTokExtractor;

impl SiteExtractor for TikTokExtractor {
    type Entity = TikTokEntity;

    fn name(&self) -> &'static str {
        "tiktok"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_tiktok_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<TikTokEntity> {
        let Some(data) = record.response_body.as_deref().and_then(parse_json) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        for item in item_list(&data) {
            out.extend(TikTokVideo::from_item(item).map(TikTokEntity::Video));
            out.extend(
                item.get("author")
                    .and_then(|a| {
                        TikTokAuthor::from_parts(a, item.get("authorStats"), item.get("authorStatsV2"))
                    })
                    .map(TikTokEntity::Author),
            );
            out.extend(
                objects(item, "challenges")
                    .filter_map(TikTokChallenge::from_value)
                    .map(TikTokEntity::Challenge),
            );
            out.extend(
                item.get("music")
                    .and_then(TikTokMusic::from_value)
                    .map(TikTokEntity::Music),
            );
        }
        out.extend(user_list(&data).into_iter().map(TikTokEntity::Author));
        out
    }

    fn key(&self, entity: &TikTokEntity) -> String {
        match entity {
            TikTokEntity::Video(v) => format!("video:{}", v.id),
            TikTokEntity::Author(a) => format!("author:{}", a.id),
            TikTokEntity::Challenge(c) => format!("challenge:{}", c.id),
            TikTokEntity::Music(m) => format!("music:{}", m.id),
        }
    }

    fn merge(&self, _existing: &mut TikTokEntity, _incoming: TikTokEntity) {}

    fn finish(&self, mut entities: Vec<TikTokEntity>) -> Vec<TikTokEntity> {
        entities.retain(|e| !matches!(e, TikTokEntity::Author(a) if a.id.is_empty()));
        entities
    }
}

impl SiteSummary for TikTokExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_tiktok_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(TikTokView::from_records(records)).unwrap_or(Value::Null)
    }
}
