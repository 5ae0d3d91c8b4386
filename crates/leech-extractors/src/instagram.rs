//! Instagram feed posts and profiles.
//!
//! Posts are found wherever a GraphQL response carries an `edges` list of
//! media nodes. Profiles come from `user` objects. Both keep the most
//! complete version seen: the longest caption or biography wins.

use std::collections::HashSet;

use leech_core::payload::encode_uri_component;
use leech_core::CapturedRequest;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{aggregate, id_field, parse_json, str_field, SiteExtractor, SiteSummary};

/// Edge lists nested deeper than this are not searched.
const MAX_EDGE_DEPTH: usize = 6;

/// Fields of which a media node needs at least one.
const MEDIA_FIELDS: &[&str] = &["caption", "image_versions2", "video_versions", "carousel_media"];

fn present(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(|v| !v.is_null())
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(|v| match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    })
}

fn url_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("url").and_then(Value::as_str))
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// Path of a media URL; CDN variants of one file share it.
fn media_key(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Drops URLs whose path was already seen, keeping the first.
pub fn dedupe_media_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(media_key(u))).collect()
}

/// Cleans an image URL copied out of escaped markup.
pub fn normalize_image_url(url: &str) -> String {
    let mut out = url.trim().to_string();
    for escaped in ["\\u0026", "\\U0026", "&amp;", "&AMP;"] {
        out = out.replace(escaped, "&");
    }
    match out.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => out,
    }
}

/// URLs to try when loading an image: the cleaned URL, then without query.
pub fn image_url_candidates(url: &str) -> Vec<String> {
    let base = normalize_image_url(url);
    if base.is_empty() {
        return Vec::new();
    }
    let mut out = vec![base.clone()];
    if let Ok(parsed) = url::Url::parse(&base) {
        if parsed.query().is_some() {
            let bare = format!("{}{}", parsed.origin().ascii_serialization(), parsed.path());
            if bare != base {
                out.push(bare);
            }
        }
    }
    out
}

/// Author, tagged user or coauthor of a post.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstagramUser {
    pub pk: String,
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub profile_pic_url: String,
    pub is_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

impl InstagramUser {
    fn from_value(u: &Value) -> Self {
        Self {
            pk: id_field(u, "pk").unwrap_or_default(),
            id: id_field(u, "id").unwrap_or_default(),
            username: str_field(u, "username"),
            full_name: str_field(u, "full_name"),
            profile_pic_url: u
                .pointer("/hd_profile_pic_url_info/url")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| str_field(u, "profile_pic_url")),
            is_verified: flag(u, "is_verified"),
            position: None,
        }
    }

    fn is_named(&self) -> bool {
        !self.username.is_empty() || !self.pk.is_empty()
    }
}

/// One slide of a carousel post.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CarouselItem {
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub accessibility_caption: Option<String>,
}

/// A feed post.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstagramPost {
    pub pk: String,
    pub id: String,
    pub code: String,
    pub post_url: Option<String>,
    pub author: InstagramUser,
    pub caption: String,
    pub caption_created_at: Option<i64>,
    pub taken_at: Option<i64>,
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub carousel: Vec<CarouselItem>,
    pub usertags: Vec<InstagramUser>,
    pub coauthors: Vec<InstagramUser>,
    pub comment_count: Option<u64>,
    pub like_count: Option<u64>,
    pub view_count: Option<u64>,
    pub product_type: String,
    pub media_type: Option<i64>,
    pub link: Option<String>,
    pub location: Option<Value>,
    pub is_paid_partnership: bool,
    pub sponsor_tags: Option<Value>,
    pub original_sound_title: Option<String>,
    pub accessibility_caption: Option<String>,
}

impl InstagramPost {
    /// Normalizes a media node. Requires a pk, or an id to derive one from.
    pub fn from_node(node: &Value) -> Option<Self> {
        let pk = id_field(node, "pk").or_else(|| {
            node.get("id")
                .and_then(Value::as_str)
                .and_then(|id| id.split('_').next())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })?;
        let author = node.get("user").map(InstagramUser::from_value).unwrap_or_default();
        let caption = node.get("caption").filter(|c| c.is_object());
        let caption_created_at = caption.and_then(|c| c.get("created_at")).and_then(Value::as_i64);
        let code = str_field(node, "code");
        let opt = |key: &str| node.get(key).filter(|v| !v.is_null()).cloned();

        Some(Self {
            id: id_field(node, "id").unwrap_or_else(|| format!("{pk}_{}", author.pk)),
            post_url: (!code.is_empty()).then(|| format!("https://www.instagram.com/p/{code}/")),
            caption: caption
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            caption_created_at,
            taken_at: node.get("taken_at").and_then(Value::as_i64).or(caption_created_at),
            image_urls: dedupe_media_urls(url_list(node.pointer("/image_versions2/candidates"))),
            video_urls: dedupe_media_urls(url_list(node.get("video_versions"))),
            carousel: node
                .get("carousel_media")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(|item| CarouselItem {
                    image_urls: url_list(item.pointer("/image_versions2/candidates")),
                    video_urls: url_list(item.get("video_versions")),
                    accessibility_caption: item
                        .get("accessibility_caption")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect(),
            usertags: node
                .pointer("/usertags/in")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|tag| {
                    let mut user = InstagramUser::from_value(tag.get("user")?);
                    user.id.clear();
                    user.position = tag.get("position").cloned();
                    user.is_named().then_some(user)
                })
                .collect(),
            coauthors: node
                .get("coauthor_producers")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(InstagramUser::from_value)
                .filter(InstagramUser::is_named)
                .collect(),
            comment_count: node.get("comment_count").and_then(Value::as_u64),
            like_count: node.get("like_count").and_then(Value::as_u64),
            view_count: node.get("view_count").and_then(Value::as_u64),
            product_type: str_field(node, "product_type"),
            media_type: node.get("media_type").and_then(Value::as_i64),
            link: node
                .get("link")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            location: opt("location"),
            is_paid_partnership: flag(node, "is_paid_partnership"),
            sponsor_tags: opt("sponsor_tags"),
            original_sound_title: node
                .pointer("/clips_metadata/original_sound_info/original_audio_title")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            accessibility_caption: node
                .get("accessibility_caption")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            author,
            code,
            pk,
        })
    }
}

/// Media nodes of every `edges` list in a response, searched breadth-limited.
pub fn feed_nodes(data: &Value) -> Vec<&Value> {
    let root = data.get("data").filter(|d| d.is_object()).unwrap_or(data);
    let mut nodes = Vec::new();
    collect_edges(root, 0, &mut nodes);
    nodes
}

fn collect_edges<'a>(value: &'a Value, depth: usize, out: &mut Vec<&'a Value>) {
    if depth > MAX_EDGE_DEPTH {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_edges(item, depth + 1, out);
            }
        }
        Value::Object(map) => {
            if let Some(edges) = map.get("edges").and_then(Value::as_array) {
                out.extend(edges.iter().filter_map(|e| e.get("node")).filter(|node| {
                    (present(node, "code") || present(node, "pk"))
                        && MEDIA_FIELDS.iter().any(|f| present(node, f))
                }));
                return;
            }
            for child in map.values() {
                collect_edges(child, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Feed posts of a response.
pub fn parse_feed(data: &Value) -> Vec<InstagramPost> {
    feed_nodes(data)
        .into_iter()
        .filter_map(InstagramPost::from_node)
        .collect()
}

/// Relationship between the viewer and a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Friendship {
    pub following: bool,
    pub followed_by: bool,
    pub blocking: bool,
    pub is_restricted: bool,
    pub is_bestie: bool,
    pub is_feed_favorite: bool,
    pub outgoing_request: bool,
    pub incoming_request: bool,
    pub muting: bool,
    pub is_muting_reel: bool,
}

impl Friendship {
    fn from_value(fs: &Value) -> Self {
        Self {
            following: flag(fs, "following"),
            followed_by: flag(fs, "followed_by"),
            blocking: flag(fs, "blocking"),
            is_restricted: flag(fs, "is_restricted"),
            is_bestie: flag(fs, "is_bestie"),
            is_feed_favorite: flag(fs, "is_feed_favorite"),
            outgoing_request: flag(fs, "outgoing_request"),
            incoming_request: flag(fs, "incoming_request"),
            muting: flag(fs, "muting"),
            is_muting_reel: flag(fs, "is_muting_reel"),
        }
    }
}

/// A user profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstagramProfile {
    pub pk: String,
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub biography: String,
    pub profile_pic_url: String,
    /// URLs to try, in order, when loading the profile picture.
    pub profile_pic_candidates: Vec<String>,
    pub is_verified: bool,
    pub is_private: bool,
    pub is_business: bool,
    pub is_memorialized: bool,
    pub account_type: Option<i64>,
    pub follower_count: Option<u64>,
    pub following_count: Option<u64>,
    pub media_count: Option<u64>,
    pub total_clips_count: Option<u64>,
    pub mutual_followers_count: Option<u64>,
    pub external_url: String,
    pub category: String,
    pub city_name: String,
    pub friendship: Friendship,
    pub bio_links: Vec<Value>,
    pub pronouns: Vec<Value>,
    pub profile_url: String,
}

impl InstagramProfile {
    /// Normalizes a user object. Requires a pk, id or username.
    pub fn from_user(user: &Value) -> Option<Self> {
        if !user.is_object() {
            return None;
        }
        let pk = id_field(user, "pk")
            .or_else(|| id_field(user, "id"))
            .unwrap_or_default();
        let username = str_field(user, "username");
        if pk.is_empty() && username.is_empty() {
            return None;
        }
        let profile_pic_url = InstagramUser::from_value(user).profile_pic_url;
        let count = |key: &str| user.get(key).and_then(Value::as_u64);
        let list = |key: &str| {
            user.get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        Some(Self {
            id: id_field(user, "id").unwrap_or_else(|| pk.clone()),
            full_name: str_field(user, "full_name"),
            biography: str_field(user, "biography"),
            profile_pic_candidates: image_url_candidates(&profile_pic_url),
            profile_pic_url,
            is_verified: flag(user, "is_verified"),
            is_private: flag(user, "is_private"),
            is_business: flag(user, "is_business"),
            is_memorialized: flag(user, "is_memorialized"),
            account_type: user.get("account_type").and_then(Value::as_i64),
            follower_count: count("follower_count"),
            following_count: count("following_count"),
            media_count: count("media_count"),
            total_clips_count: count("total_clips_count"),
            mutual_followers_count: count("mutual_followers_count"),
            external_url: str_field(user, "external_url"),
            category: str_field(user, "category"),
            city_name: str_field(user, "city_name"),
            friendship: user
                .get("friendship_status")
                .map(Friendship::from_value)
                .unwrap_or_default(),
            bio_links: list("bio_links"),
            pronouns: list("pronouns"),
            profile_url: if username.is_empty() {
                String::new()
            } else {
                format!("https://www.instagram.com/{}/", encode_uri_component(&username))
            },
            username,
            pk,
        })
    }

    fn key(&self) -> &str {
        if self.pk.is_empty() {
            &self.username
        } else {
            &self.pk
        }
    }
}

/// Profile of a `data.user` or `user` object.
pub fn parse_profile(data: &Value) -> Option<InstagramProfile> {
    let user = data
        .pointer("/data/user")
        .filter(|u| u.is_object())
        .or_else(|| data.get("user"))?;
    InstagramProfile::from_user(user)
}

/// Returns true for instagram.com and its subdomains.
pub fn is_instagram_host(host: &str) -> bool {
    host == "instagram.com" || host.ends_with(".instagram.com")
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstagramEntity {
    Post(InstagramPost),
    Profile(InstagramProfile),
}

/// Profiles and feed posts seen across captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstagramView {
    pub profiles: Vec<InstagramProfile>,
    pub posts: Vec<InstagramPost>,
}

impl InstagramView {
    /// Builds the view from store records.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let mut view = Self::default();
        for entity in aggregate(&InstagramExtractor, records) {
            match entity {
                InstagramEntity::Post(p) => view.posts.push(p),
                InstagramEntity::Profile(p) => view.profiles.push(p),
            }
        }
        view
    }
}

/// Extracts Instagram posts and profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstagramExtractor;

impl SiteExtractor for InstagramExtractor {
    type Entity = InstagramEntity;

    fn name(&self) -> &'static str {
        "instagram"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_instagram_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<InstagramEntity> {
        let Some(data) = record.response_body.as_deref().and_then(parse_json) else {
            return Vec::new();
        };
        let mut out: Vec<InstagramEntity> = parse_feed(&data)
            .into_iter()
            .map(InstagramEntity::Post)
            .collect();
        out.extend(parse_profile(&data).map(InstagramEntity::Profile));
        out
    }

    fn key(&self, entity: &InstagramEntity) -> String {
        match entity {
            InstagramEntity::Post(p) => format!("post:{}", p.pk),
            InstagramEntity::Profile(p) => format!("profile:{}", p.key()),
        }
    }

    fn merge(&self, existing: &mut InstagramEntity, incoming: InstagramEntity) {
        let longer = match (&*existing, &incoming) {
            (InstagramEntity::Post(a), InstagramEntity::Post(b)) => b.caption.len() > a.caption.len(),
            (InstagramEntity::Profile(a), InstagramEntity::Profile(b)) => {
                b.biography.len() > a.biography.len()
            }
            _ => false,
        };
        if longer {
            *existing = incoming;
        }
    }

    fn detail(&self, entity: &InstagramEntity) -> String {
        match entity {
            InstagramEntity::Post(p) => p.caption.len().to_string(),
            InstagramEntity::Profile(p) => p.biography.len().to_string(),
        }
    }
}

impl SiteSummary for InstagramExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_instagram_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(InstagramView::from_records(records)).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use leech_core::RequestType;
    use serde_json::json;

    fn record(url: &str, response: Value) -> CapturedRequest {
        CapturedRequest {
            id: 1.0,
            url: url.into(),
            method: "POST".into(),
            headers: vec![],
            body: None,
            response_body: Some(response.to_string()),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    const GRAPHQL: &str = "https://www.instagram.com/graphql/query";

    fn post(pk: u64, caption: &str) -> Value {
        json!({
            "pk": pk,
            "code": format!("C{pk}"),
            "user": {"pk": 7, "username": "ann", "profile_pic_url": "https://cdn/a.jpg"},
            "caption": {"text": caption, "created_at": 1700000000},
            "image_versions2": {"candidates": [
                {"url": "https://scontent-a.cdninstagram.com/v/p1.jpg?stp=1080"},
                {"url": "https://scontent-b.cdninstagram.com/v/p1.jpg?stp=640"},
                {"url": "https://scontent-a.cdninstagram.com/v/p2.jpg"}
            ]}
        })
    }

    fn feed(nodes: Vec<Value>) -> Value {
        let edges: Vec<Value> = nodes.into_iter().map(|n| json!({"node": n, "cursor": "x"})).collect();
        json!({"data": {"xdt_api__v1__feed__timeline__connection": {"edges": edges}}})
    }

    #[test]
    fn host_matching() {
        assert!(is_instagram_host("www.instagram.com"));
        assert!(is_instagram_host("instagram.com"));
        assert!(!is_instagram_host("fakeinstagram.com"));
    }

    #[test]
    fn post_normalization() {
        let mut node = post(1, "hello");
        node["usertags"] = json!({"in": [
            {"user": {"username": "bob", "pk": "8"}, "position": [0.5, 0.5]},
            {"user": {}}
        ]});
        node["coauthor_producers"] = json!([{"username": "cy", "is_verified": true}]);
        node["carousel_media"] = json!([{"image_versions2": {"candidates": [{"url": "https://c/1.jpg"}]}}]);
        node["clips_metadata"] = json!({"original_sound_info": {"original_audio_title": "Original audio"}});
        node["like_count"] = json!(12);

        let p = InstagramPost::from_node(&node).unwrap();
        assert_eq!(p.pk, "1");
        assert_eq!(p.id, "1_7");
        assert_eq!(p.post_url.as_deref(), Some("https://www.instagram.com/p/C1/"));
        assert_eq!(p.taken_at, Some(1700000000));
        assert_eq!(p.image_urls.len(), 2);
        assert_eq!(p.usertags.len(), 1);
        assert_eq!(p.usertags[0].position, Some(json!([0.5, 0.5])));
        assert!(p.coauthors[0].is_verified);
        assert_eq!(p.carousel[0].image_urls, vec!["https://c/1.jpg"]);
        assert_eq!(p.original_sound_title.as_deref(), Some("Original audio"));
        assert_eq!(p.like_count, Some(12));
    }

    #[test]
    fn pk_derived_from_id() {
        let p = InstagramPost::from_node(&json!({"id": "345_7", "caption": null, "video_versions": []})).unwrap();
        assert_eq!(p.pk, "345");
        assert_eq!(p.id, "345_7");
        assert!(InstagramPost::from_node(&json!({"caption": {"text": "x"}})).is_none());
    }

    #[test]
    fn edges_need_media_fields() {
        let data = json!({"data": {"a": {"b": {"edges": [
            {"node": {"pk": 1, "caption": {"text": "x"}}},
            {"node": {"pk": 2}},
            {"node": {"caption": {"text": "no id"}}}
        ]}}}});
        let nodes = feed_nodes(&data);
        assert_eq!(nodes.len(), 1);

        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": {"edges": [
            {"node": {"pk": 1, "caption": {"text": "x"}}}
        ]}}}}}}}});
        assert!(feed_nodes(&deep).is_empty());
    }

    #[test]
    fn profile_normalization() {
        let data = json!({"data": {"user": {
            "pk": "7",
            "username": "ann.b",
            "biography": "hi",
            "hd_profile_pic_url_info": {"url": "http://cdn/ann.jpg?a=1\\u0026b=2"},
            "follower_count": 100,
            "friendship_status": {"following": true, "muting": false},
            "bio_links": [{"url": "https://example.com"}]
        }}});

        let p = parse_profile(&data).unwrap();
        assert_eq!(p.pk, "7");
        assert_eq!(p.id, "7");
        assert_eq!(p.profile_url, "https://www.instagram.com/ann.b/");
        assert_eq!(p.follower_count, Some(100));
        assert!(p.friendship.following);
        assert_eq!(p.bio_links.len(), 1);
        assert_eq!(
            p.profile_pic_candidates,
            vec!["https://cdn/ann.jpg?a=1&b=2", "https://cdn/ann.jpg"]
        );

        assert!(parse_profile(&json!({"data": {"user": {"full_name": "x"}}})).is_none());
        assert!(parse_profile(&json!({"user": {"username": "bob"}})).is_some());
    }

    #[test]
    fn image_urls_are_cleaned() {
        assert_eq!(normalize_image_url(" http://a/b.jpg?x=1&amp;y=2 "), "https://a/b.jpg?x=1&y=2");
        assert_eq!(image_url_candidates("https://a/b.jpg"), vec!["https://a/b.jpg"]);
        assert!(image_url_candidates("  ").is_empty());
    }

    #[test]
    fn longest_caption_and_biography_win() {
        let records = vec![
            record(GRAPHQL, feed(vec![post(1, "short"), post(2, "two")])),
            record(GRAPHQL, feed(vec![post(1, "a much longer caption")])),
            record(GRAPHQL, feed(vec![post(1, "mid")])),
            record(GRAPHQL, json!({"data": {"user": {"pk": 7, "username": "ann", "biography": "long bio"}}})),
            record(GRAPHQL, json!({"data": {"user": {"pk": 7, "username": "ann", "biography": ""}}})),
            record("https://example.com/graphql", feed(vec![post(3, "elsewhere")])),
        ];

        let view = InstagramView::from_records(&records);
        let posts: Vec<_> = view.posts.iter().map(|p| (p.pk.as_str(), p.caption.as_str())).collect();
        assert_eq!(posts, vec![("1", "a much longer caption"), ("2", "two")]);
        assert_eq!(view.profiles.len(), 1);
        assert_eq!(view.profiles[0].biography, "long bio");

        let summary = InstagramExtractor.summarize(&records);
        assert_eq!(summary["posts"][0]["author"]["username"], json!("ann"));
    }
}
