//! Facebook search users, side-feed ads, profiles, feed posts and CDN images.
//!
//! Profiles come from two places: bulk route definitions name the user, group
//! or place behind each visited path, and GraphQL profile headers fill in the
//! name, pictures, intro card and tabs. Posts are read from group and profile
//! timeline feeds (single JSON or streamed NDJSON chunks) and merged by post id
//! so that later, richer copies add comments and counts.

use std::collections::{HashMap, HashSet};

use leech_core::payload::encode_uri_component;
use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::extractor::{aggregate, parse_json, site_records, SiteExtractor, SiteSummary};

const ORIGIN: &str = "https://www.facebook.com";

/// Anti-hijacking prefix on `/ajax/` responses.
const JSON_GUARD: &str = "for (;;);";

const MAX_IMAGE_DEPTH: usize = 8;
const MAX_PICTURE_DEPTH: usize = 15;

const UFI_STORY: &str = "/comet_sections/feedback/story/story_ufi_container/story";
const UFI_NESTED_FEEDBACK: &str =
    "/feedback_context/feedback_target_with_context/comet_ufi_summary_and_actions_renderer/feedback";

const AVATAR_KEYS: &[&str] = &[
    "profile_picture_for_sticky_bar",
    "profilePicSmall",
    "profilePicMedium",
    "profilePicLarge",
];
const HEADER_USER_KEYS: &[&str] = &["name", "url", "gender", "id", "profilePhoto", "cover_photo"];
const HEADER_RENDERER_KEYS: &[&str] = &["profile_social_context", "profile_intro_card", "profile_tabs"];
const PICTURE_POINTERS: &[&str] = &[
    "/profile_picture/uri",
    "/profilePicSmall/uri",
    "/profilePicMedium/uri",
    "/profilePicLarge/uri",
    "/profile_picture_for_sticky_bar/uri",
];

static CDN_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https://scontent[^"'\s]*fbcdn\.net/v/[^"'\s)\]\}]+"#).unwrap()
});
static CONTENT_IMAGE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"image|photo|media|background|portrait|thumbnail|preview|attachment").unwrap()
});
static DECORATION_IMAGE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"profile_picture|avatar|actor_photo|ufi_silhouette|icon_image|darkmodeimage|lightmodeimage|animation",
    )
    .unwrap()
});
static SECTION_PATHS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"/about/?(\?|$)", "About"),
        (r"/photos/?(\?|$)", "Photos"),
        (r"/videos/?(\?|$)", "Videos"),
        (r"/friends/?(\?|$)", "Friends"),
        (r"/reels", "Reels"),
        (r"/events/?(\?|$)", "Events"),
        (r"/reviews", "Reviews given"),
    ]
    .into_iter()
    .map(|(pattern, section)| (Regex::new(pattern).unwrap(), section))
    .collect()
});

static NULL: Value = Value::Null;

// =============================================================================
// JSON Helpers
// =============================================================================

fn at<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer).filter(|v| !v.is_null())
}

fn text(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn first_text(value: &Value, pointers: &[&str]) -> String {
    pointers
        .iter()
        .map(|p| text(value, p))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn array<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Ids arrive as strings or numbers.
fn string_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    value.is_some_and(is_truthy)
}

fn fill(slot: &mut String, value: &str) {
    if slot.is_empty() && !value.is_empty() {
        *slot = value.to_string();
    }
}

fn replace_if_set(slot: &mut String, value: String) {
    if !value.is_empty() {
        *slot = value;
    }
}

/// Count from a number or a formatted string ("1,204").
pub fn numeric_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

/// A single JSON document, or one value per NDJSON line.
fn json_chunks(raw: &str) -> Vec<Value> {
    if let Some(single) = parse_json(raw) {
        return vec![single];
    }
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(parse_json)
        .collect()
}

// =============================================================================
// Endpoints
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    BulkRoutes,
    Graphql,
    Other,
}

fn endpoint(url: &str) -> Endpoint {
    let Ok(parsed) = url::Url::parse(url) else {
        return Endpoint::Other;
    };
    if parsed.scheme() != "https" || parsed.host_str() != Some("www.facebook.com") || parsed.port().is_some() {
        return Endpoint::Other;
    }
    match parsed.path() {
        "/ajax/bulk-route-definitions/" => Endpoint::BulkRoutes,
        "/api/graphql/" => Endpoint::Graphql,
        _ => Endpoint::Other,
    }
}

/// Returns true for facebook.com and its subdomains.
pub fn is_facebook_host(host: &str) -> bool {
    host == "facebook.com" || host.ends_with(".facebook.com")
}

// =============================================================================
// Images
// =============================================================================

/// Identity of an image across size and signature variants: its URL path.
pub fn image_dedupe_key(uri: &str) -> String {
    url::Url::parse(uri)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| uri.to_string())
}

/// Drops later URLs with an already seen path.
pub fn dedupe_image_uris(uris: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut set = ImageSet::default();
    for uri in uris {
        set.add(Some(&uri));
    }
    set.uris
}

#[derive(Default)]
struct ImageSet {
    seen: HashSet<String>,
    uris: Vec<String>,
}

impl ImageSet {
    fn add(&mut self, uri: Option<&str>) {
        let Some(uri) = uri.filter(|u| !u.is_empty()) else {
            return;
        };
        let key = image_dedupe_key(uri);
        if !key.is_empty() && self.seen.insert(key) {
            self.uris.push(uri.to_string());
        }
    }

    fn add_at(&mut self, value: &Value, pointer: &str) {
        self.add(value.pointer(pointer).and_then(Value::as_str));
    }

    fn add_media(&mut self, value: &Value) {
        self.add_at(value, "/media/image/uri");
        self.add_at(value, "/image/uri");
    }

    /// Walks `root` for `uri` strings whose key path names content imagery.
    fn collect(&mut self, root: &Value, path: &str, depth: usize) {
        if depth > MAX_IMAGE_DEPTH {
            return;
        }
        match root {
            Value::Array(items) => {
                let next = format!("{path}[]");
                for item in items {
                    self.collect(item, &next, depth + 1);
                }
            }
            Value::Object(map) => {
                for (key, value) in map {
                    let next = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    if key == "uri" {
                        if let Some(uri) = value.as_str() {
                            let lower = next.to_lowercase();
                            if CONTENT_IMAGE_PATH.is_match(&lower) && !DECORATION_IMAGE_PATH.is_match(&lower) {
                                self.add(Some(uri));
                            }
                            continue;
                        }
                    }
                    self.collect(value, &next, depth + 1);
                }
            }
            _ => {}
        }
    }

    fn add_attachments(&mut self, owner: &Value, path: &str) {
        for attachment in array(owner, "/attachments") {
            self.add_media(attachment);
            for node in array(attachment, "/nodes") {
                self.add_media(node);
            }
            self.collect(attachment, path, 0);
        }
    }
}

fn story_images(story: &Value) -> Vec<String> {
    let mut set = ImageSet::default();
    set.add_attachments(story, "attachments");

    if let Some(content) = at(story, "/comet_sections/content/story") {
        set.add_at(content, "/text_format_metadata/background_image/uri");
        set.add_at(content, "/text_format_metadata/portrait_background_image/uri");
        if let Some(bg) = at(content, "/background").or_else(|| at(content, "/text_format_metadata/background")) {
            set.add_at(bg, "/image/uri");
            set.add_at(bg, "/portrait_image/uri");
        }

        let message = at(content, "/comet_sections/message/story");
        let container = at(content, "/comet_sections/message_container/story");
        if let Some(tfm) = message.and_then(|m| at(m, "/text_format_metadata")) {
            set.add_at(tfm, "/background_image/uri");
            set.add_at(tfm, "/portrait_background_image/uri");
            set.add_at(tfm, "/background/image/uri");
            set.add_at(tfm, "/background/portrait_image/uri");
        }
        set.collect(content, "content_story", 0);
        if let Some(m) = message {
            set.collect(m, "message_story", 0);
        }
        if let Some(c) = container {
            set.collect(c, "message_container_story", 0);
        }
    }
    if let Some(attached) = at(story, "/attached_story") {
        set.collect(attached, "attached_story", 0);
    }
    set.uris
}

/// Facebook CDN image URLs found anywhere in a body, deduplicated by path.
pub fn cdn_image_urls(body: &str) -> Vec<String> {
    dedupe_image_uris(CDN_IMAGE_URL.find_iter(body).map(|m| m.as_str().to_string()))
}

// =============================================================================
// Search Users and Ads
// =============================================================================

/// A user suggested by the search bootstrap keywords.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookSearchUser {
    pub ent_id: String,
    pub title: String,
    pub keyword_text: String,
    pub img_url: String,
    pub link_url: String,
    pub snippet: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub item_logging_id: String,
}

/// Users among `viewer.bootstrap_keywords`.
pub fn parse_search_users(data: &Value) -> Vec<FacebookSearchUser> {
    array(data, "/data/viewer/bootstrap_keywords/edges")
        .iter()
        .filter_map(|edge| at(edge, "/node"))
        .filter_map(|node| {
            let direct = at(node, "/sts_info/direct_nav_result")?;
            if text(direct, "/entity_type") != "user" {
                return None;
            }
            let logging = node
                .get("item_logging_info")
                .and_then(Value::as_str)
                .and_then(parse_json)
                .unwrap_or(Value::Null);
            let keyword_text = text(node, "/keyword_text");
            let ent_id = Some(string_of(direct.get("ent_id")))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| string_of(logging.get("kwEntId")));
            Some(FacebookSearchUser {
                ent_id,
                title: Some(text(direct, "/title"))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| keyword_text.clone()),
                keyword_text,
                img_url: text(direct, "/img_url"),
                link_url: text(direct, "/link_url"),
                snippet: text(direct, "/snippet"),
                kind: text(direct, "/type"),
                item_logging_id: string_of(node.get("item_logging_id")),
            })
        })
        .collect()
}

/// A right-column sponsored unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookAd {
    pub id: String,
    pub ad_id: String,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_picture_uri: String,
    pub description: String,
    pub title: String,
    pub subtitle: String,
    pub image_uri: String,
    pub target_url: String,
    pub web_link_url: String,
}

impl FacebookAd {
    fn key(&self) -> String {
        if !self.id.is_empty() {
            self.id.clone()
        } else if !self.ad_id.is_empty() {
            self.ad_id.clone()
        } else {
            format!("{}|{}", self.actor_id, self.title)
        }
    }
}

/// Ads in `viewer.sideFeedUnit`.
pub fn parse_side_feed_ads(data: &Value) -> Vec<FacebookAd> {
    array(data, "/data/viewer/sideFeedUnit/nodes")
        .iter()
        .filter(|node| text(node, "/__typename") == "AdsSideFeedUnit")
        .flat_map(|node| array(node, "/new_adverts/nodes"))
        .filter_map(|item| {
            let rhc = at(item, "/rhc_ad")?;
            let actor = at(rhc, "/actor").unwrap_or(&NULL);
            let ad_id = string_of(item.pointer("/sponsored_data/ad_id"));
            let target_url = text(rhc, "/target_url");
            Some(FacebookAd {
                id: Some(string_of(item.get("id")))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| ad_id.clone()),
                ad_id,
                actor_id: string_of(actor.get("id")),
                actor_name: text(actor, "/name"),
                actor_picture_uri: text(actor, "/profile_picture/uri"),
                description: text(rhc, "/description"),
                title: text(rhc, "/title"),
                subtitle: text(rhc, "/subtitle"),
                image_uri: text(rhc, "/image/uri"),
                web_link_url: Some(text(rhc, "/web_link/url"))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| target_url.clone()),
                target_url,
            })
        })
        .collect()
}

// =============================================================================
// Profiles
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    User,
    Group,
    Place,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteSection {
    pub section: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SocialContext {
    pub text: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntroLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntroCard {
    pub category: String,
    pub current_city: String,
    pub current_city_uri: String,
    pub links: Vec<IntroLink>,
    pub bio: String,
}

impl IntroCard {
    pub fn is_empty(&self) -> bool {
        self.category.is_empty() && self.current_city.is_empty() && self.bio.is_empty() && self.links.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileTab {
    pub name: String,
    pub url: String,
    pub section_type: String,
}

/// A user, group or place page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookProfile {
    pub kind: ProfileKind,
    pub user_id: String,
    pub user_vanity: String,
    pub profile_url: String,
    pub viewer_id: String,
    pub name: String,
    pub route_sections: Vec<RouteSection>,
    pub username: String,
    pub gender: String,
    pub avatar_uris: Vec<String>,
    pub cover_photo_uri: String,
    pub cover_photo_url: String,
    pub profile_photo_url: String,
    pub profile_photo_id: String,
    pub social_context: Vec<SocialContext>,
    pub intro_card: IntroCard,
    pub tabs: Vec<ProfileTab>,
}

impl FacebookProfile {
    fn apply_header(&mut self, header: ProfileHeader) {
        replace_if_set(&mut self.name, header.name);
        let username = [header.username, self.user_vanity.clone(), self.username.clone()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_default();
        self.username = username;
        replace_if_set(&mut self.gender, header.gender);
        if !header.avatar_uris.is_empty() {
            self.avatar_uris = header.avatar_uris;
        }
        replace_if_set(&mut self.cover_photo_uri, header.cover_photo_uri);
        replace_if_set(&mut self.cover_photo_url, header.cover_photo_url);
        replace_if_set(&mut self.profile_photo_url, header.profile_photo_url);
        replace_if_set(&mut self.profile_photo_id, header.profile_photo_id);
        if !header.social_context.is_empty() {
            self.social_context = header.social_context;
        }
        if !header.intro_card.is_empty() {
            self.intro_card = header.intro_card;
        }
        if !header.tabs.is_empty() {
            self.tabs = header.tabs;
        }
        if self.tabs.is_empty() {
            self.tabs = self
                .route_sections
                .iter()
                .filter(|rs| !rs.url.is_empty())
                .map(|rs| ProfileTab {
                    name: rs.section.clone(),
                    url: rs.url.clone(),
                    section_type: String::new(),
                })
                .collect();
        }
    }
}

fn profile_url(user_id: &str, vanity: &str) -> String {
    if !vanity.is_empty() {
        format!("{ORIGIN}/{}", encode_uri_component(vanity))
    } else if !user_id.is_empty() {
        format!("{ORIGIN}/profile.php?id={}", encode_uri_component(user_id))
    } else {
        String::new()
    }
}

fn page_url(path_key: &str) -> Option<String> {
    let clean = path_key.split('?').next().unwrap_or_default().trim_matches('/');
    (!clean.is_empty()).then(|| format!("{ORIGIN}/{clean}"))
}

/// Profile tab named by a route, falling back to the visited path.
pub fn route_section(route_name: &str, path_key: &str) -> Option<&'static str> {
    if !route_name.is_empty() {
        if route_name.contains("About") {
            return Some("About");
        }
        if route_name.contains("Photos") {
            return Some("Photos");
        }
        if route_name.contains("Collection") && !path_key.is_empty() {
            return if path_key.contains("photos") {
                Some("Photos")
            } else if path_key.contains("friends") {
                Some("Friends")
            } else {
                None
            };
        }
        for (needle, section) in [
            ("Videos", "Videos"),
            ("Friends", "Friends"),
            ("Timeline", "Timeline"),
            ("Reels", "Reels"),
            ("Events", "Events"),
            ("Reviews", "Reviews given"),
        ] {
            if route_name.contains(needle) {
                return Some(section);
            }
        }
    }
    SECTION_PATHS
        .iter()
        .find(|(pattern, _)| pattern.is_match(path_key))
        .map(|(_, section)| *section)
}

/// Users, groups and places named by a bulk route definitions response.
pub fn parse_route_profiles(body: &str) -> Vec<FacebookProfile> {
    let Some(data) = parse_json(body.strip_prefix(JSON_GUARD).unwrap_or(body)) else {
        return Vec::new();
    };
    let Some(payloads) = data.pointer("/payload/payloads").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut profiles: Vec<FacebookProfile> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (path_key, item) in payloads {
        if truthy(item.get("error")) {
            continue;
        }
        let Some(result) = at(item, "/result") else {
            continue;
        };
        let exports = at(result, "/exports").unwrap_or(&NULL);
        let props = at(exports, "/rootView/props").or_else(|| at(exports, "/hostableView/props"));
        let title = text(result, "/meta/title").trim().to_string();
        let route_name = text(exports, "/canonicalRouteName");
        let result_type = text(result, "/type");

        if let Some(props) = props.filter(|_| result_type == "route_definition") {
            let group_id = string_of(props.get("groupID"));
            let user_id = string_of(props.get("userID"));
            let vanity = text(props, "/userVanity").trim().to_string();

            if !group_id.is_empty() && route_name.contains("Group") {
                let url = page_url(path_key)
                    .unwrap_or_else(|| format!("{ORIGIN}/groups/{}", encode_uri_component(&group_id)));
                match index.get(&format!("group:{group_id}")) {
                    Some(&pos) => fill(&mut profiles[pos].name, &title),
                    None => {
                        index.insert(format!("group:{group_id}"), profiles.len());
                        profiles.push(FacebookProfile {
                            kind: ProfileKind::Group,
                            profile_url: url.clone(),
                            name: if title.is_empty() { group_id.clone() } else { title.clone() },
                            route_sections: vec![RouteSection { section: "Group".into(), url }],
                            ..Default::default()
                        });
                    }
                }
            } else if !user_id.is_empty() || !vanity.is_empty() {
                let viewer_id = [string_of(props.get("viewerID")), string_of(exports.get("actorID"))]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let key = [user_id.as_str(), vanity.as_str(), path_key.as_str()]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or_default()
                    .to_string();
                let pos = *index.entry(key).or_insert_with(|| {
                    profiles.push(FacebookProfile {
                        profile_url: profile_url(&user_id, &vanity),
                        user_id: user_id.clone(),
                        user_vanity: vanity.clone(),
                        viewer_id,
                        name: title.clone(),
                        ..Default::default()
                    });
                    profiles.len() - 1
                });
                let profile = &mut profiles[pos];
                fill(&mut profile.name, &title);
                if let (Some(section), Some(url)) = (route_section(&route_name, path_key), page_url(path_key)) {
                    if !profile.route_sections.iter().any(|s| s.url == url || s.section == section) {
                        profile.route_sections.push(RouteSection { section: section.into(), url });
                    }
                }
            }
        }

        if result_type == "route_redirect" {
            let Some(redirect) = at(result, "/redirect_result/exports") else {
                continue;
            };
            let redirect_props = at(redirect, "/rootView/props").or_else(|| at(redirect, "/hostableView/props"));
            let place_id = string_of(redirect_props.and_then(|p| p.get("id")));
            if place_id.is_empty() || !text(redirect, "/canonicalRouteName").contains("TopChartsCity") {
                continue;
            }
            let place_title = text(result, "/redirect_result/meta/title").trim().to_string();
            let redirect_url = text(result, "/redirect_url").trim().to_string();
            let url = if redirect_url.is_empty() {
                format!("{ORIGIN}/pages/{place_id}")
            } else if redirect_url.starts_with("http") {
                redirect_url
            } else if redirect_url.starts_with('/') {
                format!("{ORIGIN}{redirect_url}")
            } else {
                format!("{ORIGIN}/{redirect_url}")
            };
            let key = format!("place:{place_id}");
            if !index.contains_key(&key) {
                index.insert(key, profiles.len());
                profiles.push(FacebookProfile {
                    kind: ProfileKind::Place,
                    profile_url: url.clone(),
                    name: if place_title.is_empty() { place_id } else { place_title },
                    route_sections: vec![RouteSection { section: "Place".into(), url }],
                    ..Default::default()
                });
            }
        }
    }
    profiles
}

/// Fields of a GraphQL profile header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileHeader {
    pub id: String,
    pub name: String,
    pub url: String,
    pub username: String,
    pub gender: String,
    pub avatar_uris: Vec<String>,
    pub cover_photo_uri: String,
    pub cover_photo_url: String,
    pub profile_photo_url: String,
    pub profile_photo_id: String,
    pub social_context: Vec<SocialContext>,
    pub intro_card: IntroCard,
    pub tabs: Vec<ProfileTab>,
}

#[derive(Default)]
struct HeaderParts {
    user: Map<String, Value>,
    renderer: Map<String, Value>,
}

fn apply_header_payload(parts: &mut Option<HeaderParts>, data: &Value) {
    if !data.is_object() {
        return;
    }
    let user = data.get("user").filter(|u| u.is_object()).unwrap_or(data);
    let renderer = user
        .get("profile_header_renderer")
        .filter(|r| is_truthy(r))
        .or_else(|| (text(user, "/__typename") == "User").then_some(user));
    let header_user = renderer
        .and_then(|r| r.get("user"))
        .filter(|u| is_truthy(u))
        .or(renderer)
        .unwrap_or(user);
    let Some(h) = header_user.as_object() else {
        return;
    };

    if let Some(p) = parts.as_mut() {
        for key in HEADER_USER_KEYS {
            if let Some(v) = h.get(*key).filter(|v| is_truthy(v)) {
                p.user.insert(key.to_string(), v.clone());
            }
        }
        for key in AVATAR_KEYS {
            if let Some(v) = h.get(*key).filter(|v| truthy(v.get("uri"))) {
                p.user.insert(key.to_string(), v.clone());
            }
        }
        if let Some(v) = h.get("username_for_profile").filter(|v| !v.is_null()) {
            p.user.insert("username_for_profile".into(), v.clone());
        }
        if let Some(r) = renderer {
            for key in HEADER_RENDERER_KEYS {
                if let Some(v) = r.get(*key).filter(|v| is_truthy(v)) {
                    p.renderer.insert(key.to_string(), v.clone());
                }
            }
        }
    } else {
        *parts = Some(HeaderParts {
            user: h.clone(),
            renderer: renderer.unwrap_or(user).as_object().cloned().unwrap_or_default(),
        });
    }
}

fn build_header(parts: HeaderParts) -> Option<ProfileHeader> {
    let u = Value::Object(parts.user);
    let r = Value::Object(parts.renderer);

    let mut out = ProfileHeader {
        id: string_of(u.get("id")),
        name: text(&u, "/name").trim().to_string(),
        url: text(&u, "/url").trim().to_string(),
        gender: text(&u, "/gender").trim().to_string(),
        ..Default::default()
    };
    if let Ok(parsed) = url::Url::parse(&out.url) {
        let path = parsed.path().trim_matches('/');
        if !path.is_empty() && path != "profile.php" {
            out.username = path.to_string();
        }
    }
    replace_if_set(&mut out.username, text(&u, "/username_for_profile").trim().to_string());

    for key in AVATAR_KEYS {
        let uri = text(&u, &format!("/{key}/uri"));
        if !uri.is_empty() && !out.avatar_uris.contains(&uri) {
            out.avatar_uris.push(uri);
        }
    }

    let cover = at(&u, "/cover_photo").or_else(|| at(&r, "/cover_photo")).unwrap_or(&NULL);
    out.cover_photo_uri = text(cover, "/photo/image/uri");
    out.cover_photo_url = text(cover, "/url");
    out.profile_photo_url = text(&u, "/profilePhoto/url");
    out.profile_photo_id = string_of(u.pointer("/profilePhoto/id"));

    for c in array(&r, "/profile_social_context/content") {
        let text_value = first_text(c, &["/text/text", "/text"]);
        let uri = text(c, "/uri");
        if !text_value.is_empty() || !uri.is_empty() {
            out.social_context.push(SocialContext {
                text: text_value.trim().to_string(),
                uri: uri.trim().to_string(),
            });
        }
    }

    for node in array(&r, "/profile_intro_card/context_items/edges")
        .iter()
        .filter_map(|edge| at(edge, "/node"))
    {
        let short_title = first_text(node, &["/short_title/text", "/short_title"]);
        let short_title = short_title.trim();
        let page_uri = text(node, "/page_uri").trim().to_string();
        let card = &mut out.intro_card;
        match text(node, "/profile_field_type").as_str() {
            "category" => card.category = short_title.to_string(),
            "current_city" => {
                card.current_city = short_title.to_string();
                card.current_city_uri = page_uri;
            }
            "screenname" => {
                for range in array(node, "/short_title/ranges") {
                    let url = first_text(range, &["/entity/external_url", "/entity/url"]);
                    let url = url.trim();
                    if url.is_empty() {
                        continue;
                    }
                    let label = Some(short_title.to_string())
                        .filter(|s| !s.is_empty())
                        .or_else(|| {
                            url::Url::parse(url)
                                .ok()
                                .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
                        })
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| url.to_string());
                    card.links.push(IntroLink { label, url: url.to_string() });
                }
                if card.links.is_empty() && !short_title.is_empty() {
                    card.links.push(IntroLink {
                        label: short_title.to_string(),
                        url: page_uri,
                    });
                }
            }
            _ => {}
        }
    }
    out.intro_card.bio = text(&r, "/profile_intro_card/profile_status/profile_status_text/text")
        .trim()
        .to_string();

    for node in array(&r, "/profile_tabs/profile_user/timeline_nav_app_sections/edges")
        .iter()
        .filter_map(|edge| at(edge, "/node"))
    {
        let name = text(node, "/name");
        let url = text(node, "/url");
        if !name.is_empty() || !url.is_empty() {
            out.tabs.push(ProfileTab {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
                section_type: text(node, "/section_type"),
            });
        }
    }

    (!out.id.is_empty() || !out.name.is_empty() || !out.url.is_empty()).then_some(out)
}

/// Profile header from a GraphQL response, single JSON or streamed chunks.
pub fn parse_profile_header(body: &str) -> Option<ProfileHeader> {
    let mut parts = None;
    if let Some(single) = parse_json(body) {
        if let Some(data) = at(&single, "/data").filter(|d| truthy(d.pointer("/user/profile_header_renderer"))) {
            apply_header_payload(&mut parts, data);
        }
    }

    if parts.is_none() {
        for chunk in body.lines().map(str::trim).filter(|l| !l.is_empty()).filter_map(parse_json) {
            let Some(data) = at(&chunk, "/data") else {
                continue;
            };
            if truthy(data.pointer("/user/profile_header_renderer")) {
                apply_header_payload(&mut parts, data);
                break;
            }
            if !truthy(data.get("user")) && !truthy(data.get("id")) {
                continue;
            }
            let path = array(&chunk, "/path");
            let header_path = path.first().and_then(Value::as_str) == Some("user")
                || path.iter().any(|p| p.as_str() == Some("profile_header_renderer"));
            if header_path {
                let wrapped: Map<String, Value> = [("user".to_string(), data.clone())].into_iter().collect();
                apply_header_payload(&mut parts, &Value::Object(wrapped));
            } else if truthy(data.get("user")) {
                apply_header_payload(&mut parts, data);
            }
        }
    }

    parts.and_then(build_header)
}

fn collect_profile_pictures(
    value: &Value,
    profile_ids: &HashSet<String>,
    out: &mut HashMap<String, String>,
    depth: usize,
) {
    if depth > MAX_PICTURE_DEPTH {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_profile_pictures(item, profile_ids, out, depth + 1);
            }
        }
        Value::Object(map) => {
            let id = string_of(map.get("id"));
            if profile_ids.contains(&id) && !out.contains_key(&id) {
                let uri = first_text(value, PICTURE_POINTERS);
                if !uri.is_empty() {
                    out.insert(id, uri);
                }
            }
            for child in map.values() {
                collect_profile_pictures(child, profile_ids, out, depth + 1);
            }
        }
        _ => {}
    }
}

fn endpoint_bodies<'a>(records: &'a [&'a CapturedRequest], kind: Endpoint) -> impl Iterator<Item = &'a str> + 'a {
    records
        .iter()
        .filter(move |r| endpoint(&r.url) == kind)
        .filter_map(|r| r.response_body.as_deref())
}

/// Merges route profiles with GraphQL headers, then backfills avatars from
/// post authors and any payload object carrying a profile's picture.
pub fn aggregate_profiles(records: &[&CapturedRequest], posts: &[FacebookPost]) -> Vec<FacebookProfile> {
    let mut profiles: Vec<FacebookProfile> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for profile in endpoint_bodies(records, Endpoint::BulkRoutes).flat_map(parse_route_profiles) {
        let id_key = (!profile.user_id.is_empty()).then(|| profile.user_id.clone());
        let vanity_key = (!profile.user_vanity.is_empty()).then(|| format!("v:{}", profile.user_vanity));
        let fallback_key = if !profile.profile_url.is_empty() {
            Some(format!("u:{}", profile.profile_url))
        } else if !profile.name.is_empty() {
            Some(format!("p:{}", profile.name))
        } else {
            None
        };

        let existing = id_key
            .as_ref()
            .and_then(|k| index.get(k))
            .or_else(|| vanity_key.as_ref().and_then(|k| index.get(k)))
            .copied()
            .or_else(|| {
                if id_key.is_none() && vanity_key.is_none() {
                    return None;
                }
                profiles.iter().position(|p| {
                    (id_key.is_some() && p.user_id == profile.user_id)
                        || (vanity_key.is_some() && p.user_vanity == profile.user_vanity)
                })
            });

        match existing {
            Some(pos) => {
                let current = &mut profiles[pos];
                fill(&mut current.name, &profile.name);
                for rs in profile.route_sections {
                    if !rs.url.is_empty() && !current.route_sections.iter().any(|s| s.url == rs.url) {
                        current.route_sections.push(rs);
                    }
                }
            }
            None => {
                let Some(key) = id_key.or(vanity_key).or(fallback_key) else {
                    continue;
                };
                index.insert(key, profiles.len());
                profiles.push(profile);
            }
        }
    }

    for header in endpoint_bodies(records, Endpoint::Graphql).filter_map(parse_profile_header) {
        let username = header.username.trim().to_string();
        let url = if header.url.is_empty() {
            profile_url(&header.id, &username)
        } else {
            header.url.clone()
        };

        let found = (!header.id.is_empty())
            .then(|| index.get(&header.id).copied())
            .flatten()
            .or_else(|| {
                (!username.is_empty())
                    .then(|| profiles.iter().position(|p| p.user_vanity.eq_ignore_ascii_case(&username)))
                    .flatten()
            })
            .or_else(|| {
                (!url.is_empty())
                    .then(|| profiles.iter().position(|p| p.profile_url == url))
                    .flatten()
            });

        let pos = match found {
            Some(pos) => pos,
            None => {
                let key = [header.id.clone(), url.clone(), format!("h:{}", header.name).trim().to_string()]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or_default();
                profiles.push(FacebookProfile {
                    user_id: header.id.clone(),
                    user_vanity: username,
                    profile_url: url,
                    ..Default::default()
                });
                let pos = profiles.len() - 1;
                index.entry(key).or_insert(pos);
                pos
            }
        };
        profiles[pos].apply_header(header);
    }

    let mut pictures: HashMap<String, String> = HashMap::new();
    for post in posts {
        let id = post.author_id.trim();
        let picture = post.author_picture.trim();
        if !id.is_empty() && !picture.is_empty() && !pictures.contains_key(id) {
            pictures.insert(id.to_string(), picture.to_string());
        }
    }
    let profile_ids: HashSet<String> = profiles
        .iter()
        .map(|p| p.user_id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    for chunk in endpoint_bodies(records, Endpoint::Graphql).flat_map(json_chunks) {
        collect_profile_pictures(&chunk, &profile_ids, &mut pictures, 0);
    }

    for profile in profiles.iter_mut() {
        if !profile.avatar_uris.is_empty() || !profile.profile_photo_url.is_empty() {
            continue;
        }
        if let Some(picture) = pictures.get(profile.user_id.trim()) {
            profile.avatar_uris = vec![picture.clone()];
        }
    }

    profiles
}

// =============================================================================
// Posts
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopReaction {
    pub name: String,
    pub count: u64,
}

fn top_reactions(feedback: &Value) -> Vec<TopReaction> {
    array(feedback, "/top_reactions/edges")
        .iter()
        .map(|e| TopReaction {
            name: text(e, "/node/localized_name"),
            count: numeric_count(e.get("reaction_count")),
        })
        .filter(|r| !r.name.is_empty() || r.count > 0)
        .collect()
}

/// Union by name keeping the higher count, most frequent first.
pub fn merge_top_reactions(base: &[TopReaction], next: &[TopReaction]) -> Vec<TopReaction> {
    let mut merged: Vec<TopReaction> = Vec::new();
    for reaction in base.iter().chain(next).filter(|r| !r.name.is_empty()) {
        match merged.iter_mut().find(|r| r.name == reaction.name) {
            Some(existing) => existing.count = existing.count.max(reaction.count),
            None => merged.push(reaction.clone()),
        }
    }
    merged.sort_by(|a, b| b.count.cmp(&a.count));
    merged
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplyPreview {
    pub id: String,
    pub author_name: String,
    pub author_picture: String,
    pub created_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookComment {
    pub id: String,
    pub author_name: String,
    pub author_picture: String,
    pub body: String,
    pub created_time: Option<i64>,
    pub link: String,
    pub reaction_count: u64,
    pub reply_count: u64,
    pub top_reactions: Vec<TopReaction>,
    pub images: Vec<String>,
    pub reply_preview: Option<ReplyPreview>,
}

impl FacebookComment {
    pub fn from_comment(c: &Value) -> Self {
        let actions = array(c, "/comment_action_links");
        let feedback = at(c, "/feedback")
            .or_else(|| actions.iter().find_map(|l| at(l, "/comment/feedback")))
            .unwrap_or(&NULL);
        let action_link = actions
            .iter()
            .map(|l| text(l, "/comment/url"))
            .find(|s| !s.is_empty())
            .unwrap_or_default();

        let mut images = ImageSet::default();
        images.add_attachments(c, "comment.attachments");

        Self {
            id: [string_of(c.get("id")), string_of(c.get("legacy_fbid"))]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or_default(),
            author_name: first_text(
                c,
                &["/author/name", "/comet_comment_author_name_and_badges_renderer/comment/user/name"],
            ),
            author_picture: first_text(
                c,
                &[
                    "/author/profile_picture_depth_0_increased/uri",
                    "/author/profile_picture_depth_0/uri",
                    "/author/profile_picture_depth_1/uri",
                    "/comet_comment_author_name_and_badges_renderer/comment/user/profile_picture/uri",
                    "/author/profile_picture/uri",
                ],
            ),
            body: first_text(c, &["/body/text", "/preferred_body/text", "/body_renderer/text"]),
            created_time: at(c, "/created_time")
                .and_then(Value::as_i64)
                .or_else(|| actions.iter().find_map(|l| at(l, "/comment/created_time").and_then(Value::as_i64))),
            link: [text(c, "/url"), text(feedback, "/url"), action_link]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or_default(),
            reaction_count: ["/reactors/count", "/reactors/count_reduced", "/unified_reactors/count"]
                .iter()
                .map(|p| numeric_count(feedback.pointer(p)))
                .find(|n| *n > 0)
                .unwrap_or(0),
            reply_count: numeric_count(feedback.get("total_reply_count")),
            top_reactions: top_reactions(feedback),
            images: images.uris,
            reply_preview: at(c, "/inline_replies_expander_renderer/interesting_reply").map(|r| ReplyPreview {
                id: string_of(r.get("id")),
                author_name: text(r, "/author/name"),
                author_picture: first_text(
                    r,
                    &["/author/profilePictureForReplyExpander/uri", "/author/ufi_silhouette_uri"],
                ),
                created_time: r.get("created_time").and_then(Value::as_i64),
            }),
        }
    }

    fn key(&self) -> String {
        if self.id.is_empty() {
            format!(
                "fallback:{}|{}|{}",
                self.author_name,
                self.created_time.map(|t| t.to_string()).unwrap_or_default(),
                self.body
            )
        } else {
            format!("id:{}", self.id)
        }
    }

    fn merge(&mut self, next: FacebookComment) {
        fill(&mut self.id, &next.id);
        fill(&mut self.author_name, &next.author_name);
        fill(&mut self.author_picture, &next.author_picture);
        if self.body.is_empty() || next.body.len() > self.body.len() {
            self.body = next.body;
        }
        self.created_time = self.created_time.or(next.created_time);
        fill(&mut self.link, &next.link);
        self.reaction_count = self.reaction_count.max(next.reaction_count);
        self.reply_count = self.reply_count.max(next.reply_count);
        self.top_reactions = merge_top_reactions(&self.top_reactions, &next.top_reactions);
        self.images = dedupe_image_uris(self.images.drain(..).chain(next.images));
        if self.reply_preview.is_none() {
            self.reply_preview = next.reply_preview;
        }
    }
}

fn raw_comment_key(c: &Value) -> String {
    [string_of(c.get("id")), string_of(c.get("legacy_fbid"))]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| {
            format!(
                "{}|{}|{}",
                string_of(c.pointer("/author/id")),
                string_of(c.get("created_time")),
                first_text(c, &["/body/text", "/preferred_body/text"])
            )
        })
}

/// Union by comment identity, merging duplicates field by field.
pub fn merge_comments(base: Vec<FacebookComment>, next: Vec<FacebookComment>) -> Vec<FacebookComment> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<FacebookComment> = Vec::new();
    for comment in base {
        let key = comment.key();
        match index.get(&key) {
            Some(&pos) => merged[pos] = comment,
            None => {
                index.insert(key, merged.len());
                merged.push(comment);
            }
        }
    }
    for comment in next {
        let key = comment.key();
        match index.get(&key) {
            Some(&pos) => merged[pos].merge(comment),
            None => {
                index.insert(key, merged.len());
                merged.push(comment);
            }
        }
    }
    merged
}

fn story_feedback(story: &Value) -> Option<&Value> {
    let ufi = at(story, UFI_STORY);
    ufi.and_then(|u| at(u, UFI_NESTED_FEEDBACK))
        .or_else(|| ufi.and_then(|u| at(u, "/feedback")))
        .or_else(|| at(story, "/comet_sections/feedback/story/feedback"))
        .or_else(|| at(story, "/feedback"))
        .or(ufi)
}

fn story_comments(story: &Value, feedback: &Value) -> Vec<FacebookComment> {
    let ufi = at(story, UFI_STORY).unwrap_or(&NULL);
    let nested = at(ufi, UFI_NESTED_FEEDBACK).unwrap_or(&NULL);
    let interesting = at(feedback, "/interesting_top_level_comments")
        .or_else(|| at(ufi, "/interesting_top_level_comments"))
        .or_else(|| at(ufi, "/feedback_context/feedback_target_with_context/interesting_top_level_comments"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut seen = HashSet::new();
    let mut comments = Vec::new();
    let mut push = |c: &Value| {
        if c.is_object() && seen.insert(raw_comment_key(c)) {
            comments.push(FacebookComment::from_comment(c));
        }
    };

    for entry in interesting {
        if let Some(c) = at(entry, "/comment") {
            push(c);
        }
    }
    for source in [feedback, nested, ufi] {
        for list in ["/comment_rendering_instance/comments/edges", "/comment_rendering_instance/comments/nodes"] {
            for entry in array(source, list) {
                push(at(entry, "/comment").or_else(|| at(entry, "/node")).unwrap_or(entry));
            }
        }
    }
    comments
}

fn story_location(story: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let mut privacy = None;
    let mut name = None;
    let mut url = None;
    for m in array(story, "/comet_sections/context_layout/story/comet_sections/metadata") {
        match text(m, "/__typename").as_str() {
            "CometFeedStoryAudienceStrategy" => {
                privacy = Some(text(m, "/story/privacy_scope/description")).filter(|s| !s.is_empty()).or(privacy);
            }
            "CometFeedStoryLocationStrategy" => {
                if let Some(place) = at(m, "/story/implicit_place") {
                    name = Some(text(place, "/contextual_name")).filter(|s| !s.is_empty()).or(name);
                    url = Some(text(place, "/url")).filter(|s| !s.is_empty()).or(url);
                }
            }
            _ => {}
        }
    }
    (privacy, name, url)
}

/// A feed story with its counts, images and visible comments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookPost {
    pub post_id: String,
    pub story_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_picture: String,
    pub message: String,
    pub link: String,
    pub group_id: String,
    pub group_name: String,
    pub images: Vec<String>,
    pub reaction_count: u64,
    pub reaction_count_i18n: String,
    pub top_reactions: Vec<TopReaction>,
    pub comment_count: u64,
    pub share_count: u64,
    pub share_count_i18n: String,
    pub creation_time: Option<i64>,
    pub comments: Vec<FacebookComment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_url: Option<String>,
}

impl FacebookPost {
    /// Reads a `Story` node. Group fields are kept for group feeds only.
    pub fn from_story(story: &Value, in_group: bool) -> Self {
        let story_id = string_of(story.get("id"));
        let owner = at(story, "/feedback/owning_profile").unwrap_or(&NULL);
        let message = Some(text(story, "/message/text")).filter(|s| !s.is_empty()).unwrap_or_else(|| {
            at(story, "/comet_sections/content/story")
                .map(|inner| {
                    first_text(
                        inner,
                        &[
                            "/message/text",
                            "/comet_sections/message/story/message/text",
                            "/comet_sections/message_container/story/message/text",
                            "/message_container/story/message/text",
                        ],
                    )
                })
                .unwrap_or_default()
        });
        let group = if in_group {
            at(story, "/to")
                .or_else(|| at(story, "/target_group"))
                .or_else(|| at(story, "/feedback/associated_group"))
                .unwrap_or(&NULL)
        } else {
            &NULL
        };
        let feedback = story_feedback(story);
        let (privacy, location_name, location_url) = story_location(story);

        let mut post = Self {
            post_id: Some(string_of(story.get("post_id")))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| story_id.clone()),
            story_id,
            author_id: string_of(owner.get("id")),
            author_name: text(owner, "/name"),
            author_picture: first_text(
                story,
                &[
                    "/actors/0/profile_picture/uri",
                    "/comet_sections/context_layout/story/comet_sections/actor_photo/story/actors/0/profile_picture/uri",
                ],
            ),
            message,
            link: first_text(
                story,
                &[
                    "/permalink_url",
                    "/wwwURL",
                    "/url",
                    "/comet_sections/feedback/story/story_ufi_container/story/url",
                ],
            ),
            group_id: string_of(group.get("id")),
            group_name: text(group, "/name"),
            images: story_images(story),
            comments: story_comments(story, feedback.unwrap_or(&NULL)),
            creation_time: [
                "/creation_time",
                "/comet_sections/context_layout/story/creation_time",
                "/comet_sections/context_layout/story/comet_sections/timestamp/story/creation_time",
                "/comet_sections/context_layout/story/comet_sections/metadata/0/story/creation_time",
                "/comet_sections/timestamp/story/creation_time",
            ]
            .iter()
            .find_map(|p| at(story, p).and_then(Value::as_i64)),
            privacy,
            location_name,
            location_url,
            ..Default::default()
        };

        if let Some(fb) = feedback {
            post.reaction_count = numeric_count(fb.pointer("/reaction_count/count"));
            post.reaction_count_i18n = Some(text(fb, "/i18n_reaction_count"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| count_label(post.reaction_count));
            post.top_reactions = top_reactions(fb);
            post.comment_count = numeric_count(
                at(fb, "/comment_rendering_instance/comments/total_count").or_else(|| {
                    at(
                        fb,
                        "/comments_count_summary_renderer/feedback/comment_rendering_instance/comments/total_count",
                    )
                }),
            );
            post.share_count = numeric_count(fb.pointer("/share_count/count"));
            post.share_count_i18n = Some(text(fb, "/i18n_share_count"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| count_label(post.share_count));
        }
        post
    }

    fn key(&self) -> &str {
        if self.post_id.is_empty() {
            &self.story_id
        } else {
            &self.post_id
        }
    }

    /// Folds a later copy of the same post in: the longer message, the higher
    /// counts, and the union of images and comments.
    pub fn merge(&mut self, next: FacebookPost) {
        let reaction_count = self.reaction_count.max(next.reaction_count);
        let share_count = self.share_count.max(next.share_count);
        if self.reaction_count_i18n.is_empty() || reaction_count != self.reaction_count {
            self.reaction_count_i18n = Some(next.reaction_count_i18n)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.reaction_count_i18n.clone());
        }
        if self.share_count_i18n.is_empty() || share_count != self.share_count {
            self.share_count_i18n = Some(next.share_count_i18n)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.share_count_i18n.clone());
        }
        self.reaction_count = reaction_count;
        self.share_count = share_count;

        fill(&mut self.post_id, &next.post_id);
        fill(&mut self.story_id, &next.story_id);
        fill(&mut self.author_id, &next.author_id);
        fill(&mut self.author_name, &next.author_name);
        fill(&mut self.author_picture, &next.author_picture);
        if self.message.is_empty() || next.message.len() > self.message.len() {
            self.message = next.message;
        }
        fill(&mut self.link, &next.link);
        fill(&mut self.group_id, &next.group_id);
        fill(&mut self.group_name, &next.group_name);
        self.images = dedupe_image_uris(self.images.drain(..).chain(next.images));
        self.top_reactions = merge_top_reactions(&self.top_reactions, &next.top_reactions);
        self.comments = merge_comments(std::mem::take(&mut self.comments), next.comments);
        self.comment_count = self
            .comment_count
            .max(next.comment_count)
            .max(self.comments.len() as u64);
        self.creation_time = self.creation_time.or(next.creation_time);
        self.privacy = self.privacy.take().or(next.privacy);
        self.location_name = self.location_name.take().or(next.location_name);
        self.location_url = self.location_url.take().or(next.location_url);
    }
}

fn count_label(count: u64) -> String {
    if count == 0 {
        String::new()
    } else {
        count.to_string()
    }
}

/// Stories of a group member feed.
pub fn parse_group_feed(body: &str) -> Vec<FacebookPost> {
    let Some(data) = parse_json(body) else {
        return Vec::new();
    };
    let Some(node) = at(&data, "/data/node").filter(|n| text(n, "/__typename") == "Group") else {
        return Vec::new();
    };
    array(node, "/group_member_feed/edges")
        .iter()
        .filter_map(|edge| at(edge, "/node"))
        .filter(|story| text(story, "/__typename") == "Story")
        .map(|story| FacebookPost::from_story(story, true))
        .collect()
}

/// Stories of a profile timeline, single JSON or streamed chunks.
pub fn parse_timeline_feed(body: &str) -> Vec<FacebookPost> {
    let is_story = |v: &&Value| text(v, "/__typename") == "Story";
    let mut stories: Vec<Value> = Vec::new();

    if body.contains('\n') {
        for chunk in body.lines().map(str::trim).filter(|l| !l.is_empty()).filter_map(parse_json) {
            let path = array(&chunk, "/path");
            let in_feed = path.iter().any(|p| p.as_str() == Some("timeline_list_feed_units"))
                && path.iter().any(|p| p.as_str() == Some("edges"));
            if let Some(node) = at(&chunk, "/data/node").filter(is_story).filter(|_| in_feed) {
                stories.push(node.clone());
            }
        }
    } else if let Some(data) = parse_json(body) {
        if let Some(user) = at(&data, "/data/node").filter(|n| text(n, "/__typename") == "User") {
            stories.extend(
                array(user, "/timeline_list_feed_units/edges")
                    .iter()
                    .filter_map(|edge| at(edge, "/node"))
                    .filter(is_story)
                    .cloned(),
            );
        }
    }

    stories.iter().map(|s| FacebookPost::from_story(s, false)).collect()
}

// =============================================================================
// Extractor
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FacebookEntity {
    SearchUser(FacebookSearchUser),
    Ad(FacebookAd),
    Post(FacebookPost),
    Image(String),
}

/// Everything derived from Facebook traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacebookView {
    pub users: Vec<FacebookSearchUser>,
    pub ads: Vec<FacebookAd>,
    pub profiles: Vec<FacebookProfile>,
    pub posts: Vec<FacebookPost>,
    pub images: Vec<String>,
}

impl FacebookView {
    /// Builds the view from store records.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let mut view = Self::default();
        for entity in aggregate(&FacebookExtractor, records) {
            match entity {
                FacebookEntity::SearchUser(u) => view.users.push(u),
                FacebookEntity::Ad(a) => view.ads.push(a),
                FacebookEntity::Post(p) => view.posts.push(p),
                FacebookEntity::Image(i) => view.images.push(i),
            }
        }
        let site: Vec<&CapturedRequest> = site_records(&FacebookExtractor, records).collect();
        view.profiles = aggregate_profiles(&site, &view.posts);
        view
    }
}

/// Extracts Facebook entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacebookExtractor;

impl SiteExtractor for FacebookExtractor {
    type Entity = FacebookEntity;

    fn name(&self) -> &'static str {
        "facebook"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_facebook_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<FacebookEntity> {
        let Some(body) = record.response_body.as_deref() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(data) = parse_json(body) {
            out.extend(
                parse_search_users(&data)
                    .into_iter()
                    .filter(|u| !u.ent_id.is_empty())
                    .map(FacebookEntity::SearchUser),
            );
            out.extend(parse_side_feed_ads(&data).into_iter().map(FacebookEntity::Ad));
        }
        if endpoint(&record.url) == Endpoint::Graphql {
            out.extend(
                parse_group_feed(body)
                    .into_iter()
                    .chain(parse_timeline_feed(body))
                    .filter(|p| !p.key().is_empty())
                    .map(FacebookEntity::Post),
            );
        }
        out.extend(cdn_image_urls(body).into_iter().map(FacebookEntity::Image));
        out
    }

    fn key(&self, entity: &FacebookEntity) -> String {
        match entity {
            FacebookEntity::SearchUser(u) => format!("user:{}", u.ent_id),
            FacebookEntity::Ad(a) => format!("ad:{}", a.key()),
            FacebookEntity::Post(p) => format!("post:{}", p.key()),
            FacebookEntity::Image(i) => format!("image:{}", image_dedupe_key(i)),
        }
    }

    fn merge(&self, existing: &mut FacebookEntity, incoming: FacebookEntity) {
        if let (FacebookEntity::Post(post), FacebookEntity::Post(next)) = (existing, incoming) {
            post.merge(next);
        }
    }

    fn detail(&self, entity: &FacebookEntity) -> String {
        match entity {
            FacebookEntity::Post(p) => format!("{}:{}:{}", p.message.len(), p.comments.len(), p.reaction_count),
            _ => String::new(),
        }
    }
}

impl SiteSummary for FacebookExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_facebook_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(FacebookView::from_records(records)).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use leech_core::RequestType;
    use serde_json::json;

    const GRAPHQL: &str = "https://www.facebook.com/api/graphql/";
    const BULK_ROUTES: &str = "https://www.facebook.com/ajax/bulk-route-definitions/";

    fn record_text(url: &str, body: String) -> CapturedRequest {
        CapturedRequest {
            id: 1.0,
            url: url.into(),
            method: "POST".into(),
            headers: vec![],
            body: None,
            response_body: Some(body),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    fn record(url: &str, response: Value) -> CapturedRequest {
        record_text(url, response.to_string())
    }

    fn routes_body() -> String {
        let data = json!({"payload": {"payloads": {
            "/jane.doe/about": {"result": {
                "type": "route_definition",
                "meta": {"title": " Jane Doe "},
                "exports": {
                    "canonicalRouteName": "comet.fbweb.CometProfileAboutRoute",
                    "actorID": 7,
                    "rootView": {"props": {"userID": "100", "userVanity": "jane.doe"}}
                }
            }},
            "/jane.doe/photos": {"result": {
                "type": "route_definition",
                "exports": {
                    "canonicalRouteName": "comet.fbweb.CometProfilePhotosRoute",
                    "hostableView": {"props": {"userID": "100", "userVanity": "jane.doe"}}
                }
            }},
            "/groups/rustaceans/": {"result": {
                "type": "route_definition",
                "meta": {"title": "Rustaceans"},
                "exports": {
                    "canonicalRouteName": "comet.fbweb.CometGroupDiscussionRoute",
                    "rootView": {"props": {"groupID": 55}}
                }
            }},
            "/paris": {"result": {
                "type": "route_redirect",
                "redirect_url": "/places/Things-to-do-in-Paris/1",
                "redirect_result": {
                    "meta": {"title": "Paris"},
                    "exports": {
                        "canonicalRouteName": "comet.fbweb.CometTopChartsCityRoute",
                        "rootView": {"props": {"id": 1}}
                    }
                }
            }},
            "/broken": {"error": 1, "result": {"type": "route_definition"}}
        }}});
        format!("{JSON_GUARD}{data}")
    }

    fn header_body() -> Value {
        json!({"data": {"user": {"profile_header_renderer": {
            "user": {
                "id": "100",
                "name": "Jane Doe",
                "url": "https://www.facebook.com/jane.doe",
                "profilePicLarge": {"uri": "https://scontent.xx.fbcdn.net/v/large.jpg"},
                "profile_picture_for_sticky_bar": {"uri": "https://scontent.xx.fbcdn.net/v/sticky.jpg"},
                "cover_photo": {"photo": {"image": {"uri": "https://cover"}}}
            },
            "profile_intro_card": {
                "context_items": {"edges": [
                    {"node": {"profile_field_type": "current_city", "short_title": {"text": "Lives in Paris"}, "page_uri": "https://www.facebook.com/paris"}},
                    {"node": {"profile_field_type": "screenname", "short_title": {"text": "", "ranges": [
                        {"entity": {"external_url": "https://www.github.com/jane"}}
                    ]}}}
                ]},
                "profile_status": {"profile_status_text": {"text": " hello "}}
            }
        }}}})
    }

    fn story(post_id: &str, message: &str, reactions: u64, comments: Value) -> Value {
        json!({
            "__typename": "Story",
            "id": format!("S:{post_id}"),
            "post_id": post_id,
            "message": {"text": message},
            "actors": [{"profile_picture": {"uri": "https://pic/author.jpg"}}],
            "attachments": [{
                "media": {"image": {"uri": "https://scontent.x/v/a.jpg?x=1"}},
                "styles": {"attachment": {"media": {"photo_image": {"uri": "https://scontent.x/v/a.jpg?x=2"}}}},
                "actor_photo": {"uri": "https://scontent.x/v/skip.jpg"}
            }],
            "feedback": {
                "owning_profile": {"id": "100", "name": "Jane Doe"},
                "reaction_count": {"count": reactions},
                "top_reactions": {"edges": [{"node": {"localized_name": "Like"}, "reaction_count": reactions}]},
                "share_count": {"count": 1},
                "comment_rendering_instance": {"comments": {"total_count": 1, "edges": comments}}
            },
            "to": {"id": 55, "name": "Rustaceans"},
            "creation_time": 1_700_000_000
        })
    }

    fn group_feed(stories: Vec<Value>) -> Value {
        let edges: Vec<Value> = stories.into_iter().map(|s| json!({"node": s})).collect();
        json!({"data": {"node": {"__typename": "Group", "group_member_feed": {"edges": edges}}}})
    }

    #[test]
    fn host_and_endpoint_matching() {
        assert!(is_facebook_host("www.facebook.com"));
        assert!(is_facebook_host("m.facebook.com"));
        assert!(!is_facebook_host("notfacebook.com"));
        assert_eq!(endpoint(GRAPHQL), Endpoint::Graphql);
        assert_eq!(endpoint(BULK_ROUTES), Endpoint::BulkRoutes);
        assert_eq!(endpoint("https://m.facebook.com/api/graphql/"), Endpoint::Other);
    }

    #[test]
    fn numeric_counts() {
        assert_eq!(numeric_count(Some(&json!(12))), 12);
        assert_eq!(numeric_count(Some(&json!("1,204"))), 1204);
        assert_eq!(numeric_count(Some(&json!("none"))), 0);
        assert_eq!(numeric_count(None), 0);
    }

    #[test]
    fn search_users_and_ads() {
        let data = json!({"data": {"viewer": {
            "bootstrap_keywords": {"edges": [
                {"node": {"keyword_text": "jane", "item_logging_info": "{\"kwEntId\":\"100\"}",
                          "sts_info": {"direct_nav_result": {"entity_type": "user", "img_url": "https://img"}}}},
                {"node": {"keyword_text": "rust", "sts_info": {"direct_nav_result": {"entity_type": "page", "ent_id": "9"}}}}
            ]},
            "sideFeedUnit": {"nodes": [
                {"__typename": "AdsSideFeedUnit", "new_adverts": {"nodes": [
                    {"sponsored_data": {"ad_id": "a1"}, "rhc_ad": {"title": "Buy", "target_url": "https://shop", "actor": {"id": "3"}}},
                    {"id": "x"}
                ]}},
                {"__typename": "Other", "new_adverts": {"nodes": [{"rhc_ad": {"title": "Hidden"}}]}}
            ]}
        }}});

        let users = parse_search_users(&data);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].ent_id, "100");
        assert_eq!(users[0].title, "jane");

        let ads = parse_side_feed_ads(&data);
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].id, "a1");
        assert_eq!(ads[0].web_link_url, "https://shop");
    }

    #[test]
    fn route_sections_by_name_and_path() {
        assert_eq!(route_section("CometProfileAboutRoute", ""), Some("About"));
        assert_eq!(route_section("CometProfileCollectionRoute", "/x/friends_all"), Some("Friends"));
        assert_eq!(route_section("CometProfileCollectionRoute", "/x/likes"), None);
        assert_eq!(route_section("", "/x/videos?ref=1"), Some("Videos"));
        assert_eq!(route_section("", "/x/reviews_given"), Some("Reviews given"));
        assert_eq!(route_section("", "/x"), None);
    }

    #[test]
    fn route_definitions() {
        let profiles = parse_route_profiles(&routes_body());
        let place = profiles.iter().find(|p| p.kind == ProfileKind::Place).unwrap();
        assert_eq!(place.name, "Paris");
        assert_eq!(place.profile_url, "https://www.facebook.com/places/Things-to-do-in-Paris/1");

        let group = profiles.iter().find(|p| p.kind == ProfileKind::Group).unwrap();
        assert_eq!(group.name, "Rustaceans");
        assert_eq!(group.profile_url, "https://www.facebook.com/groups/rustaceans");

        let user = profiles.iter().find(|p| p.kind == ProfileKind::User).unwrap();
        assert_eq!(profiles.len(), 3);
        assert_eq!(user.name, "Jane Doe");
        assert_eq!(user.viewer_id, "7");
        assert_eq!(user.profile_url, "https://www.facebook.com/jane.doe");
        let sections: Vec<_> = user.route_sections.iter().map(|s| s.section.as_str()).collect();
        assert_eq!(sections, vec!["About", "Photos"]);
    }

    #[test]
    fn profile_header_fields() {
        let header = parse_profile_header(&header_body().to_string()).unwrap();
        assert_eq!(header.username, "jane.doe");
        assert_eq!(
            header.avatar_uris,
            vec!["https://scontent.xx.fbcdn.net/v/sticky.jpg", "https://scontent.xx.fbcdn.net/v/large.jpg"]
        );
        assert_eq!(header.cover_photo_uri, "https://cover");
        assert_eq!(header.intro_card.current_city, "Lives in Paris");
        assert_eq!(header.intro_card.links[0].label, "github.com");
        assert_eq!(header.intro_card.bio, "hello");
    }

    #[test]
    fn streamed_profile_header() {
        let body = [
            json!({"data": {"id": "200", "name": "Sam"}, "path": ["user"]}).to_string(),
            json!({"data": {"user": {"__typename": "User", "gender": "MALE"}}, "path": ["viewer"]}).to_string(),
        ]
        .join("\n");
        let header = parse_profile_header(&body).unwrap();
        assert_eq!(header.id, "200");
        assert_eq!(header.name, "Sam");
        assert_eq!(header.gender, "MALE");
        assert!(parse_profile_header("{}").is_none());
    }

    #[test]
    fn group_feed_post() {
        let comment = json!([{"node": {
            "id": "c1",
            "author": {"name": "Bob", "profile_picture_depth_0": {"uri": "https://pic/bob.jpg"}},
            "body": {"text": "nice"},
            "feedback": {"reactors": {"count_reduced": "3"}, "total_reply_count": 2},
            "inline_replies_expander_renderer": {"interesting_reply": {"id": "r1", "author": {"name": "Ann"}}}
        }}]);
        let posts = parse_group_feed(&group_feed(vec![story("p1", "hi", 4, comment)]).to_string());
        assert_eq!(posts.len(), 1);

        let post = &posts[0];
        assert_eq!(post.post_id, "p1");
        assert_eq!(post.story_id, "S:p1");
        assert_eq!(post.author_id, "100");
        assert_eq!(post.author_picture, "https://pic/author.jpg");
        assert_eq!(post.group_id, "55");
        assert_eq!(post.images, vec!["https://scontent.x/v/a.jpg?x=1"]);
        assert_eq!(post.reaction_count, 4);
        assert_eq!(post.reaction_count_i18n, "4");
        assert_eq!(post.share_count, 1);
        assert_eq!(post.creation_time, Some(1_700_000_000));

        let c = &post.comments[0];
        assert_eq!(c.author_picture, "https://pic/bob.jpg");
        assert_eq!(c.reaction_count, 3);
        assert_eq!(c.reply_count, 2);
        assert_eq!(c.reply_preview.as_ref().unwrap().author_name, "Ann");
    }

    #[test]
    fn streamed_timeline_feed() {
        let s = story("p2", "timeline", 1, json!([]));
        let body = [
            json!({"data": {"node": s}, "path": ["node", "timeline_list_feed_units", "edges", 0]}).to_string(),
            json!({"data": {"node": s}, "path": ["node", "other"]}).to_string(),
        ]
        .join("\n");
        let posts = parse_timeline_feed(&body);
        assert_eq!(posts.len(), 1);
        assert!(posts[0].group_id.is_empty());
        assert!(parse_group_feed(&body).is_empty());
    }

    #[test]
    fn posts_merge_across_records() {
        let first = story("p1", "short", 2, json!([{"node": {"id": "c1", "body": {"text": "a"}}}]));
        let second = story(
            "p1",
            "a longer message",
            5,
            json!([{"node": {"id": "c1", "body": {"text": "a longer"}}}, {"node": {"id": "c2"}}]),
        );
        let records = vec![
            record(GRAPHQL, group_feed(vec![first])),
            record(GRAPHQL, group_feed(vec![second])),
        ];

        let view = FacebookView::from_records(&records);
        assert_eq!(view.posts.len(), 1);
        let post = &view.posts[0];
        assert_eq!(post.message, "a longer message");
        assert_eq!(post.reaction_count, 5);
        assert_eq!(post.reaction_count_i18n, "5");
        assert_eq!(post.top_reactions, vec![TopReaction { name: "Like".into(), count: 5 }]);
        assert_eq!(post.comments.len(), 2);
        assert_eq!(post.comments[0].body, "a longer");
        assert_eq!(post.comment_count, 2);
    }

    #[test]
    fn profiles_join_routes_headers_and_pictures() {
        let loose_picture = json!({"data": {"viewer": {"friend": {
            "id": "300", "profile_picture": {"uri": "https://pic/sam.jpg"}
        }}}});
        let records = vec![
            record(GRAPHQL, header_body()),
            record_text(BULK_ROUTES, routes_body()),
            record_text(
                BULK_ROUTES,
                format!(
                    "{JSON_GUARD}{}",
                    json!({"payload": {"payloads": {"/profile.php?id=300": {"result": {
                        "type": "route_definition",
                        "exports": {"canonicalRouteName": "CometProfileTimelineRoute", "rootView": {"props": {"userID": 300}}}
                    }}}}})
                ),
            ),
            record(GRAPHQL, loose_picture),
            record("https://example.com/api/graphql/", header_body()),
        ];

        let view = FacebookView::from_records(&records);
        assert_eq!(view.profiles.len(), 4);

        let jane = view.profiles.iter().find(|p| p.user_id == "100").unwrap();
        assert_eq!(jane.username, "jane.doe");
        assert_eq!(jane.intro_card.bio, "hello");
        assert_eq!(jane.tabs.len(), 2);
        assert_eq!(jane.tabs[0].name, "About");

        let sam = view.profiles.iter().find(|p| p.user_id == "300").unwrap();
        assert_eq!(sam.profile_url, "https://www.facebook.com/profile.php?id=300");
        assert_eq!(sam.avatar_uris, vec!["https://pic/sam.jpg"]);
    }

    #[test]
    fn cdn_images_dedupe_by_path() {
        let body = r#"{"a":"https://scontent-cdg.xx.fbcdn.net/v/t1/p.jpg?oh=1","b":"https://scontent-ams.xx.fbcdn.net/v/t1/p.jpg?oh=2","c":"https://static.xx.fbcdn.net/v/x.png"}"#;
        assert_eq!(cdn_image_urls(body), vec!["https://scontent-cdg.xx.fbcdn.net/v/t1/p.jpg?oh=1"]);
    }
}
