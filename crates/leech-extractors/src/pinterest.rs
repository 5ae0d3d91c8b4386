//! Pinterest pins, conversations, users and images.
//!
//! Resource responses (`resource_response.data`) mix pins, conversations and
//! user objects in one list. Images are collected from every item and reduced
//! to the largest rendition of each file.

use std::collections::HashMap;

use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{aggregate, id_field, parse_json, str_field, SiteExtractor, SiteSummary};

static SIZE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)x$").unwrap());

/// Priority of `/originals/` over any sized rendition.
const ORIGINALS_PRIORITY: u32 = 99_999;

/// Keys under which items keep image maps or lists.
const IMAGE_KEYS: &[&str] = &[
    "images",
    "contextual_pin_image_urls",
    "recent_pin_images",
    "cover_images",
    "best_pins_images",
];

fn path_segments(url: &str) -> Option<Vec<String>> {
    let parsed = url::Url::parse(url).ok()?;
    Some(
        parsed
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Identity of an image file across renditions: its path without the size
/// segment.
pub fn image_signature(url: &str) -> String {
    match path_segments(url) {
        Some(parts) if parts.len() >= 2 => parts[1..].join("/"),
        Some(parts) if !parts.is_empty() => format!("/{}", parts.join("/")),
        _ => url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string()),
    }
}

/// Rendition size from the first path segment (`236x`, `originals`).
pub fn size_priority(url: &str) -> u32 {
    let Some(first) = path_segments(url).and_then(|p| p.into_iter().next()) else {
        return 0;
    };
    if first == "originals" {
        return ORIGINALS_PRIORITY;
    }
    SIZE_SEGMENT
        .captures(&first)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestImage {
    pub url: String,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub dominant_color: Option<String>,
}

impl PinterestImage {
    fn from_value(v: &Value) -> Option<Self> {
        let url = v.get("url").and_then(Value::as_str).filter(|u| !u.is_empty())?;
        Some(Self {
            url: url.to_string(),
            width: v.get("width").and_then(Value::as_u64),
            height: v.get("height").and_then(Value::as_u64),
            dominant_color: v
                .get("dominant_color")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Keeps the largest rendition per signature, in first-seen order.
pub fn dedupe_largest(images: Vec<PinterestImage>) -> Vec<PinterestImage> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<PinterestImage> = Vec::new();
    for image in images {
        let signature = image_signature(&image.url);
        if signature.is_empty() {
            continue;
        }
        match index.get(&signature) {
            Some(&pos) => {
                if size_priority(&image.url) > size_priority(&out[pos].url) {
                    out[pos] = image;
                }
            }
            None => {
                index.insert(signature, out.len());
                out.push(image);
            }
        }
    }
    out
}

/// Images directly in a list, or under the known image keys of an object.
pub fn collect_images(value: &Value, out: &mut Vec<PinterestImage>) {
    match value {
        Value::Array(items) => out.extend(items.iter().filter_map(PinterestImage::from_value)),
        Value::Object(map) => {
            for key in IMAGE_KEYS {
                match map.get(*key) {
                    Some(list @ Value::Array(_)) => collect_images(list, out),
                    Some(Value::Object(sizes)) => {
                        for size in sizes.values() {
                            match size {
                                Value::Array(_) => collect_images(size, out),
                                Value::Object(_) => out.extend(PinterestImage::from_value(size)),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestUser {
    pub id: String,
    pub node_id: String,
    pub username: String,
    pub full_name: String,
    pub image_large_url: String,
    pub is_default_image: bool,
}

impl PinterestUser {
    pub fn from_value(u: &Value) -> Option<Self> {
        if !u.is_object() {
            return None;
        }
        let image_large_url = ["image_large_url", "image_small_url", "image_medium_url", "image_xlarge_url"]
            .iter()
            .map(|k| str_field(u, k))
            .find(|s| !s.is_empty())
            .unwrap_or_default();
        let full_name = Some(str_field(u, "full_name"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| str_field(u, "first_name"));
        Some(Self {
            id: id_field(u, "id").unwrap_or_default(),
            node_id: str_field(u, "node_id"),
            username: str_field(u, "username").trim().to_string(),
            full_name: full_name.trim().to_string(),
            image_large_url,
            is_default_image: u.get("is_default_image").and_then(Value::as_bool) == Some(true),
        })
    }

    /// Full name, then username.
    pub fn display_name(&self) -> Option<&str> {
        [&self.full_name, &self.username]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestBoard {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub owner: Option<PinterestUser>,
    pub pin_count: Option<u64>,
}

/// A pin with its images deduplicated by rendition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestPin {
    pub id: String,
    pub node_id: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub domain: String,
    pub created_at: String,
    pub pinner: Option<PinterestUser>,
    pub board: Option<PinterestBoard>,
    pub images: Vec<PinterestImage>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl PinterestPin {
    pub fn from_item(item: &Value) -> Self {
        let first = |keys: &[&str]| {
            keys.iter()
                .map(|k| str_field(item, k))
                .find(|s| !s.is_empty())
                .unwrap_or_default()
        };
        let mut images = Vec::new();
        collect_images(item, &mut images);

        Self {
            id: id_field(item, "id").unwrap_or_default(),
            node_id: str_field(item, "node_id"),
            title: first(&["title", "grid_title"]).trim().to_string(),
            description: str_field(item, "description").trim().to_string(),
            link: first(&["link", "ad_destination_url"]),
            domain: str_field(item, "domain"),
            created_at: str_field(item, "created_at"),
            pinner: item
                .get("pinner")
                .filter(|p| p.is_object())
                .or_else(|| item.get("native_creator"))
                .and_then(PinterestUser::from_value),
            board: item.get("board").filter(|b| b.is_object()).map(|b| PinterestBoard {
                id: id_field(b, "id"),
                name: b.get("name").and_then(Value::as_str).map(str::to_string),
                url: b.get("url").and_then(Value::as_str).map(str::to_string),
                owner: b.get("owner").and_then(PinterestUser::from_value),
                pin_count: b.get("pin_count").and_then(Value::as_u64),
            }),
            images: dedupe_largest(images),
            kind: item.get("type").and_then(Value::as_str).map(str::to_string),
        }
    }

    fn key(&self) -> &str {
        if self.node_id.is_empty() {
            &self.id
        } else {
            &self.node_id
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastMessage {
    pub text: String,
    pub created_ms: Option<i64>,
    pub created_at: String,
    pub sender: Option<PinterestUser>,
}

/// A direct message conversation with its last message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestConversation {
    pub node_id: String,
    pub id: String,
    pub unread: u64,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub created_at: String,
    pub last_message: LastMessage,
    pub users: Vec<PinterestUser>,
}

impl PinterestConversation {
    pub fn from_item(item: &Value) -> Self {
        let last_message = item
            .get("last_message")
            .filter(|m| m.is_object())
            .map(|m| LastMessage {
                text: str_field(m, "text").trim().to_string(),
                created_ms: m.get("created_ms").and_then(Value::as_i64),
                created_at: str_field(m, "created_at"),
                sender: m.get("sender").and_then(PinterestUser::from_value),
            })
            .unwrap_or_default();

        Self {
            node_id: str_field(item, "node_id"),
            id: id_field(item, "id").unwrap_or_default(),
            unread: item.get("unread").and_then(Value::as_u64).unwrap_or(0),
            kind: item.get("type").and_then(Value::as_str).map(str::to_string),
            name: item.get("name").and_then(Value::as_str).map(str::to_string),
            created_at: str_field(item, "created_at"),
            last_message,
            users: item
                .get("users")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(PinterestUser::from_value)
                .collect(),
        }
    }

    fn key(&self) -> &str {
        if self.node_id.is_empty() {
            &self.id
        } else {
            &self.node_id
        }
    }
}

/// Items of a resource response.
pub fn resource_items(data: &Value) -> &[Value] {
    let Some(rr) = data.get("resource_response") else {
        return &[];
    };
    rr.get("data")
        .and_then(Value::as_array)
        .or_else(|| rr.pointer("/resource_response/data").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Returns true for pinterest.com and its subdomains.
pub fn is_pinterest_host(host: &str) -> bool {
    host == "pinterest.com" || host.ends_with(".pinterest.com")
}

#[derive(Debug, Clone, PartialEq)]
pub enum PinterestEntity {
    Pin(PinterestPin),
    Conversation(PinterestConversation),
    User(PinterestUser),
    Image(PinterestImage),
}

fn item_entities(item: &Value, out: &mut Vec<PinterestEntity>) {
    let kind = item.get("type").and_then(Value::as_str);
    let truthy = |key: &str| item.get(key).is_some_and(|v| !v.is_null() && v != &Value::Bool(false));
    let mut users = Vec::new();
    let mut images = Vec::new();

    if (kind == Some("pin") || truthy("images")) && !truthy("is_promoted") {
        let pin = PinterestPin::from_item(item);
        if !pin.images.is_empty() && !pin.key().is_empty() {
            users.extend(pin.pinner.clone());
            users.extend(pin.board.as_ref().and_then(|b| b.owner.clone()));
            images.extend(pin.images.iter().cloned());
            out.push(PinterestEntity::Pin(pin));
        }
    }

    if kind == Some("conversation") || (truthy("last_message") && truthy("users")) {
        let conversation = PinterestConversation::from_item(item);
        let mut conversation_images = Vec::new();
        collect_images(item, &mut conversation_images);
        let has_sender = conversation
            .last_message
            .sender
            .as_ref()
            .and_then(PinterestUser::display_name)
            .is_some();
        let has_content = !conversation.last_message.text.is_empty()
            || !conversation.users.is_empty()
            || !conversation_images.is_empty();
        if (has_sender || has_content) && !conversation.key().is_empty() {
            users.extend(conversation.last_message.sender.clone());
            users.extend(conversation.users.iter().cloned());
            images.extend(conversation_images);
            out.push(PinterestEntity::Conversation(conversation));
        }
    }

    if kind == Some("user") {
        users.extend(PinterestUser::from_value(item));
    }
    collect_images(item, &mut images);

    out.extend(
        users
            .into_iter()
            .filter(|u| !u.id.is_empty())
            .map(PinterestEntity::User),
    );
    out.extend(images.into_iter().map(PinterestEntity::Image));
}

/// Conversations, pins, users and images seen across captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PinterestView {
    pub conversations: Vec<PinterestConversation>,
    pub pins: Vec<PinterestPin>,
    pub users: Vec<PinterestUser>,
    pub images: Vec<PinterestImage>,
}

impl PinterestView {
    /// Builds the view from store records.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let mut view = Self::default();
        for entity in aggregate(&PinterestExtractor, records) {
            match entity {
                PinterestEntity::Pin(p) => view.pins.push(p),
                PinterestEntity::Conversation(c) => view.conversations.push(c),
                PinterestEntity::User(u) => view.users.push(u),
                PinterestEntity::Image(i) => view.images.push(i),
            }
        }
        view
    }
}

/// Extracts Pinterest entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinterestExtractor;

impl SiteExtractor for PinterestExtractor {
    type Entity = PinterestEntity;

    fn name(&self) -> &'static str {
        "pinterest"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_pinterest_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<PinterestEntity> {
        let Some(data) = record.response_body.as_deref().and_then(parse_json) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for item in resource_items(&data).iter().filter(|i| i.is_object()) {
            item_entities(item, &mut out);
        }
        out
    }

    fn key(&self, entity: &PinterestEntity) -> String {
        match entity {
            PinterestEntity::Pin(p) => format!("pin:{}", p.key()),
            PinterestEntity::Conversation(c) => format!("conversation:{}", c.key()),
            PinterestEntity::User(u) => format!("user:{}", u.id),
            PinterestEntity::Image(i) => format!("image:{}", image_signature(&i.url)),
        }
    }

    fn merge(&self, existing: &mut PinterestEntity, incoming: PinterestEntity) {
        match (existing, incoming) {
            (PinterestEntity::User(slot), PinterestEntity::User(user)) => *slot = user,
            (PinterestEntity::Image(slot), PinterestEntity::Image(image)) => {
                if size_priority(&image.url) > size_priority(&slot.url) {
                    *slot = image;
                }
            }
            _ => {}
        }
    }

    fn detail(&self, entity: &PinterestEntity) -> String {
        match entity {
            PinterestEntity::Image(i) => size_priority(&i.url).to_string(),
            _ => String::new(),
        }
    }
}

impl SiteSummary for PinterestExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_pinterest_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(PinterestView::from_records(records)).unwrap_or(Value::Null)
    }
}
