//! Discord channel messages and their users.

use std::collections::HashMap;

use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{
    id_field, merge_entities, parse_json, site_records, str_field, SiteExtractor, SiteSummary,
};

const AVATAR_CDN: &str = "https://cdn.discordapp.com/avatars";

/// Replies keep at most this many characters of the referenced message.
const REPLY_PREVIEW_CHARS: usize = 200;

static CHANNEL_MESSAGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/channels/(?:\d+/)?(\d+)/messages").unwrap());

/// A message author, reply author or mention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    pub global_name: String,
    pub discriminator: String,
    pub avatar: String,
    pub avatar_url: String,
    pub bot: bool,
    pub clan: Option<Value>,
    pub primary_guild: Option<Value>,
}

impl DiscordUser {
    /// Normalizes a user object. Requires an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = id_field(value, "id")?;
        let avatar = str_field(value, "avatar");
        let discriminator = match str_field(value, "discriminator") {
            d if d.is_empty() => "0".to_string(),
            d => d,
        };
        Some(Self {
            avatar_url: avatar_url(&id, &avatar),
            username: str_field(value, "username"),
            global_name: str_field(value, "global_name"),
            discriminator,
            avatar,
            bot: value.get("bot").and_then(Value::as_bool).unwrap_or(false),
            clan: value.get("clan").filter(|v| !v.is_null()).cloned(),
            primary_guild: value.get("primary_guild").filter(|v| !v.is_null()).cloned(),
            id,
        })
    }

    /// Display name, falling back to the username.
    pub fn display_name(&self) -> &str {
        if self.global_name.is_empty() {
            &self.username
        } else {
            &self.global_name
        }
    }
}

/// CDN URL of a user avatar. Animated avatars (hash prefixed `a_`) are gifs.
pub fn avatar_url(user_id: &str, hash: &str) -> String {
    if user_id.is_empty() || hash.is_empty() {
        return String::new();
    }
    let ext = if hash.starts_with("a_") { "gif" } else { "png" };
    format!("{AVATAR_CDN}/{user_id}/{hash}.{ext}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordAttachment {
    pub id: Option<String>,
    pub filename: String,
    pub size: Option<u64>,
    pub url: String,
    pub proxy_url: String,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedThumbnail {
    pub url: String,
    pub proxy_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordEmbed {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub color: Option<u64>,
    pub thumbnail: Option<EmbedThumbnail>,
}

/// Short form of the message a reply points to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferencedMessage {
    pub id: String,
    pub content: String,
    pub author: Option<DiscordUser>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: u64,
}

/// A channel message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(rename = "type")]
    pub kind: Option<i64>,
    pub content: String,
    pub timestamp: String,
    pub edited_timestamp: Option<String>,
    pub author: Option<DiscordUser>,
    pub mentions: Vec<DiscordUser>,
    pub attachments: Vec<DiscordAttachment>,
    pub embeds: Vec<DiscordEmbed>,
    pub referenced_message: Option<ReferencedMessage>,
    pub reactions: Vec<Reaction>,
    pub pinned: bool,
}

impl DiscordMessage {
    /// Returns true if the message has text, attachments or embeds.
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty() || !self.attachments.is_empty() || !self.embeds.is_empty()
    }
}

fn list<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn parse_attachment(a: &Value) -> DiscordAttachment {
    let url = str_field(a, "url");
    let proxy_url = match str_field(a, "proxy_url") {
        p if p.is_empty() => url.clone(),
        p => p,
    };
    DiscordAttachment {
        id: id_field(a, "id"),
        filename: str_field(a, "filename"),
        size: a.get("size").and_then(Value::as_u64),
        url,
        proxy_url,
        width: a.get("width").and_then(Value::as_u64),
        height: a.get("height").and_then(Value::as_u64),
        content_type: str_field(a, "content_type"),
    }
}

fn parse_embed(e: &Value) -> DiscordEmbed {
    let kind = match str_field(e, "type") {
        k if k.is_empty() => "rich".to_string(),
        k => k,
    };
    DiscordEmbed {
        kind,
        url: str_field(e, "url"),
        title: str_field(e, "title"),
        description: str_field(e, "description"),
        color: e.get("color").and_then(Value::as_u64),
        thumbnail: e
            .get("thumbnail")
            .filter(|t| t.is_object())
            .map(|t| EmbedThumbnail {
                url: str_field(t, "url"),
                proxy_url: str_field(t, "proxy_url"),
            }),
    }
}

fn parse_reference(r: &Value) -> Option<ReferencedMessage> {
    Some(ReferencedMessage {
        id: id_field(r, "id")?,
        content: str_field(r, "content")
            .chars()
            .take(REPLY_PREVIEW_CHARS)
            .collect(),
        author: r.get("author").and_then(DiscordUser::from_value),
        timestamp: r.get("timestamp").and_then(Value::as_str).map(str::to_string),
    })
}

fn parse_reaction(re: &Value) -> Reaction {
    let emoji = re
        .get("emoji")
        .and_then(|e| id_field(e, "name").or_else(|| id_field(e, "id")))
        .unwrap_or_else(|| "?".to_string());
    Reaction {
        emoji,
        count: re.get("count").and_then(Value::as_u64).unwrap_or(0),
    }
}

/// Parses a channel messages response.
///
/// `url` supplies the channel id for messages that do not carry one.
pub fn parse_messages(body: &str, url: &str) -> Vec<DiscordMessage> {
    let channel_id = CHANNEL_MESSAGES
        .captures(url)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let Some(Value::Array(items)) = parse_json(body) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|msg| {
            let id = id_field(msg, "id")?;
            Some(DiscordMessage {
                channel_id: id_field(msg, "channel_id").unwrap_or_else(|| channel_id.clone()),
                kind: msg.get("type").and_then(Value::as_i64),
                content: str_field(msg, "content"),
                timestamp: str_field(msg, "timestamp"),
                edited_timestamp: msg
                    .get("edited_timestamp")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                author: msg.get("author").and_then(DiscordUser::from_value),
                mentions: list(msg, "mentions")
                    .filter_map(DiscordUser::from_value)
                    .collect(),
                attachments: list(msg, "attachments").map(parse_attachment).collect(),
                embeds: list(msg, "embeds").map(parse_embed).collect(),
                referenced_message: msg.get("referenced_message").and_then(parse_reference),
                reactions: list(msg, "reactions").map(parse_reaction).collect(),
                pinned: msg.get("pinned").and_then(Value::as_bool).unwrap_or(false),
                id,
            })
        })
        .collect()
}

/// Returns true for discord.com and its subdomains.
pub fn is_discord_host(host: &str) -> bool {
    host == "discord.com" || host.ends_with(".discord.com")
}

/// Messages and users seen across captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscordView {
    pub users: Vec<DiscordUser>,
    pub messages: Vec<DiscordMessage>,
}

impl DiscordView {
    /// Builds the view from store records.
    ///
    /// Users are collected from every message version seen, including
    /// messages that are later dropped as empty.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let extractor = DiscordExtractor;
        let extracted: Vec<DiscordMessage> = site_records(&extractor, records)
            .flat_map(|r| extractor.extract(r))
            .collect();
        let users = collect_users(&extracted);
        Self {
            users,
            messages: extractor.finish(merge_entities(&extractor, extracted)),
        }
    }
}

fn collect_users(messages: &[DiscordMessage]) -> Vec<DiscordUser> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut users: Vec<DiscordUser> = Vec::new();
    let mut add = |user: &DiscordUser| match index.get(&user.id) {
        Some(&pos) => users[pos] = user.clone(),
        None => {
            index.insert(user.id.clone(), users.len());
            users.push(user.clone());
        }
    };

    for msg in messages {
        let Some(author) = &msg.author else {
            continue;
        };
        add(author);
        if let Some(reply_author) = msg.referenced_message.as_ref().and_then(|r| r.author.as_ref()) {
            add(reply_author);
        }
        for mention in &msg.mentions {
            add(mention);
        }
    }

    users.retain(|u| !u.display_name().is_empty());
    users
}

/// Extracts Discord channel messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscordExtractor;

impl SiteExtractor for DiscordExtractor {
    type Entity = DiscordMessage;

    fn name(&self) -> &'static str {
        "discord"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_discord_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<DiscordMessage> {
        match record.response_body.as_deref() {
            Some(body) => parse_messages(body, &record.url),
            None => Vec::new(),
        }
    }

    fn key(&self, entity: &DiscordMessage) -> String {
        entity.id.clone()
    }

    fn merge(&self, existing: &mut DiscordMessage, incoming: DiscordMessage) {
        *existing = incoming;
    }

    fn finish(&self, mut entities: Vec<DiscordMessage>) -> Vec<DiscordMessage> {
        entities.retain(DiscordMessage::has_content);
        entities.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entities
    }
}

impl SiteSummary for DiscordExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_discord_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(DiscordView::from_records(records)).unwrap_or(Value::Null)
    }
}
