//! Twitter / X tweets, users and trends.
//!
//! Everything comes from GraphQL responses. The home, profile and conversation
//! timelines yield tweets, profile lookups and the sidebar yield users, and the
//! explore sidebar yields trends. Tweets and users are keyed by rest id and the
//! first version seen wins.

use std::cmp::Reverse;

use leech_core::payload::TRUNCATION_MARKER;
use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{aggregate, id_field, parse_json, SiteExtractor, SiteSummary};

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

static NULL: Value = Value::Null;

const TWEET_TYPENAMES: &[&str] = &["Tweet", "TweetWithVisibilityResults"];

/// Key of the home timeline object, for bodies that no longer parse whole.
const HOME_TIMELINE_KEY: &str = "\"home_timeline_urt\"";

fn text(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn non_empty(value: &Value, pointer: &str) -> Option<String> {
    Some(text(value, pointer)).filter(|s| !s.is_empty())
}

fn flag(value: &Value, pointer: &str) -> bool {
    value.pointer(pointer).and_then(Value::as_bool) == Some(true)
}

fn array<'a>(value: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn kind(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Entries of a `TimelineAddEntries` instruction; nothing for other kinds.
fn added_entries(instruction: &Value) -> impl Iterator<Item = &Value> {
    let add = kind(instruction) == Some("TimelineAddEntries");
    instruction
        .get("entries")
        .and_then(Value::as_array)
        .filter(|_| add)
        .into_iter()
        .flatten()
}

/// A user from any GraphQL `user_results.result` object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TwitterUser {
    pub id: String,
    pub rest_id: String,
    pub name: String,
    pub screen_name: String,
    pub avatar_url: String,
    pub created_at: String,
    pub description: String,
    pub url: String,
    pub display_url: String,
    pub description_urls: Vec<String>,
    pub location: String,
    pub profile_banner_url: String,
    pub followers_count: Option<u64>,
    pub friends_count: Option<u64>,
    pub favourites_count: Option<u64>,
    pub statuses_count: Option<u64>,
    pub listed_count: Option<u64>,
    pub media_count: Option<u64>,
    pub protected: bool,
    pub following: bool,
    pub verified: bool,
    pub verified_type: String,
    pub is_blue_verified: bool,
    pub can_dm: bool,
    pub professional_categories: Vec<String>,
    pub pinned_tweet_ids: Vec<String>,
}

impl TwitterUser {
    /// Normalizes a user result. Requires `__typename: "User"` and a rest id.
    pub fn from_result(r: &Value) -> Option<Self> {
        if r.get("__typename").and_then(Value::as_str) != Some("User") {
            return None;
        }
        let rest_id = non_empty(r, "/rest_id")?;

        let profile_link = r.pointer("/legacy/entities/url/urls/0");
        let url = profile_link
            .and_then(|u| non_empty(u, "/expanded_url").or_else(|| non_empty(u, "/url")))
            .unwrap_or_else(|| text(r, "/legacy/url"));
        let description = non_empty(r, "/profile_bio/description")
            .unwrap_or_else(|| text(r, "/legacy/description"));
        let count = |field: &str| r.pointer(&format!("/legacy/{field}")).and_then(Value::as_u64);

        Some(Self {
            id: text(r, "/id"),
            name: text(r, "/core/name"),
            screen_name: text(r, "/core/screen_name"),
            avatar_url: text(r, "/avatar/image_url"),
            created_at: text(r, "/core/created_at"),
            description: description.trim().to_string(),
            url,
            display_url: profile_link
                .map(|u| text(u, "/display_url"))
                .unwrap_or_default(),
            description_urls: array(r, "/legacy/entities/description/urls")
                .filter_map(|u| non_empty(u, "/expanded_url").or_else(|| non_empty(u, "/url")))
                .collect(),
            location: text(r, "/location/location").trim().to_string(),
            profile_banner_url: text(r, "/legacy/profile_banner_url"),
            followers_count: count("followers_count"),
            friends_count: count("friends_count"),
            favourites_count: count("favourites_count"),
            statuses_count: count("statuses_count"),
            listed_count: count("listed_count"),
            media_count: count("media_count"),
            protected: flag(r, "/privacy/protected"),
            following: flag(r, "/relationship_perspectives/following"),
            verified: flag(r, "/verification/verified") || flag(r, "/is_blue_verified"),
            verified_type: text(r, "/verification/verified_type"),
            is_blue_verified: flag(r, "/is_blue_verified"),
            can_dm: flag(r, "/dm_permissions/can_dm"),
            professional_categories: array(r, "/professional/category")
                .filter_map(|c| non_empty(c, "/name"))
                .collect(),
            pinned_tweet_ids: array(r, "/legacy/pinned_tweet_ids_str")
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            rest_id,
        })
    }
}

/// A tweet with its author and engagement counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TwitterTweet {
    pub rest_id: String,
    pub full_text: String,
    pub created_at: String,
    pub author_name: String,
    pub author_screen_name: String,
    pub author_rest_id: String,
    pub author_avatar_url: String,
    pub favorite_count: u64,
    pub retweet_count: u64,
    pub reply_count: u64,
    pub quote_count: u64,
    pub bookmark_count: u64,
    pub views: Option<String>,
    pub lang: String,
    pub source: String,
    pub possibly_sensitive: bool,
    pub conversation_id: String,
    pub media_thumb_url: String,
    pub media_url: String,
}

impl TwitterTweet {
    /// Normalizes a tweet result, unwrapping visibility wrappers.
    ///
    /// Returns `None` for tombstones and other non-tweet results, and for
    /// tweets without an id.
    pub fn from_result(result: &Value) -> Option<Self> {
        let tweet = result.get("tweet").filter(|t| t.is_object()).unwrap_or(result);
        let typename = tweet.get("__typename").and_then(Value::as_str)?;
        if !TWEET_TYPENAMES.contains(&typename) {
            return None;
        }
        let rest_id = non_empty(tweet, "/rest_id").or_else(|| non_empty(tweet, "/legacy/id_str"))?;

        let full_text = non_empty(tweet, "/note_tweet/note_tweet_results/result/text")
            .unwrap_or_else(|| text(tweet, "/legacy/full_text"));
        let author = tweet
            .pointer("/core/user_results/result")
            .unwrap_or(&NULL);
        let count = |field: &str| {
            tweet
                .pointer(&format!("/legacy/{field}"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        let (media_thumb_url, media_url) = first_media(tweet).unwrap_or_default();

        Some(Self {
            full_text: full_text.trim().to_string(),
            created_at: text(tweet, "/legacy/created_at"),
            author_name: text(author, "/core/name"),
            author_screen_name: text(author, "/core/screen_name"),
            author_rest_id: text(author, "/rest_id"),
            author_avatar_url: text(author, "/avatar/image_url"),
            favorite_count: count("favorite_count"),
            retweet_count: count("retweet_count"),
            reply_count: count("reply_count"),
            quote_count: count("quote_count"),
            bookmark_count: count("bookmark_count"),
            views: tweet.get("views").and_then(|v| id_field(v, "count")),
            lang: text(tweet, "/legacy/lang"),
            source: HTML_TAG
                .replace_all(&text(tweet, "/legacy/source"), "")
                .trim()
                .to_string(),
            possibly_sensitive: flag(tweet, "/legacy/possibly_sensitive"),
            conversation_id: text(tweet, "/legacy/conversation_id_str"),
            media_thumb_url,
            media_url,
            rest_id,
        })
    }
}

/// Thumbnail and playable URL of the first attached media item.
///
/// Videos play the highest-bitrate mp4 variant; everything else uses the
/// image URL for both.
fn first_media(tweet: &Value) -> Option<(String, String)> {
    let media = tweet
        .pointer("/legacy/extended_entities/media")
        .or_else(|| tweet.pointer("/legacy/entities/media"))?
        .get(0)?;
    let thumb = non_empty(media, "/media_url_https")?;

    if media.get("type").and_then(Value::as_str) != Some("video") {
        return Some((thumb.clone(), thumb));
    }
    // First of equal bitrates wins.
    let best = array(media, "/video_info/variants")
        .filter(|v| text(v, "/content_type").starts_with("video/mp4"))
        .min_by_key(|v| Reverse(v.get("bitrate").and_then(Value::as_u64).unwrap_or(0)))
        .and_then(|v| non_empty(v, "/url"));
    let url = best.unwrap_or_else(|| thumb.clone());
    Some((thumb, url))
}

/// A trending topic from the explore sidebar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TwitterTrend {
    pub name: String,
    pub description: String,
    pub context: String,
    pub promoted: bool,
    pub advertiser: String,
    pub related: Vec<String>,
}

fn timeline_tweet(item_content: Option<&Value>) -> Option<TwitterTweet> {
    let item = item_content?;
    if item.get("itemType").and_then(Value::as_str) != Some("TimelineTweet") {
        return None;
    }
    TwitterTweet::from_result(item.pointer("/tweet_results/result")?)
}

/// Tweets of a profile timeline, pinned tweet first.
pub fn parse_profile_tweets(data: &Value) -> Vec<TwitterTweet> {
    let mut tweets = Vec::new();
    for inst in array(data, "/data/user/result/timeline/timeline/instructions") {
        if kind(inst) == Some("TimelinePinEntry") {
            tweets.extend(
                inst.pointer("/entry/content/itemContent/tweet_results/result")
                    .and_then(TwitterTweet::from_result),
            );
        }
        tweets.extend(added_entries(inst).filter_map(|e| timeline_tweet(e.pointer("/content/itemContent"))));
    }
    tweets
}

/// Tweets of a conversation thread.
pub fn parse_thread_tweets(data: &Value) -> Vec<TwitterTweet> {
    array(data, "/data/threaded_conversation_with_injections_v2/instructions")
        .flat_map(added_entries)
        .filter_map(|e| timeline_tweet(e.pointer("/content/itemContent")))
        .collect()
}

/// Tweets of a home timeline response.
///
/// Stored bodies may be truncated. The text before the truncation marker is
/// tried first, then the `home_timeline_urt` object is cut out of the raw
/// text if it is complete.
pub fn parse_home_timeline(body: &str) -> Vec<TwitterTweet> {
    let data = parse_json(body).or_else(|| {
        body.find(TRUNCATION_MARKER)
            .and_then(|idx| parse_json(&body[..idx]))
    });
    let instructions = data
        .as_ref()
        .and_then(|d| {
            d.pointer("/data/home/home_timeline_urt/instructions")
                .or_else(|| d.pointer("/home/home_timeline_urt/instructions"))
        })
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| raw_home_instructions(body))
        .unwrap_or_default();

    let mut tweets = Vec::new();
    for entry in instructions.iter().flat_map(added_entries) {
        let Some(content) = entry.get("content") else {
            continue;
        };
        match content.get("entryType").and_then(Value::as_str) {
            Some("TimelineTimelineCursor") => {}
            Some("TimelineTimelineModule") => tweets.extend(
                array(content, "/items").filter_map(|item| timeline_tweet(item.pointer("/item/itemContent"))),
            ),
            _ => tweets.extend(timeline_tweet(content.get("itemContent"))),
        }
    }
    tweets
}

fn raw_home_instructions(body: &str) -> Option<Vec<Value>> {
    let after_key = body.find(HOME_TIMELINE_KEY)? + HOME_TIMELINE_KEY.len();
    let colon = after_key + body[after_key..].find(':')?;
    let start = colon + 1 + body[colon + 1..].find('{')?;
    let end = start + matching_brace(&body[start..])?;
    let object: Value = serde_json::from_str(&body[start..=end]).ok()?;
    object.get("instructions")?.as_array().cloned()
}

/// Byte offset of the brace closing the object `text` starts with.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate() {
        if escaped {
            escaped = false;
        } else if in_string {
            match b {
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Subject of a profile lookup.
///
/// Falls back to the author of the pinned tweet, or of the first tweet, when
/// the result is not a user object.
pub fn parse_profile_user(data: &Value) -> Option<TwitterUser> {
    let root = data.pointer("/data/user/result")?;
    if let Some(user) = TwitterUser::from_result(root) {
        return Some(user);
    }

    for inst in array(root, "/timeline/timeline/instructions") {
        if kind(inst) == Some("TimelinePinEntry") {
            if let Some(author) =
                inst.pointer("/entry/content/itemContent/tweet_results/result/core/user_results/result")
            {
                return TwitterUser::from_result(author);
            }
        }
        let candidate = added_entries(inst).find_map(|entry| {
            let tweet = entry.pointer("/content/itemContent/tweet_results/result")?;
            let author = tweet.pointer("/core/user_results/result")?;
            let is_tweet = tweet
                .get("__typename")
                .and_then(Value::as_str)
                .is_some_and(|t| TWEET_TYPENAMES.contains(&t));
            is_tweet.then(|| TwitterUser::from_result(author))
        });
        if let Some(Some(user)) = candidate {
            return Some(user);
        }
    }
    None
}

/// Users of the "who to follow" sidebar.
pub fn parse_user_recommendations(data: &Value) -> Vec<TwitterUser> {
    array(data, "/data/sidebar_user_recommendations")
        .filter_map(|item| item.pointer("/user_results/result"))
        .filter_map(TwitterUser::from_result)
        .collect()
}

/// Trends of the explore sidebar.
pub fn parse_explore_trends(data: &Value) -> Vec<TwitterTrend> {
    array(data, "/data/explore_sidebar/timeline/instructions")
        .flat_map(added_entries)
        .filter_map(|entry| entry.get("content"))
        .filter(|c| c.get("entryType").and_then(Value::as_str) == Some("TimelineTimelineModule"))
        .flat_map(|c| array(c, "/items"))
        .filter_map(|item| item.pointer("/item/itemContent"))
        .filter(|ic| ic.get("itemType").and_then(Value::as_str) == Some("TimelineTrend"))
        .map(parse_trend)
        .collect()
}

fn parse_trend(item: &Value) -> TwitterTrend {
    let advertiser = non_empty(item, "/promoted_metadata/advertiser_results/result/legacy/name")
        .or_else(|| non_empty(item, "/promoted_metadata/advertiser_results/result/core/name"));
    let promoted_name = non_empty(item, "/promoted_metadata/promotedTrendName");

    TwitterTrend {
        name: text(item, "/name"),
        description: non_empty(item, "/description")
            .unwrap_or_else(|| text(item, "/promoted_metadata/promotedTrendDescription")),
        context: text(item, "/trend_metadata/domain_context"),
        promoted: advertiser.is_some(),
        advertiser: advertiser
            .or(promoted_name.map(|_| "Promoted".to_string()))
            .unwrap_or_default(),
        related: array(item, "/grouped_trends")
            .filter_map(|g| non_empty(g, "/name"))
            .collect(),
    }
}

/// Returns true for x.com, twitter.com and their subdomains.
pub fn is_twitter_host(host: &str) -> bool {
    host == "x.com"
        || host == "twitter.com"
        || host.ends_with(".x.com")
        || host.ends_with(".twitter.com")
}

/// One extracted Twitter entity, tagged by the list it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum TwitterEntity {
    /// Tweet from a profile or conversation timeline.
    Tweet(TwitterTweet),
    /// Tweet from the home timeline.
    TimelineTweet(TwitterTweet),
    /// Subject of a profile lookup.
    Profile(TwitterUser),
    /// Sidebar recommendation.
    Recommended(TwitterUser),
    Trend(TwitterTrend),
}

/// Users, tweets and trends seen across captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TwitterView {
    pub profiles: Vec<TwitterUser>,
    pub users: Vec<TwitterUser>,
    pub tweets: Vec<TwitterTweet>,
    pub timeline: Vec<TwitterTweet>,
    pub trends: Vec<TwitterTrend>,
}

impl TwitterView {
    /// Builds the view from store records.
    pub fn from_records(records: &[CapturedRequest]) -> Self {
        let mut view = Self::default();
        for entity in aggregate(&TwitterExtractor, records) {
            match entity {
                TwitterEntity::Tweet(t) => view.tweets.push(t),
                TwitterEntity::TimelineTweet(t) => view.timeline.push(t),
                TwitterEntity::Profile(u) => view.profiles.push(u),
                TwitterEntity::Recommended(u) => view.users.push(u),
                TwitterEntity::Trend(t) => view.trends.push(t),
            }
        }
        view
    }
}

/// Extracts Twitter / X entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwitterExtractor;

impl SiteExtractor for TwitterExtractor {
    type Entity = TwitterEntity;

    fn name(&self) -> &'static str {
        "twitter"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_twitter_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<TwitterEntity> {
        let Some(body) = record.response_body.as_deref() else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if record.url.to_ascii_lowercase().contains("hometimeline") {
            out.extend(
                parse_home_timeline(body)
                    .into_iter()
                    .map(TwitterEntity::TimelineTweet),
            );
        }

        let Some(data) = parse_json(body) else {
            return out;
        };
        out.extend(
            parse_profile_tweets(&data)
                .into_iter()
                .chain(parse_thread_tweets(&data))
                .map(TwitterEntity::Tweet),
        );
        out.extend(parse_profile_user(&data).map(TwitterEntity::Profile));
        out.extend(
            parse_user_recommendations(&data)
                .into_iter()
                .map(TwitterEntity::Recommended),
        );
        out.extend(parse_explore_trends(&data).into_iter().map(TwitterEntity::Trend));
        out
    }

    fn key(&self, entity: &TwitterEntity) -> String {
        match entity {
            TwitterEntity::Tweet(t) => format!("tweet:{}", t.rest_id),
            TwitterEntity::TimelineTweet(t) => format!("timeline:{}", t.rest_id),
            TwitterEntity::Profile(u) => format!("profile:{}", u.rest_id),
            TwitterEntity::Recommended(u) => format!("user:{}", u.rest_id),
            TwitterEntity::Trend(t) => format!("trend:{}|{}", t.name, t.context),
        }
    }

    fn merge(&self, _existing: &mut TwitterEntity, _incoming: TwitterEntity) {}
}

impl SiteSummary for TwitterExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_twitter_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        serde_json::to_value(TwitterView::from_records(records)).unwrap_or(Value::Null)
    }
}
