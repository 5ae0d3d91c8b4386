//! Leech Extractors - structured entities from captured responses.
//!
//! Each extractor reads store records of one site and derives entities from
//! their response bodies. Partial entities seen in different requests (a
//! profile from the API, its contribution calendar from the rendered page)
//! are merged by a stable key.
//!
//! Extractors never mutate the store. Views are re-derived on every render and
//! [`SignatureMemo`] tells the caller when the result actually changed.
//!
//! ## Sites
//!
//! - [`github`]: user profiles, contribution calendar, activity
//! - [`discord`]: channel messages and the users in them
//! - [`soundcloud`]: tracks, comments, stream URLs
//! - [`twitter`]: tweets, timelines, profiles, recommendations, trends
//! - [`instagram`]: feed posts and profiles
//! - [`tiktok`]: videos, authors, challenges, music
//! - [`pinterest`]: pins, conversations, users, images
//! - [`facebook`]: search users, ads, profiles, feed posts, CDN images

pub mod discord;
mod extractor;
pub mod facebook;
pub mod github;
pub mod instagram;
pub mod pinterest;
pub mod soundcloud;
pub mod tiktok;
pub mod twitter;

pub use discord::{DiscordExtractor, DiscordMessage, DiscordUser, DiscordView};
pub use extractor::{
    aggregate, merge_by_key, merge_entities, site_records, ExtractorRegistry, SignatureMemo,
    SiteExtractor, SiteSummary,
};
pub use facebook::{FacebookExtractor, FacebookPost, FacebookProfile, FacebookView};
pub use github::{GitHubExtractor, GitHubProfile};
pub use instagram::{InstagramExtractor, InstagramPost, InstagramProfile, InstagramView};
pub use pinterest::{PinterestExtractor, PinterestPin, PinterestView};
pub use soundcloud::{SoundCloudExtractor, SoundCloudTrack};
pub use tiktok::{TikTokExtractor, TikTokVideo, TikTokView};
pub use twitter::{TwitterExtractor, TwitterTweet, TwitterUser, TwitterView};
