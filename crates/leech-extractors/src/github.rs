//! GitHub profiles.
//!
//! Profiles come from two places: the REST API (`api.github.com/users/{login}`)
//! and rendered profile pages, which carry the contribution calendar and the
//! activity overview. Both are keyed by login and merged.

use std::collections::BTreeMap;

use leech_core::CapturedRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::extractor::{opt_str, parse_json, SiteExtractor, SiteSummary};

static CONTRIBUTION_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([\d,]+)\s+contributions\s+in\s+the\s+last\s+year").unwrap());
static CALENDAR_DAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-date="(\d{4}-\d{2}-\d{2})"[^>]*data-level="(\d+)""#).unwrap());
static CONTRIBUTED_REPO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href="/([^/"]+)/([^"/]+)"[^>]*class="[^"]*text-bold[^"]*""#).unwrap()
});
static ACTIVITY_PERCENTAGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-percentages="(\{[^"]+\})""#).unwrap());
static OTHER_REPOS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)and\s+(\d+)\s+other\s+repositories").unwrap());
static TIMELINE_REPO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"href="(/[^/"]+/[^"?]+)"[^>]*data-view-component="true"[^>]*class="Link[^"]*"[^>]*>[^<]+<"#,
    )
    .unwrap()
});
static PROFILE_LOGIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"github\.com/([^/?#]+)").unwrap());

/// Markers of a rendered profile page.
const PROFILE_PAGE_MARKERS: &[&str] = &[
    "ContributionCalendar-day",
    "contributions in the last year",
    "Contributed to",
];

/// One day of the contribution calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionDay {
    pub date: String,
    pub level: u8,
}

/// A GitHub user profile assembled from API and page captures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GitHubProfile {
    pub login: String,
    pub id: Option<u64>,
    pub avatar_url: Option<String>,
    pub html_url: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    pub blog: Option<String>,
    pub location: Option<String>,
    pub email: Option<String>,
    pub hireable: Option<bool>,
    pub bio: Option<String>,
    pub twitter_username: Option<String>,
    pub public_repos: Option<u64>,
    pub public_gists: Option<u64>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    pub site_admin: Option<bool>,

    pub contribution_count: Option<u64>,
    pub contribution_days: Vec<ContributionDay>,
    pub repos_contributed_to: Vec<String>,
    pub activity_percentages: BTreeMap<String, Value>,
    pub other_repos_count: Option<u64>,
    pub timeline_repos: Vec<String>,
}

impl GitHubProfile {
    fn empty(login: &str) -> Self {
        Self {
            login: login.to_string(),
            html_url: Some(format!("https://github.com/{login}")),
            ..Self::default()
        }
    }

    /// Overwrites fields with every populated field of `other`.
    pub fn merge_from(&mut self, other: GitHubProfile) {
        fn take<T>(slot: &mut Option<T>, incoming: Option<T>) {
            if incoming.is_some() {
                *slot = incoming;
            }
        }
        fn take_vec<T>(slot: &mut Vec<T>, incoming: Vec<T>) {
            if !incoming.is_empty() {
                *slot = incoming;
            }
        }

        take(&mut self.id, other.id);
        take(&mut self.avatar_url, other.avatar_url);
        take(&mut self.html_url, other.html_url);
        take(&mut self.name, other.name);
        take(&mut self.company, other.company);
        take(&mut self.blog, other.blog);
        take(&mut self.location, other.location);
        take(&mut self.email, other.email);
        take(&mut self.hireable, other.hireable);
        take(&mut self.bio, other.bio);
        take(&mut self.twitter_username, other.twitter_username);
        take(&mut self.public_repos, other.public_repos);
        take(&mut self.public_gists, other.public_gists);
        take(&mut self.followers, other.followers);
        take(&mut self.following, other.following);
        take(&mut self.created_at, other.created_at);
        take(&mut self.updated_at, other.updated_at);
        take(&mut self.account_type, other.account_type);
        take(&mut self.site_admin, other.site_admin);
        take(&mut self.contribution_count, other.contribution_count);
        take_vec(&mut self.contribution_days, other.contribution_days);
        take_vec(&mut self.repos_contributed_to, other.repos_contributed_to);
        if !other.activity_percentages.is_empty() {
            self.activity_percentages = other.activity_percentages;
        }
        take(&mut self.other_repos_count, other.other_repos_count);
        take_vec(&mut self.timeline_repos, other.timeline_repos);
    }

    fn has_page_data(&self) -> bool {
        self.contribution_count.is_some()
            || !self.contribution_days.is_empty()
            || !self.repos_contributed_to.is_empty()
            || !self.activity_percentages.is_empty()
    }
}

/// Returns true for github.com and its subdomains.
pub fn is_github_host(host: &str) -> bool {
    host == "github.com" || host.ends_with(".github.com")
}

/// Parses a `/users/{login}` API response. Requires a string `login`.
pub fn parse_user_response(body: &str) -> Option<GitHubProfile> {
    let data = parse_json(body)?;
    let login = data.get("login")?.as_str()?.to_string();
    let num = |key: &str| data.get(key).and_then(Value::as_u64);
    let flag = |key: &str| data.get(key).and_then(Value::as_bool);

    Some(GitHubProfile {
        html_url: opt_str(&data, "html_url").or_else(|| Some(format!("https://github.com/{login}"))),
        id: num("id"),
        avatar_url: opt_str(&data, "avatar_url"),
        name: opt_str(&data, "name"),
        company: opt_str(&data, "company"),
        blog: opt_str(&data, "blog"),
        location: opt_str(&data, "location"),
        email: opt_str(&data, "email"),
        hireable: flag("hireable"),
        bio: opt_str(&data, "bio"),
        twitter_username: opt_str(&data, "twitter_username"),
        public_repos: num("public_repos"),
        public_gists: num("public_gists"),
        followers: num("followers"),
        following: num("following"),
        created_at: opt_str(&data, "created_at"),
        updated_at: opt_str(&data, "updated_at"),
        account_type: opt_str(&data, "type"),
        site_admin: flag("site_admin"),
        login,
        ..GitHubProfile::default()
    })
}

/// Returns true if `html` looks like a rendered profile page.
pub fn looks_like_profile_page(html: &str) -> bool {
    PROFILE_PAGE_MARKERS.iter().any(|m| html.contains(m))
}

/// Parses the calendar and activity sections of a profile page.
///
/// The login is taken from the page URL. Returns `None` when no login can be
/// determined or the page carries none of the profile sections.
pub fn parse_profile_page(html: &str, url: &str) -> Option<GitHubProfile> {
    let login = PROFILE_LOGIN
        .captures(url)
        .map(|c| c[1].to_string())
        .or_else(|| first_path_segment(url))?;
    let mut profile = GitHubProfile::empty(&login);

    profile.contribution_count = CONTRIBUTION_COUNT
        .captures(html)
        .and_then(|c| c[1].replace(',', "").parse().ok());

    profile.contribution_days = CALENDAR_DAY
        .captures_iter(html)
        .filter_map(|c| {
            Some(ContributionDay {
                date: c[1].to_string(),
                level: c[2].parse().ok()?,
            })
        })
        .collect();

    for caps in CONTRIBUTED_REPO.captures_iter(html) {
        let repo = format!("{}/{}", &caps[1], &caps[2]);
        if !profile.repos_contributed_to.contains(&repo) {
            profile.repos_contributed_to.push(repo);
        }
    }

    if let Some(caps) = ACTIVITY_PERCENTAGES.captures(html) {
        let decoded = caps[1].replace("&quot;", "\"");
        if let Ok(map) = serde_json::from_str::<BTreeMap<String, Value>>(&decoded) {
            profile.activity_percentages = map;
        }
    }

    profile.other_repos_count = OTHER_REPOS
        .captures(html)
        .and_then(|c| c[1].parse().ok());

    for caps in TIMELINE_REPO.captures_iter(html) {
        let full = caps[1].trim_start_matches('/').to_string();
        if full.contains('/') && !profile.timeline_repos.contains(&full) {
            profile.timeline_repos.push(full);
        }
    }

    profile.has_page_data().then_some(profile)
}

fn first_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extracts GitHub profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitHubExtractor;

impl SiteExtractor for GitHubExtractor {
    type Entity = GitHubProfile;

    fn name(&self) -> &'static str {
        "github"
    }

    fn matches_host(&self, host: &str) -> bool {
        is_github_host(host)
    }

    fn extract(&self, record: &CapturedRequest) -> Vec<GitHubProfile> {
        let Some(body) = record.response_body.as_deref() else {
            return Vec::new();
        };
        let mut out = Vec::new();

        let is_user_api = url::Url::parse(&record.url).is_ok_and(|u| {
            u.host_str() == Some("api.github.com") && u.path().starts_with("/users/")
        });
        if is_user_api && record.method == "GET" {
            out.extend(parse_user_response(body));
        }

        if looks_like_profile_page(body) {
            out.extend(parse_profile_page(body, &record.url));
        }

        out
    }

    fn key(&self, entity: &GitHubProfile) -> String {
        entity.login.clone()
    }

    fn merge(&self, existing: &mut GitHubProfile, incoming: GitHubProfile) {
        existing.merge_from(incoming);
    }

    fn detail(&self, entity: &GitHubProfile) -> String {
        format!(
            "{}{}",
            entity
                .contribution_count
                .map(|c| c.to_string())
                .unwrap_or_default(),
            entity.contribution_days.len()
        )
    }
}

impl SiteSummary for GitHubExtractor {
    fn site(&self) -> &'static str {
        SiteExtractor::name(self)
    }

    fn handles_host(&self, host: &str) -> bool {
        is_github_host(host)
    }

    fn summarize(&self, records: &[CapturedRequest]) -> Value {
        let profiles = crate::extractor::aggregate(self, records);
        serde_json::json!({ "profiles": profiles })
    }
}
