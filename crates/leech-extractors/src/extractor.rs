//! Extractor interface, keyed aggregation and render memoization.

use std::collections::HashMap;
use std::sync::Arc;

use leech_core::CapturedRequest;
use serde_json::Value;

// =============================================================================
// Extractor Trait
// =============================================================================

/// Derives structured entities from captured requests of one site.
///
/// Extractors are pure: they read records and never touch the store.
pub trait SiteExtractor {
    /// Entity produced by this extractor.
    type Entity: Clone;

    /// Short site name.
    fn name(&self) -> &'static str;

    /// Checks if records from `host` belong to this site.
    fn matches_host(&self, host: &str) -> bool;

    /// Extracts zero or more (possibly partial) entities from one record.
    fn extract(&self, record: &CapturedRequest) -> Vec<Self::Entity>;

    /// Stable identity of an entity.
    fn key(&self, entity: &Self::Entity) -> String;

    /// Folds a newly seen partial entity into an existing one with the same key.
    fn merge(&self, existing: &mut Self::Entity, incoming: Self::Entity);

    /// Cheap marker of entity detail, part of the render signature.
    fn detail(&self, _entity: &Self::Entity) -> String {
        String::new()
    }

    /// Final pass over the merged entities (filtering, ordering).
    fn finish(&self, entities: Vec<Self::Entity>) -> Vec<Self::Entity> {
        entities
    }
}

/// Records of the extractor's site that carry a response.
pub fn site_records<'a, E: SiteExtractor>(
    extractor: &'a E,
    records: &'a [CapturedRequest],
) -> impl Iterator<Item = &'a CapturedRequest> + 'a {
    records.iter().filter(move |r| {
        r.response_body.is_some() && r.host().is_some_and(|h| extractor.matches_host(&h))
    })
}

/// Merges entities by key, keeping first-seen order.
pub fn merge_entities<E: SiteExtractor>(
    extractor: &E,
    entities: impl IntoIterator<Item = E::Entity>,
) -> Vec<E::Entity> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<E::Entity> = Vec::new();

    for entity in entities {
        let key = extractor.key(&entity);
        match index.get(&key) {
            Some(&pos) => extractor.merge(&mut merged[pos], entity),
            None => {
                index.insert(key, merged.len());
                merged.push(entity);
            }
        }
    }

    merged
}

/// Extracts and merges entities by key, without the final pass.
pub fn merge_by_key<E: SiteExtractor>(extractor: &E, records: &[CapturedRequest]) -> Vec<E::Entity> {
    merge_entities(
        extractor,
        site_records(extractor, records).flat_map(|r| extractor.extract(r)),
    )
}

/// Re-derives the site's entities from the store contents.
pub fn aggregate<E: SiteExtractor>(extractor: &E, records: &[CapturedRequest]) -> Vec<E::Entity> {
    let entities = extractor.finish(merge_by_key(extractor, records));
    tracing::trace!(site = extractor.name(), count = entities.len(), "Aggregated entities");
    entities
}

// =============================================================================
// Render Memoization
// =============================================================================

/// Remembers the identity signature of the last rendered entity set.
#[derive(Debug, Clone, Default)]
pub struct SignatureMemo {
    last: Option<String>,
}

impl SignatureMemo {
    /// Creates an empty memo. The first update always reports a change.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature of an entity set: sorted keys with their detail markers.
    pub fn signature<E: SiteExtractor>(extractor: &E, entities: &[E::Entity]) -> String {
        let mut parts: Vec<String> = entities
            .iter()
            .map(|e| format!("{}{}", extractor.key(e), extractor.detail(e)))
            .collect();
        parts.sort();
        parts.join(",")
    }

    /// Records the signature of `entities`; returns true if it changed.
    pub fn update<E: SiteExtractor>(&mut self, extractor: &E, entities: &[E::Entity]) -> bool {
        let signature = Self::signature(extractor, entities);
        if self.last.as_deref() == Some(signature.as_str()) {
            return false;
        }
        self.last = Some(signature);
        true
    }

    /// Forgets the last signature.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Type-erased site view, for callers that serve entities as JSON.
pub trait SiteSummary: Send + Sync {
    /// Short site name.
    fn site(&self) -> &'static str;

    /// Checks if records from `host` belong to this site.
    fn handles_host(&self, host: &str) -> bool;

    /// Aggregated entities as JSON.
    fn summarize(&self, records: &[CapturedRequest]) -> Value;
}

/// Registry of site summaries.
#[derive(Clone)]
pub struct ExtractorRegistry {
    sites: Vec<Arc<dyn SiteSummary>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("sites", &self.names())
            .finish()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { sites: Vec::new() }
    }

    /// Creates a registry with every built-in extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::github::GitHubExtractor));
        registry.register(Arc::new(crate::discord::DiscordExtractor));
        registry.register(Arc::new(crate::soundcloud::SoundCloudExtractor));
        registry.register(Arc::new(crate::twitter::TwitterExtractor));
        registry.register(Arc::new(crate::instagram::InstagramExtractor));
        registry.register(Arc::new(crate::tiktok::TikTokExtractor));
        registry.register(Arc::new(crate::pinterest::PinterestExtractor));
        registry.register(Arc::new(crate::facebook::FacebookExtractor));
        registry
    }

    /// Registers a site.
    pub fn register(&mut self, site: Arc<dyn SiteSummary>) {
        self.sites.push(site);
    }

    /// Looks up a site by name.
    pub fn get(&self, name: &str) -> Option<&dyn SiteSummary> {
        self.sites
            .iter()
            .find(|s| s.site() == name)
            .map(|s| s.as_ref())
    }

    /// Finds the site a host belongs to.
    pub fn for_host(&self, host: &str) -> Option<&dyn SiteSummary> {
        self.sites
            .iter()
            .find(|s| s.handles_host(host))
            .map(|s| s.as_ref())
    }

    /// Registered site names.
    pub fn names(&self) -> Vec<&'static str> {
        self.sites.iter().map(|s| s.site()).collect()
    }
}

// =============================================================================
// JSON Helpers
// =============================================================================

/// Parses a response body as JSON.
pub(crate) fn parse_json(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// String field, empty when missing or not a string.
pub(crate) fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

/// Optional non-empty string field.
pub(crate) fn opt_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Identifier that may be encoded as a JSON string or number.
pub(crate) fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use leech_core::RequestType;

    /// Counts words per key across "key:word" response bodies.
    struct WordSite;

    #[derive(Debug, Clone, PartialEq)]
    struct Word {
        key: String,
        count: usize,
    }

    impl SiteExtractor for WordSite {
        type Entity = Word;

        fn name(&self) -> &'static str {
            "words"
        }

        fn matches_host(&self, host: &str) -> bool {
            host == "words.test"
        }

        fn extract(&self, record: &CapturedRequest) -> Vec<Word> {
            record
                .response_body
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| Word {
                    key: w.to_string(),
                    count: 1,
                })
                .collect()
        }

        fn key(&self, entity: &Word) -> String {
            entity.key.clone()
        }

        fn merge(&self, existing: &mut Word, incoming: Word) {
            existing.count += incoming.count;
        }

        fn detail(&self, entity: &Word) -> String {
            entity.count.to_string()
        }
    }

    fn record(url: &str, response: Option<&str>) -> CapturedRequest {
        CapturedRequest {
            id: 1.0,
            url: url.into(),
            method: "GET".into(),
            headers: vec![],
            body: None,
            response_body: response.map(str::to_string),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    #[test]
    fn aggregate_merges_in_first_seen_order() {
        let records = vec![
            record("https://words.test/a", Some("b a")),
            record("https://other.test/a", Some("z")),
            record("https://words.test/b", None),
            record("https://words.test/c", Some("a c")),
        ];
        let words = aggregate(&WordSite, &records);
        let keys: Vec<_> = words.iter().map(|w| w.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(words[1].count, 2);
    }

    #[test]
    fn memo_reports_changes_only() {
        let mut memo = SignatureMemo::new();
        let a = vec![Word { key: "a".into(), count: 1 }];
        let b = vec![Word { key: "a".into(), count: 2 }];

        assert!(memo.update(&WordSite, &a));
        assert!(!memo.update(&WordSite, &a));
        assert!(memo.update(&WordSite, &b));
        memo.reset();
        assert!(memo.update(&WordSite, &b));
    }

    #[test]
    fn signature_is_order_independent() {
        let x = Word { key: "x".into(), count: 1 };
        let y = Word { key: "y".into(), count: 1 };
        assert_eq!(
            SignatureMemo::signature(&WordSite, &[x.clone(), y.clone()]),
            SignatureMemo::signature(&WordSite, &[y, x])
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = ExtractorRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec!["github", "discord", "soundcloud", "twitter", "instagram", "tiktok", "pinterest", "facebook"]
        );
        assert_eq!(registry.for_host("api.github.com").unwrap().site(), "github");
        assert_eq!(registry.for_host("api-v2.soundcloud.com").unwrap().site(), "soundcloud");
        assert_eq!(registry.for_host("x.com").unwrap().site(), "twitter");
        assert_eq!(registry.for_host("www.instagram.com").unwrap().site(), "instagram");
        assert_eq!(registry.for_host("www.tiktok.com").unwrap().site(), "tiktok");
        assert_eq!(registry.for_host("www.pinterest.com").unwrap().site(), "pinterest");
        assert_eq!(registry.for_host("www.facebook.com").unwrap().site(), "facebook");
        assert!(registry.for_host("example.com").is_none());
        assert!(registry.get("discord").is_some());
    }

    #[test]
    fn json_helpers() {
        let v = serde_json::json!({"a": "x", "n": 12, "e": ""});
        assert_eq!(str_field(&v, "a"), "x");
        assert_eq!(str_field(&v, "n"), "");
        assert_eq!(opt_str(&v, "e"), None);
        assert_eq!(id_field(&v, "n").as_deref(), Some("12"));
        assert_eq!(id_field(&v, "missing"), None);
    }
}
