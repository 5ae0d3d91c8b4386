//! Request count badge for the active tab.
//!
//! The engine reports, after every change to the store, how many captured
//! requests belong to the site open in the active tab. Hosts render the count
//! however they like through [`BadgeSink`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::model::host_of;

/// Badge background color.
pub const BADGE_COLOR: &str = "#8EA4D8";

/// Receives badge updates.
pub trait BadgeSink: Send + Sync {
    /// Called with the new request count for the active site.
    fn set_count(&self, count: usize);
}

/// Returns the badge label for a count. Zero renders as an empty badge.
pub fn badge_text(count: usize) -> String {
    if count > 0 {
        count.to_string()
    } else {
        String::new()
    }
}

/// Badge sink that remembers the latest count.
#[derive(Debug, Clone, Default)]
pub struct BadgeCounter {
    count: Arc<AtomicUsize>,
}

impl BadgeCounter {
    /// Creates a counter showing zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Latest label.
    pub fn text(&self) -> String {
        badge_text(self.count())
    }
}

impl BadgeSink for BadgeCounter {
    fn set_count(&self, count: usize) {
        let old = self.count.swap(count, Ordering::Relaxed);
        if old != count {
            tracing::trace!(count, "Badge updated");
        }
    }
}

/// Tracks which tab is active and which site it shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveTab {
    tab_id: Option<i64>,
    hostname: Option<String>,
}

impl ActiveTab {
    /// Records a tab activation. An unparsable or missing URL clears the host.
    pub fn activate(&mut self, tab_id: i64, url: Option<&str>) {
        self.tab_id = Some(tab_id);
        self.hostname = Some(url.and_then(host_of).unwrap_or_default());
    }

    /// Records a URL change. Ignored unless `tab_id` is the active tab.
    ///
    /// Returns true if the active host was updated.
    pub fn update(&mut self, tab_id: i64, url: Option<&str>) -> bool {
        if self.tab_id != Some(tab_id) {
            return false;
        }
        let Some(url) = url else {
            return false;
        };
        self.hostname = Some(host_of(url).unwrap_or_default());
        true
    }

    /// The active tab id, if known.
    pub fn tab_id(&self) -> Option<i64> {
        self.tab_id
    }

    /// The active site's host; empty when the tab shows no parsable URL.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_for_counts() {
        assert_eq!(badge_text(0), "");
        assert_eq!(badge_text(12), "12");
    }

    #[test]
    fn counter_remembers_latest() {
        let counter = BadgeCounter::new();
        counter.set_count(3);
        let clone = counter.clone();
        clone.set_count(5);
        assert_eq!(counter.count(), 5);
        assert_eq!(counter.text(), "5");
    }

    #[test]
    fn activation_sets_host() {
        let mut tab = ActiveTab::default();
        assert_eq!(tab.hostname(), None);

        tab.activate(4, Some("https://github.com/rust-lang"));
        assert_eq!(tab.tab_id(), Some(4));
        assert_eq!(tab.hostname(), Some("github.com"));

        tab.activate(5, None);
        assert_eq!(tab.hostname(), Some(""));
    }

    #[test]
    fn updates_only_for_active_tab() {
        let mut tab = ActiveTab::default();
        tab.activate(1, Some("https://a.test/"));

        assert!(!tab.update(2, Some("https://b.test/")));
        assert_eq!(tab.hostname(), Some("a.test"));

        assert!(tab.update(1, Some("https://c.test/")));
        assert_eq!(tab.hostname(), Some("c.test"));

        assert!(!tab.update(1, None));
    }
}
