//! Topic prefix routing.

use std::collections::BTreeMap;
use std::ops::Bound;

/// A longest-prefix-match table of topic prefixes to destination topics.
///
/// The table is immutable once built. It knows nothing of devices or permissions.
#[derive(Clone, Debug)]
pub struct Router {
    default: String,
    routes: BTreeMap<String, String>,
}

impl Router {
    /// Build a router from the given prefix routes, falling back to `default` for unmatched topics.
    pub fn new(default: impl Into<String>, routes: BTreeMap<String, String>) -> Self {
        Self {
            default: default.into(),
            routes,
        }
    }

    /// Find the destination of the given topic.
    pub fn route(&self, topic: &str) -> &str {
        // Every prefix of `topic` sorts at or below it, and a longer prefix sorts above a shorter
        // one, so the first prefix found walking down from `topic` is the longest.
        self.routes
            .range::<str, _>((Bound::Unbounded, Bound::Included(topic)))
            .rev()
            .find(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .map(|(_, dest)| dest.as_str())
            .unwrap_or(self.default.as_str())
    }

    /// The destination of unmatched topics.
    pub fn default_route(&self) -> &str {
        &self.default
    }
}
