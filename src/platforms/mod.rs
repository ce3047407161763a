//! Per-platform adapters: endpoints, page readers, and the mapping into canonical records.

pub mod bluesky;
pub mod mastodon;
pub mod twitter;

use crate::config::CollectorConfig;
use crate::fetch::Endpoint;
use crate::normalize::Normalized;
use crate::richtext::HtmlText;
use crate::types::{ActorRef, CanonicalPost, CanonicalProfile, Platform};
use serde_json::Value;
use std::sync::Arc;

pub use bluesky::BlueskyAdapter;
pub use mastodon::MastodonAdapter;
pub use twitter::TwitterAdapter;

/// What the collection engine needs from one platform.
///
/// Everything here is a pure description or mapping; the network calls are made by the
/// engine with the endpoints an adapter hands out.
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// A label for logs and reports, such as the instance host.
    fn name(&self) -> String {
        self.platform().to_string()
    }

    /// The bearer credential requests to this platform carry.
    fn credential(&self) -> Option<String>;

    /// The page size the platform accepts closest to `requested`.
    fn page_size(&self, requested: u32) -> u32;

    /// The endpoints walked to discover actors for `keywords`.
    fn discovery_endpoints(&self, keywords: &[String], page_size: u32) -> Vec<Endpoint>;

    /// Whether a discovery post counts toward the keyword search.
    ///
    /// Platforms with a real search endpoint accept everything it returns.
    fn discovery_match(&self, _post: &CanonicalPost, _keywords: &[String]) -> bool {
        true
    }

    /// The endpoint of an actor's full timeline.
    fn timeline_endpoint(&self, actor: &ActorRef, page_size: u32) -> Endpoint;

    /// The endpoint of an actor's profile.
    fn profile_endpoint(&self, actor: &ActorRef) -> Endpoint;

    /// Whether a full page without a next token should be flagged as possibly truncated.
    fn flags_missing_next_link(&self) -> bool {
        false
    }

    fn normalize_post(&self, item: &Value) -> Normalized<CanonicalPost>;

    fn normalize_profile(&self, body: &Value) -> Normalized<CanonicalProfile>;
}

/// Builds one adapter per enabled platform, and one per Mastodon instance.
pub fn adapters_for(config: &CollectorConfig) -> Vec<Arc<dyn PlatformAdapter>> {
    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    for platform in &config.platforms {
        match platform {
            Platform::Bluesky => adapters.push(Arc::new(BlueskyAdapter::new(
                &config.bluesky.base_url,
                config.bluesky.access_token.clone(),
            ))),
            Platform::Mastodon => {
                for instance in &config.mastodon.instances {
                    adapters.push(Arc::new(MastodonAdapter::new(
                        instance,
                        config.mastodon.access_token.clone(),
                        Arc::new(HtmlText),
                    )));
                }
            }
            Platform::Twitter => adapters.push(Arc::new(TwitterAdapter::new(
                &config.twitter.base_url,
                config.twitter.bearer_token.clone(),
            ))),
        }
    }
    adapters
}

pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
