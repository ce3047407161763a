use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The social platforms a run can collect from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// The AT-protocol feed network.
    Bluesky,
    /// A federated microblogging instance.
    Mastodon,
    /// The centralized v2 API.
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bluesky => "bluesky",
            Platform::Mastodon => "mastodon",
            Platform::Twitter => "twitter",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bluesky" => Ok(Platform::Bluesky),
            "mastodon" => Ok(Platform::Mastodon),
            "twitter" => Ok(Platform::Twitter),
            other => Err(format!("unknown platform `{other}`")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque marker handed back by a platform to request the following page.
///
/// A walk that receives no token is exhausted; a token never means "start over".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationToken {
    /// A cursor value passed back verbatim in the endpoint's cursor parameter.
    Cursor(String),
    /// A fully-qualified URL taken from a `Link: rel="next"` header.
    NextUrl(String),
}

/// One page of platform-native items plus the token for the next page.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub items: Vec<Value>,
    pub next: Option<PaginationToken>,
}

impl RawPage {
    pub fn new(items: Vec<Value>, next: Option<PaginationToken>) -> Self {
        Self { items, next }
    }
}

/// A post mapped into the platform-independent record schema.
///
/// When `is_reshare` is set, `text` and the engagement counts belong to the
/// original post while `author_handle` stays with the resharing account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPost {
    pub platform: Platform,
    pub author_handle: Option<String>,
    pub author_id: Option<String>,
    pub post_id: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub like_count: Option<u64>,
    pub repost_count: Option<u64>,
    pub reply_count: Option<u64>,
    pub language: Option<String>,
    pub external_link: Option<String>,
    pub is_reshare: bool,
}

impl CanonicalPost {
    /// An empty record for `platform`; every field starts out null.
    pub fn empty(platform: Platform) -> Self {
        Self {
            platform,
            author_handle: None,
            author_id: None,
            post_id: None,
            text: None,
            created_at: None,
            like_count: None,
            repost_count: None,
            reply_count: None,
            language: None,
            external_link: None,
            is_reshare: false,
        }
    }

    /// The author this post should be attributed to during discovery.
    ///
    /// Prefers the stable platform id and falls back to the handle.
    pub fn actor(&self) -> Option<ActorRef> {
        self.author_id
            .as_deref()
            .or(self.author_handle.as_deref())
            .map(|id| ActorRef::new(self.platform, id))
    }
}

/// Account metadata mapped into the platform-independent schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProfile {
    pub platform: Platform,
    pub handle: Option<String>,
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub followers_count: Option<u64>,
    pub following_count: Option<u64>,
    pub posts_count: Option<u64>,
    pub description: Option<String>,
}

impl CanonicalProfile {
    pub fn empty(platform: Platform) -> Self {
        Self {
            platform,
            handle: None,
            id: None,
            display_name: None,
            followers_count: None,
            following_count: None,
            posts_count: None,
            description: None,
        }
    }

    /// The join key of this profile, if it carries a handle.
    pub fn key(&self) -> Option<(Platform, String)> {
        self.handle.clone().map(|h| (self.platform, h))
    }
}

/// The unit of deduplication during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorRef {
    pub platform: Platform,
    pub id: String,
}

impl ActorRef {
    pub fn new(platform: Platform, id: impl Into<String>) -> Self {
        Self {
            platform,
            id: id.into(),
        }
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

/// One post joined with its author's profile, if the profile was collected.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRow {
    pub post: CanonicalPost,
    pub profile: Option<CanonicalProfile>,
}

/// The step of an actor's processing in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Timeline,
    Profile,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Timeline => "timeline",
            Phase::Profile => "profile",
        })
    }
}

/// A failure that ended one phase of one actor's processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorFailure {
    pub actor: ActorRef,
    pub phase: Phase,
    pub cause: String,
}

/// The joined table of a run plus what went wrong along the way.
#[derive(Debug, Clone, Default)]
pub struct CollectionResult {
    pub rows: Vec<CollectionRow>,
    pub profiles: Vec<CanonicalProfile>,
    pub actors: usize,
    pub failures: Vec<ActorFailure>,
    /// Searches that stopped early on a failed page after yielding results.
    pub discovery_interruptions: Vec<String>,
    pub shape_warnings: usize,
    pub suspect_truncations: usize,
    pub cancelled: bool,
    pub collected_at: Option<DateTime<Utc>>,
}

impl CollectionResult {
    /// Whether any actor phase failed or the run stopped early.
    pub fn is_partial(&self) -> bool {
        self.cancelled || !self.failures.is_empty() || !self.discovery_interruptions.is_empty()
    }
}
