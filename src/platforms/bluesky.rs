//! The AT-protocol app view (`app.bsky.*` XRPC methods).

use super::{trim_base, PlatformAdapter};
use crate::fetch::{kind_of, Endpoint, Paging};
use crate::normalize::{Fields, Normalized};
use crate::types::{ActorRef, CanonicalPost, CanonicalProfile, PaginationToken, Platform, RawPage};
use crate::{CollectorError, Result};
use serde_json::Value;

const REASON_REPOST: &str = "app.bsky.feed.defs#reasonRepost";

pub struct BlueskyAdapter {
    base_url: String,
    access_token: Option<String>,
}

impl BlueskyAdapter {
    pub fn new(base_url: &str, access_token: Option<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            access_token,
        }
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.base_url, method)
    }
}

fn read_items(body: Value, key: &str) -> Result<RawPage> {
    let Value::Object(mut body) = body else {
        return Err(CollectorError::Shape(format!(
            "expected an object, got {}",
            kind_of(&body)
        )));
    };
    let items = match body.remove(key) {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(CollectorError::Shape(format!(
                "expected `{key}` to be an array, got {}",
                kind_of(&other)
            )))
        }
    };
    let next = body
        .get("cursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(|c| PaginationToken::Cursor(c.to_string()));
    Ok(RawPage::new(items, next))
}

/// Reads a `searchPosts` page: post views under `posts`.
pub fn read_search_page(body: Value, _link: Option<String>) -> Result<RawPage> {
    read_items(body, "posts")
}

/// Reads a `getAuthorFeed` page: feed items under `feed`.
pub fn read_feed_page(body: Value, _link: Option<String>) -> Result<RawPage> {
    read_items(body, "feed")
}

impl PlatformAdapter for BlueskyAdapter {
    fn platform(&self) -> Platform {
        Platform::Bluesky
    }

    fn credential(&self) -> Option<String> {
        self.access_token.clone()
    }

    fn page_size(&self, requested: u32) -> u32 {
        requested.clamp(1, 100)
    }

    fn discovery_endpoints(&self, keywords: &[String], page_size: u32) -> Vec<Endpoint> {
        keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|keyword| {
                Endpoint::new(
                    self.xrpc("app.bsky.feed.searchPosts"),
                    Paging::Cursor("cursor"),
                    read_search_page,
                )
                .with_query("q", keyword)
                .with_query("limit", page_size)
            })
            .collect()
    }

    fn timeline_endpoint(&self, actor: &ActorRef, page_size: u32) -> Endpoint {
        Endpoint::new(
            self.xrpc("app.bsky.feed.getAuthorFeed"),
            Paging::Cursor("cursor"),
            read_feed_page,
        )
        .with_query("actor", &actor.id)
        .with_query("limit", page_size)
    }

    fn profile_endpoint(&self, actor: &ActorRef) -> Endpoint {
        Endpoint::single(self.xrpc("app.bsky.actor.getProfile")).with_query("actor", &actor.id)
    }

    /// Maps a post view (search) or a feed item (author feed).
    ///
    /// A feed item with a repost reason is attributed to the reposter; everything else
    /// comes from the embedded post, which is the original.
    fn normalize_post(&self, item: &Value) -> Normalized<CanonicalPost> {
        let mut post = CanonicalPost::empty(Platform::Bluesky);
        let mut fields = Fields::new(item);

        let reposter = if fields.get("/post").is_some() {
            let reason_type = fields.opt_string("/reason/$type");
            post.is_reshare = reason_type.as_deref() == Some(REASON_REPOST);
            if post.is_reshare {
                post.author_handle = fields.string("/reason/by/handle");
                post.author_id = fields.string("/reason/by/did");
            }
            let view = fields.get("/post");
            fields = match view {
                Some(view) => fields.rebase(view),
                None => fields,
            };
            post.is_reshare
        } else {
            if fields.get("/uri").is_none() && fields.get("/feed").is_none() {
                fields.warn("", "neither a post view nor a feed item");
            }
            false
        };

        if !reposter {
            post.author_handle = fields.string("/author/handle");
            post.author_id = fields.string("/author/did");
        }
        post.post_id = fields.string("/uri");
        post.text = fields.string("/record/text");
        post.created_at = fields.timestamp("/record/createdAt");
        post.like_count = fields.count("/likeCount");
        post.repost_count = fields.count("/repostCount");
        post.reply_count = fields.count("/replyCount");
        post.language = fields
            .opt_string("/record/langs/0")
            .or_else(|| fields.opt_string("/record/lang"));
        post.external_link = fields.opt_string("/embed/external/uri");

        fields.finish(post)
    }

    fn normalize_profile(&self, body: &Value) -> Normalized<CanonicalProfile> {
        let mut profile = CanonicalProfile::empty(Platform::Bluesky);
        let mut fields = Fields::new(body);

        profile.handle = fields.string("/handle");
        profile.id = fields.string("/did");
        profile.display_name = fields.opt_string("/displayName");
        profile.followers_count = fields.count("/followersCount");
        profile.following_count = fields.count("/followsCount");
        profile.posts_count = fields.count("/postsCount");
        profile.description = fields.opt_string("/description");

        fields.finish(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> BlueskyAdapter {
        BlueskyAdapter::new("https://bsky.example/", None)
    }

    fn post_view(handle: &str, text: &str, likes: u64) -> Value {
        json!({
            "uri": format!("at://did:plc:{handle}/app.bsky.feed.post/1"),
            "author": {"did": format!("did:plc:{handle}"), "handle": format!("{handle}.bsky.social")},
            "record": {"text": text, "createdAt": "2024-11-20T12:00:00.000Z", "langs": ["en"]},
            "likeCount": likes, "repostCount": 1, "replyCount": 2,
            "embed": {"external": {"uri": "https://github.com/a/b"}}
        })
    }

    #[test]
    fn test_search_post_view() {
        let normalized = adapter().normalize_post(&post_view("alice", "hello", 4));
        assert!(normalized.is_clean(), "{:?}", normalized.warnings);

        let post = normalized.value;
        assert_eq!(post.author_handle.as_deref(), Some("alice.bsky.social"));
        assert_eq!(post.author_id.as_deref(), Some("did:plc:alice"));
        assert_eq!(post.text.as_deref(), Some("hello"));
        assert_eq!(post.like_count, Some(4));
        assert_eq!(post.language.as_deref(), Some("en"));
        assert_eq!(post.external_link.as_deref(), Some("https://github.com/a/b"));
        assert!(!post.is_reshare);
    }

    #[test]
    fn test_repost_takes_original_content_and_reposter_handle() {
        let item = json!({
            "post": post_view("carol", "A", 5),
            "reason": {
                "$type": REASON_REPOST,
                "by": {"did": "did:plc:bob", "handle": "bob.bsky.social"}
            }
        });
        let post = adapter().normalize_post(&item).value;

        assert!(post.is_reshare);
        assert_eq!(post.author_handle.as_deref(), Some("bob.bsky.social"));
        assert_eq!(post.author_id.as_deref(), Some("did:plc:bob"));
        assert_eq!(post.text.as_deref(), Some("A"));
        assert_eq!(post.like_count, Some(5));
    }

    #[test]
    fn test_plain_feed_item() {
        let item = json!({"post": post_view("dave", "own post", 0)});
        let post = adapter().normalize_post(&item).value;
        assert!(!post.is_reshare);
        assert_eq!(post.author_handle.as_deref(), Some("dave.bsky.social"));
    }

    #[test]
    fn test_sparse_item_is_total() {
        let normalized = adapter().normalize_post(&json!({"uri": "at://x"}));
        assert_eq!(normalized.value.post_id.as_deref(), Some("at://x"));
        assert_eq!(normalized.value.text, None);
        assert!(!normalized.is_clean());

        let normalized = adapter().normalize_post(&json!(42));
        assert_eq!(normalized.value, CanonicalPost::empty(Platform::Bluesky));
    }

    #[test]
    fn test_profile() {
        let body = json!({
            "did": "did:plc:alice", "handle": "alice.bsky.social", "displayName": "Alice",
            "followersCount": 10, "followsCount": 3, "postsCount": 99
        });
        let normalized = adapter().normalize_profile(&body);
        assert!(normalized.is_clean());
        assert_eq!(normalized.value.following_count, Some(3));
        assert_eq!(normalized.value.description, None);
    }

    #[test]
    fn test_page_readers() {
        let page = read_search_page(json!({"posts": [{}, {}], "cursor": "abc"}), None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next, Some(PaginationToken::Cursor("abc".into())));

        let page = read_feed_page(json!({"feed": [], "cursor": ""}), None).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next, None);

        assert!(read_feed_page(json!({"feed": "oops"}), None).is_err());
    }

    #[test]
    fn test_endpoints() {
        let adapter = adapter();
        let search = adapter.discovery_endpoints(&["github.com".into()], 50);
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].url, "https://bsky.example/xrpc/app.bsky.feed.searchPosts");
        assert_eq!(adapter.page_size(500), 100);

        let actor = ActorRef::new(Platform::Bluesky, "did:plc:alice");
        let feed = adapter.timeline_endpoint(&actor, 50);
        assert_eq!(feed.paging, Paging::Cursor("cursor"));
        assert!(feed.query.contains(&("actor".to_string(), "did:plc:alice".to_string())));
    }
}
