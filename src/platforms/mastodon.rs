//! One Mastodon-compatible instance (`/api/v1`).

use super::{trim_base, PlatformAdapter};
use crate::fetch::{read_array_with_link, Endpoint, Paging};
use crate::normalize::{Fields, Normalized};
use crate::richtext::TextExtractor;
use crate::types::{ActorRef, CanonicalPost, CanonicalProfile, Platform};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;

pub struct MastodonAdapter {
    base_url: String,
    host: String,
    access_token: Option<String>,
    text: Arc<dyn TextExtractor>,
}

impl MastodonAdapter {
    pub fn new(base_url: &str, access_token: Option<String>, text: Arc<dyn TextExtractor>) -> Self {
        let base_url = trim_base(base_url);
        let host = Url::parse(&base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| base_url.clone());
        Self {
            base_url,
            host,
            access_token,
            text,
        }
    }

    /// Local accounts have a bare `acct`; qualify it so handles are unique across instances.
    fn qualify(&self, acct: String) -> String {
        if acct.contains('@') {
            acct
        } else {
            format!("{}@{}", acct, self.host)
        }
    }

    fn account_url(&self, actor: &ActorRef) -> String {
        format!(
            "{}/api/v1/accounts/{}",
            self.base_url,
            urlencoding::encode(&actor.id)
        )
    }
}

impl PlatformAdapter for MastodonAdapter {
    fn platform(&self) -> Platform {
        Platform::Mastodon
    }

    fn name(&self) -> String {
        format!("mastodon:{}", self.host)
    }

    fn credential(&self) -> Option<String> {
        self.access_token.clone()
    }

    fn page_size(&self, requested: u32) -> u32 {
        requested.clamp(1, 40)
    }

    /// Mastodon has no full-text post search without special setup, so discovery walks
    /// the federated public timeline and filters by keyword.
    fn discovery_endpoints(&self, _keywords: &[String], page_size: u32) -> Vec<Endpoint> {
        vec![Endpoint::new(
            format!("{}/api/v1/timelines/public", self.base_url),
            Paging::LinkHeader,
            read_array_with_link,
        )
        .with_query("limit", page_size)
        .with_query("local", false)]
    }

    fn discovery_match(&self, post: &CanonicalPost, keywords: &[String]) -> bool {
        let Some(text) = post.text.as_deref() else {
            return false;
        };
        let text = text.to_lowercase();
        keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .any(|k| text.contains(&k.to_lowercase()))
    }

    fn timeline_endpoint(&self, actor: &ActorRef, page_size: u32) -> Endpoint {
        Endpoint::new(
            format!("{}/statuses", self.account_url(actor)),
            Paging::LinkHeader,
            read_array_with_link,
        )
        .with_query("limit", page_size)
        .with_query("exclude_replies", false)
        .with_query("only_media", false)
    }

    fn profile_endpoint(&self, actor: &ActorRef) -> Endpoint {
        Endpoint::single(self.account_url(actor))
    }

    fn flags_missing_next_link(&self) -> bool {
        true
    }

    /// Maps a status. A reblog keeps the wrapper's id, author and timestamp; content and
    /// counts come from the reblogged status.
    fn normalize_post(&self, item: &Value) -> Normalized<CanonicalPost> {
        let mut post = CanonicalPost::empty(Platform::Mastodon);
        let mut fields = Fields::new(item);

        post.post_id = fields.string("/id");
        post.author_id = fields.string("/account/id");
        post.author_handle = fields.string("/account/acct").map(|acct| self.qualify(acct));
        post.created_at = fields.timestamp("/created_at");

        let reblog = fields.get("/reblog").filter(|r| r.is_object());
        post.is_reshare = reblog.is_some();
        if let Some(original) = reblog {
            fields = fields.rebase(original);
        }

        post.text = fields
            .string("/content")
            .map(|html| self.text.to_plain(&html));
        post.like_count = fields.count("/favourites_count");
        post.repost_count = fields.count("/reblogs_count");
        post.reply_count = fields.count("/replies_count");
        post.language = fields.opt_string("/language");
        post.external_link = fields.opt_string("/card/url");

        fields.finish(post)
    }

    fn normalize_profile(&self, body: &Value) -> Normalized<CanonicalProfile> {
        let mut profile = CanonicalProfile::empty(Platform::Mastodon);
        let mut fields = Fields::new(body);

        profile.handle = fields
            .opt_string("/acct")
            .or_else(|| fields.string("/username"))
            .map(|acct| self.qualify(acct));
        profile.id = fields.string("/id");
        profile.display_name = fields.opt_string("/display_name");
        profile.followers_count = fields.count("/followers_count");
        profile.following_count = fields.count("/following_count");
        profile.posts_count = fields.count("/statuses_count");
        profile.description = fields
            .opt_string("/note")
            .map(|html| self.text.to_plain(&html))
            .filter(|note| !note.is_empty());

        fields.finish(profile)
    }
}
