//! The v2 REST API.
//!
//! Tweets arrive with authors and retweeted originals split out into `includes`. The page
//! reader joins them back onto each tweet (`author`, `retweeted_status`) so the normalizer
//! can treat a retweet as a wrapper around its original, like the other platforms.

use super::{trim_base, PlatformAdapter};
use crate::fetch::{kind_of, Endpoint, Paging};
use crate::normalize::{Fields, Normalized};
use crate::types::{ActorRef, CanonicalPost, CanonicalProfile, PaginationToken, Platform, RawPage};
use crate::{CollectorError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

const TWEET_FIELDS: &str = "lang,author_id,created_at,text,public_metrics,referenced_tweets,entities";
const USER_FIELDS: &str = "username,name,description,public_metrics";
const EXPANSIONS: &str = "author_id,referenced_tweets.id,referenced_tweets.id.author_id";

pub struct TwitterAdapter {
    base_url: String,
    bearer_token: Option<String>,
}

impl TwitterAdapter {
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            bearer_token,
        }
    }

    fn tweets_endpoint(&self, url: String, cursor_param: &'static str, page_size: u32) -> Endpoint {
        Endpoint::new(url, Paging::Cursor(cursor_param), read_tweet_page)
            .with_query("max_results", page_size)
            .with_query("tweet.fields", TWEET_FIELDS)
            .with_query("expansions", EXPANSIONS)
            .with_query("user.fields", USER_FIELDS)
    }
}

fn index_by_id(includes: Option<&Value>, key: &str) -> HashMap<String, Value> {
    includes
        .and_then(|inc| inc.get(key))
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let id = entry.get("id")?.as_str()?;
                    Some((id.to_string(), entry.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn retweeted_id(tweet: &Map<String, Value>) -> Option<String> {
    tweet
        .get("referenced_tweets")?
        .as_array()?
        .iter()
        .find(|r| r.get("type").and_then(Value::as_str) == Some("retweeted"))?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

fn attach_author(tweet: &mut Map<String, Value>, users: &HashMap<String, Value>) {
    let author = tweet
        .get("author_id")
        .and_then(Value::as_str)
        .and_then(|id| users.get(id))
        .cloned();
    if let Some(author) = author {
        tweet.insert("author".to_string(), author);
    }
}

/// Reads a tweet list page: tweets under `data`, the cursor under `meta.next_token`.
pub fn read_tweet_page(body: Value, _link: Option<String>) -> Result<RawPage> {
    let Value::Object(mut body) = body else {
        return Err(CollectorError::Shape(format!(
            "expected an object, got {}",
            kind_of(&body)
        )));
    };

    let includes = body.get("includes");
    let users = index_by_id(includes, "users");
    let referenced = index_by_id(includes, "tweets");

    let tweets = match body.remove("data") {
        Some(Value::Array(tweets)) => tweets,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(CollectorError::Shape(format!(
                "expected `data` to be an array, got {}",
                kind_of(&other)
            )))
        }
    };

    let items = tweets
        .into_iter()
        .map(|tweet| match tweet {
            Value::Object(mut tweet) => {
                attach_author(&mut tweet, &users);
                if let Some(mut original) = retweeted_id(&tweet)
                    .and_then(|id| referenced.get(&id))
                    .and_then(|t| t.as_object().cloned())
                {
                    attach_author(&mut original, &users);
                    tweet.insert("retweeted_status".to_string(), Value::Object(original));
                }
                Value::Object(tweet)
            }
            other => other,
        })
        .collect();

    let next = body
        .get("meta")
        .and_then(|meta| meta.get("next_token"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(|t| PaginationToken::Cursor(t.to_string()));

    Ok(RawPage::new(items, next))
}

impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn credential(&self) -> Option<String> {
        self.bearer_token.clone()
    }

    fn page_size(&self, requested: u32) -> u32 {
        requested.clamp(10, 100)
    }

    fn discovery_endpoints(&self, keywords: &[String], page_size: u32) -> Vec<Endpoint> {
        keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|keyword| {
                self.tweets_endpoint(
                    format!("{}/2/tweets/search/recent", self.base_url),
                    "next_token",
                    page_size,
                )
                .with_query("query", keyword)
            })
            .collect()
    }

    fn timeline_endpoint(&self, actor: &ActorRef, page_size: u32) -> Endpoint {
        self.tweets_endpoint(
            format!(
                "{}/2/users/{}/tweets",
                self.base_url,
                urlencoding::encode(&actor.id)
            ),
            "pagination_token",
            page_size,
        )
    }

    fn profile_endpoint(&self, actor: &ActorRef) -> Endpoint {
        Endpoint::single(format!(
            "{}/2/users/{}",
            self.base_url,
            urlencoding::encode(&actor.id)
        ))
        .with_query("user.fields", USER_FIELDS)
    }

    fn normalize_post(&self, item: &Value) -> Normalized<CanonicalPost> {
        let mut post = CanonicalPost::empty(Platform::Twitter);
        let mut fields = Fields::new(item);

        post.post_id = fields.string("/id");
        post.author_id = fields.string("/author_id");
        post.author_handle = fields.opt_string("/author/username");
        if post.author_handle.is_none() {
            fields.warn("/author", "author not present in includes");
        }
        post.created_at = fields.timestamp("/created_at");
        post.language = fields.opt_string("/lang");

        post.is_reshare = item
            .as_object()
            .and_then(retweeted_id)
            .is_some();
        if post.is_reshare {
            match fields.get("/retweeted_status") {
                Some(original) => fields = fields.rebase(original),
                None => {
                    // The wrapper's own text is truncated and its counts are zero.
                    fields.warn("/retweeted_status", "retweeted original not present in includes");
                    return fields.finish(post);
                }
            }
        }

        post.text = fields.string("/text");
        post.like_count = fields.count("/public_metrics/like_count");
        post.repost_count = fields.count("/public_metrics/retweet_count");
        post.reply_count = fields.count("/public_metrics/reply_count");
        post.external_link = fields.opt_string("/entities/urls/0/expanded_url");

        fields.finish(post)
    }

    fn normalize_profile(&self, body: &Value) -> Normalized<CanonicalProfile> {
        let mut profile = CanonicalProfile::empty(Platform::Twitter);
        let mut fields = Fields::new(body);
        match fields.get("/data") {
            Some(data) => fields = fields.rebase(data),
            None => fields.warn("/data", "missing"),
        }

        profile.handle = fields.string("/username");
        profile.id = fields.string("/id");
        profile.display_name = fields.opt_string("/name");
        profile.followers_count = fields.count("/public_metrics/followers_count");
        profile.following_count = fields.count("/public_metrics/following_count");
        profile.posts_count = fields.count("/public_metrics/tweet_count");
        profile.description = fields.opt_string("/description").filter(|d| !d.is_empty());

        fields.finish(profile)
    }
}
