use crate::discovery::{discover, Discovered};
use crate::fetch::RunContext;
use crate::normalize::ShapeLog;
use crate::platforms::{adapters_for, PlatformAdapter};
use crate::types::{
    ActorFailure, ActorRef, CanonicalPost, CanonicalProfile, CollectionResult, CollectionRow,
    Phase, Platform,
};
use crate::walker::{HttpPageSource, PageSource, PaginationWalker};
use crate::{CollectorConfig, CollectorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// The per-actor requests of one platform: a timeline to walk and a profile to fetch.
#[async_trait]
pub trait ActorEndpoints: Send + Sync {
    type Pages: PageSource;

    /// The adapter that normalizes what these endpoints return.
    fn adapter(&self) -> &dyn PlatformAdapter;

    /// The pages of `actor`'s full timeline.
    fn timeline(&self, actor: &ActorRef) -> Self::Pages;

    /// Fetches `actor`'s profile once.
    async fn profile(&self, actor: &ActorRef) -> Result<Value>;
}

/// Actor endpoints served over HTTP through a platform's `RunContext`.
pub struct HttpActorEndpoints {
    adapter: Arc<dyn PlatformAdapter>,
    ctx: RunContext,
    page_size: u32,
}

impl HttpActorEndpoints {
    pub fn new(adapter: Arc<dyn PlatformAdapter>, ctx: RunContext, page_size: u32) -> Self {
        let page_size = adapter.page_size(page_size);
        Self {
            adapter,
            ctx,
            page_size,
        }
    }
}

#[async_trait]
impl ActorEndpoints for HttpActorEndpoints {
    type Pages = HttpPageSource;

    fn adapter(&self) -> &dyn PlatformAdapter {
        self.adapter.as_ref()
    }

    fn timeline(&self, actor: &ActorRef) -> HttpPageSource {
        HttpPageSource::new(
            self.ctx.clone(),
            self.adapter.timeline_endpoint(actor, self.page_size),
        )
    }

    async fn profile(&self, actor: &ActorRef) -> Result<Value> {
        self.ctx
            .fetch_object(&self.adapter.profile_endpoint(actor))
            .await
    }
}

/// How each actor's timeline is crawled.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// The ceiling on posts per actor; `None` collects everything available.
    pub max_posts: Option<usize>,
    /// The pause between pages of one timeline.
    pub delay: Duration,
    /// The number of actors processed at the same time.
    pub concurrency: usize,
    /// The page size below which a page without a next link is unremarkable.
    pub full_page: Option<usize>,
    pub cancel: CancellationToken,
    /// Shared by every actor of one platform so each unexpected shape is logged once.
    pub shapes: ShapeLog,
}

/// Everything collected for one actor; merged into the run only once the actor is finished.
#[derive(Debug)]
pub struct ActorOutcome {
    pub actor: ActorRef,
    pub posts: Vec<CanonicalPost>,
    pub profile: Option<CanonicalProfile>,
    pub failures: Vec<ActorFailure>,
    pub shape_warnings: usize,
    pub suspect_truncation: bool,
    pub cancelled: bool,
}

impl ActorOutcome {
    fn new(actor: ActorRef) -> Self {
        Self {
            actor,
            posts: Vec::new(),
            profile: None,
            failures: Vec::new(),
            shape_warnings: 0,
            suspect_truncation: false,
            cancelled: false,
        }
    }

    fn record_failure(&mut self, phase: Phase, err: CollectorError) {
        if matches!(err, CollectorError::Cancelled) {
            self.cancelled = true;
            return;
        }
        let cause = err.to_string();
        warn!(error = %err.for_actor(&self.actor, phase), "Actor phase failed, continuing with the next");
        self.failures.push(ActorFailure {
            actor: self.actor.clone(),
            phase,
            cause,
        });
    }
}

/// Walks one actor's timeline and fetches its profile.
///
/// The two are independent: either may fail without affecting the other, and a failure
/// never escapes this function.
#[instrument(skip(endpoints, actor, options), fields(actor = %actor))]
pub async fn collect_actor<E: ActorEndpoints>(
    endpoints: &E,
    actor: ActorRef,
    options: &CrawlOptions,
) -> ActorOutcome {
    let mut outcome = ActorOutcome::new(actor);
    if options.cancel.is_cancelled() {
        outcome.cancelled = true;
        return outcome;
    }
    let adapter = endpoints.adapter();

    let mut walker = PaginationWalker::new(endpoints.timeline(&outcome.actor))
        .with_limit(options.max_posts)
        .with_delay(options.delay)
        .with_cancel(options.cancel.clone());
    if let Some(size) = options.full_page {
        walker = walker.expecting_full_pages_of(size);
    }

    loop {
        match walker.next_page().await {
            Ok(Some(items)) => {
                for item in &items {
                    let normalized = adapter.normalize_post(item);
                    options
                        .shapes
                        .record(&adapter.name(), "post", &normalized.warnings);
                    outcome.shape_warnings += normalized.warnings.len();
                    outcome.posts.push(normalized.value);
                }
            }
            Ok(None) => break,
            Err(e) => {
                outcome.record_failure(Phase::Timeline, e);
                break;
            }
        }
    }
    outcome.suspect_truncation = walker.suspect_truncation();

    if !options.cancel.is_cancelled() {
        match endpoints.profile(&outcome.actor).await {
            Ok(body) => {
                let normalized = adapter.normalize_profile(&body);
                options
                    .shapes
                    .record(&adapter.name(), "profile", &normalized.warnings);
                outcome.shape_warnings += normalized.warnings.len();
                outcome.profile = Some(normalized.value);
            }
            Err(e) => outcome.record_failure(Phase::Profile, e),
        }
    } else {
        outcome.cancelled = true;
    }

    info!(posts = outcome.posts.len(), profile = outcome.profile.is_some(), "Actor collected");
    outcome
}

/// Processes `actors` with at most `options.concurrency` in flight.
pub async fn collect_actors<E: ActorEndpoints>(
    endpoints: &E,
    actors: Vec<ActorRef>,
    options: &CrawlOptions,
    progress: &ProgressBar,
) -> Vec<ActorOutcome> {
    stream::iter(actors)
        .map(|actor| collect_actor(endpoints, actor, options))
        .buffer_unordered(options.concurrency.max(1))
        .inspect(|outcome| {
            progress.set_message(outcome.actor.to_string());
            progress.inc(1);
        })
        .collect()
        .await
}

/// Accumulates finished actors and performs the final join.
#[derive(Debug, Default)]
pub struct Accumulator {
    posts: Vec<CanonicalPost>,
    profiles: Vec<CanonicalProfile>,
    failures: Vec<ActorFailure>,
    actors: usize,
    shape_warnings: usize,
    suspect_truncations: usize,
    cancelled: bool,
}

impl Accumulator {
    pub fn add_discovery(&mut self, found: &Discovered) {
        self.shape_warnings += found.shape_warnings;
        self.cancelled |= found.cancelled;
    }

    pub fn merge(&mut self, outcome: ActorOutcome) {
        self.actors += 1;
        self.posts.extend(outcome.posts);
        self.profiles.extend(outcome.profile);
        self.failures.extend(outcome.failures);
        self.shape_warnings += outcome.shape_warnings;
        self.suspect_truncations += usize::from(outcome.suspect_truncation);
        self.cancelled |= outcome.cancelled;
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Left-joins every post to its author's profile on `(platform, handle)`.
    pub fn finish(self) -> CollectionResult {
        let mut by_key: HashMap<(Platform, String), CanonicalProfile> = HashMap::new();
        let mut profiles = Vec::new();
        for profile in self.profiles {
            match profile.key() {
                Some(key) if !by_key.contains_key(&key) => {
                    by_key.insert(key, profile.clone());
                    profiles.push(profile);
                }
                Some(key) => warn!(platform = %key.0, handle = %key.1, "Duplicate profile ignored"),
                None => profiles.push(profile),
            }
        }

        let rows = self
            .posts
            .into_iter()
            .map(|post| {
                let profile = post
                    .author_handle
                    .clone()
                    .and_then(|handle| by_key.get(&(post.platform, handle)))
                    .cloned();
                CollectionRow { post, profile }
            })
            .collect();

        CollectionResult {
            rows,
            profiles,
            actors: self.actors,
            failures: self.failures,
            shape_warnings: self.shape_warnings,
            suspect_truncations: self.suspect_truncations,
            cancelled: self.cancelled,
            collected_at: Some(Utc::now()),
            ..CollectionResult::default()
        }
    }
}

/// The `Collector` struct runs discovery and per-actor collection for every enabled platform.
pub struct Collector {
    config: CollectorConfig,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// A token that aborts the run between pages and between actors.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole collection.
    ///
    /// # Returns
    ///
    /// The joined result, partial if actors failed or the run was cancelled, or a fatal
    /// `Discovery` error when a platform's keyword search could not be performed at all.
    pub async fn run(&self) -> Result<CollectionResult> {
        let adapters = adapters_for(&self.config);
        self.run_with(adapters).await
    }

    /// Runs the collection over the given adapters.
    pub async fn run_with(&self, adapters: Vec<Arc<dyn PlatformAdapter>>) -> Result<CollectionResult> {
        let timer = self.config.run_timeout().map(|timeout| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                sleep(timeout).await;
                warn!(timeout_secs = timeout.as_secs(), "Run timeout reached, stopping");
                cancel.cancel();
            })
        });

        let result = self.collect(adapters).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }

    async fn collect(&self, adapters: Vec<Arc<dyn PlatformAdapter>>) -> Result<CollectionResult> {
        let mut acc = Accumulator::default();
        let mut interruptions = Vec::new();

        // Discovery for every platform first: a failed search ends the run before any
        // timeline is crawled.
        let mut plans = Vec::new();
        for adapter in adapters {
            let ctx = RunContext::new(&self.config, adapter.credential(), self.cancel.clone())?;
            let shapes = ShapeLog::default();
            info!(platform = %adapter.name(), keywords = ?self.config.keywords, "Discovering actors");
            let found = discover(
                adapter.as_ref(),
                &ctx,
                &self.config.keywords,
                self.config.max_discovery_posts,
                self.config.page_size,
                &shapes,
            )
            .await?;
            acc.add_discovery(&found);
            if let Some(reason) = &found.interrupted {
                interruptions.push(format!("{}: {}", adapter.name(), reason));
            }
            plans.push((adapter, ctx, shapes, found.actors));
        }

        let total: usize = plans.iter().map(|(_, _, _, actors)| actors.len()).sum();
        let progress = if self.config.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:30}] {pos}/{len} actors {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for (adapter, ctx, shapes, actors) in plans {
            if self.cancel.is_cancelled() {
                acc.mark_cancelled();
                break;
            }
            let page_size = adapter.page_size(self.config.page_size);
            let options = CrawlOptions {
                max_posts: self.config.max_posts_per_user,
                delay: ctx.request_delay,
                concurrency: self.config.concurrency,
                full_page: adapter
                    .flags_missing_next_link()
                    .then_some(page_size as usize),
                cancel: self.cancel.clone(),
                shapes,
            };
            info!(platform = %adapter.name(), actors = actors.len(), "Collecting timelines and profiles");

            let endpoints = HttpActorEndpoints::new(adapter, ctx, self.config.page_size);
            for outcome in collect_actors(&endpoints, actors.into_iter().collect(), &options, &progress).await {
                acc.merge(outcome);
            }
        }
        progress.finish_and_clear();

        let mut result = acc.finish();
        result.discovery_interruptions = interruptions;
        info!(
            rows = result.rows.len(),
            profiles = result.profiles.len(),
            failures = result.failures.len(),
            "Collection finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ShapeWarning;
    use crate::platforms::BlueskyAdapter;
    use crate::types::{PaginationToken, RawPage};
    use crate::walker::tests::ScriptedSource;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted timelines and profiles keyed by actor id.
    struct ScriptedActors {
        adapter: BlueskyAdapter,
        timelines: Mutex<HashMap<String, Vec<Result<RawPage>>>>,
        profiles: Mutex<HashMap<String, Result<Value>>>,
    }

    #[async_trait]
    impl ActorEndpoints for ScriptedActors {
        type Pages = ScriptedSource;

        fn adapter(&self) -> &dyn PlatformAdapter {
            &self.adapter
        }

        fn timeline(&self, actor: &ActorRef) -> ScriptedSource {
            let script = self.timelines.lock().unwrap().remove(&actor.id).unwrap_or_default();
            ScriptedSource::new(script)
        }

        async fn profile(&self, actor: &ActorRef) -> Result<Value> {
            self.profiles
                .lock()
                .unwrap()
                .remove(&actor.id)
                .unwrap_or_else(|| Err(CollectorError::Shape("no profile scripted".into())))
        }
    }

    fn feed_item(handle: &str, n: u32) -> Value {
        json!({"post": {
            "uri": format!("at://{handle}/{n}"),
            "author": {"did": format!("did:{handle}"), "handle": handle},
            "record": {"text": format!("post {n}"), "createdAt": "2024-11-20T12:00:00Z"},
            "likeCount": n, "repostCount": 0, "replyCount": 0
        }})
    }

    fn profile(handle: &str) -> Value {
        json!({
            "did": format!("did:{handle}"), "handle": handle, "displayName": handle.to_uppercase(),
            "followersCount": 1, "followsCount": 2, "postsCount": 3
        })
    }

    fn options() -> CrawlOptions {
        CrawlOptions {
            max_posts: None,
            delay: Duration::ZERO,
            concurrency: 2,
            full_page: None,
            cancel: CancellationToken::new(),
            shapes: ShapeLog::default(),
        }
    }

    fn scripted() -> ScriptedActors {
        let mut timelines = HashMap::new();
        timelines.insert(
            "did:a".to_string(),
            vec![
                Ok(RawPage::new(vec![feed_item("a", 1), feed_item("a", 2)], Some(PaginationToken::Cursor("c".into())))),
                Ok(RawPage::new(vec![feed_item("a", 3)], None)),
            ],
        );
        timelines.insert("did:b".to_string(), vec![Ok(RawPage::new(vec![feed_item("b", 1)], None))]);
        timelines.insert("did:c".to_string(), vec![Ok(RawPage::new(vec![feed_item("c", 1)], None))]);

        let mut profiles = HashMap::new();
        profiles.insert("did:a".to_string(), Ok(profile("a")));
        profiles.insert(
            "did:b".to_string(),
            Err(CollectorError::ClientError {
                status: 400,
                url: "getProfile".into(),
                message: "Profile not found".into(),
            }),
        );
        profiles.insert("did:c".to_string(), Ok(profile("c")));

        ScriptedActors {
            adapter: BlueskyAdapter::new("https://bsky.example", None),
            timelines: Mutex::new(timelines),
            profiles: Mutex::new(profiles),
        }
    }

    fn actors() -> Vec<ActorRef> {
        ["did:a", "did:b", "did:c"]
            .into_iter()
            .map(|id| ActorRef::new(Platform::Bluesky, id))
            .collect()
    }

    #[tokio::test]
    async fn test_profile_failure_is_isolated() {
        let endpoints = scripted();
        let outcomes = collect_actors(&endpoints, actors(), &options(), &ProgressBar::hidden()).await;

        let mut acc = Accumulator::default();
        for outcome in outcomes {
            acc.merge(outcome);
        }
        let result = acc.finish();

        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.actors, 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].actor.id, "did:b");
        assert_eq!(result.failures[0].phase, Phase::Profile);
        assert!(result.is_partial());

        for row in &result.rows {
            let handle = row.post.author_handle.as_deref().unwrap();
            match handle {
                "b" => assert!(row.profile.is_none()),
                _ => {
                    let profile = row.profile.as_ref().unwrap();
                    assert_eq!(profile.handle.as_deref(), Some(handle));
                    assert_eq!(profile.followers_count, Some(1));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_timeline_failure_keeps_partial_posts_and_profile() {
        let endpoints = scripted();
        endpoints.timelines.lock().unwrap().insert(
            "did:a".to_string(),
            vec![
                Ok(RawPage::new(vec![feed_item("a", 1)], Some(PaginationToken::Cursor("c".into())))),
                Err(CollectorError::ClientError {
                    status: 500,
                    url: "feed".into(),
                    message: "boom".into(),
                }),
            ],
        );

        let outcome = collect_actor(&endpoints, ActorRef::new(Platform::Bluesky, "did:a"), &options()).await;
        assert_eq!(outcome.posts.len(), 1);
        assert!(outcome.profile.is_some());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].phase, Phase::Timeline);
    }

    #[tokio::test]
    async fn test_per_user_ceiling() {
        let endpoints = scripted();
        let options = CrawlOptions {
            max_posts: Some(2),
            ..options()
        };
        let outcome = collect_actor(&endpoints, ActorRef::new(Platform::Bluesky, "did:a"), &options).await;
        assert_eq!(outcome.posts.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_actors() {
        let endpoints = scripted();
        let options = options();
        options.cancel.cancel();

        let outcomes = collect_actors(&endpoints, actors(), &options, &ProgressBar::hidden()).await;
        assert!(outcomes.iter().all(|o| o.cancelled && o.posts.is_empty()));
        assert!(outcomes.iter().all(|o| o.failures.is_empty()));
    }

    #[tokio::test]
    async fn test_repeated_shape_gaps_are_all_counted() {
        let endpoints = scripted();
        let sparse = |n: u32| {
            let mut item = feed_item("a", n);
            item["post"].as_object_mut().unwrap().remove("likeCount");
            item
        };
        endpoints.timelines.lock().unwrap().insert(
            "did:a".to_string(),
            vec![Ok(RawPage::new(vec![sparse(1), sparse(2), sparse(3)], None))],
        );

        let options = options();
        let outcome = collect_actor(&endpoints, ActorRef::new(Platform::Bluesky, "did:a"), &options).await;
        assert_eq!(outcome.posts.len(), 3);
        assert_eq!(outcome.shape_warnings, 3);

        let gap = ShapeWarning {
            field: "/likeCount".into(),
            detail: "missing".into(),
        };
        assert_eq!(options.shapes.record("bluesky", "post", &[gap]), 0);
    }

    #[test]
    fn test_duplicate_profiles_keep_first() {
        let mut acc = Accumulator::default();
        let mut first = ActorOutcome::new(ActorRef::new(Platform::Bluesky, "did:a"));
        let mut p1 = CanonicalProfile::empty(Platform::Bluesky);
        p1.handle = Some("a".into());
        p1.followers_count = Some(1);
        let mut p2 = p1.clone();
        p2.followers_count = Some(2);
        first.profile = Some(p1);
        let mut second = ActorOutcome::new(ActorRef::new(Platform::Bluesky, "did:a2"));
        second.profile = Some(p2);

        acc.merge(first);
        acc.merge(second);
        let result = acc.finish();
        assert_eq!(result.profiles.len(), 1);
        assert_eq!(result.profiles[0].followers_count, Some(1));
    }
}
