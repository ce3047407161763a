use crate::fetch::RunContext;
use crate::normalize::ShapeLog;
use crate::platforms::PlatformAdapter;
use crate::types::ActorRef;
use crate::walker::{HttpPageSource, PageSource, PaginationWalker};
use crate::{CollectorError, Result};
use futures::TryStreamExt;
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

/// The actors found by walking a platform's keyword search.
#[derive(Debug, Default)]
pub struct Discovered {
    /// Every distinct author seen before the cutoff.
    pub actors: BTreeSet<ActorRef>,
    /// Posts read from the search walk.
    pub posts_seen: usize,
    /// Posts that counted toward the cutoff.
    pub posts_matched: usize,
    pub shape_warnings: usize,
    /// Set when a later page failed and the search stopped early.
    pub interrupted: Option<String>,
    pub cancelled: bool,
}

/// Walks one search endpoint, collecting authors until the walk ends or `max_posts` posts
/// have counted.
///
/// # Arguments
///
/// * `adapter` - Maps raw items and decides which posts match the keywords.
/// * `walker` - The walk over the search or public timeline.
/// * `keywords` - The search keywords.
/// * `max_posts` - The number of matching posts after which the walk stops.
/// * `found` - Accumulates actors and counters across endpoints.
/// * `shapes` - Logs each unexpected item shape of this platform once.
///
/// # Returns
///
/// A fatal `Discovery` error when the very first page cannot be fetched; later failures
/// only stop this walk and are recorded in `found.interrupted`.
pub async fn discover_from<S: PageSource>(
    adapter: &dyn PlatformAdapter,
    walker: PaginationWalker<S>,
    keywords: &[String],
    max_posts: usize,
    found: &mut Discovered,
    shapes: &ShapeLog,
) -> Result<()> {
    if max_posts == 0 {
        return Ok(());
    }

    let mut items = Box::pin(walker.into_items());
    let mut seen = 0usize;
    let mut matched = 0usize;

    loop {
        let item = match items.try_next().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(CollectorError::Cancelled) => {
                found.cancelled = true;
                break;
            }
            Err(e) if seen == 0 => return Err(CollectorError::Discovery(Box::new(e))),
            Err(e) => {
                warn!(platform = %adapter.name(), error = %e, posts = seen, "Search stopped early");
                found.interrupted = Some(e.to_string());
                break;
            }
        };
        seen += 1;

        let normalized = adapter.normalize_post(&item);
        shapes.record(&adapter.name(), "post", &normalized.warnings);
        found.shape_warnings += normalized.warnings.len();

        let post = normalized.value;
        if !adapter.discovery_match(&post, keywords) {
            continue;
        }
        matched += 1;
        match post.actor() {
            Some(actor) => {
                found.actors.insert(actor);
            }
            None => warn!(platform = %adapter.name(), post = ?post.post_id, "Post without author"),
        }
        if matched >= max_posts {
            break;
        }
    }

    found.posts_seen += seen;
    found.posts_matched += matched;
    Ok(())
}

/// Runs every discovery endpoint of `adapter` and returns the deduplicated actor set.
#[instrument(skip_all, fields(platform = %adapter.name()))]
pub async fn discover(
    adapter: &dyn PlatformAdapter,
    ctx: &RunContext,
    keywords: &[String],
    max_posts: usize,
    page_size: u32,
    shapes: &ShapeLog,
) -> Result<Discovered> {
    let page_size = adapter.page_size(page_size);
    let mut found = Discovered::default();

    for endpoint in adapter.discovery_endpoints(keywords, page_size) {
        if ctx.cancel.is_cancelled() {
            found.cancelled = true;
            break;
        }
        let walker = PaginationWalker::new(HttpPageSource::new(ctx.clone(), endpoint))
            .with_delay(ctx.request_delay)
            .with_cancel(ctx.cancel.clone());
        discover_from(adapter, walker, keywords, max_posts, &mut found, shapes).await?;
    }

    info!(
        actors = found.actors.len(),
        posts = found.posts_seen,
        matched = found.posts_matched,
        "Discovery finished"
    );
    Ok(found)
}
