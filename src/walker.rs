use crate::fetch::{Endpoint, RunContext};
use crate::types::{PaginationToken, RawPage};
use crate::{CollectorError, Result};
use async_trait::async_trait;
use futures::{stream, Stream, TryStreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Anything that can produce the page a pagination token points at.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the first page when `token` is `None`, otherwise the page it points at.
    async fn fetch(&self, token: Option<&PaginationToken>) -> Result<RawPage>;
}

/// Pages of one HTTP endpoint, each request wrapped in the context's retry policy.
pub struct HttpPageSource {
    ctx: RunContext,
    endpoint: Endpoint,
}

impl HttpPageSource {
    pub fn new(ctx: RunContext, endpoint: Endpoint) -> Self {
        Self { ctx, endpoint }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, token: Option<&PaginationToken>) -> Result<RawPage> {
        let request = match token {
            Some(token) => self.endpoint.advance(token),
            None => self.endpoint.clone(),
        };
        self.ctx
            .retry
            .run(&self.ctx.cancel, &request.url, || self.ctx.fetch_page(&request))
            .await
    }
}

/// Where a walk is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Running,
    Done,
    Failed,
}

/// The `PaginationWalker` struct follows a source's tokens page by page until the result set ends.
///
/// A walk is done after an empty page, a page without a next token, or once the item
/// ceiling is reached. It fails on the first error its source does not recover from.
/// Walks are forward-only; resuming needs the last token passed to [`starting_at`].
///
/// [`starting_at`]: PaginationWalker::starting_at
pub struct PaginationWalker<S> {
    source: S,
    token: Option<PaginationToken>,
    state: WalkState,
    limit: Option<usize>,
    yielded: usize,
    pages: usize,
    delay: Duration,
    cancel: CancellationToken,
    full_page: Option<usize>,
    suspect_truncation: bool,
}

impl<S: PageSource> PaginationWalker<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            token: None,
            state: WalkState::Running,
            limit: None,
            yielded: 0,
            pages: 0,
            delay: Duration::ZERO,
            cancel: CancellationToken::new(),
            full_page: None,
            suspect_truncation: false,
        }
    }

    /// Stops the walk once `limit` items have been yielded. `None` walks everything.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Pauses between successive pages.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resumes a walk from a token seen in an earlier run.
    pub fn starting_at(mut self, token: PaginationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Flags walks that end on a page of `size` items without a next token.
    pub fn expecting_full_pages_of(mut self, size: usize) -> Self {
        self.full_page = Some(size);
        self
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    /// The token of the next page not yet fetched.
    pub fn last_token(&self) -> Option<&PaginationToken> {
        self.token.as_ref()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Whether the walk ended on a full page that carried no next token.
    pub fn suspect_truncation(&self) -> bool {
        self.suspect_truncation
    }

    /// Fetches the next page of items.
    ///
    /// # Returns
    ///
    /// `Ok(Some(items))` while the walk runs, `Ok(None)` once it is done, or the error that
    /// failed it. Cancellation is checked before every page after the first.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        if self.state != WalkState::Running {
            return Ok(None);
        }
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            self.state = WalkState::Done;
            return Ok(None);
        }

        if self.pages > 0 {
            if self.cancel.is_cancelled() {
                self.state = WalkState::Failed;
                return Err(CollectorError::Cancelled);
            }
            if !self.delay.is_zero() {
                let cancelled = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = sleep(self.delay) => false,
                };
                if cancelled {
                    self.state = WalkState::Failed;
                    return Err(CollectorError::Cancelled);
                }
            }
        }

        let RawPage { mut items, next } = match self.source.fetch(self.token.as_ref()).await {
            Ok(page) => page,
            Err(e) => {
                self.state = WalkState::Failed;
                return Err(e);
            }
        };
        self.pages += 1;

        if items.is_empty() {
            debug!(page = self.pages, "Empty page, walk finished");
            self.state = WalkState::Done;
            return Ok(None);
        }

        let received = items.len();
        if let Some(limit) = self.limit {
            let remaining = limit - self.yielded;
            if received >= remaining {
                items.truncate(remaining);
                self.state = WalkState::Done;
            }
        }
        self.yielded += items.len();

        match next {
            Some(token) if self.state == WalkState::Running => {
                debug!(page = self.pages, items = received, cursor = ?token, "Page collected");
                self.token = Some(token);
            }
            Some(_) => {}
            None => {
                if self.state == WalkState::Running
                    && self.full_page.is_some_and(|size| received >= size)
                {
                    warn!(
                        page = self.pages,
                        items = received,
                        "Pagination ended on a full page without a next link; results may be truncated"
                    );
                    self.suspect_truncation = true;
                }
                debug!(page = self.pages, items = received, "No next token, walk finished");
                self.state = WalkState::Done;
            }
        }

        Ok(Some(items))
    }
}

impl<S: PageSource> PaginationWalker<S> {
    /// Turns the walk into a lazy stream of items. Pages are only fetched as items are pulled.
    pub fn into_items(self) -> impl Stream<Item = Result<Value>> {
        stream::try_unfold(self, |mut walker| async move {
            Ok::<_, CollectorError>(walker.next_page().await?.map(|page| (page, walker)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Value, CollectorError>)))
        .try_flatten()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A page source that replays a fixed script and records the tokens it was asked for.
    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Result<RawPage>>>,
        pub(crate) requested: Mutex<Vec<Option<PaginationToken>>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<RawPage>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch(&self, token: Option<&PaginationToken>) -> Result<RawPage> {
            self.requested.lock().unwrap().push(token.cloned());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CollectorError::Shape("script exhausted".into())))
        }
    }

    #[async_trait]
    impl<T: PageSource + ?Sized> PageSource for std::sync::Arc<T> {
        async fn fetch(&self, token: Option<&PaginationToken>) -> Result<RawPage> {
            (**self).fetch(token).await
        }
    }

    pub(crate) fn page(ids: &[u32], next: Option<&str>) -> Result<RawPage> {
        Ok(RawPage::new(
            ids.iter().map(|id| json!({ "id": id })).collect(),
            next.map(|t| PaginationToken::Cursor(t.to_string())),
        ))
    }

    async fn drain<S: PageSource>(walker: &mut PaginationWalker<S>) -> Vec<Value> {
        let mut all = Vec::new();
        while let Some(items) = walker.next_page().await.unwrap() {
            all.extend(items);
        }
        all
    }

    #[tokio::test]
    async fn test_follows_tokens_until_absent() {
        let source = ScriptedSource::new(vec![page(&[1, 2], Some("t2")), page(&[3], None)]);
        let mut walker = PaginationWalker::new(source);

        let items = drain(&mut walker).await;
        assert_eq!(items.len(), 3);
        assert_eq!(walker.state(), WalkState::Done);
        assert_eq!(
            *walker.source.requested.lock().unwrap(),
            vec![None, Some(PaginationToken::Cursor("t2".into()))]
        );
    }

    #[tokio::test]
    async fn test_empty_page_ends_walk_despite_token() {
        let source = ScriptedSource::new(vec![page(&[1], Some("t2")), page(&[], Some("t3"))]);
        let mut walker = PaginationWalker::new(source);

        assert_eq!(drain(&mut walker).await.len(), 1);
        assert_eq!(walker.state(), WalkState::Done);
        assert_eq!(walker.source.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_absent_token_ends_walk_with_items() {
        let source = ScriptedSource::new(vec![page(&[1, 2, 3], None), page(&[4], None)]);
        let mut walker = PaginationWalker::new(source);

        assert_eq!(drain(&mut walker).await.len(), 3);
        assert_eq!(walker.pages(), 1);
    }

    #[tokio::test]
    async fn test_item_ceiling() {
        let source = ScriptedSource::new(vec![
            page(&[1, 2], Some("t2")),
            page(&[3, 4], Some("t3")),
            page(&[5, 6], None),
        ]);
        let mut walker = PaginationWalker::new(source).with_limit(Some(3));

        let items = drain(&mut walker).await;
        assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
        assert_eq!(walker.pages(), 2);
        assert_eq!(walker.state(), WalkState::Done);
    }

    #[tokio::test]
    async fn test_error_fails_walk() {
        let source = ScriptedSource::new(vec![
            page(&[1], Some("t2")),
            Err(CollectorError::ClientError {
                status: 403,
                url: "x".into(),
                message: "forbidden".into(),
            }),
        ]);
        let mut walker = PaginationWalker::new(source);

        assert!(walker.next_page().await.unwrap().is_some());
        assert!(walker.next_page().await.is_err());
        assert_eq!(walker.state(), WalkState::Failed);
        assert_eq!(walker.last_token(), Some(&PaginationToken::Cursor("t2".into())));
        assert!(walker.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_between_pages() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![page(&[1], Some("t2")), page(&[2], None)]);
        let mut walker = PaginationWalker::new(source).with_cancel(cancel.clone());

        assert!(walker.next_page().await.unwrap().is_some());
        cancel.cancel();
        assert!(matches!(walker.next_page().await, Err(CollectorError::Cancelled)));
        assert_eq!(walker.source.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_final_page_is_flagged() {
        let source = ScriptedSource::new(vec![page(&[1, 2], None)]);
        let mut walker = PaginationWalker::new(source).expecting_full_pages_of(2);
        drain(&mut walker).await;
        assert!(walker.suspect_truncation());

        let source = ScriptedSource::new(vec![page(&[1], None)]);
        let mut walker = PaginationWalker::new(source).expecting_full_pages_of(2);
        drain(&mut walker).await;
        assert!(!walker.suspect_truncation());
    }

    #[tokio::test]
    async fn test_resume_from_token() {
        let source = ScriptedSource::new(vec![page(&[9], None)]);
        let mut walker =
            PaginationWalker::new(source).starting_at(PaginationToken::Cursor("t9".into()));
        drain(&mut walker).await;
        assert_eq!(
            *walker.source.requested.lock().unwrap(),
            vec![Some(PaginationToken::Cursor("t9".into()))]
        );
    }

    /// Retries the scripted fetches the way `HttpPageSource` retries HTTP ones.
    struct RetryingSource {
        policy: RetryPolicy,
        inner: ScriptedSource,
    }

    #[async_trait]
    impl PageSource for RetryingSource {
        async fn fetch(&self, token: Option<&PaginationToken>) -> Result<RawPage> {
            self.policy
                .run(&CancellationToken::new(), "scripted", || self.inner.fetch(token))
                .await
        }
    }

    #[tokio::test]
    async fn test_rate_limit_recovery_yields_same_items() {
        let policy = RetryPolicy {
            rate_limit_fallback: Duration::from_millis(1),
            max_total_backoff: None,
            max_transport_retries: 3,
            base_backoff: Duration::from_millis(1),
        };
        let throttled = RetryingSource {
            policy,
            inner: ScriptedSource::new(vec![
                page(&[1, 2], Some("t2")),
                Err(CollectorError::RateLimited { retry_after: None }),
                Err(CollectorError::RateLimited { retry_after: Some(Duration::from_millis(1)) }),
                page(&[3], None),
            ]),
        };
        let clean = ScriptedSource::new(vec![page(&[1, 2], Some("t2")), page(&[3], None)]);

        let mut throttled = PaginationWalker::new(throttled);
        let mut clean = PaginationWalker::new(clean);
        assert_eq!(drain(&mut throttled).await, drain(&mut clean).await);
        assert_eq!(throttled.source.inner.requested.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_item_stream_is_lazy() {
        let source = std::sync::Arc::new(ScriptedSource::new(vec![
            page(&[1, 2], Some("t2")),
            page(&[3], None),
        ]));
        let mut items = Box::pin(PaginationWalker::new(source.clone()).into_items());

        assert_eq!(items.try_next().await.unwrap(), Some(json!({"id": 1})));
        assert_eq!(items.try_next().await.unwrap(), Some(json!({"id": 2})));
        assert_eq!(source.requested.lock().unwrap().len(), 1);
        assert_eq!(items.try_next().await.unwrap(), Some(json!({"id": 3})));
        assert_eq!(items.try_next().await.unwrap(), None);
    }
}
