//! Periodic feed ingestion.
//!
//! Every cycle selects the stalest `batch_size` feeds, fetches each one in
//! its own task and waits for the whole batch before sleeping again. A feed
//! is only marked fetched after all of its items were handled, so a feed that
//! fails keeps its old timestamp and is selected first on the next cycle.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::db::{CreatePost, Database, Feed, Post, StoreError, StoreResult};
use crate::fetcher::{FeedClient, FetchError, RssFeed};

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// At most `limit` feeds, ascending by last fetch time with never-fetched feeds first.
    async fn next_feeds_to_fetch(&self, limit: u32) -> StoreResult<Vec<Feed>>;

    async fn mark_feed_fetched(&self, feed_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Fails with `StoreError::Conflict` when the feed already has a post with this URL.
    async fn create_post(&self, post: &CreatePost) -> StoreResult<Post>;
}

#[async_trait]
impl FeedStore for Database {
    async fn next_feeds_to_fetch(&self, limit: u32) -> StoreResult<Vec<Feed>> {
        self.get_next_feeds_to_fetch(limit).await
    }

    async fn mark_feed_fetched(&self, feed_id: Uuid) -> StoreResult<()> {
        Database::mark_feed_fetched(self, feed_id).await
    }
}

#[async_trait]
impl PostStore for Database {
    async fn create_post(&self, post: &CreatePost) -> StoreResult<Post> {
        Database::create_post(self, post).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to the items of one feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    /// Items dropped because their publish date could not be parsed
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: FeedOutcome) {
        self.succeeded += 1;
        self.inserted += outcome.inserted;
        self.duplicates += outcome.duplicates;
        self.skipped += outcome.skipped;
    }
}

pub struct Scheduler {
    feeds: Arc<dyn FeedStore>,
    posts: Arc<dyn PostStore>,
    client: FeedClient,
    config: SchedulerConfig,
    running: RwLock<bool>,
}

impl Scheduler {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        posts: Arc<dyn PostStore>,
        client: FeedClient,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            feeds,
            posts,
            client,
            config,
            running: RwLock::new(false),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Runs a cycle immediately, then one cycle per poll interval until
    /// `shutdown` turns true. A cycle in progress is always allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        info!(
            batch_size = self.config.batch_size,
            interval_secs = interval.as_secs(),
            "Feed fetch scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Feed fetch scheduler stopped");
    }

    /// Fetches one batch. Returns `None` without doing anything if another
    /// cycle is already in progress.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        {
            let mut running = self.running.write().await;
            if *running {
                info!("Feed fetch cycle already in progress, skipping");
                return None;
            }
            *running = true;
        }

        let report = self.do_cycle().await;

        *self.running.write().await = false;

        Some(report)
    }

    async fn do_cycle(&self) -> CycleReport {
        let feeds = match self.feeds.next_feeds_to_fetch(self.config.batch_size).await {
            Ok(feeds) => feeds,
            Err(e) => {
                error!(error = %e, "Failed to select feeds to fetch, skipping cycle");
                return CycleReport::default();
            }
        };

        let mut report = CycleReport {
            selected: feeds.len(),
            ..Default::default()
        };
        info!(feeds = report.selected, "Starting feed fetch cycle");

        let timeout = self.config.fetch_timeout();
        let mut tasks = JoinSet::new();
        for feed in feeds {
            let feed_store = Arc::clone(&self.feeds);
            let post_store = Arc::clone(&self.posts);
            let client = self.client.clone();

            tasks.spawn(async move {
                let result = tokio::time::timeout(
                    timeout,
                    process_feed(feed_store.as_ref(), post_store.as_ref(), &client, &feed),
                )
                .await;
                (feed, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((feed, Ok(Ok(outcome)))) => {
                    info!(
                        feed_id = %feed.id,
                        feed = %feed.name,
                        inserted = outcome.inserted,
                        duplicates = outcome.duplicates,
                        skipped = outcome.skipped,
                        "Fetched feed"
                    );
                    report.record(outcome);
                }
                Ok((feed, Ok(Err(e)))) => {
                    warn!(feed_id = %feed.id, url = %feed.url, error = %e, "Failed to fetch feed");
                    report.failed += 1;
                }
                Ok((feed, Err(_))) => {
                    warn!(
                        feed_id = %feed.id,
                        url = %feed.url,
                        timeout_secs = timeout.as_secs(),
                        "Feed fetch timed out"
                    );
                    report.timed_out += 1;
                }
                Err(e) => {
                    error!(error = %e, "Feed fetch task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            inserted = report.inserted,
            "Feed fetch cycle complete"
        );
        report
    }

    /// Stores the items of an already fetched document and marks the feed fetched.
    pub async fn ingest(&self, feed: &Feed, document: RssFeed) -> StoreResult<FeedOutcome> {
        ingest(self.feeds.as_ref(), self.posts.as_ref(), feed, document).await
    }
}

async fn process_feed(
    feeds: &dyn FeedStore,
    posts: &dyn PostStore,
    client: &FeedClient,
    feed: &Feed,
) -> Result<FeedOutcome, FeedError> {
    let document = client.fetch(&feed.url).await?;
    debug!(feed_id = %feed.id, channel = %document.channel.title, "Processing feed");

    let outcome = ingest(feeds, posts, feed, document).await?;
    Ok(outcome)
}

async fn ingest(
    feeds: &dyn FeedStore,
    posts: &dyn PostStore,
    feed: &Feed,
    document: RssFeed,
) -> StoreResult<FeedOutcome> {
    let mut outcome = FeedOutcome::default();

    for item in document.channel.items {
        let published_at = match item.published_at() {
            Ok(published_at) => published_at,
            Err(e) => {
                warn!(
                    feed_id = %feed.id,
                    link = %item.link,
                    pub_date = %item.pub_date,
                    error = %e,
                    "Skipping item with unparsable publish date"
                );
                outcome.skipped += 1;
                continue;
            }
        };

        let post = CreatePost {
            feed_id: feed.id,
            title: item.title,
            url: item.link,
            description: item.description,
            published_at,
        };

        match posts.create_post(&post).await {
            Ok(created) => {
                debug!(feed_id = %feed.id, post_id = created.id, title = %created.title, "Created post");
                outcome.inserted += 1;
            }
            Err(e) if e.is_conflict() => {
                outcome.duplicates += 1;
            }
            Err(e) => {
                error!(feed_id = %feed.id, url = %post.url, error = %e, "Failed to create post");
                return Err(e);
            }
        }
    }

    feeds.mark_feed_fetched(feed.id).await?;
    Ok(outcome)
}
