use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use tracing::info;
use uuid::Uuid;

use crate::config::FeedConfig;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Maps unique-constraint violations to `Conflict` and dangling
    /// references to `NotFound`, everything else passes through.
    fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(what.into())
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                StoreError::NotFound
            }
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Feed {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FeedFollow {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub feed_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePost {
    pub feed_id: Uuid,
    pub title: String,
    pub url: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
}

fn generate_api_key() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id BLOB NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_fetched_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id BLOB PRIMARY KEY,
                feed_id BLOB NOT NULL REFERENCES feeds(id),
                user_id BLOB NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT NOT NULL,
                published_at TEXT NOT NULL,
                feed_id BLOB NOT NULL REFERENCES feeds(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(feed_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched ON feeds(last_fetched_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_user(&self, name: &str) -> StoreResult<User> {
        let now = Utc::now();
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, api_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(generate_api_key())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("user '{}'", name)))
    }

    pub async fn get_user_by_name(&self, name: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_api_key(&self, api_key: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn create_feed(&self, name: &str, url: &str, user_id: Uuid) -> StoreResult<Feed> {
        let (feed, _) = self.create_feed_and_follow(name, url, user_id).await?;
        Ok(feed)
    }

    /// Creates a feed and makes its owner follow it, in one transaction.
    pub async fn create_feed_and_follow(
        &self,
        name: &str,
        url: &str,
        user_id: Uuid,
    ) -> StoreResult<(Feed, FeedFollow)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let feed = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (id, name, url, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(url)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("feed '{}'", url)))?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            INSERT INTO feed_follows (id, feed_id, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(feed.id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((feed, follow))
    }

    pub async fn follow_feed(&self, user_id: Uuid, feed_id: Uuid) -> StoreResult<FeedFollow> {
        let now = Utc::now();
        sqlx::query_as::<_, FeedFollow>(
            r#"
            INSERT INTO feed_follows (id, feed_id, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(feed_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("follow of feed {}", feed_id)))
    }

    pub async fn list_feed_follows(
        &self,
        user_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<FeedFollow>> {
        let follows = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT * FROM feed_follows
            WHERE user_id = ?
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    /// Removes one of the user's follows. Follows of other users are `NotFound`.
    pub async fn delete_feed_follow(&self, follow_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE id = ? AND user_id = ?")
            .bind(follow_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Seeds the owners and feeds declared in the configuration.
    pub async fn sync_feeds(&self, configs: &[FeedConfig]) -> StoreResult<()> {
        for config in configs {
            let owner = match self.get_user_by_name(&config.owner).await? {
                Some(user) => user,
                None => {
                    let user = self.create_user(&config.owner).await?;
                    info!(user = %user.name, api_key = %user.api_key, "Created user");
                    user
                }
            };

            match self.get_feed_by_url(&config.url).await? {
                Some(feed) => {
                    sqlx::query("UPDATE feeds SET name = ?, updated_at = ? WHERE id = ?")
                        .bind(&config.name)
                        .bind(Utc::now())
                        .bind(feed.id)
                        .execute(&self.pool)
                        .await?;
                }
                None => {
                    self.create_feed(&config.name, &config.url, owner.id).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn get_all_feeds(&self) -> StoreResult<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: Uuid) -> StoreResult<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> StoreResult<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Returns at most `limit` feeds, never-fetched first, then oldest fetch first.
    pub async fn get_next_feeds_to_fetch(&self, limit: u32) -> StoreResult<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn mark_feed_fetched(&self, feed_id: Uuid) -> StoreResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn create_post(&self, post: &CreatePost) -> StoreResult<Post> {
        let now = Utc::now();
        sqlx::query_as::<_, Post>(
            r#"
            INSERT INTO posts (title, url, description, published_at, feed_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&post.title)
        .bind(&post.url)
        .bind(&post.description)
        .bind(post.published_at)
        .bind(post.feed_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("post '{}'", post.url)))
    }

    /// Posts from every feed the user follows, most recently published first.
    pub async fn get_posts_for_user(&self, user_id: Uuid, limit: u32) -> StoreResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT posts.* FROM posts
            JOIN feed_follows ON feed_follows.feed_id = posts.feed_id
            WHERE feed_follows.user_id = ?
            ORDER BY posts.published_at DESC, posts.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn get_post_count_for_feed(&self, feed_id: Uuid) -> StoreResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    async fn create_test_feed(db: &Database, url: &str) -> Feed {
        let user = match db.get_user_by_name("owner").await.unwrap() {
            Some(user) => user,
            None => db.create_user("owner").await.unwrap(),
        };
        db.create_feed("Test", url, user.id).await.unwrap()
    }

    fn create_post_params(feed_id: Uuid, url: &str, published_at: DateTime<Utc>) -> CreatePost {
        CreatePost {
            feed_id,
            title: format!("Title of {}", url),
            url: url.to_string(),
            description: "Description".to_string(),
            published_at,
        }
    }

    async fn set_last_fetched_at(db: &Database, feed_id: Uuid, at: DateTime<Utc>) {
        sqlx::query("UPDATE feeds SET last_fetched_at = ? WHERE id = ?")
            .bind(at)
            .bind(feed_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    mod initialization_tests {
        use super::*;

        #[tokio::test]
        async fn test_database_initialization() {
            let db = create_test_db().await;
            let feeds = db.get_all_feeds().await.unwrap();
            assert!(feeds.is_empty());
        }

        #[tokio::test]
        async fn test_double_initialization_is_safe() {
            let db = create_test_db().await;
            let result = db.initialize().await;
            assert!(result.is_ok());
        }
    }

    mod user_tests {
        use super::*;

        #[tokio::test]
        async fn test_create_user_generates_api_key() {
            let db = create_test_db().await;
            let user = db.create_user("alice").await.unwrap();

            assert_eq!(user.name, "alice");
            assert_eq!(user.api_key.len(), 64);

            let found = db.get_user_by_api_key(&user.api_key).await.unwrap().unwrap();
            assert_eq!(found.id, user.id);
        }

        #[tokio::test]
        async fn test_duplicate_user_name_is_conflict() {
            let db = create_test_db().await;
            db.create_user("alice").await.unwrap();

            let err = db.create_user("alice").await.unwrap_err();
            assert!(err.is_conflict());
        }

        #[tokio::test]
        async fn test_unknown_api_key() {
            let db = create_test_db().await;
            assert!(db.get_user_by_api_key("nope").await.unwrap().is_none());
        }
    }

    mod feed_tests {
        use super::*;

        #[tokio::test]
        async fn test_create_feed_follows_owner() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;

            assert!(feed.last_fetched_at.is_none());

            let err = db.follow_feed(feed.user_id, feed.id).await.unwrap_err();
            assert!(err.is_conflict());
        }

        #[tokio::test]
        async fn test_duplicate_feed_url_is_conflict() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;

            let err = db
                .create_feed("Other", "https://test.com/rss", feed.user_id)
                .await
                .unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(db.get_all_feeds().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_create_feed_and_follow_returns_follow() {
            let db = create_test_db().await;
            let user = db.create_user("alice").await.unwrap();

            let (feed, follow) = db
                .create_feed_and_follow("A", "https://a.com/rss", user.id)
                .await
                .unwrap();

            assert_eq!(follow.feed_id, feed.id);
            assert_eq!(follow.user_id, user.id);
        }

        #[tokio::test]
        async fn test_feed_for_unknown_user_is_not_found() {
            let db = create_test_db().await;

            let err = db
                .create_feed_and_follow("A", "https://a.com/rss", Uuid::new_v4())
                .await
                .unwrap_err();

            assert!(err.is_not_found());
            assert!(db.get_all_feeds().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_get_nonexistent_feed() {
            let db = create_test_db().await;
            assert!(db.get_feed(Uuid::new_v4()).await.unwrap().is_none());
        }
    }

    mod follow_tests {
        use super::*;

        #[tokio::test]
        async fn test_follow_unknown_feed_is_not_found() {
            let db = create_test_db().await;
            let user = db.create_user("alice").await.unwrap();

            let err = db.follow_feed(user.id, Uuid::new_v4()).await.unwrap_err();
            assert!(err.is_not_found());
        }

        #[tokio::test]
        async fn test_list_follows_for_user() {
            let db = create_test_db().await;
            let alice = db.create_user("alice").await.unwrap();
            let bob = db.create_user("bob").await.unwrap();
            let a = db.create_feed("A", "https://a.com/rss", alice.id).await.unwrap();
            let b = db.create_feed("B", "https://b.com/rss", bob.id).await.unwrap();
            db.follow_feed(alice.id, b.id).await.unwrap();

            let follows = db.list_feed_follows(alice.id, 10, 0).await.unwrap();
            let feed_ids: Vec<Uuid> = follows.iter().map(|f| f.feed_id).collect();
            assert_eq!(feed_ids, vec![a.id, b.id]);

            let page = db.list_feed_follows(alice.id, 1, 1).await.unwrap();
            assert_eq!(page.len(), 1);
            assert_eq!(page[0].feed_id, b.id);

            assert_eq!(db.list_feed_follows(bob.id, 10, 0).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_delete_follow() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;
            let follows = db.list_feed_follows(feed.user_id, 10, 0).await.unwrap();

            db.delete_feed_follow(follows[0].id, feed.user_id).await.unwrap();

            assert!(db.list_feed_follows(feed.user_id, 10, 0).await.unwrap().is_empty());
            let err = db.delete_feed_follow(follows[0].id, feed.user_id).await.unwrap_err();
            assert!(err.is_not_found());
        }

        #[tokio::test]
        async fn test_cannot_delete_other_users_follow() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;
            let intruder = db.create_user("intruder").await.unwrap();
            let follows = db.list_feed_follows(feed.user_id, 10, 0).await.unwrap();

            let err = db.delete_feed_follow(follows[0].id, intruder.id).await.unwrap_err();

            assert!(err.is_not_found());
            assert_eq!(db.list_feed_follows(feed.user_id, 10, 0).await.unwrap().len(), 1);
        }
    }

    mod sync_feeds_tests {
        use super::*;

        fn create_feed_config(name: &str, url: &str, owner: &str) -> FeedConfig {
            FeedConfig {
                name: name.to_string(),
                url: url.to_string(),
                owner: owner.to_string(),
            }
        }

        #[tokio::test]
        async fn test_sync_creates_owners_and_feeds() {
            let db = create_test_db().await;
            let configs = vec![
                create_feed_config("Feed 1", "https://feed1.com/rss", "alice"),
                create_feed_config("Feed 2", "https://feed2.com/rss", "alice"),
                create_feed_config("Feed 3", "https://feed3.com/rss", "bob"),
            ];

            db.sync_feeds(&configs).await.unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            assert_eq!(feeds.len(), 3);

            let alice = db.get_user_by_name("alice").await.unwrap().unwrap();
            let bob = db.get_user_by_name("bob").await.unwrap().unwrap();
            assert_eq!(feeds.iter().filter(|f| f.user_id == alice.id).count(), 2);
            assert_eq!(feeds.iter().filter(|f| f.user_id == bob.id).count(), 1);
        }

        #[tokio::test]
        async fn test_sync_is_idempotent_and_updates_name() {
            let db = create_test_db().await;
            db.sync_feeds(&[create_feed_config("Original", "https://example.com/rss", "alice")])
                .await
                .unwrap();
            let alice = db.get_user_by_name("alice").await.unwrap().unwrap();

            db.sync_feeds(&[create_feed_config("Renamed", "https://example.com/rss", "alice")])
                .await
                .unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            assert_eq!(feeds.len(), 1);
            assert_eq!(feeds[0].name, "Renamed");

            let alice_again = db.get_user_by_name("alice").await.unwrap().unwrap();
            assert_eq!(alice.api_key, alice_again.api_key);
        }
    }

    mod staleness_tests {
        use super::*;

        #[tokio::test]
        async fn test_never_fetched_feeds_come_first() {
            let db = create_test_db().await;
            let fetched = create_test_feed(&db, "https://fetched.com/rss").await;
            let never = create_test_feed(&db, "https://never.com/rss").await;
            set_last_fetched_at(&db, fetched.id, Utc::now() - ChronoDuration::days(30)).await;

            let batch = db.get_next_feeds_to_fetch(10).await.unwrap();

            assert_eq!(batch.len(), 2);
            assert_eq!(batch[0].id, never.id);
            assert_eq!(batch[1].id, fetched.id);
        }

        #[tokio::test]
        async fn test_oldest_fetch_first() {
            let db = create_test_db().await;
            let now = Utc::now();
            let mut expected = Vec::new();
            for i in 0..3 {
                let feed = create_test_feed(&db, &format!("https://feed{}.com/rss", i)).await;
                set_last_fetched_at(&db, feed.id, now - ChronoDuration::hours(10 - i)).await;
                expected.push(feed.id);
            }
            let never = create_test_feed(&db, "https://never.com/rss").await;
            expected.insert(0, never.id);

            let batch = db.get_next_feeds_to_fetch(4).await.unwrap();
            let ids: Vec<Uuid> = batch.iter().map(|f| f.id).collect();
            assert_eq!(ids, expected);
            assert!(batch[0].last_fetched_at.is_none());
        }

        #[tokio::test]
        async fn test_batch_respects_limit() {
            let db = create_test_db().await;
            for i in 0..5 {
                create_test_feed(&db, &format!("https://feed{}.com/rss", i)).await;
            }

            assert_eq!(db.get_next_feeds_to_fetch(3).await.unwrap().len(), 3);
            assert_eq!(db.get_next_feeds_to_fetch(10).await.unwrap().len(), 5);
            assert!(db.get_next_feeds_to_fetch(0).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_mark_fetched_moves_feed_to_back() {
            let db = create_test_db().await;
            let first = create_test_feed(&db, "https://first.com/rss").await;
            let second = create_test_feed(&db, "https://second.com/rss").await;

            db.mark_feed_fetched(first.id).await.unwrap();

            let batch = db.get_next_feeds_to_fetch(2).await.unwrap();
            assert_eq!(batch[0].id, second.id);
            assert_eq!(batch[1].id, first.id);

            let first = db.get_feed(first.id).await.unwrap().unwrap();
            assert!(first.last_fetched_at.is_some());
        }

        #[tokio::test]
        async fn test_mark_unknown_feed_is_not_found() {
            let db = create_test_db().await;
            let err = db.mark_feed_fetched(Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, StoreError::NotFound));
        }
    }

    mod post_tests {
        use super::*;

        #[tokio::test]
        async fn test_create_post() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;
            let published = Utc::now() - ChronoDuration::days(1);

            let post = db
                .create_post(&create_post_params(feed.id, "https://test.com/a", published))
                .await
                .unwrap();

            assert_eq!(post.feed_id, feed.id);
            assert_eq!(post.url, "https://test.com/a");
            assert_eq!(post.published_at, published);
        }

        #[tokio::test]
        async fn test_duplicate_post_is_conflict() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;
            let params = create_post_params(feed.id, "https://test.com/a", Utc::now());

            db.create_post(&params).await.unwrap();
            let err = db.create_post(&params).await.unwrap_err();

            assert!(err.is_conflict());
            assert_eq!(db.get_post_count_for_feed(feed.id).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_same_url_different_feeds() {
            let db = create_test_db().await;
            let feed1 = create_test_feed(&db, "https://feed1.com/rss").await;
            let feed2 = create_test_feed(&db, "https://feed2.com/rss").await;

            db.create_post(&create_post_params(feed1.id, "https://a.com", Utc::now()))
                .await
                .unwrap();
            db.create_post(&create_post_params(feed2.id, "https://a.com", Utc::now()))
                .await
                .unwrap();

            assert_eq!(db.get_post_count_for_feed(feed1.id).await.unwrap(), 1);
            assert_eq!(db.get_post_count_for_feed(feed2.id).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_posts_for_user_ordered_by_recency() {
            let db = create_test_db().await;
            let feed = create_test_feed(&db, "https://test.com/rss").await;
            let now = Utc::now();
            for i in 0..11 {
                db.create_post(&create_post_params(
                    feed.id,
                    &format!("https://test.com/{}", i),
                    now - ChronoDuration::hours(i),
                ))
                .await
                .unwrap();
            }

            let posts = db.get_posts_for_user(feed.user_id, 10).await.unwrap();

            assert_eq!(posts.len(), 10);
            assert_eq!(posts[0].url, "https://test.com/0");
            assert_eq!(posts[9].url, "https://test.com/9");
        }

        #[tokio::test]
        async fn test_posts_only_from_followed_feeds() {
            let db = create_test_db().await;
            let alice = db.create_user("alice").await.unwrap();
            let bob = db.create_user("bob").await.unwrap();
            let alice_feed = db.create_feed("A", "https://a.com/rss", alice.id).await.unwrap();
            let bob_feed = db.create_feed("B", "https://b.com/rss", bob.id).await.unwrap();

            db.create_post(&create_post_params(alice_feed.id, "https://a.com/1", Utc::now()))
                .await
                .unwrap();
            db.create_post(&create_post_params(bob_feed.id, "https://b.com/1", Utc::now()))
                .await
                .unwrap();

            let posts = db.get_posts_for_user(alice.id, 10).await.unwrap();
            assert_eq!(posts.len(), 1);
            assert_eq!(posts[0].feed_id, alice_feed.id);

            db.follow_feed(alice.id, bob_feed.id).await.unwrap();
            assert_eq!(db.get_posts_for_user(alice.id, 10).await.unwrap().len(), 2);
        }
    }
}
