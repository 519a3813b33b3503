use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::{Database, Feed, FeedFollow, Post, StoreError, User};
use crate::scheduler::Scheduler;

const DEFAULT_PAGE_LIMIT: u32 = 10;
const MAX_PAGE_LIMIT: u32 = 100;

pub struct AppState {
    pub db: Arc<Database>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/readiness", get(readiness))
        .route("/v1/users", post(create_user).get(get_user))
        .route("/v1/feeds", post(create_feed).get(list_feeds))
        .route(
            "/v1/feed_follows",
            post(create_feed_follow).get(list_feed_follows),
        )
        .route("/v1/feed_follows/:id", delete(delete_feed_follow))
        .route("/v1/posts", get(list_posts))
        .route("/v1/refresh", post(refresh))
        .route("/v1/refresh/status", get(refresh_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub enum AppError {
    BadRequest(String),
    Forbidden,
    NotFound,
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            AppError::Conflict(message) => (StatusCode::CONFLICT, message),
            AppError::Internal(err) => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => AppError::Conflict(err.to_string()),
            StoreError::NotFound => AppError::NotFound,
            StoreError::Database(e) => AppError::Internal(e.into()),
        }
    }
}

/// Extracts the key from an `Authorization: ApiKey <key>` header. The scheme
/// is case-insensitive.
pub fn parse_api_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, key) = value.split_once(' ')?;
    let key = key.trim();
    if !scheme.eq_ignore_ascii_case("ApiKey") || key.is_empty() {
        return None;
    }
    Some(key)
}

async fn authenticate(db: &Database, headers: &HeaderMap) -> Result<User, AppError> {
    let api_key = parse_api_key(headers).ok_or(AppError::Forbidden)?;
    db.get_user_by_api_key(api_key)
        .await?
        .ok_or(AppError::Forbidden)
}

fn parse_limit(raw: Option<&str>) -> Result<u32, AppError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_PAGE_LIMIT);
    };
    match raw.parse::<u32>() {
        Ok(limit) if (1..=MAX_PAGE_LIMIT).contains(&limit) => Ok(limit),
        _ => Err(AppError::BadRequest(format!("invalid limit: {:?}", raw))),
    }
}

fn parse_offset(raw: Option<&str>) -> Result<u32, AppError> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    raw.parse::<u32>()
        .map_err(|_| AppError::BadRequest(format!("invalid offset: {:?}", raw)))
}

fn required(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
pub struct Readiness {
    pub status: &'static str,
}

pub async fn readiness() -> Json<Readiness> {
    Json(Readiness { status: "ok" })
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    required("name", &request.name)?;

    let user = state.db.create_user(request.name.trim()).await?;
    info!(user = %user.name, "Created user");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<User>, AppError> {
    let user = authenticate(&state.db, &headers).await?;
    Ok(Json(user))
}

#[derive(Deserialize)]
pub struct CreateFeedRequest {
    pub name: String,
    pub url: String,
}

#[derive(Serialize)]
pub struct CreatedFeed {
    pub feed: Feed,
    pub feed_follow: FeedFollow,
}

pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateFeedRequest>,
) -> Result<(StatusCode, Json<CreatedFeed>), AppError> {
    let user = authenticate(&state.db, &headers).await?;
    required("name", &request.name)?;
    let url = reqwest::Url::parse(request.url.trim())
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .ok_or_else(|| AppError::BadRequest(format!("invalid url: {:?}", request.url)))?;

    let (feed, feed_follow) = state
        .db
        .create_feed_and_follow(request.name.trim(), url.as_str(), user.id)
        .await?;
    info!(feed_id = %feed.id, url = %feed.url, user = %user.name, "Created feed");
    Ok((StatusCode::CREATED, Json(CreatedFeed { feed, feed_follow })))
}

pub async fn list_feeds(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Feed>>, AppError> {
    let feeds = state.db.get_all_feeds().await?;
    Ok(Json(feeds))
}

#[derive(Deserialize)]
pub struct CreateFeedFollowRequest {
    pub feed_id: Uuid,
}

pub async fn create_feed_follow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateFeedFollowRequest>,
) -> Result<(StatusCode, Json<FeedFollow>), AppError> {
    let user = authenticate(&state.db, &headers).await?;

    let follow = state.db.follow_feed(user.id, request.feed_id).await?;
    Ok((StatusCode::CREATED, Json(follow)))
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

pub async fn list_feed_follows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<FeedFollow>>, AppError> {
    let user = authenticate(&state.db, &headers).await?;
    let limit = parse_limit(query.limit.as_deref())?;
    let offset = parse_offset(query.offset.as_deref())?;

    let follows = state.db.list_feed_follows(user.id, limit, offset).await?;
    Ok(Json(follows))
}

pub async fn delete_feed_follow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(follow_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let user = authenticate(&state.db, &headers).await?;

    state.db.delete_feed_follow(follow_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PostsQuery {
    pub limit: Option<String>,
}

pub async fn list_posts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PostsQuery>,
) -> Result<Json<Vec<Post>>, AppError> {
    let user = authenticate(&state.db, &headers).await?;
    let limit = parse_limit(query.limit.as_deref())?;

    let posts = state.db.get_posts_for_user(user.id, limit).await?;
    Ok(Json(posts))
}

#[derive(Serialize)]
pub struct RefreshStarted {
    pub started: bool,
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.scheduler.is_running().await {
        return (StatusCode::ACCEPTED, Json(RefreshStarted { started: false }));
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.run_cycle().await;
    });

    (StatusCode::ACCEPTED, Json(RefreshStarted { started: true }))
}

#[derive(Serialize)]
pub struct RefreshStatus {
    pub running: bool,
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> Json<RefreshStatus> {
    Json(RefreshStatus {
        running: state.scheduler.is_running().await,
    })
}
