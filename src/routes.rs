use std::sync::Arc;
use actix_web::{web, HttpResponse};
use actix_multipart::Multipart;
use futures_util::TryStreamExt as _;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;
use crate::storage::{self, MediaStore, MediaStoreError, Rejection};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/posts").route(web::post().to(create_post)))
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(web::resource("/posts/{id}/like").route(web::post().to(toggle_like)))
            .service(
                web::resource("/posts/{id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(add_comment)),
            )
            .service(web::resource("/comments/{id}").route(web::delete().to(delete_comment)))
            .service(
                web::resource("/me")
                    .route(web::get().to(get_me))
                    .route(web::put().to(update_me)),
            )
            .service(web::resource("/users/search").route(web::get().to(search_users)))
            .service(web::resource("/users/{id}/follow").route(web::post().to(toggle_follow)))
            .service(web::resource("/users/{id}/followers").route(web::get().to(list_followers)))
            .service(web::resource("/users/{id}/following").route(web::get().to(list_following)))
            .service(web::resource("/profiles/{username}").route(web::get().to(get_profile)))
            .service(web::resource("/feed").route(web::get().to(feed)))
            .service(web::resource("/feed/trending").route(web::get().to(trending)))
            .service(web::resource("/feed/recommended").route(web::get().to(recommended)))
            .service(
                web::resource("/stories")
                    .route(web::get().to(list_stories))
                    .route(web::post().to(create_story)),
            )
            .service(
                web::resource("/stories/{id}")
                    .route(web::get().to(view_story))
                    .route(web::delete().to(delete_story)),
            )
            .service(web::resource("/stories/{id}/views").route(web::get().to(story_views)))
            .service(web::resource("/notifications").route(web::get().to(list_notifications)))
            .service(web::resource("/notifications/unread-count").route(web::get().to(unread_count)))
            .service(web::resource("/media").route(web::post().to(upload_media)))
            // public so <img src> and <video src> work without a bearer header
            .service(web::resource("/media/{reference}").route(web::get().to(get_media))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub media_store: Arc<dyn MediaStore>,
    pub rate_limiter: Option<RateLimiterFacade>,
}

impl AppState {
    fn guard(&self, allowed: impl FnOnce(&RateLimiterFacade) -> bool) -> Result<(), ApiError> {
        match &self.rate_limiter {
            Some(rl) if !allowed(rl) => Err(ApiError::TooManyRequests),
            _ => Ok(()),
        }
    }

    /// Mirrors the authenticated identity into the user directory so its
    /// writes reference an existing account.
    async fn actor(&self, auth: &Auth) -> Result<Id, ApiError> {
        self.repo.ensure_user(auth.user_id).await?;
        Ok(auth.user_id)
    }
}

// ---------------- account ----------------

#[utoipa::path(
    get,
    path = "/api/v1/me",
    responses((status = 200, description = "The caller's account, created on first use", body = User))
)]
pub async fn get_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.ensure_user(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[utoipa::path(
    put,
    path = "/api/v1/me",
    request_body = ProfileUpdate,
    responses(
        (status = 200, description = "Profile updated", body = User),
        (status = 400, description = "Blank username"),
        (status = 409, description = "Username taken")
    )
)]
pub async fn update_me(auth: Auth, data: web::Data<AppState>, payload: web::Json<ProfileUpdate>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.update_profile(auth.user_id, payload.into_inner()).await?;
    log::info!("profile updated for user {}", user.id);
    Ok(HttpResponse::Ok().json(user))
}

// ---------------- posts ----------------

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = EnrichedPost),
        (status = 400, description = "Empty post"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPost>) -> Result<HttpResponse, ApiError> {
    data.guard(|rl| rl.allow_post(auth.user_id))?;
    let author = data.actor(&auth).await?;
    let post = data.repo.create_post(author, payload.into_inner()).await?;
    metrics::increment_counter!("pulse_posts_total");
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = EnrichedPost),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post deleted", body = DeletedPost),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn delete_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let deleted = data.repo.delete_post(auth.user_id, path.into_inner()).await?;
    // blob cleanup is best effort; the post is already gone
    for media in &deleted.freed_media {
        if let Err(e) = data.media_store.delete(&media.reference).await {
            log::warn!("failed to release media {}: {e}", media.reference);
        }
    }
    Ok(HttpResponse::Ok().json(deleted))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Like toggled", body = LikeToggle),
        (status = 404, description = "Post not found"),
        (status = 409, description = "Concurrent update, retry")
    )
)]
pub async fn toggle_like(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let user = data.actor(&auth).await?;
    let toggle = data.repo.toggle_like(user, path.into_inner()).await?;
    if toggle.liked {
        metrics::increment_counter!("pulse_likes_total");
    }
    Ok(HttpResponse::Ok().json(toggle))
}

// ---------------- comments ----------------

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/comments",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Comments, oldest first", body = [Comment]),
        (status = 404, description = "Post not found")
    )
)]
pub async fn list_comments(_auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let comments = data.repo.list_comments(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(comments))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/comments",
    params(("id" = Id, Path, description = "Post id")),
    request_body = NewComment,
    responses(
        (status = 201, description = "Comment added", body = Comment),
        (status = 400, description = "Empty comment"),
        (status = 404, description = "Post not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn add_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    data.guard(|rl| rl.allow_comment(auth.user_id))?;
    let author = data.actor(&auth).await?;
    let comment = data.repo.add_comment(author, path.into_inner(), payload.into_inner()).await?;
    metrics::increment_counter!("pulse_comments_total");
    Ok(HttpResponse::Created().json(comment))
}

#[utoipa::path(
    delete,
    path = "/api/v1/comments/{id}",
    params(("id" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Comment deleted", body = Deleted),
        (status = 403, description = "Neither comment nor post author"),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn delete_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let deleted = data.repo.delete_comment(auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(Deleted { deleted }))
}

// ---------------- social graph ----------------

#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/follow",
    params(("id" = Id, Path, description = "User to follow or unfollow")),
    responses(
        (status = 200, description = "Follow toggled", body = FollowToggle),
        (status = 400, description = "Cannot follow yourself"),
        (status = 404, description = "User not found")
    )
)]
pub async fn toggle_follow(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let follower = data.actor(&auth).await?;
    let toggle = data.repo.toggle_follow(follower, path.into_inner()).await?;
    if toggle.following {
        metrics::increment_counter!("pulse_follows_total");
    }
    Ok(HttpResponse::Ok().json(toggle))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/followers",
    params(("id" = Id, Path, description = "User id")),
    responses(
        (status = 200, description = "Followers, newest first", body = [UserSummary]),
        (status = 404, description = "User not found")
    )
)]
pub async fn list_followers(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let users = data.repo.list_followers(auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(users))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/following",
    params(("id" = Id, Path, description = "User id")),
    responses(
        (status = 200, description = "Followed users, newest first", body = [UserSummary]),
        (status = 404, description = "User not found")
    )
)]
pub async fn list_following(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let users = data.repo.list_following(auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(users))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// Case-insensitive username fragment.
    pub q: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/users/search",
    params(SearchQuery),
    responses((status = 200, description = "Matching users", body = [UserSummary]))
)]
pub async fn search_users(auth: Auth, data: web::Data<AppState>, query: web::Query<SearchQuery>) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner().q.unwrap_or_default();
    let users = data.repo.search_users(auth.user_id, &q).await?;
    Ok(HttpResponse::Ok().json(users))
}

#[utoipa::path(
    get,
    path = "/api/v1/profiles/{username}",
    params(("username" = String, Path, description = "Username")),
    responses(
        (status = 200, description = "Profile", body = Profile),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_profile(auth: Auth, data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let profile = data.repo.profile(auth.user_id, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

// ---------------- feed ----------------

#[utoipa::path(
    get,
    path = "/api/v1/feed",
    responses((status = 200, description = "Network feed, newest first", body = [EnrichedPost]))
)]
pub async fn feed(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let posts = data.repo.compose_feed(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/v1/feed/trending",
    responses((status = 200, description = "Most liked recent posts", body = [EnrichedPost]))
)]
pub async fn trending(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let posts = data.repo.trending(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/v1/feed/recommended",
    responses((status = 200, description = "Users the viewer does not follow yet", body = [UserSummary]))
)]
pub async fn recommended(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let users = data.repo.recommended_users(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(users))
}

// ---------------- stories ----------------

#[utoipa::path(
    post,
    path = "/api/v1/stories",
    request_body = NewStory,
    responses(
        (status = 201, description = "Story created", body = Story),
        (status = 204, description = "Blank story ignored"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_story(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewStory>) -> Result<HttpResponse, ApiError> {
    data.guard(|rl| rl.allow_story(auth.user_id))?;
    let author = data.actor(&auth).await?;
    match data.repo.create_story(author, payload.into_inner()).await? {
        Some(story) => Ok(HttpResponse::Created().json(story)),
        None => Ok(HttpResponse::NoContent().finish()),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/stories",
    responses((status = 200, description = "Newest active story per author, unviewed first", body = [StoryCard]))
)]
pub async fn list_stories(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let cards = data.repo.list_active_stories(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(cards))
}

#[utoipa::path(
    get,
    path = "/api/v1/stories/{id}",
    params(("id" = Id, Path, description = "Story id")),
    responses(
        (status = 200, description = "Story marked viewed", body = StoryViewing),
        (status = 404, description = "Missing or expired")
    )
)]
pub async fn view_story(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let viewer = data.actor(&auth).await?;
    let viewing = data.repo.view_story(viewer, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(viewing))
}

#[utoipa::path(
    delete,
    path = "/api/v1/stories/{id}",
    params(("id" = Id, Path, description = "Story id")),
    responses(
        (status = 200, description = "Story deleted", body = Deleted),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Story not found")
    )
)]
pub async fn delete_story(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let deleted = data.repo.delete_story(auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(Deleted { deleted }))
}

#[utoipa::path(
    get,
    path = "/api/v1/stories/{id}/views",
    params(("id" = Id, Path, description = "Story id")),
    responses(
        (status = 200, description = "Distinct viewers", body = StoryViews),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Story not found")
    )
)]
pub async fn story_views(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let story_id = path.into_inner();
    let views = data.repo.story_view_count(auth.user_id, story_id).await?;
    Ok(HttpResponse::Ok().json(StoryViews { story_id, views }))
}

// ---------------- notifications ----------------

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    responses((status = 200, description = "Newest notifications; all are marked read", body = [Notification]))
)]
pub async fn list_notifications(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let notes = data.repo.list_notifications(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(notes))
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications/unread-count",
    responses((status = 200, description = "Unread notifications", body = UnreadCount))
)]
pub async fn unread_count(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let count = data.repo.unread_count(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(UnreadCount { count }))
}

// ---------------- media ----------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MediaUploadResponse {
    pub reference: String,
    pub kind: MediaKind,
    pub mime: String,
    pub size: usize,
    pub duplicate: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/media",
    request_body(content = String, description = "multipart/form-data with a `file` field", content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Stored", body = MediaUploadResponse),
        (status = 200, description = "Already stored", body = MediaUploadResponse),
        (status = 400, description = "No file field"),
        (status = 413, description = "Too large for its kind"),
        (status = 415, description = "Unsupported media type")
    )
)]
pub async fn upload_media(auth: Auth, data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    use actix_web::http::StatusCode;
    data.guard(|rl| rl.allow_media(auth.user_id))?;
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::BadRequest("malformed multipart body".into())
    })? {
        if field.content_disposition().get_name() != Some("file") {
            continue;
        }
        let mut field_stream = field;
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            if bytes.len() + chunk.len() > storage::UPLOAD_LIMIT {
                return Err(ApiError::PayloadTooLarge(format!("limit is {} bytes", storage::UPLOAD_LIMIT)));
            }
            bytes.extend_from_slice(&chunk);
        }
        let (kind, mime) = storage::classify(&bytes).map_err(|r| match r {
            Rejection::UnsupportedType(mime) => ApiError::UnsupportedMedia(mime),
            Rejection::TooLarge { kind, limit } => ApiError::PayloadTooLarge(format!("{kind} limit is {limit} bytes")),
        })?;
        let reference = storage::reference_for(&bytes);
        let (status, duplicate) = match data.media_store.save(&reference, &mime, &bytes).await {
            Ok(()) => (StatusCode::CREATED, false),
            Err(MediaStoreError::Duplicate) => (StatusCode::OK, true),
            Err(e) => {
                log::error!("media_store save error: {e}");
                return Err(ApiError::Internal);
            }
        };
        let resp = MediaUploadResponse { reference, kind, mime, size: bytes.len(), duplicate };
        return Ok(HttpResponse::build(status).json(resp));
    }
    Err(ApiError::BadRequest("missing file field".into()))
}

#[utoipa::path(
    get,
    path = "/api/v1/media/{reference}",
    params(("reference" = String, Path, description = "SHA-256 reference")),
    responses(
        (status = 200, description = "Media bytes"),
        (status = 404, description = "Unknown reference")
    )
)]
pub async fn get_media(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let reference = path.into_inner();
    match data.media_store.load(&reference).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok()
            .insert_header(("Content-Type", mime))
            .insert_header(("Cache-Control", "public, max-age=31536000, immutable"))
            .body(bytes)),
        Err(MediaStoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("media_store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}
