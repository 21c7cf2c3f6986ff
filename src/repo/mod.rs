use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use chrono::Duration;

use crate::models::*;

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("forbidden")] Forbidden,
    #[error("conflict")] Conflict,
    #[error("empty content")] EmptyContent,
    #[error("invalid operation: {0}")] InvalidOperation(&'static str),
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

pub const FEED_LIMIT: usize = 30;
pub const TRENDING_LIMIT: usize = 12;
pub const RECOMMENDED_LIMIT: usize = 5;
pub const SEARCH_LIMIT: usize = 20;
pub const NOTIFICATION_LIMIT: usize = 50;

pub fn story_lifetime() -> Duration { Duration::hours(24) }
pub fn trending_window() -> Duration { Duration::days(7) }

/// The fixed set of post selections the feed composer knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// Posts by the viewer and everyone they follow.
    Network,
    /// Posts by one author.
    Author(Id),
    /// Posts inside the trending window, most liked first.
    Trending,
    /// A single post.
    Single(Id),
}

impl FeedScope {
    pub fn limit(&self) -> Option<usize> {
        match self {
            FeedScope::Network => Some(FEED_LIMIT),
            FeedScope::Trending => Some(TRENDING_LIMIT),
            FeedScope::Author(_) => None,
            FeedScope::Single(_) => Some(1),
        }
    }
}

/// Trims and rejects blank text.
pub(crate) fn non_blank(text: &str) -> Option<String> {
    let t = text.trim();
    if t.is_empty() { None } else { Some(t.to_string()) }
}

/// Username given to an identity that acts before it has set one.
pub(crate) fn placeholder_username(id: Id) -> String {
    format!("user{id}")
}

pub(crate) fn clip_bio(bio: &str) -> String {
    bio.trim().chars().take(BIO_MAX_CHARS).collect()
}

/// Runs a toggle once more when the store reports a serialization conflict.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> RepoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RepoResult<T>>,
{
    match op().await {
        Err(RepoError::Conflict) => {
            tracing::warn!("toggle hit a write conflict, retrying once");
            op().await
        }
        other => other,
    }
}

/// Mirror of the identity collaborator's accounts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn upsert_user(&self, new: NewUser) -> RepoResult<User>;
    /// Returns the account for an identity-issued id, creating it with a
    /// placeholder username on first sight.
    async fn ensure_user(&self, id: Id) -> RepoResult<User>;
    /// Edits the account for an identity-issued id, creating it if needed.
    /// A username held by another account is a `Conflict`.
    async fn update_profile(&self, id: Id, update: ProfileUpdate) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn find_user_by_username(&self, username: &str) -> RepoResult<User>;
    async fn search_users(&self, viewer: Id, query: &str) -> RepoResult<Vec<UserSummary>>;
    async fn profile(&self, viewer: Id, username: &str) -> RepoResult<Profile>;
}

#[async_trait]
pub trait GraphRepo: Send + Sync {
    async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    async fn toggle_follow(&self, follower: Id, followee: Id) -> RepoResult<FollowToggle>;
    async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    async fn follower_count(&self, user: Id) -> RepoResult<i64>;
    async fn following_count(&self, user: Id) -> RepoResult<i64>;
    async fn followee_set(&self, user: Id) -> RepoResult<HashSet<Id>>;
    /// `NotFound` when `user` is not in the directory.
    async fn list_followers(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>>;
    async fn list_following(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>>;
}

#[async_trait]
pub trait ReactionRepo: Send + Sync {
    async fn toggle_like(&self, user: Id, post: Id) -> RepoResult<LikeToggle>;
    async fn like_count(&self, post: Id) -> RepoResult<i64>;
    async fn add_comment(&self, user: Id, post: Id, new: NewComment) -> RepoResult<Comment>;
    async fn delete_comment(&self, actor: Id, comment: Id) -> RepoResult<bool>;
    /// Oldest first; `NotFound` when the post does not exist.
    async fn list_comments(&self, post: Id) -> RepoResult<Vec<Comment>>;
}

#[async_trait]
pub trait StoryRepo: Send + Sync {
    /// `None` when the text is blank; nothing is stored in that case.
    async fn create_story(&self, author: Id, new: NewStory) -> RepoResult<Option<Story>>;
    async fn list_active_stories(&self, viewer: Id) -> RepoResult<Vec<StoryCard>>;
    async fn view_story(&self, viewer: Id, story: Id) -> RepoResult<StoryViewing>;
    /// Only the story's author may read its view count.
    async fn story_view_count(&self, actor: Id, story: Id) -> RepoResult<i64>;
    async fn delete_story(&self, actor: Id, story: Id) -> RepoResult<bool>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Newest first, capped; marks every notification of `recipient` read.
    async fn list_notifications(&self, recipient: Id) -> RepoResult<Vec<Notification>>;
    async fn unread_count(&self, recipient: Id) -> RepoResult<i64>;
}

#[async_trait]
pub trait FeedRepo: Send + Sync {
    async fn create_post(&self, author: Id, new: NewPost) -> RepoResult<EnrichedPost>;
    async fn delete_post(&self, actor: Id, post: Id) -> RepoResult<DeletedPost>;
    async fn get_post(&self, viewer: Id, post: Id) -> RepoResult<EnrichedPost>;
    async fn compose(&self, viewer: Id, scope: FeedScope) -> RepoResult<Vec<EnrichedPost>>;
    async fn recommended_users(&self, viewer: Id) -> RepoResult<Vec<UserSummary>>;

    async fn compose_feed(&self, viewer: Id) -> RepoResult<Vec<EnrichedPost>> {
        self.compose(viewer, FeedScope::Network).await
    }
    async fn trending(&self, viewer: Id) -> RepoResult<Vec<EnrichedPost>> {
        self.compose(viewer, FeedScope::Trending).await
    }
}

pub trait Repo: UserDirectory + GraphRepo + ReactionRepo + StoryRepo + NotificationRepo + FeedRepo {}

impl<T> Repo for T where T: UserDirectory + GraphRepo + ReactionRepo + StoryRepo + NotificationRepo + FeedRepo {}
