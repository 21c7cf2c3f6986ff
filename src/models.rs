use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

/// Hard cap on attachments per post.
pub const MAX_ATTACHMENTS: usize = 4;
pub const DEFAULT_STORY_COLOR: &str = "#6366f1";
pub const DEFAULT_AVATAR_COLOR: &str = "#6366f1";
pub const BIO_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub bio: String,
    pub avatar_color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub username: String,
    pub bio: Option<String>,
    pub avatar_color: Option<String>,
}

/// Profile fields the owner may change; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub bio: Option<String>,
    pub avatar_color: Option<String>,
}

/// A user as shown in lists (recommendations, search, follower lists).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct UserSummary {
    pub id: Id,
    pub username: String,
    pub avatar_color: String,
    pub followers_count: i64,
    pub is_following: bool, // viewer follows this user
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Profile {
    pub user: User,
    pub followers_count: i64,
    pub following_count: i64,
    pub is_following: bool,
    pub posts: Vec<EnrichedPost>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("unknown media kind '{other}'")),
        }
    }
}

/// Reference handed over by the media collaborator once an upload is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MediaRef {
    pub reference: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MediaAttachment {
    pub id: Id,
    pub post_id: Id,
    pub reference: String,
    pub kind: MediaKind,
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub author_id: Id,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

/// A post joined with its author, media, counters and viewer flags.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnrichedPost {
    pub id: Id,
    pub author_id: Id,
    pub author_username: String,
    pub author_avatar_color: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub media: Vec<MediaAttachment>,
    pub like_count: i64,
    pub comment_count: i64,
    pub viewer_has_liked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FollowToggle {
    pub following: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LikeToggle {
    pub liked: bool,
    pub like_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub author_id: Id,
    pub author_username: String,
    pub author_avatar_color: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewComment {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Story {
    pub id: Id,
    pub author_id: Id,
    pub author_username: String,
    pub author_avatar_color: String,
    pub content: String,
    pub bg_color: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewStory {
    #[serde(default)]
    pub content: String,
    pub bg_color: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct StoryViews {
    pub story_id: Id,
    pub views: i64,
}

/// One author's representative story in the story tray.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoryCard {
    pub story: Story,
    pub viewed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StoryViewing {
    pub story: Story,
    pub next_story_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Like => "like",
            NotificationKind::Comment => "comment",
            NotificationKind::Follow => "follow",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(NotificationKind::Like),
            "comment" => Ok(NotificationKind::Comment),
            "follow" => Ok(NotificationKind::Follow),
            other => Err(format!("unknown notification kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: Id,
    pub recipient_id: Id,
    pub actor_id: Id,
    pub actor_username: String,
    pub actor_avatar_color: String,
    pub kind: NotificationKind,
    pub target_post_id: Option<Id>, // None once the target post is deleted
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct Deleted {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeletedPost {
    pub deleted: bool,
    /// References no longer attached to any post; the caller releases them.
    pub freed_media: Vec<MediaRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct UnreadCount {
    pub count: i64,
}
