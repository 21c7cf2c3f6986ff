//! PostgreSQL backend.
//!
//! Toggles take a transaction-scoped advisory lock keyed on the (actor, target)
//! pair before reading, so two racing toggles on the same pair run one after
//! the other while toggles on different pairs never wait on each other.
//! Feed reads run in a repeatable-read snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};
use tracing::{debug, instrument};

use super::*;
use crate::clock::{Clock, SystemClock};

fn db_err(e: sqlx::Error) -> RepoError {
    if matches!(e, sqlx::Error::RowNotFound) {
        return RepoError::NotFound;
    }
    if let Some(code) = e.as_database_error().and_then(|d| d.code()) {
        match code.as_ref() {
            // serialization_failure, deadlock_detected
            "40001" | "40P01" => return RepoError::Conflict,
            // unique_violation: a username taken by another account
            "23505" => return RepoError::Conflict,
            // foreign_key_violation: the referenced user or post is gone
            "23503" => return RepoError::NotFound,
            _ => {}
        }
    }
    RepoError::Internal(e.to_string())
}

#[derive(sqlx::FromRow)]
struct MediaRow {
    id: Id,
    post_id: Id,
    reference: String,
    kind: String,
    position: i32,
}

impl TryFrom<MediaRow> for MediaAttachment {
    type Error = RepoError;

    fn try_from(r: MediaRow) -> Result<Self, Self::Error> {
        Ok(MediaAttachment {
            id: r.id,
            post_id: r.post_id,
            reference: r.reference,
            kind: r.kind.parse().map_err(RepoError::Internal)?,
            position: r.position,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Id,
    author_id: Id,
    author_username: String,
    author_avatar_color: String,
    content: String,
    created_at: DateTime<Utc>,
    like_count: i64,
    comment_count: i64,
    viewer_has_liked: bool,
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Id,
    recipient_id: Id,
    actor_id: Id,
    actor_username: String,
    actor_avatar_color: String,
    kind: String,
    target_post_id: Option<Id>,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = RepoError;

    fn try_from(r: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: r.id,
            recipient_id: r.recipient_id,
            actor_id: r.actor_id,
            actor_username: r.actor_username,
            actor_avatar_color: r.actor_avatar_color,
            kind: r.kind.parse().map_err(RepoError::Internal)?,
            target_post_id: r.target_post_id,
            is_read: r.is_read,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StoryCardRow {
    #[sqlx(flatten)]
    story: Story,
    viewed: bool,
}

macro_rules! enriched_posts {
    ($tail:literal) => {
        concat!(
            "SELECT p.id, p.author_id, u.username AS author_username, u.avatar_color AS author_avatar_color, \
                    p.content, p.created_at, \
                    (SELECT COUNT(*) FROM likes l WHERE l.post_id = p.id) AS like_count, \
                    (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id) AS comment_count, \
                    EXISTS(SELECT 1 FROM likes l WHERE l.post_id = p.id AND l.user_id = $1) AS viewer_has_liked \
             FROM posts p JOIN users u ON u.id = p.author_id ",
            $tail
        )
    };
}

const NETWORK_POSTS: &str = enriched_posts!(
    "WHERE p.author_id = $1 OR p.author_id IN (SELECT followee_id FROM followers WHERE follower_id = $1) \
     ORDER BY p.created_at DESC, p.id DESC LIMIT 30"
);
const AUTHOR_POSTS: &str = enriched_posts!("WHERE p.author_id = $2 ORDER BY p.created_at DESC, p.id DESC");
const TRENDING_POSTS: &str = enriched_posts!(
    "WHERE p.created_at > $2 ORDER BY like_count DESC, p.created_at DESC, p.id DESC LIMIT 12"
);
const SINGLE_POST: &str = enriched_posts!("WHERE p.id = $2");

macro_rules! user_summaries {
    ($tail:literal) => {
        concat!(
            "SELECT u.id, u.username, u.avatar_color, \
                    (SELECT COUNT(*) FROM followers f WHERE f.followee_id = u.id) AS followers_count, \
                    EXISTS(SELECT 1 FROM followers f WHERE f.follower_id = $1 AND f.followee_id = u.id) AS is_following ",
            $tail
        )
    };
}

const STORY_COLUMNS: &str = "s.id, s.author_id, u.username AS author_username, u.avatar_color AS author_avatar_color, \
                             s.content, s.bg_color, s.created_at, s.expires_at";

/// Serializes writers on one (kind, a, b) key until the transaction ends.
async fn lock_pair(conn: &mut PgConnection, kind: &str, a: Id, b: Id) -> RepoResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("{kind}:{a}:{b}"))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Notification fan-out inside the caller's transaction; an error here rolls
/// the triggering action back with it.
async fn notify(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    recipient: Id,
    actor: Id,
    kind: NotificationKind,
    target_post_id: Option<Id>,
) -> RepoResult<()> {
    if recipient == actor {
        return Ok(());
    }
    let sql = match kind {
        NotificationKind::Like => {
            "INSERT INTO notifications (recipient_id, actor_id, kind, target_post_id, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (recipient_id, actor_id, target_post_id) WHERE kind = 'like' AND NOT is_read DO NOTHING"
        }
        NotificationKind::Comment | NotificationKind::Follow => {
            "INSERT INTO notifications (recipient_id, actor_id, kind, target_post_id, created_at) \
             VALUES ($1, $2, $3, $4, $5)"
        }
    };
    let inserted = sqlx::query(sql)
        .bind(recipient)
        .bind(actor)
        .bind(kind.as_str())
        .bind(target_post_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    if inserted > 0 {
        metrics::increment_counter!("pulse_notifications_total", "kind" => kind.as_str());
    }
    Ok(())
}

/// Keeps `users_id_seq` ahead of ids inserted explicitly by the identity mirror.
async fn sync_user_sequence(conn: &mut PgConnection) -> RepoResult<()> {
    sqlx::query("SELECT setval(pg_get_serial_sequence('users', 'id'), GREATEST(MAX(id), 1)) FROM users")
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn exists(conn: &mut PgConnection, sql: &str, id: Id) -> RepoResult<bool> {
    sqlx::query_scalar::<_, bool>(sql).bind(id).fetch_one(&mut *conn).await.map_err(db_err)
}

const USER_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)";
const POST_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)";
const USER_COLUMNS: &str = "id, username, bio, avatar_color, created_at";

async fn begin_snapshot(pool: &Pool<Postgres>) -> RepoResult<sqlx::Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    Ok(tx)
}

async fn compose_on(
    conn: &mut PgConnection,
    viewer: Id,
    scope: FeedScope,
    now: DateTime<Utc>,
) -> RepoResult<Vec<EnrichedPost>> {
    let query = match scope {
        FeedScope::Network => sqlx::query_as::<_, PostRow>(NETWORK_POSTS).bind(viewer),
        FeedScope::Author(author) => sqlx::query_as::<_, PostRow>(AUTHOR_POSTS).bind(viewer).bind(author),
        FeedScope::Trending => sqlx::query_as::<_, PostRow>(TRENDING_POSTS).bind(viewer).bind(now - trending_window()),
        FeedScope::Single(id) => sqlx::query_as::<_, PostRow>(SINGLE_POST).bind(viewer).bind(id),
    };
    let rows = query.fetch_all(&mut *conn).await.map_err(db_err)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Id> = rows.iter().map(|r| r.id).collect();
    let media = sqlx::query_as::<_, MediaRow>(
        "SELECT id, post_id, reference, kind, position FROM post_media \
         WHERE post_id = ANY($1) ORDER BY post_id, position",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?
    .into_iter()
    .map(MediaAttachment::try_from)
    .collect::<RepoResult<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|r| EnrichedPost {
            media: media.iter().filter(|m| m.post_id == r.id).cloned().collect(),
            id: r.id,
            author_id: r.author_id,
            author_username: r.author_username,
            author_avatar_color: r.author_avatar_color,
            content: r.content,
            created_at: r.created_at,
            like_count: r.like_count,
            comment_count: r.comment_count,
            viewer_has_liked: r.viewer_has_liked,
        })
        .collect())
}

#[derive(Clone)]
pub struct PgRepo {
    pool: Pool<Postgres>,
    clock: Arc<dyn Clock>,
}

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Internal(e.to_string()))
    }

    async fn toggle_like_once(&self, user: Id, post: Id) -> RepoResult<LikeToggle> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_pair(&mut tx, "like", user, post).await?;
        let author: Id = sqlx::query_scalar("SELECT author_id FROM posts WHERE id = $1")
            .bind(post)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
        let removed = sqlx::query("DELETE FROM likes WHERE user_id = $1 AND post_id = $2")
            .bind(user)
            .bind(post)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected()
            > 0;
        if !removed {
            sqlx::query("INSERT INTO likes (user_id, post_id, created_at) VALUES ($1, $2, $3)")
                .bind(user)
                .bind(post)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            notify(&mut tx, now, author, user, NotificationKind::Like, Some(post)).await?;
        }
        let like_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE post_id = $1")
            .bind(post)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(LikeToggle { liked: !removed, like_count })
    }

    async fn insert_follow(conn: &mut PgConnection, now: DateTime<Utc>, follower: Id, followee: Id) -> RepoResult<bool> {
        if follower == followee {
            return Err(RepoError::InvalidOperation("cannot follow yourself"));
        }
        if !exists(conn, USER_EXISTS, followee).await? {
            return Err(RepoError::NotFound);
        }
        let created = sqlx::query(
            "INSERT INTO followers (follower_id, followee_id, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (follower_id, followee_id) DO NOTHING",
        )
        .bind(follower)
        .bind(followee)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected()
            > 0;
        if created {
            notify(conn, now, followee, follower, NotificationKind::Follow, None).await?;
        }
        Ok(created)
    }

    async fn toggle_follow_once(&self, follower: Id, followee: Id) -> RepoResult<FollowToggle> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_pair(&mut tx, "follow", follower, followee).await?;
        let removed = sqlx::query("DELETE FROM followers WHERE follower_id = $1 AND followee_id = $2")
            .bind(follower)
            .bind(followee)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected()
            > 0;
        let following = if removed {
            false
        } else {
            Self::insert_follow(&mut tx, now, follower, followee).await?
        };
        tx.commit().await.map_err(db_err)?;
        Ok(FollowToggle { following })
    }
}

#[async_trait]
impl UserDirectory for PgRepo {
    async fn upsert_user(&self, new: NewUser) -> RepoResult<User> {
        let username = non_blank(&new.username).ok_or(RepoError::EmptyContent)?;
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, bio, avatar_color, created_at) \
             VALUES ($1, COALESCE($2, ''), COALESCE($3, '#6366f1'), $4) \
             ON CONFLICT (username) DO UPDATE \
             SET bio = COALESCE($2, users.bio), avatar_color = COALESCE($3, users.avatar_color) \
             RETURNING id, username, bio, avatar_color, created_at",
        )
        .bind(username)
        .bind(new.bio.as_deref().map(clip_bio))
        .bind(new.avatar_color)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn ensure_user(&self, id: Id) -> RepoResult<User> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            "INSERT INTO users (id, username, created_at) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(placeholder_username(id))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected()
            > 0;
        if inserted {
            debug!(id, "mirrored new identity");
            sync_user_sequence(&mut tx).await?;
        }
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(user)
    }

    async fn update_profile(&self, id: Id, update: ProfileUpdate) -> RepoResult<User> {
        let username = match update.username.as_deref() {
            Some(name) => Some(non_blank(name).ok_or(RepoError::EmptyContent)?),
            None => None,
        };
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, username, bio, avatar_color, created_at) \
             VALUES ($1, COALESCE($2, $3), COALESCE($4, ''), COALESCE($5, '{DEFAULT_AVATAR_COLOR}'), $6) \
             ON CONFLICT (id) DO UPDATE \
             SET username = COALESCE($2, users.username), bio = COALESCE($4, users.bio), \
                 avatar_color = COALESCE($5, users.avatar_color) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(username)
        .bind(placeholder_username(id))
        .bind(update.bio.as_deref().map(clip_bio))
        .bind(update.avatar_color)
        .bind(self.clock.now())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sync_user_sequence(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(user)
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        sqlx::query_as::<_, User>("SELECT id, username, bio, avatar_color, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
        sqlx::query_as::<_, User>("SELECT id, username, bio, avatar_color, created_at FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn search_users(&self, viewer: Id, query: &str) -> RepoResult<Vec<UserSummary>> {
        let Some(needle) = non_blank(query) else { return Ok(Vec::new()) };
        let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        sqlx::query_as::<_, UserSummary>(user_summaries!(
            "FROM users u WHERE u.id <> $1 AND u.username ILIKE $2 ESCAPE '\\' \
             ORDER BY followers_count DESC, u.id ASC LIMIT $3"
        ))
        .bind(viewer)
        .bind(format!("%{escaped}%"))
        .bind(SEARCH_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn profile(&self, viewer: Id, username: &str) -> RepoResult<Profile> {
        let mut tx = begin_snapshot(&self.pool).await?;
        let user = sqlx::query_as::<_, User>("SELECT id, username, bio, avatar_color, created_at FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let (followers_count, following_count, is_following): (i64, i64, bool) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM followers WHERE followee_id = $2), \
                    (SELECT COUNT(*) FROM followers WHERE follower_id = $2), \
                    EXISTS(SELECT 1 FROM followers WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(viewer)
        .bind(user.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let posts = compose_on(&mut tx, viewer, FeedScope::Author(user.id), self.clock.now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(Profile { user, followers_count, following_count, is_following, posts })
    }
}

#[async_trait]
impl GraphRepo for PgRepo {
    #[instrument(skip(self))]
    async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        let now = self.clock.now();
        retry_on_conflict(|| async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            lock_pair(&mut tx, "follow", follower, followee).await?;
            let created = Self::insert_follow(&mut tx, now, follower, followee).await?;
            tx.commit().await.map_err(db_err)?;
            Ok(created)
        })
        .await
    }

    async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        let affected = sqlx::query("DELETE FROM followers WHERE follower_id = $1 AND followee_id = $2")
            .bind(follower)
            .bind(followee)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self))]
    async fn toggle_follow(&self, follower: Id, followee: Id) -> RepoResult<FollowToggle> {
        if follower == followee {
            return Err(RepoError::InvalidOperation("cannot follow yourself"));
        }
        retry_on_conflict(|| self.toggle_follow_once(follower, followee)).await
    }

    async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM followers WHERE follower_id = $1 AND followee_id = $2)")
            .bind(follower)
            .bind(followee)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn follower_count(&self, user: Id) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM followers WHERE followee_id = $1")
            .bind(user)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn following_count(&self, user: Id) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM followers WHERE follower_id = $1")
            .bind(user)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn followee_set(&self, user: Id) -> RepoResult<HashSet<Id>> {
        let ids: Vec<Id> = sqlx::query_scalar("SELECT followee_id FROM followers WHERE follower_id = $1")
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(ids.into_iter().collect())
    }

    async fn list_followers(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        if !exists(&mut tx, USER_EXISTS, user).await? {
            return Err(RepoError::NotFound);
        }
        let users = sqlx::query_as::<_, UserSummary>(user_summaries!(
            "FROM followers e JOIN users u ON u.id = e.follower_id \
             WHERE e.followee_id = $2 ORDER BY e.created_at DESC, u.id DESC"
        ))
        .bind(viewer)
        .bind(user)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(users)
    }

    async fn list_following(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        if !exists(&mut tx, USER_EXISTS, user).await? {
            return Err(RepoError::NotFound);
        }
        let users = sqlx::query_as::<_, UserSummary>(user_summaries!(
            "FROM followers e JOIN users u ON u.id = e.followee_id \
             WHERE e.follower_id = $2 ORDER BY e.created_at DESC, u.id DESC"
        ))
        .bind(viewer)
        .bind(user)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(users)
    }
}

#[async_trait]
impl ReactionRepo for PgRepo {
    #[instrument(skip(self))]
    async fn toggle_like(&self, user: Id, post: Id) -> RepoResult<LikeToggle> {
        retry_on_conflict(|| self.toggle_like_once(user, post)).await
    }

    async fn like_count(&self, post: Id) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE post_id = $1")
            .bind(post)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn add_comment(&self, user: Id, post: Id, new: NewComment) -> RepoResult<Comment> {
        let content = non_blank(&new.content).ok_or(RepoError::EmptyContent)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let author: Id = sqlx::query_scalar("SELECT author_id FROM posts WHERE id = $1")
            .bind(post)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
        let comment = sqlx::query_as::<_, Comment>(
            "WITH c AS ( \
                INSERT INTO comments (post_id, author_id, content, created_at) VALUES ($1, $2, $3, $4) \
                RETURNING id, post_id, author_id, content, created_at) \
             SELECT c.id, c.post_id, c.author_id, u.username AS author_username, \
                    u.avatar_color AS author_avatar_color, c.content, c.created_at \
             FROM c JOIN users u ON u.id = c.author_id",
        )
        .bind(post)
        .bind(user)
        .bind(content)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        notify(&mut tx, now, author, user, NotificationKind::Comment, Some(post)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(comment)
    }

    async fn delete_comment(&self, actor: Id, comment: Id) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (comment_author, post_author): (Id, Option<Id>) = sqlx::query_as(
            "SELECT c.author_id, p.author_id FROM comments c LEFT JOIN posts p ON p.id = c.post_id \
             WHERE c.id = $1 FOR UPDATE OF c",
        )
        .bind(comment)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(RepoError::NotFound)?;
        if comment_author != actor && post_author != Some(actor) {
            return Err(RepoError::Forbidden);
        }
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(comment)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn list_comments(&self, post: Id) -> RepoResult<Vec<Comment>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        if !exists(&mut tx, POST_EXISTS, post).await? {
            return Err(RepoError::NotFound);
        }
        let comments = sqlx::query_as::<_, Comment>(
            "SELECT c.id, c.post_id, c.author_id, u.username AS author_username, \
                    u.avatar_color AS author_avatar_color, c.content, c.created_at \
             FROM comments c JOIN users u ON u.id = c.author_id \
             WHERE c.post_id = $1 ORDER BY c.created_at ASC, c.id ASC",
        )
        .bind(post)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(comments)
    }
}

#[async_trait]
impl StoryRepo for PgRepo {
    async fn create_story(&self, author: Id, new: NewStory) -> RepoResult<Option<Story>> {
        let Some(content) = non_blank(&new.content) else {
            debug!(author, "blank story skipped");
            return Ok(None);
        };
        let now = self.clock.now();
        let story = sqlx::query_as::<_, Story>(&format!(
            "WITH s AS ( \
                INSERT INTO stories (author_id, content, bg_color, created_at, expires_at) \
                VALUES ($1, $2, $3, $4, $5) RETURNING *) \
             SELECT {STORY_COLUMNS} FROM s JOIN users u ON u.id = s.author_id"
        ))
        .bind(author)
        .bind(content)
        .bind(new.bg_color.unwrap_or_else(|| DEFAULT_STORY_COLOR.to_string()))
        .bind(now)
        .bind(now + story_lifetime())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(Some(story))
    }

    async fn list_active_stories(&self, viewer: Id) -> RepoResult<Vec<StoryCard>> {
        let rows = sqlx::query_as::<_, StoryCardRow>(&format!(
            "SELECT * FROM ( \
                SELECT DISTINCT ON (s.author_id) {STORY_COLUMNS}, \
                       EXISTS(SELECT 1 FROM story_views v WHERE v.story_id = s.id AND v.user_id = $1) AS viewed \
                FROM stories s JOIN users u ON u.id = s.author_id \
                WHERE s.expires_at > $2 \
                ORDER BY s.author_id, s.created_at DESC, s.id DESC) t \
             ORDER BY t.viewed ASC, t.created_at DESC, t.id DESC"
        ))
        .bind(viewer)
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| StoryCard { story: r.story, viewed: r.viewed }).collect())
    }

    async fn view_story(&self, viewer: Id, story: Id) -> RepoResult<StoryViewing> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let found = sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories s JOIN users u ON u.id = s.author_id \
             WHERE s.id = $1 AND s.expires_at > $2"
        ))
        .bind(story)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(RepoError::NotFound)?;
        sqlx::query("INSERT INTO story_views (user_id, story_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(viewer)
            .bind(story)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let next_story_id: Option<Id> = sqlx::query_scalar(
            "SELECT id FROM stories WHERE id > $1 AND expires_at > $2 ORDER BY id ASC LIMIT 1",
        )
        .bind(story)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(StoryViewing { story: found, next_story_id })
    }

    async fn story_view_count(&self, actor: Id, story: Id) -> RepoResult<i64> {
        let (author, views): (Id, i64) = sqlx::query_as(
            "SELECT s.author_id, (SELECT COUNT(*) FROM story_views v WHERE v.story_id = s.id) \
             FROM stories s WHERE s.id = $1",
        )
        .bind(story)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        Ok(views)
    }

    async fn delete_story(&self, actor: Id, story: Id) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let author: Id = sqlx::query_scalar("SELECT author_id FROM stories WHERE id = $1 FOR UPDATE")
            .bind(story)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        sqlx::query("DELETE FROM stories WHERE id = $1")
            .bind(story)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}

#[async_trait]
impl NotificationRepo for PgRepo {
    async fn list_notifications(&self, recipient: Id) -> RepoResult<Vec<Notification>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT n.id, n.recipient_id, n.actor_id, u.username AS actor_username, \
                    u.avatar_color AS actor_avatar_color, n.kind, n.target_post_id, n.is_read, n.created_at \
             FROM notifications n JOIN users u ON u.id = n.actor_id \
             WHERE n.recipient_id = $1 \
             ORDER BY n.created_at DESC, n.id DESC LIMIT $2",
        )
        .bind(recipient)
        .bind(NOTIFICATION_LIMIT as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE notifications SET is_read = TRUE WHERE recipient_id = $1 AND NOT is_read")
            .bind(recipient)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn unread_count(&self, recipient: Id) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE recipient_id = $1 AND NOT is_read")
            .bind(recipient)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl FeedRepo for PgRepo {
    async fn create_post(&self, author: Id, new: NewPost) -> RepoResult<EnrichedPost> {
        let content = new.content.trim().to_string();
        if content.is_empty() && new.media.is_empty() {
            return Err(RepoError::EmptyContent);
        }
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let id: Id = sqlx::query_scalar(
            "INSERT INTO posts (author_id, content, created_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(author)
        .bind(content)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        for (position, media) in new.media.iter().take(MAX_ATTACHMENTS).enumerate() {
            sqlx::query("INSERT INTO post_media (post_id, reference, kind, position) VALUES ($1, $2, $3, $4)")
                .bind(id)
                .bind(&media.reference)
                .bind(media.kind.as_str())
                .bind(position as i32)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        let post = compose_on(&mut tx, author, FeedScope::Single(id), now)
            .await?
            .into_iter()
            .next()
            .ok_or(RepoError::NotFound)?;
        tx.commit().await.map_err(db_err)?;
        Ok(post)
    }

    async fn delete_post(&self, actor: Id, post: Id) -> RepoResult<DeletedPost> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let author: Id = sqlx::query_scalar("SELECT author_id FROM posts WHERE id = $1 FOR UPDATE")
            .bind(post)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        let detached: Vec<(String, String)> =
            sqlx::query_as("DELETE FROM post_media WHERE post_id = $1 RETURNING reference, kind")
                .bind(post)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        // likes and comments cascade; notification targets are set to NULL
        sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(post)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let refs: Vec<String> = detached.iter().map(|(r, _)| r.clone()).collect();
        let still_used: HashSet<String> =
            sqlx::query_scalar::<_, String>("SELECT DISTINCT reference FROM post_media WHERE reference = ANY($1)")
                .bind(&refs)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?
                .into_iter()
                .collect();
        tx.commit().await.map_err(db_err)?;

        let mut freed_media: Vec<MediaRef> = Vec::new();
        for (reference, kind) in detached {
            if still_used.contains(&reference) || freed_media.iter().any(|f| f.reference == reference) {
                continue;
            }
            freed_media.push(MediaRef { kind: kind.parse().map_err(RepoError::Internal)?, reference });
        }
        Ok(DeletedPost { deleted: true, freed_media })
    }

    async fn get_post(&self, viewer: Id, post: Id) -> RepoResult<EnrichedPost> {
        self.compose(viewer, FeedScope::Single(post))
            .await?
            .into_iter()
            .next()
            .ok_or(RepoError::NotFound)
    }

    async fn compose(&self, viewer: Id, scope: FeedScope) -> RepoResult<Vec<EnrichedPost>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        let posts = compose_on(&mut tx, viewer, scope, self.clock.now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(posts)
    }

    async fn recommended_users(&self, viewer: Id) -> RepoResult<Vec<UserSummary>> {
        sqlx::query_as::<_, UserSummary>(user_summaries!(
            "FROM users u WHERE u.id <> $1 \
             AND u.id NOT IN (SELECT followee_id FROM followers WHERE follower_id = $1) \
             ORDER BY followers_count DESC, u.id ASC LIMIT $2"
        ))
        .bind(viewer)
        .bind(RECOMMENDED_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
