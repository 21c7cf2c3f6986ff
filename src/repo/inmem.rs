//! In-memory backend. Every operation holds the state lock for its whole
//! duration, so each call is one atomic unit.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::*;
use crate::clock::{Clock, SystemClock};

const SNAPSHOT_FILE: &str = "state.json";
const SNAPSHOT_TMP_EXT: &str = "json.tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredComment {
    id: Id,
    post_id: Id,
    author_id: Id,
    content: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStory {
    id: Id,
    author_id: Id,
    content: String,
    bg_color: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNotification {
    id: Id,
    recipient_id: Id,
    actor_id: Id,
    kind: NotificationKind,
    target_post_id: Option<Id>,
    is_read: bool,
    created_at: DateTime<Utc>,
}

#[derive(Default, Serialize, Deserialize)]
struct State {
    users: BTreeMap<Id, User>,
    posts: BTreeMap<Id, Post>,
    media: BTreeMap<Id, MediaAttachment>,
    /// follower -> followee -> since
    follows: BTreeMap<Id, BTreeMap<Id, DateTime<Utc>>>,
    /// post -> user -> liked at
    likes: BTreeMap<Id, BTreeMap<Id, DateTime<Utc>>>,
    comments: BTreeMap<Id, StoredComment>,
    stories: BTreeMap<Id, StoredStory>,
    /// (viewer, story)
    story_views: BTreeSet<(Id, Id)>,
    notifications: BTreeMap<Id, StoredNotification>,
    next_id: Id,
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn display(&self, user: Id) -> (String, String) {
        match self.users.get(&user) {
            Some(u) => (u.username.clone(), u.avatar_color.clone()),
            None => ("[deleted]".to_string(), DEFAULT_AVATAR_COLOR.to_string()),
        }
    }

    fn is_following(&self, follower: Id, followee: Id) -> bool {
        self.follows.get(&follower).is_some_and(|f| f.contains_key(&followee))
    }

    fn followees(&self, user: Id) -> HashSet<Id> {
        self.follows.get(&user).map(|f| f.keys().copied().collect()).unwrap_or_default()
    }

    fn follower_count(&self, user: Id) -> i64 {
        self.follows.values().filter(|f| f.contains_key(&user)).count() as i64
    }

    fn like_count(&self, post: Id) -> i64 {
        self.likes.get(&post).map(|l| l.len() as i64).unwrap_or(0)
    }

    fn summary(&self, viewer: Id, user: &User) -> UserSummary {
        UserSummary {
            id: user.id,
            username: user.username.clone(),
            avatar_color: user.avatar_color.clone(),
            followers_count: self.follower_count(user.id),
            is_following: self.is_following(viewer, user.id),
        }
    }

    fn enrich(&self, viewer: Id, post: &Post) -> EnrichedPost {
        let (author_username, author_avatar_color) = self.display(post.author_id);
        let mut media: Vec<MediaAttachment> = self.media.values()
            .filter(|m| m.post_id == post.id)
            .cloned()
            .collect();
        media.sort_by_key(|m| m.position);
        EnrichedPost {
            id: post.id,
            author_id: post.author_id,
            author_username,
            author_avatar_color,
            content: post.content.clone(),
            created_at: post.created_at,
            media,
            like_count: self.like_count(post.id),
            comment_count: self.comments.values().filter(|c| c.post_id == post.id).count() as i64,
            viewer_has_liked: self.likes.get(&post.id).is_some_and(|l| l.contains_key(&viewer)),
        }
    }

    fn comment(&self, c: &StoredComment) -> Comment {
        let (author_username, author_avatar_color) = self.display(c.author_id);
        Comment {
            id: c.id,
            post_id: c.post_id,
            author_id: c.author_id,
            author_username,
            author_avatar_color,
            content: c.content.clone(),
            created_at: c.created_at,
        }
    }

    fn story(&self, s: &StoredStory) -> Story {
        let (author_username, author_avatar_color) = self.display(s.author_id);
        Story {
            id: s.id,
            author_id: s.author_id,
            author_username,
            author_avatar_color,
            content: s.content.clone(),
            bg_color: s.bg_color.clone(),
            created_at: s.created_at,
            expires_at: s.expires_at,
        }
    }

    fn insert_follow(&mut self, follower: Id, followee: Id, now: DateTime<Utc>) -> RepoResult<bool> {
        if follower == followee {
            return Err(RepoError::InvalidOperation("cannot follow yourself"));
        }
        if !self.users.contains_key(&followee) {
            return Err(RepoError::NotFound);
        }
        if self.is_following(follower, followee) {
            return Ok(false);
        }
        self.follows.entry(follower).or_default().insert(followee, now);
        self.notify(now, followee, follower, NotificationKind::Follow, None);
        Ok(true)
    }

    fn remove_follow(&mut self, follower: Id, followee: Id) -> bool {
        let removed = self.follows.get_mut(&follower).is_some_and(|f| f.remove(&followee).is_some());
        if self.follows.get(&follower).is_some_and(|f| f.is_empty()) {
            self.follows.remove(&follower);
        }
        removed
    }

    /// Notification fan-out; self-actions never notify.
    fn notify(&mut self, now: DateTime<Utc>, recipient: Id, actor: Id, kind: NotificationKind, target_post_id: Option<Id>) {
        if recipient == actor {
            return;
        }
        if kind == NotificationKind::Like {
            let pending = self.notifications.values().any(|n| {
                n.recipient_id == recipient
                    && n.actor_id == actor
                    && n.kind == NotificationKind::Like
                    && n.target_post_id == target_post_id
                    && !n.is_read
            });
            if pending {
                return;
            }
        }
        let id = self.next_id();
        self.notifications.insert(id, StoredNotification {
            id,
            recipient_id: recipient,
            actor_id: actor,
            kind,
            target_post_id,
            is_read: false,
            created_at: now,
        });
        metrics::increment_counter!("pulse_notifications_total", "kind" => kind.as_str());
    }

    /// Inserts a directory row for an identity-issued id.
    fn insert_identity(&mut self, id: Id, username: String, now: DateTime<Utc>) -> RepoResult<()> {
        if self.users.values().any(|u| u.username == username) {
            return Err(RepoError::Conflict);
        }
        self.users.insert(id, User {
            id,
            username,
            bio: String::new(),
            avatar_color: DEFAULT_AVATAR_COLOR.to_string(),
            created_at: now,
        });
        // later allocations must not reuse an id the identity service handed out
        self.next_id = self.next_id.max(id);
        Ok(())
    }

    fn active_stories(&self, now: DateTime<Utc>) -> impl Iterator<Item = &StoredStory> {
        self.stories.values().filter(move |s| now < s.expires_at)
    }
}

#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<Arc<PathBuf>>,
    persist_lock: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl InMemRepo {
    /// Snapshot directory, `PULSE_DATA_DIR` or `./data`.
    fn data_dir() -> PathBuf {
        std::env::var("PULSE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"))
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    info!(path = %path.display(), "loaded in-memory snapshot");
                    s
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable snapshot, starting empty");
                    State::default()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no snapshot, starting empty");
                State::default()
            }
        }
    }

    /// Backed by a JSON snapshot that is rewritten after every mutation.
    pub fn new() -> Self {
        Self::at(Self::data_dir())
    }

    /// Like [`InMemRepo::new`] with an explicit snapshot directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let mut path: PathBuf = dir.into();
        path.push(SNAPSHOT_FILE);
        let state = Self::load_state_from(&path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(Arc::new(path)),
            persist_lock: Arc::new(Mutex::new(())),
            clock: Arc::new(SystemClock),
        }
    }

    /// Never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            snapshot_path: None,
            persist_lock: Arc::new(Mutex::new(())),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    /// Writes the snapshot to a temp file and renames it over the old one, so
    /// readers only ever see a complete snapshot.
    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_ref() else { return };
        let Ok(_writer) = self.persist_lock.lock() else { return };
        let bytes = match self.state.read() {
            Ok(s) => serde_json::to_vec_pretty(&*s),
            Err(_) => return,
        };
        match bytes {
            Ok(bytes) => {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                let tmp = path.with_extension(SNAPSHOT_TMP_EXT);
                let written = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path.as_path()));
                if let Err(e) = written {
                    warn!(path = %path.display(), error = %e, "failed to write snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize snapshot"),
        }
    }
}

impl Default for InMemRepo {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl UserDirectory for InMemRepo {
    async fn upsert_user(&self, new: NewUser) -> RepoResult<User> {
        let username = non_blank(&new.username).ok_or(RepoError::EmptyContent)?;
        let now = self.clock.now();
        let mut s = self.write()?;
        let existing = s.users.values().find(|u| u.username == username).map(|u| u.id);
        let user = match existing {
            Some(id) => {
                let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
                if let Some(bio) = new.bio { user.bio = clip_bio(&bio); }
                if let Some(color) = new.avatar_color { user.avatar_color = color; }
                user.clone()
            }
            None => {
                let id = s.next_id();
                let user = User {
                    id,
                    username,
                    bio: new.bio.as_deref().map(clip_bio).unwrap_or_default(),
                    avatar_color: new.avatar_color.unwrap_or_else(|| DEFAULT_AVATAR_COLOR.to_string()),
                    created_at: now,
                };
                s.users.insert(id, user.clone());
                user
            }
        };
        drop(s);
        self.persist();
        Ok(user)
    }

    async fn ensure_user(&self, id: Id) -> RepoResult<User> {
        if let Some(user) = self.read()?.users.get(&id).cloned() {
            return Ok(user);
        }
        let now = self.clock.now();
        let mut s = self.write()?;
        // another request may have mirrored the id between the two locks
        if let Some(user) = s.users.get(&id).cloned() {
            return Ok(user);
        }
        s.insert_identity(id, placeholder_username(id), now)?;
        let user = s.users.get(&id).cloned().ok_or(RepoError::NotFound)?;
        drop(s);
        debug!(id, "mirrored new identity");
        self.persist();
        Ok(user)
    }

    async fn update_profile(&self, id: Id, update: ProfileUpdate) -> RepoResult<User> {
        let username = match update.username.as_deref() {
            Some(name) => Some(non_blank(name).ok_or(RepoError::EmptyContent)?),
            None => None,
        };
        let now = self.clock.now();
        let mut s = self.write()?;
        if let Some(name) = &username {
            if s.users.values().any(|u| u.id != id && &u.username == name) {
                return Err(RepoError::Conflict);
            }
        }
        if !s.users.contains_key(&id) {
            let initial = username.clone().unwrap_or_else(|| placeholder_username(id));
            s.insert_identity(id, initial, now)?;
        }
        let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        if let Some(name) = username { user.username = name; }
        if let Some(bio) = update.bio { user.bio = clip_bio(&bio); }
        if let Some(color) = update.avatar_color { user.avatar_color = color; }
        let user = user.clone();
        drop(s);
        self.persist();
        Ok(user)
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        self.read()?.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
        self.read()?.users.values().find(|u| u.username == username).cloned().ok_or(RepoError::NotFound)
    }

    async fn search_users(&self, viewer: Id, query: &str) -> RepoResult<Vec<UserSummary>> {
        let Some(needle) = non_blank(query).map(|q| q.to_lowercase()) else { return Ok(Vec::new()) };
        let s = self.read()?;
        let mut found: Vec<UserSummary> = s.users.values()
            .filter(|u| u.id != viewer && u.username.to_lowercase().contains(&needle))
            .map(|u| s.summary(viewer, u))
            .collect();
        found.sort_by(|a, b| b.followers_count.cmp(&a.followers_count).then(a.id.cmp(&b.id)));
        found.truncate(SEARCH_LIMIT);
        Ok(found)
    }

    async fn profile(&self, viewer: Id, username: &str) -> RepoResult<Profile> {
        let s = self.read()?;
        let user = s.users.values().find(|u| u.username == username).cloned().ok_or(RepoError::NotFound)?;
        let posts = compose_in(&s, viewer, FeedScope::Author(user.id), self.clock.now());
        Ok(Profile {
            followers_count: s.follower_count(user.id),
            following_count: s.follows.get(&user.id).map(|f| f.len() as i64).unwrap_or(0),
            is_following: s.is_following(viewer, user.id),
            posts,
            user,
        })
    }
}

#[async_trait]
impl GraphRepo for InMemRepo {
    async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        let now = self.clock.now();
        let mut s = self.write()?;
        let created = s.insert_follow(follower, followee, now)?;
        drop(s);
        if created { self.persist(); }
        Ok(created)
    }

    async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        let mut s = self.write()?;
        let removed = s.remove_follow(follower, followee);
        drop(s);
        if removed { self.persist(); }
        Ok(removed)
    }

    async fn toggle_follow(&self, follower: Id, followee: Id) -> RepoResult<FollowToggle> {
        if follower == followee {
            return Err(RepoError::InvalidOperation("cannot follow yourself"));
        }
        let now = self.clock.now();
        let mut s = self.write()?;
        let following = if s.remove_follow(follower, followee) {
            false
        } else {
            s.insert_follow(follower, followee, now)?
        };
        drop(s);
        self.persist();
        Ok(FollowToggle { following })
    }

    async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool> {
        Ok(self.read()?.is_following(follower, followee))
    }

    async fn follower_count(&self, user: Id) -> RepoResult<i64> {
        Ok(self.read()?.follower_count(user))
    }

    async fn following_count(&self, user: Id) -> RepoResult<i64> {
        Ok(self.read()?.follows.get(&user).map(|f| f.len() as i64).unwrap_or(0))
    }

    async fn followee_set(&self, user: Id) -> RepoResult<HashSet<Id>> {
        Ok(self.read()?.followees(user))
    }

    async fn list_followers(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>> {
        let s = self.read()?;
        if !s.users.contains_key(&user) {
            return Err(RepoError::NotFound);
        }
        let mut edges: Vec<(Id, DateTime<Utc>)> = s.follows.iter()
            .filter_map(|(follower, f)| f.get(&user).map(|at| (*follower, *at)))
            .collect();
        edges.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        Ok(edges.into_iter()
            .filter_map(|(id, _)| s.users.get(&id))
            .map(|u| s.summary(viewer, u))
            .collect())
    }

    async fn list_following(&self, viewer: Id, user: Id) -> RepoResult<Vec<UserSummary>> {
        let s = self.read()?;
        if !s.users.contains_key(&user) {
            return Err(RepoError::NotFound);
        }
        let mut edges: Vec<(Id, DateTime<Utc>)> = s.follows.get(&user)
            .map(|f| f.iter().map(|(id, at)| (*id, *at)).collect())
            .unwrap_or_default();
        edges.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        Ok(edges.into_iter()
            .filter_map(|(id, _)| s.users.get(&id))
            .map(|u| s.summary(viewer, u))
            .collect())
    }
}

#[async_trait]
impl ReactionRepo for InMemRepo {
    async fn toggle_like(&self, user: Id, post: Id) -> RepoResult<LikeToggle> {
        let now = self.clock.now();
        let mut s = self.write()?;
        let author = s.posts.get(&post).map(|p| p.author_id).ok_or(RepoError::NotFound)?;
        let likes = s.likes.entry(post).or_default();
        let liked = if likes.remove(&user).is_some() {
            false
        } else {
            likes.insert(user, now);
            true
        };
        if s.likes.get(&post).is_some_and(|l| l.is_empty()) {
            s.likes.remove(&post);
        }
        if liked {
            s.notify(now, author, user, NotificationKind::Like, Some(post));
        }
        let like_count = s.like_count(post);
        drop(s);
        self.persist();
        Ok(LikeToggle { liked, like_count })
    }

    async fn like_count(&self, post: Id) -> RepoResult<i64> {
        Ok(self.read()?.like_count(post))
    }

    async fn add_comment(&self, user: Id, post: Id, new: NewComment) -> RepoResult<Comment> {
        let content = non_blank(&new.content).ok_or(RepoError::EmptyContent)?;
        let now = self.clock.now();
        let mut s = self.write()?;
        let author = s.posts.get(&post).map(|p| p.author_id).ok_or(RepoError::NotFound)?;
        let id = s.next_id();
        let stored = StoredComment { id, post_id: post, author_id: user, content, created_at: now };
        s.comments.insert(id, stored.clone());
        s.notify(now, author, user, NotificationKind::Comment, Some(post));
        let comment = s.comment(&stored);
        drop(s);
        self.persist();
        Ok(comment)
    }

    async fn delete_comment(&self, actor: Id, comment: Id) -> RepoResult<bool> {
        let mut s = self.write()?;
        let c = s.comments.get(&comment).ok_or(RepoError::NotFound)?;
        let post_author = s.posts.get(&c.post_id).map(|p| p.author_id);
        if c.author_id != actor && post_author != Some(actor) {
            return Err(RepoError::Forbidden);
        }
        s.comments.remove(&comment);
        drop(s);
        self.persist();
        Ok(true)
    }

    async fn list_comments(&self, post: Id) -> RepoResult<Vec<Comment>> {
        let s = self.read()?;
        if !s.posts.contains_key(&post) {
            return Err(RepoError::NotFound);
        }
        let mut v: Vec<&StoredComment> = s.comments.values().filter(|c| c.post_id == post).collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(v.into_iter().map(|c| s.comment(c)).collect())
    }
}

#[async_trait]
impl StoryRepo for InMemRepo {
    async fn create_story(&self, author: Id, new: NewStory) -> RepoResult<Option<Story>> {
        let Some(content) = non_blank(&new.content) else { return Ok(None) };
        let now = self.clock.now();
        let mut s = self.write()?;
        let id = s.next_id();
        let stored = StoredStory {
            id,
            author_id: author,
            content,
            bg_color: new.bg_color.unwrap_or_else(|| DEFAULT_STORY_COLOR.to_string()),
            created_at: now,
            expires_at: now + story_lifetime(),
        };
        s.stories.insert(id, stored.clone());
        let story = s.story(&stored);
        drop(s);
        self.persist();
        Ok(Some(story))
    }

    async fn list_active_stories(&self, viewer: Id) -> RepoResult<Vec<StoryCard>> {
        let now = self.clock.now();
        let s = self.read()?;
        // newest active story per author
        let mut newest: BTreeMap<Id, &StoredStory> = BTreeMap::new();
        for story in s.active_stories(now) {
            let slot = newest.entry(story.author_id).or_insert(story);
            if (story.created_at, story.id) > (slot.created_at, slot.id) {
                *slot = story;
            }
        }
        let mut cards: Vec<StoryCard> = newest.into_values()
            .map(|st| StoryCard { story: s.story(st), viewed: s.story_views.contains(&(viewer, st.id)) })
            .collect();
        cards.sort_by(|a, b| {
            a.viewed.cmp(&b.viewed)
                .then(b.story.created_at.cmp(&a.story.created_at))
                .then(b.story.id.cmp(&a.story.id))
        });
        Ok(cards)
    }

    async fn view_story(&self, viewer: Id, story: Id) -> RepoResult<StoryViewing> {
        let now = self.clock.now();
        let mut s = self.write()?;
        let stored = s.stories.get(&story).filter(|st| now < st.expires_at).cloned().ok_or(RepoError::NotFound)?;
        let inserted = s.story_views.insert((viewer, story));
        let next_story_id = s.active_stories(now).map(|st| st.id).filter(|id| *id > story).min();
        let viewing = StoryViewing { story: s.story(&stored), next_story_id };
        drop(s);
        if inserted { self.persist(); }
        Ok(viewing)
    }

    async fn story_view_count(&self, actor: Id, story: Id) -> RepoResult<i64> {
        let s = self.read()?;
        let author = s.stories.get(&story).map(|st| st.author_id).ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        Ok(s.story_views.iter().filter(|(_, st)| *st == story).count() as i64)
    }

    async fn delete_story(&self, actor: Id, story: Id) -> RepoResult<bool> {
        let mut s = self.write()?;
        let author = s.stories.get(&story).map(|st| st.author_id).ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        s.stories.remove(&story);
        s.story_views.retain(|(_, st)| *st != story);
        drop(s);
        self.persist();
        Ok(true)
    }
}

#[async_trait]
impl NotificationRepo for InMemRepo {
    async fn list_notifications(&self, recipient: Id) -> RepoResult<Vec<Notification>> {
        let mut s = self.write()?;
        let mut mine: Vec<&StoredNotification> = s.notifications.values()
            .filter(|n| n.recipient_id == recipient)
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let listed: Vec<Notification> = mine.into_iter()
            .take(NOTIFICATION_LIMIT)
            .map(|n| {
                let (actor_username, actor_avatar_color) = s.display(n.actor_id);
                Notification {
                    id: n.id,
                    recipient_id: n.recipient_id,
                    actor_id: n.actor_id,
                    actor_username,
                    actor_avatar_color,
                    kind: n.kind,
                    target_post_id: n.target_post_id,
                    is_read: n.is_read,
                    created_at: n.created_at,
                }
            })
            .collect();
        let mut changed = false;
        for n in s.notifications.values_mut().filter(|n| n.recipient_id == recipient && !n.is_read) {
            n.is_read = true;
            changed = true;
        }
        drop(s);
        if changed { self.persist(); }
        Ok(listed)
    }

    async fn unread_count(&self, recipient: Id) -> RepoResult<i64> {
        let s = self.read()?;
        Ok(s.notifications.values().filter(|n| n.recipient_id == recipient && !n.is_read).count() as i64)
    }
}

fn compose_in(s: &State, viewer: Id, scope: FeedScope, now: DateTime<Utc>) -> Vec<EnrichedPost> {
    let mut posts: Vec<&Post> = match scope {
        FeedScope::Network => {
            let mut authors = s.followees(viewer);
            authors.insert(viewer);
            s.posts.values().filter(|p| authors.contains(&p.author_id)).collect()
        }
        FeedScope::Author(author) => s.posts.values().filter(|p| p.author_id == author).collect(),
        FeedScope::Trending => {
            let since = now - trending_window();
            s.posts.values().filter(|p| p.created_at > since).collect()
        }
        FeedScope::Single(id) => s.posts.get(&id).into_iter().collect(),
    };
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    if scope == FeedScope::Trending {
        // stable sort keeps recency order among equal counts
        posts.sort_by_key(|p| std::cmp::Reverse(s.like_count(p.id)));
    }
    if let Some(limit) = scope.limit() {
        posts.truncate(limit);
    }
    posts.into_iter().map(|p| s.enrich(viewer, p)).collect()
}

#[async_trait]
impl FeedRepo for InMemRepo {
    async fn create_post(&self, author: Id, new: NewPost) -> RepoResult<EnrichedPost> {
        let content = new.content.trim().to_string();
        if content.is_empty() && new.media.is_empty() {
            return Err(RepoError::EmptyContent);
        }
        let now = self.clock.now();
        let mut s = self.write()?;
        let id = s.next_id();
        let post = Post { id, author_id: author, content, created_at: now };
        s.posts.insert(id, post.clone());
        for (position, media) in new.media.into_iter().take(MAX_ATTACHMENTS).enumerate() {
            let media_id = s.next_id();
            s.media.insert(media_id, MediaAttachment {
                id: media_id,
                post_id: id,
                reference: media.reference,
                kind: media.kind,
                position: position as i32,
            });
        }
        let enriched = s.enrich(author, &post);
        drop(s);
        self.persist();
        Ok(enriched)
    }

    async fn delete_post(&self, actor: Id, post: Id) -> RepoResult<DeletedPost> {
        let mut s = self.write()?;
        let author = s.posts.get(&post).map(|p| p.author_id).ok_or(RepoError::NotFound)?;
        if author != actor {
            return Err(RepoError::Forbidden);
        }
        let detached: Vec<MediaAttachment> = s.media.values().filter(|m| m.post_id == post).cloned().collect();
        s.media.retain(|_, m| m.post_id != post);
        s.likes.remove(&post);
        s.comments.retain(|_, c| c.post_id != post);
        for n in s.notifications.values_mut().filter(|n| n.target_post_id == Some(post)) {
            n.target_post_id = None;
        }
        s.posts.remove(&post);
        let mut freed_media: Vec<MediaRef> = Vec::new();
        for m in detached {
            let still_used = s.media.values().any(|other| other.reference == m.reference);
            if !still_used && !freed_media.iter().any(|f| f.reference == m.reference) {
                freed_media.push(MediaRef { reference: m.reference, kind: m.kind });
            }
        }
        drop(s);
        self.persist();
        Ok(DeletedPost { deleted: true, freed_media })
    }

    async fn get_post(&self, viewer: Id, post: Id) -> RepoResult<EnrichedPost> {
        let s = self.read()?;
        compose_in(&s, viewer, FeedScope::Single(post), self.clock.now())
            .into_iter()
            .next()
            .ok_or(RepoError::NotFound)
    }

    async fn compose(&self, viewer: Id, scope: FeedScope) -> RepoResult<Vec<EnrichedPost>> {
        let s = self.read()?;
        Ok(compose_in(&s, viewer, scope, self.clock.now()))
    }

    async fn recommended_users(&self, viewer: Id) -> RepoResult<Vec<UserSummary>> {
        let s = self.read()?;
        let followees = s.followees(viewer);
        let mut v: Vec<UserSummary> = s.users.values()
            .filter(|u| u.id != viewer && !followees.contains(&u.id))
            .map(|u| s.summary(viewer, u))
            .collect();
        v.sort_by(|a, b| b.followers_count.cmp(&a.followers_count).then(a.id.cmp(&b.id)));
        v.truncate(RECOMMENDED_LIMIT);
        Ok(v)
    }
}
