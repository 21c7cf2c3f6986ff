use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

use crate::models::Id;

/// Sliding window in-memory rate limiter (pod local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-action limits derived from env. Toggles (likes, follows) are never limited.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub post_limit: usize,
    pub post_window: Duration,
    pub comment_limit: usize,
    pub comment_window: Duration,
    pub story_limit: usize,
    pub story_window: Duration,
    pub media_limit: usize,
    pub media_window: Duration,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: u64) -> Duration { Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)) }
        Self {
            post_limit: usize_env("RL_POST_LIMIT", 10),
            post_window: dur_env("RL_POST_WINDOW", 300),
            comment_limit: usize_env("RL_COMMENT_LIMIT", 30),
            comment_window: dur_env("RL_COMMENT_WINDOW", 60),
            story_limit: usize_env("RL_STORY_LIMIT", 10),
            story_window: dur_env("RL_STORY_WINDOW", 3600),
            media_limit: usize_env("RL_MEDIA_LIMIT", 20),
            media_window: dur_env("RL_MEDIA_WINDOW", 3600),
        }
    }
}

/// High level guard used by handlers, keyed by user id.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }

    /// `RATE_LIMIT_ENABLED=false` turns every check into a pass.
    pub fn from_env() -> Self {
        let enabled = std::env::var("RATE_LIMIT_ENABLED").map(|v| v != "false" && v != "0").unwrap_or(true);
        Self::new(InMemoryRateLimiter::new(enabled), RateLimitConfig::from_env())
    }

    pub fn allow_post(&self, user: Id) -> bool { self.limiter.check(&format!("post:{user}"), self.cfg.post_limit, self.cfg.post_window) }
    pub fn allow_comment(&self, user: Id) -> bool { self.limiter.check(&format!("comment:{user}"), self.cfg.comment_limit, self.cfg.comment_window) }
    pub fn allow_story(&self, user: Id) -> bool { self.limiter.check(&format!("story:{user}"), self.cfg.story_limit, self.cfg.story_window) }
    pub fn allow_media(&self, user: Id) -> bool { self.limiter.check(&format!("media:{user}"), self.cfg.media_limit, self.cfg.media_window) }
}
