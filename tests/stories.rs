#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pulse::clock::{Clock, ManualClock};
use pulse::models::{NewStory, NewUser, DEFAULT_STORY_COLOR};
use pulse::repo::inmem::InMemRepo;
use pulse::repo::{RepoError, StoryRepo, UserDirectory};

fn repo_at_noon() -> (InMemRepo, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    let repo = InMemRepo::ephemeral().with_clock(Arc::new(clock.clone()));
    (repo, clock)
}

async fn user(r: &InMemRepo, name: &str) -> i64 {
    r.upsert_user(NewUser { username: name.into(), bio: None, avatar_color: None })
        .await
        .unwrap()
        .id
}

fn story(text: &str) -> NewStory {
    NewStory { content: text.into(), bg_color: None }
}

#[tokio::test]
async fn story_expires_after_a_day() {
    let (r, clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    let viewer = user(&r, "dave").await;
    let start = clock.now();

    let s = r.create_story(carol, story("sunset")).await.unwrap().unwrap();
    assert_eq!(s.expires_at, start + Duration::hours(24));
    assert_eq!(s.bg_color, DEFAULT_STORY_COLOR);

    clock.advance(Duration::hours(23) + Duration::minutes(59));
    let cards = r.list_active_stories(viewer).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].story.author_id, carol);

    clock.advance(Duration::minutes(2));
    assert!(r.list_active_stories(viewer).await.unwrap().is_empty());
    assert!(matches!(r.view_story(viewer, s.id).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn blank_story_is_a_no_op() {
    let (r, _clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    assert!(r.create_story(carol, story("   ")).await.unwrap().is_none());
    assert!(r.list_active_stories(carol).await.unwrap().is_empty());
}

#[tokio::test]
async fn viewing_twice_records_one_view() {
    let (r, _clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    let dave = user(&r, "dave").await;
    let s = r.create_story(carol, story("hello")).await.unwrap().unwrap();

    r.view_story(dave, s.id).await.unwrap();
    r.view_story(dave, s.id).await.unwrap();
    assert_eq!(r.story_view_count(carol, s.id).await.unwrap(), 1);
    // only the author sees who watched
    assert!(matches!(r.story_view_count(dave, s.id).await.unwrap_err(), RepoError::Forbidden));
    assert!(matches!(r.story_view_count(carol, 999).await.unwrap_err(), RepoError::NotFound));

    let cards = r.list_active_stories(dave).await.unwrap();
    assert!(cards[0].viewed);
    assert!(!r.list_active_stories(carol).await.unwrap()[0].viewed);
}

#[tokio::test]
async fn one_card_per_author_newest_wins_unviewed_first() {
    let (r, clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    let erin = user(&r, "erin").await;
    let dave = user(&r, "dave").await;

    let old = r.create_story(carol, story("old")).await.unwrap().unwrap();
    clock.advance(Duration::minutes(5));
    let newer = r.create_story(carol, story("newer")).await.unwrap().unwrap();
    clock.advance(Duration::minutes(5));
    let erins = r.create_story(erin, story("erin")).await.unwrap().unwrap();

    let cards = r.list_active_stories(dave).await.unwrap();
    let ids: Vec<i64> = cards.iter().map(|c| c.story.id).collect();
    assert_eq!(ids, vec![erins.id, newer.id]);
    assert!(!ids.contains(&old.id));

    // once erin's story is viewed it sinks below the unviewed group
    r.view_story(dave, erins.id).await.unwrap();
    let cards = r.list_active_stories(dave).await.unwrap();
    let ids: Vec<i64> = cards.iter().map(|c| c.story.id).collect();
    assert_eq!(ids, vec![newer.id, erins.id]);
}

#[tokio::test]
async fn next_story_follows_id_order_across_authors() {
    let (r, _clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    let erin = user(&r, "erin").await;
    let dave = user(&r, "dave").await;

    let a = r.create_story(carol, story("a")).await.unwrap().unwrap();
    let b = r.create_story(erin, story("b")).await.unwrap().unwrap();
    let c = r.create_story(carol, story("c")).await.unwrap().unwrap();

    assert_eq!(r.view_story(dave, a.id).await.unwrap().next_story_id, Some(b.id));
    assert_eq!(r.view_story(dave, b.id).await.unwrap().next_story_id, Some(c.id));
    assert_eq!(r.view_story(dave, c.id).await.unwrap().next_story_id, None);
}

#[tokio::test]
async fn only_the_author_deletes_a_story() {
    let (r, _clock) = repo_at_noon();
    let carol = user(&r, "carol").await;
    let dave = user(&r, "dave").await;
    let s = r
        .create_story(carol, NewStory { content: "bye".into(), bg_color: Some("#000000".into()) })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.bg_color, "#000000");

    assert!(matches!(r.delete_story(dave, s.id).await.unwrap_err(), RepoError::Forbidden));
    assert!(r.delete_story(carol, s.id).await.unwrap());
    assert!(matches!(r.delete_story(carol, s.id).await.unwrap_err(), RepoError::NotFound));
    assert!(r.list_active_stories(dave).await.unwrap().is_empty());
}
