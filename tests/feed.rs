#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pulse::clock::ManualClock;
use pulse::models::{MediaKind, MediaRef, NewPost, NewUser};
use pulse::repo::inmem::InMemRepo;
use pulse::repo::{
    FeedRepo, FeedScope, GraphRepo, ReactionRepo, RepoError, UserDirectory, FEED_LIMIT, RECOMMENDED_LIMIT,
};

fn clocked() -> (InMemRepo, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    (InMemRepo::ephemeral().with_clock(Arc::new(clock.clone())), clock)
}

async fn user(r: &InMemRepo, name: &str) -> i64 {
    r.upsert_user(NewUser { username: name.into(), bio: None, avatar_color: None })
        .await
        .unwrap()
        .id
}

async fn post(r: &InMemRepo, author: i64, text: &str) -> i64 {
    r.create_post(author, NewPost { content: text.into(), media: vec![] }).await.unwrap().id
}

fn media(reference: &str, kind: MediaKind) -> MediaRef {
    MediaRef { reference: reference.into(), kind }
}

#[tokio::test]
async fn feed_contains_only_self_and_followees() {
    let (r, clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let mallory = user(&r, "mallory").await;
    r.follow(alice, bob).await.unwrap();

    let own = post(&r, alice, "mine").await;
    clock.advance(Duration::minutes(1));
    let followed = post(&r, bob, "bob's").await;
    clock.advance(Duration::minutes(1));
    post(&r, mallory, "stranger").await;

    let feed = r.compose_feed(alice).await.unwrap();
    let ids: Vec<i64> = feed.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![followed, own]);
    assert!(feed.iter().all(|p| p.author_id == alice || p.author_id == bob));
    assert_eq!(feed[0].author_username, "bob");
}

#[tokio::test]
async fn feed_is_capped() {
    let (r, clock) = clocked();
    let alice = user(&r, "alice").await;
    for i in 0..(FEED_LIMIT + 3) {
        clock.advance(Duration::seconds(1));
        post(&r, alice, &format!("n{i}")).await;
    }
    let feed = r.compose_feed(alice).await.unwrap();
    assert_eq!(feed.len(), FEED_LIMIT);
    assert_eq!(feed[0].content, format!("n{}", FEED_LIMIT + 2));
}

#[tokio::test]
async fn posts_are_enriched_for_the_viewer() {
    let (r, _clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    r.follow(bob, alice).await.unwrap();
    let p = post(&r, alice, "enrich me").await;

    r.toggle_like(bob, p).await.unwrap();
    r.add_comment(bob, p, pulse::models::NewComment { content: "!".into() }).await.unwrap();

    let bobs_view = r.compose_feed(bob).await.unwrap();
    assert_eq!(bobs_view[0].like_count, 1);
    assert_eq!(bobs_view[0].comment_count, 1);
    assert!(bobs_view[0].viewer_has_liked);

    let alices_view = r.get_post(alice, p).await.unwrap();
    assert_eq!(alices_view.like_count, 1);
    assert!(!alices_view.viewer_has_liked);
}

#[tokio::test]
async fn create_post_content_rules() {
    let (r, _clock) = clocked();
    let alice = user(&r, "alice").await;

    let err = r.create_post(alice, NewPost { content: "   ".into(), media: vec![] }).await.unwrap_err();
    assert!(matches!(err, RepoError::EmptyContent));

    let p = r
        .create_post(alice, NewPost { content: "".into(), media: vec![media("aa11", MediaKind::Image)] })
        .await
        .unwrap();
    assert_eq!(p.content, "");
    assert_eq!(p.media.len(), 1);
    assert_eq!(p.like_count, 0);
    assert_eq!(p.comment_count, 0);
    assert!(!p.viewer_has_liked);
}

#[tokio::test]
async fn attachments_beyond_four_are_dropped_in_order() {
    let (r, _clock) = clocked();
    let alice = user(&r, "alice").await;
    let refs: Vec<MediaRef> = (0..6).map(|i| media(&format!("ref{i}"), MediaKind::Video)).collect();

    let p = r.create_post(alice, NewPost { content: "album".into(), media: refs }).await.unwrap();
    let got: Vec<(&str, i32)> = p.media.iter().map(|m| (m.reference.as_str(), m.position)).collect();
    assert_eq!(got, vec![("ref0", 0), ("ref1", 1), ("ref2", 2), ("ref3", 3)]);
}

#[tokio::test]
async fn delete_post_frees_unshared_media_only() {
    let (r, _clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;

    let shared = media("shared", MediaKind::Image);
    let unique = media("unique", MediaKind::Audio);
    let p = r
        .create_post(alice, NewPost { content: "a".into(), media: vec![shared.clone(), unique.clone()] })
        .await
        .unwrap()
        .id;
    r.create_post(alice, NewPost { content: "b".into(), media: vec![shared.clone()] }).await.unwrap();

    assert!(matches!(r.delete_post(bob, p).await.unwrap_err(), RepoError::Forbidden));
    let deleted = r.delete_post(alice, p).await.unwrap();
    assert!(deleted.deleted);
    assert_eq!(deleted.freed_media, vec![unique]);
    assert!(matches!(r.get_post(alice, p).await.unwrap_err(), RepoError::NotFound));
    assert!(matches!(r.delete_post(alice, p).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn trending_ranks_recent_posts_by_likes() {
    let (r, clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let carol = user(&r, "carol").await;

    let stale = post(&r, alice, "old news").await;
    clock.advance(Duration::days(8));
    let quiet = post(&r, alice, "quiet").await;
    let hot = post(&r, bob, "hot").await;

    for u in [alice, bob, carol] {
        r.toggle_like(u, stale).await.unwrap();
    }
    r.toggle_like(carol, hot).await.unwrap();

    // carol follows nobody, trending still shows everyone
    let trending = r.trending(carol).await.unwrap();
    let ids: Vec<i64> = trending.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![hot, quiet]);
    assert!(trending[0].viewer_has_liked);
}

#[tokio::test]
async fn author_scope_backs_profiles() {
    let (r, clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    post(&r, alice, "one").await;
    clock.advance(Duration::minutes(1));
    post(&r, alice, "two").await;
    post(&r, bob, "other").await;

    let posts = r.compose(bob, FeedScope::Author(alice)).await.unwrap();
    let texts: Vec<&str> = posts.iter().map(|p| p.content.as_str()).collect();
    assert_eq!(texts, vec!["two", "one"]);
    let profile = r.profile(bob, "alice").await.unwrap();
    assert_eq!(profile.posts.len(), 2);
}

#[tokio::test]
async fn recommended_skips_self_and_followees() {
    let (r, _clock) = clocked();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let mut others = Vec::new();
    for i in 0..6 {
        others.push(user(&r, &format!("user{i}")).await);
    }
    r.follow(alice, bob).await.unwrap();
    // user3 is the most followed candidate
    r.follow(bob, others[3]).await.unwrap();

    let recs = r.recommended_users(alice).await.unwrap();
    assert_eq!(recs.len(), RECOMMENDED_LIMIT);
    assert_eq!(recs[0].id, others[3]);
    assert!(recs.iter().all(|u| u.id != alice && u.id != bob && !u.is_following));
}
