#![cfg(feature = "inmem-store")]

use pulse::models::{NewComment, NewPost, NewUser, NotificationKind};
use pulse::repo::inmem::InMemRepo;
use pulse::repo::{FeedRepo, NotificationRepo, ReactionRepo, RepoError, UserDirectory};

async fn user(r: &InMemRepo, name: &str) -> i64 {
    r.upsert_user(NewUser { username: name.into(), bio: None, avatar_color: None })
        .await
        .unwrap()
        .id
}

async fn post(r: &InMemRepo, author: i64, text: &str) -> i64 {
    r.create_post(author, NewPost { content: text.into(), media: vec![] }).await.unwrap().id
}

#[tokio::test]
async fn like_toggle_round_trip_with_notification() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let p = post(&r, alice, "hello").await;

    let t = r.toggle_like(bob, p).await.unwrap();
    assert!(t.liked);
    assert_eq!(t.like_count, 1);
    assert_eq!(r.like_count(p).await.unwrap(), t.like_count);

    let t = r.toggle_like(bob, p).await.unwrap();
    assert!(!t.liked);
    assert_eq!(t.like_count, 0);
    assert_eq!(r.like_count(p).await.unwrap(), 0);

    let likes: Vec<_> = r
        .list_notifications(alice)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Like)
        .collect();
    assert_eq!(likes.len(), 1);
    assert_eq!(likes[0].actor_id, bob);
    assert_eq!(likes[0].target_post_id, Some(p));
}

#[tokio::test]
async fn liking_a_missing_post_is_not_found() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    assert!(matches!(r.toggle_like(alice, 42).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_likes_from_distinct_users_all_count() {
    let r = InMemRepo::ephemeral();
    let author = user(&r, "author").await;
    let p = post(&r, author, "popular").await;
    let mut likers = Vec::new();
    for i in 0..16 {
        likers.push(user(&r, &format!("fan{i}")).await);
    }

    let handles: Vec<_> = likers
        .into_iter()
        .map(|u| {
            let r = r.clone();
            tokio::spawn(async move { r.toggle_like(u, p).await })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().unwrap().liked);
    }
    assert_eq!(r.like_count(p).await.unwrap(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_toggles_by_one_user_stay_consistent() {
    let r = InMemRepo::ephemeral();
    let author = user(&r, "author").await;
    let fan = user(&r, "fan").await;
    let p = post(&r, author, "flip").await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let r = r.clone();
            tokio::spawn(async move { r.toggle_like(fan, p).await })
        })
        .collect();
    let mut liked = 0;
    for h in handles {
        if h.await.unwrap().unwrap().liked {
            liked += 1;
        }
    }
    // an even number of toggles lands back where it started
    assert_eq!(liked, 10);
    assert_eq!(r.like_count(p).await.unwrap(), 0);
    // ten likes while unread collapse into one notification
    assert_eq!(r.unread_count(author).await.unwrap(), 1);
}

#[tokio::test]
async fn comments_are_trimmed_and_ordered() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let p = post(&r, alice, "post").await;

    let first = r.add_comment(bob, p, NewComment { content: "  first  ".into() }).await.unwrap();
    assert_eq!(first.content, "first");
    assert_eq!(first.author_username, "bob");
    r.add_comment(alice, p, NewComment { content: "second".into() }).await.unwrap();

    let comments = r.list_comments(p).await.unwrap();
    let texts: Vec<&str> = comments.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(texts, vec!["first", "second"]);

    let enriched = r.get_post(alice, p).await.unwrap();
    assert_eq!(enriched.comment_count, 2);
}

#[tokio::test]
async fn blank_comment_and_missing_post_are_rejected() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    let p = post(&r, alice, "post").await;

    let err = r.add_comment(alice, p, NewComment { content: " \n ".into() }).await.unwrap_err();
    assert!(matches!(err, RepoError::EmptyContent));
    let err = r.add_comment(alice, 999, NewComment { content: "hi".into() }).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound));
    assert!(r.list_comments(p).await.unwrap().is_empty());
    assert!(matches!(r.list_comments(999).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn comment_deletion_rights() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let carol = user(&r, "carol").await;
    let p = post(&r, alice, "post").await;

    let by_bob = r.add_comment(bob, p, NewComment { content: "bob here".into() }).await.unwrap();
    let by_carol = r.add_comment(carol, p, NewComment { content: "carol here".into() }).await.unwrap();

    // a stranger cannot remove someone else's comment
    assert!(matches!(r.delete_comment(carol, by_bob.id).await.unwrap_err(), RepoError::Forbidden));
    // the comment author can
    assert!(r.delete_comment(bob, by_bob.id).await.unwrap());
    // so can the post author
    assert!(r.delete_comment(alice, by_carol.id).await.unwrap());
    assert!(matches!(r.delete_comment(alice, by_carol.id).await.unwrap_err(), RepoError::NotFound));
    assert!(r.list_comments(p).await.unwrap().is_empty());
}

#[tokio::test]
async fn self_reactions_do_not_notify() {
    let r = InMemRepo::ephemeral();
    let alice = user(&r, "alice").await;
    let p = post(&r, alice, "mine").await;

    r.toggle_like(alice, p).await.unwrap();
    r.add_comment(alice, p, NewComment { content: "me again".into() }).await.unwrap();
    assert_eq!(r.unread_count(alice).await.unwrap(), 0);
    assert!(r.list_notifications(alice).await.unwrap().is_empty());
}
