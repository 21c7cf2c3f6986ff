#![cfg(feature = "inmem-store")]

use pulse::models::{NewUser, NotificationKind, ProfileUpdate, BIO_MAX_CHARS, DEFAULT_AVATAR_COLOR};
use pulse::repo::inmem::InMemRepo;
use pulse::repo::{GraphRepo, NotificationRepo, RepoError, UserDirectory};

fn repo() -> InMemRepo {
    InMemRepo::ephemeral()
}

async fn user(r: &InMemRepo, name: &str) -> i64 {
    r.upsert_user(NewUser { username: name.into(), bio: None, avatar_color: None })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn toggle_follow_twice_restores_state() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;

    assert_eq!(r.follower_count(bob).await.unwrap(), 0);
    assert!(r.toggle_follow(alice, bob).await.unwrap().following);
    assert!(r.is_following(alice, bob).await.unwrap());
    assert_eq!(r.follower_count(bob).await.unwrap(), 1);
    assert_eq!(r.following_count(alice).await.unwrap(), 1);

    assert!(!r.toggle_follow(alice, bob).await.unwrap().following);
    assert!(!r.is_following(alice, bob).await.unwrap());
    assert_eq!(r.follower_count(bob).await.unwrap(), 0);
}

#[tokio::test]
async fn self_follow_is_rejected_without_an_edge() {
    let r = repo();
    let alice = user(&r, "alice").await;

    let err = r.toggle_follow(alice, alice).await.unwrap_err();
    assert!(matches!(err, RepoError::InvalidOperation(_)));
    let err = r.follow(alice, alice).await.unwrap_err();
    assert!(matches!(err, RepoError::InvalidOperation(_)));
    assert!(!r.is_following(alice, alice).await.unwrap());
    assert_eq!(r.follower_count(alice).await.unwrap(), 0);
}

#[tokio::test]
async fn follow_and_unfollow_are_idempotent() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;

    assert!(r.follow(alice, bob).await.unwrap());
    assert!(!r.follow(alice, bob).await.unwrap());
    assert_eq!(r.follower_count(bob).await.unwrap(), 1);
    assert!(r.unfollow(alice, bob).await.unwrap());
    assert!(!r.unfollow(alice, bob).await.unwrap());
    assert_eq!(r.follower_count(bob).await.unwrap(), 0);
}

#[tokio::test]
async fn following_an_unknown_user_is_not_found() {
    let r = repo();
    let alice = user(&r, "alice").await;
    assert!(matches!(r.toggle_follow(alice, 999).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn follow_notifies_the_followee() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;

    r.toggle_follow(alice, bob).await.unwrap();
    let notes = r.list_notifications(bob).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::Follow);
    assert_eq!(notes[0].actor_id, alice);
    assert_eq!(notes[0].target_post_id, None);
}

#[tokio::test]
async fn followee_set_and_lists() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    let carol = user(&r, "carol").await;

    r.follow(alice, bob).await.unwrap();
    r.follow(alice, carol).await.unwrap();
    r.follow(carol, bob).await.unwrap();

    let set = r.followee_set(alice).await.unwrap();
    assert_eq!(set.len(), 2);
    assert!(set.contains(&bob) && set.contains(&carol));
    assert!(r.followee_set(bob).await.unwrap().is_empty());

    // bob's followers as seen by alice: alice follows carol, not herself
    let followers = r.list_followers(alice, bob).await.unwrap();
    let ids: Vec<i64> = followers.iter().map(|u| u.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&alice) && ids.contains(&carol));
    let carol_entry = followers.iter().find(|u| u.id == carol).unwrap();
    assert!(carol_entry.is_following);

    let following = r.list_following(bob, alice).await.unwrap();
    assert_eq!(following.len(), 2);
    assert!(following.iter().all(|u| !u.is_following));

    assert!(matches!(r.list_followers(alice, 999).await.unwrap_err(), RepoError::NotFound));
    assert!(matches!(r.list_following(alice, 999).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_toggle_follow_on_one_pair_stays_consistent() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;

    let handles: Vec<_> = (0..15)
        .map(|_| {
            let r = r.clone();
            tokio::spawn(async move { r.toggle_follow(alice, bob).await })
        })
        .collect();
    let mut followed = 0;
    for h in handles {
        if h.await.unwrap().unwrap().following {
            followed += 1;
        }
    }
    // toggles alternate, so an odd count ends on following
    assert_eq!(followed, 8);
    assert!(r.is_following(alice, bob).await.unwrap());
    assert_eq!(r.follower_count(bob).await.unwrap(), 1);
    assert_eq!(r.following_count(alice).await.unwrap(), 1);

    let notes = r.list_notifications(bob).await.unwrap();
    assert_eq!(notes.len(), 8);
    assert!(notes.iter().all(|n| n.kind == NotificationKind::Follow && n.actor_id == alice));
}

#[tokio::test]
async fn identities_are_mirrored_on_first_sight() {
    let r = repo();
    let mirrored = r.ensure_user(41).await.unwrap();
    assert_eq!(mirrored.id, 41);
    assert_eq!(mirrored.username, "user41");
    assert_eq!(r.ensure_user(41).await.unwrap().created_at, mirrored.created_at);

    // ids handed out by the directory later skip past mirrored ones
    let carol = user(&r, "carol").await;
    assert!(carol > 41);
    assert!(r.toggle_follow(carol, 41).await.unwrap().following);
    assert_eq!(r.follower_count(41).await.unwrap(), 1);
}

#[tokio::test]
async fn update_profile_edits_and_guards_usernames() {
    let r = repo();
    user(&r, "alice").await;

    let me = r
        .update_profile(7, ProfileUpdate {
            username: Some(" dana ".into()),
            bio: Some(format!("  {}", "x".repeat(300))),
            avatar_color: None,
        })
        .await
        .unwrap();
    assert_eq!(me.id, 7);
    assert_eq!(me.username, "dana");
    assert_eq!(me.bio.chars().count(), BIO_MAX_CHARS);
    assert_eq!(me.avatar_color, DEFAULT_AVATAR_COLOR);

    let me = r
        .update_profile(7, ProfileUpdate { avatar_color: Some("#123456".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(me.username, "dana");
    assert_eq!(me.avatar_color, "#123456");

    let taken = ProfileUpdate { username: Some("alice".into()), ..Default::default() };
    assert!(matches!(r.update_profile(7, taken).await.unwrap_err(), RepoError::Conflict));
    let blank = ProfileUpdate { username: Some("  ".into()), ..Default::default() };
    assert!(matches!(r.update_profile(7, blank).await.unwrap_err(), RepoError::EmptyContent));
    assert_eq!(r.find_user_by_username("dana").await.unwrap().id, 7);
}

#[tokio::test]
async fn search_users_excludes_viewer_and_ranks_by_followers() {
    let r = repo();
    let viewer = user(&r, "anna").await;
    let ann = user(&r, "Annabel").await;
    let hannah = user(&r, "hannah").await;
    user(&r, "zed").await;

    r.follow(viewer, hannah).await.unwrap();

    let found = r.search_users(viewer, "ANN").await.unwrap();
    let ids: Vec<i64> = found.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![hannah, ann]);
    assert!(found[0].is_following);
    assert!(r.search_users(viewer, "   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn profile_counts_and_unknown_user() {
    let r = repo();
    let alice = user(&r, "alice").await;
    let bob = user(&r, "bob").await;
    r.follow(alice, bob).await.unwrap();

    let p = r.profile(alice, "bob").await.unwrap();
    assert_eq!(p.user.id, bob);
    assert_eq!(p.followers_count, 1);
    assert_eq!(p.following_count, 0);
    assert!(p.is_following);
    assert!(p.posts.is_empty());

    assert!(matches!(r.profile(alice, "nobody").await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn upsert_user_updates_existing_account() {
    let r = repo();
    let first = r
        .upsert_user(NewUser { username: "alice".into(), bio: None, avatar_color: None })
        .await
        .unwrap();
    let again = r
        .upsert_user(NewUser { username: "alice".into(), bio: Some("hi".into()), avatar_color: Some("#ff0000".into()) })
        .await
        .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(again.bio, "hi");
    assert_eq!(r.find_user_by_username("alice").await.unwrap().avatar_color, "#ff0000");
    assert!(matches!(
        r.upsert_user(NewUser { username: "  ".into(), bio: None, avatar_color: None }).await.unwrap_err(),
        RepoError::EmptyContent
    ));
}
