#![cfg(feature = "inmem-store")]

use pulse::models::{NewPost, ProfileUpdate};
use pulse::repo::inmem::InMemRepo;
use pulse::repo::{FeedRepo, FeedScope, UserDirectory};

#[tokio::test]
async fn snapshot_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::at(dir.path());
    r.update_profile(5, ProfileUpdate { username: Some("erin".into()), ..Default::default() })
        .await
        .unwrap();
    let p = r.create_post(5, NewPost { content: "kept".into(), media: vec![] }).await.unwrap().id;

    assert!(dir.path().join("state.json").exists());
    assert!(!dir.path().join("state.json.tmp").exists());

    let reopened = InMemRepo::at(dir.path());
    assert_eq!(reopened.find_user_by_username("erin").await.unwrap().id, 5);
    assert_eq!(reopened.get_post(5, p).await.unwrap().content, "kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_leave_a_complete_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::at(dir.path());
    let author = r.ensure_user(1).await.unwrap().id;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let r = r.clone();
            tokio::spawn(async move {
                r.create_post(author, NewPost { content: format!("post {i}"), media: vec![] }).await
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let bytes = std::fs::read(dir.path().join("state.json")).unwrap();
    serde_json::from_slice::<serde_json::Value>(&bytes).unwrap();
    let reopened = InMemRepo::at(dir.path());
    assert_eq!(reopened.compose(author, FeedScope::Author(author)).await.unwrap().len(), 20);
}
