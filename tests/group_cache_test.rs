use std::sync::Arc;
use std::time::Duration;
use wasession::group_cache::GroupMetadataCache;
use wasession::protocol::ProtocolSession;
use wasession::test_utils::{MockSession, wait_until};
use wasession::types::events::GroupMetadata;
use wasession::types::jid::Jid;

fn group(jid: &str, subject: &str) -> GroupMetadata {
    GroupMetadata {
        id: jid.parse().unwrap(),
        subject: subject.to_string(),
        owner: None,
        description: None,
        creation: None,
        participants: Vec::new(),
    }
}

const GROUP_JID: &str = "120363021033254949@g.us";

#[tokio::test]
async fn fresh_entry_is_served_without_a_network_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache = GroupMetadataCache::new(Duration::from_secs(3600));
    let mock = MockSession::new();
    let session: Arc<dyn ProtocolSession> = mock.clone();

    cache.insert(group(GROUP_JID, "Cached"));

    let jid: Jid = GROUP_JID.parse().unwrap();
    let meta = cache.get(&session, &jid).await.unwrap();
    assert_eq!(meta.subject, "Cached");
    assert_eq!(mock.group_fetch_count(), 0);
}

#[tokio::test]
async fn miss_fetches_inline_and_caches() {
    let cache = GroupMetadataCache::new(Duration::from_secs(3600));
    let mock = MockSession::new();
    mock.set_groups(vec![group(GROUP_JID, "Fetched")]);
    let session: Arc<dyn ProtocolSession> = mock.clone();

    let jid: Jid = GROUP_JID.parse().unwrap();
    let meta = cache.get(&session, &jid).await.unwrap();
    assert_eq!(meta.subject, "Fetched");
    assert_eq!(mock.group_fetch_count(), 1);

    // Second read comes from the cache.
    cache.get(&session, &jid).await.unwrap();
    assert_eq!(mock.group_fetch_count(), 1);
}

#[tokio::test]
async fn expired_entry_returns_stale_value_and_refreshes_in_background() {
    let cache = GroupMetadataCache::new(Duration::ZERO);
    let mock = MockSession::new();
    mock.set_groups(vec![group(GROUP_JID, "New")]);
    let session: Arc<dyn ProtocolSession> = mock.clone();

    cache.insert(group(GROUP_JID, "Old"));
    let jid: Jid = GROUP_JID.parse().unwrap();

    // The stale value comes back immediately, no blocking on the fetch.
    let meta = cache.get(&session, &jid).await.unwrap();
    assert_eq!(meta.subject, "Old");

    let mock_for_wait = mock.clone();
    assert!(wait_until(|| mock_for_wait.group_fetch_count() >= 1, 2_000).await);

    // Once the background refresh lands, reads observe the new subject.
    let mut refreshed = false;
    for _ in 0..100 {
        if cache.get(&session, &jid).await.unwrap().subject == "New" {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed, "background refresh never replaced the entry");
}

#[tokio::test]
async fn failed_refresh_fails_open_on_the_old_value() {
    let cache = GroupMetadataCache::new(Duration::ZERO);
    let mock = MockSession::new();
    mock.fail_group_fetch
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let session: Arc<dyn ProtocolSession> = mock.clone();

    cache.insert(group(GROUP_JID, "Old"));
    let jid: Jid = GROUP_JID.parse().unwrap();

    let meta = cache.get(&session, &jid).await.unwrap();
    assert_eq!(meta.subject, "Old");

    let mock_for_wait = mock.clone();
    assert!(wait_until(|| mock_for_wait.group_fetch_count() >= 1, 2_000).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still the old value, not an eviction and not an error.
    let meta = cache.get(&session, &jid).await.unwrap();
    assert_eq!(meta.subject, "Old");
}

#[tokio::test]
async fn sweep_refreshes_every_joined_group() {
    let cache = GroupMetadataCache::new(Duration::from_secs(3600));
    let mock = MockSession::new();
    mock.set_groups(vec![
        group("111@g.us", "One"),
        group("222@g.us", "Two"),
        group("333@g.us", "Three"),
    ]);
    let session: Arc<dyn ProtocolSession> = mock.clone();

    cache.force_refresh_all(&session).await;

    assert_eq!(cache.len(), 3);
    assert_eq!(mock.group_fetch_count(), 3);
}

#[tokio::test]
async fn non_group_jid_is_never_cached() {
    let cache = GroupMetadataCache::new(Duration::from_secs(3600));
    let mock = MockSession::new();
    let session: Arc<dyn ProtocolSession> = mock.clone();

    let jid: Jid = "5544999999999@s.whatsapp.net".parse().unwrap();
    assert!(cache.get(&session, &jid).await.is_none());
    assert_eq!(mock.group_fetch_count(), 0);
    assert!(cache.is_empty());
}
