use httpcache_service::cache_error::CacheError;
use httpcache_service::cache_key;
use httpcache_service::coordinator::{Completion, Mode};
use url::Url;

use crate::TestCache;

#[test]
fn test_one_backend_call_per_key() {
    let mut cache = TestCache::new();
    let names = ["a", "b", "c", "d"];
    let txns: Vec<_> = names
        .iter()
        .map(|&name| cache.transaction(name, "k", Mode::READ))
        .collect();

    for &txn in &txns {
        assert!(cache.coordinator.open_entry("k", txn).is_pending());
    }
    assert_eq!(cache.recorder.outstanding_calls(), 1);
    assert_eq!(cache.coordinator.pending_op_len("k"), 4);

    cache.recorder.next_call().opened();
    insta::assert_snapshot!(cache.drain(), @r"
    a: ok
    b: ok
    c: ok
    d: ok
    ");

    let entry = cache.coordinator.active_entry_for("k").unwrap();
    assert!(cache.coordinator.entry(entry).unwrap().was_opened());
    for &txn in &txns {
        assert_eq!(cache.entry_of(txn), Some(entry));
    }
    assert_eq!(cache.coordinator.pending_op_len("k"), 0);
    assert_eq!(cache.recorder.take_log(), "backend open k");
}

#[test]
fn test_create_behind_successful_create() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    let b = cache.transaction("b", "k", Mode::READ_WRITE);
    let c = cache.transaction("c", "k", Mode::READ);

    assert!(cache.coordinator.create_entry("k", a).is_pending());
    assert!(cache.coordinator.create_entry("k", b).is_pending());
    assert!(cache.coordinator.open_entry("k", c).is_pending());

    cache.recorder.next_call().created();
    insta::assert_snapshot!(cache.drain(), @r"
    a: ok
    b: cache entry could not be created
    c: ok
    ");

    let entry = cache.coordinator.active_entry_for("k").unwrap();
    assert_eq!(cache.entry_of(a), Some(entry));
    assert_eq!(cache.entry_of(b), None);
    assert_eq!(cache.entry_of(c), Some(entry));
}

#[test]
fn test_requests_behind_failed_create() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    let b = cache.transaction("b", "k", Mode::READ_WRITE);
    let c = cache.transaction("c", "k", Mode::READ);
    let d = cache.transaction("d", "k", Mode::READ_WRITE);

    assert!(cache.coordinator.create_entry("k", a).is_pending());
    assert!(cache.coordinator.create_entry("k", b).is_pending());
    assert!(cache.coordinator.open_entry("k", c).is_pending());
    assert!(cache.coordinator.open_or_create_entry("k", d).is_pending());

    cache.recorder.next_call().fail(CacheError::Failed);
    insta::assert_snapshot!(cache.drain(), @r"
    a: backend operation failed
    b: backend operation failed
    c: cache race
    d: cache race
    ");
    assert_eq!(cache.coordinator.active_entry_for("k"), None);
}

#[test]
fn test_create_behind_failed_open() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ);
    let b = cache.transaction("b", "k", Mode::READ_WRITE);
    let c = cache.transaction("c", "k", Mode::READ);

    assert!(cache.coordinator.open_entry("k", a).is_pending());
    assert!(cache.coordinator.create_entry("k", b).is_pending());
    assert!(cache.coordinator.open_entry("k", c).is_pending());

    cache.recorder.next_call().fail(CacheError::NotFound);
    insta::assert_snapshot!(cache.drain(), @r"
    a: not found
    b: cache race
    c: cache race
    ");
}

#[test]
fn test_doom_fails_queued_requests() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    let b = cache.transaction("b", "k", Mode::READ);
    let c = cache.transaction("c", "k", Mode::READ_WRITE);

    assert!(cache.coordinator.doom_entry("k", Some(a)).is_pending());
    assert!(cache.coordinator.open_entry("k", b).is_pending());
    assert!(cache.coordinator.create_entry("k", c).is_pending());

    let call = cache.recorder.next_call();
    assert_eq!(call.op, "doom");
    call.doomed();
    insta::assert_snapshot!(cache.drain(), @r"
    a: ok
    b: cache race
    c: cache race
    ");
    assert_eq!(cache.recorder.outstanding_calls(), 0);
}

#[test]
fn test_withdrawn_creator_leaves_no_entry_behind() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    let b = cache.transaction("b", "k", Mode::READ);

    assert!(cache.coordinator.create_entry("k", a).is_pending());
    assert!(cache.coordinator.open_entry("k", b).is_pending());
    cache.coordinator.remove_pending_transaction(a);
    assert!(!cache.coordinator.transaction(a).unwrap().is_cache_pending());

    cache.recorder.next_call().created();
    assert_eq!(cache.drain(), "b: cache race");
    assert_eq!(cache.coordinator.active_entry_for("k"), None);
    assert_eq!(cache.entry_of(a), None);
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    backend create k
    entry doom k
    entry close k
    ");
}

#[test]
fn test_withdrawn_opener_keeps_stored_entry() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ);

    assert!(cache.coordinator.open_entry("k", a).is_pending());
    cache.coordinator.release_transaction(a);

    cache.recorder.next_call().opened();
    assert_eq!(cache.drain(), "");
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    backend open k
    entry close k
    ");
}

#[test]
fn test_released_opener_closes_unused_entry() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ);

    assert!(cache.coordinator.open_entry("k", a).is_pending());
    cache.recorder.next_call().opened();
    assert_eq!(cache.drain(), "a: ok");
    let entry = cache.entry_of(a).unwrap();

    // a never joined the entry it opened
    cache.coordinator.release_transaction(a);
    assert_eq!(cache.drain(), "");
    assert_eq!(cache.coordinator.active_entry_for("k"), None);
    assert!(cache.coordinator.entry(entry).is_none());
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    backend open k
    entry close k
    ");
}

#[test]
fn test_completion_after_teardown_closes_entry() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    assert!(cache.coordinator.create_entry("k", a).is_pending());

    let call = cache.recorder.next_call();
    let recorder = cache.recorder.clone();
    drop(cache);
    assert_eq!(recorder.take_log(), "backend create k");

    call.created();
    assert_eq!(recorder.take_log(), "entry close k");
}

#[test]
fn test_active_entry_is_handed_out_right_away() {
    let mut cache = TestCache::new();
    let writer = cache.transaction("w", "k", Mode::READ_WRITE);
    let entry = cache.install_writer("k", writer);
    cache.recorder.take_log();

    let b = cache.transaction("b", "k", Mode::READ);
    let c = cache.transaction("c", "k", Mode::READ_WRITE);
    let d = cache.transaction("d", "k", Mode::READ_WRITE);
    assert_eq!(cache.coordinator.open_entry("k", b), Completion::Ready(Ok(())));
    assert_eq!(
        cache.coordinator.create_entry("k", c),
        Completion::Ready(Err(CacheError::CreateFailure))
    );
    assert_eq!(
        cache.coordinator.open_or_create_entry("k", d),
        Completion::Ready(Ok(()))
    );
    assert_eq!(cache.entry_of(b), Some(entry));
    assert_eq!(cache.entry_of(d), Some(entry));
    assert_eq!(cache.recorder.outstanding_calls(), 0);
    assert_eq!(cache.recorder.take_log(), "");
}

#[test]
fn test_doom_main_entry_for_url() {
    let mut cache = TestCache::new();
    let url = Url::parse("https://example.com/app.js#main").unwrap();
    let key = cache_key::generate(&url, 0);

    // without an active entry, the backend dooms it
    let _ = cache.transaction("w", &key, Mode::READ_WRITE);
    cache.coordinator.doom_main_entry_for_url(&url);
    assert_eq!(
        cache.recorder.take_log(),
        "backend doom https://example.com/app.js"
    );
    cache.recorder.next_call().doomed();
    assert_eq!(cache.drain(), "");
    assert_eq!(cache.coordinator.pending_op_len(&key), 0);

    let writer = cache.transaction("w", &key, Mode::READ_WRITE);
    let entry = cache.install_writer(&key, writer);
    cache.recorder.take_log();

    cache.coordinator.doom_main_entry_for_url(&url);
    assert!(cache.coordinator.is_doomed(entry));
    assert_eq!(cache.coordinator.active_entry_for(&key), None);
    assert_eq!(
        cache.recorder.take_log(),
        "entry doom https://example.com/app.js"
    );
}

#[tokio::test]
async fn test_completion_from_another_thread() {
    let mut cache = TestCache::new();
    let a = cache.transaction("a", "k", Mode::READ_WRITE);
    assert!(cache.coordinator.open_or_create_entry("k", a).is_pending());

    let call = cache.recorder.next_call();
    assert_eq!(call.op, "open_or_create");
    std::thread::spawn(move || call.created());

    cache.coordinator.run_next().await;
    assert_eq!(cache.drain(), "a: ok");
    let entry = cache.entry_of(a).unwrap();
    assert!(!cache.coordinator.entry(entry).unwrap().was_opened());
}
