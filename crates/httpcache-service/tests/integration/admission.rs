use httpcache_service::cache_error::CacheError;
use httpcache_service::coordinator::{Completion, Mode};
use httpcache_service::types::RequestInfo;

use crate::{TestCache, resumable_response};

#[test]
fn test_admission_is_fifo() {
    let mut cache = TestCache::new();
    let t1 = cache.transaction("t1", "k", Mode::READ_WRITE);
    let t2 = cache.transaction("t2", "k", Mode::READ_WRITE);
    let t3 = cache.transaction("t3", "k", Mode::READ_WRITE);

    assert!(cache.coordinator.open_entry("k", t1).is_pending());
    cache.recorder.next_call().opened();
    assert_eq!(cache.drain(), "t1: ok");
    let entry = cache.entry_of(t1).unwrap();

    for txn in [t1, t2, t3] {
        assert!(cache.coordinator.add_transaction_to_entry(entry, txn).is_pending());
    }
    // one pass, one admission
    assert_eq!(cache.drain(), "t1: ok");

    let done = cache.coordinator.done_with_response_headers(entry, t1, false);
    assert_eq!(cache.ready(t1, done), "t1: ok");
    assert_eq!(cache.drain(), "t2: ok");

    let done = cache.coordinator.done_with_response_headers(entry, t2, false);
    assert_eq!(cache.ready(t2, done), "t2: pending");
    assert_eq!(cache.drain(), "t3: ok");

    let done = cache.coordinator.done_with_response_headers(entry, t3, false);
    assert_eq!(cache.ready(t3, done), "t3: pending");
    assert_eq!(cache.drain(), "");
    cache.check_roles(entry);

    // every writer hands over to the next one
    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.writer(), Some(t1));
    assert_eq!(active.done_headers_queue().collect::<Vec<_>>(), [t2, t3]);

    cache.coordinator.done_with_entry(entry, t1, false, false);
    assert_eq!(cache.drain(), "t2: ok");
    assert_eq!(cache.coordinator.entry(entry).unwrap().writer(), Some(t2));
    cache.check_roles(entry);

    cache.coordinator.done_with_entry(entry, t2, false, false);
    assert_eq!(cache.drain(), "t3: ok");
    assert_eq!(cache.coordinator.entry(entry).unwrap().writer(), Some(t3));

    cache.coordinator.done_with_entry(entry, t3, false, false);
    assert_eq!(cache.drain(), "");

    // the last transaction took the entry with it, and the entry was closed once
    assert!(cache.coordinator.entry(entry).is_none());
    assert_eq!(cache.coordinator.active_entry_for("k"), None);
    assert_eq!(cache.coordinator.active_entry_count(), 0);
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    backend open k
    entry close k
    ");
}

#[test]
fn test_done_headers_queue_goes_first() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let r1 = cache.transaction("r1", "k", Mode::READ);
    let a = cache.transaction("a", "k", Mode::READ);
    let b = cache.transaction("b", "k", Mode::READ);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, r1);
    let done = cache.coordinator.done_with_response_headers(entry, r1, false);
    assert!(done.is_pending());
    assert_eq!(cache.drain(), "");

    cache.admit(entry, a);
    assert!(cache.coordinator.add_transaction_to_entry(entry, b).is_pending());
    assert_eq!(cache.drain(), "");

    // both queues are waiting once the writer is gone
    cache.coordinator.done_with_entry(entry, w, false, false);
    assert_eq!(cache.drain(), "r1: ok");
    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.readers().collect::<Vec<_>>(), [r1]);
    assert_eq!(active.headers_transaction(), Some(a));
    assert_eq!(active.add_to_entry_queue().collect::<Vec<_>>(), [b]);

    let done = cache.coordinator.done_with_response_headers(entry, a, false);
    assert!(done.is_pending());
    insta::assert_snapshot!(cache.drain(), @r"
    a: ok
    b: ok
    ");
    cache.check_roles(entry);
}

#[test]
fn test_writer_does_not_overtake_done_headers_queue() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let r1 = cache.transaction("r1", "k", Mode::READ);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, r1);
    assert!(
        cache
            .coordinator
            .done_with_response_headers(entry, r1, false)
            .is_pending()
    );
    assert_eq!(cache.drain(), "");
    cache.admit(entry, v);

    // the writer is gone, but r1 has not been promoted yet
    cache.coordinator.done_with_entry(entry, w, false, false);
    let done = cache.coordinator.done_with_response_headers(entry, v, false);
    assert_eq!(cache.ready(v, done), "v: pending");

    insta::assert_snapshot!(cache.drain(), @r"
    r1: ok
    v: ok
    ");
    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.writer(), Some(v));
    assert_eq!(active.readers().collect::<Vec<_>>(), [r1]);
    cache.check_roles(entry);
}

#[test]
fn test_failed_writer_restarts_everyone() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let r = cache.transaction("r", "k", Mode::READ);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let a = cache.transaction("a", "k", Mode::READ);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, r);
    assert!(
        cache
            .coordinator
            .done_with_response_headers(entry, r, false)
            .is_pending()
    );
    cache.admit(entry, v);
    assert!(cache.coordinator.add_transaction_to_entry(entry, a).is_pending());
    assert_eq!(cache.drain(), "");
    cache.recorder.take_log();

    // the writer never got a usable response
    cache.coordinator.done_with_entry(entry, w, true, false);
    insta::assert_snapshot!(cache.drain(), @r"
    r: cache race
    a: cache race
    ");
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    entry doom k
    entry close k
    ");
    assert_eq!(cache.coordinator.active_entry_for("k"), None);

    // the validating transaction learns about it on its next step
    assert_eq!(
        cache.coordinator.done_with_response_headers(entry, v, false),
        Completion::Ready(Err(CacheError::CacheRace))
    );
    let txn = cache.coordinator.transaction_mut(v).unwrap();
    assert!(txn.take_validating_cannot_proceed());
    assert_eq!(txn.entry(), None);
}

#[test]
fn test_cancelled_writer_keeps_truncated_entry() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let r = cache.transaction("r", "k", Mode::READ);
    let entry = cache.install_writer("k", w);
    cache
        .coordinator
        .transaction_mut(w)
        .unwrap()
        .set_response_info(Some(resumable_response()));

    cache.admit(entry, r);
    assert!(
        cache
            .coordinator
            .done_with_response_headers(entry, r, false)
            .is_pending()
    );
    assert_eq!(cache.drain(), "");
    cache.recorder.take_log();

    cache.coordinator.done_with_entry(entry, w, true, false);
    assert!(cache.coordinator.transaction(w).unwrap().is_truncated());
    assert_eq!(cache.drain(), "r: cache race");
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    entry write_info k truncated=true
    entry close k
    ");
    assert!(cache.coordinator.entry(entry).is_none());
}

#[test]
fn test_cancelled_head_request_has_no_dependents() {
    let mut cache = TestCache::new();
    let w = cache.transaction_with("w", RequestInfo::new("HEAD", "k"), Mode::READ_WRITE);
    let entry = cache.install_writer("k", w);
    cache.recorder.take_log();

    cache.coordinator.done_with_entry(entry, w, true, false);
    assert!(cache.coordinator.is_doomed(entry));
    assert_eq!(cache.drain(), "");

    assert_eq!(cache.coordinator.doomed_entry_count(), 0);
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    entry doom k
    entry close k
    ");
}

#[test]
fn test_validation_mismatch_dooms_entry() {
    let mut cache = TestCache::new();
    let x = cache.transaction("x", "k", Mode::READ);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let a = cache.transaction("a", "k", Mode::READ);
    let b = cache.transaction("b", "k", Mode::READ);

    assert!(cache.coordinator.open_entry("k", x).is_pending());
    cache.recorder.next_call().opened();
    assert_eq!(cache.drain(), "x: ok");
    let entry = cache.entry_of(x).unwrap();

    cache.admit(entry, x);
    assert!(
        cache
            .coordinator
            .done_with_response_headers(entry, x, false)
            .is_pending()
    );
    assert_eq!(cache.drain(), "x: ok");

    assert_eq!(cache.coordinator.open_entry("k", v), Completion::Ready(Ok(())));
    cache.admit(entry, v);
    assert!(cache.coordinator.add_transaction_to_entry(entry, a).is_pending());
    assert!(cache.coordinator.add_transaction_to_entry(entry, b).is_pending());
    assert_eq!(cache.drain(), "");
    cache.recorder.take_log();

    cache.coordinator.doom_entry_validation_no_match(entry);
    assert_eq!(cache.entry_of(v), None);
    insta::assert_snapshot!(cache.drain(), @r"
    a: cache race
    b: cache race
    ");
    assert!(cache.coordinator.is_doomed(entry));
    assert_eq!(cache.coordinator.active_entry_for("k"), None);

    // the reader keeps the doomed entry while v stores the new response
    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.readers().collect::<Vec<_>>(), [x]);
    assert!(cache.coordinator.create_entry("k", v).is_pending());
    cache.recorder.next_call().created();
    assert_eq!(cache.drain(), "v: ok");
    assert_ne!(cache.entry_of(v), Some(entry));

    cache.coordinator.done_with_entry(entry, x, false, false);
    assert_eq!(cache.drain(), "");
    assert_eq!(cache.coordinator.doomed_entry_count(), 0);
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    entry doom k
    backend create k
    entry close k
    ");
}

#[test]
fn test_released_transaction_leaves_queue() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let v = cache.transaction("v", "k", Mode::READ);
    let a = cache.transaction("a", "k", Mode::READ);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, v);
    assert!(cache.coordinator.add_transaction_to_entry(entry, a).is_pending());
    assert_eq!(cache.drain(), "");

    cache.coordinator.release_transaction(a);
    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.add_to_entry_queue().count(), 0);

    // a reader leaving does not disturb the writer
    let done = cache.coordinator.done_with_response_headers(entry, v, false);
    assert!(done.is_pending());
    assert_eq!(cache.drain(), "");
    cache.coordinator.release_transaction(v);
    assert_eq!(cache.drain(), "");
    assert!(!cache.coordinator.is_doomed(entry));
    assert_eq!(cache.coordinator.entry(entry).unwrap().writer(), Some(w));
}

#[test]
fn test_bumped_validator_can_start_over() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let entry = cache.install_writer("k", w);
    cache.admit(entry, v);
    cache.recorder.take_log();

    cache.coordinator.done_with_entry(entry, w, true, false);
    assert_eq!(cache.drain(), "");
    assert_eq!(cache.entry_of(v), None);
    assert_eq!(cache.coordinator.active_entry_for("k"), None);

    // v looks the key up again and validates against the stored entry
    assert!(cache.coordinator.open_entry("k", v).is_pending());
    cache.recorder.next_call().opened();
    assert_eq!(cache.drain(), "v: ok");
    let reopened = cache.entry_of(v).unwrap();
    cache.admit(reopened, v);

    assert_eq!(
        cache.coordinator.done_with_response_headers(reopened, v, false),
        Completion::Ready(Ok(()))
    );
    let active = cache.coordinator.entry(reopened).unwrap();
    assert_eq!(active.writer(), Some(v));
    assert_eq!(active.headers_transaction(), None);
    insta::assert_snapshot!(cache.recorder.take_log(), @r"
    entry doom k
    entry close k
    backend open k
    ");
}

#[test]
fn test_cancelled_queued_writer_fails_entry() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let a = cache.transaction("a", "k", Mode::READ);
    let b = cache.transaction("b", "k", Mode::READ);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, v);
    let done = cache.coordinator.done_with_response_headers(entry, v, false);
    assert_eq!(cache.ready(v, done), "v: pending");
    cache.admit(entry, a);
    assert!(cache.coordinator.add_transaction_to_entry(entry, b).is_pending());
    assert_eq!(cache.drain(), "");
    cache.recorder.take_log();

    // v would have written the body everyone behind it reads
    cache.coordinator.done_with_entry(entry, v, true, false);
    assert_eq!(cache.drain(), "b: cache race");
    assert!(cache.coordinator.is_doomed(entry));
    assert_eq!(cache.coordinator.active_entry_for("k"), None);

    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.writer(), Some(w));
    assert_eq!(active.headers_transaction(), None);
    assert_eq!(active.done_headers_queue().count(), 0);
    assert_eq!(active.add_to_entry_queue().count(), 0);
    assert!(
        cache
            .coordinator
            .transaction_mut(a)
            .unwrap()
            .take_validating_cannot_proceed()
    );
    insta::assert_snapshot!(cache.recorder.take_log(), @"entry doom k");
}

#[test]
fn test_cancelled_validator_fails_entry() {
    let mut cache = TestCache::new();
    let w = cache.transaction("w", "k", Mode::READ_WRITE);
    let r = cache.transaction("r", "k", Mode::READ);
    let v = cache.transaction("v", "k", Mode::READ_WRITE);
    let a = cache.transaction("a", "k", Mode::READ);
    let entry = cache.install_writer("k", w);

    cache.admit(entry, r);
    let done = cache.coordinator.done_with_response_headers(entry, r, false);
    assert_eq!(cache.ready(r, done), "r: pending");
    cache.admit(entry, v);
    assert!(cache.coordinator.add_transaction_to_entry(entry, a).is_pending());
    assert_eq!(cache.drain(), "");
    cache.recorder.take_log();

    // the headers phase of a writing transaction ends without a usable response
    cache.coordinator.done_with_entry(entry, v, true, false);
    insta::assert_snapshot!(cache.drain(), @r"
    r: cache race
    a: cache race
    ");
    assert_eq!(cache.entry_of(v), None);
    assert!(cache.coordinator.is_doomed(entry));

    let active = cache.coordinator.entry(entry).unwrap();
    assert_eq!(active.writer(), Some(w));
    assert!(active.readers().next().is_none());
    insta::assert_snapshot!(cache.recorder.take_log(), @"entry doom k");

    // the writer takes the doomed entry with it
    cache.coordinator.done_with_entry(entry, w, false, false);
    assert_eq!(cache.drain(), "");
    assert_eq!(cache.coordinator.doomed_entry_count(), 0);
    insta::assert_snapshot!(cache.recorder.take_log(), @"entry close k");
}
