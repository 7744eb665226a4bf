//! Integration tests for the cleanup-lock protocol.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use basalt_buffer::error::BufferError;
use basalt_buffer::pool::ReadBufferMode;
use basalt_common::types::ForkNumber;

use common::{harness, locator, rel};

#[test]
fn cleanup_lock_succeeds_immediately_on_sole_pin() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 7, ReadBufferMode::Normal, None)
        .unwrap();
    session.lock_for_cleanup(buf).unwrap();
    assert!(session.is_cleanup_ok(buf));
    assert!(session.buffer_is_exclusive_locked(buf).unwrap());
    session.unlock_release_buffer(buf).unwrap();
}

#[test]
fn cleanup_lock_waits_for_other_pins() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);

    // Session A holds a pin on block 7.
    let mut session_a = h.pool.new_session();
    let buf = session_a
        .read_buffer_extended(&relation, ForkNumber::Main, 7, ReadBufferMode::Normal, None)
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let waiter = {
        let pool = Arc::clone(&h.pool);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut session_b = pool.new_session();
            let relation = rel(1);
            let buf = session_b
                .read_buffer_extended(
                    &relation,
                    ForkNumber::Main,
                    7,
                    ReadBufferMode::Normal,
                    None,
                )
                .unwrap();
            barrier.wait();
            // Blocks until session A releases its pin.
            session_b.lock_for_cleanup(buf).unwrap();
            let ok = session_b.is_cleanup_ok(buf);
            session_b.unlock_release_buffer(buf).unwrap();
            ok
        })
    };

    barrier.wait();
    // Give B time to arm the waiter, then release.
    thread::sleep(Duration::from_millis(100));
    session_a.release_buffer(buf).unwrap();

    assert!(
        waiter.join().unwrap(),
        "the waiter came back holding a cleanup-strength lock"
    );
}

#[test]
fn conditional_cleanup_fails_fast_with_other_pins() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);

    let mut session_a = h.pool.new_session();
    let mut session_b = h.pool.new_session();

    let buf_a = session_a
        .read_buffer_extended(&relation, ForkNumber::Main, 2, ReadBufferMode::Normal, None)
        .unwrap();
    let buf_b = session_b
        .read_buffer_extended(&relation, ForkNumber::Main, 2, ReadBufferMode::Normal, None)
        .unwrap();

    assert!(!session_b.conditional_lock_for_cleanup(buf_b).unwrap());

    session_a.release_buffer(buf_a).unwrap();
    assert!(session_b.conditional_lock_for_cleanup(buf_b).unwrap());
    session_b.unlock_release_buffer(buf_b).unwrap();
}

#[test]
fn second_cleanup_waiter_is_rejected() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);

    // A pin that keeps everyone waiting.
    let mut blocker = h.pool.new_session();
    let blocker_buf = blocker
        .read_buffer_extended(&relation, ForkNumber::Main, 5, ReadBufferMode::Normal, None)
        .unwrap();

    let first_waiter = {
        let pool = Arc::clone(&h.pool);
        thread::spawn(move || {
            let mut session = pool.new_session();
            let relation = rel(1);
            let buf = session
                .read_buffer_extended(
                    &relation,
                    ForkNumber::Main,
                    5,
                    ReadBufferMode::Normal,
                    None,
                )
                .unwrap();
            session.lock_for_cleanup(buf).unwrap();
            session.unlock_release_buffer(buf).unwrap();
        })
    };

    // Let the first waiter arm the pin-count-waiter flag.
    thread::sleep(Duration::from_millis(150));

    let mut second = h.pool.new_session();
    let buf = second
        .read_buffer_extended(&relation, ForkNumber::Main, 5, ReadBufferMode::Normal, None)
        .unwrap();
    let err = second.lock_for_cleanup(buf).unwrap_err();
    assert!(matches!(err, BufferError::ConcurrentPinCountWaiters { .. }));
    second.release_buffer(buf).unwrap();
    drop(second);

    // Unblock the first waiter.
    blocker.release_buffer(blocker_buf).unwrap();
    first_waiter.join().unwrap();
}

#[test]
fn check_pinned_once_enforces_single_pin() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 0, ReadBufferMode::Normal, None)
        .unwrap();
    session.check_pinned_once(buf).unwrap();

    session.incr_ref(buf).unwrap();
    assert!(session.check_pinned_once(buf).is_err());
    assert!(session.lock_for_cleanup(buf).is_err());

    session.release_buffer(buf).unwrap();
    session.release_buffer(buf).unwrap();
}

#[test]
fn zero_and_cleanup_lock_mode_returns_cleanup_locked() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .read_buffer_extended(
            &relation,
            ForkNumber::Main,
            3,
            ReadBufferMode::ZeroAndCleanupLock,
            None,
        )
        .unwrap();
    assert!(session.is_cleanup_ok(buf));
    session.unlock_release_buffer(buf).unwrap();
}

#[test]
fn recovery_waiter_logs_conflict_but_still_acquires() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    h.wal.set_recovery(true);
    let relation = rel(1);

    let mut blocker = h.pool.new_session();
    let blocker_buf = blocker
        .read_buffer_extended(&relation, ForkNumber::Main, 1, ReadBufferMode::Normal, None)
        .unwrap();

    let waiter = {
        let pool = Arc::clone(&h.pool);
        thread::spawn(move || {
            let mut session = pool.new_session();
            let relation = rel(1);
            let buf = session
                .read_buffer_extended(
                    &relation,
                    ForkNumber::Main,
                    1,
                    ReadBufferMode::Normal,
                    None,
                )
                .unwrap();
            session.lock_for_cleanup(buf).unwrap();
            session.unlock_release_buffer(buf).unwrap();
        })
    };

    // Hold the pin past the deadlock timeout so the conflict path runs.
    thread::sleep(Duration::from_millis(1200));
    blocker.release_buffer(blocker_buf).unwrap();
    waiter.join().unwrap();
}

#[test]
fn unlock_buffers_clears_a_stale_waiter_flag() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 0, ReadBufferMode::Normal, None)
        .unwrap();
    // No waiter armed: this is a harmless no-op.
    session.unlock_buffers();
    session.release_buffer(buf).unwrap();
}
