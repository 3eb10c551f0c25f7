use std::sync::{Mutex, MutexGuard};
use std::thread;

use fdcore::fd::{self, ACTIVE_R, POLLED_R, READY_R};
use fdcore::Config;

fn nop(_fd: i32) {}

/// Serialises the tests of this file and makes sure the core is up.
/// The FD numbers used here are plain table slots; nothing is ever
/// closed, so they cannot collide with descriptors of the test binary.
fn setup() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    let _ = fdcore::init(Config::new().max_fds(2048).threads(2));
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn want_recv_arms_the_poller_when_not_ready() {
    let _serial = setup();
    let fd = 700;
    fd::insert(fd, 1, nop, 0b1);

    fd::want_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);
    assert!(fd::recv_active(fd));
    assert!(fd::recv_polled(fd));
    assert!(!fd::recv_ready(fd));

    // repeated want is a no-op
    fd::want_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);

    fd::remove(fd);
}

#[test]
fn want_recv_skips_polling_when_already_ready() {
    let _serial = setup();
    let fd = 701;
    fd::insert(fd, 1, nop, 0b1);

    fd::may_recv(fd);
    assert_eq!(fd::recv_state(fd), READY_R);

    fd::want_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | READY_R);
    assert!(!fd::recv_polled(fd));

    fd::remove(fd);
}

#[test]
fn stop_recv_round_trips_and_is_idempotent() {
    let _serial = setup();
    let fd = 702;
    fd::insert(fd, 1, nop, 0b1);

    fd::want_recv(fd);
    fd::stop_recv(fd);
    assert_eq!(fd::recv_state(fd), 0);

    fd::want_recv(fd);
    fd::stop_recv(fd);
    fd::stop_recv(fd);
    assert_eq!(fd::recv_state(fd), 0);

    fd::remove(fd);
}

#[test]
fn cant_recv_rearms_while_active() {
    let _serial = setup();
    let fd = 703;
    fd::insert(fd, 1, nop, 0b1);

    fd::want_recv(fd);
    fd::may_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | READY_R | POLLED_R);

    fd::cant_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);

    // without readiness the transition is a no-op
    fd::cant_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);

    fd::remove(fd);
}

#[test]
fn cant_recv_without_interest_only_drops_readiness() {
    let _serial = setup();
    let fd = 704;
    fd::insert(fd, 1, nop, 0b1);

    fd::may_recv(fd);
    fd::cant_recv(fd);
    assert_eq!(fd::recv_state(fd), 0);

    fd::remove(fd);
}

#[test]
fn done_recv_requires_polled_and_ready() {
    let _serial = setup();
    let fd = 705;
    fd::insert(fd, 1, nop, 0b1);

    // ready but not polled: no-op
    fd::may_recv(fd);
    fd::done_recv(fd);
    assert_eq!(fd::recv_state(fd), READY_R);

    fd::want_recv(fd); // ready, so no polling
    fd::cant_recv(fd); // now active and polled
    fd::may_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | READY_R | POLLED_R);

    fd::done_recv(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);

    fd::remove(fd);
}

#[test]
fn write_side_mirrors_read_side() {
    let _serial = setup();
    let fd = 706;
    fd::insert(fd, 1, nop, 0b1);

    fd::want_send(fd);
    assert_eq!(fd::send_state(fd), ACTIVE_R | POLLED_R);
    assert_eq!(fd::recv_state(fd), 0);

    fd::may_send(fd);
    fd::cant_send(fd);
    assert_eq!(fd::send_state(fd), ACTIVE_R | POLLED_R);

    fd::stop_send(fd);
    assert_eq!(fd::send_state(fd), 0);

    fd::remove(fd);
}

#[test]
fn stop_both_clears_both_directions_at_once() {
    let _serial = setup();
    let fd = 707;
    fd::insert(fd, 1, nop, 0b1);

    fd::want_recv(fd);
    fd::want_send(fd);
    assert!(fd::active(fd));

    fd::stop_both(fd);
    assert_eq!(fd::recv_state(fd), 0);
    assert_eq!(fd::send_state(fd), 0);
    assert!(!fd::active(fd));

    fd::remove(fd);
}

#[test]
fn polled_always_implies_active() {
    let _serial = setup();
    let fd = 708;
    fd::insert(fd, 1, nop, 0b1);

    let check = |fd| {
        assert!(!fd::recv_polled(fd) || fd::recv_active(fd));
        assert!(!fd::send_polled(fd) || fd::send_active(fd));
    };

    fd::want_recv(fd);
    check(fd);
    fd::may_recv(fd);
    check(fd);
    fd::cant_recv(fd);
    check(fd);
    fd::done_recv(fd);
    check(fd);
    fd::stop_recv(fd);
    check(fd);
    fd::want_send(fd);
    check(fd);
    fd::stop_both(fd);
    check(fd);

    fd::remove(fd);
}

#[test]
fn concurrent_want_recv_collapses_to_one_transition() {
    let _serial = setup();
    let fd = 709;
    fd::insert(fd, 1, nop, 0b1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(thread::spawn(move || {
            fd::want_recv(fd);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);

    fd::remove(fd);
}

#[test]
fn update_events_keeps_sticky_bits() {
    let _serial = setup();
    let fd = 710;
    fd::insert(fd, 1, nop, 0b1);
    fd::want_recv(fd);

    fd::update_events(fd, fd::PollEvents::IN | fd::PollEvents::HUP);
    assert!(fd::events(fd).contains(fd::PollEvents::HUP));
    assert!(fd::recv_ready(fd));

    // a later report without the hangup must not lose it
    fd::update_events(fd, fd::PollEvents::empty());
    assert!(fd::events(fd).contains(fd::PollEvents::HUP));
    assert!(!fd::events(fd).contains(fd::PollEvents::IN));

    fd::remove(fd);
}

#[test]
fn update_events_error_wakes_both_directions() {
    let _serial = setup();
    let fd = 711;
    fd::insert(fd, 1, nop, 0b1);

    fd::update_events(fd, fd::PollEvents::ERR);
    assert!(fd::recv_ready(fd));
    assert!(fd::send_ready(fd));
    assert!(fd::events(fd).contains(fd::PollEvents::ERR));

    fd::remove(fd);
}

#[test]
fn shared_fd_reaches_the_cache_through_readiness() {
    let _serial = setup();
    let fd = 712;
    fd::insert(fd, 1, nop, 0b11);

    fd::want_recv(fd);
    fd::want_send(fd);
    assert_eq!(fd::recv_state(fd), ACTIVE_R | POLLED_R);
    assert_eq!(fd::send_state(fd), ACTIVE_R | POLLED_R);

    fd::may_recv(fd);
    // both serving threads are now flagged for cache work
    assert_eq!(fd::cache_mask() & 0b11, 0b11);

    fd::stop_both(fd);
    fd::remove(fd);
}
