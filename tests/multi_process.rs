//! End-to-end scenarios exercising real process duplication: a parent
//! `fork()`s, the child runs `init_child`, and the two cooperate through
//! a shared dict or tuple with no other communication channel. Each
//! scenario's child signals pass/fail purely through its exit status, so
//! the parent's assertions run after a real `waitpid`, not by having the
//! child report over some side channel.

#![cfg(unix)]

use std::sync::Arc;

use procshare::object::ObjectKind;
use procshare::util::address::Address;
use procshare::value::Value;
use procshare::{containers, handle, participant, registry, ShareablePayload, Shareable};

struct EmptyDict;

impl Shareable for EmptyDict {
    fn kind() -> ObjectKind {
        ObjectKind::Dict
    }
    fn into_payload(self) -> ShareablePayload {
        ShareablePayload::Dict(Vec::new())
    }
}

struct Trio(Value, Value, Value);

impl Shareable for Trio {
    fn kind() -> ObjectKind {
        ObjectKind::Tuple
    }
    fn into_payload(self) -> ShareablePayload {
        ShareablePayload::Tuple(vec![self.0, self.1, self.2])
    }
}

/// `Globals`, the registry, and the process table are process-wide
/// singletons; since the default test harness runs `#[test]` functions
/// concurrently on separate threads of the same process, every test here
/// takes this lock first so two scenarios never fork from the same
/// process at once.
static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn setup() {
    procshare::register_type::<EmptyDict>().unwrap();
    procshare::register_type::<Trio>().unwrap();
    participant::init().unwrap();
}

fn dict_addr(proxy: &Arc<procshare::Proxy>) -> Address {
    handle::handle_to_pointer(proxy.referent()).unwrap()
}

unsafe fn fork() -> libc::pid_t {
    libc::fork()
}

fn wait_for_success(pid: libc::pid_t) -> bool {
    let mut status = 0i32;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}

/// Scenario 1: shared dict, cross-participant read, through the proxy
/// so the read is actually synchronized rather than touching the raw
/// address directly.
#[test]
fn test_cross_participant_dict_read() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(EmptyDict).unwrap();
    proxy
        .dict_set(Value::Str("k".into()), Value::Str("v".into()))
        .unwrap();

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        let ok = proxy.dict_get(&Value::Str("k".into())) == Ok(Value::Str("v".into()));
        std::process::exit(if ok { 0 } else { 1 });
    }
    assert!(wait_for_success(child));
}

/// Scenario 2: concurrent increment from two participants under the
/// object's monitor lock, one thousand increments each.
#[test]
fn test_concurrent_increment_reaches_expected_total() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(EmptyDict).unwrap();
    let addr = dict_addr(&proxy);
    containers::dict::assign(addr, Value::Str("c".into()), Value::Int(0)).unwrap();

    let increment = || {
        for _ in 0..1000 {
            proxy
                .dispatch("increment", |_header| {
                    let cur = match containers::dict::subscript(addr, &Value::Str("c".into())) {
                        Ok(Value::Int(n)) => n,
                        _ => 0,
                    };
                    containers::dict::assign(addr, Value::Str("c".into()), Value::Int(cur + 1))
                })
                .unwrap();
        }
    };

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        increment();
        std::process::exit(0);
    }
    increment();
    assert!(wait_for_success(child));

    let total = containers::dict::subscript(addr, &Value::Str("c".into())).unwrap();
    assert_eq!(total, Value::Int(2000));
}

/// Scenario 3: proxy bit accounting across two participants.
#[test]
fn test_proxy_bit_accounting_across_participants() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(EmptyDict).unwrap();
    let referent = proxy.referent();

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        let second = registry::make_proxy(referent).unwrap();
        drop(second);
        std::process::exit(0);
    }
    assert!(wait_for_success(child));
    drop(proxy);
    // Both drops ran (one in this process, one in the child); the object
    // is unreachable now, so a fresh allocation of the same size should
    // be able to reuse its slab unit without growing the heap.
    let reused = procshare::share(EmptyDict).unwrap();
    assert!(!reused.referent().is_null());
}

/// Scenario 4: tuple hash stability across participants.
#[test]
fn test_tuple_hash_stable_across_fork() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(Trio(Value::Int(1), Value::Str("a".into()), Value::Int(2))).unwrap();
    let parent_hash = proxy.hash().unwrap();

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        let ok = proxy.hash() == Ok(parent_hash);
        std::process::exit(if ok { 0 } else { 1 });
    }
    assert!(wait_for_success(child));
}

/// Scenario 5: one participant's `keys()` snapshot remains internally
/// consistent (length matches a real snapshot of `used`) even while
/// another participant concurrently forces a resize.
#[test]
fn test_dict_keys_snapshot_consistent_during_resize() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(EmptyDict).unwrap();

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        for i in 0..64 {
            proxy.dict_set(Value::Int(i), Value::Int(i)).ok();
        }
        std::process::exit(0);
    }
    let keys = proxy.dict_keys().unwrap();
    assert!(keys.len() <= 64, "snapshot returned more keys than were ever inserted");
    let unique: std::collections::HashSet<_> = keys.iter().map(|v| format!("{v:?}")).collect();
    assert_eq!(unique.len(), keys.len(), "snapshot must not duplicate a key");
    assert!(wait_for_success(child));
}

/// Scenario 6: `child_died` reclaims a dead child's process-table slot
/// without touching any shared object's state. This does *not* clear
/// the stale proxy bit the child's un-run `Drop` left set (see the
/// limitation documented on `participant::child_died`) — this test only
/// checks the slot gets reused and the object is left in a sane state,
/// not that the bit is gone.
#[test]
fn test_child_died_frees_slot_without_clearing_stale_proxy_bit() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let proxy = procshare::share(EmptyDict).unwrap();
    let referent = proxy.referent();

    let child = unsafe { fork() };
    if child == 0 {
        participant::init_child().unwrap();
        let _second = std::mem::ManuallyDrop::new(registry::make_proxy(referent).unwrap());
        // Simulate an abnormal death: exit without running `second`'s Drop.
        unsafe { libc::_exit(0) };
    }
    let mut status = 0i32;
    unsafe {
        libc::waitpid(child, &mut status, 0);
    }
    participant::child_died(child, libc::SIGKILL, false, false).unwrap();

    let header_ptr = procshare::object::header_ptr(referent).unwrap();
    let header = unsafe { &*header_ptr };
    assert!(!header.is_corrupt());
    // The slot is immediately reusable even though the bit was never
    // cleared for it.
    let reassigned = procshare::globals::get_or_assign_slot(child).unwrap();
    assert!(reassigned >= 0);
    procshare::globals::free_slot(child).unwrap();
    drop(proxy);
}
