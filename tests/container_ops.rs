//! Dict `update`/`copy`/`repr`/`hash` and list `repr`, exercised through
//! `Proxy`'s convenience methods the way an embedder actually would,
//! rather than the raw `containers::*` free functions directly.

use procshare::error::ProcshareError;
use procshare::object::ObjectKind;
use procshare::value::Value;
use procshare::{ShareablePayload, Shareable};

struct EmptyDict;

impl Shareable for EmptyDict {
    fn kind() -> ObjectKind {
        ObjectKind::Dict
    }
    fn into_payload(self) -> ShareablePayload {
        ShareablePayload::Dict(Vec::new())
    }
}

struct EmptyList;

impl Shareable for EmptyList {
    fn kind() -> ObjectKind {
        ObjectKind::List
    }
    fn into_payload(self) -> ShareablePayload {
        ShareablePayload::List(Vec::new())
    }
}

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn setup() {
    procshare::register_type::<EmptyDict>().ok();
    procshare::register_type::<EmptyList>().ok();
    procshare::init().unwrap();
}

#[test]
fn test_dict_update_copies_keys_from_another_dict() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let a = procshare::share(EmptyDict).unwrap();
    let b = procshare::share(EmptyDict).unwrap();
    a.dict_set(Value::Str("x".into()), Value::Int(1)).unwrap();
    b.dict_set(Value::Str("y".into()), Value::Int(2)).unwrap();

    a.dict_update(&b).unwrap();

    assert_eq!(a.dict_get(&Value::Str("x".into())).unwrap(), Value::Int(1));
    assert_eq!(a.dict_get(&Value::Str("y".into())).unwrap(), Value::Int(2));
    assert_eq!(a.dict_length().unwrap(), 2);
}

#[test]
fn test_dict_update_overwrites_existing_key() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let a = procshare::share(EmptyDict).unwrap();
    let b = procshare::share(EmptyDict).unwrap();
    a.dict_set(Value::Str("x".into()), Value::Int(1)).unwrap();
    b.dict_set(Value::Str("x".into()), Value::Int(99)).unwrap();

    a.dict_update(&b).unwrap();

    assert_eq!(a.dict_get(&Value::Str("x".into())).unwrap(), Value::Int(99));
}

#[test]
fn test_dict_copy_is_a_plain_snapshot() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let a = procshare::share(EmptyDict).unwrap();
    a.dict_set(Value::Int(1), Value::Int(10)).unwrap();
    a.dict_set(Value::Int(2), Value::Int(20)).unwrap();

    let mut snapshot = a.dict_copy().unwrap();
    snapshot.sort_by_key(|(k, _)| match k {
        Value::Int(n) => *n,
        _ => 0,
    });
    assert_eq!(
        snapshot,
        vec![(Value::Int(1), Value::Int(10)), (Value::Int(2), Value::Int(20))]
    );
}

#[test]
fn test_dict_repr_renders_entries_and_guards_self_reference() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let a = procshare::share(EmptyDict).unwrap();
    a.dict_set(Value::Str("k".into()), Value::Int(1)).unwrap();
    assert_eq!(a.repr().unwrap(), "{\"k\": 1}");

    a.dict_set(Value::Str("self".into()), Value::Shared(a.referent()))
        .unwrap();
    let repr = a.repr().unwrap();
    assert!(repr.contains("{...}"), "expected cycle placeholder in {repr:?}");
}

#[test]
fn test_dict_hash_is_unhashable() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let a = procshare::share(EmptyDict).unwrap();
    assert!(matches!(a.hash(), Err(ProcshareError::Unhashable)));
}

#[test]
fn test_list_repr_renders_entries_and_guards_self_reference() {
    let _guard = TEST_LOCK.lock().unwrap();
    setup();
    let l = procshare::share(EmptyList).unwrap();
    l.list_append(Value::Int(1)).unwrap();
    l.list_append(Value::Int(2)).unwrap();
    assert_eq!(l.repr().unwrap(), "[1, 2]");

    l.list_append(Value::Shared(l.referent())).unwrap();
    let repr = l.repr().unwrap();
    assert!(repr.contains("[...]"), "expected cycle placeholder in {repr:?}");
}
