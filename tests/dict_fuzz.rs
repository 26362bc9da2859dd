//! Randomized insert/delete/overwrite sequence checked against a plain
//! `HashMap` model, in the spirit of the teacher's `tests/scheduler.rs`
//! randomized ordering check. Single process: no `fork` is needed since
//! this is testing the dict's own probe/resize/tombstone bookkeeping,
//! not cross-process behavior.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use procshare::object::ObjectKind;
use procshare::value::Value;
use procshare::{containers, handle, Shareable, ShareablePayload};

struct FuzzDict;

impl Shareable for FuzzDict {
    fn kind() -> ObjectKind {
        ObjectKind::Dict
    }
    fn into_payload(self) -> ShareablePayload {
        ShareablePayload::Dict(Vec::new())
    }
}

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn key(i: u32) -> Value {
    Value::Int(i as i64)
}

#[test]
fn test_dict_matches_hashmap_model_under_random_ops() {
    let _guard = TEST_LOCK.lock().unwrap();
    procshare::register_type::<FuzzDict>().unwrap();
    procshare::init().unwrap();

    let proxy = procshare::share(FuzzDict).unwrap();
    let addr = handle::handle_to_pointer(proxy.referent()).unwrap();

    let mut model: HashMap<u32, i64> = HashMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xD1C7_u64);

    for _ in 0..4000 {
        let k = rng.random_range(0..200);
        let value = rng.random_range(-1000..1000);
        match rng.random_range(0..3) {
            0 => {
                containers::dict::assign(addr, key(k), Value::Int(value)).unwrap();
                model.insert(k, value);
            }
            1 => {
                let removed = containers::dict::delitem(addr, &key(k)).is_ok();
                assert_eq!(removed, model.remove(&k).is_some());
            }
            _ => {
                let got = containers::dict::subscript(addr, &key(k)).ok();
                let expected = model.get(&k).map(|v| Value::Int(*v));
                assert_eq!(got, expected);
            }
        }
    }

    assert_eq!(containers::dict::length(addr) as usize, model.len());
    for (k, v) in &model {
        assert_eq!(
            containers::dict::subscript(addr, &key(*k)).unwrap(),
            Value::Int(*v)
        );
    }

    let snapshot_keys = containers::dict::keys(addr).unwrap();
    assert_eq!(snapshot_keys.len(), model.len());
    for v in snapshot_keys {
        if let Value::Int(k) = v {
            assert!(model.contains_key(&(k as u32)));
        } else {
            panic!("unexpected key type in snapshot");
        }
    }
}
