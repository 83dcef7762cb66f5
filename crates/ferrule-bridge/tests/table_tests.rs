//! Table primitives and stack balance of the bridge API

use ferrule_bridge::{arg, Bridge, Error, Value};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

fn sequence(bridge: &mut Bridge, items: &[&str]) -> Value {
    let t = bridge.create_table().unwrap();
    for (i, item) in items.iter().enumerate() {
        let v = bridge.create_string(item).unwrap();
        bridge.set(&t, Value::Integer(i as i64 + 1), v).unwrap();
    }
    t
}

fn contents(bridge: &mut Bridge, t: &Value) -> Vec<String> {
    let n = bridge.raw_len(t) as i64;
    (1..=n)
        .map(|i| arg(&[bridge.get(t, Value::Integer(i)).unwrap()], 0).unwrap())
        .collect()
}

#[test]
fn test_insert_shifts_up() {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b", "c"]);
    let v = bridge.create_string("new").unwrap();
    bridge.raw_insert(&t, 2, v).unwrap();
    assert_eq!(contents(&mut bridge, &t), ["a", "new", "b", "c"]);
}

#[test]
fn test_insert_at_end() {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a"]);
    let v = bridge.create_string("z").unwrap();
    bridge.raw_insert(&t, 2, v).unwrap();
    assert_eq!(contents(&mut bridge, &t), ["a", "z"]);
}

#[test]
fn test_remove_shifts_down() {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b", "c", "d"]);
    bridge.raw_remove(&t, 2).unwrap();
    assert_eq!(contents(&mut bridge, &t), ["a", "c", "d"]);
    assert_eq!(bridge.get(&t, Value::Integer(4)).unwrap(), Value::Nil);
}

fn assert_out_of_bounds(result: ferrule_bridge::Result<()>) {
    match result {
        Err(Error::RuntimeError(msg)) => assert_eq!(msg, "index out of bounds"),
        other => panic!("expected out of bounds error, got {:?}", other),
    }
}

#[rstest]
#[case(0)]
#[case(-1)]
#[case(5)]
#[case(10)]
fn test_insert_out_of_bounds_leaves_table_alone(#[case] i: i64) {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b", "c"]);
    let v = bridge.create_string("x").unwrap();

    assert_out_of_bounds(bridge.raw_insert(&t, i, v));
    assert_eq!(contents(&mut bridge, &t), ["a", "b", "c"]);
    assert_eq!(bridge.get(&t, Value::Integer(i)).unwrap(), Value::Nil);
    assert_eq!(bridge.state().get_top(), 0);
}

#[rstest]
#[case(0)]
#[case(-3)]
#[case(5)]
#[case(6)]
#[case(9)]
fn test_remove_out_of_bounds_leaves_table_alone(#[case] i: i64) {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b", "c", "d"]);

    assert_out_of_bounds(bridge.raw_remove(&t, i));
    assert_eq!(contents(&mut bridge, &t), ["a", "b", "c", "d"]);
    assert_eq!(bridge.get(&t, Value::Integer(0)).unwrap(), Value::Nil);
    assert_eq!(bridge.state().get_top(), 0);
}

#[test]
fn test_insert_at_len_plus_one_appends() {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b", "c"]);
    let v = bridge.create_string("d").unwrap();
    bridge.raw_insert(&t, 4, v).unwrap();
    assert_eq!(contents(&mut bridge, &t), ["a", "b", "c", "d"]);
}

#[test]
fn test_remove_last_and_from_empty() {
    let mut bridge = Bridge::new().unwrap();
    let t = sequence(&mut bridge, &["a", "b"]);
    bridge.raw_remove(&t, 2).unwrap();
    assert_eq!(contents(&mut bridge, &t), ["a"]);

    let empty = bridge.create_table().unwrap();
    assert_out_of_bounds(bridge.raw_remove(&empty, 1));
}

#[test]
fn test_empty_table_has_no_pairs() {
    let mut bridge = Bridge::new().unwrap();
    let t = bridge.create_table().unwrap();
    assert!(bridge.pairs(&t).unwrap().is_empty());
    assert_eq!(bridge.state().get_top(), 0);
}

#[test]
fn test_len_of_string_and_table() {
    let mut bridge = Bridge::new().unwrap();
    let s = bridge.create_string("four").unwrap();
    assert_eq!(bridge.len(&s).unwrap(), 4);
    let t = sequence(&mut bridge, &["x", "y"]);
    assert_eq!(bridge.len(&t).unwrap(), 2);
    assert!(bridge.len(&Value::Boolean(true)).is_err());
}

#[test]
fn test_index_non_table() {
    let mut bridge = Bridge::new().unwrap();
    let err = bridge
        .get(&Value::Integer(1), Value::Integer(1))
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeError(_)), "{:?}", err);
    assert_eq!(bridge.state().get_top(), 0);
}

#[test]
fn test_nil_key_rejected() {
    let mut bridge = Bridge::new().unwrap();
    let t = bridge.create_table().unwrap();
    assert!(bridge.set(&t, Value::Nil, Value::Integer(1)).is_err());
    assert_eq!(bridge.state().get_top(), 0);
}

#[test]
fn test_strings_keep_nul_bytes() {
    let mut bridge = Bridge::new().unwrap();
    let s = bridge.create_string(b"a\0b").unwrap();
    assert_eq!(s.as_string().unwrap().as_bytes(), b"a\0b");
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i64),
    Remove(i64),
    SetField(String),
    Len,
    Pairs,
    CallFailing,
    Bind(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-1i64..8).prop_map(Op::Insert),
        (-1i64..8).prop_map(Op::Remove),
        "[a-z]{1,6}".prop_map(Op::SetField),
        Just(Op::Len),
        Just(Op::Pairs),
        Just(Op::CallFailing),
        (0usize..5).prop_map(Op::Bind),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every bridge operation leaves the stack as it found it, whether it
    /// succeeds or fails.
    #[test]
    fn prop_operations_keep_stack_balanced(ops in prop::collection::vec(op(), 1..24)) {
        let mut bridge = Bridge::new().unwrap();
        let t = bridge.create_table().unwrap();
        let failing = bridge
            .create_function(|_, _| Err(Error::runtime("nope")))
            .unwrap();

        for op in ops {
            let _ = match op {
                Op::Insert(i) => {
                    let n = bridge.raw_len(&t) as i64;
                    let result = bridge.raw_insert(&t, i, Value::Integer(i));
                    prop_assert_eq!(result.is_ok(), (1..=n + 1).contains(&i));
                    let expected = if result.is_ok() { n + 1 } else { n };
                    prop_assert_eq!(bridge.raw_len(&t) as i64, expected);
                    result
                }
                Op::Remove(i) => {
                    let n = bridge.raw_len(&t) as i64;
                    let result = bridge.raw_remove(&t, i);
                    prop_assert_eq!(result.is_ok(), (1..=n).contains(&i));
                    let expected = if result.is_ok() { n - 1 } else { n };
                    prop_assert_eq!(bridge.raw_len(&t) as i64, expected);
                    result
                }
                Op::SetField(name) => {
                    let k = bridge.create_string(&name).unwrap();
                    bridge.set(&t, k, Value::Boolean(true))
                }
                Op::Len => bridge.len(&t).map(|_| ()),
                Op::Pairs => bridge.pairs(&t).map(|_| ()),
                Op::CallFailing => bridge.call_function(&failing, vec![]).map(|_| ()),
                Op::Bind(n) => bridge.bind(&failing, vec![Value::Nil; n]).map(|_| ()),
            };
            prop_assert_eq!(bridge.state().get_top(), 0);
        }
    }
}
