//! Base library
//!
//! A handful of global functions that foreign code and tests rely on:
//! `error`, `pcall`, `tostring`, `type`, `select` and `rawlen`.

use crate::config::MULTRET;
use crate::state::State;
use crate::value::{Integer, NativeFn, Type, Value};
use std::os::raw::c_int;

const BASE_FUNCTIONS: &[(&str, NativeFn)] = &[
    ("error", base_error),
    ("pcall", base_pcall),
    ("tostring", base_tostring),
    ("type", base_type),
    ("select", base_select),
    ("rawlen", base_rawlen),
];

/// Registers the base library in the globals table.
pub fn open_base(state: &mut State) {
    for &(name, func) in BASE_FUNCTIONS {
        state.push_named_closure(func, 0, name);
        state.set_global(name);
    }
}

fn check_any(state: &mut State, arg: c_int, fname: &str) {
    if state.type_of(arg) == Type::None {
        state.error_message(format!(
            "bad argument #{} to '{}' (value expected)",
            arg, fname
        ));
    }
}

fn base_error(state: &mut State) -> c_int {
    state.set_top(1);
    state.error()
}

fn base_pcall(state: &mut State) -> c_int {
    check_any(state, 1, "pcall");
    state.push_boolean(true);
    state.insert(1);
    let nargs = state.get_top() - 2;
    if state.pcall(nargs, MULTRET, 0).is_ok() {
        state.get_top()
    } else {
        state.push_boolean(false);
        state.insert(-2);
        2
    }
}

fn base_tostring(state: &mut State) -> c_int {
    check_any(state, 1, "tostring");
    state.to_display_string(1);
    1
}

fn base_type(state: &mut State) -> c_int {
    check_any(state, 1, "type");
    let name = state.type_of(1).name();
    state.push_string(name);
    1
}

fn base_select(state: &mut State) -> c_int {
    let n = Integer::from(state.get_top());
    if matches!(state.value_at(1), Some(Value::String(s)) if s.as_bytes() == b"#") {
        state.push_integer(n - 1);
        return 1;
    }
    let i = match state.to_integerx(1) {
        Some(i) if i < 0 => n + i,
        Some(i) if i > n => n,
        Some(i) => i,
        None => {
            let got = state.type_of(1).name();
            state.error_message(format!(
                "bad argument #1 to 'select' (number expected, got {})",
                got
            ))
        }
    };
    if i < 1 {
        state.error_message("bad argument #1 to 'select' (index out of range)");
    }
    (n - i) as c_int
}

fn base_rawlen(state: &mut State) -> c_int {
    match state.type_of(1) {
        Type::Table | Type::String => {
            let len = state.raw_len(1) as Integer;
            state.push_integer(len);
            1
        }
        _ => state.error_message("table or string expected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Status;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn call_global(state: &mut State, name: &str, args: &[Value]) -> (Status, Vec<Value>) {
        let top = state.get_top();
        state.get_global(name);
        for arg in args {
            state.push(arg.clone());
        }
        let status = state.pcall(args.len() as c_int, MULTRET, 0);
        let results = (top + 1..=state.get_top())
            .map(|i| state.value_at(i).cloned().unwrap_or_default())
            .collect();
        state.set_top(top);
        (status, results)
    }

    fn opened() -> State {
        let mut state = State::new();
        open_base(&mut state);
        state
    }

    #[rstest]
    #[case(vec![Value::Integer(2), Value::Integer(10), Value::Integer(20), Value::Integer(30)], vec![Value::Integer(20), Value::Integer(30)])]
    #[case(vec![Value::Integer(-1), Value::Integer(10), Value::Integer(20)], vec![Value::Integer(20)])]
    #[case(vec![Value::Integer(5), Value::Integer(10)], vec![])]
    fn test_select(#[case] args: Vec<Value>, #[case] expected: Vec<Value>) {
        let mut state = opened();
        let (status, results) = call_global(&mut state, "select", &args);
        assert_eq!(status, Status::Ok);
        assert_eq!(results, expected);
    }

    #[test]
    fn test_select_count() {
        let mut state = opened();
        let hash = Value::String(state.push_string("#"));
        state.pop(1);
        let (_, results) = call_global(&mut state, "select", &[hash, Value::Nil, Value::Nil]);
        assert_eq!(results, vec![Value::Integer(2)]);
    }

    #[test]
    fn test_pcall_reports_error_value() {
        let mut state = opened();
        state.get_global("error");
        let error_fn = state.value_at(-1).cloned().unwrap();
        state.pop(1);

        let (status, results) =
            call_global(&mut state, "pcall", &[error_fn, Value::Integer(42)]);
        assert_eq!(status, Status::Ok);
        assert_eq!(results, vec![Value::Boolean(false), Value::Integer(42)]);
    }

    #[test]
    fn test_type_names() {
        let mut state = opened();
        let (_, results) = call_global(&mut state, "type", &[Value::Boolean(true)]);
        assert_eq!(results[0].as_string().unwrap().as_bytes(), b"boolean");

        let (status, _) = call_global(&mut state, "type", &[]);
        assert_eq!(status, Status::ErrRun);
    }
}
