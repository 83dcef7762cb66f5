//! Runtime state and the value stack
//!
//! A [`State`] owns one value stack shared by all active native frames. Each
//! frame sees its own window of the stack: index `1` is the first slot above
//! the called function, negative indices count down from the top, and the
//! pseudo-indices [`REGISTRY_INDEX`] and [`upvalue_index`] address the
//! registry and the upvalues of the running closure.
//!
//! Pushing never checks capacity. Callers reserve room with
//! [`State::check_stack`] the same way a C API client would.
//!
//! [`upvalue_index`]: crate::config::upvalue_index

use crate::call::Status;
use crate::config::{Limits, DEFAULT_MAX_STACK, MAX_UPVALUES, MIN_STACK, REGISTRY_INDEX, RIDX_GLOBALS};
use crate::debug::{HookFn, HookMask};
use crate::memory::{
    Allocation, MemoryState, CLOSURE_COST, STRING_COST, TABLE_COST, UPVALUE_COST, USERDATA_COST,
};
use crate::table::Table;
use crate::value::{
    FunctionRef, Integer, NativeFn, Number, StringRef, TableRef, Type, UserDataRef, Value,
};
use std::any::Any;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Host code outside of any call
    Base,
    Native,
    Hook,
}

#[derive(Debug)]
pub(crate) struct CallInfo {
    /// Stack position of index 1
    pub(crate) base: usize,
    pub(crate) callee: Value,
    pub(crate) kind: FrameKind,
}

/// A protected call in progress.
pub(crate) struct Protection {
    pub(crate) handler: Option<Value>,
}

/// Metamethod names, created once per state.
pub(crate) struct MetaNames {
    pub(crate) index: StringRef,
    pub(crate) newindex: StringRef,
    pub(crate) call: StringRef,
    pub(crate) len: StringRef,
    pub(crate) tostring: StringRef,
    pub(crate) name: StringRef,
}

/// An instance of the runtime.
///
/// `State` is neither `Send` nor `Sync`: a runtime instance is driven from a
/// single thread.
pub struct State {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallInfo>,
    pub(crate) registry: Value,
    pub(crate) memory: Rc<MemoryState>,
    pub(crate) protected: Vec<Protection>,
    pub(crate) pending: Option<(Status, Value)>,
    pub(crate) handling_error: bool,
    pub(crate) hook: Option<(HookFn, HookMask)>,
    pub(crate) allow_hook: bool,
    pub(crate) limits: Limits,
    pub(crate) names: MetaNames,
    extra: Option<Box<dyn Any>>,
}

impl State {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        let memory = Rc::new(MemoryState::default());
        let intern = |name: &str| {
            StringRef::new(
                name.as_bytes(),
                memory.force_reserve(STRING_COST + name.len()),
            )
        };
        let names = MetaNames {
            index: intern("__index"),
            newindex: intern("__newindex"),
            call: intern("__call"),
            len: intern("__len"),
            tostring: intern("__tostring"),
            name: intern("__name"),
        };

        let registry = TableRef::new(Table::new(), memory.force_reserve(TABLE_COST));
        let globals = TableRef::new(Table::new(), memory.force_reserve(TABLE_COST));
        registry
            .borrow_mut()
            .set_int(RIDX_GLOBALS, Value::Table(globals));

        let limits = Limits {
            max_stack: limits.max_stack.clamp(MIN_STACK, DEFAULT_MAX_STACK),
            max_call_depth: limits.max_call_depth.max(1),
        };
        tracing::debug!(
            max_stack = limits.max_stack,
            max_call_depth = limits.max_call_depth,
            "created runtime state"
        );

        State {
            stack: Vec::with_capacity(MIN_STACK * 2),
            frames: vec![CallInfo {
                base: 0,
                callee: Value::Nil,
                kind: FrameKind::Base,
            }],
            registry: Value::Table(registry),
            memory,
            protected: Vec::new(),
            pending: None,
            handling_error: false,
            hook: None,
            allow_hook: true,
            limits,
            names,
            extra: None,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Number of active native calls.
    pub fn depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|ci| ci.kind == FrameKind::Native)
            .count()
    }

    // ========================================================================
    // Index resolution
    // ========================================================================

    pub(crate) fn base(&self) -> usize {
        self.frames.last().map_or(0, |ci| ci.base)
    }

    /// Stack position of a valid, non-pseudo index.
    fn slot(&self, idx: c_int) -> Option<usize> {
        let base = self.base();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < self.stack.len()).then_some(pos)
        } else if idx < 0 && idx > REGISTRY_INDEX {
            let back = idx.unsigned_abs() as usize;
            (back <= self.stack.len() - base).then(|| self.stack.len() - back)
        } else {
            None
        }
    }

    fn slot_checked(&self, idx: c_int) -> usize {
        match self.slot(idx) {
            Some(pos) => pos,
            None => panic!("invalid stack index {}", idx),
        }
    }

    /// The value at an acceptable index, `None` for an empty slot or a missing upvalue.
    pub fn value_at(&self, idx: c_int) -> Option<&Value> {
        if idx == REGISTRY_INDEX {
            return Some(&self.registry);
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            return match &self.frames.last()?.callee {
                Value::Function(f) => f.upvalue(n),
                _ => None,
            };
        }
        self.slot(idx).map(|pos| &self.stack[pos])
    }

    pub(crate) fn get(&self, idx: c_int) -> Value {
        self.value_at(idx).cloned().unwrap_or_default()
    }

    fn set(&mut self, idx: c_int, value: Value) {
        let pos = self.slot_checked(idx);
        self.stack[pos] = value;
    }

    // ========================================================================
    // Stack manipulation
    // ========================================================================

    pub fn get_top(&self) -> c_int {
        (self.stack.len() - self.base()) as c_int
    }

    /// Converts a relative index into an absolute one. Pseudo-indices are unchanged.
    pub fn abs_index(&self, idx: c_int) -> c_int {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.get_top() + idx + 1
        }
    }

    /// Sets the top; new slots are filled with nil.
    pub fn set_top(&mut self, idx: c_int) {
        let base = self.base();
        let len = if idx >= 0 {
            base + idx as usize
        } else {
            let back = (-idx - 1) as usize;
            assert!(back <= self.stack.len() - base, "invalid new top {}", idx);
            self.stack.len() - back
        };
        self.stack.resize(len, Value::Nil);
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn push_value(&mut self, idx: c_int) {
        let value = self.get(idx);
        self.stack.push(value);
    }

    /// Rotates the slots between `idx` and the top `n` positions towards the
    /// top (or `-n` positions towards the bottom).
    pub fn rotate(&mut self, idx: c_int, n: c_int) {
        let start = self.slot_checked(idx);
        let segment = &mut self.stack[start..];
        if segment.is_empty() {
            return;
        }
        let shift = n.rem_euclid(segment.len() as c_int) as usize;
        segment.rotate_right(shift);
    }

    /// Moves the top value into `idx`, shifting up the values above it.
    pub fn insert(&mut self, idx: c_int) {
        self.rotate(idx, 1);
    }

    /// Removes the value at `idx`, shifting down the values above it.
    pub fn remove(&mut self, idx: c_int) {
        self.rotate(idx, -1);
        self.pop(1);
    }

    /// Pops the top value into `idx`.
    pub fn replace(&mut self, idx: c_int) {
        self.copy(-1, idx);
        self.pop(1);
    }

    pub fn copy(&mut self, from: c_int, to: c_int) {
        let value = self.get(from);
        self.set(to, value);
    }

    pub fn pop(&mut self, n: c_int) {
        self.set_top(-n - 1);
    }

    /// Whether `n` more slots fit below the stack limit.
    pub fn check_stack(&self, n: c_int) -> bool {
        n >= 0 && self.stack.len() + n as usize <= self.limits.max_stack
    }

    /// Like [`State::check_stack`], raising "stack overflow" on failure.
    pub fn check_stack_or_error(&mut self, n: c_int, msg: Option<&str>) {
        if !self.check_stack(n) {
            match msg {
                Some(msg) => self.error_message(format!("stack overflow ({})", msg)),
                None => self.error_message("stack overflow"),
            }
        }
    }

    // ========================================================================
    // Pushing values
    // ========================================================================

    pub(crate) fn alloc(&mut self, size: usize) -> Allocation {
        match self.memory.try_reserve(size) {
            Some(allocation) => allocation,
            None => self.memory_error(),
        }
    }

    pub(crate) fn new_string(&mut self, bytes: &[u8]) -> StringRef {
        let allocation = self.alloc(STRING_COST + bytes.len());
        StringRef::new(bytes, allocation)
    }

    pub(crate) fn new_table_ref(&mut self, narr: usize, nrec: usize) -> TableRef {
        let allocation = self.alloc(TABLE_COST);
        TableRef::new(Table::with_capacity(narr, nrec), allocation)
    }

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_integer(&mut self, i: Integer) {
        self.push(Value::Integer(i));
    }

    pub fn push_number(&mut self, n: Number) {
        self.push(Value::Number(n));
    }

    pub fn push_light_userdata(&mut self, p: *mut c_void) {
        self.push(Value::LightUserData(p));
    }

    /// Pushes a light function. Never allocates.
    pub fn push_function(&mut self, f: NativeFn) {
        self.push(Value::NativeFunction(f));
    }

    /// Pushes a copy of `bytes` as a new string.
    pub fn push_string(&mut self, bytes: impl AsRef<[u8]>) -> StringRef {
        let s = self.new_string(bytes.as_ref());
        self.push(Value::String(s.clone()));
        s
    }

    /// Pops `n` values and pushes a closure capturing them as upvalues `1..=n`.
    pub fn push_closure(&mut self, f: NativeFn, n: c_int) {
        self.push_closure_impl(f, n, None);
    }

    /// Like [`State::push_closure`], with a name shown in tracebacks and hooks.
    pub fn push_named_closure(&mut self, f: NativeFn, n: c_int, name: &str) {
        self.push_closure_impl(f, n, Some(name.to_string()));
    }

    fn push_closure_impl(&mut self, f: NativeFn, n: c_int, name: Option<String>) {
        let n = usize::try_from(n).unwrap_or(0);
        if n > MAX_UPVALUES {
            self.error_message("too many upvalues");
        }
        assert!(n <= self.get_top() as usize, "not enough upvalues on the stack");
        if n == 0 && name.is_none() {
            self.push_function(f);
            return;
        }
        let allocation = self.alloc(CLOSURE_COST + n * UPVALUE_COST);
        let upvalues = self.stack.split_off(self.stack.len() - n);
        self.push(Value::Function(FunctionRef::new(f, upvalues, name, allocation)));
    }

    /// Pushes a new empty userdata block of `size` bytes.
    pub fn new_userdata(&mut self, size: usize) -> UserDataRef {
        let allocation = self.alloc(USERDATA_COST + size);
        let ud = UserDataRef::new(size, allocation);
        self.push(Value::UserData(ud.clone()));
        ud
    }

    // ========================================================================
    // Reading values
    // ========================================================================

    pub fn type_of(&self, idx: c_int) -> Type {
        self.value_at(idx).map_or(Type::None, Value::type_of)
    }

    pub fn is_nil(&self, idx: c_int) -> bool {
        self.type_of(idx) == Type::Nil
    }

    pub fn is_none_or_nil(&self, idx: c_int) -> bool {
        matches!(self.type_of(idx), Type::None | Type::Nil)
    }

    pub fn to_integerx(&self, idx: c_int) -> Option<Integer> {
        self.value_at(idx).and_then(Value::as_integer)
    }

    /// Integer value at `idx`, or 0.
    pub fn to_integer(&self, idx: c_int) -> Integer {
        self.to_integerx(idx).unwrap_or(0)
    }

    pub fn to_numberx(&self, idx: c_int) -> Option<Number> {
        self.value_at(idx).and_then(Value::as_number)
    }

    pub fn to_number(&self, idx: c_int) -> Number {
        self.to_numberx(idx).unwrap_or(0.0)
    }

    pub fn to_boolean(&self, idx: c_int) -> bool {
        self.value_at(idx).is_some_and(Value::to_boolean)
    }

    /// String at `idx`. A number is converted in place, which allocates.
    pub fn to_bytes(&mut self, idx: c_int) -> Option<StringRef> {
        let value = self.value_at(idx)?.clone();
        match value {
            Value::String(s) => Some(s),
            Value::Integer(i) => {
                let s = self.new_string(i.to_string().as_bytes());
                self.set(idx, Value::String(s.clone()));
                Some(s)
            }
            Value::Number(n) => {
                let text = crate::value::format_number(n);
                let s = self.new_string(text.as_bytes());
                self.set(idx, Value::String(s.clone()));
                Some(s)
            }
            _ => None,
        }
    }

    pub fn to_userdata(&self, idx: c_int) -> Option<UserDataRef> {
        self.value_at(idx).and_then(Value::as_userdata).cloned()
    }

    /// Pointer held by a light userdata, null for anything else.
    pub fn to_light_userdata(&self, idx: c_int) -> *mut c_void {
        match self.value_at(idx) {
            Some(Value::LightUserData(p)) => *p,
            _ => std::ptr::null_mut(),
        }
    }

    pub fn to_table(&self, idx: c_int) -> Option<TableRef> {
        self.value_at(idx).and_then(Value::as_table).cloned()
    }

    pub fn to_pointer(&self, idx: c_int) -> *const c_void {
        self.value_at(idx)
            .map_or(std::ptr::null(), Value::to_pointer)
    }

    /// Primitive equality; false if either index is not valid.
    pub fn raw_equal(&self, a: c_int, b: c_int) -> bool {
        match (self.value_at(a), self.value_at(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    // ========================================================================
    // Memory and host data
    // ========================================================================

    /// Sets the memory limit in bytes and returns the previous one.
    pub fn set_memory_limit(&mut self, limit: Option<usize>) -> Option<usize> {
        self.memory.set_limit(limit)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory.limit()
    }

    pub fn used_memory(&self) -> usize {
        self.memory.used()
    }

    pub(crate) fn memory_error(&mut self) -> ! {
        let msg = b"not enough memory";
        let allocation = self.memory.force_reserve(STRING_COST + msg.len());
        let value = Value::String(StringRef::new(msg, allocation));
        self.throw(Status::ErrMem, value)
    }

    /// Attaches host data to the state, replacing any previous value.
    pub fn set_extra<T: Any>(&mut self, data: T) {
        self.extra = Some(Box::new(data));
    }

    pub fn extra<T: Any>(&self) -> Option<&T> {
        self.extra.as_ref()?.downcast_ref()
    }

    pub fn extra_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.extra.as_mut()?.downcast_mut()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn ints(state: &State) -> Vec<Integer> {
        (1..=state.get_top()).map(|i| state.to_integer(i)).collect()
    }

    fn state_with(values: &[Integer]) -> State {
        let mut state = State::new();
        for &v in values {
            state.push_integer(v);
        }
        state
    }

    #[test]
    fn test_push_and_top() {
        let state = state_with(&[1, 2, 3]);
        assert_eq!(state.get_top(), 3);
        assert_eq!(state.to_integer(-1), 3);
        assert_eq!(state.to_integer(1), 1);
        assert_eq!(state.type_of(4), Type::None);
    }

    #[rstest]
    #[case(1, 1, vec![4, 1, 2, 3])]
    #[case(1, -1, vec![2, 3, 4, 1])]
    #[case(2, 1, vec![1, 4, 2, 3])]
    #[case(-2, 1, vec![1, 2, 4, 3])]
    fn test_rotate(#[case] idx: c_int, #[case] n: c_int, #[case] expected: Vec<Integer>) {
        let mut state = state_with(&[1, 2, 3, 4]);
        state.rotate(idx, n);
        assert_eq!(ints(&state), expected);
    }

    #[test]
    fn test_insert_remove_replace() {
        let mut state = state_with(&[1, 2, 3]);
        state.insert(1);
        assert_eq!(ints(&state), vec![3, 1, 2]);
        state.remove(2);
        assert_eq!(ints(&state), vec![3, 2]);
        state.push_integer(9);
        state.replace(1);
        assert_eq!(ints(&state), vec![9, 2]);
    }

    #[test]
    fn test_set_top_fills_with_nil() {
        let mut state = state_with(&[1]);
        state.set_top(3);
        assert!(state.is_nil(3));
        state.set_top(-3);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_check_stack_respects_limit() {
        let mut state = State::with_limits(Limits {
            max_stack: 30,
            max_call_depth: 10,
        });
        assert!(state.check_stack(30));
        assert!(!state.check_stack(31));
        state.push_nil();
        assert!(!state.check_stack(30));
    }

    #[test]
    fn test_abs_index() {
        let state = state_with(&[1, 2, 3]);
        assert_eq!(state.abs_index(-1), 3);
        assert_eq!(state.abs_index(2), 2);
        assert_eq!(state.abs_index(REGISTRY_INDEX), REGISTRY_INDEX);
    }

    #[test]
    fn test_to_bytes_converts_numbers_in_place() {
        let mut state = State::new();
        state.push_integer(42);
        let s = state.to_bytes(-1).unwrap();
        assert_eq!(s.as_bytes(), b"42");
        assert_eq!(state.type_of(-1), Type::String);
    }

    #[test]
    fn test_closure_captures_upvalues() {
        fn noop(_: &mut State) -> c_int {
            0
        }
        let mut state = state_with(&[10, 20]);
        state.push_closure(noop, 2);
        assert_eq!(state.get_top(), 1);
        match state.value_at(1) {
            Some(Value::Function(f)) => {
                assert_eq!(f.upvalue_count(), 2);
                assert_eq!(f.upvalue(2), Some(&Value::Integer(20)));
            }
            other => panic!("expected a closure, got {:?}", other),
        }
    }

    #[test]
    fn test_extra_data() {
        let mut state = State::new();
        state.set_extra(5_u32);
        *state.extra_mut::<u32>().unwrap() += 1;
        assert_eq!(state.extra::<u32>(), Some(&6));
        assert_eq!(state.extra::<i64>(), None);
    }
}
