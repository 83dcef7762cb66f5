//! Host-facing handle to a runtime instance
//!
//! [`Bridge`] owns a [`State`] and exposes the operations host code needs:
//! creating host functions callable from foreign code, calling foreign
//! functions, table access and userdata. Every operation that may raise a
//! foreign error goes through the protected primitives and returns
//! [`Result`]; every operation leaves the stack as it found it.

use crate::error::{Error, Result};
use crate::ffi::{keys, safe, shim, Headroom};
use crate::util::{
    callback_error, check_stack, init_error_registry, pop_error, protect_lua_call,
    push_wrapped_error, StackGuard,
};
use ferrule_config::BridgeConfig;
use ferrule_vm::{
    open_base, upvalue_index, Integer, Limits, State, TableRef, Value, MAX_UPVALUES, MULTRET,
    REGISTRY_INDEX, RIDX_GLOBALS,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::mem;
use std::os::raw::c_int;
use std::rc::Rc;

/// Host function as stored in a closure upvalue.
pub(crate) type HostCallback = Rc<dyn Fn(&mut Bridge, Vec<Value>) -> Result<Vec<Value>>>;

/// Host hook callback.
pub(crate) type HookCallback = Rc<dyn Fn(&mut Bridge, &ferrule_vm::Debug) -> Result<()>>;

/// Per-runtime data owned by the bridge, kept in the state's host slot.
#[derive(Default)]
pub(crate) struct ExtraData {
    pub(crate) headroom: Headroom,
    pub(crate) hook_callback: Option<HookCallback>,
    pub(crate) userdata_metatables: HashMap<TypeId, TableRef>,
}

/// A runtime instance prepared for host callbacks.
///
/// Not `Send`: a bridge is used from the thread that created it.
#[repr(transparent)]
pub struct Bridge {
    state: State,
}

impl Bridge {
    /// Creates a runtime with the default configuration.
    pub fn new() -> Result<Bridge> {
        Self::with_config(&BridgeConfig::default())
    }

    /// Creates a runtime with limits and headroom from `config`.
    ///
    /// The configuration is validated first, so settings built in code obey
    /// the same bounds as settings loaded from a file.
    pub fn with_config(config: &BridgeConfig) -> Result<Bridge> {
        config.validate()?;

        let mut state = State::with_limits(Limits {
            max_stack: config.max_stack(),
            max_call_depth: config.max_call_depth(),
        });
        let headroom = Headroom::from_config(config);
        state.set_extra(ExtraData {
            headroom,
            ..ExtraData::default()
        });

        init_error_registry(&mut state)?;
        protect_lua_call(&mut state, 0, open_libs_s)?;
        state.set_memory_limit(config.memory_limit());

        tracing::debug!(
            max_stack = config.max_stack(),
            max_call_depth = config.max_call_depth(),
            memory_limit = ?config.memory_limit(),
            classify_headroom = headroom.classify,
            traceback_headroom = headroom.traceback,
            "bridge initialized"
        );
        Ok(Bridge { state })
    }

    pub(crate) fn from_state_mut(state: &mut State) -> &mut Bridge {
        // SAFETY: `Bridge` is a transparent wrapper around `State`.
        unsafe { &mut *(state as *mut State as *mut Bridge) }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Raw access to the runtime. The stack must be left balanced.
    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub(crate) fn extra_mut(&mut self) -> &mut ExtraData {
        if self.state.extra::<ExtraData>().is_none() {
            self.state.set_extra(ExtraData::default());
        }
        match self.state.extra_mut::<ExtraData>() {
            Some(extra) => extra,
            None => unreachable!("extra data was just installed"),
        }
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Wraps a host closure as a foreign function.
    ///
    /// Errors returned by the closure are raised in foreign code and come back
    /// to the host as [`Error::CallbackError`]. A panic inside the closure
    /// crosses foreign frames as an opaque payload and is resumed when it
    /// reaches host code again.
    pub fn create_function<F>(&mut self, func: F) -> Result<Value>
    where
        F: Fn(&mut Bridge, Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        self.create_callback(Rc::new(func))
    }

    pub(crate) fn create_callback(&mut self, callback: HostCallback) -> Result<Value> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 4)?;

        let ud = safe::new_userdata(&mut guard, mem::size_of::<HostCallback>())?;
        ud.write(callback).map_err(|_| Error::UserDataTypeMismatch)?;
        safe::push_rust_closure(&mut guard, call_rust_function, 1)?;
        Ok(top_value(&guard))
    }

    /// Calls `func` in protected mode and returns all of its results.
    pub fn call_function(&mut self, func: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        let nargs = args.len() as c_int;
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, nargs + 3)?;

        let stack_start = guard.get_top();
        guard.push_function(shim::error_traceback);
        guard.push(func.clone());
        for arg in args {
            guard.push(arg);
        }

        let status = guard.pcall(nargs, MULTRET, stack_start + 1);
        if !status.is_ok() {
            return Err(pop_error(&mut guard, status));
        }

        let top = guard.get_top();
        Ok(values_between(&guard, stack_start + 2, top))
    }

    /// Returns a function that calls `func` with `args` prepended to its own
    /// arguments.
    pub fn bind(&mut self, func: &Value, args: Vec<Value>) -> Result<Value> {
        let nbinds = args.len();
        if nbinds == 0 {
            return Ok(func.clone());
        }
        if nbinds + 2 > MAX_UPVALUES {
            return Err(Error::BindError);
        }

        let nbinds = nbinds as c_int;
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, nbinds + 4)?;

        guard.push(func.clone());
        guard.push_integer(nbinds as Integer);
        for arg in args {
            guard.push(arg);
        }
        safe::push_closure(&mut guard, shim::bind_call_impl, nbinds + 2)?;
        Ok(top_value(&guard))
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Creates a runtime string from arbitrary bytes.
    pub fn create_string(&mut self, s: impl AsRef<[u8]>) -> Result<Value> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 3)?;
        safe::push_string(&mut guard, s)?;
        Ok(top_value(&guard))
    }

    pub fn create_table(&mut self) -> Result<Value> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 4)?;
        safe::create_table(&mut guard, 0, 0)?;
        Ok(top_value(&guard))
    }

    /// Wraps a host error as a foreign value. Raising it from foreign code
    /// reports the same host error back to the host.
    pub fn wrap_error(&mut self, err: Error) -> Result<Value> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 3)?;
        push_wrapped_error(&mut guard, err)?;
        Ok(top_value(&guard))
    }

    pub fn globals(&mut self) -> Value {
        let mut guard = StackGuard::new(&mut self.state);
        guard.raw_get_i(REGISTRY_INDEX, RIDX_GLOBALS);
        top_value(&guard)
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<()> {
        let globals = self.globals();
        let key = self.create_string(name)?;
        self.set(&globals, key, value)
    }

    pub fn get_global(&mut self, name: &str) -> Result<Value> {
        let globals = self.globals();
        let key = self.create_string(name)?;
        self.get(&globals, key)
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// `table[key] = value`, honouring `__newindex`.
    pub fn set(&mut self, table: &Value, key: Value, value: Value) -> Result<()> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 6)?;
        guard.push(table.clone());
        guard.push(key);
        guard.push(value);
        safe::set_table(&mut guard, -3)
    }

    /// `table[key]`, honouring `__index`.
    pub fn get(&mut self, table: &Value, key: Value) -> Result<Value> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 5)?;
        guard.push(table.clone());
        guard.push(key);
        safe::get_table(&mut guard, -2)?;
        Ok(top_value(&guard))
    }

    /// Inserts `value` at position `i` of a sequence, shifting later elements up.
    ///
    /// `i` must lie in `1..=len + 1`.
    pub fn raw_insert(&mut self, table: &Value, i: Integer, value: Value) -> Result<()> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 6)?;
        guard.push(table.clone());
        let size = guard.raw_len(-1) as Integer;
        if i < 1 || i > size + 1 {
            return Err(Error::runtime("index out of bounds"));
        }
        guard.push(value);
        safe::raw_insert(&mut guard, -2, i)
    }

    /// Removes position `i` of a sequence, shifting later elements down.
    ///
    /// `i` must lie in `1..=len`.
    pub fn raw_remove(&mut self, table: &Value, i: Integer) -> Result<()> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 5)?;
        guard.push(table.clone());
        let size = guard.raw_len(-1) as Integer;
        if i < 1 || i > size {
            return Err(Error::runtime("index out of bounds"));
        }
        safe::raw_remove(&mut guard, -1, i)
    }

    /// Border of the sequence part, without metamethods.
    pub fn raw_len(&mut self, table: &Value) -> usize {
        let mut guard = StackGuard::new(&mut self.state);
        guard.push(table.clone());
        guard.raw_len(-1)
    }

    /// Length honouring `__len`.
    pub fn len(&mut self, value: &Value) -> Result<Integer> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 4)?;
        guard.push(value.clone());
        safe::len(&mut guard, -1)
    }

    /// Every key/value pair of a table, in traversal order.
    pub fn pairs(&mut self, table: &Value) -> Result<Vec<(Value, Value)>> {
        let mut guard = StackGuard::new(&mut self.state);
        check_stack(&guard, 6)?;
        guard.push(table.clone());
        guard.push_nil();

        let mut pairs = Vec::new();
        while safe::next(&mut guard, -2)? {
            let key = guard.value_at(-2).cloned().unwrap_or_default();
            pairs.push((key, top_value(&guard)));
            guard.pop(1);
        }
        Ok(pairs)
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Sets the memory limit in bytes and returns the previous one.
    pub fn set_memory_limit(&mut self, limit: Option<usize>) -> Option<usize> {
        self.state.set_memory_limit(limit)
    }

    pub fn used_memory(&self) -> usize {
        self.state.used_memory()
    }
}

fn top_value(state: &State) -> Value {
    state.value_at(-1).cloned().unwrap_or_default()
}

fn values_between(state: &State, from: c_int, to: c_int) -> Vec<Value> {
    (from..=to)
        .map(|i| state.value_at(i).cloned().unwrap_or_default())
        .collect()
}

/// Host side of every function made by [`Bridge::create_function`].
/// Upvalue 2 holds the [`HostCallback`].
fn call_rust_function(state: &mut State) -> c_int {
    callback_error(state, |state, nargs| {
        let callback = {
            let ud = state
                .to_userdata(upvalue_index(2))
                .ok_or(Error::UserDataTypeMismatch)?;
            let callback = ud
                .try_borrow::<HostCallback>()
                .map_err(|_| Error::UserDataTypeMismatch)?
                .clone();
            callback
        };

        let args = values_between(state, 2, nargs + 1);
        let results = callback(Bridge::from_state_mut(state), args)?;

        let nresults = results.len() as c_int;
        check_stack(state, nresults)?;
        for value in results {
            state.push(value);
        }
        Ok(nresults)
    })
}

fn open_libs_s(state: &mut State) -> c_int {
    open_base(state);
    state.push_named_closure(safe_pcall, 0, "pcall");
    state.set_global("pcall");
    0
}

/// `pcall` for foreign code that lets host panics through instead of
/// turning them into `false, payload`.
fn safe_pcall(state: &mut State) -> c_int {
    let top = state.get_top();
    if top == 0 {
        state.error_message("bad argument #1 to 'pcall' (value expected)");
    }

    if state.pcall(top - 1, MULTRET, 0).is_ok() {
        state.push_boolean(true);
        state.insert(1);
        state.get_top()
    } else {
        if shim::is_wrapped_struct(state, -1, keys::wrapped_panic_key()) {
            state.error();
        }
        state.push_boolean(false);
        state.insert(-2);
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_bridge_has_base_library() {
        let mut bridge = Bridge::new().unwrap();
        for name in ["pcall", "error", "tostring", "type", "select", "rawlen"] {
            let f = bridge.get_global(name).unwrap();
            assert!(f.is_callable(), "{} is not callable", name);
        }
        assert_eq!(bridge.state().get_top(), 0);
    }

    #[test]
    fn test_memory_limit_from_config() {
        let mut config = BridgeConfig::default();
        config.runtime.memory_limit = Some(1 << 20);
        let mut bridge = Bridge::with_config(&config).unwrap();
        assert_eq!(bridge.set_memory_limit(None), Some(1 << 20));
    }

    #[test]
    fn test_headroom_from_config() {
        let mut config = BridgeConfig::default();
        config.bridge.traceback_headroom = Some(16);
        let mut bridge = Bridge::with_config(&config).unwrap();
        assert_eq!(bridge.extra_mut().headroom.traceback, 16);
        assert_eq!(bridge.extra_mut().headroom.classify, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = BridgeConfig::default();
        config.bridge.classify_headroom = Some(0);
        assert!(matches!(
            Bridge::with_config(&config),
            Err(Error::ConfigError(_))
        ));

        let mut config = BridgeConfig::default();
        config.runtime.max_stack = Some(10);
        assert!(matches!(
            Bridge::with_config(&config),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_pairs_follow_insertion_order() {
        let mut bridge = Bridge::new().unwrap();
        let t = bridge.create_table().unwrap();
        let a = bridge.create_string("a").unwrap();
        let b = bridge.create_string("b").unwrap();
        bridge.set(&t, a.clone(), Value::Integer(1)).unwrap();
        bridge.set(&t, b.clone(), Value::Integer(2)).unwrap();

        let pairs = bridge.pairs(&t).unwrap();
        assert_eq!(
            pairs,
            vec![(a, Value::Integer(1)), (b, Value::Integer(2))]
        );
        assert_eq!(bridge.state().get_top(), 0);
    }
}
