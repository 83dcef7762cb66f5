//! Table access, metatables and length

use crate::config::{MAX_META_CHAIN, REGISTRY_INDEX, RIDX_GLOBALS};
use crate::state::State;
use crate::value::{Integer, TableRef, Type, Value};
use std::ffi::c_void;
use std::os::raw::c_int;

impl State {
    /// Pushes a new table with room for `narr` sequence and `nrec` other entries.
    pub fn create_table(&mut self, narr: c_int, nrec: c_int) {
        let narr = usize::try_from(narr).unwrap_or(0);
        let nrec = usize::try_from(nrec).unwrap_or(0);
        let table = self.new_table_ref(narr, nrec);
        self.push(Value::Table(table));
    }

    pub fn new_table(&mut self) {
        self.create_table(0, 0);
    }

    fn table_at(&mut self, idx: c_int) -> TableRef {
        match self.value_at(idx) {
            Some(Value::Table(t)) => t.clone(),
            _ => {
                let got = self.type_of(idx).name();
                self.error_message(format!("table expected, got {}", got))
            }
        }
    }

    fn pop_value(&mut self) -> Value {
        let value = self.get(-1);
        self.pop(1);
        value
    }

    fn push_typed(&mut self, value: Value) -> Type {
        let ty = value.type_of();
        self.push(value);
        ty
    }

    // ========================================================================
    // Raw access
    // ========================================================================

    /// Replaces the key on top with `t[key]`, without metamethods.
    pub fn raw_get(&mut self, idx: c_int) -> Type {
        let table = self.table_at(idx);
        let key = self.pop_value();
        let value = table.borrow().get(&key);
        self.push_typed(value)
    }

    /// `t[k] = v` with the key at -2 and the value at -1, without metamethods. Pops both.
    pub fn raw_set(&mut self, idx: c_int) {
        let table = self.table_at(idx);
        let value = self.pop_value();
        let key = self.pop_value();
        let result = table.borrow_mut().set(key, value);
        if let Err(err) = result {
            self.error_message(err.to_string());
        }
    }

    pub fn raw_get_i(&mut self, idx: c_int, n: Integer) -> Type {
        let table = self.table_at(idx);
        let value = table.borrow().get_int(n);
        self.push_typed(value)
    }

    /// `t[n] = v` with the value on top. Pops the value.
    pub fn raw_set_i(&mut self, idx: c_int, n: Integer) {
        let table = self.table_at(idx);
        let value = self.pop_value();
        table.borrow_mut().set_int(n, value);
    }

    /// Pushes `t[p]` where `p` is used as a light userdata key.
    pub fn raw_get_p(&mut self, idx: c_int, p: *const c_void) -> Type {
        let table = self.table_at(idx);
        let value = table.borrow().get(&Value::LightUserData(p as *mut c_void));
        self.push_typed(value)
    }

    /// `t[p] = v` with the value on top, `p` used as a light userdata key. Pops the value.
    pub fn raw_set_p(&mut self, idx: c_int, p: *const c_void) {
        let table = self.table_at(idx);
        let value = self.pop_value();
        let result = table
            .borrow_mut()
            .set(Value::LightUserData(p as *mut c_void), value);
        if let Err(err) = result {
            self.error_message(err.to_string());
        }
    }

    /// Raw length: string bytes, table border, userdata size; 0 otherwise.
    pub fn raw_len(&self, idx: c_int) -> usize {
        match self.value_at(idx) {
            Some(Value::String(s)) => s.len(),
            Some(Value::Table(t)) => t.borrow().len() as usize,
            Some(Value::UserData(ud)) => ud.size(),
            _ => 0,
        }
    }

    /// Pops a key and pushes the next key and value of the table at `idx`.
    ///
    /// Returns false, pushing nothing, when the traversal is over.
    pub fn next(&mut self, idx: c_int) -> bool {
        let table = self.table_at(idx);
        let key = self.pop_value();
        let step = table.borrow().next(&key);
        match step {
            Ok(Some((k, v))) => {
                self.push(k);
                self.push(v);
                true
            }
            Ok(None) => false,
            Err(err) => self.error_message(err.to_string()),
        }
    }

    // ========================================================================
    // Access with metamethods
    // ========================================================================

    /// Replaces the key on top with `t[key]`, honouring `__index`.
    pub fn get_table(&mut self, idx: c_int) -> Type {
        let target = self.get(idx);
        let key = self.pop_value();
        let value = self.index_value(target, key);
        self.push_typed(value)
    }

    pub fn get_field(&mut self, idx: c_int, name: &str) -> Type {
        let target = self.get(idx);
        let key = Value::String(self.new_string(name.as_bytes()));
        let value = self.index_value(target, key);
        self.push_typed(value)
    }

    pub fn geti(&mut self, idx: c_int, n: Integer) -> Type {
        let target = self.get(idx);
        let value = self.index_value(target, Value::Integer(n));
        self.push_typed(value)
    }

    /// `t[k] = v` with the key at -2 and the value at -1, honouring `__newindex`. Pops both.
    pub fn set_table(&mut self, idx: c_int) {
        let target = self.get(idx);
        let value = self.pop_value();
        let key = self.pop_value();
        self.newindex_value(target, key, value);
    }

    /// `t[name] = v` with the value on top. Pops the value.
    pub fn set_field(&mut self, idx: c_int, name: &str) {
        let target = self.get(idx);
        let key = Value::String(self.new_string(name.as_bytes()));
        let value = self.pop_value();
        self.newindex_value(target, key, value);
    }

    pub(crate) fn index_value(&mut self, mut target: Value, key: Value) -> Value {
        for _ in 0..MAX_META_CHAIN {
            let handler = match &target {
                Value::Table(t) => {
                    let raw = t.borrow().get(&key);
                    if !raw.is_nil() {
                        return raw;
                    }
                    let handler = self.metafield(&target, &self.names.index);
                    if handler.is_nil() {
                        return Value::Nil;
                    }
                    handler
                }
                other => {
                    let handler = self.metafield(other, &self.names.index);
                    if handler.is_nil() {
                        self.error_message(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        ));
                    }
                    handler
                }
            };
            if handler.is_callable() {
                let func = self.stack.len();
                self.push(handler);
                self.push(target);
                self.push(key);
                self.call_at(func, 1);
                return self.pop_value();
            }
            target = handler;
        }
        self.error_message("'__index' chain too long; possible loop")
    }

    pub(crate) fn newindex_value(&mut self, mut target: Value, key: Value, value: Value) {
        for _ in 0..MAX_META_CHAIN {
            let handler = match &target {
                Value::Table(t) => {
                    let present = !t.borrow().get(&key).is_nil();
                    let handler = if present {
                        Value::Nil
                    } else {
                        self.metafield(&target, &self.names.newindex)
                    };
                    if handler.is_nil() {
                        let result = t.borrow_mut().set(key, value);
                        if let Err(err) = result {
                            self.error_message(err.to_string());
                        }
                        return;
                    }
                    handler
                }
                other => {
                    let handler = self.metafield(other, &self.names.newindex);
                    if handler.is_nil() {
                        self.error_message(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        ));
                    }
                    handler
                }
            };
            if handler.is_callable() {
                let func = self.stack.len();
                self.push(handler);
                self.push(target);
                self.push(key);
                self.push(value);
                self.call_at(func, 0);
                return;
            }
            target = handler;
        }
        self.error_message("'__newindex' chain too long; possible loop")
    }

    /// Pushes the length of the value at `idx`, honouring `__len`.
    pub fn len(&mut self, idx: c_int) {
        let value = self.get(idx);
        let handler = self.metafield(&value, &self.names.len);
        if !handler.is_nil() {
            self.push(handler);
            self.push(value);
            self.call(1, 1);
            return;
        }
        match &value {
            Value::String(s) => self.push_integer(s.len() as Integer),
            Value::Table(t) => {
                let n = t.borrow().len();
                self.push_integer(n);
            }
            other => self.error_message(format!(
                "attempt to get length of a {} value",
                other.type_name()
            )),
        }
    }

    // ========================================================================
    // Metatables and globals
    // ========================================================================

    /// Pushes the metatable of the value at `idx` if it has one.
    pub fn get_metatable(&mut self, idx: c_int) -> bool {
        match self.value_at(idx).and_then(Value::metatable) {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pops a table (or nil) and sets it as the metatable of the value at `idx`.
    pub fn set_metatable(&mut self, idx: c_int) {
        let target = self.get(idx);
        let metatable = match self.pop_value() {
            Value::Table(t) => Some(t),
            Value::Nil => None,
            other => self.error_message(format!(
                "metatable must be a table or nil, got {}",
                other.type_name()
            )),
        };
        match &target {
            Value::Table(t) => t.set_metatable(metatable),
            Value::UserData(ud) => ud.set_metatable(metatable),
            other => self.error_message(format!(
                "cannot set metatable of a {} value",
                other.type_name()
            )),
        }
    }

    pub fn push_globals(&mut self) {
        self.raw_get_i(REGISTRY_INDEX, RIDX_GLOBALS);
    }

    pub fn get_global(&mut self, name: &str) -> Type {
        self.push_globals();
        let ty = self.get_field(-1, name);
        self.remove(-2);
        ty
    }

    /// Pops a value into the global `name`.
    pub fn set_global(&mut self, name: &str) {
        self.push_globals();
        self.insert(-2);
        self.set_field(-2, name);
        self.pop(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Status;
    use pretty_assertions::assert_eq;

    fn index_handler(state: &mut State) -> c_int {
        let key = state.to_bytes(2).map(|s| s.to_string_lossy()).unwrap_or_default();
        state.push_string(format!("computed {}", key));
        1
    }

    fn index_nil(state: &mut State) -> c_int {
        state.push_nil();
        state.get_field(-1, "x");
        1
    }

    #[test]
    fn test_raw_set_and_get() {
        let mut state = State::new();
        state.new_table();
        state.push_string("k");
        state.push_integer(7);
        state.raw_set(1);
        state.push_string("k");
        assert_eq!(state.raw_get(1), Type::Number);
        assert_eq!(state.to_integer(-1), 7);
        assert_eq!(state.get_top(), 2);
    }

    #[test]
    fn test_raw_light_userdata_keys() {
        static KEY: u8 = 0;
        let key = &KEY as *const u8 as *const c_void;
        let mut state = State::new();
        state.push_boolean(true);
        state.raw_set_p(REGISTRY_INDEX, key);
        assert_eq!(state.raw_get_p(REGISTRY_INDEX, key), Type::Boolean);
    }

    #[test]
    fn test_index_metamethod_function() {
        let mut state = State::new();
        state.new_table();
        state.new_table();
        state.push_function(index_handler);
        state.set_field(-2, "__index");
        state.set_metatable(1);

        state.get_field(1, "foo");
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "computed foo"
        );
    }

    #[test]
    fn test_index_metamethod_table_chain() {
        let mut state = State::new();
        state.new_table(); // 1: object
        state.new_table(); // 2: fallback
        state.push_integer(3);
        state.set_field(2, "x");
        state.new_table(); // 3: metatable
        state.push_value(2);
        state.set_field(3, "__index");
        state.push_value(3);
        state.set_metatable(1);

        assert_eq!(state.get_field(1, "x"), Type::Number);
        assert_eq!(state.to_integer(-1), 3);
    }

    #[test]
    fn test_indexing_nil_raises() {
        let mut state = State::new();
        state.push_function(index_nil);
        assert_eq!(state.pcall(0, 1, 0), Status::ErrRun);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "attempt to index a nil value"
        );
    }

    #[test]
    fn test_next_on_empty_table_pushes_nothing() {
        let mut state = State::new();
        state.new_table();
        state.push_nil();
        assert!(!state.next(1));
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut state = State::new();
        state.push_integer(11);
        state.set_global("answer");
        assert_eq!(state.get_top(), 0);
        assert_eq!(state.get_global("answer"), Type::Number);
        assert_eq!(state.to_integer(-1), 11);
    }
}
