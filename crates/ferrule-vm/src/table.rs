//! Table storage
//!
//! Entries are kept in insertion order so that `next` can walk them with a
//! plain position. Assigning `nil` keeps the entry as a dead slot; the key stays
//! valid for traversal and a later assignment revives the slot.

use crate::value::{Integer, Key, KeyError, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Failure of a traversal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid key to 'next'")]
pub struct InvalidNextKey;

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<(Key, Value)>,
    index: HashMap<Key, usize>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        let capacity = narr + nrec;
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Raw lookup. Keys that can never be stored (nil, NaN) read as nil.
    pub fn get(&self, key: &Value) -> Value {
        match Key::new(key.clone()) {
            Ok(key) => self.get_key(&key),
            Err(_) => Value::Nil,
        }
    }

    pub fn get_int(&self, i: Integer) -> Value {
        self.get_key(&Key::int(i))
    }

    pub(crate) fn get_key(&self, key: &Key) -> Value {
        self.index
            .get(key)
            .map(|&pos| self.entries[pos].1.clone())
            .unwrap_or(Value::Nil)
    }

    /// Raw assignment.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), KeyError> {
        let key = Key::new(key)?;
        self.set_key(key, value);
        Ok(())
    }

    pub fn set_int(&mut self, i: Integer, value: Value) {
        self.set_key(Key::int(i), value);
    }

    pub(crate) fn set_key(&mut self, key: Key, value: Value) {
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None if value.is_nil() => {}
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// A border: `n` such that `t[n]` is non-nil and `t[n + 1]` is nil (0 if `t[1]` is nil).
    pub fn len(&self) -> Integer {
        let mut n: Integer = 0;
        while !self.get_int(n + 1).is_nil() {
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, v)| v.is_nil())
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|(_, v)| !v.is_nil()).count()
    }

    /// One traversal step: the live entry after `key`, or the first one when `key` is nil.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, InvalidNextKey> {
        let start = if key.is_nil() {
            0
        } else {
            let key = Key::new(key.clone()).map_err(|_| InvalidNextKey)?;
            self.index.get(&key).ok_or(InvalidNextKey)? + 1
        };
        Ok(self.entries[start..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value().clone(), v.clone())))
    }

    /// Live entries in traversal order.
    pub fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value().clone(), v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int(i: Integer) -> Value {
        Value::Integer(i)
    }

    #[test]
    fn test_set_and_get() {
        let mut t = Table::new();
        t.set(int(1), Value::Boolean(true)).unwrap();
        assert_eq!(t.get(&int(1)), Value::Boolean(true));
        assert_eq!(t.get(&Value::Number(1.0)), Value::Boolean(true));
        assert_eq!(t.get(&int(2)), Value::Nil);
    }

    #[test]
    fn test_nil_key_rejected() {
        let mut t = Table::new();
        assert_eq!(t.set(Value::Nil, int(1)), Err(KeyError::Nil));
        assert_eq!(t.get(&Value::Nil), Value::Nil);
    }

    #[test]
    fn test_border() {
        let mut t = Table::new();
        for i in 1..=3 {
            t.set_int(i, int(i * 10));
        }
        assert_eq!(t.len(), 3);
        t.set_int(3, Value::Nil);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_next_walks_live_entries_in_order() {
        let mut t = Table::new();
        t.set_int(1, int(10));
        t.set_int(2, int(20));
        t.set_int(3, int(30));
        t.set_int(2, Value::Nil);

        let (k1, v1) = t.next(&Value::Nil).unwrap().unwrap();
        assert_eq!((k1.clone(), v1), (int(1), int(10)));
        let (k3, v3) = t.next(&k1).unwrap().unwrap();
        assert_eq!((k3.clone(), v3), (int(3), int(30)));
        assert!(t.next(&k3).unwrap().is_none());
    }

    #[test]
    fn test_next_on_empty_table() {
        let t = Table::new();
        assert!(t.next(&Value::Nil).unwrap().is_none());
    }

    #[test]
    fn test_next_with_unknown_key() {
        let t = Table::new();
        assert_eq!(t.next(&int(7)), Err(InvalidNextKey));
    }
}
