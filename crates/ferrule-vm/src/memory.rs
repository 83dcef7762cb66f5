//! Memory accounting
//!
//! The runtime does not own an allocator; it charges an approximate cost for
//! every object it creates against a counter shared by all objects of a state.
//! The charge is released when the object is dropped.

use std::cell::Cell;
use std::rc::Rc;

pub(crate) const STRING_COST: usize = 32;
pub(crate) const TABLE_COST: usize = 64;
pub(crate) const CLOSURE_COST: usize = 48;
pub(crate) const UPVALUE_COST: usize = 16;
pub(crate) const USERDATA_COST: usize = 48;

#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    used: Cell<usize>,
    limit: Cell<Option<usize>>,
}

impl MemoryState {
    pub(crate) fn used(&self) -> usize {
        self.used.get()
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.limit.get()
    }

    /// Sets a new limit and returns the previous one.
    pub(crate) fn set_limit(&self, limit: Option<usize>) -> Option<usize> {
        self.limit.replace(limit)
    }

    /// Charges `size` bytes, or returns `None` if that would exceed the limit.
    pub(crate) fn try_reserve(self: &Rc<Self>, size: usize) -> Option<Allocation> {
        let used = self.used.get().checked_add(size)?;
        if matches!(self.limit.get(), Some(limit) if used > limit) {
            return None;
        }
        self.used.set(used);
        Some(Allocation {
            size,
            memory: Rc::clone(self),
        })
    }

    /// Charges `size` bytes regardless of the limit.
    ///
    /// Only used for the objects that report a memory error.
    pub(crate) fn force_reserve(self: &Rc<Self>, size: usize) -> Allocation {
        self.used.set(self.used.get().saturating_add(size));
        Allocation {
            size,
            memory: Rc::clone(self),
        }
    }
}

/// A charge against a [`MemoryState`], released on drop.
pub(crate) struct Allocation {
    size: usize,
    memory: Rc<MemoryState>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let used = self.memory.used.get();
        self.memory.used.set(used.saturating_sub(self.size));
    }
}
