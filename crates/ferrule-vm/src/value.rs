//! Runtime value representation
//!
//! - Nil, Boolean, Integer, Number, LightUserData: immediate values
//! - String: reference-counted immutable byte strings
//! - Table, Function, UserData: reference-counted objects compared by identity
//! - NativeFunction: a bare function pointer with no upvalues (never allocates)
//!
//! Every heap object carries an [`Allocation`] so the owning state can enforce
//! its memory limit.

use crate::memory::Allocation;
use crate::state::State;
use crate::table::Table;
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::os::raw::c_int;
use std::rc::Rc;
use thiserror::Error;

/// Integer type of the runtime, selected at build time.
#[cfg(not(feature = "int32"))]
pub type Integer = i64;
/// Integer type of the runtime, selected at build time.
#[cfg(feature = "int32")]
pub type Integer = i32;

/// Floating point type of the runtime.
pub type Number = f64;

/// Native function contract.
///
/// The function sees its arguments at stack indices `1..=get_top()` and returns
/// the number of results it left on top of the stack.
pub type NativeFn = fn(&mut State) -> c_int;

/// Basic types, with tags matching the classic C API numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Not a valid stack index
    None,
    Nil,
    Boolean,
    LightUserData,
    Number,
    String,
    Table,
    Function,
    UserData,
}

impl Type {
    /// Numeric tag of the type (`-1` for [`Type::None`]).
    pub const fn tag(self) -> c_int {
        match self {
            Type::None => -1,
            Type::Nil => 0,
            Type::Boolean => 1,
            Type::LightUserData => 2,
            Type::Number => 3,
            Type::String => 4,
            Type::Table => 5,
            Type::Function => 6,
            Type::UserData => 7,
        }
    }

    /// Name used in error messages and by `type()`.
    pub const fn name(self) -> &'static str {
        match self {
            Type::None => "no value",
            Type::Nil => "nil",
            Type::Boolean => "boolean",
            Type::LightUserData | Type::UserData => "userdata",
            Type::Number => "number",
            Type::String => "string",
            Type::Table => "table",
            Type::Function => "function",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value owned by the runtime.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(Integer),
    Number(Number),
    String(StringRef),
    Table(TableRef),
    Function(FunctionRef),
    NativeFunction(NativeFn),
    UserData(UserDataRef),
    LightUserData(*mut c_void),
}

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Nil => Type::Nil,
            Value::Boolean(_) => Type::Boolean,
            Value::Integer(_) | Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::Table(_) => Type::Table,
            Value::Function(_) | Value::NativeFunction(_) => Type::Function,
            Value::UserData(_) => Type::UserData,
            Value::LightUserData(_) => Type::LightUserData,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_of().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::NativeFunction(_))
    }

    /// Truthiness: only `nil` and `false` are false.
    pub fn to_boolean(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Integer view of numbers and numeric strings with an exact integer value.
    pub fn as_integer(&self) -> Option<Integer> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) => number_to_integer(*n),
            Value::String(s) => parse_number(s.as_bytes()).and_then(|v| v.as_integer()),
            _ => None,
        }
    }

    /// Float view of numbers and numeric strings.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(i) => Some(*i as Number),
            Value::Number(n) => Some(*n),
            Value::String(s) => parse_number(s.as_bytes()).and_then(|v| v.as_number()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&UserDataRef> {
        match self {
            Value::UserData(ud) => Some(ud),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&StringRef> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Identity pointer of reference values, null for immediates.
    pub fn to_pointer(&self) -> *const c_void {
        match self {
            Value::String(s) => Rc::as_ptr(&s.0) as *const c_void,
            Value::Table(t) => Rc::as_ptr(&t.0) as *const c_void,
            Value::Function(f) => Rc::as_ptr(&f.0) as *const c_void,
            Value::NativeFunction(f) => *f as *const c_void,
            Value::UserData(ud) => Rc::as_ptr(&ud.0) as *const c_void,
            Value::LightUserData(p) => *p as *const c_void,
            _ => std::ptr::null(),
        }
    }

    /// Metatable of tables and userdata.
    pub fn metatable(&self) -> Option<TableRef> {
        match self {
            Value::Table(t) => t.metatable(),
            Value::UserData(ud) => ud.metatable(),
            _ => None,
        }
    }
}

/// Raw equality: scalars and strings by value, objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(i), Value::Number(n)) | (Value::Number(n), Value::Integer(i)) => {
                number_to_integer(*n) == Some(*i)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => *a as usize == *b as usize,
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s.to_string_lossy()),
            other => write!(f, "{}: {:p}", other.type_name(), other.to_pointer()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Integer> for Value {
    fn from(i: Integer) -> Self {
        Value::Integer(i)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

/// Converts a float with an exact integer representation.
pub fn number_to_integer(n: Number) -> Option<Integer> {
    if n.fract() == 0.0 && n >= Integer::MIN as Number && n < -(Integer::MIN as Number) {
        Some(n as Integer)
    } else {
        None
    }
}

/// Parses a numeric string the way arithmetic coercion does.
pub fn parse_number(bytes: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .ok()
            .map(|v| Value::Integer(v as Integer));
    }
    if let Ok(i) = text.parse::<Integer>() {
        return Some(Value::Integer(i));
    }
    text.parse::<Number>().ok().map(Value::Number)
}

/// Formats a float like `%.14g`, keeping a `.0` suffix on integral values.
pub fn format_number(n: Number) -> String {
    if n.is_nan() {
        if n.is_sign_negative() { "-nan" } else { "nan" }.to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

// ============================================================================
// Strings
// ============================================================================

pub(crate) struct StringObj {
    bytes: Box<[u8]>,
    _alloc: Allocation,
}

/// Immutable byte string owned by the runtime.
#[derive(Clone)]
pub struct StringRef(pub(crate) Rc<StringObj>);

impl StringRef {
    pub(crate) fn new(bytes: &[u8], alloc: Allocation) -> Self {
        StringRef(Rc::new(StringObj {
            bytes: bytes.into(),
            _alloc: alloc,
        }))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0.bytes).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }
}

impl PartialEq for StringRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.as_bytes() == other.as_bytes()
    }
}

impl Eq for StringRef {}

impl fmt::Debug for StringRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

// ============================================================================
// Tables
// ============================================================================

pub(crate) struct TableObj {
    data: RefCell<Table>,
    metatable: RefCell<Option<TableRef>>,
    _alloc: Allocation,
}

/// Shared handle to a table.
#[derive(Clone)]
pub struct TableRef(pub(crate) Rc<TableObj>);

impl TableRef {
    pub(crate) fn new(table: Table, alloc: Allocation) -> Self {
        TableRef(Rc::new(TableObj {
            data: RefCell::new(table),
            metatable: RefCell::new(None),
            _alloc: alloc,
        }))
    }

    pub fn borrow(&self) -> Ref<'_, Table> {
        self.0.data.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Table> {
        self.0.data.borrow_mut()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.0.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        *self.0.metatable.borrow_mut() = metatable;
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:p}", Rc::as_ptr(&self.0))
    }
}

// ============================================================================
// Closures
// ============================================================================

pub(crate) struct Closure {
    pub(crate) func: NativeFn,
    pub(crate) upvalues: Box<[Value]>,
    pub(crate) name: Option<String>,
    _alloc: Allocation,
}

/// Shared handle to a native closure and its captured upvalues.
#[derive(Clone)]
pub struct FunctionRef(pub(crate) Rc<Closure>);

impl FunctionRef {
    pub(crate) fn new(
        func: NativeFn,
        upvalues: Vec<Value>,
        name: Option<String>,
        alloc: Allocation,
    ) -> Self {
        FunctionRef(Rc::new(Closure {
            func,
            upvalues: upvalues.into_boxed_slice(),
            name,
            _alloc: alloc,
        }))
    }

    pub fn upvalue(&self, n: usize) -> Option<&Value> {
        n.checked_sub(1).and_then(|i| self.0.upvalues.get(i))
    }

    pub fn upvalue_count(&self) -> usize {
        self.0.upvalues.len()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function: {:p}", Rc::as_ptr(&self.0))
    }
}

// ============================================================================
// Userdata
// ============================================================================

/// Why a userdata payload could not be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UserDataAccess {
    #[error("userdata is empty or holds another type")]
    TypeMismatch,
    #[error("userdata is already borrowed")]
    Borrowed,
}

pub(crate) struct UserDataObj {
    block: RefCell<Option<Box<dyn Any>>>,
    size: usize,
    metatable: RefCell<Option<TableRef>>,
    _alloc: Allocation,
}

/// Shared handle to a userdata block.
///
/// The block is reserved with a byte size when it is created and stays empty
/// until the host writes a value into it. Writing never allocates runtime
/// memory, so a reserved block can always be filled.
#[derive(Clone)]
pub struct UserDataRef(pub(crate) Rc<UserDataObj>);

impl UserDataRef {
    pub(crate) fn new(size: usize, alloc: Allocation) -> Self {
        UserDataRef(Rc::new(UserDataObj {
            block: RefCell::new(None),
            size,
            metatable: RefCell::new(None),
            _alloc: alloc,
        }))
    }

    /// Reserved size of the block in bytes.
    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn is_empty(&self) -> bool {
        self.0.block.borrow().is_none()
    }

    /// Stores `value` in the block, replacing any previous payload.
    ///
    /// Refused (the value is handed back) when the value does not fit the
    /// reservation or the block is borrowed.
    pub fn write<T: Any>(&self, value: T) -> Result<(), T> {
        if mem::size_of::<T>() > self.0.size {
            return Err(value);
        }
        match self.0.block.try_borrow_mut() {
            Ok(mut block) => {
                *block = Some(Box::new(value));
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0
            .block
            .try_borrow()
            .map(|b| b.as_ref().is_some_and(|b| b.is::<T>()))
            .unwrap_or(false)
    }

    pub fn try_borrow<T: Any>(&self) -> Result<Ref<'_, T>, UserDataAccess> {
        let block = self
            .0
            .block
            .try_borrow()
            .map_err(|_| UserDataAccess::Borrowed)?;
        Ref::filter_map(block, |b| b.as_ref().and_then(|b| b.downcast_ref::<T>()))
            .map_err(|_| UserDataAccess::TypeMismatch)
    }

    pub fn try_borrow_mut<T: Any>(&self) -> Result<RefMut<'_, T>, UserDataAccess> {
        let block = self
            .0
            .block
            .try_borrow_mut()
            .map_err(|_| UserDataAccess::Borrowed)?;
        RefMut::filter_map(block, |b| b.as_mut().and_then(|b| b.downcast_mut::<T>()))
            .map_err(|_| UserDataAccess::TypeMismatch)
    }

    /// Removes the payload if it is a `T`.
    pub fn take<T: Any>(&self) -> Option<T> {
        let mut block = self.0.block.try_borrow_mut().ok()?;
        match block.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *block = Some(other);
                None
            }
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.0.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        *self.0.metatable.borrow_mut() = metatable;
    }

    pub fn ptr_eq(&self, other: &UserDataRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for UserDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "userdata: {:p}", Rc::as_ptr(&self.0))
    }
}

// ============================================================================
// Table keys
// ============================================================================

/// Why a value cannot be used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("table index is nil")]
    Nil,
    #[error("table index is NaN")]
    NaN,
}

/// Normalised table key. Floats with an integer value become integers.
#[derive(Clone, Debug)]
pub(crate) struct Key(Value);

impl Key {
    pub(crate) fn new(value: Value) -> Result<Key, KeyError> {
        match value {
            Value::Nil => Err(KeyError::Nil),
            Value::Number(n) if n.is_nan() => Err(KeyError::NaN),
            Value::Number(n) => Ok(Key(match number_to_integer(n) {
                Some(i) => Value::Integer(i),
                None => Value::Number(n),
            })),
            other => Ok(Key(other)),
        }
    }

    pub(crate) fn int(i: Integer) -> Key {
        Key(Value::Integer(i))
    }

    pub(crate) fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(&self.0).hash(state);
        match &self.0 {
            Value::Nil => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::String(s) => s.as_bytes().hash(state),
            other => (other.to_pointer() as usize).hash(state),
        }
    }
}
