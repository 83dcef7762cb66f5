//! Runtime configuration constants as seen by the binding layer
//!
//! Each constant is re-exported with a fixed C-style type, and [`manifest`]
//! lists them by name for tools that need the table at run time.

use ferrule_vm::{
    Integer, Status, Type, DEFAULT_MAX_STACK, MAX_UPVALUES, MIN_STACK, MULTRET, REGISTRY_INDEX,
    RIDX_GLOBALS,
};
use std::os::raw::c_int;

pub const TNONE: c_int = Type::None.tag();
pub const TNIL: c_int = Type::Nil.tag();
pub const TBOOLEAN: c_int = Type::Boolean.tag();
pub const TLIGHTUSERDATA: c_int = Type::LightUserData.tag();
pub const TNUMBER: c_int = Type::Number.tag();
pub const TSTRING: c_int = Type::String.tag();
pub const TTABLE: c_int = Type::Table.tag();
pub const TFUNCTION: c_int = Type::Function.tag();
pub const TUSERDATA: c_int = Type::UserData.tag();

pub const OK: c_int = Status::Ok.code();
pub const ERRRUN: c_int = Status::ErrRun.code();
pub const ERRMEM: c_int = Status::ErrMem.code();
pub const ERRERR: c_int = Status::ErrErr.code();

pub const LUA_MULTRET: c_int = MULTRET;
pub const LUA_MINSTACK: c_int = MIN_STACK as c_int;
pub const LUAI_MAXSTACK: c_int = DEFAULT_MAX_STACK as c_int;
pub const LUA_REGISTRYINDEX: c_int = REGISTRY_INDEX;
pub const LUA_RIDX_GLOBALS: c_int = RIDX_GLOBALS as c_int;
pub const LUAI_MAXUPVALUES: c_int = MAX_UPVALUES as c_int;

/// Width of the runtime integer type in bits, fixed at build time.
pub const LUA_INTEGER_BITS: c_int = (std::mem::size_of::<Integer>() * 8) as c_int;

/// One entry of the constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    pub name: &'static str,
    pub value: c_int,
}

impl Constant {
    const fn new(name: &'static str, value: c_int) -> Constant {
        Constant { name, value }
    }
}

const MANIFEST: &[Constant] = &[
    Constant::new("LUA_TNONE", TNONE),
    Constant::new("LUA_TNIL", TNIL),
    Constant::new("LUA_TBOOLEAN", TBOOLEAN),
    Constant::new("LUA_TLIGHTUSERDATA", TLIGHTUSERDATA),
    Constant::new("LUA_TNUMBER", TNUMBER),
    Constant::new("LUA_TSTRING", TSTRING),
    Constant::new("LUA_TTABLE", TTABLE),
    Constant::new("LUA_TFUNCTION", TFUNCTION),
    Constant::new("LUA_TUSERDATA", TUSERDATA),
    Constant::new("LUA_OK", OK),
    Constant::new("LUA_ERRRUN", ERRRUN),
    Constant::new("LUA_ERRMEM", ERRMEM),
    Constant::new("LUA_ERRERR", ERRERR),
    Constant::new("LUA_MULTRET", LUA_MULTRET),
    Constant::new("LUA_MINSTACK", LUA_MINSTACK),
    Constant::new("LUAI_MAXSTACK", LUAI_MAXSTACK),
    Constant::new("LUA_REGISTRYINDEX", LUA_REGISTRYINDEX),
    Constant::new("LUA_RIDX_GLOBALS", LUA_RIDX_GLOBALS),
    Constant::new("LUAI_MAXUPVALUES", LUAI_MAXUPVALUES),
    Constant::new("LUA_INTEGER_BITS", LUA_INTEGER_BITS),
];

/// Every exported constant, in declaration order.
pub fn manifest() -> &'static [Constant] {
    MANIFEST
}

/// Looks up a constant by its exported name.
pub fn lookup(name: &str) -> Option<c_int> {
    MANIFEST.iter().find(|c| c.name == name).map(|c| c.value)
}
