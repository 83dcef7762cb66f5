//! Host types exposed to foreign code as userdata
//!
//! A type implementing [`UserData`] declares its fields and methods once.
//! The first time a value of that type is created the declarations are
//! turned into a metatable whose `__index` and `__newindex` are dispatch
//! closures over getter, setter and method tables. The metatable is cached
//! per type for the lifetime of the bridge.
//!
//! Lookup order on read is getters, then methods, then the type's own
//! `__index` meta entry. A key found nowhere raises
//! `attempt to get an unknown field '<key>'`.

use crate::bridge::{Bridge, HostCallback};
use crate::error::{Error, Result};
use crate::ffi::{safe, shim};
use crate::util::{check_stack, StackGuard};
use ferrule_vm::{State, TableRef, Type, UserDataAccess, Value};
use std::any::TypeId;
use std::cell::{Ref, RefMut};
use std::mem;
use std::os::raw::c_int;
use std::rc::Rc;

/// A host type that can be handed to foreign code.
pub trait UserData: Sized + 'static {
    fn add_fields(_fields: &mut UserDataRegistry<Self>) {}

    fn add_methods(_methods: &mut UserDataRegistry<Self>) {}
}

/// Collects the declarations of one [`UserData`] type.
pub struct UserDataRegistry<T> {
    getters: Vec<(String, HostCallback)>,
    setters: Vec<(String, HostCallback)>,
    methods: Vec<(String, HostCallback)>,
    meta_fields: Vec<(String, Value)>,
    meta_functions: Vec<(String, HostCallback)>,
    _type: std::marker::PhantomData<T>,
}

impl<T: UserData> UserDataRegistry<T> {
    fn new() -> Self {
        UserDataRegistry {
            getters: Vec::new(),
            setters: Vec::new(),
            methods: Vec::new(),
            meta_fields: Vec::new(),
            meta_functions: Vec::new(),
            _type: std::marker::PhantomData,
        }
    }

    /// A field read through `obj.name`.
    pub fn add_field_method_get<F>(&mut self, name: impl Into<String>, getter: F)
    where
        F: Fn(&mut Bridge, &T) -> Result<Value> + 'static,
    {
        let callback = host_callback(move |bridge, args| {
            let ud = self_arg(&args)?;
            let this = borrow_userdata::<T>(&ud)?;
            Ok(vec![getter(bridge, &this)?])
        });
        self.getters.push((name.into(), callback));
    }

    /// A field written through `obj.name = value`.
    pub fn add_field_method_set<F>(&mut self, name: impl Into<String>, setter: F)
    where
        F: Fn(&mut Bridge, &mut T, Value) -> Result<()> + 'static,
    {
        let callback = host_callback(move |bridge, args| {
            let ud = self_arg(&args)?;
            let value = args.get(1).cloned().unwrap_or_default();
            let mut this = borrow_userdata_mut::<T>(&ud)?;
            setter(bridge, &mut this, value)?;
            Ok(Vec::new())
        });
        self.setters.push((name.into(), callback));
    }

    /// A method called as `obj:name(...)`.
    pub fn add_method<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(&mut Bridge, &T, Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        let callback = host_callback(move |bridge, mut args| {
            let ud = self_arg(&args)?;
            args.remove(0);
            let this = borrow_userdata::<T>(&ud)?;
            method(bridge, &this, args)
        });
        self.methods.push((name.into(), callback));
    }

    /// Like [`add_method`](Self::add_method) with exclusive access to the value.
    pub fn add_method_mut<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(&mut Bridge, &mut T, Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        let callback = host_callback(move |bridge, mut args| {
            let ud = self_arg(&args)?;
            args.remove(0);
            let mut this = borrow_userdata_mut::<T>(&ud)?;
            method(bridge, &mut this, args)
        });
        self.methods.push((name.into(), callback));
    }

    /// A raw metatable entry, e.g. `__name` or a fallback `__index` table.
    pub fn add_meta_field(&mut self, name: impl Into<String>, value: Value) {
        self.meta_fields.push((name.into(), value));
    }

    /// A metamethod such as `__tostring`. Receives the raw arguments.
    pub fn add_meta_function<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&mut Bridge, Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        self.meta_functions.push((name.into(), host_callback(function)));
    }
}

fn host_callback<F>(f: F) -> HostCallback
where
    F: Fn(&mut Bridge, Vec<Value>) -> Result<Vec<Value>> + 'static,
{
    Rc::new(f)
}

fn self_arg(args: &[Value]) -> Result<Value> {
    match args.first() {
        Some(v @ Value::UserData(_)) => Ok(v.clone()),
        _ => Err(Error::UserDataTypeMismatch),
    }
}

/// Shared access to the `T` inside a userdata value.
pub fn borrow_userdata<T: 'static>(value: &Value) -> Result<Ref<'_, T>> {
    let ud = value.as_userdata().ok_or(Error::UserDataTypeMismatch)?;
    ud.try_borrow::<T>().map_err(|err| match err {
        UserDataAccess::TypeMismatch => Error::UserDataTypeMismatch,
        UserDataAccess::Borrowed => Error::UserDataBorrowError,
    })
}

/// Exclusive access to the `T` inside a userdata value.
pub fn borrow_userdata_mut<T: 'static>(value: &Value) -> Result<RefMut<'_, T>> {
    let ud = value.as_userdata().ok_or(Error::UserDataTypeMismatch)?;
    ud.try_borrow_mut::<T>().map_err(|err| match err {
        UserDataAccess::TypeMismatch => Error::UserDataTypeMismatch,
        UserDataAccess::Borrowed => Error::UserDataBorrowMutError,
    })
}

impl Bridge {
    /// Moves `data` into a new userdata carrying the metatable of `T`.
    pub fn create_userdata<T: UserData>(&mut self, data: T) -> Result<Value> {
        let metatable = self.userdata_metatable::<T>()?;

        let mut guard = StackGuard::new(self.state_mut());
        check_stack(&guard, 4)?;
        let ud = safe::new_userdata(&mut guard, mem::size_of::<T>())?;
        ud.write(data).map_err(|_| Error::UserDataTypeMismatch)?;
        ud.set_metatable(Some(metatable));
        Ok(guard.value_at(-1).cloned().unwrap_or_default())
    }

    fn userdata_metatable<T: UserData>(&mut self) -> Result<TableRef> {
        let type_id = TypeId::of::<T>();
        if let Some(mt) = self.extra_mut().userdata_metatables.get(&type_id) {
            return Ok(mt.clone());
        }

        let mut registry = UserDataRegistry::<T>::new();
        T::add_fields(&mut registry);
        T::add_methods(&mut registry);

        let metatable = self.build_metatable(registry)?;
        tracing::debug!(
            type_name = std::any::type_name::<T>(),
            "registered userdata metatable"
        );
        self.extra_mut()
            .userdata_metatables
            .insert(type_id, metatable.clone());
        Ok(metatable)
    }

    fn build_metatable<T>(&mut self, registry: UserDataRegistry<T>) -> Result<TableRef> {
        let UserDataRegistry {
            getters,
            setters,
            methods,
            meta_fields,
            meta_functions,
            ..
        } = registry;

        let getters = self.create_callbacks(getters)?;
        let setters = self.create_callbacks(setters)?;
        let methods = self.create_callbacks(methods)?;
        let meta_functions = self.create_callbacks(meta_functions)?;

        let mut guard = StackGuard::new(self.state_mut());
        check_stack(&guard, 12)?;

        safe::create_table(&mut guard, 0, 0)?;
        let mt_idx = guard.get_top();
        for (name, value) in meta_fields.into_iter().chain(meta_functions) {
            guard.push(value);
            safe::raw_set_field(&mut guard, mt_idx, &name)?;
        }

        let getters_idx = push_field_table(&mut guard, getters)?;
        let setters_idx = push_field_table(&mut guard, setters)?;
        let methods_idx = push_field_table(&mut guard, methods)?;

        if getters_idx.is_some() || methods_idx.is_some() {
            push_base_meta(&mut guard, mt_idx, "__index")?;
            push_index_or_nil(&mut guard, getters_idx);
            push_index_or_nil(&mut guard, methods_idx);
            safe::push_closure(&mut guard, shim::meta_index_impl, 3)?;
            safe::raw_set_field(&mut guard, mt_idx, "__index")?;
        }

        if let Some(setters_idx) = setters_idx {
            push_base_meta(&mut guard, mt_idx, "__newindex")?;
            guard.push_value(setters_idx);
            safe::push_closure(&mut guard, shim::meta_newindex_impl, 2)?;
            safe::raw_set_field(&mut guard, mt_idx, "__newindex")?;
        }

        guard.to_table(mt_idx).ok_or(Error::UserDataTypeMismatch)
    }
}

impl Bridge {
    fn create_callbacks(
        &mut self,
        entries: Vec<(String, HostCallback)>,
    ) -> Result<Vec<(String, Value)>> {
        entries
            .into_iter()
            .map(|(name, callback)| Ok((name, self.create_callback(callback)?)))
            .collect()
    }
}

/// Pushes a table of `entries` and returns its index, or pushes nothing when
/// there are no entries.
fn push_field_table(state: &mut State, entries: Vec<(String, Value)>) -> Result<Option<c_int>> {
    if entries.is_empty() {
        return Ok(None);
    }
    safe::create_table(state, 0, entries.len() as c_int)?;
    let idx = state.get_top();
    for (name, value) in entries {
        state.push(value);
        safe::raw_set_field(state, idx, &name)?;
    }
    Ok(Some(idx))
}

fn push_index_or_nil(state: &mut State, idx: Option<c_int>) {
    match idx {
        Some(idx) => state.push_value(idx),
        None => state.push_nil(),
    }
}

/// Pushes the raw `name` entry of the metatable as the fallback of a dispatch
/// closure. Only nil, a table or a function can serve as fallback.
fn push_base_meta(state: &mut State, mt_idx: c_int, name: &str) -> Result<()> {
    safe::push_string(state, name)?;
    match state.raw_get(mt_idx) {
        Type::Nil | Type::Table | Type::Function => Ok(()),
        ty => {
            state.pop(1);
            Err(Error::runtime(format!("improper {} type {}", name, ty)))
        }
    }
}
