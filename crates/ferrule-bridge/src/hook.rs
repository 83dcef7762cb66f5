//! Debug hooks backed by host closures

use crate::bridge::{Bridge, ExtraData};
use crate::error::Result;
use crate::ffi::shim;
use crate::util::callback_error;
use ferrule_vm::{Debug, HookMask, State};
use std::os::raw::c_int;
use std::rc::Rc;

/// Which events trigger the hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookTriggers {
    /// Before a function is entered
    pub on_calls: bool,
    /// Before a function returns
    pub on_returns: bool,
}

impl HookTriggers {
    pub const ON_CALLS: Self = HookTriggers {
        on_calls: true,
        on_returns: false,
    };

    pub const ON_RETURNS: Self = HookTriggers {
        on_calls: false,
        on_returns: true,
    };

    pub const fn new() -> Self {
        HookTriggers {
            on_calls: false,
            on_returns: false,
        }
    }

    pub const fn on_calls(mut self) -> Self {
        self.on_calls = true;
        self
    }

    pub const fn on_returns(mut self) -> Self {
        self.on_returns = true;
        self
    }

    fn mask(self) -> HookMask {
        HookMask {
            on_calls: self.on_calls,
            on_returns: self.on_returns,
        }
    }
}

impl Bridge {
    /// Installs a hook, replacing any previous one.
    ///
    /// An error returned by `callback` is raised at the point the hook fired
    /// and reaches the host as [`crate::Error::CallbackError`].
    pub fn set_hook<F>(&mut self, triggers: HookTriggers, callback: F)
    where
        F: Fn(&mut Bridge, &Debug) -> Result<()> + 'static,
    {
        tracing::debug!(
            on_calls = triggers.on_calls,
            on_returns = triggers.on_returns,
            "installing hook"
        );
        self.extra_mut().hook_callback = Some(Rc::new(callback));
        self.state_mut().set_hook(shim::call_hook_proc, triggers.mask());
    }

    pub fn remove_hook(&mut self) {
        tracing::debug!("removing hook");
        self.state_mut().remove_hook();
        self.extra_mut().hook_callback = None;
    }
}

/// Runs the installed hook callback. Index 1 holds the failure slot.
pub(crate) fn hook_proc(state: &mut State, ar: &Debug) -> c_int {
    callback_error(state, |state, _| {
        let callback = state
            .extra::<ExtraData>()
            .and_then(|extra| extra.hook_callback.clone());
        if let Some(callback) = callback {
            callback(Bridge::from_state_mut(state), ar)?;
        }
        Ok(0)
    })
}
