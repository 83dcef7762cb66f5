//! Debug hooks, tracebacks and display strings

use crate::config::{TRACEBACK_HEAD, TRACEBACK_TAIL};
use crate::state::{CallInfo, FrameKind, State};
use crate::value::{format_number, StringRef, Value};
use std::fmt::Write;
use std::os::raw::c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// A native function was entered
    Call,
    /// A native function is about to return
    Return,
}

/// Events a hook is called for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookMask {
    pub on_calls: bool,
    pub on_returns: bool,
}

impl HookMask {
    pub fn is_empty(&self) -> bool {
        !self.on_calls && !self.on_returns
    }

    pub fn contains(&self, event: HookEvent) -> bool {
        match event {
            HookEvent::Call => self.on_calls,
            HookEvent::Return => self.on_returns,
        }
    }
}

/// Hook entry point. Runs in a frame of its own with an empty stack window.
pub type HookFn = fn(&mut State, &Debug);

/// What a hook is told about the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debug {
    pub event: HookEvent,
    /// Debug name of the function, if it has one
    pub name: Option<String>,
    /// Number of active native calls, including this one
    pub depth: usize,
}

fn frame_name(ci: &CallInfo) -> Option<&str> {
    match &ci.callee {
        Value::Function(f) => f.name(),
        _ => None,
    }
}

impl State {
    /// Installs `hook` for the events in `mask`. An empty mask removes the hook.
    pub fn set_hook(&mut self, hook: HookFn, mask: HookMask) {
        self.hook = (!mask.is_empty()).then_some((hook, mask));
    }

    pub fn remove_hook(&mut self) {
        self.hook = None;
    }

    pub fn hook_mask(&self) -> HookMask {
        self.hook.map(|(_, mask)| mask).unwrap_or_default()
    }

    /// Calls the hook for `event` unless hooks are disabled or already running.
    pub(crate) fn run_hook(&mut self, event: HookEvent) {
        let hook = match self.hook {
            Some((hook, mask)) if self.allow_hook && mask.contains(event) => hook,
            _ => return,
        };
        let ar = Debug {
            event,
            name: self.frames.last().and_then(frame_name).map(str::to_string),
            depth: self.depth(),
        };

        let top = self.stack.len();
        self.allow_hook = false;
        self.frames.push(CallInfo {
            base: top,
            callee: Value::Nil,
            kind: FrameKind::Hook,
        });
        hook(self, &ar);
        self.frames.pop();
        self.stack.truncate(top);
        self.allow_hook = true;
    }

    /// Traceback of the active native frames, innermost first, starting
    /// `level` frames below the running one.
    pub fn traceback_string(&self, level: usize, msg: Option<&str>) -> String {
        let frames: Vec<&CallInfo> = self
            .frames
            .iter()
            .rev()
            .filter(|ci| ci.kind == FrameKind::Native)
            .skip(level)
            .collect();

        let mut out = String::new();
        if let Some(msg) = msg {
            out.push_str(msg);
            out.push('\n');
        }
        out.push_str("stack traceback:");

        let truncate = frames.len() > TRACEBACK_HEAD + TRACEBACK_TAIL;
        for (i, ci) in frames.iter().enumerate() {
            if truncate && i >= TRACEBACK_HEAD && i < frames.len() - TRACEBACK_TAIL {
                if i == TRACEBACK_HEAD {
                    let skipped = frames.len() - TRACEBACK_HEAD - TRACEBACK_TAIL;
                    let _ = write!(out, "\n\t...\t(skipping {} levels)", skipped);
                }
                continue;
            }
            match frame_name(ci) {
                Some(name) => {
                    let _ = write!(out, "\n\t[native]: in function '{}'", name);
                }
                None => out.push_str("\n\t[native]: in ?"),
            }
        }
        out
    }

    /// Pushes a traceback string. Allocates, so it may raise a memory error.
    pub fn traceback(&mut self, level: usize, msg: Option<&str>) {
        let text = self.traceback_string(level, msg);
        self.push_string(text);
    }

    /// Pushes a printable form of the value at `idx`, honouring `__tostring`
    /// and `__name`.
    pub fn to_display_string(&mut self, idx: c_int) -> StringRef {
        let value = self.get(idx);

        let tostring = self.metafield(&value, &self.names.tostring);
        if !tostring.is_nil() {
            self.push(tostring);
            self.push(value);
            self.call(1, 1);
            return match self.stack.last() {
                Some(Value::String(s)) => s.clone(),
                _ => self.error_message("'__tostring' must return a string"),
            };
        }

        if let Value::String(s) = value.clone() {
            self.push(value);
            return s;
        }
        let text = match &value {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => format_number(*n),
            other => {
                let kind = match self.metafield(other, &self.names.name) {
                    Value::String(name) => name.to_string_lossy(),
                    _ => other.type_name().to_string(),
                };
                format!("{}: {:p}", kind, other.to_pointer())
            }
        };
        self.push_string(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    thread_local! {
        static EVENTS: RefCell<Vec<(HookEvent, Option<String>, usize)>> = RefCell::new(Vec::new());
    }

    fn record(_: &mut State, ar: &Debug) {
        EVENTS.with(|e| e.borrow_mut().push((ar.event, ar.name.clone(), ar.depth)));
    }

    fn leaf(state: &mut State) -> c_int {
        state.push_integer(1);
        1
    }

    fn traced(state: &mut State) -> c_int {
        state.traceback(0, Some("here"));
        1
    }

    fn outer(state: &mut State) -> c_int {
        state.push_named_closure(traced, 0, "inner");
        state.call(0, 1);
        1
    }

    #[test]
    fn test_hook_sees_call_and_return() {
        EVENTS.with(|e| e.borrow_mut().clear());
        let mut state = State::new();
        state.set_hook(
            record,
            HookMask {
                on_calls: true,
                on_returns: true,
            },
        );
        state.push_named_closure(leaf, 0, "leaf");
        state.call(0, 1);

        let events = EVENTS.with(|e| e.borrow().clone());
        assert_eq!(
            events,
            vec![
                (HookEvent::Call, Some("leaf".to_string()), 1),
                (HookEvent::Return, Some("leaf".to_string()), 1),
            ]
        );
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_empty_mask_removes_hook() {
        let mut state = State::new();
        state.set_hook(record, HookMask::default());
        assert!(state.hook_mask().is_empty());
    }

    #[test]
    fn test_traceback_lists_frames_innermost_first() {
        let mut state = State::new();
        state.push_named_closure(outer, 0, "outer");
        state.call(0, 1);
        let text = state.to_bytes(-1).unwrap().to_string_lossy();
        assert_eq!(
            text,
            "here\nstack traceback:\n\t[native]: in function 'inner'\n\t[native]: in function 'outer'"
        );
    }

    #[test]
    fn test_traceback_level_skips_frames() {
        let state = State::new();
        assert_eq!(state.traceback_string(1, None), "stack traceback:");
    }

    #[test]
    fn test_display_string_of_scalars() {
        let mut state = State::new();
        state.push_nil();
        state.push_boolean(true);
        state.push_number(2.0);
        assert_eq!(state.to_display_string(1).as_bytes(), b"nil");
        assert_eq!(state.to_display_string(2).as_bytes(), b"true");
        assert_eq!(state.to_display_string(3).as_bytes(), b"2.0");
        assert_eq!(state.get_top(), 6);
    }
}
