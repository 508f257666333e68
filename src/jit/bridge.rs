//! The narrow ABI between native code and the interpreter.
//!
//! Native code can only produce doubles; a quiet NaN is the sentinel for
//! "this call must be redone by the interpreter". Both helpers catch every
//! panic at the boundary and degrade to the sentinel, so unwinding never
//! crosses generated code.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use crate::env::Env;
use crate::state::State;
use crate::value::{FuncData, Type, Value};

thread_local! {
    /// The interpreter that is currently executing native code. Installed
    /// with save/restore discipline around every native invocation so
    /// nested invocations of different states stay correct.
    static ACTIVE_STATE: Cell<*mut State> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn swap_active_state(s: *mut State) -> *mut State {
    ACTIVE_STATE.with(|cell| cell.replace(s))
}

fn active_state() -> *mut State {
    ACTIVE_STATE.with(|cell| cell.get())
}

/// Re-enter the interpreter from native code: rebuild the arguments as
/// number values and call the function payload. Non-numeric results and
/// every failure collapse to NaN.
pub(crate) extern "C" fn call_from_jit(fd: *mut FuncData, args: *const f64, argc: i32) -> f64 {
    let res = catch_unwind(AssertUnwindSafe(|| {
        let sp = active_state();
        if sp.is_null() || fd.is_null() {
            return f64::NAN;
        }
        let state = unsafe { &mut *sp };
        let callee = unsafe { Value::from_func_retained(fd) };
        let mut items = Vec::with_capacity(argc.max(0) as usize);
        for i in 0..argc.max(0) as usize {
            items.push(Value::number(unsafe { *args.add(i) }));
        }
        let arg_list = state.list_of(items);
        match state.call(&callee, &arg_list) {
            Ok(v) if v.kind() == Type::Number => v.as_number(),
            _ => f64::NAN,
        }
    }));
    res.unwrap_or(f64::NAN)
}

/// Resolve a free variable for native code: walk the captured environment
/// chain (or the active state's global frame when no environment was
/// captured) and return its numeric value; NaN when unbound or non-numeric.
pub(crate) extern "C" fn lookup_number(env: *mut Env, name: *const u8, len: usize) -> f64 {
    let res = catch_unwind(AssertUnwindSafe(|| {
        if name.is_null() {
            return f64::NAN;
        }
        let bytes = unsafe { std::slice::from_raw_parts(name, len) };
        let Ok(key) = std::str::from_utf8(bytes) else {
            return f64::NAN;
        };
        let mut e = env;
        if e.is_null() {
            let sp = active_state();
            if sp.is_null() {
                return f64::NAN;
            }
            e = unsafe { (*sp).global };
        }
        while !e.is_null() {
            unsafe {
                if let Some(v) = (*e).map.get(key) {
                    return if v.is_number() {
                        v.as_number()
                    } else {
                        f64::NAN
                    };
                }
                e = (*e).parent;
            }
        }
        f64::NAN
    }));
    res.unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_numbers_in_the_chain() {
        let mut s = State::new();
        s.bind_global("answer", Value::number(42.0));
        let name = "answer";
        let got = lookup_number(s.global, name.as_ptr(), name.len());
        assert_eq!(got, 42.0);
    }

    #[test]
    fn lookup_signals_unbound_and_non_numeric_as_nan() {
        let mut s = State::new();
        let name = "ghost";
        assert!(lookup_number(s.global, name.as_ptr(), name.len()).is_nan());
        let text = s.make_string("hi");
        s.bind_global("label", text);
        let name = "label";
        assert!(lookup_number(s.global, name.as_ptr(), name.len()).is_nan());
    }

    #[test]
    fn null_env_without_active_state_is_nan() {
        let name = "x";
        assert!(lookup_number(ptr::null_mut(), name.as_ptr(), name.len()).is_nan());
    }

    #[test]
    fn bridge_without_active_state_is_nan() {
        assert!(call_from_jit(ptr::null_mut(), ptr::null(), 0).is_nan());
    }
}
