//! The interpreter state: symbol interner, global frame, value factories,
//! source maps and the module cache. One `State` is one independent
//! interpreter; everything the evaluator and the JIT bridge touch hangs off
//! it.

use std::ptr;

use fxhash::FxHashMap;

use crate::env::{release_env, retain_env, Env};
use crate::error::{Error, ErrorKind, Result, SourceLoc};
use crate::intrinsics;
use crate::value::{clear_closure_env, CFunc, FuncData, MacroData, PairData, Prim, Value};

pub struct State {
    pub global: *mut Env,
    pub symbol_intern: FxHashMap<String, Value>,

    /// The expression currently being evaluated. Restored on successful
    /// evaluation; left pointing at the failing expression on error so the
    /// top level can attach a source location.
    pub current_expr: Value,

    /// Source locations keyed by value identity (raw bits).
    pub src_map: FxHashMap<u64, SourceLoc>,
    /// Macro/function call chains attached to expanded nodes.
    pub src_call_chain_map: FxHashMap<u64, Vec<SourceLoc>>,
    /// Source text per file name, for diagnostic echo.
    pub sources: FxHashMap<String, String>,
    /// `require` cache keyed by canonical path. A nil entry marks a module
    /// that is still loading and guards against require cycles.
    pub loaded_modules: FxHashMap<String, Value>,

    purged: bool,
}

impl State {
    pub fn new() -> State {
        let mut state = State {
            global: Env::alloc(ptr::null_mut()),
            symbol_intern: FxHashMap::default(),
            current_expr: Value::nil(),
            src_map: FxHashMap::default(),
            src_call_chain_map: FxHashMap::default(),
            sources: FxHashMap::default(),
            loaded_modules: FxHashMap::default(),
            purged: false,
        };
        intrinsics::register_core(&mut state);
        let t = state.make_symbol("#t");
        state.bind_global("#t", t);
        state
    }

    // ---- factories ----

    pub fn make_nil(&self) -> Value {
        Value::nil()
    }

    pub fn make_number(&self, n: f64) -> Value {
        Value::number(n)
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        Value::from_string(s.to_string())
    }

    /// Intern a symbol: one `Value` per spelling for the life of the state,
    /// so symbol equality is bit equality.
    pub fn make_symbol(&mut self, name: &str) -> Value {
        if let Some(v) = self.symbol_intern.get(name) {
            return v.clone();
        }
        let v = Value::from_symbol(name.to_string());
        self.symbol_intern.insert(name.to_string(), v.clone());
        v
    }

    pub fn make_pair(&mut self, car: Value, cdr: Value) -> Value {
        Value::from_pair(PairData::new(car, cdr))
    }

    pub fn make_function(&mut self, params: Value, body: Value, env: *mut Env) -> Value {
        retain_env(env);
        Value::from_func(FuncData::new(params, body, env))
    }

    pub fn make_macro(&mut self, params: Value, body: Value, env: *mut Env) -> Value {
        retain_env(env);
        Value::from_macro(MacroData::new(params, body, env))
    }

    pub fn make_prim(&self, f: Prim) -> Value {
        Value::from_prim(f)
    }

    pub fn make_cfunc(&self, f: CFunc) -> Value {
        Value::from_cfunc(f)
    }

    pub fn make_env(&mut self, parent: *mut Env) -> *mut Env {
        Env::alloc(parent)
    }

    pub fn make_string_list<I, S>(&mut self, items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let strings: Vec<Value> = items
            .into_iter()
            .map(|s| self.make_string(s.as_ref()))
            .collect();
        self.list_of(strings)
    }

    /// Build a proper list out of the given values.
    pub fn list_of<I>(&mut self, items: I) -> Value
    where
        I: IntoIterator<Item = Value>,
    {
        let items: Vec<Value> = items.into_iter().collect();
        let mut head = Value::nil();
        for item in items.into_iter().rev() {
            head = self.make_pair(item, head);
        }
        head
    }

    // ---- bindings ----

    pub fn register_builtin(&mut self, name: &str, f: CFunc) {
        let v = self.make_cfunc(f);
        self.bind_global(name, v);
    }

    pub fn register_prim(&mut self, name: &str, f: Prim) {
        let v = self.make_prim(f);
        self.bind_global(name, v);
    }

    pub fn bind_global(&mut self, name: &str, v: Value) {
        unsafe { (*self.global).map.insert(name.to_string(), v) };
    }

    /// Create-or-update a binding in the given frame.
    pub fn bind(&mut self, sym: &Value, v: Value, env: *mut Env) -> Result<Value> {
        let env = if env.is_null() { self.global } else { env };
        let Some(name) = sym.symbol_name() else {
            return Err(Error::new(ErrorKind::BindNonSymbol));
        };
        unsafe { (*env).map.insert(name.to_string(), v.clone()) };
        Ok(v)
    }

    /// Update the first existing binding walking parent-wards; bind in the
    /// given frame when there is none.
    pub fn set(&mut self, sym: &Value, v: Value, env: *mut Env) -> Result<Value> {
        let env = if env.is_null() { self.global } else { env };
        let Some(name) = sym.symbol_name() else {
            return Err(Error::new(ErrorKind::BindNonSymbol));
        };
        let mut e = env;
        while !e.is_null() {
            unsafe {
                if let Some(slot) = (*e).map.get_mut(name) {
                    *slot = v.clone();
                    return Ok(v);
                }
                e = (*e).parent;
            }
        }
        self.bind(sym, v, env)
    }

    pub fn get_bound(&self, name: &str, env: *mut Env) -> Value {
        let env = if env.is_null() { self.global } else { env };
        crate::env::lookup(env, name).unwrap_or_else(Value::nil)
    }

    // ---- source locations ----

    pub fn set_source_loc(&mut self, v: &Value, file: &str, line: usize, col: usize) {
        if v.is_nil() {
            return;
        }
        self.src_map.insert(
            v.identity_key(),
            SourceLoc {
                file: file.to_string(),
                line,
                col,
                label: String::new(),
            },
        );
    }

    pub fn source_loc_of(&self, v: &Value) -> Option<SourceLoc> {
        if v.is_nil() {
            return None;
        }
        self.src_map.get(&v.identity_key()).cloned()
    }

    pub fn call_chain_of(&self, v: &Value) -> Option<Vec<SourceLoc>> {
        if v.is_nil() {
            return None;
        }
        self.src_call_chain_map.get(&v.identity_key()).cloned()
    }

    /// The indicated line (1-based) of a previously parsed source file.
    pub fn source_line(&self, file: &str, line: usize) -> Option<String> {
        let src = self.sources.get(file)?;
        src.lines().nth(line.saturating_sub(1)).map(str::to_string)
    }

    // ---- teardown ----

    /// Break closure↔environment cycles and release everything the state
    /// holds. Run once, either explicitly (the `exit` builtin) or on drop.
    pub fn shutdown_and_purge(&mut self) {
        if self.purged {
            return;
        }
        self.purged = true;

        for (_, v) in self.symbol_intern.iter_mut() {
            clear_closure_env(v);
            *v = Value::nil();
        }

        if !self.global.is_null() {
            let mut chain: Vec<*mut Env> = Vec::new();
            retain_env(self.global);
            chain.push(self.global);
            let mut i = 0;
            while i < chain.len() {
                let e = chain[i];
                i += 1;
                unsafe {
                    if !(*e).parent.is_null() {
                        retain_env((*e).parent);
                        chain.push((*e).parent);
                    }
                    for (_, v) in (*e).map.iter() {
                        clear_closure_env(v);
                    }
                    (*e).map.clear();
                    if !(*e).parent.is_null() {
                        release_env((*e).parent);
                        (*e).parent = ptr::null_mut();
                    }
                }
            }
            for e in chain {
                release_env(e);
            }
            release_env(self.global);
            self.global = ptr::null_mut();
        }

        self.loaded_modules.clear();
        self.sources.clear();
        self.src_call_chain_map.clear();
        self.src_map.clear();
        self.symbol_intern.clear();
        self.current_expr = Value::nil();
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.shutdown_and_purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_symbols_are_bit_equal() {
        let mut s = State::new();
        let a = s.make_symbol("foo");
        let b = s.make_symbol("foo");
        let c = s.make_symbol("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn set_updates_outer_binding() {
        let mut s = State::new();
        let sym = s.make_symbol("x");
        s.bind_global("x", Value::number(1.0));
        let child = s.make_env(s.global);
        s.set(&sym, Value::number(2.0), child).unwrap();
        assert_eq!(s.get_bound("x", s.global).as_number(), 2.0);
        crate::env::release_env(child);
    }

    #[test]
    fn set_without_existing_binding_binds_locally() {
        let mut s = State::new();
        let sym = s.make_symbol("fresh");
        let child = s.make_env(s.global);
        s.set(&sym, Value::number(7.0), child).unwrap();
        unsafe {
            assert!((*child).map.contains_key("fresh"));
            assert!(!(*s.global).map.contains_key("fresh"));
        }
        crate::env::release_env(child);
    }

    #[test]
    fn bind_rejects_non_symbols() {
        let mut s = State::new();
        let err = s.bind(&Value::number(1.0), Value::nil(), ptr::null_mut());
        assert!(err.is_err());
    }

    #[test]
    fn purge_survives_closure_cycles() {
        let mut s = State::new();
        // A function capturing the global frame, bound into that same
        // frame: a cycle refcounting alone cannot reclaim.
        let params = Value::nil();
        let body = Value::nil();
        let f = s.make_function(params, body, s.global);
        s.bind_global("f", f);
        s.shutdown_and_purge();
        // Second purge is a no-op.
        s.shutdown_and_purge();
    }

    #[test]
    fn source_line_lookup() {
        let mut s = State::new();
        s.sources
            .insert("t.lisp".to_string(), "(a)\n(b)\n".to_string());
        assert_eq!(s.source_line("t.lisp", 2).unwrap(), "(b)");
        assert!(s.source_line("t.lisp", 9).is_none());
        assert!(s.source_line("missing", 1).is_none());
    }
}
