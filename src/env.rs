//! Lexical environments: refcounted frames chained through raw parent
//! pointers. A frame is shared by every closure that captured it, so frames
//! live outside Rust's ownership graph and are retained/released manually,
//! the same way heap values are.

use std::ptr;

use fxhash::FxHashMap;

use crate::value::Value;

#[repr(C)]
pub struct Env {
    pub(crate) refs: usize,
    pub map: FxHashMap<String, Value>,
    pub parent: *mut Env,
}

impl Env {
    pub(crate) fn alloc(parent: *mut Env) -> *mut Env {
        retain_env(parent);
        Box::into_raw(Box::new(Env {
            refs: 1,
            map: FxHashMap::default(),
            parent,
        }))
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        if !self.parent.is_null() {
            release_env(self.parent);
            self.parent = ptr::null_mut();
        }
    }
}

pub fn retain_env(e: *mut Env) {
    if !e.is_null() {
        unsafe { (*e).refs += 1 };
    }
}

pub fn release_env(e: *mut Env) {
    if e.is_null() {
        return;
    }
    unsafe {
        (*e).refs -= 1;
        if (*e).refs == 0 {
            drop(Box::from_raw(e));
        }
    }
}

/// Walk the frame chain parent-wards and return the first binding found.
/// `None` is "unbound", which is distinct from a binding whose value is nil.
pub fn lookup(env: *mut Env, name: &str) -> Option<Value> {
    let mut e = env;
    while !e.is_null() {
        unsafe {
            if let Some(v) = (*e).map.get(name) {
                return Some(v.clone());
            }
            e = (*e).parent;
        }
    }
    None
}

/// Owns one temporary reference to a frame and releases it on drop.
pub struct EnvGuard(*mut Env);

impl EnvGuard {
    pub fn new(e: *mut Env) -> EnvGuard {
        EnvGuard(e)
    }

    pub fn get(&self) -> *mut Env {
        self.0
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            release_env(self.0);
            self.0 = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_the_parent_chain() {
        let root = Env::alloc(ptr::null_mut());
        let child = Env::alloc(root);
        unsafe {
            (*root).map.insert("x".to_string(), Value::number(1.0));
            (*child).map.insert("y".to_string(), Value::number(2.0));
        }
        assert_eq!(lookup(child, "y").unwrap().as_number(), 2.0);
        assert_eq!(lookup(child, "x").unwrap().as_number(), 1.0);
        assert!(lookup(child, "z").is_none());
        release_env(child);
        release_env(root);
    }

    #[test]
    fn shadowing_stops_at_the_nearest_frame() {
        let root = Env::alloc(ptr::null_mut());
        let child = Env::alloc(root);
        unsafe {
            (*root).map.insert("x".to_string(), Value::number(1.0));
            (*child).map.insert("x".to_string(), Value::number(9.0));
        }
        assert_eq!(lookup(child, "x").unwrap().as_number(), 9.0);
        release_env(child);
        release_env(root);
    }

    #[test]
    fn bound_nil_is_not_unbound() {
        let root = Env::alloc(ptr::null_mut());
        unsafe {
            (*root).map.insert("n".to_string(), Value::nil());
        }
        assert!(lookup(root, "n").is_some());
        release_env(root);
    }
}
