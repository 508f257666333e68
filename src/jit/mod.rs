//! The JIT tier: hot numeric functions get compiled to native code through
//! Cranelift. Each compiled function owns its own `JITModule`; the compiler
//! keeps a native-pointer→module registry so dropping a function value
//! frees its code.
//!
//! The JIT is a fast path, not a correctness-bearing component: every
//! failure — unsupported form, codegen error, unavailable host ISA — just
//! pins the function to the interpreter.

mod bridge;
mod emit;

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cranelift_codegen::ir::{types, AbiParam, UserFuncName};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use fxhash::FxHashMap;
use thiserror::Error;

use crate::env::Env;
use crate::state::State;
use crate::value::{FuncData, Type, Value};

/// The native ABI every compiled function implements.
pub type NativeFn = unsafe extern "C" fn(*const f64, i32) -> f64;

/// Numeric calls beyond this count trigger compilation.
pub const HOT_THRESHOLD: u64 = 3;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("expression form not supported by the native backend")]
    Unsupported,
    #[error("codegen failed: {0}")]
    Codegen(String),
}

struct Jit {
    isa: Arc<dyn TargetIsa>,
    /// Finalized code address → owning module.
    modules: FxHashMap<usize, JITModule>,
}

thread_local! {
    static JIT: RefCell<Option<Jit>> = const { RefCell::new(None) };
}

fn with_jit<R>(f: impl FnOnce(&mut Jit) -> R) -> Option<R> {
    JIT.try_with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Jit::new();
        }
        slot.as_mut().map(f)
    })
    .ok()
    .flatten()
}

impl Jit {
    fn new() -> Option<Jit> {
        let mut flags = settings::builder();
        flags.set("use_colocated_libcalls", "false").ok()?;
        flags.set("is_pic", "false").ok()?;
        let isa_builder = cranelift_native::builder().ok()?;
        let isa = isa_builder.finish(settings::Flags::new(flags)).ok()?;
        Some(Jit {
            isa,
            modules: FxHashMap::default(),
        })
    }

    fn compile(&mut self, fd: *mut FuncData) -> Option<NativeFn> {
        let mut builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());
        builder.symbol("nanlisp_call_from_jit", bridge::call_from_jit as *const u8);
        builder.symbol("nanlisp_lookup_number", bridge::lookup_number as *const u8);
        let mut module = JITModule::new(builder);

        match Self::build(&mut module, fd) {
            Some(func_id) => {
                if module.finalize_definitions().is_err() {
                    unsafe { module.free_memory() };
                    return None;
                }
                let ptr = module.get_finalized_function(func_id);
                let code: NativeFn = unsafe { std::mem::transmute(ptr) };
                self.modules.insert(ptr as usize, module);
                Some(code)
            }
            None => {
                unsafe { module.free_memory() };
                None
            }
        }
    }

    fn build(module: &mut JITModule, fd: *mut FuncData) -> Option<FuncId> {
        let (bridge_id, lookup_id) = Self::declare_helpers(module)?;

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        sig.params.push(AbiParam::new(types::I32));
        sig.returns.push(AbiParam::new(types::F64));

        let name = format!("nanlisp_jit_{:x}", fd as usize);
        let func_id = module.declare_function(&name, Linkage::Export, &sig).ok()?;

        let mut ctx = module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        emit::translate(module, bridge_id, lookup_id, fd, &mut ctx.func).ok()?;
        module.define_function(func_id, &mut ctx).ok()?;
        Some(func_id)
    }

    fn declare_helpers(module: &mut JITModule) -> Option<(FuncId, FuncId)> {
        let mut bridge_sig = module.make_signature();
        bridge_sig.params.push(AbiParam::new(types::I64));
        bridge_sig.params.push(AbiParam::new(types::I64));
        bridge_sig.params.push(AbiParam::new(types::I32));
        bridge_sig.returns.push(AbiParam::new(types::F64));
        let bridge_id = module
            .declare_function("nanlisp_call_from_jit", Linkage::Import, &bridge_sig)
            .ok()?;

        let mut lookup_sig = module.make_signature();
        lookup_sig.params.push(AbiParam::new(types::I64));
        lookup_sig.params.push(AbiParam::new(types::I64));
        lookup_sig.params.push(AbiParam::new(types::I64));
        lookup_sig.returns.push(AbiParam::new(types::F64));
        let lookup_id = module
            .declare_function("nanlisp_lookup_number", Linkage::Import, &lookup_sig)
            .ok()?;

        Some((bridge_id, lookup_id))
    }
}

/// Resolve a head-position symbol in a closure chain to a user function
/// payload. Bindings to anything else stop the walk.
pub(crate) fn resolve_function(env: *mut Env, name: &str) -> Option<*mut FuncData> {
    let mut e = env;
    while !e.is_null() {
        unsafe {
            if let Some(v) = (*e).map.get(name) {
                let fd = v.func_data();
                return if fd.is_null() { None } else { Some(fd) };
            }
            e = (*e).parent;
        }
    }
    None
}

/// Collect every user function a body calls in head position, resolving
/// through the given closure chain.
fn collect_called_funcs(expr: &Value, closure: *mut Env, out: &mut Vec<*mut FuncData>) {
    if expr.kind() != Type::Pair {
        return;
    }
    if let Some(name) = expr.car().symbol_name() {
        if let Some(fd) = resolve_function(closure, name) {
            out.push(fd);
        }
    }
    let mut walk = expr.clone();
    while walk.kind() == Type::Pair {
        collect_called_funcs(&walk.car(), closure, out);
        walk = walk.cdr();
    }
}

/// Compile a function, after first compiling the uncompiled user functions
/// its body calls directly, so those calls bind to native code instead of
/// the bridge. Returns the entry pointer, or `None` when the function must
/// stay on the interpreter.
pub(crate) fn compile_function(fd: *mut FuncData) -> Option<NativeFn> {
    let mut stack = Vec::new();
    compile_rec(fd, &mut stack)
}

fn compile_rec(fd: *mut FuncData, stack: &mut Vec<*mut FuncData>) -> Option<NativeFn> {
    if fd.is_null() || stack.contains(&fd) {
        return None;
    }
    stack.push(fd);

    let mut callees = Vec::new();
    unsafe {
        collect_called_funcs(&(*fd).body, (*fd).closure_env, &mut callees);
    }
    for callee in callees {
        // Functions already on the compile stack are mid-compilation; their
        // calls go through the bridge rather than failing them.
        if stack.contains(&callee) {
            continue;
        }
        unsafe {
            if (*callee).compiled_code.is_none() && !(*callee).jit_failed {
                match compile_rec(callee, stack) {
                    Some(code) => (*callee).compiled_code = Some(code),
                    None => (*callee).jit_failed = true,
                }
            }
        }
    }

    let res = with_jit(|jit| jit.compile(fd)).flatten();
    stack.pop();
    res
}

/// Run a compiled function. The active-state slot is saved and restored
/// around the invocation so the bridge can find its interpreter even under
/// nested native calls. A panic escaping the native frame is reported to
/// the caller, which permanently disables the function.
pub(crate) fn invoke(state: &mut State, code: NativeFn, args: &[f64]) -> std::thread::Result<f64> {
    let prev = bridge::swap_active_state(state as *mut State);
    let argp = if args.is_empty() {
        std::ptr::null()
    } else {
        args.as_ptr()
    };
    let argc = args.len() as i32;
    let res = catch_unwind(AssertUnwindSafe(|| unsafe { code(argp, argc) }));
    bridge::swap_active_state(prev);
    res
}

/// Drop the module owning the given entry point. Called when a function
/// value dies or when a native frame panicked.
pub(crate) fn release_code(code: NativeFn) {
    let key = code as usize;
    let _ = JIT.try_with(|cell| {
        if let Some(jit) = cell.borrow_mut().as_mut() {
            if let Some(module) = jit.modules.remove(&key) {
                unsafe { module.free_memory() };
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn run(s: &mut State, src: &str) -> Result<Value> {
        let forms = s.parse_all(src, "jit-test.lisp")?;
        let global = s.global;
        s.do_list(&forms, global)
    }

    fn run_ok(s: &mut State, src: &str) -> Value {
        run(s, src).expect("evaluation failed")
    }

    fn type_of(s: &mut State, name: &str) -> String {
        run_ok(s, &format!("(type {name})"))
            .symbol_name()
            .unwrap_or("?")
            .to_string()
    }

    #[test]
    fn fib_gets_compiled_and_stays_correct() {
        let mut s = State::new();
        run_ok(
            &mut s,
            "(set fib (fn (n) (cond ((< n 2) n) (#t (+ (fib (- n 1)) (fib (- n 2)))))))",
        );
        assert_eq!(type_of(&mut s, "fib"), "function");
        assert_eq!(run_ok(&mut s, "(fib 10)").as_number(), 55.0);
        // The recursion alone crosses the hot threshold.
        assert_eq!(type_of(&mut s, "fib"), "jit_func");
        // Native and interpreted answers agree.
        assert_eq!(run_ok(&mut s, "(fib 12)").as_number(), 144.0);
    }

    #[test]
    fn simple_arithmetic_function_compiles_after_threshold() {
        let mut s = State::new();
        run_ok(&mut s, "(set sq (fn (x) (* x x)))");
        for _ in 0..4 {
            assert_eq!(run_ok(&mut s, "(sq 3)").as_number(), 9.0);
        }
        assert_eq!(type_of(&mut s, "sq"), "jit_func");
        assert_eq!(run_ok(&mut s, "(sq 5)").as_number(), 25.0);
    }

    #[test]
    fn non_numeric_calls_never_trigger_compilation() {
        let mut s = State::new();
        run_ok(&mut s, "(set id (fn (x) x))");
        for _ in 0..10 {
            assert_eq!(run_ok(&mut s, "(id \"a\")").string_value(), Some("a"));
        }
        assert_eq!(type_of(&mut s, "id"), "function");
    }

    #[test]
    fn unsupported_bodies_fail_sticky_and_keep_working() {
        let mut s = State::new();
        run_ok(&mut s, "(set wrap (fn (x) (list x)))");
        for _ in 0..6 {
            assert_eq!(run_ok(&mut s, "(wrap 1)").render(), "(1)");
        }
        // Compilation was attempted and refused; the function still runs
        // through the interpreter and never reports as jit_func.
        assert_eq!(type_of(&mut s, "wrap"), "function");
        let wrap = s.get_bound("wrap", s.global);
        let fd = wrap.func_data();
        unsafe {
            assert!((*fd).jit_failed);
            assert!((*fd).compiled_code.is_none());
        }
    }

    #[test]
    fn free_variables_read_through_the_lookup_helper() {
        let mut s = State::new();
        run_ok(&mut s, "(set base 100) (set addb (fn (x) (+ x base)))");
        for _ in 0..5 {
            assert_eq!(run_ok(&mut s, "(addb 1)").as_number(), 101.0);
        }
        assert_eq!(type_of(&mut s, "addb"), "jit_func");
        // Native code sees rebinds of the free variable.
        run_ok(&mut s, "(set base 5)");
        assert_eq!(run_ok(&mut s, "(addb 1)").as_number(), 6.0);
    }

    #[test]
    fn transient_nan_deopts_without_disabling_the_function() {
        let mut s = State::new();
        run_ok(&mut s, "(set g 7) (set f (fn (n) g))");
        for _ in 0..5 {
            assert_eq!(run_ok(&mut s, "(f 1)").as_number(), 7.0);
        }
        assert_eq!(type_of(&mut s, "f"), "jit_func");
        // The free variable turns non-numeric: native code returns the NaN
        // sentinel and the interpreter redoes the call.
        run_ok(&mut s, "(set g \"hello\")");
        assert_eq!(run_ok(&mut s, "(f 1)").string_value(), Some("hello"));
        // The deopt was transient: native code is still installed and is
        // used again once the variable is numeric.
        assert_eq!(type_of(&mut s, "f"), "jit_func");
        run_ok(&mut s, "(set g 3)");
        assert_eq!(run_ok(&mut s, "(f 1)").as_number(), 3.0);
    }

    #[test]
    fn closures_compile_with_captured_numeric_frames() {
        let mut s = State::new();
        run_ok(&mut s, "(set make-adder (fn (x) (fn (y) (+ x y))))");
        run_ok(&mut s, "(set add3 (make-adder 3))");
        for _ in 0..5 {
            assert_eq!(run_ok(&mut s, "(add3 4)").as_number(), 7.0);
        }
        assert_eq!(type_of(&mut s, "add3"), "jit_func");
        assert_eq!(run_ok(&mut s, "(add3 10)").as_number(), 13.0);
    }

    #[test]
    fn direct_callees_are_compiled_first() {
        let mut s = State::new();
        run_ok(&mut s, "(set half (fn (x) (/ x 2)))");
        run_ok(&mut s, "(set quarter (fn (x) (half (half x))))");
        for _ in 0..5 {
            assert_eq!(run_ok(&mut s, "(quarter 8)").as_number(), 2.0);
        }
        // Compiling `quarter` precompiles `half` so the calls are native.
        assert_eq!(type_of(&mut s, "quarter"), "jit_func");
        assert_eq!(type_of(&mut s, "half"), "jit_func");
    }

    #[test]
    fn let_and_while_compile_inside_functions() {
        let mut s = State::new();
        run_ok(
            &mut s,
            "(set poly (fn (x) (let (a (* x 2) b (+ x 1)) (* a b))))",
        );
        for _ in 0..5 {
            assert_eq!(run_ok(&mut s, "(poly 3)").as_number(), 24.0);
        }
        assert_eq!(type_of(&mut s, "poly"), "jit_func");
        assert_eq!(run_ok(&mut s, "(poly 4)").as_number(), 40.0);
    }

    #[test]
    fn released_functions_free_their_modules() {
        let mut s = State::new();
        run_ok(&mut s, "(set tmp (fn (x) (+ x 1)))");
        for _ in 0..5 {
            run_ok(&mut s, "(tmp 1)");
        }
        assert_eq!(type_of(&mut s, "tmp"), "jit_func");
        // Rebinding drops the last reference to the compiled function,
        // which must unregister its module without crashing.
        run_ok(&mut s, "(set tmp 1)");
        assert_eq!(run_ok(&mut s, "tmp").as_number(), 1.0);
    }
}
