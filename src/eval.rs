//! The tree-walking evaluator: symbol lookup, special-form and macro
//! dispatch, function application and the handoff to native code for hot
//! numeric functions.

use fxhash::FxHashMap;

use crate::env::{self, Env, EnvGuard};
use crate::error::{Error, ErrorKind, Result, SourceLoc};
use crate::jit;
use crate::state::State;
use crate::value::{Type, Value};

/// Prepend a call-site entry to an error's chain as it unwinds across a
/// call boundary. An error that already has a primary location keeps it;
/// one without adopts the call site.
fn push_call_chain<T>(
    res: Result<T>,
    have_call_loc: bool,
    call_loc: &SourceLoc,
    entry: &[SourceLoc],
) -> Result<T> {
    match res {
        Err(mut err) if have_call_loc => {
            if err.loc.is_none() {
                err.loc = Some(call_loc.clone());
            }
            let mut chain = entry.to_vec();
            chain.append(&mut err.chain);
            err.chain = chain;
            Err(err)
        }
        other => other,
    }
}

/// Bind a parameter list against an argument list.
///
/// A bare-symbol tail parameter takes the remaining arguments as a list.
/// With `fill_missing_with_nil` (macros) exhausted arguments bind nil;
/// without it (functions) binding stops. Non-symbol parameter slots are
/// skipped.
pub(crate) fn bind_params(
    out: &mut FxHashMap<String, Value>,
    params: &Value,
    args: &Value,
    fill_missing_with_nil: bool,
) {
    let mut p = params.clone();
    let mut a = args.clone();
    loop {
        if p.is_nil() {
            break;
        }
        if let Some(name) = p.symbol_name() {
            out.insert(name.to_string(), a.clone());
            break;
        }
        if !fill_missing_with_nil && a.is_nil() {
            break;
        }
        let pcar = p.car();
        if let Some(name) = pcar.symbol_name() {
            let v = if a.is_nil() { Value::nil() } else { a.car() };
            out.insert(name.to_string(), v);
        }
        p = p.cdr();
        if !a.is_nil() {
            a = a.cdr();
        }
    }
}

impl State {
    pub fn eval(&mut self, expr: &Value, env: *mut Env) -> Result<Value> {
        let prev = std::mem::replace(&mut self.current_expr, expr.clone());
        let res = self.eval_expr(expr, env);
        // On failure current_expr stays on the failing expression so the
        // top level can report its location.
        if res.is_ok() {
            self.current_expr = prev;
        }
        res
    }

    fn eval_expr(&mut self, expr: &Value, env: *mut Env) -> Result<Value> {
        if expr.is_nil() {
            return Ok(Value::nil());
        }
        let env = if env.is_null() { self.global } else { env };
        match expr.kind() {
            Type::Symbol => {
                let name = expr.symbol_name().unwrap_or_default();
                if let Some(v) = env::lookup(env, name) {
                    return Ok(v);
                }
                let mut err = Error::new(ErrorKind::UnboundSymbol(name.to_string()));
                err.loc = self.source_loc_of(expr);
                Err(err)
            }
            Type::Pair => {
                let head = expr.car();
                let rest = expr.cdr();
                let op = self.eval(&head, env)?;
                if op.is_nil() {
                    return Err(Error::new(ErrorKind::CallNil));
                }
                match op.kind() {
                    Type::Prim => {
                        let Some(f) = op.prim_fn() else {
                            return Err(Error::new(ErrorKind::NotCallable));
                        };
                        f(self, &rest, env)
                    }
                    Type::Macro => self.expand_and_eval_macro(expr, &head, &op, &rest, env),
                    _ => {
                        let args = self.eval_args(&rest, env)?;
                        self.call(&op, &args)
                    }
                }
            }
            _ => Ok(expr.clone()),
        }
    }

    fn eval_args(&mut self, list: &Value, env: *mut Env) -> Result<Value> {
        let mut evaluated = Vec::new();
        let mut a = list.clone();
        while !a.is_nil() {
            let v = self.eval(&a.car(), env)?;
            evaluated.push(v);
            a = a.cdr();
        }
        Ok(self.list_of(evaluated))
    }

    /// Evaluate the body of a macro against its unevaluated arguments, stamp
    /// the expansion with the call site and call chain, then evaluate the
    /// expansion in the caller's environment.
    fn expand_and_eval_macro(
        &mut self,
        expr: &Value,
        head: &Value,
        op: &Value,
        raw_args: &Value,
        env: *mut Env,
    ) -> Result<Value> {
        let md = op.macro_data();
        let (params, body, closure_env) =
            unsafe { ((*md).params.clone(), (*md).body.clone(), (*md).closure_env) };

        let frame = self.make_env(closure_env);
        let guard = EnvGuard::new(frame);
        bind_params(
            unsafe { &mut (*frame).map },
            &params,
            raw_args,
            /*fill_missing_with_nil=*/ true,
        );

        let call_loc = self
            .source_loc_of(&self.current_expr)
            .or_else(|| self.source_loc_of(expr));
        let mut chain_entry: Vec<SourceLoc> = Vec::new();
        let call_loc = if let Some(mut loc) = call_loc {
            loc.label = match head.symbol_name() {
                Some(name) => format!("macro {name}"),
                None => "macro".to_string(),
            };
            chain_entry.push(loc.clone());
            if let Some(mut def_loc) = self.source_loc_of(&body) {
                def_loc.label = "macro-def".to_string();
                chain_entry.push(def_loc);
            }
            self.src_call_chain_map
                .insert(expr.identity_key(), chain_entry.clone());
            loc
        } else {
            SourceLoc::default()
        };
        let have_call_loc = !chain_entry.is_empty();

        let res = self.do_list(&body, guard.get());
        let expansion = push_call_chain(res, have_call_loc, &call_loc, &chain_entry)?;

        if !expansion.is_nil() && have_call_loc {
            self.propagate_expansion(&expansion, &call_loc, &chain_entry);
        }

        self.eval(&expansion, env)
    }

    /// Re-stamp every node of a macro expansion with the call-site location
    /// and prepend the call chain to whatever inner expansions recorded.
    fn propagate_expansion(&mut self, v: &Value, call_loc: &SourceLoc, entry: &[SourceLoc]) {
        if v.is_nil() {
            return;
        }
        self.set_source_loc(v, &call_loc.file, call_loc.line, call_loc.col);
        let mut chain = entry.to_vec();
        if let Some(inner) = self.src_call_chain_map.get(&v.identity_key()) {
            chain.extend(inner.iter().cloned());
        }
        self.src_call_chain_map.insert(v.identity_key(), chain);
        if v.kind() == Type::Pair {
            self.propagate_expansion(&v.car(), call_loc, entry);
            self.propagate_expansion(&v.cdr(), call_loc, entry);
        }
    }

    /// Apply a callable to an already-evaluated argument list.
    pub fn call(&mut self, f: &Value, args: &Value) -> Result<Value> {
        if f.is_nil() {
            return Err(Error::new(ErrorKind::CallNil));
        }
        match f.kind() {
            Type::CFunc => {
                let Some(native) = f.cfunc_fn() else {
                    return Err(Error::new(ErrorKind::NotCallable));
                };
                native(self, args)
            }
            Type::Func => self.call_user_function(f, args),
            _ => Err(Error::new(ErrorKind::NotCallable)),
        }
    }

    fn call_user_function(&mut self, f: &Value, args: &Value) -> Result<Value> {
        let fd = f.func_data();

        let mut darr: Vec<f64> = Vec::new();
        let mut numeric = true;
        let mut a = args.clone();
        while !a.is_nil() {
            let av = a.car();
            if !av.is_number() {
                numeric = false;
                break;
            }
            darr.push(av.as_number());
            a = a.cdr();
        }

        unsafe {
            (*fd).call_count += 1;
            if numeric {
                (*fd).num_call_count += 1;
                if (*fd).num_call_count > jit::HOT_THRESHOLD
                    && (*fd).compiled_code.is_none()
                    && !(*fd).jit_failed
                {
                    match jit::compile_function(fd) {
                        Some(code) => (*fd).compiled_code = Some(code),
                        None => (*fd).jit_failed = true,
                    }
                }
            }
        }

        let compiled = unsafe { (*fd).compiled_code };
        if numeric {
            if let Some(code) = compiled {
                match jit::invoke(self, code, &darr) {
                    Ok(res) if !res.is_nan() => return Ok(Value::number(res)),
                    Ok(_) => {
                        // Transient deopt: the callee signaled a non-numeric
                        // result. Native code stays installed; this call
                        // re-runs through the interpreter.
                    }
                    Err(_) => unsafe {
                        // The native frame panicked: permanently disable the
                        // fast path for this function.
                        if let Some(code) = (*fd).compiled_code.take() {
                            jit::release_code(code);
                        }
                        (*fd).jit_failed = true;
                    },
                }
                let (params, body, closure_env) =
                    unsafe { ((*fd).params.clone(), (*fd).body.clone(), (*fd).closure_env) };
                let parent = if closure_env.is_null() {
                    self.global
                } else {
                    closure_env
                };
                let frame = self.make_env(parent);
                let guard = EnvGuard::new(frame);
                bind_params(unsafe { &mut (*frame).map }, &params, args, false);
                return self.do_list(&body, guard.get());
            }
        }

        let (params, body, closure_env) =
            unsafe { ((*fd).params.clone(), (*fd).body.clone(), (*fd).closure_env) };
        let parent = if closure_env.is_null() {
            self.global
        } else {
            closure_env
        };
        let frame = self.make_env(parent);
        let guard = EnvGuard::new(frame);
        bind_params(unsafe { &mut (*frame).map }, &params, args, false);

        let mut chain_entry: Vec<SourceLoc> = Vec::new();
        let call_loc = if let Some(mut loc) = self.source_loc_of(&self.current_expr) {
            loc.label = "fn".to_string();
            chain_entry.push(loc.clone());
            loc
        } else {
            SourceLoc::default()
        };
        let have_call_loc = !chain_entry.is_empty();

        let res = self.do_list(&body, guard.get());
        push_call_chain(res, have_call_loc, &call_loc, &chain_entry)
    }

    /// Evaluate every expression of a body; the value of the last one, or
    /// nil for an empty body.
    pub fn do_list(&mut self, body: &Value, env: *mut Env) -> Result<Value> {
        let mut res = Value::nil();
        let mut walk = body.clone();
        while !walk.is_nil() {
            res = self.eval(&walk.car(), env)?;
            walk = walk.cdr();
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(s: &mut State, src: &str) -> Result<Value> {
        let forms = s.parse_all(src, "test.lisp")?;
        let global = s.global;
        s.do_list(&forms, global)
    }

    fn run_ok(s: &mut State, src: &str) -> Value {
        run(s, src).expect("evaluation failed")
    }

    #[test]
    fn self_evaluating() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "42").as_number(), 42.0);
        assert_eq!(run_ok(&mut s, "\"hi\"").string_value(), Some("hi"));
        assert!(run_ok(&mut s, "nil").is_nil());
    }

    #[test]
    fn unbound_symbol_reports_its_location() {
        let mut s = State::new();
        let err = run(&mut s, "\n  missing").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnboundSymbol(ref n) if n == "missing"));
        let loc = err.loc.unwrap();
        assert_eq!((loc.line, loc.col), (2, 3));
    }

    #[test]
    fn quote_returns_argument_unevaluated() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "'(1 2)").render(), "(1 2)");
        assert_eq!(run_ok(&mut s, "(quote x)").symbol_name(), Some("x"));
    }

    #[test]
    fn set_and_lookup() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(set x 10) x").as_number(), 10.0);
    }

    #[test]
    fn let_bindings_are_sequential() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(let (x 1 x 2) x)").as_number(), 2.0);
        assert_eq!(run_ok(&mut s, "(let (a 1 b (+ a 1)) b)").as_number(), 2.0);
    }

    #[test]
    fn let_does_not_leak() {
        let mut s = State::new();
        let err = run(&mut s, "(let (x 1) x) x").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnboundSymbol(_)));
    }

    #[test]
    fn cond_picks_first_truthy_clause() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(cond (#t 1))").as_number(), 1.0);
        assert_eq!(run_ok(&mut s, "(cond (nil 1) (#t 2))").as_number(), 2.0);
        assert!(run_ok(&mut s, "(cond (nil 1))").is_nil());
        // Empty clauses are skipped, and 0 is truthy.
        assert_eq!(run_ok(&mut s, "(cond () (0 9))").as_number(), 9.0);
    }

    #[test]
    fn while_returns_last_body_value() {
        let mut s = State::new();
        let v = run_ok(&mut s, "(set i 0) (while (< i 3) (set i (+ i 1)))");
        assert_eq!(v.as_number(), 3.0);
        assert!(run_ok(&mut s, "(while nil 1)").is_nil());
    }

    #[test]
    fn closures_capture_their_environment() {
        let mut s = State::new();
        let v = run_ok(
            &mut s,
            "(set make-adder (fn (x) (fn (y) (+ x y))))\n((make-adder 3) 4)",
        );
        assert_eq!(v.as_number(), 7.0);
    }

    #[test]
    fn rest_parameter_takes_remaining_args() {
        let mut s = State::new();
        let v = run_ok(&mut s, "(set f (fn (a . rest) rest)) (f 1 2 3)");
        assert_eq!(v.render(), "(2 3)");
        let v = run_ok(&mut s, "(set g (fn args args)) (g 1 2)");
        assert_eq!(v.render(), "(1 2)");
    }

    #[test]
    fn surplus_params_are_left_unbound_for_functions() {
        let mut s = State::new();
        // `b` never gets bound, so referencing it is an unbound error.
        let err = run(&mut s, "(set f (fn (a b) b)) (f 1)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnboundSymbol(_)));
    }

    #[test]
    fn macros_fill_missing_params_with_nil() {
        let mut s = State::new();
        let v = run_ok(&mut s, "(set m (macro (a b) `(list ,a ,b))) (m 1)");
        assert_eq!(v.render(), "(1 nil)");
    }

    #[test]
    fn macro_expansion_evaluates_in_caller_env() {
        let mut s = State::new();
        let v = run_ok(
            &mut s,
            "(set when (macro (c body) `(cond (,c ,body))))\n(when (> 3 1) 42)",
        );
        assert_eq!(v.as_number(), 42.0);
        let v = run_ok(&mut s, "(when (< 3 1) 42)");
        assert!(v.is_nil());
    }

    #[test]
    fn quasiquote_depth_tracking() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(set x 5) `,x").as_number(), 5.0);
        assert_eq!(run_ok(&mut s, "`(a ,(+ 1 2))").render(), "(a 3)");
        // A nested quasiquote shields its unquote for one level.
        assert_eq!(
            run_ok(&mut s, "``(a ,x)").render(),
            "(quasiquote (a (unquote x)))"
        );
    }

    #[test]
    fn unquote_outside_quasiquote_evaluates() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(set x 3) (unquote x)").as_number(), 3.0);
    }

    #[test]
    fn apply_spreads_an_evaluated_list() {
        let mut s = State::new();
        assert_eq!(run_ok(&mut s, "(apply + (list 1 2))").as_number(), 3.0);
    }

    #[test]
    fn calling_nil_and_non_functions() {
        let mut s = State::new();
        let err = run(&mut s, "(nil 1)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CallNil));
        let err = run(&mut s, "(3 1)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotCallable));
    }

    #[test]
    fn errors_cross_function_calls_with_chain() {
        let mut s = State::new();
        let err = run(&mut s, "(set f (fn () (error \"boom\")))\n(f)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::User(ref m) if m == "boom"));
        assert!(err.chain.iter().any(|e| e.label == "fn"));
    }

    #[test]
    fn macro_expansion_nodes_carry_the_call_chain() {
        let mut s = State::new();
        let err = run(&mut s, "(set m (macro () `(undefined-thing)))\n(m)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnboundSymbol(_)));
        // The failing node of the expansion was stamped with the call site
        // and the macro call chain.
        let chain = s.call_chain_of(&s.current_expr).unwrap_or_default();
        assert!(chain.iter().any(|e| e.label.starts_with("macro")));
    }

    #[test]
    fn errors_inside_macro_bodies_carry_the_chain_directly() {
        let mut s = State::new();
        let err = run(&mut s, "(set m (macro () (error \"inner\")))\n(m)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::User(ref m) if m == "inner"));
        assert!(err.chain.iter().any(|e| e.label.starts_with("macro")));
    }
}
