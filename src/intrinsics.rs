//! Native builtins and primitive special forms. Builtins receive their
//! arguments already evaluated; prims receive the raw argument list and the
//! calling environment.

use crate::env::{Env, EnvGuard};
use crate::error::{Error, ErrorKind, Result};
use crate::require;
use crate::state::State;
use crate::value::{value_equal, Type, Value};

pub(crate) fn require_number(v: &Value, who: &'static str) -> Result<f64> {
    if v.is_number() {
        Ok(v.as_number())
    } else {
        Err(Error::new(ErrorKind::ExpectedNumber(who, v.type_name())))
    }
}

fn two_args(args: &Value, name: &'static str) -> Result<(Value, Value)> {
    if args.is_nil() || args.cdr().is_nil() || !args.cdr().cdr().is_nil() {
        return Err(Error::new(ErrorKind::RequiresTwoArgs(name)));
    }
    Ok((args.car(), args.cdr().car()))
}

fn arith_binary(
    s: &State,
    args: &Value,
    name: &'static str,
    op: fn(f64, f64) -> Result<f64>,
) -> Result<Value> {
    let (a, b) = two_args(args, name)?;
    let a = require_number(&a, name)?;
    let b = require_number(&b, name)?;
    Ok(s.make_number(op(a, b)?))
}

fn compare_binary(
    s: &mut State,
    args: &Value,
    name: &'static str,
    cmp: fn(f64, f64) -> bool,
) -> Result<Value> {
    let (a, b) = two_args(args, name)?;
    let a = require_number(&a, name)?;
    let b = require_number(&b, name)?;
    if cmp(a, b) {
        Ok(s.get_bound("#t", s.global))
    } else {
        Ok(Value::nil())
    }
}

fn builtin_add(s: &mut State, args: &Value) -> Result<Value> {
    arith_binary(s, args, "+", |a, b| Ok(a + b))
}

fn builtin_sub(s: &mut State, args: &Value) -> Result<Value> {
    arith_binary(s, args, "-", |a, b| Ok(a - b))
}

fn builtin_mul(s: &mut State, args: &Value) -> Result<Value> {
    arith_binary(s, args, "*", |a, b| Ok(a * b))
}

fn builtin_div(s: &mut State, args: &Value) -> Result<Value> {
    arith_binary(s, args, "/", |a, b| {
        if b == 0.0 {
            Err(Error::new(ErrorKind::DivisionByZero))
        } else {
            Ok(a / b)
        }
    })
}

fn builtin_lt(s: &mut State, args: &Value) -> Result<Value> {
    compare_binary(s, args, "<", |a, b| a < b)
}

fn builtin_gt(s: &mut State, args: &Value) -> Result<Value> {
    compare_binary(s, args, ">", |a, b| a > b)
}

fn builtin_le(s: &mut State, args: &Value) -> Result<Value> {
    compare_binary(s, args, "<=", |a, b| a <= b)
}

fn builtin_ge(s: &mut State, args: &Value) -> Result<Value> {
    compare_binary(s, args, ">=", |a, b| a >= b)
}

fn builtin_eq(s: &mut State, args: &Value) -> Result<Value> {
    let (a, b) = two_args(args, "=")?;
    if value_equal(&a, &b) {
        Ok(s.get_bound("#t", s.global))
    } else {
        Ok(Value::nil())
    }
}

fn builtin_list(_s: &mut State, args: &Value) -> Result<Value> {
    Ok(args.clone())
}

fn builtin_cons(s: &mut State, args: &Value) -> Result<Value> {
    let a = args.car();
    let b = args.cdr().car();
    Ok(s.make_pair(a, b))
}

fn builtin_car(_s: &mut State, args: &Value) -> Result<Value> {
    let v = args.car();
    if v.is_nil() {
        return Ok(Value::nil());
    }
    if v.kind() != Type::Pair {
        return Err(Error::new(ErrorKind::ExpectedPair("car")));
    }
    Ok(v.car())
}

fn builtin_cdr(_s: &mut State, args: &Value) -> Result<Value> {
    let v = args.car();
    if v.is_nil() {
        return Ok(Value::nil());
    }
    if v.kind() != Type::Pair {
        return Err(Error::new(ErrorKind::ExpectedPair("cdr")));
    }
    Ok(v.cdr())
}

fn builtin_setcar(_s: &mut State, args: &Value) -> Result<Value> {
    let p = args.car();
    let v = args.cdr().car();
    if p.kind() != Type::Pair {
        return Err(Error::new(ErrorKind::ExpectedPair("setcar")));
    }
    p.set_car(v.clone());
    Ok(v)
}

fn builtin_setcdr(_s: &mut State, args: &Value) -> Result<Value> {
    let p = args.car();
    let v = args.cdr().car();
    if p.kind() != Type::Pair {
        return Err(Error::new(ErrorKind::ExpectedPair("setcdr")));
    }
    p.set_cdr(v.clone());
    Ok(v)
}

fn builtin_print(_s: &mut State, args: &Value) -> Result<Value> {
    let mut last = Value::nil();
    let mut first = true;
    let mut cur = args.clone();
    while !cur.is_nil() {
        if !first {
            print!(" ");
        }
        let el = cur.car();
        print!("{}", el.render());
        first = false;
        last = el;
        cur = cur.cdr();
    }
    println!();
    Ok(last)
}

fn builtin_type(s: &mut State, args: &Value) -> Result<Value> {
    let v = args.car();
    Ok(s.make_symbol(v.type_name()))
}

fn builtin_parse(s: &mut State, args: &Value) -> Result<Value> {
    let v = args.car();
    let Some(src) = v.string_value().map(str::to_string) else {
        return Err(Error::new(ErrorKind::RequiresString("parse")));
    };
    s.parse(&src, "(string)")
}

fn builtin_error(_s: &mut State, args: &Value) -> Result<Value> {
    let arg = args.car();
    let msg = if arg.is_nil() {
        "error".to_string()
    } else {
        arg.render()
    };
    Err(Error::new(ErrorKind::User(msg)))
}

fn builtin_exit(s: &mut State, args: &Value) -> Result<Value> {
    let mut code = 0;
    let arg = args.car();
    if !arg.is_nil() {
        code = require_number(&arg, "exit")? as i32;
    }
    s.shutdown_and_purge();
    std::process::exit(code);
}

// ---- special forms ----

fn prim_quote(_s: &mut State, args: &Value, _env: *mut Env) -> Result<Value> {
    Ok(args.car())
}

fn prim_unquote(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let arg = args.car();
    if arg.is_nil() {
        Ok(Value::nil())
    } else {
        s.eval(&arg, env)
    }
}

fn qq_expand(s: &mut State, expr: &Value, depth: u32, env: *mut Env) -> Result<Value> {
    if expr.is_nil() {
        return Ok(Value::nil());
    }
    if expr.kind() == Type::Pair {
        let car = expr.car();
        let cdr = expr.cdr();
        if car.is_symbol_named("unquote") {
            if depth == 1 {
                let uq = cdr.car();
                return if uq.is_nil() {
                    Ok(Value::nil())
                } else {
                    s.eval(&uq, env)
                };
            }
            let inner = qq_expand(s, &cdr, depth - 1, env)?;
            return Ok(s.make_pair(car, inner));
        }
        if car.is_symbol_named("quasiquote") {
            let inner = qq_expand(s, &cdr, depth + 1, env)?;
            return Ok(s.make_pair(car, inner));
        }
        let head = qq_expand(s, &car, depth, env)?;
        let tail = qq_expand(s, &cdr, depth, env)?;
        return Ok(s.make_pair(head, tail));
    }
    Ok(expr.clone())
}

fn prim_quasiquote(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    qq_expand(s, &args.car(), 1, env)
}

fn prim_set(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let sym = args.car();
    let valexpr = args.cdr().car();
    let val = s.eval(&valexpr, env)?;
    s.set(&sym, val, env)
}

fn prim_fn(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let params = args.car();
    let body = args.cdr();
    Ok(s.make_function(params, body, env))
}

fn prim_macro(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let params = args.car();
    let body = args.cdr();
    Ok(s.make_macro(params, body, env))
}

fn prim_let(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let frame = s.make_env(env);
    let guard = EnvGuard::new(frame);
    let mut vars = args.car();
    while !vars.is_nil() {
        let sym = vars.car();
        vars = vars.cdr();
        let val = s.eval(&vars.car(), guard.get())?;
        s.bind(&sym, val, guard.get())?;
        vars = vars.cdr();
    }
    s.do_list(&args.cdr(), guard.get())
}

fn prim_while(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let cond = args.car();
    let body = args.cdr();
    let mut res = Value::nil();
    while s.eval(&cond, env)?.truthy() {
        res = s.do_list(&body, env)?;
    }
    Ok(res)
}

fn prim_cond(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let mut clauses = args.clone();
    while !clauses.is_nil() {
        let clause = clauses.car();
        if clause.is_nil() {
            clauses = clauses.cdr();
            continue;
        }
        let test = clause.car();
        if s.eval(&test, env)?.truthy() {
            return s.do_list(&clause.cdr(), env);
        }
        clauses = clauses.cdr();
    }
    Ok(Value::nil())
}

fn prim_apply(s: &mut State, args: &Value, env: *mut Env) -> Result<Value> {
    let fnexpr = args.car();
    if fnexpr.is_nil() {
        return Err(Error::new(ErrorKind::ApplyWithoutFunction));
    }
    let listexpr = args.cdr().car();
    let f = s.eval(&fnexpr, env)?;
    let list = s.eval(&listexpr, env)?;
    s.call(&f, &list)
}

pub fn register_core(s: &mut State) {
    s.register_builtin("+", builtin_add);
    s.register_builtin("-", builtin_sub);
    s.register_builtin("*", builtin_mul);
    s.register_builtin("/", builtin_div);
    s.register_builtin("<", builtin_lt);
    s.register_builtin(">", builtin_gt);
    s.register_builtin("<=", builtin_le);
    s.register_builtin(">=", builtin_ge);
    s.register_builtin("=", builtin_eq);
    s.register_builtin("list", builtin_list);
    s.register_builtin("cons", builtin_cons);
    s.register_builtin("car", builtin_car);
    s.register_builtin("cdr", builtin_cdr);
    s.register_builtin("setcar", builtin_setcar);
    s.register_builtin("setcdr", builtin_setcdr);
    s.register_builtin("print", builtin_print);
    s.register_builtin("type", builtin_type);
    s.register_builtin("parse", builtin_parse);
    s.register_builtin("error", builtin_error);
    s.register_builtin("exit", builtin_exit);
    s.register_builtin("require", require::builtin_require);

    s.register_prim("quote", prim_quote);
    s.register_prim("unquote", prim_unquote);
    s.register_prim("quasiquote", prim_quasiquote);
    s.register_prim("set", prim_set);
    s.register_prim("fn", prim_fn);
    s.register_prim("macro", prim_macro);
    s.register_prim("let", prim_let);
    s.register_prim("while", prim_while);
    s.register_prim("cond", prim_cond);
    s.register_prim("apply", prim_apply);
}
