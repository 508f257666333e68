//! Cranelift IR emission for the numeric subset of the language.
//!
//! Compiled functions have the signature `(f64*, i32) -> f64`. Everything
//! flowing through native code is a double; any form outside the subset
//! aborts compilation, which sticks the function to the interpreter.

use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{
    types, AbiParam, Function, InstBuilder, MemFlags, StackSlotData, StackSlotKind,
    Value as ClifValue,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};
use fxhash::FxHashMap;

use super::{resolve_function, JitError};
use crate::value::{FuncData, Type, Value};

pub(crate) struct Emitter<'a> {
    module: &'a mut JITModule,
    fd: *mut FuncData,
    bridge_id: FuncId,
    lookup_id: FuncId,
    /// Positional index of each parameter in the argument array.
    param_index: FxHashMap<String, usize>,
    /// `let`-bound locals, function-wide like the interpreter's frame.
    locals: FxHashMap<String, Variable>,
    next_var: u32,
    args_ptr: ClifValue,
}

/// Build the whole function body into `func`. The last body expression is
/// the return value; an empty body returns 0.0.
pub(crate) fn translate(
    module: &mut JITModule,
    bridge_id: FuncId,
    lookup_id: FuncId,
    fd: *mut FuncData,
    func: &mut Function,
) -> Result<(), JitError> {
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(func, &mut fb_ctx);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let args_ptr = builder.block_params(entry)[0];

    let mut emitter = Emitter {
        module,
        fd,
        bridge_id,
        lookup_id,
        param_index: index_params(fd),
        locals: FxHashMap::default(),
        next_var: 0,
        args_ptr,
    };

    let body = unsafe { (*fd).body.clone() };
    let mut last = None;
    let mut walk = body;
    while !walk.is_nil() {
        last = Some(emitter.emit_expr(&mut builder, &walk.car())?);
        walk = walk.cdr();
    }
    let last = match last {
        Some(v) => v,
        None => builder.ins().f64const(0.0),
    };
    builder.ins().return_(&[last]);
    builder.seal_all_blocks();
    builder.finalize();
    Ok(())
}

fn index_params(fd: *mut FuncData) -> FxHashMap<String, usize> {
    let mut index = FxHashMap::default();
    let mut idx = 0usize;
    let mut p = unsafe { (*fd).params.clone() };
    loop {
        if p.is_nil() {
            break;
        }
        if let Some(name) = p.symbol_name() {
            // Bare-symbol tail parameter: still positional for native code.
            index.insert(name.to_string(), idx);
            break;
        }
        if let Some(name) = p.car().symbol_name() {
            index.insert(name.to_string(), idx);
            idx += 1;
        }
        p = p.cdr();
    }
    index
}

impl Emitter<'_> {
    fn emit_expr(&mut self, b: &mut FunctionBuilder, expr: &Value) -> Result<ClifValue, JitError> {
        if expr.is_nil() {
            return Ok(b.ins().f64const(0.0));
        }
        match expr.kind() {
            Type::Number => Ok(b.ins().f64const(expr.as_number())),
            Type::Symbol => self.emit_symbol(b, expr),
            Type::Pair => self.emit_form(b, expr),
            _ => Err(JitError::Unsupported),
        }
    }

    fn emit_symbol(
        &mut self,
        b: &mut FunctionBuilder,
        expr: &Value,
    ) -> Result<ClifValue, JitError> {
        let Some(name) = expr.symbol_name() else {
            return Err(JitError::Unsupported);
        };
        // The interpreter binds `#t` to a symbol; the numeric world only
        // needs it to be true.
        if name == "#t" {
            return Ok(b.ins().f64const(1.0));
        }
        if let Some(&i) = self.param_index.get(name) {
            return Ok(b.ins().load(
                types::F64,
                MemFlags::trusted(),
                self.args_ptr,
                (i * 8) as i32,
            ));
        }
        if let Some(&var) = self.locals.get(name) {
            return Ok(b.use_var(var));
        }
        // Free variable: resolved at run time through the captured chain.
        // Interned symbol storage is pinned for the state's lifetime, so its
        // bytes can be referenced from generated code.
        let env = unsafe { (*self.fd).closure_env };
        let env_arg = b.ins().iconst(types::I64, env as i64);
        let name_ptr = b.ins().iconst(types::I64, name.as_ptr() as i64);
        let name_len = b.ins().iconst(types::I64, name.len() as i64);
        let lookup = self.module.declare_func_in_func(self.lookup_id, b.func);
        let call = b.ins().call(lookup, &[env_arg, name_ptr, name_len]);
        Ok(b.inst_results(call)[0])
    }

    fn emit_form(&mut self, b: &mut FunctionBuilder, expr: &Value) -> Result<ClifValue, JitError> {
        let op = expr.car();
        let rest = expr.cdr();
        let Some(opname) = op.symbol_name().map(str::to_string) else {
            return Err(JitError::Unsupported);
        };

        match opname.as_str() {
            "cond" => return self.emit_cond(b, &rest),
            "while" => return self.emit_while(b, &rest),
            "let" => return self.emit_let(b, &rest),
            _ => {}
        }

        let mut vals = Vec::new();
        let mut a = rest.clone();
        while !a.is_nil() {
            vals.push(self.emit_expr(b, &a.car())?);
            a = a.cdr();
        }

        match opname.as_str() {
            "+" | "-" | "*" | "/" => {
                if vals.len() != 2 {
                    return Err(JitError::Unsupported);
                }
                let r = match opname.as_str() {
                    "+" => b.ins().fadd(vals[0], vals[1]),
                    "-" => b.ins().fsub(vals[0], vals[1]),
                    "*" => b.ins().fmul(vals[0], vals[1]),
                    _ => b.ins().fdiv(vals[0], vals[1]),
                };
                Ok(r)
            }
            "<" | ">" | "<=" | ">=" | "=" => {
                if vals.len() != 2 {
                    return Err(JitError::Unsupported);
                }
                let cc = match opname.as_str() {
                    "<" => FloatCC::LessThan,
                    ">" => FloatCC::GreaterThan,
                    "<=" => FloatCC::LessThanOrEqual,
                    ">=" => FloatCC::GreaterThanOrEqual,
                    _ => FloatCC::Equal,
                };
                let cmp = b.ins().fcmp(cc, vals[0], vals[1]);
                let one = b.ins().f64const(1.0);
                let zero = b.ins().f64const(0.0);
                Ok(b.ins().select(cmp, one, zero))
            }
            _ => self.emit_call(b, &opname, &vals),
        }
    }

    /// A call whose head resolves in the captured chain to a user function:
    /// direct native call when the callee is already compiled, bridge call
    /// back into the interpreter otherwise.
    fn emit_call(
        &mut self,
        b: &mut FunctionBuilder,
        name: &str,
        vals: &[ClifValue],
    ) -> Result<ClifValue, JitError> {
        let closure = unsafe { (*self.fd).closure_env };
        let Some(callee) = resolve_function(closure, name) else {
            return Err(JitError::Unsupported);
        };

        let args_addr = if vals.is_empty() {
            b.ins().iconst(types::I64, 0)
        } else {
            let slot = b.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                (vals.len() * 8) as u32,
                0,
            ));
            for (i, v) in vals.iter().enumerate() {
                b.ins().stack_store(*v, slot, (i * 8) as i32);
            }
            b.ins().stack_addr(types::I64, slot, 0)
        };
        let argc = b.ins().iconst(types::I32, vals.len() as i64);

        let compiled = unsafe { (*callee).compiled_code };
        if let Some(code) = compiled {
            // The precompile walk ran before this function was emitted, so
            // the callee's code address is final.
            let mut sig = self.module.make_signature();
            sig.params.push(AbiParam::new(types::I64));
            sig.params.push(AbiParam::new(types::I32));
            sig.returns.push(AbiParam::new(types::F64));
            let sig_ref = b.import_signature(sig);
            let addr = b.ins().iconst(types::I64, code as usize as i64);
            let call = b.ins().call_indirect(sig_ref, addr, &[args_addr, argc]);
            return Ok(b.inst_results(call)[0]);
        }

        let bridge = self.module.declare_func_in_func(self.bridge_id, b.func);
        let fd_arg = b.ins().iconst(types::I64, callee as i64);
        let call = b.ins().call(bridge, &[fd_arg, args_addr, argc]);
        Ok(b.inst_results(call)[0])
    }

    fn emit_cond(&mut self, b: &mut FunctionBuilder, clauses: &Value) -> Result<ClifValue, JitError> {
        if clauses.is_nil() {
            return Ok(b.ins().f64const(0.0));
        }
        let cont = b.create_block();
        b.append_block_param(cont, types::F64);

        let mut walk = clauses.clone();
        while !walk.is_nil() {
            let clause = walk.car();
            let test = clause.car();
            let condv = self.emit_expr(b, &test)?;
            let zero = b.ins().f64const(0.0);
            let is_true = b.ins().fcmp(FloatCC::OrderedNotEqual, condv, zero);

            let body_bb = b.create_block();
            let next_bb = b.create_block();
            b.ins().brif(is_true, body_bb, &[], next_bb, &[]);

            b.switch_to_block(body_bb);
            let mut last = None;
            let mut body = clause.cdr();
            while !body.is_nil() {
                last = Some(self.emit_expr(b, &body.car())?);
                body = body.cdr();
            }
            let last = match last {
                Some(v) => v,
                None => b.ins().f64const(0.0),
            };
            b.ins().jump(cont, &[last]);

            b.switch_to_block(next_bb);
            walk = walk.cdr();
        }

        let default = b.ins().f64const(0.0);
        b.ins().jump(cont, &[default]);
        b.switch_to_block(cont);
        Ok(b.block_params(cont)[0])
    }

    fn emit_while(&mut self, b: &mut FunctionBuilder, rest: &Value) -> Result<ClifValue, JitError> {
        let cond = rest.car();
        let body = rest.cdr();

        // The loop's value is the last body value, or 0.0 when the body
        // never runs; thread it through a variable so the continuation
        // block sees a well-defined result.
        let result = self.fresh_var(b);
        let zero = b.ins().f64const(0.0);
        b.def_var(result, zero);

        let header = b.create_block();
        let body_bb = b.create_block();
        let cont = b.create_block();

        b.ins().jump(header, &[]);
        b.switch_to_block(header);
        let condv = self.emit_expr(b, &cond)?;
        let zero = b.ins().f64const(0.0);
        let is_true = b.ins().fcmp(FloatCC::OrderedNotEqual, condv, zero);
        b.ins().brif(is_true, body_bb, &[], cont, &[]);

        b.switch_to_block(body_bb);
        let mut last = None;
        let mut walk = body.clone();
        while !walk.is_nil() {
            last = Some(self.emit_expr(b, &walk.car())?);
            walk = walk.cdr();
        }
        if let Some(v) = last {
            b.def_var(result, v);
        }
        b.ins().jump(header, &[]);

        b.switch_to_block(cont);
        Ok(b.use_var(result))
    }

    fn emit_let(&mut self, b: &mut FunctionBuilder, rest: &Value) -> Result<ClifValue, JitError> {
        let bindings = rest.car();
        // Both binding shapes: ((s v) ...) and the flat (s v s v ...).
        if bindings.kind() == Type::Pair && bindings.car().kind() == Type::Pair {
            let mut w = bindings.clone();
            while !w.is_nil() {
                let pair = w.car();
                let name_v = pair.car();
                let Some(name) = name_v.symbol_name().map(str::to_string) else {
                    return Err(JitError::Unsupported);
                };
                let value = self.emit_expr(b, &pair.cdr().car())?;
                let var = self.local(b, &name);
                b.def_var(var, value);
                w = w.cdr();
            }
        } else {
            let mut w = bindings.clone();
            while !w.is_nil() {
                let name_v = w.car();
                let Some(name) = name_v.symbol_name().map(str::to_string) else {
                    return Err(JitError::Unsupported);
                };
                let next = w.cdr();
                if next.is_nil() {
                    return Err(JitError::Unsupported);
                }
                let value = self.emit_expr(b, &next.car())?;
                let var = self.local(b, &name);
                b.def_var(var, value);
                w = next.cdr();
            }
        }

        let mut last = None;
        let mut body = rest.cdr();
        while !body.is_nil() {
            last = Some(self.emit_expr(b, &body.car())?);
            body = body.cdr();
        }
        Ok(match last {
            Some(v) => v,
            None => b.ins().f64const(0.0),
        })
    }

    fn local(&mut self, b: &mut FunctionBuilder, name: &str) -> Variable {
        if let Some(&var) = self.locals.get(name) {
            return var;
        }
        let var = self.fresh_var(b);
        self.locals.insert(name.to_string(), var);
        var
    }

    fn fresh_var(&mut self, b: &mut FunctionBuilder) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        b.declare_var(var, types::F64);
        var
    }
}
