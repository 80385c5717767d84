//! Hybrid JIT backend.
//!
//! Every top-level function definition is compiled to native code before any
//! statement runs; functions that the code generator rejects stay
//! interpreter-only. Top-level statements then execute through a JIT-aware
//! walker that routes calls targeting compiled functions through their
//! native entries and falls back to the interpreter for everything else.
//!
//! Generated code calls back into the runtime through `extern "C"` helpers.
//! The helpers reach the runtime through a thread-local pointer installed
//! for the duration of a run; only one runtime can be active per thread.
//! Helper failures cannot unwind through native frames, so they are parked
//! on the runtime as a fault and re-checked after every native call returns.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::ffi::{CStr, CString, c_char};
use std::fmt::Write as _;
use std::ptr;

use anyhow::{Result, bail};

use crate::ast::{BinaryOperator, Expression, FunctionDef, Program, Statement, UnaryOperator};
use crate::backend::Backend;
use crate::backend::interpreter::{ExecResult, Interpreter, Value};
use crate::codegen::{CodeGen, host_codegen};

/// Signature of a compiled function: `(args_ptr, arg_count) -> i64`.
type JitEntry = unsafe extern "C" fn(*const i64, i32) -> i64;

/// Depth of the argument scratch buffer drained by `runtime_call_func`.
const MAX_CALL_ARGS: usize = 16;

/// Ceiling on stack slots per compiled function; keeps every frame within
/// the immediate ranges both encoders use.
const MAX_LOCAL_SLOTS: usize = 500;

pub struct JIT;

impl JIT {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JIT {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for JIT {
    fn name(&self) -> &'static str {
        "jit"
    }

    fn run(&mut self, program: &Program) -> Result<String> {
        let _activation = Activation::install(JitRuntime::new())?;
        let result = run_program(program);
        let output = with_runtime(|rt| std::mem::take(&mut rt.interpreter.output));
        result.map(|()| output)
    }
}

fn run_program(program: &Program) -> Result<()> {
    // First pass: register every function with the interpreter and try to
    // compile it. A compile failure leaves the function interpreter-only.
    for statement in &program.statements {
        let Statement::FunctionDef(def) = statement else {
            continue;
        };
        with_runtime(|rt| rt.interpreter.register_function(def));

        let compiled = with_runtime(|rt| compile_function(def, &mut rt.names));
        match compiled {
            Ok(code) => {
                let page = ExecutablePage::new(&code)?;
                let function = CompiledFunction {
                    entry: page.entry(),
                    code_size: code.len(),
                };
                with_runtime(|rt| {
                    rt.pages.push(page);
                    rt.compiled.insert(def.name.clone(), function);
                });
            }
            Err(err) => {
                eprintln!(
                    "JIT compilation failed for {}: {err}, using interpreter",
                    def.name
                );
            }
        }
    }

    // Second pass: run the remaining top-level statements.
    for statement in &program.statements {
        if !matches!(statement, Statement::FunctionDef(_)) {
            exec_statement_hybrid(statement)?;
        }
    }
    Ok(())
}

/// Top-level statement walker. Statements whose call subexpressions can
/// target compiled functions are handled here; the rest go to the
/// interpreter unchanged.
fn exec_statement_hybrid(statement: &Statement) -> Result<()> {
    match statement {
        Statement::Assign { name, value, .. } => {
            let value = evaluate_hybrid(value)?;
            with_runtime(|rt| rt.interpreter.variables.insert(name.clone(), value));
            Ok(())
        }
        Statement::Call { name, args } if compiled_entry(name).is_some() => {
            call_compiled(name, args).map(|_| ())
        }
        Statement::Print(args) => {
            let values = args
                .iter()
                .map(evaluate_hybrid)
                .collect::<Result<Vec<_>>>()?;
            with_runtime(|rt| rt.interpreter.print_values(&values));
            Ok(())
        }
        other => match with_runtime(|rt| rt.interpreter.exec_statement(other))? {
            ExecResult::Continue => Ok(()),
            ExecResult::Return(_) => bail!("Return outside of function"),
        },
    }
}

fn evaluate_hybrid(expr: &Expression) -> Result<Value> {
    if let Expression::Call { name, args } = expr
        && compiled_entry(name).is_some()
    {
        return call_compiled(name, args).map(Value::Integer);
    }
    with_runtime(|rt| rt.interpreter.evaluate(expr))
}

/// Evaluate the arguments to integers and invoke the native entry.
fn call_compiled(name: &str, args: &[Expression]) -> Result<i64> {
    let mut argv = Vec::with_capacity(args.len());
    for arg in args {
        argv.push(evaluate_hybrid(arg)?.as_integer()?);
    }
    let Some(entry) = compiled_entry(name) else {
        bail!("Function not compiled: {name}")
    };
    invoke_entry(entry, &argv)
}

fn compiled_entry(name: &str) -> Option<JitEntry> {
    with_runtime(|rt| rt.compiled.get(name).map(|function| function.entry))
}

/// Run native code. No borrow of the runtime may be live across this call;
/// the helpers the code calls back into take their own short borrows.
fn invoke_entry(entry: JitEntry, args: &[i64]) -> Result<i64> {
    let result = unsafe { entry(args.as_ptr(), args.len() as i32) };
    if let Some(err) = with_runtime(|rt| rt.fault.take()) {
        return Err(err);
    }
    Ok(result)
}

struct CompiledFunction {
    entry: JitEntry,
    #[allow(dead_code)]
    code_size: usize,
}

/// Everything the `extern "C"` helpers need to reach: the interpreter (for
/// fallback calls and the output buffer), the compiled-function table, the
/// pages backing it, interned strings referenced by generated code, the
/// call-argument scratch buffer, and the parked helper fault.
struct JitRuntime {
    interpreter: Interpreter,
    compiled: HashMap<String, CompiledFunction>,
    pages: Vec<ExecutablePage>,
    names: Vec<CString>,
    scratch_args: [i64; MAX_CALL_ARGS],
    scratch_len: usize,
    fault: Option<anyhow::Error>,
}

impl JitRuntime {
    fn new() -> Self {
        Self {
            interpreter: Interpreter::new(),
            compiled: HashMap::new(),
            pages: Vec::new(),
            names: Vec::new(),
            scratch_args: [0; MAX_CALL_ARGS],
            scratch_len: 0,
            fault: None,
        }
    }
}

thread_local! {
    static ACTIVE_RUNTIME: Cell<*mut JitRuntime> = const { Cell::new(ptr::null_mut()) };
}

/// Borrow the active runtime for the duration of `f`. The borrow must not
/// span a native call.
fn with_runtime<T>(f: impl FnOnce(&mut JitRuntime) -> T) -> T {
    ACTIVE_RUNTIME.with(|cell| {
        let ptr = cell.get();
        assert!(!ptr.is_null(), "no active JIT runtime on this thread");
        f(unsafe { &mut *ptr })
    })
}

/// Owns the runtime for one run and keeps the thread-local handle pointing
/// at it; dropping releases the handle, the runtime, and with it every
/// executable page.
#[derive(Debug)]
struct Activation {
    ptr: *mut JitRuntime,
}

impl Activation {
    fn install(runtime: JitRuntime) -> Result<Self> {
        ACTIVE_RUNTIME.with(|cell| {
            if !cell.get().is_null() {
                bail!("A JIT runtime is already active on this thread");
            }
            let ptr = Box::into_raw(Box::new(runtime));
            cell.set(ptr);
            Ok(Self { ptr })
        })
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        ACTIVE_RUNTIME.with(|cell| cell.set(ptr::null_mut()));
        drop(unsafe { Box::from_raw(self.ptr) });
    }
}

/// Page-granular read/write/execute mapping; unmapped on drop.
struct ExecutablePage {
    base: *mut u8,
    len: usize,
}

impl ExecutablePage {
    fn new(code: &[u8]) -> Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            bail!("Failed to query the page size");
        }
        let page_size = page_size as usize;
        let len = code.len().div_ceil(page_size) * page_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "Failed to allocate executable memory: {}",
                std::io::Error::last_os_error()
            );
        }

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), base as *mut u8, code.len());
            #[cfg(target_arch = "aarch64")]
            __clear_cache(
                base as *mut c_char,
                (base as *mut c_char).add(code.len()),
            );
        }

        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    fn entry(&self) -> JitEntry {
        unsafe { std::mem::transmute::<*mut u8, JitEntry>(self.base) }
    }
}

impl Drop for ExecutablePage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    fn __clear_cache(begin: *mut c_char, end: *mut c_char);
}

// --- per-function compilation ---

fn compile_function(def: &FunctionDef, names: &mut Vec<CString>) -> Result<Vec<u8>> {
    if def.params.len() > MAX_CALL_ARGS {
        bail!(
            "{} parameters exceed the call-argument limit of {MAX_CALL_ARGS}",
            def.params.len()
        );
    }

    let mut slots = HashMap::new();
    for (index, param) in def.params.iter().enumerate() {
        slots.insert(param.name.clone(), index);
    }

    // Every name assigned or referenced in the body gets a zero-initialized
    // slot after the parameters, in sorted order.
    let mut body_names = BTreeSet::new();
    collect_block_names(&def.body, &slots, &mut body_names);
    for name in body_names {
        let slot = slots.len();
        slots.insert(name, slot);
    }

    let local_count = slots.len();
    if local_count > MAX_LOCAL_SLOTS {
        bail!("too many local variables ({local_count})");
    }

    let mut compiler = FunctionCompiler {
        codegen: host_codegen()?,
        slots,
        names,
    };

    compiler.codegen.emit_prologue(local_count);
    for (index, param) in def.params.iter().enumerate() {
        compiler.codegen.emit_load_arg(index);
        let slot = compiler.slot(&param.name)?;
        compiler.codegen.emit_store_local(slot);
    }

    for statement in &def.body {
        compiler.compile_statement(statement)?;
    }

    // Fall-through tail for bodies without an explicit return.
    compiler.codegen.emit_load_immediate(0);
    compiler.codegen.emit_epilogue();

    compiler.codegen.finish()
}

/// Names assigned or referenced outside the parameter list. Collection is
/// purely syntactic; the language has no nested scopes.
fn collect_block_names(
    statements: &[Statement],
    params: &HashMap<String, usize>,
    found: &mut BTreeSet<String>,
) {
    for statement in statements {
        match statement {
            Statement::Assign { name, value, .. } => {
                if !params.contains_key(name) {
                    found.insert(name.clone());
                }
                collect_expr_names(value, params, found);
            }
            Statement::Call { args, .. } | Statement::Print(args) => {
                for arg in args {
                    collect_expr_names(arg, params, found);
                }
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                collect_expr_names(condition, params, found);
                collect_block_names(then_body, params, found);
                collect_block_names(else_body, params, found);
            }
            Statement::While { condition, body } => {
                collect_expr_names(condition, params, found);
                collect_block_names(body, params, found);
            }
            Statement::Return(Some(value)) => collect_expr_names(value, params, found),
            Statement::Return(None) | Statement::FunctionDef(_) => {}
        }
    }
}

fn collect_expr_names(
    expr: &Expression,
    params: &HashMap<String, usize>,
    found: &mut BTreeSet<String>,
) {
    match expr {
        Expression::Variable(name) => {
            if !params.contains_key(name) {
                found.insert(name.clone());
            }
        }
        Expression::BinaryOp { left, right, .. } => {
            collect_expr_names(left, params, found);
            collect_expr_names(right, params, found);
        }
        Expression::UnaryOp { operand, .. } => collect_expr_names(operand, params, found),
        Expression::Call { args, .. } => {
            for arg in args {
                collect_expr_names(arg, params, found);
            }
        }
        Expression::Integer(_) | Expression::Boolean(_) | Expression::String(_) => {}
    }
}

/// How a print argument is routed to the runtime print helpers, decided
/// from the expression's syntactic kind.
enum PrintKind {
    Integer,
    Boolean,
    Str,
}

fn print_arg_kind(expr: &Expression) -> PrintKind {
    match expr {
        Expression::Boolean(_) => PrintKind::Boolean,
        Expression::String(_) => PrintKind::Str,
        Expression::BinaryOp { op, .. } => match op {
            BinaryOperator::Eq
            | BinaryOperator::Ne
            | BinaryOperator::Lt
            | BinaryOperator::Le
            | BinaryOperator::Gt
            | BinaryOperator::Ge
            | BinaryOperator::And
            | BinaryOperator::Or => PrintKind::Boolean,
            _ => PrintKind::Integer,
        },
        Expression::UnaryOp {
            op: UnaryOperator::Not,
            ..
        } => PrintKind::Boolean,
        _ => PrintKind::Integer,
    }
}

struct FunctionCompiler<'a> {
    codegen: Box<dyn CodeGen>,
    slots: HashMap<String, usize>,
    names: &'a mut Vec<CString>,
}

impl FunctionCompiler<'_> {
    fn compile_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Assign { name, value, .. } => {
                self.compile_expression(value)?;
                let slot = self.slot(name)?;
                self.codegen.emit_store_local(slot);
                Ok(())
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                let mut else_label = self.codegen.create_label();
                let mut end_label = self.codegen.create_label();

                self.compile_expression(condition)?;
                self.codegen.emit_jump_if_false(&mut else_label);
                self.compile_block(then_body)?;
                if else_body.is_empty() {
                    self.codegen.bind_label(&mut else_label);
                } else {
                    self.codegen.emit_jump(&mut end_label);
                    self.codegen.bind_label(&mut else_label);
                    self.compile_block(else_body)?;
                    self.codegen.bind_label(&mut end_label);
                }
                Ok(())
            }
            Statement::While { condition, body } => {
                let mut top_label = self.codegen.create_label();
                let mut end_label = self.codegen.create_label();

                self.codegen.bind_label(&mut top_label);
                self.compile_expression(condition)?;
                self.codegen.emit_jump_if_false(&mut end_label);
                self.compile_block(body)?;
                self.codegen.emit_jump(&mut top_label);
                self.codegen.bind_label(&mut end_label);
                Ok(())
            }
            Statement::Return(value) => {
                match value {
                    Some(value) => self.compile_expression(value)?,
                    None => self.codegen.emit_load_immediate(0),
                }
                self.codegen.emit_epilogue();
                Ok(())
            }
            Statement::Print(args) => {
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.codegen.emit_call_runtime(runtime_print_tab as usize);
                    }
                    match print_arg_kind(arg) {
                        PrintKind::Str => {
                            let Expression::String(text) = arg else {
                                unreachable!("string print kind implies a string literal");
                            };
                            let ptr = self.intern(text)?;
                            self.codegen.emit_load_string_ptr(ptr);
                            self.codegen.emit_set_call_arg(0);
                            self.codegen.emit_call_runtime(runtime_print_string as usize);
                        }
                        PrintKind::Boolean => {
                            self.compile_expression(arg)?;
                            self.codegen.emit_set_call_arg(0);
                            self.codegen.emit_call_runtime(runtime_print_bool as usize);
                        }
                        PrintKind::Integer => {
                            self.compile_expression(arg)?;
                            self.codegen.emit_set_call_arg(0);
                            self.codegen.emit_call_runtime(runtime_print_int as usize);
                        }
                    }
                }
                self.codegen.emit_call_runtime(runtime_print_newline as usize);
                Ok(())
            }
            Statement::Call { name, args } => self.compile_call(name, args),
            Statement::FunctionDef(def) => {
                bail!("nested function definition '{}'", def.name)
            }
        }
    }

    fn compile_block(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_expression(&mut self, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Integer(value) => {
                self.codegen.emit_load_immediate(*value);
                Ok(())
            }
            Expression::Boolean(value) => {
                self.codegen.emit_load_bool(*value);
                Ok(())
            }
            Expression::String(_) => {
                bail!("string values are only supported as print arguments")
            }
            Expression::Variable(name) => {
                let slot = self.slot(name)?;
                self.codegen.emit_load_local(slot);
                Ok(())
            }
            Expression::BinaryOp { op, left, right } => {
                self.compile_expression(left)?;
                self.codegen.emit_push();
                self.compile_expression(right)?;
                self.codegen.emit_pop();
                self.codegen.emit_binary(*op);
                Ok(())
            }
            Expression::UnaryOp { op, operand } => {
                self.compile_expression(operand)?;
                self.codegen.emit_unary(*op);
                Ok(())
            }
            Expression::Call { name, args } => self.compile_call(name, args),
        }
    }

    /// Arguments go one by one through the `push_arg` scratch buffer; the
    /// `call_func` helper then drains it and dispatches by name, so
    /// compiled-to-compiled and compiled-to-interpreted calls share one
    /// path. The result lands in the result register.
    fn compile_call(&mut self, name: &str, args: &[Expression]) -> Result<()> {
        if args.len() > MAX_CALL_ARGS {
            bail!(
                "call to '{name}' passes {} arguments (limit {MAX_CALL_ARGS})",
                args.len()
            );
        }
        for arg in args {
            self.compile_expression(arg)?;
            self.codegen.emit_set_call_arg(0);
            self.codegen.emit_call_runtime(runtime_push_arg as usize);
        }
        let ptr = self.intern(name)?;
        self.codegen.emit_load_string_ptr(ptr);
        self.codegen.emit_set_call_arg(0);
        self.codegen.emit_call_runtime(runtime_call_func as usize);
        Ok(())
    }

    fn slot(&self, name: &str) -> Result<usize> {
        match self.slots.get(name) {
            Some(&slot) => Ok(slot),
            None => bail!("Undefined variable in JIT: {name}"),
        }
    }

    /// Intern a NUL-terminated copy whose address stays valid for as long
    /// as the runtime (and therefore the generated code) lives.
    fn intern(&mut self, text: &str) -> Result<*const c_char> {
        let interned = CString::new(text)?;
        let ptr = interned.as_ptr();
        self.names.push(interned);
        Ok(ptr)
    }
}

// --- runtime helpers called by generated code ---

unsafe extern "C" fn runtime_print_int(value: i64) {
    with_runtime(|rt| {
        let _ = write!(rt.interpreter.output, "{value}");
    });
}

unsafe extern "C" fn runtime_print_bool(value: i32) {
    with_runtime(|rt| {
        rt.interpreter
            .output
            .push_str(if value != 0 { "true" } else { "false" });
    });
}

unsafe extern "C" fn runtime_print_string(text: *const c_char) {
    let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
    with_runtime(|rt| rt.interpreter.output.push_str(&text));
}

unsafe extern "C" fn runtime_print_tab() {
    with_runtime(|rt| rt.interpreter.output.push('\t'));
}

unsafe extern "C" fn runtime_print_newline() {
    with_runtime(|rt| rt.interpreter.output.push('\n'));
}

/// Append a call argument; the buffer is drained by the next
/// `runtime_call_func`. Single-threaded by the activation invariant.
unsafe extern "C" fn runtime_push_arg(value: i64) {
    with_runtime(|rt| {
        if rt.scratch_len < MAX_CALL_ARGS {
            rt.scratch_args[rt.scratch_len] = value;
            rt.scratch_len += 1;
        }
    });
}

/// Call a user function by name with the scratch-buffer arguments:
/// compiled entry if there is one, interpreter fallback otherwise. On
/// failure the error is parked on the runtime and 0 is returned; the
/// driver surfaces the fault once the outermost native call unwinds.
unsafe extern "C" fn runtime_call_func(name: *const c_char) -> i64 {
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();

    let (entry, args) = with_runtime(|rt| {
        let count = rt.scratch_len;
        rt.scratch_len = 0;
        let args = rt.scratch_args[..count].to_vec();
        let entry = rt.compiled.get(name.as_str()).map(|f| f.entry);
        (entry, args)
    });

    if let Some(entry) = entry {
        return unsafe { entry(args.as_ptr(), args.len() as i32) };
    }

    let result = with_runtime(|rt| interpret_call_from_native(rt, &name, &args));
    match result {
        Ok(value) => value,
        Err(err) => {
            with_runtime(|rt| {
                if rt.fault.is_none() {
                    rt.fault = Some(err);
                }
            });
            0
        }
    }
}

/// Interpreter fallback for a call issued by compiled code: integer
/// arguments bind to the parameters (missing ones as nil), the body runs
/// under the usual save/restore, and the result is coerced back to the
/// integer world — a nil result becomes 0.
fn interpret_call_from_native(rt: &mut JitRuntime, name: &str, args: &[i64]) -> Result<i64> {
    let Some(def) = rt.interpreter.functions.get(name).cloned() else {
        bail!("Undefined function: {name}")
    };

    let saved = rt.interpreter.variables.clone();
    for (i, param) in def.params.iter().enumerate() {
        let value = match args.get(i) {
            Some(&value) => Value::Integer(value),
            None => Value::None,
        };
        rt.interpreter.variables.insert(param.name.clone(), value);
    }

    let outcome = rt.interpreter.exec_block(&def.body);
    rt.interpreter.variables = saved;

    let value = match outcome? {
        ExecResult::Return(value) => value,
        ExecResult::Continue => Value::None,
    };
    match value {
        Value::None => Ok(0),
        other => other.as_integer(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use indoc::indoc;

    fn parse(source: &str) -> Program {
        let tokens = tokenize(source).expect("tokenize failed");
        parse_tokens(tokens).expect("parse failed")
    }

    fn run_jit(source: &str) -> Result<String> {
        JIT::new().run(&parse(source))
    }

    fn assert_backends_agree(source: &str) {
        let program = parse(source);
        let interpreted = Interpreter::new().run(&program).expect("interpreter run");
        let jitted = JIT::new().run(&program).expect("jit run");
        assert_eq!(jitted, interpreted, "backend outputs differ");
    }

    #[test]
    fn compiles_and_calls_square() {
        let output = run_jit(indoc! {r#"
            function f(x)
                return x * x
            end
            print(f(5))
        "#})
        .expect("run failed");
        assert_eq!(output, "25\n");
    }

    #[test]
    fn recursive_fibonacci_matches_interpreter() {
        assert_backends_agree(indoc! {r#"
            function fib(n)
                if n < 2 then
                    return n
                end
                return fib(n - 1) + fib(n - 2)
            end
            print(fib(15))
        "#});
    }

    #[test]
    fn compiled_loops_and_locals_match_interpreter() {
        assert_backends_agree(indoc! {r#"
            function sum_to(n)
                local total = 0
                local i = 1
                while i <= n do
                    total = total + i
                    i = i + 1
                end
                return total
            end
            print(sum_to(10))
            print(sum_to(100))
        "#});
    }

    #[test]
    fn compiled_print_formats_like_interpreter() {
        assert_backends_agree(indoc! {r#"
            function show(a, b)
                print(a, b, a + b)
                print("sum", a < b, true, not 0)
            end
            show(3, 4)
        "#});
    }

    #[test]
    fn compiled_operators_match_interpreter() {
        assert_backends_agree(indoc! {r#"
            function mix(a, b)
                return a * 3 - b / 2 + a % 7
            end
            function compare(a, b)
                if a >= b and b ~= 0 then
                    return -a
                elseif a == b or a > 0 then
                    return a - b
                end
                return not (a <= b)
            end
            print(mix(10, 4), mix(-9, 5))
            print(compare(5, 3), compare(-2, -2))
        "#});
    }

    #[test]
    fn compiled_caller_reaches_interpreted_callee() {
        // The string concat keeps `announce` interpreter-only; `work`
        // compiles and calls it through the runtime bridge.
        assert_backends_agree(indoc! {r#"
            function announce(n)
                print("value: " + n)
            end
            function work(n)
                announce(n)
                return n * 2
            end
            print(work(21))
        "#});
    }

    #[test]
    fn interpreted_callee_without_return_yields_zero() {
        let output = run_jit(indoc! {r#"
            function nothing(n)
                print(n)
            end
            function probe(n)
                return nothing(n)
            end
            print(probe(7))
        "#})
        .expect("run failed");
        assert_eq!(output, "7\n0\n");
    }

    #[test]
    fn fault_in_interpreted_callee_propagates() {
        let err = run_jit(indoc! {r#"
            function broken()
                print("oops " + 1)
                return missing_function()
            end
            function outer()
                return broken() + 1
            end
            print(outer())
        "#})
        .expect_err("expected runtime failure");
        assert!(err.to_string().contains("Undefined function: missing_function"));
    }

    #[test]
    fn top_level_runtime_errors_still_surface() {
        let err = run_jit("print(1 / 0)").expect_err("expected division failure");
        assert!(err.to_string().contains("Division by zero"));
    }

    #[test]
    fn top_level_statements_route_through_interpreter_state() {
        assert_backends_agree(indoc! {r#"
            function double(n)
                return n + n
            end
            x = double(4)
            if x == 8 then
                print("eight", x)
            else
                print("not eight", x)
            end
            while x > 0 do
                x = x - 3
            end
            print(x)
        "#});
    }

    #[test]
    fn deep_argument_lists_compile() {
        assert_backends_agree(indoc! {r#"
            function total(a, b, c, d, e, f)
                return a + b + c + d + e + f
            end
            print(total(1, 2, 3, 4, 5, 6))
        "#});
    }

    #[test]
    fn only_one_runtime_may_be_active() {
        let _outer = Activation::install(JitRuntime::new()).expect("install failed");
        let err = Activation::install(JitRuntime::new()).expect_err("expected busy runtime");
        assert!(err.to_string().contains("already active"));
    }

    #[test]
    fn executable_page_is_page_granular() {
        let page = ExecutablePage::new(&[0xC3]).expect("allocate failed");
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert_eq!(page.len % page_size, 0);
        assert!(page.len >= page_size);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn emitted_constant_function_executes() {
        let mut codegen = host_codegen().expect("host codegen");
        codegen.emit_prologue(0);
        codegen.emit_load_immediate(41);
        codegen.emit_push();
        codegen.emit_load_immediate(1);
        codegen.emit_pop();
        codegen.emit_binary(BinaryOperator::Add);
        codegen.emit_epilogue();
        let code = codegen.finish().expect("finish failed");

        let page = ExecutablePage::new(&code).expect("allocate failed");
        let result = unsafe { page.entry()(ptr::null(), 0) };
        assert_eq!(result, 42);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn emitted_argument_load_executes() {
        let mut codegen = host_codegen().expect("host codegen");
        codegen.emit_prologue(2);
        codegen.emit_load_arg(0);
        codegen.emit_store_local(0);
        codegen.emit_load_arg(1);
        codegen.emit_store_local(1);
        codegen.emit_load_local(0);
        codegen.emit_push();
        codegen.emit_load_local(1);
        codegen.emit_pop();
        codegen.emit_binary(BinaryOperator::Sub);
        codegen.emit_epilogue();
        let code = codegen.finish().expect("finish failed");

        let page = ExecutablePage::new(&code).expect("allocate failed");
        let args = [50i64, 8];
        let result = unsafe { page.entry()(args.as_ptr(), args.len() as i32) };
        assert_eq!(result, 42);
    }
}
