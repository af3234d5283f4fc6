// File: src/vm.rs
//
// Stack-based bytecode VM: the dispatch loop, calling convention, exception
// unwinding, and the field/index/collection opcode handlers spec.md §4-§5
// describe. Grounded on the teacher's `vm.rs` for overall shape (a `Vm`
// struct owning the heap plus a fetch-execute loop over an opcode enum) but
// entirely rebuilt around the GC arena, `CallFrame`/`ActiveHandler` call
// stack, and the tagged `Value` this crate uses instead of the teacher's
// `Arc`-based `Value`.

use std::collections::HashMap;

use crate::builtins::{self, CoreClasses};
use crate::bytecode::{Chunk, Constant, DefaultLit, FunctionMeta, OpCode};
use crate::compiler::Compiler;
use crate::errors::find_closest_match;
use crate::gc::{Heap, ObjRef};
use crate::module::ModuleLoader;
use crate::value::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, ListObj, ModuleObj, ObjKind,
    TableObj, TupleObj, UpvalueObj, UpvalueState, Value,
};

const FRAMES_MAX: usize = 512;

/// A handler installed by `SETUP_HANDLER`, plus the stack depth it was
/// installed at. `stack_len` is all the unwinder needs to both discard
/// body/arm locals and land the caught exception in the right local slot:
/// the compiler always declares an except arm's bound variable at the same
/// scope depth `try_stmt` was entered at, so truncating to `stack_len` and
/// pushing the exception reproduces exactly the stack shape the arm's body
/// expects (see DESIGN.md).
struct ActiveHandler {
    spec: crate::bytecode::HandlerSpec,
    stack_len: usize,
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
    module: ObjRef,
    handlers: Vec<ActiveHandler>,
    /// Set when this frame is running a class's `init` on behalf of a
    /// constructor call; `Return` substitutes this instance for whatever
    /// `init` itself returns, so `MyClass()` yields the new instance rather
    /// than `init`'s (normally null) return value.
    ctor_result: Option<ObjRef>,
}

#[derive(Debug)]
enum StageError {
    Parse(Vec<(u32, String)>),
    Compile(Vec<(u32, String)>),
}

/// Outcome of running a top-level script, distinguished the way spec.md §7's
/// exit codes require: 1 for a syntax error, 2 for a compile error, 3 for an
/// uncaught exception.
pub enum RunError {
    Syntax(Vec<(u32, String)>),
    Compile(Vec<(u32, String)>),
    Runtime { message: String, trace: Vec<String> },
}

pub struct Vm {
    pub heap: Heap,
    pub modules: HashMap<String, ObjRef>,
    pub core: CoreClasses,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, sorted ascending by the stack index they point at.
    open_upvalues: Vec<(usize, ObjRef)>,
    loader: ModuleLoader,
    pending_exception: Option<Value>,
    /// The frame-count floor the current dispatch loop must not unwind
    /// past. 0 at the top level; raised while driving a nested module load
    /// so an uncaught exception there doesn't leak into the importer's own
    /// handlers (see `import_module`).
    exec_floor: usize,
    last_trace: Vec<String>,
}

impl CoreClasses {
    fn dummy() -> Self {
        CoreClasses {
            exception: ObjRef::MAX,
            type_exception: ObjRef::MAX,
            name_exception: ObjRef::MAX,
            field_exception: ObjRef::MAX,
            method_exception: ObjRef::MAX,
            import_exception: ObjRef::MAX,
            stack_overflow_exception: ObjRef::MAX,
            syntax_exception: ObjRef::MAX,
            invalid_arg_exception: ObjRef::MAX,
            index_out_of_bound_exception: ObjRef::MAX,
            assert_exception: ObjRef::MAX,
            not_implemented_exception: ObjRef::MAX,
            program_interrupt: ObjRef::MAX,
            file_not_found_exception: ObjRef::MAX,
            io_exception: ObjRef::MAX,
            regex_exception: ObjRef::MAX,
        }
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            modules: HashMap::new(),
            core: CoreClasses::dummy(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            loader: ModuleLoader::new(),
            pending_exception: None,
            exec_floor: 0,
            last_trace: Vec::new(),
        };
        let core = builtins::install_core(&mut vm);
        vm.core = core;
        builtins::install_stub_modules(&mut vm);
        vm
    }

    pub fn add_search_path<P: AsRef<std::path::Path>>(&mut self, path: P) {
        self.loader.add_search_path(path);
    }

    /// Sets `sys.argv` to a `List` of strings (spec.md §6.4: "set
    /// `sys.argv`" when a script file is given). Called once by the CLI
    /// driver before `run_source`.
    pub fn set_sys_argv(&mut self, args: &[String]) {
        let items: Vec<Value> = args.iter().map(|a| Value::Object(self.heap.alloc_string(a.clone()))).collect();
        let list_ref = self.heap.alloc(ObjKind::List(crate::value::ListObj { items }));
        let Some(&sys_module) = self.modules.get("sys") else { return };
        if let ObjKind::Module(m) = &mut self.heap.get_mut(sys_module).kind {
            m.globals.insert("argv".to_string(), Value::Object(list_ref));
        }
    }

    // ---- compile/run pipeline -------------------------------------------------

    fn compile(&mut self, path: &str, src: &str) -> Result<FunctionMeta, StageError> {
        let mut parse_errors: Vec<(u32, String)> = Vec::new();
        let mut parse_sink = |_p: &str, line: u32, msg: &str| parse_errors.push((line, msg.to_string()));
        let program = crate::parser::parse_program(path, src, &mut parse_sink);
        let program = match program {
            Some(p) => p,
            None => return Err(StageError::Parse(parse_errors)),
        };
        let mut compile_errors: Vec<(u32, String)> = Vec::new();
        let mut compile_sink = |_p: &str, line: u32, msg: &str| compile_errors.push((line, msg.to_string()));
        let compiler = Compiler::new(path, &mut compile_sink);
        match compiler.compile_module(&program.body) {
            Some(meta) => Ok(meta),
            None => Err(StageError::Compile(compile_errors)),
        }
    }

    fn load_meta(&mut self, meta: FunctionMeta, module_ref: ObjRef) -> ObjRef {
        let function_ref = self.heap.alloc(ObjKind::Function(FunctionObj {
            name: meta.name,
            arity: meta.arity,
            default_count: meta.default_count,
            is_vararg: meta.is_vararg,
            upvalue_count: meta.upvalue_count,
            upvalues: meta.upvalues,
            chunk: meta.chunk,
            module: module_ref,
            home_class: None,
            defaults: meta.defaults,
        }));
        self.heap.alloc(ObjKind::Closure(ClosureObj { function: function_ref, upvalues: Vec::new() }))
    }

    fn new_module_object(&mut self, name: &str) -> ObjRef {
        self.heap.alloc(ObjKind::Module(ModuleObj { name: name.to_string(), globals: HashMap::new() }))
    }

    /// Compiles and runs `source` as the `__core__` bootstrap module.
    /// Infallible in practice -- `CORE_SOURCE` is fixed at compile time --
    /// errors are returned as a formatted string only so `install_core` can
    /// `expect()` with a readable message rather than panicking blind.
    pub fn run_core_source(&mut self, name: &str, source: &str) -> Result<(), String> {
        let meta = self.compile("<core>", source).map_err(|e| format!("{e:?}"))?;
        let module_ref = self.new_module_object(name);
        self.modules.insert(name.to_string(), module_ref);
        let closure_ref = self.load_meta(meta, module_ref);
        self.execute(closure_ref).map_err(|e| {
            let msg = self.exception_message(e);
            format!("uncaught exception during bootstrap: {msg}")
        })?;
        Ok(())
    }

    /// Compiles and runs `src` as a fresh top-level module named
    /// `module_name`, returning the script's final expression value (or
    /// null) on success.
    pub fn run_source(&mut self, path: &str, src: &str, module_name: &str) -> Result<Value, RunError> {
        let meta = match self.compile(path, src) {
            Ok(m) => m,
            Err(StageError::Parse(errs)) => return Err(RunError::Syntax(errs)),
            Err(StageError::Compile(errs)) => return Err(RunError::Compile(errs)),
        };
        let module_ref = self.new_module_object(module_name);
        self.modules.insert(module_name.to_string(), module_ref);
        let closure_ref = self.load_meta(meta, module_ref);
        match self.execute(closure_ref) {
            Ok(v) => Ok(v),
            Err(exc) => {
                let message = self.exception_message(exc);
                Err(RunError::Runtime { message, trace: self.last_trace.clone() })
            }
        }
    }

    /// Compiles and runs one chunk of REPL input against a persistent
    /// `module_name` module, so top-level `var` declarations from earlier
    /// lines remain visible to later ones (unlike `run_source`, which always
    /// starts a fresh module).
    pub fn run_repl_line(&mut self, path: &str, src: &str, module_name: &str) -> Result<Value, RunError> {
        let meta = match self.compile(path, src) {
            Ok(m) => m,
            Err(StageError::Parse(errs)) => return Err(RunError::Syntax(errs)),
            Err(StageError::Compile(errs)) => return Err(RunError::Compile(errs)),
        };
        let module_ref = match self.modules.get(module_name) {
            Some(&r) => r,
            None => {
                let r = self.new_module_object(module_name);
                self.modules.insert(module_name.to_string(), r);
                r
            }
        };
        let closure_ref = self.load_meta(meta, module_ref);
        match self.execute(closure_ref) {
            Ok(v) => Ok(v),
            Err(exc) => {
                let message = self.exception_message(exc);
                Err(RunError::Runtime { message, trace: self.last_trace.clone() })
            }
        }
    }

    pub fn lookup_core_class(&mut self, name: &str) -> Option<ObjRef> {
        let core_ref = *self.modules.get("__core__")?;
        let v = match &self.heap.get(core_ref).kind {
            ObjKind::Module(m) => m.globals.get(name).copied(),
            _ => None,
        }?;
        match v {
            Value::Object(r) if matches!(self.heap.get(r).kind, ObjKind::Class(_)) => Some(r),
            _ => None,
        }
    }

    pub fn raise(&mut self, class: ObjRef, message: &str) -> Value {
        builtins::make_exception_instance(self, class, message)
    }

    /// Renders an exception value for the embedder (`RunError::Runtime`,
    /// import-wrapping, core-bootstrap failures): an `Exception` instance's
    /// own `_err` field, since generic `stringify` deliberately renders every
    /// instance as `<ClassName instance>` (see its doc comment) and would
    /// otherwise swallow the actual message a `raise`d value carries.
    fn exception_message(&mut self, exc: Value) -> String {
        if let Value::Object(r) = exc {
            if let ObjKind::Instance(i) = &self.heap.get(r).kind {
                if let Some(&err) = i.fields.get("_err") {
                    return self.stringify(err);
                }
            }
        }
        self.stringify(exc)
    }

    pub fn stack_trace_lines(&self) -> Vec<String> {
        if self.frames.is_empty() {
            return self.last_trace.clone();
        }
        self.capture_trace()
    }

    fn capture_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let name = match &self.heap.get(f.closure).kind {
                    ObjKind::Closure(c) => match &self.heap.get(c.function).kind {
                        ObjKind::Function(fo) => fo.name.clone().unwrap_or_else(|| "<script>".to_string()),
                        _ => "?".to_string(),
                    },
                    _ => "?".to_string(),
                };
                let chunk = self.chunk_of(f.closure);
                let line = chunk.line_for(f.ip.saturating_sub(1));
                format!("  at {name} (line {line})")
            })
            .collect()
    }

    // ---- calling convention entry points ---------------------------------------

    /// Runs `callee(args...)` to completion, driving the dispatch loop until
    /// control returns to the frame depth the call started at.
    pub fn call_and_run(&mut self, callee: Value, args: &[Value]) -> Result<Value, Value> {
        let depth = self.frames.len();
        self.stack.push(callee);
        for a in args {
            self.stack.push(*a);
        }
        if let Err(exc) = self.call_value(args.len() as u8) {
            return Err(exc);
        }
        self.run_until(depth)
    }

    fn execute(&mut self, closure_ref: ObjRef) -> Result<Value, Value> {
        self.call_and_run(Value::Object(closure_ref), &[])
    }

    fn run_until(&mut self, depth: usize) -> Result<Value, Value> {
        let saved_floor = self.exec_floor;
        self.exec_floor = depth;
        let result = (|| {
            while self.frames.len() > depth {
                self.step()?;
            }
            Ok(self.stack.pop().unwrap_or(Value::Null))
        })();
        self.exec_floor = saved_floor;
        result
    }

    // ---- module import ----------------------------------------------------

    pub fn import_module(&mut self, name: &str) -> Result<ObjRef, Value> {
        if let Some(&r) = self.modules.get(name) {
            return Ok(r);
        }
        if crate::module::is_builtin_module(name) {
            return Err(self.raise(self.core.import_exception, &format!("built-in module '{name}' is unavailable")));
        }
        if self.loader.begin_loading(name).is_err() {
            return Err(self.raise(self.core.import_exception, &format!("circular import of module '{name}'")));
        }
        let resolved = self.loader.resolve(name);
        let result = match resolved {
            Some((path, src)) => {
                let path_str = path.to_string_lossy().to_string();
                match self.compile_and_run_module(&path_str, &src, name) {
                    Ok(r) => Ok(r),
                    Err(exc) => Err(self.wrap_import_error(name, exc)),
                }
            }
            None => Err(self.raise(self.core.import_exception, &format!("module '{name}' not found"))),
        };
        self.loader.end_loading(name);
        result
    }

    fn wrap_import_error(&mut self, name: &str, inner: Value) -> Value {
        let inner_msg = self.exception_message(inner);
        self.raise(self.core.import_exception, &format!("error importing module '{name}': {inner_msg}"))
    }

    fn compile_and_run_module(&mut self, path: &str, src: &str, module_name: &str) -> Result<ObjRef, Value> {
        let meta = match self.compile(path, src) {
            Ok(m) => m,
            Err(StageError::Parse(errs)) | Err(StageError::Compile(errs)) => {
                let msg = errs.into_iter().map(|(l, m)| format!("{path}:{l}: {m}")).collect::<Vec<_>>().join("\n");
                return Err(self.raise(self.core.syntax_exception, &msg));
            }
        };
        let module_ref = self.new_module_object(module_name);
        self.modules.insert(module_name.to_string(), module_ref);
        let closure_ref = self.load_meta(meta, module_ref);
        self.call_and_run(Value::Object(closure_ref), &[])?;
        Ok(module_ref)
    }

    fn define_current_global(&mut self, name: &str, v: Value) {
        let module_ref = self.frames.last().unwrap().module;
        if let ObjKind::Module(m) = &mut self.heap.get_mut(module_ref).kind {
            m.globals.insert(name.to_string(), v);
        }
    }

    fn resolve_global(&self, module: ObjRef, name: &str) -> Option<Value> {
        if let ObjKind::Module(m) = &self.heap.get(module).kind {
            if let Some(v) = m.globals.get(name) {
                return Some(*v);
            }
        }
        let is_core = matches!(&self.heap.get(module).kind, ObjKind::Module(m) if m.name == "__core__");
        if is_core {
            return None;
        }
        let core_ref = *self.modules.get("__core__")?;
        match &self.heap.get(core_ref).kind {
            ObjKind::Module(m) => m.globals.get(name).copied(),
            _ => None,
        }
    }

    /// Candidate names for an undefined-variable "did you mean" hint: the
    /// module's own globals plus `__core__`'s (the same fallback order
    /// `resolve_global` itself uses).
    fn global_candidates(&self, module: ObjRef) -> Vec<String> {
        let mut names = match &self.heap.get(module).kind {
            ObjKind::Module(m) => m.globals.keys().cloned().collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        if let Some(&core_ref) = self.modules.get("__core__") {
            if core_ref != module {
                if let ObjKind::Module(m) = &self.heap.get(core_ref).kind {
                    names.extend(m.globals.keys().cloned());
                }
            }
        }
        names
    }

    fn resolve_class_name(&self, module: ObjRef, name: &str) -> Option<ObjRef> {
        match self.resolve_global(module, name) {
            Some(Value::Object(r)) if matches!(self.heap.get(r).kind, ObjKind::Class(_)) => Some(r),
            _ => None,
        }
    }

    // ---- GC --------------------------------------------------------------

    fn gc_roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        for v in &self.stack {
            if let Value::Object(r) = v {
                roots.push(*r);
            }
        }
        for f in &self.frames {
            roots.push(f.closure);
        }
        for (_, r) in &self.open_upvalues {
            roots.push(*r);
        }
        for r in self.modules.values() {
            roots.push(*r);
        }
        if let Some(Value::Object(r)) = &self.pending_exception {
            roots.push(*r);
        }
        roots
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let roots = self.gc_roots();
            self.heap.collect(roots);
        }
    }

    // ---- stack helpers ------------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    fn chunk_of(&self, closure: ObjRef) -> &Chunk {
        match &self.heap.get(closure).kind {
            ObjKind::Closure(c) => match &self.heap.get(c.function).kind {
                ObjKind::Function(f) => &f.chunk,
                _ => panic!("chunk_of: not a function"),
            },
            _ => panic!("chunk_of: not a closure"),
        }
    }

    fn const_str(&self, closure: ObjRef, k: u16) -> String {
        match &self.chunk_of(closure).constants[k as usize] {
            Constant::Str(s) => s.clone(),
            other => panic!("const_str: constant {k} is not a string: {other:?}"),
        }
    }

    // ---- upvalues ----------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        if let Some(pos) = self.open_upvalues.iter().position(|&(idx, _)| idx == stack_index) {
            return self.open_upvalues[pos].1;
        }
        let r = self.heap.alloc(ObjKind::Upvalue(UpvalueObj { state: UpvalueState::Open(stack_index) }));
        let insert_at = self.open_upvalues.iter().position(|&(idx, _)| idx > stack_index).unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, (stack_index, r));
        r
    }

    fn close_upvalues_from(&mut self, from: usize) {
        while let Some(&(idx, _)) = self.open_upvalues.last() {
            if idx < from {
                break;
            }
            let (_, r) = self.open_upvalues.pop().unwrap();
            let val = self.stack[idx];
            if let ObjKind::Upvalue(u) = &mut self.heap.get_mut(r).kind {
                u.state = UpvalueState::Closed(val);
            }
        }
    }

    fn upvalue_ref(&self, closure: ObjRef, n: u8) -> ObjRef {
        match &self.heap.get(closure).kind {
            ObjKind::Closure(c) => c.upvalues[n as usize],
            _ => panic!("upvalue_ref: not a closure"),
        }
    }

    fn upvalue_get(&self, uref: ObjRef) -> Value {
        match &self.heap.get(uref).kind {
            ObjKind::Upvalue(u) => match &u.state {
                UpvalueState::Open(idx) => self.stack[*idx],
                UpvalueState::Closed(v) => *v,
            },
            _ => panic!("upvalue_get: not an upvalue"),
        }
    }

    fn upvalue_set(&mut self, uref: ObjRef, value: Value) {
        let idx = match &self.heap.get(uref).kind {
            ObjKind::Upvalue(u) => match &u.state {
                UpvalueState::Open(idx) => Some(*idx),
                UpvalueState::Closed(_) => None,
            },
            _ => panic!("upvalue_set: not an upvalue"),
        };
        match idx {
            Some(idx) => self.stack[idx] = value,
            None => {
                if let ObjKind::Upvalue(u) = &mut self.heap.get_mut(uref).kind {
                    u.state = UpvalueState::Closed(value);
                }
            }
        }
    }

    // ---- exception unwinding ------------------------------------------------

    /// Searches outward from the innermost live frame for a handler that
    /// catches `exc`. On a matching `except` arm, truncates the stack to the
    /// depth recorded when its `SETUP_HANDLER` ran and pushes `exc` (which,
    /// per the compiler's scope bookkeeping, lands exactly at the arm's
    /// bound-variable slot). Falls through to an `ensure` entry point if one
    /// exists with no match; otherwise pops the frame and keeps unwinding.
    /// Returns `Err(exc)` once unwinding would cross `self.exec_floor`.
    fn unwind(&mut self, exc: Value) -> Result<(), Value> {
        loop {
            if self.frames.len() <= self.exec_floor {
                self.last_trace = self.capture_trace();
                return Err(exc);
            }
            let frame_idx = self.frames.len() - 1;
            let handler = self.frames[frame_idx].handlers.pop();
            match handler {
                Some(h) => {
                    let closure = self.frames[frame_idx].closure;
                    let module = self.frames[frame_idx].module;
                    let mut matched_ip: Option<usize> = None;
                    for arm in &h.spec.except_arms {
                        let class_name = self.const_str(closure, arm.class_name);
                        if let Some(class_ref) = self.resolve_class_name(module, &class_name) {
                            if self.value_is_instance_of(exc, class_ref) {
                                matched_ip = Some(arm.target_ip);
                                break;
                            }
                        }
                    }
                    if let Some(target_ip) = matched_ip {
                        self.close_upvalues_from(h.stack_len);
                        self.stack.truncate(h.stack_len);
                        self.stack.push(exc);
                        self.frames[frame_idx].ip = target_ip;
                        return Ok(());
                    } else if let Some(ensure_ip) = h.spec.ensure_ip {
                        self.close_upvalues_from(h.stack_len);
                        self.stack.truncate(h.stack_len);
                        self.pending_exception = Some(exc);
                        self.frames[frame_idx].ip = ensure_ip;
                        return Ok(());
                    }
                    // No arm matched and there is no ensure block: keep
                    // searching this frame's remaining (necessarily
                    // shallower) handlers before popping the frame.
                }
                None => {
                    let done = self.frames.pop().unwrap();
                    self.close_upvalues_from(done.base);
                    self.stack.truncate(done.base.saturating_sub(1));
                }
            }
        }
    }

    fn value_is_instance_of(&self, v: Value, class: ObjRef) -> bool {
        let mut cur = match v {
            Value::Object(r) => match &self.heap.get(r).kind {
                ObjKind::Instance(i) => Some(i.class),
                _ => None,
            },
            _ => None,
        };
        while let Some(c) = cur {
            if c == class {
                return true;
            }
            cur = match &self.heap.get(c).kind {
                ObjKind::Class(co) => co.superclass,
                _ => None,
            };
        }
        false
    }

    fn find_method(&self, class: ObjRef, name: &str) -> Option<ObjRef> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            let (found, superclass) = match &self.heap.get(c).kind {
                ObjKind::Class(co) => (co.methods.get(name).copied(), co.superclass),
                _ => (None, None),
            };
            if let Some(Value::Object(m)) = found {
                return Some(m);
            }
            cur = superclass;
        }
        None
    }

    // ---- table helpers (safe interior mutation without aliasing `heap`) -----

    fn table_get(&self, r: ObjRef, key: &Value) -> Option<Value> {
        match &self.heap.get(r).kind {
            ObjKind::Table(t) => t.get(key, &self.heap),
            _ => None,
        }
    }

    fn table_put(&mut self, r: ObjRef, key: Value, value: Value) {
        let mut table = match &mut self.heap.get_mut(r).kind {
            ObjKind::Table(t) => std::mem::take(t),
            _ => return,
        };
        table.put(key, value, &self.heap);
        if let ObjKind::Table(slot) = &mut self.heap.get_mut(r).kind {
            *slot = table;
        }
    }

    // ---- values ------------------------------------------------------------

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Handle(x), Value::Handle(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => {
                if x == y {
                    return true;
                }
                match (&self.heap.get(x).kind, &self.heap.get(y).kind) {
                    (ObjKind::Str(a), ObjKind::Str(b)) => a.bytes == b.bytes,
                    (ObjKind::Tuple(a), ObjKind::Tuple(b)) => {
                        a.items.len() == b.items.len() && a.items.iter().zip(b.items.iter()).all(|(i, j)| self.values_equal(*i, *j))
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn len_of(&mut self, v: Value) -> Result<usize, Value> {
        let len = match v {
            Value::Object(r) => match &self.heap.get(r).kind {
                ObjKind::Str(s) => Some(s.bytes.chars().count()),
                ObjKind::List(l) => Some(l.items.len()),
                ObjKind::Tuple(t) => Some(t.items.len()),
                ObjKind::Table(t) => Some(t.len()),
                _ => None,
            },
            _ => None,
        };
        match len {
            Some(n) => Ok(n),
            None => Err(self.raise(self.core.type_exception, "value has no length")),
        }
    }

    /// Renders `v` for `print`/`str(...)`: does not invoke a user-defined
    /// `__string__` override, since doing so would require re-entering the
    /// dispatch loop from inside this helper; instances always stringify as
    /// `<ClassName instance>` (accepted simplification, see DESIGN.md).
    pub fn stringify(&mut self, v: Value) -> String {
        match v {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Handle(h) => format!("<handle {h}>"),
            Value::Object(r) => self.stringify_object(r),
        }
    }

    fn stringify_object(&mut self, r: ObjRef) -> String {
        enum Snapshot {
            Str(String),
            List(Vec<Value>),
            Tuple(Vec<Value>),
            Table(Vec<(Value, Value)>),
            Class(String),
            Instance(String),
            Function(Option<String>),
            Native(String),
            Module(String),
            BoundMethod,
            Other,
        }
        let snap = match &self.heap.get(r).kind {
            ObjKind::Str(s) => Snapshot::Str(s.bytes.clone()),
            ObjKind::List(l) => Snapshot::List(l.items.clone()),
            ObjKind::Tuple(t) => Snapshot::Tuple(t.items.to_vec()),
            ObjKind::Table(t) => Snapshot::Table(t.iter().map(|(k, v)| (*k, *v)).collect()),
            ObjKind::Class(c) => Snapshot::Class(c.name.clone()),
            ObjKind::Instance(i) => {
                let name = match &self.heap.get(i.class).kind {
                    ObjKind::Class(c) => c.name.clone(),
                    _ => "?".to_string(),
                };
                Snapshot::Instance(name)
            }
            ObjKind::Function(f) => Snapshot::Function(f.name.clone()),
            ObjKind::Closure(c) => {
                let name = match &self.heap.get(c.function).kind {
                    ObjKind::Function(f) => f.name.clone(),
                    _ => None,
                };
                Snapshot::Function(name)
            }
            ObjKind::Native(n) => Snapshot::Native(n.name.clone()),
            ObjKind::Module(m) => Snapshot::Module(m.name.clone()),
            ObjKind::BoundMethod(_) => Snapshot::BoundMethod,
            _ => Snapshot::Other,
        };
        match snap {
            Snapshot::Str(s) => s,
            Snapshot::List(items) => {
                let parts: Vec<String> = items.into_iter().map(|v| self.stringify(v)).collect();
                format!("[{}]", parts.join(", "))
            }
            Snapshot::Tuple(items) => {
                let parts: Vec<String> = items.into_iter().map(|v| self.stringify(v)).collect();
                format!("({})", parts.join(", "))
            }
            Snapshot::Table(pairs) => {
                let parts: Vec<String> = pairs.into_iter().map(|(k, v)| format!("{}: {}", self.stringify(k), self.stringify(v))).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Snapshot::Class(name) => format!("<class {name}>"),
            Snapshot::Instance(name) => format!("<{name} instance>"),
            Snapshot::Function(name) => format!("<fn {}>", name.unwrap_or_else(|| "anonymous".to_string())),
            Snapshot::Native(name) => format!("<native fn {name}>"),
            Snapshot::Module(name) => format!("<module {name}>"),
            Snapshot::BoundMethod => "<bound method>".to_string(),
            Snapshot::Other => "<object>".to_string(),
        }
    }

    // ---- field / index access ----------------------------------------------

    /// Appends " (did you mean 'x'?)" when `name` is a near-miss of one of
    /// `candidates` (spec.md §4.2's error callback; the teacher's
    /// Levenshtein-distance helper, reused here for `NameException`/
    /// `FieldException` messages).
    fn did_you_mean(name: &str, candidates: impl Iterator<Item = String>) -> String {
        let pool: Vec<String> = candidates.collect();
        match find_closest_match(name, &pool) {
            Some(m) => format!(" (did you mean '{m}'?)"),
            None => String::new(),
        }
    }

    fn get_field(&mut self, obj: Value, name: &str) -> Result<Value, Value> {
        if let Value::Object(r) = obj {
            enum Tag {
                Instance(ObjRef, Option<Value>),
                Module,
                Class,
                Other,
            }
            let tag = match &self.heap.get(r).kind {
                ObjKind::Instance(i) => Tag::Instance(i.class, i.fields.get(name).copied()),
                ObjKind::Module(_) => Tag::Module,
                ObjKind::Class(_) => Tag::Class,
                _ => Tag::Other,
            };
            match tag {
                Tag::Module => {
                    let found = match &self.heap.get(r).kind {
                        ObjKind::Module(m) => m.globals.get(name).copied(),
                        _ => None,
                    };
                    if let Some(v) = found {
                        return Ok(v);
                    }
                }
                Tag::Instance(class_ref, field_val) => {
                    if let Some(v) = field_val {
                        return Ok(v);
                    }
                    if let Some(method_ref) = self.find_method(class_ref, name) {
                        let bound = self.heap.alloc(ObjKind::BoundMethod(BoundMethodObj { receiver: obj, method: method_ref }));
                        return Ok(Value::Object(bound));
                    }
                }
                Tag::Class => {
                    if let Some(method_ref) = self.find_method(r, name) {
                        return Ok(Value::Object(method_ref));
                    }
                }
                Tag::Other => {}
            }
        }
        let type_name = obj.type_name(&self.heap);
        let hint = Self::did_you_mean(name, self.field_candidates(obj).into_iter());
        Err(self.raise(self.core.field_exception, &format!("'{type_name}' has no field '{name}'{hint}")))
    }

    /// Field/method names a `GET_FIELD` miss on `obj` could plausibly have
    /// meant, for the "did you mean" hint above: an instance's own fields
    /// plus every method up its class chain, or a module's globals.
    fn field_candidates(&self, obj: Value) -> Vec<String> {
        let Value::Object(r) = obj else { return Vec::new() };
        match &self.heap.get(r).kind {
            ObjKind::Instance(i) => {
                let mut names: Vec<String> = i.fields.keys().cloned().collect();
                let mut cur = Some(i.class);
                while let Some(c) = cur {
                    match &self.heap.get(c).kind {
                        ObjKind::Class(co) => {
                            names.extend(co.methods.keys().cloned());
                            cur = co.superclass;
                        }
                        _ => break,
                    }
                }
                names
            }
            ObjKind::Module(m) => m.globals.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn set_field(&mut self, obj: Value, name: &str, value: Value) -> Result<(), Value> {
        if let Value::Object(r) = obj {
            let tag = match &self.heap.get(r).kind {
                ObjKind::Instance(_) => 1,
                ObjKind::Module(_) => 2,
                _ => 0,
            };
            match tag {
                1 => {
                    if let ObjKind::Instance(i) = &mut self.heap.get_mut(r).kind {
                        i.fields.insert(name.to_string(), value);
                    }
                    return Ok(());
                }
                2 => {
                    if let ObjKind::Module(m) = &mut self.heap.get_mut(r).kind {
                        m.globals.insert(name.to_string(), value);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        let type_name = obj.type_name(&self.heap);
        Err(self.raise(self.core.field_exception, &format!("cannot set field '{name}' on {type_name}")))
    }

    fn index_bounds(len: usize, i: f64) -> Option<usize> {
        let mut i = i as i64;
        if i < 0 {
            i += len as i64;
        }
        if i < 0 || i as usize >= len {
            None
        } else {
            Some(i as usize)
        }
    }

    fn get_index(&mut self, obj: Value, idx: Value) -> Result<Value, Value> {
        if let Value::Object(r) = obj {
            enum Tag {
                List(usize),
                Tuple(usize),
                Str(usize),
                Table,
                Other,
            }
            let tag = match &self.heap.get(r).kind {
                ObjKind::List(l) => Tag::List(l.items.len()),
                ObjKind::Tuple(t) => Tag::Tuple(t.items.len()),
                ObjKind::Str(s) => Tag::Str(s.bytes.chars().count()),
                ObjKind::Table(_) => Tag::Table,
                _ => Tag::Other,
            };
            match tag {
                Tag::Table => return Ok(self.table_get(r, &idx).unwrap_or(Value::Null)),
                Tag::List(len) | Tag::Tuple(len) | Tag::Str(len) => {
                    let n = match idx {
                        Value::Number(n) => n,
                        _ => return Err(self.raise(self.core.type_exception, "index must be a Number")),
                    };
                    let i = match Self::index_bounds(len, n) {
                        Some(i) => i,
                        None => return Err(self.raise(self.core.index_out_of_bound_exception, &format!("index {n} out of bounds (len {len})"))),
                    };
                    return match &self.heap.get(r).kind {
                        ObjKind::List(l) => Ok(l.items[i]),
                        ObjKind::Tuple(t) => Ok(t.items[i]),
                        ObjKind::Str(s) => {
                            let ch = s.bytes.chars().nth(i).unwrap().to_string();
                            let rr = self.heap.alloc_string(ch);
                            Ok(Value::Object(rr))
                        }
                        _ => unreachable!(),
                    };
                }
                Tag::Other => {}
            }
        }
        Err(self.raise(self.core.type_exception, "value is not indexable"))
    }

    fn set_index(&mut self, obj: Value, idx: Value, value: Value) -> Result<(), Value> {
        if let Value::Object(r) = obj {
            let tag = match &self.heap.get(r).kind {
                ObjKind::List(_) => 1,
                ObjKind::Table(_) => 2,
                ObjKind::Tuple(_) => 3,
                ObjKind::Str(_) => 3,
                _ => 0,
            };
            match tag {
                1 => {
                    let len = match &self.heap.get(r).kind {
                        ObjKind::List(l) => l.items.len(),
                        _ => unreachable!(),
                    };
                    let n = match idx {
                        Value::Number(n) => n,
                        _ => return Err(self.raise(self.core.type_exception, "index must be a Number")),
                    };
                    let i = match Self::index_bounds(len, n) {
                        Some(i) => i,
                        None => return Err(self.raise(self.core.index_out_of_bound_exception, &format!("index {n} out of bounds (len {len})"))),
                    };
                    if let ObjKind::List(l) = &mut self.heap.get_mut(r).kind {
                        l.items[i] = value;
                    }
                    return Ok(());
                }
                2 => {
                    self.table_put(r, idx, value);
                    return Ok(());
                }
                3 => return Err(self.raise(self.core.type_exception, "value does not support item assignment")),
                _ => {}
            }
        }
        Err(self.raise(self.core.type_exception, "value is not indexable"))
    }

    // ---- calling convention -------------------------------------------------

    fn call_value(&mut self, arg_count: u8) -> Result<(), Value> {
        let argc = arg_count as usize;
        let call_start = self.stack.len() - 1 - argc;
        let callee = self.stack[call_start];
        match callee {
            Value::Object(r) => {
                enum Tag {
                    Closure,
                    Native,
                    BoundMethod,
                    Class,
                    Other,
                }
                let tag = match &self.heap.get(r).kind {
                    ObjKind::Closure(_) => Tag::Closure,
                    ObjKind::Native(_) => Tag::Native,
                    ObjKind::BoundMethod(_) => Tag::BoundMethod,
                    ObjKind::Class(_) => Tag::Class,
                    _ => Tag::Other,
                };
                match tag {
                    Tag::Closure => self.call_closure(r, call_start, argc),
                    Tag::Native => self.call_native(r, call_start, argc),
                    Tag::BoundMethod => self.call_bound_method(r, call_start, argc),
                    Tag::Class => self.call_class(r, call_start, argc),
                    Tag::Other => {
                        let type_name = callee.type_name(&self.heap);
                        Err(self.raise(self.core.type_exception, &format!("'{type_name}' is not callable")))
                    }
                }
            }
            _ => {
                let type_name = callee.type_name(&self.heap);
                Err(self.raise(self.core.type_exception, &format!("'{type_name}' is not callable")))
            }
        }
    }

    fn function_of(&self, closure: ObjRef) -> ObjRef {
        match &self.heap.get(closure).kind {
            ObjKind::Closure(c) => c.function,
            _ => panic!("function_of: not a closure"),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, call_start: usize, argc: usize) -> Result<(), Value> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.raise(self.core.stack_overflow_exception, "stack overflow"));
        }
        let function_ref = self.function_of(closure);
        let (arity, default_count, is_vararg, defaults, module) = match &self.heap.get(function_ref).kind {
            ObjKind::Function(f) => (f.arity, f.default_count, f.is_vararg, f.defaults.clone(), f.module),
            _ => panic!("call_closure: not a function"),
        };
        self.adjust_args(call_start, argc, arity, default_count, is_vararg, &defaults)?;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: call_start + 1,
            module,
            handlers: Vec::new(),
            ctor_result: None,
        });
        Ok(())
    }

    /// Validates argument count and fills in missing default-valued and
    /// vararg-tuple parameters so the stack above `call_start` ends up
    /// exactly `arity + default_count + (1 if vararg)` values wide.
    fn adjust_args(
        &mut self,
        call_start: usize,
        argc: usize,
        arity: u8,
        default_count: u8,
        is_vararg: bool,
        defaults: &[DefaultLit],
    ) -> Result<(), Value> {
        let arity = arity as usize;
        let default_count = default_count as usize;
        let max_fixed = arity + default_count;
        if argc < arity {
            return Err(self.raise(self.core.invalid_arg_exception, &format!("expected at least {arity} argument(s), got {argc}")));
        }
        if !is_vararg && argc > max_fixed {
            return Err(self.raise(self.core.invalid_arg_exception, &format!("expected at most {max_fixed} argument(s), got {argc}")));
        }
        if argc < max_fixed {
            for lit in &defaults[argc.saturating_sub(arity)..] {
                let v = self.default_value(lit);
                self.stack.push(v);
            }
        }
        if is_vararg {
            let fixed_end = call_start + 1 + max_fixed;
            let extra: Vec<Value> = if self.stack.len() > fixed_end { self.stack.split_off(fixed_end) } else { Vec::new() };
            let tuple_ref = self.heap.alloc(ObjKind::Tuple(TupleObj { items: extra.into_boxed_slice() }));
            self.stack.push(Value::Object(tuple_ref));
        }
        Ok(())
    }

    fn default_value(&mut self, lit: &DefaultLit) -> Value {
        match lit {
            DefaultLit::Null => Value::Null,
            DefaultLit::Bool(b) => Value::Bool(*b),
            DefaultLit::Number(n) => Value::Number(*n),
            DefaultLit::Str(s) => Value::Object(self.heap.alloc_string(s.clone())),
        }
    }

    fn call_native(&mut self, native: ObjRef, call_start: usize, argc: usize) -> Result<(), Value> {
        let (func, arity, is_vararg) = match &self.heap.get(native).kind {
            ObjKind::Native(n) => (n.func, n.arity as usize, n.is_vararg),
            _ => panic!("call_native: not a native"),
        };
        if argc < arity || (!is_vararg && argc > arity) {
            return Err(self.raise(self.core.invalid_arg_exception, &format!("expected {arity} argument(s), got {argc}")));
        }
        let args: Vec<Value> = self.stack[call_start + 1..].to_vec();
        self.stack.truncate(call_start);
        let result = func(self, &args)?;
        self.push(result);
        Ok(())
    }

    fn call_bound_method(&mut self, bound: ObjRef, call_start: usize, argc: usize) -> Result<(), Value> {
        let (receiver, method) = match &self.heap.get(bound).kind {
            ObjKind::BoundMethod(b) => (b.receiver, b.method),
            _ => panic!("call_bound_method: not a bound method"),
        };
        self.stack[call_start] = Value::Object(method);
        self.stack.insert(call_start + 1, receiver);
        self.call_closure(method, call_start, argc + 1)
    }

    fn call_class(&mut self, class: ObjRef, call_start: usize, argc: usize) -> Result<(), Value> {
        let instance_ref = self.heap.alloc(ObjKind::Instance(InstanceObj { class, fields: HashMap::new() }));
        self.heap.get_mut(instance_ref).class = Some(class);
        let init = self.find_method(class, "init");
        match init {
            Some(method) => {
                self.stack[call_start] = Value::Object(method);
                self.stack.insert(call_start + 1, Value::Object(instance_ref));
                self.call_closure(method, call_start, argc + 1)?;
                self.frames.last_mut().unwrap().ctor_result = Some(instance_ref);
                Ok(())
            }
            None => {
                if argc != 0 {
                    return Err(self.raise(self.core.invalid_arg_exception, "class has no 'init' and takes no arguments"));
                }
                self.stack.truncate(call_start);
                self.push(Value::Object(instance_ref));
                Ok(())
            }
        }
    }

    // ---- method invocation ---------------------------------------------------

    fn invoke(&mut self, call_start: usize, name: &str, argc: usize) -> Result<(), Value> {
        let receiver = self.stack[call_start];
        if let Value::Object(r) = receiver {
            if self.invoke_builtin_kind(r, name, call_start, argc)?.is_some() {
                return Ok(());
            }
            let (class_ref, field_val) = match &self.heap.get(r).kind {
                ObjKind::Instance(i) => (Some(i.class), i.fields.get(name).copied()),
                ObjKind::Class(_) => (Some(r), None),
                _ => (None, None),
            };
            if let Some(callable) = field_val {
                self.stack[call_start] = callable;
                return self.call_value(argc as u8);
            }
            if let Some(class_ref) = class_ref {
                if let Some(method) = self.find_method(class_ref, name) {
                    self.stack[call_start] = Value::Object(method);
                    self.stack.insert(call_start + 1, receiver);
                    return self.call_closure(method, call_start, argc + 1);
                }
            }
            if let ObjKind::Module(_) = &self.heap.get(r).kind {
                let found = match &self.heap.get(r).kind {
                    ObjKind::Module(m) => m.globals.get(name).copied(),
                    _ => None,
                };
                if let Some(callable) = found {
                    self.stack[call_start] = callable;
                    return self.call_value(argc as u8);
                }
            }
        }
        Err(self.raise(self.core.method_exception, &format!("no method '{name}'")))
    }

    /// Fast path for `__iter__`/`__next__` on List/Tuple/String/Table,
    /// backing `foreach` without allocating a bound method per iteration.
    /// State is the index of the last element handed out (`null` before the
    /// first). Returns `Ok(Some(()))` if it handled the call.
    fn invoke_builtin_kind(&mut self, r: ObjRef, name: &str, call_start: usize, argc: usize) -> Result<Option<()>, Value> {
        let len = match &self.heap.get(r).kind {
            ObjKind::List(l) => Some(l.items.len()),
            ObjKind::Tuple(t) => Some(t.items.len()),
            ObjKind::Str(s) => Some(s.bytes.chars().count()),
            ObjKind::Table(t) => Some(t.len()),
            _ => None,
        };
        let Some(len) = len else { return Ok(None) };
        match name {
            "__iter__" if argc == 1 => {
                let state = self.stack[call_start + 1];
                let next_idx = match state {
                    Value::Null => 0usize,
                    Value::Number(n) => n as usize + 1,
                    _ => return Err(self.raise(self.core.type_exception, "invalid iterator state")),
                };
                self.stack.truncate(call_start);
                self.push(if next_idx < len { Value::Number(next_idx as f64) } else { Value::Bool(false) });
                Ok(Some(()))
            }
            "__next__" if argc == 1 => {
                let state = self.stack[call_start + 1];
                let idx = match state {
                    Value::Number(n) => n as usize,
                    _ => return Err(self.raise(self.core.type_exception, "invalid iterator state")),
                };
                let out = match &self.heap.get(r).kind {
                    ObjKind::List(l) => l.items.get(idx).copied().unwrap_or(Value::Null),
                    ObjKind::Tuple(t) => t.items.get(idx).copied().unwrap_or(Value::Null),
                    ObjKind::Str(s) => match s.bytes.chars().nth(idx) {
                        Some(c) => {
                            let rr = self.heap.alloc_string(c.to_string());
                            Value::Object(rr)
                        }
                        None => Value::Null,
                    },
                    ObjKind::Table(t) => t.iter().nth(idx).map(|(k, _)| *k).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                self.stack.truncate(call_start);
                self.push(out);
                Ok(Some(()))
            }
            "contains" if argc == 1 => {
                let found = match &self.heap.get(r).kind {
                    ObjKind::Table(t) => {
                        let key = self.stack[call_start + 1];
                        t.contains(&key, &self.heap)
                    }
                    _ => return Ok(None),
                };
                self.stack.truncate(call_start);
                self.push(Value::Bool(found));
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    fn super_invoke(&mut self, k: u16, argc: u8) -> Result<(), Value> {
        let frame_closure = self.frames.last().unwrap().closure;
        let argc = argc as usize;
        let call_start = self.stack.len() - 1 - argc;
        let receiver = self.stack[call_start];
        let name = self.const_str(frame_closure, k);
        let function_ref = self.function_of(frame_closure);
        let home_class = match &self.heap.get(function_ref).kind {
            ObjKind::Function(f) => f.home_class,
            _ => None,
        };
        let search_from = home_class.and_then(|hc| match &self.heap.get(hc).kind {
            ObjKind::Class(c) => c.superclass,
            _ => None,
        });
        let method_ref = search_from.and_then(|sc| self.find_method(sc, &name));
        match method_ref {
            Some(m) => {
                self.stack[call_start] = Value::Object(m);
                self.stack.insert(call_start + 1, receiver);
                self.call_closure(m, call_start, argc + 1)
            }
            None => Err(self.raise(self.core.method_exception, &format!("no super method '{name}'"))),
        }
    }

    // ---- return / arithmetic ------------------------------------------------

    fn do_return(&mut self) {
        let result = self.pop();
        let frame = self.frames.pop().unwrap();
        self.close_upvalues_from(frame.base);
        self.stack.truncate(frame.base - 1);
        let result = match frame.ctor_result {
            Some(instance_ref) => Value::Object(instance_ref),
            None => result,
        };
        self.push(result);
    }

    fn concat(&mut self, ra: ObjRef, rb: ObjRef) -> Result<(), Value> {
        enum K {
            Str(String, String),
            List(Vec<Value>, Vec<Value>),
            Tuple(Vec<Value>, Vec<Value>),
            Mismatch,
        }
        let k = match (&self.heap.get(ra).kind, &self.heap.get(rb).kind) {
            (ObjKind::Str(a), ObjKind::Str(b)) => K::Str(a.bytes.clone(), b.bytes.clone()),
            (ObjKind::List(a), ObjKind::List(b)) => K::List(a.items.clone(), b.items.clone()),
            (ObjKind::Tuple(a), ObjKind::Tuple(b)) => K::Tuple(a.items.to_vec(), b.items.to_vec()),
            _ => K::Mismatch,
        };
        match k {
            K::Str(a, b) => {
                let r = self.heap.alloc_string(a + &b);
                self.push(Value::Object(r));
                Ok(())
            }
            K::List(mut a, b) => {
                a.extend(b);
                let r = self.heap.alloc(ObjKind::List(ListObj { items: a }));
                self.push(Value::Object(r));
                Ok(())
            }
            K::Tuple(mut a, b) => {
                a.extend(b);
                let r = self.heap.alloc(ObjKind::Tuple(TupleObj { items: a.into_boxed_slice() }));
                self.push(Value::Object(r));
                Ok(())
            }
            K::Mismatch => Err(self.raise(self.core.type_exception, "unsupported operand types for '+'")),
        }
    }

    fn binary_numeric(&mut self, op_add: bool, op_sub: bool, op_mul: bool, op_div: bool, op_mod: bool, op_pow: bool) -> Result<(), Value> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let r = if op_add {
                    x + y
                } else if op_sub {
                    x - y
                } else if op_mul {
                    x * y
                } else if op_div {
                    x / y
                } else if op_mod {
                    x.rem_euclid(y)
                } else if op_pow {
                    x.powf(y)
                } else {
                    unreachable!()
                };
                self.push(Value::Number(r));
                Ok(())
            }
            (Value::Object(ra), Value::Object(rb)) if op_add => self.concat(ra, rb),
            _ => Err(self.raise(self.core.type_exception, "unsupported operand types for arithmetic")),
        }
    }

    fn compare(&mut self, lt: bool, le: bool, gt: bool, ge: bool) -> Result<(), Value> {
        let b = self.pop();
        let a = self.pop();
        let ord = match (a, b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(&y),
            (Value::Object(ra), Value::Object(rb)) => match (&self.heap.get(ra).kind, &self.heap.get(rb).kind) {
                (ObjKind::Str(x), ObjKind::Str(y)) => Some(x.bytes.cmp(&y.bytes)),
                _ => None,
            },
            _ => None,
        };
        let Some(ord) = ord else {
            return Err(self.raise(self.core.type_exception, "values are not ordered"));
        };
        let result = if lt {
            ord.is_lt()
        } else if le {
            ord.is_le()
        } else if gt {
            ord.is_gt()
        } else if ge {
            ord.is_ge()
        } else {
            unreachable!()
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    // ---- dispatch loop -------------------------------------------------------

    fn step(&mut self) -> Result<(), Value> {
        self.maybe_collect();
        let frame_idx = self.frames.len() - 1;
        let closure = self.frames[frame_idx].closure;
        let ip = self.frames[frame_idx].ip;
        let op = self.chunk_of(closure).instructions[ip].clone();
        self.frames[frame_idx].ip = ip + 1;

        match op {
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                self.push(self.peek(0));
            }
            OpCode::Null => self.push(Value::Null),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Const(k) => {
                let v = match &self.chunk_of(closure).constants[k as usize] {
                    Constant::Number(n) => Value::Number(*n),
                    Constant::Str(_) => Value::Object(self.heap.intern(&self.const_str(closure, k))),
                    Constant::Function(_) => panic!("Const: function constants are only loaded via MakeClosure"),
                };
                self.push(v);
            }
            OpCode::Add => self.binary_numeric(true, false, false, false, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Sub => self.binary_numeric(false, true, false, false, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Mul => self.binary_numeric(false, false, true, false, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Div => self.binary_numeric(false, false, false, true, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Mod => self.binary_numeric(false, false, false, false, true, false).or_else(|e| self.unwind(e))?,
            OpCode::Pow => self.binary_numeric(false, false, false, false, false, true).or_else(|e| self.unwind(e))?,
            OpCode::Neg => {
                let v = self.pop();
                match v {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    _ => {
                        let exc = self.raise(self.core.type_exception, "unary '-' requires a Number");
                        self.unwind(exc)?;
                    }
                }
            }
            OpCode::Eq => {
                let b = self.pop();
                let a = self.pop();
                let r = self.values_equal(a, b);
                self.push(Value::Bool(r));
            }
            OpCode::Neq => {
                let b = self.pop();
                let a = self.pop();
                let r = !self.values_equal(a, b);
                self.push(Value::Bool(r));
            }
            OpCode::Lt => self.compare(true, false, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Le => self.compare(false, true, false, false).or_else(|e| self.unwind(e))?,
            OpCode::Gt => self.compare(false, false, true, false).or_else(|e| self.unwind(e))?,
            OpCode::Ge => self.compare(false, false, false, true).or_else(|e| self.unwind(e))?,
            OpCode::Is => {
                let b = self.pop();
                let a = self.pop();
                let result = match b {
                    Value::Object(cr) if matches!(self.heap.get(cr).kind, ObjKind::Class(_)) => self.value_is_instance_of(a, cr),
                    _ => false,
                };
                self.push(Value::Bool(result));
            }
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(!crate::bytecode::is_truthy(&v)));
            }
            OpCode::Len => {
                let v = self.pop();
                match self.len_of(v) {
                    Ok(n) => self.push(Value::Number(n as f64)),
                    Err(e) => self.unwind(e)?,
                }
            }
            OpCode::Stringify => {
                let v = self.pop();
                let s = self.stringify(v);
                let r = self.heap.alloc_string(s);
                self.push(Value::Object(r));
            }
            OpCode::LoadLocal(n) => {
                let base = self.frames[frame_idx].base;
                self.push(self.stack[base + n as usize]);
            }
            OpCode::StoreLocal(n) => {
                let base = self.frames[frame_idx].base;
                let v = self.pop();
                self.stack[base + n as usize] = v;
            }
            OpCode::LoadUpvalue(n) => {
                let uref = self.upvalue_ref(closure, n);
                self.push(self.upvalue_get(uref));
            }
            OpCode::StoreUpvalue(n) => {
                let uref = self.upvalue_ref(closure, n);
                let v = self.pop();
                self.upvalue_set(uref, v);
            }
            OpCode::LoadGlobal(k) => {
                let name = self.const_str(closure, k);
                let module = self.frames[frame_idx].module;
                match self.resolve_global(module, &name) {
                    Some(v) => self.push(v),
                    None => {
                        let hint = Self::did_you_mean(&name, self.global_candidates(module).into_iter());
                        let exc = self.raise(self.core.name_exception, &format!("undefined variable '{name}'{hint}"));
                        self.unwind(exc)?;
                    }
                }
            }
            OpCode::StoreGlobal(k) => {
                let name = self.const_str(closure, k);
                let module = self.frames[frame_idx].module;
                let exists = matches!(&self.heap.get(module).kind, ObjKind::Module(m) if m.globals.contains_key(&name));
                if !exists {
                    let hint = Self::did_you_mean(&name, self.global_candidates(module).into_iter());
                    let exc = self.raise(self.core.name_exception, &format!("undefined variable '{name}'{hint}"));
                    self.unwind(exc)?;
                } else {
                    let v = self.peek(0);
                    if let ObjKind::Module(m) = &mut self.heap.get_mut(module).kind {
                        m.globals.insert(name, v);
                    }
                    self.pop();
                }
            }
            OpCode::DefineGlobal(k) => {
                let name = self.const_str(closure, k);
                let module = self.frames[frame_idx].module;
                let v = self.pop();
                if let ObjKind::Module(m) = &mut self.heap.get_mut(module).kind {
                    m.globals.insert(name, v);
                }
            }
            OpCode::GetField(k) => {
                let name = self.const_str(closure, k);
                let obj = self.pop();
                match self.get_field(obj, &name) {
                    Ok(v) => self.push(v),
                    Err(e) => self.unwind(e)?,
                }
            }
            OpCode::SetField(k) => {
                let name = self.const_str(closure, k);
                let obj = self.pop();
                let value = self.pop();
                if let Err(e) = self.set_field(obj, &name, value) {
                    self.unwind(e)?;
                }
            }
            OpCode::GetIndex => {
                let idx = self.pop();
                let obj = self.pop();
                match self.get_index(obj, idx) {
                    Ok(v) => self.push(v),
                    Err(e) => self.unwind(e)?,
                }
            }
            OpCode::SetIndex => {
                let idx = self.pop();
                let obj = self.pop();
                let value = self.pop();
                if let Err(e) = self.set_index(obj, idx, value) {
                    self.unwind(e)?;
                }
            }
            OpCode::Jmp(t) => self.frames[frame_idx].ip = t,
            OpCode::JmpTrue(t) => {
                if crate::bytecode::is_truthy(&self.peek(0)) {
                    self.frames[frame_idx].ip = t;
                }
            }
            OpCode::JmpFalse(t) => {
                if !crate::bytecode::is_truthy(&self.peek(0)) {
                    self.frames[frame_idx].ip = t;
                }
            }
            OpCode::JmpPopFalse(t) => {
                let v = self.pop();
                if !crate::bytecode::is_truthy(&v) {
                    self.frames[frame_idx].ip = t;
                }
            }
            OpCode::Call(argc) => {
                if let Err(e) = self.call_value(argc) {
                    self.unwind(e)?;
                }
            }
            OpCode::Invoke(k, argc) => {
                let name = self.const_str(closure, k);
                let argc = argc as usize;
                let call_start = self.stack.len() - 1 - argc;
                if let Err(e) = self.invoke(call_start, &name, argc) {
                    self.unwind(e)?;
                }
            }
            OpCode::SuperInvoke(k, argc) => {
                if let Err(e) = self.super_invoke(k, argc) {
                    self.unwind(e)?;
                }
            }
            OpCode::Return => self.do_return(),
            OpCode::MakeClosure(k, upvalue_descs) => {
                let function_ref = match &self.chunk_of(closure).constants[k as usize] {
                    Constant::Function(idx) => {
                        let meta = self.chunk_of(closure).functions[*idx].clone();
                        let module = self.frames[frame_idx].module;
                        self.heap.alloc(ObjKind::Function(FunctionObj {
                            name: meta.name,
                            arity: meta.arity,
                            default_count: meta.default_count,
                            is_vararg: meta.is_vararg,
                            upvalue_count: meta.upvalue_count,
                            upvalues: meta.upvalues,
                            chunk: meta.chunk,
                            module,
                            home_class: None,
                            defaults: meta.defaults,
                        }))
                    }
                    _ => panic!("MakeClosure: constant is not a function prototype"),
                };
                let base = self.frames[frame_idx].base;
                let mut upvalues = Vec::with_capacity(upvalue_descs.len());
                for desc in &upvalue_descs {
                    let uref = if desc.is_local {
                        self.capture_upvalue(base + desc.index as usize)
                    } else {
                        self.upvalue_ref(closure, desc.index)
                    };
                    upvalues.push(uref);
                }
                let closure_ref = self.heap.alloc(ObjKind::Closure(ClosureObj { function: function_ref, upvalues }));
                self.push(Value::Object(closure_ref));
            }
            OpCode::CloseUpvalue(_) => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.pop();
            }
            OpCode::NewList => {
                let r = self.heap.alloc(ObjKind::List(ListObj { items: Vec::new() }));
                self.push(Value::Object(r));
            }
            OpCode::ListAppend => {
                let v = self.pop();
                if let Value::Object(r) = self.peek(0) {
                    if let ObjKind::List(l) = &mut self.heap.get_mut(r).kind {
                        l.items.push(v);
                    }
                }
            }
            OpCode::NewTuple(n) => {
                let n = n as usize;
                let start = self.stack.len() - n;
                let items: Vec<Value> = self.stack.split_off(start);
                let r = self.heap.alloc(ObjKind::Tuple(TupleObj { items: items.into_boxed_slice() }));
                self.push(Value::Object(r));
            }
            OpCode::NewTable => {
                let r = self.heap.alloc(ObjKind::Table(TableObj::new()));
                self.push(Value::Object(r));
            }
            OpCode::TablePut => {
                let v = self.pop();
                let k = self.pop();
                if let Value::Object(r) = self.peek(0) {
                    self.table_put(r, k, v);
                }
            }
            OpCode::NewClass(k) => {
                let name = self.const_str(closure, k);
                let r = self.heap.alloc(ObjKind::Class(ClassObj { name, superclass: None, methods: HashMap::new() }));
                self.push(Value::Object(r));
            }
            OpCode::Inherit => {
                let sup = self.pop();
                let sup_ref = match sup {
                    Value::Object(r) if matches!(self.heap.get(r).kind, ObjKind::Class(_)) => r,
                    _ => {
                        let exc = self.raise(self.core.type_exception, "superclass must be a class");
                        self.unwind(exc)?;
                        return Ok(());
                    }
                };
                if let Value::Object(class_ref) = self.peek(0) {
                    if let ObjKind::Class(c) = &mut self.heap.get_mut(class_ref).kind {
                        c.superclass = Some(sup_ref);
                    }
                }
            }
            OpCode::DefineMethod(k) => {
                let name = self.const_str(closure, k);
                let method_val = self.pop();
                if let (Value::Object(method_ref), Value::Object(class_ref)) = (method_val, self.peek(0)) {
                    let function_ref = match &self.heap.get(method_ref).kind {
                        ObjKind::Closure(c) => c.function,
                        _ => panic!("DefineMethod: not a closure"),
                    };
                    if let ObjKind::Function(f) = &mut self.heap.get_mut(function_ref).kind {
                        f.home_class = Some(class_ref);
                    }
                    if let ObjKind::Class(c) = &mut self.heap.get_mut(class_ref).kind {
                        c.methods.insert(name, method_val);
                    }
                }
            }
            OpCode::DefineNative(_) => {
                unreachable!("DefineNative is never emitted; natives are registered from Rust (see builtins.rs)")
            }
            OpCode::SetupHandler(spec) => {
                let stack_len = self.stack.len();
                self.frames[frame_idx].handlers.push(ActiveHandler { spec, stack_len });
            }
            OpCode::PopHandler => {
                self.frames[frame_idx].handlers.pop();
            }
            OpCode::Raise => {
                let exc = self.pop();
                self.unwind(exc)?;
            }
            OpCode::EndEnsure => {
                if let Some(exc) = self.pending_exception.take() {
                    self.unwind(exc)?;
                }
            }
            OpCode::Import(k) => {
                let name = self.const_str(closure, k);
                match self.import_module(&name) {
                    Ok(module_ref) => {
                        let leaf = ModuleLoader::leaf_name(&name).to_string();
                        self.define_current_global(&leaf, Value::Object(module_ref));
                        self.push(Value::Object(module_ref));
                    }
                    Err(e) => self.unwind(e)?,
                }
            }
            OpCode::ImportAs(k, ak) => {
                let name = self.const_str(closure, k);
                let alias = self.const_str(closure, ak);
                match self.import_module(&name) {
                    Ok(module_ref) => {
                        self.define_current_global(&alias, Value::Object(module_ref));
                        self.push(Value::Object(module_ref));
                    }
                    Err(e) => self.unwind(e)?,
                }
            }
            OpCode::ImportFrom(k) => {
                let combined = self.const_str(closure, k);
                let module_name = ModuleLoader::parent_name(&combined).unwrap_or(&combined).to_string();
                let symbol = ModuleLoader::leaf_name(&combined).to_string();
                match self.import_module(&module_name) {
                    Ok(module_ref) => {
                        let val = self.resolve_global(module_ref, &symbol).unwrap_or(Value::Null);
                        self.define_current_global(&symbol, val);
                        self.push(val);
                    }
                    Err(e) => self.unwind(e)?,
                }
            }
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
