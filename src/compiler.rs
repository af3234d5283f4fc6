// File: src/compiler.rs
//
// Single-pass AST -> bytecode compiler (spec.md §4.3). Grounded on the
// teacher's `Compiler` (`emit`/`patch_jump` idiom, one `Chunk` under
// construction at a time) generalized from its flat, non-nested `locals`
// vector to real per-function `FunctionScope`s with local/upvalue/global
// resolution, closures, control-flow back-patching, the foreach iteration
// desugaring, super dispatch, and try/except/ensure/with.

use crate::ast::*;
use crate::bytecode::{Chunk, DefaultLit, ExceptArm, FunctionMeta, HandlerSpec, OpCode, UpvalueDesc};

/// Error sink matching spec.md §4.2/§7: `(path, line, message)`.
pub type ErrorSink<'a> = dyn FnMut(&str, u32, &str) + 'a;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

struct LocalVar {
    name: String,
    depth: usize,
    captured: bool,
}

/// One pending `break`/`continue` site, patched once the enclosing loop's
/// exit point (break) or increment/re-test point (continue) is known.
struct LoopCtx {
    /// Scope depth at loop entry; `break`/`continue` across locals deeper
    /// than this must close their upvalues/pop their slots first.
    depth_at_entry: usize,
    /// Bytecode index of the next-iteration test (while/foreach): `continue`
    /// can jump here directly.
    continue_target: Option<usize>,
    /// Placeholder `Jmp` sites for `continue` in a classic `for`, patched
    /// once the increment clause's start is known.
    pending_continue: Vec<usize>,
    break_jumps: Vec<usize>,
}

/// Per-function compiler state (spec.md §4.3 "Scopes"): a fresh one is
/// pushed at every function, method, or anonymous literal.
struct FuncScope {
    chunk: Chunk,
    locals: Vec<LocalVar>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
    is_script: bool,
    name: Option<String>,
    arity: u8,
    default_count: u8,
    is_vararg: bool,
    /// Name of the statically enclosing class, for `super` resolution
    /// (spec.md §4.3 "super is resolved in the statically enclosing
    /// class's superclass", not the receiver's dynamic class).
    enclosing_superclass: Option<String>,
}

impl FuncScope {
    fn new(name: Option<String>, is_script: bool) -> Self {
        FuncScope {
            chunk: Chunk::new(),
            locals: Vec::new(),
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            is_script,
            name,
            arity: 0,
            default_count: 0,
            is_vararg: false,
            enclosing_superclass: None,
        }
    }
}

pub struct Compiler<'a> {
    scopes: Vec<FuncScope>,
    path: String,
    had_error: bool,
    on_error: &'a mut ErrorSink<'a>,
}

impl<'a> Compiler<'a> {
    pub fn new(path: &str, on_error: &'a mut ErrorSink<'a>) -> Self {
        Compiler { scopes: Vec::new(), path: path.to_string(), had_error: false, on_error }
    }

    /// Compiles a whole module body into the anonymous top-level function
    /// of spec.md §4.2. Returns `None` if a compile error occurred (spec.md
    /// §7 layer 3).
    pub fn compile_module(mut self, body: &[Stmt]) -> Option<FunctionMeta> {
        self.scopes.push(FuncScope::new(None, true));
        for stmt in body {
            self.statement(stmt);
        }
        self.emit(OpCode::Null, 0);
        self.emit(OpCode::Return, 0);
        let scope = self.scopes.pop().unwrap();
        if self.had_error {
            None
        } else {
            Some(FunctionMeta {
                name: scope.name,
                arity: scope.arity,
                default_count: scope.default_count,
                is_vararg: scope.is_vararg,
                upvalue_count: scope.upvalues.len() as u8,
                upvalues: scope.upvalues,
                chunk: scope.chunk,
                defaults: Vec::new(),
            })
        }
    }

    fn error(&mut self, line: u32, msg: &str) {
        self.had_error = true;
        (self.on_error)(&self.path, line, msg);
    }

    fn cur(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().unwrap()
    }

    fn emit(&mut self, op: OpCode, line: u32) -> usize {
        self.cur().chunk.emit(op, line)
    }

    // --- scope management -----------------------------------------------

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Pops every local declared in the scope just ended, emitting
    /// `CLOSE_UPVALUE` for captured ones and `POP` otherwise (spec.md §4.3
    /// "Upvalue closing").
    fn end_scope(&mut self, line: u32) {
        let depth = self.cur().scope_depth;
        while let Some(local) = self.cur().locals.last() {
            if local.depth < depth {
                break;
            }
            let captured = local.captured;
            let slot = (self.cur().locals.len() - 1) as u8;
            if captured {
                self.emit(OpCode::CloseUpvalue(slot), line);
            } else {
                self.emit(OpCode::Pop, line);
            }
            self.cur().locals.pop();
        }
        self.cur().scope_depth -= 1;
    }

    // --- identifier resolution -------------------------------------------

    fn declare_local(&mut self, name: &str, line: u32) -> u8 {
        let depth = self.cur().scope_depth;
        if self.cur().locals.len() >= MAX_LOCALS {
            self.error(line, "too many local variables in one function");
            return 0;
        }
        self.cur().locals.push(LocalVar { name: name.to_string(), depth, captured: false });
        (self.cur().locals.len() - 1) as u8
    }

    fn resolve_local(&self, scope_idx: usize, name: &str) -> Option<u8> {
        self.scopes[scope_idx].locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, _)| i as u8)
    }

    /// Resolves `name` as an upvalue of `scope_idx`, walking enclosing
    /// function scopes and chaining capture descriptors through every
    /// intervening function (spec.md §4.3 resolution step 2).
    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        if scope_idx == 0 {
            return None;
        }
        let parent = scope_idx - 1;
        if let Some(local_idx) = self.resolve_local(parent, name) {
            self.scopes[parent].locals[local_idx as usize].captured = true;
            return Some(self.add_upvalue(scope_idx, UpvalueDesc { is_local: true, index: local_idx }));
        }
        if let Some(up_idx) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(scope_idx, UpvalueDesc { is_local: false, index: up_idx }));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, desc: UpvalueDesc) -> u8 {
        let list = &mut self.scopes[scope_idx].upvalues;
        if let Some(i) = list.iter().position(|d| *d == desc) {
            return i as u8;
        }
        if list.len() >= MAX_UPVALUES {
            self.error(0, "too many captured variables in one function");
            return 0;
        }
        list.push(desc);
        (list.len() - 1) as u8
    }

    fn add_string_const(&mut self, s: &str) -> u16 {
        self.cur().chunk.add_string(s)
    }

    /// Loads `name` following spec.md §4.3's three-step resolution order.
    fn load_ident(&mut self, name: &str, line: u32) {
        let top = self.scopes.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit(OpCode::LoadLocal(slot), line);
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            self.emit(OpCode::LoadUpvalue(slot), line);
        } else {
            let k = self.add_string_const(name);
            self.emit(OpCode::LoadGlobal(k), line);
        }
    }

    fn store_ident(&mut self, name: &str, line: u32) {
        let top = self.scopes.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit(OpCode::StoreLocal(slot), line);
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            self.emit(OpCode::StoreUpvalue(slot), line);
        } else {
            let k = self.add_string_const(name);
            self.emit(OpCode::StoreGlobal(k), line);
        }
    }

    /// True while compiling directly inside the module's top-level function
    /// at its outermost (non-block) depth -- declarations here are globals,
    /// not locals (spec.md §4.3 step 3 "global of the current module").
    fn at_global_scope(&self) -> bool {
        let s = self.scopes.last().unwrap();
        s.is_script && s.scope_depth == 0
    }

    fn declare_binding(&mut self, name: &str, line: u32) {
        if self.at_global_scope() {
            let k = self.add_string_const(name);
            self.emit(OpCode::DefineGlobal(k), line);
        } else {
            self.declare_local(name, line);
        }
    }

    // --- statements -------------------------------------------------------

    fn block(&mut self, stmts: &[Stmt]) {
        self.begin_scope();
        for s in stmts {
            self.statement(s);
        }
        self.end_scope(0);
    }

    fn statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(e) => {
                let line = expr_line(e);
                self.expr(e);
                self.emit(OpCode::Pop, line);
            }
            Stmt::VarDecl { target, value, line } => {
                self.expr(value);
                self.bind_lvalue_decl(target, *line);
            }
            Stmt::FunctionDecl(f) => {
                let line = f.line;
                // Declare the name before compiling the body so a function
                // can recurse by calling its own global/local name.
                if self.at_global_scope() {
                    self.function_literal(f, None);
                    let k = self.add_string_const(f.name.as_deref().unwrap());
                    self.emit(OpCode::DefineGlobal(k), line);
                } else {
                    self.declare_local(f.name.as_deref().unwrap(), line);
                    self.function_literal(f, None);
                }
            }
            Stmt::ClassDecl(c) => self.class_decl(c),
            Stmt::Return(value, line) => {
                match value {
                    Some(e) => self.expr(e),
                    None => {
                        self.emit(OpCode::Null, *line);
                    }
                }
                self.emit(OpCode::Return, *line);
            }
            Stmt::If { cond, then_branch, elifs, else_branch } => {
                self.if_stmt(cond, then_branch, elifs, else_branch);
            }
            Stmt::While { cond, body } => self.while_stmt(cond, body),
            Stmt::For { init, cond, step, body } => self.for_stmt(init, cond, step, body),
            Stmt::ForEach { var, iterable, body } => self.foreach_stmt(var, iterable, body),
            Stmt::Try { body, excepts, ensure } => self.try_stmt(body, excepts, ensure),
            Stmt::Raise(e, line) => {
                self.expr(e);
                self.emit(OpCode::Raise, *line);
            }
            Stmt::With { expr, var, body } => self.with_stmt(expr, var, body),
            Stmt::Import { name, alias } => {
                let line = 0;
                let k = self.add_string_const(name);
                match alias {
                    Some(a) => {
                        let ak = self.add_string_const(a);
                        self.emit(OpCode::ImportAs(k, ak), line);
                    }
                    None => {
                        self.emit(OpCode::Import(k), line);
                    }
                }
                self.emit(OpCode::Pop, line);
            }
            Stmt::ImportFrom { name, symbol } => {
                let k = self.add_string_const(&format!("{name}.{symbol}"));
                self.emit(OpCode::ImportFrom(k), 0);
                self.emit(OpCode::Pop, 0);
            }
            Stmt::Break => self.break_stmt(),
            Stmt::Continue => self.continue_stmt(),
            Stmt::Block(stmts) => self.block(stmts),
        }
    }

    /// Binds a (possibly tuple-unpacking) `var`/assignment LHS, leaving the
    /// value consumed off the stack and nothing pushed back.
    fn bind_lvalue_decl(&mut self, target: &LValue, line: u32) {
        match target {
            LValue::Var(name) => self.declare_binding(name, line),
            LValue::Tuple(items) => {
                // Unpack right-to-left so each GET_INDEX consumes the
                // duplicated tuple, leaving the original slot's value ready
                // to bind left-to-right with a single pass.
                for (i, item) in items.iter().enumerate() {
                    self.emit(OpCode::Dup, line);
                    let idx_k = self.cur().chunk.add_number(i as f64);
                    self.emit(OpCode::Const(idx_k), line);
                    self.emit(OpCode::GetIndex, line);
                    match item {
                        LValue::Var(name) => self.declare_binding(name, line),
                        other => self.assign_to_lvalue(other, line),
                    }
                }
                self.emit(OpCode::Pop, line);
            }
            other => self.assign_to_lvalue(other, line),
        }
    }

    /// Stores the value already on top of the stack into an existing
    /// lvalue (field/index/var), without declaring a new binding.
    fn assign_to_lvalue(&mut self, target: &LValue, line: u32) {
        match target {
            LValue::Var(name) => self.store_ident(name, line),
            LValue::Field(obj, name) => {
                self.expr(obj);
                let k = self.add_string_const(name);
                self.emit(OpCode::SetField(k), line);
            }
            LValue::Index(obj, idx) => {
                self.expr(obj);
                self.expr(idx);
                self.emit(OpCode::SetIndex, line);
            }
            LValue::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.emit(OpCode::Dup, line);
                    let idx_k = self.cur().chunk.add_number(i as f64);
                    self.emit(OpCode::Const(idx_k), line);
                    self.emit(OpCode::GetIndex, line);
                    self.assign_to_lvalue(item, line);
                }
                self.emit(OpCode::Pop, line);
            }
        }
    }

    fn if_stmt(&mut self, cond: &Expr, then_b: &[Stmt], elifs: &[(Expr, Vec<Stmt>)], else_b: &Option<Vec<Stmt>>) {
        let line = expr_line(cond);
        self.expr(cond);
        let else_jump = self.emit(OpCode::JmpPopFalse(0), line);
        self.block(then_b);
        let mut end_jumps = vec![self.emit(OpCode::Jmp(0), line)];
        self.patch(else_jump);

        for (c, b) in elifs {
            let l = expr_line(c);
            self.expr(c);
            let next_jump = self.emit(OpCode::JmpPopFalse(0), l);
            self.block(b);
            end_jumps.push(self.emit(OpCode::Jmp(0), l));
            self.patch(next_jump);
        }

        if let Some(b) = else_b {
            self.block(b);
        }
        for j in end_jumps {
            self.patch(j);
        }
    }

    fn patch(&mut self, at: usize) {
        self.cur().chunk.patch_jump(at);
    }

    fn push_loop(&mut self, continue_target: Option<usize>) {
        let depth = self.cur().scope_depth;
        self.cur().loops.push(LoopCtx { depth_at_entry: depth, continue_target, pending_continue: Vec::new(), break_jumps: Vec::new() });
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt]) {
        let line = expr_line(cond);
        let loop_start = self.cur().chunk.instructions.len();
        self.push_loop(Some(loop_start));
        self.expr(cond);
        let exit = self.emit(OpCode::JmpPopFalse(0), line);
        self.block(body);
        self.emit(OpCode::Jmp(loop_start), line);
        self.patch(exit);
        self.finish_loop(line);
    }

    fn for_stmt(&mut self, init: &Option<Box<Stmt>>, cond: &Option<Expr>, step: &Option<Box<Stmt>>, body: &[Stmt]) {
        self.begin_scope();
        if let Some(s) = init {
            self.statement(s);
        }
        let loop_start = self.cur().chunk.instructions.len();
        // Continue target is not known yet (it's the increment, compiled
        // after the body); patched once the body is done.
        self.push_loop(None);
        let exit = cond.as_ref().map(|c| {
            let l = expr_line(c);
            self.expr(c);
            self.emit(OpCode::JmpPopFalse(0), l)
        });
        self.block(body);
        let continue_target = self.cur().chunk.instructions.len();
        if let Some(s) = step {
            self.statement_as_expr_only(s);
        }
        self.emit(OpCode::Jmp(loop_start), 0);
        if let Some(e) = exit {
            self.patch(e);
        }
        let ctx = self.cur().loops.last_mut().unwrap();
        for p in std::mem::take(&mut ctx.pending_continue) {
            self.cur().chunk.patch_jump_to(p, continue_target);
        }
        self.finish_loop(0);
        self.end_scope(0);
    }

    /// Compiles a `for` step clause, which is a bare expression or var-decl
    /// evaluated for effect (no statement terminator in the header).
    fn statement_as_expr_only(&mut self, s: &Stmt) {
        match s {
            Stmt::Expr(e) => {
                let line = expr_line(e);
                self.expr(e);
                self.emit(OpCode::Pop, line);
            }
            other => self.statement(other),
        }
    }

    fn finish_loop(&mut self, line: u32) {
        let ctx = self.cur().loops.pop().unwrap();
        for b in ctx.break_jumps {
            self.cur().chunk.patch_jump(b);
        }
        let _ = line;
    }

    /// Desugars `for var x in E do B end` per spec.md §4.3's iteration
    /// protocol: a hidden `##iter`/`##state` pair drives repeated
    /// `__iter__`/`__next__` calls (fast-pathed for builtin collections in
    /// the VM's `Invoke` handling).
    fn foreach_stmt(&mut self, var: &str, iterable: &Expr, body: &[Stmt]) {
        let line = expr_line(iterable);
        self.begin_scope();
        self.expr(iterable);
        let iterable_slot = self.declare_local("##iterable", line);
        self.emit(OpCode::Null, line);
        let state_slot = self.declare_local("##state", line);

        let loop_start = self.cur().chunk.instructions.len();
        self.push_loop(Some(loop_start));

        self.emit(OpCode::LoadLocal(iterable_slot), line);
        self.emit(OpCode::LoadLocal(state_slot), line);
        let iter_k = self.add_string_const("__iter__");
        self.emit(OpCode::Invoke(iter_k, 1), line);
        self.emit(OpCode::StoreLocal(state_slot), line);
        self.emit(OpCode::Pop, line);
        self.emit(OpCode::LoadLocal(state_slot), line);
        let exit = self.emit(OpCode::JmpPopFalse(0), line);

        self.begin_scope();
        self.emit(OpCode::LoadLocal(iterable_slot), line);
        self.emit(OpCode::LoadLocal(state_slot), line);
        let next_k = self.add_string_const("__next__");
        self.emit(OpCode::Invoke(next_k, 1), line);
        self.declare_local(var, line);
        for s in body {
            self.statement(s);
        }
        self.end_scope(line);

        self.emit(OpCode::Jmp(loop_start), line);
        self.patch(exit);
        self.finish_loop(line);
        self.end_scope(line);
    }

    fn break_stmt(&mut self) {
        let j = self.emit(OpCode::Jmp(0), 0);
        match self.cur().loops.last_mut() {
            Some(ctx) => ctx.break_jumps.push(j),
            None => self.error(0, "'break' outside a loop"),
        }
    }

    fn continue_stmt(&mut self) {
        match self.cur().loops.last().map(|c| c.continue_target) {
            Some(Some(target)) => {
                self.emit(OpCode::Jmp(target), 0);
            }
            Some(None) => {
                let j = self.emit(OpCode::Jmp(0), 0);
                self.cur().loops.last_mut().unwrap().pending_continue.push(j);
            }
            None => self.error(0, "'continue' outside a loop"),
        }
    }

    /// `try`/`except`/`ensure` (spec.md §4.3): a single `SETUP_HANDLER`
    /// carries every `except` arm (resolved class name + bound var slot +
    /// target) plus the `ensure` entry point, if any. On unwind the VM tries
    /// each arm in order and falls through to `ensure` when none match --
    /// which is what makes `ensure` run on every exit path.
    fn try_stmt(&mut self, body: &[Stmt], excepts: &[ExceptClause], ensure: &Option<Vec<Stmt>>) {
        let setup_at = self.emit(OpCode::SetupHandler(HandlerSpec::default()), 0);
        self.block(body);
        self.emit(OpCode::PopHandler, 0);
        let after_body_jump = self.emit(OpCode::Jmp(0), 0);

        let mut arms = Vec::new();
        let mut except_ends = Vec::new();
        for ec in excepts {
            let target_ip = self.cur().chunk.instructions.len();
            let class_k = self.add_string_const(&ec.class_name);
            self.begin_scope();
            let var_slot = self.declare_local(&ec.var_name, 0);
            arms.push(ExceptArm { class_name: class_k, var_slot, target_ip });
            for s in &ec.body {
                self.statement(s);
            }
            self.end_scope(0);
            except_ends.push(self.emit(OpCode::Jmp(0), 0));
        }
        self.patch(after_body_jump);
        for j in except_ends {
            self.patch(j);
        }

        let ensure_ip = ensure.as_ref().map(|_| self.cur().chunk.instructions.len());
        if let Some(eb) = ensure {
            self.block(eb);
            self.emit(OpCode::EndEnsure, 0);
        }
        self.cur().chunk.instructions[setup_at] = OpCode::SetupHandler(HandlerSpec { except_arms: arms, ensure_ip });
    }

    /// `with e ident … end` lowers to `try { ident = e; B } ensure { ident.close() } end`
    /// (spec.md §4.2/§5).
    fn with_stmt(&mut self, expr: &Expr, var: &str, body: &[Stmt]) {
        let line = expr_line(expr);
        self.begin_scope();
        self.expr(expr);
        let slot = self.declare_local(var, line);

        let setup_at = self.emit(OpCode::SetupHandler(HandlerSpec::default()), line);
        self.block(body);
        self.emit(OpCode::PopHandler, line);
        let skip_ensure = self.emit(OpCode::Jmp(0), line);

        let ensure_ip = self.cur().chunk.instructions.len();
        self.emit(OpCode::LoadLocal(slot), line);
        let close_k = self.add_string_const("close");
        self.emit(OpCode::Invoke(close_k, 0), line);
        self.emit(OpCode::Pop, line);
        self.emit(OpCode::EndEnsure, line);
        self.cur().chunk.instructions[setup_at] =
            OpCode::SetupHandler(HandlerSpec { except_arms: Vec::new(), ensure_ip: Some(ensure_ip) });

        self.patch(skip_ensure);
        self.end_scope(line);
    }

    fn class_decl(&mut self, c: &ClassDecl) {
        let name_k = self.add_string_const(&c.name);
        self.emit(OpCode::NewClass(name_k), 0);
        if let Some(sup) = &c.superclass {
            self.load_ident(sup, 0);
            self.emit(OpCode::Inherit, 0);
        }
        for m in &c.methods {
            self.method_literal(m, &c.superclass);
            let mk = self.add_string_const(m.name.as_deref().unwrap());
            self.emit(OpCode::DefineMethod(mk), m.line);
        }
        if self.at_global_scope() {
            let k = self.add_string_const(&c.name);
            self.emit(OpCode::DefineGlobal(k), 0);
        } else {
            self.declare_local(&c.name, 0);
        }
    }

    // --- functions / closures --------------------------------------------

    fn method_literal(&mut self, f: &FunctionDecl, superclass: &Option<String>) {
        self.compile_function(f, superclass.clone(), true);
    }

    fn function_literal(&mut self, f: &FunctionDecl, superclass: Option<String>) {
        self.compile_function(f, superclass, false);
    }

    fn compile_function(&mut self, f: &FunctionDecl, enclosing_superclass: Option<String>, is_method: bool) {
        let mut scope = FuncScope::new(f.name.clone(), false);
        scope.enclosing_superclass = enclosing_superclass;
        scope.arity = f.params.iter().take_while(|p| p.default.is_none()).count() as u8;
        scope.default_count = (f.params.len() as u8) - scope.arity;
        scope.is_vararg = f.is_vararg;
        self.scopes.push(scope);

        // The receiver occupies local slot 0 under the name `this`, bound
        // implicitly rather than as a formal parameter -- J* has no `this`
        // keyword, just a conventionally-named local the compiler seeds for
        // every method (spec.md §4.3/§4.4 calling convention).
        if is_method {
            self.declare_local("this", f.line);
        }
        for p in &f.params {
            self.declare_local(&p.name, f.line);
        }
        if f.is_vararg {
            // The `...` marker carries no name of its own (spec.md §4.2);
            // the packed extras are exposed to the body as `args`, the same
            // implicit-local convention used for `this` on methods above.
            self.declare_local("args", f.line);
        }
        for s in &f.body {
            self.statement(s);
        }
        self.emit(OpCode::Null, f.line);
        self.emit(OpCode::Return, f.line);

        let inner = self.scopes.pop().unwrap();
        let upvalues = inner.upvalues.clone();
        let defaults: Vec<DefaultLit> = f
            .params
            .iter()
            .filter_map(|p| p.default.as_ref())
            .map(|e| self.literal_default(e, f.line))
            .collect();
        let meta = FunctionMeta {
            name: inner.name,
            arity: inner.arity,
            default_count: inner.default_count,
            is_vararg: inner.is_vararg,
            upvalue_count: upvalues.len() as u8,
            upvalues: upvalues.clone(),
            chunk: inner.chunk,
            defaults,
        };
        let const_idx = self.cur().chunk.add_function(meta);
        self.emit(OpCode::MakeClosure(const_idx, upvalues), f.line);
    }

    /// Extracts a parameter default's literal value (spec.md §4.2: "a
    /// default value must be a literal").
    fn literal_default(&mut self, e: &Expr, line: u32) -> DefaultLit {
        match e {
            Expr::Null => DefaultLit::Null,
            Expr::True => DefaultLit::Bool(true),
            Expr::False => DefaultLit::Bool(false),
            Expr::Number(n) => DefaultLit::Number(*n),
            Expr::String(s) => DefaultLit::Str(s.clone()),
            _ => {
                self.error(line, "default parameter value must be a literal");
                DefaultLit::Null
            }
        }
    }

    // --- expressions -------------------------------------------------------

    fn expr(&mut self, e: &Expr) {
        match e {
            Expr::Null => {
                self.emit(OpCode::Null, 0);
            }
            Expr::True => {
                self.emit(OpCode::True, 0);
            }
            Expr::False => {
                self.emit(OpCode::False, 0);
            }
            Expr::Number(n) => {
                let k = self.cur().chunk.add_number(*n);
                self.emit(OpCode::Const(k), 0);
            }
            Expr::String(s) => {
                let k = self.add_string_const(s);
                self.emit(OpCode::Const(k), 0);
            }
            Expr::Identifier(name) => self.load_ident(name, 0),
            Expr::Super(method) => {
                self.emit_super_receiver(0);
                let k = self.add_string_const(method);
                self.emit(OpCode::GetField(k), 0);
            }
            Expr::Tuple(items) => {
                for it in items {
                    self.expr(it);
                }
                self.emit(OpCode::NewTuple(items.len() as u16), 0);
            }
            Expr::ArrayElement(items) => {
                self.emit(OpCode::NewList, 0);
                for it in items {
                    self.expr(it);
                    self.emit(OpCode::ListAppend, 0);
                }
            }
            Expr::DictElement(pairs) => {
                self.emit(OpCode::NewTable, 0);
                for (k, v) in pairs {
                    self.expr(k);
                    self.expr(v);
                    self.emit(OpCode::TablePut, 0);
                }
            }
            Expr::Unary { op, expr: inner, line } => {
                self.expr(inner);
                let code = match op {
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                    UnOp::Stringify => OpCode::Stringify,
                };
                self.emit(code, *line);
            }
            Expr::Binary { op, left, right, line } => self.binary(*op, left, right, *line),
            Expr::Ternary { cond, then_expr, else_expr } => {
                let line = expr_line(cond);
                self.expr(cond);
                let else_jump = self.emit(OpCode::JmpPopFalse(0), line);
                self.expr(then_expr);
                let end_jump = self.emit(OpCode::Jmp(0), line);
                self.patch(else_jump);
                self.expr(else_expr);
                self.patch(end_jump);
            }
            Expr::Assign { target, value, line } => {
                self.expr(value);
                self.emit(OpCode::Dup, *line);
                self.assign_to_lvalue(target, *line);
            }
            Expr::CompoundAssign { target, op, value, line } => {
                self.load_lvalue_for_compound(target, *line);
                self.expr(value);
                let code = match op {
                    CompoundOp::Add => OpCode::Add,
                    CompoundOp::Sub => OpCode::Sub,
                    CompoundOp::Mul => OpCode::Mul,
                    CompoundOp::Div => OpCode::Div,
                    CompoundOp::Mod => OpCode::Mod,
                };
                self.emit(code, *line);
                self.emit(OpCode::Dup, *line);
                self.assign_to_lvalue(target, *line);
            }
            Expr::Call { callee, args, line } => {
                self.expr(callee);
                for a in args {
                    self.expr(a);
                }
                self.emit(OpCode::Call(args.len() as u8), *line);
            }
            Expr::MethodCall { receiver, method, args, line } => {
                self.expr(receiver);
                for a in args {
                    self.expr(a);
                }
                let k = self.add_string_const(method);
                self.emit(OpCode::Invoke(k, args.len() as u8), *line);
            }
            Expr::SuperCall { method, args, line } => {
                self.emit_super_receiver(*line);
                for a in args {
                    self.expr(a);
                }
                let k = self.add_string_const(method);
                self.emit(OpCode::SuperInvoke(k, args.len() as u8), *line);
            }
            Expr::Field { object, name, line } => {
                self.expr(object);
                let k = self.add_string_const(name);
                self.emit(OpCode::GetField(k), *line);
            }
            Expr::Index { object, index, line } => {
                self.expr(object);
                self.expr(index);
                self.emit(OpCode::GetIndex, *line);
            }
            Expr::FunctionLiteral(f) => {
                let sup = self.scopes.last().and_then(|s| s.enclosing_superclass.clone());
                self.function_literal(f, sup);
            }
        }
    }

    /// Loads `this`, resolved through the normal identifier chain so a
    /// `super` reference inside a function literal nested in a method
    /// captures the enclosing method's receiver as an upvalue rather than
    /// reading its own local slot 0.
    fn emit_super_receiver(&mut self, line: u32) {
        self.load_ident("this", line);
    }

    /// For compound assignment, loads the current value of an lvalue.
    /// `assign_to_lvalue` re-evaluates the base (`obj`/`idx`) expressions
    /// fresh when it stores the result, so this only needs to leave the
    /// loaded value on the stack -- no leftover operands to reuse.
    fn load_lvalue_for_compound(&mut self, target: &LValue, line: u32) {
        match target {
            LValue::Var(name) => self.load_ident(name, line),
            LValue::Field(obj, name) => {
                self.expr(obj);
                let k = self.add_string_const(name);
                self.emit(OpCode::GetField(k), line);
            }
            LValue::Index(obj, idx) => {
                self.expr(obj);
                self.expr(idx);
                self.emit(OpCode::GetIndex, line);
            }
            LValue::Tuple(_) => unreachable!("compound assignment on tuples is rejected by the parser"),
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr, line: u32) {
        match op {
            BinOp::And => {
                self.expr(left);
                let short = self.emit(OpCode::JmpFalse(0), line);
                self.emit(OpCode::Pop, line);
                self.expr(right);
                self.patch(short);
                return;
            }
            BinOp::Or => {
                self.expr(left);
                let short = self.emit(OpCode::JmpTrue(0), line);
                self.emit(OpCode::Pop, line);
                self.expr(right);
                self.patch(short);
                return;
            }
            _ => {}
        }
        self.expr(left);
        self.expr(right);
        let code = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Eq => OpCode::Eq,
            BinOp::Neq => OpCode::Neq,
            BinOp::Lt => OpCode::Lt,
            BinOp::Le => OpCode::Le,
            BinOp::Gt => OpCode::Gt,
            BinOp::Ge => OpCode::Ge,
            BinOp::Is => OpCode::Is,
            BinOp::And | BinOp::Or => unreachable!(),
        };
        self.emit(code, line);
    }
}

fn expr_line(e: &Expr) -> u32 {
    match e {
        Expr::Unary { line, .. }
        | Expr::Binary { line, .. }
        | Expr::Assign { line, .. }
        | Expr::CompoundAssign { line, .. }
        | Expr::Call { line, .. }
        | Expr::MethodCall { line, .. }
        | Expr::SuperCall { line, .. }
        | Expr::Field { line, .. }
        | Expr::Index { line, .. } => *line,
        Expr::FunctionLiteral(f) => f.line,
        _ => 0,
    }
}
