// File: src/parser.rs
//
// Predictive recursive-descent parser producing the AST of src/ast.rs.
// Grounded on the teacher's `Parser` (token-cursor + `peek`/`advance`
// idiom), generalized from its single-token-lookahead toy grammar to full
// precedence climbing and the statement grammar of spec.md §4.2: explicit
// `;`/newline terminators or an implicit end at `EOF, end, else, elif,
// ensure, except`; panic-mode recovery synchronizing on a fixed token set.

use crate::ast::*;
use crate::lexer::{tokenize, Keyword, Token, TokenKind};

/// Error sink matching spec.md §4.2: `(path, line, message)`.
pub type ErrorSink<'a> = dyn FnMut(&str, u32, &str) + 'a;

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    panic_mode: bool,
    had_error: bool,
    path: String,
    on_error: &'a mut ErrorSink<'a>,
}

const TOP_SYNC: &[Keyword] = &[
    Keyword::Fun,
    Keyword::Var,
    Keyword::For,
    Keyword::If,
    Keyword::While,
    Keyword::Return,
    Keyword::Then,
    Keyword::Do,
    Keyword::Begin,
    Keyword::Class,
];

impl<'a> Parser<'a> {
    pub fn new(path: &str, source: &str, on_error: &'a mut ErrorSink<'a>) -> Self {
        Parser {
            tokens: tokenize(source),
            pos: 0,
            panic_mode: false,
            had_error: false,
            path: path.to_string(),
            on_error,
        }
    }

    /// Parses the whole module. Returns `None` if any error occurred
    /// (spec.md §7 layer 2).
    pub fn parse_module(&mut self) -> Option<Vec<Stmt>> {
        self.skip_newlines();
        let mut stmts = Vec::new();
        while !self.check_eof() {
            if let Some(s) = self.declaration() {
                stmts.push(s);
            }
            self.skip_newlines();
        }
        if self.had_error {
            None
        } else {
            Some(stmts)
        }
    }

    // --- token cursor -----------------------------------------------

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    /// `rewindTo` of spec.md §4.1: reset the cursor to a remembered
    /// position, used to disambiguate `fun` as a declaration vs. an
    /// anonymous literal.
    fn mark(&self) -> usize {
        self.pos
    }

    fn rewind_to(&mut self, mark: usize) {
        self.pos = mark;
    }

    fn check_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn check_kw(&self, kw: Keyword) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if *k == kw)
    }

    fn match_kw(&mut self, kw: Keyword) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn error(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        (self.on_error)(&self.path, self.line(), message);
    }

    fn expect_kw(&mut self, kw: Keyword, what: &str) {
        if !self.match_kw(kw) {
            self.error(&format!("expected '{what}'"));
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) {
        if !self.match_tok(&kind) {
            self.error(&format!("expected '{what}'"));
        }
    }

    fn ident(&mut self) -> String {
        if let TokenKind::Identifier(name) = self.peek().clone() {
            self.advance();
            name
        } else {
            self.error("expected identifier");
            String::new()
        }
    }

    /// Statement terminator: explicit `;`/newline, or an implicit end at
    /// EOF/end/else/elif/ensure/except (spec.md §4.2).
    fn at_implicit_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
            || self.check_kw(Keyword::End)
            || self.check_kw(Keyword::Else)
            || self.check_kw(Keyword::Elif)
            || self.check_kw(Keyword::Ensure)
            || self.check_kw(Keyword::Except)
    }

    fn end_statement(&mut self) {
        if self.at_implicit_end() {
            return;
        }
        if matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
            self.skip_newlines();
            return;
        }
        self.error("expected statement terminator");
    }

    /// Panic-mode recovery: synchronize to one of a fixed token set
    /// (spec.md §4.2). `in_class` narrows the set to `fun, end`.
    fn synchronize(&mut self, in_class: bool) {
        self.panic_mode = false;
        while !self.check_eof() {
            if matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
                self.advance();
                return;
            }
            if in_class {
                if self.check_kw(Keyword::Fun) || self.check_kw(Keyword::End) {
                    return;
                }
            } else if let TokenKind::Keyword(k) = self.peek() {
                if TOP_SYNC.contains(k) {
                    return;
                }
            }
            self.advance();
        }
    }

    // --- declarations / statements ------------------------------------

    fn declaration(&mut self) -> Option<Stmt> {
        let result = self.statement(false);
        if self.panic_mode {
            self.synchronize(false);
        }
        result
    }

    fn block(&mut self, in_class: bool) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.at_implicit_end() {
            if let Some(s) = self.statement(in_class) {
                stmts.push(s);
            }
            if self.panic_mode {
                self.synchronize(in_class);
            }
            self.skip_newlines();
        }
        stmts
    }

    fn statement(&mut self, in_class: bool) -> Option<Stmt> {
        let line = self.line();
        if self.check_kw(Keyword::Var) {
            return self.var_decl(line);
        }
        if self.check_kw(Keyword::Fun) {
            return self.function_decl();
        }
        if self.check_kw(Keyword::Class) {
            return self.class_decl();
        }
        if self.match_kw(Keyword::Return) {
            let value = if self.at_implicit_end() || matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
                None
            } else {
                Some(self.expr())
            };
            self.end_statement();
            return Some(Stmt::Return(value, line));
        }
        if self.match_kw(Keyword::If) {
            return self.if_stmt();
        }
        if self.match_kw(Keyword::While) {
            return self.while_stmt();
        }
        if self.match_kw(Keyword::For) {
            return self.for_stmt();
        }
        if self.match_kw(Keyword::Try) {
            return self.try_stmt();
        }
        if self.match_kw(Keyword::Raise) {
            let value = self.expr();
            self.end_statement();
            return Some(Stmt::Raise(value, line));
        }
        if self.match_kw(Keyword::With) {
            return self.with_stmt();
        }
        if self.match_kw(Keyword::Import) {
            return self.import_stmt();
        }
        if self.match_kw(Keyword::Break) {
            self.end_statement();
            return Some(Stmt::Break);
        }
        if self.match_kw(Keyword::Continue) {
            self.end_statement();
            return Some(Stmt::Continue);
        }
        if self.match_kw(Keyword::Begin) {
            let body = self.block(false);
            self.expect_kw(Keyword::End, "end");
            return Some(Stmt::Block(body));
        }
        if in_class {
            // Only method declarations are valid directly inside a class
            // body; anything else is a syntax error that synchronizes on
            // `fun`/`end`.
            self.error("expected method declaration");
            return None;
        }
        let stmt = self.expr_stmt(line);
        self.end_statement();
        Some(stmt)
    }

    /// Parses an expression statement, including the bare
    /// `a, b = b, a` tuple-assignment form (spec.md §4.2), which is only
    /// legal directly at statement level -- nested expressions (call
    /// arguments, parenthesized groups) parse commas themselves and never
    /// reach here.
    fn expr_stmt(&mut self, line: u32) -> Stmt {
        let first = self.ternary();
        if self.check(&TokenKind::Comma) {
            let mut items = vec![first];
            while self.match_tok(&TokenKind::Comma) {
                items.push(self.ternary());
            }
            let tuple = Expr::Tuple(items);
            self.expect(TokenKind::Assign, "=");
            let value = self.expr_list_as_tuple();
            let target = Self::expr_to_lvalue(tuple).unwrap_or_else(|| {
                self.error("invalid assignment target");
                LValue::Var(String::new())
            });
            return Stmt::Expr(Expr::Assign { target, value: Box::new(value), line });
        }
        Stmt::Expr(self.assignment_continuation(first, line))
    }

    /// Completes an assignment/compound-assignment whose LHS was already
    /// parsed via `ternary()` (used by `expr_stmt`, which must see the
    /// whole comma-separated LHS before committing to the tuple-assignment
    /// path above). Mirrors `assignment()`'s tail.
    fn assignment_continuation(&mut self, expr: Expr, line: u32) -> Expr {
        let compound = match self.peek() {
            TokenKind::Assign => None,
            TokenKind::PlusEq => Some(CompoundOp::Add),
            TokenKind::MinusEq => Some(CompoundOp::Sub),
            TokenKind::StarEq => Some(CompoundOp::Mul),
            TokenKind::SlashEq => Some(CompoundOp::Div),
            TokenKind::PercentEq => Some(CompoundOp::Mod),
            _ => return expr,
        };
        self.advance();
        let Some(target) = Self::expr_to_lvalue(expr) else {
            self.error("invalid assignment target");
            return Expr::Null;
        };
        if let Some(op) = compound {
            if matches!(target, LValue::Tuple(_)) {
                self.error("compound assignment is not allowed on tuples");
            }
            let value = self.assignment();
            return Expr::CompoundAssign { target, op, value: Box::new(value), line };
        }
        let value = self.assignment();
        Expr::Assign { target, value: Box::new(value), line }
    }

    fn var_decl(&mut self, line: u32) -> Option<Stmt> {
        self.advance(); // var
        let target = self.lvalue_list();
        self.expect(TokenKind::Assign, "=");
        let value = self.expr_list_as_tuple();
        self.end_statement();
        Some(Stmt::VarDecl { target, value, line })
    }

    /// A comma-separated list of identifiers on the LHS of `var`, collapsed
    /// to a single `LValue::Var` when there is exactly one.
    fn lvalue_list(&mut self) -> LValue {
        let mut names = vec![LValue::Var(self.ident())];
        while self.match_tok(&TokenKind::Comma) {
            names.push(LValue::Var(self.ident()));
        }
        if names.len() == 1 {
            names.pop().unwrap()
        } else {
            LValue::Tuple(names)
        }
    }

    /// A comma-separated expression list, collapsed into a `Tuple` literal
    /// when there is more than one expression (spec.md §4.2 tuple
    /// unpacking).
    fn expr_list_as_tuple(&mut self) -> Expr {
        let first = self.expr();
        if !self.check(&TokenKind::Comma) {
            return first;
        }
        let mut items = vec![first];
        while self.match_tok(&TokenKind::Comma) {
            items.push(self.expr());
        }
        Expr::Tuple(items)
    }

    fn params(&mut self) -> (Vec<Param>, bool) {
        self.expect(TokenKind::LParen, "(");
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.match_tok(&TokenKind::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                let name = self.ident();
                let default = if self.match_tok(&TokenKind::Assign) { Some(self.const_expr()) } else { None };
                params.push(Param { name, default });
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, ")");
        (params, is_vararg)
    }

    /// Default-argument expressions must be literal constants (spec.md
    /// §4.2): `number, string, bool, null`.
    fn const_expr(&mut self) -> Expr {
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Expr::Number(n)
            }
            TokenKind::String(s) => {
                self.advance();
                Expr::String(s)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Expr::True
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Expr::False
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Expr::Null
            }
            _ => {
                self.error("default argument must be a literal constant");
                Expr::Null
            }
        }
    }

    fn function_decl(&mut self) -> Option<Stmt> {
        let mark = self.mark();
        self.advance(); // fun
        // `fun` followed by an identifier and `(` is a declaration;
        // otherwise it is an anonymous function literal used as an
        // expression statement (spec.md §4.1 `rewindTo`).
        if let TokenKind::Identifier(_) = self.peek().clone() {
            if *self.peek_at(1) == TokenKind::LParen {
                let line = self.line();
                let name = self.ident();
                let (params, is_vararg) = self.params();
                let body = self.block(false);
                self.expect_kw(Keyword::End, "end");
                return Some(Stmt::FunctionDecl(FunctionDecl { name: Some(name), params, is_vararg, body, line }));
            }
        }
        self.rewind_to(mark);
        let expr = self.expr();
        self.end_statement();
        Some(Stmt::Expr(expr))
    }

    fn function_literal(&mut self) -> Expr {
        let line = self.line();
        self.advance(); // fun
        let name = if let TokenKind::Identifier(n) = self.peek().clone() {
            self.advance();
            Some(n)
        } else {
            None
        };
        let (params, is_vararg) = self.params();
        let body = self.block(false);
        self.expect_kw(Keyword::End, "end");
        Expr::FunctionLiteral(FunctionDecl { name, params, is_vararg, body, line })
    }

    fn class_decl(&mut self) -> Option<Stmt> {
        self.advance(); // class
        let name = self.ident();
        let superclass = if self.match_kw(Keyword::Is) { Some(self.ident()) } else { None };
        self.skip_newlines();
        let mut methods = Vec::new();
        while self.check_kw(Keyword::Fun) {
            let line = self.line();
            self.advance();
            let mname = self.ident();
            let (params, is_vararg) = self.params();
            let body = self.block(true);
            self.expect_kw(Keyword::End, "end");
            methods.push(FunctionDecl { name: Some(mname), params, is_vararg, body, line });
            self.skip_newlines();
        }
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::ClassDecl(ClassDecl { name, superclass, methods }))
    }

    fn if_stmt(&mut self) -> Option<Stmt> {
        let cond = self.expr();
        self.expect_kw(Keyword::Then, "then");
        let then_branch = self.block(false);
        let mut elifs = Vec::new();
        while self.match_kw(Keyword::Elif) {
            let c = self.expr();
            self.expect_kw(Keyword::Then, "then");
            let b = self.block(false);
            elifs.push((c, b));
        }
        let else_branch = if self.match_kw(Keyword::Else) { Some(self.block(false)) } else { None };
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::If { cond, then_branch, elifs, else_branch })
    }

    fn while_stmt(&mut self) -> Option<Stmt> {
        let cond = self.expr();
        self.expect_kw(Keyword::Do, "do");
        let body = self.block(false);
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::While { cond, body })
    }

    fn for_stmt(&mut self) -> Option<Stmt> {
        if self.check_kw(Keyword::Var) && matches!(self.peek_at(2), TokenKind::Keyword(Keyword::In)) {
            self.advance(); // var
            let var = self.ident();
            self.expect_kw(Keyword::In, "in");
            let iterable = self.expr();
            self.expect_kw(Keyword::Do, "do");
            let body = self.block(false);
            self.expect_kw(Keyword::End, "end");
            return Some(Stmt::ForEach { var, iterable, body });
        }
        let init = if self.check(&TokenKind::Semicolon) { None } else { self.simple_stmt().map(Box::new) };
        self.expect(TokenKind::Semicolon, ";");
        let cond = if self.check(&TokenKind::Semicolon) { None } else { Some(self.expr()) };
        self.expect(TokenKind::Semicolon, ";");
        let step = if self.check_kw(Keyword::Do) { None } else { self.simple_stmt().map(Box::new) };
        self.expect_kw(Keyword::Do, "do");
        let body = self.block(false);
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::For { init, cond, step, body })
    }

    /// A statement usable in a `for` header's init/step clause: a var
    /// declaration or an expression, without consuming a terminator.
    fn simple_stmt(&mut self) -> Option<Stmt> {
        let line = self.line();
        if self.check_kw(Keyword::Var) {
            self.advance();
            let target = self.lvalue_list();
            self.expect(TokenKind::Assign, "=");
            let value = self.expr_list_as_tuple();
            return Some(Stmt::VarDecl { target, value, line });
        }
        Some(Stmt::Expr(self.expr()))
    }

    fn try_stmt(&mut self) -> Option<Stmt> {
        let body = self.block(false);
        let mut excepts = Vec::new();
        while self.match_kw(Keyword::Except) {
            let class_name = self.ident();
            let var_name = self.ident();
            let ebody = self.block(false);
            excepts.push(ExceptClause { class_name, var_name, body: ebody });
        }
        let ensure = if self.match_kw(Keyword::Ensure) { Some(self.block(false)) } else { None };
        if excepts.is_empty() && ensure.is_none() {
            self.error("'try' requires at least one 'except' or an 'ensure'");
        }
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::Try { body, excepts, ensure })
    }

    fn with_stmt(&mut self) -> Option<Stmt> {
        let expr = self.expr();
        let var = self.ident();
        let body = self.block(false);
        self.expect_kw(Keyword::End, "end");
        Some(Stmt::With { expr, var, body })
    }

    fn import_stmt(&mut self) -> Option<Stmt> {
        let name = self.dotted_name();
        if self.match_kw(Keyword::As) {
            let alias = self.ident();
            self.end_statement();
            return Some(Stmt::Import { name, alias: Some(alias) });
        }
        if self.match_kw(Keyword::In) {
            // `import symbol in module` mirrors IMPORT_FROM's (name, symbol)
            // pair in the opposite surface order some J* builds use; this
            // crate accepts `import name.symbol` instead (see below), kept
            // here only so a stray `in` after a name is a clean error.
            self.error("expected end of import statement");
        }
        self.end_statement();
        Some(Stmt::Import { name, alias: None })
    }

    fn dotted_name(&mut self) -> String {
        let mut name = self.ident();
        while self.check(&TokenKind::Dot) && matches!(self.peek_at(1), TokenKind::Identifier(_)) {
            self.advance();
            name.push('.');
            name.push_str(&self.ident());
        }
        name
    }

    // --- expressions ---------------------------------------------------

    fn expr(&mut self) -> Expr {
        self.assignment()
    }

    fn assignment(&mut self) -> Expr {
        let line = self.line();
        let expr = self.ternary();
        let compound = match self.peek() {
            TokenKind::Assign => None,
            TokenKind::PlusEq => Some(CompoundOp::Add),
            TokenKind::MinusEq => Some(CompoundOp::Sub),
            TokenKind::StarEq => Some(CompoundOp::Mul),
            TokenKind::SlashEq => Some(CompoundOp::Div),
            TokenKind::PercentEq => Some(CompoundOp::Mod),
            _ => return expr,
        };
        self.advance();
        let Some(target) = Self::expr_to_lvalue(expr) else {
            self.error("invalid assignment target");
            return Expr::Null;
        };
        if let Some(op) = compound {
            if matches!(target, LValue::Tuple(_)) {
                self.error("compound assignment is not allowed on tuples");
            }
            let value = self.assignment();
            return Expr::CompoundAssign { target, op, value: Box::new(value), line };
        }
        let value = self.assignment();
        Expr::Assign { target, value: Box::new(value), line }
    }

    fn expr_to_lvalue(expr: Expr) -> Option<LValue> {
        match expr {
            Expr::Identifier(name) => Some(LValue::Var(name)),
            Expr::Field { object, name, .. } => Some(LValue::Field(object, name)),
            Expr::Index { object, index, .. } => Some(LValue::Index(object, index)),
            Expr::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Self::expr_to_lvalue(item)?);
                }
                Some(LValue::Tuple(out))
            }
            _ => None,
        }
    }

    fn ternary(&mut self) -> Expr {
        let then_expr = self.or_expr();
        if self.match_kw(Keyword::If) {
            let cond = self.or_expr();
            self.expect_kw(Keyword::Else, "else");
            let else_expr = self.ternary();
            return Expr::Ternary { cond: Box::new(cond), then_expr: Box::new(then_expr), else_expr: Box::new(else_expr) };
        }
        then_expr
    }

    fn or_expr(&mut self) -> Expr {
        let mut left = self.and_expr();
        while self.match_kw(Keyword::Or) {
            let line = self.line();
            let right = self.and_expr();
            left = Expr::Binary { op: BinOp::Or, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn and_expr(&mut self) -> Expr {
        let mut left = self.equality();
        while self.match_kw(Keyword::And) {
            let line = self.line();
            let right = self.equality();
            left = Expr::Binary { op: BinOp::And, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn equality(&mut self) -> Expr {
        let mut left = self.comparison();
        loop {
            let op = match self.peek() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Neq,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.comparison();
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn comparison(&mut self) -> Expr {
        let mut left = self.term();
        loop {
            let op = match self.peek() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::Keyword(Keyword::Is) => BinOp::Is,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.term();
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn term(&mut self) -> Expr {
        let mut left = self.factor();
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.factor();
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn factor(&mut self) -> Expr {
        let mut left = self.power();
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.power();
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    /// `^` is right-associative (spec.md §4.2).
    fn power(&mut self) -> Expr {
        let left = self.unary();
        if matches!(self.peek(), TokenKind::Caret) {
            let line = self.line();
            self.advance();
            let right = self.power();
            return Expr::Binary { op: BinOp::Pow, left: Box::new(left), right: Box::new(right), line };
        }
        left
    }

    fn unary(&mut self) -> Expr {
        let line = self.line();
        let op = match self.peek() {
            TokenKind::Bang => UnOp::Not,
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Hash => UnOp::Len,
            TokenKind::HashHash => UnOp::Stringify,
            _ => return self.postfix(),
        };
        self.advance();
        let expr = self.unary();
        Expr::Unary { op, expr: Box::new(expr), line }
    }

    fn postfix(&mut self) -> Expr {
        let mut expr = self.primary();
        loop {
            let line = self.line();
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.ident();
                    if self.check(&TokenKind::LParen) {
                        let args = self.call_args();
                        expr = Expr::MethodCall { receiver: Box::new(expr), method: name, args, line };
                    } else {
                        expr = Expr::Field { object: Box::new(expr), name, line };
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expr();
                    self.expect(TokenKind::RBracket, "]");
                    expr = Expr::Index { object: Box::new(expr), index: Box::new(index), line };
                }
                TokenKind::LParen => {
                    let args = self.call_args();
                    expr = Expr::Call { callee: Box::new(expr), args, line };
                }
                _ => break,
            }
        }
        expr
    }

    fn call_args(&mut self) -> Vec<Expr> {
        self.expect(TokenKind::LParen, "(");
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expr());
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, ")");
        args
    }

    fn primary(&mut self) -> Expr {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Expr::Null
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Expr::True
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Expr::False
            }
            TokenKind::Number(n) => {
                self.advance();
                Expr::Number(n)
            }
            TokenKind::String(s) => {
                self.advance();
                Expr::String(s)
            }
            TokenKind::Keyword(Keyword::Super) => {
                self.advance();
                self.expect(TokenKind::Dot, ".");
                let method = self.ident();
                if self.check(&TokenKind::LParen) {
                    let args = self.call_args();
                    Expr::SuperCall { method, args, line }
                } else {
                    Expr::Super(method)
                }
            }
            TokenKind::Keyword(Keyword::Fun) => self.function_literal(),
            TokenKind::Identifier(name) => {
                self.advance();
                Expr::Identifier(name)
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.expr();
                if self.match_tok(&TokenKind::Comma) {
                    let mut items = vec![first];
                    loop {
                        items.push(self.expr());
                        if !self.match_tok(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, ")");
                    Expr::Tuple(items)
                } else {
                    self.expect(TokenKind::RParen, ")");
                    first
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expr());
                        if !self.match_tok(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "]");
                Expr::ArrayElement(items)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = self.expr();
                        self.expect(TokenKind::Colon, ":");
                        let value = self.expr();
                        items.push((key, value));
                        if !self.match_tok(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBrace, "}");
                Expr::DictElement(items)
            }
            _ => {
                self.error("expected expression");
                self.advance();
                Expr::Null
            }
        }
    }
}

/// Convenience wrapper used by `module.rs`/`vm.rs`: parses a whole program
/// and wraps it in the anonymous top-level function the module's body runs
/// as (spec.md §4.2 "the whole program is wrapped ... into an anonymous
/// top-level function").
pub fn parse_program<'a>(path: &str, source: &str, on_error: &'a mut ErrorSink<'a>) -> Option<FunctionDecl> {
    let mut parser = Parser::new(path, source, on_error);
    let body = parser.parse_module()?;
    Some(FunctionDecl { name: None, params: Vec::new(), is_vararg: false, body, line: 0 })
}
