//! Recursive-descent parser for transformation snippets.
//!
//! Accepts a deliberately small statement language: assignments, `for`,
//! `if/elif/else`, `return`, `break`, `continue`, `pass` and expression
//! statements. Imports, function and class definitions, `while`, `with`,
//! `try` and underscore-prefixed attributes are rejected up front.

use serde_json::Value;

use crate::error::ScriptError;
use crate::query::ast::{
    AssignTarget, BinOp, BoolOp, Clause, CmpOp, Expr, Lambda, Stmt, Target, UnaryOp,
};
use crate::query::lexer::{tokenize, Tok, Token};
use crate::query::value::float_value;

const KEYWORDS: [&str; 16] = [
    "and", "or", "not", "in", "is", "if", "elif", "else", "for", "return", "pass", "break",
    "continue", "lambda", "None", "True",
];

const FORBIDDEN: [&str; 14] = [
    "import", "from", "def", "class", "while", "with", "try", "except", "finally", "raise",
    "global", "nonlocal", "del", "yield",
];

/// Deepest bracket, unary, lambda or block nesting a snippet may use.
pub const MAX_NESTING: usize = 64;

/// Most binary operators, subscripts and calls a single statement may hold.
pub const MAX_CHAIN: usize = 1024;

type Result<T> = std::result::Result<T, ScriptError>;

/// Parses a single expression (tuples allowed).
pub fn parse_expression(source: &str) -> Result<Expr> {
    let mut parser = Parser::new(tokenize(source)?);
    let expr = parser.testlist()?;
    while parser.eat(&Tok::Newline) {}
    parser.expect_eof()?;
    Ok(expr)
}

/// Parses a statement block.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        if parser.eat(&Tok::Newline) {
            continue;
        }
        body.push(parser.statement()?);
    }
    Ok(body)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    chain: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            chain: 0,
        }
    }

    // == Nesting Limits ==
    /// Runs `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("too deeply nested"));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    /// Counts one more link of a left-deep chain (`a + b + c`, `x[0][1]`).
    /// Links add up over the whole statement.
    fn link(&mut self) -> Result<()> {
        if self.chain >= MAX_CHAIN {
            return Err(self.error("expression chain too long"));
        }
        self.chain += 1;
        Ok(())
    }

    // == Token Helpers ==
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == word)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            return true;
        }
        false
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.at_sym(sym) {
            self.advance();
            return true;
        }
        false
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.advance();
            return true;
        }
        false
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn unexpected(&self) -> ScriptError {
        let found = match self.peek() {
            Tok::Int(n) => n.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(s) => format!("'{}'", s),
            Tok::Name(n) => n.clone(),
            Tok::Sym(s) => s.to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        self.error(format!("invalid syntax near {}", found))
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", sym)))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", word)))
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if self.at(&Tok::Eof) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_newline(&mut self) -> Result<()> {
        if self.eat(&Tok::Newline) || self.at(&Tok::Eof) || self.at(&Tok::Dedent) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_reserved(&name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    // == Statements ==
    fn statement(&mut self) -> Result<Stmt> {
        let outer = std::mem::take(&mut self.chain);
        let stmt = self.nested(Self::statement_inner);
        self.chain = outer;
        stmt
    }

    fn statement_inner(&mut self) -> Result<Stmt> {
        if let Tok::Name(word) = self.peek() {
            if FORBIDDEN.contains(&word.as_str()) {
                return Err(self.error(format!("'{}' is not allowed in processing code", word)));
            }
        }

        if self.eat_keyword("if") {
            return self.if_statement();
        }
        if self.eat_keyword("for") {
            let target = self.target()?;
            self.expect_keyword("in")?;
            let iter = self.testlist()?;
            self.expect_sym(":")?;
            let body = self.suite()?;
            return Ok(Stmt::For { target, iter, body });
        }

        let stmt = self.simple_statement()?;
        self.expect_newline()?;
        Ok(stmt)
    }

    fn simple_statement(&mut self) -> Result<Stmt> {
        if self.eat_keyword("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_keyword("break") {
            return Ok(Stmt::Break);
        }
        if self.eat_keyword("continue") {
            return Ok(Stmt::Continue);
        }
        if self.eat_keyword("return") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) {
                return Ok(Stmt::Return(None));
            }
            return Ok(Stmt::Return(Some(self.testlist()?)));
        }

        let expr = self.testlist()?;

        if self.eat_sym("=") {
            let target = assign_target(expr).ok_or_else(|| self.error("cannot assign to expression"))?;
            let value = self.testlist()?;
            return Ok(Stmt::Assign(target, value));
        }

        let augmented = [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("/=", BinOp::Div),
            ("//=", BinOp::FloorDiv),
            ("%=", BinOp::Mod),
        ];
        for (sym, op) in augmented {
            if self.eat_sym(sym) {
                let target = match assign_target(expr) {
                    Some(t @ (AssignTarget::Name(_) | AssignTarget::Index(..))) => t,
                    _ => return Err(self.error("illegal target for augmented assignment")),
                };
                let value = self.testlist()?;
                return Ok(Stmt::AugAssign(target, op, value));
            }
        }

        Ok(Stmt::Expr(expr))
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let mut branches = Vec::new();
        let cond = self.test()?;
        self.expect_sym(":")?;
        branches.push((cond, self.suite()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.test()?;
                self.expect_sym(":")?;
                branches.push((cond, self.suite()?));
            } else if self.eat_keyword("else") {
                self.expect_sym(":")?;
                orelse = self.suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn suite(&mut self) -> Result<Vec<Stmt>> {
        if !self.eat(&Tok::Newline) {
            // `if x: y = 1` on one line
            let stmt = self.simple_statement()?;
            self.expect_newline()?;
            return Ok(vec![stmt]);
        }
        if !self.eat(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        let mut body = Vec::new();
        while !self.eat(&Tok::Dedent) {
            if self.at(&Tok::Eof) {
                break;
            }
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn target(&mut self) -> Result<Target> {
        let first = self.target_atom()?;
        if !self.at_sym(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_sym(",") {
            if self.at_keyword("in") {
                break;
            }
            items.push(self.target_atom()?);
        }
        Ok(Target::Tuple(items))
    }

    fn target_atom(&mut self) -> Result<Target> {
        if self.eat_sym("(") {
            let inner = self.nested(Self::target)?;
            self.expect_sym(")")?;
            return Ok(inner);
        }
        Ok(Target::Name(self.identifier()?))
    }

    // == Expressions ==
    /// `a, b, c` (a bare tuple) or a single expression.
    fn testlist(&mut self) -> Result<Expr> {
        let first = self.test()?;
        if !self.at_sym(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_sym(",") {
            if self.ends_testlist() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn ends_testlist(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent)
            || self.at_sym("=")
            || self.at_sym(")")
            || self.at_sym(":")
    }

    fn test(&mut self) -> Result<Expr> {
        self.nested(Self::test_inner)
    }

    fn test_inner(&mut self) -> Result<Expr> {
        if self.eat_keyword("lambda") {
            return self.lambda();
        }
        let value = self.or_test()?;
        if self.eat_keyword("if") {
            let cond = self.or_test()?;
            self.expect_keyword("else")?;
            let otherwise = self.test()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn lambda(&mut self) -> Result<Expr> {
        let mut params = Vec::new();
        if !self.at_sym(":") {
            params.push(self.identifier()?);
            while self.eat_sym(",") {
                params.push(self.identifier()?);
            }
        }
        self.expect_sym(":")?;
        let body = self.test()?;
        Ok(Expr::Lambda(Box::new(Lambda { params, body })))
    }

    fn or_test(&mut self) -> Result<Expr> {
        let mut left = self.and_test()?;
        while self.eat_keyword("or") {
            self.link()?;
            let right = self.and_test()?;
            left = Expr::Bool(BoolOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr> {
        let mut left = self.not_test()?;
        while self.eat_keyword("and") {
            self.link()?;
            let right = self.not_test()?;
            left = Expr::Bool(BoolOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let operand = self.nested(Self::not_test)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expr::Compare(Box::new(first), rest))
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let followed_by = |word: &str| matches!(self.peek_at(1), Tok::Name(m) if m == word);
        let (op, width) = match self.peek() {
            Tok::Sym("==") => (CmpOp::Eq, 1),
            Tok::Sym("!=") => (CmpOp::NotEq, 1),
            Tok::Sym("<") => (CmpOp::Lt, 1),
            Tok::Sym("<=") => (CmpOp::LtE, 1),
            Tok::Sym(">") => (CmpOp::Gt, 1),
            Tok::Sym(">=") => (CmpOp::GtE, 1),
            Tok::Name(n) if n == "in" => (CmpOp::In, 1),
            Tok::Name(n) if n == "not" && followed_by("in") => (CmpOp::NotIn, 2),
            // `is` only ever compares against None here, so equality suffices
            Tok::Name(n) if n == "is" && followed_by("not") => (CmpOp::NotEq, 2),
            Tok::Name(n) if n == "is" => (CmpOp::Eq, 1),
            _ => return None,
        };
        for _ in 0..width {
            self.advance();
        }
        Some(op)
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOp::Add
            } else if self.eat_sym("-") {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            self.link()?;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOp::Mul
            } else if self.eat_sym("/") {
                BinOp::Div
            } else if self.eat_sym("//") {
                BinOp::FloorDiv
            } else if self.eat_sym("%") {
                BinOp::Mod
            } else {
                return Ok(left);
            };
            self.link()?;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn factor(&mut self) -> Result<Expr> {
        if self.eat_sym("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::factor)?)));
        }
        if self.eat_sym("+") {
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.nested(Self::factor)?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.eat_sym("**") {
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.at_sym("(") || self.at_sym("[") || self.at_sym(".") {
                self.link()?;
            }
            if self.eat_sym("(") {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_sym("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_sym(".") {
                let name = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(self.error("expected attribute name")),
                };
                if name.starts_with('_') {
                    return Err(self.error(format!("access to attribute '{}' is not allowed", name)));
                }
                expr = Expr::Attribute(Box::new(expr), name);
            } else {
                return Ok(expr);
            }
        }
    }

    fn subscript(&mut self, target: Expr) -> Result<Expr> {
        let lower = if self.at_sym(":") {
            None
        } else {
            Some(self.test()?)
        };

        if self.eat_sym(":") {
            let upper = if self.at_sym("]") {
                None
            } else {
                Some(Box::new(self.test()?))
            };
            self.expect_sym("]")?;
            return Ok(Expr::Slice {
                target: Box::new(target),
                lower: lower.map(Box::new),
                upper,
            });
        }

        self.expect_sym("]")?;
        let index = lower.ok_or_else(|| self.error("empty subscript"))?;
        Ok(Expr::Index(Box::new(target), Box::new(index)))
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.eat_sym(")") {
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_at(1), Tok::Sym("="));
            if is_keyword {
                let name = self.identifier()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let arg = self.test()?;
                if self.at_keyword("for") {
                    // bare generator argument: sum(x for x in xs)
                    let clauses = self.comprehension_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        clauses,
                    });
                } else {
                    args.push(arg);
                }
            }

            if !self.eat_sym(",") {
                self.expect_sym(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn comprehension_clauses(&mut self) -> Result<Vec<Clause>> {
        let mut clauses = Vec::new();
        while self.eat_keyword("for") {
            // each clause runs one loop level deeper
            if self.depth + clauses.len() >= MAX_NESTING {
                return Err(self.error("too deeply nested"));
            }
            let target = self.target()?;
            self.expect_keyword("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.or_test()?);
            }
            clauses.push(Clause {
                target,
                iter,
                conditions,
            });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Tok::Float(f) => Ok(Expr::Literal(float_value(f))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Name(name) => {
                match name.as_str() {
                    "None" => return Ok(Expr::Literal(Value::Null)),
                    "True" => return Ok(Expr::Literal(Value::Bool(true))),
                    "False" => return Ok(Expr::Literal(Value::Bool(false))),
                    _ => {}
                }
                if FORBIDDEN.contains(&name.as_str()) {
                    return Err(self.error(format!("'{}' is not allowed in processing code", name)));
                }
                if is_reserved(&name) {
                    self.pos -= 1;
                    return Err(self.unexpected());
                }
                Ok(Expr::Name(name))
            }
            Tok::Sym("(") => self.paren(),
            Tok::Sym("[") => self.list_display(),
            Tok::Sym("{") => self.dict_display(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    fn paren(&mut self) -> Result<Expr> {
        if self.eat_sym(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.test()?;
        if self.at_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_sym(")")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }
        if self.eat_sym(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_sym(",") {
            if self.at_sym(")") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_sym(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_display(&mut self) -> Result<Expr> {
        if self.eat_sym("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.test()?;
        if self.at_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_sym("]")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat_sym(",") {
            if self.at_sym("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_sym("]")?;
        Ok(Expr::List(items))
    }

    fn dict_display(&mut self) -> Result<Expr> {
        if self.eat_sym("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.test()?;
        if !self.eat_sym(":") {
            return Err(self.error("set literals are not supported, use set([...])"));
        }
        let value = self.test()?;
        if self.at_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_sym("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                clauses,
            });
        }
        let mut entries = vec![(key, value)];
        while self.eat_sym(",") {
            if self.at_sym("}") {
                break;
            }
            let key = self.test()?;
            self.expect_sym(":")?;
            entries.push((key, self.test()?));
        }
        self.expect_sym("}")?;
        Ok(Expr::Dict(entries))
    }
}

fn is_reserved(word: &str) -> bool {
    KEYWORDS.contains(&word) || word == "False" || FORBIDDEN.contains(&word)
}

fn assign_target(expr: Expr) -> Option<AssignTarget> {
    match expr {
        Expr::Name(name) => Some(AssignTarget::Name(name)),
        Expr::Index(base, index) if is_place(&base) => Some(AssignTarget::Index(*base, *index)),
        Expr::Tuple(items) => items
            .into_iter()
            .map(unpack_target)
            .collect::<Option<Vec<_>>>()
            .map(|targets| AssignTarget::Unpack(Target::Tuple(targets))),
        _ => None,
    }
}

fn unpack_target(expr: Expr) -> Option<Target> {
    match expr {
        Expr::Name(name) => Some(Target::Name(name)),
        Expr::Tuple(items) => items
            .into_iter()
            .map(unpack_target)
            .collect::<Option<Vec<_>>>()
            .map(Target::Tuple),
        _ => None,
    }
}

/// A name or a chain of subscripts rooted at a name.
pub fn is_place(expr: &Expr) -> bool {
    match expr {
        Expr::Name(_) => true,
        Expr::Index(base, _) => is_place(base),
        _ => false,
    }
}
