//! Recursive-descent parser producing the tree in [`super::ast`].

use super::ast::{Alias, BinOp, BoolOp, CmpOp, Expr, Module, Stmt, StmtKind, Target, UnaryOp};
use super::lexer::{Tok, Token};
use super::ParseError;

/// Deepest bracket/expression/block nesting accepted before parsing gives up.
pub const MAX_NESTING: usize = 200;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
    function_depth: usize,
    loop_depth: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
            function_depth: 0,
            loop_depth: 0,
        }
    }

    pub fn parse_module(mut self) -> PResult<Module> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => self.advance(),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Module { body })
    }

    // --- token helpers ---

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{op}'")))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn unexpected(&self, context: &str) -> ParseError {
        let found = match self.peek() {
            Tok::Name(n) => format!("'{n}'"),
            Tok::Keyword(k) => format!("'{k}'"),
            Tok::Int(i) => format!("'{i}'"),
            Tok::Float(f) => format!("'{f}'"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Op(o) => format!("'{o}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "unexpected indent".to_string(),
            Tok::Dedent => "unindent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        ParseError::new(self.line(), format!("{context}, found {found}"))
    }

    fn enter(&mut self) -> PResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(ParseError::new(self.line(), "too many nested levels"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    // --- statements ---

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let compound = match self.peek() {
            Tok::Keyword("if") => Some(self.if_statement()?),
            Tok::Keyword("while") => Some(self.while_statement()?),
            Tok::Keyword("for") => Some(self.for_statement()?),
            Tok::Keyword("def") => Some(self.function_def()?),
            Tok::Indent => return Err(ParseError::new(line, "unexpected indent")),
            _ => None,
        };
        match compound {
            Some(kind) => Ok(vec![Stmt { line, kind }]),
            None => self.simple_statements(),
        }
    }

    /// One or more `;`-separated simple statements terminated by a newline.
    fn simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            let line = self.line();
            let kind = self.simple_statement()?;
            stmts.push(Stmt { line, kind });
            if !self.eat_op(";") {
                break;
            }
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
        }
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(stmts)
            }
            Tok::Eof | Tok::Dedent => Ok(stmts),
            _ => Err(self.unexpected("invalid syntax")),
        }
    }

    fn simple_statement(&mut self) -> PResult<StmtKind> {
        let line = self.line();
        match self.peek() {
            Tok::Keyword("pass") => {
                self.advance();
                Ok(StmtKind::Pass)
            }
            Tok::Keyword("break") => {
                if self.loop_depth == 0 {
                    return Err(ParseError::new(line, "'break' outside loop"));
                }
                self.advance();
                Ok(StmtKind::Break)
            }
            Tok::Keyword("continue") => {
                if self.loop_depth == 0 {
                    return Err(ParseError::new(line, "'continue' not properly in loop"));
                }
                self.advance();
                Ok(StmtKind::Continue)
            }
            Tok::Keyword("return") => {
                if self.function_depth == 0 {
                    return Err(ParseError::new(line, "'return' outside function"));
                }
                self.advance();
                if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Op(";")) {
                    Ok(StmtKind::Return(None))
                } else {
                    Ok(StmtKind::Return(Some(self.expression()?)))
                }
            }
            Tok::Keyword("global") => {
                self.advance();
                Ok(StmtKind::Global(self.name_list()?))
            }
            Tok::Keyword("nonlocal") => {
                self.advance();
                Ok(StmtKind::Nonlocal(self.name_list()?))
            }
            Tok::Keyword("import") => {
                self.advance();
                self.import_names()
            }
            Tok::Keyword("from") => {
                self.advance();
                self.import_from()
            }
            _ => self.expression_statement(),
        }
    }

    fn name_list(&mut self) -> PResult<Vec<String>> {
        let mut names = vec![self.expect_name()?];
        while self.eat_op(",") {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn alias(&mut self, dotted: bool) -> PResult<Alias> {
        let name = if dotted {
            self.dotted_name()?
        } else {
            self.expect_name()?
        };
        let asname = if self.eat_keyword("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn import_names(&mut self) -> PResult<StmtKind> {
        let mut names = vec![self.alias(true)?];
        while self.eat_op(",") {
            names.push(self.alias(true)?);
        }
        Ok(StmtKind::Import(names))
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        let mut level = 0;
        while self.eat_op(".") {
            level += 1;
        }
        let module = if matches!(self.peek(), Tok::Name(_)) {
            Some(self.dotted_name()?)
        } else if level == 0 {
            return Err(self.unexpected("expected a module name"));
        } else {
            None
        };
        if !self.eat_keyword("import") {
            return Err(self.unexpected("expected 'import'"));
        }
        let names = if self.eat_op("*") {
            vec![Alias {
                name: "*".to_string(),
                asname: None,
            }]
        } else if self.eat_op("(") {
            let mut names = vec![self.alias(false)?];
            while self.eat_op(",") {
                if self.at_op(")") {
                    break;
                }
                names.push(self.alias(false)?);
            }
            self.expect_op(")")?;
            names
        } else {
            let mut names = vec![self.alias(false)?];
            while self.eat_op(",") {
                names.push(self.alias(false)?);
            }
            names
        };
        Ok(StmtKind::ImportFrom {
            module,
            level,
            names,
        })
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let expr = self.expression()?;
        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            let target = self.to_target(expr)?;
            self.advance();
            let value = self.expression()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }
        if self.at_op("=") {
            let target = self.to_target(expr)?;
            self.advance();
            let value = self.expression()?;
            if self.at_op("=") {
                return Err(ParseError::new(
                    self.line(),
                    "chained assignment is not supported",
                ));
            }
            return Ok(StmtKind::Assign { target, value });
        }
        Ok(StmtKind::Expr(expr))
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            _ => Err(ParseError::new(self.line(), "cannot assign to expression")),
        }
    }

    /// `:` followed by either an indented block or simple statements on the same line.
    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.enter()?;
        let body = if matches!(self.peek(), Tok::Newline) {
            self.advance();
            if !matches!(self.peek(), Tok::Indent) {
                return Err(ParseError::new(self.line(), "expected an indented block"));
            }
            self.advance();
            let mut body = Vec::new();
            loop {
                match self.peek() {
                    Tok::Dedent => {
                        self.advance();
                        break;
                    }
                    Tok::Eof => break,
                    Tok::Newline => self.advance(),
                    _ => body.extend(self.statement()?),
                }
            }
            body
        } else {
            self.simple_statements()?
        };
        self.leave();
        Ok(body)
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        self.advance();
        let test = self.expression()?;
        let body = self.block()?;
        let orelse = if self.at_keyword("elif") {
            let line = self.line();
            let kind = self.if_statement()?;
            vec![Stmt { line, kind }]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn loop_body(&mut self) -> PResult<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn while_statement(&mut self) -> PResult<StmtKind> {
        self.advance();
        let test = self.expression()?;
        let body = self.loop_body()?;
        Ok(StmtKind::While { test, body })
    }

    fn for_statement(&mut self) -> PResult<StmtKind> {
        self.advance();
        let target = self.expect_name()?;
        if !self.eat_keyword("in") {
            return Err(self.unexpected("expected 'in'"));
        }
        let iter = self.expression()?;
        let body = self.loop_body()?;
        Ok(StmtKind::For { target, iter, body })
    }

    fn function_def(&mut self) -> PResult<StmtKind> {
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let mut params = Vec::new();
        while !self.at_op(")") {
            params.push(self.expect_name()?);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        let saved_loops = std::mem::take(&mut self.loop_depth);
        self.function_depth += 1;
        let body = self.block();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;
        Ok(StmtKind::FunctionDef {
            name,
            params,
            body: body?,
        })
    }

    // --- expressions, lowest precedence first ---

    pub fn expression(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = if self.at_keyword("lambda") {
            self.lambda()
        } else {
            self.conditional()
        };
        self.leave();
        expr
    }

    fn lambda(&mut self) -> PResult<Expr> {
        self.advance();
        let mut params = Vec::new();
        while !self.at_op(":") {
            params.push(self.expect_name()?);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(":")?;
        let body = self.expression()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let body = self.or_expr()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let test = self.or_expr()?;
        if !self.eat_keyword("else") {
            return Err(self.unexpected("expected 'else'"));
        }
        let orelse = self.expression()?;
        Ok(Expr::IfExp {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.arith()?;
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.arith()?;
        if matches!(self.peek(), Tok::Op("==" | "!=" | "<" | "<=" | ">" | ">=")) {
            return Err(ParseError::new(
                self.line(),
                "chained comparisons are not supported",
            ));
        }
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        // Right associative, and binds tighter than a unary minus on its left.
        self.enter()?;
        let exponent = self.unary();
        self.leave();
        Ok(Expr::Binary {
            op: BinOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent?),
        })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let args = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else if self.eat_op("[") {
                let index = self.expression()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.at_op(")") {
            args.push(self.expression()?);
            if self.at_op("=") {
                return Err(ParseError::new(
                    self.line(),
                    "keyword arguments are not supported",
                ));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn atom(&mut self) -> PResult<Expr> {
        let expr = match self.peek().clone() {
            Tok::Int(value) => Expr::Int(value),
            Tok::Float(value) => Expr::Float(value),
            Tok::Str(mut text) => {
                self.advance();
                // Adjacent literals concatenate.
                while let Tok::Str(next) = self.peek() {
                    text.push_str(next);
                    self.advance();
                }
                return Ok(Expr::Str(text));
            }
            Tok::Name(name) => Expr::Name(name),
            Tok::Keyword("True") => Expr::Bool(true),
            Tok::Keyword("False") => Expr::Bool(false),
            Tok::Keyword("None") => Expr::None,
            Tok::Op("(") => {
                self.advance();
                let inner = self.expression()?;
                if self.at_op(",") {
                    return Err(ParseError::new(self.line(), "tuples are not supported"));
                }
                self.expect_op(")")?;
                return Ok(inner);
            }
            Tok::Op("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                return Ok(Expr::List(items));
            }
            _ => return Err(self.unexpected("invalid syntax")),
        };
        self.advance();
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use crate::lang::ast::*;
    use crate::lang::parse;

    fn single_expr(source: &str) -> Expr {
        let module = parse(source).unwrap();
        match module.body.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(expr)) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_of_arithmetic() {
        let expr = single_expr("1 + 2 * 3");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        let expr = single_expr("-2 ** 2");
        assert!(matches!(
            expr,
            Expr::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn attribute_call_shape() {
        let expr = single_expr("os.system('ls')");
        let Expr::Call { func, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert_eq!(
            *func,
            Expr::Attribute {
                value: Box::new(Expr::Name("os".into())),
                attr: "system".into()
            }
        );
    }

    #[test]
    fn parses_compound_statements() {
        let source = "def f(a, b):\n    if a > b:\n        return a\n    else:\n        return b\nfor i in range(3):\n    x = f(i, 1)\n";
        let module = parse(source).unwrap();
        assert_eq!(module.body.len(), 2);
        assert_eq!(module.body[1].line, 6);
        assert!(matches!(module.body[0].kind, StmtKind::FunctionDef { .. }));
    }

    #[test]
    fn parses_imports() {
        let module = parse("import math as m, os\nfrom sage.all import *\nfrom . import x").unwrap();
        let StmtKind::Import(names) = &module.body[0].kind else {
            panic!("expected import");
        };
        assert_eq!(names[0].bound_name(), "m");
        assert_eq!(names[1].bound_name(), "os");
        assert!(matches!(
            &module.body[1].kind,
            StmtKind::ImportFrom { module: Some(m), level: 0, .. } if m == "sage.all"
        ));
        assert!(matches!(
            &module.body[2].kind,
            StmtKind::ImportFrom {
                module: None,
                level: 1,
                ..
            }
        ));
    }

    #[test]
    fn semicolons_split_simple_statements() {
        let module = parse("x = 1; y = 2; x + y").unwrap();
        assert_eq!(module.body.len(), 3);
    }

    #[test]
    fn one_line_blocks() {
        let module = parse("if True: x = 1\nwhile False: pass").unwrap();
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn rejects_misplaced_control_flow() {
        assert!(parse("return 1").is_err());
        assert!(parse("break").is_err());
        assert!(parse("def f():\n    break\n").is_err());
        assert!(parse("while True:\n    def g():\n        continue\n").is_err());
    }

    #[test]
    fn rejects_unsupported_forms() {
        assert!(parse("f(x=1)").is_err());
        assert!(parse("a, b = 1, 2").is_err());
        assert!(parse("1 < 2 < 3").is_err());
        assert!(parse("x +").is_err());
        assert!(parse("  x = 1").is_err());
    }

    #[test]
    fn deep_nesting_is_a_parse_error_not_a_crash() {
        let source = format!("{}1{}", "(".repeat(5000), ")".repeat(5000));
        let err = std::thread::Builder::new()
            .stack_size(64 << 20)
            .spawn(move || parse(&source).unwrap_err())
            .unwrap()
            .join()
            .unwrap();
        assert!(err.message.contains("nested"));
    }
}
