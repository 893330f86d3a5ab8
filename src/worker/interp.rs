//! Tree-walking interpreter for cell code.
//!
//! One [`Interpreter`] lives for as long as its worker's namespace; statements
//! that completed before an error keep their effects.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::lang::ast::{
    BinOp, BoolOp, CmpOp, Expr, Module, Stmt, StmtKind, Target, UnaryOp,
};

use super::builtins;
use super::value::{Function, FunctionBody, Number, Value};

pub const MAX_CALL_DEPTH: usize = 200;
/// Upper bound on list/string lengths a single operation may produce.
pub const MAX_SEQUENCE_LEN: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}

/// A guest-level exception.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: &'static str,
    pub message: String,
    /// Innermost frame first.
    pub frames: Vec<TraceFrame>,
    pending_line: Option<usize>,
}

impl RuntimeError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
            pending_line: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    fn at_line(mut self, line: usize) -> Self {
        if self.pending_line.is_none() {
            self.pending_line = Some(line);
        }
        self
    }

    fn close_frame(&mut self, function: &str) {
        if let Some(line) = self.pending_line.take() {
            self.frames.push(TraceFrame {
                function: function.to_string(),
                line,
            });
        }
    }

    /// Python-style traceback text, outermost frame first.
    pub fn traceback(&self) -> String {
        let mut frames = self.frames.clone();
        if let Some(line) = self.pending_line {
            frames.push(TraceFrame {
                function: "<cell>".to_string(),
                line,
            });
        }
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in frames.iter().rev() {
            out.push_str(&format!("  line {}, in {}\n", frame.line, frame.function));
        }
        out.push_str(&format!("{}: {}", self.kind, self.message));
        out
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

pub type RResult<T> = Result<T, RuntimeError>;

/// A variable scope. The namespace is the root scope; each function call gets
/// a child whose parent is the defining function's scope.
#[derive(Default)]
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn child(parent: Option<Rc<Scope>>) -> Rc<Self> {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent,
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    fn contains_local(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }
}

struct Frame {
    locals: Rc<Scope>,
    globals_declared: HashSet<String>,
    nonlocals_declared: HashSet<String>,
    /// Whether `locals` is the namespace itself (module level).
    module_level: bool,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter {
    globals: Rc<Scope>,
    frames: Vec<Frame>,
    output: Option<String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let globals = Scope::child(None);
        Self {
            frames: vec![Frame {
                locals: globals.clone(),
                globals_declared: HashSet::new(),
                nonlocals_declared: HashSet::new(),
                module_level: true,
            }],
            globals,
            output: None,
        }
    }

    pub fn globals(&self) -> &Rc<Scope> {
        &self.globals
    }

    /// Start collecting `print` output; `false` discards it instead.
    pub fn begin_capture(&mut self, capture: bool) {
        self.output = capture.then(String::new);
    }

    pub fn take_output(&mut self) -> String {
        self.output.take().unwrap_or_default()
    }

    pub fn write_output(&mut self, text: &str) {
        if let Some(output) = self.output.as_mut() {
            output.push_str(text);
        }
    }

    pub fn run_module(&mut self, module: &Module) -> RResult<()> {
        self.run_statements(&module.body)
    }

    /// Execute top-level statements; loop control cannot escape a module.
    pub fn run_statements(&mut self, body: &[Stmt]) -> RResult<()> {
        for stmt in body {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    /// Evaluate a top-level expression, attributing errors to `line`.
    pub fn eval_at(&mut self, expr: &Expr, line: usize) -> RResult<Value> {
        self.eval(expr).map_err(|e| e.at_line(line))
    }

    fn frame(&self) -> &Frame {
        // The module frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    // --- names ---

    fn lookup(&self, name: &str) -> RResult<Value> {
        let frame = self.frame();
        let found = if frame.globals_declared.contains(name) {
            self.globals.get(name)
        } else {
            frame.locals.get(name).or_else(|| self.globals.get(name))
        };
        found
            .or_else(|| builtins::lookup(name))
            .ok_or_else(|| RuntimeError::new("NameError", format!("name '{name}' is not defined")))
    }

    fn assign(&mut self, name: &str, value: Value) -> RResult<()> {
        let frame = self.frame();
        if frame.module_level || frame.globals_declared.contains(name) {
            self.globals.set(name, value);
            return Ok(());
        }
        if frame.nonlocals_declared.contains(name) {
            let mut scope = frame.locals.parent.clone();
            while let Some(current) = scope {
                if current.contains_local(name) {
                    current.set(name, value);
                    return Ok(());
                }
                scope = current.parent.clone();
            }
            return Err(RuntimeError::new(
                "SyntaxError",
                format!("no binding for nonlocal '{name}' found"),
            ));
        }
        frame.locals.set(name, value);
        Ok(())
    }

    // --- statements ---

    fn exec_block(&mut self, body: &[Stmt]) -> RResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> RResult<Flow> {
        self.exec_stmt_inner(stmt).map_err(|e| e.at_line(stmt.line))
    }

    fn exec_stmt_inner(&mut self, stmt: &Stmt) -> RResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value)?;
                self.store(target, value)?;
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => self.lookup(name)?,
                    Target::Subscript { value, index } => {
                        let container = self.eval(value)?;
                        let index = self.eval(index)?;
                        builtins::subscript(&container, &index)?
                    }
                };
                let rhs = self.eval(value)?;
                let result = binary(*op, &current, &rhs)?;
                self.store(target, result)?;
            }
            StmtKind::FunctionDef { name, params, body } => {
                let closure = (!self.frame().module_level).then(|| self.frame().locals.clone());
                let function = Function {
                    name: name.clone(),
                    params: params.clone(),
                    body: FunctionBody::Block(Rc::new(body.clone())),
                    closure,
                };
                self.assign(name, Value::Function(Rc::new(function)))?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test)?.truthy() { body } else { orelse };
                return self.exec_block(branch);
            }
            StmtKind::While { test, body } => {
                while self.eval(test)?.truthy() {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let items = builtins::iterate(&self.eval(iter)?)?;
                for item in items {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Import(names) => {
                for alias in names {
                    let module = builtins::import_module(&alias.name)?;
                    self.assign(alias.bound_name(), Value::Module(module))?;
                }
            }
            StmtKind::ImportFrom {
                module,
                level,
                names,
            } => {
                let module = match module {
                    Some(module) if *level == 0 => builtins::import_module(module)?,
                    _ => {
                        return Err(RuntimeError::new(
                            "ImportError",
                            "attempted relative import with no known parent package",
                        ))
                    }
                };
                for alias in names {
                    if alias.name == "*" {
                        for (name, value) in &module.attrs {
                            self.assign(name, value.clone())?;
                        }
                        continue;
                    }
                    let value = module.attrs.get(&alias.name).cloned().ok_or_else(|| {
                        RuntimeError::new(
                            "ImportError",
                            format!("cannot import name '{}' from '{}'", alias.name, module.name),
                        )
                    })?;
                    self.assign(alias.bound_name(), value)?;
                }
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.globals_declared.extend(names.iter().cloned());
                }
            }
            StmtKind::Nonlocal(names) => {
                if self.frame().module_level {
                    return Err(RuntimeError::new(
                        "SyntaxError",
                        "nonlocal declaration not allowed at module level",
                    ));
                }
                if let Some(frame) = self.frames.last_mut() {
                    frame.nonlocals_declared.extend(names.iter().cloned());
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn store(&mut self, target: &Target, value: Value) -> RResult<()> {
        match target {
            Target::Name(name) => self.assign(name, value),
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                builtins::store_subscript(&container, &index, value)
            }
        }
    }

    // --- expressions ---

    pub fn eval(&mut self, expr: &Expr) -> RResult<Value> {
        match expr {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::str(s.as_str())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<RResult<Vec<_>>>()?;
                Ok(Value::list(values))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary(*op, &value)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Call { func, args } => {
                let callee = self.eval(func)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<RResult<Vec<_>>>()?;
                self.call(&callee, args)
            }
            Expr::Attribute { value, attr } => {
                let value = self.eval(value)?;
                builtins::attribute(&value, attr)
            }
            Expr::Subscript { value, index } => {
                let value = self.eval(value)?;
                let index = self.eval(index)?;
                builtins::subscript(&value, &index)
            }
            Expr::Lambda { params, body } => {
                let closure = (!self.frame().module_level).then(|| self.frame().locals.clone());
                Ok(Value::Function(Rc::new(Function {
                    name: "<lambda>".to_string(),
                    params: params.clone(),
                    body: FunctionBody::Expr(Rc::new((**body).clone())),
                    closure,
                })))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
        }
    }

    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> RResult<Value> {
        match callee {
            Value::Builtin(builtin) => (builtin.func)(self, args),
            Value::Method { receiver, name } => builtins::call_method(receiver, name, args),
            Value::Function(function) => self.call_function(function, args),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(&mut self, function: &Rc<Function>, args: Vec<Value>) -> RResult<Value> {
        if args.len() != function.params.len() {
            return Err(RuntimeError::type_error(format!(
                "{}() takes {} positional argument(s) but {} were given",
                function.name,
                function.params.len(),
                args.len()
            )));
        }
        if self.frames.len() > MAX_CALL_DEPTH {
            return Err(RuntimeError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            ));
        }
        let locals = Scope::child(function.closure.clone());
        for (param, arg) in function.params.iter().zip(args) {
            locals.set(param, arg);
        }
        self.frames.push(Frame {
            locals,
            globals_declared: HashSet::new(),
            nonlocals_declared: HashSet::new(),
            module_level: false,
        });
        let result = match &function.body {
            FunctionBody::Block(body) => self.exec_block(body).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            FunctionBody::Expr(expr) => self.eval(expr),
        };
        self.frames.pop();
        result.map_err(|mut err| {
            err.close_frame(&function.name);
            err
        })
    }
}

// --- operators ---

fn unary(op: UnaryOp, value: &Value) -> RResult<Value> {
    match (op, value.as_number()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Some(Number::Int(i))) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Neg, Some(Number::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Number::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Number::Float(f))) => Ok(Value::Float(f)),
        (_, None) => Err(RuntimeError::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            value.type_name()
        ))),
    }
}

fn overflow() -> RuntimeError {
    RuntimeError::new("OverflowError", "integer overflow")
}

fn zero_division(message: &str) -> RuntimeError {
    RuntimeError::new("ZeroDivisionError", message)
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn repeat_len(len: usize, times: i64) -> RResult<usize> {
    let times = usize::try_from(times.max(0)).map_err(|_| overflow())?;
    let total = len.checked_mul(times).ok_or_else(overflow)?;
    if total > MAX_SEQUENCE_LEN {
        return Err(RuntimeError::new("MemoryError", "sequence is too large"));
    }
    Ok(times)
}

fn concat_len(left: usize, right: usize) -> RResult<usize> {
    let total = left.checked_add(right).ok_or_else(overflow)?;
    if total > MAX_SEQUENCE_LEN {
        return Err(RuntimeError::new("MemoryError", "sequence is too large"));
    }
    Ok(total)
}

pub fn binary(op: BinOp, left: &Value, right: &Value) -> RResult<Value> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return numeric(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            concat_len(a.len(), b.len())?;
            Ok(Value::str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            concat_len(a.borrow().len(), b.borrow().len())?;
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s))
            if matches!(count.as_number(), Some(Number::Int(_))) =>
        {
            let Some(Number::Int(n)) = count.as_number() else {
                return Err(unsupported(op, left, right));
            };
            let times = repeat_len(s.len(), n)?;
            Ok(Value::str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items))
            if matches!(count.as_number(), Some(Number::Int(_))) =>
        {
            let Some(Number::Int(n)) = count.as_number() else {
                return Err(unsupported(op, left, right));
            };
            let items = items.borrow();
            let times = repeat_len(items.len(), n)?;
            let mut out = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        _ => Err(unsupported(op, left, right)),
    }
}

fn numeric(op: BinOp, a: Number, b: Number) -> RResult<Value> {
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        return match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    Err(zero_division("division by zero"))
                } else {
                    Ok(Value::Float(x as f64 / y as f64))
                }
            }
            BinOp::FloorDiv | BinOp::Mod => {
                if y == 0 {
                    return Err(zero_division("integer division or modulo by zero"));
                }
                let quotient = x.checked_div_euclid(y).ok_or_else(overflow)?;
                let remainder = x.rem_euclid(y);
                // Floor semantics: the remainder takes the sign of the divisor.
                let (q, r) = if remainder != 0 && y < 0 {
                    (quotient - 1, remainder + y)
                } else {
                    (quotient, remainder)
                };
                Ok(Value::Int(if op == BinOp::FloorDiv { q } else { r }))
            }
            BinOp::Pow => {
                if y < 0 {
                    Ok(Value::Float((x as f64).powf(y as f64)))
                } else {
                    let exp = u32::try_from(y).map_err(|_| overflow())?;
                    x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
                }
            }
        };
    }
    let (x, y) = (a.to_f64(), b.to_f64());
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => x.powf(y),
    };
    Ok(Value::Float(value))
}

fn comparison_too_deep() -> RuntimeError {
    RuntimeError::new(
        "RecursionError",
        "maximum recursion depth exceeded in comparison",
    )
}

/// Structural equality. Lists nested past `MAX_CALL_DEPTH` raise
/// `RecursionError`.
pub fn values_equal(left: &Value, right: &Value) -> RResult<bool> {
    equal_at(left, right, 0)
}

fn equal_at(left: &Value, right: &Value, depth: usize) -> RResult<bool> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return Ok(match (a, b) {
            (Number::Int(x), Number::Int(y)) => x == y,
            _ => a.to_f64() == b.to_f64(),
        });
    }
    Ok(match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            if Rc::ptr_eq(a, b) {
                return Ok(true);
            }
            if depth >= MAX_CALL_DEPTH {
                return Err(comparison_too_deep());
            }
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() != b.len() {
                return Ok(false);
            }
            for (x, y) in a.iter().zip(b.iter()) {
                if !equal_at(x, y, depth + 1)? {
                    return Ok(false);
                }
            }
            true
        }
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        _ => false,
    })
}

pub fn ordering(left: &Value, right: &Value, symbol: &str) -> RResult<std::cmp::Ordering> {
    order_at(left, right, symbol, 0)
}

fn order_at(
    left: &Value,
    right: &Value,
    symbol: &str,
    depth: usize,
) -> RResult<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return match (a, b) {
            (Number::Int(x), Number::Int(y)) => Ok(x.cmp(&y)),
            _ => a
                .to_f64()
                .partial_cmp(&b.to_f64())
                .ok_or_else(|| RuntimeError::value_error("cannot order NaN")),
        };
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            if Rc::ptr_eq(a, b) {
                return Ok(std::cmp::Ordering::Equal);
            }
            if depth >= MAX_CALL_DEPTH {
                return Err(comparison_too_deep());
            }
            let (a, b) = (a.borrow(), b.borrow());
            for (x, y) in a.iter().zip(b.iter()) {
                if !equal_at(x, y, depth + 1)? {
                    return order_at(x, y, symbol, depth + 1);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> RResult<bool> {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::NotEq => values_equal(left, right).map(|equal| !equal),
        CmpOp::Lt => Ok(ordering(left, right, op.symbol())? == Less),
        CmpOp::LtE => Ok(ordering(left, right, op.symbol())? != Greater),
        CmpOp::Gt => Ok(ordering(left, right, op.symbol())? == Greater),
        CmpOp::GtE => Ok(ordering(left, right, op.symbol())? != Less),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn run(source: &str) -> RResult<Interpreter> {
        let mut interp = Interpreter::new();
        interp.begin_capture(true);
        interp.run_module(&parse(source).unwrap())?;
        Ok(interp)
    }

    fn global(interp: &Interpreter, name: &str) -> String {
        interp.globals().get(name).map(|v| v.repr()).unwrap_or_default()
    }

    fn error(source: &str) -> RuntimeError {
        match run(source) {
            Err(err) => err,
            Ok(_) => panic!("expected {source:?} to raise"),
        }
    }

    #[test]
    fn arithmetic_follows_python_semantics() {
        let interp = run("a = 7 // 2\nb = -7 // 2\nc = -7 % 3\nd = 7 / 2\ne = 2 ** 10\nf = 2 ** -1\ng = True + 1").unwrap();
        assert_eq!(global(&interp, "a"), "3");
        assert_eq!(global(&interp, "b"), "-4");
        assert_eq!(global(&interp, "c"), "2");
        assert_eq!(global(&interp, "d"), "3.5");
        assert_eq!(global(&interp, "e"), "1024");
        assert_eq!(global(&interp, "f"), "0.5");
        assert_eq!(global(&interp, "g"), "2");
    }

    #[test]
    fn integer_overflow_is_an_error_not_a_wrap() {
        assert_eq!(error("x = 2 ** 64").kind, "OverflowError");
    }

    #[test]
    fn division_by_zero() {
        assert_eq!(error("1 / 0").kind, "ZeroDivisionError");
        assert_eq!(error("1 % 0").kind, "ZeroDivisionError");
        assert_eq!(error("1.0 // 0").kind, "ZeroDivisionError");
    }

    #[test]
    fn functions_closures_and_recursion() {
        let source = "def fact(n):\n    if n <= 1:\n        return 1\n    return n * fact(n - 1)\n\ndef adder(k):\n    return lambda x: x + k\n\nr = fact(10)\ns = adder(5)(1)\n";
        let interp = run(source).unwrap();
        assert_eq!(global(&interp, "r"), "3628800");
        assert_eq!(global(&interp, "s"), "6");
    }

    #[test]
    fn function_locals_do_not_leak() {
        let interp = run("def f():\n    hidden = 1\n    return hidden\nv = f()").unwrap();
        assert!(interp.globals().get("hidden").is_none());
        assert_eq!(global(&interp, "v"), "1");
    }

    #[test]
    fn global_and_nonlocal_rebind_outer_names() {
        let source = "count = 0\ndef bump():\n    global count\n    count += 1\nbump()\nbump()\ndef outer():\n    v = 1\n    def inner():\n        nonlocal v\n        v = 2\n    inner()\n    return v\nw = outer()\n";
        let interp = run(source).unwrap();
        assert_eq!(global(&interp, "count"), "2");
        assert_eq!(global(&interp, "w"), "2");
    }

    #[test]
    fn loops_and_control_flow() {
        let source = "total = 0\nfor i in range(10):\n    if i == 3:\n        continue\n    if i == 6:\n        break\n    total += i\nn = 0\nwhile True:\n    n += 1\n    if n >= 5: break\n";
        let interp = run(source).unwrap();
        assert_eq!(global(&interp, "total"), "12");
        assert_eq!(global(&interp, "n"), "5");
    }

    #[test]
    fn lists_support_methods_and_subscripts() {
        let interp = run("xs = [3, 1, 2]\nxs.append(5)\nxs[0] = 4\nys = sorted(xs)\nlast = xs[-1]").unwrap();
        assert_eq!(global(&interp, "xs"), "[4, 1, 2, 5]");
        assert_eq!(global(&interp, "ys"), "[1, 2, 4, 5]");
        assert_eq!(global(&interp, "last"), "5");
    }

    #[test]
    fn print_goes_to_the_capture_buffer() {
        let mut interp = run("print('a', 1)\nprint([1, 2])").unwrap();
        assert_eq!(interp.take_output(), "a 1\n[1, 2]\n");
    }

    #[test]
    fn name_errors_and_tracebacks() {
        let err = error("def f():\n    return missing\n\nx = 1\nf()");
        assert_eq!(err.kind, "NameError");
        assert_eq!(err.message, "name 'missing' is not defined");
        assert_eq!(
            err.traceback(),
            "Traceback (most recent call last):\n  line 5, in <cell>\n  line 2, in f\nNameError: name 'missing' is not defined"
        );
    }

    #[test]
    fn recursion_is_bounded() {
        let err = std::thread::Builder::new()
            .stack_size(256 << 20)
            .spawn(|| error("def f(n):\n    return f(n + 1)\nf(0)"))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(err.kind, "RecursionError");
    }

    #[test]
    fn import_from_math() {
        let interp = run("from math import sqrt, pi as p\nimport math\nr = sqrt(16)\nq = math.floor(p)").unwrap();
        assert_eq!(global(&interp, "r"), "4.0");
        assert_eq!(global(&interp, "q"), "3");
        assert_eq!(error("import os").kind, "ModuleNotFoundError");
        assert_eq!(error("from math import nope").kind, "ImportError");
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let interp = run("a = 1 < 2.5\nb = 'a' < 'b'\nc = [1, 2] == [1, 2]\nd = 0 or 'x'\ne = 1 and None\nf = 3 if a else 4").unwrap();
        assert_eq!(global(&interp, "a"), "True");
        assert_eq!(global(&interp, "b"), "True");
        assert_eq!(global(&interp, "c"), "True");
        assert_eq!(global(&interp, "d"), "'x'");
        assert_eq!(global(&interp, "e"), "None");
        assert_eq!(global(&interp, "f"), "3");
        assert_eq!(error("1 < 'a'").kind, "TypeError");
    }

    #[test]
    fn committed_statements_survive_a_later_error() {
        let mut interp = Interpreter::new();
        let module = parse("kept = 1\n1 / 0\nlost = 2").unwrap();
        assert!(interp.run_module(&module).is_err());
        assert!(interp.globals().get("kept").is_some());
        assert!(interp.globals().get("lost").is_none());
    }

    #[test]
    fn oversized_repetition_is_refused() {
        assert_eq!(error("'ab' * 100000000").kind, "MemoryError");
    }

    #[test]
    fn doubling_concatenation_is_refused() {
        let err = error("s = 'x'\nwhile True:\n    s = s + s");
        assert_eq!(err.kind, "MemoryError");
        assert_eq!(error("'x' * 6000000 + 'y' * 6000000").kind, "MemoryError");
    }

    #[test]
    fn comparing_self_containing_lists_raises() {
        let source = "a = []\na.append(a)\nb = []\nb.append(b)\n";
        assert_eq!(error(&format!("{source}a == b")).kind, "RecursionError");
        assert_eq!(error(&format!("{source}a < b")).kind, "RecursionError");
        let interp = run(&format!("{source}same = a == a\nn = a.count(a)")).unwrap();
        assert_eq!(global(&interp, "same"), "True");
        assert_eq!(global(&interp, "n"), "1");
    }

    #[test]
    fn shallow_nested_lists_still_compare() {
        let interp = run("a = [[1, [2]], 3]\nb = [[1, [2]], 3]\nc = [[1, [3]]]\neq = a == b\nlt = a < c").unwrap();
        assert_eq!(global(&interp, "eq"), "True");
        assert_eq!(global(&interp, "lt"), "True");
    }
}
