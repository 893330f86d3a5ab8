//! Runtime values of the cell interpreter and their textual renderings.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::ops::Deref;
use std::rc::Rc;

use crate::lang::ast::{Expr, Stmt};

use super::interp::{Interpreter, RuntimeError, Scope};

/// Lists nested deeper than this render as `[...]`.
const MAX_REPR_DEPTH: usize = 64;
/// List elements one rendering may visit before it gives up.
const MAX_RENDER_ITEMS: usize = 1_000_000;

pub type BuiltinFn = fn(&mut Interpreter, Vec<Value>) -> Result<Value, RuntimeError>;

#[derive(Clone)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

pub enum FunctionBody {
    Block(Rc<Vec<Stmt>>),
    Expr(Rc<Expr>),
}

pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: FunctionBody,
    /// Enclosing function scope for nested definitions; `None` at module level.
    pub closure: Option<Rc<Scope>>,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

pub struct ModuleObject {
    pub name: String,
    pub attrs: BTreeMap<String, Value>,
}

impl fmt::Debug for ModuleObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<module '{}'>", self.name)
    }
}

/// Storage behind a list value.
pub struct ListCell(RefCell<Vec<Value>>);

impl ListCell {
    pub fn new(items: Vec<Value>) -> Self {
        Self(RefCell::new(items))
    }
}

impl Deref for ListCell {
    type Target = RefCell<Vec<Value>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ListCell {
    /// Unlinks uniquely owned nested lists one at a time, so dropping a
    /// deeply nested list uses constant stack.
    fn drop(&mut self) {
        let mut pending = std::mem::take(self.0.get_mut());
        while let Some(value) = pending.pop() {
            if let Value::List(list) = value {
                if let Ok(mut cell) = Rc::try_unwrap(list) {
                    pending.append(cell.0.get_mut());
                }
            }
        }
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<ListCell>),
    Function(Rc<Function>),
    Builtin(Builtin),
    Module(Rc<ModuleObject>),
    Method { receiver: Box<Value>, name: String },
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(ListCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::Method { .. } => "method",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            _ => true,
        }
    }

    /// Numeric view used by arithmetic; bools count as integers.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// `repr()` form, used for cell results.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Render::new());
        out
    }

    /// `str()` form, used by `print`.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, render: &mut Render) {
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&repr_str(s)),
            Value::List(items) => {
                if !render.enter(items) {
                    out.push_str("[...]");
                    return;
                }
                out.push('[');
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if !render.spend() {
                        out.push_str("...");
                        break;
                    }
                    item.write_repr(out, render);
                }
                out.push(']');
                render.leave();
            }
            Value::Function(func) => {
                let _ = write!(out, "<function {}>", func.name);
            }
            Value::Builtin(builtin) => {
                let _ = write!(out, "<built-in function {}>", builtin.name);
            }
            Value::Module(module) => {
                let _ = write!(out, "<module '{}'>", module.name);
            }
            Value::Method { receiver, name } => {
                let _ = write!(
                    out,
                    "<bound method {}.{}>",
                    receiver.type_name(),
                    name
                );
            }
        }
    }

    /// LaTeX rendering; `None` for values that have no mathematical form.
    pub fn latex(&self) -> Option<String> {
        self.latex_with(&mut Render::new())
    }

    fn latex_with(&self, render: &mut Render) -> Option<String> {
        match self {
            Value::Bool(b) => Some(format!("\\mathrm{{{}}}", if *b { "True" } else { "False" })),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(latex_float(*f)),
            Value::Str(s) => Some(format!("\\text{{{}}}", latex_escape(s))),
            Value::List(items) => {
                if !render.enter(items) {
                    return None;
                }
                let parts = items
                    .borrow()
                    .iter()
                    .map(|item| {
                        if render.spend() {
                            item.latex_with(render)
                        } else {
                            None
                        }
                    })
                    .collect::<Option<Vec<_>>>();
                render.leave();
                Some(format!("\\left[{}\\right]", parts?.join(", ")))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Bookkeeping for one `repr` or LaTeX rendering.
struct Render {
    /// Lists currently open, innermost last.
    open: Vec<*const ListCell>,
    budget: usize,
}

impl Render {
    fn new() -> Self {
        Self {
            open: Vec::new(),
            budget: MAX_RENDER_ITEMS,
        }
    }

    /// Open `list` unless it is already open or nesting is too deep.
    fn enter(&mut self, list: &Rc<ListCell>) -> bool {
        let ptr = Rc::as_ptr(list);
        if self.open.len() >= MAX_REPR_DEPTH || self.open.contains(&ptr) {
            return false;
        }
        self.open.push(ptr);
        true
    }

    fn leave(&mut self) {
        self.open.pop();
    }

    fn spend(&mut self) -> bool {
        match self.budget.checked_sub(1) {
            Some(left) => {
                self.budget = left;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Shortest round-trip float text with an explicit exponent sign, so `1e16`
/// renders as `1e+16` and `1e-7` as `1e-07`.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let text = format!("{value:?}");
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text,
    }
}

fn latex_float(value: f64) -> String {
    if !value.is_finite() {
        return match format_float(value).as_str() {
            "inf" => "\\infty".to_string(),
            "-inf" => "-\\infty".to_string(),
            _ => "\\mathrm{NaN}".to_string(),
        };
    }
    let text = format_float(value);
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            format!("{mantissa} \\times 10^{{{exponent}}}")
        }
        None => text,
    }
}

fn latex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\textbackslash{}"),
            '{' | '}' | '$' | '&' | '#' | '_' | '%' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn repr_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
