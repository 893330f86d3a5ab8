//! Builtin functions, the `math` module, and container operations.

use std::collections::BTreeMap;
use std::rc::Rc;

use super::interp::{binary, ordering, values_equal, Interpreter, RResult, RuntimeError, MAX_SEQUENCE_LEN};
use super::value::{Builtin, BuiltinFn, ModuleObject, Number, Value};
use crate::lang::ast::BinOp;

const BUILTINS: &[(&str, BuiltinFn)] = &[
    ("abs", builtin_abs),
    ("bool", builtin_bool),
    ("float", builtin_float),
    ("int", builtin_int),
    ("len", builtin_len),
    ("list", builtin_list),
    ("max", builtin_max),
    ("min", builtin_min),
    ("pow", builtin_pow),
    ("print", builtin_print),
    ("range", builtin_range),
    ("repr", builtin_repr),
    ("round", builtin_round),
    ("sorted", builtin_sorted),
    ("str", builtin_str),
    ("sum", builtin_sum),
];

pub fn lookup(name: &str) -> Option<Value> {
    BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(name, func)| Value::Builtin(Builtin { name: *name, func: *func }))
}

/// Modules an `import` can resolve. Anything else raises `ModuleNotFoundError`
/// (the security policy normally rejects it before execution).
pub fn import_module(name: &str) -> RResult<Rc<ModuleObject>> {
    match name {
        "math" => Ok(Rc::new(math_module("math"))),
        // The numeric core of the Sage namespace is what cells rely on.
        "sage" | "sage.all" => Ok(Rc::new(math_module(name))),
        other => Err(RuntimeError::new(
            "ModuleNotFoundError",
            format!("No module named '{other}'"),
        )),
    }
}

fn math_module(name: &str) -> ModuleObject {
    const FUNCTIONS: &[(&str, BuiltinFn)] = &[
        ("acos", math_acos),
        ("asin", math_asin),
        ("atan", math_atan),
        ("atan2", math_atan2),
        ("ceil", math_ceil),
        ("cos", math_cos),
        ("exp", math_exp),
        ("fabs", math_fabs),
        ("factorial", math_factorial),
        ("floor", math_floor),
        ("gcd", math_gcd),
        ("log", math_log),
        ("log10", math_log10),
        ("sin", math_sin),
        ("sqrt", math_sqrt),
        ("tan", math_tan),
    ];
    let mut attrs: BTreeMap<String, Value> = FUNCTIONS
        .iter()
        .map(|(name, func)| {
            (
                name.to_string(),
                Value::Builtin(Builtin {
                    name: *name,
                    func: *func,
                }),
            )
        })
        .collect();
    attrs.insert("pi".into(), Value::Float(std::f64::consts::PI));
    attrs.insert("e".into(), Value::Float(std::f64::consts::E));
    attrs.insert("tau".into(), Value::Float(std::f64::consts::TAU));
    attrs.insert("inf".into(), Value::Float(f64::INFINITY));
    ModuleObject {
        name: name.to_string(),
        attrs,
    }
}

// --- argument helpers ---

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> RResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(RuntimeError::type_error(format!(
            "{name}() takes {expected} argument(s) ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn number(value: &Value) -> RResult<Number> {
    value.as_number().ok_or_else(|| {
        RuntimeError::type_error(format!("must be real number, not {}", value.type_name()))
    })
}

fn float_arg(value: &Value) -> RResult<f64> {
    number(value).map(Number::to_f64)
}

fn int_arg(value: &Value) -> RResult<i64> {
    match value.as_number() {
        Some(Number::Int(i)) => Ok(i),
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))),
    }
}

fn float_to_int(value: f64) -> RResult<i64> {
    if value.is_nan() {
        return Err(RuntimeError::value_error("cannot convert float NaN to integer"));
    }
    if value.is_infinite() || value >= 9.223_372_036_854_776e18 || value < -9.223_372_036_854_776e18 {
        return Err(RuntimeError::new(
            "OverflowError",
            "cannot convert float to integer",
        ));
    }
    Ok(value as i64)
}

fn domain_error() -> RuntimeError {
    RuntimeError::value_error("math domain error")
}

// --- builtins ---

fn builtin_print(interp: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    let line = args.iter().map(Value::display).collect::<Vec<_>>().join(" ");
    interp.write_output(&line);
    interp.write_output("\n");
    Ok(Value::None)
}

fn builtin_len(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("len", &args, 1, 1)?;
    let len = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        other => {
            return Err(RuntimeError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

fn builtin_range(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("range", &args, 1, 3)?;
    let ints = args.iter().map(int_arg).collect::<RResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked"),
    };
    if step == 0 {
        return Err(RuntimeError::value_error("range() arg 3 must not be zero"));
    }
    let span = if step > 0 {
        (stop as i128 - start as i128).max(0)
    } else {
        (start as i128 - stop as i128).max(0)
    };
    let count = (span + step.unsigned_abs() as i128 - 1) / step.unsigned_abs() as i128;
    if count > MAX_SEQUENCE_LEN as i128 {
        return Err(RuntimeError::new("MemoryError", "range is too large"));
    }
    let items = (0..count)
        .map(|i| Value::Int((start as i128 + i * step as i128) as i64))
        .collect();
    Ok(Value::list(items))
}

fn builtin_sum(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    for item in iterate(&args[0])? {
        total = binary(BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn extremum(name: &str, args: Vec<Value>, want: std::cmp::Ordering) -> RResult<Value> {
    let items = match args.len() {
        0 => {
            return Err(RuntimeError::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            )))
        }
        1 => iterate(&args[0])?,
        _ => args,
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| RuntimeError::value_error(format!("{name}() arg is an empty sequence")))?;
    for item in iter {
        let symbol = if want == std::cmp::Ordering::Less { "<" } else { ">" };
        if ordering(&item, &best, symbol)? == want {
            best = item;
        }
    }
    Ok(best)
}

fn builtin_min(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    extremum("min", args, std::cmp::Ordering::Less)
}

fn builtin_max(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    extremum("max", args, std::cmp::Ordering::Greater)
}

fn builtin_abs(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("abs", &args, 1, 1)?;
    match number(&args[0])? {
        Number::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| RuntimeError::new("OverflowError", "integer overflow")),
        Number::Float(f) => Ok(Value::Float(f.abs())),
    }
}

fn builtin_round(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("round", &args, 1, 2)?;
    let value = number(&args[0])?;
    match (value, args.get(1)) {
        (Number::Int(i), None) => Ok(Value::Int(i)),
        (Number::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (value, Some(digits)) => {
            let digits = int_arg(digits)?.clamp(-308, 308) as i32;
            let scale = 10f64.powi(digits);
            let rounded = (value.to_f64() * scale).round_ties_even() / scale;
            match value {
                Number::Int(_) => float_to_int(rounded).map(Value::Int),
                Number::Float(_) => Ok(Value::Float(rounded)),
            }
        }
    }
}

fn builtin_int(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("int", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Int(0)),
        Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            RuntimeError::value_error(format!("invalid literal for int() with base 10: {}", Value::Str(s.clone()).repr()))
        }),
        Some(other) => match number(other)? {
            Number::Int(i) => Ok(Value::Int(i)),
            Number::Float(f) => float_to_int(f.trunc()).map(Value::Int),
        },
    }
}

fn builtin_float(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("float", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Float(0.0)),
        Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            RuntimeError::value_error(format!(
                "could not convert string to float: {}",
                Value::Str(s.clone()).repr()
            ))
        }),
        Some(other) => float_arg(other).map(Value::Float),
    }
}

fn builtin_str(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("str", &args, 0, 1)?;
    Ok(Value::str(args.first().map(Value::display).unwrap_or_default()))
}

fn builtin_repr(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("repr", &args, 1, 1)?;
    Ok(Value::str(args[0].repr()))
}

fn builtin_bool(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("bool", &args, 0, 1)?;
    Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
}

fn builtin_list(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("list", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::list(Vec::new())),
        Some(value) => iterate(value).map(Value::list),
    }
}

fn builtin_sorted(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("sorted", &args, 1, 1)?;
    let mut items = iterate(&args[0])?;
    let mut failure = None;
    items.sort_by(|a, b| match ordering(a, b, "<") {
        Ok(ord) => ord,
        Err(err) => {
            failure.get_or_insert(err);
            std::cmp::Ordering::Equal
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(Value::list(items)),
    }
}

fn builtin_pow(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("pow", &args, 2, 2)?;
    binary(BinOp::Pow, &args[0], &args[1])
}

// --- math ---

fn unary_math(name: &str, args: &[Value], f: impl Fn(f64) -> Option<f64>) -> RResult<Value> {
    arity(name, args, 1, 1)?;
    f(float_arg(&args[0])?).map(Value::Float).ok_or_else(domain_error)
}

fn math_sin(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("sin", &args, |x| Some(x.sin()))
}

fn math_cos(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("cos", &args, |x| Some(x.cos()))
}

fn math_tan(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("tan", &args, |x| Some(x.tan()))
}

fn math_asin(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("asin", &args, |x| (-1.0..=1.0).contains(&x).then(|| x.asin()))
}

fn math_acos(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("acos", &args, |x| (-1.0..=1.0).contains(&x).then(|| x.acos()))
}

fn math_atan(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("atan", &args, |x| Some(x.atan()))
}

fn math_atan2(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("atan2", &args, 2, 2)?;
    Ok(Value::Float(float_arg(&args[0])?.atan2(float_arg(&args[1])?)))
}

fn math_sqrt(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("sqrt", &args, |x| (x >= 0.0).then(|| x.sqrt()))
}

fn math_exp(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("exp", &args, 1, 1)?;
    let result = float_arg(&args[0])?.exp();
    if result.is_infinite() {
        return Err(RuntimeError::new("OverflowError", "math range error"));
    }
    Ok(Value::Float(result))
}

fn math_log(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("log", &args, 1, 2)?;
    let x = float_arg(&args[0])?;
    if x <= 0.0 {
        return Err(domain_error());
    }
    match args.get(1) {
        None => Ok(Value::Float(x.ln())),
        Some(base) => {
            let base = float_arg(base)?;
            if base <= 0.0 || base == 1.0 {
                return Err(domain_error());
            }
            Ok(Value::Float(x.ln() / base.ln()))
        }
    }
}

fn math_log10(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("log10", &args, |x| (x > 0.0).then(|| x.log10()))
}

fn math_fabs(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    unary_math("fabs", &args, |x| Some(x.abs()))
}

fn math_floor(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("floor", &args, 1, 1)?;
    match number(&args[0])? {
        Number::Int(i) => Ok(Value::Int(i)),
        Number::Float(f) => float_to_int(f.floor()).map(Value::Int),
    }
}

fn math_ceil(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("ceil", &args, 1, 1)?;
    match number(&args[0])? {
        Number::Int(i) => Ok(Value::Int(i)),
        Number::Float(f) => float_to_int(f.ceil()).map(Value::Int),
    }
}

fn math_factorial(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    arity("factorial", &args, 1, 1)?;
    let n = int_arg(&args[0])?;
    if n < 0 {
        return Err(RuntimeError::value_error(
            "factorial() not defined for negative values",
        ));
    }
    (1..=n)
        .try_fold(1i64, |acc, k| acc.checked_mul(k))
        .map(Value::Int)
        .ok_or_else(|| RuntimeError::new("OverflowError", "integer overflow"))
}

fn math_gcd(_: &mut Interpreter, args: Vec<Value>) -> RResult<Value> {
    let mut acc: u64 = 0;
    for arg in &args {
        let mut b = int_arg(arg)?.unsigned_abs();
        let mut a = acc;
        while b != 0 {
            (a, b) = (b, a % b);
        }
        acc = a;
    }
    i64::try_from(acc)
        .map(Value::Int)
        .map_err(|_| RuntimeError::new("OverflowError", "integer overflow"))
}

// --- containers ---

pub fn iterate(value: &Value) -> RResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn resolve_index(index: &Value, len: usize, what: &str) -> RResult<usize> {
    let i = match index.as_number() {
        Some(Number::Int(i)) if !matches!(index, Value::Bool(_)) => i,
        _ => {
            return Err(RuntimeError::type_error(format!(
                "{what} indices must be integers, not {}",
                index.type_name()
            )))
        }
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(RuntimeError::new(
            "IndexError",
            format!("{what} index out of range"),
        ));
    }
    Ok(resolved as usize)
}

pub fn subscript(container: &Value, index: &Value) -> RResult<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = resolve_index(index, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = resolve_index(index, chars.len(), "string")?;
            Ok(Value::str(chars[i].to_string()))
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn store_subscript(container: &Value, index: &Value, value: Value) -> RResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = resolve_index(index, items.len(), "list")?;
            items[i] = value;
            Ok(())
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

const LIST_METHODS: &[&str] = &["append", "count", "extend", "index", "pop"];

pub fn attribute(value: &Value, attr: &str) -> RResult<Value> {
    match value {
        Value::Module(module) => module.attrs.get(attr).cloned().ok_or_else(|| {
            RuntimeError::new(
                "AttributeError",
                format!("module '{}' has no attribute '{attr}'", module.name),
            )
        }),
        Value::List(_) if LIST_METHODS.contains(&attr) => Ok(Value::Method {
            receiver: Box::new(value.clone()),
            name: attr.to_string(),
        }),
        Value::Str(_) if attr == "join" => Ok(Value::Method {
            receiver: Box::new(value.clone()),
            name: attr.to_string(),
        }),
        other => Err(RuntimeError::new(
            "AttributeError",
            format!("'{}' object has no attribute '{attr}'", other.type_name()),
        )),
    }
}

pub fn call_method(receiver: &Value, name: &str, args: Vec<Value>) -> RResult<Value> {
    match (receiver, name) {
        (Value::List(items), "append") => {
            arity("append", &args, 1, 1)?;
            let mut items = items.borrow_mut();
            if items.len() >= MAX_SEQUENCE_LEN {
                return Err(RuntimeError::new("MemoryError", "list is too large"));
            }
            items.extend(args);
            Ok(Value::None)
        }
        (Value::List(items), "extend") => {
            arity("extend", &args, 1, 1)?;
            let extra = iterate(&args[0])?;
            let mut items = items.borrow_mut();
            if items.len() + extra.len() > MAX_SEQUENCE_LEN {
                return Err(RuntimeError::new("MemoryError", "list is too large"));
            }
            items.extend(extra);
            Ok(Value::None)
        }
        (Value::List(items), "pop") => {
            arity("pop", &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(RuntimeError::new("IndexError", "pop from empty list"));
            }
            let i = match args.first() {
                Some(index) => resolve_index(index, items.len(), "pop")?,
                None => items.len() - 1,
            };
            Ok(items.remove(i))
        }
        (Value::List(items), "index") => {
            arity("index", &args, 1, 1)?;
            for (i, item) in items.borrow().iter().enumerate() {
                if values_equal(item, &args[0])? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(RuntimeError::value_error(format!(
                "{} is not in list",
                args[0].repr()
            )))
        }
        (Value::List(items), "count") => {
            arity("count", &args, 1, 1)?;
            let mut n = 0;
            for item in items.borrow().iter() {
                if values_equal(item, &args[0])? {
                    n += 1;
                }
            }
            Ok(Value::Int(n))
        }
        (Value::Str(sep), "join") => {
            arity("join", &args, 1, 1)?;
            let parts = iterate(&args[0])?
                .into_iter()
                .map(|part| match part {
                    Value::Str(s) => Ok(s.to_string()),
                    other => Err(RuntimeError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<RResult<Vec<_>>>()?;
            Ok(Value::str(parts.join(&**sep)))
        }
        (receiver, name) => Err(RuntimeError::new(
            "AttributeError",
            format!("'{}' object has no attribute '{name}'", receiver.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> RResult<Value> {
        let Some(Value::Builtin(builtin)) = lookup(name) else {
            panic!("no builtin {name}");
        };
        (builtin.func)(&mut Interpreter::new(), args)
    }

    fn math(name: &str, args: Vec<Value>) -> RResult<Value> {
        let module = import_module("math").unwrap();
        let Some(Value::Builtin(builtin)) = module.attrs.get(name).cloned() else {
            panic!("no math.{name}");
        };
        (builtin.func)(&mut Interpreter::new(), args)
    }

    #[test]
    fn range_matches_python() {
        let r = call("range", vec![Value::Int(10), Value::Int(0), Value::Int(-3)]).unwrap();
        assert_eq!(r.repr(), "[10, 7, 4, 1]");
        assert_eq!(call("range", vec![Value::Int(0)]).unwrap().repr(), "[]");
        assert_eq!(
            call("range", vec![Value::Int(1), Value::Int(2), Value::Int(0)]).unwrap_err().kind,
            "ValueError"
        );
    }

    #[test]
    fn huge_ranges_are_refused() {
        let err = call("range", vec![Value::Int(i64::MAX)]).unwrap_err();
        assert_eq!(err.kind, "MemoryError");
    }

    #[test]
    fn round_is_banker_style() {
        assert_eq!(call("round", vec![Value::Float(2.5)]).unwrap().repr(), "2");
        assert_eq!(call("round", vec![Value::Float(3.5)]).unwrap().repr(), "4");
        assert_eq!(
            call("round", vec![Value::Float(3.14159), Value::Int(2)]).unwrap().repr(),
            "3.14"
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(call("int", vec![Value::str(" 42 ")]).unwrap().repr(), "42");
        assert_eq!(call("int", vec![Value::Float(-2.7)]).unwrap().repr(), "-2");
        assert_eq!(call("float", vec![Value::str("1.5")]).unwrap().repr(), "1.5");
        assert_eq!(call("int", vec![Value::str("x")]).unwrap_err().kind, "ValueError");
        assert_eq!(call("str", vec![Value::Int(3)]).unwrap().repr(), "'3'");
    }

    #[test]
    fn min_max_sum_sorted() {
        let xs = Value::list(vec![Value::Int(3), Value::Float(1.5), Value::Int(2)]);
        assert_eq!(call("min", vec![xs.clone()]).unwrap().repr(), "1.5");
        assert_eq!(call("max", vec![Value::Int(1), Value::Int(9)]).unwrap().repr(), "9");
        assert_eq!(call("sum", vec![xs.clone()]).unwrap().repr(), "6.5");
        assert_eq!(call("sorted", vec![xs]).unwrap().repr(), "[1.5, 2, 3]");
        let mixed = Value::list(vec![Value::Int(1), Value::str("a")]);
        assert_eq!(call("sorted", vec![mixed]).unwrap_err().kind, "TypeError");
    }

    #[test]
    fn math_domain_errors() {
        assert_eq!(math("sqrt", vec![Value::Int(-1)]).unwrap_err().message, "math domain error");
        assert_eq!(math("log", vec![Value::Int(0)]).unwrap_err().kind, "ValueError");
        assert_eq!(math("factorial", vec![Value::Int(5)]).unwrap().repr(), "120");
        assert_eq!(math("factorial", vec![Value::Int(30)]).unwrap_err().kind, "OverflowError");
        assert_eq!(math("gcd", vec![Value::Int(12), Value::Int(-18)]).unwrap().repr(), "6");
        assert_eq!(math("floor", vec![Value::Float(-1.5)]).unwrap().repr(), "-2");
    }

    #[test]
    fn list_methods() {
        let xs = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(2)]);
        assert_eq!(call_method(&xs, "count", vec![Value::Int(2)]).unwrap().repr(), "2");
        assert_eq!(call_method(&xs, "index", vec![Value::Int(2)]).unwrap().repr(), "1");
        assert_eq!(call_method(&xs, "pop", vec![]).unwrap().repr(), "2");
        assert_eq!(xs.repr(), "[1, 2]");
        assert_eq!(
            subscript(&xs, &Value::Int(5)).unwrap_err().kind,
            "IndexError"
        );
    }

    #[test]
    fn sage_all_exposes_the_numeric_core() {
        let module = import_module("sage.all").unwrap();
        assert_eq!(module.name, "sage.all");
        assert!(module.attrs.contains_key("sin"));
        assert_eq!(import_module("cmath").unwrap_err().kind, "ModuleNotFoundError");
    }

    #[test]
    fn unknown_attributes() {
        let err = attribute(&Value::Int(1), "real").unwrap_err();
        assert_eq!(err.kind, "AttributeError");
        assert_eq!(err.message, "'int' object has no attribute 'real'");
    }
}
