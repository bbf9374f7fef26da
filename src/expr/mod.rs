//! Restricted expression language for derived values and guard conditions.
//!
//! Expressions are compiled once when a definition is loaded and evaluated against a
//! [Symbols] source, normally a packet. The grammar is a small Python-like subset:
//! arithmetic, bitwise and shift operators, chained comparisons, `and`/`or`/`not`,
//! conditional expressions, and calls to packet functions or a [FunctionTable].
//!
//! ```
//! use gds::expr::{Expression, FunctionTable, Symbols};
//! use gds::{Error, Result, Value};
//!
//! struct Volts;
//!
//! impl Symbols for Volts {
//!     fn lookup(&self, name: &str) -> Result<Option<Value>> {
//!         match name {
//!             "volts" => Ok(Some(Value::Int(12))),
//!             _ => Err(Error::UnknownField { definition: "Volts".into(), field: name.into() }),
//!         }
//!     }
//! }
//!
//! let expr = Expression::compile("volts * 0.5 if volts > 10 else None").unwrap();
//! assert_eq!(expr.eval(&Volts).unwrap(), Some(Value::Float(6.0)));
//! ```
mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::{Error, Result, Value};

pub use parser::{BinaryOp, CompareOp, Expr, UnaryOp};

use eval::{ordering, truthy};

/// Limit on nested derived-field evaluation. Deeper chains are treated as cycles.
pub const MAX_DEPTH: usize = 64;

/// Name resolution for expression evaluation.
pub trait Symbols {
    /// Value of `name`. `Ok(None)` for names that exist but have no value, such as a
    /// field whose guard is false.
    ///
    /// # Errors
    /// [Error::UnknownField] if the name does not exist, in which case function table
    /// constants are consulted before evaluation fails.
    fn lookup(&self, name: &str) -> Result<Option<Value>>;

    /// Value of `raw.<name>`.
    ///
    /// # Errors
    /// See [lookup](Symbols::lookup).
    fn lookup_raw(&self, name: &str) -> Result<Option<Value>> {
        self.lookup(name)
    }

    /// Value of `history.<name>`.
    ///
    /// # Errors
    /// Implementations may reject names outside their history.
    fn lookup_history(&self, _name: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Call a function owned by the symbol source. `None` if there is no such function.
    fn call(&self, _name: &str, _args: &[Option<Value>]) -> Option<Result<Option<Value>>> {
        None
    }

    fn functions(&self) -> &FunctionTable {
        FunctionTable::core()
    }
}

pub type NativeFunction = Arc<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>;

/// Native functions and constants callable from expressions.
///
/// The default table provides `abs`, `min`, `max`, and `round`. Math functions are
/// added with [with_math](FunctionTable::with_math).
#[derive(Clone)]
pub struct FunctionTable {
    functions: HashMap<String, NativeFunction>,
    constants: HashMap<String, Value>,
}

impl Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable")
            .field("functions", &names)
            .field("constants", &self.constants)
            .finish()
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::Expression(format!(
            "{name}() takes {min} to {max} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn number(name: &str, v: &Value) -> Result<f64> {
    v.as_f64()
        .filter(|_| v.is_numeric())
        .ok_or_else(|| Error::Expression(format!("{name}() requires a number, got {}", v.kind())))
}

fn extreme(name: &'static str, want: std::cmp::Ordering) -> NativeFunction {
    Arc::new(move |args: &[Value]| {
        let items = match args {
            [Value::List(items)] => items.as_slice(),
            _ => args,
        };
        let mut best: Option<&Value> = None;
        for item in items {
            best = match best {
                Some(b) => match ordering(item, b) {
                    Some(o) if o == want => Some(item),
                    Some(_) => Some(b),
                    None => {
                        return Err(Error::Expression(format!(
                            "{name}() cannot compare {} and {}",
                            item.kind(),
                            b.kind()
                        )))
                    }
                },
                None => Some(item),
            };
        }
        best.cloned()
            .map(Some)
            .ok_or_else(|| Error::Expression(format!("{name}() arg is an empty sequence")))
    })
}

fn unary_math(name: &'static str, f: fn(f64) -> f64) -> NativeFunction {
    Arc::new(move |args: &[Value]| {
        arity(name, args, 1, 1)?;
        let r = f(number(name, &args[0])?);
        if r.is_nan() {
            return Err(Error::Expression(format!("{name}(): math domain error")));
        }
        Ok(Some(Value::Float(r)))
    })
}

impl Default for FunctionTable {
    fn default() -> Self {
        let mut table = Self {
            functions: HashMap::default(),
            constants: HashMap::default(),
        };
        table.functions.insert(
            "abs".into(),
            Arc::new(|args: &[Value]| {
                arity("abs", args, 1, 1)?;
                match &args[0] {
                    Value::Float(f) => Ok(Some(Value::Float(f.abs()))),
                    v => match v.as_i128().filter(|_| v.is_numeric()) {
                        Some(i) => Ok(Some(
                            i.checked_abs()
                                .map_or(Value::Float((i as f64).abs()), Value::Int),
                        )),
                        None => Err(Error::Expression(format!(
                            "abs() requires a number, got {}",
                            v.kind()
                        ))),
                    },
                }
            }),
        );
        table
            .functions
            .insert("min".into(), extreme("min", std::cmp::Ordering::Less));
        table
            .functions
            .insert("max".into(), extreme("max", std::cmp::Ordering::Greater));
        table.functions.insert(
            "round".into(),
            Arc::new(|args: &[Value]| {
                arity("round", args, 1, 2)?;
                if let Value::Int(i) = &args[0] {
                    return Ok(Some(Value::Int(*i)));
                }
                let x = number("round", &args[0])?;
                match args.get(1) {
                    None => Ok(Some(Value::Int(x.round_ties_even() as i128))),
                    Some(digits) => {
                        let scale = 10f64.powf(number("round", digits)?.trunc());
                        Ok(Some(Value::Float((x * scale).round_ties_even() / scale)))
                    }
                }
            }),
        );
        table
    }
}

impl FunctionTable {
    /// Shared default table.
    #[must_use]
    pub fn core() -> &'static FunctionTable {
        static CORE: OnceLock<FunctionTable> = OnceLock::new();
        CORE.get_or_init(FunctionTable::default)
    }

    /// Add the math set: `sqrt`, `sin`, `cos`, `tan`, `log`, `log10`, `exp`, `pow`,
    /// `floor`, `ceil`, and the constants `pi` and `e`. Each is also reachable with a
    /// `math.` prefix.
    #[must_use]
    pub fn with_math(mut self) -> Self {
        let unary: [(&'static str, fn(f64) -> f64); 7] = [
            ("sqrt", f64::sqrt),
            ("sin", f64::sin),
            ("cos", f64::cos),
            ("tan", f64::tan),
            ("log10", f64::log10),
            ("exp", f64::exp),
            ("fabs", f64::abs),
        ];
        for (name, f) in unary {
            self.functions.insert(name.into(), unary_math(name, f));
        }
        self.functions.insert(
            "log".into(),
            Arc::new(|args: &[Value]| {
                arity("log", args, 1, 2)?;
                let x = number("log", &args[0])?;
                let r = match args.get(1) {
                    Some(base) => x.ln() / number("log", base)?.ln(),
                    None => x.ln(),
                };
                if r.is_nan() || x <= 0.0 {
                    return Err(Error::Expression("log(): math domain error".into()));
                }
                Ok(Some(Value::Float(r)))
            }),
        );
        self.functions.insert(
            "pow".into(),
            Arc::new(|args: &[Value]| {
                arity("pow", args, 2, 2)?;
                let r = number("pow", &args[0])?.powf(number("pow", &args[1])?);
                Ok(Some(Value::Float(r)))
            }),
        );
        for (name, f) in [("floor", f64::floor as fn(f64) -> f64), ("ceil", f64::ceil)] {
            self.functions.insert(
                name.into(),
                Arc::new(move |args: &[Value]| {
                    arity(name, args, 1, 1)?;
                    if let Value::Int(i) = &args[0] {
                        return Ok(Some(Value::Int(*i)));
                    }
                    Ok(Some(Value::Int(f(number(name, &args[0])?) as i128)))
                }),
            );
        }
        self.constants
            .insert("pi".into(), Value::Float(std::f64::consts::PI));
        self.constants
            .insert("e".into(), Value::Float(std::f64::consts::E));
        self
    }

    /// Add or replace a native function.
    #[must_use]
    pub fn with_function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_constant(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }
}

/// A compiled expression and the text it came from.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Arc<Expr>,
}

impl Expression {
    /// # Errors
    /// [Error::Expression] with the position of the first syntax error.
    pub fn compile(source: &str) -> Result<Self> {
        let ast = parser::parse(source).map_err(|e| {
            Error::Expression(format!("{} at position {} in '{source}'", e.message, e.pos))
        })?;
        Ok(Self {
            source: source.to_string(),
            ast: Arc::new(ast),
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// # Errors
    /// [Error::Expression] for unknown names or functions and for operations that are
    /// not defined for their operand types, or any error raised by a symbol lookup.
    pub fn eval(&self, symbols: &dyn Symbols) -> Result<Option<Value>> {
        eval::eval(&self.ast, symbols)
    }

    /// Evaluate as a condition. `None` is false.
    ///
    /// # Errors
    /// See [eval](Self::eval).
    pub fn test(&self, symbols: &dyn Symbols) -> Result<bool> {
        Ok(truthy(self.eval(symbols)?.as_ref()))
    }
}

impl FromStr for Expression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[derive(Debug, Clone)]
enum FunctionBody {
    Expr(Expression),
    Branches(Vec<(Expression, Expression)>),
}

/// Named function defined alongside a packet, e.g., `volts(dn)`.
///
/// The body is either a single expression or an ordered list of `(condition, value)`
/// branches where the first true condition wins. No matching branch yields `None`.
#[derive(Debug, Clone)]
pub struct PacketFunction {
    name: String,
    params: Vec<String>,
    body: FunctionBody,
}

fn parse_signature(signature: &str) -> Result<(String, Vec<String>)> {
    let bad = || Error::Expression(format!("invalid function signature '{signature}'"));
    let signature = signature.trim();
    let (name, rest) = signature.split_once('(').ok_or_else(bad)?;
    let params = rest.strip_suffix(')').ok_or_else(bad)?;

    let is_ident = |s: &str| {
        let mut chars = s.chars();
        chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_')
    };
    let name = name.trim();
    if !is_ident(name) {
        return Err(bad());
    }
    let params: Vec<String> = if params.trim().is_empty() {
        Vec::new()
    } else {
        params.split(',').map(|p| p.trim().to_string()).collect()
    };
    if !params.iter().all(|p| is_ident(p)) {
        return Err(bad());
    }
    Ok((name.to_string(), params))
}

impl PacketFunction {
    /// # Errors
    /// [Error::Expression] if the signature is not of the form `name(a, b)` or the body
    /// does not compile.
    pub fn new(signature: &str, body: &str) -> Result<Self> {
        let (name, params) = parse_signature(signature)?;
        Ok(Self {
            name,
            params,
            body: FunctionBody::Expr(Expression::compile(body)?),
        })
    }

    /// # Errors
    /// See [new](Self::new).
    pub fn with_branches<I, C, E>(signature: &str, branches: I) -> Result<Self>
    where
        I: IntoIterator<Item = (C, E)>,
        C: AsRef<str>,
        E: AsRef<str>,
    {
        let (name, params) = parse_signature(signature)?;
        let branches = branches
            .into_iter()
            .map(|(c, e)| Ok((Expression::compile(c.as_ref())?, Expression::compile(e.as_ref())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            params,
            body: FunctionBody::Branches(branches),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Evaluate with `args` bound to the parameters. Other names resolve through `outer`.
    ///
    /// # Errors
    /// [Error::Expression] if the argument count does not match, or any evaluation error.
    pub fn invoke(&self, args: &[Option<Value>], outer: &dyn Symbols) -> Result<Option<Value>> {
        if args.len() != self.params.len() {
            return Err(Error::Expression(format!(
                "{}() takes {} arguments ({} given)",
                self.name,
                self.params.len(),
                args.len()
            )));
        }
        let scope = Scope {
            params: &self.params,
            args,
            outer,
        };
        match &self.body {
            FunctionBody::Expr(e) => e.eval(&scope),
            FunctionBody::Branches(branches) => {
                for (cond, value) in branches {
                    if cond.test(&scope)? {
                        return value.eval(&scope);
                    }
                }
                Ok(None)
            }
        }
    }
}

struct Scope<'a> {
    params: &'a [String],
    args: &'a [Option<Value>],
    outer: &'a dyn Symbols,
}

impl Symbols for Scope<'_> {
    fn lookup(&self, name: &str) -> Result<Option<Value>> {
        match self.params.iter().position(|p| p == name) {
            Some(i) => Ok(self.args[i].clone()),
            None => self.outer.lookup(name),
        }
    }

    fn lookup_raw(&self, name: &str) -> Result<Option<Value>> {
        self.outer.lookup_raw(name)
    }

    fn lookup_history(&self, name: &str) -> Result<Option<Value>> {
        self.outer.lookup_history(name)
    }

    fn call(&self, name: &str, args: &[Option<Value>]) -> Option<Result<Option<Value>>> {
        self.outer.call(name, args)
    }

    fn functions(&self) -> &FunctionTable {
        self.outer.functions()
    }
}

/// Conversion from a field's digital number to engineering units.
#[derive(Debug, Clone)]
pub struct DnToEu {
    equation: Expression,
    units: Option<String>,
    when: Option<Expression>,
}

impl DnToEu {
    /// # Errors
    /// [Error::Expression] if the equation does not compile.
    pub fn new(equation: &str) -> Result<Self> {
        Ok(Self {
            equation: Expression::compile(equation)?,
            units: None,
            when: None,
        })
    }

    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// # Errors
    /// [Error::Expression] if the guard does not compile.
    pub fn with_when(mut self, when: &str) -> Result<Self> {
        self.when = Some(Expression::compile(when)?);
        Ok(self)
    }

    #[must_use]
    pub fn equation(&self) -> &Expression {
        &self.equation
    }

    #[must_use]
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    #[must_use]
    pub fn when(&self) -> Option<&Expression> {
        self.when.as_ref()
    }

    /// EU value, or `None` when the guard is false.
    ///
    /// # Errors
    /// See [Expression::eval].
    pub fn eval(&self, symbols: &dyn Symbols) -> Result<Option<Value>> {
        if let Some(when) = &self.when {
            if !when.test(symbols)? {
                return Ok(None);
            }
        }
        self.equation.eval(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dn(i128);

    impl Symbols for Dn {
        fn lookup(&self, name: &str) -> Result<Option<Value>> {
            match name {
                "dn" => Ok(Some(Value::Int(self.0))),
                _ => Err(Error::UnknownField {
                    definition: "Dn".into(),
                    field: name.into(),
                }),
            }
        }
    }

    #[test]
    fn compile_errors_carry_position() {
        let err = Expression::compile("1 + * 2").unwrap_err();
        assert!(err.to_string().contains("position 4"), "{err}");
    }

    #[test]
    fn branch_function() {
        let f = PacketFunction::with_branches(
            "level(v)",
            [("v ≤ 10", "'LOW'"), ("v ≥ 100", "'HIGH'")],
        )
        .unwrap();
        assert_eq!(f.params(), ["v".to_string()]);
        assert_eq!(
            f.invoke(&[Some(Value::Int(5))], &Dn(0)).unwrap(),
            Some(Value::from("LOW"))
        );
        assert_eq!(
            f.invoke(&[Some(Value::Int(500))], &Dn(0)).unwrap(),
            Some(Value::from("HIGH"))
        );
        assert_eq!(f.invoke(&[Some(Value::Int(50))], &Dn(0)).unwrap(), None);
        assert!(f.invoke(&[], &Dn(0)).is_err());
    }

    #[test]
    fn function_sees_outer_names() {
        let f = PacketFunction::new("scaled(k)", "dn * k").unwrap();
        assert_eq!(
            f.invoke(&[Some(Value::Int(3))], &Dn(4)).unwrap(),
            Some(Value::Int(12))
        );
    }

    #[test]
    fn bad_signatures() {
        assert!(PacketFunction::new("noparens", "1").is_err());
        assert!(PacketFunction::new("f(a b)", "1").is_err());
        assert!(PacketFunction::new("f(a)", "a +").is_err());
    }

    #[test]
    fn dntoeu_guard() {
        let conv = DnToEu::new("dn * 0.5")
            .unwrap()
            .with_units("V")
            .with_when("dn > 0")
            .unwrap();
        assert_eq!(conv.units(), Some("V"));
        assert_eq!(conv.eval(&Dn(8)).unwrap(), Some(Value::Float(4.0)));
        assert_eq!(conv.eval(&Dn(0)).unwrap(), None);
    }
}
