//! Formula PVs, computed from other PVs
//!
//! A formula is requested as `=expression` (or `eq://expression`). Other PVs are
//! referenced by their name in backticks:
//!
//! ```text
//! =(`loc://a(1)` + `sim://sine`) / 2
//! =max(`loc://limit(10)`, abs(`loc://x(-3)`))
//! =`loc://setpoint(5)` > `loc://readback(4)`
//! ```
//!
//! Supported are numbers, `+ - * /`, unary minus, parentheses, the comparisons
//! `< > <= >= == !=` (which give 1 or 0), and the functions `abs`, `sqrt`, `min`
//! and `max`.
//!
//! Each referenced PV is requested from the pool when the formula is created, and
//! released again when it is closed. The formula publishes a new value whenever
//! an input changes, once every input has a value. It is disconnected while any
//! input is, and carries the most severe alarm of its inputs.

use std::sync::Arc;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{char, multispace0},
    combinator::{all_consuming, opt, value},
    multi::{many0, separated_list1},
    number::complete::double,
    sequence::{delimited, preceded},
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::PvFactory;
use crate::{
    PvError,
    pool::{PvPool, WeakPvPool},
    pv::{ListenerHandle, Pv, PvBackend, PvCore, PvListener},
    vtype::{Alarm, AlarmSeverity, AlarmStatus, VType},
};

pub const FORMULA_TYPE: &str = crate::name::FORMULA_TYPE;

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        let truth = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Lt => truth(lhs < rhs),
            BinaryOp::Gt => truth(lhs > rhs),
            BinaryOp::Le => truth(lhs <= rhs),
            BinaryOp::Ge => truth(lhs >= rhs),
            BinaryOp::Eq => truth(lhs == rhs),
            BinaryOp::Ne => truth(lhs != rhs),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Function {
    Abs,
    Sqrt,
    Min,
    Max,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Number(f64),
    /// Index into the formula inputs
    Input(usize),
    /// A PV name, before being resolved to an input
    Name(String),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

type ParseResult<'a, T> = IResult<&'a str, T>;

fn ws<'a, O, F>(inner: F) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    F: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn pv_name(input: &str) -> ParseResult<'_, Expr> {
    delimited(char('`'), is_not("`"), char('`'))
        .map(|name: &str| Expr::Name(name.to_owned()))
        .parse(input)
}

fn function(input: &str) -> ParseResult<'_, Expr> {
    (
        alt((
            value(Function::Abs, tag("abs")),
            value(Function::Sqrt, tag("sqrt")),
            value(Function::Min, tag("min")),
            value(Function::Max, tag("max")),
        )),
        delimited(
            ws(char('(')),
            separated_list1(char(','), comparison),
            char(')'),
        ),
    )
        .map(|(function, args)| Expr::Call(function, args))
        .parse(input)
}

fn primary(input: &str) -> ParseResult<'_, Expr> {
    ws(alt((
        function,
        pv_name,
        double.map(Expr::Number),
        delimited(char('('), comparison, char(')')),
    )))
    .parse(input)
}

fn unary(input: &str) -> ParseResult<'_, Expr> {
    alt((
        preceded(ws(char('-')), unary).map(|e| Expr::Negate(Box::new(e))),
        primary,
    ))
    .parse(input)
}

fn binary_chain<'a>(
    input: &'a str,
    operand: fn(&str) -> ParseResult<'_, Expr>,
    operators: [(char, BinaryOp); 2],
) -> ParseResult<'a, Expr> {
    let [(first_symbol, first_op), (second_symbol, second_op)] = operators;
    let (input, first) = operand(input)?;
    let (input, rest) = many0((
        ws(alt((
            value(first_op, char(first_symbol)),
            value(second_op, char(second_symbol)),
        ))),
        operand,
    ))
    .parse(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |lhs, (op, rhs)| {
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }),
    ))
}

fn term(input: &str) -> ParseResult<'_, Expr> {
    binary_chain(input, unary, [('*', BinaryOp::Mul), ('/', BinaryOp::Div)])
}

fn additive(input: &str) -> ParseResult<'_, Expr> {
    binary_chain(input, term, [('+', BinaryOp::Add), ('-', BinaryOp::Sub)])
}

fn comparison(input: &str) -> ParseResult<'_, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, rhs) = opt((
        ws(alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
        ))),
        additive,
    ))
    .parse(input)?;
    Ok((
        input,
        match rhs {
            Some((op, rhs)) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            None => lhs,
        },
    ))
}

impl Expr {
    /// Replace names by input indices, collecting each distinct name once
    fn resolve(self, inputs: &mut Vec<String>) -> Result<Expr, String> {
        Ok(match self {
            Expr::Name(name) => {
                let index = match inputs.iter().position(|n| *n == name) {
                    Some(index) => index,
                    None => {
                        inputs.push(name);
                        inputs.len() - 1
                    }
                };
                Expr::Input(index)
            }
            Expr::Negate(e) => Expr::Negate(Box::new(e.resolve(inputs)?)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                op,
                Box::new(lhs.resolve(inputs)?),
                Box::new(rhs.resolve(inputs)?),
            ),
            Expr::Call(function, args) => {
                let arity_ok = match function {
                    Function::Abs | Function::Sqrt => args.len() == 1,
                    Function::Min | Function::Max => !args.is_empty(),
                };
                if !arity_ok {
                    return Err(format!(
                        "Wrong number of arguments ({}) for {function:?}",
                        args.len()
                    ));
                }
                Expr::Call(
                    function,
                    args.into_iter()
                        .map(|a| a.resolve(inputs))
                        .collect::<Result<_, _>>()?,
                )
            }
            other => other,
        })
    }

    fn evaluate(&self, inputs: &[f64]) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Input(index) => inputs.get(*index).copied().unwrap_or(f64::NAN),
            Expr::Name(_) => f64::NAN,
            Expr::Negate(e) => -e.evaluate(inputs),
            Expr::Binary(op, lhs, rhs) => op.apply(lhs.evaluate(inputs), rhs.evaluate(inputs)),
            Expr::Call(function, args) => {
                let mut values = args.iter().map(|a| a.evaluate(inputs));
                match function {
                    Function::Abs => values.next().unwrap_or(f64::NAN).abs(),
                    Function::Sqrt => values.next().unwrap_or(f64::NAN).sqrt(),
                    Function::Min => values.fold(f64::INFINITY, f64::min),
                    Function::Max => values.fold(f64::NEG_INFINITY, f64::max),
                }
            }
        }
    }
}

/// A parsed formula expression
#[derive(Clone, Debug, PartialEq)]
pub struct Formula {
    expression: String,
    expr: Expr,
    inputs: Vec<String>,
}

impl Formula {
    pub fn parse(expression: &str) -> Result<Formula, PvError> {
        let failed = |reason: String| PvError::Formula {
            expression: expression.to_owned(),
            reason,
        };
        let (_, expr) = all_consuming(ws(comparison))
            .parse(expression)
            .map_err(|e| failed(format!("{e}")))?;
        let mut inputs = Vec::new();
        let expr = expr.resolve(&mut inputs).map_err(failed)?;
        Ok(Formula {
            expression: expression.to_owned(),
            expr,
            inputs,
        })
    }

    /// Names of the PVs used by the formula, in order of first use
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Compute the formula from values for each of [`Formula::inputs`]
    pub fn evaluate(&self, inputs: &[f64]) -> f64 {
        self.expr.evaluate(inputs)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FormulaFactory;

impl PvFactory for FormulaFactory {
    fn pv_type(&self) -> &str {
        FORMULA_TYPE
    }

    fn create_pv(&self, pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError> {
        let formula = Formula::parse(base_name)?;
        let mut inputs = Vec::with_capacity(formula.inputs().len());
        for input in formula.inputs() {
            match pool.get_pv(input) {
                Ok(pv) => inputs.push(pv),
                Err(e) => {
                    for pv in &inputs {
                        pool.release_pv(pv);
                    }
                    return Err(e);
                }
            }
        }
        debug!("Formula '{name}' uses {:?}", formula.inputs());

        let core = PvCore::new(name, true);
        let state = Arc::new(FormulaState {
            values: Mutex::new(vec![None; inputs.len()]),
            formula,
            output: Arc::downgrade(&core),
        });
        let handles: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(index, pv)| {
                pv.add_listener(InputListener {
                    index,
                    state: state.clone(),
                })
            })
            .collect();
        if inputs.is_empty() {
            state.recompute();
        }
        Ok(Pv::new(
            core,
            FormulaBackend {
                pool: pool.downgrade(),
                inputs,
                handles: Mutex::new(handles),
            },
        ))
    }
}

struct FormulaState {
    formula: Formula,
    values: Mutex<Vec<Option<VType>>>,
    output: std::sync::Weak<PvCore>,
}

impl FormulaState {
    /// Store an input value and publish the new output
    ///
    /// Storing and publishing happen inside the output's delivery lock, so
    /// outputs are published in the order their inputs were stored.
    fn update(&self, index: usize, value: VType) {
        let Some(output) = self.output.upgrade() else {
            return;
        };
        let _ = output.update(|last| {
            let mut values = self.values.lock();
            if let Some(slot) = values.get_mut(index) {
                *slot = Some(value);
            }
            Ok(self.compute(&values, last))
        });
    }

    fn recompute(&self) {
        let Some(output) = self.output.upgrade() else {
            return;
        };
        let _ = output.update(|last| Ok(self.compute(&self.values.lock(), last)));
    }

    /// The output value, or `None` while an input has never had a value
    fn compute(&self, values: &[Option<VType>], last: Option<&VType>) -> Option<VType> {
        let values: Vec<&VType> = values.iter().map(Option::as_ref).collect::<Option<_>>()?;
        if values.iter().any(|v| v.is_disconnected()) {
            return Some(VType::disconnected(last));
        }
        let Some(numbers) = values
            .iter()
            .map(|v| v.value.as_f64())
            .collect::<Option<Vec<_>>>()
        else {
            return Some(VType::with_alarm(
                f64::NAN,
                Alarm {
                    severity: AlarmSeverity::Invalid,
                    status: AlarmStatus::Client,
                    message: "Non-numeric input".to_owned(),
                },
            ));
        };
        let alarm = values
            .iter()
            .map(|v| &v.alarm)
            .max_by_key(|a| a.severity)
            .cloned()
            .unwrap_or_default();
        let result = self.formula.evaluate(&numbers);
        trace!("{} = {result}", self.formula.expression());
        Some(VType::with_alarm(result, alarm))
    }
}

struct InputListener {
    index: usize,
    state: Arc<FormulaState>,
}

impl PvListener for InputListener {
    fn value_changed(&self, _pv_name: &str, value: &VType) {
        self.state.update(self.index, value.clone());
    }
}

struct FormulaBackend {
    pool: WeakPvPool,
    inputs: Vec<Arc<Pv>>,
    handles: Mutex<Vec<ListenerHandle>>,
}

impl PvBackend for FormulaBackend {
    fn close(&self, core: &PvCore) {
        for handle in self.handles.lock().drain(..) {
            handle.remove();
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        debug!(
            "Formula '{}' releasing {} inputs",
            core.name(),
            self.inputs.len()
        );
        for input in &self.inputs {
            pool.release_pv(input);
        }
    }
}
