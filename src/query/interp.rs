//! Tree-walking evaluator for transformation snippets.
//!
//! Snippets only see the names bound by the executor (`data`), the `utils`
//! helpers and a fixed set of builtins. Every evaluation step is counted and
//! the run aborts once the step budget is spent. Copies of stored values and
//! sequences built by `+`, `*` or builtins draw from the same budget, one
//! unit per value produced.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ScriptError;
use crate::query::ast::{
    AssignTarget, BinOp, BoolOp, Clause, CmpOp, Expr, Lambda, Stmt, Target, UnaryOp,
};
use crate::query::parser::is_place;
use crate::query::utils::{self, Aggregation};
use crate::query::value::{
    as_int, as_num, binary, compare, contains, float_value, get_item, item_mut, item_ref,
    iterate, key_string, produced_units, py_str, repr, set_item, shape, slice, sort_by_keys,
    truthy, type_name, unary_minus, values_equal, Num,
};

type Result<T> = std::result::Result<T, ScriptError>;

/// Evaluation steps allowed per snippet run.
pub const DEFAULT_STEP_BUDGET: u64 = 5_000_000;

/// Longest list `range()` may produce.
pub const MAX_RANGE_LEN: usize = 1_000_000;

/// Deepest expression evaluation allowed before the run is aborted.
pub const MAX_EVAL_DEPTH: usize = 128;

/// Deepest value a snippet may build and copy around.
pub const MAX_VALUE_DEPTH: usize = 256;

/// Name under which the dataset helpers are reachable.
pub const UTILS_NAME: &str = "utils";

/// Name under which `dumps` / `loads` are reachable.
pub const JSON_NAME: &str = "json";

const BUILTINS: [&str; 23] = [
    "len", "str", "int", "float", "bool", "abs", "round", "sum", "min", "max", "sorted", "list",
    "dict", "set", "range", "enumerate", "zip", "any", "all", "reversed", "map", "filter",
    "print",
];

const MUTATING_METHODS: [&str; 3] = ["append", "extend", "update"];

fn builtin_name(name: &str) -> Option<&'static str> {
    BUILTINS.iter().find(|b| **b == name).copied()
}

/// Argument of a builtin call: a value or something callable.
enum Arg<'e> {
    Value(Value),
    Lambda(&'e Lambda),
    Builtin(&'static str),
}

impl Arg<'_> {
    fn into_value(self) -> Result<Value> {
        match self {
            Arg::Value(value) => Ok(value),
            Arg::Lambda(_) | Arg::Builtin(_) => Err(ScriptError::Type(
                "functions can only be passed where a callable is expected".into(),
            )),
        }
    }
}

fn values(args: Vec<Arg<'_>>) -> Result<Vec<Value>> {
    args.into_iter().map(Arg::into_value).collect()
}

fn take_kwarg<'e>(kwargs: &mut Vec<(String, Arg<'e>)>, name: &str) -> Option<Arg<'e>> {
    let index = kwargs.iter().position(|(k, _)| k == name)?;
    Some(kwargs.remove(index).1)
}

/// Like [`take_kwarg`], treating `key=None` as absent.
fn take_callable<'e>(kwargs: &mut Vec<(String, Arg<'e>)>, name: &str) -> Option<Arg<'e>> {
    match take_kwarg(kwargs, name)? {
        Arg::Value(Value::Null) => None,
        other => Some(other),
    }
}

fn reject_kwargs<T>(function: &str, kwargs: &[(String, T)]) -> Result<()> {
    match kwargs.first() {
        Some((name, _)) => Err(ScriptError::Type(format!(
            "{}() got an unexpected keyword argument '{}'",
            function, name
        ))),
        None => Ok(()),
    }
}

fn arity(function: &str, given: usize, min: usize, max: usize) -> Result<()> {
    if given < min || given > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ScriptError::Type(format!(
            "{}() takes {} argument(s) but {} were given",
            function, expected, given
        )));
    }
    Ok(())
}

fn expect_str(value: Value, function: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ScriptError::Type(format!(
            "{}() expected a string, got {}",
            function,
            type_name(&other)
        ))),
    }
}

/// Positional-or-keyword binding for `utils` helpers.
fn bind_params(
    function: &str,
    params: &[&str],
    required: usize,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Vec<Option<Value>>> {
    if args.len() > params.len() {
        return Err(ScriptError::Type(format!(
            "{}() takes at most {} arguments ({} given)",
            function,
            params.len(),
            args.len()
        )));
    }
    let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    bound.resize(params.len(), None);

    for (name, value) in kwargs {
        let slot = params.iter().position(|p| *p == name).ok_or_else(|| {
            ScriptError::Type(format!(
                "{}() got an unexpected keyword argument '{}'",
                function, name
            ))
        })?;
        if bound[slot].is_some() {
            return Err(ScriptError::Type(format!(
                "{}() got multiple values for argument '{}'",
                function, name
            )));
        }
        bound[slot] = Some(value);
    }

    if let Some(missing) = params[..required].iter().zip(&bound).find(|(_, v)| v.is_none()) {
        return Err(ScriptError::Type(format!(
            "{}() missing required argument '{}'",
            function, missing.0
        )));
    }
    Ok(bound)
}

fn required(slot: &mut Option<Value>) -> Value {
    slot.take().unwrap_or(Value::Null)
}

/// Python-style rounding: halves go to the even neighbour.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

/// Control flow out of a statement.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

// == Interpreter ==
#[derive(Debug)]
pub struct Interpreter {
    /// Innermost scope last; index 0 holds snippet globals
    scopes: Vec<HashMap<String, Value>>,
    steps: u64,
    budget: u64,
    depth: usize,
}

impl Interpreter {
    pub fn new(budget: u64) -> Self {
        Self {
            scopes: vec![HashMap::new()],
            steps: 0,
            budget,
            depth: 0,
        }
    }

    /// Binds a global visible to the snippet.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        if let Some(globals) = self.scopes.first_mut() {
            globals.insert(name.into(), value);
        }
    }

    /// Removes and returns a global, e.g. `result` after a block ran.
    pub fn take_global(&mut self, name: &str) -> Option<Value> {
        self.scopes.first_mut()?.remove(name)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn tick(&mut self) -> Result<()> {
        self.charge(1)
    }

    fn charge(&mut self, units: u64) -> Result<()> {
        self.steps = self.steps.saturating_add(units);
        if self.steps > self.budget {
            return Err(ScriptError::Budget(self.budget));
        }
        Ok(())
    }

    /// Charges a value that was just copied or built.
    fn charge_value(&mut self, value: &Value) -> Result<()> {
        let shape = shape(value);
        if shape.depth > MAX_VALUE_DEPTH {
            return Err(ScriptError::Value(format!(
                "value nested deeper than {} levels",
                MAX_VALUE_DEPTH
            )));
        }
        self.charge(shape.units)
    }

    fn copied(&mut self, value: Value) -> Result<Value> {
        self.charge_value(&value)?;
        Ok(value)
    }

    // == Scopes ==
    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains_key(name))
    }

    fn lookup_ref(&self, name: &str) -> Result<&Value> {
        if let Some(value) = self.scopes.iter().rev().find_map(|scope| scope.get(name)) {
            return Ok(value);
        }
        if name == UTILS_NAME || name == JSON_NAME || builtin_name(name).is_some() {
            return Err(ScriptError::Type(format!(
                "'{}' can only be called, not used as a value",
                name
            )));
        }
        Err(ScriptError::Name(name.to_string()))
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
            .ok_or_else(|| ScriptError::Name(name.to_string()))
    }

    fn set_var(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn bind_target(&mut self, target: &Target, value: Value) -> Result<()> {
        match target {
            Target::Name(name) => {
                self.set_var(name, value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = iterate(value)?;
                if items.len() != targets.len() {
                    return Err(ScriptError::Value(format!(
                        "cannot unpack {} values into {} names",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.bind_target(target, item)?;
                }
                Ok(())
            }
        }
    }

    // == Places ==
    /// Splits `name[a][b]` into the root name and evaluated keys.
    fn place_path(&mut self, expr: &Expr) -> Result<(String, Vec<Value>)> {
        match expr {
            Expr::Name(name) => Ok((name.clone(), Vec::new())),
            Expr::Index(base, index) => {
                let (root, mut path) = self.place_path(base)?;
                path.push(self.eval(index)?);
                Ok((root, path))
            }
            _ => Err(ScriptError::Type("expression is not assignable".into())),
        }
    }

    /// Borrows a place without cloning the containers along the way.
    fn place_ref(&self, root: &str, path: &[Value]) -> Result<Cow<'_, Value>> {
        let mut current = self.lookup_ref(root)?;
        for (depth, key) in path.iter().enumerate() {
            if let Value::String(_) = current {
                let mut owned = get_item(current, key)?;
                for key in &path[depth + 1..] {
                    owned = get_item(&owned, key)?;
                }
                return Ok(Cow::Owned(owned));
            }
            current = item_ref(current, key)?;
        }
        Ok(Cow::Borrowed(current))
    }

    fn read_place(&mut self, root: &str, path: &[Value]) -> Result<Value> {
        let value = self.place_ref(root, path)?.into_owned();
        self.copied(value)
    }

    fn place_mut(&mut self, root: &str, path: &[Value]) -> Result<&mut Value> {
        let mut current = self.lookup_mut(root)?;
        for key in path {
            current = item_mut(current, key)?;
        }
        Ok(current)
    }

    fn assign(&mut self, target: &AssignTarget, value: Value) -> Result<()> {
        match target {
            AssignTarget::Name(name) => {
                self.set_var(name, value);
                Ok(())
            }
            AssignTarget::Index(base, index) => {
                let (root, path) = self.place_path(base)?;
                let key = self.eval(index)?;
                set_item(self.place_mut(&root, &path)?, &key, value)
            }
            AssignTarget::Unpack(target) => self.bind_target(target, value),
        }
    }

    // == Statements ==
    /// Runs a program; `Some` carries the value of an executed `return`.
    pub fn run(&mut self, program: &[Stmt]) -> Result<Option<Value>> {
        match self.exec_block(program)? {
            Flow::Return(value) => Ok(Some(value)),
            Flow::Normal => Ok(None),
            Flow::Break | Flow::Continue => Err(ScriptError::Syntax {
                line: 0,
                message: "'break' or 'continue' outside loop".into(),
            }),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Assign(target, expr) => {
                let value = self.eval(expr)?;
                self.assign(target, value)?;
            }
            Stmt::AugAssign(target, op, expr) => {
                let rhs = self.eval(expr)?;
                match target {
                    AssignTarget::Name(name) => {
                        let units = produced_units(*op, self.lookup_ref(name)?, &rhs);
                        self.charge(units)?;
                        let updated = binary(*op, self.lookup_ref(name)?, &rhs)?;
                        self.set_var(name, updated);
                    }
                    AssignTarget::Index(base, index) => {
                        let (root, mut path) = self.place_path(base)?;
                        path.push(self.eval(index)?);
                        let current = self.place_ref(&root, &path)?.into_owned();
                        self.charge(produced_units(*op, &current, &rhs))?;
                        let updated = binary(*op, &current, &rhs)?;
                        let (key, parents) = path
                            .split_last()
                            .ok_or_else(|| ScriptError::Type("expression is not assignable".into()))?;
                        set_item(self.place_mut(&root, parents)?, key, updated)?;
                    }
                    AssignTarget::Unpack(_) => {
                        return Err(ScriptError::Type(
                            "illegal expression for augmented assignment".into(),
                        ))
                    }
                }
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if truthy(&self.eval(cond)?) {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            Stmt::For { target, iter, body } => {
                let items = iterate(self.eval(iter)?)?;
                for item in items {
                    self.tick()?;
                    self.bind_target(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Pass => {}
        }
        Ok(Flow::Normal)
    }

    // == Expressions ==
    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.tick()?;
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(ScriptError::Depth(MAX_EVAL_DEPTH));
        }
        self.depth += 1;
        let value = self.eval_expr(expr);
        self.depth -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => {
                let value = self.lookup_ref(name)?.clone();
                self.copied(value)
            }
            Expr::List(items) | Expr::Tuple(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Dict(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let key = key_string(&self.eval(key)?)?;
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            Expr::Attribute(_, name) => Err(ScriptError::Type(format!(
                "attribute '{}' can only be called as a method",
                name
            ))),
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Index(base, index) => {
                if is_place(expr) {
                    let (root, path) = self.place_path(expr)?;
                    return self.read_place(&root, &path);
                }
                let target = self.eval(base)?;
                let index = self.eval(index)?;
                get_item(&target, &index)
            }
            Expr::Slice {
                target,
                lower,
                upper,
            } => {
                let target = self.eval(target)?;
                let lower = self.slice_bound(lower.as_deref())?;
                let upper = self.slice_bound(upper.as_deref())?;
                slice(&target, lower, upper)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => unary_minus(&value),
                    UnaryOp::Pos => match as_num(&value) {
                        Some(n) => Ok(n.into_value()),
                        None => Err(ScriptError::Type(format!(
                            "bad operand type for unary +: '{}'",
                            type_name(&value)
                        ))),
                    },
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            Expr::Binary(..) => self.eval_binary_chain(expr),
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (i, (op, expr)) in rest.iter().enumerate() {
                    let last = i + 1 == rest.len();
                    if last && matches!(op, CmpOp::In | CmpOp::NotIn) && is_place(expr) {
                        // membership tests borrow the container instead of copying it
                        let (root, path) = self.place_path(expr)?;
                        let container = self.place_ref(&root, &path)?;
                        return compare_op(*op, &left, &container).map(Value::Bool);
                    }
                    let right = self.eval(expr)?;
                    if !compare_op(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Bool(..) => self.eval_bool_chain(expr),
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::ListComp { element, clauses } => {
                let mut out = Vec::new();
                self.scoped(clauses, &mut |interp: &mut Interpreter| {
                    out.push(interp.eval(element)?);
                    Ok(())
                })?;
                Ok(Value::Array(out))
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => {
                let mut out = Map::new();
                self.scoped(clauses, &mut |interp: &mut Interpreter| {
                    let k = key_string(&interp.eval(key)?)?;
                    let v = interp.eval(value)?;
                    out.insert(k, v);
                    Ok(())
                })?;
                Ok(Value::Object(out))
            }
            Expr::Lambda(_) => Err(ScriptError::Type(
                "lambda can only be used as a function argument".into(),
            )),
        }
    }

    /// Folds a left-deep `a + b - c` chain without recursing down its spine.
    fn eval_binary_chain(&mut self, expr: &Expr) -> Result<Value> {
        let mut links = Vec::new();
        let mut leftmost = expr;
        while let Expr::Binary(op, left, right) = leftmost {
            links.push((*op, right.as_ref()));
            leftmost = left;
        }
        let mut acc = self.eval(leftmost)?;
        for (op, right) in links.into_iter().rev() {
            self.tick()?;
            let right = self.eval(right)?;
            self.charge(produced_units(op, &acc, &right))?;
            acc = binary(op, &acc, &right)?;
        }
        Ok(acc)
    }

    /// Same as [`Self::eval_binary_chain`] for `and` / `or`, short-circuiting.
    fn eval_bool_chain(&mut self, expr: &Expr) -> Result<Value> {
        let mut links = Vec::new();
        let mut leftmost = expr;
        while let Expr::Bool(op, left, right) = leftmost {
            links.push((*op, right.as_ref()));
            leftmost = left;
        }
        let mut acc = self.eval(leftmost)?;
        for (op, right) in links.into_iter().rev() {
            self.tick()?;
            match (op, truthy(&acc)) {
                (BoolOp::And, false) | (BoolOp::Or, true) => {}
                _ => acc = self.eval(right)?,
            }
        }
        Ok(acc)
    }

    fn slice_bound(&mut self, bound: Option<&Expr>) -> Result<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr)? {
            Value::Null => Ok(None),
            value => as_int(&value).map(Some).ok_or_else(|| {
                ScriptError::Type("slice indices must be integers or None".into())
            }),
        }
    }

    /// Runs comprehension clauses in a fresh scope.
    fn scoped(
        &mut self,
        clauses: &[Clause],
        emit: &mut dyn FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.scopes.push(HashMap::new());
        let outcome = self.comprehend(clauses, emit);
        self.scopes.pop();
        outcome
    }

    fn comprehend(
        &mut self,
        clauses: &[Clause],
        emit: &mut dyn FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let Some((clause, rest)) = clauses.split_first() else {
            return emit(self);
        };
        let items = iterate(self.eval(&clause.iter)?)?;
        'items: for item in items {
            self.tick()?;
            self.bind_target(&clause.target, item)?;
            for cond in &clause.conditions {
                if !truthy(&self.eval(cond)?) {
                    continue 'items;
                }
            }
            self.comprehend(rest, emit)?;
        }
        Ok(())
    }

    // == Calls ==
    fn eval_arg<'e>(&mut self, expr: &'e Expr) -> Result<Arg<'e>> {
        match expr {
            Expr::Lambda(lambda) => Ok(Arg::Lambda(lambda)),
            Expr::Name(name) if !self.is_bound(name) => builtin_name(name)
                .map(Arg::Builtin)
                .ok_or_else(|| ScriptError::Name(name.clone())),
            other => Ok(Arg::Value(self.eval(other)?)),
        }
    }

    #[allow(clippy::type_complexity)]
    fn eval_args<'e>(
        &mut self,
        args: &'e [Expr],
        kwargs: &'e [(String, Expr)],
    ) -> Result<(Vec<Arg<'e>>, Vec<(String, Arg<'e>)>)> {
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            positional.push(self.eval_arg(arg)?);
        }
        let mut named = Vec::with_capacity(kwargs.len());
        for (name, arg) in kwargs {
            named.push((name.clone(), self.eval_arg(arg)?));
        }
        Ok((positional, named))
    }

    fn eval_value_args(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<(Vec<Value>, Vec<(String, Value)>)> {
        let (args, kwargs) = self.eval_args(args, kwargs)?;
        let kwargs = kwargs
            .into_iter()
            .map(|(name, arg)| arg.into_value().map(|v| (name, v)))
            .collect::<Result<Vec<_>>>()?;
        Ok((values(args)?, kwargs))
    }

    fn eval_call<'e>(
        &mut self,
        func: &'e Expr,
        args: &'e [Expr],
        kwargs: &'e [(String, Expr)],
    ) -> Result<Value> {
        match func {
            Expr::Name(name) if !self.is_bound(name) => {
                let builtin = builtin_name(name).ok_or_else(|| ScriptError::Name(name.clone()))?;
                let (args, kwargs) = self.eval_args(args, kwargs)?;
                self.call_builtin(builtin, args, kwargs)
            }
            Expr::Attribute(receiver, method) => {
                if matches!(receiver.as_ref(), Expr::Name(n) if n == UTILS_NAME && !self.is_bound(n)) {
                    let (args, kwargs) = self.eval_value_args(args, kwargs)?;
                    return call_utils(method, args, kwargs);
                }
                if matches!(receiver.as_ref(), Expr::Name(n) if n == JSON_NAME && !self.is_bound(n)) {
                    let (args, kwargs) = self.eval_value_args(args, kwargs)?;
                    let result = call_json(method, args, kwargs)?;
                    return self.copied(result);
                }
                if MUTATING_METHODS.contains(&method.as_str()) && is_place(receiver) {
                    let (root, path) = self.place_path(receiver)?;
                    let (args, kwargs) = self.eval_value_args(args, kwargs)?;
                    reject_kwargs(method, &kwargs)?;
                    return mutate(self.place_mut(&root, &path)?, method, args);
                }
                let result = if is_place(receiver) {
                    let (root, path) = self.place_path(receiver)?;
                    let (args, kwargs) = self.eval_value_args(args, kwargs)?;
                    reject_kwargs(method, &kwargs)?;
                    call_method(&*self.place_ref(&root, &path)?, method, args)?
                } else {
                    let target = self.eval(receiver)?;
                    let (args, kwargs) = self.eval_value_args(args, kwargs)?;
                    reject_kwargs(method, &kwargs)?;
                    call_method(&target, method, args)?
                };
                self.copied(result)
            }
            Expr::Lambda(lambda) => {
                let (args, kwargs) = self.eval_args(args, kwargs)?;
                reject_kwargs("<lambda>", &kwargs)?;
                self.apply(&Arg::Lambda(lambda), values(args)?)
            }
            other => {
                let value = self.eval(other)?;
                Err(ScriptError::Type(format!(
                    "'{}' object is not callable",
                    type_name(&value)
                )))
            }
        }
    }

    /// Calls a lambda or builtin with positional values.
    fn apply(&mut self, callable: &Arg<'_>, args: Vec<Value>) -> Result<Value> {
        self.tick()?;
        match callable {
            Arg::Lambda(lambda) => {
                if lambda.params.len() != args.len() {
                    return Err(ScriptError::Type(format!(
                        "<lambda>() takes {} positional argument(s) but {} were given",
                        lambda.params.len(),
                        args.len()
                    )));
                }
                let scope: HashMap<String, Value> =
                    lambda.params.iter().cloned().zip(args).collect();
                self.scopes.push(scope);
                let result = self.eval(&lambda.body);
                self.scopes.pop();
                result
            }
            Arg::Builtin(name) => {
                self.call_builtin(name, args.into_iter().map(Arg::Value).collect(), Vec::new())
            }
            Arg::Value(value) => Err(ScriptError::Type(format!(
                "'{}' object is not callable",
                type_name(value)
            ))),
        }
    }

    fn call_builtin<'e>(
        &mut self,
        name: &str,
        args: Vec<Arg<'e>>,
        kwargs: Vec<(String, Arg<'e>)>,
    ) -> Result<Value> {
        let result = self.dispatch_builtin(name, args, kwargs)?;
        // items were paid for when they were read, only the new list is charged
        if let Value::Array(items) = &result {
            self.charge(items.len() as u64)?;
        }
        Ok(result)
    }

    fn dispatch_builtin<'e>(
        &mut self,
        name: &str,
        args: Vec<Arg<'e>>,
        mut kwargs: Vec<(String, Arg<'e>)>,
    ) -> Result<Value> {
        match name {
            "sorted" => {
                let key = take_callable(&mut kwargs, "key");
                let reverse = match take_kwarg(&mut kwargs, "reverse") {
                    Some(arg) => truthy(&arg.into_value()?),
                    None => false,
                };
                reject_kwargs(name, &kwargs)?;
                arity(name, args.len(), 1, 1)?;
                let items = iterate(values(args)?.remove(0))?;
                let keys = self.sort_keys(&items, key.as_ref())?;
                sort_by_keys(items, keys, reverse).map(Value::Array)
            }
            "min" | "max" => {
                let key = take_callable(&mut kwargs, "key");
                let default = take_kwarg(&mut kwargs, "default");
                reject_kwargs(name, &kwargs)?;
                let mut args = values(args)?;
                let candidates = match args.len() {
                    0 => return Err(ScriptError::Type(format!("{}() expected at least 1 argument", name))),
                    1 => iterate(args.remove(0))?,
                    _ => args,
                };
                let wanted = if name == "min" { Ordering::Less } else { Ordering::Greater };
                self.extreme(name, candidates, key.as_ref(), default, wanted)
            }
            "map" | "filter" => {
                reject_kwargs(name, &kwargs)?;
                arity(name, args.len(), 2, 2)?;
                let mut args = args.into_iter();
                let (Some(func), Some(iterable)) = (args.next(), args.next()) else {
                    return Err(ScriptError::Type(format!("{}() takes 2 arguments", name)));
                };
                let items = iterate(iterable.into_value()?)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if name == "map" {
                        out.push(self.apply(&func, vec![item])?);
                    } else {
                        let keep = match &func {
                            Arg::Value(Value::Null) => truthy(&item),
                            callable => truthy(&self.apply(callable, vec![item.clone()])?),
                        };
                        if keep {
                            out.push(item);
                        }
                    }
                }
                Ok(Value::Array(out))
            }
            "print" => {
                reject_kwargs(name, &kwargs)?;
                let line: Vec<String> = values(args)?.iter().map(py_str).collect();
                debug!(output = %line.join(" "), "snippet print");
                Ok(Value::Null)
            }
            "dict" => {
                let mut map = Map::new();
                let args = values(args)?;
                arity(name, args.len(), 0, 1)?;
                if let Some(source) = args.into_iter().next() {
                    match source {
                        Value::Object(entries) => map.extend(entries),
                        other => {
                            for pair in iterate(other)? {
                                let mut pair = iterate(pair)?;
                                if pair.len() != 2 {
                                    return Err(ScriptError::Value(
                                        "dictionary update sequence element has wrong length".into(),
                                    ));
                                }
                                let value = pair.pop().unwrap_or(Value::Null);
                                let key = key_string(&pair[0])?;
                                map.insert(key, value);
                            }
                        }
                    }
                }
                for (key, arg) in kwargs {
                    map.insert(key, arg.into_value()?);
                }
                Ok(Value::Object(map))
            }
            _ => {
                reject_kwargs(name, &kwargs)?;
                simple_builtin(name, values(args)?)
            }
        }
    }

    fn sort_keys(&mut self, items: &[Value], key: Option<&Arg<'_>>) -> Result<Vec<Value>> {
        match key {
            Some(func) => items
                .iter()
                .map(|item| self.apply(func, vec![item.clone()]))
                .collect(),
            None => Ok(items.to_vec()),
        }
    }

    fn extreme(
        &mut self,
        name: &str,
        candidates: Vec<Value>,
        key: Option<&Arg<'_>>,
        default: Option<Arg<'_>>,
        wanted: Ordering,
    ) -> Result<Value> {
        let mut best: Option<(Value, Value)> = None;
        for item in candidates {
            let rank = match key {
                Some(func) => self.apply(func, vec![item.clone()])?,
                None => item.clone(),
            };
            let better = match &best {
                None => true,
                Some((best_rank, _)) => compare(&rank, best_rank)? == wanted,
            };
            if better {
                best = Some((rank, item));
            }
        }
        match (best, default) {
            (Some((_, item)), _) => Ok(item),
            (None, Some(default)) => default.into_value(),
            (None, None) => Err(ScriptError::Value(format!(
                "{}() arg is an empty sequence",
                name
            ))),
        }
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::NotEq => !values_equal(left, right),
        CmpOp::Lt => compare(left, right)? == Ordering::Less,
        CmpOp::LtE => compare(left, right)? != Ordering::Greater,
        CmpOp::Gt => compare(left, right)? == Ordering::Greater,
        CmpOp::GtE => compare(left, right)? != Ordering::Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
    })
}

// == Builtins ==
fn simple_builtin(name: &str, mut args: Vec<Value>) -> Result<Value> {
    match name {
        "len" => {
            arity(name, args.len(), 1, 1)?;
            let len = match &args[0] {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                other => {
                    return Err(ScriptError::Type(format!(
                        "object of type '{}' has no len()",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(len))
        }
        "str" => {
            arity(name, args.len(), 0, 1)?;
            Ok(Value::String(args.first().map(py_str).unwrap_or_default()))
        }
        "int" => {
            arity(name, args.len(), 0, 1)?;
            to_int(args.pop().unwrap_or(Value::from(0)))
        }
        "float" => {
            arity(name, args.len(), 0, 1)?;
            to_float(args.pop().unwrap_or(Value::from(0.0)))
        }
        "bool" => {
            arity(name, args.len(), 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(truthy)))
        }
        "abs" => {
            arity(name, args.len(), 1, 1)?;
            match as_num(&args[0]) {
                Some(Num::Int(i)) => Ok(i
                    .checked_abs()
                    .map(Value::from)
                    .unwrap_or_else(|| float_value((i as f64).abs()))),
                Some(Num::Float(f)) => Ok(float_value(f.abs())),
                None => Err(ScriptError::Type(format!(
                    "bad operand type for abs(): '{}'",
                    type_name(&args[0])
                ))),
            }
        }
        "round" => {
            arity(name, args.len(), 1, 2)?;
            let digits = match args.get(1) {
                None | Some(Value::Null) => None,
                Some(value) => Some(as_int(value).ok_or_else(|| {
                    ScriptError::Type("round() ndigits must be an integer".into())
                })?),
            };
            let number = as_num(&args[0]).ok_or_else(|| {
                ScriptError::Type(format!(
                    "type {} doesn't define __round__ method",
                    type_name(&args[0])
                ))
            })?;
            match (number, digits) {
                (Num::Int(i), None) => Ok(Value::from(i)),
                (Num::Float(f), None) => Ok(Value::from(round_half_even(f) as i64)),
                (number, Some(digits)) => {
                    let scale = 10f64.powi(digits.clamp(-300, 300) as i32);
                    Ok(float_value(round_half_even(number.as_f64() * scale) / scale))
                }
            }
        }
        "sum" => {
            arity(name, args.len(), 1, 2)?;
            let start = if args.len() == 2 {
                args.pop().unwrap_or(Value::from(0))
            } else {
                Value::from(0)
            };
            iterate(args.remove(0))?
                .iter()
                .try_fold(start, |total, item| binary(BinOp::Add, &total, item))
        }
        "list" => {
            arity(name, args.len(), 0, 1)?;
            match args.pop() {
                Some(value) => iterate(value).map(Value::Array),
                None => Ok(Value::Array(Vec::new())),
            }
        }
        "set" => {
            arity(name, args.len(), 0, 1)?;
            let items = match args.pop() {
                Some(value) => iterate(value)?,
                None => Vec::new(),
            };
            let mut seen = std::collections::HashSet::new();
            let mut unique = Vec::new();
            for item in items {
                if matches!(item, Value::Array(_) | Value::Object(_)) {
                    return Err(ScriptError::Type(format!(
                        "unhashable type: '{}'",
                        type_name(&item)
                    )));
                }
                if seen.insert(repr(&item)) {
                    unique.push(item);
                }
            }
            Ok(Value::Array(unique))
        }
        "range" => {
            arity(name, args.len(), 1, 3)?;
            let mut ints = Vec::with_capacity(args.len());
            for arg in &args {
                ints.push(as_int(arg).ok_or_else(|| {
                    ScriptError::Type(format!(
                        "'{}' object cannot be interpreted as an integer",
                        type_name(arg)
                    ))
                })?);
            }
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            range(start, stop, step)
        }
        "enumerate" => {
            arity(name, args.len(), 1, 2)?;
            let start = match args.get(1) {
                Some(value) => as_int(value)
                    .ok_or_else(|| ScriptError::Type("enumerate() start must be an integer".into()))?,
                None => 0,
            };
            let items = iterate(args.remove(0))?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Value::Array(vec![Value::from(start + i as i64), item]))
                    .collect(),
            ))
        }
        "zip" => {
            let columns = args
                .into_iter()
                .map(iterate)
                .collect::<Result<Vec<_>>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|row| Value::Array(columns.iter().map(|col| col[row].clone()).collect()))
                .collect();
            Ok(Value::Array(rows))
        }
        "any" | "all" => {
            arity(name, args.len(), 1, 1)?;
            let items = iterate(args.remove(0))?;
            Ok(Value::Bool(if name == "any" {
                items.iter().any(truthy)
            } else {
                items.iter().all(truthy)
            }))
        }
        "reversed" => {
            arity(name, args.len(), 1, 1)?;
            let mut items = iterate(args.remove(0))?;
            items.reverse();
            Ok(Value::Array(items))
        }
        other => Err(ScriptError::Name(other.to_string())),
    }
}

fn to_int(value: Value) -> Result<Value> {
    match &value {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| ScriptError::Value(format!("invalid literal for int(): {}", repr(&value)))),
        other => match as_num(other) {
            Some(Num::Int(i)) => Ok(Value::from(i)),
            Some(Num::Float(f)) if f.is_finite() => Ok(Value::from(f.trunc() as i64)),
            Some(Num::Float(_)) => Err(ScriptError::Value("cannot convert float infinity or NaN to integer".into())),
            None => Err(ScriptError::Type(format!(
                "int() argument must be a string or a number, not '{}'",
                type_name(other)
            ))),
        },
    }
}

fn to_float(value: Value) -> Result<Value> {
    match &value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(float_value)
            .map_err(|_| ScriptError::Value(format!("could not convert string to float: {}", repr(&value)))),
        other => as_num(other)
            .map(|n| float_value(n.as_f64()))
            .ok_or_else(|| {
                ScriptError::Type(format!(
                    "float() argument must be a string or a number, not '{}'",
                    type_name(other)
                ))
            }),
    }
}

fn range(start: i64, stop: i64, step: i64) -> Result<Value> {
    if step == 0 {
        return Err(ScriptError::Value("range() arg 3 must not be zero".into()));
    }
    let span = if step > 0 {
        (stop as i128 - start as i128 + step as i128 - 1) / step as i128
    } else {
        (start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))
    };
    let len = span.max(0) as usize;
    if len > MAX_RANGE_LEN {
        return Err(ScriptError::Value(format!(
            "range of {} items exceeds the maximum of {}",
            len, MAX_RANGE_LEN
        )));
    }
    Ok(Value::Array(
        (0..len as i64).map(|i| Value::from(start + i * step)).collect(),
    ))
}

// == Methods ==
fn call_method(target: &Value, method: &str, mut args: Vec<Value>) -> Result<Value> {
    match (target, method) {
        (Value::Object(map), "get") => {
            arity(method, args.len(), 1, 2)?;
            let default = if args.len() == 2 { args.pop().unwrap_or(Value::Null) } else { Value::Null };
            Ok(map.get(&key_string(&args[0])?).cloned().unwrap_or(default))
        }
        (Value::Object(map), "keys") => {
            arity(method, args.len(), 0, 0)?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        (Value::Object(map), "values") => {
            arity(method, args.len(), 0, 0)?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        (Value::Object(map), "items") => {
            arity(method, args.len(), 0, 0)?;
            Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        (Value::String(s), _) => string_method(s, method, args),
        (Value::Array(items), "count") => {
            arity(method, args.len(), 1, 1)?;
            Ok(Value::from(items.iter().filter(|item| values_equal(item, &args[0])).count()))
        }
        (Value::Array(items), "index") => {
            arity(method, args.len(), 1, 1)?;
            items
                .iter()
                .position(|item| values_equal(item, &args[0]))
                .map(Value::from)
                .ok_or_else(|| ScriptError::Value(format!("{} is not in list", repr(&args[0]))))
        }
        // receiver is a temporary, so the mutation is not observable
        _ if MUTATING_METHODS.contains(&method) => mutate(&mut target.clone(), method, args),
        _ => Err(no_attribute(target, method)),
    }
}

fn no_attribute(target: &Value, method: &str) -> ScriptError {
    ScriptError::Type(format!(
        "'{}' object has no attribute '{}'",
        type_name(target),
        method
    ))
}

fn mutate(target: &mut Value, method: &str, mut args: Vec<Value>) -> Result<Value> {
    arity(method, args.len(), 1, 1)?;
    let arg = args.remove(0);
    match (target, method) {
        (Value::Array(items), "append") => items.push(arg),
        (Value::Array(items), "extend") => items.extend(iterate(arg)?),
        (Value::Object(map), "update") => match arg {
            Value::Object(other) => map.extend(other),
            other => {
                return Err(ScriptError::Type(format!(
                    "dict.update() expects a dict, got '{}'",
                    type_name(&other)
                )))
            }
        },
        (target, method) => return Err(no_attribute(target, method)),
    }
    Ok(Value::Null)
}

fn string_method(s: &str, method: &str, mut args: Vec<Value>) -> Result<Value> {
    let text = |value: String| -> Result<Value> { Ok(Value::String(value)) };
    match method {
        "lower" => text(s.to_lowercase()),
        "upper" => text(s.to_uppercase()),
        "title" => text(
            s.split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<String>>()
                .join(" "),
        ),
        "strip" | "lstrip" | "rstrip" => {
            arity(method, args.len(), 0, 1)?;
            let chars: Option<Vec<char>> = match args.pop() {
                None | Some(Value::Null) => None,
                Some(value) => Some(expect_str(value, method)?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            text(match method {
                "strip" => s.trim_matches(matches).to_string(),
                "lstrip" => s.trim_start_matches(matches).to_string(),
                _ => s.trim_end_matches(matches).to_string(),
            })
        }
        "startswith" | "endswith" => {
            arity(method, args.len(), 1, 1)?;
            let prefixes = match args.remove(0) {
                Value::String(p) => vec![p],
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| expect_str(item, method))
                    .collect::<Result<Vec<_>>>()?,
                other => return Err(ScriptError::Type(format!(
                    "{}() argument must be str or a list of str, not '{}'",
                    method,
                    type_name(&other)
                ))),
            };
            Ok(Value::Bool(prefixes.iter().any(|p| {
                if method == "startswith" {
                    s.starts_with(p.as_str())
                } else {
                    s.ends_with(p.as_str())
                }
            })))
        }
        "split" => {
            arity(method, args.len(), 0, 1)?;
            let parts: Vec<Value> = match args.pop() {
                None | Some(Value::Null) => s
                    .split_whitespace()
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                Some(sep) => {
                    let sep = expect_str(sep, method)?;
                    if sep.is_empty() {
                        return Err(ScriptError::Value("empty separator".into()));
                    }
                    s.split(sep.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect()
                }
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(method, args.len(), 1, 1)?;
            let mut parts = Vec::new();
            for (i, item) in iterate(args.remove(0))?.into_iter().enumerate() {
                match item {
                    Value::String(part) => parts.push(part),
                    other => {
                        return Err(ScriptError::Type(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            type_name(&other)
                        )))
                    }
                }
            }
            text(parts.join(s))
        }
        "replace" => {
            arity(method, args.len(), 2, 2)?;
            let new = expect_str(args.pop().unwrap_or(Value::Null), method)?;
            let old = expect_str(args.pop().unwrap_or(Value::Null), method)?;
            text(s.replace(old.as_str(), new.as_str()))
        }
        "count" => {
            arity(method, args.len(), 1, 1)?;
            let needle = expect_str(args.remove(0), method)?;
            if needle.is_empty() {
                return Ok(Value::from(s.chars().count() + 1));
            }
            Ok(Value::from(s.matches(needle.as_str()).count()))
        }
        "find" => {
            arity(method, args.len(), 1, 1)?;
            let needle = expect_str(args.remove(0), method)?;
            Ok(match s.find(needle.as_str()) {
                Some(byte) => Value::from(s[..byte].chars().count()),
                None => Value::from(-1),
            })
        }
        _ => Err(no_attribute(&Value::String(s.to_string()), method)),
    }
}

// == Utils ==
fn call_utils(function: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value> {
    match function {
        "group_by" | "groupBy" | "count_by" | "countBy" | "sum_by" | "sumBy" => {
            let mut bound = bind_params(function, &["data", "key"], 2, args, kwargs)?;
            let data = required(&mut bound[0]);
            let key = expect_str(required(&mut bound[1]), function)?;
            match function {
                "group_by" | "groupBy" => utils::group_by(&data, &key),
                "count_by" | "countBy" => utils::count_by(&data, &key),
                _ => utils::sum_by(&data, &key),
            }
        }
        "unique" => {
            let mut bound = bind_params(function, &["data", "key"], 1, args, kwargs)?;
            let data = required(&mut bound[0]);
            let key = match bound[1].take() {
                None | Some(Value::Null) => None,
                Some(key) => Some(expect_str(key, function)?),
            };
            utils::unique(&data, key.as_deref())
        }
        "aggregate" => {
            let mut bound = bind_params(
                function,
                &["data", "group_key", "value_key", "operation"],
                3,
                args,
                kwargs,
            )?;
            let data = required(&mut bound[0]);
            let group_key = expect_str(required(&mut bound[1]), function)?;
            let value_key = expect_str(required(&mut bound[2]), function)?;
            let operation = match bound[3].take() {
                Some(op) => Aggregation::parse(&expect_str(op, function)?)?,
                None => Aggregation::Sum,
            };
            utils::aggregate(&data, &group_key, &value_key, operation)
        }
        "filter_by_date_range" | "filterByDateRange" => {
            let mut bound = bind_params(function, &["data", "field", "start", "end"], 4, args, kwargs)?;
            let data = required(&mut bound[0]);
            let field = expect_str(required(&mut bound[1]), function)?;
            let start = expect_str(required(&mut bound[2]), function)?;
            let end = expect_str(required(&mut bound[3]), function)?;
            utils::filter_by_date_range(&data, &field, &start, &end)
        }
        "in_date_range" | "inDateRange" => {
            let mut bound = bind_params(function, &["value", "start", "end"], 3, args, kwargs)?;
            let value = required(&mut bound[0]);
            let start = expect_str(required(&mut bound[1]), function)?;
            let end = expect_str(required(&mut bound[2]), function)?;
            utils::in_date_range(&value, &start, &end).map(Value::Bool)
        }
        other => Err(ScriptError::Type(format!(
            "utils has no function '{}', available: {}",
            other,
            utils::UTILS_FUNCTIONS.join(", ")
        ))),
    }
}

// == JSON ==
fn call_json(function: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value> {
    match function {
        "dumps" => {
            // maps keep their keys sorted, so `sort_keys` changes nothing
            let mut bound = bind_params(
                function,
                &["obj", "indent", "sort_keys", "default"],
                1,
                args,
                kwargs,
            )?;
            let value = required(&mut bound[0]);
            let text = match bound[1].take() {
                None | Some(Value::Null) => serde_json::to_string(&value),
                Some(_) => serde_json::to_string_pretty(&value),
            };
            text.map(Value::String)
                .map_err(|err| ScriptError::Value(err.to_string()))
        }
        "loads" => {
            let mut bound = bind_params(function, &["s"], 1, args, kwargs)?;
            let text = expect_str(required(&mut bound[0]), function)?;
            serde_json::from_str(&text)
                .map_err(|err| ScriptError::Value(format!("invalid JSON: {}", err)))
        }
        other => Err(ScriptError::Type(format!(
            "json has no function '{}', available: dumps, loads",
            other
        ))),
    }
}
