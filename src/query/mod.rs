//! Query processing module
//!
//! Evaluates caller-supplied transformation snippets against fetched data
//! with a small, capability-restricted interpreter.

mod ast;
mod executor;
mod interp;
mod lexer;
mod parser;
mod utils;
mod value;

pub use ast::{Expr, Stmt};
pub use executor::{
    data_counts, EvalMode, QueryExecutor, QueryOutcome, QueryResult, DATA_NAME, RESULT_NAME,
};
pub use interp::{Interpreter, DEFAULT_STEP_BUDGET, MAX_RANGE_LEN};
pub use parser::{parse_expression, parse_program};
pub use utils::{Aggregation, MISSING_GROUP, UTILS_FUNCTIONS};
pub use value::MAX_SEQUENCE_LEN;
