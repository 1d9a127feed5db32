//! Query Executor
//!
//! Runs a job's transformation snippet over the fetched dataset and guards
//! the size of what comes back. Failures never escape: they are turned into
//! diagnostic objects the caller can return as the job result.

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{QueryError, ScriptError};
use crate::query::interp::{Interpreter, DEFAULT_STEP_BUDGET};
use crate::query::parser::{parse_expression, parse_program};

/// Name the dataset is bound to inside snippets.
pub const DATA_NAME: &str = "data";

/// Global read back after a block snippet finishes without `return`.
pub const RESULT_NAME: &str = "result";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const TOO_LARGE_RECOMMENDATION: &str =
    "Refine your processing to aggregate data instead of returning raw records";

const FAILED_RECOMMENDATION: &str = "Check your processing code syntax. Use utils.group_by(), \
     utils.count_by(), etc. for common operations.";

/// How a snippet was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Not run at all (absent, blank, or `return data`)
    Skipped,
    /// Single-line snippet evaluated as an expression
    Expression,
    /// Statement block
    Block,
}

/// Outcome of processing: the (possibly transformed) data or a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Data(Value),
    Diagnostic(Value),
}

impl QueryResult {
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, QueryResult::Diagnostic(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            QueryResult::Data(value) | QueryResult::Diagnostic(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub mode: EvalMode,
    /// Time spent evaluating and measuring the snippet
    pub elapsed: Duration,
}

// == Query Executor ==
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    max_result_mb: u64,
    step_budget: u64,
    enabled: bool,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(10)
    }
}

impl QueryExecutor {
    pub fn new(max_result_mb: u64) -> Self {
        Self {
            max_result_mb,
            step_budget: DEFAULT_STEP_BUDGET,
            enabled: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_result_size_mb).with_enabled(config.processing_enabled)
    }

    /// When disabled, snippets are ignored and data passes through.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_step_budget(mut self, step_budget: u64) -> Self {
        self.step_budget = step_budget;
        self
    }

    pub fn max_result_bytes(&self) -> usize {
        (self.max_result_mb as usize).saturating_mul(1024 * 1024)
    }

    /// True when `snippet` would be evaluated.
    pub fn should_run(&self, snippet: Option<&str>) -> bool {
        self.enabled
            && snippet.is_some_and(|code| {
                let code = code.trim();
                !code.is_empty() && code != "return data"
            })
    }

    // == Execute ==
    /// Applies `snippet` to `dataset`.
    ///
    /// Single-line snippets are first tried as an expression; syntax and
    /// name errors fall back to block evaluation. A block yields its
    /// `return` value, else its `result` global, else the dataset.
    pub fn execute(&self, snippet: Option<&str>, dataset: Value) -> QueryOutcome {
        let started = Instant::now();
        let code = match snippet {
            Some(code) if self.should_run(Some(code)) => code,
            _ => {
                return QueryOutcome {
                    result: QueryResult::Data(dataset),
                    mode: EvalMode::Skipped,
                    elapsed: started.elapsed(),
                }
            }
        };

        let counts = data_counts(&dataset);
        let available = available_data(&dataset);

        let (evaluated, mode) = self.evaluate(code, dataset);
        let result = match evaluated {
            Ok(value) => self.guard_size(value, counts),
            Err(err) => {
                warn!(error = %err, "processing snippet failed");
                QueryResult::Diagnostic(processing_failed(
                    &QueryError::Processing {
                        message: err.to_string(),
                    },
                    available,
                    counts,
                ))
            }
        };

        QueryOutcome {
            result,
            mode,
            elapsed: started.elapsed(),
        }
    }

    fn evaluate(&self, code: &str, mut dataset: Value) -> (Result<Value, ScriptError>, EvalMode) {
        let source = dedent(code);
        let single_line = source.trim().lines().count() <= 1;

        if single_line {
            match parse_expression(source.trim()) {
                Ok(expr) => {
                    let mut interp = self.interpreter(dataset);
                    match interp.eval(&expr) {
                        Ok(value) => {
                            debug!(steps = interp.steps(), "snippet evaluated as expression");
                            return (Ok(value), EvalMode::Expression);
                        }
                        Err(err) if err.allows_block_fallback() => {
                            debug!(error = %err, "expression evaluation failed, retrying as block");
                            // expressions cannot rebind `data`
                            dataset = interp.take_global(DATA_NAME).unwrap_or(Value::Null);
                        }
                        Err(err) => return (Err(err), EvalMode::Expression),
                    }
                }
                Err(err) => debug!(error = %err, "not an expression, running as block"),
            }
        }

        (self.run_block(&source, dataset), EvalMode::Block)
    }

    fn run_block(&self, source: &str, dataset: Value) -> Result<Value, ScriptError> {
        let program = parse_program(source)?;
        let mut interp = self.interpreter(dataset);
        let returned = interp.run(&program)?;
        debug!(steps = interp.steps(), "snippet evaluated as block");

        if let Some(value) = returned {
            return Ok(value);
        }
        if let Some(value) = interp.take_global(RESULT_NAME) {
            return Ok(value);
        }
        Ok(interp.take_global(DATA_NAME).unwrap_or(Value::Null))
    }

    fn interpreter(&self, dataset: Value) -> Interpreter {
        let mut interp = Interpreter::new(self.step_budget);
        interp.bind(DATA_NAME, dataset);
        interp
    }

    // == Size Guard ==
    fn guard_size(&self, value: Value, counts: Value) -> QueryResult {
        let size = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes.len(),
            Err(err) => {
                return QueryResult::Diagnostic(processing_failed(
                    &QueryError::Processing {
                        message: format!("result is not serializable: {}", err),
                    },
                    Value::Array(Vec::new()),
                    counts,
                ))
            }
        };

        if size > self.max_result_bytes() {
            let err = QueryError::ResultTooLarge {
                limit_mb: self.max_result_mb,
                actual_mb: size as f64 / BYTES_PER_MB,
            };
            warn!(size_bytes = size, limit_mb = self.max_result_mb, "processed result too large");
            return QueryResult::Diagnostic(too_large(&err, counts));
        }
        QueryResult::Data(value)
    }
}

// == Diagnostics ==
/// Record count per dataset key.
pub fn data_counts(dataset: &Value) -> Value {
    let counts: Map<String, Value> = dataset
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| {
                    let count = value.as_array().map(Vec::len).unwrap_or(0);
                    (key.clone(), Value::from(count))
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Object(counts)
}

fn available_data(dataset: &Value) -> Value {
    let keys = dataset
        .as_object()
        .map(|map| map.keys().cloned().map(Value::String).collect())
        .unwrap_or_default();
    Value::Array(keys)
}

fn too_large(err: &QueryError, counts: Value) -> Value {
    let (limit_mb, actual_mb) = match err {
        QueryError::ResultTooLarge {
            limit_mb,
            actual_mb,
        } => (*limit_mb, *actual_mb),
        QueryError::Processing { .. } => (0, 0.0),
    };
    json!({
        "error": "Result too large",
        "message": err.to_string(),
        "limitMB": limit_mb,
        "actualMB": (actual_mb * 100.0).round() / 100.0,
        "recommendation": TOO_LARGE_RECOMMENDATION,
        "data_counts": counts,
    })
}

fn processing_failed(err: &QueryError, available: Value, counts: Value) -> Value {
    json!({
        "error": "Processing failed",
        "message": err.to_string(),
        "recommendation": FAILED_RECOMMENDATION,
        "available_data": available,
        "data_counts": counts,
    })
}

/// Strips the indentation shared by all non-blank lines.
fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    code.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Value {
        json!({
            "people": [
                {"id": 1, "stage": "Lead"},
                {"id": 2, "stage": "Client"},
                {"id": 3, "stage": "Lead"}
            ],
            "calls": [{"id": 10}]
        })
    }

    fn run(snippet: &str) -> QueryOutcome {
        QueryExecutor::default().execute(Some(snippet), dataset())
    }

    #[test]
    fn test_skips_absent_blank_and_identity_snippets() {
        let executor = QueryExecutor::default();
        for snippet in [None, Some(""), Some("   \n"), Some("return data")] {
            let outcome = executor.execute(snippet, dataset());
            assert_eq!(outcome.mode, EvalMode::Skipped);
            assert_eq!(outcome.result, QueryResult::Data(dataset()));
        }
    }

    #[test]
    fn test_expression_mode() {
        let outcome = run("len(data['people'])");
        assert_eq!(outcome.mode, EvalMode::Expression);
        assert_eq!(outcome.result, QueryResult::Data(json!(3)));
    }

    #[test]
    fn test_single_line_statement_falls_back_to_block() {
        let outcome = run("result = utils.count_by(data['people'], 'stage')");
        assert_eq!(outcome.mode, EvalMode::Block);
        assert_eq!(
            outcome.result,
            QueryResult::Data(json!({"Lead": 2, "Client": 1}))
        );
    }

    #[test]
    fn test_block_without_result_returns_dataset() {
        let outcome = run("x = 1\ny = 2");
        assert_eq!(outcome.mode, EvalMode::Block);
        assert_eq!(outcome.result, QueryResult::Data(dataset()));
    }

    #[test]
    fn test_indented_block_with_return() {
        let snippet = "
            leads = [p for p in data['people'] if p['stage'] == 'Lead']
            return {'leads': len(leads)}
        ";
        let outcome = run(snippet);
        assert_eq!(outcome.result, QueryResult::Data(json!({"leads": 2})));
    }

    #[test]
    fn test_runtime_error_becomes_diagnostic() {
        let outcome = run("data['people'][0]['missing']");
        let diagnostic = match outcome.result {
            QueryResult::Diagnostic(value) => value,
            other => panic!("expected diagnostic, got {:?}", other),
        };
        assert_eq!(diagnostic["error"], "Processing failed");
        assert!(diagnostic["message"].as_str().unwrap().contains("KeyError"));
        let mut available: Vec<&str> = diagnostic["available_data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        available.sort();
        assert_eq!(available, vec!["calls", "people"]);
        assert_eq!(diagnostic["data_counts"], json!({"people": 3, "calls": 1}));
    }

    #[test]
    fn test_syntax_error_becomes_diagnostic() {
        let outcome = run("for p in data['people']\n    pass");
        assert!(outcome.result.is_diagnostic());
        let message = outcome.result.into_value()["message"].as_str().unwrap().to_string();
        assert!(message.contains("SyntaxError"));
    }

    #[test]
    fn test_oversize_result_is_replaced() {
        // 15 MB of text against a 10 MB limit
        let outcome = QueryExecutor::new(10).execute(Some("'x' * (15 * 1024 * 1024)"), dataset());
        let diagnostic = match outcome.result {
            QueryResult::Diagnostic(value) => value,
            other => panic!("expected diagnostic, got {:?}", other),
        };
        assert_eq!(diagnostic["error"], "Result too large");
        assert_eq!(diagnostic["limitMB"], 10);
        assert_eq!(diagnostic["actualMB"], 15.0);
        assert_eq!(diagnostic["data_counts"]["people"], 3);
        assert!(diagnostic["recommendation"].is_string());
    }

    #[test]
    fn test_result_limit_comes_from_config() {
        let config = Config {
            max_result_size_mb: 1,
            ..Config::default()
        };
        let executor = QueryExecutor::from_config(&config);
        assert_eq!(executor.max_result_bytes(), 1024 * 1024);

        let outcome = executor.execute(Some("'x' * (2 * 1024 * 1024)"), dataset());
        assert!(matches!(outcome.result, QueryResult::Diagnostic(ref d) if d["limitMB"] == 1));
    }

    #[test]
    fn test_disabled_executor_passes_data_through() {
        let outcome = QueryExecutor::default()
            .with_enabled(false)
            .execute(Some("len(data)"), dataset());
        assert_eq!(outcome.mode, EvalMode::Skipped);
        assert_eq!(outcome.result, QueryResult::Data(dataset()));
    }

    #[test]
    fn test_step_budget_produces_diagnostic() {
        let outcome = QueryExecutor::default()
            .with_step_budget(500)
            .execute(Some("for i in range(100000):\n    pass"), dataset());
        let message = outcome.result.into_value()["message"].as_str().unwrap().to_string();
        assert!(message.contains("budget"));
    }

    /// Runs a snippet on a thread as small as a blocking-pool worker.
    fn run_on_small_stack(snippet: String) -> QueryOutcome {
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || QueryExecutor::default().execute(Some(&snippet), dataset()))
            .unwrap()
            .join()
            .unwrap()
    }

    fn diagnostic_message(outcome: QueryOutcome) -> String {
        match outcome.result {
            QueryResult::Diagnostic(value) => value["message"].as_str().unwrap().to_string(),
            other => panic!("expected diagnostic, got {:?}", other),
        }
    }

    #[test]
    fn test_deeply_nested_snippets_become_diagnostics() {
        for snippet in [
            format!("{}1{}", "[".repeat(200), "]".repeat(200)),
            format!("{}True", "not ".repeat(1000)),
            format!("{}1", "-".repeat(5000)),
            format!("1{}", " + 1".repeat(5000)),
        ] {
            let message = diagnostic_message(run_on_small_stack(snippet));
            assert!(message.contains("SyntaxError"), "{}", message);
        }

        let self_nesting = "x = []\nfor i in range(1000):\n    x = [x]\nresult = len(x)".to_string();
        let message = diagnostic_message(run_on_small_stack(self_nesting));
        assert!(message.contains("nested"), "{}", message);
    }

    #[test]
    fn test_mixed_type_sort_becomes_diagnostic() {
        let items: Vec<String> = (0..50)
            .map(|i| if i % 2 == 0 { i.to_string() } else { format!("'s{}'", i) })
            .collect();
        let message = diagnostic_message(run(&format!("sorted([{}])", items.join(", "))));
        assert!(message.contains("TypeError"), "{}", message);
    }

    #[test]
    fn test_repetition_is_bounded_by_budget() {
        let outcome = QueryExecutor::default()
            .with_step_budget(50)
            .execute(Some("len([[0] * 4000] * 4000)"), dataset());
        assert!(diagnostic_message(outcome).contains("budget"));
    }

    #[test]
    fn test_dedent() {
        assert_eq!(dedent("    a = 1\n      b = 2\n"), "a = 1\n  b = 2");
        assert_eq!(dedent("x"), "x");
    }
}
