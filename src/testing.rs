//! Runs a question's tests on one sandbox and collects the graded outcome

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::grader::{Grader, TestCase, TestResult};
use crate::sandbox::{ResultCode, RunParams, RunResult, RunSpec, Sandbox, SandboxError};

/// Line printed between the outputs of consecutive tests in a combined run
pub const TEST_SEPARATOR: &str = "#<ab@17943918#@>#";

/// Fields a combinator template grader may report
const COMBINATOR_FIELDS: [&str; 9] = [
    "fraction",
    "prologuehtml",
    "testresults",
    "epiloguehtml",
    "feedbackhtml",
    "columnformats",
    "showdifferences",
    "showoutputonly",
    "graderstate",
];

/// A failure that stops grading of the whole submission
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradingError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("The combinator template grader needs a combined test program")]
    NoCombinedProgram,
}

/// Builds the programs that get sent to the sandbox
pub trait ProgramSource: Send + Sync {
    /// The program that runs a single test
    fn per_test(&self, test: &TestCase) -> anyhow::Result<String>;

    /// One program running every test, printing [`TEST_SEPARATOR`] on a line
    /// of its own between consecutive tests
    ///
    /// `None` when this source cannot combine tests.
    fn combined(&self, tests: &[TestCase]) -> Option<anyhow::Result<String>> {
        let _ = tests;
        None
    }
}

/// The student's answer followed by each test's code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSource {
    answer: String,
    separator_statement: Option<String>,
}

impl AnswerSource {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            separator_statement: None,
        }
    }

    /// Allows combined runs, using `statement` to print the separator line
    pub fn with_separator(mut self, statement: impl Into<String>) -> Self {
        self.separator_statement = Some(statement.into());
        self
    }
}

impl ProgramSource for AnswerSource {
    fn per_test(&self, test: &TestCase) -> anyhow::Result<String> {
        Ok(format!("{}\n{}\n", self.answer, test.test_code))
    }

    fn combined(&self, tests: &[TestCase]) -> Option<anyhow::Result<String>> {
        let statement = self.separator_statement.as_ref()?;
        let mut program = self.answer.clone();
        for (i, test) in tests.iter().enumerate() {
            if i > 0 {
                program.push('\n');
                program.push_str(statement);
            }
            program.push('\n');
            program.push_str(&test.test_code);
        }
        program.push('\n');
        Some(Ok(program))
    }
}

/// Everything about a question needed to run its tests
#[derive(Clone)]
pub struct Question {
    pub language: String,
    pub grader: Grader,
    pub params: RunParams,
    /// Support files copied into every run
    pub files: BTreeMap<String, Vec<u8>>,
    /// Combine tests even when they read standard input
    pub allow_multiple_stdins: bool,
    pub source: Arc<dyn ProgramSource>,
}

impl Question {
    pub fn new(language: impl Into<String>, source: Arc<dyn ProgramSource>) -> Self {
        Self {
            language: language.into(),
            grader: Grader::default(),
            params: RunParams::default(),
            files: BTreeMap::new(),
            allow_multiple_stdins: false,
            source,
        }
    }

    pub fn with_grader(mut self, grader: Grader) -> Self {
        self.grader = grader;
        self
    }

    pub fn with_params(mut self, params: RunParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    fn run_spec(&self, program: String, stdin: &str) -> RunSpec {
        RunSpec {
            source_code: program,
            language: self.language.clone(),
            stdin: stdin.to_string(),
            files: self.files.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    #[default]
    Valid,
    SyntaxError,
    BadCombinator,
}

/// Graded result of a whole submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestingOutcome {
    pub status: OutcomeStatus,
    pub max_mark: f64,
    pub actual_mark: f64,
    pub test_results: Vec<TestResult>,
    pub error_message: String,
    /// Display fields reported by a combinator template grader
    pub feedback: Map<String, Value>,
    pub sandbox_info: Vec<Value>,
}

impl TestingOutcome {
    fn new(max_mark: f64) -> Self {
        Self {
            status: OutcomeStatus::Valid,
            max_mark,
            actual_mark: 0.0,
            test_results: Vec::new(),
            error_message: String::new(),
            feedback: Map::new(),
            sandbox_info: Vec::new(),
        }
    }

    fn add_result(&mut self, result: TestResult) {
        self.actual_mark += result.awarded;
        self.test_results.push(result);
    }

    /// Marks the whole outcome as failed, discarding any results so far
    fn fail(&mut self, status: OutcomeStatus, message: impl Into<String>) {
        self.status = status;
        self.error_message = message.into();
        self.actual_mark = 0.0;
        self.test_results.clear();
    }

    fn add_sandbox_info(&mut self, run: &RunResult) {
        self.sandbox_info.extend(run.sandbox_info.iter().cloned());
    }

    /// Fraction of the available marks earned, zero unless the outcome is valid
    pub fn mark_fraction(&self) -> f64 {
        if self.status != OutcomeStatus::Valid || self.max_mark <= 0.0 {
            return 0.0;
        }
        (self.actual_mark / self.max_mark).clamp(0.0, 1.0)
    }

    pub fn all_correct(&self) -> bool {
        self.status == OutcomeStatus::Valid && (self.actual_mark - self.max_mark).abs() < 1e-6
    }
}

/// Runs `tests` in order on `sandbox` and grades them
///
/// A failure to talk to the sandbox aborts the whole run with an error
/// rather than a partial set of results. Failed runs of individual tests
/// are graded as wrong and the remaining tests still run. The sandbox is
/// closed before returning.
pub fn run_tests(
    sandbox: &mut dyn Sandbox,
    question: &Question,
    tests: &[TestCase],
) -> Result<TestingOutcome, GradingError> {
    log::info!(
        "Running {} test(s) in {} on {} sandbox",
        tests.len(),
        question.language,
        sandbox.name()
    );
    let outcome = run_all(sandbox, question, tests);
    sandbox.close();

    match &outcome {
        Ok(outcome) => log::info!(
            "Grading finished: {:?}, mark {}/{}",
            outcome.status,
            outcome.actual_mark,
            outcome.max_mark
        ),
        Err(e) => log::warn!("Grading aborted: {e}"),
    }
    outcome
}

fn run_all(
    sandbox: &mut dyn Sandbox,
    question: &Question,
    tests: &[TestCase],
) -> Result<TestingOutcome, GradingError> {
    let combine = question.grader.is_combinator()
        || question.allow_multiple_stdins
        || tests.iter().all(|test| test.stdin.is_empty());

    if combine {
        match question.source.combined(tests) {
            Some(program) => {
                if let Some(outcome) = run_combined(sandbox, question, tests, program)? {
                    return Ok(outcome);
                }
            }
            None if question.grader.is_combinator() => {
                return Err(GradingError::NoCombinedProgram);
            }
            None => {}
        }
    }
    run_singly(sandbox, question, tests)
}

fn max_mark(tests: &[TestCase]) -> f64 {
    let total: f64 = tests.iter().map(|test| test.mark).sum();
    if total == 0.0 { 1.0 } else { total }
}

/// Runs every test in one program; `None` asks for a test-by-test rerun
fn run_combined(
    sandbox: &mut dyn Sandbox,
    question: &Question,
    tests: &[TestCase],
    program: anyhow::Result<String>,
) -> Result<Option<TestingOutcome>, GradingError> {
    let mut outcome = TestingOutcome::new(max_mark(tests));
    let program = match program {
        Ok(program) => program,
        Err(e) => {
            outcome.fail(OutcomeStatus::SyntaxError, format!("Template error: {e}"));
            return Ok(Some(outcome));
        }
    };

    let run = sandbox.execute(&question.run_spec(program, ""))?;
    if question.grader.is_combinator() {
        outcome = combinator_outcome(&run);
    } else if run.result == ResultCode::CompilationError {
        outcome.fail(OutcomeStatus::SyntaxError, run.compile_info.clone());
    } else if run.result.is_success() {
        let separator = format!("{TEST_SEPARATOR}\n");
        let outputs: Vec<&str> = run.stdout.split(&separator).collect();
        if outputs.len() == tests.len() {
            for (output, test) in outputs.iter().zip(tests) {
                outcome.add_result(question.grader.grade(output, test, false));
            }
        } else {
            outcome.fail(
                OutcomeStatus::BadCombinator,
                format!(
                    "Error in question: the combined test program gave {} result(s) for {} test(s)",
                    outputs.len(),
                    tests.len()
                ),
            );
        }
    } else {
        log::info!("Combined run ended with '{}', running tests one at a time", run.result);
        return Ok(None);
    }

    outcome.add_sandbox_info(&run);
    Ok(Some(outcome))
}

fn combinator_outcome(run: &RunResult) -> TestingOutcome {
    let mut outcome = TestingOutcome::new(1.0);
    match combinator_verdict(run) {
        Ok((fraction, feedback)) => {
            outcome.actual_mark = fraction;
            outcome.feedback = feedback;
        }
        Err(message) => outcome.fail(OutcomeStatus::BadCombinator, message),
    }
    outcome
}

/// Validates the JSON document printed by a combinator template grader
fn combinator_verdict(run: &RunResult) -> Result<(f64, Map<String, Value>), String> {
    if !run.result.is_success() {
        return Err(format!(
            "Bad output from template grader:\nRun result: {}\nOutput: {}\n{}\n{}",
            run.result, run.compile_info, run.stdout, run.stderr
        ));
    }
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(&run.stdout) else {
        return Err(format!(
            "Bad JSON output from combinator grader. Output was: {}",
            run.stdout
        ));
    };
    if let Some(legacy) = fields.remove("feedback_html") {
        fields.insert("feedbackhtml".to_string(), legacy);
    }

    let output_only = fields
        .get("showoutputonly")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let fraction = match fields.get("fraction").and_then(Value::as_f64) {
        _ if output_only => 1.0,
        Some(fraction) if (0.0..=1.0).contains(&fraction) => fraction,
        _ => {
            return Err(format!(
                "Missing or bad fraction in output from template grader. Output was: {}",
                run.stdout
            ));
        }
    };

    let mut feedback = Map::new();
    for (key, value) in fields {
        match key.as_str() {
            "fraction" => {}
            "feedbackhtml" => {
                feedback.insert("epiloguehtml".to_string(), value);
            }
            name if COMBINATOR_FIELDS.contains(&name) => {
                feedback.insert(key, value);
            }
            name => return Err(format!("Unknown field name ({name}) in combinator grader output")),
        }
    }
    Ok((fraction, feedback))
}

fn run_singly(
    sandbox: &mut dyn Sandbox,
    question: &Question,
    tests: &[TestCase],
) -> Result<TestingOutcome, GradingError> {
    let mut outcome = TestingOutcome::new(max_mark(tests));

    for test in tests {
        let program = match question.source.per_test(test) {
            Ok(program) => program,
            Err(e) => {
                outcome.fail(OutcomeStatus::SyntaxError, format!("Template error: {e}"));
                break;
            }
        };

        let run = sandbox.execute(&question.run_spec(program, &test.stdin))?;
        outcome.add_sandbox_info(&run);

        match run.result {
            ResultCode::CompilationError => {
                outcome.fail(OutcomeStatus::SyntaxError, run.compile_info);
                break;
            }
            ResultCode::Success => {
                let mut result = question.grader.grade(&run.stdout, test, false);
                if result.abort {
                    log::info!("Template grader asked to abort after test '{}'", test.test_code);
                    result.awarded = 0.0;
                    result.is_correct = false;
                    outcome.add_result(result);
                    break;
                }
                outcome.add_result(result);
            }
            _ => outcome.add_result(question.grader.grade(&failure_message(&run), test, true)),
        }
    }
    Ok(outcome)
}

/// Diagnostic shown in place of the output of a run that did not succeed
fn failure_message(run: &RunResult) -> String {
    let mut headline = format!("***{}***", run.result);
    if run.result == ResultCode::RuntimeError && run.signal != 0 {
        headline.push_str(&format!(" (signal {})", run.signal));
    }
    [
        run.compile_info.as_str(),
        run.stdout.as_str(),
        headline.as_str(),
        run.stderr.as_str(),
    ]
    .into_iter()
    .filter(|part| !part.trim().is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}
