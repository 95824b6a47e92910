//! Strategies that turn a program's output into a graded [`TestResult`]

mod template;
pub mod text;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use text::{clean, reduce, tidy};

/// When a test's result is shown to the student
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestDisplay {
    #[default]
    Show,
    Hide,
    HideIfFail,
    HideIfSucceed,
}

/// An authored test: code to run, its input and the expected output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestCase {
    #[serde(default)]
    pub test_code: String,
    #[serde(default)]
    pub stdin: String,
    pub expected: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default = "default_mark")]
    pub mark: f64,
    #[serde(default)]
    pub display: TestDisplay,
    #[serde(default)]
    pub use_as_example: bool,
    /// Stop showing later results if this test fails
    #[serde(default)]
    pub hide_rest_if_fail: bool,
}

fn default_mark() -> f64 {
    1.0
}

impl TestCase {
    pub fn new(test_code: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            test_code: test_code.into(),
            stdin: String::new(),
            expected: expected.into(),
            extra: String::new(),
            mark: default_mark(),
            display: TestDisplay::default(),
            use_as_example: false,
            hide_rest_if_fail: false,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_mark(mut self, mark: f64) -> Self {
        self.mark = mark;
        self
    }
}

/// Graded outcome of one test case
///
/// `awarded` always lies within `0..=max_mark`. Display copies of the test's
/// text are tidied and bounded in length.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub test_code: String,
    pub max_mark: f64,
    pub is_correct: bool,
    pub awarded: f64,
    pub expected: String,
    pub got: String,
    pub stdin: String,
    pub extra_data: String,
    pub display: TestDisplay,
    pub hide_rest_if_fail: bool,
    /// Set by a template grader that wants no further tests run
    #[serde(default)]
    pub abort: bool,
    /// Open-ended fields a template grader reported
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestResult {
    /// A result for `test` with the given verdict and actual output
    pub fn new(test: &TestCase, is_correct: bool, awarded: f64, got: &str) -> Self {
        Self {
            test_code: tidy(&test.test_code),
            max_mark: test.mark,
            is_correct,
            awarded: awarded.clamp(0.0, test.mark.max(0.0)),
            expected: tidy(&test.expected),
            got: tidy(got),
            stdin: tidy(&test.stdin),
            extra_data: tidy(&test.extra),
            display: test.display,
            hide_rest_if_fail: test.hide_rest_if_fail,
            abort: false,
            extra: Map::new(),
        }
    }

    /// A zero-mark result carrying a diagnostic in place of the output
    pub fn failed(test: &TestCase, diagnostic: &str) -> Self {
        Self::new(test, false, 0.0, diagnostic)
    }
}

/// How per-test output is compared with the expected output
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Grader {
    /// Equal after trailing whitespace is cleaned away
    #[default]
    Exact,
    /// Equal after whitespace runs, blank lines and case are normalised
    NearEquality,
    /// The expected output is a pattern searched for anywhere in the output
    Regex,
    /// The program prints its own JSON verdict per test
    Template,
    /// A single combined run prints the verdict for the whole question
    CombinatorTemplate,
}

impl Grader {
    /// Grades one test's output
    ///
    /// `is_bad` marks a run that did not finish successfully; `output` is
    /// then a diagnostic and the test gets no marks.
    ///
    /// # Panics
    ///
    /// Panics for [`Grader::CombinatorTemplate`], which grades the whole
    /// question in one go and must never be asked about a single test.
    pub fn grade(self, output: &str, test: &TestCase, is_bad: bool) -> TestResult {
        if is_bad {
            return TestResult::failed(test, output);
        }
        match self {
            Self::Exact => {
                let is_correct = clean(output) == clean(&test.expected);
                let awarded = if is_correct { test.mark } else { 0.0 };
                TestResult::new(test, is_correct, awarded, output)
            }
            Self::NearEquality => {
                let is_correct = reduce(output) == reduce(&test.expected);
                let awarded = if is_correct { test.mark } else { 0.0 };
                TestResult::new(test, is_correct, awarded, output)
            }
            Self::Regex => {
                let is_correct = pattern_matches(&test.expected, output);
                let awarded = if is_correct { test.mark } else { 0.0 };
                TestResult::new(test, is_correct, awarded, output)
            }
            Self::Template => template::grade(output, test),
            Self::CombinatorTemplate => {
                panic!("the combinator template grader cannot grade individual tests")
            }
        }
    }

    pub fn is_combinator(self) -> bool {
        self == Self::CombinatorTemplate
    }

    /// Whether the program's output is a grading verdict rather than data
    pub fn is_template(self) -> bool {
        matches!(self, Self::Template | Self::CombinatorTemplate)
    }
}

/// Multi-line, dot-all search for `pattern` with its trailing whitespace
/// trimmed. A pattern that does not compile never matches.
fn pattern_matches(pattern: &str, output: &str) -> bool {
    match RegexBuilder::new(pattern.trim_end())
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
    {
        Ok(regex) => regex.is_match(output),
        Err(e) => {
            log::warn!("Bad expected pattern {pattern:?}: {e}");
            false
        }
    }
}
