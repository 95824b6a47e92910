use serde_json::Value;

use super::{TestCase, TestResult};

/// Keys that map onto fixed result fields and are never copied into `extra`
const RESERVED_KEYS: [&str; 11] = [
    "fraction",
    "awarded",
    "got",
    "expected",
    "abort",
    "testcode",
    "stdin",
    "extra",
    "mark",
    "iscorrect",
    "is_correct",
];

fn bad_result(test: &TestCase, output: &str) -> TestResult {
    TestResult::failed(test, &format!("Bad grading result from template:'{output}'"))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Grades a test whose program printed its own JSON verdict
///
/// The verdict needs a numeric `fraction` in `0..=1`; `awarded`, `got`,
/// `expected` and `abort` are honoured when present and any other field is
/// carried over into [`TestResult::extra`].
pub(super) fn grade(output: &str, test: &TestCase) -> TestResult {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(output) else {
        return bad_result(test, output);
    };
    let Some(fraction) = fields.get("fraction").and_then(Value::as_f64) else {
        return bad_result(test, output);
    };
    if !(0.0..=1.0).contains(&fraction) {
        return bad_result(test, output);
    }

    let is_correct = (fraction - 1.0).abs() < 1e-6;
    let awarded = fields
        .get("awarded")
        .and_then(Value::as_f64)
        .unwrap_or(test.mark * fraction);
    let got = fields.get("got").map(text).unwrap_or_default();

    let mut result = TestResult::new(test, is_correct, awarded, &got);
    if let Some(expected) = fields.get("expected") {
        result.expected = super::tidy(&text(expected));
    }
    result.abort = fields.get("abort").and_then(Value::as_bool).unwrap_or(false);
    result.extra = fields
        .into_iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .collect();
    result
}
