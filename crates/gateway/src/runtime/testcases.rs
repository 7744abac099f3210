//! One-shot testcase extraction from streamed text.
//!
//! Agents that generate testcases embed a JSON document with a
//! `"testcases"` array somewhere in their prose. After every text update
//! the accumulated transcript is scanned; the first successful parse wins
//! and the reply's extraction flag is set so the `testcases` event fires
//! at most once.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use studio_domain::event::TestcaseData;

/// Extraction is not attempted until the transcript exceeds this length.
const MIN_TEXT_CHARS: usize = 100;

/// At least one of these must appear in the text before the regex runs.
const HINT_TOKENS: [&str; 4] = [
    "testcases",
    "interface_name",
    "generate_positive_cases",
    "generate_negative_cases",
];

/// Greedy brace-to-brace span containing a `"testcases"` array. Greedy on
/// purpose: the JSON document may nest objects, so the match runs from the
/// first `{` to the last `}` and the JSON parser arbitrates.
fn testcase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)\{.*"testcases"\s*:\s*\[.*\].*\}"#).expect("static regex")
    })
}

/// Scan accumulated text for an embedded testcase document.
pub fn try_extract(text: &str) -> Option<TestcaseData> {
    if text.len() <= MIN_TEXT_CHARS {
        return None;
    }
    if !HINT_TOKENS.iter().any(|token| text.contains(token)) {
        return None;
    }

    let span = testcase_regex().find(text)?;
    let value: Value = match serde_json::from_str(span.as_str()) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "testcase span is not yet valid JSON");
            return None;
        }
    };

    let testcases = value.get("testcases")?.as_array()?;
    if testcases.is_empty() {
        return None;
    }

    Some(TestcaseData {
        status: "success".into(),
        count: testcases.len(),
        testcases: testcases.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> String {
        let doc = json!({
            "interface_name": "Login",
            "testcases": [
                {"name": "valid credentials", "expect": "ok"},
                {"name": "wrong password", "expect": "reject"}
            ]
        });
        format!(
            "Here is the generated suite for your interface:\n{}\nLet me know if anything is missing.",
            doc
        )
    }

    #[test]
    fn extracts_embedded_document() {
        let data = try_extract(&payload()).expect("extraction");
        assert_eq!(data.status, "success");
        assert_eq!(data.count, 2);
        assert_eq!(data.testcases[0]["name"], "valid credentials");
    }

    #[test]
    fn short_text_is_skipped() {
        assert!(try_extract(r#"{"testcases":[{"a":1}]}"#).is_none());
    }

    #[test]
    fn requires_hint_token() {
        let long = format!("{} {{\"cases\": []}}", "x".repeat(200));
        assert!(try_extract(&long).is_none());
    }

    #[test]
    fn empty_array_is_not_extracted() {
        let text = format!(
            "{} {}",
            "padding ".repeat(20),
            r#"{"interface_name": "X", "testcases": []}"#
        );
        assert!(try_extract(&text).is_none());
    }

    #[test]
    fn invalid_json_is_not_extracted() {
        let text = format!(
            "{} {}",
            "padding ".repeat(20),
            r#"{"testcases": [oops"#
        );
        assert!(try_extract(&text).is_none());
    }

    #[test]
    fn partial_stream_then_complete() {
        let full = payload();
        // A truncated stream must not extract; the completed one must.
        let cut = &full[..full.len() / 2];
        assert!(try_extract(cut).is_none());
        assert!(try_extract(&full).is_some());
    }
}
