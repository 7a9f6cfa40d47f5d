//! Interpretation of the resolution tool's captured output.

use serde_json::{Map, Value};

/// How many trailing stderr lines become the failure message.
pub const STDERR_TAIL_LINES: usize = 10;

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The tool reported success; `response` becomes the comment body.
    Success { response: String },
    /// Anything else; `error` becomes the comment body and the session error.
    Failure { error: String },
}

impl SessionOutcome {
    /// Text to post as the issue comment.
    pub fn body(&self) -> &str {
        match self {
            Self::Success { response } => response,
            Self::Failure { error } => error,
        }
    }
}

/// Best-effort recovery of a JSON object from noisy output.
///
/// Tries the whole string first. Failing that, scans backward for the last
/// `{` from which the remainder of the text parses as an object. Progress
/// lines or escape sequences before the payload are tolerated; trailing
/// non-whitespace after it is not.
pub fn extract_json(text: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }

    text.char_indices()
        .rev()
        .filter(|(_, c)| *c == '{')
        .find_map(|(i, _)| match serde_json::from_str::<Value>(&text[i..]) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

/// Decide the outcome of a finished process from its captured streams.
///
/// `exit_code` is negative when the process died by signal.
pub fn interpret(stdout: &str, stderr: &str, exit_code: Option<i32>) -> SessionOutcome {
    let Some(parsed) = extract_json(stdout) else {
        return SessionOutcome::Failure {
            error: failure_message(stderr, exit_code),
        };
    };

    if parsed.get("status").and_then(Value::as_str) == Some("success") {
        SessionOutcome::Success {
            response: field_text(&parsed, "response").unwrap_or_default(),
        }
    } else {
        SessionOutcome::Failure {
            error: field_text(&parsed, "error")
                .unwrap_or_else(|| "Amplifier session failed".to_string()),
        }
    }
}

fn field_text(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn failure_message(stderr: &str, exit_code: Option<i32>) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    if !tail.trim().is_empty() {
        return tail;
    }
    match exit_code {
        Some(code) => format!("Process exited with code {}", code),
        None => "Process terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_whole_string() {
        let map = extract_json(r#"{"status":"success","response":"ok"}"#).unwrap();
        assert_eq!(map["response"], "ok");
    }

    #[test]
    fn test_extract_after_leading_garbage() {
        let map = extract_json("garbage{\"status\":\"success\",\"response\":\"ok\"}").unwrap();
        assert_eq!(
            Value::Object(map),
            json!({"status": "success", "response": "ok"})
        );
    }

    #[test]
    fn test_extract_prefers_last_complete_object() {
        let text = "{\"status\":\"progress\"}\n\u{1b}[32mdone\u{1b}[0m\n{\"status\":\"success\",\"response\":\"final\"}\n";
        let map = extract_json(text).unwrap();
        assert_eq!(map["response"], "final");
    }

    #[test]
    fn test_extract_nested_object_returns_outermost_parse() {
        let text = "log line\n{\"status\":\"success\",\"response\":\"r\",\"meta\":{\"k\":1}}";
        let map = extract_json(text).unwrap();
        assert_eq!(map["status"], "success");
        assert_eq!(map["meta"]["k"], 1);
    }

    #[test]
    fn test_extract_none_without_json() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_interpret_success_with_missing_response_is_empty() {
        let outcome = interpret(r#"{"status":"success"}"#, "", Some(0));
        assert_eq!(
            outcome,
            SessionOutcome::Success {
                response: String::new()
            }
        );
    }

    #[test]
    fn test_interpret_error_object() {
        let outcome = interpret(r#"{"status":"error","error":"rate limited"}"#, "", Some(1));
        assert_eq!(outcome.body(), "rate limited");

        let outcome = interpret(r#"{"status":"error"}"#, "", Some(1));
        assert_eq!(outcome.body(), "Amplifier session failed");
    }

    #[test]
    fn test_interpret_falls_back_to_stderr_tail() {
        let stderr: String = (1..=15).map(|n| format!("line {}\n", n)).collect();
        let outcome = interpret("no json here", &stderr, Some(2));
        let expected: Vec<String> = (6..=15).map(|n| format!("line {}", n)).collect();
        assert_eq!(outcome.body(), expected.join("\n"));
    }

    #[test]
    fn test_interpret_empty_stderr_uses_exit_code() {
        assert_eq!(
            interpret("", "", Some(3)).body(),
            "Process exited with code 3"
        );
        assert_eq!(
            interpret("", "   \n", Some(-15)).body(),
            "Process exited with code -15"
        );
        assert_eq!(interpret("", "", None).body(), "Process terminated by signal");
    }
}
