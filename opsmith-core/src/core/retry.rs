//! Retry classification and backoff for transport failures.
//!
//! The classifier works over the rendered error message plus the error type
//! name, mirroring how upstream APIs surface status markers in text.
//! Unknown errors are non-retryable so a misbehaving transport cannot trap
//! the loop.

use std::time::Duration;

use rand::Rng as _;

/// Message patterns checked case-sensitively against the raw error text.
const RETRYABLE_EXACT: &[&str] = &[
    "429",
    "RESOURCE_EXHAUSTED",
    "quota",
    "rate limit",
    "500",
    "502",
    "503",
    "504",
    "INTERNAL",
    "ServerError",
    "timeout",
    "DEADLINE_EXCEEDED",
    "UNAVAILABLE",
    "ABORTED",
];

/// Patterns checked against the lowercased error text.
const RETRYABLE_LOWER: &[&str] = &[
    "connection",
    "network",
    "timeout",
    "unreachable",
    "token",
    "context length",
    "too long",
    "maximum context",
];

/// Lowercased patterns that force a non-retryable verdict.
const NON_RETRYABLE_LOWER: &[&str] = &[
    "permission_denied",
    "unauthenticated",
    "invalid_argument",
    "not_found",
    "already_exists",
    "failed_precondition",
    "authentication",
    "authorization",
    "invalid api key",
    "model not found",
    "unsupported",
];

/// Decide whether an error is worth retrying.
pub fn is_retryable_error(error_message: &str, error_type: &str) -> bool {
    let lower_message = error_message.to_lowercase();

    if RETRYABLE_EXACT
        .iter()
        .any(|pattern| error_message.contains(pattern))
    {
        return true;
    }

    if RETRYABLE_LOWER
        .iter()
        .any(|pattern| lower_message.contains(pattern))
    {
        return true;
    }

    // Malformed-response errors usually clear up on a second call.
    if error_type.to_lowercase().contains("json") || lower_message.contains("json") {
        return true;
    }

    if NON_RETRYABLE_LOWER
        .iter()
        .any(|pattern| lower_message.contains(pattern))
    {
        return false;
    }

    tracing::warn!(
        error_type,
        error_message,
        "unknown error treated as non-retryable"
    );
    false
}

/// Classify a library error by its display form and kind name.
pub fn is_retryable_llm_error(error: &crate::llm::LlmError) -> bool {
    is_retryable_error(&error.to_string(), error.kind())
}

/// Exponential backoff capped at 30 s, with jitter in [0.1, 0.5) s to
/// spread thundering herds.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let base = 2u64.saturating_pow(retry_count).min(30);
    let jitter = rand::rng().random_range(0.1..0.5);
    Duration::from_secs_f64(base as f64 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_table() {
        let cases: &[(&str, &str, bool)] = &[
            ("got 429 RESOURCE_EXHAUSTED from upstream", "ClientError", true),
            ("HTTP 500 INTERNAL server error", "ServerError", true),
            ("ServerError: backend unavailable", "ServerError", true),
            ("connection reset by peer", "IoError", true),
            ("host unreachable", "IoError", true),
            ("request timeout after 60s", "TimeoutError", true),
            ("unexpected end of JSON input", "SerdeError", true),
            ("prompt exceeds maximum context length", "InvalidRequest", true),
            ("DEADLINE_EXCEEDED", "ApiError", true),
            ("UNAVAILABLE: try again later", "ApiError", true),
            ("ABORTED by server", "ApiError", true),
            ("PERMISSION_DENIED for project", "ApiError", false),
            ("UNAUTHENTICATED request", "ApiError", false),
            ("INVALID_ARGUMENT: bad schema", "ApiError", false),
            ("NOT_FOUND: no such model", "ApiError", false),
            ("ALREADY_EXISTS", "ApiError", false),
            ("FAILED_PRECONDITION", "ApiError", false),
            ("invalid api key supplied", "AuthError", false),
            ("model not found: foo-ultra", "ApiError", false),
            ("some novel failure", "WeirdError", false),
        ];
        for (message, kind, expected) in cases {
            assert_eq!(
                is_retryable_error(message, kind),
                *expected,
                "case: {message}"
            );
        }
    }

    #[test]
    fn json_error_type_is_retryable_even_with_clean_message() {
        assert!(is_retryable_error("trailing characters", "JsonDecodeError"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        for retry in 1..8 {
            let delay = backoff_delay(retry).as_secs_f64();
            let base = 2f64.powi(retry as i32).min(30.0);
            assert!(delay >= base + 0.1 - f64::EPSILON, "retry {retry}: {delay}");
            assert!(delay < base + 0.5, "retry {retry}: {delay}");
        }
    }
}
