use once_cell::sync::Lazy;
use regex::Regex;

const GENERIC_MESSAGE: &str = "An internal error occurred. Please try again.";

/// Provider brand names that must never reach a client. Matched
/// case-insensitively as substrings.
const SENSITIVE_SERVICES: &[&str] = &[
    "openai",
    "anthropic",
    "claude",
    "gemini",
    "google",
    "cohere",
    "jina",
    "voyage",
    "bge",
    "deepseek",
];

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static API_KEY_ASSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)api[_-]?key[=:]\s*\S+").unwrap());
static SK_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"sk-\S+").unwrap());
static BEARER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").unwrap());

/// Scrub an error message before it can reach a client.
///
/// Any mention of a provider brand collapses the whole message; URLs,
/// bearer tokens and API-key-shaped substrings are redacted; messages
/// that still look like stack traces or are suspiciously long collapse
/// to the generic message.
pub fn sanitize_error_message(message: &str) -> String {
    if message.trim().is_empty() {
        return GENERIC_MESSAGE.to_string();
    }

    let lower = message.to_lowercase();
    if SENSITIVE_SERVICES.iter().any(|s| lower.contains(s)) {
        return GENERIC_MESSAGE.to_string();
    }

    let mut msg = URL_RE.replace_all(message, "[URL_REMOVED]").into_owned();
    msg = API_KEY_ASSIGN_RE
        .replace_all(&msg, "[API_KEY_REMOVED]")
        .into_owned();
    msg = SK_KEY_RE.replace_all(&msg, "[API_KEY_REMOVED]").into_owned();
    msg = BEARER_RE.replace_all(&msg, "[TOKEN_REMOVED]").into_owned();

    let lower = msg.to_lowercase();
    let looks_like_trace = ["backtrace", "stack", "panicked", "unwrap", "traceback"]
        .iter()
        .any(|kw| lower.contains(kw));

    if msg.len() > 200 || looks_like_trace || msg.trim().is_empty() {
        return GENERIC_MESSAGE.to_string();
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_api_keys() {
        let out = sanitize_error_message("request failed: sk-AAAA1234 rejected");
        assert!(!out.contains("sk-AAAA1234"));
        assert!(out.contains("[API_KEY_REMOVED]"));
    }

    #[test]
    fn strips_bearer_tokens() {
        let out = sanitize_error_message("auth header Bearer abc.def.ghi invalid");
        assert!(!out.contains("abc.def.ghi"));
    }

    #[test]
    fn strips_urls() {
        let out = sanitize_error_message("connect to https://internal.example/v1 failed");
        assert!(!out.contains("internal.example"));
        assert!(out.contains("[URL_REMOVED]"));
    }

    #[test]
    fn provider_brand_collapses_message() {
        let out = sanitize_error_message("OpenAI returned an error");
        assert_eq!(out, GENERIC_MESSAGE);
    }

    #[test]
    fn empty_becomes_generic() {
        assert_eq!(sanitize_error_message("   "), GENERIC_MESSAGE);
    }

    #[test]
    fn long_messages_collapse() {
        let msg = "x".repeat(300);
        assert_eq!(sanitize_error_message(&msg), GENERIC_MESSAGE);
    }

    #[test]
    fn plain_messages_pass_through() {
        let out = sanitize_error_message("document has no extractable text");
        assert_eq!(out, "document has no extractable text");
    }
}
