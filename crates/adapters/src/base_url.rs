use bookgen_core::config::{DEFAULT_OLLAMA_BASE_URL, DEFAULT_OPENAI_BASE_URL};
use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+$").expect("invalid version suffix regex"));
static OLLAMA_API_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(api|v1)$").expect("invalid ollama suffix regex"));

fn or_default<'a>(input: &'a str, default: &'a str) -> &'a str {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

/// Server root of an Ollama instance. A pasted `/api` or `/v1` suffix is dropped.
pub fn ollama_base_url(input: &str) -> String {
    let trimmed = or_default(input, DEFAULT_OLLAMA_BASE_URL).trim_end_matches('/');
    OLLAMA_API_SUFFIX_RE.replace(trimmed, "").into_owned()
}

/// OpenAI-style API root. Appends `/v1` unless a version is present; a trailing `#` keeps
/// the url exactly as written.
pub fn openai_base_url(input: &str) -> String {
    let trimmed = or_default(input, DEFAULT_OPENAI_BASE_URL);
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.trim_end_matches('/').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1/") {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}
