//! Input screening for untrusted client strings.
//!
//! These checks sit in front of the parameterized SQL layer as a second
//! fence: anything matching a known injection signature is rejected before
//! it reaches a query or a page.

use once_cell::sync::Lazy;
use regex::Regex;

static SQL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(--)|(;)|(union\s+select)|(drop\s+)|(insert\s+)|(delete\s+)|(update\s+)|(exec\s*)|(execute\s*)|(script\s*)|(javascript:)|(onerror\s*=)|(onload\s*=)|(')|(")|(select\s+.*\s+from)"#,
    )
    .expect("SQL signature pattern is valid")
});

static XSS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(<script[^>]*>.*?</script>)|(<.*?on\w+\s*=)|(<iframe)|(<object)|(<embed)|(<applet)")
        .expect("XSS signature pattern is valid")
});

static PATH_TRAVERSAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\.\./)|(\.\.\\)|(%2e%2e%2f)|(%2e%2e/)").expect("traversal pattern is valid")
});

static USERNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-_%$#@!&]*[a-zA-Z0-9])?$")
        .expect("username pattern is valid")
});

/// Screen a general input string for SQL/XSS/path-traversal signatures.
///
/// Empty strings are considered valid; length limits are checked separately
/// with [`valid_length`].
pub fn valid_input(input: &str) -> bool {
    if input.is_empty() {
        return true;
    }
    !SQL_PATTERN.is_match(input)
        && !XSS_PATTERN.is_match(input)
        && !PATH_TRAVERSAL_PATTERN.is_match(input)
}

/// Check the username character class: alphanumeric edges, a limited set of
/// special characters inside.
pub fn valid_username(username: &str) -> bool {
    !SQL_PATTERN.is_match(username) && USERNAME_PATTERN.is_match(username)
}

/// Inclusive length bounds, counted in bytes.
pub fn valid_length(input: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&input.len())
}
