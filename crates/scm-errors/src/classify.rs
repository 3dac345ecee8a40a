use lazy_static::lazy_static;
use regex::Regex;

use crate::category::ErrorCategory;

lazy_static! {
    static ref RE_TIMEOUT: Regex = Regex::new(r"(?i)timeout|timed out").unwrap();
    static ref RE_CONNECTION: Regex = Regex::new(r"(?i)connection (refused|reset)").unwrap();
    static ref RE_UNAUTHORIZED: Regex = Regex::new(r"(?i)unauthorized").unwrap();
    static ref RE_FORBIDDEN: Regex = Regex::new(r"(?i)forbidden").unwrap();
    static ref RE_NOT_FOUND: Regex = Regex::new(r"(?i)not found").unwrap();
    static ref RE_RATE_LIMIT: Regex = Regex::new(r"(?i)rate.?limit|too many requests").unwrap();
}

/// A raw failure as reported by an upstream client or handler, before
/// classification. This stands in for the "exception or error payload" the
/// spec's classification table matches against.
#[derive(Debug, Clone, Default)]
pub struct RawFailure {
    pub message: String,
    pub status_code: Option<u16>,
    pub is_timeout_exception: bool,
    pub is_connection_exception: bool,
}

impl RawFailure {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// Classify a raw failure into an `ErrorCategory`, applying the rules from
/// spec §4.C in order: exception-type checks first, then message-pattern
/// checks, then HTTP status, falling through to `Exception`.
pub fn classify(failure: &RawFailure) -> ErrorCategory {
    if failure.is_timeout_exception || RE_TIMEOUT.is_match(&failure.message) {
        return ErrorCategory::Timeout;
    }
    if failure.is_connection_exception || RE_CONNECTION.is_match(&failure.message) {
        return ErrorCategory::Connection;
    }
    if failure.status_code == Some(401) || RE_UNAUTHORIZED.is_match(&failure.message) {
        return ErrorCategory::AuthError;
    }
    if failure.status_code == Some(403) || RE_FORBIDDEN.is_match(&failure.message) {
        return ErrorCategory::PermissionDenied;
    }
    if failure.status_code == Some(404) || RE_NOT_FOUND.is_match(&failure.message) {
        return ErrorCategory::RepoNotFound;
    }
    if failure.status_code == Some(429) || RE_RATE_LIMIT.is_match(&failure.message) {
        return ErrorCategory::RateLimit;
    }
    if let Some(code) = failure.status_code {
        if (500..600).contains(&code) {
            return ErrorCategory::ServerError;
        }
    }
    ErrorCategory::Exception
}

/// Default transient backoffs in seconds (spec §4.C). `retry_after` from
/// the server, when present and positive, always overrides this — callers
/// should check that first and only fall back to this table.
pub fn default_backoff_seconds(category: ErrorCategory) -> i64 {
    match category {
        ErrorCategory::RateLimit => 120,
        ErrorCategory::Timeout => 30,
        ErrorCategory::ServerError => 90,
        ErrorCategory::Network => 60,
        ErrorCategory::Connection => 45,
        ErrorCategory::LeaseLost => 0,
        _ => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_rules_take_priority_table() {
        assert_eq!(
            classify(&RawFailure::from_message("x").with_status_code(401)),
            ErrorCategory::AuthError
        );
        assert_eq!(
            classify(&RawFailure::from_message("x").with_status_code(403)),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify(&RawFailure::from_message("x").with_status_code(404)),
            ErrorCategory::RepoNotFound
        );
        assert_eq!(
            classify(&RawFailure::from_message("x").with_status_code(429)),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify(&RawFailure::from_message("x").with_status_code(503)),
            ErrorCategory::ServerError
        );
    }

    #[test]
    fn message_patterns_are_case_insensitive() {
        assert_eq!(
            classify(&RawFailure::from_message("Connection Refused by peer")),
            ErrorCategory::Connection
        );
        assert_eq!(
            classify(&RawFailure::from_message("Request TIMED OUT after 30s")),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(&RawFailure::from_message("Too Many Requests")),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn unmatched_falls_back_to_exception() {
        assert_eq!(
            classify(&RawFailure::from_message("something odd happened")),
            ErrorCategory::Exception
        );
    }

    #[test]
    fn timeout_exception_flag_wins_even_without_message_match() {
        let mut failure = RawFailure::from_message("generic failure");
        failure.is_timeout_exception = true;
        assert_eq!(classify(&failure), ErrorCategory::Timeout);
    }

    #[test]
    fn default_backoffs_match_table() {
        assert_eq!(default_backoff_seconds(ErrorCategory::RateLimit), 120);
        assert_eq!(default_backoff_seconds(ErrorCategory::Timeout), 30);
        assert_eq!(default_backoff_seconds(ErrorCategory::ServerError), 90);
        assert_eq!(default_backoff_seconds(ErrorCategory::Network), 60);
        assert_eq!(default_backoff_seconds(ErrorCategory::Connection), 45);
        assert_eq!(default_backoff_seconds(ErrorCategory::LeaseLost), 0);
        assert_eq!(default_backoff_seconds(ErrorCategory::Exception), 60);
    }
}
