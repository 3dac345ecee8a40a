use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed `ErrorCategory` enumeration from spec §4.C. Every
/// `error_category` string that crosses a DB or wire boundary goes through
/// this type rather than being compared as a bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Permanent
    AuthError,
    AuthMissing,
    AuthInvalid,
    RepoNotFound,
    RepoTypeUnknown,
    PermissionDenied,
    // Transient
    RateLimit,
    Timeout,
    Network,
    ServerError,
    Connection,
    LeaseLost,
    // Other
    Exception,
    Unknown,
    UnknownJobType,
    LockHeld,
    ContractError,
    ValidationError,
    ContentTooLarge,
    ParseError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::AuthMissing => "auth_missing",
            ErrorCategory::AuthInvalid => "auth_invalid",
            ErrorCategory::RepoNotFound => "repo_not_found",
            ErrorCategory::RepoTypeUnknown => "repo_type_unknown",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Connection => "connection",
            ErrorCategory::LeaseLost => "lease_lost",
            ErrorCategory::Exception => "exception",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::UnknownJobType => "unknown_job_type",
            ErrorCategory::LockHeld => "lock_held",
            ErrorCategory::ContractError => "contract_error",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::ContentTooLarge => "content_too_large",
            ErrorCategory::ParseError => "parse_error",
        }
    }

    /// Parses a category string from a handler result or a legacy DB row,
    /// coercing anything unrecognized to `ContractError` per spec §4.C
    /// ("Unknown `error_category` values make the result `contract_error`").
    pub fn parse_or_contract_error(s: &str) -> ErrorCategory {
        s.parse().unwrap_or(ErrorCategory::ContractError)
    }

    /// Permanent errors terminate the job (`mark_dead`) after a single
    /// attempt; they are never retried.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthError
                | ErrorCategory::AuthMissing
                | ErrorCategory::AuthInvalid
                | ErrorCategory::RepoNotFound
                | ErrorCategory::RepoTypeUnknown
                | ErrorCategory::PermissionDenied
        )
    }

    /// Transient errors `fail_retry` with a category-default backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::ServerError
                | ErrorCategory::Connection
                | ErrorCategory::LeaseLost
        )
    }

    /// `lock_held` is the one "cleanly yielded" category: the worker
    /// requeues without consuming an attempt instead of treating it as a
    /// failure.
    pub fn is_lock_held(self) -> bool {
        matches!(self, ErrorCategory::LockHeld)
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auth_error" => ErrorCategory::AuthError,
            "auth_missing" => ErrorCategory::AuthMissing,
            "auth_invalid" => ErrorCategory::AuthInvalid,
            "repo_not_found" => ErrorCategory::RepoNotFound,
            "repo_type_unknown" => ErrorCategory::RepoTypeUnknown,
            "permission_denied" => ErrorCategory::PermissionDenied,
            "rate_limit" => ErrorCategory::RateLimit,
            "timeout" => ErrorCategory::Timeout,
            "network" => ErrorCategory::Network,
            "server_error" => ErrorCategory::ServerError,
            "connection" => ErrorCategory::Connection,
            "lease_lost" => ErrorCategory::LeaseLost,
            "exception" => ErrorCategory::Exception,
            "unknown" => ErrorCategory::Unknown,
            "unknown_job_type" => ErrorCategory::UnknownJobType,
            "lock_held" => ErrorCategory::LockHeld,
            "contract_error" => ErrorCategory::ContractError,
            "validation_error" => ErrorCategory::ValidationError,
            "content_too_large" => ErrorCategory::ContentTooLarge,
            "parse_error" => ErrorCategory::ParseError,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured error record replacing ad hoc dicts/exceptions (spec §9
/// "Dynamic error objects with varying shapes"). Carries everything
/// `sync_runs.error_summary_json` and `sync_jobs.last_error` need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub category: ErrorCategory,
    pub message: String,
    pub status_code: Option<i32>,
    pub retry_after: Option<i64>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl SyncError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_code: None,
            retry_after: None,
            endpoint: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_status_code(mut self, code: i32) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_retry_after(mut self, seconds: i64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for SyncError {}
