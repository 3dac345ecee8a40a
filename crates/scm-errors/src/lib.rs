//! Closed error taxonomy, classification rules, default backoffs, and the
//! secret redactor. See spec §4.C and §7.

mod category;
mod classify;
mod redact;

pub use category::{ErrorCategory, SyncError};
pub use classify::{classify, default_backoff_seconds, RawFailure};
pub use redact::redact;
