//! Error reporting sink.
//!
//! Failures that do not travel back through a `Result` (absorbed validation
//! errors, retries that ran out of budget) are reported here so they are
//! never silently lost.

use crate::key::ObjectKey;
use tracing::error;

/// Receives errors the controller decided not to propagate.
pub trait ErrorSink: Send + Sync {
    /// Report `error` for the object `key` of `kind`.
    fn report(&self, kind: &str, key: &ObjectKey, error: &anyhow::Error);

    /// Report a plain message, e.g. a validation failure.
    fn report_message(&self, kind: &str, key: &ObjectKey, message: &str) {
        self.report(kind, key, &anyhow::anyhow!("{message}"));
    }
}

/// Logs every reported error at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, kind: &str, key: &ObjectKey, error: &anyhow::Error) {
        error!(kind, key = %key, "{:#}", error);
    }
}
