//! Query logging sink.
//!
//! Every statement the persistence engine issues is reported to a
//! [`QueryLogger`]. The hooks are fire-and-forget: nothing they return is
//! consumed and they must not fail.

use crate::error::Error;
use crate::value::Value;
use std::time::Duration;

/// Observability hooks for issued statements.
pub trait QueryLogger: Send + Sync {
    /// A statement is about to run.
    fn log_query(&self, sql: &str, params: &[Value]);

    /// A statement failed.
    fn log_query_error(&self, error: &Error, sql: &str, params: &[Value]);

    /// A statement took longer than the configured threshold.
    fn log_query_slow(&self, duration: Duration, sql: &str, params: &[Value]);
}

/// Default sink: forwards every hook to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log_query(&self, sql: &str, params: &[Value]) {
        tracing::debug!(sql = %sql, params = params.len(), "relorm.query");
    }

    fn log_query_error(&self, error: &Error, sql: &str, params: &[Value]) {
        tracing::error!(
            sql = %sql,
            params = ?params,
            error = %error,
            "relorm.query failed"
        );
    }

    fn log_query_slow(&self, duration: Duration, sql: &str, params: &[Value]) {
        tracing::warn!(
            sql = %sql,
            params = params.len(),
            duration_ms = duration.as_millis() as u64,
            "relorm.query slow"
        );
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueryLogger;

impl QueryLogger for NoopQueryLogger {
    fn log_query(&self, _sql: &str, _params: &[Value]) {}

    fn log_query_error(&self, _error: &Error, _sql: &str, _params: &[Value]) {}

    fn log_query_slow(&self, _duration: Duration, _sql: &str, _params: &[Value]) {}
}
