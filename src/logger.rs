//! Leveled logging interface for the protocol engine.
//!
//! The server and the HTTP transport never log to a global sink directly; they hold an
//! `Arc<dyn Logger>`. [`TracingLogger`] forwards to `tracing` and is the default,
//! [`NoopLogger`] silences the engine entirely.

use std::sync::Arc;

pub trait Logger: Send + Sync {
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    fn debug(&self, message: &str);
}

/// Forwards every record to the `tracing` macros under the `mcp` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, message: &str) {
        tracing::error!(target: "mcp", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "mcp", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "mcp", "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "mcp", "{message}");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn error(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
}

pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

/// Records warnings and errors in memory. Used by tests that assert on diagnostics.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CapturingLogger {
    pub warnings: parking_lot::Mutex<Vec<String>>,
    pub errors: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl Logger for CapturingLogger {
    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn info(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
}
