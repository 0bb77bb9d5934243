use std::{cell::RefCell, error::Error as StdError, fmt, rc::Rc};

use tracing::error;

/// Where an unhandled failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// A module failed to initialize and was disabled.
    ModuleInit,
    /// A synchronous handler failed.
    Handler,
    /// An awaited task failed with nobody left to handle it.
    Rejection,
}

impl ErrorOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModuleInit => "module_init",
            Self::Handler => "handler",
            Self::Rejection => "rejection",
        }
    }
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub origin: ErrorOrigin,
    pub context: String,
    pub message: String,
}

/// Single sink for otherwise unhandled page errors. Clones share the log.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    reports: Rc<RefCell<Vec<ReportedError>>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, origin: ErrorOrigin, context: &str, err: &dyn StdError) {
        error!(stage = "app", origin = %origin, context, error = %err, "unhandled page error");
        self.reports.borrow_mut().push(ReportedError {
            origin,
            context: context.to_string(),
            message: err.to_string(),
        });
    }

    /// Unwraps `result`, reporting the error and yielding `None` on failure.
    pub fn capture<T, E>(
        &self,
        origin: ErrorOrigin,
        context: &str,
        result: Result<T, E>,
    ) -> Option<T>
    where
        E: StdError,
    {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(origin, context, &err);
                None
            }
        }
    }

    pub fn reports(&self) -> Vec<ReportedError> {
        self.reports.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }
}
