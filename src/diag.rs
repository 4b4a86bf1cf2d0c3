use std::{
    fmt::Display,
    io::{self, ErrorKind},
};

/// Severity split used across the pipeline. `Fatal` aborts the run. `Error`
/// is reported at the call site and a placeholder value substituted so that
/// later problems still surface; callers must check for it rather than
/// bubbling it up with `?`.
#[derive(Debug, PartialEq, Eq)]
pub enum Diag {
    Fatal(String),
    Error(String),
}

impl Diag {
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Diag::Fatal(msg.into())
    }

    pub fn error<S: Into<String>>(msg: S) -> Self {
        Diag::Error(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Diag::Fatal(msg) | Diag::Error(msg) => msg,
        }
    }

    /// Attach a source location and turn this into the error type `main`
    /// reports. Used once a diagnostic is known to end the run.
    pub fn into_io(self, file: &str, line: u32) -> io::Error {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("{file}:{line}: {}", self.message()),
        )
    }
}

pub type DiagResult<T> = Result<T, Diag>;

/// Sink for recoverable diagnostics. Anything reported here keeps the run
/// going but fails the process at the end.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error<M: Display>(&mut self, msg: M) {
        self.errors += 1;
        tracing::error!("{msg}");
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }
}
