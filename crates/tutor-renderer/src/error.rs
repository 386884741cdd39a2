use miette::Diagnostic;
use thiserror::Error;

/// Failure reported by a typesetting engine for one pass over a container.
///
/// These are logged by the scheduler, never retried. The container keeps
/// showing whatever the engine left there, at worst the fenced source.
#[derive(Debug, Error, Diagnostic)]
pub enum TypesetError {
    #[error("{failed} of {total} math expressions failed to typeset: {message}")]
    #[diagnostic(code(typeset::expressions))]
    Expressions {
        failed: usize,
        total: usize,
        message: String,
    },

    #[error("typesetting engine failed: {0}")]
    #[diagnostic(code(typeset::engine))]
    Engine(String),
}
