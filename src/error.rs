//! Errors reported by [`Function`](crate::Function) and by terms.
use thiserror::Error;

/// Broad classification of a [`FunctionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition on the arguments of a call was violated.
    InvalidArgument,
    /// The requested operation is not available for this function.
    NotSupported,
    /// A term failed while being evaluated.
    TermFault,
    /// A resource or a backend the function relies on failed.
    Internal,
}

/// A failure raised by a [`Term`](crate::Term) while it was evaluated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TermError {
    message: String,
}

impl TermError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for TermError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TermError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors which can occur when building or evaluating a function.
#[derive(Error, Debug)]
pub enum FunctionError {
    /// The variable handle was not issued by this function.
    #[error("unknown variable")]
    UnknownVariable,

    /// A value or transform does not fit the established dimension of a variable.
    #[error("variable dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// The solver dimension of a transform differs from the one the variable was registered with.
    #[error("solver dimension of a variable can not change: expected {expected}, got {found}")]
    SolverDimensionMismatch { expected: usize, found: usize },

    /// The number of variables passed to `add_term` differs from the arity of the term.
    #[error("term expects {expected} variables, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    /// A variable bound to a term slot has the wrong dimension.
    #[error("variable {slot} of the term must have dimension {expected}, got {found}")]
    TermDimensionMismatch {
        slot: usize,
        expected: usize,
        found: usize,
    },

    /// A global state vector of the wrong length was passed.
    #[error("global vector must have {expected} scalars, got {found}")]
    GlobalDimensionMismatch { expected: usize, found: usize },

    #[error("invalid number of threads: {0}")]
    InvalidThreadCount(usize),

    #[error("Hessian computation is not enabled")]
    HessianDisabled,

    /// Transforms can only be used together with value and gradient evaluation.
    #[error("change of variables is not supported for {0}")]
    ChangeOfVariablesUnsupported(&'static str),

    /// The first (lowest-indexed) term that failed during an evaluation.
    #[error("term {term} failed: {source}")]
    TermFailed {
        term: usize,
        #[source]
        source: TermError,
    },

    #[error("sparse Hessian assembly failed: {0}")]
    SparseAssembly(String),

    #[error("could not create the worker pool: {0}")]
    ThreadPool(String),
}

impl FunctionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FunctionError::UnknownVariable
            | FunctionError::DimensionMismatch { .. }
            | FunctionError::SolverDimensionMismatch { .. }
            | FunctionError::ArityMismatch { .. }
            | FunctionError::TermDimensionMismatch { .. }
            | FunctionError::GlobalDimensionMismatch { .. }
            | FunctionError::InvalidThreadCount(_) => ErrorKind::InvalidArgument,
            FunctionError::HessianDisabled | FunctionError::ChangeOfVariablesUnsupported(_) => {
                ErrorKind::NotSupported
            }
            FunctionError::TermFailed { .. } => ErrorKind::TermFault,
            FunctionError::SparseAssembly(_) | FunctionError::ThreadPool(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = core::result::Result<T, FunctionError>;
