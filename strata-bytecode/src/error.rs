#![forbid(unsafe_code)]

use miette::Diagnostic;
use strata_mir::MirError;
use thiserror::Error;

/// Which of the two fatal categories an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The program (or the layout table) is inconsistent.
    MalformedInput,
    /// A valid construct that has no lowering rule yet.
    Unimplemented,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LowerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mir(#[from] MirError),

    #[error("malformed input: {message}")]
    #[diagnostic(code(strata::lower::malformed))]
    Malformed { message: String },

    #[error("no lowering for {what}")]
    #[diagnostic(
        code(strata::lower::unimplemented),
        help("this is a missing compiler feature, not an error in the program")
    )]
    Unimplemented { what: String },

    #[error("specializations did not converge after {rounds} rounds ({} pending)", pending.len())]
    #[diagnostic(
        code(strata::lower::specialization_limit),
        help("raise `lower.max_specialization_rounds` or look for specializations that request each other")
    )]
    SpecializationLimit { rounds: usize, pending: Vec<String> },

    #[error("while generating `{function}`: {cause}")]
    #[diagnostic(code(strata::lower::specialization))]
    InSpecialization { function: String, cause: Box<LowerError> },
}

impl LowerError {
    pub fn malformed(message: impl Into<String>) -> Self {
        LowerError::Malformed {
            message: message.into(),
        }
    }

    pub fn unimplemented(what: impl Into<String>) -> Self {
        LowerError::Unimplemented { what: what.into() }
    }

    /// Attributes `cause` to the generated function `function`.
    pub fn in_specialization(function: impl Into<String>, cause: LowerError) -> Self {
        LowerError::InSpecialization {
            function: function.into(),
            cause: Box::new(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LowerError::InSpecialization { cause, .. } => cause.kind(),
            LowerError::Unimplemented { .. } => ErrorKind::Unimplemented,
            LowerError::Mir(_) | LowerError::Malformed { .. } | LowerError::SpecializationLimit { .. } => {
                ErrorKind::MalformedInput
            }
        }
    }
}
