#![forbid(unsafe_code)]

use miette::Diagnostic;
use thiserror::Error;

use crate::TypeKey;

#[derive(Debug, Error, Diagnostic)]
pub enum MirError {
    #[error("unknown type `{0}`")]
    #[diagnostic(code(strata::mir::unknown_type))]
    UnknownType(TypeKey),

    #[error("unknown concept `{0}`")]
    #[diagnostic(code(strata::mir::unknown_concept))]
    UnknownConcept(TypeKey),

    #[error("unknown entity `{0}`")]
    #[diagnostic(code(strata::mir::unknown_entity))]
    UnknownEntity(TypeKey),

    #[error("unknown field `{0}`")]
    #[diagnostic(code(strata::mir::unknown_field))]
    UnknownField(String),

    #[error("unknown invoke `{0}`")]
    #[diagnostic(code(strata::mir::unknown_invoke))]
    UnknownInvoke(String),

    #[error("unknown global constant `{0}`")]
    #[diagnostic(code(strata::mir::unknown_global))]
    UnknownGlobal(String),

    #[error("`provides` cycle: {}", path.join(" -> "))]
    #[diagnostic(
        code(strata::mir::provides_cycle),
        help("concepts and entities must form a DAG through their `provides` lists")
    )]
    ProvidesCycle { path: Vec<TypeKey> },

    #[error("expected `{key}` to be {expected}")]
    #[diagnostic(code(strata::mir::shape))]
    Shape { key: TypeKey, expected: &'static str },

    #[error("malformed body of `{invoke}`: {message}")]
    #[diagnostic(code(strata::mir::body))]
    MalformedBody { invoke: String, message: String },

    #[error("failed to read or write the program representation")]
    #[diagnostic(code(strata::mir::serde))]
    Serde(#[from] serde_json::Error),
}

impl MirError {
    pub fn shape(key: impl Into<TypeKey>, expected: &'static str) -> Self {
        MirError::Shape {
            key: key.into(),
            expected,
        }
    }

    pub fn body(invoke: impl Into<String>, message: impl Into<String>) -> Self {
        MirError::MalformedBody {
            invoke: invoke.into(),
            message: message.into(),
        }
    }
}
