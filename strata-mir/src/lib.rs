#![forbid(unsafe_code)]

pub mod decls;
pub mod error;
pub mod ir;
pub mod program;
pub mod types;
pub mod validate;
pub mod well_known;

#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

pub use decls::*;
pub use error::*;
pub use ir::*;
pub use program::*;
pub use types::*;
pub use validate::*;
