#![forbid(unsafe_code)]

//! Lowering of a typed MIR program into linear, frame-addressed bytecode.

pub mod bytecode;
pub mod context;
pub mod error;
pub mod layout;
pub mod linearize;
pub mod lower;
pub mod primitives;
pub mod specialize;

mod emit;
mod materialize;

#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

pub use bytecode::*;
pub use error::*;
pub use layout::{LayoutInfo, LayoutKind, LayoutOracle, LayoutTable, MemberLayout};
pub use lower::{lower_program, lower_program_with_options, LowerOptions};
