#![forbid(unsafe_code)]

pub mod api;
pub mod subtype;

pub use api::*;
pub use subtype::*;
