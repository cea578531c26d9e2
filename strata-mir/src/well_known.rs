#![forbid(unsafe_code)]

//! Keys of the built-in declarations the lowering and subtype rules refer to by name.

pub const NONE: &str = "None";
pub const NOTHING: &str = "Nothing";
pub const BOOL: &str = "Bool";
pub const INT: &str = "Int";
pub const NAT: &str = "Nat";
pub const BIG_INT: &str = "BigInt";
pub const BIG_NAT: &str = "BigNat";
pub const RATIONAL: &str = "Rational";
pub const FLOAT: &str = "Float";
pub const DECIMAL: &str = "Decimal";
pub const STRING: &str = "String";
pub const BYTE_BUFFER: &str = "ByteBuffer";
pub const DATE_TIME: &str = "DateTime";
pub const TICK_TIME: &str = "TickTime";
pub const LOGICAL_TIME: &str = "LogicalTime";
pub const UUID4: &str = "UUID4";
pub const UUID7: &str = "UUID7";
pub const SHA_CONTENT_HASH: &str = "SHAContentHash";
pub const REGEX: &str = "Regex";

/// Concepts.
pub const ANY: &str = "Any";
pub const SOME: &str = "Some";
pub const IOPTION: &str = "IOption";
pub const TUPLE: &str = "Tuple";
pub const RECORD: &str = "Record";
pub const API_TYPE: &str = "APIType";
pub const TESTABLE_TYPE: &str = "TestableType";

/// Reserved frame names.
pub const RETURN_SLOT: &str = "$$return";
pub const IR_RETURN_SLOT: &str = "$__ir_ret__";
pub const TEMP_PREFIX: &str = "@tmp";
/// Guard mask passed in by the caller rather than declared in the body.
pub const MASK_PARAM: &str = "@maskparam@";

/// Block labels every body carries.
pub const ENTRY_BLOCK: &str = "entry";
pub const EXIT_BLOCK: &str = "exit";

/// Numeric primitives the default operator table covers.
pub const NUMERIC: [&str; 7] = [INT, NAT, BIG_INT, BIG_NAT, RATIONAL, FLOAT, DECIMAL];
