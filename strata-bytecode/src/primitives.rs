#![forbid(unsafe_code)]

//! Default numeric operators, keyed `__i__Core::<op>=<prefix|infix>=(<T>[, <T>])`.

use crate::bytecode::{BinaryOp, NumericKind};

const OPERATOR_PREFIX: &str = "__i__Core::";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveOperator {
    /// Unary `+`: a plain copy.
    Identity(NumericKind),
    Negate(NumericKind),
    /// `swap` encodes `>`/`>=` as `<`/`<=` with the operands exchanged.
    Binary {
        op: BinaryOp,
        numeric: NumericKind,
        swap: bool,
    },
}

/// Looks up a default operator invoke. `None` means there is no table entry.
pub fn resolve(ikey: &str) -> Option<PrimitiveOperator> {
    let rest = ikey.strip_prefix(OPERATOR_PREFIX)?;

    if let Some((op, args)) = rest.split_once("=prefix=") {
        let [t] = parse_args::<1>(args)?;
        return match op {
            "+" => Some(PrimitiveOperator::Identity(t)),
            "-" if !t.is_unsigned() => Some(PrimitiveOperator::Negate(t)),
            _ => None,
        };
    }

    let (op, args) = rest.split_once("=infix=")?;
    let [l, r] = parse_args::<2>(args)?;
    if l != r {
        return None;
    }

    let (op, swap) = match op {
        "+" => (BinaryOp::Add, false),
        "-" => (BinaryOp::Sub, false),
        "*" => (BinaryOp::Mult, false),
        "/" => (BinaryOp::Div, false),
        "==" | "===" => (BinaryOp::Eq, false),
        "!=" | "!==" => (BinaryOp::Neq, false),
        "<" => (BinaryOp::Lt, false),
        "<=" => (BinaryOp::Le, false),
        ">" => (BinaryOp::Lt, true),
        ">=" => (BinaryOp::Le, true),
        _ => return None,
    };

    Some(PrimitiveOperator::Binary {
        op,
        numeric: l,
        swap,
    })
}

/// Operator spelling used when rendering the source of a lowered op.
pub fn operator_text(ikey: &str) -> &str {
    let rest = ikey.strip_prefix(OPERATOR_PREFIX).unwrap_or(ikey);
    rest.split_once("=infix=")
        .or_else(|| rest.split_once("=prefix="))
        .map(|(op, _)| op)
        .unwrap_or(rest)
}

fn parse_args<const N: usize>(args: &str) -> Option<[NumericKind; N]> {
    let inner = args.strip_prefix('(')?.strip_suffix(')')?;
    let kinds: Vec<NumericKind> = inner
        .split(", ")
        .map(NumericKind::from_key)
        .collect::<Option<_>>()?;
    kinds.try_into().ok()
}
