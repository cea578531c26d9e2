#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use crate::well_known::{ENTRY_BLOCK, EXIT_BLOCK};
use crate::{Body, InstKind, InvokeDecl, InvokeImpl, MirError, Program};

/// Structural checks on one invoke: parameter and result types resolve, and a body (if any)
/// is a well-formed CFG.
pub fn validate_invoke(program: &Program, decl: &InvokeDecl) -> Result<(), MirError> {
    for p in &decl.params {
        program.graph.type_of(&p.ptype)?;
    }
    program.graph.type_of(&decl.result_type)?;

    match &decl.implementation {
        InvokeImpl::Body { body, .. } => validate_body(&decl.ikey, body),
        InvokeImpl::Primitive { pcodes, .. } => {
            for pc in pcodes.values() {
                for carg in &pc.cargs {
                    if !decl.params.iter().any(|p| p.name == carg.cname) {
                        return Err(MirError::body(
                            decl.ikey.clone(),
                            format!("pcode `{}` captures unknown parameter `{}`", pc.code, carg.cname),
                        ));
                    }
                }
            }
            Ok(())
        }
    }
}

pub fn validate_body(ikey: &str, body: &Body) -> Result<(), MirError> {
    let err = |message: String| MirError::body(ikey.to_string(), message);

    for (label, bb) in &body.blocks {
        if label != &bb.label {
            return Err(err(format!("block keyed `{label}` is labeled `{}`", bb.label)));
        }
    }

    if !body.blocks.contains_key(ENTRY_BLOCK) {
        return Err(err("missing `entry` block".to_string()));
    }
    let Some(exit) = body.blocks.get(EXIT_BLOCK) else {
        return Err(err("missing `exit` block".to_string()));
    };
    if exit.term.is_some() || !exit.insts.is_empty() {
        return Err(err("`exit` block must be empty and unterminated".to_string()));
    }

    let mut preds: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for bb in body.blocks.values() {
        if bb.label == EXIT_BLOCK {
            continue;
        }
        let Some(term) = &bb.term else {
            return Err(err(format!("block `{}` has no terminator", bb.label)));
        };
        for succ in term.kind.successors() {
            if !body.blocks.contains_key(succ) {
                return Err(err(format!("block `{}` jumps to unknown block `{succ}`", bb.label)));
            }
            preds.entry(succ.as_str()).or_default().insert(bb.label.as_str());
        }
    }

    for bb in body.blocks.values() {
        let nphis = bb.phis().count();
        for inst in &bb.insts[nphis..] {
            if matches!(inst.kind, InstKind::Phi { .. }) {
                return Err(err(format!("phi after a non-phi instruction in `{}`", bb.label)));
            }
        }

        let bpreds = preds.get(bb.label.as_str());
        for inst in bb.phis() {
            if let InstKind::Phi { src, .. } = &inst.kind {
                for from in src.keys() {
                    if !bpreds.is_some_and(|p| p.contains(from.as_str())) {
                        return Err(err(format!(
                            "phi in `{}` names `{from}`, which is not a predecessor",
                            bb.label
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{Argument, BasicBlock, Inst, Register, SourceInfo, Terminator, TerminatorKind};

    fn jump(to: &str) -> Option<Terminator> {
        Some(Terminator {
            sinfo: SourceInfo::default(),
            kind: TerminatorKind::Jump {
                trgtblock: to.to_string(),
            },
        })
    }

    fn block(label: &str, insts: Vec<Inst>, term: Option<Terminator>) -> BasicBlock {
        BasicBlock {
            label: label.to_string(),
            insts,
            term,
        }
    }

    fn body(blocks: Vec<BasicBlock>) -> Body {
        Body {
            blocks: blocks.into_iter().map(|b| (b.label.clone(), b)).collect(),
        }
    }

    fn phi(from: &str) -> Inst {
        Inst {
            sinfo: SourceInfo::default(),
            kind: InstKind::Phi {
                trgt: Register::new("x"),
                layouttype: "Int".to_string(),
                src: BTreeMap::from([(from.to_string(), Argument::Register(Register::new("y")))]),
            },
        }
    }

    #[test]
    fn accepts_straight_line_body() {
        let b = body(vec![block("entry", vec![], jump("exit")), block("exit", vec![], None)]);
        validate_body("f", &b).expect("valid");
    }

    #[test]
    fn rejects_missing_exit_and_bad_targets() {
        let b = body(vec![block("entry", vec![], jump("exit"))]);
        assert!(validate_body("f", &b).is_err());

        let b = body(vec![block("entry", vec![], jump("nowhere")), block("exit", vec![], None)]);
        let msg = validate_body("f", &b).expect_err("unknown target").to_string();
        assert!(msg.contains("nowhere"), "{msg}");
    }

    #[test]
    fn phi_must_lead_and_name_predecessors() {
        let ok = body(vec![
            block("entry", vec![], jump("merge")),
            block("merge", vec![phi("entry")], jump("exit")),
            block("exit", vec![], None),
        ]);
        validate_body("f", &ok).expect("valid phi");

        let not_pred = body(vec![
            block("entry", vec![], jump("merge")),
            block("merge", vec![phi("other")], jump("exit")),
            block("exit", vec![], None),
        ]);
        assert!(validate_body("f", &not_pred).is_err());

        let late = body(vec![
            block("entry", vec![], jump("merge")),
            block(
                "merge",
                vec![
                    Inst {
                        sinfo: SourceInfo::default(),
                        kind: InstKind::Debug { value: None },
                    },
                    phi("entry"),
                ],
                jump("exit"),
            ),
            block("exit", vec![], None),
        ]);
        assert!(validate_body("f", &late).is_err());
    }
}
