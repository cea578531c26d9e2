#![forbid(unsafe_code)]

//! Flattening of lowered blocks into one relative-jump instruction array.
//!
//! Blocks are packed back to front. Each packed block records its distance from the
//! end of the array, so a jump whose target was already packed is encoded on the
//! spot as `(tail + 1) - distance(target)`. Back-edges point at blocks that are not
//! packed yet; they are recorded as patches and fixed once the whole function is laid
//! out, with the same formula.

use std::collections::{BTreeMap, BTreeSet};

use strata_mir::{well_known as wk, BlockLabel, Body, SourceInfo, TypeKey};
use tracing::trace;

use crate::bytecode::{Argument, Op, OpKind};
use crate::LowerError;

/// How control leaves a lowered block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockExit {
    Jump {
        sinfo: SourceInfo,
        ssrc: String,
        label: BlockLabel,
    },
    Cond {
        sinfo: SourceInfo,
        ssrc: String,
        arg: Argument,
        tlabel: BlockLabel,
        flabel: BlockLabel,
    },
    None {
        sinfo: SourceInfo,
        ssrc: String,
        arg: Argument,
        arglayouttype: TypeKey,
        nlabel: BlockLabel,
        slabel: BlockLabel,
    },
    Abort(Op),
    /// The `exit` block: no instructions and nothing after it.
    Exit,
}

#[derive(Clone, Debug)]
pub struct LinearBlock {
    pub label: BlockLabel,
    pub ops: Vec<Op>,
    pub exit: BlockExit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Linearized {
    pub ops: Vec<Op>,
    /// Absolute start index of every packed block. `exit` starts one past the end.
    pub starts: BTreeMap<BlockLabel, usize>,
}

/// Blocks reachable from `entry` in reverse postorder, with `exit` moved last.
pub fn block_order(body: &Body) -> Result<Vec<&BlockLabel>, LowerError> {
    let entry = body
        .blocks
        .get_key_value(wk::ENTRY_BLOCK)
        .map(|(k, _)| k)
        .ok_or_else(|| LowerError::malformed("body has no `entry` block"))?;

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut postorder: Vec<&BlockLabel> = Vec::new();
    let mut stack: Vec<(&BlockLabel, Vec<&BlockLabel>)> = Vec::new();

    seen.insert(entry);
    stack.push((entry, successors(body, entry)?));

    while let Some((label, succs)) = stack.last_mut() {
        match succs.pop() {
            Some(next) => {
                if seen.insert(next.as_str()) {
                    let nexts = successors(body, next)?;
                    stack.push((next, nexts));
                }
            }
            None => {
                postorder.push(label);
                stack.pop();
            }
        }
    }

    let mut order: Vec<&BlockLabel> = postorder
        .into_iter()
        .rev()
        .filter(|l| l.as_str() != wk::EXIT_BLOCK)
        .collect();
    if let Some((exit, _)) = body.blocks.get_key_value(wk::EXIT_BLOCK) {
        order.push(exit);
    }
    Ok(order)
}

/// Successors in reverse, so popping visits them in terminator order.
fn successors<'b>(body: &'b Body, label: &str) -> Result<Vec<&'b BlockLabel>, LowerError> {
    let block = body
        .block(label)
        .ok_or_else(|| LowerError::malformed(format!("jump to undefined block `{label}`")))?;
    let mut succs = block.successors();
    succs.reverse();
    Ok(succs)
}

struct PcPatch {
    chunk: usize,
    at: usize,
    edge: usize,
    edge_end: usize,
    label: BlockLabel,
}

fn delta(edge_end: usize, target: usize) -> i64 {
    edge_end as i64 - target as i64
}

/// Packs `blocks` (in forward order) into one array.
pub fn pack(blocks: Vec<LinearBlock>) -> Result<Linearized, LowerError> {
    let mut distance: BTreeMap<BlockLabel, usize> = BTreeMap::new();
    let mut chunks: Vec<Vec<Op>> = Vec::with_capacity(blocks.len());
    let mut patches: Vec<PcPatch> = Vec::new();
    let mut tail = 0usize;

    for block in blocks.into_iter().rev() {
        let LinearBlock { label, mut ops, exit } = block;
        let chunk = chunks.len();
        // The terminator is the last op of the block, directly followed by the tail.
        let edge_end = tail + 1;
        let mut encode = |target: &BlockLabel, edge: usize, at: usize| -> i64 {
            match distance.get(target) {
                Some(d) => delta(edge_end, *d),
                None => {
                    patches.push(PcPatch {
                        chunk,
                        at,
                        edge,
                        edge_end,
                        label: target.clone(),
                    });
                    0
                }
            }
        };

        match exit {
            BlockExit::Exit => {
                if !ops.is_empty() {
                    return Err(LowerError::malformed(format!(
                        "exit block `{label}` carries instructions"
                    )));
                }
            }
            BlockExit::Abort(op) => ops.push(op),
            BlockExit::Jump {
                sinfo,
                ssrc,
                label: to,
            } => {
                let offset = encode(&to, 0, ops.len());
                ops.push(Op::new(sinfo, ssrc, OpKind::Jump { offset, label: to }));
            }
            BlockExit::Cond {
                sinfo,
                ssrc,
                arg,
                tlabel,
                flabel,
            } => {
                let at = ops.len();
                let toffset = encode(&tlabel, 0, at);
                let foffset = encode(&flabel, 1, at);
                ops.push(Op::new(
                    sinfo,
                    ssrc,
                    OpKind::JumpCond {
                        arg,
                        toffset,
                        foffset,
                        tlabel,
                        flabel,
                    },
                ));
            }
            BlockExit::None {
                sinfo,
                ssrc,
                arg,
                arglayouttype,
                nlabel,
                slabel,
            } => {
                let at = ops.len();
                let noffset = encode(&nlabel, 0, at);
                let soffset = encode(&slabel, 1, at);
                ops.push(Op::new(
                    sinfo,
                    ssrc,
                    OpKind::JumpNone {
                        arg,
                        arglayouttype,
                        noffset,
                        soffset,
                        nlabel,
                        slabel,
                    },
                ));
            }
        }

        tail += ops.len();
        distance.insert(label, tail);
        chunks.push(ops);
    }

    for patch in patches {
        let target = *distance.get(&patch.label).ok_or_else(|| {
            LowerError::malformed(format!("jump to unplaced block `{}`", patch.label))
        })?;
        let op = chunks
            .get_mut(patch.chunk)
            .and_then(|c| c.get_mut(patch.at))
            .ok_or_else(|| LowerError::malformed("invalid jump patch position"))?;
        let d = delta(patch.edge_end, target);
        match (&mut op.kind, patch.edge) {
            (OpKind::Jump { offset, .. }, 0) => *offset = d,
            (OpKind::JumpCond { toffset, .. }, 0) => *toffset = d,
            (OpKind::JumpCond { foffset, .. }, 1) => *foffset = d,
            (OpKind::JumpNone { noffset, .. }, 0) => *noffset = d,
            (OpKind::JumpNone { soffset, .. }, 1) => *soffset = d,
            _ => return Err(LowerError::malformed("jump patch does not address a jump")),
        }
    }

    let total = tail;
    let starts: BTreeMap<BlockLabel, usize> = distance
        .into_iter()
        .map(|(label, d)| (label, total - d))
        .collect();
    for (label, start) in &starts {
        trace!(%label, start, "placed block");
    }

    let ops = chunks.into_iter().rev().flatten().collect();
    Ok(Linearized { ops, starts })
}

#[cfg(test)]
mod tests {
    use strata_mir::fixtures::{block, body, jump, term};
    use strata_mir::{Argument as MirArgument, ConstantValue, TerminatorKind};

    use super::*;

    fn filler(n: usize, tag: &str) -> Vec<Op> {
        (0..n)
            .map(|i| {
                Op::new(
                    SourceInfo::default(),
                    format!("{tag}{i}"),
                    OpKind::VarLifetimeEnd {
                        name: format!("{tag}{i}"),
                    },
                )
            })
            .collect()
    }

    fn goto(label: &str) -> BlockExit {
        BlockExit::Jump {
            sinfo: SourceInfo::default(),
            ssrc: "jump".into(),
            label: label.into(),
        }
    }

    fn branch(t: &str, f: &str) -> BlockExit {
        BlockExit::Cond {
            sinfo: SourceInfo::default(),
            ssrc: "jumpcond".into(),
            arg: Argument::Stack(0),
            tlabel: t.into(),
            flabel: f.into(),
        }
    }

    fn lb(label: &str, ops: Vec<Op>, exit: BlockExit) -> LinearBlock {
        LinearBlock {
            label: label.into(),
            ops,
            exit,
        }
    }

    /// Every jump edge lands exactly on the recorded start of its target.
    fn assert_edges_land(lin: &Linearized) {
        for (pc, op) in lin.ops.iter().enumerate() {
            for (label, d) in op.kind.jump_edges() {
                let landed = pc as i64 + d;
                assert_eq!(
                    landed,
                    lin.starts[label] as i64,
                    "edge from {pc} to {label} (delta {d})"
                );
            }
        }
    }

    #[test]
    fn diamond_jumps_land_on_block_starts() {
        let lin = pack(vec![
            lb("entry", filler(2, "e"), branch("left", "right")),
            lb("left", filler(1, "l"), goto("merge")),
            lb("right", filler(3, "r"), goto("merge")),
            lb("merge", filler(1, "m"), goto("exit")),
            lb("exit", Vec::new(), BlockExit::Exit),
        ])
        .expect("pack");

        assert_eq!(lin.ops.len(), 3 + 2 + 4 + 2);
        assert_eq!(lin.starts["entry"], 0);
        assert_eq!(lin.starts["left"], 3);
        assert_eq!(lin.starts["right"], 5);
        assert_eq!(lin.starts["merge"], 9);
        assert_eq!(lin.starts["exit"], 11);
        assert_edges_land(&lin);

        // Jumps to the next block in line move by one.
        assert_eq!(lin.ops[10].kind.jump_edges(), vec![("exit", 1)]);
    }

    #[test]
    fn back_edges_are_patched_after_packing() {
        let lin = pack(vec![
            lb("entry", filler(1, "e"), goto("head")),
            lb("head", filler(1, "h"), branch("body", "exit")),
            lb("body", filler(2, "b"), goto("head")),
            lb("exit", Vec::new(), BlockExit::Exit),
        ])
        .expect("pack");

        assert_edges_land(&lin);
        let back = lin.ops[lin.starts["body"] + 2].kind.jump_edges();
        assert_eq!(back.len(), 1);
        assert!(back[0].1 < 0, "loop edge must jump backwards");
    }

    #[test]
    fn abort_blocks_end_without_edges() {
        let abort = Op::new(
            SourceInfo::default(),
            "abort",
            OpKind::Abort { msg: "boom".into() },
        );
        let lin = pack(vec![
            lb("entry", Vec::new(), branch("fail", "exit")),
            lb("fail", Vec::new(), BlockExit::Abort(abort)),
            lb("exit", Vec::new(), BlockExit::Exit),
        ])
        .expect("pack");
        assert_eq!(lin.ops.len(), 2);
        assert_edges_land(&lin);
    }

    #[test]
    fn order_is_reverse_postorder_with_exit_last() {
        let cond = term(TerminatorKind::JumpCond {
            arg: MirArgument::Constant(ConstantValue::True),
            trueblock: "left".into(),
            falseblock: "right".into(),
        });
        let b = body(vec![
            block("entry", Vec::new(), cond),
            block("left", Vec::new(), jump("merge")),
            block("right", Vec::new(), jump("merge")),
            block("merge", Vec::new(), jump("exit")),
            block("dead", Vec::new(), jump("merge")),
        ]);

        let order: Vec<&str> = block_order(&b)
            .expect("order")
            .into_iter()
            .map(String::as_str)
            .collect();
        assert_eq!(order, vec!["entry", "left", "right", "merge", "exit"]);
    }

    #[test]
    fn loops_order_the_header_before_the_body() {
        let cond = term(TerminatorKind::JumpCond {
            arg: MirArgument::Constant(ConstantValue::True),
            trueblock: "body".into(),
            falseblock: "exit".into(),
        });
        let b = body(vec![
            block("entry", Vec::new(), jump("head")),
            block("head", Vec::new(), cond),
            block("body", Vec::new(), jump("head")),
        ]);
        let order: Vec<&str> = block_order(&b)
            .expect("order")
            .into_iter()
            .map(String::as_str)
            .collect();
        assert_eq!(order, vec!["entry", "head", "body", "exit"]);
    }
}
