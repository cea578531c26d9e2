#![forbid(unsafe_code)]

//! Program-level lowering: every invoke, then specializations until none are pending.

use std::collections::BTreeMap;

use strata_core::SubtypeEngine;
use strata_mir::{
    well_known as wk, BasicBlock, Body, InstKind, InvokeDecl, InvokeImpl, Program,
    TerminatorKind,
};
use tracing::debug;

use crate::bytecode::{
    Assembly, BodyFunction, Function, Op, OpKind, PCodeInfo, ParameterInfo, PrimitiveFunction,
};
use crate::context::LoweringContext;
use crate::layout::LayoutOracle;
use crate::linearize::{block_order, pack, BlockExit, LinearBlock};
use crate::specialize::SpecializationRegistry;
use crate::LowerError;

#[derive(Clone, Debug)]
pub struct LowerOptions {
    /// Drain-and-generate rounds allowed before the specialization queue must be empty.
    pub max_specialization_rounds: usize,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            max_specialization_rounds: 64,
        }
    }
}

pub fn lower_program(program: &Program, oracle: &dyn LayoutOracle) -> Result<Assembly, LowerError> {
    lower_program_with_options(program, oracle, &LowerOptions::default())
}

#[tracing::instrument(skip_all, fields(invokes = program.invokes.len()))]
pub fn lower_program_with_options(
    program: &Program,
    oracle: &dyn LayoutOracle,
    options: &LowerOptions,
) -> Result<Assembly, LowerError> {
    program.validate()?;

    let mut lowerer = Lowerer::new(program, oracle)?;
    let mut functions = BTreeMap::new();

    for decl in program.invokes.values() {
        if let Some(f) = lowerer.lower_invoke(decl)? {
            functions.insert(f.ikey().to_string(), f);
        }
    }

    let mut rounds = 0;
    while lowerer.registry.has_pending() {
        if rounds >= options.max_specialization_rounds {
            return Err(LowerError::SpecializationLimit {
                rounds,
                pending: lowerer.registry.pending_names(),
            });
        }
        rounds += 1;

        let batch = lowerer.registry.drain();
        debug!(round = rounds, pending = batch.len(), "specialization round");
        for (name, spec) in batch {
            for f in lowerer.materialize(&name, &spec)? {
                functions.insert(f.ikey().to_string(), f);
            }
        }
    }

    Ok(Assembly {
        functions,
        specializations: lowerer.registry.names().clone(),
        const_pool: lowerer.ctx.constants().layout(),
    })
}

/// Shared state for one lowering run.
pub(crate) struct Lowerer<'p> {
    pub(crate) program: &'p Program,
    pub(crate) subtypes: SubtypeEngine<'p>,
    pub(crate) ctx: LoweringContext<'p>,
    pub(crate) registry: SpecializationRegistry,
}

impl<'p> Lowerer<'p> {
    pub(crate) fn new(program: &'p Program, oracle: &'p dyn LayoutOracle) -> Result<Self, LowerError> {
        Ok(Self {
            program,
            subtypes: SubtypeEngine::new(&program.graph),
            ctx: LoweringContext::new(program, oracle)?,
            registry: SpecializationRegistry::new(),
        })
    }

    pub(crate) fn is_subtype(&self, t1: &str, t2: &str) -> Result<bool, LowerError> {
        Ok(self.subtypes.is_subtype_key(t1, t2)?)
    }

    /// `None` for default primitives: those are expanded inline at each call.
    pub(crate) fn lower_invoke(&mut self, decl: &InvokeDecl) -> Result<Option<Function>, LowerError> {
        match &decl.implementation {
            InvokeImpl::Primitive { implkey, .. } if implkey == "default" => Ok(None),
            InvokeImpl::Primitive {
                implkey,
                binds,
                pcodes,
            } => {
                let mut infos = BTreeMap::new();
                for (pname, pc) in pcodes {
                    let mut cargs = Vec::with_capacity(pc.cargs.len());
                    for carg in &pc.cargs {
                        let idx = decl
                            .params
                            .iter()
                            .position(|p| p.name == carg.cname)
                            .ok_or_else(|| {
                                LowerError::malformed(format!(
                                    "pcode `{}` of `{}` captures unknown parameter `{}`",
                                    pc.code, decl.ikey, carg.cname
                                ))
                            })?;
                        cargs.push(idx);
                    }
                    infos.insert(
                        pname.clone(),
                        PCodeInfo {
                            code: pc.code.clone(),
                            ctypes: pc.cargs.iter().map(|c| c.ctype.clone()).collect(),
                            cargs,
                        },
                    );
                }

                Ok(Some(Function::Primitive(PrimitiveFunction {
                    name: decl.shortname.clone(),
                    ikey: decl.ikey.clone(),
                    src_file: decl.src_file.clone(),
                    sinfo_start: decl.sinfo_start,
                    sinfo_end: decl.sinfo_end,
                    recursive: decl.recursive,
                    params: decl.params.clone(),
                    result_type: decl.result_type.clone(),
                    enclosing: decl.enclosing.clone(),
                    implkey: implkey.clone(),
                    binds: binds.clone(),
                    pcodes: infos,
                })))
            }
            InvokeImpl::Body { masksize, body } => {
                self.lower_body(decl, *masksize, body).map(|b| Some(Function::Body(b)))
            }
        }
    }

    fn lower_body(&mut self, decl: &InvokeDecl, argmaskslots: u32, body: &Body) -> Result<BodyFunction, LowerError> {
        self.ctx.begin_function();

        let mut paraminfo = Vec::with_capacity(decl.params.len());
        for p in &decl.params {
            let slot = self.ctx.slot_for(&p.name, &p.ptype)?;
            paraminfo.push(ParameterInfo { poffset: slot.offset });
        }
        let resultarg = self
            .ctx
            .slot_for(wk::RETURN_SLOT, &decl.result_type)?
            .as_argument();

        let order = block_order(body)?;
        let mut lowered: BTreeMap<&str, Vec<Op>> = BTreeMap::new();

        for label in &order {
            let block = lookup(body, label)?;
            for phi in block.phis() {
                if let InstKind::Phi { trgt, layouttype, .. } = &phi.kind {
                    self.ctx.slot_for(&trgt.name, layouttype)?;
                }
            }

            let mut ops = Vec::new();
            for inst in block.body() {
                ops.extend(self.lower_inst(inst)?);
            }
            lowered.insert(label.as_str(), ops);
        }

        // Phi copies go at the tail of each reached predecessor, ahead of its terminator.
        for label in &order {
            let block = lookup(body, label)?;
            for phi in block.phis() {
                let InstKind::Phi { trgt, layouttype, src } = &phi.kind else {
                    continue;
                };
                let shared = self.ctx.slot_for(&trgt.name, layouttype)?;
                for (from, value) in src {
                    if !lowered.contains_key(from.as_str()) {
                        continue;
                    }
                    let arg = self.argument(value)?;
                    if let Some(ops) = lowered.get_mut(from.as_str()) {
                        ops.push(Op::new(
                            phi.sinfo,
                            format!("{} = phi({from})", trgt.name),
                            OpKind::RegisterAssign {
                                trgt: shared,
                                arg,
                                oftype: layouttype.clone(),
                                sguard: None,
                            },
                        ));
                    }
                }
            }
        }

        let mut blocks = Vec::with_capacity(order.len());
        for label in &order {
            let block = lookup(body, label)?;
            let exit = self.lower_exit(block)?;
            blocks.push(LinearBlock {
                label: (*label).clone(),
                ops: lowered.remove(label.as_str()).unwrap_or_default(),
                exit,
            });
        }

        let linear = pack(blocks)?;
        debug!(
            function = %decl.ikey,
            frame = self.ctx.frame_size(),
            masks = self.ctx.mask_size(),
            ops = linear.ops.len(),
            "lowered function"
        );

        Ok(BodyFunction {
            name: decl.shortname.clone(),
            ikey: decl.ikey.clone(),
            src_file: decl.src_file.clone(),
            sinfo_start: decl.sinfo_start,
            sinfo_end: decl.sinfo_end,
            recursive: decl.recursive,
            params: decl.params.clone(),
            paraminfo,
            result_type: decl.result_type.clone(),
            resultarg,
            scalarstackbytes: self.ctx.frame_size(),
            masksize: self.ctx.mask_size(),
            argmaskslots,
            body: linear.ops,
        })
    }

    fn lower_exit(&mut self, block: &BasicBlock) -> Result<BlockExit, LowerError> {
        let Some(term) = &block.term else {
            if block.label == wk::EXIT_BLOCK {
                return Ok(BlockExit::Exit);
            }
            return Err(LowerError::malformed(format!(
                "block `{}` has no terminator",
                block.label
            )));
        };

        Ok(match &term.kind {
            TerminatorKind::Jump { trgtblock } => BlockExit::Jump {
                sinfo: term.sinfo,
                ssrc: format!("jump {trgtblock}"),
                label: trgtblock.clone(),
            },
            TerminatorKind::JumpCond {
                arg,
                trueblock,
                falseblock,
            } => BlockExit::Cond {
                sinfo: term.sinfo,
                ssrc: format!("if {arg} then {trueblock} else {falseblock}"),
                arg: self.argument(arg)?,
                tlabel: trueblock.clone(),
                flabel: falseblock.clone(),
            },
            TerminatorKind::JumpNone {
                arg,
                arglayouttype,
                noneblock,
                someblock,
            } => BlockExit::None {
                sinfo: term.sinfo,
                ssrc: format!("if none({arg}) then {noneblock} else {someblock}"),
                arg: self.argument(arg)?,
                arglayouttype: arglayouttype.clone(),
                nlabel: noneblock.clone(),
                slabel: someblock.clone(),
            },
            TerminatorKind::Abort { info } => BlockExit::Abort(Op::new(
                term.sinfo,
                format!("abort {info}"),
                OpKind::Abort { msg: info.clone() },
            )),
        })
    }
}

fn lookup<'b>(body: &'b Body, label: &str) -> Result<&'b BasicBlock, LowerError> {
    body.block(label)
        .ok_or_else(|| LowerError::malformed(format!("no block labeled `{label}`")))
}
