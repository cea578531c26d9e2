#![forbid(unsafe_code)]

//! Lowering of single MIR instructions into bytecode ops.

use strata_mir::{
    well_known as wk, Argument as MirArgument, CollectionKind, ConstantValue, FieldKey, FlowLayout,
    Guard as MirGuard, Inst, InstKind, LogicOp, MirError, Register, StatementGuard as MirStatementGuard,
    Type, TypeKey,
};

use crate::bytecode::{Argument, Guard, Op, OpKind, StatementGuard, TargetVar};
use crate::context::LoweringContext;
use crate::lower::Lowerer;
use crate::primitives::{self, PrimitiveOperator};
use crate::specialize::Specialization;
use crate::LowerError;

fn render(kind: &InstKind) -> String {
    let defs = kind.defs();
    if defs.is_empty() {
        return kind.name().to_string();
    }
    let names: Vec<&str> = defs.iter().map(|r| r.name.as_str()).collect();
    format!("{} = {}", names.join(", "), kind.name())
}

impl<'p> Lowerer<'p> {
    pub(crate) fn ty(&self, tkey: &str) -> Result<&'p Type, LowerError> {
        Ok(self.program.graph.type_of(tkey)?)
    }

    pub(crate) fn argument(&mut self, arg: &MirArgument) -> Result<Argument, LowerError> {
        match arg {
            MirArgument::Register(r) => self.ctx.stack_arg(&r.name),
            MirArgument::Global(g) => self.ctx.global_for(g),
            MirArgument::Constant(c) => self.ctx.constant_for(c),
        }
    }

    fn arguments(&mut self, args: &[MirArgument]) -> Result<Vec<Argument>, LowerError> {
        args.iter().map(|a| self.argument(a)).collect()
    }

    fn target(&mut self, trgt: &Register, tkey: &str) -> Result<TargetVar, LowerError> {
        self.ctx.slot_for(&trgt.name, tkey)
    }

    fn guard(&mut self, sguard: Option<&MirStatementGuard>) -> Result<Option<StatementGuard>, LowerError> {
        let Some(sg) = sguard else {
            return Ok(None);
        };

        let guard = match &sg.guard {
            MirGuard::Mask { gmask, gindex } => Guard::Mask {
                gmaskoffset: if gmask == wk::MASK_PARAM {
                    None
                } else {
                    Some(self.ctx.mask_offset(gmask)?)
                },
                gindex: *gindex,
            },
            MirGuard::Var { greg } => Guard::Var {
                gvaroffset: self.ctx.offset_of(&greg.name)?,
            },
        };
        let defaultvar = sg
            .defaultvar
            .as_ref()
            .map(|d| self.argument(d))
            .transpose()?;

        Ok(Some(StatementGuard {
            guard,
            usedefault_on: sg.usedefault_on,
            defaultvar,
        }))
    }

    /// Representation change of a value from `from` into `into`.
    pub(crate) fn coerce(
        &self,
        trgt: TargetVar,
        arg: Argument,
        from: &str,
        into: &str,
        sguard: Option<StatementGuard>,
    ) -> Result<OpKind, LowerError> {
        let direct = |sguard| OpKind::DirectAssign {
            trgt,
            intotype: into.to_string(),
            arg,
            sguard,
        };
        if from == into {
            return Ok(direct(sguard));
        }

        let fl = self.ctx.layout(from)?;
        let il = self.ctx.layout(into)?;
        match (fl.kind.is_union(), il.kind.is_union()) {
            (false, true) => Ok(OpKind::Box {
                trgt,
                intotype: into.to_string(),
                arg,
                fromtype: from.to_string(),
                sguard,
            }),
            (true, false) => Ok(OpKind::Extract {
                trgt,
                intotype: into.to_string(),
                arg,
                fromtype: from.to_string(),
                sguard,
            }),
            _ if fl.kind == il.kind && fl.size == il.size => Ok(direct(sguard)),
            _ => Err(LowerError::malformed(format!(
                "no representation change from `{from}` into `{into}`"
            ))),
        }
    }

    pub(crate) fn virtual_call(
        &self,
        trgt: TargetVar,
        trgttype: &str,
        invkey: String,
        rcvrlayouttype: &str,
        args: Vec<Argument>,
    ) -> OpKind {
        OpKind::InvokeVirtualFunction {
            trgt,
            trgttype: trgttype.to_string(),
            invkey,
            rcvrlayouttype: rcvrlayouttype.to_string(),
            args,
            optmaskoffset: None,
        }
    }

    pub(crate) fn fixed_call(&self, trgt: TargetVar, trgttype: &str, invkey: String, args: Vec<Argument>) -> OpKind {
        OpKind::InvokeFixedFunction {
            trgt,
            trgttype: trgttype.to_string(),
            invkey,
            args,
            optmaskoffset: None,
            sguard: None,
        }
    }

    /// Ops for `inst`, followed by any home-location copies it needs.
    pub(crate) fn lower_inst(&mut self, inst: &Inst) -> Result<Vec<Op>, LowerError> {
        let mut ops = Vec::new();
        if let Some((ssrc, kind)) = self.lower_kind(&inst.kind)? {
            ops.push(Op::new(inst.sinfo, ssrc, kind));
        }

        for reg in inst.kind.defs() {
            if reg.name == reg.origname
                || LoweringContext::is_reserved_name(&reg.name)
                || LoweringContext::is_reserved_name(&reg.origname)
            {
                continue;
            }
            let storage = self.ctx.storage_of(&reg.name)?;
            let homelocation = self.ctx.slot_for(&reg.origname, &storage)?;
            let fromlocation = self.ctx.stack_arg(&reg.name)?;
            ops.push(Op::new(
                inst.sinfo,
                format!("{} <- {}", reg.origname, reg.name),
                OpKind::VarHomeLocationValueUpdate {
                    homelocation,
                    fromlocation,
                    oftype: storage,
                },
            ));
        }

        Ok(ops)
    }

    fn lower_kind(&mut self, kind: &InstKind) -> Result<Option<(String, OpKind)>, LowerError> {
        let ssrc = render(kind);

        let op = match kind {
            InstKind::Debug { value } => OpKind::Debug {
                arg: value.as_ref().map(|v| self.argument(v)).transpose()?,
            },
            InstKind::AssertCheck { arg, info } => OpKind::Assert {
                arg: self.argument(arg)?,
                msg: info.clone(),
            },
            InstKind::LoadUnintVariableValue { trgt, oftype } => OpKind::LoadUnintVariableValue {
                trgt: self.target(trgt, oftype)?,
                oftype: oftype.clone(),
            },
            InstKind::DeclareGuardFlagLocation { name, count } => {
                self.ctx.mask_region(name, *count);
                return Ok(None);
            }
            InstKind::SetConstantGuardFlag { name, position, flag } => OpKind::StoreConstantMaskValue {
                gmaskoffset: self.ctx.mask_offset(name)?,
                gindex: *position,
                flag: *flag,
            },
            InstKind::ConvertValue {
                trgt,
                src,
                srctypelayout,
                intotype,
                sguard,
                ..
            } => {
                let arg = self.argument(src)?;
                let sguard = self.guard(sguard.as_ref())?;
                let trgt = self.target(trgt, intotype)?;
                self.coerce(trgt, arg, srctypelayout, intotype, sguard)?
            }
            InstKind::LoadConst { trgt, src, consttype } => {
                let arg = self.argument(src)?;
                OpKind::LoadConst {
                    trgt: self.target(trgt, consttype)?,
                    arg,
                    oftype: consttype.clone(),
                }
            }
            InstKind::TupleHasIndex {
                trgt,
                arg,
                arglayouttype,
                idx,
            } => {
                let arg = self.argument(arg)?;
                OpKind::TupleHasIndex {
                    trgt: self.target(trgt, wk::BOOL)?,
                    arg,
                    arglayouttype: arglayouttype.clone(),
                    idx: *idx,
                }
            }
            InstKind::RecordHasProperty {
                trgt,
                arg,
                arglayouttype,
                pname,
            } => {
                let arg = self.argument(arg)?;
                OpKind::RecordHasProperty {
                    trgt: self.target(trgt, wk::BOOL)?,
                    arg,
                    arglayouttype: arglayouttype.clone(),
                    pname: pname.clone(),
                }
            }
            InstKind::LoadTupleIndex {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                idx,
                resulttype,
            } => {
                let arg = self.argument(arg)?;
                let trgt = self.target(trgt, resulttype)?;
                if self.ty(argflowtype)?.as_unique_tuple().is_some() {
                    OpKind::LoadTupleIndexDirect {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        slotoffset: self.ctx.layout(argflowtype)?.at(*idx)?.offset,
                        idx: *idx,
                    }
                } else {
                    OpKind::LoadTupleIndexVirtual {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        idx: *idx,
                    }
                }
            }
            InstKind::LoadRecordProperty {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                pname,
                resulttype,
            } => {
                let arg = self.argument(arg)?;
                let trgt = self.target(trgt, resulttype)?;
                if self.ty(argflowtype)?.as_unique_record().is_some() {
                    OpKind::LoadRecordPropertyDirect {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        slotoffset: self.ctx.layout(argflowtype)?.named(pname)?.offset,
                        pname: pname.clone(),
                    }
                } else {
                    OpKind::LoadRecordPropertyVirtual {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        pname: pname.clone(),
                    }
                }
            }
            InstKind::LoadField {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                field,
                resulttype,
            } => {
                let arg = self.argument(arg)?;
                let trgt = self.target(trgt, resulttype)?;
                if self.ty(argflowtype)?.as_unique_entity().is_some() {
                    OpKind::LoadEntityFieldDirect {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        slotoffset: self.ctx.layout(argflowtype)?.named(field)?.offset,
                        field: field.clone(),
                    }
                } else {
                    OpKind::LoadEntityFieldVirtual {
                        trgt,
                        trgttype: resulttype.clone(),
                        arg,
                        arglayouttype: arglayouttype.clone(),
                        field: field.clone(),
                    }
                }
            }
            InstKind::TupleProjectToEphemeral {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                indices,
                epht,
            } => self.project_tuple(trgt, arg, arglayouttype, argflowtype, indices, epht)?,
            InstKind::RecordProjectToEphemeral {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                properties,
                epht,
            } => self.project_record(trgt, arg, arglayouttype, argflowtype, properties, epht)?,
            InstKind::EntityProjectToEphemeral {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                fields,
                epht,
            } => self.project_entity(trgt, arg, arglayouttype, argflowtype, fields, epht)?,
            InstKind::TupleUpdate {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            } => self.update_tuple(trgt, arg, arglayouttype, argflowtype, updates)?,
            InstKind::RecordUpdate {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            } => self.update_record(trgt, arg, arglayouttype, argflowtype, updates)?,
            InstKind::EntityUpdate {
                trgt,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            } => self.update_entity(trgt, arg, arglayouttype, argflowtype, updates)?,
            InstKind::LoadFromEphemeralList {
                trgt,
                arg,
                argtype,
                idx,
                resulttype,
            } => {
                let arg = self.argument(arg)?;
                OpKind::LoadFromEphemeralList {
                    trgt: self.target(trgt, resulttype)?,
                    trgttype: resulttype.clone(),
                    arg,
                    argtype: argtype.clone(),
                    slotoffset: self.ctx.layout(argtype)?.at(*idx)?.offset,
                    idx: *idx,
                }
            }
            InstKind::MultiLoadFromEphemeralList { trgts, arg, argtype } => {
                let arg = self.argument(arg)?;
                let layout = self.ctx.layout(argtype)?;
                let mut slots = Vec::with_capacity(trgts.len());
                let mut slotoffsets = Vec::with_capacity(trgts.len());
                for t in trgts {
                    slots.push(self.target(&t.into, &t.oftype)?);
                    slotoffsets.push(layout.at(t.pos)?.offset);
                }
                OpKind::MultiLoadFromEphemeralList {
                    trgts: slots,
                    trgttypes: trgts.iter().map(|t| t.oftype.clone()).collect(),
                    arg,
                    argtype: argtype.clone(),
                    slotoffsets,
                    idxs: trgts.iter().map(|t| t.pos).collect(),
                }
            }
            InstKind::InvokeFixedFunction {
                trgt,
                result_type,
                mkey,
                args,
                optmask,
                sguard,
            } => {
                return self
                    .invoke_fixed(ssrc, trgt, result_type, mkey, args, optmask.as_deref(), sguard.as_ref())
                    .map(Some);
            }
            InstKind::InvokeVirtualFunction {
                trgt,
                result_type,
                vresolve,
                rcvrlayouttype,
                args,
                optmask,
            } => {
                let args = self.arguments(args)?;
                let optmaskoffset = optmask.as_deref().map(|m| self.ctx.mask_offset(m)).transpose()?;
                let trgt = self.target(trgt, result_type)?;
                if let Some(m) = optmask {
                    self.ctx.release_mask(m);
                }
                OpKind::InvokeVirtualFunction {
                    trgt,
                    trgttype: result_type.clone(),
                    invkey: vresolve.clone(),
                    rcvrlayouttype: rcvrlayouttype.clone(),
                    args,
                    optmaskoffset,
                }
            }
            InstKind::InvokeVirtualOperator { vresolve, .. } => {
                return Err(LowerError::unimplemented(format!(
                    "InvokeVirtualOperator `{vresolve}`"
                )));
            }
            InstKind::ConstructorTuple {
                trgt,
                result_tuple_type,
                args,
            } => {
                let args = self.arguments(args)?;
                OpKind::ConstructorTuple {
                    trgt: self.target(trgt, result_tuple_type)?,
                    oftype: result_tuple_type.clone(),
                    args,
                }
            }
            InstKind::ConstructorRecord {
                trgt,
                result_record_type,
                args,
            } => {
                let mut vals = Vec::with_capacity(args.len());
                for (_, a) in args {
                    vals.push(self.argument(a)?);
                }
                OpKind::ConstructorRecord {
                    trgt: self.target(trgt, result_record_type)?,
                    oftype: result_record_type.clone(),
                    args: vals,
                }
            }
            InstKind::ConstructorEphemeralList {
                trgt,
                result_ephemeral_list_type,
                args,
            } => {
                let args = self.arguments(args)?;
                OpKind::ConstructorEphemeralList {
                    trgt: self.target(trgt, result_ephemeral_list_type)?,
                    oftype: result_ephemeral_list_type.clone(),
                    args,
                }
            }
            InstKind::ConstructorEntityDirect {
                trgt,
                entity_type,
                args,
            } => {
                let args = self.arguments(args)?;
                OpKind::ConstructorEntityDirect {
                    trgt: self.target(trgt, entity_type)?,
                    oftype: entity_type.clone(),
                    args,
                }
            }
            InstKind::ConstructorPrimaryCollectionEmpty { trgt, tkey } => {
                let spec = match self.collection_kind(tkey)? {
                    CollectionKind::List => Specialization::ListEmpty { result: tkey.clone() },
                    CollectionKind::Map => Specialization::MapEmpty { result: tkey.clone() },
                    other => return Err(unsupported_collection(other, kind)),
                };
                let invkey = self.registry.request(spec);
                let trgt = self.target(trgt, tkey)?;
                self.fixed_call(trgt, tkey, invkey, Vec::new())
            }
            InstKind::ConstructorPrimaryCollectionSingletons { trgt, tkey, args } => {
                let spec = match self.collection_kind(tkey)? {
                    CollectionKind::List => Specialization::ListSingletons {
                        argc: args.len(),
                        result: tkey.clone(),
                    },
                    other => return Err(unsupported_collection(other, kind)),
                };
                let mut vals = Vec::with_capacity(args.len());
                for (_, a) in args {
                    vals.push(self.argument(a)?);
                }
                let invkey = self.registry.request(spec);
                let trgt = self.target(trgt, tkey)?;
                self.fixed_call(trgt, tkey, invkey, vals)
            }
            InstKind::ConstructorPrimaryCollectionOneElement { trgt, tkey, arg } => {
                let (argtype, value) = arg;
                let spec = match self.collection_kind(tkey)? {
                    CollectionKind::List => Specialization::ListSingletons {
                        argc: 1,
                        result: tkey.clone(),
                    },
                    CollectionKind::Map => {
                        if self.ty(argtype)?.as_unique_tuple().is_none() {
                            return Err(LowerError::malformed(format!(
                                "map entry `{argtype}` is not a key/value tuple"
                            )));
                        }
                        Specialization::MapSingleton {
                            argtuple: argtype.clone(),
                            result: tkey.clone(),
                        }
                    }
                    other => return Err(unsupported_collection(other, kind)),
                };
                let value = self.argument(value)?;
                let invkey = self.registry.request(spec);
                let trgt = self.target(trgt, tkey)?;
                self.fixed_call(trgt, tkey, invkey, vec![value])
            }
            InstKind::StructuredAppendTuple {
                trgt,
                result_tuple_type,
                args,
                ttypes,
            } => {
                self.require_shapes(ttypes, kind, |t| t.as_unique_tuple().is_some())?;
                let args = self.arguments(args)?;
                let invkey = self.registry.request(Specialization::TupleAppend {
                    args: ttypes.clone(),
                    result: result_tuple_type.clone(),
                });
                let trgt = self.target(trgt, result_tuple_type)?;
                self.fixed_call(trgt, result_tuple_type, invkey, args)
            }
            InstKind::StructuredJoinRecord {
                trgt,
                result_record_type,
                args,
                ttypes,
            } => {
                self.require_shapes(ttypes, kind, |t| t.as_unique_record().is_some())?;
                let args = self.arguments(args)?;
                let invkey = self.registry.request(Specialization::RecordMerge {
                    args: ttypes.clone(),
                    result: result_record_type.clone(),
                });
                let trgt = self.target(trgt, result_record_type)?;
                self.fixed_call(trgt, result_record_type, invkey, args)
            }
            InstKind::PrefixNot { trgt, arg } => {
                let arg = self.argument(arg)?;
                OpKind::PrefixNot {
                    trgt: self.target(trgt, wk::BOOL)?,
                    arg,
                }
            }
            InstKind::LogicAction { trgt, opkind, args } => {
                let args = self.arguments(args)?;
                let trgt = self.target(trgt, wk::BOOL)?;
                match (args.len(), opkind) {
                    (0, _) => return Err(LowerError::malformed("logic action without operands")),
                    (1, _) => OpKind::DirectAssign {
                        trgt,
                        intotype: wk::BOOL.to_string(),
                        arg: args[0],
                        sguard: None,
                    },
                    (_, LogicOp::And) => OpKind::AllTrue { trgt, args },
                    (_, LogicOp::Or) => OpKind::SomeTrue { trgt, args },
                }
            }
            InstKind::IsTypeOf {
                trgt,
                chktype,
                arg,
                srclayouttype,
                srcflowtype,
                sguard,
            } => {
                let arg = self.argument(arg)?;
                let sguard = self.guard(sguard.as_ref())?;
                let trgt = self.target(trgt, wk::BOOL)?;
                self.type_test(trgt, chktype, arg, srclayouttype, srcflowtype, sguard)?
            }
            InstKind::RegisterAssign {
                trgt,
                src,
                layouttype,
                sguard,
            } => {
                let arg = self.argument(src)?;
                let sguard = self.guard(sguard.as_ref())?;
                OpKind::RegisterAssign {
                    trgt: self.target(trgt, layouttype)?,
                    arg,
                    oftype: layouttype.clone(),
                    sguard,
                }
            }
            InstKind::ReturnAssign { name, src, oftype } => {
                let arg = self.argument(src)?;
                OpKind::ReturnAssign {
                    trgt: self.target(name, oftype)?,
                    arg,
                    oftype: oftype.clone(),
                }
            }
            InstKind::VarLifetimeStart { name, rtype } => OpKind::VarLifetimeStart {
                homelocation: self.ctx.slot_for(name, rtype)?,
                oftype: rtype.clone(),
                name: name.clone(),
            },
            InstKind::VarLifetimeEnd { name } => OpKind::VarLifetimeEnd { name: name.clone() },
            InstKind::Phi { trgt, .. } => {
                return Err(LowerError::malformed(format!(
                    "phi for `{}` after the head of its block",
                    trgt.name
                )));
            }
        };

        Ok(Some((ssrc, op)))
    }

    pub(crate) fn ephemeral_entries(&self, epht: &str) -> Result<&'p [Type], LowerError> {
        self.ty(epht)?
            .as_unique_ephemeral()
            .map(|l| l.entries())
            .ok_or_else(|| MirError::shape(epht, "ephemeral list").into())
    }

    fn project_tuple(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        indices: &[usize],
        epht: &str,
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let entries = self.ephemeral_entries(epht)?;
        let trgt = self.target(trgt, epht)?;

        if let Some(tuple) = self.ty(argflowtype)?.as_unique_tuple() {
            let layout = self.ctx.layout(argflowtype)?;
            let mut idxs = Vec::with_capacity(indices.len());
            for (j, idx) in indices.iter().enumerate() {
                let ety = tuple.entries().get(*idx).ok_or_else(|| {
                    LowerError::malformed(format!("tuple `{argflowtype}` has no index {idx}"))
                })?;
                if entries.get(j).map(Type::type_id) != Some(ety.type_id()) {
                    break;
                }
                idxs.push((*idx, layout.at(*idx)?.offset, ety.type_id().to_string()));
            }
            if idxs.len() == indices.len() && idxs.len() == entries.len() {
                return Ok(OpKind::ProjectTuple {
                    trgt,
                    trgttype: epht.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    idxs,
                });
            }
        }

        let invkey = self.registry.request(Specialization::TupleProject {
            flow: argflowtype.to_string(),
            indices: indices.to_vec(),
            result: epht.to_string(),
        });
        Ok(self.virtual_call(trgt, epht, invkey, arglayouttype, vec![arg]))
    }

    fn project_record(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        properties: &[String],
        epht: &str,
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let entries = self.ephemeral_entries(epht)?;
        let trgt = self.target(trgt, epht)?;

        if let Some(record) = self.ty(argflowtype)?.as_unique_record() {
            let layout = self.ctx.layout(argflowtype)?;
            let mut props = Vec::with_capacity(properties.len());
            for (j, pname) in properties.iter().enumerate() {
                let entry = record.entry(pname).ok_or_else(|| {
                    LowerError::malformed(format!("record `{argflowtype}` has no property `{pname}`"))
                })?;
                if entries.get(j).map(Type::type_id) != Some(entry.ptype.type_id()) {
                    break;
                }
                props.push((
                    pname.clone(),
                    layout.named(pname)?.offset,
                    entry.ptype.type_id().to_string(),
                ));
            }
            if props.len() == properties.len() && props.len() == entries.len() {
                return Ok(OpKind::ProjectRecord {
                    trgt,
                    trgttype: epht.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    props,
                });
            }
        }

        let invkey = self.registry.request(Specialization::RecordProject {
            flow: argflowtype.to_string(),
            properties: properties.to_vec(),
            result: epht.to_string(),
        });
        Ok(self.virtual_call(trgt, epht, invkey, arglayouttype, vec![arg]))
    }

    /// Declared type of `field`, checked to belong to `entity`.
    pub(crate) fn field_type(&self, entity: &str, field: &str) -> Result<&'p TypeKey, LowerError> {
        let decl = self.program.graph.field(field)?;
        if decl.enclosing != entity {
            return Err(LowerError::malformed(format!(
                "field `{field}` does not belong to `{entity}`"
            )));
        }
        Ok(&decl.declared_type)
    }

    fn project_entity(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        fields: &[FieldKey],
        epht: &str,
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let entries = self.ephemeral_entries(epht)?;
        let trgt = self.target(trgt, epht)?;

        if self.ty(argflowtype)?.as_unique_entity().is_some() {
            let layout = self.ctx.layout(argflowtype)?;
            let mut direct = Vec::with_capacity(fields.len());
            for (j, f) in fields.iter().enumerate() {
                let fty = self.field_type(argflowtype, f)?;
                if entries.get(j).map(Type::type_id) != Some(fty.as_str()) {
                    break;
                }
                direct.push((f.clone(), layout.named(f)?.offset, fty.clone()));
            }
            if direct.len() == fields.len() && direct.len() == entries.len() {
                return Ok(OpKind::ProjectEntity {
                    trgt,
                    trgttype: epht.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    fields: direct,
                });
            }
        }

        let invkey = self.registry.request(Specialization::EntityProject {
            flow: argflowtype.to_string(),
            fields: fields.to_vec(),
            result: epht.to_string(),
        });
        Ok(self.virtual_call(trgt, epht, invkey, arglayouttype, vec![arg]))
    }

    fn update_values<K>(&mut self, updates: &[(K, MirArgument, TypeKey)]) -> Result<Vec<Argument>, LowerError> {
        updates.iter().map(|(_, v, _)| self.argument(v)).collect()
    }

    fn update_tuple(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        updates: &[(usize, MirArgument, TypeKey)],
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let vals = self.update_values(updates)?;
        let trgt = self.target(trgt, argflowtype)?;

        if let Some(tuple) = self.ty(argflowtype)?.as_unique_tuple() {
            let layout = self.ctx.layout(argflowtype)?;
            let mut direct = Vec::with_capacity(updates.len());
            for ((idx, _, ty), v) in updates.iter().zip(&vals) {
                let ety = tuple.entries().get(*idx).ok_or_else(|| {
                    LowerError::malformed(format!("tuple `{argflowtype}` has no index {idx}"))
                })?;
                if ety.type_id() != ty {
                    break;
                }
                direct.push((*idx, layout.at(*idx)?.offset, ty.clone(), *v));
            }
            if direct.len() == updates.len() {
                return Ok(OpKind::UpdateTuple {
                    trgt,
                    trgttype: argflowtype.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    updates: direct,
                });
            }
        }

        let invkey = self.registry.request(Specialization::TupleUpdate {
            flow: argflowtype.to_string(),
            updates: updates.iter().map(|(i, _, t)| (*i, t.clone())).collect(),
            result: argflowtype.to_string(),
        });
        let mut args = vec![arg];
        args.extend(vals);
        Ok(self.virtual_call(trgt, argflowtype, invkey, arglayouttype, args))
    }

    fn update_record(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        updates: &[(String, MirArgument, TypeKey)],
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let vals = self.update_values(updates)?;
        let trgt = self.target(trgt, argflowtype)?;

        if let Some(record) = self.ty(argflowtype)?.as_unique_record() {
            let layout = self.ctx.layout(argflowtype)?;
            let mut direct = Vec::with_capacity(updates.len());
            for ((pname, _, ty), v) in updates.iter().zip(&vals) {
                let entry = record.entry(pname).ok_or_else(|| {
                    LowerError::malformed(format!("record `{argflowtype}` has no property `{pname}`"))
                })?;
                if entry.ptype.type_id() != ty {
                    break;
                }
                direct.push((pname.clone(), layout.named(pname)?.offset, ty.clone(), *v));
            }
            if direct.len() == updates.len() {
                return Ok(OpKind::UpdateRecord {
                    trgt,
                    trgttype: argflowtype.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    updates: direct,
                });
            }
        }

        let invkey = self.registry.request(Specialization::RecordUpdate {
            flow: argflowtype.to_string(),
            updates: updates.iter().map(|(p, _, t)| (p.clone(), t.clone())).collect(),
            result: argflowtype.to_string(),
        });
        let mut args = vec![arg];
        args.extend(vals);
        Ok(self.virtual_call(trgt, argflowtype, invkey, arglayouttype, args))
    }

    /// True when rebuilding `entity` must go back through its constructor.
    pub(crate) fn has_invariants(&self, entity: &str) -> Result<bool, LowerError> {
        Ok(self
            .program
            .graph
            .entity(entity)?
            .as_object()
            .is_some_and(|o| o.hasconsinvariants || o.validatefunc.is_some()))
    }

    fn update_entity(
        &mut self,
        trgt: &Register,
        arg: &MirArgument,
        arglayouttype: &str,
        argflowtype: &str,
        updates: &[(FieldKey, MirArgument, TypeKey)],
    ) -> Result<OpKind, LowerError> {
        let arg = self.argument(arg)?;
        let vals = self.update_values(updates)?;
        let trgt = self.target(trgt, argflowtype)?;
        let typed: Vec<(FieldKey, TypeKey)> = updates.iter().map(|(f, _, t)| (f.clone(), t.clone())).collect();

        if self.ty(argflowtype)?.as_unique_entity().is_some() {
            if self.has_invariants(argflowtype)? {
                let invkey = self.registry.request(Specialization::EntityUpdateWithInvariantCheck {
                    entity: argflowtype.to_string(),
                    updates: typed,
                    result: argflowtype.to_string(),
                });
                let mut args = vec![arg];
                args.extend(vals);
                return Ok(self.fixed_call(trgt, argflowtype, invkey, args));
            }

            let layout = self.ctx.layout(argflowtype)?;
            let mut direct = Vec::with_capacity(updates.len());
            for ((f, _, ty), v) in updates.iter().zip(&vals) {
                if self.field_type(argflowtype, f)? != ty {
                    break;
                }
                direct.push((f.clone(), layout.named(f)?.offset, ty.clone(), *v));
            }
            if direct.len() == updates.len() {
                return Ok(OpKind::UpdateEntity {
                    trgt,
                    trgttype: argflowtype.to_string(),
                    arg,
                    arglayouttype: arglayouttype.to_string(),
                    argflowtype: argflowtype.to_string(),
                    updates: direct,
                });
            }
        }

        let invkey = self.registry.request(Specialization::EntityUpdate {
            flow: argflowtype.to_string(),
            updates: typed,
            result: argflowtype.to_string(),
        });
        let mut args = vec![arg];
        args.extend(vals);
        Ok(self.virtual_call(trgt, argflowtype, invkey, arglayouttype, args))
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_fixed(
        &mut self,
        ssrc: String,
        trgt: &Register,
        result_type: &str,
        mkey: &str,
        args: &[MirArgument],
        optmask: Option<&str>,
        sguard: Option<&MirStatementGuard>,
    ) -> Result<(String, OpKind), LowerError> {
        let decl = self.program.invoke(mkey)?;
        let argv = self.arguments(args)?;

        if decl.is_default_primitive() {
            let prim = primitives::resolve(mkey)
                .ok_or_else(|| LowerError::unimplemented(format!("primitive operator `{mkey}`")))?;
            if optmask.is_some() || sguard.is_some() {
                return Err(LowerError::malformed(format!(
                    "primitive operator `{mkey}` cannot be guarded"
                )));
            }

            let optext = primitives::operator_text(mkey);
            let name = &trgt.name;
            let out = self.target(trgt, result_type)?;
            return match (prim, argv.as_slice(), args) {
                (PrimitiveOperator::Identity(_), [a], [ma]) => Ok((
                    format!("{name} = {optext}{ma}"),
                    OpKind::DirectAssign {
                        trgt: out,
                        intotype: result_type.to_string(),
                        arg: *a,
                        sguard: None,
                    },
                )),
                (PrimitiveOperator::Negate(code), [a], [ma]) => Ok((
                    format!("{name} = {optext}{ma}"),
                    OpKind::Negate {
                        code,
                        trgt: out,
                        oftype: result_type.to_string(),
                        arg: *a,
                    },
                )),
                (PrimitiveOperator::Binary { op, numeric, swap }, [l, r], [ml, mr]) => {
                    let (larg, rarg) = if swap { (*r, *l) } else { (*l, *r) };
                    Ok((
                        format!("{name} = {ml} {optext} {mr}"),
                        OpKind::Binary {
                            code: op,
                            numeric,
                            trgt: out,
                            oftype: result_type.to_string(),
                            larg,
                            rarg,
                        },
                    ))
                }
                _ => Err(LowerError::malformed(format!(
                    "`{mkey}` called with {} arguments",
                    args.len()
                ))),
            };
        }

        let optmaskoffset = optmask.map(|m| self.ctx.mask_offset(m)).transpose()?;
        let sguard = self.guard(sguard)?;
        let out = self.target(trgt, result_type)?;
        if let Some(m) = optmask {
            self.ctx.release_mask(m);
        }

        Ok((
            ssrc,
            OpKind::InvokeFixedFunction {
                trgt: out,
                trgttype: result_type.to_string(),
                invkey: mkey.to_string(),
                args: argv,
                optmaskoffset,
                sguard,
            },
        ))
    }

    fn collection_kind(&self, tkey: &str) -> Result<CollectionKind, LowerError> {
        self.program
            .graph
            .entity(tkey)?
            .as_collection()
            .map(|c| c.kind)
            .ok_or_else(|| MirError::shape(tkey, "collection").into())
    }

    fn require_shapes(
        &self,
        ttypes: &[FlowLayout],
        kind: &InstKind,
        unique: impl Fn(&Type) -> bool,
    ) -> Result<(), LowerError> {
        for fl in ttypes {
            if !unique(self.ty(&fl.flow)?) {
                return Err(LowerError::unimplemented(format!(
                    "{} over `{}`",
                    kind.name(),
                    fl.flow
                )));
            }
        }
        Ok(())
    }

    fn type_test(
        &mut self,
        trgt: TargetVar,
        chktype: &str,
        arg: Argument,
        srclayouttype: &str,
        srcflowtype: &str,
        sguard: Option<StatementGuard>,
    ) -> Result<OpKind, LowerError> {
        let constant = |this: &mut Self, value: bool| -> Result<OpKind, LowerError> {
            let c = if value {
                ConstantValue::True
            } else {
                ConstantValue::False
            };
            Ok(OpKind::DirectAssign {
                trgt,
                intotype: wk::BOOL.to_string(),
                arg: this.ctx.constant_for(&c)?,
                sguard,
            })
        };

        if self.is_subtype(srcflowtype, chktype)? {
            return constant(self, true);
        }

        let arglayouttype = srclayouttype.to_string();
        match chktype {
            wk::NONE => {
                if !self.is_subtype(wk::NONE, srcflowtype)? {
                    return constant(self, false);
                }
                Ok(OpKind::IsNone {
                    trgt,
                    arg,
                    arglayouttype,
                    sguard,
                })
            }
            wk::NOTHING => {
                if !self.is_subtype(wk::NOTHING, srcflowtype)? {
                    return constant(self, false);
                }
                Ok(OpKind::IsNothing {
                    trgt,
                    arg,
                    arglayouttype,
                    sguard,
                })
            }
            wk::SOME => {
                if srcflowtype == wk::NONE {
                    return constant(self, false);
                }
                Ok(OpKind::IsSome {
                    trgt,
                    arg,
                    arglayouttype,
                    sguard,
                })
            }
            _ if self.ty(chktype)?.is_unique_concrete() => {
                if !self.is_subtype(chktype, srcflowtype)? {
                    return constant(self, false);
                }
                Ok(OpKind::TypeTagIs {
                    trgt,
                    oftype: chktype.to_string(),
                    arg,
                    arglayouttype,
                    sguard,
                })
            }
            _ => Ok(OpKind::TypeTagSubtypeOf {
                trgt,
                oftype: chktype.to_string(),
                arg,
                arglayouttype,
                sguard,
            }),
        }
    }
}

fn unsupported_collection(kind: CollectionKind, inst: &InstKind) -> LowerError {
    LowerError::unimplemented(format!("{} of a {}", inst.name(), kind.name()))
}
