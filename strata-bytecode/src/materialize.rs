#![forbid(unsafe_code)]

//! Bodies for queued specializations.
//!
//! Virtual families get one `{name}@{shape}` function per concrete shape that can reach
//! the call site; everything else gets exactly one function named `{name}`.

use std::collections::BTreeMap;
use std::fmt;

use strata_mir::{
    well_known as wk, FieldKey, FlowLayout, FunctionParameter, MirError, SourceInfo, TypeKey,
    TypeOption,
};
use tracing::debug;

use crate::bytecode::{Argument, BodyFunction, Function, Op, OpKind, ParameterInfo, PrimitiveFunction, TargetVar};
use crate::linearize::{pack, BlockExit, LinearBlock};
use crate::lower::Lowerer;
use crate::specialize::Specialization;
use crate::LowerError;

const GENERATED_SRC: &str = "<generated>";

/// One addressed member of a tuple, record or entity.
#[derive(Clone, Copy, Debug)]
enum Member<'a> {
    Index(usize),
    Property(&'a str),
    Field(&'a str),
}

impl fmt::Display for Member<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Index(i) => write!(f, "[{i}]"),
            Member::Property(p) => write!(f, ".{p}"),
            Member::Field(k) => write!(f, ".{k}"),
        }
    }
}

fn generated(ssrc: impl Into<String>, kind: OpKind) -> Op {
    Op::new(SourceInfo::default(), ssrc, kind)
}

fn param(name: impl Into<String>, ptype: &str) -> FunctionParameter {
    FunctionParameter {
        name: name.into(),
        ptype: ptype.to_string(),
    }
}

/// `arg` for the receiver, then `arg_0..` for the values it is combined with.
fn receiver_params(receiver: &str, rest: &[&str]) -> Vec<FunctionParameter> {
    let mut params = vec![param("arg", receiver)];
    params.extend(rest.iter().enumerate().map(|(n, t)| param(format!("arg_{n}"), t)));
    params
}

fn split_receiver(args: &[Argument]) -> Result<(Argument, &[Argument]), LowerError> {
    args.split_first()
        .map(|(a, rest)| (*a, rest))
        .ok_or_else(|| LowerError::malformed("generated function without a receiver"))
}

impl<'p> Lowerer<'p> {
    pub(crate) fn materialize(&mut self, name: &str, spec: &Specialization) -> Result<Vec<Function>, LowerError> {
        let functions = match spec {
            Specialization::TupleProject { flow, indices, result } => {
                let members: Vec<Member> = indices.iter().map(|i| Member::Index(*i)).collect();
                self.each_shape(name, flow, &members, |this, fname, shape| {
                    this.project_instance(fname, shape, &members, result)
                })?
            }
            Specialization::RecordProject {
                flow,
                properties,
                result,
            } => {
                let members: Vec<Member> = properties.iter().map(|p| Member::Property(p.as_str())).collect();
                self.each_shape(name, flow, &members, |this, fname, shape| {
                    this.project_instance(fname, shape, &members, result)
                })?
            }
            Specialization::EntityProject { flow, fields, result } => {
                let members: Vec<Member> = fields.iter().map(|f| Member::Field(f.as_str())).collect();
                self.each_shape(name, flow, &members, |this, fname, shape| {
                    this.project_instance(fname, shape, &members, result)
                })?
            }
            Specialization::TupleUpdate { flow, updates, result } => {
                let updates: Vec<(Member, &str)> = updates
                    .iter()
                    .map(|(i, t)| (Member::Index(*i), t.as_str()))
                    .collect();
                self.updates_per_shape(name, flow, &updates, result)?
            }
            Specialization::RecordUpdate { flow, updates, result } => {
                let updates: Vec<(Member, &str)> = updates
                    .iter()
                    .map(|(p, t)| (Member::Property(p.as_str()), t.as_str()))
                    .collect();
                self.updates_per_shape(name, flow, &updates, result)?
            }
            Specialization::EntityUpdate { flow, updates, result } => {
                let updates: Vec<(Member, &str)> = updates
                    .iter()
                    .map(|(f, t)| (Member::Field(f.as_str()), t.as_str()))
                    .collect();
                self.updates_per_shape(name, flow, &updates, result)?
            }
            Specialization::EntityUpdateWithInvariantCheck {
                entity,
                updates,
                result,
            } => vec![self.invariant_update(name, entity, updates, result)?],
            Specialization::ListEmpty { result } => {
                vec![self.collection_cons(name, result, "s_list_build_empty", Vec::new())?]
            }
            Specialization::MapEmpty { result } => {
                vec![self.collection_cons(name, result, "s_map_build_empty", Vec::new())?]
            }
            Specialization::ListSingletons { argc, result } => {
                let elem = self.collection_binding(result, "T")?;
                let params = (0..*argc).map(|i| param(format!("arg{i}"), elem)).collect();
                vec![self.collection_cons(name, result, "s_list_build_k", params)?]
            }
            Specialization::MapSingleton { argtuple, result } => {
                let params = vec![param("arg0", argtuple)];
                vec![self.collection_cons(name, result, "s_map_build_1", params)?]
            }
            Specialization::TupleAppend { args, result } => vec![self.append_tuples(name, args, result)?],
            Specialization::RecordMerge { args, result } => vec![self.merge_records(name, args, result)?],
        };

        debug!(%name, functions = functions.len(), "materialized specialization");
        Ok(functions)
    }

    fn each_shape<F>(
        &mut self,
        name: &str,
        flow: &str,
        members: &[Member<'_>],
        mut instance: F,
    ) -> Result<Vec<Function>, LowerError>
    where
        F: FnMut(&mut Self, String, &'p str) -> Result<Function, LowerError>,
    {
        let shapes = self.shapes(flow, members)?;
        let mut out = Vec::with_capacity(shapes.len());
        for shape in shapes {
            let fname = format!("{name}@{shape}");
            let f = instance(self, fname.clone(), shape)
                .map_err(|e| LowerError::in_specialization(fname, e))?;
            out.push(f);
        }
        Ok(out)
    }

    /// Concrete shapes below `flow` that carry every member in `members`.
    ///
    /// Every such shape in the graph gets a body, so each must convert its members into
    /// the requested result types. A flow whose shapes disagree (say `Tuple` projected to
    /// `(|Int|)` while `[Bool, Int]` exists) is ill-typed MIR; the failing shape is named
    /// in the error.
    fn shapes(&self, flow: &str, members: &[Member<'_>]) -> Result<Vec<&'p str>, LowerError> {
        let program = self.program;
        let mut out = Vec::new();

        for (key, ty) in &program.graph.types {
            let fits = match ty.unique_option() {
                Some(TypeOption::Tuple(t)) => members
                    .iter()
                    .all(|m| matches!(m, Member::Index(i) if *i < t.entries().len())),
                Some(TypeOption::Record(r)) => members
                    .iter()
                    .all(|m| matches!(m, Member::Property(p) if r.entry(p).is_some())),
                Some(TypeOption::Entity(_)) => members.iter().all(|m| {
                    matches!(m, Member::Field(f)
                        if program.graph.fields.get(*f).is_some_and(|d| d.enclosing == *key))
                }),
                _ => false,
            };
            if fits && self.is_subtype(key, flow)? {
                out.push(key.as_str());
            }
        }

        Ok(out)
    }

    /// Slot offset and declared type of `member` inside `shape`.
    fn member_slot(&self, shape: &str, member: Member<'_>) -> Result<(u32, &'p str), LowerError> {
        let layout = self.ctx.layout(shape)?;
        let missing = || LowerError::malformed(format!("`{shape}` has no member {member}"));

        match member {
            Member::Index(idx) => {
                let ety = self
                    .ty(shape)?
                    .as_unique_tuple()
                    .and_then(|t| t.entries().get(idx))
                    .ok_or_else(missing)?;
                Ok((layout.at(idx)?.offset, ety.type_id()))
            }
            Member::Property(p) => {
                let entry = self
                    .ty(shape)?
                    .as_unique_record()
                    .and_then(|r| r.entry(p))
                    .ok_or_else(missing)?;
                Ok((layout.named(p)?.offset, entry.ptype.type_id()))
            }
            Member::Field(f) => {
                let fty = self.field_type(shape, f)?;
                Ok((layout.named(f)?.offset, fty.as_str()))
            }
        }
    }

    fn load_member(
        &mut self,
        ops: &mut Vec<Op>,
        arg: Argument,
        shape: &str,
        member: Member<'_>,
    ) -> Result<(Argument, &'p str), LowerError> {
        let (slotoffset, ety) = self.member_slot(shape, member)?;
        let (trgt, loaded) = self.ctx.scratch(ety)?;
        let trgttype = ety.to_string();
        let arglayouttype = shape.to_string();

        let kind = match member {
            Member::Index(idx) => OpKind::LoadTupleIndexDirect {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                slotoffset,
                idx,
            },
            Member::Property(p) => OpKind::LoadRecordPropertyDirect {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                slotoffset,
                pname: p.to_string(),
            },
            Member::Field(f) => OpKind::LoadEntityFieldDirect {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                slotoffset,
                field: f.to_string(),
            },
        };
        ops.push(generated(format!("load {member}"), kind));
        Ok((loaded, ety))
    }

    /// `arg` as an `into` value, through a scratch slot when the representation differs.
    fn coerced(&mut self, ops: &mut Vec<Op>, arg: Argument, from: &str, into: &str) -> Result<Argument, LowerError> {
        if from == into {
            return Ok(arg);
        }
        let (trgt, out) = self.ctx.scratch(into)?;
        ops.push(generated(
            format!("coerce {from} -> {into}"),
            self.coerce(trgt, arg, from, into, None)?,
        ));
        Ok(out)
    }

    fn generated_body<F>(
        &mut self,
        ikey: String,
        params: Vec<FunctionParameter>,
        result_type: &str,
        build: F,
    ) -> Result<Function, LowerError>
    where
        F: FnOnce(&mut Self, &[Argument], TargetVar) -> Result<Vec<Op>, LowerError>,
    {
        self.ctx.begin_function();

        let mut paraminfo = Vec::with_capacity(params.len());
        let mut args = Vec::with_capacity(params.len());
        for p in &params {
            let slot = self.ctx.slot_for(&p.name, &p.ptype)?;
            paraminfo.push(ParameterInfo { poffset: slot.offset });
            args.push(slot.as_argument());
        }
        let ret = self.ctx.slot_for(wk::RETURN_SLOT, result_type)?;

        let ops = build(self, &args, ret)?;
        let linear = pack(vec![
            LinearBlock {
                label: wk::ENTRY_BLOCK.to_string(),
                ops,
                exit: BlockExit::Jump {
                    sinfo: SourceInfo::default(),
                    ssrc: format!("jump {}", wk::EXIT_BLOCK),
                    label: wk::EXIT_BLOCK.to_string(),
                },
            },
            LinearBlock {
                label: wk::EXIT_BLOCK.to_string(),
                ops: Vec::new(),
                exit: BlockExit::Exit,
            },
        ])?;

        debug!(function = %ikey, frame = self.ctx.frame_size(), ops = linear.ops.len(), "generated function");
        Ok(Function::Body(BodyFunction {
            name: ikey.clone(),
            ikey,
            src_file: GENERATED_SRC.to_string(),
            sinfo_start: SourceInfo::default(),
            sinfo_end: SourceInfo::default(),
            recursive: false,
            params,
            paraminfo,
            result_type: result_type.to_string(),
            resultarg: ret.as_argument(),
            scalarstackbytes: self.ctx.frame_size(),
            masksize: self.ctx.mask_size(),
            argmaskslots: 0,
            body: linear.ops,
        }))
    }

    fn project_instance(
        &mut self,
        fname: String,
        shape: &str,
        members: &[Member<'_>],
        result: &str,
    ) -> Result<Function, LowerError> {
        let entries = self.ephemeral_entries(result)?;
        if entries.len() != members.len() {
            return Err(LowerError::malformed(format!(
                "projection of {} members into `{result}`",
                members.len()
            )));
        }

        self.generated_body(fname, vec![param("arg", shape)], result, |this, args, ret| {
            let (arg, _) = split_receiver(args)?;
            let mut ops = Vec::new();
            let mut vals = Vec::with_capacity(members.len());
            for (m, want) in members.iter().zip(entries) {
                let (loaded, ety) = this.load_member(&mut ops, arg, shape, *m)?;
                vals.push(this.coerced(&mut ops, loaded, ety, want.type_id())?);
            }
            ops.push(generated(
                format!("{} = ({result})", wk::RETURN_SLOT),
                OpKind::ConstructorEphemeralList {
                    trgt: ret,
                    oftype: result.to_string(),
                    args: vals,
                },
            ));
            Ok(ops)
        })
    }

    fn updates_per_shape(
        &mut self,
        name: &str,
        flow: &str,
        updates: &[(Member<'_>, &str)],
        result: &str,
    ) -> Result<Vec<Function>, LowerError> {
        let members: Vec<Member> = updates.iter().map(|(m, _)| *m).collect();
        self.each_shape(name, flow, &members, |this, fname, shape| {
            this.update_instance(fname, shape, updates, result)
        })
    }

    fn update_instance(
        &mut self,
        fname: String,
        shape: &'p str,
        updates: &[(Member<'_>, &str)],
        result: &str,
    ) -> Result<Function, LowerError> {
        let types: Vec<&str> = updates.iter().map(|(_, t)| *t).collect();
        let params = receiver_params(shape, &types);
        let checked = self.ty(shape)?.as_unique_entity().is_some() && self.has_invariants(shape)?;

        self.generated_body(fname, params, result, |this, args, ret| {
            let (arg, vals) = split_receiver(args)?;
            let mut ops = Vec::new();
            let (out, outarg) = this.ctx.scratch(shape)?;

            if checked {
                let mut fields = Vec::with_capacity(updates.len());
                for (m, t) in updates {
                    let Member::Field(f) = m else {
                        return Err(MirError::shape(shape, "updated through its fields").into());
                    };
                    fields.push((f.to_string(), t.to_string()));
                }
                let invkey = this.registry.request(Specialization::EntityUpdateWithInvariantCheck {
                    entity: shape.to_string(),
                    updates: fields,
                    result: shape.to_string(),
                });
                let mut callargs = vec![arg];
                callargs.extend_from_slice(vals);
                ops.push(generated(
                    format!("update {shape}"),
                    this.fixed_call(out, shape, invkey, callargs),
                ));
            } else {
                let mut slots = Vec::with_capacity(updates.len());
                for ((m, t), v) in updates.iter().zip(vals) {
                    let (offset, mty) = this.member_slot(shape, *m)?;
                    let value = this.coerced(&mut ops, *v, t, mty)?;
                    slots.push((*m, offset, mty.to_string(), value));
                }
                ops.push(generated(format!("update {shape}"), update_op(out, shape, arg, slots)?));
            }

            ops.push(generated(
                format!("{} = {shape}", wk::RETURN_SLOT),
                this.coerce(ret, outarg, shape, result, None)?,
            ));
            Ok(ops)
        })
    }

    fn invariant_update(
        &mut self,
        name: &str,
        entity: &str,
        updates: &[(FieldKey, TypeKey)],
        result: &str,
    ) -> Result<Function, LowerError> {
        let obj = self
            .program
            .graph
            .entity(entity)?
            .as_object()
            .ok_or_else(|| MirError::shape(entity, "object entity"))?;
        let types: Vec<&str> = updates.iter().map(|(_, t)| t.as_str()).collect();
        let params = receiver_params(entity, &types);

        self.generated_body(name.to_string(), params, result, |this, args, ret| {
            let (arg, vals) = split_receiver(args)?;
            let mut ops = Vec::new();
            let mut consargs = Vec::with_capacity(obj.consfuncfields.len());

            for cf in &obj.consfuncfields {
                let fty = this.field_type(entity, &cf.cfkey)?;
                let updated = updates
                    .iter()
                    .position(|(f, _)| *f == cf.cfkey)
                    .and_then(|n| Some((vals.get(n)?, &updates.get(n)?.1)));
                let value = match updated {
                    Some((v, t)) => this.coerced(&mut ops, *v, t, fty)?,
                    None => this.load_member(&mut ops, arg, entity, Member::Field(cf.cfkey.as_str()))?.0,
                };
                consargs.push(value);
            }

            ops.push(generated(
                format!("{} = {}", wk::RETURN_SLOT, obj.consfunc),
                this.fixed_call(ret, result, obj.consfunc.clone(), consargs),
            ));
            Ok(ops)
        })
    }

    fn collection_binding(&self, tkey: &str, var: &str) -> Result<&'p TypeKey, LowerError> {
        self.program
            .graph
            .entity(tkey)?
            .as_collection()
            .and_then(|c| c.binds.get(var))
            .ok_or_else(|| LowerError::malformed(format!("collection `{tkey}` does not bind `{var}`")))
    }

    fn collection_cons(
        &self,
        name: &str,
        result: &str,
        implkey: &str,
        params: Vec<FunctionParameter>,
    ) -> Result<Function, LowerError> {
        let coll = self
            .program
            .graph
            .entity(result)?
            .as_collection()
            .ok_or_else(|| MirError::shape(result, "collection"))?;

        Ok(Function::Primitive(PrimitiveFunction {
            name: name.to_string(),
            ikey: name.to_string(),
            src_file: GENERATED_SRC.to_string(),
            sinfo_start: SourceInfo::default(),
            sinfo_end: SourceInfo::default(),
            recursive: false,
            params,
            result_type: result.to_string(),
            enclosing: Some(result.to_string()),
            implkey: implkey.to_string(),
            binds: coll.binds.clone(),
            pcodes: BTreeMap::new(),
        }))
    }

    /// Operands arrive in their layout representation.
    fn operand_params(args: &[FlowLayout]) -> Vec<FunctionParameter> {
        args.iter()
            .enumerate()
            .map(|(i, fl)| param(format!("arg{i}"), &fl.layout))
            .collect()
    }

    fn append_tuples(&mut self, name: &str, args: &[FlowLayout], result: &str) -> Result<Function, LowerError> {
        let rtuple = self
            .ty(result)?
            .as_unique_tuple()
            .ok_or_else(|| MirError::shape(result, "tuple"))?;

        self.generated_body(name.to_string(), Self::operand_params(args), result, |this, pargs, ret| {
            let mut ops = Vec::new();
            let mut elems = Vec::new();
            for (fl, a) in args.iter().zip(pargs) {
                let v = this.coerced(&mut ops, *a, &fl.layout, &fl.flow)?;
                let width = this
                    .ty(&fl.flow)?
                    .as_unique_tuple()
                    .map(|t| t.entries().len())
                    .ok_or_else(|| MirError::shape(fl.flow.clone(), "tuple"))?;
                for idx in 0..width {
                    elems.push(this.load_member(&mut ops, v, &fl.flow, Member::Index(idx))?);
                }
            }

            if elems.len() != rtuple.entries().len() {
                return Err(LowerError::malformed(format!(
                    "appending {} entries into `{result}`",
                    elems.len()
                )));
            }
            let mut vals = Vec::with_capacity(elems.len());
            for ((v, ety), want) in elems.into_iter().zip(rtuple.entries()) {
                vals.push(this.coerced(&mut ops, v, ety, want.type_id())?);
            }

            ops.push(generated(
                format!("{} = {result}", wk::RETURN_SLOT),
                OpKind::ConstructorTuple {
                    trgt: ret,
                    oftype: result.to_string(),
                    args: vals,
                },
            ));
            Ok(ops)
        })
    }

    fn merge_records(&mut self, name: &str, args: &[FlowLayout], result: &str) -> Result<Function, LowerError> {
        let rrecord = self
            .ty(result)?
            .as_unique_record()
            .ok_or_else(|| MirError::shape(result, "record"))?;

        self.generated_body(name.to_string(), Self::operand_params(args), result, |this, pargs, ret| {
            let mut ops = Vec::new();
            let mut operands = Vec::with_capacity(args.len());
            for (fl, a) in args.iter().zip(pargs) {
                let v = this.coerced(&mut ops, *a, &fl.layout, &fl.flow)?;
                let record = this
                    .ty(&fl.flow)?
                    .as_unique_record()
                    .ok_or_else(|| MirError::shape(fl.flow.clone(), "record"))?;
                operands.push((v, fl.flow.as_str(), record));
            }

            let mut vals = Vec::with_capacity(rrecord.entries().len());
            for entry in rrecord.entries() {
                // Later operands override earlier ones.
                let (v, flow, _) = operands
                    .iter()
                    .rev()
                    .find(|(_, _, r)| r.entry(&entry.pname).is_some())
                    .ok_or_else(|| {
                        LowerError::malformed(format!("no operand supplies `{}` of `{result}`", entry.pname))
                    })?;
                let (loaded, ety) = this.load_member(&mut ops, *v, flow, Member::Property(&entry.pname))?;
                vals.push(this.coerced(&mut ops, loaded, ety, entry.ptype.type_id())?);
            }

            ops.push(generated(
                format!("{} = {result}", wk::RETURN_SLOT),
                OpKind::ConstructorRecord {
                    trgt: ret,
                    oftype: result.to_string(),
                    args: vals,
                },
            ));
            Ok(ops)
        })
    }
}

fn update_op(
    trgt: TargetVar,
    shape: &str,
    arg: Argument,
    slots: Vec<(Member<'_>, u32, TypeKey, Argument)>,
) -> Result<OpKind, LowerError> {
    let mismatch = || LowerError::malformed(format!("mixed member kinds in an update of `{shape}`"));
    let trgttype = shape.to_string();
    let arglayouttype = shape.to_string();
    let argflowtype = shape.to_string();

    match slots.first().map(|s| s.0) {
        Some(Member::Property(_)) => {
            let mut updates = Vec::with_capacity(slots.len());
            for (m, off, ty, v) in slots {
                let Member::Property(p) = m else {
                    return Err(mismatch());
                };
                updates.push((p.to_string(), off, ty, v));
            }
            Ok(OpKind::UpdateRecord {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            })
        }
        Some(Member::Field(_)) => {
            let mut updates = Vec::with_capacity(slots.len());
            for (m, off, ty, v) in slots {
                let Member::Field(f) = m else {
                    return Err(mismatch());
                };
                updates.push((f.to_string(), off, ty, v));
            }
            Ok(OpKind::UpdateEntity {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            })
        }
        Some(Member::Index(_)) | None => {
            let mut updates = Vec::with_capacity(slots.len());
            for (m, off, ty, v) in slots {
                let Member::Index(i) = m else {
                    return Err(mismatch());
                };
                updates.push((i, off, ty, v));
            }
            Ok(OpKind::UpdateTuple {
                trgt,
                trgttype,
                arg,
                arglayouttype,
                argflowtype,
                updates,
            })
        }
    }
}
