#![forbid(unsafe_code)]

//! The lowered program handed to the virtual machine.
//!
//! Locations are byte offsets: `Stack` into the current frame, `Const` into the
//! program-wide constant pool. Jumps store signed deltas in instruction units
//! relative to the jump's own position; no absolute address appears anywhere.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_mir::{FieldKey, FunctionParameter, InvokeKey, SourceInfo, TypeKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum Argument {
    Stack(u32),
    Const(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetVar {
    pub offset: u32,
}

impl TargetVar {
    pub fn as_argument(self) -> Argument {
        Argument::Stack(self.offset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub poffset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Guard {
    /// `gmaskoffset` is `None` for the mask passed in by the caller.
    Mask { gmaskoffset: Option<u32>, gindex: u32 },
    Var { gvaroffset: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementGuard {
    pub guard: Guard,
    pub usedefault_on: bool,
    pub defaultvar: Option<Argument>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NumericKind {
    Int,
    Nat,
    BigInt,
    BigNat,
    Rational,
    Float,
    Decimal,
}

impl NumericKind {
    pub const ALL: [NumericKind; 7] = [
        NumericKind::Int,
        NumericKind::Nat,
        NumericKind::BigInt,
        NumericKind::BigNat,
        NumericKind::Rational,
        NumericKind::Float,
        NumericKind::Decimal,
    ];

    pub fn from_key(key: &str) -> Option<Self> {
        NumericKind::ALL.into_iter().find(|k| k.key() == key)
    }

    pub fn key(self) -> &'static str {
        use strata_mir::well_known as wk;

        match self {
            NumericKind::Int => wk::INT,
            NumericKind::Nat => wk::NAT,
            NumericKind::BigInt => wk::BIG_INT,
            NumericKind::BigNat => wk::BIG_NAT,
            NumericKind::Rational => wk::RATIONAL,
            NumericKind::Float => wk::FLOAT,
            NumericKind::Decimal => wk::DECIMAL,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, NumericKind::Nat | NumericKind::BigNat)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mult,
    Div,
    Eq,
    Neq,
    Lt,
    Le,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub sinfo: SourceInfo,
    /// Human readable rendering of the instruction this op came from.
    pub ssrc: String,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Op {
    pub fn new(sinfo: SourceInfo, ssrc: impl Into<String>, kind: OpKind) -> Self {
        Self {
            sinfo,
            ssrc: ssrc.into(),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Abort {
        msg: String,
    },
    Assert {
        arg: Argument,
        msg: String,
    },
    Debug {
        arg: Option<Argument>,
    },
    LoadUnintVariableValue {
        trgt: TargetVar,
        oftype: TypeKey,
    },
    StoreConstantMaskValue {
        gmaskoffset: u32,
        gindex: u32,
        flag: bool,
    },

    DirectAssign {
        trgt: TargetVar,
        intotype: TypeKey,
        arg: Argument,
        sguard: Option<StatementGuard>,
    },
    Box {
        trgt: TargetVar,
        intotype: TypeKey,
        arg: Argument,
        fromtype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    Extract {
        trgt: TargetVar,
        intotype: TypeKey,
        arg: Argument,
        fromtype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    LoadConst {
        trgt: TargetVar,
        arg: Argument,
        oftype: TypeKey,
    },

    TupleHasIndex {
        trgt: TargetVar,
        arg: Argument,
        arglayouttype: TypeKey,
        idx: usize,
    },
    RecordHasProperty {
        trgt: TargetVar,
        arg: Argument,
        arglayouttype: TypeKey,
        pname: String,
    },
    LoadTupleIndexDirect {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        slotoffset: u32,
        idx: usize,
    },
    LoadTupleIndexVirtual {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        idx: usize,
    },
    LoadRecordPropertyDirect {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        slotoffset: u32,
        pname: String,
    },
    LoadRecordPropertyVirtual {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        pname: String,
    },
    LoadEntityFieldDirect {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        slotoffset: u32,
        field: FieldKey,
    },
    LoadEntityFieldVirtual {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        field: FieldKey,
    },

    /// `(index, slot offset, element type)` per projected entry.
    ProjectTuple {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        idxs: Vec<(usize, u32, TypeKey)>,
    },
    ProjectRecord {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        props: Vec<(String, u32, TypeKey)>,
    },
    ProjectEntity {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        fields: Vec<(FieldKey, u32, TypeKey)>,
    },
    UpdateTuple {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(usize, u32, TypeKey, Argument)>,
    },
    UpdateRecord {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(String, u32, TypeKey, Argument)>,
    },
    UpdateEntity {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(FieldKey, u32, TypeKey, Argument)>,
    },

    LoadFromEphemeralList {
        trgt: TargetVar,
        trgttype: TypeKey,
        arg: Argument,
        argtype: TypeKey,
        slotoffset: u32,
        idx: usize,
    },
    MultiLoadFromEphemeralList {
        trgts: Vec<TargetVar>,
        trgttypes: Vec<TypeKey>,
        arg: Argument,
        argtype: TypeKey,
        slotoffsets: Vec<u32>,
        idxs: Vec<usize>,
    },

    InvokeFixedFunction {
        trgt: TargetVar,
        trgttype: TypeKey,
        invkey: InvokeKey,
        args: Vec<Argument>,
        optmaskoffset: Option<u32>,
        sguard: Option<StatementGuard>,
    },
    /// Resolved by the VM to `{invkey}@{runtime type of the receiver}`.
    InvokeVirtualFunction {
        trgt: TargetVar,
        trgttype: TypeKey,
        invkey: InvokeKey,
        rcvrlayouttype: TypeKey,
        args: Vec<Argument>,
        optmaskoffset: Option<u32>,
    },

    ConstructorTuple {
        trgt: TargetVar,
        oftype: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorRecord {
        trgt: TargetVar,
        oftype: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorEphemeralList {
        trgt: TargetVar,
        oftype: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorEntityDirect {
        trgt: TargetVar,
        oftype: TypeKey,
        args: Vec<Argument>,
    },

    PrefixNot {
        trgt: TargetVar,
        arg: Argument,
    },
    AllTrue {
        trgt: TargetVar,
        args: Vec<Argument>,
    },
    SomeTrue {
        trgt: TargetVar,
        args: Vec<Argument>,
    },

    IsNone {
        trgt: TargetVar,
        arg: Argument,
        arglayouttype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    IsSome {
        trgt: TargetVar,
        arg: Argument,
        arglayouttype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    IsNothing {
        trgt: TargetVar,
        arg: Argument,
        arglayouttype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    TypeTagIs {
        trgt: TargetVar,
        oftype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    TypeTagSubtypeOf {
        trgt: TargetVar,
        oftype: TypeKey,
        arg: Argument,
        arglayouttype: TypeKey,
        sguard: Option<StatementGuard>,
    },

    Negate {
        code: NumericKind,
        trgt: TargetVar,
        oftype: TypeKey,
        arg: Argument,
    },
    Binary {
        code: BinaryOp,
        numeric: NumericKind,
        trgt: TargetVar,
        oftype: TypeKey,
        larg: Argument,
        rarg: Argument,
    },

    Jump {
        offset: i64,
        label: String,
    },
    JumpCond {
        arg: Argument,
        toffset: i64,
        foffset: i64,
        tlabel: String,
        flabel: String,
    },
    JumpNone {
        arg: Argument,
        arglayouttype: TypeKey,
        noffset: i64,
        soffset: i64,
        nlabel: String,
        slabel: String,
    },

    RegisterAssign {
        trgt: TargetVar,
        arg: Argument,
        oftype: TypeKey,
        sguard: Option<StatementGuard>,
    },
    ReturnAssign {
        trgt: TargetVar,
        arg: Argument,
        oftype: TypeKey,
    },
    VarLifetimeStart {
        homelocation: TargetVar,
        oftype: TypeKey,
        name: String,
    },
    VarLifetimeEnd {
        name: String,
    },
    VarHomeLocationValueUpdate {
        homelocation: TargetVar,
        fromlocation: Argument,
        oftype: TypeKey,
    },
}

impl OpKind {
    /// `(target label, relative delta)` for every edge out of a jump op.
    pub fn jump_edges(&self) -> Vec<(&str, i64)> {
        match self {
            OpKind::Jump { offset, label } => vec![(label.as_str(), *offset)],
            OpKind::JumpCond {
                toffset,
                foffset,
                tlabel,
                flabel,
                ..
            } => vec![(tlabel.as_str(), *toffset), (flabel.as_str(), *foffset)],
            OpKind::JumpNone {
                noffset,
                soffset,
                nlabel,
                slabel,
                ..
            } => vec![(nlabel.as_str(), *noffset), (slabel.as_str(), *soffset)],
            _ => Vec::new(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpKind::Jump { .. } | OpKind::JumpCond { .. } | OpKind::JumpNone { .. } | OpKind::Abort { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyFunction {
    pub name: String,
    pub ikey: InvokeKey,
    pub src_file: String,
    pub sinfo_start: SourceInfo,
    pub sinfo_end: SourceInfo,
    pub recursive: bool,
    pub params: Vec<FunctionParameter>,
    pub paraminfo: Vec<ParameterInfo>,
    pub result_type: TypeKey,
    pub resultarg: Argument,
    pub scalarstackbytes: u32,
    pub masksize: u32,
    /// Mask bits the caller passes in.
    pub argmaskslots: u32,
    pub body: Vec<Op>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PCodeInfo {
    pub code: InvokeKey,
    pub ctypes: Vec<TypeKey>,
    /// Parameter positions of the captured arguments.
    pub cargs: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveFunction {
    pub name: String,
    pub ikey: InvokeKey,
    pub src_file: String,
    pub sinfo_start: SourceInfo,
    pub sinfo_end: SourceInfo,
    pub recursive: bool,
    pub params: Vec<FunctionParameter>,
    pub result_type: TypeKey,
    pub enclosing: Option<TypeKey>,
    pub implkey: String,
    pub binds: BTreeMap<String, TypeKey>,
    pub pcodes: BTreeMap<String, PCodeInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Function {
    Body(BodyFunction),
    Primitive(PrimitiveFunction),
}

impl Function {
    pub fn ikey(&self) -> &str {
        match self {
            Function::Body(b) => &b.ikey,
            Function::Primitive(p) => &p.ikey,
        }
    }

    pub fn as_body(&self) -> Option<&BodyFunction> {
        match self {
            Function::Body(b) => Some(b),
            Function::Primitive(_) => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveFunction> {
        match self {
            Function::Primitive(p) => Some(p),
            Function::Body(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstKind {
    Literal,
    Global,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstEntry {
    pub offset: u32,
    pub storage: TypeKey,
    /// Literal text, or the global key.
    pub value: String,
    pub kind: ConstKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstPoolLayout {
    pub size: u32,
    pub entries: Vec<ConstEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    pub functions: BTreeMap<InvokeKey, Function>,
    /// Canonical names of every generated specialization.
    pub specializations: BTreeSet<String>,
    pub const_pool: ConstPoolLayout,
}

impl Assembly {
    pub fn function(&self, ikey: &str) -> Option<&Function> {
        self.functions.get(ikey)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_serialize_flat_with_an_op_tag() {
        let op = Op::new(
            SourceInfo::default(),
            "x = 1i",
            OpKind::LoadConst {
                trgt: TargetVar { offset: 8 },
                arg: Argument::Const(24),
                oftype: "Int".into(),
            },
        );
        let v = serde_json::to_value(&op).expect("serialize");
        assert_eq!(v["op"], "load_const");
        assert_eq!(v["ssrc"], "x = 1i");
        assert_eq!(v["arg"]["kind"], "const");
        assert_eq!(v["arg"]["location"], 24);

        let back: Op = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, op);
    }

    #[test]
    fn jump_edges_cover_every_branch() {
        let op = OpKind::JumpCond {
            arg: Argument::Stack(0),
            toffset: 3,
            foffset: -2,
            tlabel: "left".into(),
            flabel: "right".into(),
        };
        assert_eq!(op.jump_edges(), vec![("left", 3), ("right", -2)]);
        assert!(op.is_terminator());
        assert!(OpKind::VarLifetimeEnd { name: "x".into() }.jump_edges().is_empty());
    }

    #[test]
    fn numeric_kinds_round_trip_through_keys() {
        for k in NumericKind::ALL {
            assert_eq!(NumericKind::from_key(k.key()), Some(k));
        }
        assert_eq!(NumericKind::from_key("String"), None);
    }
}
