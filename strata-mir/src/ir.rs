#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FieldKey, GlobalKey, InvokeKey, TypeKey};

pub type BlockLabel = String;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceInfo {
    pub line: u32,
    pub column: u32,
    pub pos: u32,
    pub span: u32,
}

/// A (possibly renamed) variable. `origname` is the user-visible variable it versions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub origname: String,
}

impl Register {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            origname: name.clone(),
            name,
        }
    }

    pub fn versioned(name: impl Into<String>, origname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origname: origname.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConstantValue {
    None,
    Nothing,
    True,
    False,
    Int(String),
    Nat(String),
    BigInt(String),
    BigNat(String),
    Rational(String),
    Float(String),
    Decimal(String),
    String(String),
    StringOf { value: String, oftype: TypeKey },
    DataString { value: String, oftype: TypeKey },
    TypedNumber { value: Box<ConstantValue>, oftype: TypeKey },
    Regex(String),
}

impl ConstantValue {
    /// Literal text and the type key the literal is stored as.
    pub fn literal_key(&self) -> (String, TypeKey) {
        use crate::well_known as wk;

        match self {
            ConstantValue::None => ("none".to_string(), wk::NONE.to_string()),
            ConstantValue::Nothing => ("nothing".to_string(), wk::NOTHING.to_string()),
            ConstantValue::True => ("true".to_string(), wk::BOOL.to_string()),
            ConstantValue::False => ("false".to_string(), wk::BOOL.to_string()),
            ConstantValue::Int(v) => (format!("{v}i"), wk::INT.to_string()),
            ConstantValue::Nat(v) => (format!("{v}n"), wk::NAT.to_string()),
            ConstantValue::BigInt(v) => (format!("{v}I"), wk::BIG_INT.to_string()),
            ConstantValue::BigNat(v) => (format!("{v}N"), wk::BIG_NAT.to_string()),
            ConstantValue::Rational(v) => (format!("{v}R"), wk::RATIONAL.to_string()),
            ConstantValue::Float(v) => (format!("{v}f"), wk::FLOAT.to_string()),
            ConstantValue::Decimal(v) => (format!("{v}d"), wk::DECIMAL.to_string()),
            ConstantValue::String(v) => (format!("{v:?}"), wk::STRING.to_string()),
            ConstantValue::StringOf { value, oftype } => (format!("{value:?}_{oftype}"), oftype.clone()),
            ConstantValue::DataString { value, oftype } => {
                (format!("{value:?}#{oftype}"), oftype.clone())
            }
            ConstantValue::TypedNumber { value, oftype } => {
                let (inner, _) = value.literal_key();
                (format!("{inner}_{oftype}"), oftype.clone())
            }
            ConstantValue::Regex(v) => (format!("/{v}/"), wk::REGEX.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Argument {
    Register(Register),
    Global(GlobalKey),
    Constant(ConstantValue),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Register(r) => f.write_str(&r.name),
            Argument::Global(g) => f.write_str(g),
            Argument::Constant(c) => f.write_str(&c.literal_key().0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Guard {
    Mask { gmask: String, gindex: u32 },
    Var { greg: Register },
}

/// Makes an instruction conditional on a guard; when the guard selects the default, the
/// target receives `defaultvar` instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementGuard {
    pub guard: Guard,
    pub usedefault_on: bool,
    #[serde(default)]
    pub defaultvar: Option<Argument>,
}

/// Flow/layout pair for a structural operand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLayout {
    pub flow: TypeKey,
    pub layout: TypeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralTarget {
    pub pos: usize,
    pub into: Register,
    pub oftype: TypeKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    #[serde(default)]
    pub sinfo: SourceInfo,
    pub kind: InstKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstKind {
    Debug {
        value: Option<Argument>,
    },
    AssertCheck {
        arg: Argument,
        info: String,
    },
    LoadUnintVariableValue {
        trgt: Register,
        oftype: TypeKey,
    },
    DeclareGuardFlagLocation {
        name: String,
        count: u32,
    },
    SetConstantGuardFlag {
        name: String,
        position: u32,
        flag: bool,
    },
    ConvertValue {
        trgt: Register,
        src: Argument,
        srctypelayout: TypeKey,
        srctypeflow: TypeKey,
        intotype: TypeKey,
        #[serde(default)]
        sguard: Option<StatementGuard>,
    },
    LoadConst {
        trgt: Register,
        src: Argument,
        consttype: TypeKey,
    },
    TupleHasIndex {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        idx: usize,
    },
    RecordHasProperty {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        pname: String,
    },
    LoadTupleIndex {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        idx: usize,
        resulttype: TypeKey,
    },
    LoadRecordProperty {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        pname: String,
        resulttype: TypeKey,
    },
    LoadField {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        field: FieldKey,
        resulttype: TypeKey,
    },
    TupleProjectToEphemeral {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        indices: Vec<usize>,
        epht: TypeKey,
    },
    RecordProjectToEphemeral {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        properties: Vec<String>,
        epht: TypeKey,
    },
    EntityProjectToEphemeral {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        fields: Vec<FieldKey>,
        epht: TypeKey,
    },
    TupleUpdate {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(usize, Argument, TypeKey)>,
    },
    RecordUpdate {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(String, Argument, TypeKey)>,
    },
    EntityUpdate {
        trgt: Register,
        arg: Argument,
        arglayouttype: TypeKey,
        argflowtype: TypeKey,
        updates: Vec<(FieldKey, Argument, TypeKey)>,
    },
    LoadFromEphemeralList {
        trgt: Register,
        arg: Argument,
        argtype: TypeKey,
        idx: usize,
        resulttype: TypeKey,
    },
    MultiLoadFromEphemeralList {
        trgts: Vec<EphemeralTarget>,
        arg: Argument,
        argtype: TypeKey,
    },
    InvokeFixedFunction {
        trgt: Register,
        result_type: TypeKey,
        mkey: InvokeKey,
        args: Vec<Argument>,
        #[serde(default)]
        optmask: Option<String>,
        #[serde(default)]
        sguard: Option<StatementGuard>,
    },
    InvokeVirtualFunction {
        trgt: Register,
        result_type: TypeKey,
        vresolve: InvokeKey,
        rcvrlayouttype: TypeKey,
        args: Vec<Argument>,
        #[serde(default)]
        optmask: Option<String>,
    },
    InvokeVirtualOperator {
        trgt: Register,
        result_type: TypeKey,
        vresolve: InvokeKey,
        args: Vec<Argument>,
    },
    ConstructorTuple {
        trgt: Register,
        result_tuple_type: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorRecord {
        trgt: Register,
        result_record_type: TypeKey,
        args: Vec<(String, Argument)>,
    },
    ConstructorEphemeralList {
        trgt: Register,
        result_ephemeral_list_type: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorEntityDirect {
        trgt: Register,
        entity_type: TypeKey,
        args: Vec<Argument>,
    },
    ConstructorPrimaryCollectionEmpty {
        trgt: Register,
        tkey: TypeKey,
    },
    ConstructorPrimaryCollectionSingletons {
        trgt: Register,
        tkey: TypeKey,
        args: Vec<(TypeKey, Argument)>,
    },
    ConstructorPrimaryCollectionOneElement {
        trgt: Register,
        tkey: TypeKey,
        arg: (TypeKey, Argument),
    },
    StructuredAppendTuple {
        trgt: Register,
        result_tuple_type: TypeKey,
        args: Vec<Argument>,
        ttypes: Vec<FlowLayout>,
    },
    StructuredJoinRecord {
        trgt: Register,
        result_record_type: TypeKey,
        args: Vec<Argument>,
        ttypes: Vec<FlowLayout>,
    },
    PrefixNot {
        trgt: Register,
        arg: Argument,
    },
    LogicAction {
        trgt: Register,
        opkind: LogicOp,
        args: Vec<Argument>,
    },
    IsTypeOf {
        trgt: Register,
        chktype: TypeKey,
        arg: Argument,
        srclayouttype: TypeKey,
        srcflowtype: TypeKey,
        #[serde(default)]
        sguard: Option<StatementGuard>,
    },
    RegisterAssign {
        trgt: Register,
        src: Argument,
        layouttype: TypeKey,
        #[serde(default)]
        sguard: Option<StatementGuard>,
    },
    ReturnAssign {
        name: Register,
        src: Argument,
        oftype: TypeKey,
    },
    VarLifetimeStart {
        name: String,
        rtype: TypeKey,
    },
    VarLifetimeEnd {
        name: String,
    },
    Phi {
        trgt: Register,
        layouttype: TypeKey,
        src: BTreeMap<BlockLabel, Argument>,
    },
}

impl InstKind {
    /// Short instruction name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            InstKind::Debug { .. } => "Debug",
            InstKind::AssertCheck { .. } => "AssertCheck",
            InstKind::LoadUnintVariableValue { .. } => "LoadUnintVariableValue",
            InstKind::DeclareGuardFlagLocation { .. } => "DeclareGuardFlagLocation",
            InstKind::SetConstantGuardFlag { .. } => "SetConstantGuardFlag",
            InstKind::ConvertValue { .. } => "ConvertValue",
            InstKind::LoadConst { .. } => "LoadConst",
            InstKind::TupleHasIndex { .. } => "TupleHasIndex",
            InstKind::RecordHasProperty { .. } => "RecordHasProperty",
            InstKind::LoadTupleIndex { .. } => "LoadTupleIndex",
            InstKind::LoadRecordProperty { .. } => "LoadRecordProperty",
            InstKind::LoadField { .. } => "LoadField",
            InstKind::TupleProjectToEphemeral { .. } => "TupleProjectToEphemeral",
            InstKind::RecordProjectToEphemeral { .. } => "RecordProjectToEphemeral",
            InstKind::EntityProjectToEphemeral { .. } => "EntityProjectToEphemeral",
            InstKind::TupleUpdate { .. } => "TupleUpdate",
            InstKind::RecordUpdate { .. } => "RecordUpdate",
            InstKind::EntityUpdate { .. } => "EntityUpdate",
            InstKind::LoadFromEphemeralList { .. } => "LoadFromEphemeralList",
            InstKind::MultiLoadFromEphemeralList { .. } => "MultiLoadFromEphemeralList",
            InstKind::InvokeFixedFunction { .. } => "InvokeFixedFunction",
            InstKind::InvokeVirtualFunction { .. } => "InvokeVirtualFunction",
            InstKind::InvokeVirtualOperator { .. } => "InvokeVirtualOperator",
            InstKind::ConstructorTuple { .. } => "ConstructorTuple",
            InstKind::ConstructorRecord { .. } => "ConstructorRecord",
            InstKind::ConstructorEphemeralList { .. } => "ConstructorEphemeralList",
            InstKind::ConstructorEntityDirect { .. } => "ConstructorEntityDirect",
            InstKind::ConstructorPrimaryCollectionEmpty { .. } => "ConstructorPrimaryCollectionEmpty",
            InstKind::ConstructorPrimaryCollectionSingletons { .. } => {
                "ConstructorPrimaryCollectionSingletons"
            }
            InstKind::ConstructorPrimaryCollectionOneElement { .. } => {
                "ConstructorPrimaryCollectionOneElement"
            }
            InstKind::StructuredAppendTuple { .. } => "StructuredAppendTuple",
            InstKind::StructuredJoinRecord { .. } => "StructuredJoinRecord",
            InstKind::PrefixNot { .. } => "PrefixNot",
            InstKind::LogicAction { .. } => "LogicAction",
            InstKind::IsTypeOf { .. } => "IsTypeOf",
            InstKind::RegisterAssign { .. } => "RegisterAssign",
            InstKind::ReturnAssign { .. } => "ReturnAssign",
            InstKind::VarLifetimeStart { .. } => "VarLifetimeStart",
            InstKind::VarLifetimeEnd { .. } => "VarLifetimeEnd",
            InstKind::Phi { .. } => "Phi",
        }
    }

    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<&Register> {
        match self {
            InstKind::Debug { .. }
            | InstKind::AssertCheck { .. }
            | InstKind::DeclareGuardFlagLocation { .. }
            | InstKind::SetConstantGuardFlag { .. }
            | InstKind::VarLifetimeStart { .. }
            | InstKind::VarLifetimeEnd { .. } => Vec::new(),

            InstKind::MultiLoadFromEphemeralList { trgts, .. } => {
                trgts.iter().map(|t| &t.into).collect()
            }
            InstKind::ReturnAssign { name, .. } => vec![name],

            InstKind::LoadUnintVariableValue { trgt, .. }
            | InstKind::ConvertValue { trgt, .. }
            | InstKind::LoadConst { trgt, .. }
            | InstKind::TupleHasIndex { trgt, .. }
            | InstKind::RecordHasProperty { trgt, .. }
            | InstKind::LoadTupleIndex { trgt, .. }
            | InstKind::LoadRecordProperty { trgt, .. }
            | InstKind::LoadField { trgt, .. }
            | InstKind::TupleProjectToEphemeral { trgt, .. }
            | InstKind::RecordProjectToEphemeral { trgt, .. }
            | InstKind::EntityProjectToEphemeral { trgt, .. }
            | InstKind::TupleUpdate { trgt, .. }
            | InstKind::RecordUpdate { trgt, .. }
            | InstKind::EntityUpdate { trgt, .. }
            | InstKind::LoadFromEphemeralList { trgt, .. }
            | InstKind::InvokeFixedFunction { trgt, .. }
            | InstKind::InvokeVirtualFunction { trgt, .. }
            | InstKind::InvokeVirtualOperator { trgt, .. }
            | InstKind::ConstructorTuple { trgt, .. }
            | InstKind::ConstructorRecord { trgt, .. }
            | InstKind::ConstructorEphemeralList { trgt, .. }
            | InstKind::ConstructorEntityDirect { trgt, .. }
            | InstKind::ConstructorPrimaryCollectionEmpty { trgt, .. }
            | InstKind::ConstructorPrimaryCollectionSingletons { trgt, .. }
            | InstKind::ConstructorPrimaryCollectionOneElement { trgt, .. }
            | InstKind::StructuredAppendTuple { trgt, .. }
            | InstKind::StructuredJoinRecord { trgt, .. }
            | InstKind::PrefixNot { trgt, .. }
            | InstKind::LogicAction { trgt, .. }
            | InstKind::IsTypeOf { trgt, .. }
            | InstKind::RegisterAssign { trgt, .. }
            | InstKind::Phi { trgt, .. } => vec![trgt],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminator {
    #[serde(default)]
    pub sinfo: SourceInfo,
    pub kind: TerminatorKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TerminatorKind {
    Jump {
        trgtblock: BlockLabel,
    },
    JumpCond {
        arg: Argument,
        trueblock: BlockLabel,
        falseblock: BlockLabel,
    },
    JumpNone {
        arg: Argument,
        arglayouttype: TypeKey,
        noneblock: BlockLabel,
        someblock: BlockLabel,
    },
    Abort {
        info: String,
    },
}

impl TerminatorKind {
    pub fn successors(&self) -> Vec<&BlockLabel> {
        match self {
            TerminatorKind::Jump { trgtblock } => vec![trgtblock],
            TerminatorKind::JumpCond {
                trueblock,
                falseblock,
                ..
            } => vec![trueblock, falseblock],
            TerminatorKind::JumpNone {
                noneblock,
                someblock,
                ..
            } => vec![noneblock, someblock],
            TerminatorKind::Abort { .. } => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: BlockLabel,
    pub insts: Vec<Inst>,
    /// `None` only for the `exit` block.
    #[serde(default)]
    pub term: Option<Terminator>,
}

impl BasicBlock {
    pub fn successors(&self) -> Vec<&BlockLabel> {
        self.term
            .as_ref()
            .map(|t| t.kind.successors())
            .unwrap_or_default()
    }

    /// Leading phi instructions.
    pub fn phis(&self) -> impl Iterator<Item = &Inst> {
        self.insts
            .iter()
            .take_while(|i| matches!(i.kind, InstKind::Phi { .. }))
    }

    /// Instructions after the leading phis.
    pub fn body(&self) -> &[Inst] {
        let n = self.phis().count();
        &self.insts[n..]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub blocks: BTreeMap<BlockLabel, BasicBlock>,
}

impl Body {
    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.get(label)
    }
}
