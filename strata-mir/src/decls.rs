#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Body, SourceInfo, TypeKey};

pub type FieldKey = String;
pub type InvokeKey = String;
pub type GlobalKey = String;

/// Parts shared by every nominal declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclHeader {
    pub tkey: TypeKey,
    pub ns: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub terms: BTreeMap<String, TypeKey>,
    #[serde(default)]
    pub provides: Vec<TypeKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptDecl {
    #[serde(flatten)]
    pub header: DeclHeader,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDecl {
    #[serde(flatten)]
    pub header: DeclHeader,
    pub kind: EntityKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum EntityKind {
    Object(ObjectEntity),
    Constructable(ConstructableEntity),
    Enum(EnumEntity),
    Internal(InternalEntity),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsField {
    pub cfkey: FieldKey,
    #[serde(default)]
    pub isoptional: bool,
}

/// User object entity with named fields and a constructor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntity {
    pub fields: Vec<FieldKey>,
    pub consfunc: InvokeKey,
    pub consfuncfields: Vec<ConsField>,
    #[serde(default)]
    pub validatefunc: Option<InvokeKey>,
    #[serde(default)]
    pub hasconsinvariants: bool,
}

/// Entity constructed from (and validated against) a single base value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructableEntity {
    pub valuetype: TypeKey,
    #[serde(default)]
    pub validatefunc: Option<InvokeKey>,
    #[serde(default)]
    pub usingcons: Option<InvokeKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumEntity {
    pub enums: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "internal", rename_all = "snake_case")]
pub enum InternalEntity {
    Primitive,
    StringOf { validator: TypeKey },
    DataString { fromtype: TypeKey, accepts: InvokeKey },
    DataBuffer { fromtype: TypeKey, accepts: InvokeKey },
    Constructable { fromtype: TypeKey },
    Havoc,
    Collection(PrimitiveCollection),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    List,
    Stack,
    Queue,
    Set,
    Map,
}

impl CollectionKind {
    pub fn name(self) -> &'static str {
        match self {
            CollectionKind::List => "List",
            CollectionKind::Stack => "Stack",
            CollectionKind::Queue => "Queue",
            CollectionKind::Set => "Set",
            CollectionKind::Map => "Map",
        }
    }
}

/// Parametric collection. `T` is bound for the sequence kinds, `K` and `V` for maps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveCollection {
    pub kind: CollectionKind,
    pub binds: BTreeMap<String, TypeKey>,
}

impl PrimitiveCollection {
    pub fn elem_type(&self) -> Option<&TypeKey> {
        self.binds.get("T")
    }

    pub fn key_type(&self) -> Option<&TypeKey> {
        self.binds.get("K")
    }

    pub fn value_type(&self) -> Option<&TypeKey> {
        self.binds.get("V")
    }
}

impl EntityDecl {
    pub fn as_object(&self) -> Option<&ObjectEntity> {
        match &self.kind {
            EntityKind::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&PrimitiveCollection> {
        match &self.kind {
            EntityKind::Internal(InternalEntity::Collection(c)) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub enclosing: TypeKey,
    pub fkey: FieldKey,
    pub fname: String,
    #[serde(default)]
    pub is_optional: bool,
    pub declared_type: TypeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    pub ptype: TypeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PCodeArg {
    pub cname: String,
    pub ctype: TypeKey,
}

/// A function-valued argument captured by a primitive invoke.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PCode {
    pub code: InvokeKey,
    pub cargs: Vec<PCodeArg>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeDecl {
    pub ikey: InvokeKey,
    pub shortname: String,
    #[serde(default)]
    pub enclosing: Option<TypeKey>,
    #[serde(default)]
    pub src_file: String,
    #[serde(default)]
    pub sinfo_start: SourceInfo,
    #[serde(default)]
    pub sinfo_end: SourceInfo,
    #[serde(default)]
    pub recursive: bool,
    pub params: Vec<FunctionParameter>,
    pub result_type: TypeKey,
    pub implementation: InvokeImpl,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvokeImpl {
    Body {
        #[serde(default)]
        masksize: u32,
        body: Body,
    },
    Primitive {
        implkey: String,
        #[serde(default)]
        binds: BTreeMap<String, TypeKey>,
        #[serde(default)]
        pcodes: BTreeMap<String, PCode>,
    },
}

impl InvokeDecl {
    pub fn is_default_primitive(&self) -> bool {
        matches!(&self.implementation, InvokeImpl::Primitive { implkey, .. } if implkey == "default")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantDecl {
    pub gkey: GlobalKey,
    pub shortname: String,
    pub declared_type: TypeKey,
    pub ivalue: InvokeKey,
}
