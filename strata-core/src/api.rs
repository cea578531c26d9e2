#![forbid(unsafe_code)]

use serde::Serialize;
use strata_mir::well_known as wk;
use strata_mir::{
    CollectionKind, EntityDecl, EntityKind, InternalEntity, MirError, Program, Type, TypeKey,
    TypeOption,
};

use crate::SubtypeEngine;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsFieldInfo {
    pub fkey: String,
    pub fname: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldTypeInfo {
    pub declared_type: TypeKey,
    pub is_optional: bool,
}

/// External description of one boundary type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "tag")]
pub enum ApiType {
    None,
    Nothing,
    Bool,
    Nat,
    Int,
    BigNat,
    BigInt,
    Rational,
    Float,
    Decimal,
    String,
    ByteBuffer,
    DateTime,
    TickTime,
    LogicalTime,
    UUID4,
    UUID7,
    SHAContentHash,
    Regex,
    StringOf {
        name: TypeKey,
        validator: String,
    },
    DataString {
        name: TypeKey,
        oftype: TypeKey,
        chkinv: String,
    },
    DataBuffer {
        name: TypeKey,
        oftype: TypeKey,
        chkinv: String,
    },
    ConstructableOf {
        name: TypeKey,
        oftype: TypeKey,
        validatefunc: Option<String>,
    },
    Tuple {
        name: TypeKey,
        ttypes: Vec<TypeKey>,
    },
    Record {
        name: TypeKey,
        props: Vec<String>,
        ttypes: Vec<TypeKey>,
    },
    ContainerT {
        name: TypeKey,
        category: CollectionKind,
        elemtype: TypeKey,
    },
    ContainerKV {
        name: TypeKey,
        ktype: TypeKey,
        vtype: TypeKey,
    },
    Enum {
        name: TypeKey,
        enums: Vec<String>,
    },
    Entity {
        name: TypeKey,
        consfields: Vec<ConsFieldInfo>,
        ttypes: Vec<FieldTypeInfo>,
        validatefunc: Option<String>,
        consfunc: String,
    },
    Union {
        name: TypeKey,
        opts: Vec<TypeKey>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiSignature {
    pub name: String,
    pub argnames: Vec<String>,
    pub argtypes: Vec<TypeKey>,
    pub restype: TypeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypeDeclInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub into: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiManifest {
    pub apitypes: Vec<ApiType>,
    pub typedecls: Vec<TypeDeclInfo>,
    pub namespacemap: Vec<NamespaceInfo>,
    pub apisig: Vec<ApiSignature>,
}

impl ApiManifest {
    pub fn to_json(&self) -> Result<String, MirError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Read-only walk producing [`ApiManifest`]s.
pub struct ApiReporter<'a> {
    program: &'a Program,
    subtypes: &'a SubtypeEngine<'a>,
}

fn primitive_tag(key: &str) -> Option<ApiType> {
    let tag = match key {
        wk::NONE => ApiType::None,
        wk::NOTHING => ApiType::Nothing,
        wk::BOOL => ApiType::Bool,
        wk::NAT => ApiType::Nat,
        wk::INT => ApiType::Int,
        wk::BIG_NAT => ApiType::BigNat,
        wk::BIG_INT => ApiType::BigInt,
        wk::RATIONAL => ApiType::Rational,
        wk::FLOAT => ApiType::Float,
        wk::DECIMAL => ApiType::Decimal,
        wk::STRING => ApiType::String,
        wk::BYTE_BUFFER => ApiType::ByteBuffer,
        wk::DATE_TIME => ApiType::DateTime,
        wk::TICK_TIME => ApiType::TickTime,
        wk::LOGICAL_TIME => ApiType::LogicalTime,
        wk::UUID4 => ApiType::UUID4,
        wk::UUID7 => ApiType::UUID7,
        wk::SHA_CONTENT_HASH => ApiType::SHAContentHash,
        wk::REGEX => ApiType::Regex,
        _ => return None,
    };
    Some(tag)
}

impl<'a> ApiReporter<'a> {
    pub fn new(program: &'a Program, subtypes: &'a SubtypeEngine<'a>) -> Self {
        Self { program, subtypes }
    }

    pub fn describe(&self, ty: &Type) -> Result<ApiType, MirError> {
        let name = ty.type_id().to_string();
        match ty.unique_option() {
            Some(TypeOption::Tuple(t)) => Ok(ApiType::Tuple {
                name,
                ttypes: t.entries().iter().map(|e| e.type_id().to_string()).collect(),
            }),
            Some(TypeOption::Record(r)) => Ok(ApiType::Record {
                name,
                props: r.entries().iter().map(|e| e.pname.clone()).collect(),
                ttypes: r.entries().iter().map(|e| e.ptype.type_id().to_string()).collect(),
            }),
            Some(TypeOption::Entity(e)) => self.describe_entity(self.program.graph.entity(e.type_id())?),
            Some(TypeOption::Ephemeral(_)) => Err(MirError::shape(name, "a boundary type")),
            Some(TypeOption::Concept(_)) | None => Ok(ApiType::Union {
                opts: self.concrete_subtypes(ty)?,
                name,
            }),
        }
    }

    /// Every entity currently a subtype of `ty`, sorted by key.
    fn concrete_subtypes(&self, ty: &Type) -> Result<Vec<TypeKey>, MirError> {
        let mut opts = Vec::new();
        for key in self.program.graph.entities.keys() {
            let ety = self.program.graph.type_of(key)?;
            if self.subtypes.is_subtype(ety, ty)? {
                opts.push(key.clone());
            }
        }
        opts.dedup();
        Ok(opts)
    }

    fn describe_entity(&self, decl: &EntityDecl) -> Result<ApiType, MirError> {
        let name = decl.header.tkey.clone();
        let api = match &decl.kind {
            EntityKind::Internal(InternalEntity::Primitive) => primitive_tag(&name)
                .ok_or_else(|| MirError::shape(name.clone(), "a known primitive"))?,
            EntityKind::Internal(InternalEntity::StringOf { validator }) => {
                let regex = self
                    .program
                    .graph
                    .validator_regexs
                    .get(validator)
                    .ok_or_else(|| MirError::UnknownType(validator.clone()))?;
                ApiType::StringOf {
                    name,
                    validator: regex.clone(),
                }
            }
            EntityKind::Internal(InternalEntity::DataString { fromtype, accepts }) => {
                ApiType::DataString {
                    name,
                    oftype: fromtype.clone(),
                    chkinv: accepts.clone(),
                }
            }
            EntityKind::Internal(InternalEntity::DataBuffer { fromtype, accepts }) => {
                ApiType::DataBuffer {
                    name,
                    oftype: fromtype.clone(),
                    chkinv: accepts.clone(),
                }
            }
            EntityKind::Internal(InternalEntity::Constructable { fromtype }) => {
                ApiType::ConstructableOf {
                    name,
                    oftype: fromtype.clone(),
                    validatefunc: None,
                }
            }
            EntityKind::Internal(InternalEntity::Havoc) => {
                return Err(MirError::shape(name, "a boundary type"));
            }
            EntityKind::Internal(InternalEntity::Collection(coll)) => {
                let bound = |k: Option<&TypeKey>, var: &'static str| {
                    k.cloned()
                        .ok_or_else(|| MirError::shape(format!("{name}<{var}>"), "a bound type variable"))
                };
                match coll.kind {
                    CollectionKind::Map => ApiType::ContainerKV {
                        ktype: bound(coll.key_type(), "K")?,
                        vtype: bound(coll.value_type(), "V")?,
                        name,
                    },
                    kind => ApiType::ContainerT {
                        category: kind,
                        elemtype: bound(coll.elem_type(), "T")?,
                        name,
                    },
                }
            }
            EntityKind::Constructable(c) => ApiType::ConstructableOf {
                name,
                oftype: c.valuetype.clone(),
                validatefunc: c.validatefunc.clone(),
            },
            EntityKind::Enum(e) => ApiType::Enum {
                name,
                enums: e.enums.clone(),
            },
            EntityKind::Object(obj) => {
                let mut consfields = Vec::with_capacity(obj.consfuncfields.len());
                let mut ttypes = Vec::with_capacity(obj.consfuncfields.len());
                for cf in &obj.consfuncfields {
                    let fdecl = self.program.graph.field(&cf.cfkey)?;
                    consfields.push(ConsFieldInfo {
                        fkey: fdecl.fkey.clone(),
                        fname: fdecl.fname.clone(),
                    });
                    ttypes.push(FieldTypeInfo {
                        declared_type: fdecl.declared_type.clone(),
                        is_optional: cf.isoptional,
                    });
                }
                ApiType::Entity {
                    name,
                    consfields,
                    ttypes,
                    validatefunc: obj.validatefunc.clone(),
                    consfunc: obj.consfunc.clone(),
                }
            }
        };
        Ok(api)
    }

    pub fn signature(&self, ikey: &str) -> Result<ApiSignature, MirError> {
        let decl = self.program.invoke(ikey)?;
        Ok(ApiSignature {
            name: decl.ikey.clone(),
            argnames: decl.params.iter().map(|p| p.name.clone()).collect(),
            argtypes: decl.params.iter().map(|p| p.ptype.clone()).collect(),
            restype: decl.result_type.clone(),
        })
    }

    /// Boundary manifest for `entrypoints`. With `test_build`, testable types are included too.
    pub fn emit_api_info(&self, entrypoints: &[String], test_build: bool) -> Result<ApiManifest, MirError> {
        let graph = &self.program.graph;
        let api = graph.type_of(wk::API_TYPE)?;
        let testable = graph.type_of(wk::TESTABLE_TYPE)?;

        let mut apitypes = Vec::new();
        for ty in graph.types.values() {
            let boundary = self.subtypes.is_subtype(ty, api)?
                || (test_build && self.subtypes.is_subtype(ty, testable)?);
            if boundary {
                apitypes.push(self.describe(ty)?);
            }
        }

        let typedecls = graph
            .type_aliases
            .iter()
            .map(|(name, ty)| TypeDeclInfo {
                name: name.clone(),
                ty: ty.type_id().to_string(),
            })
            .collect();

        let namespacemap = graph
            .namespace_remap
            .iter()
            .map(|(name, into)| NamespaceInfo {
                name: name.clone(),
                into: into.clone(),
            })
            .collect();

        let mut eps: Vec<&String> = entrypoints.iter().collect();
        eps.sort();
        eps.dedup();
        let apisig = eps
            .into_iter()
            .map(|ep| self.signature(ep))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(types = apitypes.len(), sigs = apisig.len(), test_build, "emitted api manifest");

        Ok(ApiManifest {
            apitypes,
            typedecls,
            namespacemap,
            apisig,
        })
    }
}
