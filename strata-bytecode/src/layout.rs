#![forbid(unsafe_code)]

//! Physical layouts are computed elsewhere; lowering only asks for them by key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_mir::TypeKey;

use crate::LowerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Scalar held directly in its slot.
    Register,
    /// Inline struct of members.
    Struct,
    /// Pointer to a heap object.
    Ref,
    InlineUnion,
    RefUnion,
}

impl LayoutKind {
    pub fn is_union(self) -> bool {
        matches!(self, LayoutKind::InlineUnion | LayoutKind::RefUnion)
    }
}

/// One member of a tuple, record, entity or ephemeral list layout.
///
/// Positional shapes are addressed by index into `members`; named shapes by `name`
/// (property name or field key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLayout {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeKey,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutInfo {
    pub tkey: TypeKey,
    pub kind: LayoutKind,
    /// Inline allocation size in bytes.
    pub size: u32,
    #[serde(default)]
    pub members: Vec<MemberLayout>,
}

impl LayoutInfo {
    pub fn at(&self, idx: usize) -> Result<&MemberLayout, LowerError> {
        self.members.get(idx).ok_or_else(|| {
            LowerError::malformed(format!("layout of `{}` has no member at index {idx}", self.tkey))
        })
    }

    pub fn named(&self, name: &str) -> Result<&MemberLayout, LowerError> {
        self.members.iter().find(|m| m.name == name).ok_or_else(|| {
            LowerError::malformed(format!("layout of `{}` has no member `{name}`", self.tkey))
        })
    }
}

/// Source of sizes and member offsets.
pub trait LayoutOracle {
    fn layout(&self, tkey: &str) -> Option<&LayoutInfo>;
}

/// A layout oracle backed by a precomputed table, usually loaded from JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutTable {
    pub types: BTreeMap<TypeKey, LayoutInfo>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: LayoutInfo) {
        self.types.insert(info.tkey.clone(), info);
    }

    pub fn scalar(&mut self, tkey: &str, size: u32) {
        self.insert(LayoutInfo {
            tkey: tkey.to_string(),
            kind: LayoutKind::Register,
            size,
            members: Vec::new(),
        });
    }

    /// Positional layout with members packed in order.
    pub fn packed(&mut self, tkey: &str, kind: LayoutKind, members: &[(&str, &str)]) {
        let mut offset = 0;
        let mut laid = Vec::with_capacity(members.len());
        for (name, ty) in members {
            laid.push(MemberLayout {
                name: name.to_string(),
                ty: ty.to_string(),
                offset,
            });
            offset += self.types.get(*ty).map(|l| l.size).unwrap_or(0);
        }
        self.insert(LayoutInfo {
            tkey: tkey.to_string(),
            kind,
            size: offset,
            members: laid,
        });
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl LayoutOracle for LayoutTable {
    fn layout(&self, tkey: &str) -> Option<&LayoutInfo> {
        self.types.get(tkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_members_follow_their_sizes() {
        let mut t = LayoutTable::new();
        t.scalar("Int", 8);
        t.scalar("Bool", 1);
        t.packed("[Int, Bool]", LayoutKind::Struct, &[("0", "Int"), ("1", "Bool")]);

        let l = t.layout("[Int, Bool]").expect("present");
        assert_eq!(l.size, 9);
        assert_eq!(l.at(1).expect("member").offset, 8);
        assert_eq!(l.named("0").expect("member").ty, "Int");
        assert!(l.at(2).is_err());
    }

    #[test]
    fn tables_load_from_json() {
        let text = r#"{ "types": { "Int": { "tkey": "Int", "kind": "register", "size": 8 } } }"#;
        let t = LayoutTable::from_json(text).expect("parse");
        assert_eq!(t.layout("Int").map(|l| l.kind), Some(LayoutKind::Register));
        assert!(t.layout("Nat").is_none());
    }

    #[test]
    fn unions_are_recognized() {
        assert!(LayoutKind::InlineUnion.is_union());
        assert!(LayoutKind::RefUnion.is_union());
        assert!(!LayoutKind::Ref.is_union());
    }
}
