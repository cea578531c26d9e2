#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical key of a type. Two types are the same type iff their keys are equal.
pub type TypeKey = String;

/// Entity option: the key is the declared entity key itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityType {
    type_id: TypeKey,
}

impl EntityType {
    pub fn new(tkey: impl Into<TypeKey>) -> Self {
        Self { type_id: tkey.into() }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }
}

/// Intersection of concept keys. Keys are kept sorted and unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConceptType {
    type_id: TypeKey,
    ckeys: Vec<TypeKey>,
}

impl ConceptType {
    pub fn new<I, S>(ckeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TypeKey>,
    {
        let mut ckeys: Vec<TypeKey> = ckeys.into_iter().map(Into::into).collect();
        ckeys.sort();
        ckeys.dedup();

        Self {
            type_id: ckeys.join(" & "),
            ckeys,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn ckeys(&self) -> &[TypeKey] {
        &self.ckeys
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TupleType {
    type_id: TypeKey,
    entries: Vec<Type>,
}

impl TupleType {
    pub fn new(entries: Vec<Type>) -> Self {
        let keys: Vec<&str> = entries.iter().map(Type::type_id).collect();
        Self {
            type_id: format!("[{}]", keys.join(", ")),
            entries,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn entries(&self) -> &[Type] {
        &self.entries
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordEntry {
    pub pname: String,
    pub ptype: Type,
}

/// Record option. Entries are stored sorted by property name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordType {
    type_id: TypeKey,
    entries: Vec<RecordEntry>,
}

impl RecordType {
    pub fn new(entries: Vec<RecordEntry>) -> Self {
        let mut entries = entries;
        entries.sort_by(|a, b| a.pname.cmp(&b.pname));

        let rendered: Vec<String> = entries
            .iter()
            .map(|e| format!("{}: {}", e.pname, e.ptype.type_id()))
            .collect();

        Self {
            type_id: format!("{{{}}}", rendered.join(", ")),
            entries,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    pub fn entry(&self, pname: &str) -> Option<&RecordEntry> {
        self.entries.iter().find(|e| e.pname == pname)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EphemeralListType {
    type_id: TypeKey,
    entries: Vec<Type>,
}

impl EphemeralListType {
    pub fn new(entries: Vec<Type>) -> Self {
        let keys: Vec<&str> = entries.iter().map(Type::type_id).collect();
        Self {
            type_id: format!("(|{}|)", keys.join(", ")),
            entries,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn entries(&self) -> &[Type] {
        &self.entries
    }
}

/// One alternative shape of a [`Type`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TypeOptionRepr", into = "TypeOptionRepr")]
pub enum TypeOption {
    Entity(EntityType),
    Concept(ConceptType),
    Tuple(TupleType),
    Record(RecordType),
    Ephemeral(EphemeralListType),
}

impl TypeOption {
    pub fn type_id(&self) -> &str {
        match self {
            TypeOption::Entity(t) => t.type_id(),
            TypeOption::Concept(t) => t.type_id(),
            TypeOption::Tuple(t) => t.type_id(),
            TypeOption::Record(t) => t.type_id(),
            TypeOption::Ephemeral(t) => t.type_id(),
        }
    }
}

/// A type: one or more options. A single option carries that option's key; several options
/// form a union keyed by the sorted, deduplicated option keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TypeRepr", into = "TypeRepr")]
pub struct Type {
    type_id: TypeKey,
    options: Vec<TypeOption>,
}

impl Type {
    pub fn single(option: TypeOption) -> Self {
        Self {
            type_id: option.type_id().to_string(),
            options: vec![option],
        }
    }

    /// Builds a union. Options are ordered by key and duplicates dropped, so the result does
    /// not depend on the order the options were given in.
    ///
    /// Returns `None` when `options` is empty.
    pub fn union(options: impl IntoIterator<Item = TypeOption>) -> Option<Self> {
        let mut by_key: BTreeMap<TypeKey, TypeOption> = BTreeMap::new();
        for opt in options {
            by_key.entry(opt.type_id().to_string()).or_insert(opt);
        }

        if by_key.len() == 1 {
            let (_, only) = by_key.into_iter().next()?;
            return Some(Self::single(only));
        }
        if by_key.is_empty() {
            return None;
        }

        let type_id = by_key.keys().cloned().collect::<Vec<_>>().join(" | ");
        Some(Self {
            type_id,
            options: by_key.into_values().collect(),
        })
    }

    /// Union of the options of every type in `types`.
    pub fn join<'a>(types: impl IntoIterator<Item = &'a Type>) -> Option<Self> {
        Self::union(types.into_iter().flat_map(|t| t.options.iter().cloned()))
    }

    pub fn entity(tkey: impl Into<TypeKey>) -> Self {
        Self::single(TypeOption::Entity(EntityType::new(tkey)))
    }

    pub fn concept<I, S>(ckeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TypeKey>,
    {
        Self::single(TypeOption::Concept(ConceptType::new(ckeys)))
    }

    pub fn tuple(entries: Vec<Type>) -> Self {
        Self::single(TypeOption::Tuple(TupleType::new(entries)))
    }

    pub fn record<S: Into<String>>(entries: impl IntoIterator<Item = (S, Type)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(pname, ptype)| RecordEntry {
                pname: pname.into(),
                ptype,
            })
            .collect();
        Self::single(TypeOption::Record(RecordType::new(entries)))
    }

    pub fn ephemeral(entries: Vec<Type>) -> Self {
        Self::single(TypeOption::Ephemeral(EphemeralListType::new(entries)))
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn options(&self) -> &[TypeOption] {
        &self.options
    }

    /// The single option, if this type is not a union.
    pub fn unique_option(&self) -> Option<&TypeOption> {
        match self.options.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn as_unique_entity(&self) -> Option<&EntityType> {
        match self.unique_option()? {
            TypeOption::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_unique_tuple(&self) -> Option<&TupleType> {
        match self.unique_option()? {
            TypeOption::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_unique_record(&self) -> Option<&RecordType> {
        match self.unique_option()? {
            TypeOption::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_unique_ephemeral(&self) -> Option<&EphemeralListType> {
        match self.unique_option()? {
            TypeOption::Ephemeral(l) => Some(l),
            _ => None,
        }
    }

    /// True when the type names exactly one concrete shape (no concept, no union).
    pub fn is_unique_concrete(&self) -> bool {
        matches!(
            self.unique_option(),
            Some(TypeOption::Entity(_) | TypeOption::Tuple(_) | TypeOption::Record(_) | TypeOption::Ephemeral(_))
        )
    }

    /// Entity and concept keys this type mentions, at any depth.
    pub fn referenced_keys(&self, out: &mut Vec<TypeKey>) {
        for opt in &self.options {
            match opt {
                TypeOption::Entity(e) => out.push(e.type_id.clone()),
                TypeOption::Concept(c) => out.extend(c.ckeys.iter().cloned()),
                TypeOption::Tuple(t) => t.entries.iter().for_each(|e| e.referenced_keys(out)),
                TypeOption::Record(r) => r.entries.iter().for_each(|e| e.ptype.referenced_keys(out)),
                TypeOption::Ephemeral(l) => l.entries.iter().for_each(|e| e.referenced_keys(out)),
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_id)
    }
}

// Persisted form. Keys are never serialized; they are rebuilt by the constructors on load.

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum TypeOptionRepr {
    Entity { tkey: TypeKey },
    Concept { ckeys: Vec<TypeKey> },
    Tuple { entries: Vec<Type> },
    Record { entries: Vec<RecordEntry> },
    Ephemeral { entries: Vec<Type> },
}

impl From<TypeOptionRepr> for TypeOption {
    fn from(repr: TypeOptionRepr) -> Self {
        match repr {
            TypeOptionRepr::Entity { tkey } => TypeOption::Entity(EntityType::new(tkey)),
            TypeOptionRepr::Concept { ckeys } => TypeOption::Concept(ConceptType::new(ckeys)),
            TypeOptionRepr::Tuple { entries } => TypeOption::Tuple(TupleType::new(entries)),
            TypeOptionRepr::Record { entries } => TypeOption::Record(RecordType::new(entries)),
            TypeOptionRepr::Ephemeral { entries } => {
                TypeOption::Ephemeral(EphemeralListType::new(entries))
            }
        }
    }
}

impl From<TypeOption> for TypeOptionRepr {
    fn from(opt: TypeOption) -> Self {
        match opt {
            TypeOption::Entity(e) => TypeOptionRepr::Entity { tkey: e.type_id },
            TypeOption::Concept(c) => TypeOptionRepr::Concept { ckeys: c.ckeys },
            TypeOption::Tuple(t) => TypeOptionRepr::Tuple { entries: t.entries },
            TypeOption::Record(r) => TypeOptionRepr::Record { entries: r.entries },
            TypeOption::Ephemeral(l) => TypeOptionRepr::Ephemeral { entries: l.entries },
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct TypeRepr {
    options: Vec<TypeOption>,
}

impl TryFrom<TypeRepr> for Type {
    type Error = String;

    fn try_from(repr: TypeRepr) -> Result<Self, Self::Error> {
        Type::union(repr.options).ok_or_else(|| "type must have at least one option".to_string())
    }
}

impl From<Type> for TypeRepr {
    fn from(ty: Type) -> Self {
        TypeRepr {
            options: ty.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int() -> Type {
        Type::entity("Int")
    }

    fn bool_() -> Type {
        Type::entity("Bool")
    }

    #[test]
    fn record_key_ignores_entry_order() {
        let ab = Type::record([("a", int()), ("b", bool_())]);
        let ba = Type::record([("b", bool_()), ("a", int())]);
        assert_eq!(ab.type_id(), "{a: Int, b: Bool}");
        assert_eq!(ab.type_id(), ba.type_id());
        assert_eq!(ab, ba);
    }

    #[test]
    fn tuple_key_keeps_entry_order() {
        let ib = Type::tuple(vec![int(), bool_()]);
        let bi = Type::tuple(vec![bool_(), int()]);
        assert_eq!(ib.type_id(), "[Int, Bool]");
        assert_eq!(bi.type_id(), "[Bool, Int]");
        assert_ne!(ib.type_id(), bi.type_id());
    }

    #[test]
    fn union_key_is_sorted_and_deduplicated() {
        let a = TypeOption::Entity(EntityType::new("A"));
        let b = TypeOption::Entity(EntityType::new("B"));

        let ba = Type::union([b.clone(), a.clone()]).expect("non-empty");
        let ab = Type::union([a.clone(), b.clone(), a.clone()]).expect("non-empty");
        assert_eq!(ba.type_id(), "A | B");
        assert_eq!(ab.type_id(), "A | B");
        assert_eq!(ab.options().len(), 2);
    }

    #[test]
    fn single_option_union_degenerates() {
        let only = Type::union([TypeOption::Entity(EntityType::new("Int"))]).expect("non-empty");
        assert_eq!(only.type_id(), "Int");
        assert!(only.as_unique_entity().is_some());
        assert!(Type::union(Vec::new()).is_none());
    }

    #[test]
    fn concept_key_is_sorted() {
        assert_eq!(Type::concept(["Some", "APIType"]).type_id(), "APIType & Some");
        assert_eq!(Type::concept(["B", "A", "B"]).type_id(), "A & B");
    }

    #[test]
    fn ephemeral_and_nested_keys() {
        let inner = Type::tuple(vec![int()]);
        let eph = Type::ephemeral(vec![inner, bool_()]);
        assert_eq!(eph.type_id(), "(|[Int], Bool|)");

        let rec = Type::record([("x", Type::tuple(vec![int(), int()]))]);
        assert_eq!(rec.type_id(), "{x: [Int, Int]}");
    }

    #[test]
    fn serialized_form_rebuilds_keys() {
        let ty = Type::join([
            &Type::record([("b", bool_()), ("a", int())]),
            &Type::tuple(vec![int(), Type::concept(["Any"])]),
        ])
        .expect("non-empty");

        let text = serde_json::to_string(&ty).expect("serialize");
        assert!(!text.contains("type_id"), "keys are not persisted: {text}");

        let back: Type = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.type_id(), ty.type_id());
        assert_eq!(back, ty);
    }

    #[test]
    fn empty_union_is_rejected_on_load() {
        let err = serde_json::from_str::<Type>(r#"{"options": []}"#);
        assert!(err.is_err());
    }
}
