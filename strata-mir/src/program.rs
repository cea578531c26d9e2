#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ConceptDecl, ConstantDecl, EntityDecl, FieldDecl, FieldKey, GlobalKey, InvokeDecl, InvokeKey,
    MirError, Type, TypeKey, TypeOption,
};

/// Declarations and structural types of one program.
///
/// `types` maps every canonical key the program mentions to its [`Type`]; nominal keys map to
/// single-option entity or concept types.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeGraph {
    #[serde(default)]
    pub concepts: BTreeMap<TypeKey, ConceptDecl>,
    #[serde(default)]
    pub entities: BTreeMap<TypeKey, EntityDecl>,
    #[serde(default)]
    pub fields: BTreeMap<FieldKey, FieldDecl>,
    #[serde(default)]
    pub types: BTreeMap<TypeKey, Type>,
    #[serde(default)]
    pub validator_regexs: BTreeMap<TypeKey, String>,
    #[serde(default)]
    pub type_aliases: BTreeMap<String, Type>,
    #[serde(default)]
    pub namespace_remap: BTreeMap<String, String>,
}

impl TypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_concept(&mut self, decl: ConceptDecl) {
        let key = decl.header.tkey.clone();
        self.types.insert(key.clone(), Type::concept([key.clone()]));
        self.concepts.insert(key, decl);
    }

    pub fn add_entity(&mut self, decl: EntityDecl) {
        let key = decl.header.tkey.clone();
        self.types.insert(key.clone(), Type::entity(key.clone()));
        self.entities.insert(key, decl);
    }

    pub fn add_field(&mut self, decl: FieldDecl) {
        self.fields.insert(decl.fkey.clone(), decl);
    }

    /// Registers a structural type (tuple, record, union...) under its canonical key.
    pub fn add_type(&mut self, ty: Type) -> TypeKey {
        let key = ty.type_id().to_string();
        self.types.entry(key.clone()).or_insert(ty);
        key
    }

    pub fn type_of(&self, key: &str) -> Result<&Type, MirError> {
        self.types
            .get(key)
            .ok_or_else(|| MirError::UnknownType(key.to_string()))
    }

    pub fn concept(&self, key: &str) -> Result<&ConceptDecl, MirError> {
        self.concepts
            .get(key)
            .ok_or_else(|| MirError::UnknownConcept(key.to_string()))
    }

    pub fn entity(&self, key: &str) -> Result<&EntityDecl, MirError> {
        self.entities
            .get(key)
            .ok_or_else(|| MirError::UnknownEntity(key.to_string()))
    }

    pub fn field(&self, key: &str) -> Result<&FieldDecl, MirError> {
        self.fields
            .get(key)
            .ok_or_else(|| MirError::UnknownField(key.to_string()))
    }

    /// Every concrete tuple shape in the graph.
    pub fn tuples(&self) -> impl Iterator<Item = &Type> {
        self.types.values().filter(|t| t.as_unique_tuple().is_some())
    }

    pub fn records(&self) -> impl Iterator<Item = &Type> {
        self.types.values().filter(|t| t.as_unique_record().is_some())
    }

    /// `provides` list of a nominal key (concept or entity).
    pub fn provides_of(&self, key: &str) -> Result<&[TypeKey], MirError> {
        if let Some(c) = self.concepts.get(key) {
            return Ok(&c.header.provides);
        }
        if let Some(e) = self.entities.get(key) {
            return Ok(&e.header.provides);
        }
        Err(MirError::UnknownType(key.to_string()))
    }

    /// Checks that the graph is closed and that `provides` is acyclic.
    pub fn validate(&self) -> Result<(), MirError> {
        for (key, ty) in &self.types {
            if key != ty.type_id() {
                return Err(MirError::shape(key.clone(), "keyed by its own canonical key"));
            }
            self.check_type_closed(ty)?;
        }

        for decl in self.concepts.values() {
            for p in &decl.header.provides {
                self.concept(p)?;
            }
            for t in decl.header.terms.values() {
                self.type_of(t)?;
            }
        }

        for decl in self.entities.values() {
            for p in &decl.header.provides {
                self.concept(p)?;
            }
            for t in decl.header.terms.values() {
                self.type_of(t)?;
            }
            if let Some(obj) = decl.as_object() {
                for f in obj.fields.iter().chain(obj.consfuncfields.iter().map(|c| &c.cfkey)) {
                    self.field(f)?;
                }
            }
            if let Some(coll) = decl.as_collection() {
                for t in coll.binds.values() {
                    self.type_of(t)?;
                }
            }
        }

        for f in self.fields.values() {
            self.entity(&f.enclosing)?;
            self.type_of(&f.declared_type)?;
        }

        for ty in self.type_aliases.values() {
            self.check_type_closed(ty)?;
        }

        self.check_provides_acyclic()
    }

    fn check_type_closed(&self, ty: &Type) -> Result<(), MirError> {
        for opt in ty.options() {
            match opt {
                TypeOption::Entity(e) => {
                    self.entity(e.type_id())?;
                }
                TypeOption::Concept(c) => {
                    for k in c.ckeys() {
                        self.concept(k)?;
                    }
                }
                TypeOption::Tuple(t) => {
                    for e in t.entries() {
                        self.check_type_closed(e)?;
                    }
                }
                TypeOption::Record(r) => {
                    for e in r.entries() {
                        self.check_type_closed(&e.ptype)?;
                    }
                }
                TypeOption::Ephemeral(l) => {
                    for e in l.entries() {
                        self.check_type_closed(e)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_provides_acyclic(&self) -> Result<(), MirError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let roots = self.concepts.keys().chain(self.entities.keys());

        for root in roots {
            if marks.contains_key(root.as_str()) {
                continue;
            }

            // (node, next provides index) stack; `path` mirrors the nodes currently visiting.
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut path: Vec<&str> = vec![root.as_str()];
            marks.insert(root.as_str(), Mark::Visiting);

            while let Some((node, idx)) = stack.last().copied() {
                let provides = self.provides_of(node)?;
                if idx >= provides.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    path.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let next = provides[idx].as_str();
                match marks.get(next) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|p| *p == next).unwrap_or(0);
                        let mut cycle: Vec<TypeKey> =
                            path[start..].iter().map(|p| p.to_string()).collect();
                        cycle.push(next.to_string());
                        return Err(MirError::ProvidesCycle { path: cycle });
                    }
                    None => {
                        marks.insert(next, Mark::Visiting);
                        stack.push((next, 0));
                        path.push(next);
                    }
                }
            }
        }

        Ok(())
    }
}

/// A fully resolved program: the type graph plus every function and global constant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub graph: TypeGraph,
    #[serde(default)]
    pub invokes: BTreeMap<InvokeKey, InvokeDecl>,
    #[serde(default)]
    pub constants: BTreeMap<GlobalKey, ConstantDecl>,
}

impl Program {
    pub fn new(graph: TypeGraph) -> Self {
        Self {
            graph,
            invokes: BTreeMap::new(),
            constants: BTreeMap::new(),
        }
    }

    pub fn add_invoke(&mut self, decl: InvokeDecl) {
        self.invokes.insert(decl.ikey.clone(), decl);
    }

    pub fn add_constant(&mut self, decl: ConstantDecl) {
        self.constants.insert(decl.gkey.clone(), decl);
    }

    pub fn invoke(&self, key: &str) -> Result<&InvokeDecl, MirError> {
        self.invokes
            .get(key)
            .ok_or_else(|| MirError::UnknownInvoke(key.to_string()))
    }

    pub fn constant(&self, key: &str) -> Result<&ConstantDecl, MirError> {
        self.constants
            .get(key)
            .ok_or_else(|| MirError::UnknownGlobal(key.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, MirError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, MirError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Graph closure and acyclicity, then per-function structure.
    pub fn validate(&self) -> Result<(), MirError> {
        self.graph.validate()?;

        for decl in self.graph.entities.values() {
            if let Some(obj) = decl.as_object() {
                self.invoke(&obj.consfunc)?;
            }
        }

        for c in self.constants.values() {
            self.graph.type_of(&c.declared_type)?;
            self.invoke(&c.ivalue)?;
        }

        for (key, decl) in &self.invokes {
            if key != &decl.ikey {
                return Err(MirError::body(key.clone(), format!("keyed as `{}`", decl.ikey)));
            }
            crate::validate_invoke(self, decl)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConceptDecl, DeclHeader};

    fn concept(key: &str, provides: &[&str]) -> ConceptDecl {
        ConceptDecl {
            header: DeclHeader {
                tkey: key.to_string(),
                ns: "Core".to_string(),
                name: key.to_string(),
                attributes: Vec::new(),
                terms: BTreeMap::new(),
                provides: provides.iter().map(|p| p.to_string()).collect(),
            },
        }
    }

    #[test]
    fn detects_provides_cycle() {
        let mut g = TypeGraph::new();
        g.add_concept(concept("A", &["B"]));
        g.add_concept(concept("B", &["C"]));
        g.add_concept(concept("C", &["A"]));

        let err = g.validate().expect_err("cycle must be rejected");
        match err {
            MirError::ProvidesCycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4, "{path:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn diamond_provides_is_not_a_cycle() {
        let mut g = TypeGraph::new();
        g.add_concept(concept("Any", &[]));
        g.add_concept(concept("L", &["Any"]));
        g.add_concept(concept("R", &["Any"]));
        g.add_concept(concept("Both", &["L", "R"]));
        g.validate().expect("diamond is a DAG");
    }

    #[test]
    fn unresolved_provides_is_reported() {
        let mut g = TypeGraph::new();
        g.add_concept(concept("A", &["Missing"]));
        assert!(matches!(g.validate(), Err(MirError::UnknownConcept(k)) if k == "Missing"));
    }

    #[test]
    fn structural_types_must_be_closed() {
        let mut g = TypeGraph::new();
        g.add_type(Type::tuple(vec![Type::entity("Int")]));
        assert!(matches!(g.validate(), Err(MirError::UnknownEntity(k)) if k == "Int"));
    }
}
