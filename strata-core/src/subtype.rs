#![forbid(unsafe_code)]

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use strata_mir::well_known as wk;
use strata_mir::{
    ConceptType, EntityType, MirError, RecordType, TupleType, Type, TypeGraph, TypeKey, TypeOption,
};

type Memo = FxHashMap<TypeKey, FxHashMap<TypeKey, bool>>;

/// Structural subtype decisions over a validated [`TypeGraph`].
///
/// Results are memoized per key pair for the lifetime of the engine. The graph is borrowed
/// immutably, so cached answers can never go stale.
pub struct SubtypeEngine<'g> {
    graph: &'g TypeGraph,
    atom_memo: RefCell<Memo>,
    memo: RefCell<Memo>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoStats {
    pub atoms: usize,
    pub types: usize,
}

fn lookup(memo: &RefCell<Memo>, k1: &str, k2: &str) -> Option<bool> {
    memo.borrow().get(k1).and_then(|m| m.get(k2)).copied()
}

fn record(memo: &RefCell<Memo>, k1: &str, k2: &str, res: bool) {
    memo.borrow_mut()
        .entry(k1.to_string())
        .or_default()
        .insert(k2.to_string(), res);
}

impl<'g> SubtypeEngine<'g> {
    pub fn new(graph: &'g TypeGraph) -> Self {
        Self {
            graph,
            atom_memo: RefCell::new(Memo::default()),
            memo: RefCell::new(Memo::default()),
        }
    }

    pub fn graph(&self) -> &'g TypeGraph {
        self.graph
    }

    /// `t1 <: t2`: every option of `t1` is an atom-subtype of some option of `t2`.
    pub fn is_subtype(&self, t1: &Type, t2: &Type) -> Result<bool, MirError> {
        if t1.type_id() == t2.type_id() {
            return Ok(true);
        }
        if let Some(res) = lookup(&self.memo, t1.type_id(), t2.type_id()) {
            return Ok(res);
        }
        tracing::trace!(t1 = t1.type_id(), t2 = t2.type_id(), "subtype memo miss");

        let mut res = true;
        for opt1 in t1.options() {
            let mut found = false;
            for opt2 in t2.options() {
                if self.is_atom_subtype(opt1, opt2)? {
                    found = true;
                    break;
                }
            }
            if !found {
                res = false;
                break;
            }
        }

        record(&self.memo, t1.type_id(), t2.type_id(), res);
        Ok(res)
    }

    /// Key-based form of [`Self::is_subtype`]; both keys must name types in the graph.
    pub fn is_subtype_key(&self, k1: &str, k2: &str) -> Result<bool, MirError> {
        if k1 == k2 {
            return Ok(true);
        }
        let t1 = self.graph.type_of(k1)?;
        let t2 = self.graph.type_of(k2)?;
        self.is_subtype(t1, t2)
    }

    pub fn is_atom_subtype(&self, t1: &TypeOption, t2: &TypeOption) -> Result<bool, MirError> {
        if t1.type_id() == t2.type_id() {
            return Ok(true);
        }
        if let Some(res) = lookup(&self.atom_memo, t1.type_id(), t2.type_id()) {
            return Ok(res);
        }

        let res = match (t1, t2) {
            (TypeOption::Concept(c1), TypeOption::Concept(c2)) => self.concept_concept(c1, c2)?,
            (TypeOption::Entity(e), TypeOption::Concept(c)) => self.entity_concept(e, c)?,
            (TypeOption::Tuple(t), TypeOption::Concept(c)) => self.tuple_concept(t, c)?,
            (TypeOption::Record(r), TypeOption::Concept(c)) => self.record_concept(r, c)?,
            _ => false,
        };

        record(&self.atom_memo, t1.type_id(), t2.type_id(), res);
        Ok(res)
    }

    pub fn memo_stats(&self) -> MemoStats {
        MemoStats {
            atoms: self.atom_memo.borrow().values().map(|m| m.len()).sum(),
            types: self.memo.borrow().values().map(|m| m.len()).sum(),
        }
    }

    fn concept_concept(&self, c1: &ConceptType, c2: &ConceptType) -> Result<bool, MirError> {
        for c2key in c2.ckeys() {
            let target = self.graph.concept(c2key)?;
            let c2type = Type::concept([c2key.clone()]);

            let mut satisfied = false;
            for c1key in c1.ckeys() {
                let decl = self.graph.concept(c1key)?;
                if decl.header.ns == target.header.ns && decl.header.name == target.header.name {
                    satisfied = true;
                    break;
                }
                if self.provides_reach(&decl.header.provides, &c2type)? {
                    satisfied = true;
                    break;
                }
            }

            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn entity_concept(&self, e: &EntityType, c: &ConceptType) -> Result<bool, MirError> {
        let ctype = Type::single(TypeOption::Concept(c.clone()));

        if e.type_id() == wk::NOTHING && self.graph.concepts.contains_key(wk::IOPTION) {
            let ioption = self.graph.type_of(wk::IOPTION)?;
            if self.is_subtype(&ctype, ioption)? {
                return Ok(true);
            }
        }

        let decl = self.graph.entity(e.type_id())?;
        self.provides_reach(&decl.header.provides, &ctype)
    }

    fn tuple_concept(&self, t: &TupleType, c: &ConceptType) -> Result<bool, MirError> {
        let provided = self.structural_concepts(wk::TUPLE, t.entries().iter())?;
        self.is_subtype(&provided, &Type::single(TypeOption::Concept(c.clone())))
    }

    fn record_concept(&self, r: &RecordType, c: &ConceptType) -> Result<bool, MirError> {
        let provided = self.structural_concepts(wk::RECORD, r.entries().iter().map(|e| &e.ptype))?;
        self.is_subtype(&provided, &Type::single(TypeOption::Concept(c.clone())))
    }

    /// Concepts a tuple or record satisfies: its kind concept plus `APIType` when every member
    /// is an API type, else `TestableType` when every member is testable.
    fn structural_concepts<'a>(
        &self,
        kind: &str,
        members: impl Iterator<Item = &'a Type> + Clone,
    ) -> Result<Type, MirError> {
        let mut ckeys = vec![kind.to_string()];

        let api = self.graph.type_of(wk::API_TYPE)?;
        if self.all_subtype(members.clone(), api)? {
            ckeys.push(wk::API_TYPE.to_string());
        } else {
            let testable = self.graph.type_of(wk::TESTABLE_TYPE)?;
            if self.all_subtype(members, testable)? {
                ckeys.push(wk::TESTABLE_TYPE.to_string());
            }
        }

        Ok(Type::concept(ckeys))
    }

    fn all_subtype<'a>(
        &self,
        mut members: impl Iterator<Item = &'a Type>,
        target: &Type,
    ) -> Result<bool, MirError> {
        members.try_fold(true, |acc, m| Ok(acc && self.is_subtype(m, target)?))
    }

    fn provides_reach(&self, provides: &[TypeKey], target: &Type) -> Result<bool, MirError> {
        for p in provides {
            let ptype = self.graph.type_of(p)?;
            if self.is_subtype(ptype, target)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use strata_mir::fixtures::{self, bool_, int, nat, none, CIRCLE, POLYGON, SHAPE, SQUARE};

    use super::*;

    fn ty(key: &str) -> Type {
        Type::entity(key)
    }

    #[test]
    fn every_graph_type_is_a_subtype_of_itself() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        for t in g.types.values() {
            assert!(eng.is_subtype(t, t).expect("query"), "{t} <: {t}");
        }
    }

    #[test]
    fn provides_is_transitive_but_not_symmetric() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let shape = Type::concept([SHAPE]);
        let polygon = Type::concept([POLYGON]);
        let square = ty(SQUARE);

        assert!(eng.is_subtype(&square, &polygon).expect("query"));
        assert!(eng.is_subtype(&square, &shape).expect("query"));
        assert!(eng.is_subtype(&polygon, &shape).expect("query"));
        assert!(!eng.is_subtype(&shape, &polygon).expect("query"));
        assert!(!eng.is_subtype(&ty(CIRCLE), &polygon).expect("query"));
    }

    #[test]
    fn tuples_are_positional() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let ib = Type::tuple(vec![int(), bool_()]);
        let bi = Type::tuple(vec![bool_(), int()]);
        assert!(!eng.is_subtype(&ib, &bi).expect("query"));
        assert!(!eng.is_subtype(&bi, &ib).expect("query"));
    }

    #[test]
    fn tuples_and_records_satisfy_synthesized_concepts() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let ib = Type::tuple(vec![int(), bool_()]);
        let rec = Type::record([("a", int()), ("b", bool_())]);

        assert!(eng.is_subtype(&ib, &Type::concept([wk::TUPLE])).expect("query"));
        assert!(eng.is_subtype(&ib, &Type::concept([wk::API_TYPE])).expect("query"));
        assert!(eng.is_subtype(&ib, &Type::concept([wk::TESTABLE_TYPE])).expect("query"));
        assert!(!eng.is_subtype(&ib, &Type::concept([wk::RECORD])).expect("query"));
        assert!(eng.is_subtype(&rec, &Type::concept([wk::RECORD, wk::API_TYPE])).expect("query"));

        // Regex is not an API type, so the tuple only gets its kind concept.
        let with_regex = Type::tuple(vec![int(), ty(wk::REGEX)]);
        assert!(eng.is_subtype(&with_regex, &Type::concept([wk::TUPLE])).expect("query"));
        assert!(!eng.is_subtype(&with_regex, &Type::concept([wk::API_TYPE])).expect("query"));
    }

    #[test]
    fn nothing_is_an_option() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let ioption = Type::concept([wk::IOPTION]);
        assert!(eng.is_subtype(&ty(wk::NOTHING), &ioption).expect("query"));
        assert!(!eng.is_subtype(&none(), &ioption).expect("query"));
    }

    #[test]
    fn unions_need_every_option_covered() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let int_or_none = Type::join([&int(), &none()]).expect("non-empty");
        let any = Type::concept([wk::ANY]);
        let some = Type::concept([wk::SOME]);

        assert!(eng.is_subtype(&int(), &int_or_none).expect("query"));
        assert!(eng.is_subtype(&int_or_none, &any).expect("query"));
        assert!(!eng.is_subtype(&int_or_none, &some).expect("query"));
        assert!(!eng.is_subtype(&int_or_none, &int()).expect("query"));
    }

    #[test]
    fn ephemeral_lists_only_match_themselves() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let eph = Type::ephemeral(vec![int()]);
        assert!(eng.is_subtype(&eph, &eph.clone()).expect("query"));
        assert!(!eng.is_subtype(&eph, &Type::concept([wk::ANY])).expect("query"));
        assert!(!eng.is_subtype(&Type::ephemeral(vec![nat()]), &eph).expect("query"));
    }

    #[test]
    fn memoized_answers_are_stable() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let square = ty(SQUARE);
        let shape = Type::concept([SHAPE]);

        let first = eng.is_subtype(&square, &shape).expect("query");
        let after_first = eng.memo_stats();
        assert!(after_first.types > 0);

        for t in g.types.values() {
            eng.is_subtype(t, &shape).expect("query");
            eng.is_subtype(&shape, t).expect("query");
        }

        assert_eq!(eng.is_subtype(&square, &shape).expect("query"), first);
        assert!(eng.memo_stats().types >= after_first.types);

        let fresh = SubtypeEngine::new(&g);
        assert_eq!(fresh.is_subtype(&square, &shape).expect("query"), first);
    }

    #[test]
    fn unknown_keys_are_reported() {
        let g = fixtures::graph();
        let eng = SubtypeEngine::new(&g);
        let err = eng
            .is_subtype(&ty("Main::Missing"), &Type::concept([wk::ANY]))
            .expect_err("missing entity");
        assert!(matches!(err, MirError::UnknownEntity(k) if k == "Main::Missing"));
    }
}
