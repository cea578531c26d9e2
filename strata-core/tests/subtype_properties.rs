use proptest::{
    prelude::{prop, Strategy},
    test_runner::{Config, TestCaseError, TestRunner},
};
use strata_core::SubtypeEngine;
use strata_mir::fixtures::{self, CIRCLE, POLYGON, SHAPE, SQUARE};
use strata_mir::{well_known as wk, Type};

const LEAVES: [&str; 8] = [
    "Int",
    "Nat",
    "Bool",
    "None",
    "Regex",
    SQUARE,
    CIRCLE,
    "List<Int>",
];

const CONCEPTS: [&str; 7] = [wk::ANY, wk::SOME, wk::API_TYPE, wk::TESTABLE_TYPE, wk::TUPLE, SHAPE, POLYGON];

fn ty() -> impl Strategy<Value = Type> {
    let leaf = prop::strategy::Union::new(vec![
        prop::sample::select(LEAVES.to_vec()).prop_map(Type::entity).boxed(),
        prop::sample::select(CONCEPTS.to_vec())
            .prop_map(|c| Type::concept([c]))
            .boxed(),
    ]);

    leaf.prop_recursive(2, 12, 3, |inner| {
        prop::strategy::Union::new(vec![
            prop::collection::vec(inner.clone(), 0..3).prop_map(Type::tuple).boxed(),
            prop::collection::btree_map("[a-c]", inner.clone(), 0..3)
                .prop_map(|m| Type::record(m))
                .boxed(),
            prop::collection::vec(inner, 2..4)
                .prop_filter_map("union", |ts| Type::join(ts.iter()))
                .boxed(),
        ])
    })
}

fn runner() -> TestRunner {
    TestRunner::new(Config {
        cases: 128,
        ..Config::default()
    })
}

#[test]
fn subtyping_is_reflexive() {
    let g = fixtures::graph();
    let eng = SubtypeEngine::new(&g);

    runner()
        .run(&ty(), |t| {
            let res = eng.is_subtype(&t, &t).map_err(|e| TestCaseError::fail(e.to_string()))?;
            if !res {
                return Err(TestCaseError::fail(format!("{t} is not a subtype of itself")));
            }
            Ok(())
        })
        .expect("reflexive");
}

#[test]
fn memoized_answers_match_a_fresh_engine() {
    let g = fixtures::graph();
    let shared = SubtypeEngine::new(&g);

    let strat = prop::collection::vec((ty(), ty()), 1..6);
    runner()
        .run(&strat, |pairs| {
            for (a, b) in &pairs {
                let warm = shared.is_subtype(a, b).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let cold = SubtypeEngine::new(&g)
                    .is_subtype(a, b)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if warm != cold {
                    return Err(TestCaseError::fail(format!("{a} <: {b}: memo {warm}, fresh {cold}")));
                }
            }
            // Replaying the same queries after the interleaving must not change any answer.
            for (a, b) in pairs.iter().rev() {
                let again = shared.is_subtype(a, b).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let cold = SubtypeEngine::new(&g)
                    .is_subtype(a, b)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if again != cold {
                    return Err(TestCaseError::fail(format!("{a} <: {b} changed after replay")));
                }
            }
            Ok(())
        })
        .expect("memo is sound");
}

#[test]
fn members_of_a_union_are_subtypes_of_it() {
    let g = fixtures::graph();
    let eng = SubtypeEngine::new(&g);
    let strat = prop::collection::vec(ty(), 1..4);

    runner()
        .run(&strat, |ts| {
            let joined = Type::join(ts.iter()).ok_or_else(|| TestCaseError::fail("empty join"))?;
            for t in &ts {
                let res = eng
                    .is_subtype(t, &joined)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if !res {
                    return Err(TestCaseError::fail(format!("{t} not <: {joined}")));
                }
            }
            Ok(())
        })
        .expect("union upper bound");
}

#[test]
fn provides_chain_orders_concepts() {
    let g = fixtures::graph();
    let eng = SubtypeEngine::new(&g);
    let c1 = Type::concept([SHAPE]);
    let c2 = Type::concept([POLYGON]);
    let e = Type::entity(SQUARE);

    assert!(eng.is_subtype(&e, &c1).expect("query"));
    assert!(eng.is_subtype(&e, &c2).expect("query"));
    assert!(!eng.is_subtype(&c1, &c2).expect("query"));
}
