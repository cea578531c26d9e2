use proptest::{
    prelude::{prop, Just, Strategy},
    test_runner::{Config, TestCaseError, TestRunner},
};
use strata_mir::{EntityType, Type, TypeOption};

const LEAVES: [&str; 6] = ["Int", "Nat", "Bool", "String", "None", "Main::Square"];

fn leaf() -> impl Strategy<Value = Type> {
    prop::sample::select(LEAVES.to_vec()).prop_map(Type::entity)
}

/// Small nested structural types.
fn ty() -> impl Strategy<Value = Type> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop::strategy::Union::new(vec![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Type::tuple).boxed(),
            prop::collection::btree_map("[a-e]", inner.clone(), 0..4)
                .prop_map(|m| Type::record(m))
                .boxed(),
            prop::collection::vec(inner, 1..4).prop_map(Type::ephemeral).boxed(),
        ])
    })
}

fn runner() -> TestRunner {
    TestRunner::new(Config {
        cases: 64,
        ..Config::default()
    })
}

#[test]
fn record_keys_do_not_depend_on_entry_order() {
    let strat = prop::collection::btree_map("[a-h]{1,3}", ty(), 1..5)
        .prop_map(|m| m.into_iter().collect::<Vec<(String, Type)>>())
        .prop_flat_map(|entries| (Just(entries.clone()), Just(entries).prop_shuffle()));

    runner()
        .run(&strat, |(entries, shuffled)| {
            let a = Type::record(entries);
            let b = Type::record(shuffled);
            if a.type_id() != b.type_id() {
                return Err(TestCaseError::fail(format!("{} != {}", a.type_id(), b.type_id())));
            }
            Ok(())
        })
        .expect("record keys are order independent");
}

#[test]
fn union_keys_do_not_depend_on_option_order() {
    let strat = prop::collection::vec(ty(), 1..5);

    runner()
        .run(&strat, |types| {
            let forward = Type::join(types.iter()).expect("non-empty");
            let backward = Type::join(types.iter().rev()).expect("non-empty");
            if forward.type_id() != backward.type_id() {
                return Err(TestCaseError::fail(format!(
                    "{} != {}",
                    forward.type_id(),
                    backward.type_id()
                )));
            }

            let mut keys: Vec<&str> = forward.options().iter().map(TypeOption::type_id).collect();
            let sorted = {
                let mut s = keys.clone();
                s.sort();
                s.dedup();
                s
            };
            keys.dedup();
            if keys != sorted {
                return Err(TestCaseError::fail(format!("options not canonical: {keys:?}")));
            }
            Ok(())
        })
        .expect("union keys are canonical");
}

#[test]
fn tuple_keys_follow_entry_order() {
    let strat = (ty(), ty()).prop_filter("distinct entries", |(a, b)| a != b);

    runner()
        .run(&strat, |(a, b)| {
            let ab = Type::tuple(vec![a.clone(), b.clone()]);
            let ba = Type::tuple(vec![b, a]);
            if ab.type_id() == ba.type_id() {
                return Err(TestCaseError::fail(format!("collision on {}", ab.type_id())));
            }
            Ok(())
        })
        .expect("tuple keys are positional");
}

#[test]
fn persisted_types_keep_their_keys() {
    runner()
        .run(&ty(), |t| {
            let text = serde_json::to_string(&t).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let back: Type =
                serde_json::from_str(&text).map_err(|e| TestCaseError::fail(e.to_string()))?;
            if back.type_id() != t.type_id() {
                return Err(TestCaseError::fail(format!("{} != {}", back.type_id(), t.type_id())));
            }
            Ok(())
        })
        .expect("round trip keeps canonical keys");
}

#[test]
fn entity_option_key_is_the_declared_key() {
    let e = TypeOption::Entity(EntityType::new("Main::Square"));
    assert_eq!(e.type_id(), "Main::Square");
}
