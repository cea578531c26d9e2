#![forbid(unsafe_code)]

//! Layouts for every type of the `strata_mir::fixtures` graph.

use strata_mir::fixtures::{
    CIRCLE, COLOR, EMAIL, EMAIL_VALIDATOR, LIST_INT, MAP_STRING_INT, POLYGON, SHAPE, SQUARE,
    STACK_INT,
};
use strata_mir::well_known as wk;

use crate::layout::{LayoutKind, LayoutTable};

fn boxed(t: &mut LayoutTable, tkey: &str, members: &[(&str, &str)]) {
    t.packed(tkey, LayoutKind::Ref, members);
    if let Some(info) = t.types.get_mut(tkey) {
        info.size = 8;
    }
}

fn union(t: &mut LayoutTable, tkey: &str, kind: LayoutKind) {
    let size = if kind == LayoutKind::InlineUnion { 16 } else { 8 };
    t.packed(tkey, kind, &[]);
    if let Some(info) = t.types.get_mut(tkey) {
        info.size = size;
    }
}

pub fn layout_table() -> LayoutTable {
    let mut t = LayoutTable::new();

    t.scalar(wk::NONE, 1);
    t.scalar(wk::NOTHING, 2);
    t.scalar(wk::BOOL, 1);
    t.scalar(wk::INT, 8);
    t.scalar(wk::NAT, 8);
    t.scalar(wk::FLOAT, 8);
    t.scalar(wk::STRING, 16);
    t.scalar(wk::REGEX, 16);
    t.scalar(EMAIL_VALIDATOR, 1);
    t.scalar(EMAIL, 16);
    t.scalar(COLOR, 8);

    for coll in [LIST_INT, STACK_INT, MAP_STRING_INT] {
        boxed(&mut t, coll, &[]);
    }
    boxed(
        &mut t,
        SQUARE,
        &[("Main::Square.side", wk::INT), ("Main::Square.tag", wk::BOOL)],
    );
    boxed(
        &mut t,
        CIRCLE,
        &[("Main::Circle.radius", wk::NAT), ("Main::Circle.filled", wk::BOOL)],
    );

    t.packed("[Int, Bool]", LayoutKind::Struct, &[("0", wk::INT), ("1", wk::BOOL)]);
    t.packed("[Bool, Int]", LayoutKind::Struct, &[("0", wk::BOOL), ("1", wk::INT)]);
    t.packed("[Int]", LayoutKind::Struct, &[("0", wk::INT)]);
    t.packed("[Nat, Bool]", LayoutKind::Struct, &[("0", wk::NAT), ("1", wk::BOOL)]);
    t.packed(
        "[Int, Bool, Int]",
        LayoutKind::Struct,
        &[("0", wk::INT), ("1", wk::BOOL), ("2", wk::INT)],
    );

    t.packed("{a: Int, b: Bool}", LayoutKind::Struct, &[("a", wk::INT), ("b", wk::BOOL)]);
    t.packed("{c: Nat}", LayoutKind::Struct, &[("c", wk::NAT)]);
    t.packed(
        "{a: Int, b: Bool, c: Nat}",
        LayoutKind::Struct,
        &[("a", wk::INT), ("b", wk::BOOL), ("c", wk::NAT)],
    );

    for (key, entries) in [
        ("(|Int, Bool|)", &[wk::INT, wk::BOOL][..]),
        ("(|Nat, Bool|)", &[wk::NAT, wk::BOOL][..]),
        ("(|Int|)", &[wk::INT][..]),
        ("(|Bool|)", &[wk::BOOL][..]),
        ("(|Nat|)", &[wk::NAT][..]),
        ("(|Int, Nat|)", &[wk::INT, wk::NAT][..]),
        ("(|Nat, Int|)", &[wk::NAT, wk::INT][..]),
    ] {
        let names: Vec<String> = (0..entries.len()).map(|i| i.to_string()).collect();
        let members: Vec<(&str, &str)> = names
            .iter()
            .map(String::as_str)
            .zip(entries.iter().copied())
            .collect();
        t.packed(key, LayoutKind::Struct, &members);
    }

    for concept in [
        wk::ANY,
        wk::SOME,
        wk::IOPTION,
        wk::TESTABLE_TYPE,
        wk::API_TYPE,
        wk::TUPLE,
        wk::RECORD,
        SHAPE,
        POLYGON,
    ] {
        union(&mut t, concept, LayoutKind::RefUnion);
    }
    union(&mut t, "Int | None", LayoutKind::InlineUnion);
    union(&mut t, "Main::Circle | Main::Square", LayoutKind::RefUnion);

    t
}

#[cfg(test)]
mod tests {
    use strata_mir::fixtures;

    use super::*;
    use crate::layout::LayoutOracle;

    #[test]
    fn every_fixture_type_has_a_layout() {
        let g = fixtures::graph();
        let t = layout_table();
        for key in g.types.keys() {
            assert!(t.layout(key).is_some(), "missing layout for `{key}`");
        }
    }

    #[test]
    fn entity_members_are_keyed_by_field() {
        let t = layout_table();
        let sq = t.layout(SQUARE).expect("square");
        assert_eq!(sq.size, 8);
        assert_eq!(sq.named("Main::Square.tag").expect("tag").offset, 8);
    }
}
