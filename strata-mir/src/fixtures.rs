#![forbid(unsafe_code)]

//! A small but complete program used by the tests of this crate and of its dependents.

use std::collections::BTreeMap;

use crate::well_known as wk;
use crate::{
    Argument, BasicBlock, Body, ConceptDecl, ConsField, ConstantDecl, ConstantValue, DeclHeader,
    EntityDecl, EntityKind, EnumEntity, FieldDecl, FunctionParameter, Inst, InstKind,
    InternalEntity, InvokeDecl, InvokeImpl, ObjectEntity, PrimitiveCollection, CollectionKind,
    Program, Register, SourceInfo, Terminator, TerminatorKind, Type, TypeGraph,
};

pub const SHAPE: &str = "Main::Shape";
pub const POLYGON: &str = "Main::Polygon";
pub const SQUARE: &str = "Main::Square";
pub const CIRCLE: &str = "Main::Circle";
pub const COLOR: &str = "Main::Color";
pub const EMAIL: &str = "StringOf<Main::EmailValidator>";
pub const EMAIL_VALIDATOR: &str = "Main::EmailValidator";
pub const LIST_INT: &str = "List<Int>";
pub const STACK_INT: &str = "Stack<Int>";
pub const MAP_STRING_INT: &str = "Map<String, Int>";
pub const ADD_INT: &str = "__i__Core::+=infix=(Int, Int)";
pub const GT_INT: &str = "__i__Core::>=infix=(Int, Int)";
pub const LIMIT: &str = "Main::limit";

fn header(tkey: &str, ns: &str, provides: &[&str]) -> DeclHeader {
    let name = tkey.rsplit("::").next().unwrap_or(tkey).to_string();
    DeclHeader {
        tkey: tkey.to_string(),
        ns: ns.to_string(),
        name,
        attributes: Vec::new(),
        terms: BTreeMap::new(),
        provides: provides.iter().map(|p| p.to_string()).collect(),
    }
}

fn concept(g: &mut TypeGraph, key: &str, ns: &str, provides: &[&str]) {
    g.add_concept(ConceptDecl {
        header: header(key, ns, provides),
    });
}

fn entity(g: &mut TypeGraph, key: &str, ns: &str, provides: &[&str], kind: EntityKind) {
    g.add_entity(EntityDecl {
        header: header(key, ns, provides),
        kind,
    });
}

fn primitive(g: &mut TypeGraph, key: &str, provides: &[&str]) {
    entity(g, key, "Core", provides, EntityKind::Internal(InternalEntity::Primitive));
}

fn collection(g: &mut TypeGraph, key: &str, kind: CollectionKind, binds: &[(&str, &str)]) {
    let binds = binds
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    entity(
        g,
        key,
        "Core",
        &[wk::SOME, wk::API_TYPE],
        EntityKind::Internal(InternalEntity::Collection(PrimitiveCollection { kind, binds })),
    );
}

fn field(g: &mut TypeGraph, enclosing: &str, fname: &str, declared: &str) -> String {
    let fkey = format!("{enclosing}.{fname}");
    g.add_field(FieldDecl {
        enclosing: enclosing.to_string(),
        fkey: fkey.clone(),
        fname: fname.to_string(),
        is_optional: false,
        declared_type: declared.to_string(),
    });
    fkey
}

pub fn int() -> Type {
    Type::entity(wk::INT)
}

pub fn nat() -> Type {
    Type::entity(wk::NAT)
}

pub fn bool_() -> Type {
    Type::entity(wk::BOOL)
}

pub fn none() -> Type {
    Type::entity(wk::NONE)
}

/// The fixture type graph.
pub fn graph() -> TypeGraph {
    let mut g = TypeGraph::new();

    concept(&mut g, wk::ANY, "Core", &[]);
    concept(&mut g, wk::SOME, "Core", &[wk::ANY]);
    concept(&mut g, wk::IOPTION, "Core", &[wk::ANY]);
    concept(&mut g, wk::TESTABLE_TYPE, "Core", &[wk::ANY]);
    concept(&mut g, wk::API_TYPE, "Core", &[wk::TESTABLE_TYPE]);
    concept(&mut g, wk::TUPLE, "Core", &[wk::SOME]);
    concept(&mut g, wk::RECORD, "Core", &[wk::SOME]);
    concept(&mut g, SHAPE, "Main", &[wk::SOME, wk::API_TYPE]);
    concept(&mut g, POLYGON, "Main", &[SHAPE]);

    primitive(&mut g, wk::NONE, &[wk::ANY, wk::API_TYPE]);
    primitive(&mut g, wk::NOTHING, &[wk::ANY, wk::API_TYPE]);
    for key in [wk::BOOL, wk::INT, wk::NAT, wk::STRING, wk::FLOAT] {
        primitive(&mut g, key, &[wk::SOME, wk::API_TYPE]);
    }
    primitive(&mut g, wk::REGEX, &[wk::SOME]);
    primitive(&mut g, EMAIL_VALIDATOR, &[wk::SOME]);
    g.validator_regexs
        .insert(EMAIL_VALIDATOR.to_string(), "/[a-z]+@[a-z]+\\.org/".to_string());
    entity(
        &mut g,
        EMAIL,
        "Core",
        &[wk::SOME, wk::API_TYPE],
        EntityKind::Internal(InternalEntity::StringOf {
            validator: EMAIL_VALIDATOR.to_string(),
        }),
    );

    collection(&mut g, LIST_INT, CollectionKind::List, &[("T", wk::INT)]);
    collection(&mut g, STACK_INT, CollectionKind::Stack, &[("T", wk::INT)]);
    collection(
        &mut g,
        MAP_STRING_INT,
        CollectionKind::Map,
        &[("K", wk::STRING), ("V", wk::INT)],
    );

    entity(
        &mut g,
        COLOR,
        "Main",
        &[wk::SOME, wk::API_TYPE],
        EntityKind::Enum(EnumEntity {
            enums: vec!["Red".to_string(), "Green".to_string()],
        }),
    );

    let side = field(&mut g, SQUARE, "side", wk::INT);
    let tag = field(&mut g, SQUARE, "tag", wk::BOOL);
    entity(
        &mut g,
        SQUARE,
        "Main",
        &[POLYGON],
        EntityKind::Object(ObjectEntity {
            fields: vec![side.clone(), tag.clone()],
            consfunc: format!("{SQUARE}@@cons"),
            consfuncfields: vec![
                ConsField { cfkey: side, isoptional: false },
                ConsField { cfkey: tag, isoptional: false },
            ],
            validatefunc: None,
            hasconsinvariants: false,
        }),
    );

    let radius = field(&mut g, CIRCLE, "radius", wk::NAT);
    let filled = field(&mut g, CIRCLE, "filled", wk::BOOL);
    entity(
        &mut g,
        CIRCLE,
        "Main",
        &[SHAPE],
        EntityKind::Object(ObjectEntity {
            fields: vec![radius.clone(), filled.clone()],
            consfunc: format!("{CIRCLE}@@cons"),
            consfuncfields: vec![
                ConsField { cfkey: radius, isoptional: false },
                ConsField { cfkey: filled, isoptional: false },
            ],
            validatefunc: Some(format!("{CIRCLE}@@validate")),
            hasconsinvariants: true,
        }),
    );

    for ty in [
        Type::tuple(vec![int(), bool_()]),
        Type::tuple(vec![bool_(), int()]),
        Type::tuple(vec![int()]),
        Type::tuple(vec![nat(), bool_()]),
        Type::tuple(vec![int(), bool_(), int()]),
        Type::record([("a", int()), ("b", bool_())]),
        Type::record([("c", nat())]),
        Type::record([("a", int()), ("b", bool_()), ("c", nat())]),
        Type::ephemeral(vec![int(), bool_()]),
        Type::ephemeral(vec![nat(), bool_()]),
        Type::ephemeral(vec![int()]),
        Type::ephemeral(vec![bool_()]),
        Type::ephemeral(vec![nat()]),
        Type::ephemeral(vec![int(), nat()]),
        Type::ephemeral(vec![nat(), int()]),
        Type::concept([wk::TUPLE]),
        Type::concept([wk::RECORD]),
        Type::join([&int(), &none()]).unwrap_or_else(int),
        Type::join([&Type::entity(SQUARE), &Type::entity(CIRCLE)]).unwrap_or_else(int),
    ] {
        g.add_type(ty);
    }

    g.type_aliases
        .insert("Main::Pair".to_string(), Type::tuple(vec![int(), bool_()]));
    g.namespace_remap
        .insert("Main".to_string(), "Main".to_string());

    g
}

pub fn reg(name: &str) -> Register {
    Register::new(name)
}

pub fn arg(name: &str) -> Argument {
    Argument::Register(Register::new(name))
}

pub fn inst(kind: InstKind) -> Inst {
    Inst {
        sinfo: SourceInfo::default(),
        kind,
    }
}

pub fn term(kind: TerminatorKind) -> Option<Terminator> {
    Some(Terminator {
        sinfo: SourceInfo::default(),
        kind,
    })
}

pub fn jump(to: &str) -> Option<Terminator> {
    term(TerminatorKind::Jump {
        trgtblock: to.to_string(),
    })
}

pub fn block(label: &str, insts: Vec<Inst>, term: Option<Terminator>) -> BasicBlock {
    BasicBlock {
        label: label.to_string(),
        insts,
        term,
    }
}

pub fn body(blocks: Vec<BasicBlock>) -> Body {
    let mut all: Vec<BasicBlock> = blocks;
    if !all.iter().any(|b| b.label == wk::EXIT_BLOCK) {
        all.push(block(wk::EXIT_BLOCK, Vec::new(), None));
    }
    Body {
        blocks: all.into_iter().map(|b| (b.label.clone(), b)).collect(),
    }
}

pub fn function(
    ikey: &str,
    params: &[(&str, &str)],
    result_type: &str,
    body: Body,
) -> InvokeDecl {
    InvokeDecl {
        ikey: ikey.to_string(),
        shortname: ikey.rsplit("::").next().unwrap_or(ikey).to_string(),
        enclosing: None,
        src_file: "main.bsq".to_string(),
        sinfo_start: SourceInfo::default(),
        sinfo_end: SourceInfo::default(),
        recursive: false,
        params: params
            .iter()
            .map(|(name, ptype)| FunctionParameter {
                name: name.to_string(),
                ptype: ptype.to_string(),
            })
            .collect(),
        result_type: result_type.to_string(),
        implementation: InvokeImpl::Body { masksize: 0, body },
    }
}

fn primitive_invoke(ikey: &str, implkey: &str, params: &[(&str, &str)], result_type: &str) -> InvokeDecl {
    let mut decl = function(ikey, params, result_type, Body::default());
    decl.implementation = InvokeImpl::Primitive {
        implkey: implkey.to_string(),
        binds: BTreeMap::new(),
        pcodes: BTreeMap::new(),
    };
    decl
}

/// `return a` for a single parameter.
fn identity_body(param: &str, oftype: &str) -> Body {
    body(vec![block(
        wk::ENTRY_BLOCK,
        vec![inst(InstKind::ReturnAssign {
            name: reg(wk::RETURN_SLOT),
            src: arg(param),
            oftype: oftype.to_string(),
        })],
        jump(wk::EXIT_BLOCK),
    )])
}

/// The fixture graph plus constructors, operator stubs and one global constant.
pub fn program() -> Program {
    let mut p = Program::new(graph());

    p.add_invoke(primitive_invoke(
        &format!("{SQUARE}@@cons"),
        "entity_cons",
        &[("side", wk::INT), ("tag", wk::BOOL)],
        SQUARE,
    ));
    p.add_invoke(primitive_invoke(
        &format!("{CIRCLE}@@cons"),
        "entity_cons",
        &[("radius", wk::NAT), ("filled", wk::BOOL)],
        CIRCLE,
    ));
    p.add_invoke(primitive_invoke(ADD_INT, "default", &[("a", wk::INT), ("b", wk::INT)], wk::INT));
    p.add_invoke(primitive_invoke(GT_INT, "default", &[("a", wk::INT), ("b", wk::INT)], wk::BOOL));

    let init = format!("{LIMIT}@@init");
    p.add_invoke(function(
        &init,
        &[],
        wk::INT,
        body(vec![block(
            wk::ENTRY_BLOCK,
            vec![inst(InstKind::ReturnAssign {
                name: reg(wk::RETURN_SLOT),
                src: Argument::Constant(ConstantValue::Int("10".to_string())),
                oftype: wk::INT.to_string(),
            })],
            jump(wk::EXIT_BLOCK),
        )]),
    ));
    p.add_invoke(function("Main::id", &[("a", wk::INT)], wk::INT, identity_body("a", wk::INT)));
    p.add_constant(ConstantDecl {
        gkey: LIMIT.to_string(),
        shortname: "limit".to_string(),
        declared_type: wk::INT.to_string(),
        ivalue: init,
    });

    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_program_validates() {
        program().validate().expect("fixture program is well formed");
    }

    #[test]
    fn fixture_program_round_trips_through_json() {
        let p = program();
        let text = p.to_json().expect("serialize");
        let back = Program::from_json(&text).expect("deserialize");
        assert_eq!(back, p);
        assert_eq!(
            back.graph.types.keys().collect::<Vec<_>>(),
            p.graph.types.keys().collect::<Vec<_>>()
        );
    }
}
