#![forbid(unsafe_code)]

//! Out-of-line functions for structural operations whose operand shape is only
//! known through a concept or union, or that need element coercions.

use std::collections::{BTreeSet, VecDeque};

use strata_mir::{FieldKey, FlowLayout, TypeKey};
use tracing::debug;

/// What to generate for one canonical name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Specialization {
    TupleProject {
        flow: TypeKey,
        indices: Vec<usize>,
        result: TypeKey,
    },
    RecordProject {
        flow: TypeKey,
        properties: Vec<String>,
        result: TypeKey,
    },
    EntityProject {
        flow: TypeKey,
        fields: Vec<FieldKey>,
        result: TypeKey,
    },
    TupleUpdate {
        flow: TypeKey,
        updates: Vec<(usize, TypeKey)>,
        result: TypeKey,
    },
    RecordUpdate {
        flow: TypeKey,
        updates: Vec<(String, TypeKey)>,
        result: TypeKey,
    },
    EntityUpdate {
        flow: TypeKey,
        updates: Vec<(FieldKey, TypeKey)>,
        result: TypeKey,
    },
    /// Rebuilds the entity through its constructor so invariants are rechecked.
    EntityUpdateWithInvariantCheck {
        entity: TypeKey,
        updates: Vec<(FieldKey, TypeKey)>,
        result: TypeKey,
    },
    ListEmpty {
        result: TypeKey,
    },
    MapEmpty {
        result: TypeKey,
    },
    ListSingletons {
        argc: usize,
        result: TypeKey,
    },
    MapSingleton {
        argtuple: TypeKey,
        result: TypeKey,
    },
    TupleAppend {
        args: Vec<FlowLayout>,
        result: TypeKey,
    },
    RecordMerge {
        args: Vec<FlowLayout>,
        result: TypeKey,
    },
}

fn typed<K: std::fmt::Display>(entries: &[(K, TypeKey)]) -> String {
    entries
        .iter()
        .map(|(k, t)| format!("({k} {t})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn flow_layouts(args: &[FlowLayout]) -> String {
    args.iter()
        .map(|fl| format!("({} {})", fl.flow, fl.layout))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Specialization {
    /// Canonical name. Two requests with the same name generate one function.
    pub fn name(&self) -> String {
        match self {
            Specialization::TupleProject {
                flow,
                indices,
                result,
            } => {
                let idxs = indices.iter().map(usize::to_string).collect::<Vec<_>>();
                format!("$TupleProject_{flow}.[{}]->{result}", idxs.join(", "))
            }
            Specialization::RecordProject {
                flow,
                properties,
                result,
            } => format!("$RecordProject_{flow}.{{{}}}->{result}", properties.join(", ")),
            Specialization::EntityProject {
                flow,
                fields,
                result,
            } => format!("$EntityProject_{flow}.{{{}}}->{result}", fields.join(", ")),
            Specialization::TupleUpdate {
                flow,
                updates,
                result,
            } => format!("$TupleUpdate_{flow}.[{}]->{result}", typed(updates)),
            Specialization::RecordUpdate {
                flow,
                updates,
                result,
            } => format!("$RecordUpdate_{flow}.{{{}}}->{result}", typed(updates)),
            Specialization::EntityUpdate {
                flow,
                updates,
                result,
            } => format!("$EntityUpdate_{flow}.{{{}}}->{result}", typed(updates)),
            Specialization::EntityUpdateWithInvariantCheck {
                entity,
                updates,
                result,
            } => format!(
                "$EntityUpdateDirectWithInvariantCheck_{entity}.{{{}}}->{result}",
                typed(updates)
            ),
            Specialization::ListEmpty { result } => format!("$ListEmptyCons->{result}"),
            Specialization::MapEmpty { result } => format!("$MapEmptyCons->{result}"),
            Specialization::ListSingletons { argc, result } => {
                format!("$ListSingletonCons->{result}#{argc}")
            }
            Specialization::MapSingleton { result, .. } => format!("$MapSingletonCons->{result}"),
            Specialization::TupleAppend { args, result } => {
                format!("$TupleAppend_{{{}}}->{result}", flow_layouts(args))
            }
            Specialization::RecordMerge { args, result } => {
                format!("$RecordMerge_{{{}}}->{result}", flow_layouts(args))
            }
        }
    }

    /// Virtual families are called through `InvokeVirtualFunction` and generate one
    /// `{name}@{shape}` function per concrete operand shape.
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            Specialization::TupleProject { .. }
                | Specialization::RecordProject { .. }
                | Specialization::EntityProject { .. }
                | Specialization::TupleUpdate { .. }
                | Specialization::RecordUpdate { .. }
                | Specialization::EntityUpdate { .. }
        )
    }
}

/// Program-wide set of requested names plus the queue of those not yet generated.
#[derive(Debug, Default)]
pub struct SpecializationRegistry {
    names: BTreeSet<String>,
    queue: VecDeque<(String, Specialization)>,
}

impl SpecializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec` if its name is new and returns the name either way.
    pub fn request(&mut self, spec: Specialization) -> String {
        let name = spec.name();
        if self.names.insert(name.clone()) {
            debug!(%name, "registered specialization");
            self.queue.push_back((name.clone(), spec));
        }
        name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.queue.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Takes every queued request. Requests made while processing them land in the
    /// next drain.
    pub fn drain(&mut self) -> Vec<(String, Specialization)> {
        self.queue.drain(..).collect()
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
