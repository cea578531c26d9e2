#![forbid(unsafe_code)]

//! Frame, guard-mask and constant-pool bookkeeping shared by every lowered function.
//!
//! The frame and mask pool are reset by [`LoweringContext::begin_function`]; the
//! constant pool lives for the whole program.

use rustc_hash::FxHashMap;
use strata_mir::{well_known as wk, ConstantValue, GlobalKey, Program, TypeKey};
use tracing::debug;

use crate::bytecode::{Argument, ConstEntry, ConstKind, ConstPoolLayout, TargetVar};
use crate::layout::{LayoutInfo, LayoutOracle};
use crate::LowerError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSlot {
    pub offset: u32,
    pub name: String,
    pub storage: TypeKey,
}

#[derive(Debug, Default)]
pub struct FrameLayout {
    map: FxHashMap<String, u32>,
    size: u32,
    slots: Vec<FrameSlot>,
}

impl FrameLayout {
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    pub fn storage(&self, name: &str) -> Option<&TypeKey> {
        self.slots.iter().find(|s| s.name == name).map(|s| &s.storage)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    fn allocate(&mut self, name: &str, info: &LayoutInfo) -> u32 {
        if let Some(offset) = self.lookup(name) {
            return offset;
        }

        let offset = self.size;
        self.slots.push(FrameSlot {
            offset,
            name: name.to_string(),
            storage: info.tkey.clone(),
        });
        self.map.insert(name.to_string(), offset);
        self.size += info.size;
        offset
    }

    fn scratch(&mut self, info: &LayoutInfo) -> u32 {
        let name = format!("@scalar_scratch_{}", self.slots.len());
        self.allocate(&name, info)
    }
}

#[derive(Debug)]
struct MaskRegion {
    offset: u32,
    occupied: bool,
    name: String,
    size: u32,
}

/// Guard-mask bit regions with first-fit reuse of released regions of the same size.
#[derive(Debug, Default)]
pub struct MaskPool {
    regions: Vec<MaskRegion>,
    map: FxHashMap<String, u32>,
    size: u32,
}

impl MaskPool {
    pub fn region(&mut self, name: &str, count: u32) -> u32 {
        let offset = match self
            .regions
            .iter_mut()
            .find(|r| !r.occupied && r.size == count)
        {
            Some(free) => {
                free.occupied = true;
                free.name = name.to_string();
                free.offset
            }
            None => {
                let offset = self.size;
                self.regions.push(MaskRegion {
                    offset,
                    occupied: true,
                    name: name.to_string(),
                    size: count,
                });
                self.size += count;
                offset
            }
        };

        self.map.insert(name.to_string(), offset);
        offset
    }

    pub fn offset(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    /// Returns false if no live region has that name.
    pub fn release(&mut self, name: &str) -> bool {
        match self.regions.iter_mut().find(|r| r.occupied && r.name == name) {
            Some(r) => {
                r.occupied = false;
                self.map.remove(name);
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    literals: FxHashMap<(String, TypeKey), u32>,
    globals: FxHashMap<GlobalKey, u32>,
    size: u32,
    entries: Vec<ConstEntry>,
}

impl ConstantPool {
    /// Reserves `none`, `nothing`, `true` and `false`, then every global in key order.
    pub fn new(program: &Program, oracle: &dyn LayoutOracle) -> Result<Self, LowerError> {
        let mut pool = ConstantPool::default();

        for value in [
            ConstantValue::None,
            ConstantValue::Nothing,
            ConstantValue::True,
            ConstantValue::False,
        ] {
            pool.literal(&value, oracle)?;
        }

        for (gkey, decl) in &program.constants {
            let info = required(oracle, &decl.declared_type)?;
            let offset = pool.push(gkey.clone(), info, ConstKind::Global);
            pool.globals.insert(gkey.clone(), offset);
        }

        Ok(pool)
    }

    fn push(&mut self, value: String, info: &LayoutInfo, kind: ConstKind) -> u32 {
        let offset = self.size;
        self.entries.push(ConstEntry {
            offset,
            storage: info.tkey.clone(),
            value,
            kind,
        });
        self.size += info.size;
        offset
    }

    pub fn literal(&mut self, value: &ConstantValue, oracle: &dyn LayoutOracle) -> Result<u32, LowerError> {
        let key = value.literal_key();
        if let Some(offset) = self.literals.get(&key) {
            return Ok(*offset);
        }

        let info = required(oracle, &key.1)?;
        let offset = self.push(key.0.clone(), info, ConstKind::Literal);
        debug!(literal = %key.0, tkey = %key.1, offset, "registered constant");
        self.literals.insert(key, offset);
        Ok(offset)
    }

    pub fn global(&self, gkey: &str) -> Option<u32> {
        self.globals.get(gkey).copied()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn layout(&self) -> ConstPoolLayout {
        ConstPoolLayout {
            size: self.size,
            entries: self.entries.clone(),
        }
    }
}

fn required<'o>(oracle: &'o dyn LayoutOracle, tkey: &str) -> Result<&'o LayoutInfo, LowerError> {
    oracle
        .layout(tkey)
        .ok_or_else(|| LowerError::malformed(format!("no layout for `{tkey}`")))
}

pub struct LoweringContext<'a> {
    oracle: &'a dyn LayoutOracle,
    frame: FrameLayout,
    masks: MaskPool,
    consts: ConstantPool,
}

impl<'a> LoweringContext<'a> {
    pub fn new(program: &Program, oracle: &'a dyn LayoutOracle) -> Result<Self, LowerError> {
        Ok(Self {
            oracle,
            frame: FrameLayout::default(),
            masks: MaskPool::default(),
            consts: ConstantPool::new(program, oracle)?,
        })
    }

    /// Drops the per-function frame and mask state. The constant pool is kept.
    pub fn begin_function(&mut self) {
        self.frame = FrameLayout::default();
        self.masks = MaskPool::default();
    }

    pub fn layout(&self, tkey: &str) -> Result<&'a LayoutInfo, LowerError> {
        required(self.oracle, tkey)
    }

    /// Offset of `name`, allocating it on first reference.
    pub fn slot_for(&mut self, name: &str, tkey: &str) -> Result<TargetVar, LowerError> {
        if let Some(offset) = self.frame.lookup(name) {
            return Ok(TargetVar { offset });
        }
        let info = self.layout(tkey)?;
        Ok(TargetVar {
            offset: self.frame.allocate(name, info),
        })
    }

    /// A fresh anonymous slot.
    pub fn scratch(&mut self, tkey: &str) -> Result<(TargetVar, Argument), LowerError> {
        let info = self.layout(tkey)?;
        let offset = self.frame.scratch(info);
        Ok((TargetVar { offset }, Argument::Stack(offset)))
    }

    /// Offset of an already allocated variable.
    pub fn offset_of(&self, name: &str) -> Result<u32, LowerError> {
        self.frame
            .lookup(name)
            .ok_or_else(|| LowerError::malformed(format!("use of unallocated variable `{name}`")))
    }

    pub fn stack_arg(&self, name: &str) -> Result<Argument, LowerError> {
        self.offset_of(name).map(Argument::Stack)
    }

    pub fn constant_for(&mut self, value: &ConstantValue) -> Result<Argument, LowerError> {
        self.consts.literal(value, self.oracle).map(Argument::Const)
    }

    pub fn true_constant(&mut self) -> Result<Argument, LowerError> {
        self.constant_for(&ConstantValue::True)
    }

    pub fn global_for(&self, gkey: &str) -> Result<Argument, LowerError> {
        self.consts
            .global(gkey)
            .map(Argument::Const)
            .ok_or_else(|| LowerError::malformed(format!("unknown global constant `{gkey}`")))
    }

    pub fn mask_region(&mut self, name: &str, count: u32) -> u32 {
        self.masks.region(name, count)
    }

    pub fn mask_offset(&self, name: &str) -> Result<u32, LowerError> {
        self.masks
            .offset(name)
            .ok_or_else(|| LowerError::malformed(format!("guard mask `{name}` was never declared")))
    }

    pub fn release_mask(&mut self, name: &str) -> bool {
        self.masks.release(name)
    }

    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    pub fn frame_size(&self) -> u32 {
        self.frame.size()
    }

    pub fn mask_size(&self) -> u32 {
        self.masks.size()
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.consts
    }

    /// Storage type of a slot, used for home-location copies.
    pub fn storage_of(&self, name: &str) -> Result<TypeKey, LowerError> {
        self.frame
            .storage(name)
            .cloned()
            .ok_or_else(|| LowerError::malformed(format!("use of unallocated variable `{name}`")))
    }

    pub fn is_reserved_name(name: &str) -> bool {
        name.starts_with(wk::TEMP_PREFIX) || name == wk::RETURN_SLOT || name == wk::IR_RETURN_SLOT
    }
}

#[cfg(test)]
mod tests {
    use strata_mir::{fixtures, ConstantDecl};

    use super::*;
    use crate::layout::LayoutTable;

    fn table() -> LayoutTable {
        let mut t = LayoutTable::new();
        t.scalar("None", 1);
        t.scalar("Nothing", 2);
        t.scalar("Bool", 1);
        t.scalar("Int", 8);
        t.scalar("Nat", 8);
        t.scalar("String", 16);
        t
    }

    #[test]
    fn reserved_literals_sit_at_fixed_offsets() {
        let t = table();
        let program = Program::new(fixtures::graph());
        let mut ctx = LoweringContext::new(&program, &t).expect("context");

        assert_eq!(ctx.constant_for(&ConstantValue::None).expect("none"), Argument::Const(0));
        assert_eq!(ctx.constant_for(&ConstantValue::Nothing).expect("nothing"), Argument::Const(1));
        assert_eq!(ctx.constant_for(&ConstantValue::True).expect("true"), Argument::Const(3));
        assert_eq!(ctx.constant_for(&ConstantValue::False).expect("false"), Argument::Const(4));
        assert_eq!(ctx.constants().size(), 5);
    }

    #[test]
    fn globals_follow_the_reserved_block_and_literals_dedup() {
        let t = table();
        let mut program = Program::new(fixtures::graph());
        for g in ["Main::b", "Main::a"] {
            program.add_constant(ConstantDecl {
                gkey: g.to_string(),
                shortname: g.to_string(),
                declared_type: "Int".to_string(),
                ivalue: format!("{g}@@init"),
            });
        }
        let mut ctx = LoweringContext::new(&program, &t).expect("context");

        assert_eq!(ctx.global_for("Main::a").expect("a"), Argument::Const(5));
        assert_eq!(ctx.global_for("Main::b").expect("b"), Argument::Const(13));
        assert!(ctx.global_for("Main::c").is_err());

        let five = ConstantValue::Int("5".to_string());
        let first = ctx.constant_for(&five).expect("literal");
        assert_eq!(first, Argument::Const(21));
        assert_eq!(ctx.constant_for(&five).expect("again"), first);

        // Same text, different type: a separate entry.
        let nat = ctx.constant_for(&ConstantValue::Nat("5".to_string())).expect("nat");
        assert_ne!(nat, first);
        assert_eq!(ctx.constants().layout().entries.len(), 8);
    }

    #[test]
    fn slots_are_stable_and_reset_per_function() {
        let t = table();
        let program = Program::new(fixtures::graph());
        let mut ctx = LoweringContext::new(&program, &t).expect("context");

        let x = ctx.slot_for("x", "Int").expect("x");
        let b = ctx.slot_for("b", "Bool").expect("b");
        assert_eq!((x.offset, b.offset), (0, 8));
        assert_eq!(ctx.slot_for("x", "Int").expect("again"), x);
        let (s, sa) = ctx.scratch("Int").expect("scratch");
        assert_eq!(s.offset, 9);
        assert_eq!(sa, Argument::Stack(9));
        assert_eq!(ctx.frame_size(), 17);
        assert!(ctx.frame().slots()[2].name.starts_with("@scalar_scratch_"));

        ctx.begin_function();
        assert_eq!(ctx.frame_size(), 0);
        assert!(ctx.stack_arg("x").is_err());
        assert_eq!(ctx.constant_for(&ConstantValue::True).expect("kept"), Argument::Const(3));
    }

    #[test]
    fn mask_regions_reuse_released_space_first_fit() {
        let mut m = MaskPool::default();
        let a = m.region("a", 2);
        let b = m.region("b", 3);
        assert_eq!((a, b), (0, 2));

        assert!(m.release("a"));
        assert!(!m.release("a"));
        assert_eq!(m.offset("a"), None);

        // Wrong size does not fit the freed region.
        assert_eq!(m.region("c", 3), 5);
        // Exact size does.
        assert_eq!(m.region("d", 2), 0);
        assert_eq!(m.size(), 8);
    }

    #[test]
    fn missing_layouts_are_malformed() {
        let t = table();
        let program = Program::new(fixtures::graph());
        let mut ctx = LoweringContext::new(&program, &t).expect("context");
        let err = ctx.slot_for("f", "Float").expect_err("no layout");
        assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);
    }

    #[test]
    fn reserved_names_are_recognized() {
        assert!(LoweringContext::is_reserved_name("@tmp_3"));
        assert!(LoweringContext::is_reserved_name("$$return"));
        assert!(LoweringContext::is_reserved_name("$__ir_ret__"));
        assert!(!LoweringContext::is_reserved_name("x"));
    }
}
