//! Per-function def-use indexing for the escape analysis.

use rustc_hash::FxHashMap;

use super::{Function, Inst};

/// Position of an instruction inside a function.
pub type InstPos = (usize, usize);

/// Maps every SSA name to its defining instruction and its uses.
pub struct DefUse {
    defs: FxHashMap<String, InstPos>,
    uses: FxHashMap<String, Vec<InstPos>>,
}

impl DefUse {
    pub fn build(func: &Function) -> Self {
        let mut defs = FxHashMap::default();
        let mut uses: FxHashMap<String, Vec<InstPos>> = FxHashMap::default();

        for (block_idx, block) in func.blocks.iter().enumerate() {
            for (inst_idx, inst) in block.insts.iter().enumerate() {
                let pos = (block_idx, inst_idx);
                if let Some(result) = &inst.result {
                    defs.insert(result.clone(), pos);
                }
                for operand in inst.operands() {
                    if let Some(name) = operand.as_local() {
                        uses.entry(name.to_owned()).or_default().push(pos);
                    }
                }
            }
        }

        Self { defs, uses }
    }

    pub fn def(&self, name: &str) -> Option<InstPos> {
        self.defs.get(name).copied()
    }

    pub fn uses(&self, name: &str) -> &[InstPos] {
        self.uses.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inst_at<'f>(&self, func: &'f Function, pos: InstPos) -> Option<&'f Inst> {
        func.blocks.get(pos.0)?.insts.get(pos.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    #[test]
    fn defs_and_uses_are_indexed() {
        let src = "define i32 @f(i32 %x) {\n  %1 = alloca i32, align 4\n  store i32 %x, ptr %1, align 4\n  %2 = load i32, ptr %1, align 4\n  ret i32 %2\n}\n";
        let module = parse_module(src).unwrap();
        let func = module.functions().next().unwrap();
        let du = DefUse::build(func);

        assert_eq!(du.def("1"), Some((0, 0)));
        assert_eq!(du.def("2"), Some((0, 2)));
        assert_eq!(du.uses("1").len(), 2);
        assert_eq!(du.uses("2"), &[(0, 3)]);
        assert_eq!(du.uses("x"), &[(0, 1)]);

        let load = du.inst_at(func, (0, 2)).unwrap();
        assert_eq!(load.result.as_deref(), Some("2"));
    }
}
