//! Bounds-check insertion.
//!
//! Every load, store, atomic access and memory intrinsic in user code gets
//! a `__ct_check_bounds(base, ptr, size, site, is_write)` call in front of
//! it. The base pointer is resolved by stripping casts and GEPs; when that
//! lands on a load from a stack slot with a single stored value, the store's
//! source is followed instead, so checks compare against the allocation the
//! pointer actually came from. Memory transfers get two checks (write side
//! and read side); zero-length constant accesses are skipped.

use std::convert::Infallible;

use crate::ir::{Callee, DefUse, Function, Module, Op, Type, ValueRef};
use crate::logger::Logger;
use crate::passes::common::{should_instrument, Inserter, SiteInterner};
use crate::passes::Pass;

pub struct BoundsPass {
    checks: usize,
}

impl BoundsPass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { checks: 0 }
    }
}

/// Strip bitcasts, address-space casts and GEPs, following SSA defs.
fn strip_casts_and_geps<'f>(func: &'f Function, defuse: &DefUse, value: &'f ValueRef) -> ValueRef {
    let mut current = value.clone();
    for _ in 0..64 {
        let Some(name) = current.as_local() else {
            break;
        };
        let Some(pos) = defuse.def(name) else {
            break;
        };
        let Some(inst) = defuse.inst_at(func, pos) else {
            break;
        };
        match &inst.op {
            Op::Cast { kind, value, .. }
                if matches!(
                    kind,
                    crate::ir::CastKind::Bitcast | crate::ir::CastKind::AddrSpaceCast
                ) =>
            {
                current = value.clone();
            }
            Op::Gep { ptr, .. } => {
                current = ptr.clone();
            }
            _ => break,
        }
    }
    current
}

/// The single value stored to an alloca, if there is exactly one store.
fn single_stored_value<'f>(
    func: &'f Function,
    defuse: &DefUse,
    alloca: &str,
) -> Option<ValueRef> {
    let mut stored = None;
    for &pos in defuse.uses(alloca) {
        let inst = defuse.inst_at(func, pos)?;
        if let Op::Store { value, ptr, .. } = &inst.op {
            if ptr.as_local() == Some(alloca) {
                if stored.is_some() {
                    return None;
                }
                stored = Some(value.clone());
            }
        }
    }
    stored
}

/// Resolve the base pointer reported to the runtime.
fn resolve_base(func: &Function, defuse: &DefUse, ptr: &ValueRef) -> ValueRef {
    let base = strip_casts_and_geps(func, defuse, ptr);

    // A load from a single-store stack slot: report the stored pointer.
    let loaded_from = base.as_local().and_then(|name| {
        let pos = defuse.def(name)?;
        let inst = defuse.inst_at(func, pos)?;
        match &inst.op {
            Op::Load { ptr, .. } => Some(ptr.clone()),
            _ => None,
        }
    });
    let Some(load_src) = loaded_from else {
        return base;
    };

    let slot = strip_casts_and_geps(func, defuse, &load_src);
    let is_alloca = slot.as_local().is_some_and(|name| {
        defuse
            .def(name)
            .and_then(|pos| defuse.inst_at(func, pos))
            .is_some_and(|inst| matches!(inst.op, Op::Alloca { .. }))
    });
    if !is_alloca {
        return base;
    }

    match slot
        .as_local()
        .and_then(|name| single_stored_value(func, defuse, name))
    {
        Some(stored) => strip_casts_and_geps(func, defuse, &stored),
        None => base,
    }
}

struct PendingCheck {
    block: usize,
    index: usize,
    base: ValueRef,
    ptr: ValueRef,
    size: SizeOperand,
    is_write: bool,
    dbg: Option<u64>,
}

enum SizeOperand {
    Const(u64),
    Value(ValueRef, Type),
}

fn mem_intrinsic_kind(callee: &Callee) -> Option<&'static str> {
    let Callee::Direct(name) = callee else {
        return None;
    };
    if name.starts_with("llvm.memset.") {
        Some("memset")
    } else if name.starts_with("llvm.memcpy.") {
        Some("memcpy")
    } else if name.starts_with("llvm.memmove.") {
        Some("memmove")
    } else {
        None
    }
}

impl Pass for BoundsPass {
    type Error = Infallible;

    fn name(&self) -> String {
        "BoundsPass".to_string()
    }

    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error> {
        module.ensure_declared(
            "__ct_check_bounds",
            "void @__ct_check_bounds(ptr, ptr, i64, ptr, i32)",
        );

        let targets: Vec<String> = module
            .functions()
            .filter(|func| should_instrument(module, func))
            .map(|func| func.name.clone())
            .collect();

        let mut interner = SiteInterner::default();
        let mut fresh_local = 0usize;

        for target in targets {
            // Collect first; interning sites needs the module mutably.
            let func = module
                .functions()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            let defuse = DefUse::build(func);
            let mut pending: Vec<PendingCheck> = Vec::new();

            for (block_idx, block) in func.blocks.iter().enumerate() {
                for (inst_idx, inst) in block.insts.iter().enumerate() {
                    match &inst.op {
                        Op::Load { ty, ptr } => {
                            let size = module.datalayout.store_size(ty, &module.types);
                            if size == 0 {
                                continue;
                            }
                            pending.push(PendingCheck {
                                block: block_idx,
                                index: inst_idx,
                                base: resolve_base(func, &defuse, ptr),
                                ptr: ptr.clone(),
                                size: SizeOperand::Const(size),
                                is_write: false,
                                dbg: inst.dbg,
                            });
                        }
                        Op::Store { ty, ptr, .. } => {
                            let size = module.datalayout.store_size(ty, &module.types);
                            if size == 0 {
                                continue;
                            }
                            pending.push(PendingCheck {
                                block: block_idx,
                                index: inst_idx,
                                base: resolve_base(func, &defuse, ptr),
                                ptr: ptr.clone(),
                                size: SizeOperand::Const(size),
                                is_write: true,
                                dbg: inst.dbg,
                            });
                        }
                        Op::AtomicRmw { ty, ptr, .. } => {
                            let size = module.datalayout.store_size(ty, &module.types);
                            pending.push(PendingCheck {
                                block: block_idx,
                                index: inst_idx,
                                base: resolve_base(func, &defuse, ptr),
                                ptr: ptr.clone(),
                                size: SizeOperand::Const(size),
                                is_write: true,
                                dbg: inst.dbg,
                            });
                        }
                        Op::CmpXchg { ty, ptr, .. } => {
                            let size = module.datalayout.store_size(ty, &module.types);
                            pending.push(PendingCheck {
                                block: block_idx,
                                index: inst_idx,
                                base: resolve_base(func, &defuse, ptr),
                                ptr: ptr.clone(),
                                size: SizeOperand::Const(size),
                                is_write: true,
                                dbg: inst.dbg,
                            });
                        }
                        Op::Call(call) => {
                            let Some(kind) = mem_intrinsic_kind(&call.callee) else {
                                continue;
                            };
                            if call.args.len() < 3 {
                                continue;
                            }
                            let (len_ty, len) = (&call.args[2].0, &call.args[2].1);
                            if let ValueRef::Const(text) = len {
                                if text == "0" {
                                    continue;
                                }
                            }
                            let size = SizeOperand::Value(len.clone(), len_ty.clone());

                            let dest = &call.args[0].1;
                            pending.push(PendingCheck {
                                block: block_idx,
                                index: inst_idx,
                                base: resolve_base(func, &defuse, dest),
                                ptr: dest.clone(),
                                size,
                                is_write: true,
                                dbg: inst.dbg,
                            });

                            if kind != "memset" {
                                let src = &call.args[1].1;
                                pending.push(PendingCheck {
                                    block: block_idx,
                                    index: inst_idx,
                                    base: resolve_base(func, &defuse, src),
                                    ptr: src.clone(),
                                    size: SizeOperand::Value(len.clone(), len_ty.clone()),
                                    is_write: false,
                                    dbg: inst.dbg,
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }

            if pending.is_empty() {
                continue;
            }

            // Intern sites up front, then splice the calls in.
            let mut inserter = Inserter::default();
            for check in pending {
                let site = interner.site_operand(module, check.dbg);
                let size_operand = match &check.size {
                    SizeOperand::Const(size) => size.to_string(),
                    SizeOperand::Value(value, ty) => match (value, ty) {
                        (ValueRef::Local(name), Type::Int(bits)) if *bits != 64 => {
                            let tmp = format!("ct.len.{fresh_local}");
                            fresh_local += 1;
                            inserter.before(
                                check.block,
                                check.index,
                                format!("%{tmp} = zext i{bits} %{name} to i64"),
                            );
                            format!("%{tmp}")
                        }
                        _ => value.render(),
                    },
                };
                inserter.before(
                    check.block,
                    check.index,
                    format!(
                        "call void @__ct_check_bounds(ptr {}, ptr {}, i64 {}, ptr {}, i32 {})",
                        check.base.render(),
                        check.ptr.render(),
                        size_operand,
                        site,
                        check.is_write as i32
                    ),
                );
                self.checks += 1;
            }

            let func = module
                .functions_mut()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            inserter.apply(func);
        }

        logger.debug(format!("inserted {} bounds checks", self.checks));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::logger::Logger;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        let logger = Logger::quiet();
        BoundsPass::new().run(&mut module, &logger).unwrap();
        module.print()
    }

    #[test]
    fn load_and_store_get_checks() {
        let out = run(
            "define i32 @f(ptr %p) {\n  store i32 7, ptr %p, align 4\n  %v = load i32, ptr %p, align 4\n  ret i32 %v\n}\n",
        );
        assert!(out
            .contains("call void @__ct_check_bounds(ptr %p, ptr %p, i64 4, ptr @.ct.site.0, i32 1)"));
        assert!(out
            .contains("call void @__ct_check_bounds(ptr %p, ptr %p, i64 4, ptr @.ct.site.0, i32 0)"));
        // The check precedes the access.
        assert!(out.find("i32 1)").unwrap() < out.find("store i32 7").unwrap());
    }

    #[test]
    fn base_strips_through_gep() {
        let out = run(
            "define void @g(ptr %p) {\n  %q = getelementptr inbounds i8, ptr %p, i64 4\n  store i8 1, ptr %q, align 1\n  ret void\n}\n",
        );
        assert!(out
            .contains("call void @__ct_check_bounds(ptr %p, ptr %q, i64 1, ptr @.ct.site.0, i32 1)"));
    }

    #[test]
    fn base_follows_single_store_stack_slot() {
        // The classic -O0 shape: malloc result parked in an alloca, then
        // reloaded before each use.
        let out = run(
            "define void @h() {\n  %slot = alloca ptr, align 8\n  %m = call ptr @malloc(i64 8)\n  store ptr %m, ptr %slot, align 8\n  %p = load ptr, ptr %slot, align 8\n  %q = getelementptr inbounds i8, ptr %p, i64 3\n  store i8 1, ptr %q, align 1\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
        );
        assert!(
            out.contains("call void @__ct_check_bounds(ptr %m, ptr %q, i64 1,"),
            "base should resolve to the stored malloc result: {out}"
        );
    }

    #[test]
    fn mem_transfer_gets_two_checks() {
        let out = run(
            "define void @t(ptr %d, ptr %s) {\n  call void @llvm.memcpy.p0.p0.i64(ptr align 1 %d, ptr align 1 %s, i64 16, i1 false)\n  ret void\n}\ndeclare void @llvm.memcpy.p0.p0.i64(ptr, ptr, i64, i1)\n",
        );
        assert!(out.contains("ptr %d, ptr %d, i64 16, ptr @.ct.site.0, i32 1"));
        assert!(out.contains("ptr %s, ptr %s, i64 16, ptr @.ct.site.0, i32 0"));
    }

    #[test]
    fn zero_length_memset_is_skipped() {
        let out = run(
            "define void @z(ptr %d) {\n  call void @llvm.memset.p0.i64(ptr %d, i8 0, i64 0, i1 false)\n  ret void\n}\ndeclare void @llvm.memset.p0.i64(ptr, i8, i64, i1)\n",
        );
        assert!(!out.contains("__ct_check_bounds(ptr %d"));
    }

    #[test]
    fn atomics_are_writes() {
        let out = run(
            "define void @a(ptr %p) {\n  %old = atomicrmw add ptr %p, i64 1 seq_cst, align 8\n  ret void\n}\n",
        );
        assert!(out.contains("call void @__ct_check_bounds(ptr %p, ptr %p, i64 8, ptr @.ct.site.0, i32 1)"));
    }
}
