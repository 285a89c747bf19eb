//! Virtual-call instrumentation.
//!
//! Indirect calls whose target was produced by the vptr dereference
//! pattern, `load (gep (load %this))`, get `__ct_vtable_dump` and/or
//! `__ct_vcall_trace` calls inserted in front, carrying the `this`
//! pointer, the raw call target, the site string and the static type name.
//! Opaque-pointer IR carries no static pointee type, so the static type is
//! the shared `<unknown>` constant; the runtime recovers the dynamic type
//! through RTTI.

use std::convert::Infallible;

use crate::ir::{Callee, CastKind, DefUse, Function, Module, Op, ValueRef};
use crate::logger::Logger;
use crate::passes::common::{should_instrument, Inserter, SiteInterner};
use crate::passes::Pass;

pub struct VtablePass {
    trace_calls: bool,
    dump_vtable: bool,
    instrumented: usize,
}

impl VtablePass {
    pub fn new(trace_calls: bool, dump_vtable: bool) -> Self {
        Self {
            trace_calls,
            dump_vtable,
            instrumented: 0,
        }
    }
}

fn strip_casts(func: &Function, defuse: &DefUse, value: &ValueRef) -> ValueRef {
    let mut current = value.clone();
    for _ in 0..16 {
        let Some(name) = current.as_local() else {
            break;
        };
        let Some(inst) = defuse.def(name).and_then(|pos| defuse.inst_at(func, pos)) else {
            break;
        };
        match &inst.op {
            Op::Cast { kind, value, .. }
                if matches!(kind, CastKind::Bitcast | CastKind::AddrSpaceCast) =>
            {
                current = value.clone();
            }
            _ => break,
        }
    }
    current
}

/// Match the vptr dereference chain and return the `this` pointer:
/// the call target must be `load (gep? (load %this))`.
fn this_from_call_target(
    func: &Function,
    defuse: &DefUse,
    target: &ValueRef,
) -> Option<ValueRef> {
    let load = strip_casts(func, defuse, target);
    let load_inst = defuse
        .def(load.as_local()?)
        .and_then(|pos| defuse.inst_at(func, pos))?;
    let Op::Load { ptr, .. } = &load_inst.op else {
        return None;
    };

    let mut vtable = strip_casts(func, defuse, ptr);
    if let Some(inst) = vtable
        .as_local()
        .and_then(|name| defuse.def(name))
        .and_then(|pos| defuse.inst_at(func, pos))
    {
        if let Op::Gep { ptr, .. } = &inst.op {
            vtable = strip_casts(func, defuse, ptr);
        }
    }

    let vptr_load = defuse
        .def(vtable.as_local()?)
        .and_then(|pos| defuse.inst_at(func, pos))?;
    let Op::Load { ptr, .. } = &vptr_load.op else {
        return None;
    };

    Some(strip_casts(func, defuse, ptr))
}

impl Pass for VtablePass {
    type Error = Infallible;

    fn name(&self) -> String {
        "VtablePass".to_string()
    }

    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error> {
        if !self.trace_calls && !self.dump_vtable {
            return Ok(());
        }

        module.ensure_declared(
            "__ct_vcall_trace",
            "void @__ct_vcall_trace(ptr, ptr, ptr, ptr)",
        );
        module.ensure_declared("__ct_vtable_dump", "void @__ct_vtable_dump(ptr, ptr, ptr)");

        let targets: Vec<String> = module
            .functions()
            .filter(|func| should_instrument(module, func))
            .map(|func| func.name.clone())
            .collect();

        let mut interner = SiteInterner::default();
        let mut unknown_type: Option<String> = None;

        for target in targets {
            struct PendingVcall {
                block: usize,
                index: usize,
                this_ptr: ValueRef,
                callee: ValueRef,
                dbg: Option<u64>,
            }

            let func = module
                .functions()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            let defuse = DefUse::build(func);
            let mut pending: Vec<PendingVcall> = Vec::new();

            for (block_idx, block) in func.blocks.iter().enumerate() {
                for (inst_idx, inst) in block.insts.iter().enumerate() {
                    let Some(call) = inst.as_call() else {
                        continue;
                    };
                    // Only true indirect calls: direct callees and inline
                    // asm are never virtual dispatch.
                    let Callee::Indirect(callee) = &call.callee else {
                        continue;
                    };
                    let Some(this_ptr) = this_from_call_target(func, &defuse, callee) else {
                        continue;
                    };
                    pending.push(PendingVcall {
                        block: block_idx,
                        index: inst_idx,
                        this_ptr,
                        callee: callee.clone(),
                        dbg: inst.dbg,
                    });
                }
            }

            if pending.is_empty() {
                continue;
            }

            let type_operand = match &unknown_type {
                Some(name) => format!("@{name}"),
                None => {
                    let name = module.add_string_constant(".ct.type", "<unknown>");
                    unknown_type = Some(name.clone());
                    format!("@{name}")
                }
            };

            let mut inserter = Inserter::default();
            for vcall in pending {
                let site = interner.site_operand(module, vcall.dbg);
                if self.dump_vtable {
                    inserter.before(
                        vcall.block,
                        vcall.index,
                        format!(
                            "call void @__ct_vtable_dump(ptr {}, ptr {}, ptr {})",
                            vcall.this_ptr.render(),
                            site,
                            type_operand
                        ),
                    );
                }
                if self.trace_calls {
                    inserter.before(
                        vcall.block,
                        vcall.index,
                        format!(
                            "call void @__ct_vcall_trace(ptr {}, ptr {}, ptr {}, ptr {})",
                            vcall.this_ptr.render(),
                            vcall.callee.render(),
                            site,
                            type_operand
                        ),
                    );
                }
                self.instrumented += 1;
            }

            let func = module
                .functions_mut()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            inserter.apply(func);
        }

        logger.debug(format!("instrumented {} virtual calls", self.instrumented));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::logger::Logger;

    const VIRTUAL_CALL: &str = "define void @f(ptr %obj) {\n  %vtable = load ptr, ptr %obj, align 8\n  %slot = getelementptr inbounds ptr, ptr %vtable, i64 2\n  %fn = load ptr, ptr %slot, align 8\n  call void %fn(ptr %obj)\n  ret void\n}\n";

    fn run(source: &str, trace: bool, dump: bool) -> String {
        let mut module = parse_module(source).unwrap();
        let logger = Logger::quiet();
        VtablePass::new(trace, dump).run(&mut module, &logger).unwrap();
        module.print()
    }

    #[test]
    fn vptr_pattern_is_instrumented() {
        let out = run(VIRTUAL_CALL, true, true);
        assert!(out.contains(
            "call void @__ct_vtable_dump(ptr %obj, ptr @.ct.site.0, ptr @.ct.type.0)"
        ));
        assert!(out.contains(
            "call void @__ct_vcall_trace(ptr %obj, ptr %fn, ptr @.ct.site.0, ptr @.ct.type.0)"
        ));
        // Inserted before the virtual call itself.
        assert!(out.find("__ct_vcall_trace").unwrap() < out.find("call void %fn").unwrap());
    }

    #[test]
    fn vcall_only_when_dump_disabled() {
        let out = run(VIRTUAL_CALL, true, false);
        assert!(out.contains("__ct_vcall_trace"));
        assert!(!out.contains("call void @__ct_vtable_dump"));
    }

    #[test]
    fn first_slot_dispatch_without_gep_matches() {
        let out = run(
            "define void @g(ptr %obj) {\n  %vtable = load ptr, ptr %obj, align 8\n  %fn = load ptr, ptr %vtable, align 8\n  call void %fn(ptr %obj)\n  ret void\n}\n",
            true,
            false,
        );
        assert!(out.contains("__ct_vcall_trace(ptr %obj, ptr %fn"));
    }

    #[test]
    fn direct_calls_are_ignored() {
        let out = run(
            "define void @h(ptr %obj) {\n  call void @callee(ptr %obj)\n  ret void\n}\ndeclare void @callee(ptr)\n",
            true,
            true,
        );
        assert!(!out.contains("__ct_vcall_trace(ptr"));
        assert!(!out.contains("call void @__ct_vtable_dump(ptr %obj"));
    }

    #[test]
    fn plain_function_pointer_calls_are_ignored() {
        // A function pointer loaded from an ordinary variable has no
        // second load in its chain.
        let out = run(
            "define void @k(ptr %slot) {\n  %fn = load ptr, ptr %slot, align 8\n  call void %fn()\n  ret void\n}\n",
            true,
            true,
        );
        assert!(!out.contains("__ct_vcall_trace(ptr"));
    }

    #[test]
    fn disabled_pass_is_a_no_op() {
        let out = run(VIRTUAL_CALL, false, false);
        assert!(!out.contains("__ct_vcall_trace"));
        assert!(!out.contains("__ct_vtable_dump"));
    }
}
