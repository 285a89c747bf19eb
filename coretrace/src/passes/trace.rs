//! Function entry/exit tracing.
//!
//! Every instrumentable function gets a `__ct_trace_enter` call at the top
//! of its entry block and, before every `ret`, the exit call matching its
//! return type: `void`, `i64` (sign-extended), `ptr`, `f64` (extended) or
//! `unknown` for anything else. Function-name string constants are
//! deduplicated per module.

use std::convert::Infallible;

use rustc_hash::FxHashMap;

use crate::ir::{Module, Op, Type, ValueRef};
use crate::logger::Logger;
use crate::passes::common::{should_instrument, Inserter};
use crate::passes::Pass;

pub struct TracePass {
    instrumented: usize,
}

impl TracePass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { instrumented: 0 }
    }
}

enum ExitCall {
    Void,
    I64,
    Ptr,
    F64,
    Unknown,
}

fn exit_call_for(ret_ty: &Type) -> ExitCall {
    match ret_ty {
        Type::Void => ExitCall::Void,
        Type::Int(bits) if *bits <= 64 => ExitCall::I64,
        Type::Ptr => ExitCall::Ptr,
        ty if ty.is_float() => ExitCall::F64,
        _ => ExitCall::Unknown,
    }
}

fn declare_runtime(module: &mut Module) {
    module.ensure_declared("__ct_trace_enter", "void @__ct_trace_enter(ptr)");
    module.ensure_declared("__ct_trace_exit_void", "void @__ct_trace_exit_void(ptr)");
    module.ensure_declared("__ct_trace_exit_i64", "void @__ct_trace_exit_i64(ptr, i64)");
    module.ensure_declared("__ct_trace_exit_ptr", "void @__ct_trace_exit_ptr(ptr, ptr)");
    module.ensure_declared("__ct_trace_exit_f64", "void @__ct_trace_exit_f64(ptr, double)");
    module.ensure_declared(
        "__ct_trace_exit_unknown",
        "void @__ct_trace_exit_unknown(ptr)",
    );
}

impl Pass for TracePass {
    type Error = Infallible;

    fn name(&self) -> String {
        "TracePass".to_string()
    }

    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error> {
        declare_runtime(module);

        // Which functions to touch, decided up front; name constants are
        // interned on demand.
        let targets: Vec<String> = module
            .functions()
            .filter(|func| should_instrument(module, func))
            .map(|func| func.name.clone())
            .collect();

        let mut name_cache: FxHashMap<String, String> = FxHashMap::default();
        let mut fresh_local = 0usize;

        for target in targets {
            let name_operand = match name_cache.get(&target) {
                Some(name) => format!("@{name}"),
                None => {
                    let global = module.add_string_constant(".ct.func", &target);
                    name_cache.insert(target.clone(), global.clone());
                    format!("@{global}")
                }
            };

            let func = module
                .functions_mut()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");

            let ret_ty = func.ret_ty.clone();
            let mut inserter = Inserter::default();

            // Entry: before the first real instruction of the entry block.
            inserter.before(
                0,
                0,
                format!("call void @__ct_trace_enter(ptr {name_operand})"),
            );

            for (block_idx, block) in func.blocks.iter().enumerate() {
                for (inst_idx, inst) in block.insts.iter().enumerate() {
                    let Op::Ret { value, .. } = &inst.op else {
                        continue;
                    };

                    match (exit_call_for(&ret_ty), value) {
                        (ExitCall::Void, _) | (_, None) => {
                            inserter.before(
                                block_idx,
                                inst_idx,
                                format!("call void @__ct_trace_exit_void(ptr {name_operand})"),
                            );
                        }
                        (ExitCall::I64, Some(value)) => {
                            let rendered = match (value, &ret_ty) {
                                (ValueRef::Local(name), Type::Int(bits)) if *bits != 64 => {
                                    let tmp = format!("ct.trace.{fresh_local}");
                                    fresh_local += 1;
                                    inserter.before(
                                        block_idx,
                                        inst_idx,
                                        format!("%{tmp} = sext i{bits} %{name} to i64"),
                                    );
                                    format!("%{tmp}")
                                }
                                _ => value.render(),
                            };
                            inserter.before(
                                block_idx,
                                inst_idx,
                                format!(
                                    "call void @__ct_trace_exit_i64(ptr {name_operand}, i64 {rendered})"
                                ),
                            );
                        }
                        (ExitCall::Ptr, Some(value)) => {
                            inserter.before(
                                block_idx,
                                inst_idx,
                                format!(
                                    "call void @__ct_trace_exit_ptr(ptr {name_operand}, ptr {})",
                                    value.render()
                                ),
                            );
                        }
                        (ExitCall::F64, Some(value)) => {
                            let rendered = match (value, &ret_ty) {
                                (ValueRef::Local(name), ty) if *ty != Type::Double => {
                                    let tmp = format!("ct.trace.{fresh_local}");
                                    fresh_local += 1;
                                    let from = match ty {
                                        Type::Half => "half",
                                        Type::BFloat => "bfloat",
                                        Type::Float => "float",
                                        _ => "double",
                                    };
                                    inserter.before(
                                        block_idx,
                                        inst_idx,
                                        format!("%{tmp} = fpext {from} %{name} to double"),
                                    );
                                    format!("%{tmp}")
                                }
                                _ => value.render(),
                            };
                            inserter.before(
                                block_idx,
                                inst_idx,
                                format!(
                                    "call void @__ct_trace_exit_f64(ptr {name_operand}, double {rendered})"
                                ),
                            );
                        }
                        (ExitCall::Unknown, Some(_)) => {
                            inserter.before(
                                block_idx,
                                inst_idx,
                                format!(
                                    "call void @__ct_trace_exit_unknown(ptr {name_operand})"
                                ),
                            );
                        }
                    }
                }
            }

            inserter.apply(func);
            self.instrumented += 1;
        }

        logger.debug(format!("traced {} functions", self.instrumented));
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
        TracePass::new().run(&mut module, &logger).unwrap();
        module.print()
    }

    #[test]
    fn entry_and_void_exit() {
        let out = run("define void @f() {\n  ret void\n}\n");
        let enter = out.find("call void @__ct_trace_enter(ptr @.ct.func.0)").unwrap();
        let exit = out.find("call void @__ct_trace_exit_void(ptr @.ct.func.0)").unwrap();
        let ret = out.find("ret void").unwrap();
        assert!(enter < exit && exit < ret);
        assert!(out.contains("@.ct.func.0 = private unnamed_addr constant [2 x i8] c\"f\\00\""));
    }

    #[test]
    fn i32_return_is_sign_extended() {
        let out = run("define i32 @g(i32 %x) {\n  ret i32 %x\n}\n");
        assert!(out.contains("%ct.trace.0 = sext i32 %x to i64"));
        assert!(out.contains("call void @__ct_trace_exit_i64(ptr @.ct.func.0, i64 %ct.trace.0)"));
    }

    #[test]
    fn i64_constant_passes_straight_through() {
        let out = run("define i64 @h() {\n  ret i64 42\n}\n");
        assert!(out.contains("call void @__ct_trace_exit_i64(ptr @.ct.func.0, i64 42)"));
        assert!(!out.contains("sext"));
    }

    #[test]
    fn pointer_and_float_returns() {
        let out = run("define ptr @p(ptr %v) {\n  ret ptr %v\n}\n");
        assert!(out.contains("call void @__ct_trace_exit_ptr(ptr @.ct.func.0, ptr %v)"));

        let out = run("define float @q(float %v) {\n  ret float %v\n}\n");
        assert!(out.contains("%ct.trace.0 = fpext float %v to double"));
        assert!(out.contains("call void @__ct_trace_exit_f64(ptr @.ct.func.0, double %ct.trace.0)"));
    }

    #[test]
    fn aggregate_return_uses_unknown() {
        let out = run("define { i64, i64 } @r({ i64, i64 } %v) {\n  ret { i64, i64 } %v\n}\n");
        assert!(out.contains("call void @__ct_trace_exit_unknown(ptr @.ct.func.0)"));
    }

    #[test]
    fn every_return_is_instrumented() {
        let out = run(
            "define void @s(i1 %c) {\n  br i1 %c, label %a, label %b\n\na:\n  ret void\n\nb:\n  ret void\n}\n",
        );
        assert_eq!(out.matches("__ct_trace_exit_void").count(), 2);
    }

    #[test]
    fn runtime_functions_are_skipped() {
        let out = run("define void @__ct_thing() {\n  ret void\n}\n");
        assert!(!out.contains("call void @__ct_trace_enter"));
    }
}
