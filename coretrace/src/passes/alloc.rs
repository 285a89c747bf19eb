//! Allocation-call rewriting and automatic frees.
//!
//! Every call to the libc and C++ allocator families (malloc, calloc,
//! realloc, aligned_alloc, posix_memalign, mmap/munmap, sbrk/brk, the
//! Itanium `operator new`/`new[]` manglings and every `operator delete`
//! flavor) is replaced with the matching `__ct_*` runtime entry point,
//! with the site string appended and integer arguments widened to the
//! pointer-sized type. Replacements keep the original result name, so uses
//! never need rewriting; invokes keep their destinations.
//!
//! On top of the rewriting, two analyses drive automatic frees:
//! an allocation whose result is effectively unused becomes the
//! `_unreachable` interceptor variant plus an immediate autofree, and an
//! allocation the escape analysis proves [`EscapeState::ReachableLocal`]
//! gets an autofree before every return of its function. Calls to local
//! "returning allocator" functions with unused results are auto-freed the
//! same way.

use std::convert::Infallible;

use rustc_hash::FxHashSet;

use crate::ir::{Callee, CastKind, DefUse, Function, Module, Op, Type, ValueRef};
use crate::logger::Logger;
use crate::passes::common::{should_instrument, Inserter, SiteInterner};
use crate::passes::escape::{classify_allocation, classify_slot, EscapeState, ReturnAllocators};
use crate::passes::Pass;

/// Allocator family of a tracked allocation; selects the release call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Malloc,
    New,
    NewArray,
    Mmap,
    Sbrk,
}

impl AllocKind {
    fn autofree_symbol(self) -> &'static str {
        match self {
            AllocKind::Malloc => "__ct_autofree",
            AllocKind::New => "__ct_autofree_delete",
            AllocKind::NewArray => "__ct_autofree_delete_array",
            AllocKind::Mmap => "__ct_autofree_munmap",
            AllocKind::Sbrk => "__ct_autofree_sbrk",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    Malloc,
    Calloc,
    Realloc,
    AlignedAlloc,
    PosixMemalign,
    Mmap,
    Munmap,
    Sbrk,
    Brk,
    New,
    NewArray,
    NewNothrow,
    NewArrayNothrow,
    Free,
    Delete,
    DeleteArray,
    DeleteNothrow,
    DeleteArrayNothrow,
    DeleteDestroying,
    DeleteArrayDestroying,
}

/// Strip the Mach-O `\01` marker and the extra leading underscore some
/// platforms put in front of Itanium manglings.
fn normalize_symbol(name: &str) -> &str {
    let name = name.strip_prefix('\u{1}').unwrap_or(name);
    name.strip_prefix('_')
        .filter(|rest| rest.starts_with("_Z"))
        .unwrap_or(name)
}

fn family_of(raw_name: &str) -> Option<Family> {
    let name = normalize_symbol(raw_name);
    let family = match name {
        "malloc" => Family::Malloc,
        "calloc" => Family::Calloc,
        "realloc" => Family::Realloc,
        "aligned_alloc" => Family::AlignedAlloc,
        "posix_memalign" => Family::PosixMemalign,
        "mmap" => Family::Mmap,
        "munmap" => Family::Munmap,
        "sbrk" => Family::Sbrk,
        "brk" => Family::Brk,
        "free" => Family::Free,
        "_Znwm" | "_ZnwmSt11align_val_t" => Family::New,
        "_Znam" | "_ZnamSt11align_val_t" => Family::NewArray,
        "_ZnwmRKSt9nothrow_t" | "_ZnwmSt11align_val_tRKSt9nothrow_t" => Family::NewNothrow,
        "_ZnamRKSt9nothrow_t" | "_ZnamSt11align_val_tRKSt9nothrow_t" => Family::NewArrayNothrow,
        _ => {
            if let Some(rest) = name.strip_prefix("_ZdlPv") {
                if rest.contains("St19destroying_delete_t") {
                    Family::DeleteDestroying
                } else if rest.ends_with("RKSt9nothrow_t") {
                    Family::DeleteNothrow
                } else {
                    Family::Delete
                }
            } else if let Some(rest) = name.strip_prefix("_ZdaPv") {
                if rest.contains("St19destroying_delete_t") {
                    Family::DeleteArrayDestroying
                } else if rest.ends_with("RKSt9nothrow_t") {
                    Family::DeleteArrayNothrow
                } else {
                    Family::DeleteArray
                }
            } else {
                return None;
            }
        }
    };
    Some(family)
}

/// The allocation kind a symbol produces, for the return-allocator
/// inference. Release-side families yield nothing.
pub(crate) fn allocator_kind(name: &str) -> Option<AllocKind> {
    match family_of(name)? {
        Family::Malloc | Family::Calloc | Family::Realloc | Family::AlignedAlloc => {
            Some(AllocKind::Malloc)
        }
        Family::New | Family::NewNothrow => Some(AllocKind::New),
        Family::NewArray | Family::NewArrayNothrow => Some(AllocKind::NewArray),
        Family::Mmap => Some(AllocKind::Mmap),
        Family::Sbrk => Some(AllocKind::Sbrk),
        _ => None,
    }
}

struct Replacement {
    /// Runtime symbol without the `_unreachable` suffix.
    symbol: &'static str,
    /// `declare` signature for [`Module::ensure_declared`].
    signature: &'static str,
    unreachable_signature: Option<&'static str>,
    ret: &'static str,
    /// Indices of forwarded arguments and the textual type each is
    /// rendered with (`i64` arguments get widened as needed).
    forwarded: &'static [(usize, &'static str)],
    takes_site: bool,
    kind: Option<AllocKind>,
}

fn replacement_for(family: Family) -> Replacement {
    match family {
        Family::Malloc => Replacement {
            symbol: "__ct_malloc",
            signature: "ptr @__ct_malloc(i64, ptr)",
            unreachable_signature: Some("ptr @__ct_malloc_unreachable(i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Malloc),
        },
        Family::Calloc => Replacement {
            symbol: "__ct_calloc",
            signature: "ptr @__ct_calloc(i64, i64, ptr)",
            unreachable_signature: Some("ptr @__ct_calloc_unreachable(i64, i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64"), (1, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Malloc),
        },
        Family::Realloc => Replacement {
            symbol: "__ct_realloc",
            signature: "ptr @__ct_realloc(ptr, i64, ptr)",
            unreachable_signature: None,
            ret: "ptr",
            forwarded: &[(0, "ptr"), (1, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Malloc),
        },
        Family::AlignedAlloc => Replacement {
            symbol: "__ct_aligned_alloc",
            signature: "ptr @__ct_aligned_alloc(i64, i64, ptr)",
            unreachable_signature: None,
            ret: "ptr",
            forwarded: &[(0, "i64"), (1, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Malloc),
        },
        Family::PosixMemalign => Replacement {
            symbol: "__ct_posix_memalign",
            signature: "i32 @__ct_posix_memalign(ptr, i64, i64, ptr)",
            unreachable_signature: None,
            ret: "i32",
            forwarded: &[(0, "ptr"), (1, "i64"), (2, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Malloc),
        },
        Family::Mmap => Replacement {
            symbol: "__ct_mmap",
            signature: "ptr @__ct_mmap(ptr, i64, i32, i32, i32, i64, ptr)",
            unreachable_signature: None,
            ret: "ptr",
            forwarded: &[(0, "ptr"), (1, "i64"), (2, "i32"), (3, "i32"), (4, "i32"), (5, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Mmap),
        },
        Family::Munmap => Replacement {
            symbol: "__ct_munmap",
            signature: "i32 @__ct_munmap(ptr, i64, ptr)",
            unreachable_signature: None,
            ret: "i32",
            forwarded: &[(0, "ptr"), (1, "i64")],
            takes_site: true,
            kind: None,
        },
        Family::Sbrk => Replacement {
            symbol: "__ct_sbrk",
            signature: "ptr @__ct_sbrk(i64, ptr)",
            unreachable_signature: None,
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::Sbrk),
        },
        Family::Brk => Replacement {
            symbol: "__ct_brk",
            signature: "i32 @__ct_brk(ptr, ptr)",
            unreachable_signature: None,
            ret: "i32",
            forwarded: &[(0, "ptr")],
            takes_site: true,
            kind: None,
        },
        Family::New => Replacement {
            symbol: "__ct_new",
            signature: "ptr @__ct_new(i64, ptr)",
            unreachable_signature: Some("ptr @__ct_new_unreachable(i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::New),
        },
        Family::NewArray => Replacement {
            symbol: "__ct_new_array",
            signature: "ptr @__ct_new_array(i64, ptr)",
            unreachable_signature: Some("ptr @__ct_new_array_unreachable(i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::NewArray),
        },
        Family::NewNothrow => Replacement {
            symbol: "__ct_new_nothrow",
            signature: "ptr @__ct_new_nothrow(i64, ptr)",
            unreachable_signature: Some("ptr @__ct_new_nothrow_unreachable(i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::New),
        },
        Family::NewArrayNothrow => Replacement {
            symbol: "__ct_new_array_nothrow",
            signature: "ptr @__ct_new_array_nothrow(i64, ptr)",
            unreachable_signature: Some("ptr @__ct_new_array_nothrow_unreachable(i64, ptr)"),
            ret: "ptr",
            forwarded: &[(0, "i64")],
            takes_site: true,
            kind: Some(AllocKind::NewArray),
        },
        Family::Free => Replacement {
            symbol: "__ct_free",
            signature: "void @__ct_free(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::Delete => Replacement {
            symbol: "__ct_delete",
            signature: "void @__ct_delete(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::DeleteArray => Replacement {
            symbol: "__ct_delete_array",
            signature: "void @__ct_delete_array(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::DeleteNothrow => Replacement {
            symbol: "__ct_delete_nothrow",
            signature: "void @__ct_delete_nothrow(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::DeleteArrayNothrow => Replacement {
            symbol: "__ct_delete_array_nothrow",
            signature: "void @__ct_delete_array_nothrow(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::DeleteDestroying => Replacement {
            symbol: "__ct_delete_destroying",
            signature: "void @__ct_delete_destroying(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
        Family::DeleteArrayDestroying => Replacement {
            symbol: "__ct_delete_array_destroying",
            signature: "void @__ct_delete_array_destroying(ptr)",
            unreachable_signature: None,
            ret: "void",
            forwarded: &[(0, "ptr")],
            takes_site: false,
            kind: None,
        },
    }
}

/// Is the allocation's result effectively unused: no users besides debug
/// intrinsics, transparent casts, stores into dead stack slots and
/// autofree calls?
fn effectively_unused(func: &Function, defuse: &DefUse, root: &str) -> bool {
    let mut worklist = vec![root.to_owned()];
    let mut visited: FxHashSet<String> = FxHashSet::default();
    visited.insert(root.to_owned());

    while let Some(current) = worklist.pop() {
        for &pos in defuse.uses(&current) {
            let Some(inst) = defuse.inst_at(func, pos) else {
                continue;
            };
            match &inst.op {
                Op::Call(call) | Op::Invoke(call) => {
                    let Callee::Direct(name) = &call.callee else {
                        return false;
                    };
                    if name.starts_with("llvm.dbg.") || name.starts_with("__ct_autofree") {
                        continue;
                    }
                    return false;
                }
                Op::Cast { kind, .. }
                    if matches!(kind, CastKind::Bitcast | CastKind::AddrSpaceCast) =>
                {
                    if let Some(result) = &inst.result {
                        if visited.insert(result.clone()) {
                            worklist.push(result.clone());
                        }
                    }
                }
                Op::Store { value, ptr, .. } if value.as_local() == Some(current.as_str()) => {
                    if !store_slot_is_dead(func, defuse, ptr) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    true
}

/// A store destination that is an alloca whose only uses are stores to it
/// and debug intrinsics.
fn store_slot_is_dead(func: &Function, defuse: &DefUse, dest: &ValueRef) -> bool {
    let Some(name) = dest.as_local() else {
        return false;
    };
    let Some(def) = defuse.def(name).and_then(|pos| defuse.inst_at(func, pos)) else {
        return false;
    };
    if !matches!(def.op, Op::Alloca { .. }) {
        return false;
    }

    for &pos in defuse.uses(name) {
        let Some(inst) = defuse.inst_at(func, pos) else {
            continue;
        };
        match &inst.op {
            Op::Store { ptr, .. } if ptr.as_local() == Some(name) => {}
            Op::Call(call) => {
                let ignorable =
                    matches!(&call.callee, Callee::Direct(cn) if cn.starts_with("llvm.dbg."));
                if !ignorable {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

pub struct AllocPass {
    replaced: usize,
    autofreed_sites: usize,
}

impl AllocPass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            replaced: 0,
            autofreed_sites: 0,
        }
    }
}

struct PlannedCall {
    block: usize,
    index: usize,
    family: Family,
    unreachable: bool,
}

struct PlannedAutofree {
    symbol: &'static str,
    /// Rendered pointer operand (`%name`).
    operand: String,
}

/// Where an "immediately after the call" insertion lands: after a plain
/// call it is the next instruction; after an invoke it is the head of the
/// normal destination block.
fn after_call_position(func: &Function, block: usize, index: usize) -> Option<(usize, usize)> {
    let inst = &func.blocks[block].insts[index];
    if !inst.is_invoke() {
        return Some((block, index + 1));
    }
    let normal = inst.as_call()?.normal_dest.clone()?;
    for (idx, candidate) in func.blocks.iter().enumerate() {
        let Some(label_line) = &candidate.label_line else {
            continue;
        };
        let label = label_line.split(':').next().unwrap_or("");
        if label == normal || label.trim_matches('"') == normal {
            return Some((idx, 0));
        }
    }
    None
}

impl Pass for AllocPass {
    type Error = Infallible;

    fn name(&self) -> String {
        "AllocPass".to_string()
    }

    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error> {
        let return_allocators = ReturnAllocators::build(module);
        // The runtime's size type follows the data layout's pointer width;
        // the replacement table spells it `i64` and we map it here.
        let size_bits = module.datalayout.pointer_size * 8;
        let size_ty = format!("i{size_bits}");

        let targets: Vec<String> = module
            .functions()
            .filter(|func| should_instrument(module, func))
            .map(|func| func.name.clone())
            .collect();

        let mut interner = SiteInterner::default();
        let mut fresh_local = 0usize;

        for target in targets {
            let func = module
                .functions()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            let defuse = DefUse::build(func);

            let mut planned: Vec<PlannedCall> = Vec::new();
            // Autofree insertions keyed by position.
            let mut immediate: Vec<((usize, usize), PlannedAutofree)> = Vec::new();
            let mut at_returns: Vec<PlannedAutofree> = Vec::new();
            let mut slot_returns: Vec<(String, &'static str)> = Vec::new();

            for (block_idx, block) in func.blocks.iter().enumerate() {
                for (inst_idx, inst) in block.insts.iter().enumerate() {
                    let Some(call) = inst.as_call() else {
                        continue;
                    };
                    let Callee::Direct(callee) = &call.callee else {
                        continue;
                    };

                    if let Some(family) = family_of(callee) {
                        let replacement = replacement_for(family);
                        let mut unreachable = false;

                        if let Some(kind) = replacement.kind {
                            if family == Family::PosixMemalign {
                                // The pointer lives in the output slot.
                                if let Some(slot) = call.args.first().and_then(|(_, v)| v.as_local())
                                {
                                    let state = classify_slot(
                                        func,
                                        &defuse,
                                        slot,
                                        (block_idx, inst_idx),
                                    );
                                    if state == EscapeState::ReachableLocal {
                                        slot_returns
                                            .push((slot.to_owned(), kind.autofree_symbol()));
                                    }
                                }
                            } else if let Some(result) = &inst.result {
                                if replacement.unreachable_signature.is_some()
                                    && effectively_unused(func, &defuse, result)
                                {
                                    unreachable = true;
                                    if let Some(pos) =
                                        after_call_position(func, block_idx, inst_idx)
                                    {
                                        immediate.push((
                                            pos,
                                            PlannedAutofree {
                                                symbol: kind.autofree_symbol(),
                                                operand: format!("%{result}"),
                                            },
                                        ));
                                    }
                                } else {
                                    let state = classify_allocation(func, &defuse, result);
                                    if state == EscapeState::ReachableLocal {
                                        at_returns.push(PlannedAutofree {
                                            symbol: kind.autofree_symbol(),
                                            operand: format!("%{result}"),
                                        });
                                    }
                                }
                            }
                        }

                        planned.push(PlannedCall {
                            block: block_idx,
                            index: inst_idx,
                            family,
                            unreachable,
                        });
                        continue;
                    }

                    // Calls to local returning allocators with a discarded
                    // result get the matching immediate autofree.
                    if let Some(kind) = return_allocators.kind_of(callee) {
                        if let Some(result) = &inst.result {
                            if effectively_unused(func, &defuse, result) {
                                if let Some(pos) = after_call_position(func, block_idx, inst_idx)
                                {
                                    immediate.push((
                                        pos,
                                        PlannedAutofree {
                                            symbol: kind.autofree_symbol(),
                                            operand: format!("%{result}"),
                                        },
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if planned.is_empty() && immediate.is_empty() && at_returns.is_empty()
                && slot_returns.is_empty()
            {
                continue;
            }

            // Return positions for the end-of-function autofrees.
            let return_positions: Vec<(usize, usize)> = func
                .blocks
                .iter()
                .enumerate()
                .flat_map(|(block_idx, block)| {
                    block.insts.iter().enumerate().filter_map(move |(inst_idx, inst)| {
                        matches!(inst.op, Op::Ret { .. }).then_some((block_idx, inst_idx))
                    })
                })
                .collect();

            // Pre-compute everything that needs the module mutably.
            struct Rewrite {
                block: usize,
                index: usize,
                text: String,
            }
            let mut rewrites: Vec<Rewrite> = Vec::new();
            let mut inserter = Inserter::default();

            for plan in &planned {
                let replacement = replacement_for(plan.family);
                module.ensure_declared(
                    replacement.symbol,
                    &replacement.signature.replace("i64", &size_ty),
                );
                let symbol = if plan.unreachable {
                    let signature = replacement
                        .unreachable_signature
                        .expect("unreachable variant exists");
                    let symbol = &signature[signature.find('@').unwrap() + 1
                        ..signature.find('(').unwrap()];
                    module.ensure_declared(symbol, &signature.replace("i64", &size_ty));
                    format!("{}_unreachable", replacement.symbol)
                } else {
                    replacement.symbol.to_owned()
                };

                let func_ref = module
                    .functions()
                    .find(|f| f.name == target)
                    .expect("function disappeared mid-pass");
                let inst = &func_ref.blocks[plan.block].insts[plan.index];
                let call = inst.as_call().expect("planned call");
                let dbg = inst.dbg;
                let is_invoke = inst.is_invoke();
                let is_tail = inst.text.starts_with("tail call")
                    || inst.text.contains("= tail call");
                let result = inst.result.clone();
                let normal_dest = call.normal_dest.clone();
                let unwind_dest = call.unwind_dest.clone();

                // Render forwarded args, widening integers to the size type
                // where the runtime expects it.
                let mut rendered_args: Vec<String> = Vec::new();
                let mut preludes: Vec<String> = Vec::new();
                for &(arg_idx, expected) in replacement.forwarded {
                    let expected = if expected == "i64" {
                        size_ty.as_str()
                    } else {
                        expected
                    };
                    let Some((ty, value)) = call.args.get(arg_idx) else {
                        rendered_args.push(format!("{expected} 0"));
                        continue;
                    };
                    let rendered = if expected == size_ty {
                        match (ty, value) {
                            (Type::Int(bits), ValueRef::Local(name))
                                if u64::from(*bits) < size_bits =>
                            {
                                let tmp = format!("ct.arg.{fresh_local}");
                                fresh_local += 1;
                                preludes.push(format!(
                                    "%{tmp} = zext i{bits} %{name} to {size_ty}"
                                ));
                                format!("%{tmp}")
                            }
                            (Type::Int(bits), ValueRef::Local(name))
                                if u64::from(*bits) > size_bits =>
                            {
                                let tmp = format!("ct.arg.{fresh_local}");
                                fresh_local += 1;
                                preludes.push(format!(
                                    "%{tmp} = trunc i{bits} %{name} to {size_ty}"
                                ));
                                format!("%{tmp}")
                            }
                            _ => value.render(),
                        }
                    } else {
                        value.render()
                    };
                    rendered_args.push(format!("{expected} {rendered}"));
                }
                if replacement.takes_site {
                    let site = interner.site_operand(module, dbg);
                    rendered_args.push(format!("ptr {site}"));
                }

                let mut text = String::new();
                if let Some(result) = &result {
                    text.push_str(&format!("%{result} = "));
                }
                if is_tail {
                    text.push_str("tail ");
                }
                text.push_str(if is_invoke { "invoke " } else { "call " });
                text.push_str(replacement.ret);
                text.push_str(&format!(" @{symbol}({})", rendered_args.join(", ")));
                if is_invoke {
                    if let (Some(normal), Some(unwind)) = (normal_dest, unwind_dest) {
                        text.push_str(&format!(" to label %{normal} unwind label %{unwind}"));
                    }
                }
                if let Some(dbg) = dbg {
                    text.push_str(&format!(", !dbg !{dbg}"));
                }

                for prelude in preludes {
                    inserter.before(plan.block, plan.index, prelude);
                }
                rewrites.push(Rewrite {
                    block: plan.block,
                    index: plan.index,
                    text,
                });
                self.replaced += 1;
            }

            // Immediate autofrees for unreachable allocations.
            for ((block, index), autofree) in immediate {
                module.ensure_declared(
                    autofree.symbol,
                    autofree_signature(autofree.symbol),
                );
                inserter.before(
                    block,
                    index,
                    format!("call void @{}(ptr {})", autofree.symbol, autofree.operand),
                );
                self.autofreed_sites += 1;
            }

            // Autofrees for provably local allocations, before every return.
            for autofree in &at_returns {
                module.ensure_declared(
                    autofree.symbol,
                    autofree_signature(autofree.symbol),
                );
            }
            for &(block, index) in &return_positions {
                for autofree in &at_returns {
                    inserter.before(
                        block,
                        index,
                        format!("call void @{}(ptr {})", autofree.symbol, autofree.operand),
                    );
                }
                for (slot, symbol) in &slot_returns {
                    module.ensure_declared(symbol, autofree_signature(symbol));
                    let tmp = format!("ct.af.{fresh_local}");
                    fresh_local += 1;
                    inserter.before(block, index, format!("%{tmp} = load ptr, ptr %{slot}"));
                    inserter.before(
                        block,
                        index,
                        format!("call void @{symbol}(ptr %{tmp})"),
                    );
                }
            }
            self.autofreed_sites += at_returns.len() + slot_returns.len();

            // Apply: rewrite call text in place, then splice insertions.
            let func = module
                .functions_mut()
                .find(|func| func.name == target)
                .expect("function disappeared mid-pass");
            for rewrite in rewrites {
                let inst = &mut func.blocks[rewrite.block].insts[rewrite.index];
                *inst = crate::ir::parse_instruction(&rewrite.text);
            }
            inserter.apply(func);
        }

        logger.debug(format!(
            "replaced {} allocator calls, {} autofree sites",
            self.replaced, self.autofreed_sites
        ));
        Ok(())
    }
}

fn autofree_signature(symbol: &str) -> &'static str {
    match symbol {
        "__ct_autofree" => "void @__ct_autofree(ptr)",
        "__ct_autofree_delete" => "void @__ct_autofree_delete(ptr)",
        "__ct_autofree_delete_array" => "void @__ct_autofree_delete_array(ptr)",
        "__ct_autofree_munmap" => "void @__ct_autofree_munmap(ptr)",
        "__ct_autofree_sbrk" => "void @__ct_autofree_sbrk(ptr)",
        _ => "void @__ct_autofree(ptr)",
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
        AllocPass::new().run(&mut module, &logger).unwrap();
        module.print()
    }

    #[test]
    fn malloc_and_free_are_replaced() {
        let out = run(
            "define void @f() {\n  %p = call ptr @malloc(i64 8)\n  call void @free(ptr %p)\n  ret void\n}\ndeclare ptr @malloc(i64)\ndeclare void @free(ptr)\n",
        );
        assert!(out.contains("%p = call ptr @__ct_malloc(i64 8, ptr @.ct.site.0)"));
        assert!(out.contains("call void @__ct_free(ptr %p)"));
        assert!(out.contains("declare ptr @__ct_malloc(i64, ptr)"));
        assert!(!out.contains("call ptr @malloc"));
    }

    #[test]
    fn unused_malloc_becomes_unreachable_with_autofree() {
        let out = run(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
        );
        assert!(out.contains("%p = call ptr @__ct_malloc_unreachable(i64 16, ptr @.ct.site.0)"));
        let unreachable = out.find("__ct_malloc_unreachable").unwrap();
        let autofree = out.find("call void @__ct_autofree(ptr %p)").unwrap();
        assert!(unreachable < autofree);
    }

    #[test]
    fn local_allocation_gets_autofree_before_every_return() {
        let out = run(
            "define void @f(i1 %c) {\n  %p = call ptr @malloc(i64 16)\n  store i8 1, ptr %p, align 1\n  br i1 %c, label %a, label %b\n\na:\n  ret void\n\nb:\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
        );
        assert_eq!(out.matches("call void @__ct_autofree(ptr %p)").count(), 2);
        // Each autofree directly precedes its ret.
        for block in ["a:", "b:"] {
            let at = out.find(block).unwrap();
            let autofree = out[at..].find("__ct_autofree").unwrap();
            let ret = out[at..].find("ret void").unwrap();
            assert!(autofree < ret);
        }
    }

    #[test]
    fn escaped_allocation_gets_no_autofree() {
        let out = run(
            "define ptr @f() {\n  %p = call ptr @malloc(i64 16)\n  ret ptr %p\n}\ndeclare ptr @malloc(i64)\n",
        );
        assert!(out.contains("@__ct_malloc(i64 16"));
        assert!(!out.contains("__ct_autofree"));
    }

    #[test]
    fn freed_allocation_gets_no_autofree() {
        let out = run(
            "define void @f() {\n  %p = call ptr @malloc(i64 8)\n  store i8 0, ptr %p, align 1\n  call void @free(ptr %p)\n  ret void\n}\ndeclare ptr @malloc(i64)\ndeclare void @free(ptr)\n",
        );
        assert!(!out.contains("__ct_autofree"));
    }

    #[test]
    fn operator_new_variants_are_replaced() {
        let out = run(
            "define void @f() {\n  %a = call ptr @_Znwm(i64 4)\n  %b = call ptr @_Znam(i64 12)\n  call void @_ZdlPv(ptr %a)\n  call void @_ZdaPv(ptr %b)\n  ret void\n}\ndeclare ptr @_Znwm(i64)\ndeclare ptr @_Znam(i64)\ndeclare void @_ZdlPv(ptr)\ndeclare void @_ZdaPv(ptr)\n",
        );
        assert!(out.contains("%a = call ptr @__ct_new(i64 4, ptr @.ct.site.0)"));
        assert!(out.contains("%b = call ptr @__ct_new_array(i64 12, ptr @.ct.site.0)"));
        assert!(out.contains("call void @__ct_delete(ptr %a)"));
        assert!(out.contains("call void @__ct_delete_array(ptr %b)"));
    }

    #[test]
    fn sized_and_nothrow_deletes_map_to_variants() {
        let out = run(
            "define void @f(ptr %p, ptr %q, ptr %r) {\n  call void @_ZdlPvm(ptr %p, i64 4)\n  call void @_ZdlPvRKSt9nothrow_t(ptr %q, ptr %r)\n  ret void\n}\ndeclare void @_ZdlPvm(ptr, i64)\ndeclare void @_ZdlPvRKSt9nothrow_t(ptr, ptr)\n",
        );
        assert!(out.contains("call void @__ct_delete(ptr %p)"));
        assert!(out.contains("call void @__ct_delete_nothrow(ptr %q)"));
    }

    #[test]
    fn invoke_keeps_destinations_and_dbg() {
        let out = run(
            "define void @f() personality ptr @__gxx_personality_v0 {\n  %p = invoke ptr @_Znwm(i64 4) to label %ok unwind label %bad, !dbg !9\n\nok:\n  ret void\n\nbad:\n  %lp = landingpad { ptr, i32 } cleanup\n  resume { ptr, i32 } %lp\n}\ndeclare ptr @_Znwm(i64)\ndeclare i32 @__gxx_personality_v0(...)\n!9 = !DILocation(line: 3, column: 1, scope: !4)\n!4 = distinct !DISubprogram(name: \"f\", file: !1, scope: !1)\n!1 = !DIFile(filename: \"x.cc\", directory: \"/t\")\n",
        );
        assert!(out.contains(
            "%p = invoke ptr @__ct_new_unreachable(i64 4, ptr @.ct.site.0) to label %ok unwind label %bad, !dbg !9"
        ));
        // The immediate autofree lands in the normal destination.
        let ok_at = out.find("ok:").unwrap();
        let autofree_at = out.find("call void @__ct_autofree_delete(ptr %p)").unwrap();
        assert!(autofree_at > ok_at);
    }

    #[test]
    fn mmap_and_munmap_are_replaced() {
        let out = run(
            "define void @f() {\n  %m = call ptr @mmap(ptr null, i64 4096, i32 3, i32 34, i32 -1, i64 0)\n  %rc = call i32 @munmap(ptr %m, i64 4096)\n  ret void\n}\ndeclare ptr @mmap(ptr, i64, i32, i32, i32, i64)\ndeclare i32 @munmap(ptr, i64)\n",
        );
        assert!(out.contains(
            "%m = call ptr @__ct_mmap(ptr null, i64 4096, i32 3, i32 34, i32 -1, i64 0, ptr @.ct.site.0)"
        ));
        assert!(out.contains("%rc = call i32 @__ct_munmap(ptr %m, i64 4096, ptr @.ct.site.0)"));
    }

    #[test]
    fn narrow_size_arguments_are_widened() {
        let out = run(
            "define void @f(i32 %n) {\n  %p = call ptr @malloc(i32 %n)\n  store i8 0, ptr %p, align 1\n  ret void\n}\ndeclare ptr @malloc(i32)\n",
        );
        assert!(out.contains("%ct.arg.0 = zext i32 %n to i64"));
        assert!(out.contains("call ptr @__ct_malloc(i64 %ct.arg.0, ptr @.ct.site.0)"));
    }

    #[test]
    fn posix_memalign_slot_gets_load_and_autofree() {
        let out = run(
            "define void @f() {\n  %slot = alloca ptr, align 8\n  %rc = call i32 @posix_memalign(ptr %slot, i64 64, i64 128)\n  %p = load ptr, ptr %slot, align 8\n  store i8 0, ptr %p, align 1\n  ret void\n}\ndeclare i32 @posix_memalign(ptr, i64, i64)\n",
        );
        assert!(out.contains(
            "%rc = call i32 @__ct_posix_memalign(ptr %slot, i64 64, i64 128, ptr @.ct.site.0)"
        ));
        assert!(out.contains("%ct.af.0 = load ptr, ptr %slot"));
        let autofree = out.find("call void @__ct_autofree(ptr %ct.af.0)").unwrap();
        let ret = out.find("  ret void").unwrap();
        assert!(autofree < ret);
    }

    #[test]
    fn returning_allocator_caller_gets_immediate_autofree() {
        let out = run(
            "define ptr @my_alloc(i64 %n) {\n  %p = call ptr @malloc(i64 %n)\n  ret ptr %p\n}\ndefine void @caller() {\n  %x = call ptr @my_alloc(i64 32)\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
        );
        let call_at = out.find("%x = call ptr @my_alloc(i64 32)").unwrap();
        let autofree_at = out.find("call void @__ct_autofree(ptr %x)").unwrap();
        assert!(call_at < autofree_at);
    }

    #[test]
    fn runtime_functions_are_not_rewritten() {
        let out = run(
            "define linkonce_odr ptr @helper() {\n  %p = call ptr @malloc(i64 8)\n  ret ptr %p\n}\ndeclare ptr @malloc(i64)\n",
        );
        // Interposable linkage: left alone entirely.
        assert!(out.contains("%p = call ptr @malloc(i64 8)"));
        assert!(!out.contains("__ct_malloc"));
    }
}
