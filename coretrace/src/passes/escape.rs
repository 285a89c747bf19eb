//! Whole-function escape analysis for allocation sites.
//!
//! Starting from an allocation's SSA result (or from a `posix_memalign`
//! output slot via its load-uses), the walker follows every use through
//! casts, GEPs, phis and selects and classifies what happens to the
//! pointer. The resulting state is a total order; observing a worse fate
//! only ever raises it. Only `ReachableLocal` sites, where the pointer
//! provably never leaves its function, get an automatic free at returns.

use rustc_hash::FxHashSet;

use crate::ir::{Callee, CastKind, DefUse, Function, Module, Op, ValueRef};
use crate::passes::alloc::allocator_kind;

/// The fate of an allocation's pointer, worst-use-wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscapeState {
    /// No non-debug, non-cast user at all.
    Unreachable,
    /// Used, but never leaves the function.
    ReachableLocal,
    /// Stored somewhere global memory can reach.
    ReachableGlobal,
    /// Stored through a pointer the analysis cannot bound.
    EscapedStore,
    /// Passed to a call that may capture or free it.
    EscapedCall,
    /// Returned to the caller.
    EscapedReturn,
    /// Reached an instruction the analysis does not model.
    EscapedScan,
}

/// Callees that take ownership of the pointer: classifying these as
/// `EscapedCall` both suppresses the autofree and avoids double frees.
fn is_free_like(name: &str) -> bool {
    if matches!(name, "free" | "cfree" | "munmap") {
        return true;
    }
    if name.starts_with("__ct_free")
        || name.starts_with("__ct_delete")
        || name.starts_with("__ct_autofree")
        || name.starts_with("__ct_munmap")
    {
        return true;
    }
    // operator delete manglings, with platform prefixes stripped.
    let name = name.strip_prefix('\u{1}').unwrap_or(name);
    let name = name.strip_prefix('_').filter(|n| n.starts_with("_Z")).unwrap_or(name);
    name.starts_with("_ZdlPv") || name.starts_with("_ZdaPv")
}

fn is_ignored_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.dbg.")
        || name.starts_with("llvm.lifetime.")
        || name.starts_with("llvm.assume")
        || name.starts_with("llvm.experimental.noalias")
}

/// Intrinsics that read or write through the pointer without capturing it.
fn is_nocapture_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.memset.")
        || name.starts_with("llvm.memcpy.")
        || name.starts_with("llvm.memmove.")
        || name.starts_with("llvm.prefetch")
}

struct Walker<'a> {
    func: &'a Function,
    defuse: &'a DefUse,
    /// Visited set doubles as the in-progress guard for phi/select cycles.
    visited: FxHashSet<String>,
}

impl<'a> Walker<'a> {
    fn new(func: &'a Function, defuse: &'a DefUse) -> Self {
        Self {
            func,
            defuse,
            visited: FxHashSet::default(),
        }
    }

    fn classify(&mut self, name: &str) -> EscapeState {
        if !self.visited.insert(name.to_owned()) {
            // A cycle through phi/select adds nothing new.
            return EscapeState::ReachableLocal;
        }

        let mut state = EscapeState::ReachableLocal;
        for &pos in self.defuse.uses(name) {
            let Some(inst) = self.defuse.inst_at(self.func, pos) else {
                continue;
            };
            state = state.max(self.classify_use(name, inst));
            if state == EscapeState::EscapedScan {
                break;
            }
        }
        state
    }

    fn classify_use(&mut self, name: &str, inst: &crate::ir::Inst) -> EscapeState {
        match &inst.op {
            Op::Call(call) | Op::Invoke(call) => self.classify_call(call),
            Op::Ret { .. } => EscapeState::EscapedReturn,
            Op::Store { value, ptr, .. } => {
                if value.as_local() == Some(name) {
                    self.classify_store_dest(ptr)
                } else {
                    // A store *through* our pointer is a plain write.
                    EscapeState::ReachableLocal
                }
            }
            Op::Load { .. } => EscapeState::ReachableLocal,
            Op::AtomicRmw { value, .. } => {
                if value.as_local() == Some(name) {
                    EscapeState::EscapedStore
                } else {
                    EscapeState::ReachableLocal
                }
            }
            Op::CmpXchg {
                expected,
                replacement,
                ..
            } => {
                if replacement.as_local() == Some(name) || expected.as_local() == Some(name) {
                    EscapeState::EscapedStore
                } else {
                    EscapeState::ReachableLocal
                }
            }
            Op::Br { .. } | Op::Switch { .. } | Op::ICmp { .. } | Op::Unreachable => {
                EscapeState::ReachableLocal
            }
            // Pointer identity survives casts; so does a scalar escape of
            // the integer image of the pointer.
            Op::Cast { .. } => self.classify_result(inst),
            Op::Gep { ptr, .. } => {
                if ptr.as_local() == Some(name) {
                    self.classify_result(inst)
                } else {
                    // Our pointer used as an index is a plain integer use.
                    EscapeState::ReachableLocal
                }
            }
            Op::Phi { .. } | Op::Select { .. } => self.classify_result(inst),
            Op::Alloca { .. } => EscapeState::ReachableLocal,
            Op::Other { .. } => EscapeState::EscapedScan,
        }
    }

    fn classify_result(&mut self, inst: &crate::ir::Inst) -> EscapeState {
        match &inst.result {
            Some(result) => {
                let result = result.clone();
                self.classify(&result)
            }
            None => EscapeState::ReachableLocal,
        }
    }

    fn classify_call(&mut self, call: &crate::ir::CallInst) -> EscapeState {
        match &call.callee {
            Callee::Direct(callee) => {
                if is_ignored_intrinsic(callee) || is_nocapture_intrinsic(callee) {
                    return EscapeState::ReachableLocal;
                }
                if is_free_like(callee) {
                    // Ownership transferred.
                    return EscapeState::EscapedCall;
                }
                if call.varargs {
                    return EscapeState::EscapedCall;
                }
                // Without attribute-level capture information every other
                // call may retain the pointer.
                EscapeState::EscapedCall
            }
            Callee::Indirect(_) | Callee::InlineAsm => EscapeState::EscapedCall,
        }
    }

    fn classify_store_dest(&mut self, dest: &ValueRef) -> EscapeState {
        // Store into a global (directly or through a cast constant
        // expression): reachable from anywhere, but not lost.
        if dest.strip_constexpr_global().is_some() {
            return EscapeState::ReachableGlobal;
        }

        let Some(dest_name) = dest.as_local() else {
            return EscapeState::EscapedStore;
        };

        // Strip casts/GEPs on the destination.
        let mut base = dest_name.to_owned();
        for _ in 0..16 {
            let Some(inst) = self
                .defuse
                .def(&base)
                .and_then(|pos| self.defuse.inst_at(self.func, pos))
            else {
                // Unknown producer (function argument): not bounded.
                return EscapeState::EscapedStore;
            };
            match &inst.op {
                Op::Cast { kind, value, .. }
                    if matches!(kind, CastKind::Bitcast | CastKind::AddrSpaceCast) =>
                {
                    match value.as_local() {
                        Some(name) => base = name.to_owned(),
                        None => return EscapeState::EscapedStore,
                    }
                }
                Op::Gep { ptr, .. } => match ptr.as_local() {
                    Some(name) => base = name.to_owned(),
                    None => {
                        return if ptr.strip_constexpr_global().is_some() {
                            EscapeState::ReachableGlobal
                        } else {
                            EscapeState::EscapedStore
                        }
                    }
                },
                Op::Alloca { .. } => {
                    return self.classify_via_alloca(&base);
                }
                _ => return EscapeState::EscapedStore,
            }
        }
        EscapeState::EscapedStore
    }

    /// Our pointer was parked in a stack slot. If the slot's own address
    /// never escapes, every load from it is just an alias of the pointer;
    /// classify those. Otherwise the store published the pointer.
    fn classify_via_alloca(&mut self, alloca: &str) -> EscapeState {
        if self.alloca_address_escapes(alloca) {
            return EscapeState::EscapedStore;
        }

        let mut state = EscapeState::ReachableLocal;
        let loads: Vec<String> = self
            .defuse
            .uses(alloca)
            .iter()
            .filter_map(|&pos| {
                let inst = self.defuse.inst_at(self.func, pos)?;
                match &inst.op {
                    Op::Load { ptr, .. } if ptr.as_local() == Some(alloca) => {
                        inst.result.clone()
                    }
                    _ => None,
                }
            })
            .collect();
        for load in loads {
            state = state.max(self.classify(&load));
        }
        state
    }

    fn alloca_address_escapes(&self, alloca: &str) -> bool {
        for &pos in self.defuse.uses(alloca) {
            let Some(inst) = self.defuse.inst_at(self.func, pos) else {
                continue;
            };
            match &inst.op {
                Op::Load { .. } => {}
                Op::Store { ptr, .. } if ptr.as_local() == Some(alloca) => {}
                Op::Call(call) | Op::Invoke(call) => {
                    let ignorable = matches!(
                        &call.callee,
                        Callee::Direct(name) if is_ignored_intrinsic(name)
                    );
                    if !ignorable {
                        return true;
                    }
                }
                _ => return true,
            }
        }
        false
    }
}

/// Classify the fate of an allocation's SSA result.
pub fn classify_allocation(func: &Function, defuse: &DefUse, result: &str) -> EscapeState {
    Walker::new(func, defuse).classify(result)
}

/// Classify a `posix_memalign`-style output slot: the allocation
/// materializes through loads of the slot. `alloc_call` is the position of
/// the allocation call itself, which legitimately takes the slot's address.
pub fn classify_slot(
    func: &Function,
    defuse: &DefUse,
    slot: &str,
    alloc_call: (usize, usize),
) -> EscapeState {
    // The slot's address must not leak anywhere besides the allocator.
    for &pos in defuse.uses(slot) {
        if pos == alloc_call {
            continue;
        }
        let Some(inst) = defuse.inst_at(func, pos) else {
            continue;
        };
        match &inst.op {
            Op::Load { .. } => {}
            Op::Store { ptr, .. } if ptr.as_local() == Some(slot) => {}
            Op::Call(call) | Op::Invoke(call) => {
                let ignorable = matches!(
                    &call.callee,
                    Callee::Direct(name) if is_ignored_intrinsic(name)
                );
                if !ignorable {
                    return EscapeState::EscapedCall;
                }
            }
            _ => return EscapeState::EscapedScan,
        }
    }

    let mut walker = Walker::new(func, defuse);
    let mut state = EscapeState::ReachableLocal;
    let loads: Vec<String> = defuse
        .uses(slot)
        .iter()
        .filter_map(|&pos| {
            let inst = defuse.inst_at(func, pos)?;
            match &inst.op {
                Op::Load { ptr, .. } if ptr.as_local() == Some(slot) => inst.result.clone(),
                _ => None,
            }
        })
        .collect();
    for load in loads {
        state = state.max(walker.classify(&load));
    }
    state
}

/// Functions whose every return value is a call to a known allocator of
/// one agreed kind. Callers discard their result? Then the callee's
/// allocation can be freed right after the call.
pub struct ReturnAllocators {
    map: rustc_hash::FxHashMap<String, crate::passes::alloc::AllocKind>,
}

impl ReturnAllocators {
    pub fn build(module: &Module) -> Self {
        let mut map = rustc_hash::FxHashMap::default();

        for func in module.functions() {
            let defuse = DefUse::build(func);
            let mut kinds = Vec::new();
            let mut eligible = true;
            let mut saw_ret = false;

            for inst in func.insts() {
                let Op::Ret { value, .. } = &inst.op else {
                    continue;
                };
                saw_ret = true;
                let Some(value) = value else {
                    eligible = false;
                    break;
                };

                // Strip pointer casts back to the defining call.
                let mut current = value.clone();
                let mut resolved = None;
                for _ in 0..16 {
                    let Some(name) = current.as_local() else {
                        break;
                    };
                    let Some(def) = defuse.def(name).and_then(|pos| defuse.inst_at(func, pos))
                    else {
                        break;
                    };
                    match &def.op {
                        Op::Cast { kind, value, .. }
                            if matches!(kind, CastKind::Bitcast | CastKind::AddrSpaceCast) =>
                        {
                            current = value.clone();
                        }
                        Op::Call(call) | Op::Invoke(call) => {
                            if let Callee::Direct(callee) = &call.callee {
                                resolved = allocator_kind(callee);
                            }
                            break;
                        }
                        _ => break,
                    }
                }

                match resolved {
                    Some(kind) => kinds.push(kind),
                    None => {
                        eligible = false;
                        break;
                    }
                }
            }

            if eligible && saw_ret && !kinds.is_empty() && kinds.windows(2).all(|w| w[0] == w[1])
            {
                map.insert(func.name.clone(), kinds[0]);
            }
        }

        Self { map }
    }

    pub fn kind_of(&self, name: &str) -> Option<crate::passes::alloc::AllocKind> {
        self.map.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    fn classify_in(source: &str, result: &str) -> EscapeState {
        let module = parse_module(source).unwrap();
        let func = module.functions().next().unwrap();
        let defuse = DefUse::build(func);
        classify_allocation(func, &defuse, result)
    }

    #[test]
    fn local_only_use_is_reachable_local() {
        let state = classify_in(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  store i32 42, ptr %p, align 4\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableLocal);
    }

    #[test]
    fn returned_pointer_escapes_by_return() {
        let state = classify_in(
            "define ptr @f() {\n  %p = call ptr @malloc(i64 16)\n  ret ptr %p\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedReturn);
    }

    #[test]
    fn store_to_global_is_reachable_global() {
        let state = classify_in(
            "@sink = global ptr null\ndefine void @f() {\n  %p = call ptr @malloc(i64 16)\n  store ptr %p, ptr @sink, align 8\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableGlobal);
    }

    #[test]
    fn store_to_unknown_pointer_escapes() {
        let state = classify_in(
            "define void @f(ptr %out) {\n  %p = call ptr @malloc(i64 16)\n  store ptr %p, ptr %out, align 8\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedStore);
    }

    #[test]
    fn call_to_free_is_escaped_call() {
        let state = classify_in(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  call void @free(ptr %p)\n  ret void\n}\ndeclare ptr @malloc(i64)\ndeclare void @free(ptr)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedCall);
    }

    #[test]
    fn varargs_call_escapes() {
        let state = classify_in(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  %n = call i32 (ptr, ...) @printf(ptr @.fmt, ptr %p)\n  ret void\n}\n@.fmt = private constant [3 x i8] c\"%p\\00\"\ndeclare ptr @malloc(i64)\ndeclare i32 @printf(ptr, ...)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedCall);
    }

    #[test]
    fn dead_stack_slot_stays_local() {
        // The O0 pattern: pointer parked in an alloca, reloaded, used
        // locally only.
        let state = classify_in(
            "define void @f() {\n  %slot = alloca ptr, align 8\n  %p = call ptr @malloc(i64 16)\n  store ptr %p, ptr %slot, align 8\n  %q = load ptr, ptr %slot, align 8\n  store i32 1, ptr %q, align 4\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableLocal);
    }

    #[test]
    fn reloaded_pointer_returned_escapes() {
        let state = classify_in(
            "define ptr @f() {\n  %slot = alloca ptr, align 8\n  %p = call ptr @malloc(i64 16)\n  store ptr %p, ptr %slot, align 8\n  %q = load ptr, ptr %slot, align 8\n  ret ptr %q\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedReturn);
    }

    #[test]
    fn slot_address_passed_to_call_escapes() {
        let state = classify_in(
            "define void @f() {\n  %slot = alloca ptr, align 8\n  %p = call ptr @malloc(i64 16)\n  store ptr %p, ptr %slot, align 8\n  call void @sink(ptr %slot)\n  ret void\n}\ndeclare ptr @malloc(i64)\ndeclare void @sink(ptr)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedStore);
    }

    #[test]
    fn gep_and_cast_chains_are_transparent() {
        let state = classify_in(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  %q = getelementptr inbounds i8, ptr %p, i64 8\n  %r = bitcast ptr %q to ptr\n  store i8 0, ptr %r, align 1\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableLocal);
    }

    #[test]
    fn ptrtoint_return_propagates_scalar_escape() {
        let state = classify_in(
            "define i64 @f() {\n  %p = call ptr @malloc(i64 16)\n  %v = ptrtoint ptr %p to i64\n  ret i64 %v\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedReturn);
    }

    #[test]
    fn icmp_and_branch_do_not_escape() {
        let state = classify_in(
            "define void @f(i1 %c) {\n  %p = call ptr @malloc(i64 16)\n  %isnull = icmp eq ptr %p, null\n  br i1 %isnull, label %a, label %b\n\na:\n  ret void\n\nb:\n  store i8 1, ptr %p, align 1\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableLocal);
    }

    #[test]
    fn phi_cycles_terminate() {
        let state = classify_in(
            "define void @f(i1 %c) {\n  %p = call ptr @malloc(i64 16)\n  br label %loop\n\nloop:\n  %cur = phi ptr [ %p, %0 ], [ %next, %loop ]\n  %next = getelementptr inbounds i8, ptr %cur, i64 1\n  br i1 %c, label %loop, label %done\n\ndone:\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::ReachableLocal);
    }

    #[test]
    fn select_escape_propagates() {
        let state = classify_in(
            "define ptr @f(i1 %c, ptr %other) {\n  %p = call ptr @malloc(i64 16)\n  %sel = select i1 %c, ptr %p, ptr %other\n  ret ptr %sel\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedReturn);
    }

    #[test]
    fn unmodelled_user_is_escaped_scan() {
        let state = classify_in(
            "define void @f() {\n  %p = call ptr @malloc(i64 16)\n  %v = ptrtoint ptr %p to i64\n  %x = add i64 %v, 1\n  ret void\n}\ndeclare ptr @malloc(i64)\n",
            "p",
        );
        assert_eq!(state, EscapeState::EscapedScan);
    }

    #[test]
    fn return_allocator_inference() {
        let module = parse_module(
            "define ptr @my_alloc(i64 %n) {\n  %p = call ptr @malloc(i64 %n)\n  ret ptr %p\n}\ndefine ptr @maybe_alloc(i1 %c, i64 %n) {\n  br i1 %c, label %a, label %b\n\na:\n  %p = call ptr @malloc(i64 %n)\n  ret ptr %p\n\nb:\n  ret ptr null\n}\ndeclare ptr @malloc(i64)\n",
        )
        .unwrap();
        let allocators = ReturnAllocators::build(&module);
        assert_eq!(
            allocators.kind_of("my_alloc"),
            Some(crate::passes::alloc::AllocKind::Malloc)
        );
        assert_eq!(allocators.kind_of("maybe_alloc"), None);
    }

    #[test]
    fn posix_memalign_slot_classification() {
        let module = parse_module(
            "define void @f() {\n  %slot = alloca ptr, align 8\n  %rc = call i32 @posix_memalign(ptr %slot, i64 64, i64 256)\n  %p = load ptr, ptr %slot, align 8\n  store i8 0, ptr %p, align 1\n  ret void\n}\ndeclare i32 @posix_memalign(ptr, i64, i64)\n",
        )
        .unwrap();
        let func = module.functions().next().unwrap();
        let defuse = DefUse::build(func);
        // The allocation call sits at block 0, instruction 1.
        let state = classify_slot(func, &defuse, "slot", (0, 1));
        assert_eq!(state, EscapeState::ReachableLocal);
    }
}
