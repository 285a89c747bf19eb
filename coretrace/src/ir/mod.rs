//! In-memory representation of textual LLVM IR.
//!
//! The driver stops each cc1 job at textual IR, parses it into this model,
//! lets the instrumentation passes mutate it and prints it back. The model
//! is deliberately conservative: every line the passes do not understand or
//! do not touch is preserved verbatim, and only the instruction set the
//! passes reason about (calls, memory accesses, control flow, casts,
//! pointer arithmetic) is parsed into structured form. SSA names are stable
//! in textual IR, so replacing a defining instruction never requires
//! rewriting its uses.

mod analysis;
mod debug;
mod parse;
mod print;
mod types;

pub use analysis::DefUse;
pub use debug::{DebugInfo, Location, MetaNode, MetaValue};
pub use parse::parse_module;
pub(crate) use parse::parse_instruction;
pub use types::{DataLayout, Type, TypeTable};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrError {
    #[error("malformed IR at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("unterminated function body starting at line {0}")]
    UnterminatedFunction(usize),
}

/// A value operand. Locals and globals carry their name without the sigil;
/// everything else (literals, aggregate constants, constant expressions)
/// keeps its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueRef {
    Local(String),
    Global(String),
    Const(String),
}

impl ValueRef {
    pub fn as_local(&self) -> Option<&str> {
        match self {
            ValueRef::Local(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&str> {
        match self {
            ValueRef::Global(name) => Some(name),
            _ => None,
        }
    }

    /// Step through cast-kind constant expressions: `bitcast (ptr @g to
    /// ptr)` refers to `@g`. Returns the referenced global, if any.
    pub fn strip_constexpr_global(&self) -> Option<&str> {
        match self {
            ValueRef::Global(name) => Some(name),
            ValueRef::Const(text) => {
                let looks_like_cast = text.starts_with("bitcast")
                    || text.starts_with("addrspacecast")
                    || text.starts_with("getelementptr")
                    || text.starts_with("ptrtoint")
                    || text.starts_with("inttoptr");
                if !looks_like_cast {
                    return None;
                }
                let at = text.find('@')?;
                let rest = &text[at + 1..];
                let end = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '$'))
                    .unwrap_or(rest.len());
                Some(&rest[..end])
            }
            _ => None,
        }
    }

    /// Render the operand the way it appeared in the IR.
    pub fn render(&self) -> String {
        match self {
            ValueRef::Local(name) => format!("%{name}"),
            ValueRef::Global(name) => {
                if name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$') {
                    format!("@{name}")
                } else {
                    format!("@\"{name}\"")
                }
            }
            ValueRef::Const(text) => text.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CastKind {
    Bitcast,
    AddrSpaceCast,
    PtrToInt,
    IntToPtr,
    Trunc,
    ZExt,
    SExt,
    FpExt,
    FpTrunc,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Direct(String),
    Indirect(ValueRef),
    InlineAsm,
}

#[derive(Clone, Debug)]
pub struct CallInst {
    pub callee: Callee,
    pub ret_ty: Type,
    pub args: Vec<(Type, ValueRef)>,
    /// The printed signature carried a varargs function type.
    pub varargs: bool,
    /// `invoke` only: `to label %normal unwind label %unwind`.
    pub normal_dest: Option<String>,
    pub unwind_dest: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Op {
    Call(CallInst),
    Invoke(CallInst),
    Load {
        ty: Type,
        ptr: ValueRef,
    },
    Store {
        ty: Type,
        value: ValueRef,
        ptr: ValueRef,
    },
    AtomicRmw {
        ty: Type,
        ptr: ValueRef,
        value: ValueRef,
    },
    CmpXchg {
        ty: Type,
        ptr: ValueRef,
        expected: ValueRef,
        replacement: ValueRef,
    },
    Ret {
        ty: Option<Type>,
        value: Option<ValueRef>,
    },
    Br {
        cond: Option<ValueRef>,
    },
    Switch {
        cond: ValueRef,
    },
    Unreachable,
    Alloca {
        ty: Type,
    },
    Cast {
        kind: CastKind,
        value: ValueRef,
        to: Type,
    },
    Gep {
        base_ty: Type,
        ptr: ValueRef,
        indices: Vec<ValueRef>,
    },
    Phi {
        ty: Type,
        incoming: Vec<(ValueRef, String)>,
    },
    Select {
        ty: Type,
        cond: ValueRef,
        if_true: ValueRef,
        if_false: ValueRef,
    },
    ICmp {
        lhs: ValueRef,
        rhs: ValueRef,
    },
    /// Unmodelled instruction; operands are the referenced locals/globals.
    Other {
        operands: Vec<ValueRef>,
    },
}

#[derive(Clone, Debug)]
pub struct Inst {
    /// Exact text to print, including the result assignment.
    pub text: String,
    pub result: Option<String>,
    pub op: Op,
    pub dbg: Option<u64>,
}

impl Inst {
    /// Every local/global operand, in no particular order. The escape and
    /// def-use machinery works off this.
    pub fn operands(&self) -> Vec<&ValueRef> {
        let mut out = Vec::new();
        match &self.op {
            Op::Call(call) | Op::Invoke(call) => {
                if let Callee::Indirect(target) = &call.callee {
                    out.push(target);
                }
                for (_, arg) in &call.args {
                    out.push(arg);
                }
            }
            Op::Load { ptr, .. } => out.push(ptr),
            Op::Store { value, ptr, .. } => {
                out.push(value);
                out.push(ptr);
            }
            Op::AtomicRmw { ptr, value, .. } => {
                out.push(ptr);
                out.push(value);
            }
            Op::CmpXchg {
                ptr,
                expected,
                replacement,
                ..
            } => {
                out.push(ptr);
                out.push(expected);
                out.push(replacement);
            }
            Op::Ret { value, .. } => {
                if let Some(value) = value {
                    out.push(value);
                }
            }
            Op::Br { cond } => {
                if let Some(cond) = cond {
                    out.push(cond);
                }
            }
            Op::Switch { cond } => out.push(cond),
            Op::Unreachable => {}
            Op::Alloca { .. } => {}
            Op::Cast { value, .. } => out.push(value),
            Op::Gep { ptr, indices, .. } => {
                out.push(ptr);
                for index in indices {
                    out.push(index);
                }
            }
            Op::Phi { incoming, .. } => {
                for (value, _) in incoming {
                    out.push(value);
                }
            }
            Op::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                out.push(cond);
                out.push(if_true);
                out.push(if_false);
            }
            Op::ICmp { lhs, rhs } => {
                out.push(lhs);
                out.push(rhs);
            }
            Op::Other { operands } => {
                for operand in operands {
                    out.push(operand);
                }
            }
        }
        out
    }

    pub fn as_call(&self) -> Option<&CallInst> {
        match &self.op {
            Op::Call(call) | Op::Invoke(call) => Some(call),
            _ => None,
        }
    }

    pub fn is_invoke(&self) -> bool {
        matches!(self.op, Op::Invoke(_))
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    /// The label line exactly as written (`"entry:"`, `"5:  ; preds"`),
    /// absent for the implicit first block.
    pub label_line: Option<String>,
    pub insts: Vec<Inst>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    External,
    Private,
    Internal,
    AvailableExternally,
    LinkOnce,
    LinkOnceOdr,
    Weak,
    WeakOdr,
    Common,
    Appending,
    ExternWeak,
}

impl Linkage {
    /// Linkage kinds the instrumentation must leave alone: another
    /// definition may replace these at link time.
    pub fn is_interposable(self) -> bool {
        matches!(
            self,
            Linkage::AvailableExternally
                | Linkage::LinkOnce
                | Linkage::LinkOnceOdr
                | Linkage::Weak
                | Linkage::WeakOdr
        )
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    /// The full `define ...` header line, without the trailing `{`.
    pub header: String,
    pub name: String,
    pub linkage: Linkage,
    pub ret_ty: Type,
    /// Attribute tokens from the header: plain keywords and `#N` group refs.
    pub attrs: Vec<String>,
    /// `!dbg !N` on the definition, pointing at the DISubprogram.
    pub subprogram: Option<u64>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn insts(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|block| block.insts.iter())
    }
}

#[derive(Clone, Debug)]
pub enum Item {
    /// Any top-level line we do not model (globals, attributes, metadata,
    /// comments, declares). Printed back verbatim.
    Verbatim(String),
    Function(Function),
}

pub struct Module {
    pub items: Vec<Item>,
    pub datalayout: DataLayout,
    pub triple: Option<String>,
    pub types: TypeTable,
    pub debug: DebugInfo,
    /// `attributes #N = { ... }` groups, for attribute queries.
    pub attr_groups: FxHashMap<u64, Vec<String>>,
    /// Names of globals and functions already present in the module.
    defined_symbols: FxHashSet<String>,
    /// Synthesized top-level lines (site strings, config globals, declares)
    /// appended on print.
    synthesized: Vec<String>,
    next_string_id: usize,
}

impl Module {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            datalayout: DataLayout::default(),
            triple: None,
            types: TypeTable::default(),
            debug: DebugInfo::default(),
            attr_groups: FxHashMap::default(),
            defined_symbols: FxHashSet::default(),
            synthesized: Vec::new(),
            next_string_id: 0,
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(func) => Some(func),
            _ => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.items.iter_mut().filter_map(|item| match item {
            Item::Function(func) => Some(func),
            _ => None,
        })
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.defined_symbols.contains(name)
    }

    pub(crate) fn record_symbol(&mut self, name: &str) {
        self.defined_symbols.insert(name.to_owned());
    }

    /// Append a synthesized top-level line (printed after the original
    /// items). The symbol name is recorded so later requests are no-ops.
    pub fn add_synthesized(&mut self, name: &str, line: String) -> bool {
        if self.defined_symbols.contains(name) {
            return false;
        }
        self.defined_symbols.insert(name.to_owned());
        self.synthesized.push(line);
        true
    }

    /// Declare a runtime function unless the module already has it.
    pub fn ensure_declared(&mut self, name: &str, signature: &str) {
        if self.defined_symbols.contains(name) {
            return;
        }
        self.add_synthesized(name, format!("declare {signature}"));
    }

    /// Add a private NUL-terminated string constant and return the global's
    /// name. `prefix` selects the naming family (`.ct.site` / `.ct.func`).
    pub fn add_string_constant(&mut self, prefix: &str, text: &str) -> String {
        let id = self.next_string_id;
        self.next_string_id += 1;
        let name = format!("{prefix}.{id}");

        let mut encoded = String::new();
        for &byte in text.as_bytes() {
            match byte {
                b'\\' => encoded.push_str("\\5C"),
                b'"' => encoded.push_str("\\22"),
                0x20..=0x7e => encoded.push(byte as char),
                _ => encoded.push_str(&format!("\\{byte:02X}")),
            }
        }
        encoded.push_str("\\00");

        let line = format!(
            "@{name} = private unnamed_addr constant [{} x i8] c\"{encoded}\", align 1",
            text.len() + 1
        );
        self.add_synthesized(&name, line);
        name
    }

    /// Emit or overwrite an `i32` config global with weak-ODR linkage.
    pub fn set_config_global(&mut self, name: &str, value: i32) {
        let line = format!("@{name} = weak_odr global i32 {value}");
        if self.defined_symbols.contains(name) {
            // Already synthesized earlier in this run; rewrite in place.
            if let Some(existing) = self
                .synthesized
                .iter_mut()
                .find(|l| l.starts_with(&format!("@{name} ")))
            {
                *existing = line;
                return;
            }
            // Present in the original module: override textually.
            for item in &mut self.items {
                if let Item::Verbatim(text) = item {
                    if text.starts_with(&format!("@{name} ")) {
                        *text = line;
                        return;
                    }
                }
            }
            return;
        }
        self.add_synthesized(name, line);
    }

    /// Does the function attribute list (including groups) contain `what`,
    /// either as a bare keyword or a quoted string attribute?
    pub fn function_has_attr(&self, func: &Function, what: &str) -> bool {
        let quoted = format!("\"{what}\"");
        for attr in &func.attrs {
            if attr == what || *attr == quoted {
                return true;
            }
            if let Some(group) = attr.strip_prefix('#') {
                if let Ok(id) = group.parse::<u64>() {
                    if let Some(tokens) = self.attr_groups.get(&id) {
                        if tokens.iter().any(|t| t == what || *t == quoted) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    pub(crate) fn synthesized_lines(&self) -> &[String] {
        &self.synthesized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_constants_are_deduplicated_by_name_only() {
        let mut module = Module::new();
        let a = module.add_string_constant(".ct.site", "a.c:1:2");
        let b = module.add_string_constant(".ct.site", "a.c:9:9");
        assert_ne!(a, b);
        assert!(module.has_symbol(&a));
    }

    #[test]
    fn string_encoding_escapes_specials() {
        let mut module = Module::new();
        module.add_string_constant(".ct.site", "a\"b\\c\n");
        let line = module.synthesized_lines().last().unwrap();
        assert!(line.contains("c\"a\\22b\\5Cc\\0A\\00\""));
        assert!(line.contains("[7 x i8]"));
    }

    #[test]
    fn ensure_declared_is_idempotent() {
        let mut module = Module::new();
        module.ensure_declared("__ct_malloc", "ptr @__ct_malloc(i64, ptr)");
        module.ensure_declared("__ct_malloc", "ptr @__ct_malloc(i64, ptr)");
        assert_eq!(
            module
                .synthesized_lines()
                .iter()
                .filter(|l| l.contains("__ct_malloc"))
                .count(),
            1
        );
    }

    #[test]
    fn constexpr_global_stripping() {
        let v = ValueRef::Const("bitcast (ptr @target to ptr)".to_owned());
        assert_eq!(v.strip_constexpr_global(), Some("target"));
        let v = ValueRef::Const("getelementptr inbounds ([4 x i8], ptr @.str, i64 0, i64 0)".to_owned());
        assert_eq!(v.strip_constexpr_global(), Some(".str"));
        let v = ValueRef::Const("42".to_owned());
        assert_eq!(v.strip_constexpr_global(), None);
    }

    #[test]
    fn config_global_emission_and_override() {
        let mut module = Module::new();
        module.set_config_global("__ct_config_shadow", 1);
        module.set_config_global("__ct_config_shadow", 0);
        let lines: Vec<_> = module
            .synthesized_lines()
            .iter()
            .filter(|l| l.contains("__ct_config_shadow"))
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(*lines[0], "@__ct_config_shadow = weak_odr global i32 0");
    }
}
