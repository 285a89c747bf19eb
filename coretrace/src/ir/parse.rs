//! Parser for the textual IR subset the passes reason about.
//!
//! The outer loop is line oriented: top-level lines become verbatim items,
//! type/metadata/attribute lines additionally feed the side tables, and
//! `define` opens a function body. Inside a body every line is kept as
//! text; instructions the passes care about are parsed into [`Op`]s, and
//! anything else degrades to [`Op::Other`] with its operands extracted, so
//! def-use stays complete even over unmodelled instructions.

use super::debug::parse_metadata_line;
use super::types::Type;
use super::{Block, CallInst, Callee, CastKind, Function, Inst, IrError, Item, Linkage, Module, Op, ValueRef};

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Word(String),
    Local(String),
    Global(String),
    Meta(String),
    AttrRef(u64),
    Str(String),
    Punct(char),
    Ellipsis,
}

#[derive(Clone)]
struct SpannedTok {
    tok: Tok,
    start: usize,
    end: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '-' | '+')
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '-')
}

fn tokenize(line: &str) -> Vec<SpannedTok> {
    let mut toks = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == ';' {
            break;
        }

        let start = i;
        match c {
            '%' | '@' | '!' | '#' => {
                i += 1;
                let (name, end) = if i < bytes.len() && bytes[i] == b'"' {
                    i += 1;
                    let name_start = i;
                    while i < bytes.len() && bytes[i] != b'"' {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    let name = line[name_start..i.min(line.len())].to_owned();
                    i += 1;
                    (name, i)
                } else {
                    let name_start = i;
                    while i < bytes.len() && is_name_char(bytes[i] as char) {
                        i += 1;
                    }
                    (line[name_start..i].to_owned(), i)
                };
                let tok = match c {
                    '%' => Tok::Local(name),
                    '@' => Tok::Global(name),
                    '!' => Tok::Meta(name),
                    _ => match name.parse::<u64>() {
                        Ok(id) => Tok::AttrRef(id),
                        Err(_) => Tok::Word(format!("#{name}")),
                    },
                };
                toks.push(SpannedTok {
                    tok,
                    start,
                    end,
                });
            }
            '"' => {
                i += 1;
                let content_start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                let content = line[content_start..i.min(line.len())].to_owned();
                i += 1;
                toks.push(SpannedTok {
                    tok: Tok::Str(content),
                    start,
                    end: i,
                });
            }
            '.' if bytes[i..].starts_with(b"...") => {
                i += 3;
                toks.push(SpannedTok {
                    tok: Tok::Ellipsis,
                    start,
                    end: i,
                });
            }
            '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | ',' | '=' | '*' | ':' => {
                i += 1;
                toks.push(SpannedTok {
                    tok: Tok::Punct(c),
                    start,
                    end: i,
                });
            }
            _ if is_word_char(c) => {
                while i < bytes.len() && is_word_char(bytes[i] as char) {
                    i += 1;
                }
                toks.push(SpannedTok {
                    tok: Tok::Word(line[start..i].to_owned()),
                    start,
                    end: i,
                });
            }
            _ => {
                i += 1;
            }
        }
    }

    toks
}

struct Cursor<'a> {
    line: &'a str,
    toks: &'a [SpannedTok],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, toks: &'a [SpannedTok]) -> Self {
        Self { line, toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<&Tok> {
        let tok = self.toks.get(self.pos).map(|t| &t.tok);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Word(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    /// Source text spanned by tokens `[from, to)`.
    fn text_between(&self, from: usize, to: usize) -> &'a str {
        if from >= self.toks.len() || from >= to {
            return "";
        }
        let start = self.toks[from].start;
        let end = self.toks[to.min(self.toks.len()) - 1].end;
        &self.line[start..end]
    }

    /// Skip a balanced region opened by the punct at the cursor.
    fn skip_balanced(&mut self) {
        let Some(Tok::Punct(open)) = self.peek().cloned() else {
            return;
        };
        let close = match open {
            '(' => ')',
            '[' => ']',
            '{' => '}',
            '<' => '>',
            _ => return,
        };
        self.pos += 1;
        let mut depth = 1;
        while let Some(tok) = self.next() {
            match tok {
                Tok::Punct(c) if *c == open => depth += 1,
                Tok::Punct(c) if *c == close => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

const CONSTEXPR_OPS: &[&str] = &[
    "bitcast",
    "getelementptr",
    "ptrtoint",
    "inttoptr",
    "addrspacecast",
    "trunc",
    "zext",
    "sext",
    "icmp",
    "add",
    "sub",
    "mul",
    "select",
    "blockaddress",
    "dso_local_equivalent",
];

const SIMPLE_CONSTANTS: &[&str] = &["null", "undef", "poison", "none", "true", "false", "zeroinitializer"];

const PARAM_ATTRS: &[&str] = &[
    "noundef",
    "nonnull",
    "signext",
    "zeroext",
    "inreg",
    "noalias",
    "nocapture",
    "readonly",
    "readnone",
    "writeonly",
    "returned",
    "swiftself",
    "swifterror",
    "immarg",
    "nest",
    "nofree",
    "dead_on_unwind",
    "writable",
    "captures",
];

const CALL_MODIFIERS: &[&str] = &[
    "tail",
    "musttail",
    "notail",
    "fast",
    "nnan",
    "ninf",
    "nsz",
    "arcp",
    "contract",
    "afn",
    "reassoc",
    "ccc",
    "fastcc",
    "coldcc",
    "x86_stdcallcc",
    "x86_thiscallcc",
    "arm_aapcscc",
    "arm_aapcs_vfpcc",
    "spir_func",
    "noundef",
    "nonnull",
    "signext",
    "zeroext",
    "inreg",
    "range",
    "addrspace",
];

fn parse_type(cursor: &mut Cursor) -> Option<Type> {
    let checkpoint = cursor.pos;
    let base = match cursor.peek().cloned() {
        Some(Tok::Word(word)) => {
            let ty = match word.as_str() {
                "void" => Some(Type::Void),
                "half" => Some(Type::Half),
                "bfloat" => Some(Type::BFloat),
                "float" => Some(Type::Float),
                "double" => Some(Type::Double),
                "x86_fp80" => Some(Type::X86Fp80),
                "fp128" | "ppc_fp128" => Some(Type::Fp128),
                "ptr" => Some(Type::Ptr),
                "label" => Some(Type::Label),
                "token" => Some(Type::Token),
                "metadata" => Some(Type::Metadata),
                "opaque" => Some(Type::Opaque("opaque".to_owned())),
                _ => {
                    if let Some(bits) = word.strip_prefix('i').and_then(|b| b.parse::<u32>().ok())
                    {
                        Some(Type::Int(bits))
                    } else {
                        None
                    }
                }
            };
            match ty {
                Some(ty) => {
                    cursor.pos += 1;
                    // `ptr addrspace(N)`
                    if ty == Type::Ptr && cursor.eat_word("addrspace") {
                        cursor.skip_balanced();
                    }
                    ty
                }
                None => return None,
            }
        }
        Some(Tok::Local(name)) => {
            cursor.pos += 1;
            Type::Named(name)
        }
        Some(Tok::Punct('[')) => {
            cursor.pos += 1;
            let count = match cursor.next() {
                Some(Tok::Word(w)) => w.parse::<u64>().ok()?,
                _ => return None,
            };
            if !cursor.eat_word("x") {
                cursor.pos = checkpoint;
                return None;
            }
            let elem = parse_type(cursor)?;
            if !cursor.eat_punct(']') {
                cursor.pos = checkpoint;
                return None;
            }
            Type::Array(count, Box::new(elem))
        }
        Some(Tok::Punct('<')) => {
            cursor.pos += 1;
            if cursor.eat_punct('{') {
                // packed struct <{ ... }>
                let mut fields = Vec::new();
                if !cursor.eat_punct('}') {
                    loop {
                        fields.push(parse_type(cursor)?);
                        if cursor.eat_punct('}') {
                            break;
                        }
                        if !cursor.eat_punct(',') {
                            cursor.pos = checkpoint;
                            return None;
                        }
                    }
                }
                if !cursor.eat_punct('>') {
                    cursor.pos = checkpoint;
                    return None;
                }
                Type::Struct {
                    packed: true,
                    fields,
                }
            } else {
                let vscale = cursor.eat_word("vscale");
                if vscale && !cursor.eat_word("x") {
                    cursor.pos = checkpoint;
                    return None;
                }
                let count = match cursor.next() {
                    Some(Tok::Word(w)) => w.parse::<u64>().ok()?,
                    _ => {
                        cursor.pos = checkpoint;
                        return None;
                    }
                };
                if !cursor.eat_word("x") {
                    cursor.pos = checkpoint;
                    return None;
                }
                let elem = parse_type(cursor)?;
                if !cursor.eat_punct('>') {
                    cursor.pos = checkpoint;
                    return None;
                }
                Type::Vector(count, Box::new(elem))
            }
        }
        Some(Tok::Punct('{')) => {
            cursor.pos += 1;
            let mut fields = Vec::new();
            if !cursor.eat_punct('}') {
                loop {
                    fields.push(parse_type(cursor)?);
                    if cursor.eat_punct('}') {
                        break;
                    }
                    if !cursor.eat_punct(',') {
                        cursor.pos = checkpoint;
                        return None;
                    }
                }
            }
            Type::Struct {
                packed: false,
                fields,
            }
        }
        _ => return None,
    };

    // Postfix: `*` pointers (typed-pointer IR) and function types.
    let mut ty = base;
    loop {
        if cursor.eat_punct('*') {
            ty = Type::Ptr;
            continue;
        }
        break;
    }
    Some(ty)
}

/// Parse one value operand. Aggregates and constant expressions are kept
/// as their original text.
fn parse_value(cursor: &mut Cursor) -> Option<ValueRef> {
    let start = cursor.pos;
    match cursor.peek().cloned() {
        Some(Tok::Local(name)) => {
            cursor.pos += 1;
            Some(ValueRef::Local(name))
        }
        Some(Tok::Global(name)) => {
            cursor.pos += 1;
            Some(ValueRef::Global(name))
        }
        Some(Tok::Word(word)) => {
            if SIMPLE_CONSTANTS.contains(&word.as_str())
                || word.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '-')
            {
                cursor.pos += 1;
                return Some(ValueRef::Const(word));
            }
            if word == "c" {
                cursor.pos += 1;
                if let Some(Tok::Str(_)) = cursor.peek() {
                    cursor.pos += 1;
                }
                return Some(ValueRef::Const(
                    cursor.text_between(start, cursor.pos).to_owned(),
                ));
            }
            if CONSTEXPR_OPS.contains(&word.as_str()) {
                cursor.pos += 1;
                // Optional qualifier words before the paren (e.g.
                // `getelementptr inbounds (...)`).
                while matches!(cursor.peek(), Some(Tok::Word(_))) {
                    cursor.pos += 1;
                }
                cursor.skip_balanced();
                // Cast expressions written infix: `... to <ty>` is inside
                // the parens, nothing more to do.
                return Some(ValueRef::Const(
                    cursor.text_between(start, cursor.pos).to_owned(),
                ));
            }
            if word == "asm" {
                // Inline-asm value: `asm [sideeffect] "tmpl", "constraints"`.
                cursor.pos += 1;
                while matches!(cursor.peek(), Some(Tok::Word(_)) | Some(Tok::Str(_)))
                    || cursor.peek() == Some(&Tok::Punct(','))
                {
                    cursor.pos += 1;
                }
                return Some(ValueRef::Const(
                    cursor.text_between(start, cursor.pos).to_owned(),
                ));
            }
            None
        }
        Some(Tok::Punct(open)) if matches!(open, '{' | '[' | '<') => {
            cursor.skip_balanced();
            Some(ValueRef::Const(
                cursor.text_between(start, cursor.pos).to_owned(),
            ))
        }
        Some(Tok::Str(_)) => {
            cursor.pos += 1;
            Some(ValueRef::Const(
                cursor.text_between(start, cursor.pos).to_owned(),
            ))
        }
        _ => None,
    }
}

/// Skip parameter attributes between a type and its value.
fn skip_param_attrs(cursor: &mut Cursor) {
    loop {
        match cursor.peek().cloned() {
            Some(Tok::Word(word)) if PARAM_ATTRS.contains(&word.as_str()) => {
                cursor.pos += 1;
                if cursor.peek() == Some(&Tok::Punct('(')) {
                    cursor.skip_balanced();
                }
            }
            Some(Tok::Word(word))
                if word == "align" || word == "dereferenceable" || word == "dereferenceable_or_null" =>
            {
                cursor.pos += 1;
                if cursor.peek() == Some(&Tok::Punct('(')) {
                    cursor.skip_balanced();
                } else if matches!(cursor.peek(), Some(Tok::Word(_))) {
                    cursor.pos += 1;
                }
            }
            Some(Tok::Word(word)) if word == "byval" || word == "sret" || word == "byref" || word == "preallocated" || word == "inalloca" || word == "elementtype" => {
                cursor.pos += 1;
                if cursor.peek() == Some(&Tok::Punct('(')) {
                    cursor.skip_balanced();
                }
            }
            _ => break,
        }
    }
}

fn collect_operand_tokens(toks: &[SpannedTok], skip_result: bool) -> Vec<ValueRef> {
    let mut operands = Vec::new();
    let mut after_label = false;
    let mut first_local = true;

    for (i, spanned) in toks.iter().enumerate() {
        match &spanned.tok {
            Tok::Word(w) if w == "label" => {
                after_label = true;
                continue;
            }
            Tok::Local(name) => {
                if skip_result
                    && first_local
                    && i == 0
                    && matches!(toks.get(1).map(|t| &t.tok), Some(Tok::Punct('=')))
                {
                    first_local = false;
                    continue;
                }
                first_local = false;
                if after_label {
                    after_label = false;
                    continue;
                }
                operands.push(ValueRef::Local(name.clone()));
            }
            Tok::Global(name) => {
                after_label = false;
                operands.push(ValueRef::Global(name.clone()));
            }
            _ => {
                after_label = false;
            }
        }
    }
    operands
}

fn parse_call(cursor: &mut Cursor, is_invoke: bool) -> Option<Op> {
    // Skip modifiers until the return type parses.
    let mut ret_ty = None;
    while !cursor.at_end() {
        let checkpoint = cursor.pos;
        match cursor.peek().cloned() {
            Some(Tok::Word(word)) if CALL_MODIFIERS.contains(&word.as_str()) => {
                cursor.pos += 1;
                if cursor.peek() == Some(&Tok::Punct('(')) {
                    cursor.skip_balanced();
                }
                continue;
            }
            _ => {}
        }
        if let Some(ty) = parse_type(cursor) {
            ret_ty = Some(ty);
            break;
        }
        cursor.pos = checkpoint;
        // Unknown modifier word; skip it.
        if matches!(cursor.peek(), Some(Tok::Word(_))) {
            cursor.pos += 1;
        } else {
            return None;
        }
    }
    let ret_ty = ret_ty?;

    // Optional explicit function signature: `ret-ty (params...) callee`.
    let mut varargs = false;
    if cursor.peek() == Some(&Tok::Punct('(')) {
        let checkpoint = cursor.pos;
        cursor.pos += 1;
        let mut ok = true;
        if !cursor.eat_punct(')') {
            loop {
                if cursor.peek() == Some(&Tok::Ellipsis) {
                    cursor.pos += 1;
                    varargs = true;
                } else if parse_type(cursor).is_none() {
                    ok = false;
                    break;
                }
                if cursor.eat_punct(')') {
                    break;
                }
                if !cursor.eat_punct(',') {
                    ok = false;
                    break;
                }
            }
        }
        let next_is_callee = matches!(
            cursor.peek(),
            Some(Tok::Global(_)) | Some(Tok::Local(_)) | Some(Tok::Word(_))
        );
        if !(ok && next_is_callee) {
            cursor.pos = checkpoint;
            varargs = false;
        }
    }

    // The callee.
    let callee = match cursor.peek().cloned() {
        Some(Tok::Global(name)) => {
            cursor.pos += 1;
            Callee::Direct(name)
        }
        Some(Tok::Local(name)) => {
            cursor.pos += 1;
            Callee::Indirect(ValueRef::Local(name))
        }
        Some(Tok::Word(word)) if word == "asm" => {
            // Skip the template/constraint strings up to the argument list.
            while !cursor.at_end() && cursor.peek() != Some(&Tok::Punct('(')) {
                cursor.pos += 1;
            }
            Callee::InlineAsm
        }
        _ => {
            let value = parse_value(cursor)?;
            match value.strip_constexpr_global() {
                Some(name) => Callee::Direct(name.to_owned()),
                None => Callee::Indirect(value),
            }
        }
    };

    // Arguments.
    let mut args = Vec::new();
    if cursor.eat_punct('(') && !cursor.eat_punct(')') {
        loop {
            if cursor.peek() == Some(&Tok::Ellipsis) {
                cursor.pos += 1;
            } else {
                let ty = parse_type(cursor)?;
                skip_param_attrs(cursor);
                if matches!(ty, Type::Metadata) {
                    // Metadata arguments (debug intrinsics) are opaque.
                    while !cursor.at_end()
                        && cursor.peek() != Some(&Tok::Punct(','))
                        && cursor.peek() != Some(&Tok::Punct(')'))
                    {
                        if matches!(cursor.peek(), Some(Tok::Punct('(' | '[' | '{' | '<'))) {
                            cursor.skip_balanced();
                        } else {
                            cursor.pos += 1;
                        }
                    }
                } else {
                    let value = parse_value(cursor)?;
                    args.push((ty, value));
                }
            }
            if cursor.eat_punct(')') {
                break;
            }
            if !cursor.eat_punct(',') {
                return None;
            }
        }
    }

    // Invoke destinations.
    let mut normal_dest = None;
    let mut unwind_dest = None;
    if is_invoke {
        while !cursor.at_end() {
            if cursor.eat_word("to") {
                if cursor.eat_word("label") {
                    if let Some(Tok::Local(name)) = cursor.peek().cloned() {
                        normal_dest = Some(name);
                        cursor.pos += 1;
                    }
                }
            } else if cursor.eat_word("unwind") {
                if cursor.eat_word("label") {
                    if let Some(Tok::Local(name)) = cursor.peek().cloned() {
                        unwind_dest = Some(name);
                        cursor.pos += 1;
                    }
                }
            } else {
                cursor.pos += 1;
            }
        }
    }

    let call = CallInst {
        callee,
        ret_ty,
        args,
        varargs,
        normal_dest,
        unwind_dest,
    };
    Some(if is_invoke {
        Op::Invoke(call)
    } else {
        Op::Call(call)
    })
}

fn parse_op(cursor: &mut Cursor) -> Option<Op> {
    let opcode = match cursor.peek().cloned() {
        Some(Tok::Word(word)) => word,
        _ => return None,
    };

    match opcode.as_str() {
        "call" | "tail" | "musttail" | "notail" => {
            // `tail call ...` and friends.
            if opcode != "call" {
                cursor.pos += 1;
                if !cursor.eat_word("call") {
                    return None;
                }
            } else {
                cursor.pos += 1;
            }
            parse_call(cursor, false)
        }
        "invoke" => {
            cursor.pos += 1;
            parse_call(cursor, true)
        }
        "load" => {
            cursor.pos += 1;
            while cursor.eat_word("atomic") || cursor.eat_word("volatile") {}
            let ty = parse_type(cursor)?;
            cursor.eat_punct(',');
            let _ptr_ty = parse_type(cursor)?;
            let ptr = parse_value(cursor)?;
            Some(Op::Load { ty, ptr })
        }
        "store" => {
            cursor.pos += 1;
            while cursor.eat_word("atomic") || cursor.eat_word("volatile") {}
            let ty = parse_type(cursor)?;
            skip_param_attrs(cursor);
            let value = parse_value(cursor)?;
            cursor.eat_punct(',');
            let _ptr_ty = parse_type(cursor)?;
            let ptr = parse_value(cursor)?;
            Some(Op::Store { ty, value, ptr })
        }
        "atomicrmw" => {
            cursor.pos += 1;
            cursor.eat_word("volatile");
            // The operation keyword (add/xchg/...).
            if matches!(cursor.peek(), Some(Tok::Word(_))) {
                cursor.pos += 1;
            }
            let _ptr_ty = parse_type(cursor)?;
            let ptr = parse_value(cursor)?;
            cursor.eat_punct(',');
            let ty = parse_type(cursor)?;
            let value = parse_value(cursor)?;
            Some(Op::AtomicRmw { ty, ptr, value })
        }
        "cmpxchg" => {
            cursor.pos += 1;
            cursor.eat_word("weak");
            cursor.eat_word("volatile");
            let _ptr_ty = parse_type(cursor)?;
            let ptr = parse_value(cursor)?;
            cursor.eat_punct(',');
            let ty = parse_type(cursor)?;
            let expected = parse_value(cursor)?;
            cursor.eat_punct(',');
            let _new_ty = parse_type(cursor)?;
            let replacement = parse_value(cursor)?;
            Some(Op::CmpXchg {
                ty,
                ptr,
                expected,
                replacement,
            })
        }
        "ret" => {
            cursor.pos += 1;
            if cursor.eat_word("void") {
                return Some(Op::Ret {
                    ty: None,
                    value: None,
                });
            }
            let ty = parse_type(cursor)?;
            let value = parse_value(cursor)?;
            Some(Op::Ret {
                ty: Some(ty),
                value: Some(value),
            })
        }
        "br" => {
            cursor.pos += 1;
            if cursor.eat_word("label") {
                return Some(Op::Br { cond: None });
            }
            let _ty = parse_type(cursor)?;
            let cond = parse_value(cursor)?;
            Some(Op::Br { cond: Some(cond) })
        }
        "switch" => {
            cursor.pos += 1;
            let _ty = parse_type(cursor)?;
            let cond = parse_value(cursor)?;
            Some(Op::Switch { cond })
        }
        "unreachable" => {
            cursor.pos += 1;
            Some(Op::Unreachable)
        }
        "alloca" => {
            cursor.pos += 1;
            while cursor.eat_word("inalloca") || cursor.eat_word("swifterror") {}
            let ty = parse_type(cursor)?;
            Some(Op::Alloca { ty })
        }
        "bitcast" | "addrspacecast" | "ptrtoint" | "inttoptr" | "trunc" | "zext" | "sext"
        | "fpext" | "fptrunc" | "fptoui" | "fptosi" | "uitofp" | "sitofp" => {
            cursor.pos += 1;
            let kind = match opcode.as_str() {
                "bitcast" => CastKind::Bitcast,
                "addrspacecast" => CastKind::AddrSpaceCast,
                "ptrtoint" => CastKind::PtrToInt,
                "inttoptr" => CastKind::IntToPtr,
                "trunc" => CastKind::Trunc,
                "zext" => CastKind::ZExt,
                "sext" => CastKind::SExt,
                "fpext" => CastKind::FpExt,
                "fptrunc" => CastKind::FpTrunc,
                _ => CastKind::Other,
            };
            let _from = parse_type(cursor)?;
            let value = parse_value(cursor)?;
            if !cursor.eat_word("to") {
                return None;
            }
            let to = parse_type(cursor)?;
            Some(Op::Cast { kind, value, to })
        }
        "getelementptr" => {
            cursor.pos += 1;
            while cursor.eat_word("inbounds") || cursor.eat_word("nusw") || cursor.eat_word("nuw") {
                if cursor.peek() == Some(&Tok::Punct('(')) {
                    cursor.skip_balanced();
                }
            }
            if cursor.eat_word("inrange") {
                cursor.skip_balanced();
            }
            let base_ty = parse_type(cursor)?;
            cursor.eat_punct(',');
            let _ptr_ty = parse_type(cursor)?;
            let ptr = parse_value(cursor)?;
            let mut indices = Vec::new();
            while cursor.eat_punct(',') {
                let Some(_idx_ty) = parse_type(cursor) else {
                    break;
                };
                let Some(index) = parse_value(cursor) else {
                    break;
                };
                indices.push(index);
            }
            Some(Op::Gep {
                base_ty,
                ptr,
                indices,
            })
        }
        "phi" => {
            cursor.pos += 1;
            // Fast-math flags may precede the type.
            while matches!(cursor.peek(), Some(Tok::Word(w)) if CALL_MODIFIERS.contains(&w.as_str()))
            {
                cursor.pos += 1;
            }
            let ty = parse_type(cursor)?;
            let mut incoming = Vec::new();
            loop {
                if !cursor.eat_punct('[') {
                    break;
                }
                let value = parse_value(cursor)?;
                cursor.eat_punct(',');
                let label = match cursor.next() {
                    Some(Tok::Local(name)) => name.clone(),
                    _ => return None,
                };
                if !cursor.eat_punct(']') {
                    return None;
                }
                incoming.push((value, label));
                if !cursor.eat_punct(',') {
                    break;
                }
            }
            Some(Op::Phi { ty, incoming })
        }
        "select" => {
            cursor.pos += 1;
            while matches!(cursor.peek(), Some(Tok::Word(w)) if CALL_MODIFIERS.contains(&w.as_str()))
            {
                cursor.pos += 1;
            }
            let _cond_ty = parse_type(cursor)?;
            let cond = parse_value(cursor)?;
            cursor.eat_punct(',');
            let ty = parse_type(cursor)?;
            let if_true = parse_value(cursor)?;
            cursor.eat_punct(',');
            let _ty2 = parse_type(cursor)?;
            let if_false = parse_value(cursor)?;
            Some(Op::Select {
                ty,
                cond,
                if_true,
                if_false,
            })
        }
        "icmp" | "fcmp" => {
            cursor.pos += 1;
            // Fast-math flags (fcmp only), then the predicate keyword.
            while matches!(cursor.peek(), Some(Tok::Word(w)) if CALL_MODIFIERS.contains(&w.as_str()))
            {
                cursor.pos += 1;
            }
            if matches!(cursor.peek(), Some(Tok::Word(_))) {
                cursor.pos += 1;
            }
            let _ty = parse_type(cursor)?;
            let lhs = parse_value(cursor)?;
            cursor.eat_punct(',');
            let rhs = parse_value(cursor)?;
            Some(Op::ICmp { lhs, rhs })
        }
        _ => None,
    }
}

/// Extract a trailing `!dbg !N` reference.
fn extract_dbg(toks: &[SpannedTok]) -> Option<u64> {
    for window in toks.windows(2) {
        if let (Tok::Meta(kind), Tok::Meta(id)) = (&window[0].tok, &window[1].tok) {
            if kind == "dbg" {
                return id.parse().ok();
            }
        }
    }
    None
}

/// Parse one body line into an instruction. Never fails: unmodelled lines
/// become `Op::Other` with their operands extracted.
pub(crate) fn parse_instruction(line: &str) -> Inst {
    let trimmed = line.trim();
    let toks = tokenize(trimmed);
    let dbg = extract_dbg(&toks);

    let mut cursor = Cursor::new(trimmed, &toks);
    let mut result = None;
    if let Some(Tok::Local(name)) = cursor.peek().cloned() {
        if matches!(toks.get(1).map(|t| &t.tok), Some(Tok::Punct('='))) {
            result = Some(name);
            cursor.pos += 2;
        }
    }

    let op = parse_op(&mut cursor).unwrap_or_else(|| Op::Other {
        operands: collect_operand_tokens(&toks, true),
    });

    Inst {
        text: trimmed.to_owned(),
        result,
        op,
        dbg,
    }
}

const LINKAGE_WORDS: &[(&str, Linkage)] = &[
    ("private", Linkage::Private),
    ("internal", Linkage::Internal),
    ("available_externally", Linkage::AvailableExternally),
    ("linkonce", Linkage::LinkOnce),
    ("linkonce_odr", Linkage::LinkOnceOdr),
    ("weak", Linkage::Weak),
    ("weak_odr", Linkage::WeakOdr),
    ("common", Linkage::Common),
    ("appending", Linkage::Appending),
    ("extern_weak", Linkage::ExternWeak),
];

/// Parse a `define` header line (without its body).
fn parse_function_header(line: &str) -> Option<Function> {
    let toks = tokenize(line);
    let mut cursor = Cursor::new(line, &toks);
    if !cursor.eat_word("define") {
        return None;
    }

    let mut linkage = Linkage::External;
    let mut ret_ty = None;
    while !cursor.at_end() {
        let checkpoint = cursor.pos;
        if let Some(Tok::Word(word)) = cursor.peek().cloned() {
            if let Some((_, found)) = LINKAGE_WORDS.iter().find(|(w, _)| *w == word) {
                linkage = *found;
                cursor.pos += 1;
                continue;
            }
        }
        if let Some(ty) = parse_type(&mut cursor) {
            // Guard against attribute words parsing as nothing; a type
            // must be followed eventually by the function name.
            ret_ty = Some(ty);
            break;
        }
        cursor.pos = checkpoint;
        match cursor.peek() {
            Some(Tok::Word(_)) => cursor.pos += 1,
            _ => return None,
        }
    }
    let ret_ty = ret_ty?;

    let name = loop {
        match cursor.next() {
            Some(Tok::Global(name)) => break name.clone(),
            Some(Tok::Word(_)) | Some(Tok::Punct('(')) => continue,
            _ => return None,
        }
    };

    // Skip the parameter list.
    if cursor.peek() == Some(&Tok::Punct('(')) {
        cursor.skip_balanced();
    }

    // Everything after the parameter list up to `{` is attributes,
    // metadata, section info, etc.
    let mut attrs = Vec::new();
    let mut subprogram = None;
    let mut last_meta_kind: Option<String> = None;
    while let Some(tok) = cursor.next() {
        match tok {
            Tok::Word(word) => attrs.push(word.clone()),
            Tok::AttrRef(id) => attrs.push(format!("#{id}")),
            Tok::Str(text) => attrs.push(format!("\"{text}\"")),
            Tok::Meta(kind) => {
                if let Ok(id) = kind.parse::<u64>() {
                    if last_meta_kind.as_deref() == Some("dbg") {
                        subprogram = Some(id);
                    }
                } else {
                    last_meta_kind = Some(kind.clone());
                    continue;
                }
                last_meta_kind = None;
            }
            _ => {}
        }
    }

    Some(Function {
        header: line.to_owned(),
        name,
        linkage,
        ret_ty,
        attrs,
        subprogram,
        blocks: Vec::new(),
    })
}

fn is_label_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let Some(colon) = line.find(':') else {
        return false;
    };
    let label = &line[..colon];
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '-' | '"'))
}

/// Extract the symbol a top-level line defines or declares, if any.
fn top_level_symbol(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("declare ") {
        let toks = tokenize(rest);
        for spanned in &toks {
            if let Tok::Global(name) = &spanned.tok {
                return Some(name.clone());
            }
        }
        return None;
    }
    if line.starts_with('@') {
        let toks = tokenize(line);
        if let Some(SpannedTok {
            tok: Tok::Global(name),
            ..
        }) = toks.first()
        {
            return Some(name.clone());
        }
    }
    None
}

fn parse_attribute_group(line: &str) -> Option<(u64, Vec<String>)> {
    let rest = line.strip_prefix("attributes #")?;
    let (id, rest) = rest.split_once('=')?;
    let id: u64 = id.trim().parse().ok()?;
    let body = rest.trim().strip_prefix('{')?.strip_suffix('}')?;

    let toks = tokenize(body);
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < toks.len() {
        match &toks[i].tok {
            Tok::Word(word) => {
                // `"key"="value"` pairs arrive as Str tokens; words are
                // plain enum attributes.
                tokens.push(word.clone());
            }
            Tok::Str(text) => {
                tokens.push(format!("\"{text}\""));
                // Skip `="value"` if present.
                if matches!(toks.get(i + 1).map(|t| &t.tok), Some(Tok::Punct('='))) {
                    i += 2;
                }
            }
            _ => {}
        }
        i += 1;
    }
    Some((id, tokens))
}

fn extract_quoted(line: &str) -> Option<String> {
    let start = line.find('"')? + 1;
    let end = line[start..].find('"')? + start;
    Some(line[start..end].to_owned())
}

/// Parse a whole textual IR module.
pub fn parse_module(source: &str) -> Result<Module, IrError> {
    let mut module = Module::new();
    let mut lines = source.lines().enumerate().peekable();

    while let Some((lineno, line)) = lines.next() {
        let trimmed = line.trim_end();

        if trimmed.starts_with("define") && trimmed.ends_with('{') {
            let header = trimmed.trim_end_matches('{').trim_end();
            let mut function = parse_function_header(header).ok_or_else(|| IrError::Parse {
                line: lineno + 1,
                message: format!("unparsable function header: {header}"),
            })?;
            function.header = trimmed.to_owned();
            module.record_symbol(&function.name.clone());

            let mut blocks: Vec<Block> = Vec::new();
            let mut current = Block {
                label_line: None,
                insts: Vec::new(),
            };
            let mut closed = false;

            for (_, body_line) in lines.by_ref() {
                let body_trimmed = body_line.trim_end();
                if body_trimmed == "}" {
                    closed = true;
                    break;
                }
                if body_trimmed.is_empty() {
                    // Blank separator before a label; keep it with the
                    // label line for faithful output.
                    current.insts.push(Inst {
                        text: String::new(),
                        result: None,
                        op: Op::Other {
                            operands: Vec::new(),
                        },
                        dbg: None,
                    });
                    continue;
                }
                if is_label_line(body_trimmed) {
                    blocks.push(current);
                    current = Block {
                        label_line: Some(body_trimmed.to_owned()),
                        insts: Vec::new(),
                    };
                    continue;
                }
                current.insts.push(parse_instruction(body_line));
            }

            if !closed {
                return Err(IrError::UnterminatedFunction(lineno + 1));
            }
            blocks.push(current);
            function.blocks = blocks;
            module.items.push(Item::Function(function));
            continue;
        }

        // Top-level non-function lines.
        if let Some(spec) = trimmed.strip_prefix("target datalayout") {
            if let Some(datalayout) = extract_quoted(spec) {
                module.datalayout = super::types::DataLayout::parse(&datalayout);
            }
        } else if let Some(spec) = trimmed.strip_prefix("target triple") {
            module.triple = extract_quoted(spec);
        } else if trimmed.starts_with('%') && trimmed.contains("= type") {
            let (name_part, body_part) = trimmed.split_once("= type").unwrap();
            let name = name_part.trim().trim_start_matches('%').to_owned();
            let body_toks = tokenize(body_part.trim());
            let mut cursor = Cursor::new(body_part.trim(), &body_toks);
            if let Some(ty) = parse_type(&mut cursor) {
                module.types.define(name, ty);
            }
        } else if let Some((id, node)) = parse_metadata_line(trimmed) {
            module.debug.insert(id, node);
        } else if let Some((id, tokens)) = parse_attribute_group(trimmed) {
            module.attr_groups.insert(id, tokens);
        } else if let Some(symbol) = top_level_symbol(trimmed) {
            module.record_symbol(&symbol);
        }

        module.items.push(Item::Verbatim(trimmed.to_owned()));
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_MODULE: &str = r#"; ModuleID = 'demo.c'
source_filename = "demo.c"
target datalayout = "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
target triple = "x86_64-unknown-linux-gnu"

@.str = private unnamed_addr constant [3 x i8] c"hi\00", align 1

; Function Attrs: noinline nounwind optnone uwtable
define dso_local i32 @main() #0 !dbg !10 {
  %1 = alloca i32, align 4
  %2 = alloca ptr, align 8
  store i32 0, ptr %1, align 4
  %3 = call noalias ptr @malloc(i64 noundef 8) #3, !dbg !14
  store ptr %3, ptr %2, align 8, !dbg !15
  %4 = load ptr, ptr %2, align 8, !dbg !16
  call void @free(ptr noundef %4) #4, !dbg !17
  ret i32 0, !dbg !18
}

declare noalias ptr @malloc(i64 noundef) #1

declare void @free(ptr noundef) #2

attributes #0 = { noinline nounwind optnone uwtable "frame-pointer"="all" "no-trapping-math"="true" }
attributes #1 = { nounwind allocsize(0) }

!10 = distinct !DISubprogram(name: "main", scope: !1, file: !1, line: 4, unit: !0)
!1 = !DIFile(filename: "demo.c", directory: "/tmp")
!14 = !DILocation(line: 5, column: 13, scope: !10)
!15 = !DILocation(line: 5, column: 11, scope: !10)
!16 = !DILocation(line: 6, column: 8, scope: !10)
!17 = !DILocation(line: 6, column: 3, scope: !10)
!18 = !DILocation(line: 7, column: 3, scope: !10)
"#;

    #[test]
    fn parses_module_structure() {
        let module = parse_module(SMALL_MODULE).unwrap();
        let functions: Vec<_> = module.functions().collect();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name, "main");
        assert_eq!(functions[0].ret_ty, Type::Int(32));
        assert_eq!(functions[0].subprogram, Some(10));
        assert!(module.has_symbol("malloc"));
        assert!(module.has_symbol("free"));
        assert!(module.has_symbol(".str"));
        assert_eq!(module.datalayout.pointer_size, 8);
    }

    #[test]
    fn parses_call_instruction() {
        let module = parse_module(SMALL_MODULE).unwrap();
        let main = module.functions().next().unwrap();
        let calls: Vec<_> = main
            .insts()
            .filter_map(|inst| inst.as_call().map(|c| (inst, c)))
            .collect();
        assert_eq!(calls.len(), 2);

        let (inst, call) = &calls[0];
        assert_eq!(call.callee, Callee::Direct("malloc".to_owned()));
        assert_eq!(inst.result.as_deref(), Some("3"));
        assert_eq!(inst.dbg, Some(14));
        assert_eq!(call.args.len(), 1);
        assert_eq!(call.args[0].0, Type::Int(64));
        assert_eq!(call.args[0].1, ValueRef::Const("8".to_owned()));

        let (_, free_call) = &calls[1];
        assert_eq!(free_call.callee, Callee::Direct("free".to_owned()));
        assert_eq!(free_call.args[0].1, ValueRef::Local("4".to_owned()));
    }

    #[test]
    fn parses_memory_instructions() {
        let inst = parse_instruction("  store ptr %3, ptr %2, align 8, !dbg !15");
        match &inst.op {
            Op::Store { ty, value, ptr } => {
                assert_eq!(*ty, Type::Ptr);
                assert_eq!(*value, ValueRef::Local("3".to_owned()));
                assert_eq!(*ptr, ValueRef::Local("2".to_owned()));
            }
            other => panic!("expected store, got {other:?}"),
        }
        assert_eq!(inst.dbg, Some(15));

        let inst = parse_instruction("  %4 = load i32, ptr %2, align 4");
        match &inst.op {
            Op::Load { ty, ptr } => {
                assert_eq!(*ty, Type::Int(32));
                assert_eq!(*ptr, ValueRef::Local("2".to_owned()));
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn parses_varargs_call_signature() {
        let inst = parse_instruction(
            "  %5 = call i32 (ptr, ...) @printf(ptr noundef @.str, i32 noundef %4)",
        );
        let call = inst.as_call().unwrap();
        assert!(call.varargs);
        assert_eq!(call.callee, Callee::Direct("printf".to_owned()));
        assert_eq!(call.args.len(), 2);
    }

    #[test]
    fn parses_indirect_call() {
        let inst = parse_instruction("  call void %12(ptr noundef %10)");
        let call = inst.as_call().unwrap();
        assert_eq!(call.callee, Callee::Indirect(ValueRef::Local("12".to_owned())));
    }

    #[test]
    fn parses_invoke_with_destinations() {
        let inst = parse_instruction(
            "  %6 = invoke noalias ptr @_Znwm(i64 noundef 4) to label %7 unwind label %9, !dbg !20",
        );
        assert!(inst.is_invoke());
        let call = inst.as_call().unwrap();
        assert_eq!(call.callee, Callee::Direct("_Znwm".to_owned()));
        assert_eq!(call.normal_dest.as_deref(), Some("7"));
        assert_eq!(call.unwind_dest.as_deref(), Some("9"));
    }

    #[test]
    fn parses_gep_and_casts() {
        let inst =
            parse_instruction("  %7 = getelementptr inbounds i8, ptr %6, i64 4, !dbg !22");
        match &inst.op {
            Op::Gep { ptr, indices, .. } => {
                assert_eq!(*ptr, ValueRef::Local("6".to_owned()));
                assert_eq!(indices.len(), 1);
            }
            other => panic!("expected gep, got {other:?}"),
        }

        let inst = parse_instruction("  %8 = ptrtoint ptr %7 to i64");
        match &inst.op {
            Op::Cast { kind, value, to } => {
                assert_eq!(*kind, CastKind::PtrToInt);
                assert_eq!(*value, ValueRef::Local("7".to_owned()));
                assert_eq!(*to, Type::Int(64));
            }
            other => panic!("expected cast, got {other:?}"),
        }
    }

    #[test]
    fn parses_phi_and_select() {
        let inst = parse_instruction("  %x = phi ptr [ %a, %bb1 ], [ null, %bb2 ]");
        match &inst.op {
            Op::Phi { incoming, .. } => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(incoming[0].0, ValueRef::Local("a".to_owned()));
                assert_eq!(incoming[0].1, "bb1");
                assert_eq!(incoming[1].0, ValueRef::Const("null".to_owned()));
            }
            other => panic!("expected phi, got {other:?}"),
        }

        let inst = parse_instruction("  %y = select i1 %c, ptr %a, ptr %b");
        match &inst.op {
            Op::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                assert_eq!(*cond, ValueRef::Local("c".to_owned()));
                assert_eq!(*if_true, ValueRef::Local("a".to_owned()));
                assert_eq!(*if_false, ValueRef::Local("b".to_owned()));
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn parses_ret_variants() {
        let inst = parse_instruction("  ret void");
        assert!(matches!(inst.op, Op::Ret { value: None, .. }));

        let inst = parse_instruction("  ret ptr %8, !dbg !30");
        match &inst.op {
            Op::Ret {
                ty: Some(ty),
                value: Some(value),
            } => {
                assert_eq!(*ty, Type::Ptr);
                assert_eq!(*value, ValueRef::Local("8".to_owned()));
            }
            other => panic!("expected ret, got {other:?}"),
        }
    }

    #[test]
    fn unmodelled_instructions_keep_operands() {
        let inst = parse_instruction("  %9 = add nsw i32 %7, %8");
        match &inst.op {
            Op::Other { operands } => {
                assert_eq!(operands.len(), 2);
                assert!(operands.contains(&ValueRef::Local("7".to_owned())));
                assert!(operands.contains(&ValueRef::Local("8".to_owned())));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
        assert_eq!(inst.result.as_deref(), Some("9"));
    }

    #[test]
    fn label_lines_split_blocks() {
        let src = "define void @f() {\n  br label %next\n\nnext:                ; preds = %0\n  ret void\n}\n";
        let module = parse_module(src).unwrap();
        let func = module.functions().next().unwrap();
        assert_eq!(func.blocks.len(), 2);
        assert!(func.blocks[1]
            .label_line
            .as_deref()
            .unwrap()
            .starts_with("next:"));
    }

    #[test]
    fn attribute_groups_are_indexed() {
        let module = parse_module(SMALL_MODULE).unwrap();
        let group = module.attr_groups.get(&0).unwrap();
        assert!(group.iter().any(|t| t == "noinline"));
        assert!(group.iter().any(|t| t == "optnone"));
        assert!(group.iter().any(|t| t == "\"frame-pointer\""));
    }

    #[test]
    fn function_attr_query_expands_groups() {
        let module = parse_module(SMALL_MODULE).unwrap();
        let main = module.functions().next().unwrap();
        assert!(module.function_has_attr(main, "optnone"));
        assert!(!module.function_has_attr(main, "naked"));
    }

    #[test]
    fn quoted_symbols_tokenize() {
        let inst = parse_instruction("  %1 = call ptr @\"\\01_Znwm\"(i64 8)");
        let call = inst.as_call().unwrap();
        assert!(matches!(call.callee, Callee::Direct(ref name) if name.contains("_Znwm")));
    }
}
