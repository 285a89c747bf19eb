//! Shared pass machinery: site-string interning and the "should this
//! function be instrumented" predicate.

use rustc_hash::FxHashMap;

use crate::ir::{DebugInfo, Function, Module};

/// Format an instruction's debug location as `basename:line:col`. Missing
/// components are dropped; no location at all yields `<unknown>`.
pub fn format_site(debug: &DebugInfo, dbg: Option<u64>) -> String {
    let Some(dbg) = dbg else {
        return "<unknown>".to_owned();
    };
    let Some(location) = debug.location(dbg) else {
        return "<unknown>".to_owned();
    };

    let base = location
        .filename
        .rsplit('/')
        .next()
        .unwrap_or(location.filename.as_str());
    let mut site = if base.is_empty() {
        "<unknown>".to_owned()
    } else {
        base.to_owned()
    };
    if location.line > 0 {
        site.push_str(&format!(":{}", location.line));
    }
    if location.column > 0 {
        site.push_str(&format!(":{}", location.column));
    }
    site
}

/// Interns one site-string global per distinct debug location, plus a
/// shared `<unknown>` constant created lazily. Returned values are operand
/// references (`@.ct.site.N`).
#[derive(Default)]
pub struct SiteInterner {
    by_location: FxHashMap<u64, String>,
    unknown: Option<String>,
}

impl SiteInterner {
    /// The `ptr` operand text for an instruction's site.
    pub fn site_operand(&mut self, module: &mut Module, dbg: Option<u64>) -> String {
        match dbg {
            Some(id) => {
                if let Some(name) = self.by_location.get(&id) {
                    return format!("@{name}");
                }
                let text = format_site(&module.debug, dbg);
                let name = module.add_string_constant(".ct.site", &text);
                self.by_location.insert(id, name.clone());
                format!("@{name}")
            }
            None => {
                if let Some(name) = &self.unknown {
                    return format!("@{name}");
                }
                let name = module.add_string_constant(".ct.site", "<unknown>");
                self.unknown = Some(name.clone());
                format!("@{name}")
            }
        }
    }
}

/// Collects instructions to insert ahead of existing positions and applies
/// them in one sweep, back to front, so recorded indices stay valid.
#[derive(Default)]
pub(crate) struct Inserter {
    pending: Vec<(usize, usize, crate::ir::Inst)>,
}

impl Inserter {
    pub fn before(&mut self, block: usize, index: usize, text: String) {
        self.pending.push((block, index, crate::ir::parse_instruction(&text)));
    }

    pub fn apply(self, func: &mut Function) {
        // Group same-position inserts in emission order, then splice the
        // positions back to front so earlier indices stay valid.
        let mut groups: FxHashMap<(usize, usize), Vec<crate::ir::Inst>> = FxHashMap::default();
        for (block, index, inst) in self.pending {
            groups.entry((block, index)).or_default().push(inst);
        }
        let mut positions: Vec<(usize, usize)> = groups.keys().copied().collect();
        positions.sort_by(|a, b| b.cmp(a));
        for position in positions {
            let insts = groups.remove(&position).unwrap();
            let target = &mut func.blocks[position.0].insts;
            for (offset, inst) in insts.into_iter().enumerate() {
                target.insert(position.1 + offset, inst);
            }
        }
    }
}

fn is_system_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if path.contains("c++/v1") || path.contains("/lib/clang/") {
        return true;
    }
    path.starts_with("/Library/Developer/CommandLineTools")
        || path.starts_with("/Applications/Xcode.app")
        || path.starts_with("/usr/include")
        || path.starts_with("/usr/local/include")
}

/// The candidate filter: runtime functions, naked/no-instrument functions,
/// interposable linkage and system-header code are all left alone.
pub fn should_instrument(module: &Module, func: &Function) -> bool {
    if func.name.starts_with("__ct_") {
        return false;
    }
    if module.function_has_attr(func, "no_instrument_function")
        || module.function_has_attr(func, "naked")
    {
        return false;
    }
    if func.linkage.is_interposable() {
        return false;
    }

    if let Some(subprogram) = func.subprogram {
        if let Some((dir, file)) = module.debug.subprogram_path(subprogram) {
            if !dir.is_empty() && !file.is_empty() {
                let full = if file.starts_with('/') {
                    file.clone()
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), file)
                };
                if is_system_path(&full) {
                    return false;
                }
            } else if !file.is_empty() && is_system_path(&file) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    fn module_with(source: &str) -> Module {
        parse_module(source).unwrap()
    }

    #[test]
    fn site_formatting_uses_basename() {
        let module = module_with(
            "!1 = !DIFile(filename: \"/home/u/src/demo.c\", directory: \"/home/u\")\n!4 = distinct !DISubprogram(name: \"f\", file: !1, scope: !1)\n!9 = !DILocation(line: 12, column: 7, scope: !4)\n",
        );
        assert_eq!(format_site(&module.debug, Some(9)), "demo.c:12:7");
        assert_eq!(format_site(&module.debug, None), "<unknown>");
        assert_eq!(format_site(&module.debug, Some(77)), "<unknown>");
    }

    #[test]
    fn interner_caches_per_location() {
        let mut module = module_with(
            "!1 = !DIFile(filename: \"a.c\", directory: \"/t\")\n!4 = distinct !DISubprogram(name: \"f\", file: !1, scope: !1)\n!9 = !DILocation(line: 1, column: 2, scope: !4)\n",
        );
        let mut interner = SiteInterner::default();
        let a = interner.site_operand(&mut module, Some(9));
        let b = interner.site_operand(&mut module, Some(9));
        assert_eq!(a, b);
        let unknown_a = interner.site_operand(&mut module, None);
        let unknown_b = interner.site_operand(&mut module, None);
        assert_eq!(unknown_a, unknown_b);
        assert_ne!(a, unknown_a);
    }

    #[test]
    fn runtime_and_interposable_functions_are_skipped() {
        let module = module_with(
            "define void @__ct_helper() {\n  ret void\n}\ndefine linkonce_odr void @inline_thing() {\n  ret void\n}\ndefine void @user_code() {\n  ret void\n}\n",
        );
        let functions: Vec<_> = module.functions().collect();
        assert!(!should_instrument(&module, functions[0]));
        assert!(!should_instrument(&module, functions[1]));
        assert!(should_instrument(&module, functions[2]));
    }

    #[test]
    fn system_header_functions_are_skipped() {
        let module = module_with(
            "define void @sys_fn() !dbg !4 {\n  ret void\n}\n!1 = !DIFile(filename: \"string.h\", directory: \"/usr/include\")\n!4 = distinct !DISubprogram(name: \"sys_fn\", file: !1, scope: !1)\n",
        );
        let func = module.functions().next().unwrap();
        assert!(!should_instrument(&module, func));
    }

    #[test]
    fn naked_attribute_is_skipped() {
        let module = module_with(
            "define void @asm_stub() #0 {\n  ret void\n}\nattributes #0 = { naked nounwind }\n",
        );
        let func = module.functions().next().unwrap();
        assert!(!should_instrument(&module, func));
    }
}
