//! Module printer.
//!
//! Verbatim items and untouched instruction text round-trip unchanged;
//! synthesized globals and declarations are appended at the end, where
//! LLVM accepts top-level entities in any order.

use super::{Item, Module};

impl Module {
    /// Render the module back to textual IR.
    pub fn print(&self) -> String {
        let mut out = String::new();

        for item in &self.items {
            match item {
                Item::Verbatim(line) => {
                    out.push_str(line);
                    out.push('\n');
                }
                Item::Function(func) => {
                    out.push_str(&func.header);
                    out.push('\n');
                    for block in &func.blocks {
                        if let Some(label) = &block.label_line {
                            out.push_str(label);
                            out.push('\n');
                        }
                        for inst in &block.insts {
                            if inst.text.is_empty() {
                                out.push('\n');
                            } else {
                                out.push_str("  ");
                                out.push_str(&inst.text);
                                out.push('\n');
                            }
                        }
                    }
                    out.push_str("}\n");
                }
            }
        }

        if !self.synthesized_lines().is_empty() {
            out.push('\n');
            for line in self.synthesized_lines() {
                out.push_str(line);
                out.push('\n');
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::parse_module;

    const ROUND_TRIP: &str = r#"; ModuleID = 'demo.c'
target triple = "x86_64-unknown-linux-gnu"

@g = global i32 0, align 4

define dso_local i32 @twice(i32 noundef %0) #0 {
  %2 = alloca i32, align 4
  store i32 %0, ptr %2, align 4
  %3 = load i32, ptr %2, align 4
  %4 = add nsw i32 %3, %3
  ret i32 %4
}

attributes #0 = { noinline nounwind }
"#;

    #[test]
    fn untouched_module_round_trips() {
        let module = parse_module(ROUND_TRIP).unwrap();
        assert_eq!(module.print(), ROUND_TRIP);
    }

    #[test]
    fn synthesized_lines_append_at_end() {
        let mut module = parse_module(ROUND_TRIP).unwrap();
        module.ensure_declared("__ct_trace_enter", "void @__ct_trace_enter(ptr)");
        let printed = module.print();
        assert!(printed.ends_with("declare void @__ct_trace_enter(ptr)\n"));
        assert!(printed.starts_with("; ModuleID"));
    }

    #[test]
    fn label_blocks_round_trip() {
        let src = "define void @f(i1 %c) {\n  br i1 %c, label %a, label %b\n\na:                                                ; preds = %0\n  ret void\n\nb:                                                ; preds = %0\n  ret void\n}\n";
        let module = parse_module(src).unwrap();
        assert_eq!(module.print(), src);
    }
}
