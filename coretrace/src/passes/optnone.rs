//! `--ct-optnone`: pin user functions at `optnone noinline` so later
//! optimization cannot fold away instrumented patterns. Runs before the
//! other passes when requested.

use std::convert::Infallible;

use crate::ir::Module;
use crate::logger::Logger;
use crate::passes::common::should_instrument;
use crate::passes::Pass;

pub struct OptNonePass {
    annotated: usize,
}

impl OptNonePass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { annotated: 0 }
    }
}

impl Pass for OptNonePass {
    type Error = Infallible;

    fn name(&self) -> String {
        "OptNonePass".to_string()
    }

    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error> {
        let mut targets: Vec<(String, String)> = Vec::new();
        for func in module.functions() {
            if !should_instrument(module, func) {
                continue;
            }
            // optnone is illegal next to alwaysinline.
            if module.function_has_attr(func, "alwaysinline") {
                continue;
            }
            let mut wanted = Vec::new();
            if !module.function_has_attr(func, "optnone") {
                wanted.push("optnone");
            }
            if !module.function_has_attr(func, "noinline") {
                wanted.push("noinline");
            }
            if wanted.is_empty() {
                continue;
            }
            targets.push((func.name.clone(), wanted.join(" ")));
            self.annotated += 1;
        }

        for (name, extra) in targets {
            let func = module
                .functions_mut()
                .find(|func| func.name == name)
                .expect("function disappeared mid-pass");

            // The header line ends with `{`; the attributes go before it.
            if let Some(brace) = func.header.rfind('{') {
                let (head, tail) = func.header.split_at(brace);
                func.header = format!("{} {extra} {}", head.trim_end(), tail);
            }
            for token in extra.split(' ') {
                func.attrs.push(token.to_owned());
            }
        }

        logger.debug(format!("annotated {} functions optnone", self.annotated));
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
        OptNonePass::new().run(&mut module, &logger).unwrap();
        module.print()
    }

    #[test]
    fn plain_function_gets_both_attributes() {
        let out = run("define void @f() {\n  ret void\n}\n");
        assert!(out.contains("define void @f() optnone noinline {"));
    }

    #[test]
    fn existing_attributes_are_not_duplicated() {
        let out = run(
            "define void @f() #0 {\n  ret void\n}\nattributes #0 = { noinline optnone }\n",
        );
        assert!(out.contains("define void @f() #0 {"));
    }

    #[test]
    fn alwaysinline_functions_are_left_alone() {
        let out = run(
            "define void @f() #0 {\n  ret void\n}\nattributes #0 = { alwaysinline }\n",
        );
        assert!(!out.contains("optnone"));
    }

    #[test]
    fn partial_attributes_are_completed() {
        let out = run(
            "define void @f() #0 {\n  ret void\n}\nattributes #0 = { noinline }\n",
        );
        assert!(out.contains("define void @f() #0 optnone {"));
    }
}
