use crate::ir::Module;
use crate::logger::Logger;

pub trait Pass {
    type Error: std::error::Error;

    fn name(&self) -> String;
    fn run(&mut self, module: &mut Module, logger: &Logger) -> Result<(), Self::Error>;
}
