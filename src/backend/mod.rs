use anyhow::Result;

use crate::ast::Program;

pub mod interpreter;
pub mod jit;

/// Common interface implemented by each execution backend.
///
/// `run` executes the whole program and returns everything it wrote to
/// standard output (each `print` contributes its tab-joined arguments and a
/// trailing newline).
pub trait Backend {
    fn name(&self) -> &'static str;
    fn run(&mut self, program: &Program) -> Result<String>;
}

pub fn backends() -> Vec<Box<dyn Backend>> {
    vec![
        Box::new(interpreter::Interpreter::new()),
        Box::new(jit::JIT::new()),
    ]
}
