use std::fs;

use anyhow::{Context, Result, bail};
use luaparse::backend::Backend;
use luaparse::backend::interpreter::Interpreter;
use luaparse::backend::jit::JIT;
use luaparse::{lexer, parser};

fn main() -> Result<()> {
    let mut use_jit = false;
    let mut input_path: Option<String> = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--jit" => {
                use_jit = true;
            }
            _ => {
                if input_path.is_some() {
                    bail!("Usage: luaparse [--jit] <filename.lua>");
                }
                input_path = Some(arg);
            }
        }
    }

    let Some(path) = input_path else {
        bail!("Usage: luaparse [--jit] <filename.lua>");
    };
    let source = fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;

    let tokens = lexer::tokenize(&source)?;
    let program = parser::parse_tokens(tokens)?;

    let mut backend: Box<dyn Backend> = if use_jit {
        Box::new(JIT::new())
    } else {
        Box::new(Interpreter::new())
    };
    let output = backend.run(&program)?;
    if !output.is_empty() {
        print!("{output}");
    }
    Ok(())
}
