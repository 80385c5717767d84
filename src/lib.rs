//! `luaparse` library crate.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the AST (`ast`)
//! - execution backends: `backend::interpreter` (AST-walk) and
//!   `backend::jit` (ahead-of-execution native compilation with
//!   interpreter fallback)
//! - `codegen`: the x86-64 and AArch64 machine-code encoders behind the
//!   JIT backend
pub mod ast;
pub mod backend;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod token;
