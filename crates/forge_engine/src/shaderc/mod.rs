//! Shader compiler
//!
//! Compiles the engine's shading language to SPIR-V through four stages:
//! lexer ([`lexer::Lexer`]), two-stack precedence parser ([`parser::Parser`]
//! producing an [`ast`]), legaliser ([`legaliser::legalise`] producing typed
//! [`hir`]), and the SPIR-V backend ([`spv`]).

pub mod ast;
pub mod error;
pub mod hir;
pub mod legaliser;
pub mod lexer;
pub mod parser;
pub mod spv;
pub mod token;
pub mod types;

pub use error::{Error, SourceLocation};
pub use types::{ScalarType, Type};

/// Compiles shader source text to a SPIR-V module.
pub fn compile(source: &str) -> Result<Vec<spv::Word>, Error> {
    let mut lexer = lexer::Lexer::new(source);
    let root = parser::Parser::new(&mut lexer).parse()?;
    let hir_root = legaliser::legalise(&root)?;
    let mut builder = spv::Builder::new();
    spv::build_module(&mut builder, &hir_root);
    Ok(builder.finish())
}
