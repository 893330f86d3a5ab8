//! Front end for the cell language: a small Python-flavoured numeric scripting
//! language executed by the worker harness.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod visit;

pub use ast::Module;
pub use visit::TreeStats;

/// Source that could not be tokenized or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid syntax (line {line}): {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Parse a complete cell.
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_module()
}
