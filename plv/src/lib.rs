//! A disassembler over a linked `core::program::Program`, and the
//! front-end pipeline glue `-d` debug output drives: lex, parse, analyze,
//! compile, then hand the result to `disassembler` for a listing. Named
//! after Hinton's own "Program Lifecycle Visualizer" crate, whose role
//! here is narrowed to a textual trace instead of a browser-facing dump.

mod disassembler;

use core::ast::{AstArena, NodeIdx};
use core::errors::{CompileError, LexError, ParseError};
use core::program::Program;
use core::tokens::TokenList;
use std::path::PathBuf;
use symbols::SymbolTable;
use thiserror::Error;
use tracing::{debug, info_span};

pub use disassembler::disassemble;

#[derive(Debug, Error)]
pub enum FrontendError {
  #[error(transparent)]
  Lex(#[from] LexError),
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Compile(#[from] CompileError),
}

/// Drives lexer -> parser -> analyzers -> compiler for one file, logging
/// a `tracing` span per stage so `-d` shows where time (and, at `debug!`
/// level, which rule/label) went without the driver needing its own
/// instrumentation.
pub fn compile_source(source: &[char], path: &PathBuf, symbols: &mut SymbolTable, file_id: u32) -> Result<(Program, AstArena, NodeIdx), FrontendError> {
  let lex_span = info_span!("lex", file = %path.display());
  let tokens = lex_span.in_scope(|| lexer::Lexer::lex(source));
  debug!(count = tokens.len(), "lexed tokens");

  let token_list = TokenList::new(path, source, &tokens);

  let parse_span = info_span!("parse", file = %path.display());
  let (mut ast, root) = parse_span.in_scope(|| parser::Parser::parse(&token_list, symbols))?;
  debug!(nodes = ast.len(), "parsed ast");

  // Re-run below by `compiler::compile` itself; done again here only so
  // `-d` can report the root frame's size before codegen starts.
  let analyze_span = info_span!("analyze", file = %path.display());
  let analysis = analyze_span.in_scope(|| analyzers::analyze(&mut ast, root));
  if let Some(frame) = analysis.frames.get(&root) {
    debug!(slots = frame.size, "resolved root frame");
  }

  let file_name = path.display().to_string();
  let compile_span = info_span!("compile", file = %path.display());
  let program = compile_span.in_scope(|| compiler::compile(&mut ast, root, symbols, file_id, file_name))?;
  debug!(bytes = program.code.len(), "compiled program");

  Ok((program, ast, root))
}
