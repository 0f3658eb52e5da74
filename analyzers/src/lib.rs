//! Whole-program passes that run on a parsed tree before it reaches the
//! compiler: constant folding/dead-branch elimination, then lexical
//! frame and slot resolution.

pub mod env;
pub mod simplify;

use core::ast::{AstArena, NodeIdx};
pub use env::{Analysis, FrameInfo};

/// Runs both passes over `root` in the order the compiler needs them:
/// folding first, so resolution never has to account for branches or
/// operators the compiler will never actually emit.
pub fn analyze(ast: &mut AstArena, root: NodeIdx) -> Analysis {
  simplify::simplify(ast, root);
  env::resolve(ast, root)
}
