pub mod ast;
pub mod chunk;
pub mod errors;
pub mod opcode;
pub mod program;
pub mod source_map;
pub mod tokens;
pub mod utils;
pub mod value;

/// The current version of the interpreter.
pub const VERSION: &str = "0.1.0";
/// Program file format version written to `VERS` chunks. A major bump means
/// old program files fail with `UnsupportedVersion`.
pub const PROGRAM_VERSION: (u32, u32) = (1, 0);
/// The max number of nested call frames walked when building a stack trace.
pub const FRAMES_MAX: usize = 128;
