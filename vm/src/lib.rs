//! The bytecode interpreter: a register file, a combined heap/operand
//! stack (`heap::Heap`), and a fetch-decode-execute loop over a linked
//! `core::program::Program`. `run.rs` holds the per-opcode bodies; this
//! module owns construction, the fetch loop, and the garbage-collector
//! rooting helpers every allocating opcode goes through.

mod run;

use core::ast::{AstArena, NodeIdx};
use core::errors::{CompileError, RuntimeError, RuntimeErrorKind, TraceFrame};
use core::opcode::{OpCode, NUM_REGISTERS};
use core::program::Program;
use core::source_map::SourceMap;
use core::value::Value;
use heap::Heap;
use std::collections::HashMap;
use symbols::SymbolTable;
use thiserror::Error;

/// Either phase of turning source into a finished value can fail; this is
/// the error type the convenience entry point (`interpret`) returns, so
/// callers don't have to juggle `CompileError` and `RuntimeError`
/// separately when all they want is "did it work".
#[derive(Debug, Error)]
pub enum ExecError {
  #[error(transparent)]
  Compile(#[from] CompileError),
  #[error(transparent)]
  Runtime(#[from] RuntimeError),
}

/// Rebuilds a `SymbolTable` from a loaded program's string table. Useful
/// when a `.tape` file is loaded from disk without the `SymbolTable` the
/// original compile used: since `intern` is a pure function of the name,
/// re-interning the same names reproduces the same ids.
pub fn symbols_from_program(program: &Program) -> SymbolTable {
  let mut symbols = SymbolTable::default();
  for (_, name) in &program.strings {
    symbols.intern(name);
  }
  symbols
}

pub struct Vm {
  heap: Heap,
  symbols: SymbolTable,
  registers: [Value; NUM_REGISTERS],
  /// Dedicated call-linkage register manipulated only by `link`/`unlink`;
  /// distinct from the 8 general-purpose registers reachable by
  /// `push`/`pull`.
  link: Value,
  code: Vec<u8>,
  pc: usize,
  source_map: SourceMap,
  file_names: HashMap<u32, String>,
}

impl Vm {
  pub fn new(program: Program, symbols: SymbolTable) -> Self {
    Vm::with_file_names(program, symbols, HashMap::new())
  }

  pub fn with_file_names(program: Program, symbols: SymbolTable, file_names: HashMap<u32, String>) -> Self {
    Vm {
      heap: Heap::new(heap::DEFAULT_CAPACITY),
      symbols,
      registers: [Value::NIL; NUM_REGISTERS],
      link: Value::int(0),
      code: program.code,
      pc: 0,
      source_map: program.source_map,
      file_names,
    }
  }

  /// Compiles an already-parsed, already-analyzed-or-not tree and runs it
  /// in one call, the way a REPL or a one-shot script evaluator wants to.
  pub fn interpret(ast: &mut AstArena, root: NodeIdx, symbols: &mut SymbolTable, file_id: u32, file_name: impl Into<String>) -> Result<Value, ExecError> {
    let file_name = file_name.into();
    let program = compiler::compile(ast, root, symbols, file_id, file_name.clone())?;
    let mut file_names = HashMap::new();
    file_names.insert(file_id, file_name);
    let mut vm = Vm::with_file_names(program, std::mem::take(symbols), file_names);
    let result = vm.run()?;
    *symbols = vm.symbols;
    Ok(result)
  }

  /// Runs the loaded program to completion (falling off the end of its
  /// code, or an explicit `halt`) and returns the value left on top of the
  /// operand stack, or `nil` if the stack is empty.
  pub fn run(&mut self) -> Result<Value, RuntimeError> {
    loop {
      if self.pc >= self.code.len() {
        return Ok(self.heap.stack_peek(0).unwrap_or(Value::NIL));
      }

      let instr_start = self.pc;
      let byte = self.code[self.pc];
      self.pc += 1;
      let op = OpCode::try_from(byte).map_err(|b| RuntimeError::new(RuntimeErrorKind::IOError(format!("invalid opcode byte {b:#04x}"))))?;
      let operand = if op.has_operand() { Some(core::utils::read_operand(&self.code, &mut self.pc)) } else { None };

      if let Err(kind) = self.step(op, operand) {
        #[cfg(feature = "plv")]
        tracing::debug!(pc = instr_start, "{}", self.disassembly_near(instr_start));
        return Err(RuntimeError { kind, trace: self.build_trace() });
      }
      if matches!(op, OpCode::Halt) {
        return Ok(self.heap.stack_peek(0).unwrap_or(Value::NIL));
      }
    }
  }

  /// A one-line disassembly of the instruction at `pc`, for the `-d`
  /// trace's "where did this blow up" line. Only compiled in when the
  /// `plv` feature is enabled, since it's the one place the VM reaches
  /// for a front-end crate.
  #[cfg(feature = "plv")]
  fn disassembly_near(&self, pc: usize) -> String {
    let program = Program { code: self.code.clone(), strings: Vec::new(), source_map: self.source_map.clone() };
    let full = plv::disassemble(&program, &self.symbols, &self.file_names);
    full
      .lines()
      .find(|line| line.trim_start().starts_with(&pc.to_string()))
      .unwrap_or("<unknown>")
      .to_string()
  }

  // ---- GC rooting -------------------------------------------------------

  /// Ensures `cells` free heap cells exist, treating the register file and
  /// `extra` (locally-held values popped off the stack, not yet pushed
  /// back) as additional roots. `collect_garbage` rewrites roots in place,
  /// so `extra`'s forwarded values are visible to the caller afterward.
  fn reserve(&mut self, extra: &mut [Value], cells: usize) {
    let reg_count = self.registers.len();
    let mut roots: Vec<Value> = Vec::with_capacity(reg_count + 1 + extra.len());
    roots.extend_from_slice(&self.registers);
    roots.push(self.link);
    roots.extend_from_slice(extra);

    self.heap.maybe_gc(&mut roots, cells);

    self.registers.copy_from_slice(&roots[..reg_count]);
    self.link = roots[reg_count];
    extra.copy_from_slice(&roots[reg_count + 1..]);
  }

  // ---- stack traces -------------------------------------------------------

  fn trace_frame(&self, pc: usize) -> TraceFrame {
    match self.source_map.lookup(pc as u32) {
      Some((file_id, pos)) => TraceFrame { pc, file: self.file_names.get(&file_id).cloned(), source_pos: Some(pos) },
      None => TraceFrame { pc, file: None, source_pos: None },
    }
  }

  /// Walks the `link` chain: each call site leaves `[old_link,
  /// return_addr]` on the stack below the callee's own frame, at depths
  /// fixed by the `link` value recorded when that call's `link` opcode
  /// ran. Best-effort — any inconsistency (a hand-rolled program that
  /// manipulates the stack around `link`/`unlink` directly, for instance)
  /// just truncates the trace rather than panicking.
  fn build_trace(&self) -> Vec<TraceFrame> {
    const MAX_FRAMES: usize = 64;
    let mut trace = vec![self.trace_frame(self.pc)];
    let mut link = self.link;
    let mut len = self.heap.stack_len();

    for _ in 0..MAX_FRAMES {
      if !link.is_int() {
        break;
      }
      let link_idx = link.as_int();
      if link_idx <= 0 || link_idx as usize > len {
        break;
      }
      let link_idx = link_idx as usize;
      let Ok(return_addr) = self.heap.stack_peek(len - link_idx - 1) else { break };
      let Ok(old_link) = self.heap.stack_peek(len - link_idx) else { break };
      if !return_addr.is_int() {
        break;
      }
      trace.push(self.trace_frame(return_addr.as_int() as usize));
      len = link_idx;
      link = old_link;
    }
    trace
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::ast::{AstArena, NodeKind};

  fn compile_and_run(mut ast: AstArena, root: NodeIdx, symbols: &mut SymbolTable) -> Result<Value, ExecError> {
    Vm::interpret(&mut ast, root, symbols, 0, "test.cst")
  }

  #[test]
  fn runs_a_constant_program() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let c = ast.push_leaf(NodeKind::Const(Value::int(42)), (0, 1));
    let root = ast.push(NodeKind::Do, (0, 1), vec![c]);
    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 42);
  }

  #[test]
  fn runs_arithmetic() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let a = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 1));
    let b = ast.push_leaf(NodeKind::Const(Value::int(2)), (0, 1));
    let add = ast.push(NodeKind::Add, (0, 1), vec![a, b]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![add]);
    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 3);
  }

  #[test]
  fn runs_lambda_call() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let x = symbols.intern("x");
    let param = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let body = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let lambda = ast.push(NodeKind::Lambda, (0, 1), vec![param, body]);
    let arg = ast.push_leaf(NodeKind::Const(Value::int(9)), (0, 1));
    let call = ast.push(NodeKind::Call, (0, 1), vec![lambda, arg]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![call]);
    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 9);
  }

  #[test]
  fn runs_nested_calls() {
    // (\x -> (\y -> x + y) 4) 3  ==  7
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let x = symbols.intern("x");
    let y = symbols.intern("y");

    let y_param = ast.push_leaf(NodeKind::Id(y), (0, 1));
    let x_ref = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let y_ref = ast.push_leaf(NodeKind::Id(y), (0, 1));
    let sum = ast.push(NodeKind::Add, (0, 1), vec![x_ref, y_ref]);
    let inner_lambda = ast.push(NodeKind::Lambda, (0, 1), vec![y_param, sum]);
    let four = ast.push_leaf(NodeKind::Const(Value::int(4)), (0, 1));
    let inner_call = ast.push(NodeKind::Call, (0, 1), vec![inner_lambda, four]);

    let x_param = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let outer_lambda = ast.push(NodeKind::Lambda, (0, 1), vec![x_param, inner_call]);
    let three = ast.push_leaf(NodeKind::Const(Value::int(3)), (0, 1));
    let outer_call = ast.push(NodeKind::Call, (0, 1), vec![outer_lambda, three]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![outer_call]);

    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 7);
  }

  #[test]
  fn traps_into_a_primitive() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let seven = ast.push_leaf(NodeKind::Const(Value::int(7)), (0, 1));
    let id = primitives::primitive_id("popcount").unwrap();
    let trap = ast.push(NodeKind::Trap, (0, 1), vec![seven]);
    ast.set_attr(trap, id as i64);
    let root = ast.push(NodeKind::Do, (0, 1), vec![trap]);
    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 3);
  }

  #[test]
  fn division_by_zero_is_a_runtime_error() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let a = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 1));
    let b = ast.push_leaf(NodeKind::Const(Value::int(0)), (0, 1));
    let div = ast.push(NodeKind::Div, (0, 1), vec![a, b]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![div]);
    let err = compile_and_run(ast, root, &mut symbols).unwrap_err();
    assert!(matches!(err, ExecError::Runtime(e) if matches!(e.kind, RuntimeErrorKind::DivByZero)));
  }

  #[test]
  fn panic_unwinds_with_the_message() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let msg = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 1));
    let panic = ast.push(NodeKind::Panic, (0, 1), vec![msg]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![panic]);
    let err = compile_and_run(ast, root, &mut symbols).unwrap_err();
    assert!(matches!(err, ExecError::Runtime(_)));
  }

  #[test]
  fn builds_a_tuple_and_reports_its_length() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let a = ast.push_leaf(NodeKind::Const(Value::int(10)), (0, 1));
    let b = ast.push_leaf(NodeKind::Const(Value::int(20)), (0, 1));
    let tuple = ast.push(NodeKind::Tuple, (0, 1), vec![a, b]);
    let len = ast.push(NodeKind::Len, (0, 1), vec![tuple]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![len]);
    let result = compile_and_run(ast, root, &mut symbols).unwrap();
    assert_eq!(result.as_int(), 2);
  }
}
