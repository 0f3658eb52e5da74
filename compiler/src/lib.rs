//! Turns a simplified, environment-resolved AST into bytecode: one `Chunk`
//! per expression, composed with the flag-aware operators in
//! `core::chunk`, then linked into a single flat `Program`.
//!
//! A frame (program root, module body, `let`, or lambda call) is built by
//! pushing the current `env` register, creating a fresh tuple, and
//! pairing them so that `head` of the result is the new frame and `tail`
//! is the enclosing chain — matching the runtime's own frame-by-frame
//! walk (`frame = Head(env); env = Tail(env)`).
//!
//! Calls have no dedicated opcode. A call site stashes the callee's code
//! address and captured environment in scratch registers 2 and 3, builds
//! the argument frame as a tuple, pairs it onto the captured environment,
//! saves the old `link` register and a return address, then `goto`s into
//! the body. Every lambda body ends with the fixed epilogue `rot; unlink;
//! swap; goto`, which restores `link` and jumps back to the return
//! address the call site computed with `pos`. `jump`/`branch`/`pos`
//! operands are byte offsets measured from the address of the *next*
//! instruction, so every offset here is just the size of bytes already
//! materialized as a `Chunk` — no label-patching pass is needed.
//!
//! Cross-module access (`M.field`) goes through a small registry: every
//! `module` block gets a slot in a `REG_MOD`-resident tuple, populated by
//! running each module's top-level bindings once at program start and
//! capturing the resulting frame tuple. `Ref(field)` indexes into that
//! registry with two link-time-resolved constants, found by matching the
//! field's symbol against the one root-level module whose top-level scope
//! exports it.

use analyzers::Analysis;
use core::ast::{AstArena, NodeIdx, NodeKind};
use core::chunk::Chunk;
use core::errors::{CompileError, CompileErrorKind};
use core::opcode::{OpCode, REG_ENV, REG_MOD};
use core::program::Program;
use core::value::Value;
use std::collections::HashMap;
use symbols::SymbolTable;

/// Scratch register the call sequence uses to stash a closure's captured
/// environment while it builds the new argument frame.
const REG_CALL_ENV: i32 = 2;
/// Scratch register holding the callee's code address across the same
/// sequence.
const REG_CALL_CODE: i32 = 3;

pub struct Compiler<'a> {
  ast: &'a AstArena,
  analysis: &'a Analysis,
  symbols: &'a mut SymbolTable,
  file_id: u32,
  file_name: String,
  strings: Vec<(u32, String)>,
  resolved_refs: HashMap<NodeIdx, (u32, u32)>,
}

impl<'a> Compiler<'a> {
  pub fn new(ast: &'a AstArena, analysis: &'a Analysis, symbols: &'a mut SymbolTable, file_id: u32, file_name: impl Into<String>) -> Self {
    Compiler { ast, analysis, symbols, file_id, file_name: file_name.into(), strings: Vec::new(), resolved_refs: HashMap::new() }
  }

  /// Compiles the whole program: every root-level `module` gets a
  /// registry slot, populated once before the rest of the root runs.
  pub fn compile_program(mut self, root: NodeIdx) -> Result<Program, CompileError> {
    let module_nodes: Vec<NodeIdx> =
      self.ast.get(root).children.iter().copied().filter(|&c| matches!(self.ast.get(c).kind, NodeKind::Module)).collect();
    self.resolve_refs(root, &module_nodes);

    let mut prelude = Chunk::new(self.pos(root));
    if !module_nodes.is_empty() {
      prelude.emit_op_with_operand(OpCode::Tuple, module_nodes.len() as i64);
      prelude.emit_op(OpCode::Pull);
      prelude.emit_operand(REG_MOD as i64);
      for (slot, &module) in module_nodes.iter().enumerate() {
        prelude = prelude.append(self.reset_env(self.pos(module)));
        prelude = prelude.append(self.compile_module_init(module, slot as i64)?);
      }
    }
    prelude = prelude.append(self.reset_env(self.pos(root)));

    let body = self.compile_scope(root, false)?;
    let mut program = Program::new();
    program.code = prelude.append(body).serialize();
    program.strings = self.strings;
    // Coarse fallback: every instruction maps to this file. Finer
    // per-statement positions would need a running byte offset threaded
    // through every composition call; not worth the complexity while the
    // only consumer is a link-chain stack trace, not a source-level
    // debugger.
    program.source_map.record(self.file_id, 0, program.code.len() as u32);
    Ok(program)
  }

  fn pos(&self, node: NodeIdx) -> u32 {
    self.ast.get(node).span.0
  }

  fn error(&self, node: NodeIdx, kind: CompileErrorKind) -> CompileError {
    CompileError { kind, file: self.file_name.clone(), line: 0, source_pos: self.pos(node) }
  }

  fn reset_env(&self, pos: u32) -> Chunk {
    let mut chunk = Chunk::new(pos);
    chunk.emit_op_with_operand(OpCode::Const, Value::NIL.0 as i64);
    chunk.emit_op(OpCode::Pull);
    chunk.emit_operand(REG_ENV as i64);
    chunk.modifies_env = true;
    chunk
  }

  /// Finds, for every `Ref` node in the tree, which root-level module
  /// exports the field it names, and at which slot.
  fn resolve_refs(&mut self, root: NodeIdx, module_nodes: &[NodeIdx]) {
    let mut fields: HashMap<NodeIdx, u32> = HashMap::new();
    self.collect_refs(root, &mut fields);
    for (node, field) in fields {
      for (slot, &module) in module_nodes.iter().enumerate() {
        let body = self.ast.get(module).children[0];
        if let Some(&field_slot) = self.analysis.frames[&body].slot_of.get(&field) {
          self.resolved_refs.insert(node, (slot as u32, field_slot));
          break;
        }
      }
    }
  }

  fn collect_refs(&self, node: NodeIdx, out: &mut HashMap<NodeIdx, u32>) {
    if let NodeKind::Ref(field) = self.ast.get(node).kind {
      out.insert(node, field);
    }
    for &child in &self.ast.get(node).children.clone() {
      self.collect_refs(child, out);
    }
  }

  /// Installs `module`'s export frame (the tuple its top-level scope
  /// builds for its `Def`s) into the registry at `slot`.
  fn compile_module_init(&mut self, module: NodeIdx, slot: i64) -> Result<Chunk, CompileError> {
    let body = self.ast.get(module).children[0];
    let mut chunk = Chunk::new(self.pos(module));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_MOD as i64);
    chunk = chunk.append(self.compile_scope(body, true)?);
    chunk.emit_op_with_operand(OpCode::Const, slot);
    chunk.emit_op(OpCode::Swap);
    chunk.emit_op(OpCode::Set);
    chunk.emit_op(OpCode::Drop);
    Ok(chunk)
  }

  /// Compiles a top-level scope (program root or module body): builds its
  /// frame, runs its `Def`s and statements in order, then (when
  /// `as_export`) leaves that frame tuple as the scope's value instead of
  /// the last statement's.
  fn compile_scope(&mut self, scope: NodeIdx, as_export: bool) -> Result<Chunk, CompileError> {
    let frame = self.analysis.frames[&scope].clone();
    let children = self.ast.get(scope).children.clone();

    let mut chunk = Chunk::new(self.pos(scope));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_ENV as i64);
    chunk.emit_op_with_operand(OpCode::Tuple, frame.size as i64);
    chunk.emit_op(OpCode::Pair);
    chunk.emit_op(OpCode::Pull);
    chunk.emit_operand(REG_ENV as i64);
    chunk.needs_env = true;
    chunk.modifies_env = true;

    let mut pending: Option<Chunk> = None;
    for &child in &children {
      match self.ast.get(child).kind {
        NodeKind::Def => {
          if let Some(p) = pending.take() {
            chunk = chunk.preserving_env(p);
            chunk.emit_op(OpCode::Drop);
          }
          let name = self.ast.get(child).attr.expect("def carries a name symbol") as u32;
          let index = *frame.slot_of.get(&name).expect("def name resolves to a frame slot");
          let value = self.ast.get(child).children[0];
          let mut def_chunk = Chunk::new(self.pos(child));
          def_chunk.emit_op(OpCode::Push);
          def_chunk.emit_operand(REG_ENV as i64);
          def_chunk.needs_env = true;
          def_chunk = def_chunk.append(self.compile_expr(value)?);
          def_chunk.emit_op_with_operand(OpCode::Define, index as i64);
          chunk = chunk.preserving_env(def_chunk);
        }
        NodeKind::Import | NodeKind::Module => {}
        _ => {
          if let Some(p) = pending.take() {
            chunk = chunk.preserving_env(p);
            chunk.emit_op(OpCode::Drop);
          }
          pending = Some(self.compile_expr(child)?);
        }
      }
    }

    if as_export {
      if let Some(p) = pending.take() {
        chunk = chunk.preserving_env(p);
        chunk.emit_op(OpCode::Drop);
      }
      chunk.emit_op(OpCode::Push);
      chunk.emit_operand(REG_ENV as i64);
      chunk.emit_op(OpCode::Head);
      chunk.needs_env = true;
    } else if let Some(p) = pending {
      chunk = chunk.preserving_env(p);
    } else {
      chunk.emit_op_with_operand(OpCode::Const, Value::NIL.0 as i64);
    }
    Ok(chunk)
  }

  fn compile_expr(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    match self.ast.get(node).kind {
      NodeKind::Const(v) => Ok(self.compile_const(node, v)),
      NodeKind::Sym(sym) => Ok(self.compile_const(node, Value::symbol(sym))),
      NodeKind::Str(sym) => Ok(self.compile_str(node, sym)),
      NodeKind::Id(_) => self.compile_lookup(node),
      NodeKind::Ref(field) => self.compile_ref(node, field),

      NodeKind::Tuple => self.compile_tuple(node),
      NodeKind::Pair => self.compile_binary_op(node, OpCode::Pair),
      NodeKind::Head => self.compile_unary_op(node, OpCode::Head),
      NodeKind::Tail => self.compile_unary_op(node, OpCode::Tail),
      NodeKind::Len => self.compile_unary_op(node, OpCode::Len),
      NodeKind::Neg => self.compile_unary_op(node, OpCode::Neg),
      NodeKind::Not => self.compile_unary_op(node, OpCode::Not),
      NodeKind::Comp => self.compile_unary_op(node, OpCode::Comp),

      NodeKind::Eq => self.compile_binary_op(node, OpCode::Eq),
      NodeKind::Rem => self.compile_binary_op(node, OpCode::Rem),
      NodeKind::BitAnd => self.compile_binary_op(node, OpCode::And),
      NodeKind::Mul => self.compile_binary_op(node, OpCode::Mul),
      NodeKind::Add => self.compile_binary_op(node, OpCode::Add),
      NodeKind::Sub => self.compile_binary_op(node, OpCode::Sub),
      NodeKind::Div => self.compile_binary_op(node, OpCode::Div),
      NodeKind::Lt => self.compile_binary_op(node, OpCode::Lt),
      NodeKind::Shift => self.compile_binary_op(node, OpCode::Shift),
      NodeKind::Gt => self.compile_binary_op(node, OpCode::Gt),
      NodeKind::Join => self.compile_binary_op(node, OpCode::Join),
      NodeKind::BitOr => self.compile_binary_op(node, OpCode::Or),
      NodeKind::Xor => self.compile_binary_op(node, OpCode::Xor),
      NodeKind::Slice => self.compile_ternary_op(node, OpCode::Slice),

      NodeKind::And => self.compile_and(node),
      NodeKind::Or => self.compile_or(node),
      NodeKind::If => self.compile_if(node),

      NodeKind::Let => self.compile_let(node),
      NodeKind::Lambda => self.compile_lambda(node),
      NodeKind::Call => self.compile_call(node),
      NodeKind::Do => self.compile_do(node),

      NodeKind::Trap => self.compile_trap(node),
      NodeKind::Panic => self.compile_panic(node),

      NodeKind::Access => Err(self.error(node, CompileErrorKind::MalformedForm("access on a non-module value".into()))),
      NodeKind::Assign | NodeKind::Def | NodeKind::Import | NodeKind::Module => {
        Err(self.error(node, CompileErrorKind::MalformedForm("unexpected in expression position".into())))
      }
      NodeKind::Error => Err(self.error(node, CompileErrorKind::MalformedForm("parse error reached the compiler".into()))),
    }
  }

  fn compile_const(&mut self, node: NodeIdx, v: Value) -> Chunk {
    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op_with_operand(OpCode::Const, v.0 as i64);
    chunk
  }

  fn compile_str(&mut self, node: NodeIdx, sym: u32) -> Chunk {
    if let Some(name) = self.symbols.name_of(sym) {
      let name = name.to_string();
      if !self.strings.iter().any(|(id, _)| *id == sym) {
        self.strings.push((sym, name));
      }
    }
    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op_with_operand(OpCode::Const, Value::symbol(sym).0 as i64);
    chunk.emit_op(OpCode::Str);
    chunk
  }

  fn compile_lookup(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let name_sym = match self.ast.get(node).kind {
      NodeKind::Id(s) => s,
      _ => unreachable!(),
    };
    let address = self.ast.get(node).attr.ok_or_else(|| {
      let name = self.symbols.name_of(name_sym).unwrap_or("<unknown>").to_string();
      self.error(node, CompileErrorKind::UndefinedVariable(name))
    })?;
    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_ENV as i64);
    chunk.emit_op_with_operand(OpCode::Lookup, address);
    chunk.needs_env = true;
    Ok(chunk)
  }

  fn compile_ref(&mut self, node: NodeIdx, field: u32) -> Result<Chunk, CompileError> {
    let (module_slot, field_slot) = self.resolved_refs.get(&node).copied().ok_or_else(|| {
      let name = self.symbols.name_of(field).unwrap_or("<unknown>").to_string();
      self.error(node, CompileErrorKind::MalformedForm(format!("unresolved export `{name}`")))
    })?;
    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_MOD as i64);
    chunk.emit_op_with_operand(OpCode::Const, module_slot as i64);
    chunk.emit_op(OpCode::Get);
    chunk.emit_op_with_operand(OpCode::Const, field_slot as i64);
    chunk.emit_op(OpCode::Get);
    Ok(chunk)
  }

  fn compile_unary_op(&mut self, node: NodeIdx, op: OpCode) -> Result<Chunk, CompileError> {
    let operand = self.ast.get(node).children[0];
    let mut chunk = self.compile_expr(operand)?;
    chunk.emit_op(op);
    Ok(chunk)
  }

  fn compile_binary_op(&mut self, node: NodeIdx, op: OpCode) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let left = self.compile_expr(children[0])?;
    let right = self.compile_expr(children[1])?;
    let mut chunk = left.preserving_env(right);
    chunk.emit_op(op);
    Ok(chunk)
  }

  fn compile_ternary_op(&mut self, node: NodeIdx, op: OpCode) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let a = self.compile_expr(children[0])?;
    let b = self.compile_expr(children[1])?;
    let c = self.compile_expr(children[2])?;
    let mut chunk = a.preserving_env(b).preserving_env(c);
    chunk.emit_op(op);
    Ok(chunk)
  }

  fn compile_tuple(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op_with_operand(OpCode::Tuple, children.len() as i64);
    for (i, &child) in children.iter().enumerate() {
      let mut slot = Chunk::new(self.pos(child));
      slot.emit_op_with_operand(OpCode::Const, i as i64);
      slot = slot.preserving_env(self.compile_expr(child)?);
      slot.emit_op(OpCode::Set);
      chunk = chunk.preserving_env(slot);
    }
    Ok(chunk)
  }

  /// `and`: truthy left continues to `b`; falsy left short-circuits,
  /// keeping the left value.
  fn compile_and(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let left = self.compile_expr(children[0])?;
    let right = self.compile_expr(children[1])?;

    let mut rhs = Chunk::new(right.source_pos);
    rhs.emit_op(OpCode::Drop);
    rhs = rhs.append(right);
    let rhs_size = rhs.size() as i64;
    let jump_size = (1 + core::utils::OPERAND_WIDTH) as i64;

    let mut chunk = left;
    chunk.emit_op(OpCode::Dup);
    chunk.emit_op_with_operand(OpCode::Branch, jump_size);
    chunk.emit_op_with_operand(OpCode::Jump, rhs_size);
    chunk = chunk.preserving_env(rhs);
    Ok(chunk)
  }

  /// `or`: truthy left short-circuits, keeping the left value; falsy
  /// left continues to `b`.
  fn compile_or(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let left = self.compile_expr(children[0])?;
    let right = self.compile_expr(children[1])?;

    let mut rhs = Chunk::new(right.source_pos);
    rhs.emit_op(OpCode::Drop);
    rhs = rhs.append(right);
    let rhs_size = rhs.size() as i64;

    let mut chunk = left;
    chunk.emit_op(OpCode::Dup);
    chunk.emit_op_with_operand(OpCode::Branch, rhs_size);
    chunk = chunk.preserving_env(rhs);
    Ok(chunk)
  }

  fn compile_if(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let cond = self.compile_expr(children[0])?;
    let then_chunk = self.compile_expr(children[1])?;
    let else_chunk = self.compile_expr(children[2])?;

    let jump_size = (1 + core::utils::OPERAND_WIDTH) as i64;
    let branch_target = else_chunk.size() as i64 + jump_size;

    let mut else_then = else_chunk;
    else_then.emit_op_with_operand(OpCode::Jump, then_chunk.size() as i64);
    let else_then = else_then.parallel(then_chunk);

    let mut chunk = cond;
    chunk.emit_op_with_operand(OpCode::Branch, branch_target);
    chunk = chunk.preserving_env(else_then);
    Ok(chunk)
  }

  /// A `let` frame is pushed before its assign values are evaluated (and
  /// before the body runs), so siblings and the body can refer to each
  /// other and to themselves.
  fn compile_let(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let frame = self.analysis.frames[&node].clone();
    let children = self.ast.get(node).children.clone();
    let count = children.len() - 1;
    let body = children[count];

    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_ENV as i64);
    chunk.emit_op_with_operand(OpCode::Tuple, frame.size as i64);
    chunk.emit_op(OpCode::Pair);
    chunk.emit_op(OpCode::Pull);
    chunk.emit_operand(REG_ENV as i64);
    chunk.needs_env = true;
    chunk.modifies_env = true;

    for (i, &assign) in children[..count].iter().enumerate() {
      let index = self.ast.get(assign).attr.unwrap_or(i as i64);
      let value = self.ast.get(assign).children[1];
      let mut assign_chunk = Chunk::new(self.pos(assign));
      assign_chunk.emit_op(OpCode::Push);
      assign_chunk.emit_operand(REG_ENV as i64);
      assign_chunk.needs_env = true;
      assign_chunk = assign_chunk.append(self.compile_expr(value)?);
      assign_chunk.emit_op_with_operand(OpCode::Define, index);
      chunk = chunk.preserving_env(assign_chunk);
    }

    chunk = chunk.preserving_env(self.compile_expr(body)?);
    Ok(chunk)
  }

  /// Builds the closure value `pair(captured_env, code_addr)` then jumps
  /// over the out-of-line body, which the analyzer has already given its
  /// own frame (the parameter list), built by the call site rather than
  /// here.
  fn compile_lambda(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let param_count = children.len() - 1;
    let body_node = children[param_count];

    let mut body = self.compile_expr(body_node)?;
    body.emit_op(OpCode::Rot);
    body.emit_op(OpCode::Unlink);
    body.emit_op(OpCode::Swap);
    body.emit_op(OpCode::Goto);
    let body_size = body.size() as i64;

    let pair_size = 1i64;
    let jump_size = (1 + core::utils::OPERAND_WIDTH) as i64;
    let offset_to_body = pair_size + jump_size;

    let mut chunk = Chunk::new(self.pos(node));
    chunk.emit_op(OpCode::Push);
    chunk.emit_operand(REG_ENV as i64);
    chunk.needs_env = true;
    chunk.emit_op_with_operand(OpCode::Pos, offset_to_body);
    chunk.emit_op(OpCode::Pair);
    chunk.emit_op_with_operand(OpCode::Jump, body_size);
    chunk = chunk.tack_on(body);
    Ok(chunk)
  }

  /// Stashes the closure's code address and captured environment, builds
  /// the argument frame, extends the environment, then transfers control
  /// with a saved `link` and return address.
  fn compile_call(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let (callee_node, arg_nodes) = (children[0], &children[1..]);

    // A bare identifier with no lexical address that happens to name a
    // primitive is a call to it (`print(1 + 2)`), not an undefined
    // variable — primitives aren't seeded into any lexical frame, they're
    // resolved directly against the trap table at the call site.
    if let NodeKind::Id(sym) = self.ast.get(callee_node).kind {
      if self.ast.get(callee_node).attr.is_none() {
        if let Some(id) = self.symbols.name_of(sym).and_then(primitives::primitive_id) {
          return self.compile_primitive_call(node, id, arg_nodes);
        }
      }
    }

    let mut chunk = self.compile_expr(callee_node)?;
    let mut stash = Chunk::new(chunk.source_pos);
    stash.emit_op(OpCode::Dup);
    stash.emit_op(OpCode::Tail);
    stash.emit_op(OpCode::Pull);
    stash.emit_operand(REG_CALL_ENV as i64);
    stash.emit_op(OpCode::Head);
    stash.emit_op(OpCode::Pull);
    stash.emit_operand(REG_CALL_CODE as i64);
    chunk = chunk.preserving_env(stash);

    let mut frame = Chunk::new(chunk.source_pos);
    frame.emit_op_with_operand(OpCode::Tuple, arg_nodes.len() as i64);
    for (i, &arg) in arg_nodes.iter().enumerate() {
      let mut slot = Chunk::new(self.pos(arg));
      slot.emit_op_with_operand(OpCode::Const, i as i64);
      slot = slot.preserving_env(self.compile_expr(arg)?);
      slot.emit_op(OpCode::Set);
      frame = frame.preserving_env(slot);
    }
    frame.emit_op(OpCode::Push);
    frame.emit_operand(REG_CALL_ENV as i64);
    frame.emit_op(OpCode::Swap);
    frame.emit_op(OpCode::Pair);
    frame.emit_op(OpCode::Pull);
    frame.emit_operand(REG_ENV as i64);
    frame.emit_op(OpCode::Push);
    frame.emit_operand(REG_CALL_CODE as i64);
    frame.emit_op(OpCode::Goto);
    frame.modifies_env = true;

    let return_offset = frame.size() as i64;
    let mut call_seq = Chunk::new(chunk.source_pos);
    call_seq.emit_op(OpCode::Link);
    call_seq.emit_op_with_operand(OpCode::Pos, return_offset);
    call_seq = call_seq.append(frame);

    chunk = chunk.preserving_env(call_seq);
    Ok(chunk)
  }

  fn compile_do(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    if children.is_empty() {
      let mut chunk = Chunk::new(self.pos(node));
      chunk.emit_op_with_operand(OpCode::Const, Value::NIL.0 as i64);
      return Ok(chunk);
    }
    let mut compiled: Vec<Chunk> = Vec::with_capacity(children.len());
    for &child in &children {
      compiled.push(self.compile_expr(child)?);
    }
    let last = compiled.pop().unwrap();
    let mut chunk: Option<Chunk> = None;
    for stmt in compiled {
      chunk = Some(match chunk {
        None => stmt,
        Some(mut c) => {
          c.emit_op(OpCode::Drop);
          c.preserving_env(stmt)
        }
      });
    }
    Ok(match chunk {
      None => last,
      Some(mut c) => {
        c.emit_op(OpCode::Drop);
        c.preserving_env(last)
      }
    })
  }

  /// `trap(id, args...)`: the primitive id is a literal baked in by the
  /// parser, not a lexical reference.
  /// Compiles a call whose callee is a bare unbound name matching a
  /// primitive straight to `trap id`, the same code a literal
  /// `trap(id, args...)` form produces, with arity checked against the
  /// primitive's own declared arity instead of the caller-supplied literal.
  fn compile_primitive_call(&mut self, node: NodeIdx, id: u32, arg_nodes: &[NodeIdx]) -> Result<Chunk, CompileError> {
    let expected = primitives::primitive_arity(id).unwrap_or(arg_nodes.len());
    if arg_nodes.len() != expected {
      let name = primitives::primitive_name(id).unwrap_or("<primitive>");
      return Err(self.error(node, CompileErrorKind::MalformedForm(format!("{name} expects {expected} argument(s)"))));
    }
    let mut chunk: Option<Chunk> = None;
    for &arg in arg_nodes {
      let arg_chunk = self.compile_expr(arg)?;
      chunk = Some(match chunk {
        None => arg_chunk,
        Some(c) => c.preserving_env(arg_chunk),
      });
    }
    let mut chunk = chunk.unwrap_or_else(|| Chunk::new(self.pos(node)));
    chunk.emit_op_with_operand(OpCode::Trap, id as i64);
    Ok(chunk)
  }

  fn compile_trap(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let id = self.ast.get(node).attr.ok_or_else(|| self.error(node, CompileErrorKind::MalformedForm("trap missing a primitive id".into())))?;
    let children = self.ast.get(node).children.clone();
    let mut chunk: Option<Chunk> = None;
    for &arg in &children {
      let arg_chunk = self.compile_expr(arg)?;
      chunk = Some(match chunk {
        None => arg_chunk,
        Some(c) => c.preserving_env(arg_chunk),
      });
    }
    let mut chunk = chunk.unwrap_or_else(|| Chunk::new(self.pos(node)));
    chunk.emit_op_with_operand(OpCode::Trap, id);
    Ok(chunk)
  }

  fn compile_panic(&mut self, node: NodeIdx) -> Result<Chunk, CompileError> {
    let children = self.ast.get(node).children.clone();
    let mut chunk = if let Some(&msg) = children.first() { self.compile_expr(msg)? } else { Chunk::new(self.pos(node)) };
    chunk.emit_op(OpCode::Panic);
    Ok(chunk)
  }
}

/// Convenience entry point: runs the environment/constant passes, then
/// compiles. Most callers (the driver, tests) want this rather than
/// wiring `analyzers::analyze` and `Compiler` together by hand.
pub fn compile(ast: &mut AstArena, root: NodeIdx, symbols: &mut SymbolTable, file_id: u32, file_name: impl Into<String>) -> Result<Program, CompileError> {
  let analysis = analyzers::analyze(ast, root);
  Compiler::new(ast, &analysis, symbols, file_id, file_name).compile_program(root)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn run(mut ast: AstArena, root: NodeIdx, symbols: &mut SymbolTable) -> Program {
    compile(&mut ast, root, symbols, 0, "test.cst").expect("compiles")
  }

  #[test]
  fn compiles_a_constant_program() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let c = ast.push_leaf(NodeKind::Const(Value::int(42)), (0, 1));
    let root = ast.push(NodeKind::Do, (0, 1), vec![c]);
    let program = run(ast, root, &mut symbols);
    assert!(!program.code.is_empty());
  }

  #[test]
  fn compiles_arithmetic_expression() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let a = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 1));
    let b = ast.push_leaf(NodeKind::Const(Value::int(2)), (0, 1));
    let add = ast.push(NodeKind::Add, (0, 1), vec![a, b]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![add]);
    let program = run(ast, root, &mut symbols);
    assert!(program.code.contains(&(OpCode::Add as u8)));
  }

  #[test]
  fn compiles_lambda_and_call() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let x = symbols.intern("x");
    let param = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let body = ast.push_leaf(NodeKind::Id(x), (0, 1));
    let lambda = ast.push(NodeKind::Lambda, (0, 1), vec![param, body]);
    let arg = ast.push_leaf(NodeKind::Const(Value::int(9)), (0, 1));
    let call = ast.push(NodeKind::Call, (0, 1), vec![lambda, arg]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![call]);
    let program = run(ast, root, &mut symbols);
    assert!(program.code.contains(&(OpCode::Goto as u8)));
    assert!(program.code.contains(&(OpCode::Link as u8)));
  }

  #[test]
  fn compiles_module_export_and_reference() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let inc_name = symbols.intern("inc");
    let one = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 1));
    let def = ast.push(NodeKind::Def, (0, 1), vec![one]);
    ast.set_attr(def, inc_name as i64);
    let module_body = ast.push(NodeKind::Do, (0, 1), vec![def]);
    let module = ast.push(NodeKind::Module, (0, 1), vec![module_body]);
    let m_name = symbols.intern("M");
    ast.set_attr(module, m_name as i64);

    let import = ast.push_leaf(NodeKind::Import, (0, 1));
    ast.set_attr(import, m_name as i64);
    let base = ast.push_leaf(NodeKind::Id(m_name), (0, 1));
    let access = ast.push(NodeKind::Access, (0, 1), vec![base]);
    ast.set_attr(access, inc_name as i64);

    let root = ast.push(NodeKind::Do, (0, 1), vec![import, module, access]);
    let program = run(ast, root, &mut symbols);
    assert!(program.code.contains(&(OpCode::Get as u8)));
  }

  #[test]
  fn reports_undefined_variable() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let name = symbols.intern("nowhere");
    let id = ast.push_leaf(NodeKind::Id(name), (3, 10));
    let root = ast.push(NodeKind::Do, (0, 11), vec![id]);
    let err = compile(&mut ast, root, &mut symbols, 0, "test.cst").unwrap_err();
    assert!(matches!(err.kind, CompileErrorKind::UndefinedVariable(_)));
  }

  #[test]
  fn calling_a_bare_primitive_name_compiles_to_a_trap() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let print_sym = symbols.intern("print");
    let callee = ast.push_leaf(NodeKind::Id(print_sym), (0, 1));
    let arg = ast.push_leaf(NodeKind::Const(Value::int(3)), (0, 1));
    let call = ast.push(NodeKind::Call, (0, 1), vec![callee, arg]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![call]);
    let program = run(ast, root, &mut symbols);
    assert!(program.code.contains(&(OpCode::Trap as u8)));
    assert!(!program.code.contains(&(OpCode::Goto as u8)));
  }

  #[test]
  fn calling_a_primitive_with_the_wrong_arity_is_a_compile_error() {
    let mut ast = AstArena::new();
    let mut symbols = SymbolTable::default();
    let print_sym = symbols.intern("print");
    let callee = ast.push_leaf(NodeKind::Id(print_sym), (0, 1));
    let call = ast.push(NodeKind::Call, (0, 1), vec![callee]);
    let root = ast.push(NodeKind::Do, (0, 1), vec![call]);
    let err = compile(&mut ast, root, &mut symbols, 0, "test.cst").unwrap_err();
    assert!(matches!(err.kind, CompileErrorKind::MalformedForm(_)));
  }
}
