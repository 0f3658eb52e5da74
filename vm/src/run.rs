//! Per-opcode bodies. `Vm::step` is the only entry point `lib.rs` calls;
//! everything here returns a bare `RuntimeErrorKind` so the fetch loop can
//! attach a stack trace in exactly one place.

use core::errors::RuntimeErrorKind;
use core::opcode::{OpCode, NUM_REGISTERS};
use core::value::Value;

use crate::Vm;

type Op = Result<(), RuntimeErrorKind>;

fn type_error(op: &'static str, expected: &'static str) -> RuntimeErrorKind {
  RuntimeErrorKind::TypeError { op, expected, got: "a value of the wrong type" }
}

fn expect_int(op: &'static str, v: Value) -> Result<i32, RuntimeErrorKind> {
  if v.is_int() {
    Ok(v.as_int())
  } else {
    Err(type_error(op, "integer"))
  }
}

fn expect_register(n: i64) -> Result<usize, RuntimeErrorKind> {
  if n >= 0 && (n as usize) < NUM_REGISTERS {
    Ok(n as usize)
  } else {
    Err(RuntimeErrorKind::IOError(format!("register index {n} out of range")))
  }
}

impl Vm {
  pub(crate) fn step(&mut self, op: OpCode, operand: Option<i64>) -> Op {
    use OpCode::*;
    match op {
      Noop | Halt => Ok(()),
      Panic => self.op_panic(),
      Const => self.op_const(operand.unwrap()),
      Lookup => self.op_lookup(operand.unwrap()),
      Define => self.op_define(operand.unwrap()),

      Jump => self.op_jump(operand.unwrap()),
      Branch => self.op_branch(operand.unwrap()),
      Pos => self.op_pos(operand.unwrap()),
      Goto => self.op_goto(),
      Push => self.op_push(operand.unwrap()),
      Pull => self.op_pull(operand.unwrap()),
      Link => self.op_link(),
      Unlink => self.op_unlink(),

      Add => self.op_arith("add", |a, b| a.wrapping_add(b)),
      Sub => self.op_arith("sub", |a, b| a.wrapping_sub(b)),
      Mul => self.op_arith("mul", |a, b| a.wrapping_mul(b)),
      Div => self.op_div(),
      Rem => self.op_rem(),
      And => self.op_arith("and", |a, b| a & b),
      Or => self.op_arith("or", |a, b| a | b),
      Comp => self.op_unary_int("comp", |a| !a),
      Lt => self.op_compare("lt", |a, b| a < b),
      Gt => self.op_compare("gt", |a, b| a > b),
      Eq => self.op_eq(),
      Neg => self.op_unary_int("neg", |a| a.wrapping_neg()),
      Not => self.op_not(),
      Shift => self.op_shift(),
      Xor => self.op_arith("xor", |a, b| a ^ b),

      Dup => self.op_dup(),
      Drop => self.op_drop(),
      Swap => self.op_swap(),
      Over => self.op_over(),
      Rot => self.op_rot(),
      Pick => self.op_pick(operand.unwrap()),

      Pair => self.op_pair(),
      Head => self.op_head(),
      Tail => self.op_tail(),
      Tuple => self.op_tuple(operand.unwrap()),
      Len => self.op_len(),
      Get => self.op_get(),
      Set => self.op_set(),
      Str => self.op_str(),
      Join => self.op_join(),
      Slice => self.op_slice(),

      Trap => self.op_trap(operand.unwrap()),
    }
  }

  fn pop(&mut self) -> Result<Value, RuntimeErrorKind> {
    self.heap.stack_pop().map_err(|e| e.kind)
  }

  fn push(&mut self, v: Value) {
    self.reserve(&mut [], 1);
    self.heap.stack_push(v);
  }

  // ---- control & environment ----------------------------------------

  fn op_panic(&mut self) -> Op {
    let message = match self.heap.stack_peek(0) {
      Ok(v) if self.heap.is_binary(v) => String::from_utf8_lossy(&self.heap.binary_data(v)).into_owned(),
      Ok(v) => format!("{v:?}"),
      Err(_) => "panic".to_string(),
    };
    Err(RuntimeErrorKind::Panic(message))
  }

  fn op_const(&mut self, n: i64) -> Op {
    self.push(Value(n as u32));
    Ok(())
  }

  fn op_lookup(&mut self, n: i64) -> Op {
    let mut env = self.pop()?;
    let mut remaining = n;
    loop {
      if env.is_nil() {
        return Err(RuntimeErrorKind::UndefinedVariable);
      }
      let frame = self.heap.head(env);
      let frame_size = self.heap.obj_len(frame) as i64;
      if remaining < frame_size {
        let v = self.heap.tuple_get(frame, remaining).map_err(|e| e.kind)?;
        self.push(v);
        return Ok(());
      }
      remaining -= frame_size;
      env = self.heap.tail(env);
    }
  }

  fn op_define(&mut self, n: i64) -> Op {
    let value = self.pop()?;
    let mut env = self.pop()?;
    let mut remaining = n;
    loop {
      if env.is_nil() {
        return Err(RuntimeErrorKind::UndefinedVariable);
      }
      let frame = self.heap.head(env);
      let frame_size = self.heap.obj_len(frame) as i64;
      if remaining < frame_size {
        return self.heap.tuple_set(frame, remaining, value).map_err(|e| e.kind);
      }
      remaining -= frame_size;
      env = self.heap.tail(env);
    }
  }

  fn op_jump(&mut self, n: i64) -> Op {
    self.pc = (self.pc as i64 + n) as usize;
    Ok(())
  }

  fn op_branch(&mut self, n: i64) -> Op {
    let a = self.pop()?;
    if a.is_truthy() {
      self.pc = (self.pc as i64 + n) as usize;
    }
    Ok(())
  }

  fn op_pos(&mut self, n: i64) -> Op {
    self.push(Value::int((self.pc as i64 + n) as i32));
    Ok(())
  }

  fn op_goto(&mut self) -> Op {
    let target = self.pop()?;
    self.pc = expect_int("goto", target)? as usize;
    Ok(())
  }

  fn op_push(&mut self, r: i64) -> Op {
    let r = expect_register(r)?;
    self.push(self.registers[r]);
    Ok(())
  }

  fn op_pull(&mut self, r: i64) -> Op {
    let r = expect_register(r)?;
    let v = self.pop()?;
    self.registers[r] = v;
    Ok(())
  }

  fn op_link(&mut self) -> Op {
    let old_link = self.link;
    self.push(old_link);
    self.link = Value::int(self.heap.stack_len() as i32);
    Ok(())
  }

  fn op_unlink(&mut self) -> Op {
    self.link = self.pop()?;
    Ok(())
  }

  // ---- arithmetic -----------------------------------------------------

  fn op_arith(&mut self, name: &'static str, f: impl Fn(i32, i32) -> i32) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let a = expect_int(name, a)?;
    let b = expect_int(name, b)?;
    self.push(Value::int(f(a, b)));
    Ok(())
  }

  fn op_unary_int(&mut self, name: &'static str, f: impl Fn(i32) -> i32) -> Op {
    let a = self.pop()?;
    let a = expect_int(name, a)?;
    self.push(Value::int(f(a)));
    Ok(())
  }

  fn op_div(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let a = expect_int("div", a)?;
    let b = expect_int("div", b)?;
    if b == 0 {
      return Err(RuntimeErrorKind::DivByZero);
    }
    self.push(Value::int(a.wrapping_div(b)));
    Ok(())
  }

  fn op_rem(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let a = expect_int("rem", a)?;
    let b = expect_int("rem", b)?;
    if b == 0 {
      return Err(RuntimeErrorKind::DivByZero);
    }
    self.push(Value::int(a.wrapping_rem(b)));
    Ok(())
  }

  fn op_compare(&mut self, name: &'static str, f: impl Fn(i32, i32) -> bool) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let a = expect_int(name, a)?;
    let b = expect_int(name, b)?;
    self.push(Value::from(f(a, b)));
    Ok(())
  }

  fn op_eq(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    self.push(Value::from(self.heap.val_eq(a, b)));
    Ok(())
  }

  fn op_not(&mut self) -> Op {
    let a = self.pop()?;
    self.push(Value::from(!a.is_truthy()));
    Ok(())
  }

  fn op_shift(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let a = expect_int("shift", a)?;
    let b = expect_int("shift", b)?;
    let result = if b >= 0 {
      a.checked_shl(b as u32).unwrap_or(0)
    } else {
      a.checked_shr((-b) as u32).unwrap_or(if a < 0 { -1 } else { 0 })
    };
    self.push(Value::int(result));
    Ok(())
  }

  // ---- direct stack manipulation --------------------------------------

  fn op_dup(&mut self) -> Op {
    let a = self.heap.stack_peek(0).map_err(|e| e.kind)?;
    self.push(a);
    Ok(())
  }

  fn op_drop(&mut self) -> Op {
    self.pop()?;
    Ok(())
  }

  fn op_swap(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    self.heap.stack_push(b);
    self.heap.stack_push(a);
    Ok(())
  }

  fn op_over(&mut self) -> Op {
    let a = self.heap.stack_peek(1).map_err(|e| e.kind)?;
    self.push(a);
    Ok(())
  }

  fn op_rot(&mut self) -> Op {
    // a b c -> b c a
    let c = self.pop()?;
    let b = self.pop()?;
    let a = self.pop()?;
    self.heap.stack_push(b);
    self.heap.stack_push(c);
    self.heap.stack_push(a);
    Ok(())
  }

  fn op_pick(&mut self, n: i64) -> Op {
    let v = self.heap.stack_peek(n as usize).map_err(|e| e.kind)?;
    self.push(v);
    Ok(())
  }

  // ---- containers ------------------------------------------------------

  fn op_pair(&mut self) -> Op {
    let h = self.pop()?;
    let t = self.pop()?;
    let mut extra = [t, h];
    self.reserve(&mut extra, 2);
    let p = self.heap.pair(extra[1], extra[0]);
    self.heap.stack_push(p);
    Ok(())
  }

  fn op_head(&mut self) -> Op {
    let p = self.pop()?;
    if !self.heap.is_pair(p) {
      return Err(type_error("head", "pair"));
    }
    let h = self.heap.head(p);
    self.push(h);
    Ok(())
  }

  fn op_tail(&mut self) -> Op {
    let p = self.pop()?;
    if !self.heap.is_pair(p) {
      return Err(type_error("tail", "pair"));
    }
    let t = self.heap.tail(p);
    self.push(t);
    Ok(())
  }

  fn op_tuple(&mut self, n: i64) -> Op {
    self.reserve(&mut [], n as usize + 1);
    let t = self.heap.tuple(n as u32);
    self.heap.stack_push(t);
    Ok(())
  }

  fn op_len(&mut self) -> Op {
    let a = self.pop()?;
    let len = if a.is_nil() {
      0
    } else if self.heap.is_tuple(a) || self.heap.is_binary(a) {
      self.heap.obj_len(a) as i32
    } else if self.heap.is_pair(a) {
      let mut n = 0i32;
      let mut cursor = a;
      while self.heap.is_pair(cursor) {
        n += 1;
        cursor = self.heap.tail(cursor);
      }
      n
    } else {
      return Err(type_error("len", "tuple, pair list, or binary"));
    };
    self.push(Value::int(len));
    Ok(())
  }

  fn op_get(&mut self) -> Op {
    let index = self.pop()?;
    let container = self.pop()?;
    let index = expect_int("get", index)? as i64;
    if self.heap.is_tuple(container) {
      let v = self.heap.tuple_get(container, index).map_err(|e| e.kind)?;
      self.push(v);
    } else if self.heap.is_binary(container) {
      let b = self.heap.binary_get(container, index).map_err(|e| e.kind)?;
      self.push(Value::int(b as i32));
    } else {
      return Err(type_error("get", "tuple or binary"));
    }
    Ok(())
  }

  fn op_set(&mut self) -> Op {
    let value = self.pop()?;
    let index = self.pop()?;
    let container = self.pop()?;
    let index = expect_int("set", index)? as i64;
    if self.heap.is_tuple(container) {
      self.heap.tuple_set(container, index, value).map_err(|e| e.kind)?;
    } else if self.heap.is_binary(container) {
      let byte = expect_int("set", value)?;
      if !(0..256).contains(&byte) {
        return Err(type_error("set", "byte in 0..256"));
      }
      self.heap.binary_set(container, index, byte as u8).map_err(|e| e.kind)?;
    } else {
      return Err(type_error("set", "tuple or binary"));
    }
    self.push(container);
    Ok(())
  }

  fn op_str(&mut self) -> Op {
    let sym = self.pop()?;
    let name = self.symbols.name_of(sym.as_symbol_id()).unwrap_or("").to_string();
    let bytes = name.into_bytes();
    self.reserve(&mut [], bytes.len().div_ceil(4).max(1) + 1);
    let b = self.heap.binary_from_bytes(&bytes);
    self.heap.stack_push(b);
    Ok(())
  }

  fn op_join(&mut self) -> Op {
    let b = self.pop()?;
    let a = self.pop()?;
    let mut extra = [a, b];
    if self.heap.is_tuple(a) && self.heap.is_tuple(b) {
      let cells = self.heap.obj_len(a) as usize + self.heap.obj_len(b) as usize + 1;
      self.reserve(&mut extra, cells);
      let joined = self.heap.tuple_join(extra[0], extra[1]);
      self.heap.stack_push(joined);
    } else if self.heap.is_binary(a) && self.heap.is_binary(b) {
      let cells = (self.heap.obj_len(a) as usize + self.heap.obj_len(b) as usize).div_ceil(4).max(1) + 1;
      self.reserve(&mut extra, cells);
      let joined = self.heap.binary_join(extra[0], extra[1]);
      self.heap.stack_push(joined);
    } else {
      return Err(type_error("join", "two tuples or two binaries"));
    }
    Ok(())
  }

  fn op_slice(&mut self) -> Op {
    let end = self.pop()?;
    let start = self.pop()?;
    let container = self.pop()?;
    let start = expect_int("slice", start)? as i64;
    let end = expect_int("slice", end)? as i64;
    let mut extra = [container];
    if self.heap.is_tuple(container) {
      let cells = (end - start).max(0) as usize + 1;
      self.reserve(&mut extra, cells);
      let out = self.heap.tuple_slice(extra[0], start, end).map_err(|e| e.kind)?;
      self.heap.stack_push(out);
    } else if self.heap.is_binary(container) {
      let cells = ((end - start).max(0) as usize).div_ceil(4) + 1;
      self.reserve(&mut extra, cells);
      let out = self.heap.binary_slice(extra[0], start, end).map_err(|e| e.kind)?;
      self.heap.stack_push(out);
    } else {
      return Err(type_error("slice", "tuple or binary"));
    }
    Ok(())
  }

  // ---- primitives --------------------------------------------------------

  fn op_trap(&mut self, id: i64) -> Op {
    let arity = primitives::primitive_arity(id as u32).unwrap_or(0);
    let mut args = vec![Value::NIL; arity];
    for slot in args.iter_mut().rev() {
      *slot = self.pop()?;
    }

    // A primitive's output is bounded by the size of its heap-resident
    // input, so reserving the whole current capacity is always enough
    // without introspecting each primitive's worst case individually.
    let cells = self.heap.capacity();
    self.reserve(&mut args, cells);

    let result = primitives::call(id as u32, &mut self.heap, &self.symbols, &args).map_err(|e| e.kind)?;
    self.push(result);
    Ok(())
  }
}
