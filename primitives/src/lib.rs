//! The primitive functions reachable from bytecode through `trap id`.
//! Each one is a pure host function: it consumes its operands from a
//! slice already popped off the stack by the VM and returns exactly one
//! result, or a runtime error.

use core::errors::{RuntimeError, RuntimeErrorKind};
use core::utils::get_time_millis;
use core::value::Value;
use heap::Heap;
use std::cell::Cell;
use std::io::Write;
use symbols::SymbolTable;

/// The signature every primitive body has. `heap` is passed mutably
/// because primitives that build a result (`format`, `join`-like string
/// building) allocate; `symbols` gives read access to interned names for
/// `typeof` and `symbol_name`.
pub type PrimitiveBody = fn(&mut Heap, &SymbolTable, &[Value]) -> Result<Value, RuntimeError>;

pub struct PrimitiveDef {
  pub name: &'static str,
  pub arity: usize,
  pub body: PrimitiveBody,
}

macro_rules! prim {
  ($name:expr, $arity:expr, $body:expr) => {{
    PrimitiveDef { name: $name, arity: $arity, body: $body }
  }};
}

pub const PRIMITIVES_LEN: usize = 12;

pub const PRIMITIVES: [PrimitiveDef; PRIMITIVES_LEN] = [
  prim!("typeof", 1, prim_typeof),
  prim!("format", 1, prim_format),
  prim!("make_tuple", 1, prim_make_tuple),
  prim!("symbol_name", 1, prim_symbol_name),
  prim!("hash", 1, prim_hash),
  prim!("popcount", 1, prim_popcount),
  prim!("max_int", 0, prim_max_int),
  prim!("min_int", 0, prim_min_int),
  prim!("time", 0, prim_time),
  prim!("random", 0, prim_random),
  prim!("seed", 1, prim_seed),
  prim!("print", 1, prim_print),
];

/// Looks up a primitive's `trap` id by surface name, for the compiler's
/// name-to-id table.
pub fn primitive_id(name: &str) -> Option<u32> {
  PRIMITIVES.iter().position(|p| p.name == name).map(|i| i as u32)
}

pub fn primitive_name(id: u32) -> Option<&'static str> {
  PRIMITIVES.get(id as usize).map(|p| p.name)
}

pub fn primitive_arity(id: u32) -> Option<usize> {
  PRIMITIVES.get(id as usize).map(|p| p.arity)
}

/// Invokes primitive `id` with `args` already in evaluation order
/// (`args[0]` is the first operand pushed, not the top of stack).
pub fn call(id: u32, heap: &mut Heap, symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let def = PRIMITIVES.get(id as usize).ok_or_else(|| RuntimeError::new(RuntimeErrorKind::UndefinedVariable))?;
  if args.len() != def.arity {
    return Err(RuntimeError::new(RuntimeErrorKind::TypeError { op: def.name, expected: "exact arity", got: "wrong argument count" }));
  }
  (def.body)(heap, symbols, args)
}

/// `typeof`'s result is always one of a fixed set of type names; since a
/// symbol's id is a pure function of its spelling, minting one here with
/// a throwaway table yields the same id the caller's own table would
/// have produced for the same name.
fn prim_typeof(heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let v = args[0];
  let name = if v.is_nil() {
    "nil"
  } else if v.is_int() {
    "integer"
  } else if heap.is_pair(v) {
    "pair"
  } else if heap.is_tuple(v) {
    "tuple"
  } else if heap.is_binary(v) {
    "binary"
  } else {
    "symbol"
  };
  Ok(Value::symbol(SymbolTable::default().intern(name)))
}

fn format_size(heap: &Heap, value: Value) -> usize {
  if value.is_int() {
    let n = value.as_int();
    if (0..256).contains(&n) {
      return 1;
    }
    return 0;
  }
  if heap.is_binary(value) {
    return heap.obj_len(value) as usize;
  }
  if heap.is_pair(value) {
    return format_size(heap, heap.head(value)) + format_size(heap, heap.tail(value));
  }
  0
}

fn format_into(heap: &Heap, value: Value, out: &mut Vec<u8>) {
  if value.is_int() {
    let n = value.as_int();
    if (0..256).contains(&n) {
      out.push(n as u8);
    }
    return;
  }
  if heap.is_binary(value) {
    out.extend(heap.binary_data(value));
    return;
  }
  if heap.is_pair(value) {
    format_into(heap, heap.head(value), out);
    format_into(heap, heap.tail(value), out);
  }
}

/// Flattens a list of bytes and binaries (a `head`/`tail` chain) into one
/// binary, the way `format` is used to build output for `print`.
fn prim_format(heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let size = format_size(heap, args[0]);
  let mut bytes = Vec::with_capacity(size);
  format_into(heap, args[0], &mut bytes);
  Ok(heap.binary_from_bytes(&bytes))
}

fn prim_symbol_name(heap: &mut Heap, symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let v = args[0];
  if v.is_int() {
    return Err(RuntimeError::new(RuntimeErrorKind::TypeError { op: "symbol_name", expected: "symbol", got: "integer" }));
  }
  match symbols.name_of(v.as_symbol_id()) {
    Some(name) => Ok(heap.binary_from_bytes(name.as_bytes())),
    None => Ok(Value::NIL),
  }
}

fn val_hash(heap: &Heap, value: Value) -> u32 {
  if value.is_nil() {
    return 0;
  }
  if value.is_int() {
    return (value.as_int() as u32).wrapping_mul(0x9E37_79B1);
  }
  if heap.is_pair(value) {
    return val_hash(heap, heap.head(value)) ^ val_hash(heap, heap.tail(value)).rotate_left(13);
  }
  if heap.is_tuple(value) {
    let len = heap.obj_len(value);
    let mut hash = 0u32;
    for i in 0..len {
      hash ^= val_hash(heap, heap.tuple_get(value, i as i64).unwrap()).rotate_left(i);
    }
    return hash;
  }
  if heap.is_binary(value) {
    let mut hash = 0x811c_9dc5u32;
    for b in heap.binary_data(value) {
      hash ^= b as u32;
      hash = hash.wrapping_mul(0x0100_0193);
    }
    return hash;
  }
  value.as_symbol_id()
}

fn prim_hash(heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let h = val_hash(heap, args[0]);
  Ok(Value::int((h & 0x3FFF_FFFF) as i32))
}

fn prim_popcount(_heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  if !args[0].is_int() {
    return Err(RuntimeError::new(RuntimeErrorKind::TypeError { op: "popcount", expected: "integer", got: "non-integer" }));
  }
  Ok(Value::int(args[0].as_int().count_ones() as i32))
}

fn prim_max_int(_heap: &mut Heap, _symbols: &SymbolTable, _args: &[Value]) -> Result<Value, RuntimeError> {
  Ok(Value::int(core::value::MAX_INT))
}

fn prim_min_int(_heap: &mut Heap, _symbols: &SymbolTable, _args: &[Value]) -> Result<Value, RuntimeError> {
  Ok(Value::int(core::value::MIN_INT))
}

fn prim_time(_heap: &mut Heap, _symbols: &SymbolTable, _args: &[Value]) -> Result<Value, RuntimeError> {
  Ok(Value::int((get_time_millis() & 0x3FFF_FFFF) as i32))
}

/// Flattens a `head`/`tail` list into a tuple, walking it once to size the
/// tuple and again to fill it.
fn prim_make_tuple(heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let list = args[0];
  let mut len = 0u32;
  let mut cursor = list;
  while !cursor.is_nil() {
    if !heap.is_pair(cursor) {
      return Err(RuntimeError::new(RuntimeErrorKind::TypeError { op: "make_tuple", expected: "a list", got: "a non-pair tail" }));
    }
    len += 1;
    cursor = heap.tail(cursor);
  }
  let tuple = heap.tuple(len);
  let mut cursor = list;
  let mut i = 0i64;
  while !cursor.is_nil() {
    heap.tuple_set(tuple, i, heap.head(cursor))?;
    i += 1;
    cursor = heap.tail(cursor);
  }
  Ok(tuple)
}

thread_local! {
  /// xorshift32 state, seeded from the wall clock on first use. Not
  /// cryptographic: matches the original's own PRNG, a single mutable
  /// generator shared by `random`/`seed`, not a value-carrying argument.
  static RNG_STATE: Cell<u32> = Cell::new((get_time_millis() as u32) | 1);
}

fn xorshift32(state: u32) -> u32 {
  let mut x = state;
  x ^= x << 13;
  x ^= x >> 17;
  x ^= x << 5;
  x
}

fn prim_random(_heap: &mut Heap, _symbols: &SymbolTable, _args: &[Value]) -> Result<Value, RuntimeError> {
  let next = RNG_STATE.with(|s| {
    let n = xorshift32(s.get());
    s.set(n);
    n
  });
  Ok(Value::int((next & 0x3FFF_FFFF) as i32))
}

fn prim_seed(_heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  if !args[0].is_int() {
    return Err(RuntimeError::new(RuntimeErrorKind::TypeError { op: "seed", expected: "integer", got: "non-integer" }));
  }
  let seed = (args[0].as_int() as u32) | 1;
  RNG_STATE.with(|s| s.set(seed));
  Ok(Value::NIL)
}

/// Writes a value to stdout followed by a newline: an integer prints as
/// decimal digits, a binary prints its raw bytes, anything else prints its
/// debug form. This is the one primitive with an actual host side effect;
/// every other entry in this table is pure.
fn prim_print(heap: &mut Heap, _symbols: &SymbolTable, args: &[Value]) -> Result<Value, RuntimeError> {
  let v = args[0];
  let mut bytes = if v.is_int() {
    v.as_int().to_string().into_bytes()
  } else if heap.is_binary(v) {
    heap.binary_data(v)
  } else {
    format!("{v:?}").into_bytes()
  };
  bytes.push(b'\n');
  std::io::stdout().write_all(&bytes).map_err(|e| RuntimeError::new(RuntimeErrorKind::IOError(e.to_string())))?;
  Ok(Value::NIL)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn typeof_distinguishes_int_and_nil() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    let t_int = call(primitive_id("typeof").unwrap(), &mut heap, &symbols, &[Value::int(1)]).unwrap();
    let t_nil = call(primitive_id("typeof").unwrap(), &mut heap, &symbols, &[Value::NIL]).unwrap();
    assert_ne!(t_int, t_nil);
  }

  #[test]
  fn format_flattens_byte_list_into_binary() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    let list = heap.pair(Value::int(b'h' as i32), heap.pair(Value::int(b'i' as i32), Value::NIL));
    let bin = call(primitive_id("format").unwrap(), &mut heap, &symbols, &[list]).unwrap();
    assert_eq!(heap.binary_data(bin), b"hi");
  }

  #[test]
  fn hash_is_deterministic() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    let a = call(primitive_id("hash").unwrap(), &mut heap, &symbols, &[Value::int(42)]).unwrap();
    let b = call(primitive_id("hash").unwrap(), &mut heap, &symbols, &[Value::int(42)]).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn popcount_counts_set_bits() {
    let mut heap = Heap::new(16);
    let symbols = SymbolTable::default();
    let result = call(primitive_id("popcount").unwrap(), &mut heap, &symbols, &[Value::int(7)]).unwrap();
    assert_eq!(result.as_int(), 3);
  }

  #[test]
  fn unknown_primitive_id_is_an_error() {
    let mut heap = Heap::new(16);
    let symbols = SymbolTable::default();
    assert!(call(9999, &mut heap, &symbols, &[]).is_err());
  }

  #[test]
  fn wrong_arity_is_an_error() {
    let mut heap = Heap::new(16);
    let symbols = SymbolTable::default();
    assert!(call(primitive_id("time").unwrap(), &mut heap, &symbols, &[Value::int(1)]).is_err());
  }

  #[test]
  fn make_tuple_collects_a_list_in_order() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    let list = heap.pair(Value::int(1), heap.pair(Value::int(2), heap.pair(Value::int(3), Value::NIL)));
    let tuple = call(primitive_id("make_tuple").unwrap(), &mut heap, &symbols, &[list]).unwrap();
    assert_eq!(heap.obj_len(tuple), 3);
    assert_eq!(heap.tuple_get(tuple, 0).unwrap().as_int(), 1);
    assert_eq!(heap.tuple_get(tuple, 2).unwrap().as_int(), 3);
  }

  #[test]
  fn make_tuple_rejects_an_improper_list() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    assert!(call(primitive_id("make_tuple").unwrap(), &mut heap, &symbols, &[Value::int(5)]).is_err());
  }

  #[test]
  fn seed_makes_random_deterministic() {
    let mut heap = Heap::new(16);
    let symbols = SymbolTable::default();
    call(primitive_id("seed").unwrap(), &mut heap, &symbols, &[Value::int(7)]).unwrap();
    let a = call(primitive_id("random").unwrap(), &mut heap, &symbols, &[]).unwrap();
    call(primitive_id("seed").unwrap(), &mut heap, &symbols, &[Value::int(7)]).unwrap();
    let b = call(primitive_id("random").unwrap(), &mut heap, &symbols, &[]).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn print_accepts_an_integer_and_a_binary() {
    let mut heap = Heap::new(64);
    let symbols = SymbolTable::default();
    assert!(call(primitive_id("print").unwrap(), &mut heap, &symbols, &[Value::int(3)]).is_ok());
    let bin = heap.binary_from_bytes(b"hi");
    assert!(call(primitive_id("print").unwrap(), &mut heap, &symbols, &[bin]).is_ok());
  }
}
