use std::collections::HashMap;

/// Default bit width for symbol ids, matching the runtime's 32-bit value
/// words. `intern` masks the hash down to this many low bits.
pub const DEFAULT_BITS: u32 = 32;

/// FNV-1a, chosen because it is a fixed, unseeded hash: two processes
/// (or two runs of the same process) intern the same name to the same id,
/// which `intern`'s determinism contract requires. `std`'s `HashMap`
/// hasher is randomly seeded per-process and cannot be used here.
fn fnv1a(bytes: &[u8]) -> u32 {
  const OFFSET_BASIS: u32 = 0x811c_9dc5;
  const PRIME: u32 = 0x0100_0193;
  let mut hash = OFFSET_BASIS;
  for &b in bytes {
    hash ^= b as u32;
    hash = hash.wrapping_mul(PRIME);
  }
  hash
}

/// Process-wide, append-only table mapping interned names to 32-bit ids
/// and back. Names are never removed: the garbage collector must not
/// reclaim them, since a live `Value` may be a symbol whose only record
/// of its spelling is this table.
pub struct SymbolTable {
  mask: u32,
  names: HashMap<u32, Box<str>>,
}

impl SymbolTable {
  /// Creates a table whose ids are masked to `bits` low bits (default 32).
  pub fn new(bits: u32) -> Self {
    let bits = bits.min(32);
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    SymbolTable { mask, names: HashMap::new() }
  }

  fn id_of(&self, name: &str) -> u32 {
    fnv1a(name.as_bytes()) & self.mask
  }

  /// Interns `name`, returning its id. Idempotent: repeated calls with the
  /// same name return the same id, since the id is a pure function of the
  /// name and the table's bit width.
  ///
  /// If a different name already occupies this id, that earlier name wins
  /// and stays the one `name_of` reports; the collision is silently
  /// accepted rather than rejected, matching the original's
  /// insertion-order semantics.
  pub fn intern(&mut self, name: &str) -> u32 {
    let id = self.id_of(name);
    self.names.entry(id).or_insert_with(|| name.into());
    id
  }

  /// Looks up the name registered for `id`, or `None` if no `intern` call
  /// ever produced this id.
  pub fn name_of(&self, id: u32) -> Option<&str> {
    self.names.get(&id).map(|s| s.as_ref())
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

impl Default for SymbolTable {
  fn default() -> Self {
    Self::new(DEFAULT_BITS)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intern_is_idempotent() {
    let mut table = SymbolTable::default();
    let a = table.intern("foo");
    let b = table.intern("foo");
    assert_eq!(a, b);
  }

  #[test]
  fn intern_is_deterministic_across_tables() {
    let mut t1 = SymbolTable::default();
    let mut t2 = SymbolTable::default();
    assert_eq!(t1.intern("bar"), t2.intern("bar"));
  }

  #[test]
  fn name_of_round_trips() {
    let mut table = SymbolTable::default();
    let id = table.intern("inc");
    assert_eq!(table.name_of(id), Some("inc"));
  }

  #[test]
  fn unknown_id_resolves_to_none() {
    let table = SymbolTable::default();
    assert_eq!(table.name_of(0xdead_beef & table.mask), None);
  }

  #[test]
  fn collision_keeps_first_registrant() {
    // Force a collision by using a 1-bit table: every name maps to id 0 or 1.
    let mut table = SymbolTable::new(1);
    let first = table.intern("alpha");
    let second = table.intern("beta");
    if first == second {
      assert_eq!(table.name_of(first), Some("alpha"));
    }
  }
}
