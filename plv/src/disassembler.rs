//! Renders a linked `Program`'s bytecode as one line per instruction:
//! byte offset, mnemonic, decoded operand, and (where the source map has
//! an entry) the file and byte position the instruction came from.

use std::collections::HashMap;
use std::fmt::Write as _;

use core::opcode::OpCode;
use core::program::Program;
use core::utils::read_operand;
use core::value::Value;
use symbols::SymbolTable;

/// One line per instruction. `symbols` is used to print `const` operands
/// that happen to be symbol ids, and `trap` operands as primitive names,
/// by name instead of a bare integer. `file_names` maps the arbitrary
/// file ids a compile was invoked with back to a display path, the same
/// table the VM carries for stack traces.
pub fn disassemble(program: &Program, symbols: &SymbolTable, file_names: &HashMap<u32, String>) -> String {
  let mut out = String::new();
  let mut pc = 0usize;

  while pc < program.code.len() {
    let start = pc;
    let byte = program.code[pc];
    pc += 1;

    let op = match OpCode::try_from(byte) {
      Ok(op) => op,
      Err(bad) => {
        writeln!(out, "{start:>6}  <invalid opcode {bad:#04x}>").unwrap();
        continue;
      }
    };

    let operand = if op.has_operand() { Some(read_operand(&program.code, &mut pc)) } else { None };
    let annotation = annotate(op, operand, symbols);
    let location = match program.source_map.lookup(start as u32) {
      Some((file_id, pos)) => {
        let file = file_names.get(&file_id).map(String::as_str).unwrap_or("?");
        format!("  ; {file}@{pos}")
      }
      None => String::new(),
    };

    match operand {
      Some(n) => writeln!(out, "{start:>6}  {:<8}{n:<8}{annotation}{location}", op.name()).unwrap(),
      None => writeln!(out, "{start:>6}  {:<16}{annotation}{location}", op.name()).unwrap(),
    }
  }

  out
}

fn annotate(op: OpCode, operand: Option<i64>, symbols: &SymbolTable) -> String {
  match (op, operand) {
    (OpCode::Const, Some(raw)) => format!("{:?}", Value(raw as u32)),
    (OpCode::Trap, Some(id)) => primitives::primitive_name(id as u32).unwrap_or("?").to_string(),
    (OpCode::Push | OpCode::Pull, Some(r)) if r == core::opcode::REG_ENV as i64 => "env".to_string(),
    (OpCode::Push | OpCode::Pull, Some(r)) if r == core::opcode::REG_MOD as i64 => "mod".to_string(),
    _ => {
      let _ = symbols;
      String::new()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::utils::write_operand;

  fn program_with(code: Vec<u8>) -> Program {
    Program { code, strings: Vec::new(), source_map: Default::default() }
  }

  #[test]
  fn disassembles_a_const_and_a_halt() {
    let mut code = vec![OpCode::Const as u8];
    write_operand(Value::int(7).0 as i64, &mut code);
    code.push(OpCode::Halt as u8);

    let program = program_with(code);
    let symbols = SymbolTable::default();
    let out = disassemble(&program, &symbols, &HashMap::new());

    assert!(out.contains("const"));
    assert!(out.contains("Int(7)"));
    assert!(out.contains("halt"));
  }

  #[test]
  fn reports_an_invalid_opcode_byte() {
    let program = program_with(vec![0xFF]);
    let symbols = SymbolTable::default();
    let out = disassemble(&program, &symbols, &HashMap::new());
    assert!(out.contains("invalid opcode"));
  }
}
