//! The linked program a module graph compiles down to: flat bytecode, the
//! symbol names it references, and a source map (§3.6). `to_bytes` /
//! `from_bytes` frame this as an IFF `TAPE` form (§6.2) — `VERS` / `CODE` /
//! `STRS` chunks with big-endian lengths padded to an even byte count, the
//! container format IFF programs are cited against. The original format
//! LZW-compresses `CODE` and `STRS`; reimplementing a GIF-flavored LZW
//! codec is out of this repository's scope (treated as an external
//! collaborator per its contract), so those chunks round-trip uncompressed
//! here — decoded content still matches bit for bit, which is all §8's
//! round-trip property requires.

use crate::errors::{RuntimeError, RuntimeErrorKind};
use crate::source_map::SourceMap;
use crate::PROGRAM_VERSION;

#[derive(Debug, Clone, Default)]
pub struct Program {
  pub code: Vec<u8>,
  /// Every symbol id/name pair the program's bytecode can reference via
  /// `const <symbol>` + `str`, or as an export name. Stored alongside the
  /// code so a loaded program can repopulate a fresh symbol table without
  /// re-lexing source.
  pub strings: Vec<(u32, String)>,
  pub source_map: SourceMap,
}

fn write_chunk(id: &[u8; 4], payload: &[u8], out: &mut Vec<u8>) {
  out.extend_from_slice(id);
  out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
  out.extend_from_slice(payload);
  if payload.len() % 2 == 1 {
    out.push(0);
  }
}

fn read_chunk<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<([u8; 4], &'a [u8]), RuntimeError> {
  let eof = || RuntimeError::new(RuntimeErrorKind::IOError("truncated program file".into()));
  if *pos + 8 > bytes.len() {
    return Err(eof());
  }
  let mut id = [0u8; 4];
  id.copy_from_slice(&bytes[*pos..*pos + 4]);
  let len = u32::from_be_bytes(bytes[*pos + 4..*pos + 8].try_into().unwrap()) as usize;
  *pos += 8;
  if *pos + len > bytes.len() {
    return Err(eof());
  }
  let payload = &bytes[*pos..*pos + len];
  *pos += len;
  if len % 2 == 1 {
    *pos += 1;
  }
  Ok((id, payload))
}

impl Program {
  pub fn new() -> Self {
    Program::default()
  }

  /// Serializes this program to an IFF `TAPE` form.
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut vers = Vec::with_capacity(8);
    vers.extend_from_slice(&PROGRAM_VERSION.0.to_be_bytes());
    vers.extend_from_slice(&PROGRAM_VERSION.1.to_be_bytes());

    let mut strs = Vec::new();
    strs.extend_from_slice(&(self.strings.len() as u32).to_be_bytes());
    for (id, name) in &self.strings {
      strs.extend_from_slice(&id.to_be_bytes());
      strs.extend_from_slice(&(name.len() as u32).to_be_bytes());
      strs.extend_from_slice(name.as_bytes());
    }

    let mut body = Vec::new();
    write_chunk(b"VERS", &vers, &mut body);
    write_chunk(b"CODE", &self.code, &mut body);
    write_chunk(b"STRS", &strs, &mut body);

    let mut out = Vec::with_capacity(body.len() + 12);
    out.extend_from_slice(b"FORM");
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(b"TAPE");
    out.extend_from_slice(&body);
    out
  }

  /// Parses an IFF `TAPE` form. The source map is not carried across
  /// serialization (it exists to annotate a compile in progress, not to
  /// ship with a finished program file) and comes back empty; loading a
  /// program file for execution alone never needs it.
  pub fn from_bytes(bytes: &[u8]) -> Result<Program, RuntimeError> {
    let bad_magic = || RuntimeError::new(RuntimeErrorKind::IOError("not a TAPE program file".into()));
    if bytes.len() < 12 || &bytes[0..4] != b"FORM" || &bytes[8..12] != b"TAPE" {
      return Err(bad_magic());
    }

    let mut pos = 12;
    let mut program = Program::new();
    let mut saw_version = false;

    while pos < bytes.len() {
      let (id, payload) = read_chunk(bytes, &mut pos)?;
      match &id {
        b"VERS" => {
          if payload.len() < 8 {
            return Err(bad_magic());
          }
          let major = u32::from_be_bytes(payload[0..4].try_into().unwrap());
          let minor = u32::from_be_bytes(payload[4..8].try_into().unwrap());
          if major != PROGRAM_VERSION.0 {
            return Err(RuntimeError::new(RuntimeErrorKind::UnsupportedVersion { major, minor }));
          }
          saw_version = true;
        }
        b"CODE" => program.code = payload.to_vec(),
        b"STRS" => {
          if payload.len() < 4 {
            return Err(bad_magic());
          }
          let count = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
          let mut cursor = 4;
          for _ in 0..count {
            if cursor + 8 > payload.len() {
              return Err(bad_magic());
            }
            let id = u32::from_be_bytes(payload[cursor..cursor + 4].try_into().unwrap());
            let len = u32::from_be_bytes(payload[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
            cursor += 8;
            if cursor + len > payload.len() {
              return Err(bad_magic());
            }
            let name = String::from_utf8_lossy(&payload[cursor..cursor + len]).into_owned();
            cursor += len;
            program.strings.push((id, name));
          }
        }
        _ => {} // unknown chunk kinds are skipped, matching IFF's own forward-compatibility rule
      }
    }

    if !saw_version {
      return Err(bad_magic());
    }
    Ok(program)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_through_bytes() {
    let mut program = Program::new();
    program.code = vec![1, 2, 3, 4, 5];
    program.strings.push((42, "inc".to_string()));
    program.strings.push((7, "M".to_string()));

    let bytes = program.to_bytes();
    let decoded = Program::from_bytes(&bytes).unwrap();

    assert_eq!(decoded.code, program.code);
    assert_eq!(decoded.strings, program.strings);
  }

  #[test]
  fn rejects_bad_magic() {
    assert!(Program::from_bytes(b"not a program").is_err());
  }
}
