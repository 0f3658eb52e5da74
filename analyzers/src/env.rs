//! Assigns every lexical reference a flat address into the runtime's
//! environment chain, and rewrites module-qualified access (`M.field`)
//! into a direct export reference the compiler hands off to the linker.
//!
//! The runtime environment is a chain of frames, one frame per `let`,
//! per lambda call, and one for a module's (or the program's) top-level
//! bindings; each frame is one tuple. A `lookup n` walks the chain from
//! the innermost frame outward, subtracting each frame's length from `n`
//! until it lands inside the frame that owns it. The addresses computed
//! here mirror that walk exactly: `n` is the target's local slot plus
//! the combined size of every frame between the reference and the
//! frame that binds it.

use core::ast::{AstArena, NodeIdx, NodeKind};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct FrameInfo {
  pub size: usize,
  pub slot_of: HashMap<u32, u32>,
}

#[derive(Debug, Default)]
pub struct Analysis {
  /// Keyed by the node that owns the frame: the program root, a
  /// `Module`'s body, a `Let`, or a `Lambda`.
  pub frames: HashMap<NodeIdx, FrameInfo>,
}

struct Ctx {
  /// Frame-owning nodes from innermost to outermost.
  chain: Vec<NodeIdx>,
  /// Names bound by an `import` visible in the current module/program.
  imports: HashSet<u32>,
}

pub fn resolve(ast: &mut AstArena, root: NodeIdx) -> Analysis {
  let mut analysis = Analysis::default();
  let mut ctx = Ctx { chain: Vec::new(), imports: HashSet::new() };
  resolve_scope(ast, root, &mut ctx, &mut analysis);
  analysis
}

/// Resolves a top-level scope: the program root, or a module's body.
/// Its frame holds one slot per direct `Def`, addressed in source order;
/// plain statements and `import`s contribute no slot but are still
/// walked for nested references.
fn resolve_scope(ast: &mut AstArena, scope: NodeIdx, ctx: &mut Ctx, analysis: &mut Analysis) {
  let children = ast.get(scope).children.clone();
  let mut slot_of = HashMap::new();
  let mut next = 0u32;
  for &child in &children {
    match ast.get(child).kind {
      NodeKind::Def => {
        if let Some(name) = ast.get(child).attr {
          slot_of.entry(name as u32).or_insert_with(|| {
            let s = next;
            next += 1;
            s
          });
        }
      }
      NodeKind::Import => {
        if let Some(name) = ast.get(child).attr {
          ctx.imports.insert(name as u32);
        }
      }
      _ => {}
    }
  }
  analysis.frames.insert(scope, FrameInfo { size: next as usize, slot_of });

  ctx.chain.push(scope);
  for &child in &children {
    match ast.get(child).kind {
      NodeKind::Def => {
        let value = ast.get(child).children[0];
        walk(ast, value, ctx, analysis);
      }
      NodeKind::Import => {}
      _ => walk(ast, child, ctx, analysis),
    }
  }
  ctx.chain.pop();
}

fn walk(ast: &mut AstArena, node: NodeIdx, ctx: &mut Ctx, analysis: &mut Analysis) {
  match ast.get(node).kind {
    NodeKind::Id(name) => {
      if let Some(addr) = resolve_address(&ctx.chain, name, analysis) {
        ast.set_attr(node, addr as i64);
      }
    }

    NodeKind::Let => {
      let children = ast.get(node).children.clone();
      let count = children.len() - 1;
      let body = children[count];
      let mut slot_of = HashMap::new();
      for (i, &a) in children[..count].iter().enumerate() {
        let name_node = ast.get(a).children[0];
        if let NodeKind::Id(name) = ast.get(name_node).kind {
          slot_of.insert(name, i as u32);
        }
      }
      analysis.frames.insert(node, FrameInfo { size: count, slot_of });
      ast.set_attr(node, count as i64);

      ctx.chain.push(node);
      for (i, &a) in children[..count].iter().enumerate() {
        ast.set_attr(a, i as i64);
        let value = ast.get(a).children[1];
        walk(ast, value, ctx, analysis);
      }
      walk(ast, body, ctx, analysis);
      ctx.chain.pop();
    }

    NodeKind::Lambda => {
      let children = ast.get(node).children.clone();
      let param_count = children.len() - 1;
      let body = children[param_count];
      let mut slot_of = HashMap::new();
      for (i, &p) in children[..param_count].iter().enumerate() {
        if let NodeKind::Id(name) = ast.get(p).kind {
          slot_of.insert(name, i as u32);
        }
      }
      analysis.frames.insert(node, FrameInfo { size: param_count, slot_of });

      ctx.chain.push(node);
      walk(ast, body, ctx, analysis);
      ctx.chain.pop();
    }

    // A module is a fresh top-level scope: it neither sees nor
    // contributes to the enclosing chain.
    NodeKind::Module => {
      let body = ast.get(node).children[0];
      let mut inner = Ctx { chain: Vec::new(), imports: HashSet::new() };
      resolve_scope(ast, body, &mut inner, analysis);
    }

    NodeKind::Access => {
      let base = ast.get(node).children[0];
      let field = ast.get(node).attr.expect("access always carries a field symbol") as u32;
      if let NodeKind::Id(name) = ast.get(base).kind {
        if ctx.imports.contains(&name) {
          ast.replace(node, NodeKind::Ref(field));
          return;
        }
      }
      walk(ast, base, ctx, analysis);
    }

    NodeKind::Import => {}

    _ => {
      let children = ast.get(node).children.clone();
      for child in children {
        walk(ast, child, ctx, analysis);
      }
    }
  }
}

fn resolve_address(chain: &[NodeIdx], name: u32, analysis: &Analysis) -> Option<u32> {
  let mut offset = 0u32;
  for &frame_node in chain.iter().rev() {
    let frame = &analysis.frames[&frame_node];
    if let Some(&local) = frame.slot_of.get(&name) {
      return Some(offset + local);
    }
    offset += frame.size as u32;
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::value::Value;

  fn id_leaf(ast: &mut AstArena, symbols: &mut symbols::SymbolTable, name: &str) -> NodeIdx {
    let n = symbols.intern(name);
    ast.push_leaf(NodeKind::Id(n), (0, 0))
  }

  #[test]
  fn resolves_lambda_param_to_slot_zero() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let param = id_leaf(&mut ast, &mut symbols, "x");
    let body = id_leaf(&mut ast, &mut symbols, "x");
    let lambda = ast.push(NodeKind::Lambda, (0, 0), vec![param, body]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![lambda]);

    resolve(&mut ast, root);
    assert_eq!(ast.get(body).attr, Some(0));
  }

  #[test]
  fn addresses_outer_let_binding_across_a_nested_lambda_frame() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let name_node = id_leaf(&mut ast, &mut symbols, "y");
    let value = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 0));
    let assign = ast.push(NodeKind::Assign, (0, 0), vec![name_node, value]);

    let param = id_leaf(&mut ast, &mut symbols, "x");
    let inner_ref = id_leaf(&mut ast, &mut symbols, "y");
    let lambda = ast.push(NodeKind::Lambda, (0, 0), vec![param, inner_ref]);
    let let_body = ast.push(NodeKind::Let, (0, 0), vec![assign, lambda]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![let_body]);

    resolve(&mut ast, root);
    // one slot in the lambda's own frame (the param) precedes `y`'s frame
    assert_eq!(ast.get(inner_ref).attr, Some(1));
  }

  #[test]
  fn top_level_def_is_addressable_like_any_frame_slot() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let def_value = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 0));
    let def = ast.push(NodeKind::Def, (0, 0), vec![def_value]);
    let def_name = symbols.intern("g");
    ast.set_attr(def, def_name as i64);

    let reference = id_leaf(&mut ast, &mut symbols, "g");
    let lambda = ast.push(NodeKind::Lambda, (0, 0), vec![reference]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![def, lambda]);

    resolve(&mut ast, root);
    assert_eq!(ast.get(reference).attr, Some(0));
  }

  #[test]
  fn module_qualified_access_becomes_a_ref_node() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let import_name = symbols.intern("M");
    let import = ast.push_leaf(NodeKind::Import, (0, 0));
    ast.set_attr(import, import_name as i64);

    let base = id_leaf(&mut ast, &mut symbols, "M");
    let field_name = symbols.intern("inc");
    let access = ast.push(NodeKind::Access, (0, 0), vec![base]);
    ast.set_attr(access, field_name as i64);

    let root = ast.push(NodeKind::Do, (0, 0), vec![import, access]);
    resolve(&mut ast, root);

    assert!(matches!(ast.get(access).kind, NodeKind::Ref(n) if n == field_name));
  }

  #[test]
  fn module_body_does_not_inherit_the_enclosing_frame() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let outer_name = id_leaf(&mut ast, &mut symbols, "x");
    let outer_value = ast.push_leaf(NodeKind::Const(Value::int(1)), (0, 0));
    let outer_assign = ast.push(NodeKind::Assign, (0, 0), vec![outer_name, outer_value]);

    let unresolved_ref = id_leaf(&mut ast, &mut symbols, "x");
    let module_body = ast.push(NodeKind::Do, (0, 0), vec![unresolved_ref]);
    let module = ast.push(NodeKind::Module, (0, 0), vec![module_body]);
    let module_name = symbols.intern("M");
    ast.set_attr(module, module_name as i64);

    let let_body = ast.push(NodeKind::Let, (0, 0), vec![outer_assign, module]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![let_body]);

    resolve(&mut ast, root);
    assert!(ast.get(unresolved_ref).attr.is_none());
  }
}
