//! Constant folding and dead-branch elimination, run once over a freshly
//! parsed tree before environment resolution. Folding only ever narrows
//! a node to `Const`; it never introduces a node kind the parser itself
//! wouldn't have produced.
//!
//! Alongside arithmetic/logical folding this also propagates `let`- and
//! top-level-bound constants through identifier references, using a
//! compile-time environment shaped exactly like the runtime frame chain
//! `env::resolve` builds afterwards: one scope per top-level/module body
//! (one slot per direct `Def`) and one per `let`/lambda. A slot holds
//! `Some(v)` when its value is statically known to be `v`, or `None` when
//! it's bound but not known (a lambda param, a non-constant binding).
//! Because scopes are filled in source order, a binding can only see the
//! constness of bindings that precede it — this is conservative but never
//! wrong: a binding simplify can't yet prove constant is just left alone.

use core::ast::{AstArena, NodeIdx, NodeKind};
use core::value::Value;
use std::collections::HashMap;

type Scope = HashMap<u32, Option<Value>>;

pub fn simplify(ast: &mut AstArena, node: NodeIdx) {
  let mut scopes: Vec<Scope> = Vec::new();
  simplify_scope(ast, node, &mut scopes);
}

/// Simplifies a top-level scope: the program root, or a module's body.
/// Mirrors `env::resolve_scope`'s frame shape — one slot per direct
/// `Def`, addressed in source order, with `import`s contributing no
/// slot — so constant propagation only ever sees bindings the later
/// address-resolution pass will also see.
fn simplify_scope(ast: &mut AstArena, scope: NodeIdx, scopes: &mut Vec<Scope>) {
  let children = ast.get(scope).children.clone();
  scopes.push(Scope::new());
  for &child in &children {
    match ast.get(child).kind {
      NodeKind::Def => {
        let value = ast.get(child).children[0];
        simplify_walk(ast, value, scopes);
        if let Some(name) = ast.get(child).attr {
          let known = const_value(ast, value);
          scopes.last_mut().unwrap().insert(name as u32, known);
        }
      }
      NodeKind::Import => {}
      _ => simplify_walk(ast, child, scopes),
    }
  }
  scopes.pop();
  fold(ast, scope);
}

fn simplify_walk(ast: &mut AstArena, node: NodeIdx, scopes: &mut Vec<Scope>) {
  match ast.get(node).kind {
    NodeKind::Id(name) => {
      if let Some(v) = lookup_const(scopes, name) {
        ast.replace(node, NodeKind::Const(v));
      }
      return;
    }

    NodeKind::Let => {
      let children = ast.get(node).children.clone();
      let count = children.len() - 1;
      let body = children[count];
      scopes.push(Scope::new());
      for &a in &children[..count] {
        let name_node = ast.get(a).children[0];
        let value = ast.get(a).children[1];
        simplify_walk(ast, value, scopes);
        if let NodeKind::Id(name) = ast.get(name_node).kind {
          let known = const_value(ast, value);
          scopes.last_mut().unwrap().insert(name, known);
        }
      }
      simplify_walk(ast, body, scopes);
      scopes.pop();
      return;
    }

    NodeKind::Lambda => {
      let children = ast.get(node).children.clone();
      let param_count = children.len() - 1;
      let body = children[param_count];
      scopes.push(Scope::new());
      for &p in &children[..param_count] {
        if let NodeKind::Id(name) = ast.get(p).kind {
          scopes.last_mut().unwrap().insert(name, None);
        }
      }
      simplify_walk(ast, body, scopes);
      scopes.pop();
      return;
    }

    // A module is a fresh top-level scope: it neither sees nor
    // contributes to the enclosing chain, matching `env::resolve`.
    NodeKind::Module => {
      let body = ast.get(node).children[0];
      let mut inner: Vec<Scope> = Vec::new();
      simplify_scope(ast, body, &mut inner);
      return;
    }

    _ => {}
  }

  let children = ast.get(node).children.clone();
  for &child in &children {
    simplify_walk(ast, child, scopes);
  }
  fold(ast, node);
}

fn lookup_const(scopes: &[Scope], name: u32) -> Option<Value> {
  for scope in scopes.iter().rev() {
    if let Some(&known) = scope.get(&name) {
      return known;
    }
  }
  None
}

fn const_value(ast: &AstArena, node: NodeIdx) -> Option<Value> {
  match ast.get(node).kind {
    NodeKind::Const(v) => Some(v),
    _ => None,
  }
}

fn fold(ast: &mut AstArena, node: NodeIdx) {
  match ast.get(node).kind {
    NodeKind::Neg => fold_unary(ast, node, |a| Value::int(-a)),
    NodeKind::Not => fold_unary(ast, node, |a| Value::from(a == 0)),
    NodeKind::Comp => fold_unary(ast, node, |a| Value::int(!a)),

    NodeKind::Add => fold_binary(ast, node, |a, b| Value::int(a.wrapping_add(b))),
    NodeKind::Sub => fold_binary(ast, node, |a, b| Value::int(a.wrapping_sub(b))),
    NodeKind::Mul => fold_binary(ast, node, |a, b| Value::int(a.wrapping_mul(b))),
    NodeKind::BitAnd => fold_binary(ast, node, |a, b| Value::int(a & b)),
    NodeKind::BitOr => fold_binary(ast, node, |a, b| Value::int(a | b)),
    NodeKind::Xor => fold_binary(ast, node, |a, b| Value::int(a ^ b)),
    NodeKind::Eq => fold_binary(ast, node, |a, b| Value::from(a == b)),
    NodeKind::Lt => fold_binary(ast, node, |a, b| Value::from(a < b)),
    NodeKind::Gt => fold_binary(ast, node, |a, b| Value::from(a > b)),
    // Division and modulo by a known-zero constant are left for the VM to
    // raise at run time rather than folded away here.
    NodeKind::Div => try_fold_binary(ast, node, |a, b| if b != 0 { Some(Value::int(a / b)) } else { None }),
    NodeKind::Rem => try_fold_binary(ast, node, |a, b| if b != 0 { Some(Value::int(a % b)) } else { None }),
    NodeKind::Shift => try_fold_binary(ast, node, |a, b| {
      let n = if b >= 0 { a.checked_shl(b as u32) } else { a.checked_shr((-b) as u32) };
      n.map(Value::int)
    }),

    NodeKind::And => fold_short_circuit(ast, node, false),
    NodeKind::Or => fold_short_circuit(ast, node, true),

    NodeKind::If => fold_if(ast, node),

    _ => {}
  }
}

fn const_int(ast: &AstArena, node: NodeIdx) -> Option<i32> {
  match ast.get(node).kind {
    NodeKind::Const(v) if v.is_int() => Some(v.as_int()),
    NodeKind::Const(v) if v.is_nil() => Some(0),
    _ => None,
  }
}

fn fold_unary(ast: &mut AstArena, node: NodeIdx, f: impl Fn(i32) -> Value) {
  let operand = ast.get(node).children[0];
  if let Some(a) = const_int(ast, operand) {
    ast.replace(node, NodeKind::Const(f(a)));
  }
}

fn fold_binary(ast: &mut AstArena, node: NodeIdx, f: impl Fn(i32, i32) -> Value) {
  try_fold_binary(ast, node, move |a, b| Some(f(a, b)));
}

fn try_fold_binary(ast: &mut AstArena, node: NodeIdx, f: impl Fn(i32, i32) -> Option<Value>) {
  let children = ast.get(node).children.clone();
  let (left, right) = (children[0], children[1]);
  if let (Some(a), Some(b)) = (const_int(ast, left), const_int(ast, right)) {
    if let Some(v) = f(a, b) {
      ast.replace(node, NodeKind::Const(v));
    }
  }
}

/// `and`/`or` only fold when the left operand is already constant: the
/// right operand keeps its side effects otherwise since it may not run.
fn fold_short_circuit(ast: &mut AstArena, node: NodeIdx, is_or: bool) {
  let children = ast.get(node).children.clone();
  let left = children[0];
  let right = children[1];
  if let NodeKind::Const(v) = ast.get(left).kind {
    if v.is_truthy() == is_or {
      let folded = ast.get(left).kind;
      ast.replace(node, folded);
    } else {
      // falls through to the right operand unconditionally
      let folded = ast.get(right).kind;
      let right_children = ast.get(right).children.clone();
      ast.get_mut(node).kind = folded;
      ast.get_mut(node).children = right_children;
    }
  }
}

fn fold_if(ast: &mut AstArena, node: NodeIdx) {
  let children = ast.get(node).children.clone();
  let (cond, then_branch, else_branch) = (children[0], children[1], children[2]);
  if let NodeKind::Const(v) = ast.get(cond).kind {
    let keep = if v.is_truthy() { then_branch } else { else_branch };
    let kept_kind = ast.get(keep).kind;
    let kept_children = ast.get(keep).children.clone();
    ast.get_mut(node).kind = kept_kind;
    ast.get_mut(node).children = kept_children;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::value::Value;

  fn leaf(ast: &mut AstArena, v: i32) -> NodeIdx {
    ast.push_leaf(NodeKind::Const(Value::int(v)), (0, 0))
  }

  #[test]
  fn folds_constant_arithmetic() {
    let mut ast = AstArena::new();
    let a = leaf(&mut ast, 2);
    let b = leaf(&mut ast, 3);
    let add = ast.push(NodeKind::Add, (0, 0), vec![a, b]);
    simplify(&mut ast, add);
    assert!(matches!(ast.get(add).kind, NodeKind::Const(v) if v.as_int() == 5));
  }

  #[test]
  fn leaves_division_by_zero_unfolded() {
    let mut ast = AstArena::new();
    let a = leaf(&mut ast, 1);
    let b = leaf(&mut ast, 0);
    let div = ast.push(NodeKind::Div, (0, 0), vec![a, b]);
    simplify(&mut ast, div);
    assert!(matches!(ast.get(div).kind, NodeKind::Div));
  }

  #[test]
  fn eliminates_dead_if_branch() {
    let mut ast = AstArena::new();
    let cond = leaf(&mut ast, 1);
    let then_v = leaf(&mut ast, 10);
    let then_branch = ast.push(NodeKind::Do, (0, 0), vec![then_v]);
    let else_v = leaf(&mut ast, 20);
    let else_branch = ast.push(NodeKind::Do, (0, 0), vec![else_v]);
    let if_node = ast.push(NodeKind::If, (0, 0), vec![cond, then_branch, else_branch]);
    simplify(&mut ast, if_node);
    assert!(matches!(ast.get(if_node).kind, NodeKind::Do));
    assert_eq!(ast.get(if_node).children, vec![then_v]);
  }

  #[test]
  fn short_circuits_or_with_truthy_left() {
    let mut ast = AstArena::new();
    let left = leaf(&mut ast, 1);
    let right = leaf(&mut ast, 0);
    let or_node = ast.push(NodeKind::Or, (0, 0), vec![left, right]);
    simplify(&mut ast, or_node);
    assert!(matches!(ast.get(or_node).kind, NodeKind::Const(v) if v.as_int() == 1));
  }

  fn id_leaf(ast: &mut AstArena, symbols: &mut symbols::SymbolTable, name: &str) -> NodeIdx {
    let n = symbols.intern(name);
    ast.push_leaf(NodeKind::Id(n), (0, 0))
  }

  #[test]
  fn propagates_a_let_bound_constant_through_an_identifier_reference() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let name_node = id_leaf(&mut ast, &mut symbols, "x");
    let value = leaf(&mut ast, 2);
    let assign = ast.push(NodeKind::Assign, (0, 0), vec![name_node, value]);

    let left = id_leaf(&mut ast, &mut symbols, "x");
    let right = leaf(&mut ast, 3);
    let add = ast.push(NodeKind::Add, (0, 0), vec![left, right]);
    let let_node = ast.push(NodeKind::Let, (0, 0), vec![assign, add]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![let_node]);

    simplify(&mut ast, root);
    assert!(matches!(ast.get(add).kind, NodeKind::Const(v) if v.as_int() == 5));
  }

  #[test]
  fn a_lambda_param_shadows_an_outer_constant_and_never_folds() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let outer_name = id_leaf(&mut ast, &mut symbols, "x");
    let outer_value = leaf(&mut ast, 2);
    let assign = ast.push(NodeKind::Assign, (0, 0), vec![outer_name, outer_value]);

    let param = id_leaf(&mut ast, &mut symbols, "x");
    let inner_ref = id_leaf(&mut ast, &mut symbols, "x");
    let lambda = ast.push(NodeKind::Lambda, (0, 0), vec![param, inner_ref]);
    let let_node = ast.push(NodeKind::Let, (0, 0), vec![assign, lambda]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![let_node]);

    simplify(&mut ast, root);
    assert!(matches!(ast.get(inner_ref).kind, NodeKind::Id(_)));
  }

  #[test]
  fn a_top_level_def_constant_propagates_to_a_later_reference() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let def_value = leaf(&mut ast, 7);
    let def = ast.push(NodeKind::Def, (0, 0), vec![def_value]);
    let def_name = symbols.intern("g");
    ast.set_attr(def, def_name as i64);

    let reference = id_leaf(&mut ast, &mut symbols, "g");
    let one = leaf(&mut ast, 1);
    let add = ast.push(NodeKind::Add, (0, 0), vec![reference, one]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![def, add]);

    simplify(&mut ast, root);
    assert!(matches!(ast.get(add).kind, NodeKind::Const(v) if v.as_int() == 8));
  }

  #[test]
  fn a_module_body_does_not_see_the_enclosing_constant() {
    let mut ast = AstArena::new();
    let mut symbols = symbols::SymbolTable::default();
    let outer_name = id_leaf(&mut ast, &mut symbols, "x");
    let outer_value = leaf(&mut ast, 2);
    let assign = ast.push(NodeKind::Assign, (0, 0), vec![outer_name, outer_value]);

    let unresolved_ref = id_leaf(&mut ast, &mut symbols, "x");
    let module_body = ast.push(NodeKind::Do, (0, 0), vec![unresolved_ref]);
    let module = ast.push(NodeKind::Module, (0, 0), vec![module_body]);
    let module_name = symbols.intern("M");
    ast.set_attr(module, module_name as i64);

    let let_node = ast.push(NodeKind::Let, (0, 0), vec![assign, module]);
    let root = ast.push(NodeKind::Do, (0, 0), vec![let_node]);

    simplify(&mut ast, root);
    assert!(matches!(ast.get(unresolved_ref).kind, NodeKind::Id(_)));
  }
}
