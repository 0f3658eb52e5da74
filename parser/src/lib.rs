//! A PEG parser over the lexed token stream: ordered choice between
//! alternative productions is implemented as ordinary backtracking (save
//! a position, try a production, restore on failure), since every
//! alternative here is tried at token granularity rather than a
//! character one. Failure is tracked at the farthest position reached by
//! any attempted production, not just the one that finally failed, so a
//! deeply backtracked expression still reports its error at the most
//! informative point.

use core::ast::{AstArena, NodeIdx, NodeKind};
use core::errors::{LocatedError, ParseErrorKind};
use core::tokens::{TokenIdx, TokenKind, TokenList};
use core::value::Value;
use symbols::SymbolTable;

pub type ParseError = LocatedError<ParseErrorKind>;
pub type PResult<T> = Result<T, ParseError>;

pub struct Parser<'a> {
  tokens: &'a TokenList<'a>,
  pos: usize,
  farthest: usize,
  ast: AstArena,
  symbols: &'a mut SymbolTable,
}

impl<'a> Parser<'a> {
  pub fn parse(tokens: &'a TokenList<'a>, symbols: &'a mut SymbolTable) -> PResult<(AstArena, NodeIdx)> {
    let mut parser = Parser { tokens, pos: 0, farthest: 0, ast: AstArena::new(), symbols };
    parser.skip_newlines();
    let root = parser.program()?;
    parser.skip_newlines();
    if !parser.at_eof() {
      return Err(parser.fail("end of file"));
    }
    Ok((parser.ast, root))
  }

  // ---- token stream primitives -------------------------------------------

  fn peek(&self) -> &TokenKind {
    &self.tokens[self.pos].kind
  }

  fn peek_at(&self, offset: usize) -> &TokenKind {
    let idx = (self.pos + offset).min(self.tokens.tokens.len() - 1);
    &self.tokens[idx].kind
  }

  fn at_eof(&self) -> bool {
    matches!(self.peek(), TokenKind::Eof)
  }

  fn advance(&mut self) -> TokenIdx {
    let idx = self.pos;
    if !self.at_eof() {
      self.pos += 1;
    }
    if self.pos > self.farthest {
      self.farthest = self.pos;
    }
    idx
  }

  fn check(&self, kind: &TokenKind) -> bool {
    self.peek().type_match(kind)
  }

  fn matches(&mut self, kind: &TokenKind) -> bool {
    if self.check(kind) {
      self.advance();
      true
    } else {
      false
    }
  }

  fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<TokenIdx> {
    if self.check(&kind) {
      Ok(self.advance())
    } else {
      Err(self.fail(what))
    }
  }

  fn skip_newlines(&mut self) {
    while self.check(&TokenKind::Newline) {
      self.advance();
    }
  }

  fn mark(&self) -> usize {
    self.pos
  }

  fn reset(&mut self, mark: usize) {
    self.pos = mark;
  }

  fn span_from(&self, start: TokenIdx) -> (u32, u32) {
    let s = self.tokens[start].span.0 as u32;
    let last = self.pos.saturating_sub(1).max(start);
    let e = self.tokens[last].span.1 as u32;
    (s, e)
  }

  /// Span of a binary node: starts where its left operand started, ends
  /// at the token just consumed for its right operand.
  fn span_join(&self, left: NodeIdx) -> (u32, u32) {
    let s = self.ast.get(left).span.0;
    let last = self.pos.saturating_sub(1);
    let e = self.tokens[last].span.1 as u32;
    (s, e)
  }

  fn fail(&mut self, expected: &str) -> ParseError {
    let farthest = self.farthest.max(self.pos);
    let idx = farthest.min(self.tokens.tokens.len() - 1);
    let tok = &self.tokens[idx];
    ParseError {
      kind: ParseErrorKind::UnexpectedToken { expected: expected.to_string(), found: format!("{:?}", tok.kind) },
      file: self.tokens.filepath.to_string_lossy().into_owned(),
      line: tok.line_num,
      source_pos: tok.span.0 as u32,
    }
  }

  fn intern(&mut self, name: &str) -> u32 {
    self.symbols.intern(name)
  }

  fn lexeme(&self, idx: TokenIdx) -> String {
    self.tokens.lexeme(idx)
  }

  // ---- top level -----------------------------------------------------------

  fn program(&mut self) -> PResult<NodeIdx> {
    let start = self.pos;
    let mut forms = Vec::new();
    loop {
      self.skip_newlines();
      if self.at_eof() {
        break;
      }
      forms.push(self.top_form()?);
      self.skip_newlines();
    }
    Ok(self.ast.push(NodeKind::Do, self.span_from(start), forms))
  }

  fn top_form(&mut self) -> PResult<NodeIdx> {
    if self.check(&TokenKind::Module) {
      return self.module_def();
    }
    if self.check(&TokenKind::Import) {
      return self.import_stmt();
    }
    self.statement()
  }

  fn module_def(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // 'module'
    let name_tok = self.expect(TokenKind::Ident, "a module name")?;
    let name = self.intern(&self.lexeme(name_tok));
    self.skip_newlines();
    let body = self.block_until(&[TokenKind::End])?;
    self.expect(TokenKind::End, "`end`")?;
    let idx = self.ast.push(NodeKind::Module, self.span_from(start), vec![body]);
    self.ast.set_attr(idx, name as i64);
    Ok(idx)
  }

  fn import_stmt(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // 'import'
    let name_tok = self.expect(TokenKind::Ident, "a module name")?;
    let name = self.intern(&self.lexeme(name_tok));
    let idx = self.ast.push_leaf(NodeKind::Import, self.span_from(start));
    self.ast.set_attr(idx, name as i64);
    Ok(idx)
  }

  /// Parses statements until one of `terminators` is current, wrapping
  /// them in a `do` node.
  fn block_until(&mut self, terminators: &[TokenKind]) -> PResult<NodeIdx> {
    let start = self.pos;
    let mut forms = Vec::new();
    loop {
      self.skip_newlines();
      if self.at_eof() || terminators.iter().any(|t| self.check(t)) {
        break;
      }
      forms.push(self.statement()?);
      self.skip_newlines();
    }
    Ok(self.ast.push(NodeKind::Do, self.span_from(start), forms))
  }

  fn statement(&mut self) -> PResult<NodeIdx> {
    if self.check(&TokenKind::Let) && self.peek_is_top_level_def() {
      return self.def_stmt();
    }
    self.expr()
  }

  /// Distinguishes a top-level `let name = value` binding from a
  /// `let name = value in body` expression: both start the same way, so
  /// this looks two tokens ahead for `Ident Equal` without consuming.
  fn peek_is_top_level_def(&self) -> bool {
    matches!(self.peek_at(1), TokenKind::Ident) && matches!(self.peek_at(2), TokenKind::Equal)
  }

  fn def_stmt(&mut self) -> PResult<NodeIdx> {
    let mark = self.mark();
    let start = self.advance(); // 'let'
    let name_tok = self.expect(TokenKind::Ident, "a binding name")?;
    self.expect(TokenKind::Equal, "`=`")?;
    let value = self.or_expr()?;
    if self.check(&TokenKind::In) {
      // actually a let-expression; back off and reparse as one
      self.reset(mark);
      return self.expr();
    }
    let name = self.intern(&self.lexeme(name_tok));
    let idx = self.ast.push(NodeKind::Def, self.span_from(start), vec![value]);
    self.ast.set_attr(idx, name as i64);
    Ok(idx)
  }

  // ---- expressions, lowest to highest precedence ----------------------------

  fn expr(&mut self) -> PResult<NodeIdx> {
    if self.check(&TokenKind::Let) {
      return self.let_expr();
    }
    self.or_expr()
  }

  fn let_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // 'let'
    let name_tok = self.expect(TokenKind::Ident, "a binding name")?;
    let name = self.intern(&self.lexeme(name_tok));
    let name_node = self.ast.push_leaf(NodeKind::Id(name), self.span_from(start));
    self.expect(TokenKind::Equal, "`=`")?;
    let value = self.or_expr()?;
    self.expect(TokenKind::In, "`in`")?;
    let body = self.expr()?;
    let assign = self.ast.push(NodeKind::Assign, self.span_from(start), vec![name_node, value]);
    let idx = self.ast.push(NodeKind::Let, self.span_from(start), vec![assign, body]);
    self.ast.set_attr(idx, 1);
    Ok(idx)
  }

  fn or_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.and_expr()?;
    while self.matches(&TokenKind::Or) {
      let right = self.and_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::Or, span, vec![left, right]);
    }
    Ok(left)
  }

  fn and_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.eq_expr()?;
    while self.matches(&TokenKind::And) {
      let right = self.eq_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::And, span, vec![left, right]);
    }
    Ok(left)
  }

  fn eq_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.rel_expr()?;
    while self.matches(&TokenKind::EqEq) {
      let right = self.rel_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::Eq, span, vec![left, right]);
    }
    Ok(left)
  }

  fn rel_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.concat_expr()?;
    loop {
      if self.matches(&TokenKind::Lt) {
        let right = self.concat_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Lt, span, vec![left, right]);
      } else if self.matches(&TokenKind::Gt) {
        let right = self.concat_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Gt, span, vec![left, right]);
      } else {
        break;
      }
    }
    Ok(left)
  }

  fn concat_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.cons_expr()?;
    while self.matches(&TokenKind::Concat) {
      let right = self.cons_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::Join, span, vec![left, right]);
    }
    Ok(left)
  }

  /// `::` is right-associative: `a :: b :: c` builds `a :: (b :: c)`.
  fn cons_expr(&mut self) -> PResult<NodeIdx> {
    let left = self.bitor_expr()?;
    if self.matches(&TokenKind::ColonColon) {
      let right = self.cons_expr()?;
      let span = self.span_join(left);
      return Ok(self.ast.push(NodeKind::Pair, span, vec![left, right]));
    }
    Ok(left)
  }

  fn bitor_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.bitxor_expr()?;
    while self.matches(&TokenKind::Pipe) {
      let right = self.bitxor_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::BitOr, span, vec![left, right]);
    }
    Ok(left)
  }

  fn bitxor_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.bitand_expr()?;
    while self.matches(&TokenKind::Caret) {
      let right = self.bitand_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::Xor, span, vec![left, right]);
    }
    Ok(left)
  }

  fn bitand_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.add_expr()?;
    while self.matches(&TokenKind::Amp) {
      let right = self.add_expr()?;
      let span = self.span_join(left);
      left = self.ast.push(NodeKind::BitAnd, span, vec![left, right]);
    }
    Ok(left)
  }

  fn add_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.mul_expr()?;
    loop {
      if self.matches(&TokenKind::Plus) {
        let right = self.mul_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Add, span, vec![left, right]);
      } else if self.matches(&TokenKind::Minus) {
        let right = self.mul_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Sub, span, vec![left, right]);
      } else {
        break;
      }
    }
    Ok(left)
  }

  fn mul_expr(&mut self) -> PResult<NodeIdx> {
    let mut left = self.unary_expr()?;
    loop {
      if self.matches(&TokenKind::Star) {
        let right = self.unary_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Mul, span, vec![left, right]);
      } else if self.matches(&TokenKind::Slash) {
        let right = self.unary_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Div, span, vec![left, right]);
      } else if self.matches(&TokenKind::Percent) {
        let right = self.unary_expr()?;
        let span = self.span_join(left);
        left = self.ast.push(NodeKind::Rem, span, vec![left, right]);
      } else {
        break;
      }
    }
    Ok(left)
  }

  fn unary_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.pos;
    if self.matches(&TokenKind::Minus) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Neg, self.span_from(start), vec![operand]));
    }
    if self.matches(&TokenKind::Not) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Not, self.span_from(start), vec![operand]));
    }
    if self.matches(&TokenKind::Head) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Head, self.span_from(start), vec![operand]));
    }
    if self.matches(&TokenKind::Tail) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Tail, self.span_from(start), vec![operand]));
    }
    if self.matches(&TokenKind::Len) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Len, self.span_from(start), vec![operand]));
    }
    if self.matches(&TokenKind::Tilde) {
      let operand = self.unary_expr()?;
      return Ok(self.ast.push(NodeKind::Comp, self.span_from(start), vec![operand]));
    }
    self.postfix_expr()
  }

  fn postfix_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.pos;
    let mut node = self.primary_expr()?;
    loop {
      if self.matches(&TokenKind::LParen) {
        let args = self.arg_list()?;
        self.expect(TokenKind::RParen, "`)`")?;
        node = self.reduce_call(node, args, start);
      } else if self.matches(&TokenKind::Dot) {
        let field_tok = self.expect(TokenKind::Ident, "a field name")?;
        let field = self.intern(&self.lexeme(field_tok));
        let idx = self.ast.push(NodeKind::Access, self.span_from(start), vec![node]);
        self.ast.set_attr(idx, field as i64);
        node = idx;
      } else {
        break;
      }
    }
    Ok(node)
  }

  fn arg_list(&mut self) -> PResult<Vec<NodeIdx>> {
    let mut args = Vec::new();
    if self.check(&TokenKind::RParen) {
      return Ok(args);
    }
    args.push(self.expr()?);
    while self.matches(&TokenKind::Comma) {
      args.push(self.expr()?);
    }
    Ok(args)
  }

  /// `shift(a, b)` is the only binary operator with no infix spelling of
  /// its own; recognized here by callee name rather than widening the
  /// token set with an operator no other surface syntax uses.
  fn reduce_call(&mut self, callee: NodeIdx, mut args: Vec<NodeIdx>, start: TokenIdx) -> NodeIdx {
    if let NodeKind::Id(name) = self.ast.get(callee).kind {
      if args.len() == 2 && self.symbols.name_of(name) == Some("shift") {
        let b = args.pop().unwrap();
        let a = args.pop().unwrap();
        return self.ast.push(NodeKind::Shift, self.span_from(start), vec![a, b]);
      }
    }
    let mut children = vec![callee];
    children.extend(args);
    self.ast.push(NodeKind::Call, self.span_from(start), children)
  }

  fn primary_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.pos;
    match self.peek().clone() {
      TokenKind::Int => {
        let tok = self.advance();
        let text = self.lexeme(tok).replace('_', "");
        let n = parse_int_literal(&text);
        Ok(self.ast.push_leaf(NodeKind::Const(Value::int(n)), self.span_from(start)))
      }
      TokenKind::True => {
        self.advance();
        Ok(self.ast.push_leaf(NodeKind::Const(Value::int(1)), self.span_from(start)))
      }
      TokenKind::False => {
        self.advance();
        Ok(self.ast.push_leaf(NodeKind::Const(Value::NIL), self.span_from(start)))
      }
      TokenKind::Nil => {
        self.advance();
        Ok(self.ast.push_leaf(NodeKind::Const(Value::NIL), self.span_from(start)))
      }
      TokenKind::Sym => {
        let tok = self.advance();
        let raw = self.lexeme(tok);
        let id = self.intern(raw.trim_start_matches(':'));
        Ok(self.ast.push_leaf(NodeKind::Sym(id), self.span_from(start)))
      }
      TokenKind::Str => {
        let tok = self.advance();
        let raw = self.lexeme(tok);
        let unquoted = raw.trim_start_matches('"').trim_end_matches('"');
        let id = self.intern(unquoted);
        Ok(self.ast.push_leaf(NodeKind::Str(id), self.span_from(start)))
      }
      TokenKind::Ident => {
        let tok = self.advance();
        let id = self.intern(&self.lexeme(tok));
        Ok(self.ast.push_leaf(NodeKind::Id(id), self.span_from(start)))
      }
      TokenKind::LParen => {
        self.advance();
        let inner = self.expr()?;
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(inner)
      }
      TokenKind::LBracket => self.tuple_literal(),
      TokenKind::Backslash => self.lambda_expr(),
      TokenKind::If => self.if_expr(),
      TokenKind::Do => self.do_expr(),
      TokenKind::Panic => {
        self.advance();
        let msg = self.expr()?;
        Ok(self.ast.push(NodeKind::Panic, self.span_from(start), vec![msg]))
      }
      TokenKind::Trap => self.trap_expr(),
      _ => Err(self.fail("an expression")),
    }
  }

  fn tuple_literal(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // '['
    let mut items = Vec::new();
    if !self.check(&TokenKind::RBracket) {
      items.push(self.expr()?);
      while self.matches(&TokenKind::Comma) {
        items.push(self.expr()?);
      }
    }
    self.expect(TokenKind::RBracket, "`]`")?;
    Ok(self.ast.push(NodeKind::Tuple, self.span_from(start), items))
  }

  fn lambda_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // '\'
    let mut params = Vec::new();
    if self.check(&TokenKind::Ident) {
      let tok = self.advance();
      let name = self.intern(&self.lexeme(tok));
      params.push(self.ast.push_leaf(NodeKind::Id(name), self.span_from(start)));
      while self.matches(&TokenKind::Comma) {
        let tok = self.expect(TokenKind::Ident, "a parameter name")?;
        let name = self.intern(&self.lexeme(tok));
        params.push(self.ast.push_leaf(NodeKind::Id(name), self.span_from(start)));
      }
    }
    self.expect(TokenKind::Arrow, "`->`")?;
    let body = self.expr()?;
    let mut children = params;
    children.push(body);
    Ok(self.ast.push(NodeKind::Lambda, self.span_from(start), children))
  }

  fn if_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // 'if'
    let cond = self.or_expr()?;
    self.expect(TokenKind::Do, "`do`")?;
    self.skip_newlines();
    let then_branch = self.block_until(&[TokenKind::Else, TokenKind::End])?;
    let else_branch = if self.matches(&TokenKind::Else) {
      self.skip_newlines();
      self.block_until(&[TokenKind::End])?
    } else {
      self.ast.push(NodeKind::Do, self.span_from(start), Vec::new())
    };
    self.expect(TokenKind::End, "`end`")?;
    Ok(self.ast.push(NodeKind::If, self.span_from(start), vec![cond, then_branch, else_branch]))
  }

  fn do_expr(&mut self) -> PResult<NodeIdx> {
    self.advance(); // 'do'
    self.skip_newlines();
    let body = self.block_until(&[TokenKind::End])?;
    self.expect(TokenKind::End, "`end`")?;
    Ok(body)
  }

  fn trap_expr(&mut self) -> PResult<NodeIdx> {
    let start = self.advance(); // 'trap'
    self.expect(TokenKind::LParen, "`(`")?;
    let id_tok = self.expect(TokenKind::Int, "a primitive id")?;
    let id = parse_int_literal(&self.lexeme(id_tok).replace('_', ""));
    let mut args = Vec::new();
    while self.matches(&TokenKind::Comma) {
      args.push(self.expr()?);
    }
    self.expect(TokenKind::RParen, "`)`")?;
    let idx = self.ast.push(NodeKind::Trap, self.span_from(start), args);
    self.ast.set_attr(idx, id as i64);
    Ok(idx)
  }
}

/// Parses an integer literal lexed with an optional `0x`/`0o`/`0b` radix
/// prefix (underscores already stripped). Wraps modulo 2^30 the same way
/// runtime arithmetic does, via `Value::int`.
fn parse_int_literal(text: &str) -> i32 {
  let (radix, digits) = if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
    (16, rest)
  } else if let Some(rest) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
    (8, rest)
  } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
    (2, rest)
  } else {
    (10, text)
  };
  i64::from_str_radix(digits, radix).unwrap_or(0) as i32
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn parse_src(src: &str) -> (AstArena, NodeIdx, SymbolTable) {
    let chars: Vec<char> = src.chars().collect();
    let toks = lexer::Lexer::lex(&chars);
    let path = PathBuf::from("<test>");
    let list = TokenList::new(&path, &chars, &toks);
    let mut symbols = SymbolTable::default();
    let (ast, root) = Parser::parse(&list, &mut symbols).unwrap_or_else(|e| panic!("{}", e));
    (ast, root, symbols)
  }

  #[test]
  fn parses_let_expression() {
    let (ast, root, _) = parse_src("let x = 1 in x");
    let block = ast.get(root);
    assert_eq!(block.children.len(), 1);
    assert!(matches!(ast.get(block.children[0]).kind, NodeKind::Let));
  }

  #[test]
  fn parses_if_with_else() {
    let (ast, root, _) = parse_src("if 1 do 2 else 3 end");
    let stmt = ast.get(root).children[0];
    assert!(matches!(ast.get(stmt).kind, NodeKind::If));
  }

  #[test]
  fn parses_lambda_and_call() {
    let (ast, root, _) = parse_src("(\\x, y -> x + y)(1, 2)");
    let stmt = ast.get(root).children[0];
    assert!(matches!(ast.get(stmt).kind, NodeKind::Call));
  }

  #[test]
  fn parses_tuple_and_cons() {
    let (ast, root, _) = parse_src("[1, 2] :: nil");
    let stmt = ast.get(root).children[0];
    assert!(matches!(ast.get(stmt).kind, NodeKind::Pair));
  }

  #[test]
  fn shift_call_becomes_shift_node() {
    let (ast, root, _) = parse_src("shift(1, 2)");
    let stmt = ast.get(root).children[0];
    assert!(matches!(ast.get(stmt).kind, NodeKind::Shift));
  }

  #[test]
  fn top_level_def_and_module() {
    let (ast, root, _) = parse_src("module m\nlet x = 1\nend");
    let stmt = ast.get(root).children[0];
    assert!(matches!(ast.get(stmt).kind, NodeKind::Module));
  }

  #[test]
  fn reports_farthest_failure_position() {
    let chars: Vec<char> = "let x = in".chars().collect();
    let toks = lexer::Lexer::lex(&chars);
    let path = PathBuf::from("<test>");
    let list = TokenList::new(&path, &chars, &toks);
    let mut symbols = SymbolTable::default();
    assert!(Parser::parse(&list, &mut symbols).is_err());
  }
}
