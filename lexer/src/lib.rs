use core::tokens;
use core::tokens::{ErrorTokenKind, Token, TokenKind};

mod lex_numbers;
mod lex_strings;

#[macro_export]
macro_rules! char_is_ident_start {
  ($ch:expr) => {{
    $ch.is_alphabetic() || $ch == '_'
  }};
}

/// Struct that represents the scanner.
pub struct Lexer<'a> {
  /// A flat list of characters from the source file.
  source: &'a [char],
  /// The list of tokens found in the source file.
  tokens: Vec<Token>,
  /// The index of the current character.
  current: usize,
  /// The current line index.
  line_num: usize,
  /// The position in the flat source vector of the first
  /// character for the current line.
  line_start: usize,
  /// The position of the first character for the current
  /// token in the flat source vector.
  token_start: usize,
}

impl<'a> Lexer<'a> {
  /// An initialized instance of the Lexer.
  /// # Parameters
  /// - `source` - the source file, as a flat char slice
  pub fn lex(source: &[char]) -> Vec<Token> {
    let mut the_lexer = Lexer {
      source,
      tokens: vec![],
      current: 0,
      line_num: 1,
      line_start: 0,
      token_start: 0,
    };

    the_lexer.find_tokens();
    the_lexer.tokens
  }

  /// Drives the scanner to completion, one token at a time. Newlines are
  /// their own token: `do`-blocks use them to terminate a statement, so
  /// they cannot be swallowed as whitespace the way they are in Hinton.
  fn find_tokens(&mut self) {
    loop {
      self.skip_whitespace();
      self.token_start = self.current;

      if self.is_at_end() {
        self.make_eof_token();
        break;
      }

      let tok = self.scan_one();
      self.tokens.push(tok);
    }
  }

  fn scan_one(&mut self) -> Token {
    let c = self.advance();

    if c == '\n' {
      let tok = self.make_token(TokenKind::Newline);
      self.line_num += 1;
      self.line_start = self.current;
      return tok;
    }

    if char_is_ident_start!(c) {
      return self.make_identifier_token();
    }

    if c.is_ascii_digit() {
      return self.make_numeric_token();
    }

    match c {
      '"' => self.make_string_token(),
      ':' => {
        if self.matches(':') {
          self.make_token(TokenKind::ColonColon)
        } else if char_is_ident_start!(self.get_current()) {
          self.make_symbol_token()
        } else {
          self.make_token(TokenKind::Colon)
        }
      }
      '(' => self.make_token(TokenKind::LParen),
      ')' => self.make_token(TokenKind::RParen),
      '[' => self.make_token(TokenKind::LBracket),
      ']' => self.make_token(TokenKind::RBracket),
      '{' => self.make_token(TokenKind::LBrace),
      '}' => self.make_token(TokenKind::RBrace),
      ',' => self.make_token(TokenKind::Comma),
      '.' => self.make_token(TokenKind::Dot),
      '=' => {
        if self.matches('=') {
          self.make_token(TokenKind::EqEq)
        } else {
          self.make_token(TokenKind::Equal)
        }
      }
      '-' => {
        if self.matches('>') {
          self.make_token(TokenKind::Arrow)
        } else {
          self.make_token(TokenKind::Minus)
        }
      }
      '\\' => self.make_token(TokenKind::Backslash),
      '~' => self.make_token(TokenKind::Tilde),
      '+' => self.make_token(TokenKind::Plus),
      '*' => self.make_token(TokenKind::Star),
      '/' => self.make_token(TokenKind::Slash),
      '%' => self.make_token(TokenKind::Percent),
      '&' => self.make_token(TokenKind::Amp),
      '|' => self.make_token(TokenKind::Pipe),
      '^' => self.make_token(TokenKind::Caret),
      '<' => {
        if self.matches('>') {
          self.make_token(TokenKind::Concat)
        } else {
          self.make_token(TokenKind::Lt)
        }
      }
      '>' => self.make_token(TokenKind::Gt),
      _ => self.make_error_token(ErrorTokenKind::InvalidChar, false),
    }
  }

  /// Gets the previously consumed character.
  pub fn get_previous(&self) -> char {
    self.source[self.current - 1]
  }

  /// Gets the current character without consuming it.
  pub fn get_current(&self) -> char {
    if self.is_at_end() {
      '\0'
    } else {
      self.source[self.current]
    }
  }

  /// Returns the next character without consuming it.
  pub fn get_next(&self) -> char {
    if self.current + 1 >= self.source.len() {
      return '\0';
    }

    self.source[self.current + 1]
  }

  /// Checks if the scanner is at the end of the source.
  pub fn is_at_end(&self) -> bool {
    self.current >= self.source.len()
  }

  /// Matches the current character against a provided character.
  pub fn matches(&mut self, expected: char) -> bool {
    if self.is_at_end() || self.get_current() != expected {
      return false;
    }
    self.current += 1;
    true
  }

  /// Advances to the next char and returns consumed char.
  pub fn advance(&mut self) -> char {
    self.current += 1;
    self.get_previous()
  }

  /// Skips spaces, tabs, carriage returns, and `#`-to-end-of-line
  /// comments. Newlines are not skipped here; `scan_one` turns them into
  /// their own token.
  pub fn skip_whitespace(&mut self) {
    loop {
      if self.is_at_end() {
        break;
      }

      match self.get_current() {
        ' ' | '\r' | '\t' => self.current += 1,
        '#' => self.skip_line_comment(),
        _ => break,
      }
    }
  }

  /// Skips a `#`-to-end-of-line comment.
  fn skip_line_comment(&mut self) {
    while !self.is_at_end() && self.get_current() != '\n' {
      self.advance();
    }
  }

  /// Generates an identifier (or keyword) token with the current state of
  /// the scanner.
  pub(crate) fn make_identifier_token(&mut self) -> Token {
    while !self.is_at_end() {
      let c = self.get_current();

      if c.is_alphabetic() || c.is_ascii_digit() || c == '_' {
        self.advance();
      } else {
        break;
      }
    }

    let id: String = self.source[self.token_start..self.current].iter().collect();
    let tok_kind = tokens::make_identifier_kind(id.as_str());

    self.make_token(tok_kind)
  }

  /// Generates a symbol-literal token (`:name`). `token_start` points at
  /// the leading `:`; the name's first character has already been peeked
  /// (not consumed) by the caller.
  fn make_symbol_token(&mut self) -> Token {
    self.advance();
    while !self.is_at_end() {
      let c = self.get_current();
      if c.is_alphabetic() || c.is_ascii_digit() || c == '_' {
        self.advance();
      } else {
        break;
      }
    }
    self.make_token(TokenKind::Sym)
  }

  /// Generates a token with the current state of the scanner.
  pub fn make_token(&self, kind: TokenKind) -> Token {
    Token {
      line_num: self.line_num,
      line_start: self.line_start,
      span: (self.token_start, self.current),
      kind,
    }
  }

  fn make_eof_token(&mut self) {
    self.tokens.push(Token {
      line_num: self.line_num,
      line_start: self.line_start,
      span: (self.token_start, self.current),
      kind: TokenKind::Eof,
    });
  }

  /// Generates an error token at the current position.
  pub fn make_error_token(&mut self, err: ErrorTokenKind, advance: bool) -> Token {
    let tok = Token {
      line_num: self.line_num,
      line_start: self.line_start,
      span: (self.token_start, self.current),
      kind: TokenKind::Error(err),
    };

    if advance {
      self.advance();
    }

    tok
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lex(src: &str) -> Vec<TokenKind> {
    let chars: Vec<char> = src.chars().collect();
    Lexer::lex(&chars).into_iter().map(|t| t.kind).collect()
  }

  #[test]
  fn lexes_a_call_expression() {
    let kinds = lex("print(1 + 2)");
    assert_eq!(
      kinds,
      vec![
        TokenKind::Ident,
        TokenKind::LParen,
        TokenKind::Int,
        TokenKind::Plus,
        TokenKind::Int,
        TokenKind::RParen,
        TokenKind::Eof,
      ]
    );
  }

  #[test]
  fn comments_run_to_end_of_line() {
    let kinds = lex("1 # a comment\n2");
    assert_eq!(kinds, vec![TokenKind::Int, TokenKind::Newline, TokenKind::Int, TokenKind::Eof]);
  }

  #[test]
  fn lexes_symbols_and_cons() {
    let kinds = lex(":foo :: nil");
    assert_eq!(kinds, vec![TokenKind::Sym, TokenKind::ColonColon, TokenKind::Nil, TokenKind::Eof]);
  }

  #[test]
  fn lexes_string_literals() {
    let kinds = lex("\"hello\"");
    assert_eq!(kinds, vec![TokenKind::Str, TokenKind::Eof]);
  }

  #[test]
  fn unterminated_string_is_an_error_token() {
    let kinds = lex("\"hello");
    assert!(matches!(kinds[0], TokenKind::Error(ErrorTokenKind::UnterminatedStr)));
  }

  #[test]
  fn keywords_are_not_identifiers() {
    let kinds = lex("if do else end let in and or not");
    assert_eq!(
      kinds,
      vec![
        TokenKind::If,
        TokenKind::Do,
        TokenKind::Else,
        TokenKind::End,
        TokenKind::Let,
        TokenKind::In,
        TokenKind::And,
        TokenKind::Or,
        TokenKind::Not,
        TokenKind::Eof,
      ]
    );
  }
}
