use core::tokens::{ErrorTokenKind, Token, TokenKind::Str};

use crate::Lexer;

impl<'a> Lexer<'a> {
  /// Makes a plain string literal token. No interpolation: `\"`, `\\`,
  /// and `\n` are the only recognized escapes, consumed here so an
  /// escaped quote can't prematurely close the literal.
  pub fn make_string_token(&mut self) -> Token {
    let quote_kind = self.get_previous();

    // Don't include the opening quote in the literal's span.
    self.token_start = self.current;

    loop {
      if self.is_at_end() {
        return self.make_error_token(ErrorTokenKind::UnterminatedStr, false);
      }

      if self.get_current() == '\\' && self.get_next() != '\0' {
        self.advance();
        self.advance();
        continue;
      }

      if self.get_current() == quote_kind {
        break;
      }

      if self.advance() == '\n' {
        self.line_num += 1;
      }
    }

    let tok = self.make_token(Str);
    self.advance(); // consume the closing quote
    tok
  }
}
