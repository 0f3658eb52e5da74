use core::tokens::ErrorTokenKind::InvalidNumber;
use core::tokens::Token;
use core::tokens::TokenKind::Int;

use crate::{char_is_ident_start, Lexer};

impl<'a> Lexer<'a> {
  /// Makes an integer literal token. The value space is a 30-bit signed
  /// integer with no floating-point tag, so there is nothing to lex here
  /// but decimal digits, an optional `0x`/`0o`/`0b` radix prefix, and `_`
  /// as a visual digit separator.
  pub(super) fn make_numeric_token(&mut self) -> Token {
    let radix: u32 = match (self.get_previous(), self.get_current()) {
      ('0', 'x') | ('0', 'X') => {
        self.advance();
        16
      }
      ('0', 'o') | ('0', 'O') => {
        self.advance();
        8
      }
      ('0', 'b') | ('0', 'B') => {
        self.advance();
        2
      }
      _ => 10,
    };

    let digits_start = self.current;
    while !self.is_at_end() {
      let c = self.get_current();
      if c.is_digit(radix) || c == '_' {
        self.advance();
      } else {
        break;
      }
    }

    if self.current == digits_start && radix != 10 {
      return self.make_error_token(InvalidNumber, true);
    }
    if self.get_previous() == '_' {
      return self.make_error_token_at_prev(InvalidNumber);
    }
    if !self.is_at_end() && char_is_ident_start!(self.get_current()) {
      return self.make_error_token(InvalidNumber, true);
    }

    self.make_token(Int)
  }
}
