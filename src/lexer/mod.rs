//! Lexer for the C subset
//!
//! Single-pass scanner producing the token stream the parser consumes.
//! This is the small frontend collaborator of the pipeline; all the
//! interesting work happens in `compiler`.

mod token;

pub use token::{Token, TokenKind};

use crate::error::{Error, Result};

/// Hand-written scanner over the source text
pub struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    /// Creates a scanner over the given source text
    pub fn new(source: &'a str) -> Self {
        Scanner {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scans the entire input into a token vector terminated by `Eof`
    pub fn scan_tokens(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn peek2(&self) -> u8 {
        *self.src.get(self.pos + 1).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == c {
            self.bump();
            true
        } else {
            false
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::LexError {
            line: self.line,
            col: self.column,
            message: msg.into(),
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'/' if self.peek2() == b'/' => {
                    while self.peek() != b'\n' && self.peek() != 0 {
                        self.bump();
                    }
                }
                b'/' if self.peek2() == b'*' => {
                    self.bump();
                    self.bump();
                    loop {
                        if self.peek() == 0 {
                            return Err(self.err("unterminated comment"));
                        }
                        if self.peek() == b'*' && self.peek2() == b'/' {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let tok = |kind| Token::new(kind, line, column);

        let c = self.peek();
        if c == 0 {
            return Ok(tok(TokenKind::Eof));
        }
        if c.is_ascii_digit() {
            return Ok(Token::new(self.number()?, line, column));
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(Token::new(self.word(), line, column));
        }
        if c == b'"' {
            return Ok(Token::new(self.string()?, line, column));
        }
        if c == b'\'' {
            return Ok(Token::new(self.char_lit()?, line, column));
        }

        self.bump();
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b';' => TokenKind::Semi,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'?' => TokenKind::Question,
            b'.' => TokenKind::Dot,
            b'~' => TokenKind::Tilde,
            b'+' => {
                if self.eat(b'+') {
                    TokenKind::Inc
                } else if self.eat(b'=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat(b'-') {
                    TokenKind::Dec
                } else if self.eat(b'=') {
                    TokenKind::MinusAssign
                } else if self.eat(b'>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat(b'=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat(b'=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => {
                if self.eat(b'=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    TokenKind::AndAnd
                } else if self.eat(b'=') {
                    TokenKind::AmpAssign
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    TokenKind::OrOr
                } else if self.eat(b'=') {
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                }
            }
            b'^' => {
                if self.eat(b'=') {
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            b'<' => {
                if self.eat(b'<') {
                    if self.eat(b'=') {
                        TokenKind::ShlAssign
                    } else {
                        TokenKind::Shl
                    }
                } else if self.eat(b'=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    if self.eat(b'=') {
                        TokenKind::ShrAssign
                    } else {
                        TokenKind::Shr
                    }
                } else if self.eat(b'=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            _ => return Err(self.err(format!("unexpected character `{}`", c as char))),
        };
        Ok(tok(kind))
    }

    fn number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        if self.peek() == b'0' && (self.peek2() == b'x' || self.peek2() == b'X') {
            self.bump();
            self.bump();
            let hex_start = self.pos;
            while self.peek().is_ascii_hexdigit() {
                self.bump();
            }
            if self.pos == hex_start {
                return Err(self.err("empty hex literal"));
            }
            let text = std::str::from_utf8(&self.src[hex_start..self.pos]).unwrap();
            let value = u64::from_str_radix(text, 16)
                .map_err(|_| self.err("hex literal out of range"))?;
            return Ok(TokenKind::Integer(value as i64));
        }
        while self.peek().is_ascii_digit() {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == b'.' && self.peek2().is_ascii_digit() {
            is_float = true;
            self.bump();
            while self.peek().is_ascii_digit() {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.err("bad float literal"))?;
            Ok(TokenKind::Float(value))
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.err("integer literal out of range"))?;
            Ok(TokenKind::Integer(value))
        }
    }

    fn word(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()))
    }

    fn escape(&mut self) -> Result<u8> {
        Ok(match self.bump() {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'b' => 8,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'e' => 0x1b,
            other => return Err(self.err(format!("unknown escape `\\{}`", other as char))),
        })
    }

    fn string(&mut self) -> Result<TokenKind> {
        self.bump(); // opening quote
        let mut out = Vec::new();
        loop {
            match self.peek() {
                0 | b'\n' => return Err(self.err("unterminated string literal")),
                b'"' => {
                    self.bump();
                    break;
                }
                b'\\' => {
                    self.bump();
                    out.push(self.escape()?);
                }
                _ => out.push(self.bump()),
            }
        }
        Ok(TokenKind::Str(String::from_utf8_lossy(&out).into_owned()))
    }

    fn char_lit(&mut self) -> Result<TokenKind> {
        self.bump(); // opening quote
        let value = match self.peek() {
            0 | b'\n' => return Err(self.err("unterminated character literal")),
            b'\\' => {
                self.bump();
                self.escape()?
            }
            _ => self.bump(),
        };
        if !self.eat(b'\'') {
            return Err(self.err("unterminated character literal"));
        }
        Ok(TokenKind::Integer(value as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Scanner::new(src)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_scan_expression() {
        assert_eq!(
            kinds("2 + 3 * 4;"),
            vec![
                TokenKind::Integer(2),
                TokenKind::Plus,
                TokenKind::Integer(3),
                TokenKind::Star,
                TokenKind::Integer(4),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            kinds("int main"),
            vec![
                TokenKind::Int,
                TokenKind::Ident("main".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("a <<= b >> c != d->e"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::ShlAssign,
                TokenKind::Ident("b".into()),
                TokenKind::Shr,
                TokenKind::Ident("c".into()),
                TokenKind::NotEq,
                TokenKind::Ident("d".into()),
                TokenKind::Arrow,
                TokenKind::Ident("e".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"0x10 '\n' 2.5 "a\tb""#),
            vec![
                TokenKind::Integer(16),
                TokenKind::Integer(10),
                TokenKind::Float(2.5),
                TokenKind::Str("a\tb".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // line\n/* block\n */ 2"),
            vec![TokenKind::Integer(1), TokenKind::Integer(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = Scanner::new("int\n  x;").scan_tokens().unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(Scanner::new("\"abc").scan_tokens().is_err());
    }
}
