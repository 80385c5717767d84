use thiserror::Error;

use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("Unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { character: char, position: usize },
    #[error("Invalid integer literal '{literal}' at position {position}")]
    InvalidIntegerLiteral { literal: String, position: usize },
    #[error("Unterminated string literal at position {position}")]
    UnterminatedString { position: usize },
}

pub type LexResult<T> = Result<T, LexError>;

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub fn next_token(&mut self) -> LexResult<Token<'a>> {
        loop {
            self.consume_while(|c| c.is_whitespace());

            if self.peek_char() == Some('-') && self.char_at(self.pos + 1) == Some('-') {
                self.consume_while(|c| c != '\n');
                continue;
            }

            let start = self.pos;
            let Some(ch) = self.peek_char() else {
                return Ok(Token::new(TokenKind::EOF, Span { start, end: start }));
            };

            if let Some(token) = self.try_consume_operator(ch, start) {
                return Ok(token);
            }

            return match ch {
                '"' => self.read_string(start),
                c if c.is_ascii_digit() => self.read_integer(start),
                c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier(start)),
                _ => Err(LexError::UnexpectedCharacter {
                    character: ch,
                    position: start,
                }),
            };
        }
    }

    fn try_consume_operator(&mut self, ch: char, start: usize) -> Option<Token<'a>> {
        let kind = match ch {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '=' => {
                self.consume_char();
                return Some(if self.peek_char() == Some('=') {
                    self.consume_char();
                    Token::new(TokenKind::EqEq, Span { start, end: self.pos })
                } else {
                    Token::new(TokenKind::Assign, Span { start, end: self.pos })
                });
            }
            '<' => {
                self.consume_char();
                return Some(if self.peek_char() == Some('=') {
                    self.consume_char();
                    Token::new(TokenKind::LessEq, Span { start, end: self.pos })
                } else {
                    Token::new(TokenKind::Less, Span { start, end: self.pos })
                });
            }
            '>' => {
                self.consume_char();
                return Some(if self.peek_char() == Some('=') {
                    self.consume_char();
                    Token::new(TokenKind::GreaterEq, Span { start, end: self.pos })
                } else {
                    Token::new(TokenKind::Greater, Span { start, end: self.pos })
                });
            }
            '~' => {
                self.consume_char();
                if self.peek_char() == Some('=') {
                    self.consume_char();
                    return Some(Token::new(TokenKind::NotEq, Span { start, end: self.pos }));
                }
                return None;
            }
            _ => return None,
        };

        self.consume_char();
        Some(Token::new(kind, Span { start, end: self.pos }))
    }

    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        self.consume_while(|c| c.is_alphanumeric() || c == '_');
        let end = self.pos;

        let ident = &self.input[start..end];
        let kind = match ident {
            "function" => TokenKind::Function,
            "end" => TokenKind::End,
            "if" => TokenKind::If,
            "then" => TokenKind::Then,
            "else" => TokenKind::Else,
            "elseif" => TokenKind::Elseif,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "return" => TokenKind::Return,
            "local" => TokenKind::Local,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "type" => TokenKind::Type,
            "print" => TokenKind::Print,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            _ => TokenKind::Identifier(ident),
        };
        Token::new(kind, Span { start, end })
    }

    fn read_integer(&mut self, start: usize) -> LexResult<Token<'a>> {
        self.consume_while(|c| c.is_ascii_digit());
        let end = self.pos;

        let literal = &self.input[start..end];
        let value = literal
            .parse::<i64>()
            .map_err(|_| LexError::InvalidIntegerLiteral {
                literal: literal.to_string(),
                position: start,
            })?;
        Ok(Token::new(TokenKind::Integer(value), Span { start, end }))
    }

    fn read_string(&mut self, start: usize) -> LexResult<Token<'a>> {
        self.consume_char(); // opening quote
        let mut content = String::new();

        loop {
            match self.peek_char() {
                None | Some('\n') => {
                    return Err(LexError::UnterminatedString { position: start });
                }
                Some('"') => {
                    self.consume_char();
                    let span = Span { start, end: self.pos };
                    return Ok(Token::new(TokenKind::String(content), span));
                }
                Some('\\') => {
                    self.consume_char();
                    // Unknown escapes keep the escaped character itself.
                    let escaped = match self.consume_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(other) => other,
                        None => return Err(LexError::UnterminatedString { position: start }),
                    };
                    content.push(escaped);
                }
                Some(c) => {
                    self.consume_char();
                    content.push(c);
                }
            }
        }
    }

    fn consume_while<P>(&mut self, keep_predicate: P) -> usize
    where
        P: Fn(char) -> bool,
    {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if !keep_predicate(c) {
                break;
            }
            self.consume_char();
        }
        self.pos - start
    }

    fn char_at(&self, index: usize) -> Option<char> {
        if index >= self.input.len() {
            None
        } else {
            self.input[index..].chars().next()
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.char_at(self.pos)
    }

    fn consume_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = LexResult<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(token) => Some(Ok(token)),
            Err(e) => Some(Err(e)),
        }
    }
}

pub fn tokenize(input: &str) -> LexResult<Vec<Token<'_>>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.kind, TokenKind::EOF);
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        tokenize(input)
            .expect("tokenize should succeed")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn tokenizes_function_definition() {
        let input = indoc! {r#"
            function square(x)
                return x * x
            end
            print(square(5))
        "#};
        let expected = vec![
            TokenKind::Function,
            TokenKind::Identifier("square"),
            TokenKind::LParen,
            TokenKind::Identifier("x"),
            TokenKind::RParen,
            TokenKind::Return,
            TokenKind::Identifier("x"),
            TokenKind::Star,
            TokenKind::Identifier("x"),
            TokenKind::End,
            TokenKind::Print,
            TokenKind::LParen,
            TokenKind::Identifier("square"),
            TokenKind::LParen,
            TokenKind::Integer(5),
            TokenKind::RParen,
            TokenKind::RParen,
            TokenKind::EOF,
        ];
        assert_eq!(kinds(input), expected);
    }

    #[test]
    fn tokenizes_comparison_operators() {
        let expected = vec![
            TokenKind::EqEq,
            TokenKind::NotEq,
            TokenKind::Less,
            TokenKind::LessEq,
            TokenKind::Greater,
            TokenKind::GreaterEq,
            TokenKind::Assign,
            TokenKind::EOF,
        ];
        assert_eq!(kinds("== ~= < <= > >= ="), expected);
    }

    #[test]
    fn skips_line_comments() {
        let input = indoc! {r#"
            -- leading comment
            x = 1 -- trailing comment
        "#};
        let expected = vec![
            TokenKind::Identifier("x"),
            TokenKind::Assign,
            TokenKind::Integer(1),
            TokenKind::EOF,
        ];
        assert_eq!(kinds(input), expected);
    }

    #[test]
    fn decodes_string_escapes() {
        let tokens = kinds(r#"s = "a\tb\n\"c\\d\q""#);
        assert_eq!(
            tokens[2],
            TokenKind::String("a\tb\n\"c\\dq".to_string())
        );
    }

    #[test]
    fn errors_on_unexpected_character() {
        let err = tokenize("x = 1 @ 2").expect_err("expected lexing failure");
        assert_eq!(
            err,
            LexError::UnexpectedCharacter {
                character: '@',
                position: 6
            }
        );
    }

    #[test]
    fn errors_on_integer_overflow() {
        let err = tokenize("n = 99999999999999999999999999").expect_err("expected overflow");
        assert!(err.to_string().contains("Invalid integer literal"));
    }

    #[test]
    fn errors_on_unterminated_string() {
        let err = tokenize("x = \"abc\n").expect_err("expected unterminated string failure");
        assert_eq!(err, LexError::UnterminatedString { position: 4 });
    }

    #[test]
    fn errors_on_lone_tilde() {
        let err = tokenize("x = ~1").expect_err("expected lexing failure");
        assert_eq!(
            err,
            LexError::UnexpectedCharacter {
                character: '~',
                position: 4
            }
        );
    }
}
