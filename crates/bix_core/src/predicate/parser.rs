//! Parser for the s-expression query syntax.
//!
//! ```text
//! pred   := literal | '(' head arg* ')'
//! head   := and | or | not | eq | prefix | range | bundled | <custom name>
//! literal:= "string" | integer | true | false
//! ```
//!
//! `(range attr lo hi)` is half-open, `_` leaves a side unbounded.

use super::{Atom, Matcher, Predicate};
use crate::attribute::{Attribute, Value};
use crate::consts::MAX_QUERY_DEPTH;
use crate::errors::{BixError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LeftParen,
    RightParen,
    Str(String),
    Int(i64),
    Symbol(String),
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    /// Returns the token and the byte position it starts at.
    fn next_token(&mut self) -> Result<(Token, usize)> {
        self.skip_whitespace();
        let start = self.position;
        let Some(ch) = self.peek_char() else { return Ok((Token::Eof, start)) };
        let tok = match ch {
            '(' => { self.advance(); Token::LeftParen }
            ')' => { self.advance(); Token::RightParen }
            '"' => { self.advance(); Token::Str(self.read_string(start)?) }
            _ => {
                let word = self.read_word();
                let numeric = word.strip_prefix('-').unwrap_or(&word);
                if !numeric.is_empty() && numeric.bytes().all(|b| b.is_ascii_digit()) {
                    let n = word.parse::<i64>().map_err(|e| BixError::Parse { pos: start, msg: format!("bad integer '{word}': {e}") })?;
                    Token::Int(n)
                } else {
                    Token::Symbol(word)
                }
            }
        };
        Ok((tok, start))
    }

    fn read_word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() || c == '(' || c == ')' || c == '"' { break; }
            out.push(c);
            self.advance();
        }
        out
    }

    fn read_string(&mut self, start: usize) -> Result<String> {
        let unterminated = || BixError::Parse { pos: start, msg: "unterminated string".into() };
        let mut out = String::new();
        loop {
            match self.advance().ok_or_else(unterminated)? {
                '"' => return Ok(out),
                '\\' => {
                    let esc_pos = self.position - 1;
                    match self.advance().ok_or_else(unterminated)? {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        'u' => out.push(self.read_unicode_escape(esc_pos)?),
                        c => return Err(BixError::Parse { pos: esc_pos, msg: format!("unknown escape '\\{c}'") }),
                    }
                }
                c => out.push(c),
            }
        }
    }

    /// `\u{XXXX}`
    fn read_unicode_escape(&mut self, pos: usize) -> Result<char> {
        let bad = || BixError::Parse { pos, msg: "bad unicode escape".into() };
        if self.advance() != Some('{') { return Err(bad()); }
        let mut hex = String::new();
        loop {
            match self.advance().ok_or_else(bad)? {
                '}' => break,
                c if c.is_ascii_hexdigit() && hex.len() < 6 => hex.push(c),
                _ => return Err(bad()),
            }
        }
        u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32).ok_or_else(bad)
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    pos: usize,
    /// Forms currently open.
    depth: usize,
}

/// Parse one predicate; trailing input is an error.
pub fn parse(input: &str) -> Result<Predicate> {
    let mut p = Parser::new(input)?;
    let pred = p.predicate()?;
    if p.current != Token::Eof {
        return Err(p.error("unexpected input after predicate"));
    }
    Ok(pred)
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let (current, pos) = lexer.next_token()?;
        Ok(Self { lexer, current, pos, depth: 0 })
    }

    fn bump(&mut self) -> Result<Token> {
        let (next, pos) = self.lexer.next_token()?;
        self.pos = pos;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn error(&self, msg: &str) -> BixError {
        BixError::Parse { pos: self.pos, msg: format!("{msg} (found {:?})", self.current) }
    }

    fn expect_close(&mut self) -> Result<()> {
        match self.current {
            Token::RightParen => { self.bump()?; Ok(()) }
            _ => Err(self.error("expected ')'")),
        }
    }

    fn predicate(&mut self) -> Result<Predicate> {
        match self.current {
            Token::LeftParen => {
                if self.depth == MAX_QUERY_DEPTH {
                    return Err(BixError::Parse { pos: self.pos, msg: format!("nesting deeper than {MAX_QUERY_DEPTH}") });
                }
                self.bump()?;
                let head = match self.bump()? {
                    Token::Symbol(s) => s,
                    _ => return Err(BixError::Parse { pos: self.pos, msg: "expected predicate name after '('".into() }),
                };
                self.depth += 1;
                let pred = self.form(&head)?;
                self.depth -= 1;
                self.expect_close()?;
                Ok(pred)
            }
            _ => Ok(Predicate::Literal(self.literal()?)),
        }
    }

    fn form(&mut self, head: &str) -> Result<Predicate> {
        Ok(match head {
            "and" => Predicate::And(self.rest()?),
            "or" => Predicate::Or(self.rest()?),
            "bundled" => Predicate::Bundled(self.rest()?),
            "not" => Predicate::Not(Box::new(self.predicate()?)),
            "eq" => {
                let attribute = self.attribute()?;
                Predicate::Atom(Atom { attribute, matcher: Matcher::Eq(self.literal()?) })
            }
            "prefix" => {
                let attribute = self.attribute()?;
                match self.bump()? {
                    Token::Str(s) => Predicate::Atom(Atom { attribute, matcher: Matcher::Prefix(s) }),
                    _ => return Err(BixError::Parse { pos: self.pos, msg: "prefix needs a string".into() }),
                }
            }
            "range" => {
                let attribute = self.attribute()?;
                let lower = self.bound()?;
                let upper = self.bound()?;
                Predicate::Atom(Atom { attribute, matcher: Matcher::Range { lower, upper } })
            }
            name => Predicate::Custom { name: name.to_string(), args: self.rest()? },
        })
    }

    /// Predicates up to (not including) the closing paren.
    fn rest(&mut self) -> Result<Vec<Predicate>> {
        let mut out = Vec::new();
        while !matches!(self.current, Token::RightParen | Token::Eof) {
            out.push(self.predicate()?);
        }
        Ok(out)
    }

    fn attribute(&mut self) -> Result<Attribute> {
        let pos = self.pos;
        match self.bump()? {
            Token::Symbol(s) => Attribute::new(&s).map_err(|e| BixError::Parse { pos, msg: e.to_string() }),
            t => Err(BixError::Parse { pos, msg: format!("expected attribute name, found {t:?}") }),
        }
    }

    fn literal(&mut self) -> Result<Value> {
        let pos = self.pos;
        match self.bump()? {
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Int(n) => Ok(Value::Num(n)),
            Token::Symbol(s) if s == "true" => Ok(Value::Bool(true)),
            Token::Symbol(s) if s == "false" => Ok(Value::Bool(false)),
            t => Err(BixError::Parse { pos, msg: format!("expected literal, found {t:?}") }),
        }
    }

    fn bound(&mut self) -> Result<Option<Value>> {
        if matches!(&self.current, Token::Symbol(s) if s == "_") {
            self.bump()?;
            return Ok(None);
        }
        self.literal().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_forms() {
        let p = parse(r#"(and (eq author "alice") (not (prefix text "sp")) (range bout 10 _))"#).unwrap();
        assert_eq!(p, Predicate::and([
            Predicate::eq(Attribute::author(), "alice"),
            Predicate::not(Predicate::prefix(Attribute::text(), "sp")),
            Predicate::range(Attribute::bout(), Some(Value::Num(10)), None),
        ]));
    }

    #[test]
    fn unknown_heads_become_custom() {
        let p = parse(r#"(urn:test:talks-with "bob" (eq author "alice") -3 true)"#).unwrap();
        assert_eq!(p, Predicate::custom("urn:test:talks-with", [
            Predicate::literal("bob"),
            Predicate::eq(Attribute::author(), "alice"),
            Predicate::literal(-3),
            Predicate::literal(true),
        ]));
    }

    #[test]
    fn empty_variadics() {
        assert_eq!(parse("(bundled)").unwrap(), Predicate::Bundled(vec![]));
        assert_eq!(parse("(or)").unwrap(), Predicate::Or(vec![]));
    }

    #[test]
    fn display_round_trips() {
        let src = r#"(or (bundled (eq bout 7)) (range author "a" "c") (custom-x "q\"uote\n" false))"#;
        let p = parse(src).unwrap();
        assert_eq!(parse(&p.to_string()).unwrap(), p);
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |n: usize| format!("{}(eq author \"a\"){}", "(not ".repeat(n), ")".repeat(n));
        assert!(parse(&nested(MAX_QUERY_DEPTH - 1)).is_ok());
        match parse(&nested(MAX_QUERY_DEPTH)) {
            Err(BixError::Parse { pos, .. }) => assert_eq!(pos, MAX_QUERY_DEPTH * 5),
            other => panic!("unexpected {other:?}"),
        }
        // far past the limit is still an error, not a crash
        assert!(matches!(parse(&nested(200_000)), Err(BixError::Parse { .. })));
    }

    #[test]
    fn errors_carry_positions() {
        match parse("(eq author)") {
            Err(BixError::Parse { pos, .. }) => assert_eq!(pos, 10),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("(and (eq author \"a\")").is_err());
        assert!(parse("(eq Author \"a\")").is_err());
        assert!(parse("(eq author \"a\") extra").is_err());
        assert!(parse("\"open").is_err());
    }
}
