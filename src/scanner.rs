//! Lexical scanner producing a token stream with expression-boundary hints.
//!
//! Tokens borrow their text from the source string. Besides classifying
//! tokens, the scanner tracks a stack of expression-sequence frames so that
//! the first token of the *last* expression in every sequence (the body of a
//! parenthesized form, or the top-level program) carries `is_final = true`.
//! The compiler uses that flag to decide where an expression sequence
//! switches to one-value continuation arity.
//!
//! A token immediately preceded by `'` is not registered as an expression of
//! its own: the quote and its datum form a single expression anchored on the
//! quote token.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{anychar, char, satisfy},
    combinator::{opt, recognize, value},
    sequence::{delimited, pair, preceded},
};

use crate::{Error, ScanError, ScanErrorKind};

/// Identifies the type of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Begins a compound expression or pair literal
    LeftParen,
    /// Ends a compound expression or pair literal
    RightParen,
    /// Literal shorthand: 'x expands to (quote x)
    SingleQuote,
    /// Delimits the car and cdr of a pair literal: '(1 . 2)
    Dot,
    BooleanTrue,
    BooleanFalse,
    Character,
    String,
    Number,
    /// Syntactic keyword, builtin procedure name, or variable name
    Identifier,
    /// Marks the end of the token array
    Eof,
}

/// A token: a slice of the source, its kind, and the final-expression flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'src> {
    /// Text of the token, pointing into the source rather than copied.
    /// String tokens hold the contents without the quotes; number tokens
    /// drop a leading `+`.
    pub text: &'src str,
    pub kind: TokenKind,
    /// Whether this token begins the final expression of an expression
    /// sequence. Drives the compiler's coarity handling of sequence tails.
    pub is_final: bool,
}

impl<'src> Token<'src> {
    fn new(text: &'src str, kind: TokenKind) -> Self {
        Token {
            text,
            kind,
            is_final: false,
        }
    }
}

/// Whitespace is space or newline only.
fn is_whitespace(c: char) -> bool {
    c == ' ' || c == '\n'
}

/// A delimiter ends number and identifier tokens.
fn is_delimiter(c: char) -> bool {
    is_whitespace(c) || c == '(' || c == ')' || c == '"' || c == ';'
}

/// A numeric character is either a digit or `.`.
fn is_numeric(c: char) -> bool {
    c.is_ascii_digit() || c == '.'
}

fn is_special_initial(c: char) -> bool {
    matches!(
        c,
        '!' | '$' | '%' | '&' | '*' | '/' | ':' | '<' | '=' | '>' | '?' | '^' | '_' | '~'
    )
}

fn is_identifier_initial(c: char) -> bool {
    c.is_ascii_alphabetic() || is_special_initial(c)
}

fn is_identifier_subsequent(c: char) -> bool {
    is_identifier_initial(c) || c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | '@')
}

/// Recognize a number, optionally signed: -12, 3.5, 17.
fn number(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        opt(alt((char('-'), char('+')))),
        take_while1(is_numeric),
    ))
    .parse(input)
}

/// Recognize an identifier: an initial character plus subsequents.
fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(is_identifier_initial),
        take_while(is_identifier_subsequent),
    ))
    .parse(input)
}

/// Recognize a string literal and yield its contents. Escapes are not
/// handled.
fn string_literal(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"')).parse(input)
}

/// Recognize #t or #f.
fn boolean(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::BooleanTrue, tag("#t")),
        value(TokenKind::BooleanFalse, tag("#f")),
    ))
    .parse(input)
}

/// Recognize a character literal and yield the character's text.
fn character(input: &str) -> IResult<&str, &str> {
    preceded(tag("#\\"), recognize(anychar)).parse(input)
}

/// Recognize a line comment (terminating newline not consumed).
fn line_comment(input: &str) -> IResult<&str, &str> {
    preceded(char(';'), take_while(|c| c != '\n')).parse(input)
}

struct Scanner<'src> {
    source: &'src str,
    rest: &'src str,
    tokens: Vec<Token<'src>>,
    /// Stack of expression-sequence frames; each frame holds the indices of
    /// the tokens that begin its member expressions.
    expression_sequences: Vec<Vec<usize>>,
}

impl<'src> Scanner<'src> {
    fn new(source: &'src str) -> Self {
        Scanner {
            source,
            rest: source,
            tokens: Vec::new(),
            expression_sequences: vec![Vec::new()],
        }
    }

    /// Byte offset of the scan position, for error context.
    fn offset(&self) -> usize {
        self.source.len() - self.rest.len()
    }

    fn scan_error(&self, kind: ScanErrorKind, message: impl Into<String>) -> Error {
        Error::ScanError(ScanError::with_context(
            kind,
            message,
            self.source,
            self.offset(),
        ))
    }

    fn add_token(&mut self, text: &'src str, kind: TokenKind) {
        self.tokens.push(Token::new(text, kind));
    }

    /// Register the just-added token as an expression of the current
    /// sequence, unless it is the operand of a preceding quote.
    fn push_expression(&mut self) -> Result<(), Error> {
        if self.tokens.len() > 1
            && self.tokens[self.tokens.len() - 2].kind == TokenKind::SingleQuote
        {
            return Ok(());
        }

        let index = self.tokens.len() - 1;
        match self.expression_sequences.last_mut() {
            Some(frame) => {
                frame.push(index);
                Ok(())
            }
            None => Err(self.scan_error(
                ScanErrorKind::UnbalancedParens,
                "expression outside any expression sequence",
            )),
        }
    }

    /// A `(` both counts as an expression of the enclosing sequence and
    /// opens a new one.
    fn push_expression_sequence(&mut self) -> Result<(), Error> {
        self.push_expression()?;
        self.expression_sequences.push(Vec::new());
        Ok(())
    }

    /// Close the current sequence, marking the token that begins its final
    /// expression.
    fn pop_expression_sequence(&mut self) -> Result<(), Error> {
        let frame = self.expression_sequences.pop().ok_or_else(|| {
            self.scan_error(
                ScanErrorKind::UnbalancedParens,
                "can't pop from empty expression sequence stack",
            )
        })?;

        let final_index = *frame.last().ok_or_else(|| {
            self.scan_error(
                ScanErrorKind::EmptyExpressionSequence,
                "no expressions in expression sequence",
            )
        })?;

        self.tokens[final_index].is_final = true;
        Ok(())
    }

    /// Consume whitespace and line comments before the next token.
    fn skip_atmosphere(&mut self) {
        loop {
            let trimmed = self.rest.trim_start_matches(is_whitespace);
            if let Ok((after, _)) = line_comment(trimmed) {
                self.rest = after;
            } else {
                self.rest = trimmed;
                return;
            }
        }
    }

    /// Scan a token beginning with `#`: boolean or character literal.
    fn scan_hash(&mut self) -> Result<(), Error> {
        if let Ok((after, kind)) = boolean(self.rest) {
            let text = &self.rest[..2];
            self.rest = after;
            self.add_token(text, kind);
            return Ok(());
        }
        if let Ok((after, chr)) = character(self.rest) {
            self.rest = after;
            self.add_token(chr, TokenKind::Character);
            return Ok(());
        }

        match self.rest.chars().nth(1) {
            // nothing after `#`, or `#\` at end of input
            None | Some('\\') => {
                Err(self.scan_error(ScanErrorKind::UnexpectedEof, "unexpected eof"))
            }
            Some(_) => Err(self.scan_error(
                ScanErrorKind::InvalidCharacter,
                "invalid character after #",
            )),
        }
    }

    /// Scan a token beginning with `-` or `+`: a signed number when followed
    /// by a numeric character, a one-character identifier when followed by a
    /// delimiter or end of input.
    fn scan_sign(&mut self) -> Result<(), Error> {
        match self.rest.chars().nth(1) {
            Some(c) if is_numeric(c) => self.scan_number(),
            Some(c) if is_delimiter(c) => {
                let text = &self.rest[..1];
                self.rest = &self.rest[1..];
                self.add_token(text, TokenKind::Identifier);
                Ok(())
            }
            None => {
                let text = self.rest;
                self.rest = "";
                self.add_token(text, TokenKind::Identifier);
                Ok(())
            }
            Some(_) => Err(self.scan_error(
                ScanErrorKind::InvalidCharacter,
                "invalid character after - or +",
            )),
        }
    }

    fn scan_number(&mut self) -> Result<(), Error> {
        let (after, mut text) = number(self.rest)
            .map_err(|_| self.scan_error(ScanErrorKind::InvalidCharacter, "malformed number"))?;
        // An explicit plus sign carries no information
        text = text.strip_prefix('+').unwrap_or(text);
        self.rest = after;
        self.add_token(text, TokenKind::Number);
        Ok(())
    }

    fn scan_identifier(&mut self) -> Result<(), Error> {
        let (after, text) = identifier(self.rest).map_err(|_| {
            self.scan_error(ScanErrorKind::InvalidCharacter, "malformed identifier")
        })?;
        self.rest = after;
        self.add_token(text, TokenKind::Identifier);
        Ok(())
    }

    fn scan_string(&mut self) -> Result<(), Error> {
        let (after, contents) = string_literal(self.rest).map_err(|_| {
            self.scan_error(
                ScanErrorKind::UnterminatedString,
                "source ended with no closing quote",
            )
        })?;
        self.rest = after;
        self.add_token(contents, TokenKind::String);
        Ok(())
    }

    fn run(mut self) -> Result<Vec<Token<'src>>, Error> {
        loop {
            self.skip_atmosphere();

            let Some(current) = self.rest.chars().next() else {
                break;
            };

            match current {
                '(' => {
                    let text = &self.rest[..1];
                    self.rest = &self.rest[1..];
                    self.add_token(text, TokenKind::LeftParen);
                    self.push_expression_sequence()?;
                }
                ')' => {
                    let text = &self.rest[..1];
                    self.rest = &self.rest[1..];
                    self.add_token(text, TokenKind::RightParen);
                    self.pop_expression_sequence()?;
                }
                '\'' => {
                    let text = &self.rest[..1];
                    self.rest = &self.rest[1..];
                    self.add_token(text, TokenKind::SingleQuote);
                    self.push_expression()?;
                }
                '.' => {
                    let text = &self.rest[..1];
                    self.rest = &self.rest[1..];
                    self.add_token(text, TokenKind::Dot);
                }
                '#' => {
                    self.scan_hash()?;
                    self.push_expression()?;
                }
                '"' => {
                    self.scan_string()?;
                    self.push_expression()?;
                }
                '-' | '+' => {
                    self.scan_sign()?;
                    self.push_expression()?;
                }
                c if c.is_ascii_digit() => {
                    self.scan_number()?;
                    self.push_expression()?;
                }
                c if is_identifier_initial(c) => {
                    self.scan_identifier()?;
                    self.push_expression()?;
                }
                _ => {
                    return Err(self.scan_error(
                        ScanErrorKind::InvalidCharacter,
                        "unexpected first character of token",
                    ));
                }
            }
        }

        if self.expression_sequences.len() != 1 {
            return Err(self.scan_error(
                ScanErrorKind::UnbalancedParens,
                "unexpected expression sequence stack size",
            ));
        }

        // The top-level program is itself an expression sequence
        self.pop_expression_sequence()?;

        self.tokens.push(Token::new("", TokenKind::Eof));
        Ok(self.tokens)
    }
}

/// Tokenize a source string, ending the token array with an `Eof` token.
pub fn scan(source: &str) -> Result<Vec<Token<'_>>, Error> {
    Scanner::new(source).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScanErrorKind;

    /// Expected outcome of a scan test case
    #[derive(Debug)]
    enum ScanTestResult {
        /// Scanning succeeds with these (kind, text, is_final) tokens,
        /// excluding the trailing Eof
        Tokens(Vec<(TokenKind, &'static str, bool)>),
        /// Scanning fails with this error kind
        ErrorKind(ScanErrorKind),
    }
    use ScanTestResult::*;

    fn run_scan_tests(test_cases: Vec<(&str, ScanTestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let test_id = format!("Scan test #{}", i + 1);
            let result = scan(input);

            match (result, expected) {
                (Ok(tokens), Tokens(expected_tokens)) => {
                    let last = tokens.last().expect("token array never empty");
                    assert_eq!(last.kind, TokenKind::Eof, "{test_id}: missing eof");

                    let actual: Vec<(TokenKind, &str, bool)> = tokens
                        [..tokens.len() - 1]
                        .iter()
                        .map(|t| (t.kind, t.text, t.is_final))
                        .collect();
                    assert_eq!(&actual, expected_tokens, "{test_id}: token mismatch");
                }
                (Err(crate::Error::ScanError(e)), ErrorKind(expected_kind)) => {
                    assert_eq!(&e.kind, expected_kind, "{test_id}: error kind mismatch");
                }
                (Ok(tokens), ErrorKind(kind)) => {
                    panic!("{test_id}: expected {kind:?}, got tokens {tokens:?}");
                }
                (Err(e), expected) => {
                    panic!("{test_id}: expected {expected:?}, got error {e:?}");
                }
            }
        }
    }

    #[test]
    fn test_scanner_comprehensive() {
        use TokenKind::*;

        let test_cases = vec![
            // ===== ATOMS =====
            ("42 ", Tokens(vec![(Number, "42", true)])),
            ("42", Tokens(vec![(Number, "42", true)])),
            ("-5 ", Tokens(vec![(Number, "-5", true)])),
            ("+5 ", Tokens(vec![(Number, "5", true)])),
            ("3.25 ", Tokens(vec![(Number, "3.25", true)])),
            ("-3.25 ", Tokens(vec![(Number, "-3.25", true)])),
            ("#t ", Tokens(vec![(BooleanTrue, "#t", true)])),
            ("#f ", Tokens(vec![(BooleanFalse, "#f", true)])),
            ("#\\a ", Tokens(vec![(Character, "a", true)])),
            ("\"hello\" ", Tokens(vec![(String, "hello", true)])),
            ("foo ", Tokens(vec![(Identifier, "foo", true)])),
            ("set! ", Tokens(vec![(Identifier, "set!", true)])),
            ("<=? ", Tokens(vec![(Identifier, "<=?", true)])),
            ("x->y ", Tokens(vec![(Identifier, "x->y", true)])),
            // A lone sign followed by a delimiter is an identifier
            ("- ", Tokens(vec![(Identifier, "-", true)])),
            ("+", Tokens(vec![(Identifier, "+", true)])),
            // `.` scans as a dot token, so `.5` is dot then number
            (".5 ", Tokens(vec![(Dot, ".", false), (Number, "5", true)])),
            // ===== SEQUENCE STRUCTURE =====
            (
                "(+ 1 2)",
                Tokens(vec![
                    (LeftParen, "(", true),
                    (Identifier, "+", false),
                    (Number, "1", false),
                    (Number, "2", true),
                    (RightParen, ")", false),
                ]),
            ),
            (
                "1 2 3 ",
                Tokens(vec![
                    (Number, "1", false),
                    (Number, "2", false),
                    (Number, "3", true),
                ]),
            ),
            (
                "(f 1) 2 ",
                Tokens(vec![
                    (LeftParen, "(", false),
                    (Identifier, "f", false),
                    (Number, "1", true),
                    (RightParen, ")", false),
                    (Number, "2", true),
                ]),
            ),
            // A quoted datum is one expression anchored on the quote
            (
                "'x ",
                Tokens(vec![(SingleQuote, "'", true), (Identifier, "x", false)]),
            ),
            (
                "(quote x)",
                Tokens(vec![
                    (LeftParen, "(", true),
                    (Identifier, "quote", false),
                    (Identifier, "x", true),
                    (RightParen, ")", false),
                ]),
            ),
            (
                "'(1 . 2)",
                Tokens(vec![
                    (SingleQuote, "'", true),
                    (LeftParen, "(", false),
                    (Number, "1", false),
                    (Dot, ".", false),
                    (Number, "2", true),
                    (RightParen, ")", false),
                ]),
            ),
            // ===== COMMENTS AND WHITESPACE =====
            ("; nothing here\n42 ", Tokens(vec![(Number, "42", true)])),
            ("42 ; trailing", Tokens(vec![(Number, "42", true)])),
            (
                "1\n; two\n3 ",
                Tokens(vec![(Number, "1", false), (Number, "3", true)]),
            ),
            // ===== ERRORS =====
            ("\"unterminated", ErrorKind(ScanErrorKind::UnterminatedString)),
            ("#", ErrorKind(ScanErrorKind::UnexpectedEof)),
            ("#\\", ErrorKind(ScanErrorKind::UnexpectedEof)),
            ("#q", ErrorKind(ScanErrorKind::InvalidCharacter)),
            ("-x", ErrorKind(ScanErrorKind::InvalidCharacter)),
            ("+x", ErrorKind(ScanErrorKind::InvalidCharacter)),
            ("@foo", ErrorKind(ScanErrorKind::InvalidCharacter)),
            ("[1]", ErrorKind(ScanErrorKind::InvalidCharacter)),
            ("(1", ErrorKind(ScanErrorKind::UnbalancedParens)),
            ("1)", ErrorKind(ScanErrorKind::UnbalancedParens)),
            ("()", ErrorKind(ScanErrorKind::EmptyExpressionSequence)),
            ("", ErrorKind(ScanErrorKind::EmptyExpressionSequence)),
            ("   ", ErrorKind(ScanErrorKind::EmptyExpressionSequence)),
        ];

        run_scan_tests(test_cases);
    }

    #[test]
    fn test_nested_finals() {
        use TokenKind::*;

        // Every nesting level marks its own final expression
        let tokens = scan("(f (g 1 2) (h 3))").unwrap();
        let finals: Vec<(&str, TokenKind)> = tokens
            .iter()
            .filter(|t| t.is_final)
            .map(|t| (t.text, t.kind))
            .collect();
        // outer frame's final is the whole program's single expression `(`;
        // (g 1 2) marks 2, (h 3) marks 3, and f's sequence marks the `(` of
        // (h 3)
        assert_eq!(
            finals,
            vec![("(", LeftParen), ("2", Number), ("(", LeftParen), ("3", Number)]
        );
    }

    #[test]
    fn test_lambda_body_final() {
        // The last body expression of a lambda is marked, earlier ones not
        let tokens = scan("((lambda (x) 3 (* x x)) 5)").unwrap();
        let texts: Vec<(&str, bool)> = tokens.iter().map(|t| (t.text, t.is_final)).collect();

        // the `3` is non-final, the `(` of (* x x) is final in the lambda
        // body sequence
        let three = texts.iter().find(|(t, _)| *t == "3").unwrap();
        assert!(!three.1);
        let star_paren_final = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind == TokenKind::LeftParen)
            .filter(|(i, _)| tokens[i + 1].text == "*")
            .all(|(_, t)| t.is_final);
        assert!(star_paren_final);
    }
}
