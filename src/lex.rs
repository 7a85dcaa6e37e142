use std::collections::VecDeque;

use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::scan::{self, Scanner};
use crate::source::{Keyword, Location, Span, Token, TokenKind};

/// Upper bound on token lookahead.
pub const MAX_TOKEN_PEEK: usize = 8;

/// Hand-written tokenizer for MDL source.
///
/// Emits [`Token`]s until end of input. Recoverable faults are routed through
/// the [`Reporter`]; when the active policy classifies a code as fatal the
/// corresponding diagnostic is returned as `Err` and lexing stops.
pub struct Lexer<'input> {
    scan: Scanner<'input>,
    uri: String,
    reporter: &'input Reporter,
}

impl<'input> Lexer<'input> {
    pub fn new(uri: impl Into<String>, bytes: &'input [u8], reporter: &'input Reporter) -> Self {
        Self {
            scan: Scanner::new(bytes),
            uri: uri.into(),
            reporter,
        }
    }

    fn report(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        at: Location,
    ) -> Result<(), Diagnostic> {
        self.reporter
            .report(Diagnostic::new(code, message).at(self.uri.clone(), at))
    }

    /// Peek that defers decode errors to the next consume.
    fn peek(&mut self, n: usize) -> Option<char> {
        self.scan.peek(n).ok().flatten()
    }

    fn bump(&mut self) -> Option<char> {
        self.scan.next().ok().flatten().map(|(c, _)| c)
    }

    fn token(&self, kind: TokenKind, start: Location, text: impl Into<String>) -> Token {
        Token::new(kind, Span::new(start, self.scan.location()), text)
    }

    /// Produces the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<Token>, Diagnostic> {
        loop {
            let start = self.scan.location();
            let (c, at) = match self.scan.next() {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(None),
                Err(err) => {
                    let code = match err {
                        scan::Error::MisplacedBom(_) => ErrorCode::UnsupportedFileFormat,
                        scan::Error::InvalidUtf8(_) => ErrorCode::UnexpectedToken,
                    };
                    self.report(code, err.to_string(), err.location())?;
                    self.scan.resync_after_line_break();
                    continue;
                }
            };

            let token = match c {
                '\n' => self.token(TokenKind::Newline, start, "\n"),
                '\r' => {
                    let mut text = String::from("\r");
                    if self.peek(0) == Some('\n') {
                        self.bump();
                        text.push('\n');
                    }
                    self.token(TokenKind::Newline, start, text)
                }
                c if c.is_whitespace() => continue,

                '/' => match self.peek(0) {
                    Some('/') => {
                        self.bump();
                        self.lex_line_comment(start)
                    }
                    Some('*') => {
                        self.bump();
                        self.lex_block_comment(start)?
                    }
                    Some('=') => {
                        self.bump();
                        self.token(TokenKind::SlashEqual, start, "/=")
                    }
                    _ => self.token(TokenKind::Slash, start, "/"),
                },

                '=' => self.one_or_two(start, '=', TokenKind::Equal, TokenKind::EqualEqual),
                '!' => self.one_or_two(start, '=', TokenKind::Bang, TokenKind::BangEqual),
                '<' => self.one_or_two(start, '=', TokenKind::AngleOpen, TokenKind::LessEqual),
                '>' => self.one_or_two(start, '=', TokenKind::AngleClose, TokenKind::GreaterEqual),
                '&' => self.one_or_two(start, '&', TokenKind::Ampersand, TokenKind::AmpAmp),
                '|' => self.one_or_two(start, '|', TokenKind::Pipe, TokenKind::PipePipe),
                '+' => self.one_or_two(start, '=', TokenKind::Plus, TokenKind::PlusEqual),
                '-' => self.one_or_two(start, '=', TokenKind::Minus, TokenKind::MinusEqual),
                '*' => self.one_or_two(start, '=', TokenKind::Star, TokenKind::StarEqual),

                '{' => self.token(TokenKind::CurlyOpen, start, "{"),
                '}' => self.token(TokenKind::CurlyClose, start, "}"),
                '[' => self.token(TokenKind::SquareOpen, start, "["),
                ']' => self.token(TokenKind::SquareClose, start, "]"),
                '(' => self.token(TokenKind::ParenOpen, start, "("),
                ')' => self.token(TokenKind::ParenClose, start, ")"),
                ',' => self.token(TokenKind::Comma, start, ","),
                ':' => self.token(TokenKind::Colon, start, ":"),
                ';' => self.token(TokenKind::Semicolon, start, ";"),
                '@' => self.token(TokenKind::At, start, "@"),
                '$' => self.token(TokenKind::Dollar, start, "$"),
                '~' => self.token(TokenKind::Tilde, start, "~"),
                '?' => self.token(TokenKind::Question, start, "?"),
                '^' => self.token(TokenKind::Caret, start, "^"),
                '%' => self.token(TokenKind::Percent, start, "%"),

                '.' => match self.peek(0) {
                    Some(d) if d.is_ascii_digit() => self.lex_float_fraction(start, String::new())?,
                    _ => self.token(TokenKind::Dot, start, "."),
                },

                '"' => self.lex_delimited(start, '"', TokenKind::Text)?,
                '`' => self.lex_delimited(start, '`', TokenKind::Prose)?,

                '0' if matches!(self.peek(0), Some('x' | 'X')) && self.peek(1) == Some('"') => {
                    self.bump();
                    self.bump();
                    self.lex_delimited(start, '"', TokenKind::Data)?
                }

                c if c.is_ascii_digit() => self.lex_number(c, start)?,

                c if c == '_' || c.is_alphabetic() => {
                    let mut text = String::from(c);
                    self.take_while(&mut text, |c| c == '_' || c.is_alphanumeric());
                    let kind = match Keyword::lookup(&text) {
                        Some(kw) => TokenKind::Keyword(kw),
                        None => TokenKind::Identifier,
                    };
                    self.token(kind, start, text)
                }

                other => {
                    self.report(
                        ErrorCode::UnexpectedToken,
                        format!("unexpected character {other:?}"),
                        at,
                    )?;
                    continue;
                }
            };
            return Ok(Some(token));
        }
    }

    fn one_or_two(
        &mut self,
        start: Location,
        second: char,
        single: TokenKind,
        double: TokenKind,
    ) -> Token {
        if self.peek(0) == Some(second) {
            self.bump();
            self.token(double, start, double.to_string())
        } else {
            self.token(single, start, single.to_string())
        }
    }

    fn take_while(&mut self, buf: &mut String, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek(0) {
            if !pred(c) {
                break;
            }
            self.bump();
            buf.push(c);
        }
    }

    fn lex_line_comment(&mut self, start: Location) -> Token {
        let mut text = String::new();
        self.take_while(&mut text, |c| c != '\n' && c != '\r');
        self.token(TokenKind::CommentLine, start, text)
    }

    fn lex_block_comment(&mut self, start: Location) -> Result<Token, Diagnostic> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('*') if self.peek(0) == Some('/') => {
                    self.bump();
                    return Ok(self.token(TokenKind::CommentBlock, start, text));
                }
                Some(c) => text.push(c),
                None => {
                    self.report(
                        ErrorCode::UnexpectedEof,
                        "unterminated block comment",
                        start,
                    )?;
                    return Ok(self.token(TokenKind::CommentBlock, start, text));
                }
            }
        }
    }

    /// Text, prose, and data literals share the same shape: everything up to
    /// the closing delimiter, with `\<delim>` as the only recognized escape.
    /// Other escape sequences are preserved literally. Multi-line content is
    /// permitted.
    fn lex_delimited(
        &mut self,
        start: Location,
        delim: char,
        kind: TokenKind,
    ) -> Result<Token, Diagnostic> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('\\') if self.peek(0) == Some(delim) => {
                    self.bump();
                    text.push(delim);
                }
                Some(c) if c == delim => return Ok(self.token(kind, start, text)),
                Some(c) => text.push(c),
                None => {
                    let what = match kind {
                        TokenKind::Prose => "prose literal",
                        TokenKind::Data => "data literal",
                        _ => "text literal",
                    };
                    self.report(
                        ErrorCode::UnexpectedEof,
                        format!("unterminated {what}"),
                        start,
                    )?;
                    return Ok(self.token(kind, start, text));
                }
            }
        }
    }

    fn lex_number(&mut self, first: char, start: Location) -> Result<Token, Diagnostic> {
        let mut text = String::from(first);
        let token = if first == '0' {
            match self.peek(0) {
                Some(c @ ('x' | 'X')) => {
                    self.bump();
                    text.push(c);
                    self.lex_hex(start, text)?
                }
                Some(c @ ('o' | 'O')) => {
                    self.bump();
                    text.push(c);
                    self.take_while(&mut text, |c| matches!(c, '0'..='7' | '_'));
                    self.token(TokenKind::Integer, start, text)
                }
                Some(c @ ('b' | 'B')) => {
                    self.bump();
                    text.push(c);
                    self.take_while(&mut text, |c| matches!(c, '0' | '1' | '_'));
                    self.token(TokenKind::Integer, start, text)
                }
                Some('.') if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.bump();
                    self.lex_float_fraction(start, text)?
                }
                Some('e' | 'E') => self.lex_decimal_tail(start, text)?,
                // leading 0 followed by octal digits, for compatibility
                Some('0'..='7' | '_') => {
                    self.take_while(&mut text, |c| matches!(c, '0'..='7' | '_'));
                    self.token(TokenKind::Integer, start, text)
                }
                _ => self.token(TokenKind::Integer, start, text),
            }
        } else {
            self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
            self.lex_decimal_tail(start, text)?
        };
        self.check_number_junk(token)
    }

    /// Fraction and exponent of a decimal literal whose integer digits (and
    /// dot, when reached through the leading-dot form) are already consumed.
    fn lex_decimal_tail(&mut self, start: Location, mut text: String) -> Result<Token, Diagnostic> {
        let mut float = false;
        if self.peek(0) == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            text.push('.');
            self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
            float = true;
        }
        if let Some(e @ ('e' | 'E')) = self.peek(0) {
            let sign = matches!(self.peek(1), Some('+' | '-'));
            let digits_at = if sign { 2 } else { 1 };
            if self.peek(digits_at).is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
                text.push(e);
                if sign {
                    let s = self.bump().unwrap_or_default();
                    text.push(s);
                }
                self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
                float = true;
            }
        }
        let kind = if float {
            TokenKind::Float
        } else {
            TokenKind::Integer
        };
        Ok(self.token(kind, start, text))
    }

    /// `.digits` float form; `text` holds whatever preceded the dot.
    fn lex_float_fraction(&mut self, start: Location, text: String) -> Result<Token, Diagnostic> {
        let mut text = text;
        text.push('.');
        self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
        if let Some(e @ ('e' | 'E')) = self.peek(0) {
            let sign = matches!(self.peek(1), Some('+' | '-'));
            let digits_at = if sign { 2 } else { 1 };
            if self.peek(digits_at).is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
                text.push(e);
                if sign {
                    let s = self.bump().unwrap_or_default();
                    text.push(s);
                }
                self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
            }
        }
        let token = self.token(TokenKind::Float, start, text);
        self.check_number_junk(token)
    }

    /// `0x` hexadecimal integer or `0xhex(.hex)?[pP][+-]?dec` float.
    fn lex_hex(&mut self, start: Location, mut text: String) -> Result<Token, Diagnostic> {
        self.take_while(&mut text, |c| c.is_ascii_hexdigit() || c == '_');
        if text.len() == 2 {
            let token = self.token(TokenKind::Integer, start, text);
            self.report(
                ErrorCode::InvalidNumber,
                format!("hex literal `{}` has no digits", token.text),
                start,
            )?;
            return Ok(token);
        }
        let mut float = false;
        if self.peek(0) == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_hexdigit()) {
            self.bump();
            text.push('.');
            self.take_while(&mut text, |c| c.is_ascii_hexdigit() || c == '_');
            float = true;
        }
        match self.peek(0) {
            Some(p @ ('p' | 'P')) => {
                self.bump();
                text.push(p);
                if let Some(s @ ('+' | '-')) = self.peek(0) {
                    self.bump();
                    text.push(s);
                }
                if !self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    let token = self.token(TokenKind::Float, start, text);
                    self.report(
                        ErrorCode::InvalidNumber,
                        format!("hex float `{}` is missing its exponent digits", token.text),
                        start,
                    )?;
                    return Ok(token);
                }
                self.take_while(&mut text, |c| c.is_ascii_digit() || c == '_');
                Ok(self.token(TokenKind::Float, start, text))
            }
            _ if float => {
                // a hex fraction requires a binary exponent
                let token = self.token(TokenKind::Float, start, text);
                self.report(
                    ErrorCode::InvalidNumber,
                    format!("hex float `{}` is missing a `p` exponent", token.text),
                    start,
                )?;
                Ok(token)
            }
            _ => Ok(self.token(TokenKind::Integer, start, text)),
        }
    }

    /// A number immediately followed by identifier characters is malformed;
    /// the junk is folded into the token text so the caller sees the whole
    /// run.
    fn check_number_junk(&mut self, mut token: Token) -> Result<Token, Diagnostic> {
        if self.peek(0).is_some_and(|c| c == '_' || c.is_alphanumeric()) {
            self.take_while(&mut token.text, |c| c == '_' || c.is_alphanumeric());
            token.span.end = self.scan.location();
            self.report(
                ErrorCode::InvalidNumber,
                format!("malformed number literal `{}`", token.text),
                token.span.start,
            )?;
        }
        Ok(token)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, Diagnostic>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

/// Bounded N-token peek over an iterator of tokens.
pub struct Lookahead<I> {
    inner: I,
    pending: VecDeque<Token>,
    done: bool,
}

impl<I: Iterator<Item = Result<Token, Diagnostic>>> Lookahead<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            pending: VecDeque::with_capacity(MAX_TOKEN_PEEK),
            done: false,
        }
    }

    pub fn next(&mut self) -> Result<Option<Token>, Diagnostic> {
        self.fill(1)?;
        Ok(self.pending.pop_front())
    }

    /// Peeks `n` tokens ahead without consuming; `peek(0)` is the next token.
    /// `n` must be below [`MAX_TOKEN_PEEK`].
    pub fn peek(&mut self, n: usize) -> Result<Option<&Token>, Diagnostic> {
        debug_assert!(n < MAX_TOKEN_PEEK);
        self.fill(n + 1)?;
        Ok(self.pending.get(n))
    }

    fn fill(&mut self, want: usize) -> Result<(), Diagnostic> {
        while !self.done && self.pending.len() < want.min(MAX_TOKEN_PEEK) {
            match self.inner.next().transpose()? {
                Some(token) => self.pending.push_back(token),
                None => self.done = true,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<Token> {
        let reporter = Reporter::new();
        Lexer::new("/test.mgdl", src.as_bytes(), &reporter)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex_all(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_compounds() {
        use TokenKind::*;
        assert_eq!(
            kinds("{ } [ ] ( ) < > , . : ; @ $ ~ ? | & ^ % + - * / ! ="),
            vec![
                CurlyOpen, CurlyClose, SquareOpen, SquareClose, ParenOpen, ParenClose, AngleOpen,
                AngleClose, Comma, Dot, Colon, Semicolon, At, Dollar, Tilde, Question, Pipe,
                Ampersand, Caret, Percent, Plus, Minus, Star, Slash, Bang, Equal,
            ]
        );
        assert_eq!(
            kinds("== != <= >= && || += -= *= /="),
            vec![
                EqualEqual, BangEqual, LessEqual, GreaterEqual, AmpAmp, PipePipe, PlusEqual,
                MinusEqual, StarEqual, SlashEqual,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = lex_all("struct Foo syntax bar_2");
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Struct));
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].text, "Foo");
        assert_eq!(tokens[2].kind, TokenKind::Keyword(Keyword::Syntax));
        assert_eq!(tokens[3].kind, TokenKind::Identifier);
        assert_eq!(tokens[3].text, "bar_2");
    }

    #[test]
    fn test_text_literal_escapes() {
        let tokens = lex_all(r#""hello \"world\" \n still""#);
        assert_eq!(tokens[0].kind, TokenKind::Text);
        // \" collapses, other escapes stay literal
        assert_eq!(tokens[0].text, "hello \"world\" \\n still");
    }

    #[test]
    fn test_multiline_text_literal() {
        let tokens = lex_all("\"line one\nline two\" x");
        assert_eq!(tokens[0].kind, TokenKind::Text);
        assert_eq!(tokens[0].text, "line one\nline two");
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].span.start.line, 2);
    }

    #[test]
    fn test_prose_and_data_literals() {
        let tokens = lex_all(r#"`some \` prose` 0x"DEADBEEF""#);
        assert_eq!(tokens[0].kind, TokenKind::Prose);
        assert_eq!(tokens[0].text, "some ` prose");
        assert_eq!(tokens[1].kind, TokenKind::Data);
        assert_eq!(tokens[1].text, "DEADBEEF");
    }

    #[test]
    fn test_integer_literals() {
        let tokens = lex_all("0 42 1_000 0xFF_AA 0o755 0755 0b1010_0001 0O17");
        for t in &tokens {
            assert_eq!(t.kind, TokenKind::Integer, "{}", t.text);
        }
        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["0", "42", "1_000", "0xFF_AA", "0o755", "0755", "0b1010_0001", "0O17"]
        );
    }

    #[test]
    fn test_float_literals() {
        let tokens = lex_all("1.5 0.25 .5 1e10 2.5e-3 1_0.0_1e+2 0x1Fp3 0x1.8p-2");
        for t in &tokens {
            assert_eq!(t.kind, TokenKind::Float, "{}", t.text);
        }
        assert_eq!(tokens[2].text, ".5");
        assert_eq!(tokens[5].text, "1_0.0_1e+2");
        assert_eq!(tokens[7].text, "0x1.8p-2");
    }

    #[test]
    fn test_number_followed_by_dot_not_float() {
        // `1.foo` is an integer, a dot, and an identifier
        use TokenKind::*;
        assert_eq!(kinds("1.foo"), vec![Integer, Dot, Identifier]);
    }

    #[test]
    fn test_comments() {
        let tokens = lex_all("// line note\n/* block\nnote */");
        assert_eq!(tokens[0].kind, TokenKind::CommentLine);
        assert_eq!(tokens[0].text, " line note");
        assert_eq!(tokens[1].kind, TokenKind::Newline);
        assert_eq!(tokens[2].kind, TokenKind::CommentBlock);
        assert_eq!(tokens[2].text, " block\nnote ");
    }

    #[test]
    fn test_newline_tokens() {
        use TokenKind::*;
        assert_eq!(kinds("a\nb\r\nc\rd"), vec![
            Identifier, Newline, Identifier, Newline, Identifier, Newline, Identifier
        ]);
    }

    #[test]
    fn test_unterminated_text_reports_and_returns_partial() {
        let reporter = Reporter::new();
        reporter.allow_non_fatal([ErrorCode::UnexpectedEof]);
        let mut lexer = Lexer::new("/test.mgdl", b"\"partial", &reporter);
        let token = lexer.next_token().unwrap().unwrap();
        assert_eq!(token.kind, TokenKind::Text);
        assert_eq!(token.text, "partial");
        let diags = reporter.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, ErrorCode::UnexpectedEof);
    }

    #[test]
    fn test_unterminated_text_fatal_by_default() {
        let reporter = Reporter::new();
        let mut lexer = Lexer::new("/test.mgdl", b"\"partial", &reporter);
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnexpectedEof);
    }

    #[test]
    fn test_malformed_number_reported() {
        let reporter = Reporter::new();
        reporter.allow_non_fatal([ErrorCode::InvalidNumber]);
        let mut lexer = Lexer::new("/test.mgdl", b"123abc", &reporter);
        let token = lexer.next_token().unwrap().unwrap();
        assert_eq!(token.text, "123abc");
        assert_eq!(reporter.diagnostics()[0].code, ErrorCode::InvalidNumber);
    }

    #[test]
    fn test_spans() {
        let tokens = lex_all("ab cd");
        assert_eq!(tokens[0].span.start.column, 1);
        assert_eq!(tokens[0].span.end.column, 3);
        assert_eq!(tokens[1].span.start.column, 4);
        assert_eq!(tokens[1].span.start.offset, 3);
    }

    #[test]
    fn test_lookahead_bound() {
        let reporter = Reporter::new();
        let lexer = Lexer::new("/test.mgdl", b"a b c d e f g h i j", &reporter);
        let mut la = Lookahead::new(lexer);
        assert_eq!(la.peek(0).unwrap().unwrap().text, "a");
        assert_eq!(la.peek(7).unwrap().unwrap().text, "h");
        assert_eq!(la.next().unwrap().unwrap().text, "a");
        assert_eq!(la.peek(7).unwrap().unwrap().text, "i");
        for expected in ["b", "c", "d", "e", "f", "g", "h", "i", "j"] {
            assert_eq!(la.next().unwrap().unwrap().text, expected);
        }
        assert!(la.next().unwrap().is_none());
    }
}
