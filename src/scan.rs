use std::collections::VecDeque;
use std::{error, fmt};

use crate::source::Location;

/// Upper bound on code-point lookahead.
pub const MAX_PEEK: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte sequence that does not decode as UTF-8.
    InvalidUtf8(Location),
    /// A BOM anywhere but offset 0, or a second BOM.
    MisplacedBom(Location),
}

impl Error {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::InvalidUtf8(at) | Self::MisplacedBom(at) => *at,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8(at) => write!(f, "invalid UTF-8 sequence at {at}"),
            Self::MisplacedBom(at) => write!(f, "misplaced byte order mark at {at}"),
        }
    }
}

impl error::Error for Error {}

const BOM: char = '\u{feff}';

/// Decoded UTF-8 code-point stream with bounded lookahead.
///
/// A single BOM is permitted only at offset 0. NUL is treated as end of
/// input. Line numbers advance on `\n`, `\r`, and `\r\n` (the pair counted
/// once); columns count code points and restart at each line break.
#[derive(Debug, Clone)]
pub struct Scanner<'input> {
    bytes: &'input [u8],
    pending: VecDeque<(char, Location)>,
    next: Location,
    last_was_cr: bool,
    bom_seen: bool,
    eof: bool,
}

impl<'input> Scanner<'input> {
    #[must_use]
    pub fn new(bytes: &'input [u8]) -> Self {
        Self {
            bytes,
            pending: VecDeque::with_capacity(MAX_PEEK),
            next: Location::start_of_file(),
            last_was_cr: false,
            bom_seen: false,
            eof: false,
        }
    }

    /// Location of the next unread code point (or of end of input).
    #[must_use]
    pub fn location(&self) -> Location {
        self.pending.front().map(|(_, at)| *at).unwrap_or(self.next)
    }

    /// Consumes and returns the next code point with its location.
    pub fn next(&mut self) -> Result<Option<(char, Location)>, Error> {
        self.fill(1)?;
        Ok(self.pending.pop_front())
    }

    /// Peeks `n` code points ahead without consuming; `peek(0)` is the next
    /// code point. `n` must be below [`MAX_PEEK`].
    pub fn peek(&mut self, n: usize) -> Result<Option<char>, Error> {
        debug_assert!(n < MAX_PEEK);
        self.fill(n + 1)?;
        Ok(self.pending.get(n).map(|(c, _)| *c))
    }

    /// Discards buffered lookahead and raw bytes up to and including the next
    /// line-feed byte. Used by the lexer to resynchronize after a bad code
    /// point.
    pub fn resync_after_line_break(&mut self) {
        self.pending.clear();
        let mut offset = self.next.offset as usize;
        while let Some(&b) = self.bytes.get(offset) {
            offset += 1;
            if b == b'\n' {
                break;
            }
        }
        self.next = Location {
            line: self.next.line + 1,
            column: 1,
            offset: offset as u64,
        };
        self.last_was_cr = false;
    }

    fn fill(&mut self, want: usize) -> Result<(), Error> {
        while self.pending.len() < want.min(MAX_PEEK) {
            match self.decode_one()? {
                Some(entry) => self.pending.push_back(entry),
                None => break,
            }
        }
        Ok(())
    }

    fn decode_one(&mut self) -> Result<Option<(char, Location)>, Error> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let offset = self.next.offset as usize;
            let Some(&lead) = self.bytes.get(offset) else {
                self.eof = true;
                return Ok(None);
            };
            if lead == 0 {
                // NUL terminates the stream
                self.eof = true;
                return Ok(None);
            }
            let width = match lead {
                0x01..=0x7f => 1,
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                _ => return Err(Error::InvalidUtf8(self.next)),
            };
            let Some(raw) = self.bytes.get(offset..offset + width) else {
                return Err(Error::InvalidUtf8(self.next));
            };
            let c = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.chars().next())
                .ok_or(Error::InvalidUtf8(self.next))?;

            if c == BOM {
                if self.next.offset == 0 && !self.bom_seen {
                    self.bom_seen = true;
                    self.next.offset = width as u64;
                    continue;
                }
                return Err(Error::MisplacedBom(self.next));
            }

            let at = self.next;
            self.advance(c, width);
            return Ok(Some((c, at)));
        }
    }

    fn advance(&mut self, c: char, width: usize) {
        self.next.offset += width as u64;
        match c {
            '\r' => {
                self.next.line += 1;
                self.next.column = 1;
                self.last_was_cr = true;
            }
            '\n' if self.last_was_cr => {
                // second half of \r\n, already counted
                self.last_was_cr = false;
            }
            '\n' => {
                self.next.line += 1;
                self.next.column = 1;
            }
            _ => {
                self.next.column += 1;
                self.last_was_cr = false;
            }
        }
    }
}

#[test]
fn test_scan_lines_and_columns() {
    let mut s = Scanner::new("ab\ncd\r\ne".as_bytes());
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.line, at.column, at.offset), ('a', 1, 1, 0));
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.line, at.column, at.offset), ('b', 1, 2, 1));
    let (c, _) = s.next().unwrap().unwrap();
    assert_eq!(c, '\n');
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.line, at.column), ('c', 2, 1));
    let (_, _) = s.next().unwrap().unwrap();
    let (c, _) = s.next().unwrap().unwrap();
    assert_eq!(c, '\r');
    let (c, _) = s.next().unwrap().unwrap();
    assert_eq!(c, '\n');
    // \r\n counted as one break
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.line, at.column), ('e', 3, 1));
    assert_eq!(s.next().unwrap(), None);
}

#[test]
fn test_scan_peek_bound() {
    let mut s = Scanner::new(b"abcdefghij");
    assert_eq!(s.peek(0).unwrap(), Some('a'));
    assert_eq!(s.peek(7).unwrap(), Some('h'));
    assert_eq!(s.peek(3).unwrap(), Some('d'));
    assert_eq!(s.next().unwrap().unwrap().0, 'a');
    assert_eq!(s.peek(7).unwrap(), Some('i'));
}

#[test]
fn test_scan_bom_rules() {
    let mut with_bom = Vec::from("\u{feff}ok".as_bytes());
    let mut s = Scanner::new(&with_bom);
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.offset), ('o', 3));
    assert_eq!(s.next().unwrap().unwrap().0, 'k');

    with_bom.extend_from_slice("\u{feff}".as_bytes());
    let mut s = Scanner::new(&with_bom);
    s.next().unwrap();
    s.next().unwrap();
    assert!(matches!(s.next(), Err(Error::MisplacedBom(_))));
}

#[test]
fn test_scan_nul_is_eof() {
    let mut s = Scanner::new(b"a\0b");
    assert_eq!(s.next().unwrap().unwrap().0, 'a');
    assert_eq!(s.next().unwrap(), None);
    assert_eq!(s.next().unwrap(), None);
}

#[test]
fn test_scan_invalid_utf8_resync() {
    let mut s = Scanner::new(b"a\xffb\nc");
    assert_eq!(s.next().unwrap().unwrap().0, 'a');
    assert!(matches!(s.next(), Err(Error::InvalidUtf8(_))));
    s.resync_after_line_break();
    let (c, at) = s.next().unwrap().unwrap();
    assert_eq!((c, at.line), ('c', 2));
}
