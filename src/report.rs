use std::collections::HashSet;
use std::fmt;

use num_enum::TryFromPrimitive;
use parking_lot::Mutex;

use crate::source::Location;

/// Exported diagnostic codes.
///
/// The numeric value is stable and rendered as `MNNNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    UnknownFatal = 0,
    FileNotFound = 1,
    UnsupportedFileSystemOperation = 2,
    PermissionDenied = 3,
    UnsupportedFileFormat = 4,
    UnexpectedEof = 5,
    ProtobufParseError = 6,
    InvalidNumber = 7,
    UnexpectedToken = 8,
    InvalidLiteral = 9,
    UidCollision = 10,
    NameCollision = 11,
    UnknownImport = 12,
    UnknownType = 13,
    UnknownIdentifier = 14,
    UnknownReference = 15,
    UnresolvedReference = 16,
    TypeParameterError = 17,
    WrongTypeKind = 18,
    WrongTypeForApi = 19,
    WrongTypeValue = 20,
    Unimplemented = 21,
    UnknownFieldInStructLiteral = 22,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{:04}", *self as u16)
    }
}

/// A single reported problem: code, message, and where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub message: String,
    /// URI of the offending file, when known.
    pub uri: Option<String>,
    /// Position inside the file, when known.
    pub location: Option<Location>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            uri: None,
            location: None,
        }
    }

    #[must_use]
    pub fn at(mut self, uri: impl Into<String>, location: Location) -> Self {
        self.uri = Some(uri.into());
        self.location = Some(location);
        self
    }

    #[must_use]
    pub fn in_file(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Key used to order diagnostics for display; accumulation order across
    /// workers is non-deterministic.
    #[must_use]
    pub fn sort_key(&self) -> (String, u64, u16) {
        (
            self.uri.clone().unwrap_or_default(),
            self.location.map(|l| l.offset).unwrap_or(0),
            self.code as u16,
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        match (&self.uri, &self.location) {
            (Some(uri), Some(loc)) => write!(f, " ({uri}:{loc})"),
            (Some(uri), None) => write!(f, " ({uri})"),
            (None, Some(loc)) => write!(f, " ({loc})"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for Diagnostic {}

#[derive(Debug, Default)]
struct ReporterInner {
    diagnostics: Vec<Diagnostic>,
    non_fatal: HashSet<ErrorCode>,
}

/// Thread-safe accumulator of diagnostics.
///
/// Reporting a code classified non-fatal records the diagnostic and lets the
/// caller continue; reporting a fatal code hands the diagnostic back so the
/// caller can abort its current unit of work. The default non-fatal set is
/// empty.
#[derive(Debug, Default)]
pub struct Reporter {
    inner: Mutex<ReporterInner>,
}

impl Reporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Widens the set of codes treated as non-fatal.
    pub fn allow_non_fatal<I: IntoIterator<Item = ErrorCode>>(&self, codes: I) {
        self.inner.lock().non_fatal.extend(codes);
    }

    /// Records `diagnostic`. Returns `Err` with the same diagnostic when its
    /// code is fatal under the current policy.
    pub fn report(&self, diagnostic: Diagnostic) -> Result<(), Diagnostic> {
        let mut inner = self.inner.lock();
        let fatal = !inner.non_fatal.contains(&diagnostic.code);
        inner.diagnostics.push(diagnostic.clone());
        if fatal { Err(diagnostic) } else { Ok(()) }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().diagnostics.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().diagnostics.len()
    }

    /// Snapshot of everything reported so far, in arrival order.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.lock().diagnostics.clone()
    }
}

#[test]
fn test_code_display() {
    assert_eq!(ErrorCode::UnknownFatal.to_string(), "M0000");
    assert_eq!(ErrorCode::UnexpectedToken.to_string(), "M0008");
    assert_eq!(ErrorCode::UnknownFieldInStructLiteral.to_string(), "M0022");
    assert!(matches!(ErrorCode::try_from(13u16), Ok(ErrorCode::UnknownType)));
    assert!(ErrorCode::try_from(23u16).is_err());
}

#[test]
fn test_fatality_policy() {
    let reporter = Reporter::new();
    let diag = Diagnostic::new(ErrorCode::UnexpectedToken, "boom");
    assert!(reporter.report(diag.clone()).is_err());

    reporter.allow_non_fatal([ErrorCode::UnexpectedToken]);
    assert!(reporter.report(diag).is_ok());
    assert_eq!(reporter.len(), 2);
}
