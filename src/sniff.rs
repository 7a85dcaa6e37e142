use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::scan::Scanner;

/// Input dialects this compiler ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Native MDL (`microglot0`, `microglot1`).
    Mdl,
    /// Protobuf syntax (`proto2`, `proto3`).
    Pdl,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Start,
    SawSyntax,
    SawEqual,
}

/// Scans just enough of `bytes` to find the first `syntax = "<name>"`
/// directive and picks the dialect to dispatch to.
///
/// The sniffer is a minimal lexer: it recognizes newlines, the `syntax`
/// keyword, `=`, and text literals; every other character resets the match.
/// A missing or unknown directive is a fatal `UnsupportedFileFormat`.
pub fn sniff(uri: &str, bytes: &[u8], reporter: &Reporter) -> Result<Dialect, Diagnostic> {
    let mut scan = Scanner::new(bytes);
    let mut state = State::Start;

    let unsupported = |message: String| {
        let diagnostic = Diagnostic::new(ErrorCode::UnsupportedFileFormat, message).in_file(uri);
        // no dialect means no way forward, whatever the fatality policy says
        let _ = reporter.report(diagnostic.clone());
        Err(diagnostic)
    };

    loop {
        let (c, _) = match scan.next() {
            Ok(Some(next)) => next,
            Ok(None) => {
                return unsupported(format!("{uri} carries no syntax directive"));
            }
            Err(err) => {
                return unsupported(err.to_string());
            }
        };
        match c {
            ' ' | '\t' => {}
            '\n' | '\r' => state = State::Start,
            '=' => {
                state = match state {
                    State::SawSyntax => State::SawEqual,
                    _ => State::Start,
                };
            }
            '"' => {
                let mut name = String::new();
                loop {
                    match scan.next() {
                        Ok(Some(('\\', _))) if scan.peek(0).ok().flatten() == Some('"') => {
                            scan.next().ok();
                            name.push('"');
                        }
                        Ok(Some(('"', _))) => break,
                        Ok(Some((c, _))) => name.push(c),
                        Ok(None) | Err(_) => {
                            return unsupported(format!("{uri} carries no syntax directive"));
                        }
                    }
                }
                if state == State::SawEqual {
                    return match name.as_str() {
                        "microglot0" | "microglot1" => Ok(Dialect::Mdl),
                        "proto2" | "proto3" => Ok(Dialect::Pdl),
                        other => unsupported(format!("unsupported syntax {other:?} in {uri}")),
                    };
                }
                state = State::Start;
            }
            c if c == '_' || c.is_alphanumeric() => {
                let mut word = String::from(c);
                while let Ok(Some(n)) = scan.peek(0) {
                    if n != '_' && !n.is_alphanumeric() {
                        break;
                    }
                    scan.next().ok();
                    word.push(n);
                }
                state = if word == "syntax" {
                    State::SawSyntax
                } else {
                    State::Start
                };
            }
            _ => state = State::Start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sniff_ok(src: &str) -> Dialect {
        sniff("/test", src.as_bytes(), &Reporter::new()).unwrap()
    }

    #[test]
    fn test_sniff_dialects() {
        assert_eq!(sniff_ok("syntax = \"microglot0\"\n"), Dialect::Mdl);
        assert_eq!(sniff_ok("syntax = \"microglot1\"\n"), Dialect::Mdl);
        assert_eq!(sniff_ok("syntax = \"proto2\";\n"), Dialect::Pdl);
        assert_eq!(sniff_ok("\n\nsyntax=\"proto3\";\nmessage M {}\n"), Dialect::Pdl);
    }

    #[test]
    fn test_sniff_unknown_or_missing() {
        let reporter = Reporter::new();
        let err = sniff("/t", b"syntax = \"proto9\"\n", &reporter).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFileFormat);
        let err = sniff("/t", b"struct Foo {}\n", &reporter).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFileFormat);
        assert_eq!(reporter.len(), 2);
    }

    #[test]
    fn test_sniff_resets_across_lines() {
        // directive parts split across lines never match
        let reporter = Reporter::new();
        assert!(sniff("/t", b"syntax\n= \"microglot0\"\n", &reporter).is_err());
    }
}
