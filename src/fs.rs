use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::report::{Diagnostic, ErrorCode};

/// What a file's extension says it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `.mgdl` MDL source.
    Mdl,
    /// `.proto` PDL source.
    Pdl,
    /// `.mgdlbin` encoded descriptor, reserved.
    MdlBin,
    /// `.mgdljson` encoded descriptor, reserved.
    MdlJson,
    /// `.mgdlproto` encoded descriptor, reserved.
    MdlProto,
    /// `.protoset` PDL descriptor set.
    PdlDesc,
    /// Anything else.
    None,
}

impl FileKind {
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("mgdl") => Self::Mdl,
            Some("proto") => Self::Pdl,
            Some("mgdlbin") => Self::MdlBin,
            Some("mgdljson") => Self::MdlJson,
            Some("mgdlproto") => Self::MdlProto,
            Some("protoset") => Self::PdlDesc,
            _ => Self::None,
        }
    }
}

/// One openable input file. `body` must hand out a fresh reader per call;
/// multiple readers may be live concurrently.
pub trait FileHandle: Send + Sync + std::fmt::Debug {
    fn path(&self) -> &str;
    fn kind(&self) -> FileKind;
    fn body(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Where the compiler gets its bytes. A file URI yields one handle; a
/// directory yields handles for every file with a known extension.
pub trait FileSource: Send + Sync {
    fn open(&self, uri: &str) -> Result<Vec<Box<dyn FileHandle>>, Diagnostic>;
}

/// Canonical form of an input URI: non-file schemes pass through, `file:`
/// URIs become plain absolute paths, relative paths are joined to `/`.
#[must_use]
pub fn normalize_uri(uri: &str) -> String {
    if let Some(rest) = uri.strip_prefix("file://") {
        return normalize_uri(rest);
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return uri.to_string();
        }
    }
    if uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{uri}")
    }
}

/// Root directories searched for imports that do not resolve as given.
#[must_use]
pub fn default_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        let mut roots = Vec::new();
        if let Ok(profile) = std::env::var("USERPROFILE") {
            roots.push(PathBuf::from(profile).join("AppData\\Local\\microglot\\idl"));
        }
        if let Ok(drive) = std::env::var("SystemDrive") {
            roots.push(PathBuf::from(format!("{drive}\\ProgramData\\microglot\\idl")));
        }
        roots
    } else {
        let dirs = std::env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share/:/usr/share/".to_string());
        dirs.split(':')
            .filter(|d| !d.is_empty())
            .map(|d| Path::new(d).join("microglot"))
            .collect()
    }
}

#[derive(Debug)]
struct OsFileHandle {
    path: String,
    kind: FileKind,
}

impl FileHandle for OsFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn body(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }
}

/// OS-backed file source with optional search roots.
pub struct OsFileSource {
    roots: Vec<PathBuf>,
}

impl OsFileSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: default_roots(),
        }
    }

    #[must_use]
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn locate(&self, uri: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(uri);
        if direct.exists() {
            return Some(direct);
        }
        let relative = uri.trim_start_matches('/');
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.exists())
    }
}

impl Default for OsFileSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSource for OsFileSource {
    fn open(&self, uri: &str) -> Result<Vec<Box<dyn FileHandle>>, Diagnostic> {
        let normalized = normalize_uri(uri);
        let Some(path) = self.locate(&normalized) else {
            return Err(
                Diagnostic::new(ErrorCode::FileNotFound, format!("{uri} not found"))
                    .in_file(normalized),
            );
        };
        if path.is_dir() {
            let entries = std::fs::read_dir(&path)
                .map_err(|err| io_diagnostic(&normalized, &err))?
                .collect::<io::Result<Vec<_>>>()
                .map_err(|err| io_diagnostic(&normalized, &err))?;
            let mut handles: Vec<Box<dyn FileHandle>> = Vec::new();
            for entry in entries {
                let entry_path = entry.path().to_string_lossy().into_owned();
                let kind = FileKind::from_path(&entry_path);
                if kind == FileKind::None || !entry.path().is_file() {
                    log::debug!("skipping {entry_path}: unknown extension");
                    continue;
                }
                handles.push(Box::new(OsFileHandle {
                    path: entry_path,
                    kind,
                }));
            }
            return Ok(handles);
        }
        let path = path.to_string_lossy().into_owned();
        let kind = FileKind::from_path(&path);
        Ok(vec![Box::new(OsFileHandle { path, kind })])
    }
}

fn io_diagnostic(uri: &str, err: &io::Error) -> Diagnostic {
    let code = match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        _ => ErrorCode::UnsupportedFileSystemOperation,
    };
    Diagnostic::new(code, err.to_string()).in_file(uri.to_string())
}

/// In-memory file source, the seam used by embedding tools and the driver
/// tests.
#[derive(Default)]
pub struct MemoryFileSource {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFileSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.files.insert(normalize_uri(&uri.into()), body.into());
    }
}

#[derive(Debug)]
struct MemoryFileHandle {
    path: String,
    body: Vec<u8>,
}

impl FileHandle for MemoryFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> FileKind {
        FileKind::from_path(&self.path)
    }

    fn body(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(self.body.clone())))
    }
}

impl FileSource for MemoryFileSource {
    fn open(&self, uri: &str) -> Result<Vec<Box<dyn FileHandle>>, Diagnostic> {
        let normalized = normalize_uri(uri);
        match self.files.get(&normalized) {
            Some(body) => Ok(vec![Box::new(MemoryFileHandle {
                path: normalized,
                body: body.clone(),
            })]),
            None => Err(
                Diagnostic::new(ErrorCode::FileNotFound, format!("{uri} not found"))
                    .in_file(normalized),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_kind_by_extension() {
        assert_eq!(FileKind::from_path("/a/b.mgdl"), FileKind::Mdl);
        assert_eq!(FileKind::from_path("b.proto"), FileKind::Pdl);
        assert_eq!(FileKind::from_path("b.mgdlbin"), FileKind::MdlBin);
        assert_eq!(FileKind::from_path("b.mgdljson"), FileKind::MdlJson);
        assert_eq!(FileKind::from_path("b.mgdlproto"), FileKind::MdlProto);
        assert_eq!(FileKind::from_path("b.protoset"), FileKind::PdlDesc);
        assert_eq!(FileKind::from_path("b.txt"), FileKind::None);
        assert_eq!(FileKind::from_path("noext"), FileKind::None);
    }

    #[test]
    fn test_normalize_uri() {
        assert_eq!(normalize_uri("/abs/a.mgdl"), "/abs/a.mgdl");
        assert_eq!(normalize_uri("rel/a.mgdl"), "/rel/a.mgdl");
        assert_eq!(normalize_uri("file:///abs/a.mgdl"), "/abs/a.mgdl");
        assert_eq!(normalize_uri("https://example.com/a.mgdl"), "https://example.com/a.mgdl");
    }

    #[test]
    fn test_os_source_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mgdl = dir.path().join("m.mgdl");
        std::fs::File::create(&mgdl)
            .unwrap()
            .write_all(b"syntax = \"microglot0\"\n")
            .unwrap();
        std::fs::File::create(dir.path().join("notes.txt")).unwrap();

        let source = OsFileSource::with_roots(Vec::new());
        let handles = source.open(&mgdl.to_string_lossy()).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].kind(), FileKind::Mdl);
        // two live readers over the same handle
        let mut first = handles[0].body().unwrap();
        let mut second = handles[0].body().unwrap();
        let (mut a, mut b) = (String::new(), String::new());
        first.read_to_string(&mut a).unwrap();
        second.read_to_string(&mut b).unwrap();
        assert_eq!(a, b);

        let handles = source.open(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(handles.len(), 1, "unknown extensions are skipped");

        let err = source.open("/definitely/not/here.mgdl").unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[test]
    fn test_memory_source() {
        let mut source = MemoryFileSource::new();
        source.insert("/a.mgdl", "syntax = \"microglot0\"\n");
        let handles = source.open("/a.mgdl").unwrap();
        assert_eq!(handles[0].kind(), FileKind::Mdl);
        assert!(source.open("/b.mgdl").is_err());
    }
}
