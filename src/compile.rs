use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::check;
use crate::fold;
use crate::fs::{FileHandle, FileKind, FileSource, normalize_uri};
use crate::ir::{Image, Module};
use crate::link::{self, PROTOBUF_BOOTSTRAP_URI};
use crate::lower;
use crate::parse;
use crate::pdl::{self, PdlParser};
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::sniff::{self, Dialect};
use crate::symbol::GlobalSymbols;
use crate::uid;

/// Embedded bootstrap module; compiled at startup, aliased as `Protobuf`.
const PROTOBUF_BOOTSTRAP: &str = include_str!("protobuf.mgdl");

/// Cooperative cancellation handle shared by the driver and its workers.
///
/// Cancelling closes an internal channel, so every blocking operation can
/// select on it and return promptly with the recorded cause.
#[derive(Clone)]
pub struct CancelToken {
    cause: Arc<Mutex<Option<String>>>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            cause: Arc::new(Mutex::new(None)),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Records `cause` and wakes every blocked worker. Idempotent; the first
    /// cause wins.
    pub fn cancel(&self, cause: impl Into<String>) {
        let mut recorded = self.cause.lock();
        if recorded.is_none() {
            *recorded = Some(cause.into());
        }
        drop(recorded);
        self.sender.lock().take();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.sender.lock().is_none()
    }

    #[must_use]
    pub fn cause(&self) -> String {
        self.cause
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    fn channel(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver's answer: the (possibly partial) image plus everything the
/// reporter accumulated, in arrival order. Callers that compare diagnostics
/// should sort them first.
#[derive(Debug)]
pub struct Compilation {
    pub image: Image,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("compilation cancelled: {0}")]
    Cancelled(String),
}

/// The concurrent compile driver.
///
/// Workers run per-file pipelines (sniff → dialect sub-compiler → UID
/// completion → symbol collection) in parallel under a counting semaphore,
/// imports are discovered from finished descriptors and enqueued exactly
/// once, then a second fan-out links every module, and the assembled image
/// is folded and checked single-threaded.
pub struct Compiler {
    file_source: Arc<dyn FileSource>,
    pdl_parser: Option<Arc<dyn PdlParser>>,
    max_procs: usize,
    non_fatal: Vec<ErrorCode>,
}

enum WorkerOutcome {
    Compiled(Module),
    Failed,
}

impl Compiler {
    #[must_use]
    pub fn new(file_source: Arc<dyn FileSource>) -> Self {
        Self {
            file_source,
            pdl_parser: None,
            max_procs: usize::MAX,
            non_fatal: Vec::new(),
        }
    }

    /// Installs the external PDL parser; without one, PDL inputs report
    /// `Unimplemented`.
    #[must_use]
    pub fn with_pdl_parser(mut self, parser: Arc<dyn PdlParser>) -> Self {
        self.pdl_parser = Some(parser);
        self
    }

    /// Caps worker parallelism below the machine's CPU count.
    #[must_use]
    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs.max(1);
        self
    }

    /// Widens the reporter's non-fatal code set for this compiler.
    #[must_use]
    pub fn with_non_fatal(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.non_fatal.extend(codes);
        self
    }

    fn parallelism(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(self.max_procs).max(1)
    }

    /// Compiles `files` and everything they import into one linked image.
    pub fn compile(
        &self,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<Compilation, CompileError> {
        if cancel.is_cancelled() {
            return Err(CompileError::Cancelled(cancel.cause()));
        }
        let reporter = Reporter::new();
        reporter.allow_non_fatal(self.non_fatal.iter().copied());
        let symbols = GlobalSymbols::new();

        // the bootstrap must compile before anything can link against it
        let bootstrap = match self.compile_source(
            PROTOBUF_BOOTSTRAP_URI,
            FileKind::Mdl,
            PROTOBUF_BOOTSTRAP.as_bytes(),
            &symbols,
            &reporter,
            cancel,
        ) {
            WorkerOutcome::Compiled(module) => module,
            WorkerOutcome::Failed => {
                log::error!("bootstrap module failed to compile");
                return Ok(Compilation {
                    image: Image::default(),
                    diagnostics: reporter.diagnostics(),
                });
            }
        };

        let collected = self.run_parse_stage(files, bootstrap, &symbols, &reporter, cancel)?;
        let linked = self.run_link_stage(collected, &symbols, &reporter, cancel)?;

        // dedup by URI, first writer wins
        let mut by_uri: IndexMap<String, Module> = IndexMap::new();
        for module in linked {
            by_uri.entry(module.uri.clone()).or_insert(module);
        }
        let mut image = Image {
            modules: by_uri.into_values().collect(),
        };

        fold::optimize(&mut image);
        check::check(&image, &reporter);

        if cancel.is_cancelled() {
            return Err(CompileError::Cancelled(cancel.cause()));
        }
        Ok(Compilation {
            image,
            diagnostics: reporter.diagnostics(),
        })
    }

    /// First fan-out: per-file parse pipelines plus dynamic import
    /// discovery. Returns every successfully compiled module.
    fn run_parse_stage(
        &self,
        files: &[String],
        bootstrap: Module,
        symbols: &GlobalSymbols,
        reporter: &Reporter,
        cancel: &CancelToken,
    ) -> Result<Vec<Module>, CompileError> {
        let permits = semaphore(self.parallelism());
        let mut collected = vec![bootstrap];
        let mut loaded: HashSet<String> = HashSet::new();
        loaded.insert(PROTOBUF_BOOTSTRAP_URI.to_string());

        std::thread::scope(|scope| {
            let (results_tx, results_rx) = unbounded::<WorkerOutcome>();
            let mut outstanding = 0usize;

            let mut spawn_handles =
                |handles: Vec<Box<dyn FileHandle>>,
                 loaded: &mut HashSet<String>,
                 outstanding: &mut usize| {
                    for handle in handles {
                        if !loaded.insert(handle.path().to_string()) {
                            continue;
                        }
                        *outstanding += 1;
                        let results_tx = results_tx.clone();
                        let permits = permits.clone();
                        scope.spawn(move || {
                            let outcome = if acquire(&permits, cancel) {
                                let outcome =
                                    self.compile_handle(&*handle, symbols, reporter, cancel);
                                release(&permits);
                                outcome
                            } else {
                                WorkerOutcome::Failed
                            };
                            let _ = results_tx.send(outcome);
                        });
                    }
                };

            for file in files {
                match self.file_source.open(file) {
                    Ok(handles) => spawn_handles(handles, &mut loaded, &mut outstanding),
                    Err(diagnostic) => {
                        let _ = reporter.report(diagnostic);
                    }
                }
            }

            while outstanding > 0 {
                let outcome = select! {
                    recv(results_rx) -> msg => match msg {
                        Ok(outcome) => outcome,
                        Err(_) => break,
                    },
                    recv(cancel.channel()) -> _ => {
                        return Err(CompileError::Cancelled(cancel.cause()));
                    }
                };
                outstanding -= 1;
                if let WorkerOutcome::Compiled(module) = outcome {
                    for import in &module.imports {
                        let normalized = normalize_uri(&import.uri);
                        if loaded.contains(&normalized) {
                            continue;
                        }
                        match self.file_source.open(&normalized) {
                            Ok(handles) => {
                                spawn_handles(handles, &mut loaded, &mut outstanding);
                            }
                            Err(diagnostic) => {
                                // the linker reports the unknown import
                                log::debug!(
                                    "{}: import {normalized} not openable: {diagnostic}",
                                    module.uri
                                );
                            }
                        }
                    }
                    collected.push(module);
                }
            }
            Ok(())
        })?;

        Ok(collected)
    }

    /// Second fan-out: link every collected module in parallel.
    fn run_link_stage(
        &self,
        collected: Vec<Module>,
        symbols: &GlobalSymbols,
        reporter: &Reporter,
        cancel: &CancelToken,
    ) -> Result<Vec<Module>, CompileError> {
        let permits = semaphore(self.parallelism());
        let expected = collected.len();
        let mut linked = Vec::with_capacity(expected);

        std::thread::scope(|scope| {
            let (results_tx, results_rx) = unbounded::<Module>();
            for mut module in collected {
                let results_tx = results_tx.clone();
                let permits = permits.clone();
                scope.spawn(move || {
                    if acquire(&permits, cancel) {
                        link::link(&mut module, symbols, reporter);
                        release(&permits);
                    }
                    let _ = results_tx.send(module);
                });
            }
            drop(results_tx);

            for _ in 0..expected {
                select! {
                    recv(results_rx) -> msg => match msg {
                        Ok(module) => linked.push(module),
                        Err(_) => break,
                    },
                    recv(cancel.channel()) -> _ => {
                        return Err(CompileError::Cancelled(cancel.cause()));
                    }
                }
            }
            Ok(())
        })?;

        Ok(linked)
    }

    /// One file's pipeline: read → sniff → dialect sub-compiler → UID
    /// completion → symbol collection.
    fn compile_handle(
        &self,
        handle: &dyn FileHandle,
        symbols: &GlobalSymbols,
        reporter: &Reporter,
        cancel: &CancelToken,
    ) -> WorkerOutcome {
        let uri = handle.path().to_string();
        match handle.kind() {
            FileKind::MdlBin | FileKind::MdlJson | FileKind::MdlProto | FileKind::PdlDesc => {
                let _ = reporter.report(
                    Diagnostic::new(
                        ErrorCode::Unimplemented,
                        "encoded descriptor inputs are not decoded yet",
                    )
                    .in_file(uri),
                );
                return WorkerOutcome::Failed;
            }
            FileKind::Mdl | FileKind::Pdl | FileKind::None => {}
        }

        let mut body = Vec::new();
        let read = handle.body().and_then(|mut r| r.read_to_end(&mut body));
        if let Err(err) = read {
            let _ = reporter.report(
                Diagnostic::new(ErrorCode::UnknownFatal, err.to_string()).in_file(uri),
            );
            return WorkerOutcome::Failed;
        }
        self.compile_source(&uri, handle.kind(), &body, symbols, reporter, cancel)
    }

    fn compile_source(
        &self,
        uri: &str,
        kind: FileKind,
        body: &[u8],
        symbols: &GlobalSymbols,
        reporter: &Reporter,
        cancel: &CancelToken,
    ) -> WorkerOutcome {
        if cancel.is_cancelled() {
            return WorkerOutcome::Failed;
        }
        let Ok(dialect) = sniff::sniff(uri, body, reporter) else {
            return WorkerOutcome::Failed;
        };
        log::debug!("{uri}: compiling as {dialect:?} ({kind:?})");

        let mut module = match dialect {
            Dialect::Mdl => {
                let Some(ast) = parse::parse(uri, body, reporter) else {
                    return WorkerOutcome::Failed;
                };
                let Some(module) = lower::lower(&ast, reporter) else {
                    return WorkerOutcome::Failed;
                };
                module
            }
            Dialect::Pdl => {
                let Some(parser) = &self.pdl_parser else {
                    let _ = reporter.report(
                        Diagnostic::new(
                            ErrorCode::Unimplemented,
                            "no PDL parser is configured",
                        )
                        .in_file(uri.to_string()),
                    );
                    return WorkerOutcome::Failed;
                };
                let raw = match parser.parse_pdl(uri, body) {
                    Ok(raw) => raw,
                    Err(err) => {
                        let mut diagnostic =
                            Diagnostic::new(ErrorCode::ProtobufParseError, err.to_string())
                                .in_file(uri.to_string());
                        diagnostic.location = err.location;
                        let _ = reporter.report(diagnostic);
                        return WorkerOutcome::Failed;
                    }
                };
                match pdl::convert(&raw, uri, reporter) {
                    Ok(module) => module,
                    Err(_) => return WorkerOutcome::Failed,
                }
            }
        };

        if cancel.is_cancelled() {
            return WorkerOutcome::Failed;
        }
        if let Err(err) = uid::complete_uids(&mut module) {
            let _ = reporter.report(
                Diagnostic::new(ErrorCode::UnknownFatal, err.to_string())
                    .in_file(uri.to_string()),
            );
            return WorkerOutcome::Failed;
        }
        if symbols.collect(&module, reporter).is_err() {
            return WorkerOutcome::Failed;
        }
        WorkerOutcome::Compiled(module)
    }
}

/// Counting semaphore over a bounded channel: acquire fills a slot, release
/// drains one.
type Semaphore = (Sender<()>, Receiver<()>);

fn semaphore(capacity: usize) -> Semaphore {
    bounded(capacity)
}

/// Blocks for a permit; `false` means cancellation won.
fn acquire(permits: &Semaphore, cancel: &CancelToken) -> bool {
    select! {
        send(permits.0, ()) -> res => res.is_ok(),
        recv(cancel.channel()) -> _ => false,
    }
}

fn release(permits: &Semaphore) {
    let _ = permits.1.recv();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSource;

    fn compiler(files: &[(&str, &str)]) -> Compiler {
        let mut source = MemoryFileSource::new();
        for (uri, body) in files {
            source.insert(*uri, *body);
        }
        Compiler::new(Arc::new(source))
    }

    #[test]
    fn test_compile_empty_module() {
        let compiler = compiler(&[("/empty.mgdl", "syntax = \"microglot0\"\n")]);
        let result = compiler
            .compile(&["/empty.mgdl".to_string()], &CancelToken::new())
            .unwrap();
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let module = result.image.module("/empty.mgdl").unwrap();
        assert!(module.structs.is_empty());
        assert!(module.constants.is_empty());
        assert_ne!(module.uid, 0);
        // the bootstrap rides along in the image
        assert!(result.image.module(PROTOBUF_BOOTSTRAP_URI).is_some());
    }

    #[test]
    fn test_compile_discovers_imports() {
        let compiler = compiler(&[
            (
                "/app.mgdl",
                "syntax = \"microglot0\"\nimport \"/lib.mgdl\" as lib\nstruct App {\n  w :lib.Widget\n}\n",
            ),
            ("/lib.mgdl", "syntax = \"microglot0\"\nstruct Widget {\n  a :Bool\n}\n"),
        ]);
        let result = compiler
            .compile(&["/app.mgdl".to_string()], &CancelToken::new())
            .unwrap();
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let lib = result.image.module("/lib.mgdl").unwrap();
        let app = result.image.module("/app.mgdl").unwrap();
        assert_eq!(
            app.structs[0].fields[0].ty.reference(),
            Some(lib.structs[0].reference)
        );
    }

    #[test]
    fn test_compile_dedups_modules() {
        let compiler = compiler(&[
            ("/a.mgdl", "syntax = \"microglot0\"\nimport \"/b.mgdl\" as b\n"),
            ("/b.mgdl", "syntax = \"microglot0\"\n"),
        ]);
        let result = compiler
            .compile(
                &["/a.mgdl".to_string(), "/b.mgdl".to_string(), "/a.mgdl".to_string()],
                &CancelToken::new(),
            )
            .unwrap();
        let mut uris: Vec<_> = result.image.modules.iter().map(|m| m.uri.as_str()).collect();
        uris.sort();
        assert_eq!(uris, vec!["/a.mgdl", "/b.mgdl", PROTOBUF_BOOTSTRAP_URI]);
    }

    #[test]
    fn test_compile_cancelled_before_start() {
        let compiler = compiler(&[("/a.mgdl", "syntax = \"microglot0\"\n")]);
        let cancel = CancelToken::new();
        cancel.cancel("shutting down");
        let err = compiler
            .compile(&["/a.mgdl".to_string()], &cancel)
            .unwrap_err();
        let CompileError::Cancelled(cause) = err;
        assert_eq!(cause, "shutting down");
    }

    #[test]
    fn test_compile_missing_input_reports() {
        let compiler = compiler(&[]);
        let result = compiler
            .compile(&["/missing.mgdl".to_string()], &CancelToken::new())
            .unwrap();
        assert_eq!(result.diagnostics[0].code, ErrorCode::FileNotFound);
    }
}
