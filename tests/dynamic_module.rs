//! Dynamic Module Tests
//!
//! Compiles a small parser module in C against `include/bisonlink.h`,
//! then loads it from disk through `dlopen`. The module reads its input
//! chunk by chunk and raises one `line` event per chunk.
//!
//! Uses the compiler named by `CC` (default `cc`). When no compiler is
//! installed the tests print a note and pass.

#![cfg(unix)]

use std::cell::RefCell;
use std::ffi::c_int;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use bisonlink::engine::{library_filename, CompiledModule, Library, ParserModule, SessionState};
use bisonlink::prelude::*;
use tempfile::TempDir;

const FIXTURE_SOURCE: &str = r#"
#include "bisonlink.h"

char *rules_hash = "abc123";
int parse_calls = 0;
int buffer_resets = 0;

void reset_flex_buffer(void) { buffer_resets++; }

void do_parse(BL_HostRef parser, const BL_MarshalerAbi *m, const BL_RelayAbi *r, int debug) {
    char buf[64];
    int n;
    const char *names[1] = { "text" };

    parse_calls++;
    while ((n = BL_FILL(r, parser, buf, sizeof buf)) > 0) {
        BL_HostRef values[1];
        BL_HostRef result;

        values[0] = BL_TOKEN(m, buf, n);
        if (!values[0])
            return;
        result = BL_INVOKE(m, parser, "line", debug, 1, names, values);
        BL_RELEASE(m, values[0]);
        if (!result)
            return;
        BL_RELEASE(m, result);
    }
}
"#;

/// A compiled fixture module in its own directory
struct Fixture {
    _dir: TempDir,
    path: PathBuf,
}

/// Build the fixture module, or None when no C compiler is available
fn build_fixture() -> Option<Fixture> {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("calc_fixture.c");
    std::fs::write(&source, FIXTURE_SOURCE).unwrap();

    let path = dir.path().join(library_filename("calc_fixture"));
    let include = Path::new(env!("CARGO_MANIFEST_DIR")).join("include");
    let compiler = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());

    let output = match Command::new(&compiler)
        .arg("-shared")
        .arg("-fPIC")
        .arg("-I")
        .arg(&include)
        .arg("-o")
        .arg(&path)
        .arg(&source)
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("skipping: C compiler `{}` not found", compiler);
            return None;
        }
        Err(e) => panic!("failed to run `{}`: {}", compiler, e),
    };

    assert!(
        output.status.success(),
        "fixture failed to compile: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Some(Fixture { _dir: dir, path })
}

/// Reads one of the fixture's `int` counters through a second handle
fn counter(library: &Library, symbol: &str) -> c_int {
    let address = library.resolve(symbol).unwrap();
    unsafe { *(address as *const c_int) }
}

/// Parser that records every `line` event as (option, bytes)
fn line_parser(input: &'static [u8]) -> (ValueRef, Rc<RefCell<Vec<(i64, Vec<u8>)>>>) {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let lines_in = lines.clone();
    let parser = NativeParser::new()
        .on("line", move |call| {
            let text = call.value(0)?;
            let bytes = text.as_bytes().unwrap_or_default().to_vec();
            lines_in.borrow_mut().push((call.option, bytes));
            Ok(Value::int(call.option))
        })
        .input(input)
        .build();
    (parser, lines)
}

#[test]
fn test_matching_signature_runs_module_once() {
    let Some(fixture) = build_fixture() else {
        return;
    };
    // Keeps the module mapped while the session opens and closes its own copy.
    let handle = Library::open(&fixture.path).unwrap();

    let runtime = NativeRuntime::new();
    let (parser, lines) = line_parser(b"1 + 2\n3\n");

    let config = SessionConfig::new().with_expected_signature("abc123");
    let mut session = Session::new(config);
    let report = session.execute(&fixture.path, &runtime, &parser).unwrap();

    assert_eq!(counter(&handle, "parse_calls"), 1);
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.runs, 1);
    assert_eq!(report.events, 2);
    assert_eq!(
        *lines.borrow(),
        vec![(0, b"1 + 2\n".to_vec()), (0, b"3\n".to_vec())]
    );

    handle.close().unwrap();
}

#[test]
fn test_stale_signature_never_calls_entry() {
    let Some(fixture) = build_fixture() else {
        return;
    };
    let handle = Library::open(&fixture.path).unwrap();

    let runtime = NativeRuntime::new();
    let (parser, lines) = line_parser(b"1\n");

    let config = SessionConfig::new().with_expected_signature("xyz999");
    let mut session = Session::new(config);
    let err = session.execute(&fixture.path, &runtime, &parser).unwrap_err();

    assert_eq!(
        err,
        BridgeError::StaleModule {
            expected: "xyz999".to_string(),
            found: "abc123".to_string(),
        }
    );
    assert_eq!(counter(&handle, "parse_calls"), 0);
    assert!(lines.borrow().is_empty());
    assert_eq!(session.state(), SessionState::Closed);

    handle.close().unwrap();
}

#[test]
fn test_module_exports_signature_and_reset_hook() {
    let Some(fixture) = build_fixture() else {
        return;
    };

    let module = ParserModule::load(&fixture.path).unwrap();
    assert_eq!(module.signature(), Some("abc123"));
    assert!(module.reset_hook().is_some());
    assert_eq!(module.path(), fixture.path.as_path());
    module.close().unwrap();
}

#[test]
fn test_engine_resets_and_passes_debug_flag() {
    let Some(fixture) = build_fixture() else {
        return;
    };
    let handle = Library::open(&fixture.path).unwrap();

    let runtime = NativeRuntime::new();
    let (parser, lines) = line_parser(b"caf\xe9\n");

    let config = SessionConfig::new().with_debug(true);
    let mut engine = ParserEngine::load(&fixture.path, config).unwrap();
    engine.run(&runtime, &parser).unwrap();
    engine.run(&runtime, &parser).unwrap();

    assert_eq!(counter(&handle, "parse_calls"), 2);
    assert_eq!(counter(&handle, "buffer_resets"), 1);
    assert_eq!(*lines.borrow(), vec![(1, b"caf\xe9\n".to_vec())]);
    assert_eq!(engine.report().runs, 2);

    engine.close().unwrap();
    handle.close().unwrap();
}
