//! Parse sessions
//!
//! A [`Session`] drives one compiled module through a linear lifecycle:
//!
//! ```text
//! Idle --open--> Loaded --run--> Running --close--> Closed
//!                  |                                  ^
//!                  +--------------close---------------+
//! ```
//!
//! [`Session::execute`] runs the whole lifecycle and closes the module on
//! every path. The generated parser signals failure by leaving an error
//! pending rather than through its return value, so a normal return from
//! `do_parse` is only a success once the pending slot has been checked.
//!
//! [`ParserEngine`] keeps a module loaded across several runs, resetting
//! the lexer buffer between them.

use std::ffi::c_int;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{BridgeError, BridgeResult, HostError};
use super::host::{Attr, HostRuntime};
use super::relay::TruncationPolicy;
use super::symbols::{CompiledModule, DynamicLoader, ModuleLoader, ParserModule};
use super::trampoline::{BridgeContext, BridgeStats};

/// Logging macros - no-op when logging feature is disabled
#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

/// Logging macros - use log crate when logging feature is enabled
#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// Logging macros - no-op when logging feature is disabled
#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

/// Logging macros - use log crate when logging feature is enabled
#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

/// Default bound on consecutive runs in [`ParserEngine::run_until_closed`]
pub const DEFAULT_MAX_RUNS: usize = 10_000;

// ============================================================================
// Configuration
// ============================================================================

/// Session configuration
///
/// # Example
///
/// ```
/// use bisonlink::engine::{SessionConfig, TruncationPolicy};
///
/// let config = SessionConfig::new()
///     .with_expected_signature("abc123")
///     .with_truncation(TruncationPolicy::Strict);
/// assert_eq!(config.expected_signature.as_deref(), Some("abc123"));
///
/// let config = SessionConfig::from_json(r#"{"debug": true}"#).unwrap();
/// assert!(config.debug);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Grammar signature the module must export (None = don't check)
    pub expected_signature: Option<String>,

    /// Ask the generated parser for debug traces
    pub debug: bool,

    /// Discard buffered lexer input before every run on a reused module
    pub reset_buffer: bool,

    /// Behavior when a read returns more than the lexer buffer holds
    pub truncation: TruncationPolicy,

    /// Upper bound on runs in one `run_until_closed` call
    pub max_runs: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expected_signature: None,
            debug: false,
            reset_buffer: true,
            truncation: TruncationPolicy::Clamp,
            max_runs: DEFAULT_MAX_RUNS,
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that fails on truncated reads
    pub fn strict() -> Self {
        Self {
            truncation: TruncationPolicy::Strict,
            ..Self::default()
        }
    }

    /// Load a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| BridgeError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for unusable values
    pub fn validate(&self) -> BridgeResult<()> {
        if self.max_runs == 0 {
            return Err(BridgeError::InvalidConfig {
                reason: "max_runs must be at least 1".to_string(),
            });
        }
        if let Some(expected) = &self.expected_signature {
            if expected.is_empty() {
                return Err(BridgeError::InvalidConfig {
                    reason: "expected_signature must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Set the expected grammar signature
    pub fn with_expected_signature(mut self, signature: impl Into<String>) -> Self {
        self.expected_signature = Some(signature.into());
        self
    }

    /// Enable or disable parser debug traces
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Enable or disable the lexer buffer reset between runs
    pub fn with_reset_buffer(mut self, reset: bool) -> Self {
        self.reset_buffer = reset;
        self
    }

    /// Set the truncation policy
    pub fn with_truncation(mut self, policy: TruncationPolicy) -> Self {
        self.truncation = policy;
        self
    }

    /// Set the run bound for `run_until_closed`
    pub fn with_max_runs(mut self, runs: usize) -> Self {
        self.max_runs = runs;
        self
    }
}

// ============================================================================
// State and report
// ============================================================================

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No module loaded
    #[default]
    Idle,
    /// Module loaded, not yet run
    Loaded,
    /// Entry point invoked
    Running,
    /// Module closed; the session is finished
    Closed,
}

impl SessionState {
    /// Lowercase state name
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loaded => "loaded",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of what a session or engine did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Lifecycle state when the report was taken
    pub state: SessionState,
    /// Number of entry-point invocations
    pub runs: usize,
    /// Rule events dispatched
    pub events: usize,
    /// Fill requests answered
    pub fills: usize,
    /// Bytes copied into the lexer buffer
    pub bytes_read: usize,
    /// Bytes dropped by clamped reads
    pub truncated_bytes: usize,
    /// End-of-input cleanup failures (reported, never fatal)
    pub cleanup_errors: Vec<String>,
}

impl SessionReport {
    fn record(&mut self, outcome: RunOutcome) {
        self.runs += 1;
        self.events += outcome.stats.events;
        self.fills += outcome.stats.fills;
        self.bytes_read += outcome.stats.bytes_read;
        self.truncated_bytes += outcome.stats.truncated_bytes;
        self.cleanup_errors
            .extend(outcome.cleanup_errors.iter().map(|e| e.to_string()));
    }

    /// Serialize the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Running a module
// ============================================================================

struct RunOutcome {
    stats: BridgeStats,
    cleanup_errors: Vec<HostError>,
}

/// Check the module's exported signature against the expected one
pub fn check_signature<M: CompiledModule>(module: &M, expected: Option<&str>) -> BridgeResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match module.signature() {
        None => Err(BridgeError::MissingSignature),
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(BridgeError::StaleModule {
            expected: expected.to_string(),
            found: found.to_string(),
        }),
    }
}

/// Invoke the entry point once with the bridge wired in
fn run_module<M, R>(
    module: &M,
    runtime: &R,
    parser: &R::Object,
    config: &SessionConfig,
) -> (RunOutcome, Option<BridgeError>)
where
    M: CompiledModule,
    R: HostRuntime,
{
    let context = BridgeContext::new(runtime, config.truncation);
    let marshaler = context.marshaler_abi();
    let relay = context.relay_abi();
    let raw_parser = runtime.export(parser.clone());

    let entry = module.entry_point();
    unsafe {
        entry(raw_parser, &marshaler, &relay, c_int::from(config.debug));
        runtime.release_raw(raw_parser);
    }

    let outcome = RunOutcome {
        stats: context.stats(),
        cleanup_errors: context.take_cleanup_errors(),
    };
    (outcome, context.take_pending())
}

// ============================================================================
// Session
// ============================================================================

/// One load-run-close cycle of a compiled parser module
pub struct Session<L: ModuleLoader = DynamicLoader> {
    loader: L,
    config: SessionConfig,
    state: SessionState,
    module: Option<L::Module>,
    report: SessionReport,
}

impl Session<DynamicLoader> {
    /// Create a session that loads modules from disk
    pub fn new(config: SessionConfig) -> Self {
        Self::with_loader(DynamicLoader, config)
    }
}

impl<L: ModuleLoader> Session<L> {
    /// Create a session with a custom loader
    pub fn with_loader(loader: L, config: SessionConfig) -> Self {
        Self {
            loader,
            config,
            state: SessionState::Idle,
            module: None,
            report: SessionReport::default(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The loaded module, while the session holds one
    pub fn module(&self) -> Option<&L::Module> {
        self.module.as_ref()
    }

    /// Summary of the session so far
    pub fn report(&self) -> SessionReport {
        SessionReport {
            state: self.state,
            ..self.report.clone()
        }
    }

    fn expect_state(&self, expected: SessionState) -> BridgeResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Load the module (`Idle -> Loaded`); on failure the session stays idle
    pub fn open(&mut self, path: impl AsRef<Path>) -> BridgeResult<()> {
        self.expect_state(SessionState::Idle)?;
        self.config.validate()?;

        let module = self.loader.open(path.as_ref())?;
        log_debug!("session loaded {}", path.as_ref().display());
        self.module = Some(module);
        self.state = SessionState::Loaded;
        Ok(())
    }

    /// Compare the module signature with the configured one
    pub fn verify_signature(&self) -> BridgeResult<()> {
        self.expect_state(SessionState::Loaded)?;
        let module = self.module.as_ref().ok_or(BridgeError::InvalidState {
            expected: SessionState::Loaded.as_str(),
            actual: self.state.as_str(),
        })?;
        check_signature(module, self.config.expected_signature.as_deref())
    }

    /// Verify the signature and run the parser (`Loaded -> Running`)
    ///
    /// A stale module is reported without invoking the entry point. After
    /// the entry point returns, a pending failure becomes the result.
    pub fn run<R: HostRuntime>(&mut self, runtime: &R, parser: &R::Object) -> BridgeResult<()> {
        self.verify_signature()?;
        let module = self.module.as_ref().ok_or(BridgeError::InvalidState {
            expected: SessionState::Loaded.as_str(),
            actual: self.state.as_str(),
        })?;

        self.state = SessionState::Running;
        log_debug!("session running (debug = {})", self.config.debug);

        let (outcome, pending) = run_module(module, runtime, parser, &self.config);
        self.report.record(outcome);

        match pending {
            Some(e) => {
                log_debug!("parse left a pending failure: {}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Close the module (`Loaded | Running -> Closed`)
    pub fn close(&mut self) -> BridgeResult<()> {
        match self.state {
            SessionState::Loaded | SessionState::Running => {}
            _ => {
                return Err(BridgeError::InvalidState {
                    expected: "loaded or running",
                    actual: self.state.as_str(),
                })
            }
        }

        self.state = SessionState::Closed;
        match self.module.take() {
            Some(module) => self.loader.close(module).map_err(BridgeError::from),
            None => Ok(()),
        }
    }

    /// Open, run and close in one call; the module is closed on every path
    pub fn execute<R: HostRuntime>(
        &mut self,
        path: impl AsRef<Path>,
        runtime: &R,
        parser: &R::Object,
    ) -> BridgeResult<SessionReport> {
        self.open(path)?;

        let result = self.run(runtime, parser);
        let closed = self.close();

        match (result, closed) {
            (Ok(()), Ok(())) => Ok(self.report()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(_close_error)) => {
                log_warn!("closing module after failed run: {}", _close_error);
                Err(e)
            }
        }
    }
}

impl<L: ModuleLoader> Drop for Session<L> {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            let _ = self.loader.close(module);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// A module kept loaded for repeated runs
///
/// # Example
///
/// ```rust,ignore
/// use bisonlink::engine::{NativeParser, NativeRuntime, ParserEngine, SessionConfig};
///
/// let runtime = NativeRuntime::new();
/// let parser = NativeParser::new().input(std::io::stdin().lock()).build();
///
/// let mut engine = ParserEngine::load("build/libcalc-parser.so", SessionConfig::new())?;
/// engine.run_until_closed(&runtime, &parser)?;
/// engine.close()?;
/// ```
pub struct ParserEngine<M: CompiledModule = ParserModule> {
    module: M,
    config: SessionConfig,
    report: SessionReport,
}

impl ParserEngine<ParserModule> {
    /// Load a module from disk and check its signature
    pub fn load(path: impl AsRef<Path>, config: SessionConfig) -> BridgeResult<Self> {
        config.validate()?;
        let module = ParserModule::load(path)?;
        Self::from_module(module, config)
    }

    /// Unload the module
    pub fn close(self) -> BridgeResult<()> {
        self.module.close().map_err(BridgeError::from)
    }
}

impl<M: CompiledModule> ParserEngine<M> {
    /// Wrap an already loaded module and check its signature
    pub fn from_module(module: M, config: SessionConfig) -> BridgeResult<Self> {
        config.validate()?;
        check_signature(&module, config.expected_signature.as_deref())?;
        Ok(Self {
            module,
            config,
            report: SessionReport {
                state: SessionState::Loaded,
                ..SessionReport::default()
            },
        })
    }

    /// The loaded module
    pub fn module(&self) -> &M {
        &self.module
    }

    /// Give the module back
    pub fn into_module(self) -> M {
        self.module
    }

    /// Summary of all runs so far
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Run the parser once
    ///
    /// From the second run on, buffered lexer input from the previous run is
    /// discarded first (unless disabled in the configuration).
    pub fn run<R: HostRuntime>(&mut self, runtime: &R, parser: &R::Object) -> BridgeResult<()> {
        if self.report.runs > 0 && self.config.reset_buffer {
            self.module.reset_buffer();
        }

        self.report.state = SessionState::Running;
        let (outcome, pending) = run_module(&self.module, runtime, parser, &self.config);
        self.report.record(outcome);
        self.report.state = SessionState::Loaded;

        match pending {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run repeatedly until the host's input file reports itself closed
    ///
    /// Hosts without a `file.closed` flag get exactly one run. Returns the
    /// number of runs made by this call.
    pub fn run_until_closed<R: HostRuntime>(
        &mut self,
        runtime: &R,
        parser: &R::Object,
    ) -> BridgeResult<usize> {
        if input_closed(runtime, parser)? == Some(true) {
            return Ok(0);
        }

        let mut runs = 0;
        while runs < self.config.max_runs {
            self.run(runtime, parser)?;
            runs += 1;

            if input_closed(runtime, parser)? != Some(false) {
                break;
            }
        }
        Ok(runs)
    }
}

/// `parser.file.closed`, or None when the host does not expose it
fn input_closed<R: HostRuntime>(runtime: &R, parser: &R::Object) -> BridgeResult<Option<bool>> {
    let Some(file) = runtime.attr_optional(parser, Attr::File)? else {
        return Ok(None);
    };
    let Some(closed) = runtime.attr_optional(&file, Attr::Closed)? else {
        return Ok(None);
    };
    Ok(Some(runtime.is_truthy(&closed)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.expected_signature, None);
        assert!(!config.debug);
        assert!(config.reset_buffer);
        assert_eq!(config.truncation, TruncationPolicy::Clamp);
        assert_eq!(config.max_runs, DEFAULT_MAX_RUNS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config = SessionConfig::from_json(
            r#"{"expected_signature": "abc123", "truncation": "strict", "max_runs": 3}"#,
        )
        .unwrap();
        assert_eq!(config.expected_signature.as_deref(), Some("abc123"));
        assert_eq!(config.truncation, TruncationPolicy::Strict);
        assert_eq!(config.max_runs, 3);
        assert!(config.reset_buffer);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            SessionConfig::from_json(r#"{"max_runs": 0}"#),
            Err(BridgeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            SessionConfig::from_json(r#"{"truncation": "sometimes"}"#),
            Err(BridgeError::InvalidConfig { .. })
        ));
        assert!(SessionConfig::new()
            .with_expected_signature("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_strict_preset() {
        assert_eq!(SessionConfig::strict().truncation, TruncationPolicy::Strict);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Closed.as_str(), "closed");
    }

    #[test]
    fn test_open_missing_module_stays_idle() {
        let mut session = Session::new(SessionConfig::new());
        let err = session.open("/no/such/libparser.so").unwrap_err();
        assert!(err.is_load_failure());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_close_requires_open_module() {
        let mut session = Session::new(SessionConfig::new());
        assert!(matches!(
            session.close(),
            Err(BridgeError::InvalidState { .. })
        ));
    }
}
