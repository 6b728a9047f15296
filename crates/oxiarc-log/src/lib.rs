//! Leveled logging for the `OxiArc` runtime.
//!
//! A small, dependency-free logger shared by every crate in the workspace:
//!
//! - Five levels, filtered through one global atomic threshold
//! - Macros that record the calling module path automatically
//! - Colored output on stderr (disabled when `NO_COLOR` is set)
//! - Initial level read from the `OXIARC_LOG` environment variable
//! - Thread-local capture of log records for tests
//!
//! # Example
//!
//! ```
//! use oxiarc_log::{Level, debug, info, warn};
//!
//! oxiarc_log::set_level(Level::Debug);
//!
//! let id = 7;
//! info!("allocated object {}", id);
//! debug!("strong count now {}", 2);
//! warn!("object {} leaked", id);
//! ```
//!
//! Capturing records instead of printing them:
//!
//! ```
//! use oxiarc_log::{Level, capture, debug};
//!
//! let ((), records) = capture(Level::Debug, || {
//!     debug!("iPhone 12 Pro Max is now deallocated");
//! });
//!
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].level, Level::Debug);
//! assert!(records[0].message.contains("deallocated"));
//! ```

use std::cell::RefCell;
use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable holding the initial log level.
pub const LEVEL_ENV: &str = "OXIARC_LOG";

/// Environment variable that disables ANSI colors when present.
pub const NO_COLOR_ENV: &str = "NO_COLOR";

/// Severity of a log record.
///
/// Lower discriminants are more severe; a logger at level `L` emits every
/// record whose level is `<= L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Broken invariants and failed operations.
    Error = 0,
    /// Suspicious but recoverable situations, such as leaked objects.
    Warn = 1,
    /// High-level lifecycle events.
    Info = 2,
    /// Deallocations and other per-object events.
    Debug = 3,
    /// Every retain, release and binding change.
    Trace = 4,
}

impl Level {
    const fn color(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Upper-case name of the level, as printed in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a log level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level `{}`", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, case-insensitively.
    ///
    /// ```
    /// use oxiarc_log::Level;
    ///
    /// assert_eq!("debug".parse(), Ok(Level::Debug));
    /// assert_eq!("WARNING".parse(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_owned())),
        }
    }
}

/// Process-wide logger state.
///
/// Obtained through [`logger()`]; every field is atomic so the logger can be
/// reconfigured from any thread.
pub struct Logger {
    level: AtomicU8,
    color: AtomicBool,
}

impl Logger {
    const fn new(level: Level, color: bool) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            color: AtomicBool::new(color),
        }
    }

    fn from_env() -> Self {
        let level = std::env::var(LEVEL_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(Level::Warn);
        let color = std::env::var_os(NO_COLOR_ENV).is_none();
        Logger::new(level, color)
    }

    /// Sets the most verbose level that will be emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current threshold.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Whether a record at `level` passes the threshold.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    /// Turns ANSI colors on or off.
    pub fn set_color(&self, enabled: bool) {
        self.color.store(enabled, Ordering::Relaxed);
    }

    fn color(&self) -> bool {
        self.color.load(Ordering::Relaxed)
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, initializing it from the environment on
/// first use. Defaults to [`Level::Warn`].
pub fn logger() -> &'static Logger {
    LOGGER.get_or_init(Logger::from_env)
}

/// Sets the global threshold.
pub fn set_level(level: Level) {
    logger().set_level(level);
}

/// Parses `s` and sets the global threshold.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `s` does not name a level; the threshold is
/// left unchanged.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity.
    pub level: Level,
    /// Module path of the call site.
    pub target: String,
    /// Formatted message.
    pub message: String,
}

struct Capture {
    threshold: Level,
    records: Vec<Record>,
}

thread_local! {
    static CAPTURE: RefCell<Option<Capture>> = const { RefCell::new(None) };
}

// Restores the enclosing capture (if any) even when the closure panics.
struct CaptureScope {
    previous: Option<Option<Capture>>,
}

impl CaptureScope {
    fn enter(threshold: Level) -> Self {
        let previous = CAPTURE.with(|slot| {
            slot.replace(Some(Capture {
                threshold,
                records: Vec::new(),
            }))
        });
        CaptureScope {
            previous: Some(previous),
        }
    }

    fn finish(mut self) -> Vec<Record> {
        let previous = self.previous.take().unwrap_or_default();
        CAPTURE
            .with(|slot| slot.replace(previous))
            .map(|capture| capture.records)
            .unwrap_or_default()
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CAPTURE.with(|slot| slot.replace(previous));
        }
    }
}

/// Runs `f` with logging on the current thread redirected into a buffer.
///
/// Records at `threshold` or more severe are collected regardless of the
/// global level and are not printed. Other threads are unaffected.
pub fn capture<R>(threshold: Level, f: impl FnOnce() -> R) -> (R, Vec<Record>) {
    let scope = CaptureScope::enter(threshold);
    let result = f();
    (result, scope.finish())
}

fn capturing(level: Level) -> bool {
    CAPTURE.with(|slot| {
        slot.try_borrow()
            .ok()
            .and_then(|capture| capture.as_ref().map(|c| level <= c.threshold))
            .unwrap_or(false)
    })
}

/// Whether a record at `level` would be printed or captured.
pub fn enabled(level: Level) -> bool {
    logger().enabled(level) || capturing(level)
}

/// Emits one record. Called by the logging macros.
#[doc(hidden)]
pub fn __log(level: Level, target: &str, args: Arguments) {
    if capturing(level) {
        let record = Record {
            level,
            target: target.to_owned(),
            message: args.to_string(),
        };
        CAPTURE.with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut()
                && let Some(capture) = slot.as_mut()
            {
                capture.records.push(record);
            }
        });
        return;
    }

    let logger = logger();
    if !logger.enabled(level) {
        return;
    }

    let mut stderr = std::io::stderr().lock();
    // A closed stderr is not worth failing the caller over.
    let _ = if logger.color() {
        writeln!(stderr, "{}[{level}]\x1b[0m {target}: {args}", level.color())
    } else {
        writeln!(stderr, "[{level}] {target}: {args}")
    };
}

/// Logs at an explicit level.
///
/// ```
/// use oxiarc_log::{Level, log};
///
/// log!(level: Level::Info, "store holds {} objects", 3);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::enabled(level) {
            $crate::__log(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
