//! Log level control
//!
//! The engine logs through `tracing`. Hosts that do not install their own
//! subscriber call [`init_logging`], which installs a stderr fmt layer behind
//! a reloadable filter so [`set_log_level`] can change verbosity at runtime.
//!
//! `tracing` has five levels against the eight of the ABI, so `Critical`
//! shares the `ERROR` filter with `Error` and `VVerbose` shares `TRACE` with
//! `Verbose`. The exact level last set is kept and reported by [`log_level`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

/// Verbosity levels exposed over the ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Nothing
    None,
    /// Unrecoverable conditions
    Critical,
    /// Failed operations
    Error,
    /// Contract violations and degraded behaviour
    #[default]
    Warning,
    /// Lifecycle events
    Info,
    /// Residency decisions
    Debug,
    /// Per-page detail
    Verbose,
    /// Everything
    VVerbose,
}

impl LogLevel {
    const ALL: [Self; 8] = [
        Self::None,
        Self::Critical,
        Self::Error,
        Self::Warning,
        Self::Info,
        Self::Debug,
        Self::Verbose,
        Self::VVerbose,
    ];

    /// Matching `tracing` filter; two pairs of levels share a filter
    #[must_use]
    pub fn filter(self) -> LevelFilter {
        match self {
            Self::None => LevelFilter::OFF,
            Self::Critical | Self::Error => LevelFilter::ERROR,
            Self::Warning => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Verbose | Self::VVerbose => LevelFilter::TRACE,
        }
    }
}

type FilterHandle = reload::Handle<LevelFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warning as u8);

/// Install the stderr subscriber at `level`
///
/// Returns `false` if another global subscriber was already installed; the
/// level can then only be changed through that subscriber.
pub fn init_logging(level: LogLevel) -> bool {
    if FILTER.get().is_some() {
        set_log_level(level);
        return true;
    }
    LEVEL.store(level as u8, Ordering::Relaxed);
    let (filter, handle) = reload::Layer::new(level.filter());
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
    }
    installed
}

/// Change verbosity of the subscriber installed by [`init_logging`]
///
/// Installs the subscriber on first use.
pub fn set_log_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
    match FILTER.get() {
        Some(handle) => {
            if let Err(e) = handle.reload(level.filter()) {
                eprintln!("vbar: could not change log level: {}", e);
            }
        }
        None => {
            init_logging(level);
        }
    }
}

/// Level most recently passed to [`init_logging`] or [`set_log_level`]
#[must_use]
pub fn log_level() -> LogLevel {
    LogLevel::ALL
        .get(usize::from(LEVEL.load(Ordering::Relaxed)))
        .copied()
        .unwrap_or_default()
}

/// Current level filter, `None` if [`init_logging`] never ran
#[must_use]
pub fn current_filter() -> Option<LevelFilter> {
    FILTER
        .get()
        .and_then(|handle| handle.clone_current())
}
