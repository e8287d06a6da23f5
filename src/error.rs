//! The crate's error type.
//!
//! Mirrors the split AFL++ makes between `FATAL`/`PFATAL` (unrecoverable,
//! abort the process) and `WARNF` (recoverable, log and keep going): the
//! fatal kinds below are only ever raised from call sites the rest of the
//! crate treats as truly unrecoverable; everything else is returned as a
//! normal `Result` and handled by the caller.

use core::fmt;
use std::io;

/// All error conditions the scheduling core can raise.
#[derive(Debug)]
pub enum Error {
    /// Allocation failure. Fatal in the source (`FATAL("could not acquire
    /// memory for alias table")` and friends); we keep the distinction so
    /// callers can tell it apart from ordinary I/O failure, even though in
    /// safe Rust this variant is rarely constructed directly.
    Allocation(String),
    /// I/O on a queue `.state/` marker file (create/unlink). Fatal: these
    /// markers guarantee persistence of recoverable state across restarts,
    /// so a failure to write one can't be shrugged off.
    QueueStateIo(String, io::Error),
    /// I/O on minimizer snapshot/scratch directories. Recoverable: warn and
    /// skip the minimization round.
    ScratchIo(String, io::Error),
    /// The external minimizer process could not be spawned or exited
    /// non-zero. Recoverable.
    MinimizerSpawn(String),
    /// Collecting the minimizer's keep-set failed. Recoverable; no seeds
    /// are disabled on a failed guess.
    KeepSetCollection(String),
    /// An invariant the core relies on was violated (duplicate id, edge-id
    /// overflow, cover-list overflow, corrupt queue). Fatal.
    Invariant(String),
    /// A caller asked for a seed id that isn't in the queue.
    InvalidSeedId(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Allocation(msg) => write!(f, "allocation failure: {msg}"),
            Error::QueueStateIo(ctx, err) => write!(f, "queue state I/O ({ctx}): {err}"),
            Error::ScratchIo(ctx, err) => write!(f, "minimizer scratch I/O ({ctx}): {err}"),
            Error::MinimizerSpawn(msg) => write!(f, "minimizer spawn failed: {msg}"),
            Error::KeepSetCollection(msg) => write!(f, "keep-set collection failed: {msg}"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Error::InvalidSeedId(id) => write!(f, "no such seed id: {id}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::QueueStateIo(_, err) | Error::ScratchIo(_, err) => Some(err),
            _ => None,
        }
    }
}

/// Abort the process with a diagnostic, the way AFL++'s `FATAL`/`PFATAL`
/// do for allocation failure and invariant corruption. Not a
/// panic: callers that hit this are telling us recovery is impossible, not
/// that a bug was detected mid-computation.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}
