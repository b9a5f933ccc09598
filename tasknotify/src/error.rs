//! Error types for tasknotify.

use std::io;

/// Errors surfaced to callers of the environment API.
///
/// Transient conditions (nothing ready yet, momentary queue/pool pressure,
/// try-lock contention) never appear here; they are absorbed by retries or
/// deferred to the next polling cycle. Substrate failures detected inside a
/// polling callback do not appear here either: those abort the process (see
/// [`fatal`]) because completion accounting can no longer be trusted.
#[derive(Debug)]
pub enum Error {
    /// Segment id is outside the substrate's advertised segment range.
    InvalidSegment(u16),
    /// Queue id or queue range is outside the substrate's advertised limit.
    InvalidQueueRange { first: u16, count: u32 },
    /// Queue group id is outside the configured group-table range.
    InvalidGroup(u16),
    /// Queue group already exists.
    GroupExists(u16),
    /// Queue group does not exist.
    GroupNotFound(u16),
    /// The queue-group table is full.
    GroupTableFull,
    /// A queue group must own at least one queue.
    EmptyGroup,
    /// The requested placement policy needs CPU topology information that
    /// the host runtime does not provide.
    PolicyUnsupported,
    /// Synchronous failure reported by the substrate while submitting an
    /// operation on the caller's thread.
    Submit(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidSegment(seg) => write!(f, "segment {} out of range", seg),
            Error::InvalidQueueRange { first, count } => {
                write!(f, "queue range [{}, {}+{}) out of range", first, first, count)
            }
            Error::InvalidGroup(id) => write!(f, "queue group id {} out of range", id),
            Error::GroupExists(id) => write!(f, "queue group {} already exists", id),
            Error::GroupNotFound(id) => write!(f, "queue group {} does not exist", id),
            Error::GroupTableFull => write!(f, "too many queue groups created"),
            Error::EmptyGroup => write!(f, "queue group must contain at least one queue"),
            Error::PolicyUnsupported => {
                write!(f, "placement policy requires CPU topology information")
            }
            Error::Submit(e) => write!(f, "operation submit failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Submit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Submit(e)
    }
}

/// Result type for tasknotify operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Abort the process on an unrecoverable substrate failure.
///
/// Called when a polling callback observes a broken completion queue, a
/// failed in-flight request, or an unexpected return code from the
/// substrate. Returning an error from a periodic callback is not possible,
/// and continuing would leave task completion counters inconsistent with
/// the hardware state.
pub(crate) fn fatal(context: &str, error: &dyn std::fmt::Display) -> ! {
    log::error!("fatal: {}: {}", context, error);
    eprintln!("tasknotify fatal error: {}: {}", context, error);
    std::process::abort();
}
