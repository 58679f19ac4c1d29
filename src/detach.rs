/// Detaching the locker into its own session.
///
/// After `detach` returns, parent and child share nothing: the parent
/// exits at once and only the child holds the terminal.
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::time::Duration;

/// Which side of the fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The original process. It must exit with success and undo nothing.
    Parent { child: Pid },
    /// The background process that keeps the lock.
    Child,
}

#[derive(Debug)]
pub enum DetachError {
    Fork { source: nix::Error },
}

impl std::fmt::Display for DetachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetachError::Fork { source } => write!(f, "fork: {source}"),
        }
    }
}

impl std::error::Error for DetachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DetachError::Fork { source } => Some(source),
        }
    }
}

/// Fork; in the child become a session leader and wait `settle` for the
/// terminal layer before the caller reopens its terminal.
pub fn detach(settle: Duration) -> Result<Detached, DetachError> {
    // SAFETY: the process is single-threaded at this point.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::info!(child = child.as_raw(), "detached, lock continues in background");
            Ok(Detached::Parent { child })
        }
        Ok(ForkResult::Child) => {
            if let Err(e) = setsid() {
                tracing::warn!(error = %e, "setsid failed");
            }
            // Without this pause, reopening the terminal can fail.
            std::thread::sleep(settle);
            Ok(Detached::Child)
        }
        Err(e) => Err(DetachError::Fork { source: e }),
    }
}
