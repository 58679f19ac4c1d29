/// Signal dispositions for the locker.
///
/// SIGTERM and SIGQUIT exit (which runs the registered teardown).
/// SIGINT and SIGHUP are ignored so the lock cannot be escaped with them;
/// SIGUSR1 and SIGUSR2 are reserved and ignored as well.
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

/// Signals whose handler ends the process.
pub const FATAL: [Signal; 2] = [Signal::SIGTERM, Signal::SIGQUIT];

/// Signals that are dropped on the floor.
pub const IGNORED: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

extern "C" fn exit_on_signal(_: nix::libc::c_int) {
    // exit(3) runs the atexit teardown.
    unsafe { nix::libc::exit(0) }
}

fn install_one(sig: Signal, handler: SigHandler) {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only calls exit.
    if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
        tracing::warn!(signal = %sig, error = %e, "failed to install signal handler");
    }
}

/// Install all dispositions. Failures are logged, not fatal.
pub fn install() {
    for sig in FATAL {
        install_one(sig, SigHandler::Handler(exit_on_signal));
    }
    for sig in IGNORED {
        install_one(sig, SigHandler::SigIgn);
    }
    tracing::debug!("signal handlers installed");
}

/// Keeps the fatal signals blocked until dropped, so their handler can
/// never run in the middle of a state change.
pub struct FatalSignalsBlocked {
    previous: Option<SigSet>,
}

impl Drop for FatalSignalsBlocked {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = previous.thread_set_mask() {
                tracing::warn!(error = %e, "failed to restore signal mask");
            }
        }
    }
}

/// Block SIGTERM and SIGQUIT for the current thread.
pub fn block_fatal() -> FatalSignalsBlocked {
    let mut set = SigSet::empty();
    for sig in FATAL {
        set.add(sig);
    }
    let previous = match set.thread_swap_mask(SigmaskHow::SIG_BLOCK) {
        Ok(old) => Some(old),
        Err(e) => {
            tracing::warn!(error = %e, "failed to block fatal signals");
            None
        }
    };
    FatalSignalsBlocked { previous }
}
