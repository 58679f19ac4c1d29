/// Process-wide home of the lock session and its exit hook.
///
/// The session lives in a static so the `atexit` hook (reached from
/// `exit`, from `main` returning, or from a SIGTERM/SIGQUIT handler) can
/// find it. All mutation goes through `with_session`, which keeps the
/// fatal signals blocked, so the hook never sees a half-applied change.
use crate::session::SessionContext;
use crate::signals;
use crate::vt::LinuxTerminal;
use std::sync::{Mutex, MutexGuard, Once};

static SESSION: Mutex<Option<SessionContext<LinuxTerminal>>> = Mutex::new(None);
static REGISTER: Once = Once::new();

fn slot() -> MutexGuard<'static, Option<SessionContext<LinuxTerminal>>> {
    SESSION.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn run_at_exit() {
    let _blocked = signals::block_fatal();
    if let Some(session) = slot().as_mut() {
        for failure in session.teardown() {
            tracing::warn!(error = %failure, "teardown step failed");
        }
    }
}

/// Hand the session to the teardown and arrange for it to run at exit.
/// The hook is installed once; a second call only replaces the session.
pub fn register(session: SessionContext<LinuxTerminal>) {
    REGISTER.call_once(|| {
        // SAFETY: the hook is a plain extern "C" fn with no arguments.
        if unsafe { nix::libc::atexit(run_at_exit) } != 0 {
            tracing::error!("failed to register exit teardown");
        } else {
            tracing::debug!("exit teardown registered");
        }
    });
    let _blocked = signals::block_fatal();
    *slot() = Some(session);
}

/// Run `f` against the registered session with fatal signals blocked.
/// Returns `None` if nothing has been registered.
pub fn with_session<R>(f: impl FnOnce(&mut SessionContext<LinuxTerminal>) -> R) -> Option<R> {
    let _blocked = signals::block_fatal();
    let mut guard = slot();
    guard.as_mut().map(f)
}
