/// Lock session state and the teardown that unwinds it.
///
/// Every field starts in a "not touched" state so teardown can run from
/// any point in setup, any number of times.
use crate::identity::Identities;
use crate::toggle::{ToggleError, ToggleState};
use crate::vt::{TerminalOps, VtError};

/// A single failed restore step. Teardown keeps going after any of these.
#[derive(Debug)]
pub enum TeardownError {
    Toggle(ToggleError),
    Terminal { step: &'static str, source: VtError },
}

impl std::fmt::Display for TeardownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownError::Toggle(e) => write!(f, "restore failed: {e}"),
            TeardownError::Terminal { step, source } => write!(f, "{step} failed: {source}"),
        }
    }
}

impl std::error::Error for TeardownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TeardownError::Toggle(e) => Some(e),
            TeardownError::Terminal { source, .. } => Some(source),
        }
    }
}

/// Everything the locker has changed and must put back.
#[derive(Debug)]
pub struct SessionContext<T: TerminalOps> {
    pub terminal: T,
    /// Terminal that was active before locking.
    pub original_vt: i32,
    pub sysrq: ToggleState,
    pub printk: ToggleState,
    pub identities: Option<Identities>,
    switch_locked: bool,
    released: bool,
    detached_parent: bool,
}

impl<T: TerminalOps> SessionContext<T> {
    pub fn new(terminal: T, original_vt: i32, sysrq: ToggleState, printk: ToggleState) -> Self {
        Self {
            terminal,
            original_vt,
            sysrq,
            printk,
            identities: None,
            switch_locked: false,
            released: false,
            detached_parent: false,
        }
    }

    #[cfg(test)]
    pub fn switch_locked(&self) -> bool {
        self.switch_locked
    }

    #[cfg(test)]
    pub fn released(&self) -> bool {
        self.released
    }

    /// Allocate the lock terminal and harden its input.
    pub fn acquire(&mut self) -> Result<(), VtError> {
        self.terminal.acquire()?;
        self.terminal.secure()
    }

    /// Forbid terminal switching. Only valid once the terminal is secured.
    pub fn lock(&mut self) -> Result<(), VtError> {
        if !self.terminal.is_acquired() {
            return Err(VtError::NotAcquired);
        }
        self.terminal.lock_switch(true)?;
        self.switch_locked = true;
        Ok(())
    }

    /// Mark this process as the parent half of a detach. Its teardown
    /// must not touch anything the child now owns.
    pub fn mark_detached_parent(&mut self) {
        self.detached_parent = true;
    }

    /// Release the lock after a successful authentication.
    ///
    /// Everything except printk is undone here; printk and the standard
    /// streams are left for the exit-time teardown.
    pub fn unlock(&mut self) -> Vec<TeardownError> {
        let mut failures = Vec::new();
        if self.released {
            return failures;
        }
        self.unwind_terminal(&mut failures);
        failures
    }

    /// Restore all state still held. Every step is attempted even when an
    /// earlier one failed; the failures are returned.
    pub fn teardown(&mut self) -> Vec<TeardownError> {
        let mut failures = Vec::new();
        if self.detached_parent {
            return failures;
        }
        if let Some(ids) = self.identities.take() {
            tracing::debug!(owner = %ids.owner.name, "identities released");
        }
        self.terminal.close_stdio();
        if let Err(e) = self.printk.restore() {
            failures.push(TeardownError::Toggle(e));
        }
        if self.released {
            return failures;
        }
        self.unwind_terminal(&mut failures);
        failures
    }

    fn unwind_terminal(&mut self, failures: &mut Vec<TeardownError>) {
        if let Err(e) = self.sysrq.restore() {
            failures.push(TeardownError::Toggle(e));
        }
        let acquired = self.terminal.is_acquired();
        if acquired {
            if let Err(e) = self.terminal.reset() {
                failures.push(TeardownError::Terminal {
                    step: "terminal reset",
                    source: e,
                });
            }
        }
        if self.switch_locked {
            self.switch_locked = false;
            if let Err(e) = self.terminal.lock_switch(false) {
                failures.push(TeardownError::Terminal {
                    step: "switch unlock",
                    source: e,
                });
            }
        }
        // The terminal cannot be deallocated while fds 0-2 still point at it.
        self.terminal.close_stdio();
        if acquired {
            if let Err(e) = self.terminal.release(self.original_vt) {
                failures.push(TeardownError::Terminal {
                    step: "terminal release",
                    source: e,
                });
            }
        }
        self.terminal.destroy();
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    /// Records every terminal call so tests can check ordering.
    #[derive(Debug, Default)]
    struct FakeTerminal {
        calls: Vec<&'static str>,
        acquired: bool,
        secured: bool,
        switch_locked: bool,
        destroyed: bool,
        released_to: Option<i32>,
        fail_release: bool,
        /// Allocate the terminal, then fail to switch to it.
        fail_after_alloc: bool,
    }

    impl TerminalOps for FakeTerminal {
        fn acquire(&mut self) -> Result<(), VtError> {
            self.calls.push("acquire");
            self.acquired = true;
            if self.fail_after_alloc {
                return Err(VtError::NotAcquired);
            }
            Ok(())
        }
        fn secure(&mut self) -> Result<(), VtError> {
            self.calls.push("secure");
            self.secured = true;
            Ok(())
        }
        fn reopen(&mut self) -> Result<(), VtError> {
            self.calls.push("reopen");
            Ok(())
        }
        fn lock_switch(&mut self, enable: bool) -> Result<(), VtError> {
            self.calls.push(if enable { "lock" } else { "unlock" });
            self.switch_locked = enable;
            Ok(())
        }
        fn reset(&mut self) -> Result<(), VtError> {
            self.calls.push("reset");
            self.secured = false;
            Ok(())
        }
        fn release(&mut self, original: i32) -> Result<(), VtError> {
            self.calls.push("release");
            if self.fail_release {
                return Err(VtError::NotAcquired);
            }
            self.acquired = false;
            self.released_to = Some(original);
            Ok(())
        }
        fn destroy(&mut self) {
            self.calls.push("destroy");
            self.destroyed = true;
        }
        fn is_acquired(&self) -> bool {
            self.acquired
        }
        fn close_stdio(&mut self) {
            self.calls.push("close_stdio");
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sysrq: PathBuf,
        printk: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sysrq = dir.path().join("sysrq");
        let printk = dir.path().join("printk");
        std::fs::write(&sysrq, "176\n").unwrap();
        std::fs::write(&printk, "4\t4\t1\t7\n").unwrap();
        Fixture {
            _dir: dir,
            sysrq,
            printk,
        }
    }

    fn context(fx: &Fixture) -> SessionContext<FakeTerminal> {
        SessionContext::new(
            FakeTerminal::default(),
            2,
            ToggleState::sysrq(&fx.sysrq),
            ToggleState::printk(&fx.printk),
        )
    }

    fn first_field(path: &Path) -> String {
        let text = std::fs::read_to_string(path).unwrap();
        text.split(['\t', '\n']).next().unwrap().to_string()
    }

    fn index_of(calls: &[&str], name: &str) -> usize {
        calls.iter().position(|c| *c == name).unwrap()
    }

    #[test]
    fn test_fresh_context_is_unlocked() {
        let fx = fixture();
        let ctx = context(&fx);
        assert!(!ctx.switch_locked());
        assert!(!ctx.released());
        assert!(ctx.sysrq.previous().is_none());
    }

    #[test]
    fn test_teardown_from_every_setup_prefix() {
        for steps in 0..=5 {
            let fx = fixture();
            let mut ctx = context(&fx);
            if steps >= 1 {
                ctx.sysrq.suppress().unwrap();
            }
            if steps >= 2 {
                ctx.printk.suppress().unwrap();
            }
            if steps >= 3 {
                ctx.terminal.acquire().unwrap();
            }
            if steps >= 4 {
                ctx.terminal.secure().unwrap();
            }
            if steps >= 5 {
                ctx.lock().unwrap();
            }

            let failures = ctx.teardown();
            assert!(failures.is_empty(), "steps={steps}: {failures:?}");
            assert_eq!(first_field(&fx.sysrq), "176", "steps={steps}");
            assert_eq!(first_field(&fx.printk), "4", "steps={steps}");
            assert!(!ctx.switch_locked());
            assert!(!ctx.terminal.switch_locked);
            assert!(!ctx.terminal.acquired);
            assert!(!ctx.terminal.secured);
            assert!(ctx.terminal.destroyed);
            assert!(ctx.released());
        }
    }

    #[test]
    fn test_teardown_order_when_fully_locked() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.acquire().unwrap();
        ctx.lock().unwrap();
        ctx.teardown();

        let calls = &ctx.terminal.calls;
        assert!(index_of(calls, "reset") < index_of(calls, "unlock"));
        assert!(index_of(calls, "unlock") < index_of(calls, "release"));
        assert!(index_of(calls, "close_stdio") < index_of(calls, "release"));
        assert_eq!(calls.last(), Some(&"destroy"));
        assert_eq!(ctx.terminal.released_to, Some(2));
    }

    #[test]
    fn test_teardown_skips_switch_unlock_when_never_locked() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.acquire().unwrap();
        ctx.teardown();
        assert!(!ctx.terminal.calls.contains(&"unlock"));
        assert!(ctx.terminal.calls.contains(&"release"));
    }

    #[test]
    fn test_teardown_before_acquire_touches_no_terminal() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.teardown();
        assert_eq!(
            ctx.terminal.calls,
            vec!["close_stdio", "close_stdio", "destroy"]
        );
    }

    #[test]
    fn test_untouched_toggles_are_never_written() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.acquire().unwrap();
        ctx.lock().unwrap();

        std::fs::write(&fx.sysrq, "sentinel\n").unwrap();
        std::fs::write(&fx.printk, "sentinel\n").unwrap();
        ctx.teardown();
        assert_eq!(std::fs::read_to_string(&fx.sysrq).unwrap(), "sentinel\n");
        assert_eq!(std::fs::read_to_string(&fx.printk).unwrap(), "sentinel\n");
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.acquire().unwrap();
        ctx.lock().unwrap();
        ctx.teardown();
        let calls_after_first = ctx.terminal.calls.len();

        std::fs::write(&fx.sysrq, "0\n").unwrap();
        let failures = ctx.teardown();
        assert!(failures.is_empty());
        // The second pass may only close stdio again; nothing is released twice.
        assert_eq!(&ctx.terminal.calls[calls_after_first..], &["close_stdio"]);
        assert_eq!(first_field(&fx.sysrq), "0");
    }

    #[test]
    fn test_detached_parent_teardown_does_nothing() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.acquire().unwrap();
        ctx.lock().unwrap();
        ctx.mark_detached_parent();

        ctx.teardown();
        assert_eq!(ctx.terminal.calls, vec!["acquire", "secure", "lock"]);
        assert_eq!(first_field(&fx.sysrq), "0");
        assert!(ctx.switch_locked());
    }

    #[test]
    fn test_teardown_drops_identities() {
        use crate::identity::{Identities, Identity};
        use nix::unistd::Uid;

        let fx = fixture();
        let mut ctx = context(&fx);
        let root = Identity {
            name: "root".to_string(),
            uid: Uid::from_raw(0),
            home: PathBuf::from("/root"),
        };
        ctx.identities = Some(Identities {
            owner: root.clone(),
            administrator: root,
        });
        ctx.teardown();
        assert!(ctx.identities.is_none());
    }

    #[test]
    fn test_lock_requires_terminal() {
        let fx = fixture();
        let mut ctx = context(&fx);
        assert!(matches!(ctx.lock(), Err(VtError::NotAcquired)));
        assert!(!ctx.switch_locked());
    }

    #[test]
    fn test_unlock_then_exit_teardown() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.printk.suppress().unwrap();
        ctx.acquire().unwrap();
        ctx.lock().unwrap();

        assert!(ctx.unlock().is_empty());
        assert!(ctx.released());
        assert!(!ctx.switch_locked());
        assert_eq!(first_field(&fx.sysrq), "176");
        // printk stays muted until the process exits.
        assert_eq!(first_field(&fx.printk), "1");

        ctx.teardown();
        assert_eq!(first_field(&fx.printk), "4");
        let releases = ctx.terminal.calls.iter().filter(|c| **c == "release").count();
        assert_eq!(releases, 1);
        let destroys = ctx.terminal.calls.iter().filter(|c| **c == "destroy").count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn test_teardown_continues_past_failures() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.acquire().unwrap();
        ctx.lock().unwrap();
        ctx.terminal.fail_release = true;

        let failures = ctx.teardown();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("terminal release"));
        assert!(ctx.terminal.destroyed);
        assert_eq!(first_field(&fx.sysrq), "176");
    }

    #[test]
    fn test_teardown_releases_partially_acquired_terminal() {
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.terminal.fail_after_alloc = true;
        assert!(ctx.acquire().is_err());

        let failures = ctx.teardown();
        assert!(failures.is_empty());
        assert!(ctx.terminal.calls.contains(&"release"));
        assert!(!ctx.terminal.calls.contains(&"unlock"));
        assert_eq!(ctx.terminal.released_to, Some(2));
        assert_eq!(first_field(&fx.sysrq), "176");
    }

    #[test]
    fn test_teardown_after_failed_detach() {
        // Setup got as far as locking; the fork then failed and the
        // process is exiting non-zero.
        let fx = fixture();
        let mut ctx = context(&fx);
        ctx.sysrq.suppress().unwrap();
        ctx.printk.suppress().unwrap();
        ctx.acquire().unwrap();
        ctx.lock().unwrap();

        ctx.teardown();
        assert_eq!(first_field(&fx.sysrq), "176");
        assert_eq!(first_field(&fx.printk), "4");
        assert_eq!(ctx.terminal.released_to, Some(2));
        assert!(!ctx.terminal.switch_locked);
    }
}
