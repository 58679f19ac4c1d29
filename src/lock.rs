/// The locking sequence, from opening the console to the final unlock.
use crate::auth::{self, AuthError, AuthState, CommandAuthenticator};
use crate::config::{ConfigError, LockConfig};
use crate::detach::{self, DetachError, Detached};
use crate::identity::{Identities, IdentityError};
use crate::session::SessionContext;
use crate::teardown;
use crate::toggle::{ToggleError, ToggleState};
use crate::vt::{Console, LinuxTerminal, TerminalOps, VtError};
use nix::unistd::Pid;
use std::io::Write;

/// Fatal errors. Any of these ends the process after the teardown runs.
#[derive(Debug)]
pub enum LockError {
    NotRoot,
    Config(ConfigError),
    Terminal(VtError),
    Identity(IdentityError),
    Toggle(ToggleError),
    Detach(DetachError),
    Auth(AuthError),
    /// A setup step ran before the session was registered.
    Unregistered,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::NotRoot => write!(f, "must be root"),
            LockError::Config(e) => write!(f, "{e}"),
            LockError::Terminal(e) => write!(f, "{e}"),
            LockError::Identity(e) => write!(f, "{e}"),
            LockError::Toggle(e) => write!(f, "{e}"),
            LockError::Detach(e) => write!(f, "{e}"),
            LockError::Auth(e) => write!(f, "{e}"),
            LockError::Unregistered => write!(f, "lock session is not registered"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Config(e) => Some(e),
            LockError::Terminal(e) => Some(e),
            LockError::Identity(e) => Some(e),
            LockError::Toggle(e) => Some(e),
            LockError::Detach(e) => Some(e),
            LockError::Auth(e) => Some(e),
            LockError::NotRoot | LockError::Unregistered => None,
        }
    }
}

impl From<ConfigError> for LockError {
    fn from(e: ConfigError) -> Self {
        LockError::Config(e)
    }
}

impl From<VtError> for LockError {
    fn from(e: VtError) -> Self {
        LockError::Terminal(e)
    }
}

impl From<IdentityError> for LockError {
    fn from(e: IdentityError) -> Self {
        LockError::Identity(e)
    }
}

impl From<ToggleError> for LockError {
    fn from(e: ToggleError) -> Self {
        LockError::Toggle(e)
    }
}

impl From<DetachError> for LockError {
    fn from(e: DetachError) -> Self {
        LockError::Detach(e)
    }
}

impl From<AuthError> for LockError {
    fn from(e: AuthError) -> Self {
        LockError::Auth(e)
    }
}

impl From<std::io::Error> for LockError {
    fn from(e: std::io::Error) -> Self {
        LockError::Auth(AuthError::from(e))
    }
}

/// How a lock run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Someone authenticated and everything was released.
    Unlocked,
    /// This is the parent of a detach; the child holds the lock.
    Detached { child: Pid },
}

pub fn require_root() -> Result<(), LockError> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(LockError::NotRoot)
    }
}

/// Turn console switching off or on and return. No terminal is acquired
/// and nothing is restored afterwards.
pub fn set_switch_lock(config: &LockConfig, enable: bool) -> Result<(), LockError> {
    let mut console = Console::open(
        &config.terminal.console_device,
        &config.terminal.tty_prefix,
    )?;
    let result = console.lock_switch(enable);
    console.destroy();
    result?;
    Ok(())
}

/// Apply one change to the registered session with fatal signals held off.
fn step<R, E>(
    f: impl FnOnce(&mut SessionContext<LinuxTerminal>) -> Result<R, E>,
) -> Result<R, LockError>
where
    E: Into<LockError>,
{
    teardown::with_session(f)
        .ok_or(LockError::Unregistered)?
        .map_err(Into::into)
}

/// Lock the active terminal until the owner or the administrator
/// authenticates.
pub fn lock(config: &LockConfig) -> Result<Outcome, LockError> {
    let console = Console::open(
        &config.terminal.console_device,
        &config.terminal.tty_prefix,
    )?;
    let (original_vt, owner) = console.current()?;
    let identities = Identities::resolve(owner)?;

    let mut session = SessionContext::new(
        LinuxTerminal::new(console),
        original_vt,
        ToggleState::sysrq(&config.kernel.sysrq_path),
        ToggleState::printk(&config.kernel.printk_path),
    );
    session.identities = Some(identities.clone());
    teardown::register(session);

    if config.lock.disable_sysrq {
        step(|s| s.sysrq.suppress())?;
    }
    if config.lock.mute_kernel_messages {
        step(|s| s.printk.suppress())?;
    }

    step(|s| s.acquire())?;
    step(|s| s.lock())?;
    tracing::info!(original_vt, owner = %identities.owner.name, "terminal locked");

    if config.lock.detach {
        match detach::detach(config.terminal.settle_delay())? {
            Detached::Parent { child } => {
                step(|s| {
                    s.mark_detached_parent();
                    Ok::<_, LockError>(())
                })?;
                return Ok(Outcome::Detached { child });
            }
            Detached::Child => step(|s| s.terminal.reopen())?,
        }
    }

    let vt = step(|s| {
        s.terminal.redirect_stdio()?;
        s.terminal.handle().try_clone_file()
    })?;
    authenticate(config, &identities, &vt)?;
    // Our descriptor would keep the terminal from being deallocated.
    drop(vt);

    let failures = step(|s| Ok::<_, LockError>(s.unlock()))?;
    for failure in failures {
        tracing::warn!(error = %failure, "unlock step failed");
    }
    Ok(Outcome::Unlocked)
}

fn authenticate(
    config: &LockConfig,
    identities: &Identities,
    vt: &std::fs::File,
) -> Result<(), LockError> {
    let mut input = vt;
    let mut output = vt;
    if let Some(banner) = config.banner() {
        write!(output, "{banner}\n\n")?;
    }

    let mut state = AuthState::new(identities.owner_is_administrator());
    let mut authenticator = CommandAuthenticator::new(&config.auth);
    auth::run(
        &mut state,
        identities,
        &mut authenticator,
        &mut input,
        &mut output,
    )?;
    Ok(())
}
