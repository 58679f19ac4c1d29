use crate::config::AuthConfig;
use crate::identity::{Identities, Identity};
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive owner failures before the administrator is offered.
pub const OWNER_ATTEMPTS: u32 = 3;

/// Longest secret accepted; further input is dropped.
const MAX_SECRET: usize = 1023;

/// Pause before prompting again after the console hung up.
const HANGUP_BACKOFF: Duration = Duration::from_millis(500);

/// Whose credentials the loop is currently asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Owner,
    Administrator,
}

/// Identity switching for the unlock loop.
///
/// Starts at the owner and alternates: three owner failures hand over to
/// the administrator, one administrator failure hands back. When the
/// terminal belongs to the administrator there is only one target.
#[derive(Debug, Clone)]
pub struct AuthState {
    target: Target,
    failures: u32,
    admin_only: bool,
}

impl AuthState {
    pub fn new(owner_is_admin: bool) -> Self {
        Self {
            target: if owner_is_admin {
                Target::Administrator
            } else {
                Target::Owner
            },
            failures: 0,
            admin_only: owner_is_admin,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Consecutive failures against the current target.
    #[cfg(test)]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. Returns `true` if the target flipped.
    pub fn record_failure(&mut self) -> bool {
        if self.admin_only {
            return false;
        }
        self.failures += 1;
        let flip = match self.target {
            Target::Administrator => true,
            Target::Owner => self.failures >= OWNER_ATTEMPTS,
        };
        if flip {
            self.target = match self.target {
                Target::Owner => Target::Administrator,
                Target::Administrator => Target::Owner,
            };
            self.failures = 0;
            debug!(next = ?self.target, "switching authentication target");
        }
        flip
    }
}

/// Console failures while authenticating. `Io` ends the lock.
#[derive(Debug)]
pub enum AuthError {
    Io { source: std::io::Error },
    /// End of input before any byte was read.
    Hangup,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Io { source } => write!(f, "error reading from console: {source}"),
            AuthError::Hangup => write!(f, "console hung up"),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Io { source } => Some(source),
            AuthError::Hangup => None,
        }
    }
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Io { source: e }
    }
}

/// One verification attempt against one account.
pub trait Authenticator {
    /// Returns `Ok(true)` if `who` proved their identity.
    fn authenticate(
        &mut self,
        who: &Identity,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<bool, AuthError>;
}

/// Ask until someone authenticates. There is no attempt limit.
///
/// A hangup is not a failed attempt: the loop waits and prompts again.
pub fn run(
    state: &mut AuthState,
    identities: &Identities,
    authenticator: &mut dyn Authenticator,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<(), AuthError> {
    loop {
        let who = match state.target() {
            Target::Owner => &identities.owner,
            Target::Administrator => &identities.administrator,
        };
        if state.target() == Target::Administrator {
            write!(output, "{}: ", who.name)?;
            output.flush()?;
        }
        match authenticator.authenticate(who, input, output) {
            Ok(true) => {
                info!(user = %who.name, "authenticated");
                return Ok(());
            }
            Ok(false) => {}
            Err(AuthError::Hangup) => {
                warn!("console hung up, waiting before prompting again");
                std::thread::sleep(HANGUP_BACKOFF);
                continue;
            }
            Err(e) => return Err(e),
        }
        info!(user = %who.name, "authentication failed");
        state.record_failure();
        write!(output, "Authentication failed\n\n")?;
        output.flush()?;
    }
}

/// Read one line of secret input from a terminal in non-canonical mode.
///
/// Handles backspace/DEL and ^U itself, skips NUL, and stops at CR, LF or
/// end of input. End of input before any byte is `UnexpectedEof`.
pub fn read_secret(input: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut secret = Vec::new();
    let mut byte = [0u8; 1];
    let mut seen = false;
    loop {
        match input.read(&mut byte) {
            Ok(0) if !seen => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "console closed",
                ))
            }
            Ok(0) => break,
            Ok(_) => {
                seen = true;
                match byte[0] {
                    b'\n' | b'\r' => break,
                    0x08 | 0x7f => {
                        secret.pop();
                    }
                    0x15 => {
                        secret.fill(0);
                        secret.clear();
                    }
                    0 => {}
                    b if secret.len() < MAX_SECRET => secret.push(b),
                    _ => {}
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                secret.fill(0);
                return Err(e);
            }
        }
    }
    Ok(secret)
}

/// Verifies a password by running a helper command.
///
/// `{user}` in the arguments becomes the account name; the password is
/// written to the helper's stdin followed by a NUL byte, the framing
/// `unix_chkpwd` expects. Exit status 0 means success.
pub struct CommandAuthenticator {
    command: String,
    args: Vec<String>,
}

impl CommandAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn build_args(&self, user: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{user}", user))
            .collect()
    }

    fn verify(&self, who: &Identity, secret: &[u8]) -> bool {
        let mut child = match Command::new(&self.command)
            .args(self.build_args(&who.name))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %self.command, error = %e, "failed to spawn password helper");
                return false;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            // The helper may exit before reading everything.
            if let Err(e) = stdin.write_all(secret).and_then(|()| stdin.write_all(b"\0")) {
                debug!(error = %e, "password helper closed stdin early");
            }
        }
        match child.wait() {
            Ok(status) => {
                debug!(exit_code = ?status.code(), "password helper finished");
                status.success()
            }
            Err(e) => {
                warn!(error = %e, "failed to wait for password helper");
                false
            }
        }
    }
}

impl Authenticator for CommandAuthenticator {
    fn authenticate(
        &mut self,
        who: &Identity,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<bool, AuthError> {
        write!(output, "Password: ")?;
        output.flush()?;
        let mut secret = match read_secret(input) {
            Ok(secret) => secret,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(AuthError::Hangup),
            Err(e) => return Err(e.into()),
        };
        writeln!(output)?;
        output.flush()?;

        let ok = self.verify(who, &secret);
        secret.fill(0);
        Ok(ok)
    }
}
