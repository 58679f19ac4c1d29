/// Linux virtual terminal control through the console device.
///
/// `Console` is the subsystem handle (`/dev/console`), `VtHandle` is the
/// one terminal this process allocates and holds while locked.
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd::Uid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

// <linux/vt.h>
const VT_OPENQRY: u32 = 0x5600;
const VT_GETSTATE: u32 = 0x5603;
const VT_ACTIVATE: u32 = 0x5606;
const VT_WAITACTIVE: u32 = 0x5607;
const VT_DISALLOCATE: u32 = 0x5608;
const VT_LOCKSWITCH: u32 = 0x560B;
const VT_UNLOCKSWITCH: u32 = 0x560C;

/// `struct vt_stat` as filled in by `VT_GETSTATE`.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct VtStat {
    v_active: u16,
    v_signal: u16,
    v_state: u16,
}

nix::ioctl_read_bad!(vt_openqry, VT_OPENQRY, nix::libc::c_int);
nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE, VtStat);
nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE);
nix::ioctl_write_int_bad!(vt_waitactive, VT_WAITACTIVE);
nix::ioctl_write_int_bad!(vt_disallocate, VT_DISALLOCATE);
nix::ioctl_write_int_bad!(vt_lockswitch, VT_LOCKSWITCH);
nix::ioctl_write_int_bad!(vt_unlockswitch, VT_UNLOCKSWITCH);

/// Errors from console and terminal operations.
#[derive(Debug)]
pub enum VtError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The console subsystem was already destroyed.
    Closed,
    /// An operation needed an acquired terminal.
    NotAcquired,
    Ioctl {
        op: &'static str,
        source: nix::Error,
    },
    Stat {
        path: PathBuf,
        source: nix::Error,
    },
    Termios { source: nix::Error },
    Io { source: std::io::Error },
    Stdio { source: nix::Error },
}

impl std::fmt::Display for VtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VtError::Open { path, source } => {
                write!(f, "failed to open {}: {}", path.display(), source)
            }
            VtError::Closed => write!(f, "console subsystem is not open"),
            VtError::NotAcquired => write!(f, "no virtual terminal acquired"),
            VtError::Ioctl { op, source } => write!(f, "{op}: {source}"),
            VtError::Stat { path, source } => {
                write!(f, "failed to stat {}: {}", path.display(), source)
            }
            VtError::Termios { source } => {
                write!(f, "failed to change terminal attributes: {source}")
            }
            VtError::Io { source } => write!(f, "terminal I/O error: {source}"),
            VtError::Stdio { source } => {
                write!(f, "failed to redirect standard streams: {source}")
            }
        }
    }
}

impl std::error::Error for VtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VtError::Open { source, .. } => Some(source),
            VtError::Ioctl { source, .. } => Some(source),
            VtError::Stat { source, .. } => Some(source),
            VtError::Termios { source } => Some(source),
            VtError::Io { source } => Some(source),
            VtError::Stdio { source } => Some(source),
            VtError::Closed | VtError::NotAcquired => None,
        }
    }
}

fn ioctl_err(op: &'static str) -> impl FnOnce(nix::Error) -> VtError {
    move |source| VtError::Ioctl { op, source }
}

fn open_rw(path: &Path) -> Result<File, VtError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| VtError::Open {
            path: path.to_path_buf(),
            source: e,
        })
}

/// The console device through which terminals are queried and switched.
#[derive(Debug)]
pub struct Console {
    file: Option<File>,
    tty_prefix: String,
}

impl Console {
    /// Open the console subsystem.
    pub fn open(device: &Path, tty_prefix: &str) -> Result<Self, VtError> {
        let file = open_rw(device)?;
        tracing::debug!(device = %device.display(), "console opened");
        Ok(Self {
            file: Some(file),
            tty_prefix: tty_prefix.to_string(),
        })
    }

    fn fd(&self) -> Result<RawFd, VtError> {
        self.file.as_ref().map(File::as_raw_fd).ok_or(VtError::Closed)
    }

    /// Device path of terminal `nr` (e.g. `/dev/tty3`).
    pub fn tty_path(&self, nr: i32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.tty_prefix, nr))
    }

    /// The active terminal and the uid owning its device node.
    pub fn current(&self) -> Result<(i32, Uid), VtError> {
        let mut state = VtStat::default();
        unsafe { vt_getstate(self.fd()?, &mut state) }.map_err(ioctl_err("VT_GETSTATE"))?;
        let nr = i32::from(state.v_active);
        let path = self.tty_path(nr);
        let stat = nix::sys::stat::stat(&path).map_err(|e| VtError::Stat {
            path: path.clone(),
            source: e,
        })?;
        let owner = Uid::from_raw(stat.st_uid);
        tracing::debug!(vt = nr, owner = owner.as_raw(), "current terminal");
        Ok((nr, owner))
    }

    /// Allocate a free terminal, open it and bring it to the foreground.
    ///
    /// `handle` records the terminal as soon as it is open, so a failed
    /// switch still leaves it for `release` to free.
    pub fn acquire(&self, handle: &mut VtHandle) -> Result<(), VtError> {
        let fd = self.fd()?;
        let mut nr: nix::libc::c_int = -1;
        unsafe { vt_openqry(fd, &mut nr) }.map_err(ioctl_err("could not open new console"))?;

        let path = self.tty_path(nr);
        let file = open_rw(&path)?;
        *handle = VtHandle {
            nr: Some(nr),
            path: Some(path),
            file: Some(file),
            saved: None,
        };
        unsafe { vt_activate(fd, nr) }.map_err(ioctl_err("could not activate console"))?;
        unsafe { vt_waitactive(fd, nr) }.map_err(ioctl_err("VT_WAITACTIVE"))?;
        tracing::info!(vt = nr, "terminal acquired");
        Ok(())
    }

    /// Forbid (or allow again) switching away from the active terminal.
    pub fn lock_switch(&self, enable: bool) -> Result<(), VtError> {
        let fd = self.fd()?;
        let result = if enable {
            unsafe { vt_lockswitch(fd, 1) }
        } else {
            unsafe { vt_unlockswitch(fd, 1) }
        };
        let op = if enable {
            "could not disable console switching"
        } else {
            "could not enable console switching"
        };
        result.map_err(ioctl_err(op))?;
        tracing::info!(locked = enable, "console switching updated");
        Ok(())
    }

    /// Switch back to `original` and free the held terminal.
    ///
    /// Every step is attempted and the handle is always cleared; the first
    /// failure is returned.
    pub fn release(&self, handle: &mut VtHandle, original: i32) -> Result<(), VtError> {
        let Some(nr) = handle.nr else {
            return Err(VtError::NotAcquired);
        };
        let mut first: Option<VtError> = None;
        let mut note = |result: Result<(), VtError>| {
            if let Err(e) = result {
                tracing::warn!(error = %e, "terminal release step failed");
                first.get_or_insert(e);
            }
        };

        let fd = self.fd();
        if let Ok(fd) = fd {
            note(unsafe { vt_activate(fd, original) }
                .map(drop)
                .map_err(ioctl_err("could not activate console")));
            note(unsafe { vt_waitactive(fd, original) }
                .map(drop)
                .map_err(ioctl_err("VT_WAITACTIVE")));
        }

        // The terminal cannot be deallocated while we still have it open.
        *handle = VtHandle::unacquired();

        match fd {
            Ok(fd) => note(unsafe { vt_disallocate(fd, nr) }
                .map(drop)
                .map_err(ioctl_err("VT_DISALLOCATE"))),
            Err(e) => note(Err(e)),
        }

        match first {
            Some(e) => Err(e),
            None => {
                tracing::info!(vt = nr, original, "terminal released");
                Ok(())
            }
        }
    }

    /// Close the console device. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!("console closed");
        }
    }
}

/// The terminal held while locked. Every field starts out empty.
#[derive(Debug, Default)]
pub struct VtHandle {
    nr: Option<i32>,
    path: Option<PathBuf>,
    file: Option<File>,
    saved: Option<Termios>,
}

impl VtHandle {
    /// A handle that holds nothing yet.
    pub fn unacquired() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn nr(&self) -> Option<i32> {
        self.nr
    }

    pub fn is_acquired(&self) -> bool {
        self.nr.is_some()
    }

    fn file(&self) -> Result<&File, VtError> {
        self.file.as_ref().ok_or(VtError::NotAcquired)
    }

    /// A second descriptor for the terminal, for prompting and reading.
    pub fn try_clone_file(&self) -> Result<File, VtError> {
        self.file()?
            .try_clone()
            .map_err(|e| VtError::Io { source: e })
    }

    /// Turn off echo, line editing and signal keys, remembering the old
    /// attributes for `reset`, then clear the screen.
    pub fn secure(&mut self) -> Result<(), VtError> {
        let file = self.file()?;
        let original = termios::tcgetattr(file).map_err(|e| VtError::Termios { source: e })?;

        let mut hardened = original.clone();
        hardened.local_flags &=
            !(LocalFlags::ECHO | LocalFlags::ECHOCTL | LocalFlags::ICANON | LocalFlags::ISIG);
        hardened.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        hardened.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(file, SetArg::TCSANOW, &hardened)
            .map_err(|e| VtError::Termios { source: e })?;

        let mut out = file;
        out.write_all(b"\x1b[H\x1b[J")
            .and_then(|()| out.flush())
            .map_err(|e| VtError::Io { source: e })?;

        if self.saved.is_none() {
            self.saved = Some(original);
        }
        Ok(())
    }

    /// Open the device again, e.g. after becoming a new session leader.
    pub fn reopen(&mut self) -> Result<(), VtError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.file = None;
        self.file = Some(open_rw(&path)?);
        let session = nix::unistd::getsid(None).ok();
        tracing::debug!(path = %path.display(), session = ?session, "terminal reopened");
        Ok(())
    }

    /// Put back the attributes recorded by `secure`.
    pub fn reset(&mut self) -> Result<(), VtError> {
        let Some(saved) = self.saved.as_ref() else {
            return Ok(());
        };
        termios::tcsetattr(self.file()?, SetArg::TCSANOW, saved)
            .map_err(|e| VtError::Termios { source: e })
    }
}

/// Terminal operations the lock session drives and the teardown unwinds.
pub trait TerminalOps {
    fn acquire(&mut self) -> Result<(), VtError>;
    fn secure(&mut self) -> Result<(), VtError>;
    fn reopen(&mut self) -> Result<(), VtError>;
    fn lock_switch(&mut self, enable: bool) -> Result<(), VtError>;
    fn reset(&mut self) -> Result<(), VtError>;
    fn release(&mut self, original: i32) -> Result<(), VtError>;
    fn destroy(&mut self);
    fn is_acquired(&self) -> bool;
    /// Close fds 0-2 so nothing keeps the terminal open.
    fn close_stdio(&mut self);
}

/// `TerminalOps` backed by the real console and one held terminal.
#[derive(Debug)]
pub struct LinuxTerminal {
    console: Console,
    vt: VtHandle,
    stdio_closed: bool,
}

impl LinuxTerminal {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            vt: VtHandle::unacquired(),
            stdio_closed: false,
        }
    }

    pub fn handle(&self) -> &VtHandle {
        &self.vt
    }

    /// Point stdin, stdout and stderr at the held terminal.
    pub fn redirect_stdio(&mut self) -> Result<(), VtError> {
        let fd = self.vt.file()?.as_raw_fd();
        for target in 0..=2 {
            nix::unistd::dup2(fd, target).map_err(|e| VtError::Stdio { source: e })?;
        }
        self.stdio_closed = false;
        Ok(())
    }
}

impl TerminalOps for LinuxTerminal {
    fn acquire(&mut self) -> Result<(), VtError> {
        if self.vt.is_acquired() {
            return Ok(());
        }
        self.console.acquire(&mut self.vt)
    }

    fn secure(&mut self) -> Result<(), VtError> {
        self.vt.secure()
    }

    fn reopen(&mut self) -> Result<(), VtError> {
        self.vt.reopen()
    }

    fn lock_switch(&mut self, enable: bool) -> Result<(), VtError> {
        self.console.lock_switch(enable)
    }

    fn reset(&mut self) -> Result<(), VtError> {
        self.vt.reset()
    }

    fn release(&mut self, original: i32) -> Result<(), VtError> {
        self.console.release(&mut self.vt, original)
    }

    fn destroy(&mut self) {
        self.console.destroy();
    }

    fn is_acquired(&self) -> bool {
        self.vt.is_acquired()
    }

    fn close_stdio(&mut self) {
        if self.stdio_closed {
            return;
        }
        for fd in 0..=2 {
            let _ = nix::unistd::close(fd);
        }
        self.stdio_closed = true;
    }
}
