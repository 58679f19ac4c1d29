/// Kernel control files holding a single integer (SysRq mask, printk level).
///
/// A toggle is only restored from the value this process read before
/// overwriting it; the file is never re-read to find the original.
use std::path::{Path, PathBuf};

/// Errors from reading or writing a control file.
#[derive(Debug)]
pub enum ToggleError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file did not start with an integer followed by the terminator.
    Malformed { path: PathBuf, terminator: char },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ToggleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToggleError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ToggleError::Malformed { path, terminator } => {
                write!(
                    f,
                    "{}: expected an integer terminated by {:?}",
                    path.display(),
                    terminator
                )
            }
            ToggleError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ToggleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToggleError::Read { source, .. } => Some(source),
            ToggleError::Malformed { .. } => None,
            ToggleError::Write { source, .. } => Some(source),
        }
    }
}

/// Read the decimal integer in front of the first `terminator`.
pub fn read_int(path: &Path, terminator: char) -> Result<i32, ToggleError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ToggleError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let malformed = || ToggleError::Malformed {
        path: path.to_path_buf(),
        terminator,
    };
    let (head, _) = contents.split_once(terminator).ok_or_else(malformed)?;
    head.trim().parse().map_err(|_| malformed())
}

/// Overwrite a control file with `value` as decimal text.
pub fn write_int(path: &Path, value: i32) -> Result<(), ToggleError> {
    std::fs::write(path, format!("{value}\n")).map_err(|e| ToggleError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

/// One controlled kernel feature and the value it had before we touched it.
#[derive(Debug)]
pub struct ToggleState {
    path: PathBuf,
    terminator: char,
    quiet: i32,
    previous: Option<i32>,
}

impl ToggleState {
    pub fn new(path: impl Into<PathBuf>, terminator: char, quiet: i32) -> Self {
        Self {
            path: path.into(),
            terminator,
            quiet,
            previous: None,
        }
    }

    /// `/proc/sys/kernel/sysrq`: any positive mask is cleared to 0.
    pub fn sysrq(path: impl Into<PathBuf>) -> Self {
        Self::new(path, '\n', 0)
    }

    /// `/proc/sys/kernel/printk`: the console level (first field) drops to 1.
    pub fn printk(path: impl Into<PathBuf>) -> Self {
        Self::new(path, '\t', 1)
    }

    /// Value recorded before suppression, if this process changed the file.
    #[cfg(test)]
    pub fn previous(&self) -> Option<i32> {
        self.previous
    }

    /// Lower the feature to its quiet value, remembering the old value.
    ///
    /// An unreadable file means the feature is absent: it is logged and
    /// left alone. Only a failed write is an error. Calling this again
    /// after a recorded change does nothing.
    pub fn suppress(&mut self) -> Result<(), ToggleError> {
        if self.previous.is_some() {
            return Ok(());
        }
        let current = match read_int(&self.path, self.terminator) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "control file unavailable, leaving it unchanged");
                return Ok(());
            }
        };
        if current <= self.quiet {
            tracing::debug!(path = %self.path.display(), current, "already quiet");
            return Ok(());
        }
        write_int(&self.path, self.quiet)?;
        self.previous = Some(current);
        tracing::info!(
            path = %self.path.display(),
            previous = current,
            value = self.quiet,
            "control file suppressed"
        );
        Ok(())
    }

    /// Write back the recorded value. At most one write per recorded change.
    pub fn restore(&mut self) -> Result<(), ToggleError> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };
        write_int(&self.path, previous)?;
        tracing::info!(path = %self.path.display(), value = previous, "control file restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_read_int_stops_at_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let printk = control_file(&dir, "printk", "7\t4\t1\t7\n");
        let sysrq = control_file(&dir, "sysrq", "176\n");
        assert_eq!(read_int(&printk, '\t').unwrap(), 7);
        assert_eq!(read_int(&sysrq, '\n').unwrap(), 176);
    }

    #[test]
    fn test_read_int_requires_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "176");
        let err = read_int(&path, '\n').unwrap_err();
        assert!(matches!(err, ToggleError::Malformed { .. }));
    }

    #[test]
    fn test_read_int_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "on\n");
        assert!(matches!(
            read_int(&path, '\n'),
            Err(ToggleError::Malformed { .. })
        ));
    }

    #[test]
    fn test_write_int_into_missing_dir_fails() {
        let err = write_int(Path::new("/nonexistent-dir/sysrq"), 0).unwrap_err();
        assert!(matches!(err, ToggleError::Write { .. }));
        assert!(err.to_string().contains("failed to write"));
    }

    #[test]
    fn test_suppress_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "176\n");
        let mut toggle = ToggleState::sysrq(&path);

        toggle.suppress().unwrap();
        assert_eq!(toggle.previous(), Some(176));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n");

        toggle.restore().unwrap();
        assert_eq!(toggle.previous(), None);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "176\n");
    }

    #[test]
    fn test_printk_suppresses_console_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "printk", "4\t4\t1\t7\n");
        let mut toggle = ToggleState::printk(&path);

        toggle.suppress().unwrap();
        assert_eq!(toggle.previous(), Some(4));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[test]
    fn test_already_quiet_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "printk", "1\t4\t1\t7\n");
        let mut toggle = ToggleState::printk(&path);

        toggle.suppress().unwrap();
        assert_eq!(toggle.previous(), None);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\t4\t1\t7\n");
    }

    #[test]
    fn test_restore_without_record_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "0\n");
        let mut toggle = ToggleState::sysrq(&path);
        toggle.suppress().unwrap();

        // Anything written by restore would show up here.
        std::fs::write(&path, "sentinel\n").unwrap();
        toggle.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sentinel\n");
    }

    #[test]
    fn test_restore_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "1\n");
        let mut toggle = ToggleState::sysrq(&path);
        toggle.suppress().unwrap();
        toggle.restore().unwrap();

        std::fs::write(&path, "0\n").unwrap();
        toggle.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n");
    }

    #[test]
    fn test_second_suppress_keeps_first_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file(&dir, "sysrq", "16\n");
        let mut toggle = ToggleState::sysrq(&path);
        toggle.suppress().unwrap();

        std::fs::write(&path, "99\n").unwrap();
        toggle.suppress().unwrap();
        assert_eq!(toggle.previous(), Some(16));
    }

    #[test]
    fn test_missing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let mut toggle = ToggleState::sysrq(&path);

        toggle.suppress().unwrap();
        assert_eq!(toggle.previous(), None);
        toggle.restore().unwrap();
        assert!(!path.exists());
    }
}
