use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vtlock.toml";

/// Top-level configuration loaded from vtlock.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct LockConfig {
    pub lock: LockOptions,
    pub auth: AuthConfig,
    pub kernel: KernelConfig,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct LockOptions {
    pub detach: bool,
    pub disable_sysrq: bool,
    pub mute_kernel_messages: bool,
    pub prompt: Option<String>,
}

/// Helper command used to verify a password. `{user}` in `args` is
/// replaced with the account name; the password arrives on stdin.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub sysrq_path: PathBuf,
    pub printk_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub console_device: PathBuf,
    pub tty_prefix: String,
    pub settle_ms: u64,
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl LockConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Merge command-line flags over the file values. Flags can only
    /// enable features; a non-empty `prompt` replaces the configured one.
    pub fn apply_overrides(
        &mut self,
        detach: bool,
        disable_sysrq: bool,
        mute_kernel_messages: bool,
        prompt: Option<String>,
    ) {
        self.lock.detach |= detach;
        self.lock.disable_sysrq |= disable_sysrq;
        self.lock.mute_kernel_messages |= mute_kernel_messages;
        if prompt.is_some() {
            self.lock.prompt = prompt;
        }
    }

    /// Banner to show above the first prompt, if any.
    pub fn banner(&self) -> Option<&str> {
        self.lock.prompt.as_deref().filter(|p| !p.is_empty())
    }
}

impl TerminalConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// --- Default implementations ---

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            command: "/usr/sbin/unix_chkpwd".to_string(),
            args: vec!["{user}".to_string(), "nonull".to_string()],
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            sysrq_path: PathBuf::from("/proc/sys/kernel/sysrq"),
            printk_path: PathBuf::from("/proc/sys/kernel/printk"),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            console_device: PathBuf::from("/dev/console"),
            tty_prefix: "/dev/tty".to_string(),
            settle_ms: 1000,
        }
    }
}
