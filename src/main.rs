mod auth;
mod config;
mod detach;
mod identity;
mod lock;
mod session;
mod signals;
mod teardown;
mod toggle;
mod vt;

use clap::Parser;
use config::LockConfig;
use lock::{LockError, Outcome};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Lock the active virtual terminal until its owner, or the administrator,
/// authenticates again. Terminal switching stays disabled while locked.
#[derive(Parser, Debug)]
#[command(name = "vtlock", version, about)]
pub struct Cli {
    /// Fork to the background once the terminal is locked
    #[arg(short, long)]
    detach: bool,

    /// Only disable terminal switching, then exit
    #[arg(short = 'l', long, conflicts_with = "unlock_switch")]
    lock_switch: bool,

    /// Only re-enable terminal switching, then exit
    #[arg(short = 'L', long)]
    unlock_switch: bool,

    /// Disable the SysRq key while locked
    #[arg(short = 's', long)]
    disable_sysrq: bool,

    /// Mute kernel messages on the console while locked
    #[arg(short, long)]
    mute_kernel_messages: bool,

    /// Message shown above the password prompt
    #[arg(short, long, value_name = "MSG")]
    prompt: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print resolved settings and exit without locking
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// `Some(enable)` when only the switch lock should be changed.
    fn switch_only(&self) -> Option<bool> {
        if self.lock_switch {
            Some(true)
        } else if self.unlock_switch {
            Some(false)
        } else {
            None
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_settings(cli: &Cli, config: &LockConfig) {
    println!("vtlock v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", cli.config.display());
    match cli.switch_only() {
        Some(true) => println!("Mode: disable terminal switching"),
        Some(false) => println!("Mode: enable terminal switching"),
        None => println!("Mode: lock"),
    }
    println!("Detach: {}", config.lock.detach);
    println!(
        "Disable SysRq: {} ({})",
        config.lock.disable_sysrq,
        config.kernel.sysrq_path.display()
    );
    println!(
        "Mute kernel messages: {} ({})",
        config.lock.mute_kernel_messages,
        config.kernel.printk_path.display()
    );
    println!("Banner: {}", config.banner().unwrap_or("(none)"));
    println!(
        "Password helper: {} {}",
        config.auth.command,
        config.auth.args.join(" ")
    );
    println!("Console: {}", config.terminal.console_device.display());
}

fn run(cli: &Cli, config: &LockConfig) -> Result<(), LockError> {
    lock::require_root()?;
    signals::install();

    if let Some(enable) = cli.switch_only() {
        return lock::set_switch_lock(config, enable);
    }

    match lock::lock(config)? {
        Outcome::Unlocked => tracing::debug!("unlocked"),
        Outcome::Detached { child } => {
            tracing::debug!(child = child.as_raw(), "parent exiting after detach")
        }
    }
    Ok(())
}

fn fail(err: LockError) -> ! {
    tracing::debug!(error = ?err, "fatal error");
    eprintln!("vtlock: {err}");
    // exit(3) runs the registered teardown.
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match LockConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => fail(e.into()),
    };
    config.apply_overrides(
        cli.detach,
        cli.disable_sysrq,
        cli.mute_kernel_messages,
        cli.prompt.clone(),
    );

    if cli.dry_run {
        print_settings(&cli, &config);
        return;
    }

    if let Err(e) = run(&cli, &config) {
        fail(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["vtlock"]);
        assert!(!cli.detach);
        assert_eq!(cli.switch_only(), None);
        assert_eq!(cli.config, PathBuf::from("/etc/vtlock.toml"));
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from(["vtlock", "-d", "-s", "-m", "-p", "back soon"]);
        assert!(cli.detach);
        assert!(cli.disable_sysrq);
        assert!(cli.mute_kernel_messages);
        assert_eq!(cli.prompt.as_deref(), Some("back soon"));
    }

    #[test]
    fn test_cli_switch_modes() {
        assert_eq!(Cli::parse_from(["vtlock", "-l"]).switch_only(), Some(true));
        assert_eq!(Cli::parse_from(["vtlock", "-L"]).switch_only(), Some(false));
        assert!(Cli::try_parse_from(["vtlock", "-l", "-L"]).is_err());
    }

    #[test]
    fn test_cli_verify() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
