//! plotest CLI - run hardware-in-the-loop suites against plo based boards.
//!
//! ## Features
//!
//! - Flash the whole-device image once, then run the configured tests
//! - Physical boards over serial, emulators as child processes
//! - GPIO, modem line, debug probe or interactive reboots
//! - Picks the serial port interactively when none is configured
//! - Every global option can come from a `PLOTEST_*` variable

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod report;
#[cfg(feature = "native")]
mod serial;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Progress bars and colored results only on a color-capable terminal.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Failures the CLI classifies itself; each maps to an exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Wrong invocation.
    #[error("{0}")]
    Usage(String),
    /// Missing or invalid configuration.
    #[error("{0}")]
    Config(String),
    /// The user stopped the run.
    #[error("{0}")]
    Cancelled(String),
    /// The run completed with failing tests.
    #[error("{failed} of {total} tests failed")]
    TestsFailed {
        /// Failed tests.
        failed: usize,
        /// Tests run.
        total: usize,
    },
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Cancelled(_) => 130,
            Self::TestsFailed { .. } => 1,
        }
    }
}

/// Exit code for an error that ended the program.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    match err.downcast_ref::<plotest::Error>() {
        Some(plotest::Error::Config(_) | plotest::Error::HarnessComposition(_)) => 3,
        Some(plotest::Error::Interrupted) => 130,
        _ => 1,
    }
}

/// plotest - hardware-in-the-loop test runner for plo based boards.
///
/// Environment variables:
///   PLOTEST_TARGET            - Default target name
///   PLOTEST_HOST              - Default host name or kind (rpi, pc, emulator)
///   PLOTEST_PORT              - Serial port of a physical target
///   PLOTEST_CONFIG            - Configuration file
///   PLOTEST_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "plotest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Targets, hosts and tests are declared in plotest.toml.")]
pub(crate) struct Cli {
    /// Target to run on.
    #[arg(short, long, global = true, env = "PLOTEST_TARGET")]
    target: Option<String>,

    /// Host driving the target: a configured host name or rpi, pc, emulator.
    #[arg(long, global = true, env = "PLOTEST_HOST")]
    host: Option<String>,

    /// Serial port of a physical target.
    #[arg(short, long, global = true, env = "PLOTEST_PORT")]
    port: Option<String>,

    /// More logging (-v debug, -vv trace with timestamps).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print failures and the summary.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Never prompt; fail when a choice is needed.
    #[arg(long, global = true, env = "PLOTEST_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Read this file instead of the global and local plotest.toml.
    #[arg(long = "config", global = true, value_name = "PATH", env = "PLOTEST_CONFIG")]
    config_path: Option<PathBuf>,

    /// Copy all console traffic to a file.
    #[arg(long, global = true, value_name = "PATH")]
    session_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash the device image, then run the tests.
    Run {
        /// Skip flashing.
        #[arg(long)]
        no_flash: bool,

        /// Skip the tests.
        #[arg(long)]
        no_test: bool,

        /// Reboot before every test.
        #[arg(long)]
        nightly: bool,

        /// Only run the named test (can be repeated).
        #[arg(long = "test", value_name = "NAME")]
        tests: Vec<String>,
    },

    /// Flash the device image only.
    Flash,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate the script for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    // First Ctrl-C stops after the running test, the second one right away.
    let installed = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!(
            "\n{} stopping after the current test (Ctrl-C again to abort)",
            style("⚠").yellow()
        );
    });
    if let Err(e) = installed {
        debug!("Ctrl-C handler not installed: {e}");
    }
    plotest::set_interrupt_checker(|| INTERRUPTED.load(Ordering::SeqCst));
}

fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run {
            no_flash,
            no_test,
            nightly,
            tests,
        } => commands::run::cmd_run(
            cli,
            &commands::run::RunArgs {
                flash: !no_flash,
                test: !no_test,
                nightly: *nightly,
                only: tests.clone(),
            },
        ),
        Commands::Flash => commands::run::cmd_flash(cli),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "plotest v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
    install_interrupt_handler();

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&e))
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from([
            "plotest",
            "--target",
            "ia32-generic-qemu",
            "run",
            "--no-flash",
            "--nightly",
            "--test",
            "uname",
            "--test",
            "ls",
        ])
        .unwrap();
        assert_eq!(cli.target.as_deref(), Some("ia32-generic-qemu"));
        let Commands::Run {
            no_flash,
            no_test,
            nightly,
            tests,
        } = cli.command
        else {
            panic!("Expected Run command");
        };
        assert!(no_flash);
        assert!(!no_test);
        assert!(nightly);
        assert_eq!(tests, ["uname", "ls"]);
    }

    #[test]
    fn test_cli_global_args_after_subcommand() {
        let cli = Cli::try_parse_from(["plotest", "flash", "-p", "/dev/ttyACM0", "-vv"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Flash));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["plotest"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::new(CliError::Usage("x".into()));
        assert_eq!(exit_code_for(&usage), 2);

        let config = anyhow::Error::new(CliError::Config("x".into()));
        assert_eq!(exit_code_for(&config), 3);

        let failed = anyhow::Error::new(CliError::TestsFailed { failed: 1, total: 3 });
        assert_eq!(exit_code_for(&failed), 1);

        let interrupted = anyhow::Error::new(plotest::Error::Interrupted);
        assert_eq!(exit_code_for(&interrupted), 130);

        let composition = anyhow::Error::new(plotest::Error::HarnessComposition("x".into()));
        assert_eq!(exit_code_for(&composition), 3);

        let flash = anyhow::Error::new(plotest::Error::Flash {
            message: "copy failed".into(),
            output: String::new(),
        })
        .context("flashing ia32-generic-qemu");
        assert_eq!(exit_code_for(&flash), 1);
    }
}
