//! `run` and `flash`: drive the test runner against one target.

use anyhow::Result;
use console::style;
use log::{info, warn};
use plotest::{RunContext, Summary, Target, TestOptions, TestRunner};

use super::open_target;
use crate::config::Config;
use crate::report::ConsoleReporter;
use crate::{Cli, CliError};

/// Options of the `run` command.
pub(crate) struct RunArgs {
    pub(crate) flash: bool,
    pub(crate) test: bool,
    pub(crate) nightly: bool,
    pub(crate) only: Vec<String>,
}

/// Run the command line's session and close the target whatever happens.
fn execute(target: Target, context: RunContext, tests: &mut [TestOptions], quiet: bool) -> Result<Summary> {
    let mut runner = TestRunner::new(target, context);
    let mut reporter = ConsoleReporter::new(quiet);
    let outcome = runner.run(tests, &mut reporter);

    let mut target = runner.into_target();
    if let Err(e) = target.close() {
        warn!("Failed to close {}: {e}", target.config().name);
    }
    Ok(outcome?)
}

/// Flash (when the target has an image), then run the configured tests.
pub(crate) fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref())?;
    let (name, _) = config.target(cli.target.as_deref())?;
    let mut tests = if args.test {
        config.tests_for(name, &args.only)?
    } else {
        Vec::new()
    };
    if args.test && tests.is_empty() {
        warn!("No tests configured for {name}");
    }

    let target = open_target(cli, &config)?;
    let flash = args.flash && target.config().flash_image.is_some();
    if args.flash && !flash {
        info!("{name} has no flash image, skipping flashing");
    }
    let context = RunContext::new()
        .with_flash(flash)
        .with_test(args.test)
        .with_nightly(args.nightly);

    let summary = execute(target, context, &mut tests, cli.quiet)?;
    if summary.is_success() {
        Ok(())
    } else {
        Err(CliError::TestsFailed {
            failed: summary.failed,
            total: summary.total(),
        }
        .into())
    }
}

/// Program the whole-device image and stop.
pub(crate) fn cmd_flash(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref())?;
    let mut target = open_target(cli, &config)?;
    if target.config().flash_image.is_none() {
        let name = target.config().name.clone();
        if let Err(e) = target.close() {
            warn!("Failed to close {name}: {e}");
        }
        return Err(CliError::Config(format!("target {name} has no flash_image")).into());
    }

    let context = RunContext::new()
        .with_flash(true)
        .with_test(false);
    execute(target, context, &mut [], cli.quiet)?;

    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("✓").green().bold());
    }
    Ok(())
}
