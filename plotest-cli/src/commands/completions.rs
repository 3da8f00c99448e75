//! `completions`: shell completion scripts.

use std::io::{self, Write};

use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::Cli;

fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    let bin = cmd
        .get_bin_name()
        .unwrap_or("plotest")
        .to_string();
    generate(shell, &mut cmd, bin, out);
}

/// Print the completion script for `shell` on stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    write_completions(shell, &mut io::stdout());
}
