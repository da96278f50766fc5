//! # Shell Completion Module
//!
//! ```bash
//! # Generate bash completions
//! pulsetempo completion bash > ~/.local/share/bash-completion/completions/pulsetempo
//!
//! # Generate zsh completions
//! pulsetempo completion zsh > ~/.config/zsh/completions/_pulsetempo
//! ```

use crate::cli::Shell;
use clap::Command;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io::Write;

/// Write the completion script for `cmd` to `out`.
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command, out: &mut dyn Write) {
    let name = cmd.get_name().to_string();
    generate(gen, cmd, name, out);
}

#[must_use]
pub const fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}
