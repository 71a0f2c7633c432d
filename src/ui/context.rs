//! How kiln presents human-facing output for one command

use crate::cli::args::OutputFormat;
use std::io::IsTerminal;

/// Env vars that force line-oriented output even on a terminal
const PLAIN_ENV: [&str; 2] = ["CI", "KILN_PLAIN"];

/// How human-facing output is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// cliclack and indicatif widgets
    Rich,
    /// One line per event, for logs and CI
    Plain,
    /// Nothing. Stdout carries only machine-readable output.
    Silent,
}

#[derive(Debug, Clone)]
pub struct UiContext {
    presentation: Presentation,
    /// Approve confirmations without asking (`--yes`)
    auto_yes: bool,
}

impl UiContext {
    /// Rich on an interactive terminal unless CI or `KILN_PLAIN` is set
    pub fn detect() -> Self {
        let tty = std::io::stdout().is_terminal() && std::io::stdin().is_terminal();
        Self::resolve(tty, |var| std::env::var_os(var).is_some(), std::env::var("TERM").ok())
    }

    fn resolve(tty: bool, is_set: impl Fn(&str) -> bool, term: Option<String>) -> Self {
        let rich = tty && term.as_deref() != Some("dumb") && !PLAIN_ENV.iter().any(|v| is_set(v));
        Self::with_presentation(if rich {
            Presentation::Rich
        } else {
            Presentation::Plain
        })
    }

    pub fn with_presentation(presentation: Presentation) -> Self {
        Self {
            presentation,
            auto_yes: false,
        }
    }

    pub fn plain() -> Self {
        Self::with_presentation(Presentation::Plain)
    }

    /// Machine-readable formats keep stdout free of progress and step lines
    pub fn for_format(mut self, format: OutputFormat) -> Self {
        if !matches!(format, OutputFormat::Table) {
            self.presentation = Presentation::Silent;
        }
        self
    }

    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn presentation(&self) -> Presentation {
        self.presentation
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Only a rich terminal can answer a prompt
    pub fn can_prompt(&self) -> bool {
        self.presentation == Presentation::Rich
    }
}
