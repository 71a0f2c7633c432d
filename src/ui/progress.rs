//! Progress indicators with CI fallback

use super::context::{Presentation, UiContext};
use super::theme::SPINNER_TICKS;
use crate::orchestrator::{BuildObserver, LayerSource};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    presentation: Presentation,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            presentation: ctx.presentation(),
        }
    }

    pub fn start(&mut self, message: &str) {
        match self.presentation {
            Presentation::Rich => {
                let spinner = cliclack::spinner();
                spinner.start(message);
                self.spinner = Some(spinner);
            }
            Presentation::Plain => println!("{} {}", style("...").dim(), message),
            Presentation::Silent => {}
        }
    }

    pub fn stop(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.stop(message),
            None if self.presentation == Presentation::Plain => {
                println!("{} {}", style("[OK]").green(), message)
            }
            None => {}
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.error(message),
            None if self.presentation == Presentation::Plain => {
                println!("{} {}", style("[FAIL]").red(), message)
            }
            None => {}
        }
    }
}

/// Live build progress fed by the build session.
///
/// Rich output is an indicatif spinner with a running layer count. Plain
/// output prints one line per phase and per layer. Silent prints nothing.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
    presentation: Presentation,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, target: &str) -> Self {
        let presentation = ctx.presentation();
        let bar = match presentation {
            Presentation::Rich => {
                let bar = ProgressBar::new_spinner();
                if let Ok(template) = ProgressStyle::with_template(
                    "  {spinner:.208} {prefix} {pos} layers {msg:.dim}  {elapsed:.dim}",
                ) {
                    bar.set_style(template.tick_chars(SPINNER_TICKS));
                }
                bar.set_prefix(format!("Building {}", target));
                bar.enable_steady_tick(std::time::Duration::from_millis(120));
                Some(bar)
            }
            Presentation::Plain => {
                println!("Building {}...", target);
                None
            }
            Presentation::Silent => None,
        };
        Self { bar, presentation }
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }

    fn plain(&self) -> bool {
        self.presentation == Presentation::Plain
    }
}

impl BuildObserver for BuildProgress {
    fn phase(&self, message: &str) {
        if let Some(ref bar) = self.bar {
            bar.set_message(message.to_string());
        } else if self.plain() {
            println!("  {}", message);
        }
    }

    fn layer_ready(&self, name: &str, source: LayerSource) {
        if let Some(ref bar) = self.bar {
            bar.inc(1);
        } else if self.plain() {
            println!("  {} {} ({})", style("[OK]").green(), name, source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_spinner_has_no_widget() {
        let mut spinner = TaskSpinner::new(&UiContext::plain());
        spinner.start("Removing cache entries...");
        assert!(spinner.spinner.is_none());
        spinner.stop_error("Failed");
    }

    #[test]
    fn build_progress_without_bar() {
        for ctx in [
            UiContext::plain(),
            UiContext::with_presentation(Presentation::Silent),
        ] {
            let progress = BuildProgress::new(&ctx, "team/app:v1");
            assert!(progress.bar.is_none());
            progress.phase("installing dependencies");
            progress.layer_ready("dependencies", LayerSource::Cached);
            progress.finish();
        }
    }
}
