//! Step and summary lines for CLI output

use super::context::{Presentation, UiContext};
use super::theme::ember;
use console::style;

/// Run `rich` or `plain` for the context's presentation; silent runs neither
fn emit(ctx: &UiContext, rich: impl FnOnce(), plain: impl FnOnce()) {
    match ctx.presentation() {
        Presentation::Rich => rich(),
        Presentation::Plain => plain(),
        Presentation::Silent => {}
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || {
            cliclack::outro(style(message).green().bold()).ok();
        },
        || println!("\n{} {}", style("[OK]").green(), message),
    );
}

pub fn section(ctx: &UiContext, title: &str) {
    emit(
        ctx,
        || {
            println!();
            cliclack::log::step(style(title).bold()).ok();
        },
        || println!("\n{}", style(title).bold()),
    );
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || {
            cliclack::log::success(message).ok();
        },
        || println!("  {} {}", style("[OK]").green(), message),
    );
}

/// Success line with a dimmed detail, e.g. a layer and where it came from
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(
        ctx,
        || {
            cliclack::log::success(format!("{} {}", message, style(detail).dim())).ok();
        },
        || println!("  {} {} ({})", style("[OK]").green(), message, detail),
    );
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    step_warn_hint(ctx, message, "");
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    let line = if hint.is_empty() {
        message.to_string()
    } else {
        format!("{} - {}", message, hint)
    };
    emit(
        ctx,
        || {
            cliclack::log::warning(&line).ok();
        },
        || println!("  {} {}", style("[WARN]").yellow(), line),
    );
}

pub fn step_info(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || {
            cliclack::log::info(message).ok();
        },
        || println!("  {} {}", ember().apply_to("[INFO]"), message),
    );
}

pub fn remark(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || {
            cliclack::log::remark(message).ok();
        },
        || println!("  {}", style(message).dim()),
    );
}

/// Aligned `key: value` line under the current section
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    let line = format!("  {:<10} {}", format!("{}:", key), value);
    emit(ctx, || println!("{}", style(&line).dim()), || println!("{}", line));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::OutputFormat;
    use std::cell::Cell;

    #[test]
    fn silent_context_runs_nothing() {
        let ran = Cell::new(false);
        let ctx = UiContext::plain().for_format(OutputFormat::Json);
        emit(&ctx, || ran.set(true), || ran.set(true));
        assert!(!ran.get());
    }

    #[test]
    fn plain_context_takes_plain_branch() {
        let branch = Cell::new("");
        emit(&UiContext::plain(), || branch.set("rich"), || branch.set("plain"));
        assert_eq!(branch.get(), "plain");
    }

    #[test]
    fn plain_output_does_not_panic() {
        let ctx = UiContext::plain();
        section(&ctx, "Layers");
        step_ok_detail(&ctx, "dependencies", "cached");
        step_warn_hint(&ctx, "No entries", "Nothing to remove");
        key_value(&ctx, "digest", "sha256:abc");
        outro_success(&ctx, "Done");
    }
}
