//! cliclack theme and the spinner frames shared with build progress

use cliclack::ThemeState;
use console::Style;

/// Spinner frames; the trailing blank is shown once a spinner finishes
pub(crate) const SPINNER_TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";

/// 256-color orange for anything in progress
const EMBER: u8 = 208;

pub(crate) fn ember() -> Style {
    Style::new().color256(EMBER)
}

#[derive(Debug, Clone, Default)]
pub struct KilnTheme;

impl cliclack::Theme for KilnTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => ember(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel | ThemeState::Submit => Style::new().dim(),
        }
    }

    fn info_symbol(&self) -> String {
        ember().apply_to("●").to_string()
    }

    fn spinner_chars(&self) -> String {
        SPINNER_TICKS.to_string()
    }
}

pub fn init_theme() {
    cliclack::set_theme(KilnTheme);
}
