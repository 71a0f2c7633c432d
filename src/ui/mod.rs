//! UI module for consistent CLI output
//!
//! Uses `cliclack` for steps, spinners and prompts and `indicatif` for build
//! progress. A [`UiContext`] picks rich, plain or silent presentation; the
//! machine-readable `--format`s are silent so stdout stays parseable.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Removing cache entries...");
//! // ... do work ...
//! spinner.stop("Removed 3 entries");
//!
//! ui::step_warn_hint(&ctx, "Nothing to remove", "Try --days 0");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::{Presentation, UiContext};
pub use output::{
    key_value, outro_success, remark, section, step_info, step_ok, step_ok_detail, step_warn,
    step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, KilnTheme};
