//! Confirmation prompts

use super::context::UiContext;
use crate::error::{KilnError, KilnResult};

/// Ask for confirmation. `--yes` approves; a context that cannot prompt
/// takes `default`.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> KilnResult<bool> {
    if ctx.auto_yes() {
        super::remark(ctx, &format!("{} yes (--yes)", message));
        return Ok(true);
    }
    if !ctx.can_prompt() {
        return Ok(default);
    }

    // cliclack blocks on stdin
    let message = message.to_string();
    let result = tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| KilnError::Internal(format!("prompt task failed: {}", e)))?;

    result.map_err(|e| KilnError::User(format!("Prompt failed: {}", e)))
}
