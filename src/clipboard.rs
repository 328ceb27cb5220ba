//! System clipboard access for the console.

use anyhow::{bail, Context, Result};

/// Puts console text on the clipboard and returns how many lines were copied.
pub fn copy_console(text: &str) -> Result<usize> {
    if text.trim().is_empty() {
        bail!("console is empty");
    }
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(text.to_string())
        .context("failed to set clipboard text")?;
    Ok(text.lines().count())
}
