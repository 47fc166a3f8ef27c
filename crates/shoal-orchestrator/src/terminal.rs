//! Local terminal raw mode for joined sessions

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use shoal_core::{Result, ShoalError};

/// Put the controlling terminal in raw mode
pub fn enter_raw() -> Result<()> {
    enable_raw_mode().map_err(|e| ShoalError::Terminal(format!("Failed to enable raw mode: {}", e)))
}

/// Restore the settings saved by [`enter_raw`]
pub fn restore() -> Result<()> {
    disable_raw_mode()
        .map_err(|e| ShoalError::Terminal(format!("Failed to disable raw mode: {}", e)))
}

/// RAII guard for raw mode
///
/// Restores the terminal on drop, including when the join errors or panics.
pub struct TerminalGuard {
    was_raw: bool,
}

impl TerminalGuard {
    pub fn acquire() -> Result<Self> {
        let was_raw = is_raw_mode_enabled().unwrap_or(false);
        if !was_raw {
            enter_raw()?;
        }
        Ok(Self { was_raw })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.was_raw {
            // Best effort, nothing useful to do with an error here
            let _ = restore();
        }
    }
}
