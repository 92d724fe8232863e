//! Display mode detection.
//!
//! Determines whether to draw live progress, stay silent, or print JSON
//! based on CLI flags and terminal capabilities.

/// How a single run is reported on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Live progress line, then a colored summary
    Live,
    /// Summary only
    Silent,
    /// Final status event as JSON
    Json,
}

impl DisplayMode {
    /// Determine display mode from CLI flags and environment.
    ///
    /// * `Json` when `json_flag` is set, regardless of `is_tty`
    /// * `Live` on a terminal
    /// * `Silent` otherwise
    pub fn detect(json_flag: bool, is_tty: bool) -> Self {
        if json_flag {
            DisplayMode::Json
        } else if is_tty {
            DisplayMode::Live
        } else {
            DisplayMode::Silent
        }
    }

    /// Whether progress events should be drawn as they arrive.
    pub fn shows_progress(&self) -> bool {
        matches!(self, DisplayMode::Live)
    }
}
