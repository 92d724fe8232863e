//! Reporting of status events on the terminal.

pub mod display_mode;
pub mod render;

pub use display_mode::DisplayMode;

use crate::messaging::Event;
use crossterm::cursor::MoveToColumn;
use crossterm::execute;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use log::debug;
use std::io::{self, Write};
use tokio::sync::mpsc::UnboundedReceiver;

/// Replace the current terminal line with `line`.
pub fn redraw_line<W: Write>(out: &mut W, line: &str) -> io::Result<()> {
    execute!(
        out,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(line)
    )
}

/// Draw progress events as they arrive, until the engine is dropped.
///
/// The line is redrawn in place on stderr so stdout only carries the final
/// report.
pub async fn follow_progress(
    mut events: UnboundedReceiver<Event>,
    mode: DisplayMode,
) {
    let mut stderr = io::stderr();
    let mut drawn = false;

    while let Some(event) = events.recv().await {
        if !mode.shows_progress() {
            continue;
        }
        if let Some(line) = render::progress_line(&event) {
            match redraw_line(&mut stderr, &line) {
                Ok(()) => drawn = true,
                Err(e) => debug!("Could not draw progress: {}", e),
            }
        }
    }

    if drawn {
        eprintln!();
    }
}

/// Print the final report of a run in the requested mode.
pub fn report(
    event: &Event,
    mode: DisplayMode,
) -> Result<(), serde_json::Error> {
    match mode {
        DisplayMode::Json => {
            println!("{}", serde_json::to_string_pretty(event)?)
        }
        DisplayMode::Live | DisplayMode::Silent => {
            for line in render::summary_lines(event) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}
