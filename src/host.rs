//! Line-delimited JSON host.
//!
//! Reads one command per line and writes one JSON document per line:
//! status events as the engine pushes them, the configuration for
//! `config` and `{"config": {...}}`, and `{"error": ...}` for commands
//! that could not be carried out. The running test is aborted when the
//! input ends.

use crate::engine::orchestrator::RunOutcome;
use crate::engine::SpeedTest;
use crate::messaging::{Command, Event};
use log::{debug, info};
use serde::Serialize;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[derive(Serialize)]
struct ErrorReply<'a> {
    error: &'a str,
}

async fn write_line<W, T>(output: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await
}

/// Serve commands from `input` until it ends.
pub async fn serve<R, W>(
    test: SpeedTest,
    mut events: UnboundedReceiver<Event>,
    input: R,
    mut output: W,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut running: Option<JoinHandle<RunOutcome>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                match Command::parse(&line) {
                    Ok(command) => {
                        handle(&test, command, &mut running, &mut output)
                            .await?
                    }
                    Err(e) => {
                        let reply = ErrorReply { error: &e.message };
                        write_line(&mut output, &reply).await?
                    }
                }
            }
            Some(event) = events.recv() => {
                write_line(&mut output, &event).await?
            }
        }
    }

    info!("Input closed, shutting down");
    test.abort();
    if let Some(run) = running.take() {
        if let Ok(Err(e)) = run.await {
            debug!("Run ended: {}", e);
        }
    }
    while let Ok(event) = events.try_recv() {
        write_line(&mut output, &event).await?;
    }

    Ok(())
}

async fn handle<W: AsyncWrite + Unpin>(
    test: &SpeedTest,
    command: Command,
    running: &mut Option<JoinHandle<RunOutcome>>,
    output: &mut W,
) -> io::Result<()> {
    debug!("Command: {:?}", command);

    match command {
        Command::Start => match test.spawn() {
            Ok(run) => {
                *running = Some(run);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                write_line(output, &ErrorReply { error: &message }).await
            }
        },
        Command::Abort => {
            test.abort();
            Ok(())
        }
        Command::Status => write_line(output, &test.status_event()).await,
        Command::Config => write_line(output, &*test.config()).await,
        Command::Overrides(overrides) => {
            match test.apply_overrides(&overrides) {
                Ok(config) => write_line(output, &*config).await,
                Err(e) => {
                    write_line(output, &ErrorReply { error: &e.message }).await
                }
            }
        }
    }
}
