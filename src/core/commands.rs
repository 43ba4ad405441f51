// Operator commands read from a line-oriented input

use crate::core::events::EventSink;
use crate::types::Instrument;
use std::io::{self, BufRead};
use std::str::FromStr;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Close(Instrument),
    CloseAll,
    Panic,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("usage: close <INSTRUMENT>")]
    MissingInstrument,
}

impl FromStr for Command {
    type Err = CommandError;

    /// Case-insensitive; extra arguments are ignored
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        match verb.as_str() {
            "close" => words
                .next()
                .map(|symbol| Command::Close(Instrument::new(symbol)))
                .ok_or(CommandError::MissingInstrument),
            "closeall" => Ok(Command::CloseAll),
            "panic" => Ok(Command::Panic),
            "q" | "quit" | "exit" => Ok(Command::Quit),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}

/// Blank lines carry no command
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    line.parse().map(Some)
}

/// Read commands on a dedicated thread so a blocking read never stalls the
/// engine loop. The thread ends at end of input or once the receiver is gone.
pub fn spawn_command_reader<R>(
    reader: R,
    commands: UnboundedSender<Command>,
    events: EventSink,
) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("command-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        events.error(format!("command input failed: {}", e));
                        break;
                    }
                };
                match parse_line(&line) {
                    Ok(Some(command)) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => events.info(e.to_string()),
                }
            }
            debug!("⌨️  Command reader finished");
        })
}
