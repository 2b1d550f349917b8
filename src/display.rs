use std::{
    io::Read,
    time::{Duration, Instant},
};

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const BAUD: u32 = 115_200;
const ACK_TIMEOUT: Duration = Duration::from_millis(250);
const READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(20);

pub const MAX_BRIGHTNESS: u8 = 15;
pub const MAX_SPEED: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Bored,
    Thinking,
    Finish,
    RemoveFigure,
    Error,
}

impl Pattern {
    fn keyword(self) -> &'static str {
        match self {
            Pattern::Bored => "BORED",
            Pattern::Thinking => "THINKING",
            Pattern::Finish => "FINISH",
            Pattern::RemoveFigure => "REMOVE_FIGURE",
            Pattern::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// LED matrix client. The display is advisory: callers log failures and move
/// on, a dead matrix never takes the installation down.
pub struct Matrix {
    port: Box<dyn SerialPort>,
    path: String,
    current: Option<Pattern>,
}

impl Matrix {
    pub fn open(path: &str) -> Result<Self> {
        let port = open_port(path)?;
        info!("LED matrix on {path}");
        Ok(Self {
            port,
            path: path.to_string(),
            current: None,
        })
    }

    /// Idempotent: re-sending the pattern currently showing is a no-op.
    pub fn set_pattern(&mut self, pattern: Pattern) -> Result<()> {
        if self.current == Some(pattern) {
            return Ok(());
        }

        self.command_with_reopen(&format!("PATTERN {pattern}"))?;
        self.current = Some(pattern);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.command_with_reopen("STOP")?;
        self.current = None;
        Ok(())
    }

    pub fn set_brightness(&mut self, level: u8) -> Result<()> {
        self.command_with_reopen(&format!("BRIGHT {}", level.min(MAX_BRIGHTNESS)))
    }

    pub fn set_speed(&mut self, level: u8) -> Result<()> {
        self.command_with_reopen(&format!("SPEED {}", level.min(MAX_SPEED)))
    }

    fn command_with_reopen(&mut self, command: &str) -> Result<()> {
        match self.command(command) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("LED matrix not answering, reopening {}: {first}", self.path);
                self.port = open_port(&self.path)?;
                self.command(command).map_err(|err| Error::DeviceUnavailable {
                    device: "led matrix",
                    reason: err.to_string(),
                })
            }
        }
    }

    fn command(&mut self, command: &str) -> Result<()> {
        debug!("Matrix command: {command}");
        std::io::Write::write_all(&mut self.port, command.as_bytes())?;
        std::io::Write::write_all(&mut self.port, b"\n")?;

        let line = self.read_ack_line()?;
        parse_ack(&line).map_err(|msg| Error::DeviceUnavailable {
            device: "led matrix",
            reason: msg,
        })
    }

    fn read_ack_line(&mut self) -> Result<String> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' {
                        return Ok(String::from_utf8_lossy(&line).into_owned());
                    }
                    line.push(byte[0]);
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::DeviceUnavailable {
            device: "led matrix",
            reason: "no ACK within 250 ms".to_string(),
        })
    }
}

fn open_port(path: &str) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, BAUD)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(READ_CHUNK_TIMEOUT)
        .open()?;
    Ok(port)
}

fn parse_ack(line: &str) -> std::result::Result<(), String> {
    let trimmed = line.trim();
    if trimmed == "OK" {
        return Ok(());
    }
    match trimmed.strip_prefix("ERR") {
        Some(msg) => Err(format!("matrix error:{msg}")),
        None => Err(format!("unexpected matrix answer '{trimmed}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_keywords_match_firmware() {
        assert_eq!(Pattern::Bored.to_string(), "BORED");
        assert_eq!(Pattern::Thinking.to_string(), "THINKING");
        assert_eq!(Pattern::Finish.to_string(), "FINISH");
        assert_eq!(Pattern::RemoveFigure.to_string(), "REMOVE_FIGURE");
        assert_eq!(Pattern::Error.to_string(), "ERROR");
    }

    #[test]
    fn ack_ok_parses() {
        assert!(parse_ack("OK").is_ok());
        assert!(parse_ack("OK\r").is_ok());
    }

    #[test]
    fn ack_err_carries_message() {
        let err = parse_ack("ERR unknown pattern").unwrap_err();
        assert!(err.contains("unknown pattern"));
    }

    #[test]
    fn ack_garbage_is_rejected() {
        assert!(parse_ack("HELLO").is_err());
        assert!(parse_ack("").is_err());
    }
}
