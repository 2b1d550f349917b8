use std::{
    ffi::CString,
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task,
};
use tracing::{debug, warn};

use crate::{error::Result, figurine::FIGURINE_COUNT};

/// Operator commands accepted on the control FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCommand {
    /// Log the current phase and pending-upload count.
    Status,
    /// Print a slip for a fixed figurine id without any tokens on the tray.
    Demo(u32),
    /// Retry pending record uploads now.
    Flush,
    /// Clean shutdown.
    Quit,
}

pub async fn serve_control_pipe(
    socket_path: PathBuf,
    sender: mpsc::Sender<OpCommand>,
) -> Result<()> {
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    task::spawn_blocking({
        let path = socket_path.clone();
        move || create_fifo(&path)
    })
    .await
    .map_err(|err| std::io::Error::other(err.to_string()))??;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&socket_path)
        .await?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            continue;
        }

        let Some(cmd) = parse_command(line.trim()) else {
            warn!("Ignoring unknown control command '{}'", line.trim());
            continue;
        };

        debug!("Control pipe command: {cmd:?}");
        let _ = sender.send(cmd).await;
    }
}

pub fn parse_command(input: &str) -> Option<OpCommand> {
    let mut parts = input.trim().splitn(2, char::is_whitespace);
    let command = parts.next()?.to_ascii_uppercase();
    let argument = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match (command.as_str(), argument) {
        ("STATUS", None) => Some(OpCommand::Status),
        ("FLUSH", None) => Some(OpCommand::Flush),
        ("QUIT", None) => Some(OpCommand::Quit),
        ("DEMO", Some(raw)) => {
            let id: u32 = raw.parse().ok()?;
            (1..=FIGURINE_COUNT).contains(&id).then_some(OpCommand::Demo(id))
        }
        _ => None,
    }
}

fn create_fifo(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let mode = 0o666;
    let res = unsafe { libc::mkfifo(c_path.as_ptr(), mode) };
    if res == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_command("STATUS"), Some(OpCommand::Status));
        assert_eq!(parse_command("flush"), Some(OpCommand::Flush));
        assert_eq!(parse_command(" Quit "), Some(OpCommand::Quit));
    }

    #[test]
    fn parses_demo_with_id_in_range() {
        assert_eq!(parse_command("DEMO 1"), Some(OpCommand::Demo(1)));
        assert_eq!(parse_command("demo 27000"), Some(OpCommand::Demo(27000)));
    }

    #[test]
    fn rejects_demo_out_of_range_or_garbled() {
        assert_eq!(parse_command("DEMO 0"), None);
        assert_eq!(parse_command("DEMO 27001"), None);
        assert_eq!(parse_command("DEMO xyz"), None);
        assert_eq!(parse_command("DEMO"), None);
    }

    #[test]
    fn rejects_unknown_commands() {
        assert_eq!(parse_command("DANCE"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("STATUS now"), None);
    }
}
