//! Operator console.
//!
//! Reads one command per line and answers with one line:
//!
//! ```text
//! start          arm the camera node
//! stop           disarm the camera node
//! status         link phase, streaming state and counters
//! snap <path>    write the latest frame to <path>
//! quit           stop the hub
//! ```

use std::io::BufRead;
use std::path::PathBuf;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use camlink_core::{CommandVerb, HubHandle};

use crate::snapshot;

const HELP: &str = "commands: start | stop | status | snap <path> | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(CommandVerb),
    Status,
    Snap(PathBuf),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();
        let cmd = match (word.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("start", []) => Self::Send(CommandVerb::Start),
            ("stop", []) => Self::Send(CommandVerb::Stop),
            ("status", []) => Self::Status,
            ("snap", [path]) => Self::Snap(PathBuf::from(*path)),
            ("snap", _) => return Err("usage: snap <path>".into()),
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            _ => return Err(format!("unknown command {:?}; {HELP}", line.trim())),
        };
        Ok(Some(cmd))
    }
}

/// Carry out `cmd` against the hub and describe the outcome.
pub async fn execute(handle: &HubHandle, cmd: &ConsoleCommand) -> String {
    match cmd {
        ConsoleCommand::Send(verb) => {
            if handle.send_command(*verb).await {
                format!("{verb} sent")
            } else {
                format!("{verb} not sent: no camera node connected")
            }
        }
        ConsoleCommand::Status => handle.status().to_string(),
        ConsoleCommand::Snap(path) => match handle.latest_frame() {
            None => "no frame received yet".into(),
            Some(frame) => match snapshot::save_frame(path, &frame).await {
                Ok(()) => format!("wrote {} bytes to {}", frame.len(), path.display()),
                Err(e) => format!("snap failed: {e}"),
            },
        },
        ConsoleCommand::Help => HELP.into(),
        ConsoleCommand::Quit => {
            handle.stop();
            "stopping".into()
        }
    }
}

/// Lines typed on stdin.
///
/// A blocking read on stdin cannot be cancelled, so it runs on its own
/// thread instead of the runtime's blocking pool, which would otherwise hold
/// up shutdown until the next newline.
pub fn stdin_lines() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            debug!("stdin closed");
        })?;
    Ok(rx)
}

/// Serve commands from `lines` until `quit` or end of input.
///
/// End of input leaves the hub running, so a detached process keeps going.
pub async fn run<W>(handle: HubHandle, mut lines: mpsc::Receiver<String>, mut output: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let (reply, quit) = match ConsoleCommand::parse(&line) {
            Ok(None) => continue,
            Ok(Some(cmd)) => (execute(&handle, &cmd).await, cmd == ConsoleCommand::Quit),
            Err(e) => (e, false),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        if quit {
            info!("quit requested from console");
            break;
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use camlink_core::{HubConfig, ServerSession, SupervisorConfig, TcpAcceptor};

    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            ConsoleCommand::parse("START").unwrap(),
            Some(ConsoleCommand::Send(CommandVerb::Start))
        );
        assert_eq!(
            ConsoleCommand::parse("  stop \n").unwrap(),
            Some(ConsoleCommand::Send(CommandVerb::Stop))
        );
        assert_eq!(
            ConsoleCommand::parse("snap /tmp/a.jpg").unwrap(),
            Some(ConsoleCommand::Snap(PathBuf::from("/tmp/a.jpg")))
        );
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ConsoleCommand::parse("snap").is_err());
        assert!(ConsoleCommand::parse("start now").is_err());
        assert!(ConsoleCommand::parse("reboot").unwrap_err().contains("reboot"));
    }

    async fn feed(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        rx
    }

    async fn idle_hub() -> HubHandle {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", Default::default()).await.unwrap();
        let (hub, handle) = ServerSession::new(acceptor, SupervisorConfig::default(), HubConfig::default());
        tokio::spawn(hub.run());
        handle
    }

    #[tokio::test]
    async fn console_session_without_node() {
        let handle = idle_hub().await;
        let input = feed(&["start", "snap /tmp/never.jpg", "bogus", "", "status", "quit", "status"]).await;
        let mut output = Vec::new();
        run(handle.clone(), input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let replies: Vec<&str> = text.lines().collect();
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0], "START not sent: no camera node connected");
        assert_eq!(replies[1], "no frame received yet");
        assert!(replies[2].starts_with("unknown command"));
        assert!(replies[3].contains("0 frames"));
        assert_eq!(replies[4], "stopping");
        assert!(!handle.stop_handle().load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn end_of_input_leaves_hub_running() {
        let handle = idle_hub().await;
        let input = feed(&["help"]).await;
        let mut output = Vec::new();
        run(handle.clone(), input, &mut output).await.unwrap();
        assert_eq!(String::from_utf8(output).unwrap().trim(), HELP);
        assert!(handle.stop_handle().load(std::sync::atomic::Ordering::SeqCst));
        handle.stop();
    }
}
