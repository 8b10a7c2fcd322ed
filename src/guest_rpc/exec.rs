//! Exec RPC: bidirectional stdin/stdout/stderr streaming over a pooled
//! guest-agent channel (`spec.md` §4.4).
//!
//! The terminal event is always exactly one [`GuestMessage::ExitCode`];
//! everything before it is `Stdout`/`Stderr` (absent under TTY, which the
//! guest agent multiplexes through a single PTY — an in-guest concern
//! this crate does not implement, per `spec.md` §1's scope boundary).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use super::GuestRpcError;
use super::pool::{Channel, Connection};
use super::protocol::GuestMessage;

/// Exit code the spec reserves for client-observed timeout expiry
/// (`spec.md` §4.4, §8 scenario 4).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(i32),
}

pub struct ExecSession {
    channel: Channel,
}

impl ExecSession {
    pub async fn start(conn: &Connection, request: ExecRequest) -> Result<Self, GuestRpcError> {
        let channel = conn.open_channel().await;
        channel.send(GuestMessage::ExecStart {
            command: request.command,
            tty: request.tty,
            env: request.env,
            cwd: request.cwd,
            timeout_seconds: request.timeout_seconds,
        })?;
        Ok(Self { channel })
    }

    pub fn write_stdin(&self, data: Vec<u8>) -> Result<(), GuestRpcError> {
        self.channel.send(GuestMessage::Stdin { data })
    }

    /// Reads the next event. Returns `None` once the channel has been
    /// fully drained after `ExitCode` (the caller should stop polling).
    pub async fn next_event(&mut self) -> Option<ExecEvent> {
        match self.channel.recv().await? {
            GuestMessage::Stdout { data } => Some(ExecEvent::Stdout(data)),
            GuestMessage::Stderr { data } => Some(ExecEvent::Stderr(data)),
            GuestMessage::ExitCode { code } => Some(ExecEvent::Exit(code)),
            other => {
                warn!(?other, "unexpected message on exec channel, ignoring");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Runs a non-interactive command to completion, collecting all output.
/// `deadline` is the client-side backstop in case the guest itself hangs
/// past `request.timeout_seconds` (`spec.md` §5: "long-running boot and
/// VFIO-bind operations honor an upper time bound regardless of
/// cancellation"); on expiry the local result still reports
/// [`TIMEOUT_EXIT_CODE`] even though the guest-side stream is simply
/// abandoned rather than cleanly closed.
pub async fn run_to_completion(
    conn: &Connection,
    request: ExecRequest,
    deadline: Duration,
) -> Result<ExecOutcome, GuestRpcError> {
    let mut session = ExecSession::start(conn, request).await?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let result = timeout(deadline, async {
        loop {
            match session.next_event().await {
                Some(ExecEvent::Stdout(data)) => stdout.extend_from_slice(&data),
                Some(ExecEvent::Stderr(data)) => stderr.extend_from_slice(&data),
                Some(ExecEvent::Exit(code)) => return code,
                None => return TIMEOUT_EXIT_CODE,
            }
        }
    })
    .await;

    let exit_code = result.unwrap_or(TIMEOUT_EXIT_CODE);
    Ok(ExecOutcome {
        stdout,
        stderr,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_rpc::protocol::Envelope;
    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    #[tokio::test]
    async fn run_to_completion_collects_stdout_then_exit() {
        let (server, client) = duplex(4096);
        let conn = Connection::spawn(client);
        let mut server_framed = Framed::new(server, LengthDelimitedCodec::new());

        let responder = tokio::spawn(async move {
            let frame = server_framed.next().await.unwrap().unwrap();
            let envelope: Envelope = serde_json::from_slice(&frame).unwrap();
            let channel_id = envelope.channel_id;

            for msg in [
                GuestMessage::Stdout {
                    data: b"hi\n".to_vec(),
                },
                GuestMessage::ExitCode { code: 0 },
            ] {
                let reply = Envelope {
                    channel_id,
                    message: msg,
                };
                server_framed
                    .send(serde_json::to_vec(&reply).unwrap().into())
                    .await
                    .unwrap();
            }
        });

        let outcome = run_to_completion(
            &conn,
            ExecRequest {
                command: vec!["echo".into(), "hi".into()],
                tty: false,
                env: HashMap::new(),
                cwd: None,
                timeout_seconds: None,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        responder.await.unwrap();
        assert_eq!(outcome.stdout, b"hi\n");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn run_to_completion_times_out_to_124() {
        let (_server, client) = duplex(4096);
        let conn = Connection::spawn(client);

        let outcome = run_to_completion(
            &conn,
            ExecRequest {
                command: vec!["sleep".into(), "10".into()],
                tty: false,
                env: HashMap::new(),
                cwd: None,
                timeout_seconds: Some(1),
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
    }
}
