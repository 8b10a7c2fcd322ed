//! Cloud Hypervisor hybrid vsock handshake (`spec.md` §4.4, §6).
//!
//! A client opens the hypervisor's vsock Unix socket and writes
//! `CONNECT <port>\n`. The server replies with a line starting `OK ` on
//! success, anything else on failure. A single `read()` call can return
//! bytes belonging to the application protocol past the reply's newline;
//! [`Handshaken`] replays those before touching the underlying stream
//! again, per `spec.md` §6's "client must preserve any bytes read after
//! the newline."

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::GuestRpcError;

const HANDSHAKE_READ_CHUNK: usize = 512;

/// Wraps a handshaken stream, replaying any bytes already read past the
/// `OK ...\n` reply before reading fresh ones from the inner stream.
pub struct Handshaken<S> {
    inner: S,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Handshaken<S> {
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Handshaken<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.leftover_pos < self.leftover.len() {
            let remaining = &self.leftover[self.leftover_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.leftover_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Handshaken<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Performs the `CONNECT <port>\n` / `OK ...` handshake over `stream`,
/// returning a [`Handshaken`] wrapper that replays any over-read bytes.
pub async fn handshake<S>(mut stream: S, port: u32) -> Result<Handshaken<S>, GuestRpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {port}\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(GuestRpcError::Io)?;
    stream.flush().await.map_err(GuestRpcError::Io)?;

    let mut buf = vec![0u8; HANDSHAKE_READ_CHUNK];
    let mut accumulated = Vec::new();
    let newline_pos = loop {
        use tokio::io::AsyncReadExt;
        let n = stream.read(&mut buf).await.map_err(GuestRpcError::Io)?;
        if n == 0 {
            return Err(GuestRpcError::HandshakeFailed(
                "connection closed before handshake reply".into(),
            ));
        }
        accumulated.extend_from_slice(&buf[..n]);
        if let Some(pos) = accumulated.iter().position(|&b| b == b'\n') {
            break pos;
        }
    };

    let reply = String::from_utf8_lossy(&accumulated[..newline_pos]).into_owned();
    let leftover = accumulated[newline_pos + 1..].to_vec();

    if !reply.starts_with("OK ") {
        return Err(GuestRpcError::HandshakeFailed(reply));
    }

    Ok(Handshaken {
        inner: stream,
        leftover,
        leftover_pos: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn handshake_succeeds_and_preserves_trailing_bytes() {
        let (mut server, client) = duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"CONNECT 1234\n");
            server.write_all(b"OK 1234\nhello").await.unwrap();
            server.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        });

        let mut stream = handshake(client, 1234).await.unwrap();
        let mut rest = [0u8; 5];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");
    }

    #[tokio::test]
    async fn handshake_rejects_non_ok_reply() {
        let (mut server, client) = duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"ERR no such port\n").await.unwrap();
        });

        let err = handshake(client, 1234).await.unwrap_err();
        assert!(matches!(err, GuestRpcError::HandshakeFailed(_)));
    }
}
