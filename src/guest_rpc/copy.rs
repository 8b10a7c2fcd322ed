//! Copy RPC: file/directory transfer to and from the guest over a pooled
//! channel (`spec.md` §4.4).
//!
//! To-guest: `CopyToGuestStart` (one per entry, depth-first) followed by
//! zero or more `CopyToGuestData` chunks and a `CopyToGuestEnd`, with a
//! single `CopyToGuestResponse` once the guest has drained the whole
//! transfer. From-guest: the guest is the one walking the tree, so the
//! client instead receives an ordered `Header`, `Data*`, `End` per entry,
//! with the `End.final_entry` flag marking the last one.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::GuestRpcError;
use super::pool::{Channel, Connection};
use super::protocol::{CHUNK_SIZE, GuestMessage};

fn unix_mtime(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Copies `local_path` (file or directory, recursively) to `remote_path`
/// in the guest. Returns the total bytes written as reported by the
/// guest's final response.
pub async fn copy_to_guest(
    conn: &Connection,
    local_path: &Path,
    remote_path: &str,
) -> Result<u64, GuestRpcError> {
    let mut channel = conn.open_channel().await;
    send_entry_recursive(&mut channel, local_path, remote_path).await?;
    channel.send(GuestMessage::CopyToGuestEnd)?;

    loop {
        match channel.recv().await {
            Some(GuestMessage::CopyToGuestResponse {
                success,
                bytes_written,
                error,
            }) => {
                if success {
                    return Ok(bytes_written);
                }
                return Err(GuestRpcError::CopyFailed(
                    error.unwrap_or_else(|| "guest reported copy failure".into()),
                ));
            }
            Some(_) => continue,
            None => return Err(GuestRpcError::ConnectionClosed),
        }
    }
}

async fn send_entry_recursive(
    channel: &mut Channel,
    local_path: &Path,
    remote_path: &str,
) -> Result<(), GuestRpcError> {
    let metadata = tokio::fs::metadata(local_path)
        .await
        .map_err(GuestRpcError::Io)?;

    channel.send(GuestMessage::CopyToGuestStart {
        path: remote_path.to_string(),
        mode: metadata.mode() & 0o7777,
        is_dir: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mtime: unix_mtime(metadata.modified().map_err(GuestRpcError::Io)?),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
    })?;

    if metadata.is_dir() {
        let mut entries = tokio::fs::read_dir(local_path).await.map_err(GuestRpcError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(GuestRpcError::Io)? {
            let child_remote = format!(
                "{}/{}",
                remote_path.trim_end_matches('/'),
                entry.file_name().to_string_lossy()
            );
            Box::pin(send_entry_recursive(channel, &entry.path(), &child_remote)).await?;
        }
        return Ok(());
    }

    let mut file = tokio::fs::File::open(local_path).await.map_err(GuestRpcError::Io)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(GuestRpcError::Io)?;
        if n == 0 {
            break;
        }
        channel.send(GuestMessage::CopyToGuestData {
            data: buf[..n].to_vec(),
        })?;
    }
    Ok(())
}

/// Copy-from-guest outcome for one transferred entry.
#[derive(Debug)]
pub struct CopiedEntry {
    pub path: String,
    pub is_dir: bool,
    pub bytes: u64,
}

/// Requests `remote_path` from the guest and writes everything received
/// under `local_root`, joining each entry's guest-relative path.
pub async fn copy_from_guest(
    conn: &Connection,
    remote_path: &str,
    local_root: &Path,
    follow_links: bool,
) -> Result<Vec<CopiedEntry>, GuestRpcError> {
    let mut channel = conn.open_channel().await;
    channel.send(GuestMessage::CopyFromGuestRequest {
        path: remote_path.to_string(),
        follow_links,
    })?;

    let mut entries = Vec::new();
    loop {
        match channel.recv().await {
            Some(GuestMessage::CopyFromGuestHeader {
                path,
                mode: _,
                is_dir,
                size: _,
                mtime: _,
            }) => {
                let dest = join_guest_relative(local_root, &path);
                let (bytes, final_entry) = receive_one_entry(&mut channel, &dest, is_dir).await?;
                entries.push(CopiedEntry {
                    path,
                    is_dir,
                    bytes,
                });
                if final_entry {
                    return Ok(entries);
                }
            }
            Some(GuestMessage::CopyFromGuestError { path, message }) => {
                return Err(GuestRpcError::CopyFailed(format!("{path}: {message}")));
            }
            Some(_) => continue,
            None => return Err(GuestRpcError::ConnectionClosed),
        }
    }
}

/// Returns the bytes written and whether the guest marked this its last
/// entry for the transfer.
async fn receive_one_entry(
    channel: &mut Channel,
    dest: &Path,
    is_dir: bool,
) -> Result<(u64, bool), GuestRpcError> {
    if is_dir {
        tokio::fs::create_dir_all(dest).await.map_err(GuestRpcError::Io)?;
    } else if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(GuestRpcError::Io)?;
    }

    let mut file = if is_dir {
        None
    } else {
        Some(tokio::fs::File::create(dest).await.map_err(GuestRpcError::Io)?)
    };
    let mut total = 0u64;

    loop {
        match channel.recv().await {
            Some(GuestMessage::CopyFromGuestData { data }) => {
                if let Some(f) = file.as_mut() {
                    f.write_all(&data).await.map_err(GuestRpcError::Io)?;
                }
                total += data.len() as u64;
            }
            Some(GuestMessage::CopyFromGuestEnd { final_entry }) => {
                return Ok((total, final_entry));
            }
            Some(_) => continue,
            None => return Err(GuestRpcError::ConnectionClosed),
        }
    }
}

fn join_guest_relative(root: &Path, guest_path: &str) -> PathBuf {
    let relative = guest_path.trim_start_matches('/');
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_rpc::protocol::Envelope;
    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    #[tokio::test]
    async fn copy_to_guest_streams_file_and_collects_response() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("hello.txt");
        tokio::fs::write(&src, b"hello world").await.unwrap();

        let (server, client) = duplex(8192);
        let conn = Connection::spawn(client);
        let mut server_framed = Framed::new(server, LengthDelimitedCodec::new());

        let responder = tokio::spawn(async move {
            let mut channel_id = None;
            let mut total = 0u64;
            loop {
                let frame = server_framed.next().await.unwrap().unwrap();
                let envelope: Envelope = serde_json::from_slice(&frame).unwrap();
                channel_id.get_or_insert(envelope.channel_id);
                match envelope.message {
                    GuestMessage::CopyToGuestData { data } => total += data.len() as u64,
                    GuestMessage::CopyToGuestEnd => break,
                    _ => {}
                }
            }
            let reply = Envelope {
                channel_id: channel_id.unwrap(),
                message: GuestMessage::CopyToGuestResponse {
                    success: true,
                    bytes_written: total,
                    error: None,
                },
            };
            server_framed
                .send(serde_json::to_vec(&reply).unwrap().into())
                .await
                .unwrap();
        });

        let written = copy_to_guest(&conn, &src, "/tmp/hello.txt").await.unwrap();
        responder.await.unwrap();
        assert_eq!(written, 11);
    }
}
