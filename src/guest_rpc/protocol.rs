//! Guest RPC message schema (`spec.md` §4.4, §6).
//!
//! Every message on the wire is a `channel_id`-tagged [`Envelope`] so one
//! post-handshake connection can multiplex several concurrent exec/copy
//! streams (`spec.md` §4.4: "Connections are pooled per Unix-socket
//! path... Sharing one transport across streams lets multiple concurrent
//! exec sessions exist cheaply").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 32 KiB chunk size for stdin and file-transfer data, both directions
/// (`spec.md` §4.4).
pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel_id: u32,
    pub message: GuestMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GuestMessage {
    ExecStart {
        command: Vec<String>,
        tty: bool,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout_seconds: Option<u64>,
    },
    Stdin {
        data: Vec<u8>,
    },
    Stdout {
        data: Vec<u8>,
    },
    Stderr {
        data: Vec<u8>,
    },
    ExitCode {
        code: i32,
    },
    CopyToGuestStart {
        path: String,
        mode: u32,
        is_dir: bool,
        size: u64,
        mtime: i64,
        uid: Option<u32>,
        gid: Option<u32>,
    },
    CopyToGuestData {
        data: Vec<u8>,
    },
    CopyToGuestEnd,
    CopyToGuestResponse {
        success: bool,
        bytes_written: u64,
        error: Option<String>,
    },
    CopyFromGuestRequest {
        path: String,
        follow_links: bool,
    },
    CopyFromGuestHeader {
        path: String,
        mode: u32,
        is_dir: bool,
        size: u64,
        mtime: i64,
    },
    CopyFromGuestData {
        data: Vec<u8>,
    },
    CopyFromGuestEnd {
        final_entry: bool,
    },
    CopyFromGuestError {
        path: String,
        message: String,
    },
    StatPathRequest {
        path: String,
    },
    StatPathResponse {
        exists: bool,
        is_dir: bool,
        size: u64,
        mode: u32,
        mtime: i64,
    },
    /// Sent by the pool to ask the guest to open a new logical stream on
    /// this channel id before the first real message.
    StreamOpen,
    /// Closes a channel without closing the underlying connection.
    StreamClose,
}
