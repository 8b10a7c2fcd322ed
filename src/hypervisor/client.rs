//! Raw HTTP-over-Unix-socket transport for the Cloud Hypervisor API.
//!
//! Mirrors the teacher's `VmManager::send_api_request` almost verbatim: a
//! fresh `hyper::client::conn::http1` handshake per request over a
//! `tokio::net::UnixStream`. Cloud Hypervisor's API socket accepts one
//! request per connection just fine, and a fresh connection sidesteps any
//! keep-alive bookkeeping for what is a low-frequency control plane.

use std::path::Path;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use super::HypervisorError;

pub async fn request(
    socket_path: &Path,
    method: &str,
    uri_path: &str,
    body: Option<String>,
) -> Result<(StatusCode, String), HypervisorError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| HypervisorError::Connect {
            path: socket_path.to_path_buf(),
            source: e,
        })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HypervisorError::Protocol(e.to_string()))?;
    tokio::spawn(conn);

    let request = if let Some(body) = body {
        Request::builder()
            .method(method)
            .uri(format!("http://localhost{uri_path}"))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(BoxBody::new(Full::new(Bytes::from(body))))
            .map_err(|e| HypervisorError::Protocol(e.to_string()))?
    } else {
        Request::builder()
            .method(method)
            .uri(format!("http://localhost{uri_path}"))
            .header("Accept", "application/json")
            .body(BoxBody::new(Empty::new()))
            .map_err(|e| HypervisorError::Protocol(e.to_string()))?
    };

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| HypervisorError::Protocol(e.to_string()))?;
    let status = response.status();

    let body_bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| HypervisorError::Protocol(e.to_string()))?
        .to_bytes();
    let body_str = String::from_utf8_lossy(&body_bytes).into_owned();

    Ok((status, body_str))
}
