//! Embedded authoritative resolver for `<instance>.<suffix>` (`spec.md`
//! §4.6, §9 "Embedded internal DNS").
//!
//! Cleaner than pushing per-instance IPs into the proxy config on every
//! network change: the proxy dials `<instance>.<suffix>` and this resolver
//! answers from the instance manager's live IP at query time, with a 5s
//! TTL, so the proxy never caches a stale address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{LowerName, Name, RData, Record, RecordType};
use hickory_server::ServerFuture;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use super::{IngressError, IngressView};

const ANSWER_TTL: u32 = 5;

pub struct Handler {
    view: Arc<dyn IngressView>,
    suffix: Name,
}

impl Handler {
    fn new(view: Arc<dyn IngressView>, suffix: &str) -> Result<Self, IngressError> {
        let suffix = Name::from_ascii(suffix.trim_end_matches('.'))
            .map_err(|e| IngressError::InvalidConfig(format!("bad dns suffix {suffix:?}: {e}")))?;
        Ok(Self { view, suffix })
    }

    /// `<instance>` portion of `name`, if `name` is `<instance>.<suffix>`.
    fn instance_label(&self, name: &LowerName) -> Option<String> {
        let name: Name = name.into();
        if name.num_labels() != self.suffix.num_labels() + 1 {
            return None;
        }
        if !self.suffix.zone_of(&name) {
            return None;
        }
        name.iter().next().map(|l| String::from_utf8_lossy(l).into_owned())
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_message_type(MessageType::Response);

        if request.op_code() != OpCode::Query {
            header.set_response_code(ResponseCode::NotImp);
            let response = MessageResponseBuilder::from_message_request(request).build_no_records(header);
            return response_handle.send_response(response).await.unwrap_or_else(fail_response_info);
        }

        let query = request.query();
        let qtype = query.query_type();
        let builder = MessageResponseBuilder::from_message_request(request);

        let Some(label) = self.instance_label(query.name()) else {
            header.set_response_code(ResponseCode::NXDomain);
            let response = builder.build_no_records(header);
            return response_handle.send_response(response).await.unwrap_or_else(fail_response_info);
        };

        match qtype {
            RecordType::A => match self.view.resolve_ip(&label).await {
                Some(ip) => {
                    let record = Record::from_rdata(
                        query.name().clone().into(),
                        ANSWER_TTL,
                        RData::A(A(ip)),
                    );
                    header.set_response_code(ResponseCode::NoError);
                    let response = builder.build(header, [&record], [], [], []);
                    response_handle.send_response(response).await.unwrap_or_else(fail_response_info)
                }
                None => {
                    header.set_response_code(ResponseCode::NXDomain);
                    let response = builder.build_no_records(header);
                    response_handle.send_response(response).await.unwrap_or_else(fail_response_info)
                }
            },
            // Empty answer, not NXDOMAIN, to speed IPv4 fallback (spec.md §4.6).
            RecordType::AAAA => {
                header.set_response_code(ResponseCode::NoError);
                let response = builder.build_no_records(header);
                response_handle.send_response(response).await.unwrap_or_else(fail_response_info)
            }
            _ => {
                header.set_response_code(ResponseCode::NXDomain);
                let response = builder.build_no_records(header);
                response_handle.send_response(response).await.unwrap_or_else(fail_response_info)
            }
        }
    }
}

fn fail_response_info(_: std::io::Error) -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

/// Binds `listen_address` and serves queries until the process exits.
/// Intended to be driven from a dedicated `tokio::spawn`'d task.
pub async fn run(
    view: Arc<dyn IngressView>,
    listen_address: SocketAddr,
    suffix: &str,
) -> Result<(), IngressError> {
    let handler = Handler::new(view, suffix)?;
    let socket = UdpSocket::bind(listen_address)
        .await
        .map_err(IngressError::Io)?;
    let mut server = ServerFuture::new(handler);
    server.register_socket(socket);
    info!(address = %listen_address, suffix, "dns resolver listening");
    server
        .block_until_done()
        .await
        .map_err(|e| IngressError::Io(std::io::Error::other(e.to_string())))?;
    warn!("dns resolver exited");
    Ok(())
}

/// TTL used for every answer this resolver serves.
pub const fn answer_ttl() -> Duration {
    Duration::from_secs(ANSWER_TTL as u64)
}
