//! Worker side of session establishment
//!
//! The worker reads the coordinator's service list, answers with one offer
//! (or an undefined offer when nothing fits) and waits for the decision. The
//! whole exchange runs directly on the socket under the negotiation timeout;
//! the connection tasks only take over once a session is established.

use super::config::ProviderService;
use bks_core::error::{BksError, Result};
use bks_core::options::EndpointOptions;
use bks_wire::codec::{Frame, FrameType, HEADER_LEN};
use bks_wire::connection::FrameConnection;
use bks_wire::limits::{clamp_keepalive, MAX_SERVICE_TYPES, PROVIDER_VERSION};
use bks_wire::messages::{
    to_bytes, OfferedService, RequestServices, ServiceDecision, ServiceDetail, ServiceType,
};
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// The offer picked from a service list
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChosenOffer {
    /// Index into the worker's provider services
    pub service_index: usize,
    pub detail: ServiceDetail,
    pub offer: OfferedService,
    pub keepalive_secs: u32,
}

/// Pick the highest-priority requested type this worker can supply.
///
/// Ties keep the earlier entry of the request.
pub(crate) fn choose_offer(
    services: &[ProviderService],
    request: &RequestServices,
) -> Option<ChosenOffer> {
    let mut best: Option<ChosenOffer> = None;
    for detail in &request.services {
        if best
            .as_ref()
            .is_some_and(|b| detail.priority <= b.detail.priority)
        {
            continue;
        }
        let Some((service_index, service)) = services
            .iter()
            .enumerate()
            .find(|(_, s)| s.supports(detail))
        else {
            continue;
        };
        let instances = service.capacity(detail);
        if instances == 0 {
            trace!("[NEGOTIATE] No capacity for type {}", detail.service_type);
            continue;
        }
        best = Some(ChosenOffer {
            service_index,
            detail: *detail,
            offer: OfferedService {
                service_type: detail.service_type,
                service_instances: instances,
                class_instances: instances.min(service.max_class_instances),
                costing: service.estimate(detail),
                provider_version: PROVIDER_VERSION,
            },
            keepalive_secs: clamp_keepalive(detail.keepalive_secs),
        });
    }
    best
}

/// An established session, ready to be served
#[derive(Debug)]
pub(crate) struct NegotiatedSession {
    pub session_id: u32,
    pub service_index: usize,
    pub service_type: ServiceType,
    pub max_instances: u32,
    pub max_class_instances: u32,
    pub keepalive: Duration,
    pub max_resp_payload: u32,
    /// Framing state, carrying any bytes read past the accept frame
    pub conn: FrameConnection,
}

fn protocol(e: impl std::fmt::Display) -> BksError {
    BksError::protocol(e.to_string())
}

/// Run the worker side of negotiation on a freshly connected stream.
///
/// # Errors
///
/// `NegotiationTimeout`, `NoServiceOffered` (an undefined offer was sent),
/// `NegotiationRejected`, `ConnectionClosed`, or a protocol/IO error.
pub(crate) async fn negotiate(
    stream: &mut TcpStream,
    services: &[ProviderService],
    options: &EndpointOptions,
) -> Result<NegotiatedSession> {
    let timeout = options.negotiation_timeout;
    compio::time::timeout(timeout, exchange(stream, services, options.read_buffer_size))
        .await
        .map_err(|_elapsed| BksError::NegotiationTimeout(timeout))?
}

async fn exchange(
    stream: &mut TcpStream,
    services: &[ProviderService],
    read_buffer_size: usize,
) -> Result<NegotiatedSession> {
    let mut conn = FrameConnection::new(
        0,
        HEADER_LEN + 4 + MAX_SERVICE_TYPES * ServiceDetail::ENCODED_LEN,
        Instant::now(),
    );

    let frame = read_frame(stream, &mut conn, read_buffer_size).await?;
    if frame.frame_type() != FrameType::RequestServices {
        return Err(BksError::protocol(format!(
            "expected request-services, got {:?}",
            frame.frame_type()
        )));
    }
    let session_id = frame.header.session_id;
    conn.set_session_id(session_id);
    let request = RequestServices::decode(frame.payload).map_err(protocol)?;
    debug!(
        "[NEGOTIATE] Session {} offered {} service type(s)",
        session_id,
        request.services.len()
    );

    let Some(chosen) = choose_offer(services, &request) else {
        let none = OfferedService::none();
        conn.queue_frame(FrameType::OfferedService, &to_bytes(|b| none.encode(b)))
            .map_err(protocol)?;
        flush(stream, &mut conn).await?;
        debug!("[NEGOTIATE] Session {}: nothing to offer", session_id);
        return Err(BksError::NoServiceOffered);
    };

    conn.queue_frame(
        FrameType::OfferedService,
        &to_bytes(|b| chosen.offer.encode(b)),
    )
    .map_err(protocol)?;
    flush(stream, &mut conn).await?;
    debug!(
        "[NEGOTIATE] Session {} offering type {} with {} instances",
        session_id, chosen.offer.service_type, chosen.offer.service_instances
    );

    let reply = read_frame(stream, &mut conn, read_buffer_size).await?;
    if reply.header.session_id != session_id {
        return Err(BksError::protocol("decision carries the wrong session id"));
    }
    match reply.frame_type() {
        FrameType::AcceptService => {
            let decision = ServiceDecision::decode(reply.payload).map_err(protocol)?;
            if decision.service_type != chosen.offer.service_type {
                return Err(BksError::protocol(format!(
                    "accepted type {} was not offered",
                    decision.service_type
                )));
            }
        }
        FrameType::RejectService => return Err(BksError::NegotiationRejected),
        other => {
            return Err(BksError::protocol(format!(
                "expected a service decision, got {other:?}"
            )))
        }
    }

    conn.set_max_frame_len(HEADER_LEN + chosen.detail.max_req_payload as usize);
    Ok(NegotiatedSession {
        session_id,
        service_index: chosen.service_index,
        service_type: chosen.offer.service_type,
        max_instances: chosen.offer.service_instances,
        max_class_instances: chosen.offer.class_instances,
        keepalive: Duration::from_secs(u64::from(chosen.keepalive_secs)),
        max_resp_payload: chosen.detail.max_resp_payload,
        conn,
    })
}

/// Read until `conn` yields a frame.
async fn read_frame<S: AsyncRead>(
    stream: &mut S,
    conn: &mut FrameConnection,
    read_buffer_size: usize,
) -> Result<Frame> {
    loop {
        if let Some(frame) = conn.poll_frame(Instant::now()).map_err(protocol)? {
            return Ok(frame);
        }
        let BufResult(res, buf) = stream.read(Vec::with_capacity(read_buffer_size)).await;
        match res? {
            0 => return Err(BksError::ConnectionClosed),
            n => {
                trace!("[NEGOTIATE] Read {} bytes", n);
                conn.on_bytes(Bytes::from(buf));
            }
        }
    }
}

async fn flush(stream: &mut TcpStream, conn: &mut FrameConnection) -> Result<()> {
    if let Some(bytes) = conn.take_outbound(Instant::now()) {
        let BufResult(res, _) = stream.write_all(bytes.to_vec()).await;
        res?;
        conn.on_write_complete();
    }
    Ok(())
}
