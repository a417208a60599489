//! Coordinator I/O loop
//!
//! A single task on the coordinator thread owns every connection. It waits
//! on accepted sockets, connection events, the wake channel and a periodic
//! tick, and after each wake-up runs housekeeping over all links:
//! negotiation timeouts, keepalive expiry, framing queued requests within
//! each session's send window, keepalives, and the sweep of terminated
//! sessions.

use super::negotiation::{AcceptedTerms, Negotiation, Outcome, Step};
use super::registry::Registry;
use bks_core::actor::{spawn_connection, ConnEvent, ConnHandle, ConnId};
use bks_core::options::EndpointOptions;
use bks_core::tcp::enable_tcp_nodelay;
use bks_wire::codec::{Frame, FrameType, HEADER_LEN};
use bks_wire::connection::FrameConnection;
use bks_wire::messages::{to_bytes, JobResponse, OfferedService};
use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long shutdown waits for connections to flush and close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

enum Role {
    Negotiating(Negotiation),
    Established(AcceptedTerms),
}

struct Link {
    handle: ConnHandle,
    conn: FrameConnection,
    session_id: u32,
    role: Role,
}

enum LoopEvent {
    Accepted(TcpStream),
    Conn(ConnEvent),
    Wake,
    Tick,
    Stopped,
}

pub(crate) struct CoordinatorLoop {
    registry: Arc<Registry>,
    options: EndpointOptions,
    links: HashMap<ConnId, Link>,
    next_conn: ConnId,
    event_tx: Sender<ConnEvent>,
    event_rx: Receiver<ConnEvent>,
    accept_rx: Receiver<TcpStream>,
    wake_rx: Receiver<()>,
}

async fn accept_loop(listener: TcpListener, accept_tx: Sender<TcpStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("[COORD] Accepted connection from {}", peer);
                if accept_tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("[COORD] Accept failed: {}", e);
                compio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

impl CoordinatorLoop {
    /// Must be called on the runtime that will run the loop.
    pub(crate) fn new(
        registry: Arc<Registry>,
        options: EndpointOptions,
        listener: TcpListener,
        wake_rx: Receiver<()>,
    ) -> Self {
        let (accept_tx, accept_rx) = flume::unbounded();
        compio::runtime::spawn(accept_loop(listener, accept_tx)).detach();
        let (event_tx, event_rx) = flume::unbounded();
        Self {
            registry,
            options,
            links: HashMap::new(),
            next_conn: 1,
            event_tx,
            event_rx,
            accept_rx,
            wake_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("[COORD] I/O loop started");
        loop {
            let event = select! {
                s = self.accept_rx.recv_async().fuse() => s.map_or(LoopEvent::Stopped, LoopEvent::Accepted),
                e = self.event_rx.recv_async().fuse() => e.map_or(LoopEvent::Stopped, LoopEvent::Conn),
                w = self.wake_rx.recv_async().fuse() => w.map_or(LoopEvent::Stopped, |()| LoopEvent::Wake),
                () = compio::time::sleep(self.options.poll_interval).fuse() => LoopEvent::Tick,
            };

            let now = Instant::now();
            match event {
                LoopEvent::Accepted(stream) => self.on_accept(stream, now),
                LoopEvent::Conn(event) => self.on_conn_event(event, now),
                LoopEvent::Wake | LoopEvent::Tick => {}
                LoopEvent::Stopped => self.registry.close(),
            }
            if self.registry.is_closed() {
                break;
            }
            self.housekeeping(now);
        }
        self.shutdown().await;
        info!("[COORD] I/O loop stopped");
    }

    fn on_accept(&mut self, stream: TcpStream, now: Instant) {
        if self.options.tcp_nodelay {
            if let Err(e) = enable_tcp_nodelay(&stream) {
                debug!("[COORD] Failed to set TCP_NODELAY: {}", e);
            }
        }

        let Some(session_id) = self.registry.alloc_session_id() else {
            warn!("[COORD] No free session id, closing connection");
            return;
        };
        // An empty list still goes out; an offer for a full type is then
        // answered with reject-service.
        let services = self.registry.offerable_services();
        if services.services.is_empty() {
            debug!("[NEGOTIATE] Session {} offered an empty service list", session_id);
        }
        self.evict_oldest_negotiation();

        let conn_id = self.next_conn;
        self.next_conn += 1;
        let handle = spawn_connection(
            stream,
            conn_id,
            self.options.read_buffer_size,
            self.event_tx.clone(),
        );
        let mut conn = FrameConnection::new(
            session_id,
            HEADER_LEN + OfferedService::ENCODED_LEN,
            now,
        );
        if let Err(e) = conn.queue_frame(FrameType::RequestServices, &to_bytes(|b| services.encode(b))) {
            warn!("[NEGOTIATE] Failed to frame service list: {}", e);
            self.registry.release_session_id(session_id);
            handle.close();
            return;
        }

        debug!(
            "[NEGOTIATE] Session {} requesting {} service type(s)",
            session_id,
            services.services.len()
        );
        self.links.insert(
            conn_id,
            Link {
                handle,
                conn,
                session_id,
                role: Role::Negotiating(Negotiation::new(session_id, now)),
            },
        );
    }

    fn evict_oldest_negotiation(&mut self) {
        let negotiating = self
            .links
            .iter()
            .filter_map(|(&id, link)| match &link.role {
                Role::Negotiating(n) => Some((id, n.started())),
                Role::Established(_) => None,
            });
        let mut count = 0;
        let mut oldest: Option<(ConnId, Instant)> = None;
        for (id, started) in negotiating {
            count += 1;
            if oldest.map_or(true, |(_, t)| started < t) {
                oldest = Some((id, started));
            }
        }
        if count >= self.options.max_negotiations {
            if let Some((id, _)) = oldest {
                self.teardown(id, "evicted by a newer negotiation");
            }
        }
    }

    fn on_conn_event(&mut self, event: ConnEvent, now: Instant) {
        match event {
            ConnEvent::Received { conn, bytes } => {
                let Some(link) = self.links.get_mut(&conn) else {
                    return;
                };
                trace!("[COORD] Session {} received {} bytes", link.session_id, bytes.len());
                link.conn.on_bytes(bytes);
                self.process_frames(conn, now);
            }
            ConnEvent::Written { conn } => {
                let Some(link) = self.links.get_mut(&conn) else {
                    return;
                };
                link.conn.on_write_complete();
                self.after_write(conn);
            }
            ConnEvent::Closed { conn } => self.teardown(conn, "connection closed"),
        }
    }

    fn process_frames(&mut self, conn_id: ConnId, now: Instant) {
        loop {
            let result = {
                let Some(link) = self.links.get_mut(&conn_id) else {
                    return;
                };
                match link.conn.poll_frame(now) {
                    Ok(Some(frame)) => handle_frame(link, &self.registry, frame),
                    Ok(None) => return,
                    Err(e) => Err(e.to_string()),
                }
            };
            if let Err(reason) = result {
                self.teardown(conn_id, &reason);
                return;
            }
        }
    }

    fn after_write(&mut self, conn_id: ConnId) {
        let outcome = match self.links.get(&conn_id) {
            Some(Link {
                role: Role::Negotiating(negotiation),
                conn,
                ..
            }) if conn.is_tx_idle() => negotiation.on_write_complete(),
            _ => None,
        };
        match outcome {
            Some(Outcome::Established(terms)) => self.establish(conn_id, terms),
            Some(Outcome::Rejected) => self.teardown(conn_id, "offer rejected"),
            None => {}
        }
    }

    fn establish(&mut self, conn_id: ConnId, terms: AcceptedTerms) {
        let Some(link) = self.links.get_mut(&conn_id) else {
            return;
        };
        match self.registry.establish_session(link.session_id, &terms) {
            Ok(()) => {
                info!(
                    "[COORD] Session {} established: type {} instances {} keepalive {}s",
                    link.session_id, terms.service_type, terms.max_instances, terms.keepalive_secs
                );
                link.conn
                    .set_max_frame_len(HEADER_LEN + terms.max_resp_payload as usize);
                link.role = Role::Established(terms);
                // Start the worker's keepalive clock right away.
                link.conn.request_ack();
            }
            Err(e) => {
                warn!("[COORD] Session {} could not be established: {}", link.session_id, e);
                // The reservation was consumed; only the id is left to release.
                if let Some(link) = self.links.remove(&conn_id) {
                    self.registry.release_session_id(link.session_id);
                    link.handle.close();
                }
            }
        }
    }

    /// Close a link and retire its session.
    fn teardown(&mut self, conn_id: ConnId, reason: &str) {
        let Some(link) = self.links.remove(&conn_id) else {
            return;
        };
        match &link.role {
            Role::Negotiating(negotiation) => {
                debug!("[NEGOTIATE] Session {} aborted: {}", link.session_id, reason);
                negotiation.abandon(&self.registry);
                self.registry.release_session_id(link.session_id);
            }
            Role::Established(_) => {
                info!("[COORD] Session {} terminated: {}", link.session_id, reason);
                self.registry.mark_terminating(link.session_id);
            }
        }
        link.handle.close();
    }

    fn housekeeping(&mut self, now: Instant) {
        let expired: Vec<(ConnId, &'static str)> = self
            .links
            .iter()
            .filter_map(|(&id, link)| match &link.role {
                Role::Negotiating(n) if n.is_expired(now, self.options.negotiation_timeout) => {
                    Some((id, "negotiation timed out"))
                }
                Role::Established(terms) if link.conn.is_expired(now, terms.keepalive()) => {
                    Some((id, "keepalive expired"))
                }
                _ => None,
            })
            .collect();
        for (id, reason) in expired {
            self.teardown(id, reason);
        }

        let mut failed = Vec::new();
        for (&id, link) in &mut self.links {
            if let Role::Established(terms) = &link.role {
                let budget = link.conn.send_budget();
                for payload in self.registry.take_ready_requests(link.session_id, budget) {
                    if let Err(e) = link.conn.queue_frame(FrameType::JobRequest, &payload) {
                        warn!("[COORD] Session {} failed to frame request: {}", link.session_id, e);
                    }
                }
                if link.conn.keepalive_due(now, terms.keepalive()) {
                    link.conn.queue_keepalive();
                }
            }
            if let Some(bytes) = link.conn.take_outbound(now) {
                if link.handle.send(bytes).is_err() {
                    failed.push(id);
                }
            }
        }
        for id in failed {
            self.teardown(id, "writer gone");
        }

        self.registry.sweep_terminated();
    }

    async fn shutdown(mut self) {
        info!("[COORD] Closing {} connection(s)", self.links.len());
        let mut open = HashSet::new();
        for (id, mut link) in self.links.drain() {
            match &link.role {
                Role::Established(_) => {
                    if link.conn.queue_frame(FrameType::Terminate, &[]).is_ok() {
                        if let Some(bytes) = link.conn.drain_outbound() {
                            let _ = link.handle.send(bytes);
                        }
                    }
                    self.registry.mark_terminating(link.session_id);
                }
                Role::Negotiating(negotiation) => {
                    negotiation.abandon(&self.registry);
                    self.registry.release_session_id(link.session_id);
                }
            }
            link.handle.close();
            open.insert(id);
        }
        self.registry.sweep_terminated();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !open.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match compio::time::timeout(remaining, self.event_rx.recv_async()).await {
                Ok(Ok(ConnEvent::Closed { conn })) => {
                    open.remove(&conn);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
}

/// Apply one received frame to a link. An error tears the link down.
fn handle_frame(link: &mut Link, registry: &Registry, frame: Frame) -> Result<(), String> {
    match &mut link.role {
        Role::Negotiating(negotiation) => match negotiation.on_frame(registry, &frame) {
            Step::Reply(frame_type, payload) => link
                .conn
                .queue_frame(frame_type, &payload)
                .map(drop)
                .map_err(|e| e.to_string()),
            Step::Abort(reason) => Err(reason.to_string()),
        },
        Role::Established(_) => {
            if frame.header.session_id != link.session_id {
                return Err(format!(
                    "frame for session {} arrived on session {}",
                    frame.header.session_id, link.session_id
                ));
            }
            match frame.frame_type() {
                FrameType::JobResponse => {
                    match JobResponse::decode(frame.payload) {
                        Ok(response) => {
                            if let Err(e) = registry.complete_job(link.session_id, response) {
                                warn!("[COORD] Session {} dropped response: {}", link.session_id, e);
                            }
                        }
                        Err(e) => {
                            warn!("[COORD] Session {} dropped response: {}", link.session_id, e);
                        }
                    }
                    link.conn.request_ack();
                    Ok(())
                }
                FrameType::Terminate => Err("terminated by worker".to_string()),
                other => Err(format!("unexpected {other:?} frame")),
            }
        }
    }
}
