//! Worker session dispatcher
//!
//! One task per established session owns the framing state. It claims slots
//! for incoming requests, answers busy when none is free, frames finished
//! responses inside the send window and keeps the session alive.

use super::handlers::HandlerTable;
use super::negotiation::NegotiatedSession;
use super::pool::{ExecContext, ExecutionPool};
use super::ShutdownHandle;
use bks_core::actor::{spawn_connection, ConnEvent, ConnHandle};
use bks_core::error::{BksError, Result};
use bks_core::options::EndpointOptions;
use bks_wire::codec::FrameType;
use bks_wire::connection::FrameConnection;
use bks_wire::messages::{to_bytes, JobRequest, JobResponse};
use compio::net::TcpStream;
use flume::Receiver;
use futures::{select, FutureExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The coordinator sent terminate
    Terminated,
    /// Local shutdown was requested
    Shutdown,
}

enum DispatchEvent {
    Conn(ConnEvent),
    JobDone,
    Shutdown,
    Tick,
    Lost,
}

struct Dispatcher<C> {
    conn: FrameConnection,
    handle: ConnHandle,
    session_id: u32,
    keepalive: Duration,
    ctx: Arc<ExecContext<C>>,
    pool: ExecutionPool,
    busy_replies: VecDeque<JobResponse>,
}

/// Serve one negotiated session until it ends.
///
/// # Errors
///
/// `KeepaliveExpired`, `ConnectionClosed`, protocol errors from the peer,
/// or a failure to start the execution threads.
pub(crate) async fn serve<C: Send + 'static>(
    stream: TcpStream,
    session: NegotiatedSession,
    handlers: Arc<HandlerTable<C>>,
    max_threads: usize,
    options: &EndpointOptions,
    shutdown: &ShutdownHandle,
) -> Result<SessionEnd> {
    let NegotiatedSession {
        session_id,
        max_instances,
        max_class_instances,
        keepalive,
        max_resp_payload,
        mut conn,
        ..
    } = session;

    let (event_tx, event_rx) = flume::unbounded();
    let handle = spawn_connection(stream, u64::from(session_id), options.read_buffer_size, event_tx);

    let ctx = Arc::new(ExecContext::new(
        session_id,
        max_instances,
        max_class_instances,
        handlers,
        max_resp_payload,
    ));
    let (done_tx, done_rx) = flume::unbounded();
    let threads = max_threads.min(max_instances as usize).max(1);
    let pool = ExecutionPool::start(threads, &ctx, &done_tx)?;
    drop(done_tx);

    // Acknowledge the accept right away so the coordinator sees us alive.
    conn.request_ack();
    let mut dispatcher = Dispatcher {
        conn,
        handle,
        session_id,
        keepalive,
        ctx,
        pool,
        busy_replies: VecDeque::new(),
    };
    info!(
        "[WORKER] Session {} serving {} instance(s) on {} thread(s)",
        session_id, max_instances, threads
    );

    let tick = (keepalive / 4).min(options.poll_interval);
    // Frames that arrived together with the accept are already buffered.
    let result = match dispatcher.process_frames() {
        Ok(None) => dispatcher.run(&event_rx, &done_rx, shutdown, tick).await,
        Ok(Some(end)) => Ok(end),
        Err(e) => Err(e),
    };

    dispatcher.handle.close();
    debug!(
        "[WORKER] Session {} closed with {} class instance(s) live and {} job slot(s) busy",
        session_id,
        dispatcher.ctx.class_instances(),
        dispatcher.ctx.table.busy()
    );
    result
}

impl<C> Dispatcher<C> {
    async fn run(
        &mut self,
        event_rx: &Receiver<ConnEvent>,
        done_rx: &Receiver<usize>,
        shutdown: &ShutdownHandle,
        tick: Duration,
    ) -> Result<SessionEnd> {
        loop {
            self.pump(Instant::now())?;
            let event = select! {
                e = event_rx.recv_async().fuse() => e.map_or(DispatchEvent::Lost, DispatchEvent::Conn),
                d = done_rx.recv_async().fuse() => d.map_or(DispatchEvent::Lost, |_| DispatchEvent::JobDone),
                () = shutdown.wait().fuse() => DispatchEvent::Shutdown,
                () = compio::time::sleep(tick).fuse() => DispatchEvent::Tick,
            };
            match event {
                DispatchEvent::Conn(event) => {
                    if let Some(end) = self.on_conn_event(event)? {
                        return Ok(end);
                    }
                }
                DispatchEvent::JobDone | DispatchEvent::Tick => {}
                DispatchEvent::Shutdown => {
                    self.terminate();
                    return Ok(SessionEnd::Shutdown);
                }
                DispatchEvent::Lost => return Err(BksError::ConnectionClosed),
            }
        }
    }

    fn on_conn_event(&mut self, event: ConnEvent) -> Result<Option<SessionEnd>> {
        match event {
            ConnEvent::Received { bytes, .. } => {
                trace!("[WORKER] Session {} received {} bytes", self.session_id, bytes.len());
                self.conn.on_bytes(bytes);
                self.process_frames()
            }
            ConnEvent::Written { .. } => {
                self.conn.on_write_complete();
                Ok(None)
            }
            ConnEvent::Closed { .. } => Err(BksError::ConnectionClosed),
        }
    }

    fn process_frames(&mut self) -> Result<Option<SessionEnd>> {
        while let Some(frame) = self
            .conn
            .poll_frame(Instant::now())
            .map_err(|e| BksError::protocol(e.to_string()))?
        {
            if frame.header.session_id != self.session_id {
                return Err(BksError::protocol(format!(
                    "frame for session {} on session {}",
                    frame.header.session_id, self.session_id
                )));
            }
            match frame.frame_type() {
                FrameType::JobRequest => {
                    let request = JobRequest::decode(frame.payload)
                        .map_err(|e| BksError::protocol(e.to_string()))?;
                    self.dispatch(request)?;
                    self.conn.request_ack();
                }
                FrameType::Terminate => {
                    info!("[WORKER] Session {} terminated by coordinator", self.session_id);
                    return Ok(Some(SessionEnd::Terminated));
                }
                other => {
                    return Err(BksError::protocol(format!(
                        "unexpected {other:?} frame in session"
                    )))
                }
            }
        }
        Ok(None)
    }

    fn dispatch(&mut self, request: JobRequest) -> Result<()> {
        match self.ctx.table.claim(request) {
            Ok(slot) => {
                if !self.pool.submit(slot) {
                    return Err(BksError::ChannelSend);
                }
            }
            Err(request) => {
                debug!(
                    "[WORKER] Session {} busy, refusing job {}",
                    self.session_id, request.job_id
                );
                self.busy_replies.push_back(JobResponse::busy(&request));
            }
        }
        Ok(())
    }

    /// Check liveness, frame what the window allows and start a write.
    fn pump(&mut self, now: Instant) -> Result<()> {
        if self.conn.is_expired(now, self.keepalive) {
            return Err(BksError::KeepaliveExpired(self.keepalive));
        }

        let mut budget = self.conn.send_budget();
        while budget > 0 {
            let Some(response) = self.busy_replies.pop_front() else {
                break;
            };
            self.queue_response(&response)?;
            budget -= 1;
        }
        for response in self.ctx.table.take_finished(budget) {
            self.queue_response(&response)?;
        }

        if self.conn.keepalive_due(now, self.keepalive) {
            self.conn.queue_keepalive();
        }
        if let Some(bytes) = self.conn.take_outbound(now) {
            self.handle.send(bytes)?;
        }
        Ok(())
    }

    fn queue_response(&mut self, response: &JobResponse) -> Result<()> {
        trace!(
            "[WORKER] Session {} job {} done with code {}",
            self.session_id,
            response.job_id,
            response.result_code
        );
        self.conn
            .queue_frame(FrameType::JobResponse, &to_bytes(|b| response.encode(b)))
            .map(drop)
            .map_err(|e| BksError::protocol(e.to_string()))
    }

    fn terminate(&mut self) {
        info!("[WORKER] Session {} shutting down", self.session_id);
        if self.conn.queue_frame(FrameType::Terminate, &[]).is_ok() {
            if let Some(bytes) = self.conn.drain_outbound() {
                let _ = self.handle.send(bytes);
            }
        }
    }
}
