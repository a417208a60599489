//! Session registry
//!
//! All coordinator state that both the I/O loop and application threads
//! touch lives here behind one `RwLock`: registered service types, open
//! sessions, their job slots and the id allocators. Two atomic counters
//! (requests waiting to be sent, responses waiting to be polled) are kept
//! alongside so either side can check for work without the lock.
//!
//! Only the I/O loop creates and removes sessions; application threads
//! submit and poll.

use super::config::ServiceConfig;
use super::ids::IdBitmap;
use super::job::{Job, JobResult, JobStatus, PollError, SubmitError, Submission};
use super::negotiation::{evaluate_offer, AcceptedTerms, OfferVerdict};
use bks_wire::jobid::{class_handle_session, JobId, JobIdError, JobIdParts};
use bks_wire::limits::{MAX_CONCURRENT_REQUESTS, MAX_CONCURRENT_SESSIONS, MAX_REQ_ID, MAX_SERVICE_TYPES};
use bks_wire::messages::{
    to_bytes, JobRequest, JobResponse, OfferedService, RequestServices, ServiceType,
};
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid service config: {field} = {value}")]
    InvalidConfig { field: &'static str, value: u32 },

    #[error("service type {0} is already registered")]
    AlreadyRegistered(ServiceType),

    #[error("service type {0} is not registered")]
    UnknownServiceType(ServiceType),

    #[error("service type {0} has no free session index")]
    TypeFull(ServiceType),

    #[error("registry is closed")]
    Closed,
}

/// Why a job response was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("undecodable job id: {0}")]
    BadJobId(#[from] JobIdError),

    #[error("session {0} is not established")]
    UnknownSession(u32),

    #[error("job {job_id} does not belong to session {session_id}")]
    WrongSession { job_id: JobId, session_id: u32 },

    #[error("job {0} is not awaiting a response")]
    NotAwaiting(JobId),

    #[error("job {job_id} was sent for instance {sent:#x} but answered for {got:#x}")]
    ClassMismatch { job_id: JobId, sent: u64, got: u64 },
}

/// Class instances of one service type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassInstanceCount {
    /// Handles returned by workers and not yet destructed
    pub committed: u32,
    /// Construct jobs submitted but not yet answered
    pub uncommitted: u32,
}

/// Snapshot of one established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u32,
    pub service_type: ServiceType,
    /// 1-based position within the type's session list
    pub type_index: u32,
    pub max_instances: u32,
    pub max_class_instances: u32,
    pub keepalive_secs: u32,
    /// Occupied job slots
    pub busy: u32,
    pub class_instances: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Submitted, waiting for the I/O loop to frame it
    Ready,
    /// On the wire, waiting for the response
    Sent,
    /// Response stored, waiting for a poll
    Done,
}

#[derive(Debug)]
struct JobSlot {
    state: SlotState,
    job_id: JobId,
    req_id: u32,
    class_instance_id: u64,
    method_id: u32,
    construct: bool,
    params: Bytes,
    data: Bytes,
    result: Option<JobResult>,
    submitted_at: Option<Instant>,
}

impl JobSlot {
    const fn free() -> Self {
        Self {
            state: SlotState::Free,
            job_id: JobId::from_raw(0),
            req_id: 0,
            class_instance_id: 0,
            method_id: 0,
            construct: false,
            params: Bytes::new(),
            data: Bytes::new(),
            result: None,
            submitted_at: None,
        }
    }

    fn status(&self) -> JobStatus {
        match (&self.state, &self.result) {
            (SlotState::Done, Some(result)) => JobStatus::Completed(result.clone()),
            _ => JobStatus::Pending,
        }
    }
}

#[derive(Debug)]
struct Session {
    service_type: ServiceType,
    type_index: u32,
    max_instances: u32,
    max_class_instances: u32,
    keepalive_secs: u32,
    class_instances: HashSet<u64>,
    constructs_in_flight: u32,
    slots: Vec<JobSlot>,
    busy: u32,
    terminating: bool,
}

impl Session {
    fn new(terms: &AcceptedTerms, type_index: u32) -> Self {
        Self {
            service_type: terms.service_type,
            type_index,
            max_instances: terms.max_instances,
            max_class_instances: terms.max_class_instances,
            keepalive_secs: terms.keepalive_secs,
            class_instances: HashSet::new(),
            constructs_in_flight: 0,
            slots: (0..terms.max_instances).map(|_| JobSlot::free()).collect(),
            busy: 0,
            terminating: false,
        }
    }

    const fn is_full(&self) -> bool {
        self.busy >= self.max_instances
    }

    fn class_room(&self) -> bool {
        (self.class_instances.len() as u32 + self.constructs_in_flight) < self.max_class_instances
    }

    /// `self` has proportionally fewer busy slots than `other`; equal load
    /// prefers the larger session.
    fn less_busy_than(&self, other: &Self) -> bool {
        let lhs = u64::from(self.busy) * u64::from(other.max_instances);
        let rhs = u64::from(other.busy) * u64::from(self.max_instances);
        lhs < rhs || (lhs == rhs && self.max_instances > other.max_instances)
    }
}

#[derive(Debug)]
struct TypeEntry {
    config: ServiceConfig,
    /// Indexed by type-local session index - 1
    sessions: Vec<Option<u32>>,
    /// Accept frames being written for this type
    pending_accepts: u32,
}

impl TypeEntry {
    fn established(&self) -> u32 {
        self.sessions.iter().flatten().count() as u32
    }

    fn open_sessions(&self) -> u32 {
        self.established() + self.pending_accepts
    }
}

#[derive(Debug)]
struct RegistryState {
    types: Vec<Option<TypeEntry>>,
    sessions: HashMap<u32, Session>,
    session_ids: IdBitmap,
    live_req_ids: HashSet<u32>,
    next_req_id: u32,
    closed: bool,
}

impl RegistryState {
    fn type_entry(&self, ty: ServiceType) -> Option<&TypeEntry> {
        self.types.get(ty.index())?.as_ref()
    }

    fn type_entry_mut(&mut self, ty: ServiceType) -> Option<&mut TypeEntry> {
        self.types.get_mut(ty.index())?.as_mut()
    }

    fn alloc_req_id(&mut self) -> Option<u32> {
        if self.live_req_ids.len() >= MAX_CONCURRENT_REQUESTS as usize {
            return None;
        }
        loop {
            let id = self.next_req_id;
            self.next_req_id = if id >= MAX_REQ_ID { 1 } else { id + 1 };
            if self.live_req_ids.insert(id) {
                return Some(id);
            }
        }
    }

    /// Map a job id back to its live (session, slot index).
    fn resolve(&self, job_id: JobId) -> Option<(u32, usize)> {
        let parts = job_id.unpack().ok()?;
        let entry = self.type_entry(ServiceType(parts.type_id))?;
        let type_idx = parts.type_session_idx.checked_sub(1)? as usize;
        if *entry.sessions.get(type_idx)? != Some(parts.session_id) {
            return None;
        }
        let session = self.sessions.get(&parts.session_id)?;
        if session.terminating {
            return None;
        }
        let slot_idx = parts.instance_id.checked_sub(1)? as usize;
        let slot = session.slots.get(slot_idx)?;
        (slot.state != SlotState::Free && slot.job_id == job_id)
            .then_some((parts.session_id, slot_idx))
    }

    fn pick_session(&self, entry: &TypeEntry, job: &Job) -> Option<u32> {
        let mut best: Option<(u32, &Session)> = None;
        for &sid in entry.sessions.iter().flatten() {
            if job.session_hint.is_some_and(|hint| hint != sid) {
                continue;
            }
            let Some(session) = self.sessions.get(&sid) else {
                continue;
            };
            if session.terminating || session.is_full() {
                continue;
            }
            if job.is_construct() && !session.class_room() {
                continue;
            }
            match best {
                Some((_, current)) if !session.less_busy_than(current) => {}
                _ => best = Some((sid, session)),
            }
        }
        best.map(|(sid, _)| sid)
    }
}

/// Shared coordinator state.
///
/// # Examples
///
/// ```
/// use bks::coordinator::{Registry, ServiceConfig};
/// use bks::wire::messages::ServiceType;
///
/// let registry = Registry::new();
/// registry.register_type(ServiceConfig::new(ServiceType::ECHO)).unwrap();
/// assert_eq!(registry.num_sessions(None), 0);
/// ```
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    requests_pending: AtomicUsize,
    responses_ready: AtomicUsize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                types: (0..=MAX_SERVICE_TYPES).map(|_| None).collect(),
                sessions: HashMap::new(),
                session_ids: IdBitmap::new(MAX_CONCURRENT_SESSIONS),
                live_req_ids: HashSet::new(),
                next_req_id: 1,
                closed: false,
            }),
            requests_pending: AtomicUsize::new(0),
            responses_ready: AtomicUsize::new(0),
        }
    }

    /// Register a service type workers may offer.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for out-of-range limits, `AlreadyRegistered` when the
    /// type is known and `Closed` after [`close`](Self::close).
    pub fn register_type(&self, config: ServiceConfig) -> Result<(), RegistryError> {
        let config = config.validate()?;
        let mut state = self.state.write();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        let ty = config.service_type;
        let slot = state
            .types
            .get_mut(ty.index())
            .ok_or(RegistryError::UnknownServiceType(ty))?;
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(ty));
        }
        debug!(
            "[COORD] Registered service type {} (sessions {}, instances {}..={})",
            ty, config.max_sessions, config.min_instances, config.max_instances
        );
        *slot = Some(TypeEntry {
            sessions: vec![None; config.max_sessions as usize],
            config,
            pending_accepts: 0,
        });
        Ok(())
    }

    #[must_use]
    pub fn service_config(&self, service_type: ServiceType) -> Option<ServiceConfig> {
        self.state
            .read()
            .type_entry(service_type)
            .map(|entry| entry.config.clone())
    }

    /// Established sessions of one type, or of all types.
    #[must_use]
    pub fn num_sessions(&self, service_type: Option<ServiceType>) -> u32 {
        let state = self.state.read();
        state
            .sessions
            .values()
            .filter(|s| !s.terminating && service_type.map_or(true, |ty| s.service_type == ty))
            .count() as u32
    }

    /// Negotiated job instances across established sessions.
    #[must_use]
    pub fn num_instances(&self, service_type: Option<ServiceType>) -> u32 {
        let state = self.state.read();
        state
            .sessions
            .values()
            .filter(|s| !s.terminating && service_type.map_or(true, |ty| s.service_type == ty))
            .map(|s| s.max_instances)
            .sum()
    }

    #[must_use]
    pub fn class_instances(&self, service_type: Option<ServiceType>) -> ClassInstanceCount {
        let state = self.state.read();
        state
            .sessions
            .values()
            .filter(|s| !s.terminating && service_type.map_or(true, |ty| s.service_type == ty))
            .fold(ClassInstanceCount::default(), |acc, s| ClassInstanceCount {
                committed: acc.committed + s.class_instances.len() as u32,
                uncommitted: acc.uncommitted + s.constructs_in_flight,
            })
    }

    /// Snapshot of all established sessions, ordered by id.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.read();
        let mut out: Vec<SessionInfo> = state
            .sessions
            .iter()
            .filter(|(_, s)| !s.terminating)
            .map(|(&session_id, s)| SessionInfo {
                session_id,
                service_type: s.service_type,
                type_index: s.type_index,
                max_instances: s.max_instances,
                max_class_instances: s.max_class_instances,
                keepalive_secs: s.keepalive_secs,
                busy: s.busy,
                class_instances: s.class_instances.len() as u32,
            })
            .collect();
        out.sort_by_key(|info| info.session_id);
        out
    }

    /// Responses waiting to be polled. Lock-free.
    #[inline]
    #[must_use]
    pub fn responses_ready(&self) -> usize {
        self.responses_ready.load(Ordering::Relaxed)
    }

    /// Submitted jobs not yet framed. Lock-free.
    #[inline]
    #[must_use]
    pub fn requests_pending(&self) -> usize {
        self.requests_pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Refuse further submissions and registrations.
    pub fn close(&self) {
        self.state.write().closed = true;
    }

    /// Queue a job on the least busy matching session.
    ///
    /// # Errors
    ///
    /// See [`SubmitError`]. Having no session with a free instance is not
    /// an error but [`Submission::Busy`].
    pub fn submit(&self, job: Job) -> Result<Submission, SubmitError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.closed {
            return Err(SubmitError::Closed);
        }
        let entry = state
            .type_entry(job.service_type)
            .ok_or(SubmitError::UnknownServiceType(job.service_type))?;

        let max_param = entry.config.max_param_len as usize;
        if job.params.len() > max_param {
            return Err(SubmitError::ParamsTooLong {
                len: job.params.len(),
                max: max_param,
            });
        }
        let request_len = JobRequest::FIXED_LEN + job.params.len() + job.data.len();
        let max_request = entry.config.max_req_payload as usize;
        if request_len > max_request {
            return Err(SubmitError::RequestTooLarge {
                len: request_len,
                max: max_request,
            });
        }

        let session_id = if job.class_instance_id == 0 {
            match state.pick_session(entry, &job) {
                Some(sid) => sid,
                None => return Ok(Submission::Busy),
            }
        } else {
            let handle = job.class_instance_id;
            let sid = class_handle_session(handle);
            let owner = state.sessions.get(&sid).filter(|s| {
                !s.terminating && s.service_type == job.service_type && s.class_instances.contains(&handle)
            });
            match owner {
                None => return Err(SubmitError::InstanceGone(handle)),
                Some(s) if s.is_full() => return Ok(Submission::Busy),
                Some(_) => sid,
            }
        };

        let Some(req_id) = state.alloc_req_id() else {
            return Ok(Submission::Busy);
        };
        let Some(session) = state.sessions.get_mut(&session_id) else {
            state.live_req_ids.remove(&req_id);
            return Ok(Submission::Busy);
        };
        let Some(slot_idx) = session.slots.iter().position(|s| s.state == SlotState::Free) else {
            state.live_req_ids.remove(&req_id);
            return Ok(Submission::Busy);
        };

        let packed = JobIdParts {
            req_id,
            session_id,
            instance_id: slot_idx as u32 + 1,
            type_id: job.service_type.0,
            type_session_idx: session.type_index,
        }
        .pack();
        let job_id = match packed {
            Ok(id) => id,
            Err(e) => {
                // Every field is range-checked at registration and allocation.
                debug!("[COORD] Job id packing failed: {}", e);
                state.live_req_ids.remove(&req_id);
                return Ok(Submission::Busy);
            }
        };

        let construct = job.is_construct();
        let slot = &mut session.slots[slot_idx];
        *slot = JobSlot {
            state: SlotState::Ready,
            job_id,
            req_id,
            class_instance_id: job.class_instance_id,
            method_id: job.method_id,
            construct,
            params: job.params,
            data: job.data,
            result: None,
            submitted_at: Some(Instant::now()),
        };
        session.busy += 1;
        if construct {
            session.constructs_in_flight += 1;
        }
        self.requests_pending.fetch_add(1, Ordering::Relaxed);

        trace!(
            "[COORD] Job {} queued on session {} instance {}",
            job_id,
            session_id,
            slot_idx + 1
        );
        Ok(Submission::Queued(job_id))
    }

    /// Check a job and take its result if the response arrived.
    ///
    /// With `retain` the result stays in place and may be polled again;
    /// otherwise the slot and its request id are released.
    ///
    /// # Errors
    ///
    /// [`PollError::NoLongerExists`] when the id does not name a live job.
    pub fn poll(&self, job_id: JobId, retain: bool) -> Result<JobStatus, PollError> {
        let gone = PollError::NoLongerExists(job_id);

        if retain {
            let state = self.state.read();
            let (sid, idx) = state.resolve(job_id).ok_or(gone)?;
            let session = state.sessions.get(&sid).ok_or(gone)?;
            return Ok(session.slots[idx].status());
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let (sid, idx) = state.resolve(job_id).ok_or(gone)?;
        let session = state.sessions.get_mut(&sid).ok_or(gone)?;
        let slot = &mut session.slots[idx];
        if slot.state != SlotState::Done {
            return Ok(JobStatus::Pending);
        }
        let Some(result) = slot.result.take() else {
            return Ok(JobStatus::Pending);
        };
        state.live_req_ids.remove(&slot.req_id);
        *slot = JobSlot::free();
        session.busy -= 1;
        self.responses_ready.fetch_sub(1, Ordering::Relaxed);
        Ok(JobStatus::Completed(result))
    }

    pub(crate) fn alloc_session_id(&self) -> Option<u32> {
        let mut state = self.state.write();
        let id = state.session_ids.alloc();
        trace!(
            "[COORD] Allocated session id {:?} ({} in use)",
            id,
            state.session_ids.in_use()
        );
        id
    }

    pub(crate) fn release_session_id(&self, session_id: u32) {
        self.state.write().session_ids.release(session_id);
    }

    /// The request-services list: every type that still has room.
    pub(crate) fn offerable_services(&self) -> RequestServices {
        let state = self.state.read();
        RequestServices {
            services: state
                .types
                .iter()
                .flatten()
                .filter(|entry| entry.open_sessions() < entry.config.max_sessions)
                .map(|entry| entry.config.to_detail())
                .collect(),
        }
    }

    /// Evaluate an offer and, when accepted, hold a place for the session.
    pub(crate) fn reserve_session(&self, offer: &OfferedService) -> OfferVerdict {
        let mut state = self.state.write();
        if state.closed {
            return OfferVerdict::Abort("coordinator is closed");
        }
        let Some(entry) = state.type_entry_mut(offer.service_type) else {
            return OfferVerdict::Abort("offered type is not registered");
        };
        let verdict = evaluate_offer(&entry.config, entry.open_sessions(), offer);
        if matches!(verdict, OfferVerdict::Accept(_)) {
            entry.pending_accepts += 1;
        }
        verdict
    }

    pub(crate) fn release_reservation(&self, service_type: ServiceType) {
        if let Some(entry) = self.state.write().type_entry_mut(service_type) {
            entry.pending_accepts = entry.pending_accepts.saturating_sub(1);
        }
    }

    /// Turn a reservation into an established session.
    pub(crate) fn establish_session(
        &self,
        session_id: u32,
        terms: &AcceptedTerms,
    ) -> Result<(), RegistryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let closed = state.closed;
        let entry = state
            .type_entry_mut(terms.service_type)
            .ok_or(RegistryError::UnknownServiceType(terms.service_type))?;
        entry.pending_accepts = entry.pending_accepts.saturating_sub(1);
        if closed {
            return Err(RegistryError::Closed);
        }
        let idx = entry
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::TypeFull(terms.service_type))?;
        entry.sessions[idx] = Some(session_id);
        state
            .sessions
            .insert(session_id, Session::new(terms, idx as u32 + 1));
        Ok(())
    }

    /// Encode up to `budget` queued requests of a session and mark them sent.
    pub(crate) fn take_ready_requests(&self, session_id: u32, budget: usize) -> Vec<Bytes> {
        if budget == 0 || self.requests_pending() == 0 {
            return Vec::new();
        }
        let mut state = self.state.write();
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Vec::new();
        };
        if session.terminating {
            return Vec::new();
        }
        let mut out = Vec::new();
        for slot in session
            .slots
            .iter_mut()
            .filter(|s| s.state == SlotState::Ready)
            .take(budget)
        {
            let request = JobRequest {
                job_id: slot.job_id,
                class_instance_id: slot.class_instance_id,
                method_id: slot.method_id,
                params: std::mem::take(&mut slot.params),
                data: std::mem::take(&mut slot.data),
            };
            out.push(to_bytes(|b| request.encode(b)));
            slot.state = SlotState::Sent;
        }
        self.requests_pending.fetch_sub(out.len(), Ordering::Relaxed);
        out
    }

    /// Store a worker's response in its slot.
    ///
    /// # Errors
    ///
    /// A [`ResponseError`] when the response does not match a job sent on
    /// this session. Nothing is changed in that case.
    pub(crate) fn complete_job(
        &self,
        session_id: u32,
        response: JobResponse,
    ) -> Result<(), ResponseError> {
        let job_id = response.job_id;
        let parts = job_id.unpack()?;

        let mut state = self.state.write();
        let session = state
            .sessions
            .get_mut(&session_id)
            .filter(|s| !s.terminating)
            .ok_or(ResponseError::UnknownSession(session_id))?;
        if parts.session_id != session_id
            || parts.type_id != session.service_type.0
            || parts.type_session_idx != session.type_index
        {
            return Err(ResponseError::WrongSession { job_id, session_id });
        }
        let slot = parts
            .instance_id
            .checked_sub(1)
            .and_then(|i| session.slots.get_mut(i as usize))
            .filter(|s| s.state == SlotState::Sent && s.job_id == job_id)
            .ok_or(ResponseError::NotAwaiting(job_id))?;

        let sent = slot.class_instance_id;
        let got = response.class_instance_id;
        if sent != 0 && got != 0 && got != sent {
            return Err(ResponseError::ClassMismatch { job_id, sent, got });
        }

        if slot.construct {
            session.constructs_in_flight = session.constructs_in_flight.saturating_sub(1);
        }
        if sent == 0 && got != 0 {
            session.class_instances.insert(got);
        } else if sent != 0 && got == 0 {
            session.class_instances.remove(&sent);
        }

        if let Some(at) = slot.submitted_at {
            trace!(
                "[COORD] Job {} answered with code {} after {:?}",
                job_id,
                response.result_code,
                at.elapsed()
            );
        }
        slot.result = Some(JobResult {
            class_instance_id: got,
            method_id: response.method_id,
            result_code: response.result_code,
            data: response.data,
        });
        slot.state = SlotState::Done;
        self.responses_ready.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop resolving the session's jobs. Returns false for unknown ids.
    pub(crate) fn mark_terminating(&self, session_id: u32) -> bool {
        match self.state.write().sessions.get_mut(&session_id) {
            Some(session) => {
                session.terminating = true;
                true
            }
            None => false,
        }
    }

    /// Remove terminating sessions, releasing their ids and request ids.
    pub(crate) fn sweep_terminated(&self) -> Vec<u32> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let dead: Vec<u32> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.terminating)
            .map(|(&id, _)| id)
            .collect();

        for &sid in &dead {
            let Some(session) = state.sessions.remove(&sid) else {
                continue;
            };
            for slot in &session.slots {
                match slot.state {
                    SlotState::Free => continue,
                    SlotState::Ready => {
                        self.requests_pending.fetch_sub(1, Ordering::Relaxed);
                    }
                    SlotState::Done => {
                        self.responses_ready.fetch_sub(1, Ordering::Relaxed);
                    }
                    SlotState::Sent => {}
                }
                state.live_req_ids.remove(&slot.req_id);
            }
            if let Some(entry) = state.type_entry_mut(session.service_type) {
                if let Some(place) = entry.sessions.get_mut(session.type_index as usize - 1) {
                    if *place == Some(sid) {
                        *place = None;
                    }
                }
            }
            state.session_ids.release(sid);
            debug!("[COORD] Session {} removed", sid);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bks_wire::messages::{METHOD_CONSTRUCT, RESULT_OK};

    fn terms(max_instances: u32, max_class_instances: u32) -> AcceptedTerms {
        AcceptedTerms {
            service_type: ServiceType::ECHO,
            max_instances,
            max_class_instances,
            keepalive_secs: 60,
            max_resp_payload: 4096,
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_type(ServiceConfig::new(ServiceType::ECHO).with_max_sessions(4))
            .unwrap();
        registry
    }

    fn open_session(registry: &Registry, terms: &AcceptedTerms) -> u32 {
        let sid = registry.alloc_session_id().unwrap();
        registry.establish_session(sid, terms).unwrap();
        sid
    }

    fn queued(submission: Result<Submission, SubmitError>) -> JobId {
        submission.unwrap().job_id().expect("job should be queued")
    }

    fn respond(registry: &Registry, sid: u32, handle: u64) {
        for bytes in registry.take_ready_requests(sid, 16) {
            let request = JobRequest::decode(bytes).unwrap();
            let response = JobResponse {
                job_id: request.job_id,
                class_instance_id: handle,
                method_id: request.method_id,
                result_code: RESULT_OK,
                data: Bytes::new(),
            };
            registry.complete_job(sid, response).unwrap();
        }
    }

    #[test]
    fn test_register_twice() {
        let registry = registry();
        assert_eq!(
            registry.register_type(ServiceConfig::new(ServiceType::ECHO)),
            Err(RegistryError::AlreadyRegistered(ServiceType::ECHO))
        );
        assert_eq!(registry.offerable_services().services.len(), 1);
    }

    #[test]
    fn test_no_sessions_is_busy() {
        let registry = registry();
        let job = Job::call(ServiceType::ECHO, 0, 10);
        assert_eq!(registry.submit(job), Ok(Submission::Busy));
        assert_eq!(
            registry.submit(Job::call(ServiceType::SMITH_WATERMAN, 0, 10)),
            Err(SubmitError::UnknownServiceType(ServiceType::SMITH_WATERMAN))
        );
    }

    #[test]
    fn test_least_busy_session_wins() {
        let registry = registry();
        let a = open_session(&registry, &terms(10, 10));
        let b = open_session(&registry, &terms(10, 10));

        for _ in 0..8 {
            queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_session_hint(a)));
        }
        for _ in 0..2 {
            queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_session_hint(b)));
        }

        let id = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10)));
        assert_eq!(id.unpack().unwrap().session_id, b);
    }

    #[test]
    fn test_equal_load_prefers_larger_session() {
        let registry = registry();
        let _small = open_session(&registry, &terms(4, 4));
        let large = open_session(&registry, &terms(8, 4));
        let id = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10)));
        assert_eq!(id.unpack().unwrap().session_id, large);
    }

    #[test]
    fn test_one_job_per_instance() {
        let registry = registry();
        let sid = open_session(&registry, &terms(3, 0));
        let ids: Vec<JobId> = (0..3)
            .map(|_| queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10))))
            .collect();
        let instances: HashSet<u32> = ids
            .iter()
            .map(|id| id.unpack().unwrap().instance_id)
            .collect();
        assert_eq!(instances.len(), 3);
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, 0, 10)),
            Ok(Submission::Busy)
        );

        // Completing and collecting one job frees exactly one instance.
        respond(&registry, sid, 0);
        assert_eq!(registry.responses_ready(), 3);
        assert!(matches!(
            registry.poll(ids[1], false),
            Ok(JobStatus::Completed(r)) if r.result_code == RESULT_OK
        ));
        assert_eq!(
            registry.poll(ids[1], false),
            Err(PollError::NoLongerExists(ids[1]))
        );
        let again = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10)));
        assert_eq!(
            again.unpack().unwrap().instance_id,
            ids[1].unpack().unwrap().instance_id
        );
        assert_ne!(again, ids[1]);
    }

    #[test]
    fn test_retain_keeps_result() {
        let registry = registry();
        let sid = open_session(&registry, &terms(2, 0));
        let id = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_data("abc")));
        assert_eq!(registry.poll(id, true), Ok(JobStatus::Pending));
        assert_eq!(registry.requests_pending(), 1);

        let sent = registry.take_ready_requests(sid, 5);
        assert_eq!(sent.len(), 1);
        assert_eq!(registry.requests_pending(), 0);
        assert_eq!(&JobRequest::decode(sent[0].clone()).unwrap().data[..], b"abc");

        let response = JobResponse {
            job_id: id,
            class_instance_id: 0,
            method_id: 10,
            result_code: 7,
            data: Bytes::from_static(b"out"),
        };
        registry.complete_job(sid, response.clone()).unwrap();
        assert!(!registry.poll(id, true).unwrap().is_pending());
        assert!(!registry.poll(id, true).unwrap().is_pending());
        assert_eq!(
            registry.complete_job(sid, response),
            Err(ResponseError::NotAwaiting(id))
        );
        assert!(matches!(
            registry.poll(id, false),
            Ok(JobStatus::Completed(r)) if r.result_code == 7 && &r.data[..] == b"out"
        ));
        assert_eq!(registry.responses_ready(), 0);
    }

    #[test]
    fn test_construct_and_destruct_track_handles() {
        let registry = registry();
        let sid = open_session(&registry, &terms(4, 1));
        let handle = bks_wire::jobid::pack_class_handle(sid, 1, 1);

        let construct = queued(registry.submit(Job::construct(ServiceType::ECHO)));
        assert_eq!(
            registry.class_instances(None),
            ClassInstanceCount {
                committed: 0,
                uncommitted: 1
            }
        );
        // The only class instance allowance is taken by the pending construct.
        assert_eq!(
            registry.submit(Job::construct(ServiceType::ECHO)),
            Ok(Submission::Busy)
        );

        respond(&registry, sid, handle);
        assert!(matches!(
            registry.poll(construct, false),
            Ok(JobStatus::Completed(r)) if r.class_instance_id == handle
        ));
        assert_eq!(registry.class_instances(Some(ServiceType::ECHO)).committed, 1);

        let call = queued(registry.submit(Job::call(ServiceType::ECHO, handle, 10)));
        assert_eq!(call.unpack().unwrap().session_id, sid);
        respond(&registry, sid, handle);
        registry.poll(call, false).unwrap();

        queued(registry.submit(Job::destruct(ServiceType::ECHO, handle)));
        respond(&registry, sid, 0);
        assert_eq!(registry.class_instances(None).committed, 0);
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, handle, 10)),
            Err(SubmitError::InstanceGone(handle))
        );
    }

    #[test]
    fn test_class_mismatch_is_dropped() {
        let registry = registry();
        let sid = open_session(&registry, &terms(2, 2));
        let handle = bks_wire::jobid::pack_class_handle(sid, 1, 1);
        let construct = queued(registry.submit(Job::construct(ServiceType::ECHO)));
        respond(&registry, sid, handle);
        registry.poll(construct, false).unwrap();

        let id = queued(registry.submit(Job::call(ServiceType::ECHO, handle, 10)));
        registry.take_ready_requests(sid, 1);
        let bogus = JobResponse {
            job_id: id,
            class_instance_id: handle + 1,
            method_id: 10,
            result_code: RESULT_OK,
            data: Bytes::new(),
        };
        assert!(matches!(
            registry.complete_job(sid, bogus),
            Err(ResponseError::ClassMismatch { .. })
        ));
        assert_eq!(registry.poll(id, true), Ok(JobStatus::Pending));
    }

    #[test]
    fn test_response_validation() {
        let registry = registry();
        let a = open_session(&registry, &terms(2, 0));
        let b = open_session(&registry, &terms(2, 0));
        let id = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_session_hint(a)));

        let response = JobResponse {
            job_id: id,
            class_instance_id: 0,
            method_id: 10,
            result_code: RESULT_OK,
            data: Bytes::new(),
        };
        // Not sent yet.
        assert_eq!(
            registry.complete_job(a, response.clone()),
            Err(ResponseError::NotAwaiting(id))
        );
        registry.take_ready_requests(a, 4);
        assert_eq!(
            registry.complete_job(b, response.clone()),
            Err(ResponseError::WrongSession {
                job_id: id,
                session_id: b
            })
        );
        let mut garbage = response.clone();
        garbage.job_id = JobId::from_raw(0);
        assert!(matches!(
            registry.complete_job(a, garbage),
            Err(ResponseError::BadJobId(_))
        ));
        assert_eq!(registry.complete_job(a, response), Ok(()));
    }

    #[test]
    fn test_teardown_invalidates_jobs_and_handles() {
        let registry = registry();
        let sid = open_session(&registry, &terms(2, 2));
        let handle = bks_wire::jobid::pack_class_handle(sid, 1, 1);
        let construct = queued(registry.submit(Job::construct(ServiceType::ECHO)));
        respond(&registry, sid, handle);
        registry.poll(construct, false).unwrap();
        let pending = queued(registry.submit(Job::call(ServiceType::ECHO, handle, 10)));
        assert_eq!(registry.requests_pending(), 1);

        assert!(registry.mark_terminating(sid));
        assert_eq!(registry.poll(pending, true), Err(PollError::NoLongerExists(pending)));
        assert_eq!(registry.num_sessions(None), 0);

        assert_eq!(registry.sweep_terminated(), vec![sid]);
        assert_eq!(registry.requests_pending(), 0);
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, handle, 10)),
            Err(SubmitError::InstanceGone(handle))
        );
        // The id is free again and the type has room for a new session.
        assert_eq!(registry.alloc_session_id(), Some(sid));
        assert_eq!(registry.offerable_services().services.len(), 1);
    }

    #[test]
    fn test_stale_type_index_does_not_resolve() {
        let registry = registry();
        let sid = open_session(&registry, &terms(2, 0));
        let id = queued(registry.submit(Job::call(ServiceType::ECHO, 0, 10)));
        let mut parts = id.unpack().unwrap();
        parts.type_session_idx += 1;
        let forged = parts.pack().unwrap();
        assert_eq!(registry.poll(forged, true), Err(PollError::NoLongerExists(forged)));
        parts.type_session_idx -= 1;
        parts.instance_id = 3;
        let out_of_range = parts.pack().unwrap();
        assert!(registry.poll(out_of_range, true).is_err());
        assert_eq!(registry.sessions()[0].session_id, sid);
    }

    #[test]
    fn test_payload_limits() {
        let registry = Registry::new();
        registry
            .register_type(
                ServiceConfig::new(ServiceType::ECHO)
                    .with_max_param_len(4)
                    .with_payload_limits(64, 64),
            )
            .unwrap();
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_params(vec![0u8; 5])),
            Err(SubmitError::ParamsTooLong { len: 5, max: 4 })
        );
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, 0, 10).with_data(vec![0u8; 40])),
            Err(SubmitError::RequestTooLarge {
                len: JobRequest::FIXED_LEN + 40,
                max: 64
            })
        );
        registry.close();
        assert_eq!(
            registry.submit(Job::call(ServiceType::ECHO, 0, METHOD_CONSTRUCT)),
            Err(SubmitError::Closed)
        );
    }

    #[test]
    fn test_full_type_not_offered() {
        let registry = Registry::new();
        registry
            .register_type(ServiceConfig::new(ServiceType::ECHO).with_max_sessions(1))
            .unwrap();
        open_session(&registry, &terms(2, 0));
        assert!(registry.offerable_services().services.is_empty());
    }
}
