//! Job submission and polling types

use bks_wire::jobid::JobId;
use bks_wire::messages::{ServiceType, METHOD_CONSTRUCT, METHOD_DESTRUCT, RESULT_OK};
use bytes::Bytes;
use thiserror::Error;

/// A method call to dispatch to some worker.
///
/// `class_instance_id == 0` lets the coordinator pick the least busy
/// session; a non-zero handle pins the job to the session that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub service_type: ServiceType,
    pub class_instance_id: u64,
    pub method_id: u32,
    pub params: Bytes,
    pub data: Bytes,
    /// Restrict session selection to this session id
    pub session_hint: Option<u32>,
}

impl Job {
    #[must_use]
    pub fn call(service_type: ServiceType, class_instance_id: u64, method_id: u32) -> Self {
        Self {
            service_type,
            class_instance_id,
            method_id,
            params: Bytes::new(),
            data: Bytes::new(),
            session_hint: None,
        }
    }

    /// Create a class instance on some worker. The response carries its handle.
    #[must_use]
    pub fn construct(service_type: ServiceType) -> Self {
        Self::call(service_type, 0, METHOD_CONSTRUCT)
    }

    /// Destroy the class instance `handle`.
    #[must_use]
    pub fn destruct(service_type: ServiceType, handle: u64) -> Self {
        Self::call(service_type, handle, METHOD_DESTRUCT)
    }

    #[must_use]
    pub fn with_params(mut self, params: impl Into<Bytes>) -> Self {
        self.params = params.into();
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    #[must_use]
    pub fn with_session_hint(mut self, session_id: u32) -> Self {
        self.session_hint = Some(session_id);
        self
    }

    #[inline]
    pub(crate) const fn is_construct(&self) -> bool {
        self.class_instance_id == 0 && self.method_id == METHOD_CONSTRUCT
    }
}

/// Outcome of a successful submit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The job holds a slot and will be sent
    Queued(JobId),
    /// No session had a free instance; try again later
    Busy,
}

impl Submission {
    #[must_use]
    pub const fn job_id(self) -> Option<JobId> {
        match self {
            Self::Queued(id) => Some(id),
            Self::Busy => None,
        }
    }

    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("service type {0} is not registered")]
    UnknownServiceType(ServiceType),

    #[error("parameters are {len} bytes (max: {max})")]
    ParamsTooLong { len: usize, max: usize },

    #[error("request payload would be {len} bytes (max: {max})")]
    RequestTooLarge { len: usize, max: usize },

    #[error("class instance {0:#x} no longer exists")]
    InstanceGone(u64),

    #[error("coordinator is closed")]
    Closed,
}

/// Worker's answer to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Handle the job ran against; for a construct the new handle
    pub class_instance_id: u64,
    pub method_id: u32,
    pub result_code: u32,
    pub data: Bytes,
}

impl JobResult {
    #[inline]
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result_code == RESULT_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed(JobResult),
}

impl JobStatus {
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// The job was already collected, or its session is gone
    #[error("job {0} no longer exists")]
    NoLongerExists(JobId),
}
