//! Service type registration
//!
//! A coordinator registers each service type it wants workers for, together
//! with the limits it sends out during negotiation.

use super::registry::RegistryError;
use bks_wire::limits::*;
use bks_wire::messages::{ServiceDetail, ServiceType};

/// Limits for one service type.
///
/// Defaults follow the Smith-Waterman profile in [`bks_wire::limits`].
///
/// # Examples
///
/// ```
/// use bks::coordinator::ServiceConfig;
/// use bks::wire::messages::ServiceType;
///
/// let config = ServiceConfig::new(ServiceType::ECHO)
///     .with_max_sessions(4)
///     .with_instances(1, 8);
/// assert_eq!(config.max_sessions, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub service_type: ServiceType,
    /// Accepted provider version range
    pub min_provider_version: u32,
    pub max_provider_version: u32,
    /// Sessions of this type that may be established at once
    pub max_sessions: u32,
    /// Liveness period; a session silent for this long is torn down
    pub keepalive_secs: u32,
    /// Job instances a worker must offer at least / may offer at most
    pub min_instances: u32,
    pub max_instances: u32,
    /// Class instances per session
    pub min_class_instances: u32,
    pub max_class_instances: u32,
    pub max_proc_secs: u32,
    pub max_param_len: u32,
    pub max_query_seq_len: u32,
    pub max_targ_seq_len: u32,
    pub max_req_payload: u32,
    pub max_resp_payload: u32,
    /// Preference sent to workers offering several types
    pub priority: u32,
}

impl ServiceConfig {
    #[must_use]
    pub const fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            min_provider_version: MIN_PROVIDER_VERSION,
            max_provider_version: MAX_PROVIDER_VERSION,
            max_sessions: DEFAULT_SESSIONS_PER_TYPE,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            min_instances: MIN_SERVICE_INSTANCES,
            max_instances: DEFAULT_SERVICE_INSTANCES,
            min_class_instances: 0,
            max_class_instances: DEFAULT_SERVICE_INSTANCES,
            max_proc_secs: DEFAULT_MAX_PROC_SECS,
            max_param_len: DEFAULT_MAX_PARAM_LEN,
            max_query_seq_len: DEFAULT_MAX_QUERY_SEQ_LEN,
            max_targ_seq_len: DEFAULT_MAX_TARG_SEQ_LEN,
            max_req_payload: DEFAULT_MAX_REQ_PAYLOAD,
            max_resp_payload: DEFAULT_MAX_RESP_PAYLOAD,
            priority: DEFAULT_PRIORITY,
        }
    }

    #[must_use]
    pub fn with_max_sessions(mut self, max: u32) -> Self {
        self.max_sessions = max;
        self
    }

    #[must_use]
    pub fn with_keepalive_secs(mut self, secs: u32) -> Self {
        self.keepalive_secs = secs;
        self
    }

    #[must_use]
    pub fn with_instances(mut self, min: u32, max: u32) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    #[must_use]
    pub fn with_class_instances(mut self, min: u32, max: u32) -> Self {
        self.min_class_instances = min;
        self.max_class_instances = max;
        self
    }

    #[must_use]
    pub fn with_max_proc_secs(mut self, secs: u32) -> Self {
        self.max_proc_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_param_len(mut self, len: u32) -> Self {
        self.max_param_len = len;
        self
    }

    #[must_use]
    pub fn with_seq_lens(mut self, query: u32, target: u32) -> Self {
        self.max_query_seq_len = query;
        self.max_targ_seq_len = target;
        self
    }

    #[must_use]
    pub fn with_payload_limits(mut self, request: u32, response: u32) -> Self {
        self.max_req_payload = request;
        self.max_resp_payload = response;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Check every field against the protocol limits.
    ///
    /// Processing time below the minimum is raised to it; everything else
    /// out of range is an error.
    ///
    /// # Errors
    ///
    /// `RegistryError::InvalidConfig` naming the first offending field.
    pub fn validate(mut self) -> Result<Self, RegistryError> {
        fn check(ok: bool, field: &'static str, value: u32) -> Result<(), RegistryError> {
            if ok {
                Ok(())
            } else {
                Err(RegistryError::InvalidConfig { field, value })
            }
        }

        check(
            self.service_type.is_defined(),
            "service_type",
            u32::from(self.service_type.0),
        )?;
        check(
            (1..=MAX_SESSIONS_PER_TYPE).contains(&self.max_sessions),
            "max_sessions",
            self.max_sessions,
        )?;
        check(
            (MIN_KEEPALIVE_SECS..=MAX_KEEPALIVE_SECS).contains(&self.keepalive_secs),
            "keepalive_secs",
            self.keepalive_secs,
        )?;
        check(
            (MIN_SERVICE_INSTANCES..=MAX_SERVICE_INSTANCES).contains(&self.min_instances),
            "min_instances",
            self.min_instances,
        )?;
        check(
            (self.min_instances..=MAX_SERVICE_INSTANCES).contains(&self.max_instances),
            "max_instances",
            self.max_instances,
        )?;
        check(
            self.max_class_instances <= MAX_CLASS_INSTANCES,
            "max_class_instances",
            self.max_class_instances,
        )?;
        check(
            self.min_class_instances <= self.max_class_instances,
            "min_class_instances",
            self.min_class_instances,
        )?;
        check(
            self.min_provider_version <= self.max_provider_version,
            "min_provider_version",
            self.min_provider_version,
        )?;
        check(
            self.max_proc_secs <= MAX_PROC_SECS,
            "max_proc_secs",
            self.max_proc_secs,
        )?;
        check(
            self.max_param_len <= MAX_PARAM_LEN,
            "max_param_len",
            self.max_param_len,
        )?;
        check(
            self.max_query_seq_len <= MAX_SEQ_LEN,
            "max_query_seq_len",
            self.max_query_seq_len,
        )?;
        check(
            self.max_targ_seq_len <= MAX_SEQ_LEN,
            "max_targ_seq_len",
            self.max_targ_seq_len,
        )?;
        check(
            (1..=MAX_PAYLOAD).contains(&self.max_req_payload),
            "max_req_payload",
            self.max_req_payload,
        )?;
        check(
            (1..=MAX_PAYLOAD).contains(&self.max_resp_payload),
            "max_resp_payload",
            self.max_resp_payload,
        )?;

        self.max_proc_secs = self.max_proc_secs.max(MIN_PROC_SECS);
        Ok(self)
    }

    /// The negotiation record sent to workers
    #[must_use]
    pub fn to_detail(&self) -> ServiceDetail {
        ServiceDetail {
            service_type: self.service_type,
            min_provider_version: self.min_provider_version,
            max_provider_version: self.max_provider_version,
            keepalive_secs: self.keepalive_secs,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            min_class_instances: self.min_class_instances,
            max_class_instances: self.max_class_instances,
            max_proc_secs: self.max_proc_secs,
            max_param_len: self.max_param_len,
            max_query_seq_len: self.max_query_seq_len,
            max_targ_seq_len: self.max_targ_seq_len,
            max_req_payload: self.max_req_payload,
            max_resp_payload: self.max_resp_payload,
            priority: self.priority,
        }
    }
}
