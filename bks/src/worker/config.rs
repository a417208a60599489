//! Worker configuration

use super::costing::{CostingInputs, CostingParams};
use bks_wire::limits::{
    DEFAULT_MAX_QUERY_SEQ_LEN, DEFAULT_MAX_REQ_PAYLOAD, DEFAULT_MAX_RESP_PAYLOAD,
    DEFAULT_MAX_TARG_SEQ_LEN, DEFAULT_SERVICE_INSTANCES, MAX_CLASS_INSTANCES,
    MAX_SERVICE_INSTANCES, MIN_SERVICE_INSTANCES, PROVIDER_VERSION,
};
use bks_wire::messages::{ServiceDetail, ServiceType};
use std::fmt;
use std::sync::Arc;

/// Custom capacity estimate replacing [`CostingParams::instances`]
pub type CostingFn = Arc<dyn Fn(&CostingInputs) -> u32 + Send + Sync>;

/// A service type this worker can supply.
///
/// The limits are the largest jobs the worker accepts; a coordinator asking
/// for more than any of them is not offered this service.
#[derive(Clone)]
pub struct ProviderService {
    pub service_type: ServiceType,
    /// Ceiling on job instances offered per session
    pub max_instances: u32,
    /// Ceiling on class instances offered per session
    pub max_class_instances: u32,
    pub max_query_seq_len: u32,
    pub max_targ_seq_len: u32,
    pub max_req_payload: u32,
    pub max_resp_payload: u32,
    pub costing: CostingParams,
    costing_fn: Option<CostingFn>,
}

impl fmt::Debug for ProviderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderService")
            .field("service_type", &self.service_type)
            .field("max_instances", &self.max_instances)
            .field("max_class_instances", &self.max_class_instances)
            .field("max_query_seq_len", &self.max_query_seq_len)
            .field("max_targ_seq_len", &self.max_targ_seq_len)
            .field("max_req_payload", &self.max_req_payload)
            .field("max_resp_payload", &self.max_resp_payload)
            .field("costing", &self.costing)
            .field("custom_costing", &self.costing_fn.is_some())
            .finish()
    }
}

impl ProviderService {
    /// A service with the default (Smith-Waterman) limits.
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            max_instances: DEFAULT_SERVICE_INSTANCES,
            max_class_instances: DEFAULT_SERVICE_INSTANCES,
            max_query_seq_len: DEFAULT_MAX_QUERY_SEQ_LEN,
            max_targ_seq_len: DEFAULT_MAX_TARG_SEQ_LEN,
            max_req_payload: DEFAULT_MAX_REQ_PAYLOAD,
            max_resp_payload: DEFAULT_MAX_RESP_PAYLOAD,
            costing: CostingParams::default(),
            costing_fn: None,
        }
    }

    /// Set the instance ceiling (1..=128).
    #[must_use]
    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = max.clamp(MIN_SERVICE_INSTANCES, MAX_SERVICE_INSTANCES);
        self
    }

    /// Set the class-instance ceiling (0..=128).
    #[must_use]
    pub fn with_max_class_instances(mut self, max: u32) -> Self {
        self.max_class_instances = max.min(MAX_CLASS_INSTANCES);
        self
    }

    #[must_use]
    pub const fn with_seq_lens(mut self, query: u32, targ: u32) -> Self {
        self.max_query_seq_len = query;
        self.max_targ_seq_len = targ;
        self
    }

    #[must_use]
    pub const fn with_payload_limits(mut self, req: u32, resp: u32) -> Self {
        self.max_req_payload = req;
        self.max_resp_payload = resp;
        self
    }

    #[must_use]
    pub const fn with_costing(mut self, costing: CostingParams) -> Self {
        self.costing = costing;
        self
    }

    /// Replace the default estimate with `f`.
    #[must_use]
    pub fn with_costing_fn(
        mut self,
        f: impl Fn(&CostingInputs) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.costing_fn = Some(Arc::new(f));
        self
    }

    /// Whether jobs within `detail`'s limits fit this service.
    #[must_use]
    pub fn supports(&self, detail: &ServiceDetail) -> bool {
        detail.service_type == self.service_type
            && (detail.min_provider_version..=detail.max_provider_version)
                .contains(&PROVIDER_VERSION)
            && detail.max_query_seq_len <= self.max_query_seq_len
            && detail.max_targ_seq_len <= self.max_targ_seq_len
            && detail.max_req_payload <= self.max_req_payload
            && detail.max_resp_payload <= self.max_resp_payload
    }

    /// Raw capacity estimate for `detail`, before any ceiling.
    #[must_use]
    pub fn estimate(&self, detail: &ServiceDetail) -> u32 {
        let inputs = CostingInputs::from(detail);
        match &self.costing_fn {
            Some(f) => f(&inputs),
            None => self.costing.instances(&inputs),
        }
    }

    /// Instances to offer for `detail`. Zero means the service cannot be
    /// supplied.
    #[must_use]
    pub fn capacity(&self, detail: &ServiceDetail) -> u32 {
        self.estimate(detail)
            .min(self.max_instances)
            .min(detail.max_instances)
    }
}

/// Worker-wide settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Execution threads per session; a session never gets more threads
    /// than negotiated instances.
    /// - Default: number of CPUs
    pub max_threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution thread ceiling (at least 1).
    #[must_use]
    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bks_wire::limits::DEFAULT_PRIORITY;

    fn detail(ty: ServiceType) -> ServiceDetail {
        ServiceDetail {
            service_type: ty,
            min_provider_version: 1,
            max_provider_version: 1,
            keepalive_secs: 60,
            min_instances: 1,
            max_instances: 32,
            min_class_instances: 0,
            max_class_instances: 32,
            max_proc_secs: 1200,
            max_param_len: 0x3fff,
            max_query_seq_len: 1000,
            max_targ_seq_len: 1000,
            max_req_payload: 10_000,
            max_resp_payload: 10_000,
            priority: DEFAULT_PRIORITY,
        }
    }

    #[test]
    fn test_supports_limits() {
        let service = ProviderService::new(ServiceType::ECHO).with_seq_lens(1000, 500);
        assert!(!service.supports(&detail(ServiceType::ECHO)));
        assert!(!service.supports(&detail(ServiceType::SMITH_WATERMAN)));

        let service = service.with_seq_lens(1000, 1000);
        assert!(service.supports(&detail(ServiceType::ECHO)));

        let mut newer = detail(ServiceType::ECHO);
        newer.min_provider_version = 2;
        newer.max_provider_version = 3;
        assert!(!service.supports(&newer));
    }

    #[test]
    fn test_capacity_ceilings() {
        let d = detail(ServiceType::ECHO);
        let service = ProviderService::new(ServiceType::ECHO).with_max_instances(200);
        assert_eq!(service.max_instances, 128);
        // The default estimate is huge for small jobs; the request caps it.
        assert_eq!(service.capacity(&d), 32);

        let small = ProviderService::new(ServiceType::ECHO).with_max_instances(4);
        assert_eq!(small.capacity(&d), 4);

        let custom = ProviderService::new(ServiceType::ECHO).with_costing_fn(|inputs| {
            inputs.max_query_seq_len / 500
        });
        assert_eq!(custom.estimate(&d), 2);
        assert_eq!(custom.capacity(&d), 2);

        let none = ProviderService::new(ServiceType::ECHO).with_costing_fn(|_| 0);
        assert_eq!(none.capacity(&d), 0);
    }

    #[test]
    fn test_worker_config() {
        assert!(WorkerConfig::default().max_threads >= 1);
        assert_eq!(WorkerConfig::new().with_max_threads(0).max_threads, 1);
    }
}
