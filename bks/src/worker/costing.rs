//! Capacity estimation
//!
//! A worker offers as many job instances as its resources allow for the
//! limits the coordinator asks for. The default estimate divides a resource
//! budget by a weighted cost of one job's payloads and alignment matrix.

use bks_wire::messages::ServiceDetail;

/// Request limits the estimate is based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostingInputs {
    pub max_query_seq_len: u32,
    pub max_targ_seq_len: u32,
    pub max_req_payload: u32,
    pub max_resp_payload: u32,
}

impl From<&ServiceDetail> for CostingInputs {
    fn from(detail: &ServiceDetail) -> Self {
        Self {
            max_query_seq_len: detail.max_query_seq_len,
            max_targ_seq_len: detail.max_targ_seq_len,
            max_req_payload: detail.max_req_payload,
            max_resp_payload: detail.max_resp_payload,
        }
    }
}

/// Weights of the default estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostingParams {
    pub scale_payload: f64,
    pub scale_targ_len: f64,
    pub scale_query_len: f64,
    pub scale_scaled_targ_query: f64,
    /// Resource budget shared by all instances
    pub avail_resources: f64,
}

impl Default for CostingParams {
    fn default() -> Self {
        Self {
            scale_payload: 1.0,
            scale_targ_len: 1.0,
            scale_query_len: 1.0,
            scale_scaled_targ_query: 0.05,
            avail_resources: 256e9,
        }
    }
}

const MIN_DIVISOR: f64 = 0.0001;

impl CostingParams {
    /// Instances affordable for `inputs`.
    #[must_use]
    pub fn instances(&self, inputs: &CostingInputs) -> u32 {
        let payload = f64::from(inputs.max_req_payload) + f64::from(inputs.max_resp_payload);
        let query = f64::from(inputs.max_query_seq_len) * self.scale_query_len;
        let targ = f64::from(inputs.max_targ_seq_len) * self.scale_targ_len;
        let divisor = (self.scale_payload * payload + self.scale_scaled_targ_query * (query * targ))
            .max(MIN_DIVISOR);
        // Float to int casts saturate.
        ((self.avail_resources + 0.5) / divisor) as u32
    }
}
