//! Frame payloads
//!
//! Every payload is little-endian with no padding. Decoders check exact
//! lengths; a payload that is too short or has trailing bytes is malformed.

use crate::codec::{FrameError, Result};
use crate::jobid::JobId;
use crate::limits::{self, MAX_SERVICE_TYPES};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Service type identifier (1..=15 registrable, 0 = undefined)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServiceType(pub u8);

impl ServiceType {
    pub const UNDEFINED: Self = Self(0);
    pub const SMITH_WATERMAN: Self = Self(1);
    pub const ECHO: Self = Self(2);

    #[inline]
    #[must_use]
    pub const fn is_defined(self) -> bool {
        self.0 != 0 && self.0 as usize <= MAX_SERVICE_TYPES
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNDEFINED => f.write_str("undefined"),
            Self::SMITH_WATERMAN => f.write_str("smith-waterman"),
            Self::ECHO => f.write_str("echo"),
            Self(other) => write!(f, "type-{other}"),
        }
    }
}

/// Job completed successfully
pub const RESULT_OK: u32 = 0;
/// Generic failure
pub const RESULT_FAILED: u32 = 1;
/// Method id has no registered handler
pub const RESULT_UNKNOWN_METHOD: u32 = 2;
/// Class instance handle unknown to the worker
pub const RESULT_NO_CLASS_INSTANCE: u32 = 3;
/// Every job instance of the worker is busy
pub const RESULT_PROVIDER_BUSY: u32 = 4;
/// Class instance table is full
pub const RESULT_CLASS_LIMIT: u32 = 5;

/// Reserved method: create a class instance, response carries its handle
pub const METHOD_CONSTRUCT: u32 = 1;
/// Reserved method: destroy a class instance, response carries handle 0
pub const METHOD_DESTRUCT: u32 = 2;

fn need(src: &impl Buf, n: usize, what: &'static str) -> Result<()> {
    if src.remaining() < n {
        return Err(FrameError::Malformed(what));
    }
    Ok(())
}

fn finish(src: &impl Buf, what: &'static str) -> Result<()> {
    if src.has_remaining() {
        return Err(FrameError::Malformed(what));
    }
    Ok(())
}

/// Negotiation limits of one service type, as sent by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDetail {
    pub service_type: ServiceType,
    pub min_provider_version: u32,
    pub max_provider_version: u32,
    pub keepalive_secs: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    pub min_class_instances: u32,
    pub max_class_instances: u32,
    pub max_proc_secs: u32,
    pub max_param_len: u32,
    pub max_query_seq_len: u32,
    pub max_targ_seq_len: u32,
    pub max_req_payload: u32,
    pub max_resp_payload: u32,
    pub priority: u32,
}

impl ServiceDetail {
    pub const ENCODED_LEN: usize = 1 + 14 * 4;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::ENCODED_LEN);
        dst.put_u8(self.service_type.0);
        for v in [
            self.min_provider_version,
            self.max_provider_version,
            self.keepalive_secs,
            self.min_instances,
            self.max_instances,
            self.min_class_instances,
            self.max_class_instances,
            self.max_proc_secs,
            self.max_param_len,
            self.max_query_seq_len,
            self.max_targ_seq_len,
            self.max_req_payload,
            self.max_resp_payload,
            self.priority,
        ] {
            dst.put_u32_le(v);
        }
    }

    fn decode_from(src: &mut impl Buf) -> Result<Self> {
        need(&*src, Self::ENCODED_LEN, "service detail truncated")?;
        Ok(Self {
            service_type: ServiceType(src.get_u8()),
            min_provider_version: src.get_u32_le(),
            max_provider_version: src.get_u32_le(),
            keepalive_secs: src.get_u32_le(),
            min_instances: src.get_u32_le(),
            max_instances: src.get_u32_le(),
            min_class_instances: src.get_u32_le(),
            max_class_instances: src.get_u32_le(),
            max_proc_secs: src.get_u32_le(),
            max_param_len: src.get_u32_le(),
            max_query_seq_len: src.get_u32_le(),
            max_targ_seq_len: src.get_u32_le(),
            max_req_payload: src.get_u32_le(),
            max_resp_payload: src.get_u32_le(),
            priority: src.get_u32_le(),
        })
    }
}

/// The service types a coordinator is prepared to accept
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestServices {
    pub services: SmallVec<[ServiceDetail; 4]>,
}

impl RequestServices {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(4 + self.services.len() * ServiceDetail::ENCODED_LEN);
        dst.put_u32_le(self.services.len() as u32);
        for detail in &self.services {
            detail.encode(dst);
        }
    }

    /// # Errors
    ///
    /// `Malformed` unless at most 15 entries are present with no trailing
    /// bytes. An empty list is valid: every type is full.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        need(&src, 4, "service list truncated")?;
        let num = src.get_u32_le() as usize;
        if num > MAX_SERVICE_TYPES {
            return Err(FrameError::Malformed("service count out of range"));
        }
        let mut services = SmallVec::with_capacity(num);
        for _ in 0..num {
            services.push(ServiceDetail::decode_from(&mut src)?);
        }
        finish(&src, "trailing bytes after service list")?;
        Ok(Self { services })
    }
}

/// A worker's offer: one service type and its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferedService {
    pub service_type: ServiceType,
    pub service_instances: u32,
    pub class_instances: u32,
    pub costing: u32,
    pub provider_version: u32,
}

impl OfferedService {
    pub const ENCODED_LEN: usize = 1 + 4 * 4;

    /// The offer sent when no requested type can be supplied
    #[must_use]
    pub const fn none() -> Self {
        Self {
            service_type: ServiceType::UNDEFINED,
            service_instances: 0,
            class_instances: 0,
            costing: 0,
            provider_version: limits::PROVIDER_VERSION,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::ENCODED_LEN);
        dst.put_u8(self.service_type.0);
        dst.put_u32_le(self.service_instances);
        dst.put_u32_le(self.class_instances);
        dst.put_u32_le(self.costing);
        dst.put_u32_le(self.provider_version);
    }

    /// # Errors
    ///
    /// `Malformed` unless exactly 17 bytes are present.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.len() != Self::ENCODED_LEN {
            return Err(FrameError::Malformed("offered service length"));
        }
        Ok(Self {
            service_type: ServiceType(src.get_u8()),
            service_instances: src.get_u32_le(),
            class_instances: src.get_u32_le(),
            costing: src.get_u32_le(),
            provider_version: src.get_u32_le(),
        })
    }
}

/// Payload of accept-service and reject-service frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDecision {
    pub service_type: ServiceType,
}

impl ServiceDecision {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.service_type.0);
    }

    /// # Errors
    ///
    /// `Malformed` unless exactly one byte is present.
    pub fn decode(src: Bytes) -> Result<Self> {
        match src[..] {
            [ty] => Ok(Self {
                service_type: ServiceType(ty),
            }),
            _ => Err(FrameError::Malformed("service decision length")),
        }
    }
}

/// A method call against a (possibly absent) class instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub class_instance_id: u64,
    pub method_id: u32,
    pub params: Bytes,
    pub data: Bytes,
}

impl JobRequest {
    pub const FIXED_LEN: usize = 8 + 8 + 4 + 4 + 4;

    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.params.len() + self.data.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i64_le(self.job_id.to_wire());
        dst.put_u64_le(self.class_instance_id);
        dst.put_u32_le(self.method_id);
        dst.put_u32_le(self.params.len() as u32);
        dst.put_u32_le(self.data.len() as u32);
        dst.extend_from_slice(&self.params);
        dst.extend_from_slice(&self.data);
    }

    /// # Errors
    ///
    /// `Malformed` when the declared sizes disagree with the payload length.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        need(&src, Self::FIXED_LEN, "job request truncated")?;
        let job_id = JobId::from_wire(src.get_i64_le());
        let class_instance_id = src.get_u64_le();
        let method_id = src.get_u32_le();
        let param_len = src.get_u32_le() as usize;
        let data_len = src.get_u32_le() as usize;
        if src.len() != param_len.saturating_add(data_len) {
            return Err(FrameError::Malformed("job request sizes"));
        }
        let params = src.split_to(param_len);
        Ok(Self {
            job_id,
            class_instance_id,
            method_id,
            params,
            data: src,
        })
    }
}

/// Outcome of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResponse {
    pub job_id: JobId,
    pub class_instance_id: u64,
    pub method_id: u32,
    pub result_code: u32,
    pub data: Bytes,
}

impl JobResponse {
    pub const FIXED_LEN: usize = 8 + 8 + 4 + 4 + 4;

    /// Immediate reply for a request that found every instance busy
    #[must_use]
    pub fn busy(request: &JobRequest) -> Self {
        Self {
            job_id: request.job_id,
            class_instance_id: request.class_instance_id,
            method_id: request.method_id,
            result_code: RESULT_PROVIDER_BUSY,
            data: Bytes::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.data.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i64_le(self.job_id.to_wire());
        dst.put_u64_le(self.class_instance_id);
        dst.put_u32_le(self.method_id);
        dst.put_u32_le(self.result_code);
        dst.put_u32_le(self.data.len() as u32);
        dst.extend_from_slice(&self.data);
    }

    /// # Errors
    ///
    /// `Malformed` when the declared size disagrees with the payload length.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        need(&src, Self::FIXED_LEN, "job response truncated")?;
        let job_id = JobId::from_wire(src.get_i64_le());
        let class_instance_id = src.get_u64_le();
        let method_id = src.get_u32_le();
        let result_code = src.get_u32_le();
        let data_len = src.get_u32_le() as usize;
        if src.len() != data_len {
            return Err(FrameError::Malformed("job response size"));
        }
        Ok(Self {
            job_id,
            class_instance_id,
            method_id,
            result_code,
            data: src,
        })
    }
}

/// Encode any payload into a fresh buffer
pub fn to_bytes(encode: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    encode(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobid::pack_job_id;

    fn detail(ty: u8) -> ServiceDetail {
        ServiceDetail {
            service_type: ServiceType(ty),
            min_provider_version: 1,
            max_provider_version: 1,
            keepalive_secs: 60,
            min_instances: 1,
            max_instances: 32,
            min_class_instances: 0,
            max_class_instances: 32,
            max_proc_secs: 1200,
            max_param_len: 100,
            max_query_seq_len: 1000,
            max_targ_seq_len: 1000,
            max_req_payload: 5000,
            max_resp_payload: 5000,
            priority: 100,
        }
    }

    #[test]
    fn test_service_list_size() {
        let req = RequestServices {
            services: [detail(1), detail(2)].into_iter().collect(),
        };
        let bytes = to_bytes(|b| req.encode(b));
        assert_eq!(bytes.len(), 4 + 2 * 57);
        assert_eq!(RequestServices::decode(bytes.clone()).unwrap(), req);

        // Truncated and padded lists are both rejected.
        assert!(RequestServices::decode(bytes.slice(..bytes.len() - 1)).is_err());
        let mut padded = BytesMut::from(&bytes[..]);
        padded.put_u8(0);
        assert!(RequestServices::decode(padded.freeze()).is_err());
    }

    #[test]
    fn test_service_count_bounds() {
        let empty = to_bytes(|b| b.put_u32_le(0));
        assert!(RequestServices::decode(empty).unwrap().services.is_empty());
        let too_many = to_bytes(|b| b.put_u32_le(16));
        assert!(RequestServices::decode(too_many).is_err());
    }

    #[test]
    fn test_job_request_split() {
        let req = JobRequest {
            job_id: JobId::from_raw(pack_job_id(3, 1, 2, 2, 1)),
            class_instance_id: 0,
            method_id: 10,
            params: Bytes::from_static(b"pp"),
            data: Bytes::from_static(b"dddd"),
        };
        let bytes = to_bytes(|b| req.encode(b));
        assert_eq!(bytes.len(), JobRequest::FIXED_LEN + 6);
        let back = JobRequest::decode(bytes.clone()).unwrap();
        assert_eq!(&back.params[..], b"pp");
        assert_eq!(&back.data[..], b"dddd");

        assert!(JobRequest::decode(bytes.slice(..bytes.len() - 1)).is_err());
    }

    #[test]
    fn test_busy_response_echoes_request() {
        let req = JobRequest {
            job_id: JobId::from_raw(pack_job_id(9, 4, 1, 1, 2)),
            class_instance_id: 77,
            method_id: 12,
            params: Bytes::new(),
            data: Bytes::from_static(b"ignored"),
        };
        let resp = JobResponse::busy(&req);
        assert_eq!(resp.job_id, req.job_id);
        assert_eq!(resp.class_instance_id, 77);
        assert_eq!(resp.method_id, 12);
        assert_eq!(resp.result_code, RESULT_PROVIDER_BUSY);
        assert!(resp.data.is_empty());
        assert_eq!(to_bytes(|b| resp.encode(b)).len(), JobResponse::FIXED_LEN);
    }

    #[test]
    fn test_decision_and_offer_lengths() {
        assert!(ServiceDecision::decode(Bytes::from_static(&[2, 0])).is_err());
        assert_eq!(
            ServiceDecision::decode(Bytes::from_static(&[0])).unwrap().service_type,
            ServiceType::UNDEFINED
        );
        let offer = OfferedService::none();
        let bytes = to_bytes(|b| offer.encode(b));
        assert_eq!(bytes.len(), OfferedService::ENCODED_LEN);
        assert_eq!(OfferedService::decode(bytes).unwrap(), offer);
    }
}
