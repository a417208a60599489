//! Protocol limits and defaults
//!
//! Ranges enforced during service registration and negotiation, and the
//! default service profile (sized for Smith-Waterman alignment jobs).

/// Provider protocol version range accepted by coordinators
pub const MIN_PROVIDER_VERSION: u32 = 1;
pub const MAX_PROVIDER_VERSION: u32 = 1;
/// Version advertised by workers built from this crate
pub const PROVIDER_VERSION: u32 = 1;

/// Service type ids are 1..=15 (4 bits in a job id)
pub const MAX_SERVICE_TYPES: usize = 15;

/// Keepalive bounds (seconds)
pub const MIN_KEEPALIVE_SECS: u32 = 15;
pub const DEFAULT_KEEPALIVE_SECS: u32 = 60;
pub const MAX_KEEPALIVE_SECS: u32 = 600;

/// Concurrently open sessions across all service types; ids are 1..=100
pub const MAX_CONCURRENT_SESSIONS: u32 = 100;
/// Sessions per service type
pub const MAX_SESSIONS_PER_TYPE: u32 = 100;
pub const DEFAULT_SESSIONS_PER_TYPE: u32 = 25;

/// Job instances per session
pub const MIN_SERVICE_INSTANCES: u32 = 1;
pub const DEFAULT_SERVICE_INSTANCES: u32 = 32;
pub const MAX_SERVICE_INSTANCES: u32 = 128;

/// Class instances per session
pub const MAX_CLASS_INSTANCES: u32 = 128;

/// Maximum request id value (24 bits)
pub const MAX_REQ_ID: u32 = 0x00ff_ffff;
/// Request ids that can be outstanding at the same time
pub const MAX_CONCURRENT_REQUESTS: u32 = MAX_CONCURRENT_SESSIONS * MAX_SERVICE_INSTANCES;

/// Absolute payload and sequence ceilings
pub const MAX_PAYLOAD: u32 = 0x03ff_ffff;
pub const MAX_SEQ_LEN: u32 = 0x01ff_ffff;
pub const MAX_PARAM_LEN: u32 = 50_000;

/// Per-job processing time bounds (seconds)
pub const MIN_PROC_SECS: u32 = 120;
pub const MAX_PROC_SECS: u32 = 36_000;

/// Default profile: Smith-Waterman sized jobs
pub const DEFAULT_MAX_QUERY_SEQ_LEN: u32 = 0x0003_ffff;
pub const DEFAULT_MAX_TARG_SEQ_LEN: u32 = 0x0003_ffff;
pub const DEFAULT_MAX_PARAM_LEN: u32 = 0x3fff;
pub const DEFAULT_MAX_REQ_PAYLOAD: u32 =
    DEFAULT_MAX_QUERY_SEQ_LEN + DEFAULT_MAX_TARG_SEQ_LEN + DEFAULT_MAX_PARAM_LEN + 0x0fff;
pub const DEFAULT_MAX_RESP_PAYLOAD: u32 = 0x4fff * 200 * 10 + 0x0fff;
pub const DEFAULT_MAX_PROC_SECS: u32 = 1200;

/// Default negotiation priority of a service type
pub const DEFAULT_PRIORITY: u32 = 100;

/// Frames one side may send beyond the peer's last acknowledged sequence
pub const MAX_FRAMES_AHEAD: u8 = 4;

/// Clamp a requested keepalive into the accepted range.
#[inline]
#[must_use]
pub fn clamp_keepalive(secs: u32) -> u32 {
    secs.clamp(MIN_KEEPALIVE_SECS, MAX_KEEPALIVE_SECS)
}
