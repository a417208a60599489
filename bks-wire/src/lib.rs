//! BKS wire protocol
//!
//! Sans-IO building blocks shared by coordinators and workers:
//! - Frame header codec and sequence arithmetic (`codec`)
//! - Per-connection framing state machine (`connection`)
//! - Job identifier and class-instance handle packing (`jobid`)
//! - Negotiation and job payload records (`messages`)
//! - Typed parameter blocks (`marshal`)
//! - Protocol limits and the default service profile (`limits`)

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod connection;
pub mod jobid;
pub mod limits;
pub mod marshal;
pub mod messages;

pub mod prelude {
    pub use crate::codec::{Frame, FrameError, FrameHeader, FrameType, HEADER_LEN};
    pub use crate::connection::{FrameConnection, RecvState, TxState};
    pub use crate::jobid::{JobId, JobIdError, JobIdParts};
    pub use crate::marshal::{MarshalError, ParamReader, ParamWriter};
    pub use crate::messages::{
        JobRequest, JobResponse, OfferedService, RequestServices, ServiceDecision, ServiceDetail,
        ServiceType,
    };
}
