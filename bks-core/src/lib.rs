//! BKS Core
//!
//! Protocol-agnostic transport building blocks:
//! - Connection actor with split read/write pumps (`actor`)
//! - Segmented receive buffer (`buffer`)
//! - Endpoint options and reconnect backoff (`options`, `reconnect`)
//! - TCP and timeout helpers (`tcp`, `timeout`)
//! - Error types (`error`)

// The tcp module needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
pub mod actor;
pub mod buffer;
pub mod error;
pub mod options;
pub mod reconnect;
pub mod tcp;
pub mod timeout;

pub mod prelude {
    pub use crate::actor::{spawn_connection, ConnEvent, ConnHandle, ConnId, WriteCmd};
    pub use crate::buffer::RecvBuffer;
    pub use crate::error::{BksError, Result};
    pub use crate::options::EndpointOptions;
    pub use crate::reconnect::{ReconnectError, ReconnectState};
    pub use crate::tcp::{enable_tcp_nodelay, shutdown_stream};
}
