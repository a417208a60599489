//! # BKS
//!
//! A job-distribution framework: a coordinator hands method calls on remote
//! class instances to pools of workers over TCP.
//!
//! ## Architecture
//!
//! - **`bks-core`**: connection tasks, endpoint options, reconnect backoff,
//!   error types
//! - **`bks-wire`**: pure state machines and codecs (sans-IO): frames,
//!   sequencing and flow control, job identifiers, negotiation records
//! - **`bks`**: the two endpoints (this crate)
//!
//! A [`coordinator::Coordinator`] listens for workers and negotiates one
//! session per connection. Application threads submit jobs and poll for
//! their results; the coordinator sends each job to the least busy session
//! of its service type. A [`worker::Worker`] connects, offers the service
//! it can supply with a capacity estimate and runs incoming jobs on a pool
//! of execution threads.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bks::coordinator::{Coordinator, Job, ServiceConfig};
//! use bks::worker::{HandlerTable, ProviderService, Worker};
//! use bks::wire::messages::ServiceType;
//! use bks::Bytes;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::new(Default::default());
//! coordinator.register_service(ServiceConfig::new(ServiceType::ECHO))?;
//! let addr = coordinator.start("127.0.0.1:0".parse()?)?;
//!
//! let worker = Worker::new(addr).with_service(
//!     ProviderService::new(ServiceType::ECHO),
//!     HandlerTable::new(|_: &[u8], _: &[u8]| Ok(()))
//!         .with_method(3, |_: &mut (), _: &[u8], data: &[u8]| Ok(Bytes::copy_from_slice(data))),
//! );
//! let _thread = worker.spawn()?;
//!
//! let submission = coordinator.submit(Job::construct(ServiceType::ECHO))?;
//! println!("construct: {submission:?}");
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub use bks_wire as wire;
pub use bytes::Bytes;

pub mod coordinator;
pub mod dev_tracing;
pub mod worker;

pub mod prelude {
    pub use crate::coordinator::{
        Coordinator, Job, JobResult, JobStatus, PollError, ServiceConfig, SubmitError, Submission,
    };
    pub use crate::worker::{
        HandlerTable, JobError, ProviderService, ShutdownHandle, Worker, WorkerConfig, WorkerError,
    };
    pub use bks_core::error::{BksError, Result};
    pub use bks_core::options::EndpointOptions;
    pub use bks_wire::jobid::JobId;
    pub use bks_wire::marshal::{ParamReader, ParamWriter};
    pub use bks_wire::messages::ServiceType;
    pub use bytes::Bytes;
}
