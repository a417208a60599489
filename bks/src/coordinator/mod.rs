//! Coordinator (requester side)
//!
//! The coordinator listens for workers, negotiates one session per
//! connection and dispatches submitted jobs to the least busy session of the
//! requested service type.
//!
//! The I/O loop runs on a dedicated thread with its own compio runtime.
//! [`Coordinator`] itself is `Send + Sync`: any thread may submit and poll,
//! which only takes the registry lock briefly and wakes the loop.
//!
//! ```rust,no_run
//! use bks::coordinator::{Coordinator, Job, JobStatus, ServiceConfig};
//! use bks::wire::messages::ServiceType;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::new(Default::default());
//! coordinator.register_service(ServiceConfig::new(ServiceType::ECHO))?;
//! let addr = coordinator.start("127.0.0.1:7070".parse()?)?;
//! println!("listening on {addr}");
//!
//! if let Some(job_id) = coordinator.submit(Job::construct(ServiceType::ECHO))?.job_id() {
//!     while coordinator.poll(job_id)?.is_pending() {
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod ids;
mod io_loop;
mod job;
mod negotiation;
mod registry;

pub use config::ServiceConfig;
pub use job::{Job, JobResult, JobStatus, PollError, SubmitError, Submission};
pub use registry::{ClassInstanceCount, Registry, RegistryError, ResponseError, SessionInfo};

use bks_core::error::{BksError, Result};
use bks_core::options::EndpointOptions;
use bks_wire::jobid::JobId;
use bks_wire::messages::ServiceType;
use compio::net::TcpListener;
use flume::{Receiver, Sender};
use io_loop::CoordinatorLoop;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Handle to a coordinator endpoint.
///
/// Dropping the handle shuts the endpoint down.
#[derive(Debug)]
pub struct Coordinator {
    registry: Arc<Registry>,
    options: EndpointOptions,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(options: EndpointOptions) -> Self {
        // One pending wake-up is enough; the loop drains all work per wake.
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            registry: Arc::new(Registry::new()),
            options,
            wake_tx,
            wake_rx,
            thread: Mutex::new(None),
        }
    }

    /// The shared registry, for status queries.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a service type. Types may be added after `start`.
    ///
    /// # Errors
    ///
    /// See [`Registry::register_type`].
    pub fn register_service(&self, config: ServiceConfig) -> std::result::Result<(), RegistryError> {
        self.registry.register_type(config)
    }

    /// Bind `addr` and start the I/O thread. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Bind failures, thread or runtime creation failures, or `Config` when
    /// already started.
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(BksError::config("coordinator already started"));
        }
        if self.registry.is_closed() {
            return Err(BksError::config("coordinator was shut down"));
        }

        let (ready_tx, ready_rx) = flume::bounded::<std::io::Result<SocketAddr>>(1);
        let registry = Arc::clone(&self.registry);
        let options = self.options.clone();
        let wake_rx = self.wake_rx.clone();

        let handle = std::thread::Builder::new()
            .name("bks-coordinator".to_string())
            .spawn(move || {
                let runtime = match compio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match TcpListener::bind(addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    match listener.local_addr() {
                        Ok(local) => {
                            let _ = ready_tx.send(Ok(local));
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    }
                    CoordinatorLoop::new(registry, options, listener, wake_rx)
                        .run()
                        .await;
                });
            })?;

        let local = ready_rx.recv().map_err(|_| BksError::ChannelRecv)??;
        info!("[COORD] Listening on {}", local);
        *thread = Some(handle);
        Ok(local)
    }

    /// Queue a job and wake the I/O loop.
    ///
    /// # Errors
    ///
    /// See [`Registry::submit`].
    pub fn submit(&self, job: Job) -> std::result::Result<Submission, SubmitError> {
        let submission = self.registry.submit(job)?;
        if let Submission::Queued(job_id) = submission {
            debug!("[COORD] Submitted job {}", job_id);
            self.wake();
        }
        Ok(submission)
    }

    /// Poll a job; a completed result is handed out once.
    ///
    /// # Errors
    ///
    /// [`PollError::NoLongerExists`] for collected jobs and lost sessions.
    pub fn poll(&self, job_id: JobId) -> std::result::Result<JobStatus, PollError> {
        self.registry.poll(job_id, false)
    }

    /// Poll a job, leaving a completed result in place.
    ///
    /// # Errors
    ///
    /// [`PollError::NoLongerExists`] for collected jobs and lost sessions.
    pub fn poll_retain(&self, job_id: JobId) -> std::result::Result<JobStatus, PollError> {
        self.registry.poll(job_id, true)
    }

    #[must_use]
    pub fn num_sessions(&self, service_type: Option<ServiceType>) -> u32 {
        self.registry.num_sessions(service_type)
    }

    #[must_use]
    pub fn num_instances(&self, service_type: Option<ServiceType>) -> u32 {
        self.registry.num_instances(service_type)
    }

    #[must_use]
    pub fn class_instances(&self, service_type: Option<ServiceType>) -> ClassInstanceCount {
        self.registry.class_instances(service_type)
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.sessions()
    }

    #[must_use]
    pub fn responses_ready(&self) -> usize {
        self.registry.responses_ready()
    }

    /// Terminate every session, close the listener and join the I/O thread.
    pub fn shutdown(&self) {
        self.registry.close();
        self.wake();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                debug!("[COORD] I/O thread panicked");
            }
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
