//! Worker (provider side)
//!
//! A worker connects to a coordinator, offers one of its services and runs
//! the jobs it receives on a pool of execution threads. When the session
//! ends it reconnects with exponential backoff; class instances and the
//! execution pool belong to one session and are dropped with it.
//!
//! ```rust,no_run
//! use bks::worker::{HandlerTable, ProviderService, Worker};
//! use bks::wire::messages::ServiceType;
//! use bks::Bytes;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let echo = HandlerTable::new(|_params: &[u8], _data: &[u8]| Ok(()))
//!     .with_method(3, |_: &mut (), _params: &[u8], data: &[u8]| {
//!         Ok(Bytes::copy_from_slice(data))
//!     });
//! let worker = Worker::new("127.0.0.1:7070".parse()?)
//!     .with_service(ProviderService::new(ServiceType::ECHO), echo);
//! let shutdown = worker.shutdown_handle();
//! let thread = worker.spawn()?;
//! // ...
//! shutdown.shutdown();
//! thread.join().ok();
//! # Ok(())
//! # }
//! ```

mod config;
mod costing;
mod dispatcher;
mod handlers;
mod instances;
mod negotiation;
mod pool;
mod slots;

pub use config::{CostingFn, ProviderService, WorkerConfig};
pub use costing::{CostingInputs, CostingParams};
pub use handlers::{HandlerTable, JobError};

use bks_core::error::{BksError, Result};
use bks_core::options::EndpointOptions;
use bks_core::reconnect::{ReconnectError, ReconnectState};
use bks_core::tcp::enable_tcp_nodelay;
use bks_core::timeout::connect_with_timeout;
use dispatcher::{serve, SessionEnd};
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use negotiation::negotiate;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why [`Worker::run`] stopped
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Endpoint(#[from] BksError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Stops a running worker from any thread.
///
/// An established session sends terminate to the coordinator before the
/// worker returns.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown was requested.
    pub(crate) async fn wait(&self) {
        while !self.is_shutdown() {
            if self.rx.recv_async().await.is_err() {
                return;
            }
        }
    }
}

/// A provider endpoint serving class type `C`
pub struct Worker<C> {
    coordinator: SocketAddr,
    services: Vec<ProviderService>,
    handlers: Vec<Arc<HandlerTable<C>>>,
    config: WorkerConfig,
    options: EndpointOptions,
    shutdown: ShutdownHandle,
}

impl<C> std::fmt::Debug for Worker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("coordinator", &self.coordinator)
            .field("services", &self.services)
            .field("config", &self.config)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> Worker<C> {
    #[must_use]
    pub fn new(coordinator: SocketAddr) -> Self {
        Self {
            coordinator,
            services: Vec::new(),
            handlers: Vec::new(),
            config: WorkerConfig::default(),
            options: EndpointOptions::default(),
            shutdown: ShutdownHandle::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: EndpointOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Offer `service`, running its jobs with `handlers`.
    ///
    /// Services registered first win when the coordinator lists several
    /// matching entries at the same priority.
    #[must_use]
    pub fn with_service(mut self, service: ProviderService, handlers: HandlerTable<C>) -> Self {
        self.services.push(service);
        self.handlers.push(Arc::new(handlers));
        self
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve sessions until shutdown, reconnecting after each one.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Reconnect`] once no session could be established for
    /// `max_connect_wait`, or [`WorkerError::Endpoint`] for unrecoverable
    /// errors such as a missing service.
    pub async fn run(&self) -> std::result::Result<(), WorkerError> {
        if self.services.is_empty() {
            return Err(BksError::config("worker has no services").into());
        }
        let mut reconnect = ReconnectState::new(&self.options);
        info!("[WORKER] Serving coordinator at {}", self.coordinator);

        while !self.shutdown.is_shutdown() {
            match self.session(&mut reconnect).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Terminated) => {}
                Err(e) if !e.is_recoverable() => return Err(e.into()),
                Err(e) if e.is_connection_error() => info!("[WORKER] Lost coordinator: {}", e),
                Err(e) => warn!("[WORKER] Session ended: {}", e),
            }
            if self.shutdown.is_shutdown() {
                break;
            }

            reconnect.record_failure(Instant::now())?;
            let delay = reconnect.next_delay();
            debug!(
                "[WORKER] Reconnecting in {:?} (attempt {})",
                delay,
                reconnect.attempt()
            );
            let stopped = select! {
                () = compio::time::sleep(delay).fuse() => false,
                () = self.shutdown.wait().fuse() => true,
            };
            if stopped {
                break;
            }
        }
        info!("[WORKER] Stopped");
        Ok(())
    }

    /// Connect, negotiate and serve one session.
    async fn session(&self, reconnect: &mut ReconnectState) -> Result<SessionEnd> {
        let mut stream =
            connect_with_timeout(self.coordinator, self.options.connect_timeout).await?;
        if self.options.tcp_nodelay {
            if let Err(e) = enable_tcp_nodelay(&stream) {
                debug!("[WORKER] Failed to set TCP_NODELAY: {}", e);
            }
        }

        let session = negotiate(&mut stream, &self.services, &self.options).await?;
        reconnect.reset();
        info!(
            "[WORKER] Session {} established: type {} instances {} class instances {}",
            session.session_id,
            session.service_type,
            session.max_instances,
            session.max_class_instances
        );
        let Some(handlers) = self.handlers.get(session.service_index) else {
            return Err(BksError::config("negotiated service has no handlers"));
        };
        serve(
            stream,
            session,
            Arc::clone(handlers),
            self.config.max_threads,
            &self.options,
            &self.shutdown,
        )
        .await
    }

    /// Run the worker on its own thread with its own runtime.
    ///
    /// # Errors
    ///
    /// Thread creation failures.
    pub fn spawn(self) -> std::io::Result<JoinHandle<std::result::Result<(), WorkerError>>> {
        std::thread::Builder::new()
            .name("bks-worker".to_string())
            .spawn(move || {
                let runtime = compio::runtime::Runtime::new().map_err(BksError::from)?;
                runtime.block_on(self.run())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bks_wire::messages::ServiceType;
    use compio::net::TcpListener;
    use std::time::Duration;

    fn worker(addr: SocketAddr) -> Worker<()> {
        Worker::new(addr).with_service(
            ProviderService::new(ServiceType::ECHO),
            HandlerTable::new(|_: &[u8], _: &[u8]| Ok(())),
        )
    }

    #[compio::test]
    async fn test_gives_up_after_max_wait() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let options = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(10))
            .with_reconnect_ivl_max(Duration::from_millis(40))
            .with_max_connect_wait(Some(Duration::from_millis(200)));

        let result = worker(addr).with_options(options).run().await;
        assert!(matches!(
            result,
            Err(WorkerError::Reconnect(ReconnectError::MaxWaitExceeded { .. }))
        ));
    }

    #[compio::test]
    async fn test_no_services() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = Worker::<()>::new(addr).run().await;
        assert!(matches!(result, Err(WorkerError::Endpoint(BksError::Config(_)))));
    }

    #[compio::test]
    async fn test_shutdown_stops_reconnecting() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let options = EndpointOptions::default().with_reconnect_ivl(Duration::from_secs(30));
        let worker = worker(addr).with_options(options);
        let handle = worker.shutdown_handle();

        let stopper = async {
            compio::time::sleep(Duration::from_millis(50)).await;
            handle.shutdown();
        };
        let (result, ()) = futures::join!(worker.run(), stopper);
        assert!(result.is_ok());
        assert!(handle.is_shutdown());
    }
}
