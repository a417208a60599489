//! Execution threads of one worker session
//!
//! Job logic never runs on the dispatcher. Claimed slot indices travel over a
//! flume channel to a fixed set of threads; each thread runs the job against
//! the session's class instances, parks the response in the slot and reports
//! the index back so the dispatcher wakes up.

use super::handlers::HandlerTable;
use super::instances::ClassInstances;
use super::slots::InstanceTable;
use bks_wire::messages::{JobRequest, JobResponse, RESULT_FAILED};
use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// State shared by the dispatcher and the execution threads
pub(crate) struct ExecContext<C> {
    pub(crate) table: InstanceTable,
    classes: Mutex<ClassInstances<C>>,
    handlers: Arc<HandlerTable<C>>,
    max_resp_payload: usize,
}

impl<C> ExecContext<C> {
    pub(crate) fn new(
        session_id: u32,
        instances: u32,
        class_instances: u32,
        handlers: Arc<HandlerTable<C>>,
        max_resp_payload: u32,
    ) -> Self {
        Self {
            table: InstanceTable::new(instances),
            classes: Mutex::new(ClassInstances::new(session_id, class_instances)),
            handlers,
            max_resp_payload: max_resp_payload as usize,
        }
    }

    pub(crate) fn class_instances(&self) -> usize {
        self.classes.lock().len()
    }

    fn run(&self, request: &JobRequest) -> JobResponse {
        let mut response = self.handlers.execute(&self.classes, request);
        if response.encoded_len() > self.max_resp_payload {
            warn!(
                "[POOL] Job {} response of {} bytes exceeds {}",
                request.job_id,
                response.encoded_len(),
                self.max_resp_payload
            );
            response.result_code = RESULT_FAILED;
            response.data = Bytes::new();
        }
        response
    }
}

pub(crate) struct ExecutionPool {
    job_tx: Option<Sender<usize>>,
    threads: Vec<JoinHandle<()>>,
}

impl ExecutionPool {
    /// Start `threads` execution threads. Finished slot indices are sent on
    /// `done_tx`.
    pub(crate) fn start<C: Send + 'static>(
        threads: usize,
        ctx: &Arc<ExecContext<C>>,
        done_tx: &Sender<usize>,
    ) -> io::Result<Self> {
        let (job_tx, job_rx) = flume::unbounded();
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let ctx = Arc::clone(ctx);
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bks-exec-{i}"))
                .spawn(move || exec_loop(&ctx, &job_rx, &done_tx))?;
            handles.push(handle);
        }
        debug!("[POOL] Started {} execution thread(s)", handles.len());
        Ok(Self {
            job_tx: Some(job_tx),
            threads: handles,
        })
    }

    /// Hand a claimed slot to the threads.
    pub(crate) fn submit(&self, slot: usize) -> bool {
        self.job_tx
            .as_ref()
            .is_some_and(|tx| tx.send(slot).is_ok())
    }

    /// Stop accepting work and wait for running jobs to finish.
    #[cfg(test)]
    pub(crate) fn join(mut self) {
        self.job_tx = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        // Closing the channel ends each thread after its current job.
        self.job_tx = None;
        trace!("[POOL] Released {} execution thread(s)", self.threads.len());
    }
}

fn exec_loop<C>(ctx: &ExecContext<C>, job_rx: &Receiver<usize>, done_tx: &Sender<usize>) {
    while let Ok(slot) = job_rx.recv() {
        let Some(request) = ctx.table.take_request(slot) else {
            continue;
        };
        trace!("[POOL] Slot {} running job {}", slot, request.job_id);
        let response = ctx.run(&request);
        ctx.table.finish(slot, response);
        // The dispatcher is gone once the session ended; keep draining.
        let _ = done_tx.send(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::handlers::JobError;
    use bks_wire::jobid::JobId;
    use bks_wire::messages::{METHOD_CONSTRUCT, RESULT_OK};
    use std::time::Duration;

    fn request(id: u64, class_instance_id: u64, method_id: u32) -> JobRequest {
        JobRequest {
            job_id: JobId::from_raw(id),
            class_instance_id,
            method_id,
            params: Bytes::new(),
            data: Bytes::new(),
        }
    }

    fn handlers() -> Arc<HandlerTable<Vec<u8>>> {
        Arc::new(
            HandlerTable::new(|_: &[u8], data: &[u8]| Ok(data.to_vec()))
                .with_method(3, |buf: &mut Vec<u8>, _: &[u8], _: &[u8]| {
                    Ok(Bytes::copy_from_slice(buf))
                })
                .with_method(4, |_: &mut Vec<u8>, _: &[u8], _: &[u8]| {
                    Err(JobError::failed("nope"))
                }),
        )
    }

    #[test]
    fn test_jobs_run_off_thread() {
        let ctx = Arc::new(ExecContext::new(1, 2, 2, handlers(), 1024));
        let (done_tx, done_rx) = flume::unbounded();
        let pool = ExecutionPool::start(2, &ctx, &done_tx).unwrap();

        let mut construct = request(1, 0, METHOD_CONSTRUCT);
        construct.data = Bytes::from_static(b"hello");
        let slot = ctx.table.claim(construct).unwrap();
        assert!(pool.submit(slot));
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), slot);
        let built = ctx.table.take_finished(1).pop().unwrap();
        assert_eq!(built.result_code, RESULT_OK);
        assert_eq!(ctx.class_instances(), 1);

        let slot = ctx
            .table
            .claim(request(2, built.class_instance_id, 3))
            .unwrap();
        assert!(pool.submit(slot));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let echoed = ctx.table.take_finished(1).pop().unwrap();
        assert_eq!(&echoed.data[..], b"hello");

        pool.join();
    }

    #[test]
    fn test_oversized_response_fails() {
        let ctx = Arc::new(ExecContext::new(1, 1, 1, handlers(), 40));
        let (done_tx, done_rx) = flume::unbounded();
        let pool = ExecutionPool::start(1, &ctx, &done_tx).unwrap();

        let mut construct = request(1, 0, METHOD_CONSTRUCT);
        construct.data = Bytes::from(vec![7u8; 64]);
        let slot = ctx.table.claim(construct).unwrap();
        pool.submit(slot);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let handle = ctx.table.take_finished(1).pop().unwrap().class_instance_id;

        let slot = ctx.table.claim(request(2, handle, 3)).unwrap();
        pool.submit(slot);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let response = ctx.table.take_finished(1).pop().unwrap();
        assert_eq!(response.result_code, RESULT_FAILED);
        assert!(response.data.is_empty());

        pool.join();
    }
}
