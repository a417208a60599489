//! End-to-end tests: a coordinator and real workers on loopback.
//!
//! Each endpoint runs on its own thread with its own runtime; the test body
//! drives the coordinator through its blocking submit/poll API.

use bks::coordinator::{Coordinator, Job, JobResult, JobStatus, ServiceConfig, SubmitError};
use bks::prelude::*;
use bks::wire::messages::RESULT_UNKNOWN_METHOD;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const APPEND: u32 = 3;

/// Instances hold a prefix given at construction; `APPEND` returns
/// prefix + data.
fn prefix_handlers() -> HandlerTable<Vec<u8>> {
    HandlerTable::new(|params: &[u8], _: &[u8]| {
        let prefix = ParamReader::new(Bytes::copy_from_slice(params)).get_bytes()?;
        Ok(prefix.to_vec())
    })
    .with_method(APPEND, |prefix: &mut Vec<u8>, _: &[u8], data: &[u8]| {
        let mut out = prefix.clone();
        out.extend_from_slice(data);
        Ok(Bytes::from(out))
    })
}

fn options() -> EndpointOptions {
    EndpointOptions::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_reconnect_ivl(Duration::from_millis(20))
        .with_reconnect_ivl_max(Duration::from_millis(200))
}

fn start_coordinator(config: ServiceConfig) -> (Coordinator, SocketAddr) {
    bks::dev_tracing::init_tracing();
    let coordinator = Coordinator::new(options());
    coordinator.register_service(config).unwrap();
    let addr = coordinator.start("127.0.0.1:0".parse().unwrap()).unwrap();
    (coordinator, addr)
}

fn prefix_worker(addr: SocketAddr, instances: u32, class_instances: u32) -> Worker<Vec<u8>> {
    Worker::new(addr)
        .with_options(options())
        .with_config(WorkerConfig::new().with_max_threads(2))
        .with_service(
            ProviderService::new(ServiceType::ECHO)
                .with_max_instances(instances)
                .with_max_class_instances(class_instances),
            prefix_handlers(),
        )
}

fn wait_until<T>(what: &str, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Submit until an instance is free, then wait for the result.
fn complete(coordinator: &Coordinator, job: &Job) -> JobResult {
    let job_id = wait_until("a free instance", || {
        coordinator.submit(job.clone()).unwrap().job_id()
    });
    wait_until("the job result", || match coordinator.poll(job_id).unwrap() {
        JobStatus::Completed(result) => Some(result),
        JobStatus::Pending => None,
    })
}

fn construct(prefix: &[u8]) -> Job {
    let mut params = ParamWriter::new();
    params.put_bytes(prefix);
    Job::construct(ServiceType::ECHO).with_params(params.finish())
}

#[test]
fn test_construct_call_destruct() {
    let (coordinator, addr) = start_coordinator(
        ServiceConfig::new(ServiceType::ECHO)
            .with_instances(1, 4)
            .with_class_instances(0, 4),
    );
    let worker = prefix_worker(addr, 4, 4);
    let shutdown = worker.shutdown_handle();
    let thread = worker.spawn().unwrap();

    let built = complete(&coordinator, &construct(b"re: "));
    assert!(built.is_ok());
    let handle = built.class_instance_id;
    assert_ne!(handle, 0);
    assert_eq!(coordinator.num_sessions(Some(ServiceType::ECHO)), 1);
    assert_eq!(coordinator.num_instances(Some(ServiceType::ECHO)), 4);
    assert_eq!(coordinator.class_instances(None).committed, 1);

    let call = Job::call(ServiceType::ECHO, handle, APPEND).with_data(Bytes::from_static(b"hello"));
    let echoed = complete(&coordinator, &call);
    assert!(echoed.is_ok());
    assert_eq!(echoed.class_instance_id, handle);
    assert_eq!(&echoed.data[..], b"re: hello");

    let unknown = complete(&coordinator, &Job::call(ServiceType::ECHO, handle, 99));
    assert_eq!(unknown.result_code, RESULT_UNKNOWN_METHOD);

    let destroyed = complete(&coordinator, &Job::destruct(ServiceType::ECHO, handle));
    assert!(destroyed.is_ok());
    assert_eq!(destroyed.class_instance_id, 0);
    assert_eq!(
        coordinator.submit(call),
        Err(SubmitError::InstanceGone(handle))
    );

    shutdown.shutdown();
    thread.join().unwrap().unwrap();
    wait_until("session teardown", || {
        (coordinator.num_sessions(None) == 0).then_some(())
    });
}

#[test]
fn test_class_instance_ceiling_is_negotiated() {
    let (coordinator, addr) = start_coordinator(
        ServiceConfig::new(ServiceType::ECHO)
            .with_instances(1, 4)
            .with_class_instances(0, 4),
    );
    // The worker offers a single class instance.
    let worker = prefix_worker(addr, 4, 1);
    let shutdown = worker.shutdown_handle();
    let thread = worker.spawn().unwrap();

    let first = complete(&coordinator, &construct(b"a"));
    assert!(first.is_ok());
    assert_eq!(coordinator.class_instances(None).committed, 1);

    // The coordinator already knows the session is full of class instances.
    assert_eq!(
        coordinator.submit(construct(b"b")).unwrap(),
        bks::coordinator::Submission::Busy
    );

    shutdown.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_worker_loss_invalidates_handles() {
    let (coordinator, addr) = start_coordinator(
        ServiceConfig::new(ServiceType::ECHO).with_instances(1, 2),
    );
    let worker = prefix_worker(addr, 2, 2);
    let shutdown = worker.shutdown_handle();
    let thread = worker.spawn().unwrap();

    let handle = complete(&coordinator, &construct(b"x")).class_instance_id;
    shutdown.shutdown();
    thread.join().unwrap().unwrap();
    wait_until("session teardown", || {
        (coordinator.num_sessions(None) == 0).then_some(())
    });

    assert_eq!(
        coordinator.submit(Job::call(ServiceType::ECHO, handle, APPEND)),
        Err(SubmitError::InstanceGone(handle))
    );
    assert!(coordinator.submit(construct(b"y")).unwrap().is_busy());

    // A new worker picks up where the old one left off.
    let worker = prefix_worker(addr, 2, 2);
    let shutdown = worker.shutdown_handle();
    let thread = worker.spawn().unwrap();
    let rebuilt = complete(&coordinator, &construct(b"y"));
    assert!(rebuilt.is_ok());
    assert_ne!(rebuilt.class_instance_id, handle);

    shutdown.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_jobs_spread_over_workers() {
    let (coordinator, addr) = start_coordinator(
        ServiceConfig::new(ServiceType::ECHO)
            .with_instances(1, 2)
            .with_max_sessions(2),
    );
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let worker = prefix_worker(addr, 2, 2);
            let shutdown = worker.shutdown_handle();
            (shutdown, worker.spawn().unwrap())
        })
        .collect();
    wait_until("both sessions", || {
        (coordinator.num_sessions(Some(ServiceType::ECHO)) == 2).then_some(())
    });

    // Four constructs fit only when both sessions take two each.
    let ids: Vec<_> = (0..4)
        .map(|i| {
            coordinator
                .submit(construct(format!("{i}").as_bytes()))
                .unwrap()
                .job_id()
                .expect("an instance is free")
        })
        .collect();
    assert!(coordinator.submit(construct(b"5")).unwrap().is_busy());

    let mut sessions = std::collections::HashSet::new();
    for id in ids {
        let result = wait_until("construct result", || match coordinator.poll(id).unwrap() {
            JobStatus::Completed(result) => Some(result),
            JobStatus::Pending => None,
        });
        assert!(result.is_ok());
        sessions.insert(bks::wire::jobid::class_handle_session(result.class_instance_id));
    }
    assert_eq!(sessions.len(), 2);

    for (shutdown, thread) in workers {
        shutdown.shutdown();
        thread.join().unwrap().unwrap();
    }
}
