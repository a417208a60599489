//! Method handlers
//!
//! A worker serves one class type `C` per service. The constructor builds an
//! instance from the construct request; every other method id maps to a
//! registered handler that runs against one instance.
//!
//! ```rust
//! use bks::worker::HandlerTable;
//! use bks::wire::marshal::ParamReader;
//! use bks::Bytes;
//!
//! struct Counter(u64);
//!
//! let handlers = HandlerTable::new(|_params: &[u8], _data: &[u8]| Ok(Counter(0)))
//!     .with_method(3, |counter: &mut Counter, params: &[u8], _data: &[u8]| {
//!         let step = ParamReader::new(Bytes::copy_from_slice(params)).get_u64()?;
//!         counter.0 += step;
//!         Ok(Bytes::copy_from_slice(&counter.0.to_le_bytes()))
//!     });
//! assert!(handlers.has_method(3));
//! ```

use super::instances::ClassInstances;
use bks_wire::marshal::MarshalError;
use bks_wire::messages::{
    JobRequest, JobResponse, METHOD_CONSTRUCT, METHOD_DESTRUCT, RESULT_CLASS_LIMIT,
    RESULT_FAILED, RESULT_NO_CLASS_INSTANCE, RESULT_OK, RESULT_UNKNOWN_METHOD,
};
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a constructor or method
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid parameters: {0}")]
    InvalidParams(#[from] MarshalError),

    #[error("{0}")]
    Failed(String),

    /// Report a specific non-zero result code
    #[error("failed with code {code}: {message}")]
    Code { code: u32, message: String },
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn with_code(code: u32, msg: impl Into<String>) -> Self {
        Self::Code {
            code,
            message: msg.into(),
        }
    }

    /// Result code sent back for this error; never `RESULT_OK`.
    #[must_use]
    pub const fn result_code(&self) -> u32 {
        match self {
            Self::Code { code, .. } if *code != RESULT_OK => *code,
            _ => RESULT_FAILED,
        }
    }
}

type Constructor<C> = Box<dyn Fn(&[u8], &[u8]) -> Result<C, JobError> + Send + Sync>;
type Method<C> = Box<dyn Fn(&mut C, &[u8], &[u8]) -> Result<Bytes, JobError> + Send + Sync>;

/// Constructor plus method table of one class
pub struct HandlerTable<C> {
    constructor: Constructor<C>,
    methods: HashMap<u32, Method<C>>,
}

impl<C> std::fmt::Debug for HandlerTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.methods.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("HandlerTable").field("methods", &ids).finish()
    }
}

impl<C> HandlerTable<C> {
    pub fn new(
        constructor: impl Fn(&[u8], &[u8]) -> Result<C, JobError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            constructor: Box::new(constructor),
            methods: HashMap::new(),
        }
    }

    /// Register `method` under `method_id`.
    ///
    /// Ids 1 and 2 are construct and destruct; registering them has no
    /// effect. A later registration replaces an earlier one.
    #[must_use]
    pub fn with_method(
        mut self,
        method_id: u32,
        method: impl Fn(&mut C, &[u8], &[u8]) -> Result<Bytes, JobError> + Send + Sync + 'static,
    ) -> Self {
        if method_id == METHOD_CONSTRUCT || method_id == METHOD_DESTRUCT {
            warn!("[WORKER] Method id {} is reserved, handler ignored", method_id);
            return self;
        }
        self.methods.insert(method_id, Box::new(method));
        self
    }

    #[must_use]
    pub fn has_method(&self, method_id: u32) -> bool {
        self.methods.contains_key(&method_id)
    }

    /// Run one request against `classes` and build its response.
    pub(crate) fn execute(
        &self,
        classes: &Mutex<ClassInstances<C>>,
        request: &JobRequest,
    ) -> JobResponse {
        let (class_instance_id, result) = match request.method_id {
            METHOD_CONSTRUCT => self.construct(classes, request),
            METHOD_DESTRUCT => match classes.lock().remove(request.class_instance_id) {
                Some(_) => (0, Ok(Bytes::new())),
                None => (request.class_instance_id, Err(RESULT_NO_CLASS_INSTANCE)),
            },
            method_id => (
                request.class_instance_id,
                self.call(classes, method_id, request),
            ),
        };

        let (result_code, data) = match result {
            Ok(data) => (RESULT_OK, data),
            Err(code) => (code, Bytes::new()),
        };
        JobResponse {
            job_id: request.job_id,
            class_instance_id,
            method_id: request.method_id,
            result_code,
            data,
        }
    }

    fn construct(
        &self,
        classes: &Mutex<ClassInstances<C>>,
        request: &JobRequest,
    ) -> (u64, Result<Bytes, u32>) {
        if classes.lock().is_full() {
            return (0, Err(RESULT_CLASS_LIMIT));
        }
        let instance = match (self.constructor)(&request.params, &request.data) {
            Ok(instance) => instance,
            Err(e) => {
                debug!("[WORKER] Job {} construct failed: {}", request.job_id, e);
                return (0, Err(e.result_code()));
            }
        };
        // Another thread may have filled the table meanwhile.
        match classes.lock().insert(instance) {
            Ok(handle) => (handle, Ok(Bytes::new())),
            Err(_) => (0, Err(RESULT_CLASS_LIMIT)),
        }
    }

    fn call(
        &self,
        classes: &Mutex<ClassInstances<C>>,
        method_id: u32,
        request: &JobRequest,
    ) -> Result<Bytes, u32> {
        let method = self.methods.get(&method_id).ok_or(RESULT_UNKNOWN_METHOD)?;
        let instance = classes
            .lock()
            .get(request.class_instance_id)
            .ok_or(RESULT_NO_CLASS_INSTANCE)?;
        let mut instance = instance.lock();
        method(&mut instance, &request.params, &request.data).map_err(|e| {
            debug!("[WORKER] Job {} method {} failed: {}", request.job_id, method_id, e);
            e.result_code()
        })
    }
}
