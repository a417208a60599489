//! Class instances of one session
//!
//! Handles pack the session id, the table slot and a per-table serial (see
//! `bks_wire::jobid::pack_class_handle`), so a handle from an earlier session
//! or a destroyed instance never resolves to a live one.

use bks_wire::jobid::{pack_class_handle, MAX_HANDLE_SERIAL};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// First serial of a new table. Session ids are reused, so serials start
/// somewhere different for every table.
fn initial_serial() -> u64 {
    static TABLES: AtomicU64 = AtomicU64::new(0);
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let salt = TABLES.fetch_add(1, Ordering::Relaxed) << 24;
    ((clock ^ salt) & MAX_HANDLE_SERIAL).max(1)
}

struct Entry<C> {
    handle: u64,
    instance: Arc<Mutex<C>>,
}

pub(crate) struct ClassInstances<C> {
    session_id: u32,
    entries: Vec<Option<Entry<C>>>,
    len: usize,
    next_serial: u64,
}

impl<C> ClassInstances<C> {
    pub(crate) fn new(session_id: u32, capacity: u32) -> Self {
        Self {
            session_id,
            entries: (0..capacity).map(|_| None).collect(),
            len: 0,
            next_serial: initial_serial(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len >= self.entries.len()
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Store `instance` and return its handle, or give it back when full.
    pub(crate) fn insert(&mut self, instance: C) -> Result<u64, C> {
        let Some(slot) = self.entries.iter().position(Option::is_none) else {
            return Err(instance);
        };
        let serial = self.next_serial;
        self.next_serial = if serial >= MAX_HANDLE_SERIAL { 1 } else { serial + 1 };
        let handle = pack_class_handle(self.session_id, slot as u32, serial);
        self.entries[slot] = Some(Entry {
            handle,
            instance: Arc::new(Mutex::new(instance)),
        });
        self.len += 1;
        Ok(handle)
    }

    fn find(&self, handle: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.handle == handle))
    }

    pub(crate) fn get(&self, handle: u64) -> Option<Arc<Mutex<C>>> {
        self.find(handle)
            .and_then(|slot| self.entries[slot].as_ref())
            .map(|e| Arc::clone(&e.instance))
    }

    /// Remove an instance. A method still running on it keeps it alive
    /// until the call returns.
    pub(crate) fn remove(&mut self, handle: u64) -> Option<Arc<Mutex<C>>> {
        let slot = self.find(handle)?;
        let entry = self.entries[slot].take()?;
        self.len -= 1;
        Some(entry.instance)
    }
}
