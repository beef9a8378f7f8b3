// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process-wide kernel state: the object tables, the unique-id allocator and
//! the monotonic microsecond clock.
//!
//! The tables sit behind a single table-level lock, distinct from the lock
//! each object carries for its own state. Lookups clone the object's `Arc`
//! and drop the table lock before touching the object, so table traffic never
//! serializes primitive operations.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as HostMutex, MutexGuard};
use std::time::Instant;

use hashbrown::HashMap;

use crate::attr::ObjectAttr;
use crate::condvar::Condvar;
use crate::error::SyncError;
use crate::event::SimpleEvent;
use crate::eventflag::EventFlag;
use crate::msgpipe::MsgPipe;
use crate::mutex::Mutex;
use crate::park::lock;
use crate::rwlock::RwLock;
use crate::semaphore::Semaphore;
use crate::thread::ThreadHandle;
use crate::timer::Timer;

/// Unique handle for kernel objects and threads. Always positive.
pub type Uid = i32;

/// Longest allowed object name, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Distinguishes the full-featured mutex/condvar family from its lightweight
/// twin. The two share their state machines and differ only in which tables
/// and error codes they use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    Heavy,
    Light,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) threads: HashMap<Uid, Arc<ThreadHandle>>,
    pub(crate) mutexes: HashMap<Uid, Arc<Mutex>>,
    pub(crate) lwmutexes: HashMap<Uid, Arc<Mutex>>,
    pub(crate) semaphores: HashMap<Uid, Arc<Semaphore>>,
    pub(crate) condvars: HashMap<Uid, Arc<Condvar>>,
    pub(crate) lwcondvars: HashMap<Uid, Arc<Condvar>>,
    pub(crate) rwlocks: HashMap<Uid, Arc<RwLock>>,
    pub(crate) eventflags: HashMap<Uid, Arc<EventFlag>>,
    pub(crate) simple_events: HashMap<Uid, Arc<SimpleEvent>>,
    pub(crate) timers: HashMap<Uid, Arc<Timer>>,
    pub(crate) msgpipes: HashMap<Uid, Arc<MsgPipe>>,
}

/// The synchronization kernel. One per emulated process.
pub struct Kernel {
    tables: HostMutex<Tables>,
    next_uid: AtomicI32,
    epoch: Instant,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            tables: HostMutex::new(Tables::default()),
            next_uid: AtomicI32::new(1),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn next_uid(&self) -> Uid {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Microseconds since the kernel was created. Monotonic; feeds timeout
    /// and timer-deadline arithmetic.
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    /// Registers a guest thread with the scheduler-facing fields this crate
    /// consumes, returning its handle.
    pub fn register_thread(&self, name: &str, priority: i32) -> Arc<ThreadHandle> {
        let uid = self.next_uid();
        let thread = Arc::new(ThreadHandle::new(uid, name, priority));
        self.tables().threads.insert(uid, Arc::clone(&thread));
        thread
    }

    pub fn get_thread(&self, uid: Uid) -> Result<Arc<ThreadHandle>, SyncError> {
        self.tables()
            .threads
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownThreadId)
    }

    /// Removes a finished thread from the table. The scheduler guarantees the
    /// thread no longer waits on anything when it calls this.
    pub fn unregister_thread(&self, uid: Uid) {
        self.tables().threads.remove(&uid);
    }

    pub(crate) fn check_name(name: &str, attr: ObjectAttr) -> Result<(), SyncError> {
        if name.len() > MAX_NAME_LEN && attr.contains(ObjectAttr::NAME_REQUIRED) {
            return Err(SyncError::UidNameTooLong);
        }
        Ok(())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_unique_and_positive() {
        let kernel = Kernel::new();
        let a = kernel.register_thread("a", 160);
        let b = kernel.register_thread("b", 160);
        assert!(a.uid() > 0);
        assert_ne!(a.uid(), b.uid());
        assert_eq!(kernel.get_thread(a.uid()).unwrap().uid(), a.uid());
    }

    #[test]
    fn name_limit_is_enforced_only_when_required() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            Kernel::check_name(&long, ObjectAttr::NAME_REQUIRED),
            Err(SyncError::UidNameTooLong)
        );
        assert_eq!(Kernel::check_name(&long, ObjectAttr::empty()), Ok(()));
        let exact = "x".repeat(MAX_NAME_LEN);
        assert_eq!(Kernel::check_name(&exact, ObjectAttr::NAME_REQUIRED), Ok(()));
    }

    #[test]
    fn clock_is_monotonic_microseconds() {
        let kernel = Kernel::new();
        let a = kernel.now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = kernel.now_us();
        assert!(b >= a + 1_000);
    }
}
