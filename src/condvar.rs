// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest condition variables, each bound to one associated mutex.
//!
//! `wait` releases the associated mutex once and re-acquires it with count 1
//! on every exit path — success and timeout alike — so the caller always
//! returns holding the mutex. The condvar shares ownership of its mutex; the
//! mutex knows nothing about its condvars.

use std::sync::{Arc, Mutex as HostMutex};

use log::{error, trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid, Weight};
use crate::mutex::Mutex;
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

/// Which waiters a signal call wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// The queue head only.
    Any,
    /// The entire queue.
    All,
    /// A specific thread's record, if that thread is waiting.
    Specific(Uid),
}

pub(crate) struct Condvar {
    uid: Uid,
    name: String,
    weight: Weight,
    assoc: Arc<Mutex>,
    state: HostMutex<CondvarState>,
}

struct CondvarState {
    waiters: WaitQueue,
}

fn unknown_id(weight: Weight) -> SyncError {
    match weight {
        Weight::Heavy => SyncError::UnknownCondId,
        Weight::Light => SyncError::UnknownLwCondId,
    }
}

impl Kernel {
    pub(crate) fn find_condvar(&self, uid: Uid, weight: Weight) -> Result<Arc<Condvar>, SyncError> {
        let tables = self.tables();
        let table = match weight {
            Weight::Heavy => &tables.condvars,
            Weight::Light => &tables.lwcondvars,
        };
        table.get(&uid).cloned().ok_or(unknown_id(weight))
    }

    pub fn condvar_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        assoc_mutex_id: Uid,
        weight: Weight,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        let assoc = self.find_mutex(assoc_mutex_id, weight)?;

        let uid = self.next_uid();
        trace!(
            "condvar_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" assoc_mutexid: {assoc_mutex_id}"
        );
        let condvar = Arc::new(Condvar {
            uid,
            name: name.to_owned(),
            weight,
            assoc,
            state: HostMutex::new(CondvarState {
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });

        let mut tables = self.tables();
        match weight {
            Weight::Heavy => tables.condvars.insert(uid, condvar),
            Weight::Light => tables.lwcondvars.insert(uid, condvar),
        };
        Ok(uid)
    }

    pub fn condvar_wait(
        &self,
        thread_id: Uid,
        cond_id: Uid,
        timeout: Option<&mut u32>,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let condvar = self.find_condvar(cond_id, weight)?;
        let thread = self.get_thread(thread_id)?;
        condvar.wait(&thread, timeout)
    }

    pub fn condvar_signal(
        &self,
        thread_id: Uid,
        cond_id: Uid,
        target: SignalTarget,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let condvar = self.find_condvar(cond_id, weight)?;
        trace!(
            "condvar_signal: uid: {} thread_id: {} target: {:?}",
            cond_id,
            thread_id,
            target
        );
        condvar.signal(target);
        Ok(())
    }

    pub fn condvar_delete(
        &self,
        thread_id: Uid,
        cond_id: Uid,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let condvar = self.find_condvar(cond_id, weight)?;
        let state = lock(&condvar.state);
        if state.waiters.is_empty() {
            let mut tables = self.tables();
            match weight {
                Weight::Heavy => tables.condvars.remove(&cond_id),
                Weight::Light => tables.lwcondvars.remove(&cond_id),
            };
        } else {
            warn!(
                "condvar_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                cond_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl Condvar {
    fn wait(&self, thread: &Arc<ThreadHandle>, mut timeout: Option<&mut u32>) -> Result<(), SyncError> {
        let state = lock(&self.state);
        trace!(
            "condvar_wait: uid: {} thread_id: {} name: \"{}\" waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            state.waiters.len()
        );

        // The only place two object locks overlap: the associated mutex is
        // released while the condvar's own lock is held, so a signal cannot
        // slip between the release and the enqueue.
        self.assoc.unlock(thread, 1)?;

        let record = WaitRecord::new(thread, WaitPayload::Sleep);
        let wait_result = park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.waiters,
            timeout.as_deref_mut(),
        );

        match wait_result {
            Ok(()) => self.assoc.lock(thread, 1, timeout, false),
            Err(SyncError::WaitTimeout) => {
                // The caller still gets the mutex back before seeing the
                // timeout.
                self.assoc.lock(thread, 1, None, false)?;
                Err(SyncError::WaitTimeout)
            }
            Err(other) => Err(other),
        }
    }

    fn signal(&self, target: SignalTarget) {
        let mut state = lock(&self.state);
        match target {
            SignalTarget::Any => {
                if let Some(record) = state.waiters.pop() {
                    record.thread.make_runnable();
                }
            }
            SignalTarget::All => {
                for record in state.waiters.drain() {
                    record.thread.make_runnable();
                }
            }
            SignalTarget::Specific(uid) => match state.waiters.find_thread(uid) {
                Some(at) => {
                    if let Some(record) = state.waiters.remove_at(at) {
                        record.thread.make_runnable();
                    }
                }
                None => {
                    error!(
                        "condvar_signal: uid: {} target thread {} is not waiting",
                        self.uid, uid
                    );
                }
            },
        }
    }
}
