// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Exclusive, optionally-recursive guest mutexes.
//!
//! Ownership transfers on unlock: when the count reaches zero the head of the
//! wait queue becomes the owner with the count it asked for, before it even
//! wakes. The lightweight variant shares this state machine and differs only
//! in its table and error codes.

use std::sync::{Arc, Mutex as HostMutex};

use log::{trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid, Weight};
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

pub(crate) struct Mutex {
    uid: Uid,
    name: String,
    attr: ObjectAttr,
    weight: Weight,
    state: HostMutex<MutexState>,
}

struct MutexState {
    lock_count: i32,
    owner: Option<Arc<ThreadHandle>>,
    waiters: WaitQueue,
}

impl MutexState {
    fn owned_by(&self, thread: &ThreadHandle) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.uid() == thread.uid())
    }
}

fn unknown_id(weight: Weight) -> SyncError {
    match weight {
        Weight::Heavy => SyncError::UnknownMutexId,
        Weight::Light => SyncError::UnknownLwMutexId,
    }
}

fn recursive_error(weight: Weight) -> SyncError {
    match weight {
        Weight::Heavy => SyncError::MutexRecursive,
        Weight::Light => SyncError::LwMutexRecursive,
    }
}

fn failed_to_own(weight: Weight) -> SyncError {
    match weight {
        Weight::Heavy => SyncError::MutexFailedToOwn,
        Weight::Light => SyncError::LwMutexFailedToOwn,
    }
}

fn unlock_underflow(weight: Weight) -> SyncError {
    match weight {
        Weight::Heavy => SyncError::MutexUnlockUnderflow,
        Weight::Light => SyncError::LwMutexUnlockUnderflow,
    }
}

impl Kernel {
    pub(crate) fn find_mutex(&self, uid: Uid, weight: Weight) -> Result<Arc<Mutex>, SyncError> {
        let tables = self.tables();
        let table = match weight {
            Weight::Heavy => &tables.mutexes,
            Weight::Light => &tables.lwmutexes,
        };
        table.get(&uid).cloned().ok_or(unknown_id(weight))
    }

    pub fn mutex_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        init_count: i32,
        weight: Weight,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        if init_count < 0 {
            return Err(SyncError::IllegalCount);
        }
        if init_count > 1 && attr.contains(ObjectAttr::RECURSIVE) {
            return Err(SyncError::IllegalCount);
        }
        let owner = if init_count > 0 {
            Some(self.get_thread(thread_id)?)
        } else {
            None
        };

        let uid = self.next_uid();
        let mutex = Arc::new(Mutex {
            uid,
            name: name.to_owned(),
            attr,
            weight,
            state: HostMutex::new(MutexState {
                lock_count: init_count,
                owner,
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });
        trace!(
            "mutex_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" attr: {attr:?} init_count: {init_count}"
        );

        let mut tables = self.tables();
        match weight {
            Weight::Heavy => tables.mutexes.insert(uid, mutex),
            Weight::Light => tables.lwmutexes.insert(uid, mutex),
        };
        Ok(uid)
    }

    pub fn mutex_lock(
        &self,
        thread_id: Uid,
        mutex_id: Uid,
        lock_count: i32,
        timeout: Option<&mut u32>,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let mutex = self.find_mutex(mutex_id, weight)?;
        let thread = self.get_thread(thread_id)?;
        mutex.lock(&thread, lock_count, timeout, false)
    }

    pub fn mutex_try_lock(
        &self,
        thread_id: Uid,
        mutex_id: Uid,
        lock_count: i32,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let mutex = self.find_mutex(mutex_id, weight)?;
        let thread = self.get_thread(thread_id)?;
        mutex.lock(&thread, lock_count, None, true)
    }

    pub fn mutex_unlock(
        &self,
        thread_id: Uid,
        mutex_id: Uid,
        unlock_count: i32,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let mutex = self.find_mutex(mutex_id, weight)?;
        let thread = self.get_thread(thread_id)?;
        mutex.unlock(&thread, unlock_count)
    }

    /// Deletes a mutex with no pending waiters. A mutex that still has
    /// waiters is left alive; the refusal is logged rather than reported so
    /// guests that race deletion against their own teardown keep running.
    pub fn mutex_delete(
        &self,
        thread_id: Uid,
        mutex_id: Uid,
        weight: Weight,
    ) -> Result<(), SyncError> {
        let mutex = self.find_mutex(mutex_id, weight)?;
        let state = lock(&mutex.state);
        if state.waiters.is_empty() {
            let mut tables = self.tables();
            match weight {
                Weight::Heavy => tables.mutexes.remove(&mutex_id),
                Weight::Light => tables.lwmutexes.remove(&mutex_id),
            };
        } else {
            warn!(
                "mutex_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                mutex_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl Mutex {
    pub(crate) fn lock(
        &self,
        thread: &Arc<ThreadHandle>,
        lock_count: i32,
        timeout: Option<&mut u32>,
        only_try: bool,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "mutex_lock: uid: {} thread_id: {} name: \"{}\" lock_count: {} held: {} waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            lock_count,
            state.lock_count,
            state.waiters.len()
        );

        if state.lock_count > 0 {
            if state.owned_by(thread) {
                if self.attr.contains(ObjectAttr::RECURSIVE) {
                    state.lock_count += lock_count;
                    return Ok(());
                }
                return Err(recursive_error(self.weight));
            }
            if only_try {
                return Err(failed_to_own(self.weight));
            }

            let record = WaitRecord::new(thread, WaitPayload::Lock { count: lock_count });
            return park(
                thread,
                &self.state,
                state,
                &record,
                |s| &mut s.waiters,
                timeout,
            );
        }

        state.lock_count = lock_count;
        state.owner = Some(Arc::clone(thread));
        Ok(())
    }

    /// Unlocks `unlock_count` levels. Only the owner's unlocks have any
    /// effect; a non-owner call is accepted as a no-op.
    pub(crate) fn unlock(
        &self,
        thread: &Arc<ThreadHandle>,
        unlock_count: i32,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        if !state.owned_by(thread) {
            return Ok(());
        }
        if unlock_count > state.lock_count {
            return Err(unlock_underflow(self.weight));
        }

        state.lock_count -= unlock_count;
        if state.lock_count == 0 {
            state.owner = None;
            if let Some(record) = state.waiters.pop() {
                let count = match &record.payload {
                    WaitPayload::Lock { count } => *count,
                    _ => unreachable!(),
                };
                state.lock_count = count;
                state.owner = Some(Arc::clone(&record.thread));
                record.thread.make_runnable();
            }
        }
        Ok(())
    }
}
