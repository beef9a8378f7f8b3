// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest reader/writer locks.
//!
//! The unlock scan walks the wait queue head-to-tail, granting the first
//! record and then every further read record while write records are skipped
//! in place. Readers queued behind a writer can therefore be served before
//! that writer, and sustained read pressure can starve it. That ordering is
//! guest-visible behavior and is kept exactly as is; see the pinned test at
//! the bottom of this file before changing the scan.

use std::sync::{Arc, Mutex as HostMutex};

use hashbrown::HashMap;
use log::{trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unlocked,
    ReadLocked,
    WriteLocked,
}

pub(crate) struct RwLock {
    uid: Uid,
    name: String,
    attr: ObjectAttr,
    state: HostMutex<RwLockState>,
}

struct RwLockState {
    mode: Mode,
    /// Hold count per owning thread. Empty exactly when unlocked.
    owners: HashMap<Uid, i32>,
    waiters: WaitQueue,
}

impl Kernel {
    pub(crate) fn find_rwlock(&self, uid: Uid) -> Result<Arc<RwLock>, SyncError> {
        self.tables()
            .rwlocks
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownRwLockId)
    }

    pub fn rwlock_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        let uid = self.next_uid();
        trace!("rwlock_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" attr: {attr:?}");
        let rwlock = Arc::new(RwLock {
            uid,
            name: name.to_owned(),
            attr,
            state: HostMutex::new(RwLockState {
                mode: Mode::Unlocked,
                owners: HashMap::new(),
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });
        self.tables().rwlocks.insert(uid, rwlock);
        Ok(uid)
    }

    pub fn rwlock_lock(
        &self,
        thread_id: Uid,
        rwlock_id: Uid,
        exclusive: bool,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let rwlock = self.find_rwlock(rwlock_id)?;
        let thread = self.get_thread(thread_id)?;
        rwlock.lock_for(&thread, exclusive, timeout)
    }

    pub fn rwlock_unlock(
        &self,
        thread_id: Uid,
        rwlock_id: Uid,
        exclusive: bool,
    ) -> Result<(), SyncError> {
        let rwlock = self.find_rwlock(rwlock_id)?;
        let thread = self.get_thread(thread_id)?;
        rwlock.unlock_for(&thread, exclusive)
    }

    pub fn rwlock_delete(&self, thread_id: Uid, rwlock_id: Uid) -> Result<(), SyncError> {
        let rwlock = self.find_rwlock(rwlock_id)?;
        let state = lock(&rwlock.state);
        if state.waiters.is_empty() {
            self.tables().rwlocks.remove(&rwlock_id);
        } else {
            warn!(
                "rwlock_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                rwlock_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl RwLock {
    fn lock_for(
        &self,
        thread: &Arc<ThreadHandle>,
        exclusive: bool,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "rwlock_lock: uid: {} thread_id: {} name: \"{}\" exclusive: {} mode: {:?} waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            exclusive,
            state.mode,
            state.waiters.len()
        );

        let uid = thread.uid();
        let grant_now = match state.mode {
            Mode::Unlocked => true,
            Mode::ReadLocked if !exclusive => true,
            // Recursion on an existing hold: reads always, writes only when
            // the attribute allows them.
            _ => {
                state.owners.contains_key(&uid)
                    && (!exclusive || self.attr.contains(ObjectAttr::RECURSIVE))
            }
        };
        if grant_now {
            if state.mode == Mode::Unlocked {
                state.mode = if exclusive {
                    Mode::WriteLocked
                } else {
                    Mode::ReadLocked
                };
            }
            *state.owners.entry(uid).or_insert(0) += 1;
            return Ok(());
        }

        let record = WaitRecord::new(thread, WaitPayload::Excl { exclusive });
        park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.waiters,
            timeout,
        )
    }

    fn unlock_for(&self, thread: &Arc<ThreadHandle>, exclusive: bool) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "rwlock_unlock: uid: {} thread_id: {} name: \"{}\" exclusive: {} mode: {:?}",
            self.uid,
            thread.uid(),
            self.name,
            exclusive,
            state.mode
        );

        let uid = thread.uid();
        let Some(count) = state.owners.get_mut(&uid) else {
            return Err(SyncError::RwLockNotOwner);
        };
        *count -= 1;
        if *count == 0 {
            state.owners.remove(&uid);
        }
        if !state.owners.is_empty() {
            return Ok(());
        }

        state.mode = Mode::Unlocked;
        Self::wake_waiters(&mut state);
        Ok(())
    }

    /// Head-to-tail scan-and-skip. Grants the first record outright; once the
    /// lock is read-held, further read records are granted past any write
    /// records left queued. Granting a write record ends the scan.
    fn wake_waiters(state: &mut RwLockState) {
        let mut at = 0;
        while at < state.waiters.len() {
            let (exclusive, record) = {
                let Some(record) = state.waiters.get(at) else {
                    break;
                };
                let exclusive = match &record.payload {
                    WaitPayload::Excl { exclusive } => *exclusive,
                    _ => unreachable!(),
                };
                (exclusive, Arc::clone(record))
            };
            match state.mode {
                Mode::WriteLocked => break,
                Mode::ReadLocked if exclusive => {
                    at += 1;
                }
                _ => {
                    state.mode = if exclusive {
                        Mode::WriteLocked
                    } else {
                        Mode::ReadLocked
                    };
                    *state.owners.entry(record.thread.uid()).or_insert(0) += 1;
                    state.waiters.remove_at(at);
                    record.thread.make_runnable();
                    if exclusive {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn kernel_and_thread() -> (Arc<Kernel>, Uid) {
        let kernel = Arc::new(Kernel::new());
        let thread = kernel.register_thread("main", 160);
        (kernel, thread.uid())
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let (kernel, tid) = kernel_and_thread();
        let rid = kernel
            .rwlock_create(tid, "rw", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, rid, false, None).unwrap();

        let reader = kernel.register_thread("reader", 160).uid();
        kernel.rwlock_lock(reader, rid, false, None).unwrap();

        let writer = kernel.register_thread("writer", 160).uid();
        let mut timeout = 10_000u32;
        assert_eq!(
            kernel.rwlock_lock(writer, rid, true, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );

        kernel.rwlock_unlock(tid, rid, false).unwrap();
        kernel.rwlock_unlock(reader, rid, false).unwrap();
        kernel.rwlock_lock(writer, rid, true, None).unwrap();
    }

    #[test]
    fn read_recursion_is_always_allowed() {
        let (kernel, tid) = kernel_and_thread();
        let rid = kernel
            .rwlock_create(tid, "rw", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, rid, false, None).unwrap();
        kernel.rwlock_lock(tid, rid, false, None).unwrap();
        kernel.rwlock_unlock(tid, rid, false).unwrap();
        kernel.rwlock_unlock(tid, rid, false).unwrap();

        // Fully released: a writer gets in immediately.
        let writer = kernel.register_thread("writer", 160).uid();
        kernel.rwlock_lock(writer, rid, true, None).unwrap();
    }

    #[test]
    fn write_recursion_needs_the_attribute() {
        let (kernel, tid) = kernel_and_thread();
        let plain = kernel
            .rwlock_create(tid, "plain", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, plain, true, None).unwrap();
        let mut timeout = 10_000u32;
        assert_eq!(
            kernel.rwlock_lock(tid, plain, true, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );

        let recursive = kernel
            .rwlock_create(tid, "rec", ObjectAttr::RECURSIVE)
            .unwrap();
        kernel.rwlock_lock(tid, recursive, true, None).unwrap();
        kernel.rwlock_lock(tid, recursive, true, None).unwrap();
        kernel.rwlock_unlock(tid, recursive, true).unwrap();
        kernel.rwlock_unlock(tid, recursive, true).unwrap();
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let (kernel, tid) = kernel_and_thread();
        let rid = kernel
            .rwlock_create(tid, "rw", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, rid, false, None).unwrap();

        let other = kernel.register_thread("other", 160).uid();
        assert_eq!(
            kernel.rwlock_unlock(other, rid, false),
            Err(SyncError::RwLockNotOwner)
        );
    }

    /// Pins the read-preferring unlock scan: readers queued behind a writer
    /// are served before it. If this ordering ever changes it must change
    /// deliberately, with this test.
    #[test]
    fn readers_behind_a_queued_writer_are_served_first() {
        let (kernel, tid) = kernel_and_thread();
        let rid = kernel
            .rwlock_create(tid, "rw", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, rid, true, None).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        let mut uids = Vec::new();
        // Queue order: reader r1, writer w, reader r2. The readers leave
        // their guest-level holds in place when their host threads exit; the
        // main thread releases them by uid below.
        for (delay_ms, exclusive, tag) in [(0u64, false, "r1"), (20, true, "w"), (40, false, "r2")]
        {
            let kernel = Arc::clone(&kernel);
            let tx = tx.clone();
            let waiter = kernel.register_thread(tag, 160).uid();
            uids.push(waiter);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                kernel.rwlock_lock(waiter, rid, exclusive, None).unwrap();
                tx.send(tag).unwrap();
            }));
        }
        thread::sleep(Duration::from_millis(100)); // Let all three park.

        kernel.rwlock_unlock(tid, rid, true).unwrap();

        // Both readers come out of the scan; the earlier-queued writer stays
        // parked behind them.
        let mut granted = vec![
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ];
        granted.sort_unstable();
        assert_eq!(granted, ["r1", "r2"]);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        // Only after the last reader leaves does the writer get the lock.
        kernel.rwlock_unlock(uids[0], rid, false).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );
        kernel.rwlock_unlock(uids[2], rid, false).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "w");
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn granting_a_writer_stops_the_scan() {
        let (kernel, tid) = kernel_and_thread();
        let rid = kernel
            .rwlock_create(tid, "rw", ObjectAttr::empty())
            .unwrap();
        kernel.rwlock_lock(tid, rid, true, None).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        // Queue order: writer w, reader r. The writer is at the head, so the
        // scan grants it from the unlocked state and stops.
        for (delay_ms, exclusive, tag) in [(0u64, true, "w"), (20, false, "r")] {
            let kernel = Arc::clone(&kernel);
            let tx = tx.clone();
            let waiter = kernel.register_thread(tag, 160).uid();
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                kernel.rwlock_lock(waiter, rid, exclusive, None).unwrap();
                tx.send(tag).unwrap();
                kernel.rwlock_unlock(waiter, rid, exclusive).unwrap();
            }));
        }
        thread::sleep(Duration::from_millis(80)); // Let both park.

        kernel.rwlock_unlock(tid, rid, true).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "w");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "r");
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
