// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Counting semaphores with head-of-line signal distribution.
//!
//! A signal only ever looks at the front of the wait queue: waiters are
//! granted while the head's requested count fits the value, and the scan
//! stops at the first head it cannot satisfy, even if a smaller request sits
//! right behind it.

use std::sync::{Arc, Mutex as HostMutex};

use log::{trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

pub(crate) struct Semaphore {
    uid: Uid,
    name: String,
    init_val: i32,
    max: i32,
    state: HostMutex<SemaphoreState>,
}

struct SemaphoreState {
    val: i32,
    waiters: WaitQueue,
}

impl Kernel {
    pub(crate) fn find_semaphore(&self, uid: Uid) -> Result<Arc<Semaphore>, SyncError> {
        self.tables()
            .semaphores
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownSemaId)
    }

    pub fn semaphore_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        init_val: i32,
        max_val: i32,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        if init_val < 0 || max_val <= 0 || init_val > max_val {
            return Err(SyncError::IllegalCount);
        }

        let uid = self.next_uid();
        let semaphore = Arc::new(Semaphore {
            uid,
            name: name.to_owned(),
            init_val,
            max: max_val,
            state: HostMutex::new(SemaphoreState {
                val: init_val,
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });
        trace!(
            "semaphore_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" init_val: {init_val} max_val: {max_val}"
        );
        self.tables().semaphores.insert(uid, semaphore);
        Ok(uid)
    }

    pub fn semaphore_wait(
        &self,
        thread_id: Uid,
        sema_id: Uid,
        need: i32,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let semaphore = self.find_semaphore(sema_id)?;
        let thread = self.get_thread(thread_id)?;
        semaphore.wait(&thread, need, timeout)
    }

    pub fn semaphore_signal(
        &self,
        thread_id: Uid,
        sema_id: Uid,
        count: i32,
    ) -> Result<(), SyncError> {
        let semaphore = self.find_semaphore(sema_id)?;
        trace!(
            "semaphore_signal: uid: {} thread_id: {} count: {}",
            sema_id,
            thread_id,
            count
        );
        semaphore.signal(count)
    }

    /// Wakes every waiter with [`SyncError::WaitCancel`] and resets the
    /// value: to `set_count` when non-negative, back to the initial value
    /// otherwise. The number of waiters woken is reported through
    /// `num_wait_threads`.
    pub fn semaphore_cancel(
        &self,
        thread_id: Uid,
        sema_id: Uid,
        set_count: i32,
        num_wait_threads: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let semaphore = self.find_semaphore(sema_id)?;
        trace!(
            "semaphore_cancel: uid: {} thread_id: {} set_count: {}",
            sema_id,
            thread_id,
            set_count
        );
        semaphore.cancel(set_count, num_wait_threads)
    }

    pub fn semaphore_delete(&self, thread_id: Uid, sema_id: Uid) -> Result<(), SyncError> {
        let semaphore = self.find_semaphore(sema_id)?;
        let state = lock(&semaphore.state);
        if state.waiters.is_empty() {
            self.tables().semaphores.remove(&sema_id);
        } else {
            warn!(
                "semaphore_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                sema_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl Semaphore {
    fn wait(
        &self,
        thread: &Arc<ThreadHandle>,
        need: i32,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "semaphore_wait: uid: {} thread_id: {} name: \"{}\" val: {} need: {} waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            state.val,
            need,
            state.waiters.len()
        );

        if state.val >= need {
            state.val -= need;
            return Ok(());
        }

        let record = WaitRecord::new(thread, WaitPayload::Need { count: need });
        park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.waiters,
            timeout,
        )
    }

    fn signal(&self, count: i32) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        if state.val + count > self.max {
            return Err(SyncError::SemaOverflow);
        }
        state.val += count;

        // Head-of-line: stop at the first waiter the value cannot cover.
        loop {
            let need = match state.waiters.front() {
                Some(record) => match &record.payload {
                    WaitPayload::Need { count } => *count,
                    _ => unreachable!(),
                },
                None => break,
            };
            if state.val < need {
                break;
            }
            if let Some(record) = state.waiters.pop() {
                state.val -= need;
                record.thread.make_runnable();
            }
        }
        Ok(())
    }

    fn cancel(
        &self,
        set_count: i32,
        num_wait_threads: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        if set_count > self.max {
            return Err(SyncError::IllegalCount);
        }
        let mut state = lock(&self.state);
        let mut woken = 0u32;
        for record in state.waiters.drain() {
            record.cancel();
            record.thread.make_runnable();
            woken += 1;
        }
        state.val = if set_count < 0 {
            self.init_val
        } else {
            set_count
        };
        if let Some(out) = num_wait_threads {
            *out = woken;
        }
        Ok(())
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
    fn wait_subtracts_when_enough_is_available() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 3, 5)
            .unwrap();
        kernel.semaphore_wait(tid, sid, 2, None).unwrap();
        kernel.semaphore_wait(tid, sid, 1, None).unwrap();
        let mut timeout = 10_000u32;
        assert_eq!(
            kernel.semaphore_wait(tid, sid, 1, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );
    }

    #[test]
    fn signal_above_max_overflows_without_changing_the_value() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 4, 5)
            .unwrap();
        assert_eq!(
            kernel.semaphore_signal(tid, sid, 2),
            Err(SyncError::SemaOverflow)
        );
        // Value must still be 4: one more unit fits.
        kernel.semaphore_signal(tid, sid, 1).unwrap();
        kernel.semaphore_wait(tid, sid, 5, None).unwrap();
    }

    #[test]
    fn illegal_initial_values_are_rejected() {
        let (kernel, tid) = kernel_and_thread();
        assert_eq!(
            kernel.semaphore_create(tid, "s", ObjectAttr::empty(), -1, 5),
            Err(SyncError::IllegalCount)
        );
        assert_eq!(
            kernel.semaphore_create(tid, "s", ObjectAttr::empty(), 0, 0),
            Err(SyncError::IllegalCount)
        );
        assert_eq!(
            kernel.semaphore_create(tid, "s", ObjectAttr::empty(), 6, 5),
            Err(SyncError::IllegalCount)
        );
    }

    #[test]
    fn head_of_line_blocks_smaller_requests_behind_a_large_one() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 0, 10)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let mut waiters = Vec::new();
        // A large request parks first, a small one behind it.
        for (delay_ms, need, tag) in [(0u64, 5, "large"), (20, 1, "small")] {
            let kernel = Arc::clone(&kernel);
            let tx = tx.clone();
            let waiter = kernel.register_thread(tag, 160).uid();
            waiters.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                kernel.semaphore_wait(waiter, sid, need, None).unwrap();
                tx.send(tag).unwrap();
            }));
        }
        thread::sleep(Duration::from_millis(60)); // Let both park.

        // Two units satisfy the small request, but the large head blocks it.
        kernel.semaphore_signal(tid, sid, 2).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        // Three more units cover exactly the head; the small request stays
        // parked until another signal arrives.
        kernel.semaphore_signal(tid, sid, 3).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "large");
        kernel.semaphore_signal(tid, sid, 1).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "small");
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn cancel_wakes_all_waiters_and_resets_the_value() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 2, 10)
            .unwrap();
        kernel.semaphore_wait(tid, sid, 2, None).unwrap();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let kernel = Arc::clone(&kernel);
            let waiter = kernel.register_thread("w", 160).uid();
            waiters.push(thread::spawn(move || {
                kernel.semaphore_wait(waiter, sid, 1, None)
            }));
        }
        thread::sleep(Duration::from_millis(50)); // Let both park.

        let mut woken = 0u32;
        kernel
            .semaphore_cancel(tid, sid, -1, Some(&mut woken))
            .unwrap();
        assert_eq!(woken, 2);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(SyncError::WaitCancel));
        }
        // Value restored to the initial 2.
        kernel.semaphore_wait(tid, sid, 2, None).unwrap();
    }

    #[test]
    fn cancel_above_max_is_rejected() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 0, 3)
            .unwrap();
        assert_eq!(
            kernel.semaphore_cancel(tid, sid, 4, None),
            Err(SyncError::IllegalCount)
        );
    }

    #[test]
    fn conservation_across_a_mixed_sequence() {
        let (kernel, tid) = kernel_and_thread();
        let sid = kernel
            .semaphore_create(tid, "sem", ObjectAttr::empty(), 1, 8)
            .unwrap();
        kernel.semaphore_signal(tid, sid, 3).unwrap();
        kernel.semaphore_wait(tid, sid, 2, None).unwrap();
        kernel.semaphore_signal(tid, sid, 4).unwrap();
        kernel.semaphore_wait(tid, sid, 6, None).unwrap();
        // initial 1 + signaled 7 - granted 8 = 0 left.
        let mut timeout = 5_000u32;
        assert_eq!(
            kernel.semaphore_wait(tid, sid, 1, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );
    }
}
