// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 32-bit event flags with AND/OR pattern waits.
//!
//! Unlike the head-only wake scans of mutexes and semaphores, `set` walks the
//! whole wait queue and wakes every waiter whose condition now holds,
//! applying each waiter's own clear mode before evaluating the next. A waiter
//! always receives the flag word as it stood when its condition was
//! satisfied, before any clearing.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as HostMutex};

use log::{trace, warn};

use crate::attr::{EvfWaitMode, ObjectAttr};
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

pub(crate) struct EventFlag {
    uid: Uid,
    name: String,
    attr: ObjectAttr,
    state: HostMutex<EventFlagState>,
}

struct EventFlagState {
    flags: u32,
    waiters: WaitQueue,
}

fn matches(flags: u32, pattern: u32, mode: EvfWaitMode) -> bool {
    if mode.contains(EvfWaitMode::OR) {
        flags & pattern != 0
    } else {
        flags & pattern == pattern
    }
}

fn apply_clear(flags: &mut u32, pattern: u32, mode: EvfWaitMode) {
    if mode.contains(EvfWaitMode::CLEAR_ALL) {
        *flags = 0;
    }
    if mode.contains(EvfWaitMode::CLEAR_MATCHED) {
        *flags &= !pattern;
    }
}

impl Kernel {
    pub(crate) fn find_eventflag(&self, uid: Uid) -> Result<Arc<EventFlag>, SyncError> {
        self.tables()
            .eventflags
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownEvfId)
    }

    pub fn eventflag_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        init_pattern: u32,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        let uid = self.next_uid();
        trace!(
            "eventflag_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" attr: {attr:?} init_pattern: {init_pattern:#b}"
        );
        let event = Arc::new(EventFlag {
            uid,
            name: name.to_owned(),
            attr,
            state: HostMutex::new(EventFlagState {
                flags: init_pattern,
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });
        self.tables().eventflags.insert(uid, event);
        Ok(uid)
    }

    pub fn eventflag_wait(
        &self,
        thread_id: Uid,
        evf_id: Uid,
        pattern: u32,
        mode: EvfWaitMode,
        out_bits: Option<&mut u32>,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        let thread = self.get_thread(thread_id)?;
        event.wait_or_poll(&thread, pattern, mode, out_bits, timeout, true)
    }

    pub fn eventflag_poll(
        &self,
        thread_id: Uid,
        evf_id: Uid,
        pattern: u32,
        mode: EvfWaitMode,
        out_bits: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        let thread = self.get_thread(thread_id)?;
        event.wait_or_poll(&thread, pattern, mode, out_bits, None, false)
    }

    pub fn eventflag_set(&self, thread_id: Uid, evf_id: Uid, pattern: u32) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        trace!(
            "eventflag_set: uid: {} thread_id: {} pattern: {:#b}",
            evf_id,
            thread_id,
            pattern
        );
        event.set(pattern);
        Ok(())
    }

    /// Keeps only the bits present in `pattern`. Wakes nobody.
    pub fn eventflag_clear(
        &self,
        thread_id: Uid,
        evf_id: Uid,
        pattern: u32,
    ) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        trace!(
            "eventflag_clear: uid: {} thread_id: {} pattern: {:#b}",
            evf_id,
            thread_id,
            pattern
        );
        lock(&event.state).flags &= pattern;
        Ok(())
    }

    /// Wakes every waiter with [`SyncError::WaitCancel`], then overwrites the
    /// flag word with `pattern`.
    pub fn eventflag_cancel(
        &self,
        thread_id: Uid,
        evf_id: Uid,
        pattern: u32,
        num_wait_threads: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        trace!(
            "eventflag_cancel: uid: {} thread_id: {} pattern: {:#b}",
            evf_id,
            thread_id,
            pattern
        );
        let mut state = lock(&event.state);
        let mut woken = 0u32;
        for record in state.waiters.drain() {
            record.cancel();
            record.thread.make_runnable();
            woken += 1;
        }
        state.flags = pattern;
        if let Some(out) = num_wait_threads {
            *out = woken;
        }
        Ok(())
    }

    pub fn eventflag_delete(&self, thread_id: Uid, evf_id: Uid) -> Result<(), SyncError> {
        let event = self.find_eventflag(evf_id)?;
        let state = lock(&event.state);
        if state.waiters.is_empty() {
            self.tables().eventflags.remove(&evf_id);
        } else {
            warn!(
                "eventflag_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                evf_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl EventFlag {
    fn wait_or_poll(
        &self,
        thread: &Arc<ThreadHandle>,
        pattern: u32,
        mode: EvfWaitMode,
        out_bits: Option<&mut u32>,
        timeout: Option<&mut u32>,
        do_wait: bool,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "eventflag_wait: uid: {} thread_id: {} name: \"{}\" flags: {:#b} pattern: {:#b} waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            state.flags,
            pattern,
            state.waiters.len()
        );

        if matches(state.flags, pattern, mode) {
            let satisfied = state.flags;
            apply_clear(&mut state.flags, pattern, mode);
            if let Some(out) = out_bits {
                *out = satisfied;
            }
            return Ok(());
        }

        let entry_bits = state.flags & pattern;
        if !do_wait {
            if let Some(out) = out_bits {
                *out = entry_bits;
            }
            return Err(SyncError::EvfConditionNotMet);
        }
        if !self.attr.contains(ObjectAttr::MULTI_WAIT) && !state.waiters.is_empty() {
            return Err(SyncError::EvfMultiWait);
        }

        let record = WaitRecord::new(
            thread,
            WaitPayload::Flag {
                pattern,
                mode,
                out: entry_bits.into(),
            },
        );
        let result = park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.waiters,
            timeout,
        );
        if let Some(out) = out_bits {
            let WaitPayload::Flag { out: cell, .. } = &record.payload else {
                unreachable!()
            };
            *out = cell.load(Ordering::Acquire);
        }
        result
    }

    fn set(&self, pattern: u32) {
        let mut state = lock(&self.state);
        state.flags |= pattern;

        let mut at = 0;
        while at < state.waiters.len() {
            let record = match state.waiters.get(at) {
                Some(record) => Arc::clone(record),
                None => break,
            };
            let WaitPayload::Flag {
                pattern: wanted,
                mode,
                out,
            } = &record.payload
            else {
                unreachable!()
            };
            if matches(state.flags, *wanted, *mode) {
                out.store(state.flags, Ordering::Release);
                apply_clear(&mut state.flags, *wanted, *mode);
                state.waiters.remove_at(at);
                record.thread.make_runnable();
            } else {
                at += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn kernel_and_thread() -> (Arc<Kernel>, Uid) {
        let kernel = Arc::new(Kernel::new());
        let thread = kernel.register_thread("main", 160);
        (kernel, thread.uid())
    }

    #[test]
    fn and_match_with_clear_matched_leaves_the_rest() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0b101)
            .unwrap();

        let mut bits = 0u32;
        kernel
            .eventflag_wait(
                tid,
                eid,
                0b100,
                EvfWaitMode::CLEAR_MATCHED,
                Some(&mut bits),
                None,
            )
            .unwrap();
        assert_eq!(bits, 0b101);

        // Only the matched bit was cleared.
        let mut left = 0u32;
        kernel
            .eventflag_poll(tid, eid, 0b1, EvfWaitMode::OR, Some(&mut left))
            .unwrap();
        assert_eq!(left, 0b001);
    }

    #[test]
    fn or_wait_blocks_until_a_bit_arrives() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0b101)
            .unwrap();

        let waiter = kernel.register_thread("waiter", 160).uid();
        let handle = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                let mut bits = 0u32;
                let result =
                    kernel.eventflag_wait(waiter, eid, 0b010, EvfWaitMode::OR, Some(&mut bits), None);
                (result, bits)
            })
        };
        thread::sleep(Duration::from_millis(50)); // Let it park.

        kernel.eventflag_set(tid, eid, 0b010).unwrap();
        let (result, bits) = handle.join().unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(bits, 0b111);
    }

    #[test]
    fn clear_all_mode_empties_the_word() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0b11)
            .unwrap();
        kernel
            .eventflag_wait(tid, eid, 0b01, EvfWaitMode::OR | EvfWaitMode::CLEAR_ALL, None, None)
            .unwrap();
        assert_eq!(
            kernel.eventflag_poll(tid, eid, u32::MAX, EvfWaitMode::OR, None),
            Err(SyncError::EvfConditionNotMet)
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0b1110)
            .unwrap();
        kernel.eventflag_clear(tid, eid, 0b0110).unwrap();
        let mut first = 0u32;
        kernel
            .eventflag_poll(tid, eid, u32::MAX, EvfWaitMode::OR, Some(&mut first))
            .unwrap();
        kernel.eventflag_clear(tid, eid, 0b0110).unwrap();
        let mut second = 0u32;
        kernel
            .eventflag_poll(tid, eid, u32::MAX, EvfWaitMode::OR, Some(&mut second))
            .unwrap();
        assert_eq!(first, 0b0110);
        assert_eq!(first, second);
    }

    #[test]
    fn second_waiter_is_rejected_without_the_multi_attribute() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0)
            .unwrap();

        let first = kernel.register_thread("first", 160).uid();
        let handle = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || kernel.eventflag_wait(first, eid, 0b1, EvfWaitMode::OR, None, None))
        };
        thread::sleep(Duration::from_millis(50)); // Let it park.

        assert_eq!(
            kernel.eventflag_wait(tid, eid, 0b1, EvfWaitMode::OR, None, None),
            Err(SyncError::EvfMultiWait)
        );

        kernel.eventflag_set(tid, eid, 0b1).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn set_wakes_every_satisfied_waiter_with_its_own_clear_mode() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::MULTI_WAIT, 0)
            .unwrap();

        let mut handles = Vec::new();
        // First waiter consumes its bit, second waits on a different bit.
        for (delay_ms, pattern, mode) in [
            (0u64, 0b01u32, EvfWaitMode::OR | EvfWaitMode::CLEAR_MATCHED),
            (20, 0b10, EvfWaitMode::OR),
        ] {
            let kernel = Arc::clone(&kernel);
            let waiter = kernel.register_thread("waiter", 160).uid();
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                let mut bits = 0u32;
                let result = kernel.eventflag_wait(waiter, eid, pattern, mode, Some(&mut bits), None);
                (result, bits)
            }));
        }
        thread::sleep(Duration::from_millis(80)); // Let both park.

        kernel.eventflag_set(tid, eid, 0b11).unwrap();
        let (first_result, first_bits) = handles.remove(0).join().unwrap();
        let (second_result, second_bits) = handles.remove(0).join().unwrap();
        assert_eq!(first_result, Ok(()));
        // The first waiter saw both bits and cleared its own.
        assert_eq!(first_bits, 0b11);
        assert_eq!(second_result, Ok(()));
        assert_eq!(second_bits, 0b10);
    }

    #[test]
    fn cancel_wakes_waiters_and_installs_the_pattern() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .eventflag_create(tid, "evf", ObjectAttr::empty(), 0)
            .unwrap();

        let waiter = kernel.register_thread("waiter", 160).uid();
        let handle = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || kernel.eventflag_wait(waiter, eid, 0b1, EvfWaitMode::OR, None, None))
        };
        thread::sleep(Duration::from_millis(50)); // Let it park.

        let mut woken = 0u32;
        kernel
            .eventflag_cancel(tid, eid, 0b1000, Some(&mut woken))
            .unwrap();
        assert_eq!(woken, 1);
        assert_eq!(handle.join().unwrap(), Err(SyncError::WaitCancel));

        let mut bits = 0u32;
        kernel
            .eventflag_poll(tid, eid, u32::MAX, EvfWaitMode::OR, Some(&mut bits))
            .unwrap();
        assert_eq!(bits, 0b1000);
    }
}
